//! Kernels and kernel argument binding
//!
//! Kernel compilation is out of scope; a [`Kernel`] wraps a host closure that
//! the simulated device runs over the bound memory. Binding checks that every
//! argument lives on the stream's device, that native objects are not mapped
//! and that written arguments do not alias any other argument.

use crate::device::DevicePtr;
use crate::error::{Result, RuntimeError};
use crate::memory::{DeviceAllocation, MemoryPtr};
use std::fmt;
use std::sync::Arc;

/// Host body of a kernel
pub type KernelFn = dyn Fn(&mut KernelContext<'_>) -> std::result::Result<(), String> + Send + Sync;

/// Compiled kernel handle
#[derive(Clone)]
pub struct Kernel {
    name: Arc<str>,
    entry: Arc<KernelFn>,
}

impl Kernel {
    pub fn new<F>(name: impl Into<String>, entry: F) -> Self
    where
        F: Fn(&mut KernelContext<'_>) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name.into()),
            entry: Arc::new(entry),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel").field("name", &self.name).finish()
    }
}

/// Global and local work sizes of a launch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkGroupSizes {
    pub global: [usize; 3],
    pub local: [usize; 3],
}

impl Default for WorkGroupSizes {
    fn default() -> Self {
        Self {
            global: [1, 1, 1],
            local: [1, 1, 1],
        }
    }
}

impl WorkGroupSizes {
    pub fn linear(global: usize) -> Self {
        Self {
            global: [global, 1, 1],
            ..Self::default()
        }
    }
}

/// One kernel parameter, referring into [`KernelArgumentsData`] by index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentDesc {
    Input(usize),
    Output(usize),
    Intermediate(usize),
    Scalar(usize),
}

/// Parameter list and launch geometry of a kernel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelArgumentsDesc {
    pub arguments: Vec<ArgumentDesc>,
    pub work_groups: WorkGroupSizes,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarValue {
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl ScalarValue {
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Self::U32(v) => Some(v.into()),
            Self::U64(v) => Some(v),
            Self::I32(v) => u64::try_from(v).ok(),
            Self::I64(v) => u64::try_from(v).ok(),
            Self::F32(_) | Self::F64(_) => None,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            Self::U32(v) => v.into(),
            Self::I32(v) => v.into(),
            Self::U64(v) => v as f64,
            Self::I64(v) => v as f64,
            Self::F32(v) => v.into(),
            Self::F64(v) => v,
        }
    }
}

/// Memory and scalar values passed to a launch
#[derive(Debug, Clone, Default)]
pub struct KernelArgumentsData {
    pub inputs: Vec<MemoryPtr>,
    pub outputs: Vec<MemoryPtr>,
    pub intermediates: Vec<MemoryPtr>,
    pub scalars: Vec<ScalarValue>,
}

/// View of the bound arguments inside a running kernel
///
/// Slices appear in parameter order within each class. Image arguments
/// include row padding.
pub struct KernelContext<'a> {
    pub inputs: Vec<&'a [u8]>,
    pub outputs: Vec<&'a mut [u8]>,
    pub intermediates: Vec<&'a mut [u8]>,
    pub scalars: &'a [ScalarValue],
    pub work_groups: WorkGroupSizes,
}

impl KernelContext<'_> {
    pub fn input_as<T: bytemuck::Pod>(&self, index: usize) -> std::result::Result<&[T], String> {
        let bytes = self.inputs.get(index).ok_or_else(|| format!("no input {index}"))?;
        bytemuck::try_cast_slice(*bytes).map_err(|e| format!("input {index}: {e}"))
    }

    pub fn output_as<T: bytemuck::Pod>(&mut self, index: usize) -> std::result::Result<&mut [T], String> {
        let bytes = self.outputs.get_mut(index).ok_or_else(|| format!("no output {index}"))?;
        bytemuck::try_cast_slice_mut(&mut **bytes).map_err(|e| format!("output {index}: {e}"))
    }
}

// ================================================================================================
// Binding
// ================================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Access {
    Read,
    Write,
}

#[derive(Debug)]
struct BoundMemory {
    storage: Arc<DeviceAllocation>,
    len: usize,
    access: Access,
}

/// Arguments validated against a device, ready to run on a queue worker
#[derive(Debug)]
pub(crate) struct BoundArguments {
    inputs: Vec<BoundMemory>,
    outputs: Vec<BoundMemory>,
    intermediates: Vec<BoundMemory>,
    scalars: Vec<ScalarValue>,
    work_groups: WorkGroupSizes,
}

impl BoundArguments {
    pub fn bind(device: &DevicePtr, desc: &KernelArgumentsDesc, data: &KernelArgumentsData) -> Result<Self> {
        let mut bound = Self {
            inputs: Vec::new(),
            outputs: Vec::new(),
            intermediates: Vec::new(),
            scalars: Vec::new(),
            work_groups: desc.work_groups,
        };

        for arg in &desc.arguments {
            match *arg {
                ArgumentDesc::Input(i) => bound.inputs.push(bind_memory(device, &data.inputs, i, "input", Access::Read)?),
                ArgumentDesc::Output(i) => {
                    bound.outputs.push(bind_memory(device, &data.outputs, i, "output", Access::Write)?)
                }
                ArgumentDesc::Intermediate(i) => bound.intermediates.push(bind_memory(
                    device,
                    &data.intermediates,
                    i,
                    "intermediate",
                    Access::Write,
                )?),
                ArgumentDesc::Scalar(i) => {
                    let value = data
                        .scalars
                        .get(i)
                        .ok_or_else(|| RuntimeError::invalid_argument(format!("scalar index {i} out of range")))?;
                    bound.scalars.push(*value);
                }
            }
        }

        bound.check_aliasing()?;
        Ok(bound)
    }

    fn check_aliasing(&self) -> Result<()> {
        let all: Vec<&BoundMemory> = self
            .inputs
            .iter()
            .chain(&self.outputs)
            .chain(&self.intermediates)
            .collect();
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                let shared = a.storage.handle() == b.storage.handle();
                if shared && (a.access == Access::Write || b.access == Access::Write) {
                    return Err(RuntimeError::invalid_argument(format!(
                        "written argument aliases another argument at {:?}",
                        a.storage.handle()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Run `kernel` over the bound memory.
    pub fn execute(&self, kernel: &Kernel) -> Result<()> {
        // SAFETY: binding rejected written arguments that share storage with any
        // other argument, and events order this launch against other access.
        let inputs = self
            .inputs
            .iter()
            .map(|m| unsafe { &m.storage.as_slice()[..m.len] })
            .collect();
        let outputs = self
            .outputs
            .iter()
            .map(|m| unsafe { &mut m.storage.as_mut_slice()[..m.len] })
            .collect();
        let intermediates = self
            .intermediates
            .iter()
            .map(|m| unsafe { &mut m.storage.as_mut_slice()[..m.len] })
            .collect();

        let mut ctx = KernelContext {
            inputs,
            outputs,
            intermediates,
            scalars: &self.scalars,
            work_groups: self.work_groups,
        };
        (kernel.entry)(&mut ctx).map_err(|message| RuntimeError::execution_failed(format!("kernel '{}'", kernel.name), message))
    }
}

fn bind_memory(
    device: &DevicePtr,
    list: &[MemoryPtr],
    index: usize,
    class: &str,
    access: Access,
) -> Result<BoundMemory> {
    let memory = list
        .get(index)
        .ok_or_else(|| RuntimeError::invalid_argument(format!("{class} index {index} out of range")))?;

    if memory.device().id() != device.id() {
        return Err(RuntimeError::ForeignMemory(format!(
            "{class} {index} (memory #{}) is not on device '{}'",
            memory.id(),
            device.info().name
        )));
    }
    if memory.variant().is_native() && memory.is_locked() {
        return Err(RuntimeError::invalid_argument(format!(
            "{class} {index} (memory #{}) is mapped on the host",
            memory.id()
        )));
    }

    Ok(BoundMemory {
        storage: memory.storage().clone(),
        len: memory.device_size(),
        access,
    })
}
