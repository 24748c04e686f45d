//! Host mapping state shared by every lockable memory object
//!
//! A lock count and the active mapping live behind one mutex. Nested locks
//! return the same pointer; the mapping is torn down when the count returns
//! to zero.

use super::allocation::DeviceAllocation;
use super::Memory;
use crate::caps::AllocationKind;
use crate::error::{Result, RuntimeError};
use bytemuck::Pod;
use parking_lot::Mutex;
use std::ptr::NonNull;

/// Intended host access of a lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockType {
    Read,
    Write,
    #[default]
    ReadWrite,
}

impl LockType {
    pub const fn writes(self) -> bool {
        !matches!(self, Self::Read)
    }
}

/// How a memory variant satisfies a host lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockStrategy {
    /// Copy into a host staging buffer; written back on the last unlock
    Staged,
    /// Hand out the allocation pointer itself
    Direct,
    /// Host access is impossible for this kind
    Denied(AllocationKind),
}

/// Host pointer returned by a lock, valid until the matching unlock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedPtr {
    ptr: NonNull<u8>,
    len: usize,
    row_pitch: Option<usize>,
}

impl MappedPtr {
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Mapped bytes; for images this includes row padding.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes between consecutive image rows; `None` for linear memory.
    pub fn row_pitch(&self) -> Option<usize> {
        self.row_pitch
    }

    /// # Safety
    ///
    /// The memory must stay locked and unwritten for `'a`.
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        std::slice::from_raw_parts(self.ptr.as_ptr(), self.len)
    }

    /// # Safety
    ///
    /// The memory must stay locked for `'a` with no other access to the mapping.
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len)
    }
}

// SAFETY: a plain address; every dereference goes through an unsafe accessor
// or a guard that keeps the mapping alive.
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

// ================================================================================================
// LockState
// ================================================================================================

#[derive(Default)]
struct LockInner {
    count: u32,
    staging: Option<Box<[u8]>>,
    writable: bool,
    mapped: Option<MappedPtr>,
}

pub(crate) struct LockState {
    inner: Mutex<LockInner>,
}

impl LockState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LockInner::default()),
        }
    }

    pub fn count(&self) -> u32 {
        self.inner.lock().count
    }

    pub fn mapped(&self) -> Option<MappedPtr> {
        self.inner.lock().mapped
    }

    /// Take one lock. The first lock creates the mapping.
    pub fn lock(
        &self,
        storage: &DeviceAllocation,
        len: usize,
        strategy: LockStrategy,
        lock_type: LockType,
        row_pitch: Option<usize>,
    ) -> Result<(MappedPtr, bool)> {
        let mut inner = self.inner.lock();
        inner.writable |= lock_type.writes();

        if let Some(mapped) = inner.mapped {
            inner.count += 1;
            return Ok((mapped, false));
        }

        let ptr = match strategy {
            LockStrategy::Denied(kind) => {
                inner.writable = false;
                return Err(RuntimeError::AccessDenied { kind });
            }
            LockStrategy::Direct => NonNull::new(storage.as_ptr()),
            LockStrategy::Staged => {
                let mut staging = vec![0u8; len].into_boxed_slice();
                storage.read(0, &mut staging)?;
                let ptr = NonNull::new(staging.as_mut_ptr());
                inner.staging = Some(staging);
                ptr
            }
        };

        let ptr = ptr.ok_or_else(|| RuntimeError::invalid_argument("mapping produced a null pointer"))?;
        let mapped = MappedPtr { ptr, len, row_pitch };
        inner.mapped = Some(mapped);
        inner.count = 1;
        Ok((mapped, true))
    }

    /// Drop one lock. Returns true when this unlock tore down the mapping.
    pub fn unlock(&self, storage: &DeviceAllocation, memory: u64) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.count == 0 {
            return Err(RuntimeError::LockUnderflow { memory });
        }

        inner.count -= 1;
        if inner.count > 0 {
            return Ok(false);
        }

        inner.mapped = None;
        let writable = std::mem::take(&mut inner.writable);
        if let Some(staging) = inner.staging.take() {
            if writable {
                storage.write(0, &staging)?;
            }
        }
        Ok(true)
    }
}

// ================================================================================================
// MemLock
// ================================================================================================

/// RAII host mapping of a [`Memory`]
///
/// Created by [`Memory::map`]; unlocks on drop. Access goes through copying
/// helpers so that nested locks of the same memory never hand out aliasing
/// references.
///
/// ```rust
/// use hologram_runtime::{AllocationKind, Engine, Layout, LockType, RuntimeConfig};
///
/// # fn main() -> hologram_runtime::Result<()> {
/// let engine = Engine::from_query(RuntimeConfig::default())?;
/// let stream = engine.create_stream()?;
/// let memory = engine.allocate_memory(&Layout::of::<u32>(4), AllocationKind::NativeBuffer)?;
/// {
///     let mut mapped = memory.map(stream.as_ref(), LockType::Write)?;
///     mapped.write_as(4, 7u32)?;
/// }
/// let mapped = memory.map(stream.as_ref(), LockType::Read)?;
/// assert_eq!(mapped.read_as::<u32>(4)?, 7);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct MemLock<'a> {
    memory: &'a Memory,
    mapped: MappedPtr,
    lock_type: LockType,
}

impl<'a> MemLock<'a> {
    pub(crate) fn new(memory: &'a Memory, mapped: MappedPtr, lock_type: LockType) -> Self {
        Self {
            memory,
            mapped,
            lock_type,
        }
    }

    pub fn mapped(&self) -> MappedPtr {
        self.mapped
    }

    pub fn len(&self) -> usize {
        self.mapped.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapped.is_empty()
    }

    pub fn row_pitch(&self) -> Option<usize> {
        self.mapped.row_pitch()
    }

    pub fn read_into(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        RuntimeError::check_bounds(offset, dst.len(), self.len())?;
        // SAFETY: in bounds of a mapping kept alive by this guard.
        unsafe {
            std::ptr::copy_nonoverlapping(self.mapped.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    pub fn write_from(&mut self, offset: usize, src: &[u8]) -> Result<()> {
        if !self.lock_type.writes() {
            return Err(RuntimeError::invalid_argument("write through a read-only mapping"));
        }
        RuntimeError::check_bounds(offset, src.len(), self.len())?;
        // SAFETY: in bounds of a mapping kept alive by this guard.
        unsafe {
            std::ptr::copy(src.as_ptr(), self.mapped.as_ptr().add(offset), src.len());
        }
        Ok(())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len()];
        // SAFETY: `out` has exactly the mapping's length.
        unsafe {
            std::ptr::copy_nonoverlapping(self.mapped.as_ptr(), out.as_mut_ptr(), out.len());
        }
        out
    }

    pub fn read_as<T: Pod>(&self, offset: usize) -> Result<T> {
        let mut value = T::zeroed();
        self.read_into(offset, bytemuck::bytes_of_mut(&mut value))?;
        Ok(value)
    }

    pub fn write_as<T: Pod>(&mut self, offset: usize, value: T) -> Result<()> {
        self.write_from(offset, bytemuck::bytes_of(&value))
    }
}

impl Drop for MemLock<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.memory.release_lock() {
            tracing::error!(memory = self.memory.id(), error = %err, "failed to release mapping");
        }
    }
}
