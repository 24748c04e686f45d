//! Devices and device memory accounting

mod query;

pub use query::DeviceQuery;

use crate::caps::{AllocationKind, MemoryCapabilities};
use crate::error::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);

/// Shared handle to a device
pub type DevicePtr = Arc<Device>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    #[default]
    IntegratedGpu,
    DiscreteGpu,
    Cpu,
}

/// Static description of a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceInfo {
    pub name: String,
    pub vendor_id: u32,
    pub device_type: DeviceType,
    /// Total device memory in bytes
    pub global_mem_size: u64,
    /// Largest single allocation in bytes
    pub max_alloc_size: u64,
    pub supports_image: bool,
    pub compute_units: u32,
    pub mem_caps: MemoryCapabilities,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            name: "hologram simulated gpu".to_string(),
            vendor_id: 0x8086,
            device_type: DeviceType::IntegratedGpu,
            global_mem_size: 1 << 30,
            max_alloc_size: 1 << 28,
            supports_image: true,
            compute_units: 8,
            mem_caps: MemoryCapabilities::new([
                AllocationKind::NativeBuffer,
                AllocationKind::UnifiedHost,
                AllocationKind::UnifiedShared,
                AllocationKind::UnifiedDevice,
            ]),
        }
    }
}

/// A compute device with memory accounting
///
/// Allocations reserve bytes against `global_mem_size` and release them when
/// the backing storage is dropped.
pub struct Device {
    id: u64,
    info: DeviceInfo,
    allocated: AtomicU64,
    peak: AtomicU64,
}

impl Device {
    pub fn new(info: DeviceInfo) -> DevicePtr {
        Arc::new(Self {
            id: NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed),
            info,
            allocated: AtomicU64::new(0),
            peak: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn mem_caps(&self) -> &MemoryCapabilities {
        &self.info.mem_caps
    }

    /// Bytes currently held by live allocations
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated.load(Ordering::Acquire)
    }

    /// High-water mark of `allocated_bytes`
    pub fn peak_bytes(&self) -> u64 {
        self.peak.load(Ordering::Acquire)
    }

    /// Reserve `bytes` of device memory.
    ///
    /// # Errors
    ///
    /// - [`RuntimeError::AllocationTooLarge`] if `bytes` exceeds `max_alloc_size`
    /// - [`RuntimeError::OutOfMemory`] if the device has too little memory left
    pub(crate) fn reserve(&self, bytes: u64) -> Result<()> {
        if bytes > self.info.max_alloc_size {
            return Err(RuntimeError::AllocationTooLarge {
                requested: bytes,
                max: self.info.max_alloc_size,
            });
        }

        let capacity = self.info.global_mem_size;
        let reserved = self
            .allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(bytes).filter(|total| *total <= capacity)
            })
            .map_err(|current| RuntimeError::OutOfMemory {
                requested: bytes,
                available: capacity.saturating_sub(current),
            })?;

        self.peak.fetch_max(reserved + bytes, Ordering::AcqRel);
        Ok(())
    }

    pub(crate) fn release(&self, bytes: u64) {
        let previous = self.allocated.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(previous >= bytes, "device memory accounting underflow");
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.info.name)
            .field("allocated", &self.allocated_bytes())
            .finish()
    }
}
