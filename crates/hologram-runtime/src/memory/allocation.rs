//! Device storage for the simulated backend
//!
//! Every memory object is backed by one cache-line aligned, zero-initialized
//! host allocation. Host code and queue workers access it through raw copies;
//! ordering between them is the caller's job, expressed with events.

use crate::device::DevicePtr;
use crate::error::{Result, RuntimeError};
use crate::memory::shared::NativeHandle;
use rayon::prelude::*;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

// ================================================================================================
// Constants
// ================================================================================================

/// Alignment of every device allocation
pub const ALLOCATION_ALIGNMENT: usize = 64;

/// Fills at or above this size are split across the rayon pool
const PARALLEL_FILL_THRESHOLD: usize = 1 << 20;

const FILL_CHUNK: usize = 64 * 1024;

// ================================================================================================
// DeviceAllocation
// ================================================================================================

/// One aligned block of simulated device memory
pub struct DeviceAllocation {
    data: NonNull<u8>,
    layout: Layout,
    /// Device charged for this allocation; `None` for external storage
    device: Option<DevicePtr>,
}

impl DeviceAllocation {
    /// Allocate `size` zeroed bytes charged against `device`.
    ///
    /// # Errors
    ///
    /// Fails with the device's exhaustion errors, or `OutOfMemory` if the
    /// host allocator refuses the request. Nothing stays reserved on failure.
    pub fn new(device: &DevicePtr, size: usize) -> Result<Self> {
        device.reserve(size as u64)?;
        match Self::raw(size) {
            Ok((data, layout)) => Ok(Self {
                data,
                layout,
                device: Some(device.clone()),
            }),
            Err(err) => {
                device.release(size as u64);
                Err(err)
            }
        }
    }

    /// Storage owned by an external producer and not charged to any device
    pub fn external(size: usize) -> Result<Self> {
        let (data, layout) = Self::raw(size)?;
        Ok(Self {
            data,
            layout,
            device: None,
        })
    }

    fn raw(size: usize) -> Result<(NonNull<u8>, Layout)> {
        if size == 0 {
            return Err(RuntimeError::invalid_layout("zero-sized allocation"));
        }
        let layout = Layout::from_size_align(size, ALLOCATION_ALIGNMENT)
            .map_err(|e| RuntimeError::invalid_layout(e.to_string()))?;

        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let data = NonNull::new(ptr).ok_or(RuntimeError::OutOfMemory {
            requested: size as u64,
            available: 0,
        })?;
        Ok((data, layout))
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn handle(&self) -> NativeHandle {
        NativeHandle::from_ptr(self.data.as_ptr())
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.data.as_ptr()
    }

    pub fn device(&self) -> Option<&DevicePtr> {
        self.device.as_ref()
    }

    /// View the whole allocation.
    ///
    /// # Safety
    ///
    /// No write to the allocation may run while the slice is alive.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.data.as_ptr(), self.len())
    }

    /// Mutable view of the whole allocation.
    ///
    /// # Safety
    ///
    /// No other access to the allocation may run while the slice is alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.data.as_ptr(), self.len())
    }

    /// Copy `dst.len()` bytes starting at `offset` out of the allocation.
    pub fn read(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        RuntimeError::check_bounds(offset, dst.len(), self.len())?;
        // SAFETY: range checked above; dst is a distinct host buffer.
        unsafe {
            std::ptr::copy_nonoverlapping(self.data.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    /// Copy `src` into the allocation starting at `offset`.
    pub fn write(&self, offset: usize, src: &[u8]) -> Result<()> {
        RuntimeError::check_bounds(offset, src.len(), self.len())?;
        // SAFETY: range checked above. `copy` tolerates src pointing into this allocation.
        unsafe {
            std::ptr::copy(src.as_ptr(), self.data.as_ptr().add(offset), src.len());
        }
        Ok(())
    }

    /// Repeat `pattern` over `len` bytes starting at `offset`.
    pub fn fill(&self, offset: usize, len: usize, pattern: &[u8]) -> Result<()> {
        if pattern.is_empty() {
            return Err(RuntimeError::invalid_argument("fill pattern is empty"));
        }
        RuntimeError::check_bounds(offset, len, self.len())?;

        // SAFETY: range checked; callers order fills against other accesses with events.
        let target = unsafe { std::slice::from_raw_parts_mut(self.data.as_ptr().add(offset), len) };

        let chunk = FILL_CHUNK - FILL_CHUNK % pattern.len();
        if len >= PARALLEL_FILL_THRESHOLD && chunk > 0 {
            target.par_chunks_mut(chunk).for_each(|block| fill_block(block, pattern));
        } else {
            fill_block(target, pattern);
        }
        Ok(())
    }
}

fn fill_block(block: &mut [u8], pattern: &[u8]) {
    if let [byte] = pattern {
        block.fill(*byte);
        return;
    }
    for (dst, src) in block.iter_mut().zip(pattern.iter().cycle()) {
        *dst = *src;
    }
}

impl Drop for DeviceAllocation {
    fn drop(&mut self) {
        // SAFETY: allocated in `raw` with exactly this layout.
        unsafe { dealloc(self.data.as_ptr(), self.layout) };
        if let Some(device) = &self.device {
            device.release(self.layout.size() as u64);
        }
    }
}

// SAFETY: the allocation is plain bytes; concurrent access is ordered by events.
unsafe impl Send for DeviceAllocation {}
unsafe impl Sync for DeviceAllocation {}

impl std::fmt::Debug for DeviceAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceAllocation")
            .field("handle", &self.handle())
            .field("len", &self.len())
            .finish()
    }
}
