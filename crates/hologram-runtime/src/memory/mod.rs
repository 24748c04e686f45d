//! Memory objects
//!
//! A [`Memory`] owns (or shares) one device allocation of a given
//! [`AllocationKind`] and [`Layout`]. The concrete resource is one of a small
//! set of variants; lock behaviour, pitch handling and descriptor export are
//! looked up from the variant instead of being spread over a type hierarchy.
//!
//! | variant         | lock            | pitched | export mem_type |
//! |-----------------|-----------------|---------|-----------------|
//! | native buffer   | staged mapping  | no      | `Buffer`        |
//! | native image    | staged mapping  | yes     | `Image`         |
//! | media surface   | staged mapping  | yes     | `VaSurface`     |
//! | external buffer | staged mapping  | no      | `DxBuffer`      |
//! | unified memory  | pointer / denied| no      | `Empty`         |

mod allocation;
mod buffer;
mod image;
mod lockable;
mod shared;
mod usm;

pub use allocation::{DeviceAllocation, ALLOCATION_ALIGNMENT};
pub use buffer::{ExternalBuffer, NativeBuffer};
pub use image::{ImagePitch, MediaSurface};
pub use lockable::{LockType, MappedPtr, MemLock};
pub use shared::{NativeHandle, SharedMemParams, SharedMemType, SharedSurface, SurfaceRepr};
pub use usm::UnifiedMemory;

use crate::caps::AllocationKind;
use crate::device::DevicePtr;
use crate::error::{Result, RuntimeError};
use crate::event::EventPtr;
use crate::layout::Layout;
use crate::stream::{DeviceOp, Stream};
use hologram_tracing::performance::{record_transfer, TransferDirection};
use hologram_tracing::perf_span;
use lockable::{LockState, LockStrategy};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

static NEXT_MEMORY_ID: AtomicU64 = AtomicU64::new(1);

/// Shared handle to a memory object
pub type MemoryPtr = Arc<Memory>;

/// Concrete resource behind a [`Memory`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryVariant {
    Buffer(NativeBuffer),
    Image { pitch: ImagePitch, imported: bool },
    MediaSurface { pitch: ImagePitch, surface: MediaSurface },
    ExternalBuffer(ExternalBuffer),
    Unified(UnifiedMemory),
}

impl MemoryVariant {
    pub(crate) fn lock_strategy(&self) -> LockStrategy {
        match self {
            Self::Unified(usm) => usm.lock_strategy(),
            _ => LockStrategy::Staged,
        }
    }

    pub fn pitch(&self) -> Option<ImagePitch> {
        match self {
            Self::Image { pitch, .. } | Self::MediaSurface { pitch, .. } => Some(*pitch),
            _ => None,
        }
    }

    /// Whether the variant is a classic backend object that kernels cannot
    /// use while it is mapped
    pub fn is_native(&self) -> bool {
        !matches!(self, Self::Unified(_))
    }

    pub fn is_imported(&self) -> bool {
        match self {
            Self::Buffer(buffer) => buffer.imported,
            Self::Image { imported, .. } => *imported,
            Self::MediaSurface { .. } | Self::ExternalBuffer(_) => true,
            Self::Unified(_) => false,
        }
    }
}

/// Engine-side identity stamped on every memory object
#[derive(Clone)]
pub(crate) struct MemoryOrigin {
    pub engine_id: u64,
    pub context: NativeHandle,
    pub device: DevicePtr,
}

/// A device memory object
pub struct Memory {
    id: u64,
    origin: MemoryOrigin,
    layout: Layout,
    kind: AllocationKind,
    variant: MemoryVariant,
    storage: Arc<DeviceAllocation>,
    lock: LockState,
}

impl Memory {
    pub(crate) fn new(
        origin: MemoryOrigin,
        layout: Layout,
        kind: AllocationKind,
        variant: MemoryVariant,
        storage: Arc<DeviceAllocation>,
    ) -> Result<MemoryPtr> {
        let needed = match variant.pitch() {
            Some(pitch) => pitch.slice_pitch,
            None => layout.bytes_count(),
        };
        if storage.len() < needed {
            return Err(RuntimeError::OutOfBounds {
                offset: 0,
                size: needed,
                capacity: storage.len(),
            });
        }

        let memory = Self {
            id: NEXT_MEMORY_ID.fetch_add(1, Ordering::Relaxed),
            origin,
            layout,
            kind,
            variant,
            storage,
            lock: LockState::new(),
        };
        tracing::debug!(
            memory = memory.id,
            kind = %kind,
            variant = ?memory.variant,
            bytes = needed,
            "memory object created"
        );
        Ok(Arc::new(memory))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn kind(&self) -> AllocationKind {
        self.kind
    }

    pub fn variant(&self) -> &MemoryVariant {
        &self.variant
    }

    /// Dense byte size described by the layout
    pub fn size(&self) -> usize {
        self.layout.bytes_count()
    }

    /// Bytes the device sees, including image row padding
    pub fn device_size(&self) -> usize {
        self.variant.pitch().map_or_else(|| self.size(), |p| p.slice_pitch)
    }

    pub fn device(&self) -> &DevicePtr {
        &self.origin.device
    }

    pub fn native_handle(&self) -> NativeHandle {
        self.storage.handle()
    }

    pub fn lock_count(&self) -> u32 {
        self.lock.count()
    }

    pub fn is_locked(&self) -> bool {
        self.lock_count() > 0
    }

    /// The active host mapping, if locked
    pub fn mapped_ptr(&self) -> Option<MappedPtr> {
        self.lock.mapped()
    }

    pub fn is_allocated_by(&self, engine: &crate::Engine) -> bool {
        engine.id() == self.origin.engine_id
    }

    pub(crate) fn engine_id(&self) -> u64 {
        self.origin.engine_id
    }

    pub(crate) fn origin(&self) -> &MemoryOrigin {
        &self.origin
    }

    pub(crate) fn storage(&self) -> &Arc<DeviceAllocation> {
        &self.storage
    }

    fn check_stream(&self, stream: &dyn Stream) -> Result<()> {
        if stream.device().id() != self.origin.device.id() {
            return Err(RuntimeError::ForeignMemory(format!(
                "memory #{} belongs to device '{}', stream runs on '{}'",
                self.id,
                self.origin.device.info().name,
                stream.device().info().name
            )));
        }
        Ok(())
    }

    // ============================================================================================
    // Host mapping
    // ============================================================================================

    /// Map the memory for host access and return the mapped pointer.
    ///
    /// Nested calls return the same pointer and must each be matched by an
    /// [`unlock`](Self::unlock). Native objects are mapped through a staging
    /// copy that becomes visible to the device at the last unlock; on an
    /// in-order queue the first lock drains queued work first, on an
    /// out-of-order queue the caller orders it with events.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::AccessDenied`] for device-only unified memory.
    pub fn lock(&self, stream: &dyn Stream, lock_type: LockType) -> Result<MappedPtr> {
        self.check_stream(stream)?;
        let strategy = self.variant.lock_strategy();

        if strategy == LockStrategy::Staged && !self.is_locked() && stream.queue().is_in_order() {
            stream.queue().wait_idle();
        }

        let _span = perf_span!("memory_lock", memory = self.id);
        let (mapped, created) =
            self.lock
                .lock(&self.storage, self.device_size(), strategy, lock_type, self.variant.pitch().map(|p| p.row_pitch))?;
        if created {
            tracing::debug!(memory = self.id, ?lock_type, ?strategy, "memory mapped");
        }
        Ok(mapped)
    }

    /// Release one lock taken by [`lock`](Self::lock).
    ///
    /// # Errors
    ///
    /// [`RuntimeError::LockUnderflow`] when the memory is not locked.
    pub fn unlock(&self, stream: &dyn Stream) -> Result<()> {
        self.check_stream(stream)?;
        self.release_lock()
    }

    /// Lock with a guard that unlocks on drop.
    pub fn map(&self, stream: &dyn Stream, lock_type: LockType) -> Result<MemLock<'_>> {
        let mapped = self.lock(stream, lock_type)?;
        Ok(MemLock::new(self, mapped, lock_type))
    }

    pub(crate) fn release_lock(&self) -> Result<()> {
        if self.lock.unlock(&self.storage, self.id)? {
            tracing::debug!(memory = self.id, "memory unmapped");
        }
        Ok(())
    }

    // ============================================================================================
    // Device operations
    // ============================================================================================

    /// Zero-fill on the stream.
    pub fn fill(&self, stream: &mut dyn Stream) -> Result<EventPtr> {
        self.fill_pattern(stream, 0)
    }

    /// Set every byte to `pattern` on the stream.
    pub fn fill_pattern(&self, stream: &mut dyn Stream, pattern: u8) -> Result<EventPtr> {
        self.fill_bytes(stream, vec![pattern])
    }

    /// Repeat the bytes of `value` over the memory on the stream.
    pub fn fill_value<T: bytemuck::Pod>(&self, stream: &mut dyn Stream, value: T) -> Result<EventPtr> {
        let pattern = bytemuck::bytes_of(&value).to_vec();
        if pattern.is_empty() {
            return Err(RuntimeError::invalid_argument("fill value has no bytes"));
        }
        if self.size() % pattern.len() != 0 {
            return Err(RuntimeError::SizeMismatch {
                expected: self.size() - self.size() % pattern.len(),
                actual: self.size(),
            });
        }
        self.fill_bytes(stream, pattern)
    }

    fn fill_bytes(&self, stream: &mut dyn Stream, pattern: Vec<u8>) -> Result<EventPtr> {
        self.check_stream(stream)?;
        let storage = self.storage.clone();
        let pitch = self.variant.pitch();
        let size = self.size();
        let device_size = self.device_size();
        let memory = self.id;

        let op: DeviceOp = Box::new(move || {
            let _span = perf_span!("memory_fill", memory = memory, bytes = device_size);
            match pitch {
                Some(pitch) if pattern.len() > 1 => {
                    let dense: Vec<u8> = pattern.iter().copied().cycle().take(size).collect();
                    pitch.write_dense(&storage, &dense)
                }
                _ => storage.fill(0, device_size, &pattern),
            }
        });
        stream.enqueue_transfer(&[], op, "fill")
    }

    /// Copy the full contents of `other` into this memory on the stream.
    ///
    /// Works across every pair of variants; pitched images are copied row by row.
    pub fn copy_from(&self, stream: &mut dyn Stream, other: &Memory) -> Result<EventPtr> {
        self.check_stream(stream)?;
        if other.size() != self.size() {
            return Err(RuntimeError::SizeMismatch {
                expected: self.size(),
                actual: other.size(),
            });
        }

        let src = other.storage.clone();
        let dst = self.storage.clone();
        let src_pitch = other.variant.pitch();
        let dst_pitch = self.variant.pitch();
        let size = self.size();

        let op: DeviceOp = Box::new(move || {
            let start = Instant::now();
            match (src_pitch, dst_pitch) {
                (None, None) => {
                    // SAFETY: the source is not written while this copy runs; events order it.
                    let bytes = unsafe { &src.as_slice()[..size] };
                    dst.write(0, bytes)?;
                }
                _ => {
                    let mut dense = vec![0u8; size];
                    read_dense(&src, src_pitch, &mut dense)?;
                    write_dense(&dst, dst_pitch, &dense)?;
                }
            }
            record_transfer(size, TransferDirection::DeviceToDevice, start.elapsed().as_micros() as u64);
            Ok(())
        });
        stream.enqueue_transfer(&[], op, "copy_from")
    }

    /// Upload `data` on the stream. The host bytes are staged on the stream
    /// until [`Stream::release_pending_memory`].
    pub fn copy_from_host(&self, stream: &mut dyn Stream, data: &[u8]) -> Result<EventPtr> {
        self.check_stream(stream)?;
        if data.len() != self.size() {
            return Err(RuntimeError::SizeMismatch {
                expected: self.size(),
                actual: data.len(),
            });
        }

        let staging: Arc<[u8]> = Arc::from(data);
        stream.park_staging(staging.clone());

        let dst = self.storage.clone();
        let pitch = self.variant.pitch();
        let op: DeviceOp = Box::new(move || {
            let start = Instant::now();
            write_dense(&dst, pitch, &staging)?;
            record_transfer(staging.len(), TransferDirection::HostToDevice, start.elapsed().as_micros() as u64);
            Ok(())
        });
        stream.enqueue_transfer(&[], op, "copy_from_host")
    }

    /// Blocking download of the dense contents after all work enqueued on
    /// the stream since its last barrier.
    pub fn copy_to_host(&self, stream: &mut dyn Stream, dst: &mut [u8]) -> Result<()> {
        self.check_stream(stream)?;
        if dst.len() != self.size() {
            return Err(RuntimeError::SizeMismatch {
                expected: self.size(),
                actual: dst.len(),
            });
        }

        let marker = stream.enqueue_marker(&[], false)?;
        marker.wait()?;

        let start = Instant::now();
        read_dense(&self.storage, self.variant.pitch(), dst)?;
        record_transfer(dst.len(), TransferDirection::DeviceToHost, start.elapsed().as_micros() as u64);
        Ok(())
    }

    /// Typed convenience over [`copy_to_host`](Self::copy_to_host).
    pub fn read_as_vec<T: bytemuck::Pod>(&self, stream: &mut dyn Stream) -> Result<Vec<T>> {
        let elem = std::mem::size_of::<T>();
        if elem == 0 || self.size() % elem != 0 {
            return Err(RuntimeError::SizeMismatch {
                expected: self.size() - self.size() % elem.max(1),
                actual: self.size(),
            });
        }
        let mut out = vec![T::zeroed(); self.size() / elem];
        self.copy_to_host(stream, bytemuck::cast_slice_mut(&mut out))?;
        Ok(out)
    }

    // ============================================================================================
    // Interop
    // ============================================================================================

    /// Descriptor of the underlying resource for external consumers.
    pub fn get_internal_params(&self) -> SharedMemParams {
        let context = self.origin.context;
        match &self.variant {
            MemoryVariant::Buffer(buffer) => buffer.export(context, self.storage.handle()),
            MemoryVariant::Image { .. } => SharedMemParams::image(context, self.storage.handle()),
            MemoryVariant::MediaSurface { surface, .. } => surface.export(context),
            MemoryVariant::ExternalBuffer(buffer) => buffer.export(context),
            MemoryVariant::Unified(usm) => usm.export(context, self.storage.handle()),
        }
    }
}

fn write_dense(storage: &DeviceAllocation, pitch: Option<ImagePitch>, src: &[u8]) -> Result<()> {
    match pitch {
        Some(pitch) => pitch.write_dense(storage, src),
        None => storage.write(0, src),
    }
}

fn read_dense(storage: &DeviceAllocation, pitch: Option<ImagePitch>, dst: &mut [u8]) -> Result<()> {
    match pitch {
        Some(pitch) => pitch.read_dense(storage, dst),
        None => storage.read(0, dst),
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        let count = self.lock.count();
        if count > 0 {
            tracing::error!(memory = self.id, lock_count = count, "memory destroyed while locked");
            debug_assert!(count == 0, "memory #{} destroyed with {} outstanding locks", self.id, count);
        }
    }
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memory")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("variant", &self.variant)
            .field("size", &self.size())
            .field("lock_count", &self.lock_count())
            .finish()
    }
}
