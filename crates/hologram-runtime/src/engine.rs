//! Memory object and stream factory bound to one device
//!
//! The engine validates allocation kinds against the device capabilities,
//! creates native buffers, images and unified allocations, and imports
//! resources described by a [`SharedMemParams`]. Surface and device-buffer
//! imports are resolved through an [`ExternalMemoryProvider`].

use crate::caps::AllocationKind;
use crate::config::{RuntimeConfig, RuntimeType};
use crate::device::{DevicePtr, DeviceQuery};
use crate::error::{Result, RuntimeError};
use crate::layout::Layout;
use crate::memory::{
    DeviceAllocation, ExternalBuffer, ImagePitch, MediaSurface, Memory, MemoryOrigin, MemoryPtr, MemoryVariant,
    NativeBuffer, NativeHandle, SharedMemParams, SharedMemType, SharedSurface, UnifiedMemory, ALLOCATION_ALIGNMENT,
};
use crate::stream::{self, Stream};
use hologram_tracing::performance::record_allocation;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

/// Context handles are opaque to callers; engines get distinct non-null values.
const CONTEXT_HANDLE_BASE: usize = 0x0c7f_0000;

/// Allocation kinds tried by [`Engine::preferred_allocation_kind`], best first
const PREFERRED_KINDS: [AllocationKind; 3] = [
    AllocationKind::UnifiedDevice,
    AllocationKind::NativeBuffer,
    AllocationKind::UnifiedShared,
];

/// Producer of storage for resources created outside the runtime
///
/// Implemented by decoders, display pipelines or OS graphics interop layers.
/// The returned storage must hold at least the bytes the layout needs
/// (row-pitched for surfaces).
pub trait ExternalMemoryProvider: Send + Sync {
    fn resolve_surface(
        &self,
        device: NativeHandle,
        surface: SharedSurface,
        plane: u32,
        layout: &Layout,
    ) -> Result<Arc<DeviceAllocation>>;

    fn resolve_device_buffer(
        &self,
        device: NativeHandle,
        resource: NativeHandle,
        layout: &Layout,
    ) -> Result<Arc<DeviceAllocation>>;
}

/// Device memory accounting snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    pub allocated: u64,
    pub peak: u64,
    pub capacity: u64,
}

/// Factory for memory objects and streams on one device
pub struct Engine {
    id: u64,
    device: DevicePtr,
    config: RuntimeConfig,
    context: NativeHandle,
    registry: RwLock<HashMap<NativeHandle, Weak<DeviceAllocation>>>,
    provider: RwLock<Option<Arc<dyn ExternalMemoryProvider>>>,
}

impl Engine {
    pub fn new(device: DevicePtr, config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        if config.runtime == RuntimeType::UnifiedQueue && !device.mem_caps().supports_any_unified() {
            return Err(RuntimeError::unsupported(format!(
                "device '{}' cannot run the unified-queue runtime without unified memory",
                device.info().name
            )));
        }

        let id = NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed);
        tracing::info!(engine = id, device = %device.info().name, runtime = %config.runtime, "engine created");
        Ok(Self {
            id,
            context: NativeHandle(CONTEXT_HANDLE_BASE + id as usize),
            device,
            config,
            registry: RwLock::new(HashMap::new()),
            provider: RwLock::new(None),
        })
    }

    /// Engine on the first device the configured runtime can use.
    pub fn from_query(config: RuntimeConfig) -> Result<Self> {
        let (query, _duration_us) = hologram_tracing::timed_block!("device_query", {
            DeviceQuery::new(config.runtime, &config)
        });
        let device = query?
            .into_devices()
            .remove("0")
            .ok_or_else(|| RuntimeError::UnknownDevice(format!("no device usable by the {} runtime", config.runtime)))?;
        Self::new(device, config)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn device(&self) -> &DevicePtr {
        &self.device
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Opaque context handle stamped into exported descriptors
    pub fn context(&self) -> NativeHandle {
        self.context
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        MemoryUsage {
            allocated: self.device.allocated_bytes(),
            peak: self.device.peak_bytes(),
            capacity: self.device.info().global_mem_size,
        }
    }

    pub fn set_external_memory_provider(&self, provider: Arc<dyn ExternalMemoryProvider>) {
        *self.provider.write() = Some(provider);
    }

    pub fn create_stream(&self) -> Result<Box<dyn Stream>> {
        stream::create_stream(self.device.clone(), &self.config)
    }

    fn origin(&self) -> MemoryOrigin {
        MemoryOrigin {
            engine_id: self.id,
            context: self.context,
            device: self.device.clone(),
        }
    }

    // ============================================================================================
    // Allocation
    // ============================================================================================

    pub fn supports_allocation(&self, kind: AllocationKind) -> bool {
        kind != AllocationKind::Unspecified && self.device.mem_caps().supports(kind)
    }

    /// Best supported kind for general-purpose device memory
    pub fn preferred_allocation_kind(&self) -> Option<AllocationKind> {
        PREFERRED_KINDS.into_iter().find(|&kind| self.supports_allocation(kind))
    }

    /// Allocate a new memory object of `kind` shaped by `layout`.
    ///
    /// Image layouts need a native buffer on a device with image support.
    ///
    /// # Errors
    ///
    /// `Unsupported` for `Unspecified` or unsupported kinds, `InvalidLayout`
    /// for malformed layouts and the device exhaustion errors when the
    /// allocation does not fit.
    pub fn allocate_memory(&self, layout: &Layout, kind: AllocationKind) -> Result<MemoryPtr> {
        layout.validate()?;
        if kind == AllocationKind::Unspecified {
            return Err(RuntimeError::unsupported("allocation kind must be specified"));
        }
        if !self.supports_allocation(kind) {
            return Err(RuntimeError::unsupported(format!(
                "device '{}' does not support {kind} allocations",
                self.device.info().name
            )));
        }

        let (variant, size) = if layout.is_image() {
            if kind != AllocationKind::NativeBuffer {
                return Err(RuntimeError::unsupported(format!("image layouts cannot use {kind} allocations")));
            }
            if !self.device.info().supports_image {
                return Err(RuntimeError::unsupported(format!(
                    "device '{}' has no image support",
                    self.device.info().name
                )));
            }
            let pitch = ImagePitch::from_layout(layout)?;
            (MemoryVariant::Image { pitch, imported: false }, pitch.slice_pitch)
        } else if kind == AllocationKind::NativeBuffer {
            (MemoryVariant::Buffer(NativeBuffer { imported: false }), layout.bytes_count())
        } else {
            let usm = UnifiedMemory::new(kind)
                .ok_or_else(|| RuntimeError::unsupported(format!("{kind} is not a unified kind")))?;
            (MemoryVariant::Unified(usm), layout.bytes_count())
        };

        let start = Instant::now();
        let storage = Arc::new(DeviceAllocation::new(&self.device, size)?);
        record_allocation(size, kind.as_str(), ALLOCATION_ALIGNMENT, start.elapsed().as_micros() as u64);
        self.register(&storage);

        Memory::new(self.origin(), layout.clone(), kind, variant, storage)
    }

    /// View the resource of `memory` under a different layout.
    ///
    /// The new object shares the storage; it may not need more bytes than the
    /// resource holds.
    pub fn reinterpret_buffer(&self, memory: &Memory, layout: Layout) -> Result<MemoryPtr> {
        layout.validate()?;
        if memory.engine_id() != self.id {
            return Err(RuntimeError::ForeignMemory(format!(
                "memory #{} was not allocated by engine {}",
                memory.id(),
                self.id
            )));
        }

        let imported = memory.variant().is_imported();
        let variant = match (layout.is_image(), *memory.variant()) {
            (true, MemoryVariant::Buffer(_) | MemoryVariant::Image { .. }) => MemoryVariant::Image {
                pitch: ImagePitch::from_layout(&layout)?,
                imported,
            },
            (true, other) => {
                return Err(RuntimeError::unsupported(format!("cannot view {other:?} as an image")))
            }
            (false, MemoryVariant::Buffer(buffer)) => MemoryVariant::Buffer(buffer),
            (false, MemoryVariant::Image { .. } | MemoryVariant::MediaSurface { .. }) => {
                MemoryVariant::Buffer(NativeBuffer { imported })
            }
            (false, other @ (MemoryVariant::ExternalBuffer(_) | MemoryVariant::Unified(_))) => other,
        };

        tracing::debug!(memory = memory.id(), dims = ?layout.dims(), "reinterpreting memory");
        Memory::new(
            memory.origin().clone(),
            layout,
            memory.kind(),
            variant,
            memory.storage().clone(),
        )
    }

    fn register(&self, storage: &Arc<DeviceAllocation>) {
        let mut registry = self.registry.write();
        registry.retain(|_, weak| weak.strong_count() > 0);
        registry.insert(storage.handle(), Arc::downgrade(storage));
    }

    fn lookup(&self, handle: NativeHandle) -> Result<Arc<DeviceAllocation>> {
        self.registry
            .read()
            .get(&handle)
            .and_then(Weak::upgrade)
            .ok_or_else(|| RuntimeError::ForeignMemory(format!("handle {handle:?} is not a live allocation of this engine")))
    }

    fn provider(&self, what: &str) -> Result<Arc<dyn ExternalMemoryProvider>> {
        self.provider
            .read()
            .clone()
            .ok_or_else(|| RuntimeError::unsupported(format!("importing {what} needs an external memory provider")))
    }

    // ============================================================================================
    // Import
    // ============================================================================================

    /// Wrap an existing backend buffer handle.
    pub fn share_buffer(&self, layout: &Layout, handle: NativeHandle) -> Result<MemoryPtr> {
        self.import_memory(layout, &SharedMemParams::buffer(self.context, handle))
    }

    /// Wrap an existing backend image handle.
    pub fn share_image(&self, layout: &Layout, handle: NativeHandle) -> Result<MemoryPtr> {
        self.import_memory(layout, &SharedMemParams::image(self.context, handle))
    }

    /// Import one plane of a media surface.
    pub fn share_surface(
        &self,
        layout: &Layout,
        device: NativeHandle,
        surface: SharedSurface,
        plane: u32,
    ) -> Result<MemoryPtr> {
        self.import_memory(layout, &SharedMemParams::va_surface(self.context, device, surface, plane))
    }

    /// Import a buffer owned by an OS graphics device.
    pub fn share_dx_buffer(&self, layout: &Layout, device: NativeHandle, resource: NativeHandle) -> Result<MemoryPtr> {
        self.import_memory(layout, &SharedMemParams::dx_buffer(self.context, device, resource))
    }

    /// Create a memory object for the resource described by `params`.
    ///
    /// # Errors
    ///
    /// - `Unsupported` for an `Empty` descriptor, a surface handle in the
    ///   representation this build does not use, or a surface/device-buffer
    ///   import without a provider.
    /// - `ForeignMemory` when the descriptor names another context or a
    ///   buffer/image handle this engine did not allocate.
    pub fn import_memory(&self, layout: &Layout, params: &SharedMemParams) -> Result<MemoryPtr> {
        layout.validate()?;
        if !params.context.is_null() && params.context != self.context {
            return Err(RuntimeError::ForeignMemory(format!(
                "descriptor context {:?} does not belong to engine {}",
                params.context, self.id
            )));
        }

        let (variant, storage) = match params.mem_type {
            SharedMemType::Empty => {
                return Err(RuntimeError::unsupported("descriptor carries no memory type"));
            }
            SharedMemType::Buffer => {
                require_linear(layout, "buffer")?;
                (MemoryVariant::Buffer(NativeBuffer { imported: true }), self.lookup(params.mem)?)
            }
            SharedMemType::Image => {
                let pitch = ImagePitch::from_layout(layout)?;
                (MemoryVariant::Image { pitch, imported: true }, self.lookup(params.mem)?)
            }
            SharedMemType::VaSurface => {
                if params.surface.repr() != self.config.surface_repr {
                    return Err(RuntimeError::unsupported(format!(
                        "surface given as {:?}, this runtime uses {:?}",
                        params.surface.repr(),
                        self.config.surface_repr
                    )));
                }
                let pitch = ImagePitch::from_layout(layout)?;
                let storage =
                    self.provider("media surfaces")?
                        .resolve_surface(params.user_device, params.surface, params.plane, layout)?;
                let surface = MediaSurface::from_params(params);
                (MemoryVariant::MediaSurface { pitch, surface }, storage)
            }
            SharedMemType::DxBuffer => {
                require_linear(layout, "device buffer")?;
                let storage = self
                    .provider("device buffers")?
                    .resolve_device_buffer(params.user_device, params.mem, layout)?;
                (MemoryVariant::ExternalBuffer(ExternalBuffer::from_params(params)), storage)
            }
        };

        tracing::debug!(engine = self.id, mem_type = ?params.mem_type, handle = ?params.mem, "importing memory");
        Memory::new(self.origin(), layout.clone(), AllocationKind::NativeBuffer, variant, storage)
    }
}

fn require_linear(layout: &Layout, what: &str) -> Result<()> {
    if layout.is_image() {
        return Err(RuntimeError::invalid_layout(format!("{what} imports need a linear layout")));
    }
    Ok(())
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("id", &self.id)
            .field("device", &self.device.info().name)
            .field("runtime", &self.config.runtime)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::MemoryCapabilities;
    use crate::device::{Device, DeviceInfo};
    use crate::memory::LockType;

    fn engine_with(kinds: &[AllocationKind]) -> Engine {
        let info = DeviceInfo {
            mem_caps: MemoryCapabilities::new(kinds.iter().copied()),
            ..DeviceInfo::default()
        };
        Engine::new(Device::new(info), RuntimeConfig::default()).unwrap()
    }

    #[test]
    fn test_preferred_kind_order() {
        assert_eq!(
            engine_with(&AllocationKind::ALL).preferred_allocation_kind(),
            Some(AllocationKind::UnifiedDevice)
        );
        assert_eq!(
            engine_with(&[AllocationKind::UnifiedShared, AllocationKind::NativeBuffer]).preferred_allocation_kind(),
            Some(AllocationKind::NativeBuffer)
        );
        assert_eq!(engine_with(&[AllocationKind::UnifiedHost]).preferred_allocation_kind(), None);
    }

    #[test]
    fn test_rejects_unspecified_and_unsupported_kinds() {
        let engine = engine_with(&[AllocationKind::NativeBuffer]);
        let layout = Layout::bytes(64);
        assert!(matches!(
            engine.allocate_memory(&layout, AllocationKind::Unspecified),
            Err(RuntimeError::Unsupported(_))
        ));
        assert!(matches!(
            engine.allocate_memory(&layout, AllocationKind::UnifiedShared),
            Err(RuntimeError::Unsupported(_))
        ));
    }

    #[test]
    fn test_allocation_is_accounted() {
        let engine = engine_with(&[AllocationKind::NativeBuffer]);
        let memory = engine.allocate_memory(&Layout::bytes(4096), AllocationKind::NativeBuffer).unwrap();
        assert_eq!(engine.memory_usage().allocated, 4096);
        assert!(memory.is_allocated_by(&engine));
        drop(memory);
        assert_eq!(engine.memory_usage().allocated, 0);
        assert_eq!(engine.memory_usage().peak, 4096);
    }

    #[test]
    fn test_image_needs_native_buffer() {
        let engine = engine_with(&AllocationKind::ALL);
        let layout = Layout::image_2d(10, 4, 4);
        assert!(engine.allocate_memory(&layout, AllocationKind::UnifiedShared).is_err());
        let image = engine.allocate_memory(&layout, AllocationKind::NativeBuffer).unwrap();
        let pitch = image.variant().pitch().unwrap();
        assert_eq!(pitch.row_pitch, 64);
        assert_eq!(image.device_size(), 256);
    }

    #[test]
    fn test_share_buffer_resolves_registered_handle() {
        let engine = engine_with(&[AllocationKind::NativeBuffer]);
        let stream = engine.create_stream().unwrap();
        let original = engine.allocate_memory(&Layout::of::<u32>(4), AllocationKind::NativeBuffer).unwrap();
        original
            .map(stream.as_ref(), LockType::Write)
            .unwrap()
            .write_as(0, 42u32)
            .unwrap();

        let shared = engine.share_buffer(&Layout::of::<u32>(4), original.native_handle()).unwrap();
        assert!(shared.variant().is_imported());
        assert_eq!(shared.map(stream.as_ref(), LockType::Read).unwrap().read_as::<u32>(0).unwrap(), 42);

        assert!(matches!(
            engine.share_buffer(&Layout::bytes(4), NativeHandle(0xbad)),
            Err(RuntimeError::ForeignMemory(_))
        ));
    }

    #[test]
    fn test_import_rejects_empty_and_foreign_context() {
        let engine = engine_with(&[AllocationKind::NativeBuffer]);
        let layout = Layout::bytes(16);
        assert!(matches!(
            engine.import_memory(&layout, &SharedMemParams::default()),
            Err(RuntimeError::Unsupported(_))
        ));

        let other = engine_with(&[AllocationKind::NativeBuffer]);
        let params = SharedMemParams::buffer(other.context(), NativeHandle(0x1000));
        assert!(matches!(engine.import_memory(&layout, &params), Err(RuntimeError::ForeignMemory(_))));
    }

    #[test]
    fn test_surface_import_needs_provider() {
        let engine = engine_with(&[AllocationKind::NativeBuffer]);
        let surface = SharedSurface::none(engine.config().surface_repr);
        let result = engine.share_surface(&Layout::image_2d(8, 8, 1), NativeHandle(1), surface, 0);
        assert!(matches!(result, Err(RuntimeError::Unsupported(_))));
    }

    #[test]
    fn test_reinterpret_shares_storage() {
        let engine = engine_with(&[AllocationKind::NativeBuffer]);
        let memory = engine.allocate_memory(&Layout::of::<u32>(8), AllocationKind::NativeBuffer).unwrap();
        let bytes = engine.reinterpret_buffer(&memory, Layout::bytes(32)).unwrap();
        assert_eq!(bytes.native_handle(), memory.native_handle());
        assert!(matches!(
            engine.reinterpret_buffer(&memory, Layout::bytes(64)),
            Err(RuntimeError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_unified_runtime_requires_unified_device() {
        let info = DeviceInfo {
            mem_caps: MemoryCapabilities::new([AllocationKind::NativeBuffer]),
            ..DeviceInfo::default()
        };
        let config = RuntimeConfig {
            runtime: RuntimeType::UnifiedQueue,
            ..RuntimeConfig::default()
        };
        assert!(Engine::new(Device::new(info), config).is_err());
    }
}
