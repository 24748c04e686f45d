//! Integration tests for importing and exporting shared memory descriptors

use hologram_runtime::memory::ImagePitch;
use hologram_runtime::{
    AllocationKind, DeviceAllocation, Engine, ExternalMemoryProvider, Layout, MemoryVariant, NativeHandle,
    RuntimeConfig, RuntimeError, SharedMemParams, SharedMemType, SharedSurface, SurfaceRepr,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Hands out one external allocation per resource and returns it again on
/// repeated imports.
#[derive(Default)]
struct FakeProducer {
    surfaces: Mutex<HashMap<(NativeHandle, SharedSurface, u32), Arc<DeviceAllocation>>>,
    buffers: Mutex<HashMap<(NativeHandle, NativeHandle), Arc<DeviceAllocation>>>,
}

impl ExternalMemoryProvider for FakeProducer {
    fn resolve_surface(
        &self,
        device: NativeHandle,
        surface: SharedSurface,
        plane: u32,
        layout: &Layout,
    ) -> hologram_runtime::Result<Arc<DeviceAllocation>> {
        let size = ImagePitch::from_layout(layout)?.slice_pitch;
        let mut surfaces = self.surfaces.lock();
        if let Some(existing) = surfaces.get(&(device, surface, plane)) {
            return Ok(existing.clone());
        }
        let storage = Arc::new(DeviceAllocation::external(size)?);
        surfaces.insert((device, surface, plane), storage.clone());
        Ok(storage)
    }

    fn resolve_device_buffer(
        &self,
        device: NativeHandle,
        resource: NativeHandle,
        layout: &Layout,
    ) -> hologram_runtime::Result<Arc<DeviceAllocation>> {
        let mut buffers = self.buffers.lock();
        if let Some(existing) = buffers.get(&(device, resource)) {
            return Ok(existing.clone());
        }
        let storage = Arc::new(DeviceAllocation::external(layout.bytes_count())?);
        buffers.insert((device, resource), storage.clone());
        Ok(storage)
    }
}

fn engine_with_producer() -> Engine {
    let engine = Engine::from_query(RuntimeConfig::default()).unwrap();
    engine.set_external_memory_provider(Arc::new(FakeProducer::default()));
    engine
}

fn surface_for(repr: SurfaceRepr, id: u32) -> SharedSurface {
    match repr {
        SurfaceRepr::Handle => SharedSurface::Handle(NativeHandle(0x5000 + id as usize)),
        SurfaceRepr::Index => SharedSurface::Index(id),
    }
}

#[test]
fn test_media_surface_export_names_the_imported_plane() {
    let engine = engine_with_producer();
    let mut stream = engine.create_stream().unwrap();
    let device = NativeHandle(0xd3);
    let surface = surface_for(engine.config().surface_repr, 7);
    let layout = Layout::image_2d(16, 4, 1);

    let luma = engine.share_surface(&layout, device, surface, 0).unwrap();
    assert_eq!(luma.kind(), AllocationKind::NativeBuffer);
    assert!(matches!(luma.variant(), MemoryVariant::MediaSurface { .. }));

    let pixels: Vec<u8> = (0..64).collect();
    luma.copy_from_host(stream.as_mut(), &pixels).unwrap();
    stream.finish().unwrap();

    let exported = luma.get_internal_params();
    assert_eq!(exported.mem_type, SharedMemType::VaSurface);
    assert_eq!(exported.context, engine.context());
    assert_eq!(exported.user_device, device);
    assert_eq!(exported.surface, surface);
    assert_eq!(exported.plane, 0);
    assert!(exported.same_surface(&SharedMemParams::va_surface(NativeHandle::NULL, device, surface, 0)));

    // Importing the exported descriptor reaches the same producer storage.
    let again = engine.import_memory(&layout, &exported).unwrap();
    assert_eq!(again.native_handle(), luma.native_handle());
    let mut out = vec![0u8; 64];
    again.copy_to_host(stream.as_mut(), &mut out).unwrap();
    assert_eq!(out, pixels);
}

#[test]
fn test_surface_planes_are_distinct() {
    let engine = engine_with_producer();
    let surface = surface_for(engine.config().surface_repr, 3);
    let luma = engine
        .share_surface(&Layout::image_2d(8, 8, 1), NativeHandle(1), surface, 0)
        .unwrap();
    let chroma = engine
        .share_surface(&Layout::image_2d(4, 4, 2), NativeHandle(1), surface, 1)
        .unwrap();

    assert_ne!(luma.native_handle(), chroma.native_handle());
    assert!(!luma.get_internal_params().same_surface(&chroma.get_internal_params()));
}

#[test]
fn test_surface_in_other_representation_is_unsupported() {
    let engine = engine_with_producer();
    let other = match engine.config().surface_repr {
        SurfaceRepr::Handle => SurfaceRepr::Index,
        SurfaceRepr::Index => SurfaceRepr::Handle,
    };
    let result = engine.share_surface(&Layout::image_2d(8, 8, 1), NativeHandle(1), surface_for(other, 1), 0);
    assert!(matches!(result, Err(RuntimeError::Unsupported(_))));
}

#[test]
fn test_dx_buffer_round_trip() {
    let engine = engine_with_producer();
    let mut stream = engine.create_stream().unwrap();
    let device = NativeHandle(0xdd);
    let resource = NativeHandle(0x7700);
    let layout = Layout::of::<u32>(32);

    let buffer = engine.share_dx_buffer(&layout, device, resource).unwrap();
    assert_eq!(buffer.kind(), AllocationKind::NativeBuffer);
    assert!(buffer.variant().is_imported());
    buffer.fill_value(stream.as_mut(), 9u32).unwrap();
    stream.finish().unwrap();

    let exported = buffer.get_internal_params();
    assert_eq!(exported, SharedMemParams::dx_buffer(engine.context(), device, resource));

    let view = engine.import_memory(&layout, &exported).unwrap();
    let values: Vec<u32> = view.read_as_vec(stream.as_mut()).unwrap();
    assert!(values.iter().all(|&v| v == 9));
}

#[test]
fn test_dx_buffer_needs_linear_layout() {
    let engine = engine_with_producer();
    let result = engine.share_dx_buffer(&Layout::image_2d(4, 4, 4), NativeHandle(1), NativeHandle(2));
    assert!(matches!(result, Err(RuntimeError::InvalidLayout(_))));
}

#[test]
fn test_native_buffer_export_reimports_on_same_engine_only() {
    let engine = engine_with_producer();
    let memory = engine.allocate_memory(&Layout::bytes(128), AllocationKind::NativeBuffer).unwrap();
    let params = memory.get_internal_params();
    assert_eq!(params.mem_type, SharedMemType::Buffer);
    assert_eq!(params.mem, memory.native_handle());

    let view = engine.import_memory(&Layout::bytes(128), &params).unwrap();
    assert_eq!(view.native_handle(), memory.native_handle());

    let other = engine_with_producer();
    assert!(matches!(
        other.import_memory(&Layout::bytes(128), &params),
        Err(RuntimeError::ForeignMemory(_))
    ));
}

#[test]
fn test_unified_export_cannot_be_imported() {
    let engine = engine_with_producer();
    let memory = engine.allocate_memory(&Layout::bytes(64), AllocationKind::UnifiedShared).unwrap();
    let params = memory.get_internal_params();
    assert_eq!(params.mem_type, SharedMemType::Empty);
    assert_eq!(params.mem, memory.native_handle());
    assert!(matches!(
        engine.import_memory(&Layout::bytes(64), &params),
        Err(RuntimeError::Unsupported(_))
    ));
}
