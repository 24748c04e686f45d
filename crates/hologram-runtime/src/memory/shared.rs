//! Backend-neutral descriptors for importing and exporting memory

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque native handle (context, device, memory object or surface)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NativeHandle(pub usize);

impl NativeHandle {
    pub const NULL: NativeHandle = NativeHandle(0);

    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeHandle({:#x})", self.0)
    }
}

/// What kind of resource a [`SharedMemParams`] describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharedMemType {
    #[default]
    Empty,
    Buffer,
    Image,
    /// Video/media surface plane
    VaSurface,
    /// OS graphics device buffer
    DxBuffer,
}

/// Which surface representation a build uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurfaceRepr {
    /// Opaque pointer-sized handle
    Handle,
    /// 32-bit surface index
    Index,
}

impl SurfaceRepr {
    /// Handle on Windows targets, index everywhere else
    pub const fn for_target() -> Self {
        if cfg!(windows) {
            Self::Handle
        } else {
            Self::Index
        }
    }
}

impl Default for SurfaceRepr {
    fn default() -> Self {
        Self::for_target()
    }
}

/// Surface identifier in one of the two platform representations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharedSurface {
    Handle(NativeHandle),
    Index(u32),
}

impl SharedSurface {
    /// The "no surface" value for a representation
    pub const fn none(repr: SurfaceRepr) -> Self {
        match repr {
            SurfaceRepr::Handle => Self::Handle(NativeHandle::NULL),
            SurfaceRepr::Index => Self::Index(0),
        }
    }

    pub const fn repr(self) -> SurfaceRepr {
        match self {
            Self::Handle(_) => SurfaceRepr::Handle,
            Self::Index(_) => SurfaceRepr::Index,
        }
    }
}

impl Default for SharedSurface {
    fn default() -> Self {
        Self::none(SurfaceRepr::for_target())
    }
}

/// Native handles describing memory shared with an external subsystem
///
/// Only used while importing or exporting; memory objects never keep the
/// descriptor they were created from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SharedMemParams {
    pub mem_type: SharedMemType,
    pub context: NativeHandle,
    pub user_device: NativeHandle,
    pub mem: NativeHandle,
    pub surface: SharedSurface,
    pub plane: u32,
}

impl SharedMemParams {
    pub fn buffer(context: NativeHandle, mem: NativeHandle) -> Self {
        Self {
            mem_type: SharedMemType::Buffer,
            context,
            mem,
            ..Self::default()
        }
    }

    pub fn image(context: NativeHandle, mem: NativeHandle) -> Self {
        Self {
            mem_type: SharedMemType::Image,
            context,
            mem,
            ..Self::default()
        }
    }

    pub fn va_surface(context: NativeHandle, device: NativeHandle, surface: SharedSurface, plane: u32) -> Self {
        Self {
            mem_type: SharedMemType::VaSurface,
            context,
            user_device: device,
            surface,
            plane,
            ..Self::default()
        }
    }

    pub fn dx_buffer(context: NativeHandle, device: NativeHandle, resource: NativeHandle) -> Self {
        Self {
            mem_type: SharedMemType::DxBuffer,
            context,
            user_device: device,
            mem: resource,
            ..Self::default()
        }
    }

    /// Descriptor exported by unified memory: no backend object, just the pointer
    pub fn unified(context: NativeHandle, ptr: NativeHandle) -> Self {
        Self {
            mem_type: SharedMemType::Empty,
            context,
            mem: ptr,
            ..Self::default()
        }
    }

    /// Whether two descriptors name the same surface plane on the same device
    pub fn same_surface(&self, other: &SharedMemParams) -> bool {
        self.mem_type == other.mem_type
            && self.user_device == other.user_device
            && self.surface == other.surface
            && self.plane == other.plane
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_representation() {
        let repr = SurfaceRepr::for_target();
        assert_eq!(SharedSurface::default().repr(), repr);
        if cfg!(windows) {
            assert_eq!(repr, SurfaceRepr::Handle);
        } else {
            assert_eq!(repr, SurfaceRepr::Index);
        }
    }

    #[test]
    fn test_constructors_set_type_and_handles() {
        let ctx = NativeHandle(0x10);
        let dev = NativeHandle(0x20);
        let dx = SharedMemParams::dx_buffer(ctx, dev, NativeHandle(0x30));
        assert_eq!(dx.mem_type, SharedMemType::DxBuffer);
        assert_eq!(dx.user_device, dev);
        assert_eq!(dx.mem, NativeHandle(0x30));
        assert_eq!(dx.plane, 0);

        let usm = SharedMemParams::unified(ctx, NativeHandle(0x40));
        assert_eq!(usm.mem_type, SharedMemType::Empty);
        assert!(usm.user_device.is_null());
    }

    #[test]
    fn test_same_surface_ignores_context_and_mem() {
        let a = SharedMemParams::va_surface(NativeHandle(1), NativeHandle(2), SharedSurface::Index(7), 1);
        let mut b = a;
        b.context = NativeHandle(99);
        b.mem = NativeHandle(5);
        assert!(a.same_surface(&b));
        b.plane = 0;
        assert!(!a.same_surface(&b));
    }

    #[test]
    fn test_handle_debug_is_hex() {
        assert_eq!(format!("{:?}", NativeHandle(255)), "NativeHandle(0xff)");
    }
}
