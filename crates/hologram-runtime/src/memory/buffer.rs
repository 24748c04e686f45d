//! Linear native buffers and buffers imported from OS graphics resources

use super::shared::{NativeHandle, SharedMemParams};

/// Linear backend buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeBuffer {
    /// Wraps a caller-supplied handle instead of a fresh allocation
    pub imported: bool,
}

impl NativeBuffer {
    pub fn export(&self, context: NativeHandle, mem: NativeHandle) -> SharedMemParams {
        SharedMemParams::buffer(context, mem)
    }
}

/// Buffer backed by an OS graphics device resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalBuffer {
    pub device: NativeHandle,
    pub resource: NativeHandle,
}

impl ExternalBuffer {
    pub fn from_params(params: &SharedMemParams) -> Self {
        Self {
            device: params.user_device,
            resource: params.mem,
        }
    }

    pub fn export(&self, context: NativeHandle) -> SharedMemParams {
        SharedMemParams::dx_buffer(context, self.device, self.resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SharedMemType;

    #[test]
    fn test_buffer_export() {
        let params = NativeBuffer { imported: false }.export(NativeHandle(1), NativeHandle(0x1000));
        assert_eq!(params.mem_type, SharedMemType::Buffer);
        assert_eq!(params.mem, NativeHandle(0x1000));
        assert!(params.user_device.is_null());
    }

    #[test]
    fn test_external_buffer_round_trip() {
        let params = SharedMemParams::dx_buffer(NativeHandle(1), NativeHandle(2), NativeHandle(3));
        assert_eq!(ExternalBuffer::from_params(&params).export(NativeHandle(1)), params);
    }
}
