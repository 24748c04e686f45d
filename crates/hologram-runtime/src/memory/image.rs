//! Native 2D images and media surfaces imported from external producers

use super::allocation::DeviceAllocation;
use super::shared::{NativeHandle, SharedMemParams, SharedSurface};
use crate::error::{Result, RuntimeError};
use crate::layout::{align_up, Layout, IMAGE_ROW_ALIGNMENT};

/// Geometry of a row-pitched 2D image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImagePitch {
    pub width: usize,
    pub height: usize,
    pub bytes_per_pixel: usize,
    /// Bytes between the starts of consecutive rows
    pub row_pitch: usize,
    /// Bytes of the whole image including row padding
    pub slice_pitch: usize,
}

impl ImagePitch {
    pub fn from_layout(layout: &Layout) -> Result<Self> {
        let (width, height) = layout
            .image_extent()
            .ok_or_else(|| RuntimeError::invalid_layout("image memory needs an image_2d layout"))?;
        let bytes_per_pixel = layout.element_size();
        let overflow = || RuntimeError::invalid_layout(format!("pitched {width}x{height} image overflows usize"));
        let row_pitch = width
            .checked_mul(bytes_per_pixel)
            .and_then(|row| align_up(row, IMAGE_ROW_ALIGNMENT))
            .ok_or_else(overflow)?;
        let slice_pitch = row_pitch.checked_mul(height).ok_or_else(overflow)?;
        Ok(Self {
            width,
            height,
            bytes_per_pixel,
            row_pitch,
            slice_pitch,
        })
    }

    /// Dense bytes in one row
    pub fn row_bytes(&self) -> usize {
        self.width * self.bytes_per_pixel
    }

    /// Scatter dense rows from `src` into pitched storage.
    pub fn write_dense(&self, storage: &DeviceAllocation, src: &[u8]) -> Result<()> {
        let row = self.row_bytes();
        if src.len() != row * self.height {
            return Err(RuntimeError::SizeMismatch {
                expected: row * self.height,
                actual: src.len(),
            });
        }
        for (y, line) in src.chunks_exact(row).enumerate() {
            storage.write(y * self.row_pitch, line)?;
        }
        Ok(())
    }

    /// Gather pitched storage into dense rows in `dst`.
    pub fn read_dense(&self, storage: &DeviceAllocation, dst: &mut [u8]) -> Result<()> {
        let row = self.row_bytes();
        if dst.len() != row * self.height {
            return Err(RuntimeError::SizeMismatch {
                expected: row * self.height,
                actual: dst.len(),
            });
        }
        for (y, line) in dst.chunks_exact_mut(row).enumerate() {
            storage.read(y * self.row_pitch, line)?;
        }
        Ok(())
    }
}

/// Plane of an external video surface, owned by the surface producer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaSurface {
    pub device: NativeHandle,
    pub surface: SharedSurface,
    pub plane: u32,
}

impl MediaSurface {
    pub fn from_params(params: &SharedMemParams) -> Self {
        Self {
            device: params.user_device,
            surface: params.surface,
            plane: params.plane,
        }
    }

    pub fn export(&self, context: NativeHandle) -> SharedMemParams {
        SharedMemParams::va_surface(context, self.device, self.surface, self.plane)
    }
}
