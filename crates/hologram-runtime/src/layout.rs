//! Shape and byte-size description of memory objects
//!
//! The runtime only extracts byte counts and image pitches from a layout;
//! element types and tensor formats are left to callers.

use crate::error::{Result, RuntimeError};
use serde::{Deserialize, Serialize};

/// Row pitch alignment for 2D images, in bytes
pub const IMAGE_ROW_ALIGNMENT: usize = 64;

/// Storage format of a layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryFormat {
    /// Linear buffer
    #[default]
    Linear,
    /// Row-pitched 2D image; dims are `[height, width]`
    Image2d,
}

/// Byte size and shape of a memory object
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Layout {
    dims: Vec<usize>,
    element_size: usize,
    format: MemoryFormat,
}

impl Layout {
    /// Linear layout with the given dimensions and element size
    pub fn linear(dims: impl Into<Vec<usize>>, element_size: usize) -> Self {
        Self {
            dims: dims.into(),
            element_size,
            format: MemoryFormat::Linear,
        }
    }

    /// Linear layout of `count` bytes
    pub fn bytes(count: usize) -> Self {
        Self::linear(vec![count], 1)
    }

    /// Linear layout of `count` elements of `T`
    pub fn of<T: bytemuck::Pod>(count: usize) -> Self {
        Self::linear(vec![count], std::mem::size_of::<T>())
    }

    /// 2D image layout with `bytes_per_pixel` bytes per pixel
    pub fn image_2d(width: usize, height: usize, bytes_per_pixel: usize) -> Self {
        Self {
            dims: vec![height, width],
            element_size: bytes_per_pixel,
            format: MemoryFormat::Image2d,
        }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    pub fn format(&self) -> MemoryFormat {
        self.format
    }

    pub fn is_image(&self) -> bool {
        self.format == MemoryFormat::Image2d
    }

    /// Number of elements
    pub fn count(&self) -> usize {
        self.dims.iter().product()
    }

    /// Number of bytes in the dense (unpitched) representation
    pub fn bytes_count(&self) -> usize {
        self.count() * self.element_size
    }

    /// `(width, height)` of an image layout
    pub fn image_extent(&self) -> Option<(usize, usize)> {
        match (self.format, self.dims.as_slice()) {
            (MemoryFormat::Image2d, [height, width]) => Some((*width, *height)),
            _ => None,
        }
    }

    /// Reject layouts that cannot back an allocation
    pub fn validate(&self) -> Result<()> {
        if self.element_size == 0 {
            return Err(RuntimeError::invalid_layout("element size is zero"));
        }
        if self.dims.is_empty() {
            return Err(RuntimeError::invalid_layout("layout has no dimensions"));
        }
        if self.dims.contains(&0) {
            return Err(RuntimeError::invalid_layout(format!("zero-sized dimension in {:?}", self.dims)));
        }
        let overflow = self
            .dims
            .iter()
            .try_fold(self.element_size, |acc, &d| acc.checked_mul(d))
            .is_none();
        if overflow {
            return Err(RuntimeError::invalid_layout("byte size overflows usize"));
        }
        if self.is_image() && self.image_extent().is_none() {
            return Err(RuntimeError::invalid_layout("image layouts need exactly [height, width]"));
        }
        Ok(())
    }
}

/// `value` rounded up to a multiple of `alignment`, `None` on overflow
pub(crate) const fn align_up(value: usize, alignment: usize) -> Option<usize> {
    value.div_ceil(alignment).checked_mul(alignment)
}
