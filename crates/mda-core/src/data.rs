//! Frame payloads and their pixel layout.
//!
//! A [`Frame`] owns its bytes; [`FrameShape`] is the width and height carried
//! in notifications, and [`PixelType`] fixes the sample size of a store.

use crate::error::{EdaError, EdaResult};
use crate::limits::validate_frame_size;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sample type of a store, fixed when the store is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelType {
    /// 8-bit unsigned samples (1 byte/pixel)
    U8,
    /// 16-bit unsigned samples, little endian (2 bytes/pixel)
    U16,
}

impl PixelType {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            PixelType::U8 => 1,
            PixelType::U16 => 2,
        }
    }

    /// Stable numeric tag written into ring buffer headers.
    pub fn tag(self) -> u32 {
        match self {
            PixelType::U8 => 1,
            PixelType::U16 => 2,
        }
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(PixelType::U8),
            2 => Some(PixelType::U16),
            _ => None,
        }
    }
}

impl fmt::Display for PixelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelType::U8 => f.write_str("u8"),
            PixelType::U16 => f.write_str("u16"),
        }
    }
}

/// Width and height of a frame, as carried in `FrameReady`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "[u32; 2]", into = "[u32; 2]")]
pub struct FrameShape {
    pub width: u32,
    pub height: u32,
}

impl FrameShape {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl From<[u32; 2]> for FrameShape {
    fn from([width, height]: [u32; 2]) -> Self {
        Self { width, height }
    }
}

impl From<FrameShape> for [u32; 2] {
    fn from(shape: FrameShape) -> Self {
        [shape.width, shape.height]
    }
}

impl fmt::Display for FrameShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A single image frame.
///
/// # Storage
/// Data is stored as a raw byte vector (`Vec<u8>`), row-major, `height` rows
/// of `width` samples.
/// - 8-bit images: 1 byte per pixel.
/// - 16-bit images: 2 bytes per pixel, Little Endian.
///
/// Frames are ephemeral: they exist as arguments to `put` and return values of
/// `get`, and are never retained outside the ring buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Width in pixels
    pub width: u32,

    /// Height in pixels
    pub height: u32,

    pub pixel_type: PixelType,

    /// Raw pixel data
    pub data: Vec<u8>,
}

impl Frame {
    /// Create a new frame from 16-bit pixel data.
    ///
    /// Copies the data into a byte vector.
    pub fn from_u16(width: u32, height: u32, pixels: &[u16]) -> Self {
        let mut data = Vec::with_capacity(pixels.len() * 2);
        for pixel in pixels {
            data.extend_from_slice(&pixel.to_le_bytes());
        }

        Self {
            width,
            height,
            pixel_type: PixelType::U16,
            data,
        }
    }

    /// Create a new frame from 8-bit pixel data.
    pub fn from_u8(width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            pixel_type: PixelType::U8,
            data,
        }
    }

    /// Create a frame from raw bytes, checking the length against the shape.
    pub fn from_bytes(
        width: u32,
        height: u32,
        pixel_type: PixelType,
        data: Vec<u8>,
    ) -> EdaResult<Self> {
        let frame = Self {
            width,
            height,
            pixel_type,
            data,
        };
        frame.validate()?;
        Ok(frame)
    }

    pub fn shape(&self) -> FrameShape {
        FrameShape::new(self.width, self.height)
    }

    /// Payload length implied by the shape and sample type.
    pub fn expected_len(&self) -> EdaResult<usize> {
        Ok(validate_frame_size(self.width, self.height, self.pixel_type.bytes_per_sample())?.bytes)
    }

    /// Check dimension limits and that the payload matches the shape.
    pub fn validate(&self) -> EdaResult<()> {
        let expected = self.expected_len()?;
        if expected != self.data.len() {
            return Err(EdaError::FrameSizeMismatch {
                width: self.width,
                height: self.height,
                pixel_type: self.pixel_type,
                expected,
                actual: self.data.len(),
            });
        }
        Ok(())
    }

    /// Get pixel value at (x, y) as u32.
    pub fn get(&self, x: u32, y: u32) -> Option<u32> {
        if x >= self.width || y >= self.height {
            return None;
        }

        let idx = y as usize * self.width as usize + x as usize;

        match self.pixel_type {
            PixelType::U8 => self.data.get(idx).map(|&v| v as u32),
            PixelType::U16 => {
                let start = idx * 2;
                let bytes = self.data.get(start..start + 2)?;
                Some(u16::from_le_bytes([bytes[0], bytes[1]]) as u32)
            }
        }
    }

    /// Decode 16-bit samples. Returns None for 8-bit frames.
    pub fn to_u16_vec(&self) -> Option<Vec<u16>> {
        if self.pixel_type != PixelType::U16 {
            return None;
        }
        Some(
            self.data
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect(),
        )
    }

    /// True if any sample is nonzero.
    pub fn any_nonzero(&self) -> bool {
        self.data.iter().any(|&b| b != 0)
    }

    /// Calculate mean pixel value.
    pub fn mean(&self) -> f64 {
        match self.pixel_type {
            PixelType::U8 => {
                if self.data.is_empty() {
                    return 0.0;
                }
                let sum: u64 = self.data.iter().map(|&v| v as u64).sum();
                sum as f64 / self.data.len() as f64
            }
            PixelType::U16 => {
                let samples = self.to_u16_vec().unwrap_or_default();
                if samples.is_empty() {
                    return 0.0;
                }
                let sum: u64 = samples.iter().map(|&v| v as u64).sum();
                sum as f64 / samples.len() as f64
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_u16_is_little_endian() {
        let frame = Frame::from_u16(2, 1, &[0x0102, 0xA0B0]);
        assert_eq!(frame.data, vec![0x02, 0x01, 0xB0, 0xA0]);
        assert_eq!(frame.get(1, 0), Some(0xA0B0));
        assert_eq!(frame.get(2, 0), None);
    }

    #[test]
    fn test_from_bytes_rejects_short_payload() {
        let err = Frame::from_bytes(4, 4, PixelType::U16, vec![0; 16]).unwrap_err();
        assert!(matches!(
            err,
            EdaError::FrameSizeMismatch {
                expected: 32,
                actual: 16,
                ..
            }
        ));
    }

    #[test]
    fn test_mean_and_nonzero() {
        let frame = Frame::from_u16(2, 2, &[0, 2, 4, 6]);
        assert!((frame.mean() - 3.0).abs() < f64::EPSILON);
        assert!(frame.any_nonzero());
        assert!(!Frame::from_u8(2, 1, vec![0, 0]).any_nonzero());
    }

    #[test]
    fn test_shape_serializes_as_pair() {
        let json = serde_json::to_string(&FrameShape::new(512, 256)).unwrap();
        assert_eq!(json, "[512,256]");
        let back: FrameShape = serde_json::from_str(&json).unwrap();
        assert_eq!(back.width, 512);
    }

    #[test]
    fn test_pixel_type_tags() {
        for pt in [PixelType::U8, PixelType::U16] {
            assert_eq!(PixelType::from_tag(pt.tag()), Some(pt));
        }
        assert_eq!(PixelType::from_tag(99), None);
    }
}
