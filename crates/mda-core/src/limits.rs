//! Shared hard limits to prevent unbounded allocations or payload growth.
//!
//! This module centralizes:
//! - Frame and message size limits
//! - Timeouts for the cross-process receiver loop
//! - Initial index extents

use crate::error::EdaError;
use std::time::Duration;

// =============================================================================
// Timeout Constants
// =============================================================================

/// Bounded dequeue timeout of the remote receiver loop (0.5 seconds).
///
/// The timeout exists only so the loop can observe its stop flag; it never
/// causes a message to be dropped.
pub const RECEIVER_POLL_TIMEOUT: Duration = Duration::from_millis(500);

// =============================================================================
// Size Limits
// =============================================================================

/// Default ring buffer capacity (10^9 bytes).
pub const DEFAULT_CAPACITY_BYTES: u64 = 1_000_000_000;

/// Maximum allowed frame payload in bytes (default: 256MB).
pub const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

/// Maximum supported width/height for frames.
pub const MAX_FRAME_DIMENSION: u32 = 65_536;

/// Maximum serialized size of one cross-process event message (default: 1MB).
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Default upper bound on index cells (channel x z x time).
pub const MAX_INDEX_ENTRIES: usize = 64 * 1024 * 1024;

// =============================================================================
// Index Defaults
// =============================================================================

pub const DEFAULT_INDEX_CHANNELS: usize = 3;
pub const DEFAULT_INDEX_Z: usize = 1;
pub const DEFAULT_INDEX_TIME: usize = 1000;

/// Validated frame sizing information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSize {
    pub pixels: usize,
    pub bytes: usize,
}

/// Validate frame dimensions and calculate pixel/byte sizes safely.
pub fn validate_frame_size(
    width: u32,
    height: u32,
    bytes_per_pixel: usize,
) -> Result<FrameSize, EdaError> {
    if width > MAX_FRAME_DIMENSION || height > MAX_FRAME_DIMENSION {
        return Err(EdaError::FrameDimensionsTooLarge {
            width,
            height,
            max_dimension: MAX_FRAME_DIMENSION,
        });
    }

    let pixels = (width as usize)
        .checked_mul(height as usize)
        .ok_or(EdaError::SizeOverflow {
            context: "frame pixel count",
        })?;

    let bytes = pixels
        .checked_mul(bytes_per_pixel)
        .ok_or(EdaError::SizeOverflow {
            context: "frame byte size",
        })?;

    if bytes > MAX_FRAME_BYTES {
        return Err(EdaError::FrameTooLarge {
            bytes,
            max_bytes: MAX_FRAME_BYTES,
        });
    }

    Ok(FrameSize { pixels, bytes })
}
