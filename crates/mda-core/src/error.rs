//! Error types shared by every crate in the workspace.
//!
//! `EdaError` is the single error enum for the store, the index, the event
//! channel and the consumer adapters. Using `thiserror`, each variant carries
//! enough context to be logged on its own, and `#[from]` conversions let the
//! `?` operator lift I/O and configuration failures.
//!
//! ## Error Categories
//!
//! 1. **Store errors** - `OutOfRange`, `CoordinateNotFound`, `StoreClosed`,
//!    `GrowthFailure`, `DuplicateCoordinate`
//!    - Raised synchronously by `put`/`get` on the calling thread
//!    - On the acquisition thread these abort the acquisition; on a consumer
//!      thread they are reported without touching the producer
//!
//! 2. **Frame validation errors** - `FrameSizeMismatch`, `PixelTypeMismatch`,
//!    `FrameDimensionsTooLarge`, `FrameTooLarge`, `SizeOverflow`,
//!    `InvalidCoordinate`
//!    - Rejected before anything is written
//!
//! 3. **Channel errors** - `ChannelTimeout`, `Serialization`,
//!    `MessageTooLarge`, `Disconnected`
//!    - `ChannelTimeout` is a control-flow signal for the receiver loop, not a
//!      failure; `Serialization` is logged and the message dropped

use crate::coords::Coordinate;
use crate::data::PixelType;
use thiserror::Error;

/// Convenience alias for results using the workspace error type.
pub type EdaResult<T> = std::result::Result<T, EdaError>;

/// Primary error type for the frame store and its event channel.
#[derive(Error, Debug)]
pub enum EdaError {
    /// A buffer read or write would cross the end of the data region.
    ///
    /// Raised by `RingBuffer::read` when `offset + len` exceeds the capacity,
    /// and by `RingBuffer::put` when a single frame is larger than the whole
    /// buffer.
    #[error("Range {offset}..{offset}+{len} exceeds ring buffer capacity {capacity}")]
    OutOfRange { offset: u64, len: u64, capacity: u64 },

    /// Lookup of a coordinate that was never recorded.
    #[error("No frame recorded at {0}")]
    CoordinateNotFound(Coordinate),

    /// The store was closed (explicitly or after a fatal growth failure).
    #[error("Frame store is closed")]
    StoreClosed,

    /// The index table could not be extended.
    ///
    /// **Error Type**: Fatal to the store instance that raised it.
    #[error("Index growth to {channels}x{z}x{time} failed: {reason}")]
    GrowthFailure {
        channels: usize,
        z: usize,
        time: usize,
        reason: String,
    },

    /// A second frame arrived for a coordinate under `DuplicatePolicy::Reject`.
    #[error("Coordinate {0} was already recorded")]
    DuplicateCoordinate(Coordinate),

    /// Receiver poll timed out. Not an error: the loop checks its stop flag
    /// and polls again.
    #[error("Timed out waiting for the next message")]
    ChannelTimeout,

    /// A cross-process message could not be encoded or decoded.
    #[error("Malformed message: {0}")]
    Serialization(String),

    /// A framed message declared a payload longer than the configured limit.
    #[error("Message of {len} bytes exceeds limit of {max} bytes")]
    MessageTooLarge { len: usize, max: usize },

    /// The peer closed the transport.
    #[error("Transport disconnected")]
    Disconnected,

    #[error("Frame payload is {actual} bytes but {width}x{height} {pixel_type} needs {expected}")]
    FrameSizeMismatch {
        width: u32,
        height: u32,
        pixel_type: PixelType,
        expected: usize,
        actual: usize,
    },

    #[error("Store holds {expected} samples but frame is {actual}")]
    PixelTypeMismatch { expected: PixelType, actual: PixelType },

    #[error("Frame dimensions {width}x{height} exceed maximum {max_dimension} per dimension")]
    FrameDimensionsTooLarge {
        width: u32,
        height: u32,
        max_dimension: u32,
    },

    #[error("Size overflow while computing {context}")]
    SizeOverflow { context: &'static str },

    #[error("Frame size {bytes} bytes exceeds maximum {max_bytes} bytes")]
    FrameTooLarge { bytes: usize, max_bytes: usize },

    /// A partial coordinate carried an unknown axis or a negative index.
    #[error("Invalid coordinate: {0}")]
    InvalidCoordinate(String),

    /// A backing file did not carry a valid ring buffer header.
    #[error("Invalid ring buffer header: {0}")]
    InvalidHeader(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration parsed but failed semantic validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),
}

impl EdaError {
    /// Whether this error must abort the acquisition that raised it.
    ///
    /// Per-call problems (a missing coordinate, a bad frame) leave the store
    /// usable; a failed growth or a closed store does not.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EdaError::GrowthFailure { .. } | EdaError::StoreClosed | EdaError::Io(_)
        )
    }

    /// Whether the receiver loop should drop the message and keep going.
    pub fn is_per_message(&self) -> bool {
        matches!(
            self,
            EdaError::Serialization(_) | EdaError::MessageTooLarge { .. }
        )
    }
}

impl From<serde_json::Error> for EdaError {
    fn from(err: serde_json::Error) -> Self {
        EdaError::Serialization(err.to_string())
    }
}
