//! `mda-core`
//!
//! Core types and traits for buffered multi-dimensional acquisition.
//!
//! This crate provides the vocabulary shared by the frame store, the event
//! channel and the consumer adapters: logical coordinates over the
//! channel/z/time/position/grid axes, frames and their sample types,
//! sequence descriptors, the `FrameReady`/`SequenceStarted` notifications,
//! the workspace error type, and configuration.
//!
//! ## Key Types
//!
//! - [`Coordinate`]: fully specified grid point; [`complete_coordinate`]
//!   fills axes the acquisition engine left out
//! - [`Frame`]: ephemeral image payload passed to `put` and returned by `get`
//! - [`AcquisitionEvent`]: what event channels deliver
//! - [`EdaError`]: error kinds for store, index and channel
//! - [`StreamConfig`]: layered Figment configuration

pub mod acquisition;
pub mod config;
pub mod coords;
pub mod data;
pub mod error;
pub mod events;
pub mod limits;
pub mod sequence;

pub use acquisition::{AcquisitionSink, FrameAccess, FrameSource};
pub use config::{DuplicatePolicy, ShutdownPolicy, StreamConfig};
pub use coords::{complete_coordinate, Axis, Coordinate};
pub use data::{Frame, FrameShape, PixelType};
pub use error::{EdaError, EdaResult};
pub use events::{AcquisitionEvent, FrameReady, SubscriptionHandle};
pub use sequence::{SequenceContext, SequenceDescriptor};
