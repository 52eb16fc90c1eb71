//! `mda-consumers`
//!
//! Consumers of a running acquisition. Each one subscribes to a
//! [`mda_bus::Subscriber`] (the local store or a remote mirror) and reads
//! frames back through [`mda_core::FrameAccess`], so the same consumer works
//! in the producing process and in a separate viewer process.
//!
//! - [`DisplayCache`]: in-memory hyperstack for live viewing
//! - [`FrameSaver`]: assembles the finished acquisition and writes it out
//! - [`RemoteMirror`]: index plus read-only mapping of another process's
//!   ring buffer

pub mod display_cache;
pub mod hyperstack;
pub mod mirror;
pub mod saver;

pub use display_cache::DisplayCache;
pub use hyperstack::{Hyperstack, OverflowPolicy};
pub use mirror::RemoteMirror;
pub use saver::{AssembledStack, FrameSaver, RawMetadata};
