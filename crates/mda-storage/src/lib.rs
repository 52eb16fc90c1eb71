//! `mda-storage`
//!
//! Buffered storage for multi-dimensional acquisitions.
//!
//! - [`RingBuffer`]: fixed-capacity memory-mapped byte region; frames are
//!   appended whole and the cursor wraps to 0 when one does not fit.
//! - [`RingBufferReader`]: read-only view of a file-backed ring buffer from
//!   another process.
//! - [`IndexTable`]: channel x z x time grid mapping coordinates to buffer
//!   locations, grown on demand.
//! - [`FrameStore`]: composes the two and publishes `FrameReady` after every
//!   `put`.

pub mod frame_store;
pub mod index_table;
pub mod ring_buffer;
pub mod ring_buffer_reader;

pub use frame_store::{FrameStore, StoreStats};
pub use index_table::{grown_dims, IndexDims, IndexEntry, IndexTable};
pub use ring_buffer::RingBuffer;
pub use ring_buffer_reader::RingBufferReader;
