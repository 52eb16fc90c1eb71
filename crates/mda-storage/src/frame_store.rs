//! The frame store: ring buffer plus coordinate index plus notifications.
//!
//! `put` writes a frame's bytes into the [`RingBuffer`], records where they
//! landed in the [`IndexTable`], then publishes `FrameReady` to every current
//! subscriber, synchronously on the calling (acquisition) thread. Receiving
//! `FrameReady` is the only signal a consumer needs before calling `get` for
//! that coordinate from its own thread.
//!
//! The store is single-producer: `put` is never called concurrently with
//! itself. `get` may run on any thread at any time.

use crate::index_table::{IndexEntry, IndexTable};
use crate::ring_buffer::RingBuffer;
use mda_bus::{EventBus, Handler, Publisher, Subscriber};
use mda_core::limits::validate_frame_size;
use mda_core::{
    AcquisitionEvent, AcquisitionSink, Coordinate, DuplicatePolicy, EdaError, EdaResult, Frame,
    FrameAccess, FrameReady, PixelType, SequenceContext, SequenceDescriptor, StreamConfig,
    SubscriptionHandle,
};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Counters describing what the store has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub frames_written: u64,
    pub bytes_written: u64,
    pub duplicates: u64,
    pub index_growths: u64,
    pub wraps: u64,
}

pub struct FrameStore {
    /// None once closed
    ring: RwLock<Option<RingBuffer>>,
    index: IndexTable,
    bus: Arc<EventBus>,
    context: SequenceContext,
    pixel_type: PixelType,
    capacity: u64,
    backing_path: Option<PathBuf>,
    duplicate_policy: DuplicatePolicy,
    closed: AtomicBool,
    frames_written: AtomicU64,
    bytes_written: AtomicU64,
    duplicates: AtomicU64,
}

impl std::fmt::Debug for FrameStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameStore")
            .field("pixel_type", &self.pixel_type)
            .field("capacity", &self.capacity)
            .field("backing_path", &self.backing_path)
            .field("closed", &self.is_closed())
            .field("index", &self.index)
            .finish()
    }
}

impl FrameStore {
    /// Compose a store from its parts, with a private bus and context.
    pub fn new(ring: RingBuffer, index: IndexTable) -> Self {
        Self {
            pixel_type: ring.pixel_type(),
            capacity: ring.capacity(),
            backing_path: ring.path().map(|p| p.to_path_buf()),
            ring: RwLock::new(Some(ring)),
            index,
            bus: Arc::new(EventBus::new()),
            context: SequenceContext::new(),
            duplicate_policy: DuplicatePolicy::default(),
            closed: AtomicBool::new(false),
            frames_written: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
        }
    }

    /// Publish through `bus` instead of a private one.
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = bus;
        self
    }

    /// Share the "current sequence" handle with other components.
    pub fn with_context(mut self, context: SequenceContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_duplicate_policy(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicate_policy = policy;
        self
    }

    /// Build a store from the `[store]` and `[index]` sections.
    ///
    /// With `backing_path` set the ring buffer lives in that file and other
    /// processes can attach to it; otherwise it is anonymous memory.
    pub fn from_config(config: &StreamConfig) -> EdaResult<Self> {
        let store = &config.store;
        let ring = match &store.backing_path {
            Some(path) => RingBuffer::create(path, store.capacity_bytes, store.pixel_type)?,
            None => RingBuffer::anonymous(store.capacity_bytes, store.pixel_type)?,
        };
        let index = IndexTable::from_config(&config.index)?;
        Ok(Self::new(ring, index).with_duplicate_policy(store.duplicate_policy))
    }

    fn ensure_open(&self) -> EdaResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EdaError::StoreClosed);
        }
        Ok(())
    }

    /// Start of an acquisition.
    ///
    /// Records the descriptor in the shared context, reserves index space for
    /// the declared shape, and publishes `SequenceStarted`. If frames from a
    /// previous acquisition are indexed, the index is cleared and the ring
    /// buffer rewound so the store is reused.
    pub fn begin_sequence(&self, descriptor: &SequenceDescriptor) -> EdaResult<()> {
        self.ensure_open()?;

        if !self.index.is_empty() {
            tracing::info!(previous = self.index.len(), "Reusing store for new acquisition");
            self.index.clear();
            if let Some(ring) = self.ring.read().as_ref() {
                ring.reset();
            }
        }

        self.context.begin(*descriptor);
        if let Err(e) = self.index.ensure_capacity(descriptor.index_extents()) {
            // the descriptor is advisory, frames still grow the index on demand
            tracing::warn!(error = %e, ?descriptor, "Could not pre-size index");
        }

        tracing::info!(
            c = descriptor.c,
            z = descriptor.z,
            t = descriptor.t,
            p = descriptor.p,
            g = descriptor.g,
            "Sequence started"
        );
        self.bus
            .publish(&AcquisitionEvent::SequenceStarted(*descriptor))
    }

    /// Store `frame` at `coordinate` and notify subscribers.
    ///
    /// Returns the ring buffer offset the frame was written at.
    ///
    /// # Errors
    /// - `StoreClosed` after [`close`](Self::close)
    /// - `PixelTypeMismatch` / `FrameSizeMismatch` for a frame that does not
    ///   match the store or its own shape
    /// - `DuplicateCoordinate` under [`DuplicatePolicy::Reject`]
    /// - `OutOfRange` for a frame larger than the buffer
    /// - `GrowthFailure` if the index cannot grow; the store is closed
    pub fn put(&self, frame: &Frame, coordinate: Coordinate) -> EdaResult<u64> {
        self.ensure_open()?;

        if frame.pixel_type != self.pixel_type {
            return Err(EdaError::PixelTypeMismatch {
                expected: self.pixel_type,
                actual: frame.pixel_type,
            });
        }
        frame.validate()?;

        if self.duplicate_policy == DuplicatePolicy::Reject && self.index.contains(&coordinate) {
            return Err(EdaError::DuplicateCoordinate(coordinate));
        }

        let offset = {
            let ring = self.ring.read();
            let ring = ring.as_ref().ok_or(EdaError::StoreClosed)?;
            ring.put(&frame.data)?
        };

        let entry = IndexEntry {
            width: frame.width,
            height: frame.height,
            offset,
        };
        let previous = match self.index.record(&coordinate, entry) {
            Ok(previous) => previous,
            Err(e) => {
                tracing::error!(%coordinate, error = %e, "Index growth failed, closing store");
                self.close();
                return Err(e);
            }
        };
        if let Some(previous) = previous {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                %coordinate,
                old_offset = previous.offset,
                new_offset = offset,
                "Coordinate written twice, index now points at the newer frame"
            );
        }

        self.frames_written.fetch_add(1, Ordering::Relaxed);
        self.bytes_written
            .fetch_add(frame.data.len() as u64, Ordering::Relaxed);
        tracing::debug!(%coordinate, offset, bytes = frame.data.len(), "Frame stored");

        self.bus.publish(&AcquisitionEvent::FrameReady(FrameReady {
            coordinate,
            shape: frame.shape(),
            locator: offset,
        }))?;
        Ok(offset)
    }

    /// Copy the frame recorded at `coordinate` out of the ring buffer.
    ///
    /// # Errors
    /// `CoordinateNotFound` if nothing was put there, `OutOfRange` if the
    /// recorded location does not fit the buffer, `StoreClosed` after close.
    pub fn get(&self, coordinate: &Coordinate) -> EdaResult<Frame> {
        self.ensure_open()?;
        let entry = self.index.lookup(coordinate)?;
        let size = validate_frame_size(
            entry.width,
            entry.height,
            self.pixel_type.bytes_per_sample(),
        )?;

        let data = {
            let ring = self.ring.read();
            let ring = ring.as_ref().ok_or(EdaError::StoreClosed)?;
            ring.read(entry.offset, size.bytes as u64)?
        };
        Frame::from_bytes(entry.width, entry.height, self.pixel_type, data)
    }

    /// Where `coordinate` lives in the buffer, without copying the frame.
    pub fn locate(&self, coordinate: &Coordinate) -> EdaResult<IndexEntry> {
        self.ensure_open()?;
        self.index.lookup(coordinate)
    }

    /// Release the ring buffer. Later `get`/`put` calls fail with
    /// `StoreClosed`. Idempotent.
    ///
    /// A file-backed buffer's file is left in place for readers that still
    /// map it.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let ring = self.ring.write().take();
        self.context.clear();
        tracing::info!(
            frames = self.frames_written.load(Ordering::Relaxed),
            bytes = self.bytes_written.load(Ordering::Relaxed),
            released = ring.is_some(),
            "Frame store closed"
        );
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> StoreStats {
        let wraps = self
            .ring
            .read()
            .as_ref()
            .map(|ring| ring.wraps())
            .unwrap_or_default();
        StoreStats {
            frames_written: self.frames_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            index_growths: self.index.growths(),
            wraps,
        }
    }

    pub fn pixel_type(&self) -> PixelType {
        self.pixel_type
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Backing file for other processes to attach to, if file-backed.
    pub fn backing_path(&self) -> Option<&std::path::Path> {
        self.backing_path.as_deref()
    }

    /// Bus the store publishes on.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn context(&self) -> &SequenceContext {
        &self.context
    }

    pub fn index(&self) -> &IndexTable {
        &self.index
    }
}

impl AcquisitionSink for FrameStore {
    fn on_sequence_start(&self, descriptor: &SequenceDescriptor) -> EdaResult<()> {
        self.begin_sequence(descriptor)
    }

    fn on_frame(&self, frame: &Frame, coordinate: Coordinate) -> EdaResult<()> {
        self.put(frame, coordinate).map(|_| ())
    }
}

impl FrameAccess for FrameStore {
    fn get_frame(&self, coordinate: &Coordinate) -> EdaResult<Frame> {
        self.get(coordinate)
    }

    fn pixel_type(&self) -> PixelType {
        self.pixel_type
    }
}

impl Subscriber for FrameStore {
    fn subscribe_frame_ready(&self, handler: Handler<FrameReady>) -> SubscriptionHandle {
        self.bus.subscribe_frame_ready(handler)
    }

    fn subscribe_sequence_started(
        &self,
        handler: Handler<SequenceDescriptor>,
    ) -> SubscriptionHandle {
        self.bus.subscribe_sequence_started(handler)
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.bus.unsubscribe(handle)
    }
}
