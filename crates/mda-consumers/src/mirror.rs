//! Frame access from another process.
//!
//! A [`RemoteMirror`] sits behind a [`mda_bus::RemoteReceiver`]. It maps the
//! producer's backing file read-only, rebuilds the coordinate index from the
//! `FrameReady` locators it is told about, and re-publishes every
//! notification on its own bus once the index is updated. Consumers in the
//! receiving process attach to the mirror exactly as they would to a local
//! store, so a handler that calls [`FrameAccess::get_frame`] always finds the
//! coordinate it was notified about.

use mda_bus::{EventBus, Handler, Publisher, Subscriber};
use mda_core::config::IndexConfig;
use mda_core::limits::validate_frame_size;
use mda_core::{
    AcquisitionEvent, Coordinate, EdaError, EdaResult, Frame, FrameAccess, FrameReady, PixelType,
    SequenceContext, SequenceDescriptor, SubscriptionHandle,
};
use mda_storage::{IndexEntry, IndexTable, RingBufferReader};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct RemoteMirror {
    path: PathBuf,
    pixel_type: PixelType,
    reader: RwLock<Option<Arc<RingBufferReader>>>,
    index: IndexTable,
    bus: Arc<EventBus>,
    context: SequenceContext,
    failures: AtomicU64,
}

impl std::fmt::Debug for RemoteMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteMirror")
            .field("path", &self.path)
            .field("pixel_type", &self.pixel_type)
            .field("index", &self.index)
            .field("failures", &self.failures())
            .finish()
    }
}

impl RemoteMirror {
    /// Mirror the store whose ring buffer is backed by `path`.
    ///
    /// The file is opened on first access so the mirror can be built before
    /// the producer has created it.
    pub fn new(path: impl Into<PathBuf>, pixel_type: PixelType, index: &IndexConfig) -> EdaResult<Self> {
        Ok(Self {
            path: path.into(),
            pixel_type,
            reader: RwLock::new(None),
            index: IndexTable::from_config(index)?,
            bus: Arc::new(EventBus::new()),
            context: SequenceContext::new(),
            failures: AtomicU64::new(0),
        })
    }

    /// Forward `upstream`'s notifications through this mirror.
    pub fn attach(self: &Arc<Self>, upstream: &dyn Subscriber) -> [SubscriptionHandle; 2] {
        let mirror = Arc::clone(self);
        let sequence = upstream.subscribe_sequence_started(Arc::new(
            move |descriptor: &SequenceDescriptor| mirror.on_sequence_started(descriptor),
        ));
        let mirror = Arc::clone(self);
        let frame = upstream
            .subscribe_frame_ready(Arc::new(move |event: &FrameReady| mirror.on_frame_ready(event)));
        [sequence, frame]
    }

    pub fn on_sequence_started(&self, descriptor: &SequenceDescriptor) {
        self.context.begin(*descriptor);
        self.index.clear();
        if let Err(e) = self.index.ensure_capacity(descriptor.index_extents()) {
            self.failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!(?descriptor, error = %e, "Mirror could not size index");
        }
        // the producer may have recreated its backing file
        *self.reader.write() = None;
        self.republish(&AcquisitionEvent::SequenceStarted(*descriptor));
    }

    pub fn on_frame_ready(&self, event: &FrameReady) {
        let entry = IndexEntry {
            width: event.shape.width,
            height: event.shape.height,
            offset: event.locator,
        };
        match self.index.record(&event.coordinate, entry) {
            Ok(_) => self.republish(&AcquisitionEvent::FrameReady(*event)),
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(coordinate = %event.coordinate, error = %e, "Mirror could not index frame");
            }
        }
    }

    fn republish(&self, event: &AcquisitionEvent) {
        if let Err(e) = self.bus.publish(event) {
            tracing::warn!(kind = event.kind(), error = %e, "Mirror republish failed");
        }
    }

    fn reader(&self) -> EdaResult<Arc<RingBufferReader>> {
        if let Some(reader) = self.reader.read().as_ref() {
            return Ok(Arc::clone(reader));
        }
        let mut slot = self.reader.write();
        if let Some(reader) = slot.as_ref() {
            return Ok(Arc::clone(reader));
        }
        let reader = RingBufferReader::open(&self.path)?;
        if reader.pixel_type() != self.pixel_type {
            return Err(EdaError::PixelTypeMismatch {
                expected: self.pixel_type,
                actual: reader.pixel_type(),
            });
        }
        tracing::debug!(path = %self.path.display(), capacity = reader.capacity(), "Mirror mapped producer buffer");
        let reader = Arc::new(reader);
        *slot = Some(Arc::clone(&reader));
        Ok(reader)
    }

    pub fn locate(&self, coordinate: &Coordinate) -> EdaResult<IndexEntry> {
        self.index.lookup(coordinate)
    }

    pub fn index(&self) -> &IndexTable {
        &self.index
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Descriptor of the producer's acquisition in progress.
    pub fn context(&self) -> &SequenceContext {
        &self.context
    }

    pub fn backing_path(&self) -> &Path {
        &self.path
    }

    /// Notifications that could not be applied.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl FrameAccess for RemoteMirror {
    fn get_frame(&self, coordinate: &Coordinate) -> EdaResult<Frame> {
        let entry = self.index.lookup(coordinate)?;
        let size = validate_frame_size(
            entry.width,
            entry.height,
            self.pixel_type.bytes_per_sample(),
        )?;
        let data = self.reader()?.read(entry.offset, size.bytes as u64)?;
        Frame::from_bytes(entry.width, entry.height, self.pixel_type, data)
    }

    fn pixel_type(&self) -> PixelType {
        self.pixel_type
    }
}

impl Subscriber for RemoteMirror {
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

#[cfg(test)]
mod tests {
    use super::*;
    use mda_core::FrameShape;
    use mda_storage::RingBuffer;

    fn ready(c: u32, t: u32, locator: u64) -> FrameReady {
        FrameReady {
            coordinate: Coordinate::new(c, 0, t),
            shape: FrameShape::new(4, 2),
            locator,
        }
    }

    #[test]
    fn test_reads_frames_through_producer_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ring.buf");
        let ring = RingBuffer::create(&path, 4096, PixelType::U8).unwrap();
        let first = ring.put(&[7; 8]).unwrap();
        let second = ring.put(&[9; 8]).unwrap();

        let mirror = RemoteMirror::new(&path, PixelType::U8, &IndexConfig::default()).unwrap();
        mirror.on_sequence_started(&SequenceDescriptor::new(2, 1, 1));
        mirror.on_frame_ready(&ready(0, 0, first));
        mirror.on_frame_ready(&ready(1, 0, second));

        assert_eq!(mirror.get_frame(&Coordinate::new(0, 0, 0)).unwrap().data, vec![7; 8]);
        assert_eq!(mirror.get_frame(&Coordinate::new(1, 0, 0)).unwrap().data, vec![9; 8]);
        assert!(matches!(
            mirror.get_frame(&Coordinate::new(0, 0, 1)),
            Err(EdaError::CoordinateNotFound(_))
        ));
    }

    #[test]
    fn test_republishes_after_indexing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ring.buf");
        let ring = RingBuffer::create(&path, 4096, PixelType::U8).unwrap();
        let offset = ring.put(&[3; 8]).unwrap();

        let mirror = Arc::new(RemoteMirror::new(&path, PixelType::U8, &IndexConfig::default()).unwrap());
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let (m, s) = (Arc::clone(&mirror), Arc::clone(&seen));
        mirror.events().on_frame_ready(move |event| {
            // handlers observe the index already updated
            s.lock().push(m.get_frame(&event.coordinate).ok().map(|f| f.data));
        });

        mirror.on_frame_ready(&ready(0, 0, offset));
        assert_eq!(*seen.lock(), vec![Some(vec![3; 8])]);
    }

    #[test]
    fn test_sequence_start_clears_index() {
        let mirror =
            RemoteMirror::new("/nonexistent/ring.buf", PixelType::U8, &IndexConfig::default())
                .unwrap();
        mirror.on_frame_ready(&ready(0, 0, 0));
        assert!(mirror.index().contains(&Coordinate::new(0, 0, 0)));
        mirror.on_sequence_started(&SequenceDescriptor::new(1, 1, 4));
        assert!(mirror.index().is_empty());
        assert_eq!(
            mirror.context().current(),
            Some(SequenceDescriptor::new(1, 1, 4))
        );
    }

    #[test]
    fn test_missing_backing_file_is_reported_on_read() {
        let mirror =
            RemoteMirror::new("/nonexistent/ring.buf", PixelType::U8, &IndexConfig::default())
                .unwrap();
        mirror.on_frame_ready(&ready(0, 0, 0));
        assert!(matches!(
            mirror.get_frame(&Coordinate::new(0, 0, 0)),
            Err(EdaError::Io(_))
        ));
    }

    #[test]
    fn test_pixel_type_disagreement() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ring.buf");
        let _ring = RingBuffer::create(&path, 4096, PixelType::U16).unwrap();

        let mirror = RemoteMirror::new(&path, PixelType::U8, &IndexConfig::default()).unwrap();
        mirror.on_frame_ready(&ready(0, 0, 0));
        assert!(matches!(
            mirror.get_frame(&Coordinate::new(0, 0, 0)),
            Err(EdaError::PixelTypeMismatch { .. })
        ));
    }
}
