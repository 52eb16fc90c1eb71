//! Assemble a finished acquisition for persistence.
//!
//! The saver reads the declared shape from the [`SequenceContext`] shared with
//! its frame source and remembers the buffer offset of the first frame after
//! each sequence start. Once the acquisition is done,
//! [`FrameSaver::assemble`] pulls every declared coordinate through
//! [`FrameAccess`] into one in-memory [`Hyperstack`], and
//! [`FrameSaver::save_raw`] writes that array plus a JSON sidecar. Encoding to
//! an image format is left to whatever consumes the array.

use crate::hyperstack::{Hyperstack, OverflowPolicy};
use mda_bus::Subscriber;
use mda_core::{
    Coordinate, EdaError, EdaResult, FrameAccess, FrameReady, FrameShape, PixelType,
    SequenceContext, SequenceDescriptor, SubscriptionHandle,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Raw pixel file name written by [`FrameSaver::save_raw`].
pub const RAW_FILE: &str = "frames.raw";
/// Sidecar file name written by [`FrameSaver::save_raw`].
pub const METADATA_FILE: &str = "metadata.json";

/// Sidecar describing the raw file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMetadata {
    /// Axis names, slowest first
    pub axis_order: Vec<String>,
    /// Extent per axis, matching `axis_order`
    pub shape: Vec<usize>,
    pub pixel_type: PixelType,
    pub byte_order: String,
    pub descriptor: SequenceDescriptor,
    /// Buffer offset of the first frame of the acquisition
    pub start_locator: Option<u64>,
    /// Declared coordinates with no frame (written as zeros)
    pub missing: Vec<Coordinate>,
}

#[derive(Debug, Default)]
struct SaverState {
    start_locator: Option<u64>,
    frame_shape: Option<FrameShape>,
    frames_seen: u64,
}

pub struct FrameSaver {
    source: Arc<dyn FrameAccess>,
    context: SequenceContext,
    state: Mutex<SaverState>,
}

impl std::fmt::Debug for FrameSaver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSaver")
            .field("sequence", &self.context.current())
            .field("state", &*self.state.lock())
            .finish()
    }
}

/// Result of [`FrameSaver::assemble`].
#[derive(Debug, Clone)]
pub struct AssembledStack {
    pub stack: Hyperstack,
    pub descriptor: SequenceDescriptor,
    pub start_locator: Option<u64>,
    pub missing: Vec<Coordinate>,
}

impl FrameSaver {
    /// Save frames from `source`. `context` must be the one the source
    /// records sequence starts in.
    pub fn new(source: Arc<dyn FrameAccess>, context: SequenceContext) -> Self {
        Self {
            source,
            context,
            state: Mutex::new(SaverState::default()),
        }
    }

    pub fn attach(self: &Arc<Self>, subscriber: &dyn Subscriber) -> [SubscriptionHandle; 2] {
        let saver = Arc::clone(self);
        let sequence = subscriber.subscribe_sequence_started(Arc::new(
            move |descriptor: &SequenceDescriptor| saver.on_sequence_started(descriptor),
        ));
        let saver = Arc::clone(self);
        let frame = subscriber
            .subscribe_frame_ready(Arc::new(move |event: &FrameReady| saver.on_frame_ready(event)));
        [sequence, frame]
    }

    pub fn on_sequence_started(&self, descriptor: &SequenceDescriptor) {
        *self.state.lock() = SaverState::default();
        tracing::debug!(?descriptor, "Saver reset");
    }

    pub fn on_frame_ready(&self, event: &FrameReady) {
        let mut state = self.state.lock();
        if state.start_locator.is_none() && self.context.current().is_some() {
            state.start_locator = Some(event.locator);
            tracing::debug!(locator = event.locator, "Saver caught first frame");
        }
        state.frame_shape.get_or_insert(event.shape);
        state.frames_seen += 1;
    }

    pub fn start_locator(&self) -> Option<u64> {
        self.state.lock().start_locator
    }

    pub fn frames_seen(&self) -> u64 {
        self.state.lock().frames_seen
    }

    /// Read every coordinate the sequence declared into one array.
    ///
    /// Coordinates without a frame are left zero and listed in `missing`.
    ///
    /// # Errors
    /// `Configuration` if no sequence has started or no frame arrived yet;
    /// any error other than `CoordinateNotFound` from the frame source.
    pub fn assemble(&self) -> EdaResult<AssembledStack> {
        let (descriptor, shape, start_locator) = {
            let state = self.state.lock();
            let descriptor = self
                .context
                .current()
                .ok_or_else(|| EdaError::Configuration("no sequence has started".into()))?;
            let shape = state
                .frame_shape
                .ok_or_else(|| EdaError::Configuration("no frames received".into()))?;
            (descriptor, shape, state.start_locator)
        };

        let (channels, depth, time) = descriptor.index_extents();
        let mut stack = Hyperstack::for_sequence(
            &descriptor,
            shape,
            self.source.pixel_type(),
            OverflowPolicy::Reject,
        )?;
        let mut missing = Vec::new();

        for c in 0..channels as u32 {
            for z in 0..depth as u32 {
                for t in 0..time as u32 {
                    let coordinate = Coordinate::new(c, z, t);
                    match self.source.get_frame(&coordinate) {
                        Ok(frame) => stack.insert(&coordinate, &frame)?,
                        Err(EdaError::CoordinateNotFound(_)) => missing.push(coordinate),
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        if !missing.is_empty() {
            tracing::warn!(missing = missing.len(), "Acquisition incomplete, gaps are zero-filled");
        }
        Ok(AssembledStack {
            stack,
            descriptor,
            start_locator,
            missing,
        })
    }

    /// Write the assembled array and sidecar into `dir` (created if needed).
    ///
    /// Returns the path of the raw file.
    pub fn save_raw(&self, dir: &Path) -> EdaResult<PathBuf> {
        let assembled = self.assemble()?;
        std::fs::create_dir_all(dir)?;

        let (c, z, t) = assembled.stack.dims();
        let shape = assembled.stack.shape();
        let metadata = RawMetadata {
            axis_order: ["c", "z", "t", "y", "x"].map(String::from).to_vec(),
            shape: vec![c, z, t, shape.height as usize, shape.width as usize],
            pixel_type: assembled.stack.pixel_type(),
            byte_order: "little".into(),
            descriptor: assembled.descriptor,
            start_locator: assembled.start_locator,
            missing: assembled.missing,
        };

        let raw_path = dir.join(RAW_FILE);
        std::fs::write(&raw_path, assembled.stack.as_bytes())?;
        let sidecar = serde_json::to_vec_pretty(&metadata)?;
        std::fs::write(dir.join(METADATA_FILE), sidecar)?;

        tracing::info!(
            path = %raw_path.display(),
            bytes = assembled.stack.as_bytes().len(),
            frames = assembled.stack.filled(),
            "Saved acquisition"
        );
        Ok(raw_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mda_core::Frame;
    use mda_storage::{FrameStore, IndexTable, RingBuffer};
    use tracing_test::traced_test;

    fn acquire(frames: &[(u32, u32)]) -> (Arc<FrameStore>, Arc<FrameSaver>) {
        let store = Arc::new(FrameStore::new(
            RingBuffer::anonymous(1 << 20, PixelType::U16).unwrap(),
            IndexTable::new((3, 1, 10), 1 << 20).unwrap(),
        ));
        let saver = Arc::new(FrameSaver::new(store.clone(), store.context().clone()));
        saver.attach(store.as_ref());

        store.begin_sequence(&SequenceDescriptor::new(2, 1, 2)).unwrap();
        for &(c, t) in frames {
            let value = (c * 100 + t) as u16;
            store
                .put(&Frame::from_u16(3, 2, &[value; 6]), Coordinate::new(c, 0, t))
                .unwrap();
        }
        (store, saver)
    }

    #[test]
    fn test_assemble_full_sequence() {
        let (_store, saver) = acquire(&[(0, 0), (1, 0), (0, 1), (1, 1)]);
        assert_eq!(saver.start_locator(), Some(0));
        assert_eq!(saver.frames_seen(), 4);

        let assembled = saver.assemble().unwrap();
        assert!(assembled.missing.is_empty());
        assert_eq!(assembled.stack.dims(), (2, 1, 2));
        assert_eq!(
            assembled.stack.get(&Coordinate::new(1, 0, 1)).unwrap().get(2, 1),
            Some(101)
        );
    }

    #[test]
    fn test_save_raw_writes_array_and_sidecar() {
        let (_store, saver) = acquire(&[(0, 0), (1, 0), (0, 1)]);
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("run1");

        let raw = saver.save_raw(&out).unwrap();
        let bytes = std::fs::read(&raw).unwrap();
        assert_eq!(bytes.len(), 2 * 2 * 3 * 2 * 2);

        let metadata: RawMetadata =
            serde_json::from_slice(&std::fs::read(out.join(METADATA_FILE)).unwrap()).unwrap();
        assert_eq!(metadata.shape, vec![2, 1, 2, 2, 3]);
        assert_eq!(metadata.pixel_type, PixelType::U16);
        assert_eq!(metadata.missing, vec![Coordinate::new(1, 0, 1)]);

        // (c=1, t=0) is the third cell
        let cell = 6 * 2;
        assert_eq!(u16::from_le_bytes([bytes[2 * cell], bytes[2 * cell + 1]]), 100);
    }

    #[traced_test]
    #[test]
    fn test_gaps_are_reported() {
        let (_store, saver) = acquire(&[(0, 0)]);
        let assembled = saver.assemble().unwrap();
        assert_eq!(assembled.missing.len(), 3);
        assert_eq!(assembled.stack.filled(), 1);
        assert!(logs_contain("Acquisition incomplete"));
    }

    #[test]
    fn test_assemble_before_sequence_fails() {
        let store = Arc::new(FrameStore::new(
            RingBuffer::anonymous(1024, PixelType::U8).unwrap(),
            IndexTable::new((1, 1, 1), 16).unwrap(),
        ));
        let saver = FrameSaver::new(store.clone(), store.context().clone());
        assert!(matches!(saver.assemble(), Err(EdaError::Configuration(_))));
    }

    #[test]
    fn test_assemble_uses_descriptor_from_context() {
        let (store, saver) = acquire(&[(0, 0), (1, 0)]);
        // the saver follows the shared context, not a copy taken at start
        store.context().begin(SequenceDescriptor::new(2, 1, 1));
        let assembled = saver.assemble().unwrap();
        assert_eq!(assembled.descriptor, SequenceDescriptor::new(2, 1, 1));
        assert_eq!(assembled.stack.dims(), (2, 1, 1));
        assert!(assembled.missing.is_empty());

        store.close();
        assert!(matches!(saver.assemble(), Err(EdaError::Configuration(_))));
    }
}
