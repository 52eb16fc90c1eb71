//! Seams between the acquisition engine, the store, and frame consumers.
//!
//! The engine is an upstream event source: it calls [`AcquisitionSink`] once
//! per sequence start and once per captured frame. Consumers read frames back
//! through [`FrameAccess`], which both the producer's store and a remote
//! mirror implement, so consumer code does not care which side it runs on.

use crate::coords::{complete_coordinate, Coordinate};
use crate::data::{Frame, PixelType};
use crate::error::EdaResult;
use crate::sequence::SequenceDescriptor;

/// Receiver of upstream acquisition callbacks.
///
/// Called on the acquisition thread, never concurrently with itself.
pub trait AcquisitionSink: Send + Sync {
    /// A new acquisition is starting with the given declared shape.
    fn on_sequence_start(&self, descriptor: &SequenceDescriptor) -> EdaResult<()>;

    /// A frame was captured at a fully specified coordinate.
    fn on_frame(&self, frame: &Frame, coordinate: Coordinate) -> EdaResult<()>;

    /// A frame was captured at a partial `{axis: index}` coordinate, as the
    /// engine reports it. Missing axes are completed with zero.
    fn on_frame_indexed(&self, frame: &Frame, index: &[(&str, i64)]) -> EdaResult<()> {
        let coordinate = complete_coordinate(index.iter().copied())?;
        self.on_frame(frame, coordinate)
    }
}

/// Something that drives an acquisition into a sink (a camera, a simulator).
pub trait FrameSource {
    /// Run one acquisition to completion, reporting into `sink`.
    fn run(&mut self, sink: &dyn AcquisitionSink) -> EdaResult<()>;
}

/// Read access to frames by coordinate.
pub trait FrameAccess: Send + Sync {
    fn get_frame(&self, coordinate: &Coordinate) -> EdaResult<Frame>;

    fn pixel_type(&self) -> PixelType;
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Coordinate>>,
    }

    impl AcquisitionSink for Recorder {
        fn on_sequence_start(&self, _descriptor: &SequenceDescriptor) -> EdaResult<()> {
            Ok(())
        }

        fn on_frame(&self, _frame: &Frame, coordinate: Coordinate) -> EdaResult<()> {
            self.seen.lock().push(coordinate);
            Ok(())
        }
    }

    #[test]
    fn test_indexed_frames_are_completed() {
        let sink = Recorder::default();
        let frame = Frame::from_u8(1, 1, vec![1]);
        sink.on_frame_indexed(&frame, &[("t", 2)]).unwrap();
        sink.on_frame_indexed(&frame, &[("c", 1), ("t", 3)]).unwrap();
        assert!(sink.on_frame_indexed(&frame, &[("x", 0)]).is_err());

        let seen = sink.seen.lock();
        assert_eq!(*seen, vec![Coordinate::new(0, 0, 2), Coordinate::new(1, 0, 3)]);
    }
}
