//! Notifications published by the frame store.

use crate::coords::Coordinate;
use crate::data::FrameShape;
use crate::sequence::SequenceDescriptor;
use serde::{Deserialize, Serialize};

/// A frame has been written and indexed; `get(coordinate)` is now safe.
///
/// `locator` is the byte offset of the frame in the ring buffer's data
/// region. Remote readers use it to read straight from a mapped copy of the
/// buffer without consulting the producer's index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameReady {
    pub coordinate: Coordinate,
    pub shape: FrameShape,
    pub locator: u64,
}

/// Everything an event channel delivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionEvent {
    SequenceStarted(SequenceDescriptor),
    FrameReady(FrameReady),
}

impl AcquisitionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AcquisitionEvent::SequenceStarted(_) => "sequence_started",
            AcquisitionEvent::FrameReady(_) => "frame_ready",
        }
    }
}

impl From<FrameReady> for AcquisitionEvent {
    fn from(event: FrameReady) -> Self {
        AcquisitionEvent::FrameReady(event)
    }
}

impl From<SequenceDescriptor> for AcquisitionEvent {
    fn from(descriptor: SequenceDescriptor) -> Self {
        AcquisitionEvent::SequenceStarted(descriptor)
    }
}

/// Opaque handle returned by every subscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(pub u64);

impl SubscriptionHandle {
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.0
    }
}
