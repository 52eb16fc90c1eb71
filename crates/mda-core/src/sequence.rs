//! Sequence descriptors and the shared "current sequence" handle.

use crate::coords::Axis;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Declared shape of an acquisition, one count per axis.
///
/// Arrives once per acquisition start. It seeds expected axis extents but is
/// advisory: frames outside the declared shape are still accepted. A count of
/// zero means the sequence does not iterate that axis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceDescriptor {
    pub c: u32,
    pub z: u32,
    pub t: u32,
    pub p: u32,
    pub g: u32,
}

impl SequenceDescriptor {
    pub fn new(c: u32, z: u32, t: u32) -> Self {
        Self {
            c,
            z,
            t,
            ..Default::default()
        }
    }

    pub fn count(&self, axis: Axis) -> u32 {
        match axis {
            Axis::Channel => self.c,
            Axis::Z => self.z,
            Axis::Time => self.t,
            Axis::Position => self.p,
            Axis::Grid => self.g,
        }
    }

    /// Number of slots to reserve along an axis (an un-iterated axis still
    /// holds one slot).
    pub fn extent(&self, axis: Axis) -> usize {
        self.count(axis).max(1) as usize
    }

    /// Expected (channel, z, time) extents.
    pub fn index_extents(&self) -> (usize, usize, usize) {
        (
            self.extent(Axis::Channel),
            self.extent(Axis::Z),
            self.extent(Axis::Time),
        )
    }

    /// Total frames the sequence declares.
    pub fn frame_count(&self) -> usize {
        Axis::ALL.into_iter().map(|axis| self.extent(axis)).product()
    }
}

/// Shared handle to the descriptor of the acquisition in progress.
///
/// Passed explicitly to the store and to consumers instead of being looked
/// up from a global acquisition object.
#[derive(Debug, Clone, Default)]
pub struct SequenceContext {
    current: Arc<RwLock<Option<SequenceDescriptor>>>,
}

impl SequenceContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, descriptor: SequenceDescriptor) {
        *self.current.write() = Some(descriptor);
    }

    pub fn current(&self) -> Option<SequenceDescriptor> {
        *self.current.read()
    }

    pub fn clear(&self) {
        *self.current.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extents_treat_zero_as_one() {
        let desc = SequenceDescriptor::new(2, 0, 5);
        assert_eq!(desc.index_extents(), (2, 1, 5));
        assert_eq!(desc.frame_count(), 10);
    }

    #[test]
    fn test_descriptor_json_is_flat_map() {
        let desc: SequenceDescriptor = serde_json::from_str(r#"{"c":2,"z":1,"t":5}"#).unwrap();
        assert_eq!(desc, SequenceDescriptor::new(2, 1, 5));
    }

    #[test]
    fn test_context_is_shared_between_clones() {
        let ctx = SequenceContext::new();
        let other = ctx.clone();
        assert!(other.current().is_none());
        ctx.begin(SequenceDescriptor::new(1, 1, 3));
        assert_eq!(other.current(), Some(SequenceDescriptor::new(1, 1, 3)));
        other.clear();
        assert!(ctx.current().is_none());
    }
}
