//! Logical frame coordinates.
//!
//! An acquisition visits points of a five-axis grid: channel (`c`), z-slice
//! (`z`), time point (`t`), stage position (`p`) and grid tile (`g`). The
//! acquisition engine reports only the axes a sequence actually iterates, so
//! every consumer first completes the partial map with zeros via
//! [`complete_coordinate`].

use crate::error::{EdaError, EdaResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The acquisition axes in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Axis {
    #[serde(rename = "c")]
    Channel,
    #[serde(rename = "z")]
    Z,
    #[serde(rename = "t")]
    Time,
    #[serde(rename = "p")]
    Position,
    #[serde(rename = "g")]
    Grid,
}

impl Axis {
    pub const ALL: [Axis; 5] = [
        Axis::Channel,
        Axis::Z,
        Axis::Time,
        Axis::Position,
        Axis::Grid,
    ];

    /// Short key used in coordinate maps and on the wire.
    pub fn key(self) -> &'static str {
        match self {
            Axis::Channel => "c",
            Axis::Z => "z",
            Axis::Time => "t",
            Axis::Position => "p",
            Axis::Grid => "g",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Axis::ALL.into_iter().find(|axis| axis.key() == key)
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// A fully specified point in the acquisition grid.
///
/// Serializes as a flat `{"c": .., "z": .., "t": .., "p": .., "g": ..}` map;
/// missing axes deserialize as zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Coordinate {
    pub c: u32,
    pub z: u32,
    pub t: u32,
    pub p: u32,
    pub g: u32,
}

impl Coordinate {
    /// Coordinate at position 0, grid tile 0.
    pub fn new(c: u32, z: u32, t: u32) -> Self {
        Self {
            c,
            z,
            t,
            ..Default::default()
        }
    }

    pub fn get(&self, axis: Axis) -> u32 {
        match axis {
            Axis::Channel => self.c,
            Axis::Z => self.z,
            Axis::Time => self.t,
            Axis::Position => self.p,
            Axis::Grid => self.g,
        }
    }

    pub fn set(&mut self, axis: Axis, value: u32) {
        match axis {
            Axis::Channel => self.c = value,
            Axis::Z => self.z = value,
            Axis::Time => self.t = value,
            Axis::Position => self.p = value,
            Axis::Grid => self.g = value,
        }
    }

    /// The (channel, z, time) triple the index is keyed on.
    pub fn index_key(&self) -> (usize, usize, usize) {
        (self.c as usize, self.z as usize, self.t as usize)
    }

    pub fn to_map(&self) -> BTreeMap<String, u32> {
        Axis::ALL
            .into_iter()
            .map(|axis| (axis.key().to_string(), self.get(axis)))
            .collect()
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(c={} z={} t={} p={} g={})",
            self.c, self.z, self.t, self.p, self.g
        )
    }
}

/// Fill missing axes of a partial `{axis: index}` map with zero.
///
/// Unknown axis names and negative indices are rejected with
/// [`EdaError::InvalidCoordinate`].
pub fn complete_coordinate<'a, I>(partial: I) -> EdaResult<Coordinate>
where
    I: IntoIterator<Item = (&'a str, i64)>,
{
    let mut coord = Coordinate::default();
    for (key, value) in partial {
        let axis = Axis::from_key(key)
            .ok_or_else(|| EdaError::InvalidCoordinate(format!("unknown axis '{key}'")))?;
        let value = u32::try_from(value).map_err(|_| {
            EdaError::InvalidCoordinate(format!("axis '{key}' has out-of-range index {value}"))
        })?;
        coord.set(axis, value);
    }
    Ok(coord)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_fills_missing_axes() {
        let coord = complete_coordinate([("t", 4), ("c", 1)]).unwrap();
        assert_eq!(coord, Coordinate::new(1, 0, 4));
        assert_eq!(coord.p, 0);
        assert_eq!(coord.g, 0);
    }

    #[test]
    fn test_complete_rejects_unknown_axis() {
        let err = complete_coordinate([("q", 1)]).unwrap_err();
        assert!(matches!(err, EdaError::InvalidCoordinate(_)));
    }

    #[test]
    fn test_complete_rejects_negative_index() {
        let err = complete_coordinate([("z", -1)]).unwrap_err();
        assert!(matches!(err, EdaError::InvalidCoordinate(_)));
    }

    #[test]
    fn test_partial_json_deserializes_with_zeros() {
        let coord: Coordinate = serde_json::from_str(r#"{"t": 3}"#).unwrap();
        assert_eq!(coord, Coordinate::new(0, 0, 3));
    }

    #[test]
    fn test_to_map_lists_every_axis() {
        let map = Coordinate::new(2, 1, 9).to_map();
        assert_eq!(map.len(), 5);
        assert_eq!(map["c"], 2);
        assert_eq!(map["t"], 9);
    }
}
