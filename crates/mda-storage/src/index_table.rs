//! Coordinate to ring-buffer-location index.
//!
//! A dense channel x z x time grid of optional entries. Position and grid
//! axes are not part of the key, so acquisitions over several positions
//! must keep them apart upstream.
//!
//! The grid grows on demand when a coordinate lands outside it: channel and
//! z are extended to exactly fit, time at least doubles. Existing entries are
//! preserved. Growth is bounded by `max_entries` and every allocation is
//! fallible, so a runaway acquisition yields `GrowthFailure` instead of an
//! abort.

use mda_core::config::IndexConfig;
use mda_core::{Coordinate, EdaError, EdaResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Where one frame lives in the ring buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub width: u32,
    pub height: u32,
    pub offset: u64,
}

/// Extents of the grid along (channel, z, time).
pub type IndexDims = (usize, usize, usize);

/// Smallest grid covering `key` that follows the growth rule: channel and z
/// grow to exactly `key + 1`, time grows to `max(2 * time, key.t + 1)`.
///
/// Returns `current` unchanged when `key` is already inside it.
pub fn grown_dims(current: IndexDims, key: IndexDims) -> IndexDims {
    let (c, z, t) = current;
    let channels = c.max(key.0 + 1);
    let depth = z.max(key.1 + 1);
    let time = if key.2 >= t {
        t.saturating_mul(2).max(key.2 + 1)
    } else {
        t
    };
    (channels, depth, time)
}

fn cell_count(dims: IndexDims) -> Option<usize> {
    dims.0.checked_mul(dims.1)?.checked_mul(dims.2)
}

struct Grid {
    dims: IndexDims,
    cells: Vec<Option<IndexEntry>>,
    recorded: usize,
    growths: u64,
}

impl Grid {
    fn slot(&self, key: IndexDims) -> Option<usize> {
        let (c, z, t) = self.dims;
        if key.0 < c && key.1 < z && key.2 < t {
            Some((key.0 * z + key.1) * t + key.2)
        } else {
            None
        }
    }

    fn set(&mut self, key: IndexDims, entry: IndexEntry) -> Option<Option<IndexEntry>> {
        let slot = self.slot(key)?;
        let previous = self.cells[slot].replace(entry);
        if previous.is_none() {
            self.recorded += 1;
        }
        Some(previous)
    }

    fn grow_to(&mut self, target: IndexDims, max_entries: usize) -> EdaResult<()> {
        let failure = |reason: String| EdaError::GrowthFailure {
            channels: target.0,
            z: target.1,
            time: target.2,
            reason,
        };

        let total = cell_count(target).ok_or_else(|| failure("cell count overflows".into()))?;
        if total > max_entries {
            return Err(failure(format!("exceeds limit of {max_entries} entries")));
        }

        let mut cells: Vec<Option<IndexEntry>> = Vec::new();
        cells
            .try_reserve_exact(total)
            .map_err(|e| failure(e.to_string()))?;
        cells.resize(total, None);

        let (oc, oz, ot) = self.dims;
        let (_, nz, nt) = target;
        for c in 0..oc {
            for z in 0..oz {
                let src = (c * oz + z) * ot;
                let dst = (c * nz + z) * nt;
                cells[dst..dst + ot].copy_from_slice(&self.cells[src..src + ot]);
            }
        }

        tracing::info!(
            from = ?self.dims,
            to = ?target,
            recorded = self.recorded,
            "Index table grown"
        );
        self.cells = cells;
        self.dims = target;
        self.growths += 1;
        Ok(())
    }
}

/// Thread-safe coordinate index.
///
/// Concurrent lookups share a read lock; `record` and growth take the write
/// lock, so a lookup never observes a half-copied grid.
pub struct IndexTable {
    grid: RwLock<Grid>,
    max_entries: usize,
}

impl std::fmt::Debug for IndexTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let grid = self.grid.read();
        f.debug_struct("IndexTable")
            .field("dims", &grid.dims)
            .field("recorded", &grid.recorded)
            .field("max_entries", &self.max_entries)
            .finish()
    }
}

impl IndexTable {
    pub fn new(initial: IndexDims, max_entries: usize) -> EdaResult<Self> {
        let mut grid = Grid {
            dims: (0, 0, 0),
            cells: Vec::new(),
            recorded: 0,
            growths: 0,
        };
        let initial = (initial.0.max(1), initial.1.max(1), initial.2.max(1));
        grid.grow_to(initial, max_entries)?;
        grid.growths = 0;
        Ok(Self {
            grid: RwLock::new(grid),
            max_entries,
        })
    }

    pub fn from_config(config: &IndexConfig) -> EdaResult<Self> {
        Self::new(
            (config.initial_channels, config.initial_z, config.initial_time),
            config.max_entries,
        )
    }

    /// Map `coordinate` to `entry`, growing the grid if needed.
    ///
    /// Returns the entry previously recorded at that coordinate, if any.
    pub fn record(&self, coordinate: &Coordinate, entry: IndexEntry) -> EdaResult<Option<IndexEntry>> {
        let key = coordinate.index_key();
        let mut grid = self.grid.write();

        if let Some(previous) = grid.set(key, entry) {
            return Ok(previous);
        }

        let target = grown_dims(grid.dims, key);
        grid.grow_to(target, self.max_entries)?;

        grid.set(key, entry).ok_or_else(|| EdaError::GrowthFailure {
            channels: target.0,
            z: target.1,
            time: target.2,
            reason: format!("{coordinate} still outside grid after growth"),
        })
    }

    /// # Errors
    /// `CoordinateNotFound` if nothing was recorded at `coordinate`.
    pub fn lookup(&self, coordinate: &Coordinate) -> EdaResult<IndexEntry> {
        let grid = self.grid.read();
        grid.slot(coordinate.index_key())
            .and_then(|slot| grid.cells[slot])
            .ok_or(EdaError::CoordinateNotFound(*coordinate))
    }

    pub fn contains(&self, coordinate: &Coordinate) -> bool {
        self.lookup(coordinate).is_ok()
    }

    /// Grow (never shrink) so that every coordinate within `dims` fits
    /// without further growth.
    pub fn ensure_capacity(&self, dims: IndexDims) -> EdaResult<()> {
        let mut grid = self.grid.write();
        let current = grid.dims;
        let target = (
            current.0.max(dims.0),
            current.1.max(dims.1),
            current.2.max(dims.2),
        );
        if target == current {
            return Ok(());
        }
        grid.grow_to(target, self.max_entries)
    }

    /// Forget every entry, keeping the current extents.
    pub fn clear(&self) {
        let mut grid = self.grid.write();
        grid.cells.fill(None);
        grid.recorded = 0;
    }

    pub fn dims(&self) -> IndexDims {
        self.grid.read().dims
    }

    /// Number of coordinates with an entry.
    pub fn len(&self) -> usize {
        self.grid.read().recorded
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How many times the grid was extended after construction.
    pub fn growths(&self) -> u64 {
        self.grid.read().growths
    }
}
