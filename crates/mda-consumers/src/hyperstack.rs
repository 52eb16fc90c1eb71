//! Growable channel x z x time array of equally sized frames.
//!
//! Consumers keep their own copy of the frames they care about in a
//! [`Hyperstack`]. Frames outside the current extents either grow the array
//! (same rule as the store's index: channel and z extended to fit, time at
//! least doubled) or are rejected, depending on [`OverflowPolicy`].

use mda_core::{Coordinate, EdaError, EdaResult, Frame, FrameShape, PixelType, SequenceDescriptor};
use mda_storage::{grown_dims, IndexDims};

/// Behavior for frames landing outside the current extents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    #[default]
    Grow,
    Reject,
}

/// Dense frame array in (channel, z, time, row, column) order.
#[derive(Debug, Clone)]
pub struct Hyperstack {
    shape: FrameShape,
    pixel_type: PixelType,
    dims: IndexDims,
    policy: OverflowPolicy,
    data: Vec<u8>,
    filled: Vec<bool>,
}

impl Hyperstack {
    pub fn new(
        dims: IndexDims,
        shape: FrameShape,
        pixel_type: PixelType,
        policy: OverflowPolicy,
    ) -> EdaResult<Self> {
        let dims = (dims.0.max(1), dims.1.max(1), dims.2.max(1));
        let mut stack = Self {
            shape,
            pixel_type,
            dims: (0, 0, 0),
            policy,
            data: Vec::new(),
            filled: Vec::new(),
        };
        stack.resize(dims)?;
        Ok(stack)
    }

    /// Sized from a sequence's declared extents.
    pub fn for_sequence(
        descriptor: &SequenceDescriptor,
        shape: FrameShape,
        pixel_type: PixelType,
        policy: OverflowPolicy,
    ) -> EdaResult<Self> {
        Self::new(descriptor.index_extents(), shape, pixel_type, policy)
    }

    fn frame_bytes(&self) -> usize {
        self.shape.pixels() * self.pixel_type.bytes_per_sample()
    }

    fn cell(&self, key: IndexDims) -> Option<usize> {
        let (c, z, t) = self.dims;
        (key.0 < c && key.1 < z && key.2 < t).then(|| (key.0 * z + key.1) * t + key.2)
    }

    fn resize(&mut self, target: IndexDims) -> EdaResult<()> {
        let cells = target
            .0
            .checked_mul(target.1)
            .and_then(|n| n.checked_mul(target.2))
            .ok_or(EdaError::SizeOverflow {
                context: "hyperstack cell count",
            })?;
        let frame_bytes = self.frame_bytes();
        let total = cells.checked_mul(frame_bytes).ok_or(EdaError::SizeOverflow {
            context: "hyperstack byte size",
        })?;

        let mut data: Vec<u8> = Vec::new();
        data.try_reserve_exact(total)
            .map_err(|e| EdaError::GrowthFailure {
                channels: target.0,
                z: target.1,
                time: target.2,
                reason: e.to_string(),
            })?;
        data.resize(total, 0);
        let mut filled = vec![false; cells];

        let (oc, oz, ot) = self.dims;
        let (_, nz, nt) = target;
        for c in 0..oc {
            for z in 0..oz {
                let src = (c * oz + z) * ot;
                let dst = (c * nz + z) * nt;
                filled[dst..dst + ot].copy_from_slice(&self.filled[src..src + ot]);
                data[dst * frame_bytes..(dst + ot) * frame_bytes]
                    .copy_from_slice(&self.data[src * frame_bytes..(src + ot) * frame_bytes]);
            }
        }

        if self.dims != (0, 0, 0) {
            tracing::debug!(from = ?self.dims, to = ?target, "Hyperstack grown");
        }
        self.data = data;
        self.filled = filled;
        self.dims = target;
        Ok(())
    }

    /// Copy `frame` into the cell for `coordinate`.
    ///
    /// # Errors
    /// `FrameSizeMismatch`/`PixelTypeMismatch` for a frame of another shape,
    /// `InvalidCoordinate` for an out-of-range coordinate under
    /// [`OverflowPolicy::Reject`], `GrowthFailure` if growing fails.
    pub fn insert(&mut self, coordinate: &Coordinate, frame: &Frame) -> EdaResult<()> {
        if frame.pixel_type != self.pixel_type {
            return Err(EdaError::PixelTypeMismatch {
                expected: self.pixel_type,
                actual: frame.pixel_type,
            });
        }
        if frame.shape() != self.shape || frame.data.len() != self.frame_bytes() {
            return Err(EdaError::FrameSizeMismatch {
                width: frame.width,
                height: frame.height,
                pixel_type: frame.pixel_type,
                expected: self.frame_bytes(),
                actual: frame.data.len(),
            });
        }

        let key = coordinate.index_key();
        let cell = match self.cell(key) {
            Some(cell) => cell,
            None => {
                if self.policy == OverflowPolicy::Reject {
                    return Err(EdaError::InvalidCoordinate(format!(
                        "{coordinate} outside {}x{}x{} stack",
                        self.dims.0, self.dims.1, self.dims.2
                    )));
                }
                self.resize(grown_dims(self.dims, key))?;
                self.cell(key).ok_or_else(|| {
                    EdaError::InvalidCoordinate(format!("{coordinate} outside grown stack"))
                })?
            }
        };

        let n = self.frame_bytes();
        self.data[cell * n..(cell + 1) * n].copy_from_slice(&frame.data);
        self.filled[cell] = true;
        Ok(())
    }

    /// Frame stored at `coordinate`, if one was inserted.
    pub fn get(&self, coordinate: &Coordinate) -> Option<Frame> {
        let cell = self.cell(coordinate.index_key())?;
        if !self.filled[cell] {
            return None;
        }
        let n = self.frame_bytes();
        Some(Frame {
            width: self.shape.width,
            height: self.shape.height,
            pixel_type: self.pixel_type,
            data: self.data[cell * n..(cell + 1) * n].to_vec(),
        })
    }

    pub fn contains(&self, coordinate: &Coordinate) -> bool {
        self.cell(coordinate.index_key())
            .is_some_and(|cell| self.filled[cell])
    }

    pub fn dims(&self) -> IndexDims {
        self.dims
    }

    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    pub fn pixel_type(&self) -> PixelType {
        self.pixel_type
    }

    pub fn filled(&self) -> usize {
        self.filled.iter().filter(|&&f| f).count()
    }

    /// Whole array, (channel, z, time, row, column), little-endian samples.
    /// Cells never written are zero.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}
