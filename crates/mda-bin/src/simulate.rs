//! Simulated camera driving an acquisition without hardware.
//!
//! Frames follow the descriptor's time, z, channel order (channel fastest)
//! and are reported with the engine's partial `{axis: index}` coordinates.
//! A frame the sink rejects is skipped unless the error is fatal, which ends
//! the acquisition.

use mda_core::{AcquisitionSink, EdaResult, Frame, FrameSource, PixelType, SequenceDescriptor};
use std::time::Duration;

/// glibc LCG, reproducible across platforms.
#[inline]
fn prng(seed: u64) -> u64 {
    seed.wrapping_mul(1103515245).wrapping_add(12345) & 0x7fffffff
}

/// Diagonal gradient with a per-channel offset, a bright spot that moves
/// with `frame_num`, and low-amplitude noise. Never all zero.
pub fn test_pattern(width: u32, height: u32, frame_num: u64, channel: u32) -> Vec<u16> {
    let w = width as usize;
    let h = height as usize;
    let mut buffer = vec![0u16; w * h];

    let spot_x = (frame_num as usize * 7) % w.max(1);
    let spot_y = h / 2;
    let spot_radius = (w.min(h) / 8).max(1);
    let channel_offset = (channel as u64 * 8192) % 32768;
    let frame_seed = frame_num.wrapping_mul(2654435761);

    for y in 0..h {
        for x in 0..w {
            let idx = y * w + x;
            let gradient = ((x + y) as u64 * 32767) / (w + h).max(1) as u64;
            let noise = prng(frame_seed ^ idx as u64) & 0x3FF;
            let mut value = (gradient + channel_offset + noise).min(65535);

            let dx = x.abs_diff(spot_x);
            let dy = y.abs_diff(spot_y);
            if dx * dx + dy * dy <= spot_radius * spot_radius {
                value = 60000;
            }
            buffer[idx] = (value as u16).max(1);
        }
    }
    buffer
}

#[derive(Debug, Clone)]
pub struct SimulatedCamera {
    descriptor: SequenceDescriptor,
    width: u32,
    height: u32,
    pixel_type: PixelType,
    interval: Duration,
    skipped: u64,
}

impl SimulatedCamera {
    pub fn new(descriptor: SequenceDescriptor, width: u32, height: u32, pixel_type: PixelType) -> Self {
        Self {
            descriptor,
            width,
            height,
            pixel_type,
            interval: Duration::ZERO,
            skipped: 0,
        }
    }

    /// Pause between frames.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Frames the sink rejected during the last run.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn frame(&self, frame_num: u64, channel: u32) -> Frame {
        let pixels = test_pattern(self.width, self.height, frame_num, channel);
        match self.pixel_type {
            PixelType::U16 => Frame::from_u16(self.width, self.height, &pixels),
            PixelType::U8 => Frame::from_u8(
                self.width,
                self.height,
                pixels.iter().map(|&p| (p >> 8).max(1) as u8).collect(),
            ),
        }
    }
}

impl FrameSource for SimulatedCamera {
    fn run(&mut self, sink: &dyn AcquisitionSink) -> EdaResult<()> {
        let d = self.descriptor;
        self.skipped = 0;
        sink.on_sequence_start(&d)?;

        let mut frame_num = 0u64;
        for t in 0..d.t.max(1) {
            for z in 0..d.z.max(1) {
                for c in 0..d.c.max(1) {
                    let frame = self.frame(frame_num, c);
                    let index = [("t", i64::from(t)), ("z", i64::from(z)), ("c", i64::from(c))];
                    match sink.on_frame_indexed(&frame, &index) {
                        Ok(()) => tracing::trace!(frame_num, c, z, t, "Simulated frame"),
                        Err(e) if e.is_fatal() => {
                            tracing::error!(frame_num, c, z, t, error = %e, "Acquisition aborted");
                            return Err(e);
                        }
                        Err(e) => {
                            self.skipped += 1;
                            tracing::warn!(frame_num, c, z, t, error = %e, "Frame rejected, continuing");
                        }
                    }
                    frame_num += 1;
                    if !self.interval.is_zero() {
                        std::thread::sleep(self.interval);
                    }
                }
            }
        }
        tracing::info!(
            frames = frame_num,
            skipped = self.skipped,
            "Simulated acquisition finished"
        );
        Ok(())
    }
}
