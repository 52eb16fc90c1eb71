//! Live-view cache.
//!
//! Keeps every frame seen during the current acquisition in a [`Hyperstack`]
//! so a viewer can scrub through channel, z and time, and tracks the most
//! recent coordinate. Each cached frame is announced on `frame_cached`; the
//! renderer subscribes there instead of to the store.

use crate::hyperstack::{Hyperstack, OverflowPolicy};
use mda_bus::{Signal, Subscriber};
use mda_core::{
    Coordinate, EdaError, EdaResult, Frame, FrameAccess, FrameReady, SequenceDescriptor,
    SubscriptionHandle,
};
use mda_storage::IndexDims;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct CacheState {
    descriptor: Option<SequenceDescriptor>,
    stack: Option<Hyperstack>,
    /// Extents whose allocation failed, with the reason
    unavailable: Option<(IndexDims, String)>,
    latest: Option<Coordinate>,
}

pub struct DisplayCache {
    source: Arc<dyn FrameAccess>,
    policy: OverflowPolicy,
    state: Mutex<CacheState>,
    frame_cached: Signal<Coordinate>,
    failures: AtomicU64,
}

impl std::fmt::Debug for DisplayCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisplayCache")
            .field("policy", &self.policy)
            .field("latest", &self.latest())
            .field("failures", &self.failures())
            .finish()
    }
}

impl DisplayCache {
    /// Cache frames read from `source` (the local store or a remote mirror).
    pub fn new(source: Arc<dyn FrameAccess>, policy: OverflowPolicy) -> Self {
        Self {
            source,
            policy,
            state: Mutex::new(CacheState::default()),
            frame_cached: Signal::new("frame_cached"),
            failures: AtomicU64::new(0),
        }
    }

    /// Subscribe to `subscriber`'s notifications.
    pub fn attach(self: &Arc<Self>, subscriber: &dyn Subscriber) -> [SubscriptionHandle; 2] {
        let cache = Arc::clone(self);
        let sequence = subscriber.subscribe_sequence_started(Arc::new(
            move |descriptor: &SequenceDescriptor| cache.on_sequence_started(descriptor),
        ));
        let cache = Arc::clone(self);
        let frame = subscriber.subscribe_frame_ready(Arc::new(move |event: &FrameReady| {
            if let Err(e) = cache.on_frame_ready(event) {
                cache.failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(coordinate = %event.coordinate, error = %e, "Display cache could not load frame");
            }
        }));
        [sequence, frame]
    }

    /// Drop the previous acquisition and remember the declared shape.
    pub fn on_sequence_started(&self, descriptor: &SequenceDescriptor) {
        let mut state = self.state.lock();
        *state = CacheState {
            descriptor: Some(*descriptor),
            ..CacheState::default()
        };
        tracing::debug!(?descriptor, "Display cache reset");
    }

    /// Pull the frame for `event` from the source and cache it.
    pub fn on_frame_ready(&self, event: &FrameReady) -> EdaResult<()> {
        let frame = self.source.get_frame(&event.coordinate)?;
        {
            let mut state = self.state.lock();
            if state.stack.is_none() {
                if let Some(((channels, z, time), reason)) = &state.unavailable {
                    return Err(EdaError::GrowthFailure {
                        channels: *channels,
                        z: *z,
                        time: *time,
                        reason: reason.clone(),
                    });
                }
                let declared = state
                    .descriptor
                    .map(|d| d.index_extents())
                    .unwrap_or((1, 1, 1));
                match self.allocate(declared, &frame) {
                    Ok(stack) => state.stack = Some(stack),
                    Err(e) => {
                        state.unavailable = Some((declared, e.to_string()));
                        return Err(e);
                    }
                }
            }
            if let Some(stack) = state.stack.as_mut() {
                stack.insert(&event.coordinate, &frame)?;
            }
            state.latest = Some(event.coordinate);
        }
        self.frame_cached.emit(&event.coordinate);
        Ok(())
    }

    /// Size the array for the declared extents. If that is too large, a
    /// growing cache starts with a single time point and grows as frames
    /// arrive.
    fn allocate(&self, declared: IndexDims, frame: &Frame) -> EdaResult<Hyperstack> {
        match Hyperstack::new(declared, frame.shape(), frame.pixel_type, self.policy) {
            Ok(stack) => Ok(stack),
            Err(e) if self.policy == OverflowPolicy::Grow && declared.2 > 1 => {
                tracing::warn!(?declared, error = %e, "Declared sequence too large to cache, growing on demand");
                Hyperstack::new(
                    (declared.0, declared.1, 1),
                    frame.shape(),
                    frame.pixel_type,
                    self.policy,
                )
            }
            Err(e) => Err(e),
        }
    }

    /// Called after each frame lands in the cache.
    pub fn on_frame_cached<F>(&self, handler: F) -> SubscriptionHandle
    where
        F: Fn(&Coordinate) + Send + Sync + 'static,
    {
        self.frame_cached.connect(handler)
    }

    pub fn frame(&self, coordinate: &Coordinate) -> Option<Frame> {
        self.state.lock().stack.as_ref()?.get(coordinate)
    }

    pub fn latest(&self) -> Option<Coordinate> {
        self.state.lock().latest
    }

    pub fn latest_frame(&self) -> Option<Frame> {
        let state = self.state.lock();
        state.stack.as_ref()?.get(&state.latest?)
    }

    pub fn dims(&self) -> Option<IndexDims> {
        self.state.lock().stack.as_ref().map(Hyperstack::dims)
    }

    pub fn descriptor(&self) -> Option<SequenceDescriptor> {
        self.state.lock().descriptor
    }

    /// Frames that could not be loaded or cached.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}
