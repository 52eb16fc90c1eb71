//! In-process event channel.
//!
//! [`EventBus`] dispatches synchronously on the publishing thread, in publish
//! order, with no copying beyond handing each handler a reference. A consumer
//! that wants the work done on another thread asks for an [`EventQueue`]
//! instead of a callback, which makes the thread hop explicit.

use crate::signal::{HandleAllocator, Handler, Signal};
use mda_core::{AcquisitionEvent, EdaResult, FrameReady, SequenceDescriptor, SubscriptionHandle};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Publishing side of an event channel.
pub trait Publisher: Send + Sync {
    fn publish(&self, event: &AcquisitionEvent) -> EdaResult<()>;
}

/// Subscribing side of an event channel.
///
/// Implemented both by the local bus and by the remote receiver, so consumer
/// adapters attach the same way on either side of a process boundary.
pub trait Subscriber: Send + Sync {
    fn subscribe_frame_ready(&self, handler: Handler<FrameReady>) -> SubscriptionHandle;

    fn subscribe_sequence_started(&self, handler: Handler<SequenceDescriptor>)
        -> SubscriptionHandle;

    /// Returns false if `handle` was unknown or already removed.
    fn unsubscribe(&self, handle: SubscriptionHandle) -> bool;
}

#[derive(Debug)]
pub struct EventBus {
    frame_ready: Signal<FrameReady>,
    sequence_started: Signal<SequenceDescriptor>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let ids = Arc::new(HandleAllocator::new());
        Self {
            frame_ready: Signal::with_ids("frame_ready", Arc::clone(&ids)),
            sequence_started: Signal::with_ids("sequence_started", ids),
        }
    }

    pub fn on_frame_ready<F>(&self, handler: F) -> SubscriptionHandle
    where
        F: Fn(&FrameReady) + Send + Sync + 'static,
    {
        self.frame_ready.connect(handler)
    }

    pub fn on_sequence_started<F>(&self, handler: F) -> SubscriptionHandle
    where
        F: Fn(&SequenceDescriptor) + Send + Sync + 'static,
    {
        self.sequence_started.connect(handler)
    }

    /// Deliver every event into a queue drained on whichever thread or task
    /// owns the returned [`EventQueue`].
    pub fn subscribe_queue(&self) -> EventQueue {
        let (tx, rx) = mpsc::unbounded_channel();

        let frame_tx = tx.clone();
        let frame = self.on_frame_ready(move |event| {
            // receiver gone: the queue owner stopped listening
            let _ = frame_tx.send(AcquisitionEvent::FrameReady(*event));
        });
        let sequence = self.on_sequence_started(move |descriptor| {
            let _ = tx.send(AcquisitionEvent::SequenceStarted(*descriptor));
        });

        EventQueue {
            rx,
            handles: [frame, sequence],
        }
    }

    /// Detach a queue created by [`subscribe_queue`](Self::subscribe_queue).
    pub fn unsubscribe_queue(&self, queue: &EventQueue) {
        for handle in queue.handles {
            self.unsubscribe(handle);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.frame_ready.len() + self.sequence_started.len()
    }

    pub fn clear(&self) {
        self.frame_ready.disconnect_all();
        self.sequence_started.disconnect_all();
    }
}

impl Publisher for EventBus {
    fn publish(&self, event: &AcquisitionEvent) -> EdaResult<()> {
        match event {
            AcquisitionEvent::FrameReady(ready) => {
                self.frame_ready.emit(ready);
            }
            AcquisitionEvent::SequenceStarted(descriptor) => {
                self.sequence_started.emit(descriptor);
            }
        }
        Ok(())
    }
}

impl Subscriber for EventBus {
    fn subscribe_frame_ready(&self, handler: Handler<FrameReady>) -> SubscriptionHandle {
        self.frame_ready.connect_shared(handler)
    }

    fn subscribe_sequence_started(
        &self,
        handler: Handler<SequenceDescriptor>,
    ) -> SubscriptionHandle {
        self.sequence_started.connect_shared(handler)
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.frame_ready.disconnect(handle) || self.sequence_started.disconnect(handle)
    }
}

/// Thread-safe FIFO of events fed by an [`EventBus`].
#[derive(Debug)]
pub struct EventQueue {
    rx: mpsc::UnboundedReceiver<AcquisitionEvent>,
    handles: [SubscriptionHandle; 2],
}

impl EventQueue {
    pub async fn recv(&mut self) -> Option<AcquisitionEvent> {
        self.rx.recv().await
    }

    /// Blocking receive for plain threads. Must not be called from within an
    /// async runtime.
    pub fn blocking_recv(&mut self) -> Option<AcquisitionEvent> {
        self.rx.blocking_recv()
    }

    pub fn try_recv(&mut self) -> Option<AcquisitionEvent> {
        self.rx.try_recv().ok()
    }

    pub fn handles(&self) -> [SubscriptionHandle; 2] {
        self.handles
    }
}
