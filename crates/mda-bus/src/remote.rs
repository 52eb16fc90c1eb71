//! Cross-process event channel.
//!
//! [`RemoteForwarder`] is the publish side: it serializes each event to a
//! length-prefixed wire message and queues it for a writer task, which writes
//! the queue to the stream in publish order. [`RemoteReceiver`] is the other
//! end: a task on the tokio runtime reads the stream, decodes messages and
//! re-dispatches them to subscribers in the receiving process through its own
//! [`EventBus`].
//!
//! # Receiver lifecycle
//!
//! ```text
//! Idle --start--> Listening --message--> Dispatching --done--> Listening
//!                     |
//!                     +-- stop flag / stop message / EOF / fatal error --> Stopped
//! ```
//!
//! Every read is wrapped in `tokio::time::timeout(poll_timeout)`. A timeout is
//! not an error: the loop checks the stop flag and reads again. Partially
//! received messages stay buffered across timeouts, so nothing is lost to
//! polling.
//!
//! A malformed message is logged and dropped; delivery continues with the
//! next one.

use crate::local::{EventBus, Publisher, Subscriber};
use crate::signal::Handler;
use crate::transport::{Endpoint, Transport};
use crate::wire::{encode, FrameDecoder, WireMessage};
use mda_core::config::ChannelConfig;
use mda_core::{
    AcquisitionEvent, EdaError, EdaResult, FrameReady, SequenceDescriptor, ShutdownPolicy,
    SubscriptionHandle,
};
use parking_lot::Mutex;
use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const READ_CHUNK: usize = 64 * 1024;

/// How long a draining receiver waits for more bytes before it gives up.
const DRAIN_WINDOW: Duration = Duration::from_millis(10);

fn current_runtime(what: &str) -> EdaResult<Handle> {
    Handle::try_current()
        .map_err(|e| EdaError::Configuration(format!("{what} needs a tokio runtime: {e}")))
}

// =============================================================================
// Publish side
// =============================================================================

#[derive(Debug)]
struct Outgoing {
    bytes: Vec<u8>,
    /// Writer exits after this message
    last: bool,
}

/// Writes published events to a stream transport.
///
/// `publish` never blocks the producer: the encoded message is queued and a
/// writer task on the runtime drains the queue in order. A failed write
/// closes the queue, so every later `publish` returns `Disconnected` and
/// [`send_stop`](Self::send_stop) returns the write error itself.
pub struct RemoteForwarder {
    queue: mpsc::UnboundedSender<Outgoing>,
    writer: Mutex<Option<JoinHandle<EdaResult<()>>>>,
    peer: String,
    max_message_bytes: usize,
    sent: Arc<AtomicU64>,
}

impl std::fmt::Debug for RemoteForwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteForwarder")
            .field("peer", &self.peer)
            .field("sent", &self.sent())
            .finish()
    }
}

impl RemoteForwarder {
    /// Spawn the writer task for `transport` on the current runtime.
    pub fn new(transport: Box<dyn Transport>, max_message_bytes: usize) -> EdaResult<Self> {
        let runtime = current_runtime("RemoteForwarder")?;
        let peer = transport.peer();
        let sent = Arc::new(AtomicU64::new(0));
        let (queue, rx) = mpsc::unbounded_channel();
        let writer = runtime.spawn(write_loop(transport, rx, Arc::clone(&sent), peer.clone()));
        Ok(Self {
            queue,
            writer: Mutex::new(Some(writer)),
            peer,
            max_message_bytes,
            sent,
        })
    }

    pub async fn connect(endpoint: &Endpoint, config: &ChannelConfig) -> EdaResult<Self> {
        Self::new(endpoint.connect().await?, config.max_message_bytes)
    }

    fn enqueue(&self, message: &WireMessage, last: bool) -> EdaResult<()> {
        let bytes = encode(message, self.max_message_bytes)?;
        self.queue
            .send(Outgoing { bytes, last })
            .map_err(|_| EdaError::Disconnected)
    }

    /// Tell the receiver that nothing else will follow, then wait until every
    /// queued message has been written.
    pub async fn send_stop(&self) -> EdaResult<()> {
        let queued = self.enqueue(&WireMessage::Stop, true);
        let writer = self.writer.lock().take();
        let Some(writer) = writer else {
            return Err(EdaError::Disconnected);
        };
        writer.await.map_err(|e| EdaError::Io(io::Error::other(e)))??;
        queued?;
        tracing::info!(peer = %self.peer, sent = self.sent(), "Sent stop message");
        Ok(())
    }

    /// Messages written so far, the stop message included.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Acquire)
    }

    /// Forward every event published on `bus`.
    ///
    /// Handlers cannot return errors, so a failed enqueue is logged and the
    /// producer carries on.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) -> [SubscriptionHandle; 2] {
        let forwarder = Arc::clone(self);
        let frame = bus.on_frame_ready(move |event| {
            forwarder.forward(&AcquisitionEvent::FrameReady(*event));
        });
        let forwarder = Arc::clone(self);
        let sequence = bus.on_sequence_started(move |descriptor| {
            forwarder.forward(&AcquisitionEvent::SequenceStarted(*descriptor));
        });
        [frame, sequence]
    }

    fn forward(&self, event: &AcquisitionEvent) {
        if let Err(e) = self.publish(event) {
            tracing::error!(peer = %self.peer, kind = event.kind(), error = %e, "Failed to forward event");
        }
    }
}

impl Publisher for RemoteForwarder {
    fn publish(&self, event: &AcquisitionEvent) -> EdaResult<()> {
        self.enqueue(&WireMessage::from(event), false)
    }
}

async fn write_loop(
    mut transport: Box<dyn Transport>,
    mut queue: mpsc::UnboundedReceiver<Outgoing>,
    sent: Arc<AtomicU64>,
    peer: String,
) -> EdaResult<()> {
    while let Some(message) = queue.recv().await {
        if let Err(e) = write_message(&mut transport, &message.bytes).await {
            tracing::error!(%peer, error = %e, "Event channel write failed");
            return Err(e);
        }
        sent.fetch_add(1, Ordering::AcqRel);
        if message.last {
            break;
        }
    }
    if let Err(e) = transport.shutdown().await {
        tracing::debug!(%peer, error = %e, "Event channel shutdown failed");
    }
    Ok(())
}

async fn write_message(transport: &mut Box<dyn Transport>, bytes: &[u8]) -> EdaResult<()> {
    let disconnected = |e: io::Error| match e.kind() {
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset => EdaError::Disconnected,
        _ => EdaError::Io(e),
    };
    transport.write_all(bytes).await.map_err(disconnected)?;
    transport.flush().await.map_err(disconnected)?;
    Ok(())
}

// =============================================================================
// Receive side
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Idle,
    Listening,
    Dispatching,
    Stopped,
}

/// Why the receiver loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverExit {
    StopRequested,
    StopMessage,
    Disconnected,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiverStats {
    pub dispatched: u64,
    pub malformed: u64,
    /// Decoded events a subscriber target refused
    pub failed: u64,
}

#[derive(Debug)]
struct Shared {
    state: watch::Sender<ReceiverState>,
    exit: Mutex<Option<ReceiverExit>>,
    stop: AtomicBool,
    dispatched: AtomicU64,
    malformed: AtomicU64,
    failed: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        let (state, _) = watch::channel(ReceiverState::Idle);
        Self {
            state,
            exit: Mutex::new(None),
            stop: AtomicBool::new(false),
            dispatched: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    fn set_state(&self, state: ReceiverState) {
        self.state.send_replace(state);
    }

    fn state(&self) -> ReceiverState {
        *self.state.borrow()
    }

    fn stats(&self) -> ReceiverStats {
        ReceiverStats {
            dispatched: self.dispatched.load(Ordering::Acquire),
            malformed: self.malformed.load(Ordering::Acquire),
            failed: self.failed.load(Ordering::Acquire),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LoopSettings {
    poll_timeout: Duration,
    shutdown: ShutdownPolicy,
    max_message_bytes: usize,
}

/// Receiving end of the cross-process channel.
///
/// Subscribe first, then [`start`](Self::start) with a connected transport;
/// events are dispatched on the receiver task.
pub struct RemoteReceiver {
    bus: Arc<EventBus>,
    shared: Arc<Shared>,
    settings: LoopSettings,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RemoteReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteReceiver")
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish()
    }
}

impl RemoteReceiver {
    pub fn new(config: &ChannelConfig) -> Self {
        Self::with_bus(config, Arc::new(EventBus::new()))
    }

    /// Dispatch into an existing bus instead of a private one.
    pub fn with_bus(config: &ChannelConfig, bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            shared: Arc::new(Shared::new()),
            settings: LoopSettings {
                poll_timeout: config.poll_timeout(),
                shutdown: config.shutdown,
                max_message_bytes: config.max_message_bytes,
            },
            task: Mutex::new(None),
        }
    }

    /// Spawn the receiver loop on `transport` on the current runtime.
    pub fn start(&self, transport: Box<dyn Transport>) -> EdaResult<()> {
        let mut task = self.task.lock();
        if self.state() != ReceiverState::Idle {
            return Err(EdaError::Configuration(
                "receiver can only be started once".into(),
            ));
        }
        let runtime = current_runtime("RemoteReceiver")?;

        let bus = Arc::clone(&self.bus);
        let shared = Arc::clone(&self.shared);
        let settings = self.settings;
        shared.set_state(ReceiverState::Listening);

        *task = Some(runtime.spawn(async move {
            run_loop(transport, &bus, &shared, settings).await;
        }));
        Ok(())
    }

    /// Ask the loop to exit at its next stop-flag check (at most one poll
    /// timeout away).
    pub fn request_stop(&self) {
        self.shared.stop.store(true, Ordering::Release);
    }

    /// Request a stop and wait for the loop to exit.
    pub async fn stop(&self) -> ReceiverStats {
        self.request_stop();
        self.join().await;
        self.stats()
    }

    /// Wait for the loop to exit on its own (stop message or disconnect).
    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Receiver task failed");
                self.shared.set_state(ReceiverState::Stopped);
            }
        }
    }

    /// Wait until the loop has stopped or `limit` elapses. Returns whether it
    /// stopped.
    pub async fn wait_until_stopped(&self, limit: Duration) -> bool {
        let mut state = self.shared.state.subscribe();
        let stopped = matches!(
            timeout(limit, state.wait_for(|s| *s == ReceiverState::Stopped)).await,
            Ok(Ok(_))
        );
        stopped
    }

    pub fn state(&self) -> ReceiverState {
        self.shared.state()
    }

    pub fn exit_reason(&self) -> Option<ReceiverExit> {
        *self.shared.exit.lock()
    }

    pub fn stats(&self) -> ReceiverStats {
        self.shared.stats()
    }

    /// Bus that received events are dispatched into.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.bus
    }
}

impl Subscriber for RemoteReceiver {
    fn subscribe_frame_ready(&self, handler: Handler<FrameReady>) -> SubscriptionHandle {
        self.bus.subscribe_frame_ready(handler)
    }

    fn subscribe_sequence_started(
        &self,
        handler: Handler<SequenceDescriptor>,
    ) -> SubscriptionHandle {
        self.bus.subscribe_sequence_started(handler)
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.bus.unsubscribe(handle)
    }
}

impl Drop for RemoteReceiver {
    // the task sees the flag within one poll timeout and exits on its own
    fn drop(&mut self) {
        if self.task.get_mut().is_some() {
            self.request_stop();
        }
    }
}

async fn run_loop(
    mut transport: Box<dyn Transport>,
    bus: &EventBus,
    shared: &Shared,
    settings: LoopSettings,
) {
    let peer = transport.peer();
    tracing::info!(%peer, timeout = ?settings.poll_timeout, policy = ?settings.shutdown, "Receiver listening");

    let mut decoder = FrameDecoder::new(settings.max_message_bytes);
    let mut chunk = vec![0u8; READ_CHUNK];

    let exit = loop {
        if let Some(exit) = dispatch_buffered(&mut decoder, bus, shared, settings.shutdown) {
            break exit;
        }

        if shared.stop.load(Ordering::Acquire) {
            if settings.shutdown == ShutdownPolicy::Drain {
                drain(&mut transport, &mut decoder, &mut chunk).await;
                if let Some(exit) = dispatch_buffered(&mut decoder, bus, shared, settings.shutdown)
                {
                    break exit;
                }
            } else if decoder.buffered() > 0 {
                tracing::warn!(bytes = decoder.buffered(), "Dropping undelivered messages on stop");
            }
            break ReceiverExit::StopRequested;
        }

        match timeout(settings.poll_timeout, transport.read(&mut chunk)).await {
            // poll timeout, go check the stop flag
            Err(_) => continue,
            Ok(Ok(0)) => {
                if decoder.buffered() > 0 {
                    tracing::warn!(bytes = decoder.buffered(), "Peer closed mid-message");
                }
                break ReceiverExit::Disconnected;
            }
            Ok(Ok(n)) => decoder.extend(&chunk[..n]),
            Ok(Err(e)) if e.kind() == ErrorKind::Interrupted => continue,
            Ok(Err(e)) => {
                tracing::error!(%peer, error = %e, "Receiver read failed");
                break ReceiverExit::Failed;
            }
        }
    };

    let stats = shared.stats();
    tracing::info!(
        %peer,
        ?exit,
        dispatched = stats.dispatched,
        malformed = stats.malformed,
        failed = stats.failed,
        "Receiver stopped"
    );
    *shared.exit.lock() = Some(exit);
    shared.set_state(ReceiverState::Stopped);
}

/// Pull in whatever the sender managed to write before the stop.
async fn drain(transport: &mut Box<dyn Transport>, decoder: &mut FrameDecoder, chunk: &mut [u8]) {
    loop {
        match timeout(DRAIN_WINDOW, transport.read(chunk)).await {
            Err(_) | Ok(Ok(0)) => break,
            Ok(Ok(n)) => decoder.extend(&chunk[..n]),
            Ok(Err(e)) if e.kind() == ErrorKind::Interrupted => continue,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Drain read failed");
                break;
            }
        }
    }
    tracing::debug!(bytes = decoder.buffered(), "Drained receiver transport");
}

/// Dispatch every complete message already buffered, in arrival order.
///
/// Per-message problems are counted and skipped. A fatal error from the
/// target ends the loop.
fn dispatch_buffered(
    decoder: &mut FrameDecoder,
    target: &dyn Publisher,
    shared: &Shared,
    policy: ShutdownPolicy,
) -> Option<ReceiverExit> {
    while let Some(result) = decoder.next_message() {
        if policy == ShutdownPolicy::Drop && shared.stop.load(Ordering::Acquire) {
            return Some(ReceiverExit::StopRequested);
        }

        match result {
            Ok(WireMessage::Stop) => return Some(ReceiverExit::StopMessage),
            Ok(message) => {
                let Some(event) = message.into_event() else {
                    continue;
                };
                shared.set_state(ReceiverState::Dispatching);
                let published = target.publish(&event);
                shared.set_state(ReceiverState::Listening);
                match published {
                    Ok(()) => {
                        shared.dispatched.fetch_add(1, Ordering::AcqRel);
                        tracing::trace!(kind = event.kind(), "Dispatched remote event");
                    }
                    Err(e) if e.is_fatal() => {
                        tracing::error!(kind = event.kind(), error = %e, "Dispatch failed, stopping receiver");
                        return Some(ReceiverExit::Failed);
                    }
                    Err(e) => {
                        shared.failed.fetch_add(1, Ordering::AcqRel);
                        tracing::warn!(kind = event.kind(), error = %e, "Dispatch failed");
                    }
                }
            }
            Err(e) if e.is_per_message() => {
                shared.malformed.fetch_add(1, Ordering::AcqRel);
                tracing::error!(error = %e, "Dropping malformed message");
            }
            Err(e) => {
                tracing::error!(error = %e, "Receiver stream is unusable");
                return Some(ReceiverExit::Failed);
            }
        }
    }
    None
}
