//! `mda-bus`
//!
//! Delivery of `FrameReady` and `SequenceStarted` notifications.
//!
//! Two channel variants share one contract ([`Publisher`] and
//! [`Subscriber`]):
//!
//! - **Local**: [`EventBus`] calls handlers synchronously on the publishing
//!   thread, in publish order.
//! - **Remote**: [`RemoteForwarder`] serializes events onto a `tokio::net`
//!   stream; [`RemoteReceiver`] reads them in another process on a runtime
//!   task and re-dispatches them to local handlers there.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mda_bus::{EventBus, Publisher};
//! use mda_core::{AcquisitionEvent, SequenceDescriptor};
//!
//! let bus = Arc::new(EventBus::new());
//! bus.on_sequence_started(|d| println!("{} frames expected", d.frame_count()));
//! bus.publish(&AcquisitionEvent::SequenceStarted(SequenceDescriptor::new(2, 1, 5)))?;
//! # Ok::<(), mda_core::EdaError>(())
//! ```

pub mod local;
pub mod remote;
pub mod signal;
pub mod transport;
pub mod wire;

pub use local::{EventBus, EventQueue, Publisher, Subscriber};
pub use remote::{ReceiverExit, ReceiverState, ReceiverStats, RemoteForwarder, RemoteReceiver};
pub use signal::{Handler, Signal};
pub use transport::{Endpoint, Listener, Transport};
pub use wire::WireMessage;
