//! Delta Broadcaster: encodes applied deltas into per-session frames and
//! hands them to the transport.
//!
//! # Invariants
//! - A session receives the deltas of one scope in apply order.
//! - Scope deltas at or below a session's last resync revision for that map are not sent.
//! - State frames are retried on transient failure; cosmetic frames are not.
//! - A stream that fails for good is closed and reported, never silently kept.

pub mod broadcaster;
pub mod error;
pub mod frame;
pub mod retry;
pub mod transport;

pub use broadcaster::{Broadcaster, DeliveryReport, StreamStats};
pub use error::{BroadcastError, TransportError};
pub use frame::Frame;
pub use retry::RetryPolicy;
pub use transport::{FlakyTransport, RecordingTransport, Transport};
