//! Outbound publish tracking
//!
//! This module handles:
//! - Holding outbound commands until the cloud replies to them
//! - Re-keying entries from the transport id to the reply key
//! - Evicting entries whose reply never arrives

mod correlator;
mod timeout;

pub use correlator::{PendingPublish, PublishHandle, ReplyCorrelator, TrackerError};
pub use timeout::ReplyTimeout;
