//! Device-side cloud client
//!
//! This crate handles:
//! - Dispatching cloud action requests to registered handlers
//! - Tracking outbound publishes until the cloud replies to them
//! - Layered configuration and file-transfer bookkeeping

pub mod client;
pub mod command;
pub mod osal;
pub mod tracker;
pub mod transfer;
pub mod transport;

pub use client::{default_config, load_config, Client, Location};
pub use command::{ActionHandler, ActionOutcome, CommandError, HandlerResult, UserData};
pub use tracker::{PendingPublish, ReplyCorrelator, ReplyTimeout, TrackerError};
pub use transfer::{PendingTransfer, PendingTransferSet, TransferIdentity, TransferKey};
pub use transport::{ChannelTransport, OutboundMessage, Transport};
