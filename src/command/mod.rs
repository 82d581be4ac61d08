//! Action registry and dispatch for the device client
//!
//! This module handles:
//! - Registering named actions against in-process or external-process handlers
//! - Dispatching inbound action requests to the registered handler
//! - Translating action parameters into command-line arguments
//! - Running external commands and capturing their output

mod handler;
mod process;
mod registry;

pub use handler::{ActionHandler, ActionOutcome, Command, HandlerResult, UserData};
pub use process::{build_argv, ProcessOutcome, ProcessOutput, ProcessRunner, SystemRunner};
pub use registry::{CommandError, CommandRegistry};
