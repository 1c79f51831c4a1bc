//! Remote session management.
//!
//! A [`RemoteSessionController`] owns at most one remote command at a time:
//! it connects, opens a channel, wires caller stdio through the output codec,
//! and tracks the lifecycle in a [`SessionState`].

mod controller;
mod driver;
mod id;
mod io;
mod state;
mod transfer;

pub use controller::{
    ControllerConfig, OnReady, RemoteSessionController, RunOutcome, DEFAULT_CONNECT_TIMEOUT,
};
pub use id::SessionId;
pub use io::{CaptureBuffer, ChannelReader, InputForwarder, OutputForwarder, OutputPump, Stdio};
pub use state::SessionState;
pub use transfer::{
    TransferLimits, ValidatedFile, DEFAULT_CLOSE_DELAY, DEFAULT_MAX_FILE_SIZE,
    DEFAULT_TRANSFER_COMMAND,
};
