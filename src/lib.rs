//! # kata-tunnel
//!
//! Client for Go engines hosted on remote platforms, reached over SSH.
//!
//! The remote engine speaks its usual text protocol, but bulky output
//! (analysis streams) is sent as inline gzip segments. This crate connects,
//! forwards the local stdin to the engine, decodes its output back into
//! plain bytes, and can push a local engine config before a run.
//!
//! ## Features
//!
//! - **Output decoding**: [`codec::FrameDecoder`] demultiplexes literal bytes
//!   and compressed segments behind a plain `std::io::Read`
//! - **Session control**: [`RemoteSessionController`] runs one remote command
//!   at a time and can be stopped from any task
//! - **Discovery**: resolves SSH coordinates from a platform world document
//! - **Pluggable transport**: SSH in production, scripted in-memory in tests
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use kata_tunnel::{ConnectionParameters, ControllerConfig, RemoteSessionController};
//! use kata_tunnel::session::Stdio;
//! use kata_tunnel::transport::SshTransport;
//!
//! #[tokio::main]
//! async fn main() -> kata_tunnel::Result<()> {
//!     kata_tunnel::logging::try_init().ok();
//!
//!     let controller = RemoteSessionController::new(
//!         Arc::new(SshTransport::new()),
//!         ControllerConfig::default(),
//!     );
//!     let params = ConnectionParameters::new("203.0.113.7", 2222, "kata", "secret");
//!     controller
//!         .run_command(&params, "run-katago --compress", Stdio::inherit(), None)
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod client;
pub mod codec;
pub mod command;
pub mod config;
pub mod discovery;
pub mod error;
pub mod logging;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use client::{Account, Client, SessionHandle};
pub use codec::{FrameDecoder, FrameEncoder, OutputMode};
pub use command::{EngineCommand, RouteOptions};
pub use error::{FileValidationError, KataTunnelError, Result};
pub use session::{ControllerConfig, RemoteSessionController, RunOutcome, SessionId, SessionState};
pub use transport::ConnectionParameters;
