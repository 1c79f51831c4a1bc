//! Remote-shell transport abstraction.
//!
//! The session layer dials a connection and runs one command channel on
//! it; everything else is bytes and events on that channel.
//! [`SshTransport`] does this over SSH and [`MemoryTransport`] scripts the
//! remote side in-process.

mod memory;
mod ssh;

pub use memory::{MemoryTransport, RemoteEnd};
pub use ssh::SshTransport;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Where and as whom to connect.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParameters {
    /// Remote host name or address.
    pub host: String,
    /// Remote port.
    pub port: u16,
    /// Login user.
    pub user: String,
    /// Password; never serialized or printed.
    #[serde(skip, default)]
    pub secret: String,
}

impl ConnectionParameters {
    /// Create connection parameters.
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            secret: secret.into(),
        }
    }

    /// Attach the secret to parameters obtained from discovery.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = secret.into();
        self
    }

    /// `host:port` for dialing.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for ConnectionParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParameters")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Something that happened on a command channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Bytes from the remote command's stdout.
    Stdout(Vec<u8>),
    /// Bytes from the remote command's stderr.
    Stderr(Vec<u8>),
    /// The remote command exited with this status.
    ExitStatus(u32),
    /// The remote side will send no more data.
    Eof,
    /// The channel is closed.
    Closed,
}

/// Dials connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open and authenticate a connection, giving up after `timeout`.
    async fn connect(
        &self,
        params: &ConnectionParameters,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>>;
}

/// An authenticated transport connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open a command-execution channel.
    async fn open_channel(&self) -> Result<Box<dyn ExecChannel>>;

    /// Tear down the connection.
    async fn disconnect(&self) -> Result<()>;
}

/// One command-execution channel.
///
/// `next_event` must be cancel-safe: it is polled inside `select!` next to
/// input and cancellation sources.
#[async_trait]
pub trait ExecChannel: Send {
    /// Start `command` on the remote side.
    async fn exec(&mut self, command: &str) -> Result<()>;

    /// Wait for the next event; `None` once the channel is gone.
    async fn next_event(&mut self) -> Option<ChannelEvent>;

    /// Send bytes to the remote command's stdin.
    async fn send_data(&mut self, data: &[u8]) -> Result<()>;

    /// Signal end of input.
    async fn send_eof(&mut self) -> Result<()>;

    /// Close the channel.
    async fn close(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address() {
        let params = ConnectionParameters::new("10.0.0.5", 2222, "kata", "pw");
        assert_eq!(params.address(), "10.0.0.5:2222");
    }

    #[test]
    fn test_debug_redacts_secret() {
        let params = ConnectionParameters::new("host", 22, "user", "hunter2");
        let printed = format!("{:?}", params);
        assert!(printed.contains("host"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn test_deserialize_without_secret() {
        let params: ConnectionParameters =
            serde_json::from_str(r#"{"host":"a.example","port":22,"user":"u"}"#).unwrap();
        assert_eq!(params.port, 22);
        assert!(params.secret.is_empty());

        let params = params.with_secret("s");
        assert_eq!(params.secret, "s");
        assert!(!serde_json::to_string(&params).unwrap().contains("\"s\""));
    }
}
