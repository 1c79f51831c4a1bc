//! SSH transport built on russh.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;
use tracing::{debug, trace};

use super::{ChannelEvent, Connection, ConnectionParameters, ExecChannel, Transport};
use crate::error::KataTunnelError;
use crate::Result;

/// Extended-data stream number carrying stderr.
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// Client handler; server keys are not pinned.
struct AcceptAnyHostKey;

#[async_trait]
impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Password-authenticated SSH transport.
#[derive(Debug, Clone, Default)]
pub struct SshTransport {
    keepalive: Option<Duration>,
}

impl SshTransport {
    /// Create a transport with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Send keepalives at this interval.
    pub fn with_keepalive(mut self, interval: Duration) -> Self {
        self.keepalive = Some(interval);
        self
    }

    /// Keepalive interval, if any.
    pub fn keepalive(&self) -> Option<Duration> {
        self.keepalive
    }

    fn client_config(&self) -> Arc<client::Config> {
        Arc::new(client::Config {
            keepalive_interval: self.keepalive,
            ..Default::default()
        })
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(
        &self,
        params: &ConnectionParameters,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>> {
        let addr = params.address();
        debug!("ssh: dialing {} as {}", addr, params.user);

        let dial = async {
            let mut handle =
                client::connect(self.client_config(), addr.as_str(), AcceptAnyHostKey).await?;
            let accepted = handle
                .authenticate_password(params.user.clone(), params.secret.clone())
                .await?;
            Ok::<_, russh::Error>((handle, accepted))
        };

        let (handle, accepted) = tokio::time::timeout(timeout, dial)
            .await
            .map_err(|_| KataTunnelError::ConnectTimeout(timeout))?
            .map_err(|e| KataTunnelError::Connection(format!("{}: {}", addr, e)))?;

        if !accepted {
            return Err(KataTunnelError::Connection(format!(
                "{}: authentication rejected for user {}",
                addr, params.user
            )));
        }

        debug!("ssh: connected to {}", addr);
        Ok(Box::new(SshConnection { handle }))
    }
}

struct SshConnection {
    handle: Handle<AcceptAnyHostKey>,
}

#[async_trait]
impl Connection for SshConnection {
    async fn open_channel(&self) -> Result<Box<dyn ExecChannel>> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| KataTunnelError::Channel(e.to_string()))?;
        Ok(Box::new(SshChannel {
            channel,
            closed: false,
        }))
    }

    async fn disconnect(&self) -> Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| KataTunnelError::Connection(e.to_string()))
    }
}

struct SshChannel {
    channel: Channel<Msg>,
    closed: bool,
}

#[async_trait]
impl ExecChannel for SshChannel {
    async fn exec(&mut self, command: &str) -> Result<()> {
        self.channel
            .exec(true, command)
            .await
            .map_err(|e| KataTunnelError::Channel(e.to_string()))
    }

    async fn next_event(&mut self) -> Option<ChannelEvent> {
        if self.closed {
            return None;
        }
        loop {
            let msg = match self.channel.wait().await {
                Some(msg) => msg,
                None => {
                    self.closed = true;
                    return None;
                }
            };
            let event = match msg {
                ChannelMsg::Data { data } => ChannelEvent::Stdout(data.to_vec()),
                ChannelMsg::ExtendedData { data, ext } if ext == SSH_EXTENDED_DATA_STDERR => {
                    ChannelEvent::Stderr(data.to_vec())
                }
                ChannelMsg::ExitStatus { exit_status } => ChannelEvent::ExitStatus(exit_status),
                ChannelMsg::Eof => ChannelEvent::Eof,
                ChannelMsg::Close => {
                    self.closed = true;
                    ChannelEvent::Closed
                }
                other => {
                    trace!("ssh: ignoring channel message {:?}", other);
                    continue;
                }
            };
            return Some(event);
        }
    }

    async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        self.channel
            .data(data)
            .await
            .map_err(|e| KataTunnelError::Channel(e.to_string()))
    }

    async fn send_eof(&mut self) -> Result<()> {
        self.channel
            .eof()
            .await
            .map_err(|e| KataTunnelError::Channel(e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.channel
            .close()
            .await
            .map_err(|e| KataTunnelError::Channel(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keepalive_reaches_client_config() {
        assert_eq!(SshTransport::new().client_config().keepalive_interval, None);
        let transport = SshTransport::new().with_keepalive(Duration::from_secs(20));
        assert_eq!(
            transport.client_config().keepalive_interval,
            Some(Duration::from_secs(20))
        );
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        // Bind then drop to get a port with nothing listening.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let params = ConnectionParameters::new("127.0.0.1", port, "kata", "pw");
        let result = SshTransport::new()
            .connect(&params, Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(KataTunnelError::Connection(_))));
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        // A listener that accepts but never speaks SSH.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _accept = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let params = ConnectionParameters::new("127.0.0.1", port, "kata", "pw");
        let result = SshTransport::new()
            .connect(&params, Duration::from_millis(200))
            .await;
        assert!(matches!(result, Err(KataTunnelError::ConnectTimeout(_))));
    }
}
