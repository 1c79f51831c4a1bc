//! In-process transport with a scripted remote side.
//!
//! Each channel runs the script on its own task. The script sees the command
//! line, reads what the local side sends to stdin, and emits channel events.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::trace;

use super::{ChannelEvent, Connection, ConnectionParameters, ExecChannel, Transport};
use crate::error::KataTunnelError;
use crate::Result;

type Script = Arc<dyn Fn(RemoteEnd) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Buffered events per channel.
const EVENT_BUFFER: usize = 64;

/// The remote half of an in-memory channel, handed to the script.
pub struct RemoteEnd {
    /// Command line passed to `exec`.
    pub command: String,
    stdin: mpsc::Receiver<Vec<u8>>,
    events: mpsc::Sender<ChannelEvent>,
}

impl RemoteEnd {
    /// Next chunk of stdin; `None` after end of input or close.
    pub async fn recv_stdin(&mut self) -> Option<Vec<u8>> {
        self.stdin.recv().await
    }

    /// Collect stdin until the local side signals end of input.
    pub async fn read_stdin_to_end(&mut self) -> Vec<u8> {
        let mut all = Vec::new();
        while let Some(chunk) = self.stdin.recv().await {
            all.extend(chunk);
        }
        all
    }

    /// Emit stdout bytes. Returns `false` once the channel is closed.
    pub async fn stdout(&self, data: impl Into<Vec<u8>>) -> bool {
        self.emit(ChannelEvent::Stdout(data.into())).await
    }

    /// Emit stderr bytes. Returns `false` once the channel is closed.
    pub async fn stderr(&self, data: impl Into<Vec<u8>>) -> bool {
        self.emit(ChannelEvent::Stderr(data.into())).await
    }

    /// Report an exit status, then EOF and close, as an SSH server would.
    pub async fn exit(&self, status: u32) {
        self.emit(ChannelEvent::ExitStatus(status)).await;
        self.emit(ChannelEvent::Eof).await;
        self.emit(ChannelEvent::Closed).await;
    }

    /// Close the channel without an exit status.
    pub async fn close(&self) {
        self.emit(ChannelEvent::Closed).await;
    }

    /// Resolve once the local side has closed the channel.
    pub async fn closed(&self) {
        self.events.closed().await
    }

    async fn emit(&self, event: ChannelEvent) -> bool {
        self.events.send(event).await.is_ok()
    }
}

/// Transport whose remote side is a user-supplied async script.
#[derive(Clone)]
pub struct MemoryTransport {
    script: Script,
    connect_error: Option<String>,
    channel_error: Option<String>,
    connect_delay: Duration,
    connects: Arc<AtomicUsize>,
}

impl MemoryTransport {
    /// Create a transport running `script` for every executed command.
    pub fn new<F, Fut>(script: F) -> Self
    where
        F: Fn(RemoteEnd) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            script: Arc::new(move |remote| Box::pin(script(remote))),
            connect_error: None,
            channel_error: None,
            connect_delay: Duration::ZERO,
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Make every connect attempt fail with `message`.
    pub fn failing_connect(mut self, message: impl Into<String>) -> Self {
        self.connect_error = Some(message.into());
        self
    }

    /// Make every channel open fail with `message`.
    pub fn failing_channel(mut self, message: impl Into<String>) -> Self {
        self.channel_error = Some(message.into());
        self
    }

    /// Delay each connect, to simulate a slow dial.
    pub fn connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Number of connect attempts so far.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(
        &self,
        params: &ConnectionParameters,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        trace!("memory transport: connect {}", params.address());

        if !self.connect_delay.is_zero() {
            if self.connect_delay > timeout {
                tokio::time::sleep(timeout).await;
                return Err(KataTunnelError::ConnectTimeout(timeout));
            }
            tokio::time::sleep(self.connect_delay).await;
        }
        if let Some(message) = &self.connect_error {
            return Err(KataTunnelError::Connection(message.clone()));
        }

        Ok(Box::new(MemoryConnection {
            script: Arc::clone(&self.script),
            channel_error: self.channel_error.clone(),
        }))
    }
}

struct MemoryConnection {
    script: Script,
    channel_error: Option<String>,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn open_channel(&self) -> Result<Box<dyn ExecChannel>> {
        if let Some(message) = &self.channel_error {
            return Err(KataTunnelError::Channel(message.clone()));
        }
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        Ok(Box::new(MemoryChannel {
            script: Arc::clone(&self.script),
            events_tx: Some(events_tx),
            events_rx,
            stdin_tx: None,
            pending_stdin: Vec::new(),
            closed: false,
        }))
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

struct MemoryChannel {
    script: Script,
    events_tx: Option<mpsc::Sender<ChannelEvent>>,
    events_rx: mpsc::Receiver<ChannelEvent>,
    stdin_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    /// Input written before `exec`, replayed once the script starts.
    pending_stdin: Vec<Vec<u8>>,
    closed: bool,
}

#[async_trait]
impl ExecChannel for MemoryChannel {
    async fn exec(&mut self, command: &str) -> Result<()> {
        let events = self
            .events_tx
            .take()
            .ok_or_else(|| KataTunnelError::Channel("command already started".into()))?;
        if self.closed {
            return Err(KataTunnelError::ChannelClosed);
        }

        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        for chunk in self.pending_stdin.drain(..) {
            let _ = stdin_tx.send(chunk);
        }
        self.stdin_tx = Some(stdin_tx);

        // Bridge the unbounded input queue to the bounded receiver the script sees.
        let (script_tx, script_rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(forward_stdin(stdin_rx, script_tx));

        let remote = RemoteEnd {
            command: command.to_string(),
            stdin: script_rx,
            events,
        };
        tokio::spawn((self.script)(remote));
        Ok(())
    }

    async fn next_event(&mut self) -> Option<ChannelEvent> {
        if self.closed {
            return None;
        }
        let event = self.events_rx.recv().await;
        match event {
            Some(ChannelEvent::Closed) | None => self.closed = true,
            _ => {}
        }
        event
    }

    async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(KataTunnelError::ChannelClosed);
        }
        match &self.stdin_tx {
            Some(tx) => tx
                .send(data.to_vec())
                .map_err(|_| KataTunnelError::Channel("remote stopped reading input".into())),
            None if self.events_tx.is_some() => {
                self.pending_stdin.push(data.to_vec());
                Ok(())
            }
            None => Err(KataTunnelError::Channel("input already closed".into())),
        }
    }

    async fn send_eof(&mut self) -> Result<()> {
        self.stdin_tx = None;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.stdin_tx = None;
        self.events_tx = None;
        self.events_rx.close();
        Ok(())
    }
}

async fn forward_stdin(mut rx: mpsc::UnboundedReceiver<Vec<u8>>, tx: mpsc::Sender<Vec<u8>>) {
    while let Some(chunk) = rx.recv().await {
        if tx.send(chunk).await.is_err() {
            break;
        }
    }
}
