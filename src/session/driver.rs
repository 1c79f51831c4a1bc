//! Event loop that runs one command channel to completion.

use std::future::Future;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, warn};

use crate::transport::{ChannelEvent, ExecChannel};

/// Queues connecting a channel to the local stdio adapters.
pub(crate) struct ChannelIo {
    /// Chunks for the remote stdin; end of queue means end of input.
    pub stdin: mpsc::Receiver<Vec<u8>>,
    /// Raw stdout chunks for the output pump.
    pub stdout: mpsc::Sender<Vec<u8>>,
    /// Stderr chunks.
    pub stderr: mpsc::Sender<Vec<u8>>,
    /// Hold back end-of-input this long after the last input chunk.
    pub eof_delay: Option<Duration>,
}

/// How the channel loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DriveOutcome {
    /// The command reported an exit status before the channel closed.
    Exited(u32),
    /// The channel closed without an exit status.
    Closed,
    /// A stop request closed the channel.
    Stopped,
}

/// Resolves once a stop has been requested or the controller went away.
pub(crate) async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

async fn next_input(stdin: &mut Option<mpsc::Receiver<Vec<u8>>>) -> Option<Vec<u8>> {
    match stdin {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn eof_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Shuttle bytes between `io` and `channel` until the channel closes or a
/// stop is requested. The output queues are dropped on return, which ends
/// the output pump.
pub(crate) async fn drive(
    channel: &mut dyn ExecChannel,
    io: ChannelIo,
    mut stop: watch::Receiver<bool>,
) -> DriveOutcome {
    let ChannelIo {
        stdin,
        stdout,
        stderr,
        eof_delay,
    } = io;
    let mut stdin = Some(stdin);
    let mut eof_deadline: Option<Instant> = None;
    let mut exit_status = None;

    loop {
        tokio::select! {
            _ = stop_requested(&mut stop) => return close_on_stop(channel).await,
            chunk = next_input(&mut stdin) => match chunk {
                Some(data) => {
                    let sent = or_stop(&mut stop, channel.send_data(&data)).await;
                    match sent {
                        None => return close_on_stop(channel).await,
                        Some(Err(e)) => {
                            warn!("channel driver: failed to forward input: {}", e);
                            stdin = None;
                        }
                        Some(Ok(())) => {}
                    }
                }
                None => {
                    stdin = None;
                    match eof_delay {
                        Some(delay) => eof_deadline = Some(Instant::now() + delay),
                        None => {
                            if or_stop(&mut stop, send_eof(channel)).await.is_none() {
                                return close_on_stop(channel).await;
                            }
                        }
                    }
                }
            },
            _ = eof_timer(eof_deadline) => {
                eof_deadline = None;
                if or_stop(&mut stop, send_eof(channel)).await.is_none() {
                    return close_on_stop(channel).await;
                }
            }
            event = channel.next_event() => match event {
                Some(ChannelEvent::Stdout(data)) => {
                    match or_stop(&mut stop, stdout.send(data)).await {
                        None => return close_on_stop(channel).await,
                        Some(Err(_)) => trace!("channel driver: output pump already gone"),
                        Some(Ok(())) => {}
                    }
                }
                Some(ChannelEvent::Stderr(data)) => {
                    match or_stop(&mut stop, stderr.send(data)).await {
                        None => return close_on_stop(channel).await,
                        Some(Err(_)) => trace!("channel driver: stderr writer already gone"),
                        Some(Ok(())) => {}
                    }
                }
                Some(ChannelEvent::ExitStatus(status)) => {
                    debug!("channel driver: exit status {}", status);
                    exit_status = Some(status);
                }
                Some(ChannelEvent::Eof) => trace!("channel driver: remote EOF"),
                Some(ChannelEvent::Closed) | None => break,
            },
        }
    }

    match exit_status {
        Some(status) => DriveOutcome::Exited(status),
        None => DriveOutcome::Closed,
    }
}

/// Await `op` unless a stop arrives first, in which case `None`.
///
/// Every send in the loop goes through here: a full output queue or a
/// remote that stopped reading must not keep a stop from closing the channel.
async fn or_stop<T>(stop: &mut watch::Receiver<bool>, op: impl Future<Output = T>) -> Option<T> {
    tokio::select! {
        biased;
        _ = stop_requested(stop) => None,
        out = op => Some(out),
    }
}

async fn close_on_stop(channel: &mut dyn ExecChannel) -> DriveOutcome {
    debug!("channel driver: stop requested, closing channel");
    if let Err(e) = channel.close().await {
        debug!("channel driver: close failed: {}", e);
    }
    DriveOutcome::Stopped
}

async fn send_eof(channel: &mut dyn ExecChannel) {
    trace!("channel driver: sending EOF");
    if let Err(e) = channel.send_eof().await {
        debug!("channel driver: EOF failed: {}", e);
    }
}
