//! Lifecycle of remote command sessions.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::driver::{drive, stop_requested, ChannelIo, DriveOutcome};
use super::io::{ChannelReader, InputForwarder, OutputForwarder, OutputPump, Stdio};
use super::transfer::TransferLimits;
use super::{SessionId, SessionState};
use crate::codec::OutputMode;
use crate::error::KataTunnelError;
use crate::transport::{Connection, ConnectionParameters, ExecChannel, Transport};
use crate::Result;

/// Default bound on connection establishment.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for the output tasks after the channel closes.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shorter wait used once a stop was requested; output still queued for a
/// slow sink is abandoned.
const STOP_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Chunks buffered between the channel driver and the stdio adapters.
const QUEUE_DEPTH: usize = 64;

/// Callback invoked once stdio is wired, right before the command starts.
pub type OnReady = Box<dyn FnOnce() + Send>;

/// Settings threaded into a controller at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Bound on dialing and authenticating.
    pub connect_timeout: Duration,
    /// Whether stdout is decoded or passed through.
    pub output_mode: OutputMode,
    /// File push limits.
    pub transfer: TransferLimits,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            output_mode: OutputMode::Framed,
            transfer: TransferLimits::default(),
        }
    }
}

/// Successful ends of a run or transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The remote command exited with status 0.
    Completed,
    /// A stop request arrived before the command was started.
    Stopped,
}

/// Bookkeeping for the current session.
struct SessionSlot {
    id: SessionId,
    state: SessionState,
    stopped: bool,
    stop_tx: watch::Sender<bool>,
}

impl SessionSlot {
    fn request_stop(&mut self) -> bool {
        if self.stopped || !self.state.is_active() {
            return false;
        }
        self.stopped = true;
        // Receivers may already be gone if the session is winding down.
        let _ = self.stop_tx.send(true);
        true
    }
}

/// A connected command channel and the connection carrying it.
struct Established {
    connection: Box<dyn Connection>,
    channel: Box<dyn ExecChannel>,
}

impl Established {
    async fn shutdown(mut self) {
        if let Err(e) = self.channel.close().await {
            debug!("closing channel failed: {}", e);
        }
        if let Err(e) = self.connection.disconnect().await {
            debug!("disconnect failed: {}", e);
        }
    }
}

/// Owns one remote command-execution session at a time.
///
/// `run_command` and `transfer_file` take `&self`, so a controller shared
/// through an `Arc` can be stopped from another task while a run is in
/// flight. Starting a new operation stops and replaces the previous session.
pub struct RemoteSessionController {
    transport: Arc<dyn Transport>,
    config: ControllerConfig,
    slot: Mutex<Option<SessionSlot>>,
}

impl RemoteSessionController {
    /// Create a controller over `transport`.
    pub fn new(transport: Arc<dyn Transport>, config: ControllerConfig) -> Self {
        Self {
            transport,
            config,
            slot: Mutex::new(None),
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// State of the current session, `Idle` before the first one.
    pub fn state(&self) -> SessionState {
        self.lock_slot()
            .as_ref()
            .map(|slot| slot.state)
            .unwrap_or_default()
    }

    /// Run `command_line` remotely with the given stdio.
    ///
    /// Stdout is decoded per the configured [`OutputMode`] by a background
    /// pump; stderr and stdin are forwarded as is. `on_ready` fires after the
    /// plumbing is in place and before the command is issued.
    ///
    /// Returns `Ok(RunOutcome::Completed)` on exit status 0, and
    /// `Ok(RunOutcome::Stopped)` when a stop request arrives before the
    /// command starts. A non-zero status is [`KataTunnelError::CommandFailed`];
    /// a channel that closes without a status, including one closed by
    /// [`stop`](Self::stop), is [`KataTunnelError::ChannelClosed`].
    pub async fn run_command(
        &self,
        params: &ConnectionParameters,
        command_line: &str,
        stdio: Stdio,
        on_ready: Option<OnReady>,
    ) -> Result<RunOutcome> {
        let (id, mut stop_rx) = self.begin()?;

        let Some(mut session) = self.establish(id, params, &mut stop_rx).await? else {
            return Ok(RunOutcome::Stopped);
        };

        let Stdio {
            stdin,
            stdout,
            stderr,
        } = stdio;
        let (stdin_tx, stdin_rx) = mpsc::channel(QUEUE_DEPTH);
        let (stdout_tx, stdout_rx) = mpsc::channel(QUEUE_DEPTH);
        let (stderr_tx, stderr_rx) = mpsc::channel(QUEUE_DEPTH);

        if let Err(e) = InputForwarder::new(stdin, stdin_tx).spawn() {
            self.finish(id, SessionState::Failed);
            session.shutdown().await;
            return Err(e.into());
        }
        let stderr_task = OutputForwarder::new(stderr, stderr_rx).spawn();
        let pump = OutputPump::new(ChannelReader::new(stdout_rx), self.config.output_mode)
            .spawn(stdout);

        if let Some(on_ready) = on_ready {
            on_ready();
        }

        debug!(
            "{}: running equal command: ssh -p {} {}@{} {}",
            id, params.port, params.user, params.host, command_line
        );
        let io = ChannelIo {
            stdin: stdin_rx,
            stdout: stdout_tx,
            stderr: stderr_tx,
            eof_delay: None,
        };
        let outcome = self.execute(&mut session, command_line, io, stop_rx).await;
        session.shutdown().await;
        let grace = self.drain_timeout(id);
        drain(id, "output pump", pump, grace).await;
        drain(id, "stderr writer", stderr_task, grace).await;

        self.conclude(id, outcome)
    }

    /// Push a local file to the remote side.
    ///
    /// The file is validated against the configured [`TransferLimits`]
    /// before any connection is made. Its bytes are then written to the
    /// input of the companion command (`<command> <basename><route>`), and
    /// end-of-input follows after the configured close delay. Remote output
    /// is logged.
    pub async fn transfer_file(
        &self,
        params: &ConnectionParameters,
        local_path: &Path,
        route: &str,
    ) -> Result<RunOutcome> {
        let limits = &self.config.transfer;
        let file = limits.validate(local_path).map_err(|e| {
            error!("refusing to transfer {}: {}", local_path.display(), e);
            KataTunnelError::from(e)
        })?;
        let contents = tokio::fs::read(&file.path).await?;

        let (id, mut stop_rx) = self.begin()?;
        let Some(mut session) = self.establish(id, params, &mut stop_rx).await? else {
            return Ok(RunOutcome::Stopped);
        };

        let (stdin_tx, stdin_rx) = mpsc::channel(1);
        let (stdout_tx, stdout_rx) = mpsc::channel(QUEUE_DEPTH);
        let (stderr_tx, stderr_rx) = mpsc::channel(QUEUE_DEPTH);
        // Dropping the sender after the single chunk marks the end of input.
        if stdin_tx.send(contents).await.is_err() {
            warn!("{}: input queue closed before the file was queued", id);
        }
        drop(stdin_tx);
        let stdout_log = tokio::spawn(log_remote_output(id, "stdout", stdout_rx));
        let stderr_log = tokio::spawn(log_remote_output(id, "stderr", stderr_rx));

        let command = limits.companion_command(&file.name, route);
        info!("{}: pushing {} ({} bytes)", id, file.name, file.size);
        let io = ChannelIo {
            stdin: stdin_rx,
            stdout: stdout_tx,
            stderr: stderr_tx,
            eof_delay: Some(limits.close_delay),
        };
        let outcome = self.execute(&mut session, &command, io, stop_rx).await;
        session.shutdown().await;
        let grace = self.drain_timeout(id);
        drain(id, "stdout log", stdout_log, grace).await;
        drain(id, "stderr log", stderr_log, grace).await;

        self.conclude(id, outcome)
    }

    /// Request cancellation of the current session.
    ///
    /// Closes the open channel, if any, which makes the in-flight run return
    /// and ends its output pump. Safe to call from any task, repeatedly, or
    /// when nothing is running.
    pub fn stop(&self) {
        let mut slot = self.lock_slot();
        if let Some(slot) = slot.as_mut() {
            if slot.request_stop() {
                info!("{}: stop requested", slot.id);
            }
        }
    }

    /// Install a fresh session, stopping whatever ran before.
    fn begin(&self) -> Result<(SessionId, watch::Receiver<bool>)> {
        let mut slot = self.lock_slot();
        if let Some(previous) = slot.as_mut() {
            if previous.request_stop() {
                info!("{}: replaced by a new session", previous.id);
            }
        }

        let id = SessionId::next();
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut state = SessionState::Idle;
        state.transition_to(SessionState::Connecting)?;
        *slot = Some(SessionSlot {
            id,
            state,
            stopped: false,
            stop_tx,
        });
        debug!("{}: connecting", id);
        Ok((id, stop_rx))
    }

    /// Dial and open a channel. `Ok(None)` means a stop arrived first.
    async fn establish(
        &self,
        id: SessionId,
        params: &ConnectionParameters,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> Result<Option<Established>> {
        let connection = tokio::select! {
            result = self.transport.connect(params, self.config.connect_timeout) => match result {
                Ok(connection) => connection,
                Err(e) => {
                    error!("{}: cannot connect to {}: {}", id, params.address(), e);
                    self.finish(id, SessionState::Failed);
                    return Err(e);
                }
            },
            _ = stop_requested(stop_rx) => {
                self.finish(id, SessionState::Stopped);
                return Ok(None);
            }
        };

        let opened = tokio::select! {
            result = connection.open_channel() => Some(result),
            _ = stop_requested(stop_rx) => None,
        };
        let channel = match opened {
            Some(Ok(channel)) => channel,
            Some(Err(e)) => {
                error!("{}: cannot open command channel: {}", id, e);
                self.finish(id, SessionState::Failed);
                if let Err(e) = connection.disconnect().await {
                    debug!("{}: disconnect failed: {}", id, e);
                }
                return Err(e);
            }
            None => {
                if let Err(e) = connection.disconnect().await {
                    debug!("{}: disconnect failed: {}", id, e);
                }
                self.finish(id, SessionState::Stopped);
                return Ok(None);
            }
        };

        let session = Established {
            connection,
            channel,
        };
        if !self.enter_running(id) {
            debug!("{}: stopped before the command started", id);
            session.shutdown().await;
            self.finish(id, SessionState::Stopped);
            return Ok(None);
        }
        Ok(Some(session))
    }

    /// Move session `id` to `Running` unless a stop got there first.
    fn enter_running(&self, id: SessionId) -> bool {
        let mut slot = self.lock_slot();
        match slot.as_mut().filter(|slot| slot.id == id) {
            Some(slot) if !slot.stopped => slot.state.transition_to(SessionState::Running).is_ok(),
            _ => false,
        }
    }

    /// Issue the command and drive the channel until it closes.
    async fn execute(
        &self,
        session: &mut Established,
        command: &str,
        io: ChannelIo,
        stop_rx: watch::Receiver<bool>,
    ) -> Result<DriveOutcome> {
        session.channel.exec(command).await?;
        Ok(drive(session.channel.as_mut(), io, stop_rx).await)
    }

    /// Record the final state and map the outcome to the caller's result.
    fn conclude(&self, id: SessionId, outcome: Result<DriveOutcome>) -> Result<RunOutcome> {
        let stopped = self.is_stop_requested(id);
        let result = match outcome {
            _ if stopped => Err(KataTunnelError::ChannelClosed),
            Ok(DriveOutcome::Exited(0)) => Ok(RunOutcome::Completed),
            Ok(DriveOutcome::Exited(exit_status)) => {
                Err(KataTunnelError::CommandFailed { exit_status })
            }
            Ok(DriveOutcome::Closed) | Ok(DriveOutcome::Stopped) => {
                Err(KataTunnelError::ChannelClosed)
            }
            Err(e) => Err(e),
        };

        let state = match (&result, stopped) {
            (_, true) => SessionState::Stopped,
            (Ok(_), false) => SessionState::Completed,
            (Err(_), false) => SessionState::Failed,
        };
        self.finish(id, state);
        match &result {
            Ok(_) => info!("{}: command completed", id),
            Err(e) => info!("{}: session ended: {}", id, e),
        }
        result
    }

    fn drain_timeout(&self, id: SessionId) -> Duration {
        if self.is_stop_requested(id) {
            STOP_DRAIN_TIMEOUT
        } else {
            DRAIN_TIMEOUT
        }
    }

    fn is_stop_requested(&self, id: SessionId) -> bool {
        self.lock_slot()
            .as_ref()
            .map(|slot| slot.id == id && slot.stopped)
            .unwrap_or(false)
    }

    /// Move session `id` to a terminal state; a pending stop takes precedence.
    fn finish(&self, id: SessionId, state: SessionState) {
        let mut slot = self.lock_slot();
        if let Some(slot) = slot.as_mut().filter(|slot| slot.id == id) {
            let target = if slot.stopped {
                SessionState::Stopped
            } else {
                state
            };
            if slot.state.transition_to(target).is_err() {
                debug!("{}: ignoring transition {:?} -> {:?}", id, slot.state, target);
            }
        }
    }

    /// The slot only holds plain bookkeeping, so a guard poisoned by a
    /// panicking holder is still usable.
    fn lock_slot(&self) -> MutexGuard<'_, Option<SessionSlot>> {
        match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for RemoteSessionController {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Wait for a helper task bound to the session, without letting a stuck
/// sink hold the caller forever.
async fn drain(id: SessionId, what: &str, task: JoinHandle<()>, grace: Duration) {
    match tokio::time::timeout(grace, task).await {
        Ok(Ok(())) => debug!("{}: {} finished", id, what),
        Ok(Err(e)) => error!("{}: {} task failed: {}", id, what, e),
        Err(_) => warn!("{}: {} still busy after channel close", id, what),
    }
}

async fn log_remote_output(id: SessionId, stream: &'static str, mut rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(chunk) = rx.recv().await {
        let text = String::from_utf8_lossy(&chunk);
        for line in text.lines().filter(|line| !line.trim().is_empty()) {
            info!("{}: remote {}: {}", id, stream, line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FrameEncoder;
    use crate::session::CaptureBuffer;
    use crate::transport::MemoryTransport;
    use std::io::{Cursor, Write};
    use std::time::Instant;
    use tempfile::TempDir;

    fn params() -> ConnectionParameters {
        ConnectionParameters::new("memory", 22, "kata", "pw")
    }

    fn controller(transport: MemoryTransport) -> Arc<RemoteSessionController> {
        Arc::new(RemoteSessionController::new(
            Arc::new(transport),
            ControllerConfig::default(),
        ))
    }

    fn captured_stdio(input: &[u8]) -> (Stdio, CaptureBuffer, CaptureBuffer) {
        let stdout = CaptureBuffer::new();
        let stderr = CaptureBuffer::new();
        let stdio = Stdio::new(Cursor::new(input.to_vec()), stdout.clone(), stderr.clone());
        (stdio, stdout, stderr)
    }

    #[test]
    fn test_stop_without_session() {
        let controller = controller(MemoryTransport::new(|_remote| async {}));
        controller.stop();
        controller.stop();
        assert_eq!(controller.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_run_decodes_output() {
        let transport = MemoryTransport::new(|mut remote| async move {
            let input = remote.read_stdin_to_end().await;
            let mut reply = b"= ".to_vec();
            reply.extend(FrameEncoder::new(0).encode(&input).unwrap());
            remote.stdout(reply).await;
            remote.stderr("KataGo loaded\n").await;
            remote.exit(0).await;
        });
        let controller = controller(transport);
        let (stdio, stdout, stderr) = captured_stdio(b"name\n");

        let outcome = controller
            .run_command(&params(), "run-katago", stdio, None)
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(stdout.contents(), b"= name\n");
        assert_eq!(stderr.contents(), b"KataGo loaded\n");
        assert_eq!(controller.state(), SessionState::Completed);
    }

    #[tokio::test]
    async fn test_raw_mode_passes_bytes_through() {
        let transport = MemoryTransport::new(|remote| async move {
            remote.stdout(vec![b'a', 0xFF, b'b']).await;
            remote.exit(0).await;
        });
        let config = ControllerConfig {
            output_mode: OutputMode::Raw,
            ..ControllerConfig::default()
        };
        let controller = RemoteSessionController::new(Arc::new(transport), config);
        let (stdio, stdout, _stderr) = captured_stdio(b"");

        controller
            .run_command(&params(), "cat", stdio, None)
            .await
            .unwrap();
        assert_eq!(stdout.contents(), vec![b'a', 0xFF, b'b']);
    }

    #[tokio::test]
    async fn test_on_ready_runs_before_command() {
        let transport = MemoryTransport::new(|remote| async move {
            remote.exit(0).await;
        });
        let controller = controller(transport);
        let (stdio, _stdout, _stderr) = captured_stdio(b"");
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&fired);

        controller
            .run_command(
                &params(),
                "true",
                stdio,
                Some(Box::new(move || {
                    flag.store(true, std::sync::atomic::Ordering::SeqCst)
                })),
            )
            .await
            .unwrap();
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_non_zero_exit() {
        let transport = MemoryTransport::new(|remote| async move {
            remote.stderr("no such engine\n").await;
            remote.exit(2).await;
        });
        let controller = controller(transport);
        let (stdio, _stdout, stderr) = captured_stdio(b"");

        let err = controller
            .run_command(&params(), "run-katago --name nope", stdio, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            KataTunnelError::CommandFailed { exit_status: 2 }
        ));
        assert_eq!(stderr.contents(), b"no such engine\n");
        assert_eq!(controller.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_closed_without_status() {
        let transport = MemoryTransport::new(|remote| async move {
            remote.close().await;
        });
        let controller = controller(transport);
        let (stdio, _stdout, _stderr) = captured_stdio(b"");

        let err = controller
            .run_command(&params(), "run-katago", stdio, None)
            .await
            .unwrap_err();
        assert!(matches!(err, KataTunnelError::ChannelClosed));
        assert_eq!(controller.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let transport = MemoryTransport::new(|_remote| async {}).failing_connect("refused");
        let controller = controller(transport);
        let (stdio, _stdout, _stderr) = captured_stdio(b"");

        let err = controller
            .run_command(&params(), "run-katago", stdio, None)
            .await
            .unwrap_err();
        assert!(matches!(err, KataTunnelError::Connection(_)));
        assert_eq!(controller.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_channel_failure() {
        let transport = MemoryTransport::new(|_remote| async {}).failing_channel("denied");
        let controller = controller(transport);
        let (stdio, _stdout, _stderr) = captured_stdio(b"");

        let err = controller
            .run_command(&params(), "run-katago", stdio, None)
            .await
            .unwrap_err();
        assert!(matches!(err, KataTunnelError::Channel(_)));
        assert_eq!(controller.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn test_stop_during_run() {
        let transport = MemoryTransport::new(|remote| async move {
            remote.stdout("= \n").await;
            remote.closed().await;
        });
        let controller = controller(transport);
        let (stdio, stdout, _stderr) = captured_stdio(b"");

        let runner = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move {
                controller
                    .run_command(&params(), "run-katago", stdio, None)
                    .await
            })
        };
        while controller.state() != SessionState::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = Instant::now();
        controller.stop();
        let result = tokio::time::timeout(Duration::from_secs(2), runner)
            .await
            .unwrap()
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(matches!(result, Err(KataTunnelError::ChannelClosed)));
        assert_eq!(controller.state(), SessionState::Stopped);
        assert_eq!(stdout.contents(), b"= \n");

        controller.stop();
        assert_eq!(controller.state(), SessionState::Stopped);
    }

    /// Sink whose writes block until the gate is released.
    struct GatedWriter(std::sync::mpsc::Receiver<()>);

    impl Write for GatedWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let _ = self.0.recv();
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stop_with_stuck_stdout_sink() {
        let transport = MemoryTransport::new(|remote| async move {
            while remote.stdout(vec![b'x'; 100]).await {}
        });
        let controller = controller(transport);
        let (gate, gated) = std::sync::mpsc::channel::<()>();
        let stdio = Stdio::new(Cursor::new(Vec::new()), GatedWriter(gated), std::io::sink());

        let runner = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move {
                controller
                    .run_command(&params(), "run-katago --raw", stdio, None)
                    .await
            })
        };
        while controller.state() != SessionState::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // Let the output queue fill up behind the blocked sink.
        tokio::time::sleep(Duration::from_millis(50)).await;

        controller.stop();
        let result = tokio::time::timeout(Duration::from_secs(2), runner)
            .await
            .expect("run did not return after stop")
            .unwrap();
        assert!(matches!(result, Err(KataTunnelError::ChannelClosed)));
        assert_eq!(controller.state(), SessionState::Stopped);

        drop(gate);
    }

    #[tokio::test]
    async fn test_poisoned_slot_is_recovered() {
        let transport = MemoryTransport::new(|remote| async move {
            remote.exit(0).await;
        });
        let controller = controller(transport);
        let poisoner = Arc::clone(&controller);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.slot.lock().unwrap();
            panic!("poison the session slot");
        })
        .join();
        assert!(controller.slot.is_poisoned());

        controller.stop();
        let (stdio, _stdout, _stderr) = captured_stdio(b"");
        let outcome = controller
            .run_command(&params(), "run-katago", stdio, None)
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(controller.state(), SessionState::Completed);
    }

    #[tokio::test]
    async fn test_stop_while_connecting() {
        let transport =
            MemoryTransport::new(|_remote| async {}).connect_delay(Duration::from_secs(10));
        let controller = controller(transport);
        let (stdio, _stdout, _stderr) = captured_stdio(b"");

        let runner = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move {
                controller
                    .run_command(&params(), "run-katago", stdio, None)
                    .await
            })
        };
        while controller.state() != SessionState::Connecting {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        controller.stop();

        let result = tokio::time::timeout(Duration::from_secs(2), runner)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap(), RunOutcome::Stopped);
        assert_eq!(controller.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_new_run_replaces_previous_session() {
        let transport = MemoryTransport::new(|remote| async move {
            if remote.command == "first" {
                remote.closed().await;
            } else {
                remote.exit(0).await;
            }
        });
        let controller = controller(transport);

        let (stdio, _stdout, _stderr) = captured_stdio(b"");
        let first = {
            let controller = Arc::clone(&controller);
            tokio::spawn(async move { controller.run_command(&params(), "first", stdio, None).await })
        };
        while controller.state() != SessionState::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let (stdio, _stdout, _stderr) = captured_stdio(b"");
        let second = controller
            .run_command(&params(), "second", stdio, None)
            .await
            .unwrap();
        assert_eq!(second, RunOutcome::Completed);

        let first = tokio::time::timeout(Duration::from_secs(2), first)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first, Err(KataTunnelError::ChannelClosed)));
        assert_eq!(controller.state(), SessionState::Completed);
    }

    #[tokio::test]
    async fn test_transfer_file() {
        let transport = MemoryTransport::new(|mut remote| async move {
            let body = remote.read_stdin_to_end().await;
            remote
                .stdout(format!("{} {}\n", remote.command, body.len()))
                .await;
            remote.exit(0).await;
        });
        let mut config = ControllerConfig::default();
        config.transfer.close_delay = Duration::from_millis(10);
        let controller = RemoteSessionController::new(Arc::new(transport), config);
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gtp_custom.cfg");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"maxVisits = 500\n")
            .unwrap();

        let outcome = controller
            .transfer_file(&params(), &path, " --gpu-type 1x")
            .await
            .unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(controller.state(), SessionState::Completed);
    }

    #[tokio::test]
    async fn test_transfer_rejects_before_connecting() {
        let transport = MemoryTransport::new(|_remote| async {});
        let tracker = transport.clone();
        let controller = controller(transport);
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("huge.cfg");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&vec![b'#'; 200 * 1024])
            .unwrap();

        let err = controller
            .transfer_file(&params(), &path, "")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            KataTunnelError::FileValidation(crate::error::FileValidationError::TooLarge { .. })
        ));
        assert_eq!(tracker.connect_count(), 0);
        assert_eq!(controller.state(), SessionState::Idle);
    }
}
