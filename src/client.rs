//! High-level client for remote engine sessions.
//!
//! [`Client`] resolves connection parameters once (through platform
//! discovery or as given), pushes a local engine config when the command
//! references one, and runs engine commands on fresh controllers.

use std::io;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::codec::OutputMode;
use crate::command::{
    query_server_command, EngineCommand, RouteOptions, PRELOAD_COMMAND, VIEW_CONFIG_COMMAND,
};
use crate::discovery::Discovery;
use crate::error::KataTunnelError;
use crate::session::{
    CaptureBuffer, ControllerConfig, OnReady, RemoteSessionController, RunOutcome, SessionState,
    Stdio,
};
use crate::transport::{ConnectionParameters, Transport};
use crate::Result;

/// Who to log in as, and where to look the account up.
#[derive(Debug, Clone)]
pub struct Account {
    /// Platform name in the world document.
    pub platform: String,
    /// Account name.
    pub username: String,
    /// Account password.
    pub password: String,
}

enum Target {
    Discover { discovery: Discovery, account: Account },
    Fixed,
}

/// Entry point for running engines on a remote platform.
pub struct Client {
    transport: Arc<dyn Transport>,
    config: ControllerConfig,
    route: RouteOptions,
    target: Target,
    params: OnceCell<ConnectionParameters>,
}

impl Client {
    /// Create a client that discovers its server through `discovery`.
    pub fn new(
        transport: Arc<dyn Transport>,
        config: ControllerConfig,
        discovery: Discovery,
        account: Account,
    ) -> Self {
        Self {
            transport,
            config,
            route: RouteOptions::default(),
            target: Target::Discover { discovery, account },
            params: OnceCell::new(),
        }
    }

    /// Create a client for a known server.
    pub fn with_parameters(
        transport: Arc<dyn Transport>,
        config: ControllerConfig,
        params: ConnectionParameters,
    ) -> Self {
        Self {
            transport,
            config,
            route: RouteOptions::default(),
            target: Target::Fixed,
            params: OnceCell::new_with(Some(params)),
        }
    }

    /// Set routing options applied to every request.
    pub fn with_route(mut self, route: RouteOptions) -> Self {
        self.route = route;
        self
    }

    /// Routing options in use.
    pub fn route(&self) -> &RouteOptions {
        &self.route
    }

    /// Connection parameters, discovering them on first use.
    pub async fn parameters(&self) -> Result<&ConnectionParameters> {
        self.params
            .get_or_try_init(|| async {
                match &self.target {
                    Target::Discover { discovery, account } => {
                        discovery
                            .discover(&account.platform, &account.username, &account.password)
                            .await
                    }
                    Target::Fixed => Err(KataTunnelError::Config(
                        "no connection parameters configured".into(),
                    )),
                }
            })
            .await
    }

    /// Start the engine described by `command`.
    ///
    /// A referenced local config is pushed first; failures there are
    /// returned before the engine starts. The session runs on a background
    /// task; use the returned handle to stop or await it.
    pub async fn run_katago(
        &self,
        command: EngineCommand,
        stdio: Stdio,
        on_ready: Option<OnReady>,
    ) -> Result<SessionHandle> {
        self.start(command, stdio, on_ready).await
    }

    /// Like [`run_katago`](Self::run_katago) with the preload wrapper.
    pub async fn preload_katago(
        &self,
        command: EngineCommand,
        stdio: Stdio,
        on_ready: Option<OnReady>,
    ) -> Result<SessionHandle> {
        let command = EngineCommand {
            program: PRELOAD_COMMAND.to_string(),
            ..command
        };
        self.start(command, stdio, on_ready).await
    }

    /// Print the effective engine configuration and return it.
    pub async fn view_config(&self, command: EngineCommand) -> Result<Vec<u8>> {
        let command = EngineCommand {
            program: VIEW_CONFIG_COMMAND.to_string(),
            ..command
        };
        let params = self.parameters().await?;
        self.push_local_config(params, &command).await?;
        let line = self.render(command);
        self.collect(params, &line).await
    }

    /// Ask the server about node availability.
    pub async fn query_server(&self) -> Result<Vec<u8>> {
        let params = self.parameters().await?;
        self.collect(params, &query_server_command(&self.route))
            .await
    }

    async fn start(
        &self,
        command: EngineCommand,
        stdio: Stdio,
        on_ready: Option<OnReady>,
    ) -> Result<SessionHandle> {
        let params = self.parameters().await?.clone();
        self.push_local_config(&params, &command).await?;

        let line = self.render(command);
        let controller = Arc::new(RemoteSessionController::new(
            Arc::clone(&self.transport),
            self.config.clone(),
        ));
        let runner = Arc::clone(&controller);
        info!("starting {}", line.split(' ').next().unwrap_or_default());
        let task =
            tokio::spawn(async move { runner.run_command(&params, &line, stdio, on_ready).await });
        Ok(SessionHandle { controller, task })
    }

    async fn push_local_config(
        &self,
        params: &ConnectionParameters,
        command: &EngineCommand,
    ) -> Result<()> {
        let Some(path) = command.local_config.as_deref() else {
            return Ok(());
        };
        debug!("pushing local config {}", path.display());
        let controller = RemoteSessionController::new(Arc::clone(&self.transport), self.config.clone());
        match controller
            .transfer_file(params, path, &self.route.render())
            .await?
        {
            RunOutcome::Completed => Ok(()),
            RunOutcome::Stopped => Err(KataTunnelError::ChannelClosed),
        }
    }

    /// Apply client routing unless the command carries its own.
    fn render(&self, mut command: EngineCommand) -> String {
        if command.route.is_empty() {
            command.route = self.route.clone();
        }
        command.render()
    }

    /// Run a one-shot command and collect its stdout undecoded.
    async fn collect(&self, params: &ConnectionParameters, line: &str) -> Result<Vec<u8>> {
        let config = ControllerConfig {
            output_mode: OutputMode::Raw,
            ..self.config.clone()
        };
        let controller = RemoteSessionController::new(Arc::clone(&self.transport), config);
        let stdout = CaptureBuffer::new();
        let stderr = CaptureBuffer::new();
        let stdio = Stdio::new(io::empty(), stdout.clone(), stderr.clone());

        let result = controller.run_command(params, line, stdio, None).await;
        let diagnostics = stderr.to_string_lossy();
        if !diagnostics.trim().is_empty() {
            debug!("remote stderr: {}", diagnostics.trim_end());
        }
        result.map(|_| stdout.contents())
    }
}

/// A running engine session.
pub struct SessionHandle {
    controller: Arc<RemoteSessionController>,
    task: JoinHandle<Result<RunOutcome>>,
}

impl SessionHandle {
    /// Ask the session to stop. Returns immediately.
    pub fn stop(&self) {
        self.controller.stop();
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.controller.state()
    }

    /// A controller handle usable from other tasks, e.g. a signal handler.
    pub fn controller(&self) -> Arc<RemoteSessionController> {
        Arc::clone(&self.controller)
    }

    /// Wait for the session to end.
    pub async fn wait(self) -> Result<RunOutcome> {
        self.task.await.map_err(|e| {
            KataTunnelError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("session task failed: {}", e),
            ))
        })?
    }
}
