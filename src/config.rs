//! Configuration management for kata-tunnel.
//!
//! Configuration is loaded with the following priority (highest to lowest):
//! 1. Command-line arguments
//! 2. Environment variables
//! 3. Configuration file (JSON)
//! 4. Default values

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cli::Args;
use crate::client::Account;
use crate::codec::OutputMode;
use crate::command::{
    EngineCommand, RouteOptions, DEFAULT_ENGINE_COMMAND, DEFAULT_REFRESH_INTERVAL,
    DEFAULT_TRANSMIT_MOVE_NUM,
};
use crate::discovery::DEFAULT_REQUEST_TIMEOUT;
use crate::error::KataTunnelError;
use crate::session::{
    ControllerConfig, TransferLimits, DEFAULT_CLOSE_DELAY, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_MAX_FILE_SIZE, DEFAULT_TRANSFER_COMMAND,
};
use crate::transport::SshTransport;

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where to discover servers.
    pub world: WorldSection,
    /// Account used to log in.
    pub account: AccountSection,
    /// Transport settings.
    pub connection: ConnectionSection,
    /// Config file pushes.
    pub transfer: TransferSection,
    /// Engine invocation.
    pub engine: EngineSection,
    /// Logging configuration.
    pub logging: LoggingSection,
}

/// Discovery configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldSection {
    /// World document URL. Has no default.
    pub url: Option<String>,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for WorldSection {
    fn default() -> Self {
        Self {
            url: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT.as_secs(),
        }
    }
}

/// Account configuration section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountSection {
    /// Platform name in the world document.
    pub platform: Option<String>,
    /// Account name.
    pub username: Option<String>,
    /// Account password.
    #[serde(skip_serializing)]
    pub password: Option<String>,
}

/// Connection configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSection {
    /// Bound on dialing and authenticating, in seconds.
    pub connect_timeout_secs: u64,
    /// SSH keepalive interval in seconds; unset or 0 disables keepalives.
    pub keepalive_secs: Option<u64>,
}

impl Default for ConnectionSection {
    fn default() -> Self {
        Self {
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT.as_secs(),
            keepalive_secs: None,
        }
    }
}

/// Transfer configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferSection {
    /// Files at or above this many bytes are refused.
    pub max_file_size: u64,
    /// Accepted file name suffixes.
    pub extensions: Vec<String>,
    /// Delay before end-of-input, in milliseconds.
    pub close_delay_ms: u64,
    /// Remote companion command.
    pub command: String,
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            extensions: vec![".cfg".to_string()],
            close_delay_ms: DEFAULT_CLOSE_DELAY.as_millis() as u64,
            command: DEFAULT_TRANSFER_COMMAND.to_string(),
        }
    }
}

/// Engine configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Remote wrapper command.
    pub command: String,
    /// Ask the server to compress output.
    pub compress: bool,
    /// Pass output through without decoding.
    pub raw_output: bool,
    /// Refresh interval, in centiseconds.
    pub refresh_interval: u32,
    /// Cap on moves sent per analysis update.
    pub transmit_move_num: u32,
    /// Engine binary name.
    pub name: Option<String>,
    /// Weight name.
    pub weight: Option<String>,
    /// Server-side engine config name.
    pub config: Option<String>,
    /// Local engine config pushed before each run.
    pub local_config: Option<PathBuf>,
    /// Engine override config.
    pub override_config: Option<String>,
    /// Free-form information for the server.
    pub extra_info: Option<String>,
    /// Client identifier.
    pub client_id: Option<String>,
    /// Node routing options.
    pub route: RouteOptions,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            command: DEFAULT_ENGINE_COMMAND.to_string(),
            compress: true,
            raw_output: false,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            transmit_move_num: DEFAULT_TRANSMIT_MOVE_NUM,
            name: None,
            weight: None,
            config: None,
            local_config: None,
            override_config: None,
            extra_info: None,
            client_id: None,
            route: RouteOptions::default(),
        }
    }
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level (error, warn, info, debug, trace) or a full filter.
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_env_from<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = var("KATA_TUNNEL_WORLD").filter(|v| !v.is_empty()) {
            self.world.url = Some(url);
        }

        if let Some(secs) = var("KATA_TUNNEL_CONNECT_TIMEOUT").and_then(|v| v.parse().ok()) {
            self.connection.connect_timeout_secs = secs;
        }

        if let Some(secs) = var("KATA_TUNNEL_KEEPALIVE").and_then(|v| v.parse().ok()) {
            self.connection.keepalive_secs = Some(secs);
        }

        if let Some(level) = var("KATA_TUNNEL_LOG_LEVEL") {
            self.logging.level = level;
        } else if let Some(level) = var("RUST_LOG") {
            self.logging.level = level;
        }
    }

    /// Apply CLI argument overrides.
    pub fn apply_args(&mut self, args: &Args) {
        override_with(&mut self.world.url, &args.world);
        override_with(&mut self.account.platform, &args.platform);
        override_with(&mut self.account.username, &args.username);
        override_with(&mut self.account.password, &args.password);

        let engine = &mut self.engine;
        if let Some(ref cmd) = args.cmd {
            engine.command = cmd.clone();
        }
        if args.no_compress {
            engine.compress = false;
        }
        if args.raw {
            engine.raw_output = true;
        }
        if let Some(value) = args.refresh_interval {
            engine.refresh_interval = value;
        }
        if let Some(value) = args.transmit_move_num {
            engine.transmit_move_num = value;
        }
        override_with(&mut engine.name, &args.kata_name);
        override_with(&mut engine.weight, &args.kata_weight);
        override_with(&mut engine.config, &args.kata_config);
        override_with(&mut engine.local_config, &args.kata_local_config);
        override_with(&mut engine.override_config, &args.kata_override_config);
        override_with(&mut engine.extra_info, &args.extra_info);
        override_with(&mut engine.client_id, &args.client_id);
        override_with(&mut engine.route.engine_type, &args.engine_type);
        override_with(&mut engine.route.gpu_type, &args.gpu_type);
        override_with(&mut engine.route.force_node, &args.force_node);
        override_with(&mut engine.route.token, &args.token);

        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }
    }

    /// Load configuration with full priority chain.
    ///
    /// Priority: CLI args > env vars > config file > defaults
    pub fn load(args: &Args) -> Result<Self, ConfigError> {
        let mut config = match args.config {
            Some(ref path) => Config::from_file(path)?,
            None => Config::default(),
        };
        config.apply_env();
        config.apply_args(args);
        Ok(config)
    }

    /// Controller settings derived from this configuration.
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            connect_timeout: Duration::from_secs(self.connection.connect_timeout_secs),
            output_mode: if self.engine.raw_output {
                OutputMode::Raw
            } else {
                OutputMode::Framed
            },
            transfer: TransferLimits {
                max_size: self.transfer.max_file_size,
                extensions: self.transfer.extensions.clone(),
                close_delay: Duration::from_millis(self.transfer.close_delay_ms),
                command: self.transfer.command.clone(),
            },
        }
    }

    /// SSH transport configured from the connection section.
    pub fn ssh_transport(&self) -> SshTransport {
        match self.connection.keepalive_secs.filter(|&secs| secs > 0) {
            Some(secs) => SshTransport::new().with_keepalive(Duration::from_secs(secs)),
            None => SshTransport::new(),
        }
    }

    /// Engine command line with the given engine arguments.
    pub fn engine_command(&self, sub_commands: &[String]) -> EngineCommand {
        let engine = &self.engine;
        EngineCommand {
            program: engine.command.clone(),
            name: engine.name.clone(),
            weight: engine.weight.clone(),
            config: engine.config.clone(),
            local_config: engine.local_config.clone(),
            override_config: engine.override_config.clone(),
            extra_info: engine.extra_info.clone(),
            client_id: engine.client_id.clone(),
            compress: engine.compress,
            refresh_interval: engine.refresh_interval,
            transmit_move_num: engine.transmit_move_num,
            route: engine.route.clone(),
            sub_commands: sub_commands.to_vec(),
        }
    }

    /// The world URL, required for discovery.
    pub fn world_url(&self) -> Result<&str, ConfigError> {
        self.world
            .url
            .as_deref()
            .filter(|url| !url.is_empty())
            .ok_or(ConfigError::Missing("world URL (--world or KATA_TUNNEL_WORLD)"))
    }

    /// Discovery request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.world.request_timeout_secs)
    }

    /// Account credentials, all of which are required.
    pub fn account(&self) -> Result<Account, ConfigError> {
        let account = &self.account;
        Ok(Account {
            platform: required(&account.platform, "platform (--platform)")?,
            username: required(&account.username, "username (--username)")?,
            password: required(&account.password, "password (--password)")?,
        })
    }

    /// Get the log level filter string.
    pub fn log_filter(&self) -> &str {
        &self.logging.level
    }
}

fn override_with<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
    if let Some(value) = value {
        *slot = Some(value.clone());
    }
}

fn required(value: &Option<String>, what: &'static str) -> Result<String, ConfigError> {
    value
        .clone()
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing(what))
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// JSON parsing error.
    #[error("failed to parse config file: {0}")]
    Json(#[from] serde_json::Error),
    /// A required setting is absent.
    #[error("missing required setting: {0}")]
    Missing(&'static str),
}

impl From<ConfigError> for KataTunnelError {
    fn from(e: ConfigError) -> Self {
        KataTunnelError::Config(e.to_string())
    }
}
