//! Remote engine command lines.
//!
//! The remote side exposes a handful of wrapper commands (`run-katago`,
//! `preload-katago`, `view-config`, `query-server`, `scp-config`) that take
//! long-style flags. This module renders them from typed options.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Engine command used when none is configured.
pub const DEFAULT_ENGINE_COMMAND: &str = "run-katago";

/// Remote command that preloads the engine without attaching to it.
pub const PRELOAD_COMMAND: &str = "preload-katago";

/// Remote command that prints the effective engine configuration.
pub const VIEW_CONFIG_COMMAND: &str = "view-config";

/// Remote command that reports server availability.
pub const QUERY_SERVER_COMMAND: &str = "query-server";

/// Default refresh interval, in centiseconds.
pub const DEFAULT_REFRESH_INTERVAL: u32 = 30;

/// Default cap on moves sent per analysis update.
pub const DEFAULT_TRANSMIT_MOVE_NUM: u32 = 20;

/// Options that steer which server node handles a request.
///
/// Rendered as ` --engine-type X --force-node Y ...` with a leading space, or
/// as an empty string when nothing is set. Empty values are skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RouteOptions {
    /// Engine flavour, e.g. `katago` or `leela-zero`.
    pub engine_type: Option<String>,
    /// Pin the request to a named node.
    pub force_node: Option<String>,
    /// GPU class, e.g. `2x`.
    pub gpu_type: Option<String>,
    /// Access token.
    pub token: Option<String>,
}

impl RouteOptions {
    /// Render as command-line flags.
    pub fn render(&self) -> String {
        let mut out = String::new();
        push_flag(&mut out, "--engine-type", self.engine_type.as_deref());
        push_flag(&mut out, "--force-node", self.force_node.as_deref());
        push_flag(&mut out, "--gpu-type", self.gpu_type.as_deref());
        push_flag(&mut out, "--token", self.token.as_deref());
        out
    }

    /// Whether no option is set.
    pub fn is_empty(&self) -> bool {
        self.render().is_empty()
    }
}

fn push_flag(out: &mut String, flag: &str, value: Option<&str>) {
    if let Some(value) = value.filter(|v| !v.is_empty()) {
        out.push(' ');
        out.push_str(flag);
        out.push(' ');
        out.push_str(value);
    }
}

/// A remote engine invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineCommand {
    /// Wrapper command name.
    pub program: String,
    /// Engine binary name.
    pub name: Option<String>,
    /// Network weight name.
    pub weight: Option<String>,
    /// Server-side config name.
    pub config: Option<String>,
    /// Local config pushed beforehand; only its base name goes on the wire.
    pub local_config: Option<PathBuf>,
    /// Engine override config, passed through to the engine.
    pub override_config: Option<String>,
    /// Free-form information for the server.
    pub extra_info: Option<String>,
    /// Client identifier.
    pub client_id: Option<String>,
    /// Ask the server to frame its output with compressed segments.
    pub compress: bool,
    /// Refresh interval, in centiseconds.
    pub refresh_interval: u32,
    /// Cap on moves sent per analysis update.
    pub transmit_move_num: u32,
    /// Node routing options.
    pub route: RouteOptions,
    /// Arguments passed to the engine after `--`.
    pub sub_commands: Vec<String>,
}

impl EngineCommand {
    /// Start a command line for `program` with default settings.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            name: None,
            weight: None,
            config: None,
            local_config: None,
            override_config: None,
            extra_info: None,
            client_id: None,
            compress: true,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            transmit_move_num: DEFAULT_TRANSMIT_MOVE_NUM,
            route: RouteOptions::default(),
            sub_commands: Vec::new(),
        }
    }

    /// Set the engine binary name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the weight name.
    pub fn weight(mut self, weight: impl Into<String>) -> Self {
        self.weight = Some(weight.into());
        self
    }

    /// Set the server-side config name.
    pub fn config(mut self, config: impl Into<String>) -> Self {
        self.config = Some(config.into());
        self
    }

    /// Reference a local config file that is pushed before the run.
    pub fn local_config(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_config = Some(path.into());
        self
    }

    /// Set the engine override config.
    pub fn override_config(mut self, value: impl Into<String>) -> Self {
        self.override_config = Some(value.into());
        self
    }

    /// Set the extra information string.
    pub fn extra_info(mut self, value: impl Into<String>) -> Self {
        self.extra_info = Some(value.into());
        self
    }

    /// Set the client identifier.
    pub fn client_id(mut self, value: impl Into<String>) -> Self {
        self.client_id = Some(value.into());
        self
    }

    /// Enable or disable compressed output framing.
    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Set the refresh interval.
    pub fn refresh_interval(mut self, value: u32) -> Self {
        self.refresh_interval = value;
        self
    }

    /// Set the transmitted move cap.
    pub fn transmit_move_num(mut self, value: u32) -> Self {
        self.transmit_move_num = value;
        self
    }

    /// Set node routing options.
    pub fn route(mut self, route: RouteOptions) -> Self {
        self.route = route;
        self
    }

    /// Append engine arguments.
    pub fn sub_commands<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sub_commands.extend(args.into_iter().map(Into::into));
        self
    }

    /// Render the full command line.
    ///
    /// An override config rides along with the sub commands when there are
    /// any; otherwise it implies `-- gtp -override-config <value>`.
    pub fn render(&self) -> String {
        let mut out = self.program.clone();
        push_flag(&mut out, "--name", self.name.as_deref());
        push_flag(&mut out, "--weight", self.weight.as_deref());
        push_flag(&mut out, "--config", self.config.as_deref());
        let custom = self.local_config.as_deref().and_then(base_name);
        push_flag(&mut out, "--custom-config", custom.as_deref());
        push_flag(&mut out, "--extra-info", self.extra_info.as_deref());
        push_flag(&mut out, "--client-id", self.client_id.as_deref());
        if self.compress {
            out.push_str(" --compress");
        }
        out.push_str(&format!(" --refresh-interval {}", self.refresh_interval));
        out.push_str(&format!(" --transmit-move-num {}", self.transmit_move_num));
        out.push_str(&self.route.render());

        let override_config = self.override_config.as_deref().filter(|v| !v.is_empty());
        if !self.sub_commands.is_empty() {
            out.push_str(" -- ");
            out.push_str(&self.sub_commands.join(" "));
            if let Some(value) = override_config {
                out.push_str(" -override-config ");
                out.push_str(value);
            }
        } else if let Some(value) = override_config {
            out.push_str(" -- gtp -override-config ");
            out.push_str(value);
        }
        out
    }
}

impl std::fmt::Display for EngineCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

/// `query-server` with routing options.
pub fn query_server_command(route: &RouteOptions) -> String {
    format!("{}{}", QUERY_SERVER_COMMAND, route.render())
}

/// Final path component as UTF-8, if any.
pub fn base_name(path: &Path) -> Option<String> {
    path.file_name().map(|n| n.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_command() {
        let cmd = EngineCommand::new("run-katago");
        assert_eq!(
            cmd.render(),
            "run-katago --compress --refresh-interval 30 --transmit-move-num 20"
        );
    }

    #[test]
    fn test_full_command() {
        let route = RouteOptions {
            engine_type: Some("katago".into()),
            gpu_type: Some("2x".into()),
            ..RouteOptions::default()
        };
        let cmd = EngineCommand::new("run-katago")
            .name("katago-1.9")
            .weight("40b")
            .config("default_gtp")
            .local_config("/home/me/configs/my_gtp.cfg")
            .extra_info("sabaki")
            .client_id("c-17")
            .compress(false)
            .refresh_interval(50)
            .transmit_move_num(10)
            .route(route)
            .sub_commands(["analysis", "-model", "m.bin.gz"]);

        assert_eq!(
            cmd.render(),
            "run-katago --name katago-1.9 --weight 40b --config default_gtp \
             --custom-config my_gtp.cfg --extra-info sabaki --client-id c-17 \
             --refresh-interval 50 --transmit-move-num 10 \
             --engine-type katago --gpu-type 2x -- analysis -model m.bin.gz"
        );
    }

    #[test]
    fn test_override_config_without_sub_commands() {
        let cmd = EngineCommand::new("run-katago").override_config("maxVisits=100");
        assert!(cmd
            .render()
            .ends_with("--transmit-move-num 20 -- gtp -override-config maxVisits=100"));
    }

    #[test]
    fn test_override_config_with_sub_commands() {
        let cmd = EngineCommand::new("run-katago")
            .override_config("maxVisits=100")
            .sub_commands(["gtp"]);
        assert!(cmd
            .render()
            .ends_with(" -- gtp -override-config maxVisits=100"));
    }

    #[test]
    fn test_empty_values_are_skipped() {
        let cmd = EngineCommand::new("view-config").name("").override_config("");
        assert_eq!(
            cmd.to_string(),
            "view-config --compress --refresh-interval 30 --transmit-move-num 20"
        );
    }

    #[test]
    fn test_route_options() {
        assert_eq!(RouteOptions::default().render(), "");
        assert!(RouteOptions::default().is_empty());

        let route = RouteOptions {
            force_node: Some("node-3".into()),
            token: Some("t0k".into()),
            ..RouteOptions::default()
        };
        assert_eq!(route.render(), " --force-node node-3 --token t0k");
        assert_eq!(
            query_server_command(&route),
            "query-server --force-node node-3 --token t0k"
        );
    }
}
