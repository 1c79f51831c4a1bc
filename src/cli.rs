//! Command-line interface for kata-tunnel.
//!
//! Uses lexopt for minimal binary size overhead.

use std::ffi::OsString;
use std::path::PathBuf;

use thiserror::Error;

/// Command-line arguments.
///
/// Options left unset fall back to the environment, then the config file.
#[derive(Debug, Clone, Default)]
pub struct Args {
    /// World document URL.
    pub world: Option<String>,
    /// Platform name within the world.
    pub platform: Option<String>,
    /// Account name.
    pub username: Option<String>,
    /// Account password.
    pub password: Option<String>,
    /// Ask the server not to compress output.
    pub no_compress: bool,
    /// Refresh interval, in centiseconds.
    pub refresh_interval: Option<u32>,
    /// Cap on moves sent per analysis update.
    pub transmit_move_num: Option<u32>,
    /// Local engine config pushed before the run.
    pub kata_local_config: Option<PathBuf>,
    /// Engine binary name.
    pub kata_name: Option<String>,
    /// Weight name.
    pub kata_weight: Option<String>,
    /// Server-side engine config name.
    pub kata_config: Option<String>,
    /// Engine override config.
    pub kata_override_config: Option<String>,
    /// Engine flavour routing option.
    pub engine_type: Option<String>,
    /// GPU class routing option.
    pub gpu_type: Option<String>,
    /// Node pinning routing option.
    pub force_node: Option<String>,
    /// Access token routing option.
    pub token: Option<String>,
    /// Free-form information for the server.
    pub extra_info: Option<String>,
    /// Client identifier.
    pub client_id: Option<String>,
    /// Remote wrapper command, e.g. `run-katago` or `query-server`.
    pub cmd: Option<String>,
    /// Path to configuration file.
    pub config: Option<PathBuf>,
    /// Log level (error, warn, info, debug, trace).
    pub log_level: Option<String>,
    /// Pass engine output through without decoding.
    pub raw: bool,
    /// Arguments forwarded to the engine.
    pub sub_commands: Vec<String>,
    /// Show version and exit.
    pub version: bool,
    /// Show help and exit.
    pub help: bool,
}

/// Parse command-line arguments.
pub fn parse_args() -> Result<Args, ArgsError> {
    parse_args_from(std::env::args_os())
}

/// Parse arguments from an iterator (for testing).
pub fn parse_args_from<I>(args: I) -> Result<Args, ArgsError>
where
    I: IntoIterator<Item = OsString>,
{
    use lexopt::prelude::*;

    let mut result = Args::default();
    let mut parser = lexopt::Parser::from_iter(args);

    while let Some(arg) = parser.next()? {
        match arg {
            Short('h') | Long("help") => result.help = true,
            Short('V') | Long("version") => result.version = true,
            Short('w') | Long("world") => result.world = Some(parser.value()?.parse()?),
            Short('p') | Long("platform") => result.platform = Some(parser.value()?.parse()?),
            Short('u') | Long("username") => result.username = Some(parser.value()?.parse()?),
            Long("password") => result.password = Some(parser.value()?.parse()?),
            Long("no-compress") => result.no_compress = true,
            Long("refresh-interval") => {
                result.refresh_interval = Some(number(&mut parser, "refresh-interval")?);
            }
            Long("transmit-move-num") => {
                result.transmit_move_num = Some(number(&mut parser, "transmit-move-num")?);
            }
            Long("kata-local-config") => {
                result.kata_local_config = Some(parser.value()?.parse()?);
            }
            Long("kata-name") => result.kata_name = Some(parser.value()?.parse()?),
            Long("kata-weight") => result.kata_weight = Some(parser.value()?.parse()?),
            Long("kata-config") => result.kata_config = Some(parser.value()?.parse()?),
            Long("kata-override-config") => {
                result.kata_override_config = Some(parser.value()?.parse()?);
            }
            Long("engine-type") => result.engine_type = Some(parser.value()?.parse()?),
            Long("gpu-type") => result.gpu_type = Some(parser.value()?.parse()?),
            Long("force-node") => result.force_node = Some(parser.value()?.parse()?),
            Long("token") => result.token = Some(parser.value()?.parse()?),
            Long("extra-info") => result.extra_info = Some(parser.value()?.parse()?),
            Long("client-id") => result.client_id = Some(parser.value()?.parse()?),
            Long("cmd") => result.cmd = Some(parser.value()?.parse()?),
            Short('c') | Long("config") => result.config = Some(parser.value()?.parse()?),
            Short('l') | Long("log-level") => result.log_level = Some(parser.value()?.parse()?),
            Long("raw") => result.raw = true,
            Value(val) => {
                // Everything from the first positional on belongs to the engine.
                result.sub_commands.push(val.string()?);
                for rest in parser.raw_args()? {
                    let rest = rest
                        .into_string()
                        .map_err(|v| ArgsError::UnexpectedArgument(v.to_string_lossy().into()))?;
                    result.sub_commands.push(rest);
                }
            }
            _ => return Err(arg.unexpected().into()),
        }
    }

    Ok(result)
}

fn number(parser: &mut lexopt::Parser, name: &'static str) -> Result<u32, ArgsError> {
    use lexopt::ValueExt;

    let value: String = parser.value()?.parse()?;
    value
        .parse()
        .map_err(|_| ArgsError::InvalidValue(name, value))
}

/// Print help message.
pub fn print_help() {
    let version = env!("CARGO_PKG_VERSION");
    println!(
        r#"kata-tunnel {version}
Run a remote engine over SSH with compressed output framing

USAGE:
    kata-tunnel [OPTIONS] [--] [ENGINE ARGS]...

OPTIONS:
    -w, --world <URL>                 World document URL
    -p, --platform <NAME>             Platform name, like aistudio or colab
    -u, --username <NAME>             Account name
        --password <PASSWORD>         Account password
        --cmd <CMD>                   Remote command [default: run-katago]
                                      (also: preload-katago, view-config, query-server)
        --kata-name <NAME>            Engine binary name
        --kata-weight <NAME>          Weight name
        --kata-config <NAME>          Server-side engine config name
        --kata-local-config <FILE>    Local engine config (.cfg) pushed before the run
        --kata-override-config <KV>   Engine override config
        --engine-type <TYPE>          Engine type routing option
        --gpu-type <TYPE>             GPU type routing option
        --force-node <NODE>           Pin to a server node
        --token <TOKEN>               Access token
        --extra-info <TEXT>           Extra information for the server
        --client-id <ID>              Client identifier
        --no-compress                 Ask the server not to compress output
        --raw                         Do not decode engine output
        --refresh-interval <N>        Refresh interval in centiseconds [default: 30]
        --transmit-move-num <N>       Moves sent per analysis update [default: 20]
    -c, --config <FILE>               Path to configuration file (JSON)
    -l, --log-level <LVL>             Log level (error, warn, info, debug, trace)
    -h, --help                        Print help
    -V, --version                     Print version

ENVIRONMENT VARIABLES:
    KATA_TUNNEL_WORLD                 World URL (overrides config)
    KATA_TUNNEL_CONNECT_TIMEOUT       Connect timeout in seconds (overrides config)
    KATA_TUNNEL_KEEPALIVE             SSH keepalive interval in seconds, 0 disables
    KATA_TUNNEL_LOG_LEVEL             Log level (overrides config)
    RUST_LOG                          Alternative log level setting

EXAMPLES:
    # Attach a GTP front end to a remote engine
    kata-tunnel -w https://example.com/world.json -p colab -u alice --password secret

    # Push a local config and run the analysis engine
    kata-tunnel -p colab -u alice --password secret --kata-local-config my.cfg -- analysis

    # Ask which nodes are available
    kata-tunnel -p colab -u alice --password secret --cmd query-server
"#
    );
}

/// Print version.
pub fn print_version() {
    println!("kata-tunnel {}", env!("CARGO_PKG_VERSION"));
}

/// Argument parsing errors.
#[derive(Debug, Error)]
pub enum ArgsError {
    /// Lexopt parsing error.
    #[error("{0}")]
    Lexopt(#[from] lexopt::Error),
    /// Invalid argument value.
    #[error("invalid value for --{0}: '{1}'")]
    InvalidValue(&'static str, String),
    /// Unexpected positional argument.
    #[error("unexpected argument: '{0}'")]
    UnexpectedArgument(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(args: &[&str]) -> Vec<OsString> {
        std::iter::once("kata-tunnel")
            .chain(args.iter().copied())
            .map(OsString::from)
            .collect()
    }

    #[test]
    fn test_default_args() {
        let result = parse_args_from(args(&[])).unwrap();
        assert!(result.world.is_none());
        assert!(!result.no_compress);
        assert!(!result.raw);
        assert!(result.sub_commands.is_empty());
    }

    #[test]
    fn test_account_options() {
        let result = parse_args_from(args(&[
            "-w",
            "https://example.com/world.json",
            "-p",
            "colab",
            "-u",
            "alice",
            "--password",
            "secret",
        ]))
        .unwrap();
        assert_eq!(result.world.as_deref(), Some("https://example.com/world.json"));
        assert_eq!(result.platform.as_deref(), Some("colab"));
        assert_eq!(result.username.as_deref(), Some("alice"));
        assert_eq!(result.password.as_deref(), Some("secret"));
    }

    #[test]
    fn test_engine_options() {
        let result = parse_args_from(args(&[
            "--kata-name",
            "katago",
            "--kata-weight",
            "40b",
            "--kata-local-config",
            "my.cfg",
            "--no-compress",
            "--refresh-interval",
            "50",
            "--transmit-move-num",
            "5",
            "--gpu-type",
            "2x",
        ]))
        .unwrap();
        assert_eq!(result.kata_name.as_deref(), Some("katago"));
        assert_eq!(result.kata_weight.as_deref(), Some("40b"));
        assert_eq!(result.kata_local_config, Some(PathBuf::from("my.cfg")));
        assert!(result.no_compress);
        assert_eq!(result.refresh_interval, Some(50));
        assert_eq!(result.transmit_move_num, Some(5));
        assert_eq!(result.gpu_type.as_deref(), Some("2x"));
    }

    #[test]
    fn test_sub_commands_after_separator() {
        let result =
            parse_args_from(args(&["-u", "alice", "--", "analysis", "-model", "m.bin"])).unwrap();
        assert_eq!(result.username.as_deref(), Some("alice"));
        assert_eq!(result.sub_commands, vec!["analysis", "-model", "m.bin"]);
    }

    #[test]
    fn test_sub_commands_positional() {
        let result = parse_args_from(args(&["gtp", "-config", "x.cfg"])).unwrap();
        assert_eq!(result.sub_commands, vec!["gtp", "-config", "x.cfg"]);
    }

    #[test]
    fn test_help_and_version() {
        assert!(parse_args_from(args(&["-h"])).unwrap().help);
        assert!(parse_args_from(args(&["--help"])).unwrap().help);
        assert!(parse_args_from(args(&["-V"])).unwrap().version);
    }

    #[test]
    fn test_invalid_number() {
        let result = parse_args_from(args(&["--refresh-interval", "soon"]));
        assert!(matches!(
            result,
            Err(ArgsError::InvalidValue("refresh-interval", _))
        ));
    }

    #[test]
    fn test_unknown_option() {
        assert!(parse_args_from(args(&["--listen"])).is_err());
    }
}
