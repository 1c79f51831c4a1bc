//! kata-tunnel binary entry point.

use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

use kata_tunnel::cli::{self, Args};
use kata_tunnel::command::{PRELOAD_COMMAND, QUERY_SERVER_COMMAND, VIEW_CONFIG_COMMAND};
use kata_tunnel::config::Config;
use kata_tunnel::discovery::Discovery;
use kata_tunnel::session::Stdio;
use kata_tunnel::{logging, Client, KataTunnelError, RunOutcome, SessionState};
use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let args = match cli::parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {}", e);
            eprintln!("Run with --help for usage.");
            return ExitCode::from(2);
        }
    };
    if args.help {
        cli::print_help();
        return ExitCode::SUCCESS;
    }
    if args.version {
        cli::print_version();
        return ExitCode::SUCCESS;
    }

    let config = match Config::load(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::from(2);
        }
    };
    if logging::init_with_filter(config.log_filter()).is_err() {
        logging::init();
    }
    info!("kata-tunnel v{}", env!("CARGO_PKG_VERSION"));

    match run(&args, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(KataTunnelError::CommandFailed { exit_status }) => {
            error!("remote command exited with status {}", exit_status);
            ExitCode::from(u8::try_from(exit_status).unwrap_or(1).max(1))
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args, config: &Config) -> kata_tunnel::Result<()> {
    let discovery = Discovery::with_timeout(config.world_url()?, config.request_timeout())?;
    let account = config.account()?;
    debug!("platform: [{}] user: [{}]", account.platform, account.username);

    let transport = Arc::new(config.ssh_transport());
    let client = Client::new(transport, config.controller_config(), discovery, account)
        .with_route(config.engine.route.clone());
    let command = config.engine_command(&args.sub_commands);

    let program = command.program.clone();
    match program.as_str() {
        QUERY_SERVER_COMMAND => print_stdout(&client.query_server().await?),
        VIEW_CONFIG_COMMAND => print_stdout(&client.view_config(command).await?),
        _ => {
            let stdio = Stdio::inherit();
            let handle = if program == PRELOAD_COMMAND {
                client.preload_katago(command, stdio, None).await?
            } else {
                client.run_katago(command, stdio, None).await?
            };

            let session = handle.controller();
            let controller = handle.controller();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupted, stopping session");
                    controller.stop();
                }
            });

            match handle.wait().await {
                Ok(RunOutcome::Completed) | Ok(RunOutcome::Stopped) => Ok(()),
                Err(KataTunnelError::ChannelClosed)
                    if session.state() == SessionState::Stopped =>
                {
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
    }
}

fn print_stdout(bytes: &[u8]) -> kata_tunnel::Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(bytes)?;
    stdout.flush()?;
    Ok(())
}
