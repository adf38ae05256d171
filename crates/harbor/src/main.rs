use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{LevelFilter, debug, info};
use tokio::net::TcpListener;

use harbor::api::{AppState, build_router};
use harbor::auth::AuthState;
use harbor::config::HarborConfig;
use harbor::db::Database;
use harbor::shutdown;

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let config = HarborConfig::load(cli.common.config.as_deref())?;
    init_logging(&cli.common, &config);
    debug!("configuration loaded");

    match cli.command {
        Command::Serve(cmd) => run_serve(config, cmd),
    }
}

#[tokio::main]
async fn run_serve(mut config: HarborConfig, cmd: ServeCommand) -> Result<()> {
    if let Some(host) = cmd.host {
        config.server.host = host;
    }
    if let Some(port) = cmd.port {
        config.server.port = port;
    }
    config.validate()?;
    let config = Arc::new(config);

    let db = Database::new(&config.database.path).await?;
    let jwt_secret = config
        .auth
        .jwt_secret
        .clone()
        .context("jwt secret vanished after validation")?;
    let auth = AuthState::new(jwt_secret);
    let state = AppState::new(config.clone(), db, auth);
    let registry = state.registry.clone();

    let router = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "invalid listen address {}:{}",
                config.server.host, config.server.port
            )
        })?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    info!("Harbor listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown::wait_for_signal())
        .await
        .context("serving")?;

    shutdown::drain(&registry).await;
    info!("Shutdown complete");
    Ok(())
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Harbor - WebSocket gateway for command-line AI agents.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the gateway server
    Serve(ServeCommand),
}

#[derive(Debug, Args)]
struct ServeCommand {
    /// Listen host (overrides config and HOST)
    #[arg(long)]
    host: Option<String>,
    /// Listen port (overrides config and PORT)
    #[arg(long)]
    port: Option<u16>,
}

fn init_logging(opts: &CommonOpts, config: &HarborConfig) {
    let level = if opts.quiet {
        LevelFilter::Error
    } else {
        match opts.verbose {
            0 => config
                .server
                .log_level
                .as_deref()
                .and_then(|l| l.parse().ok())
                .unwrap_or(LevelFilter::Info),
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    // One subscriber for everything: tracing events directly, log macros via
    // the tracing-log bridge. RUST_LOG wins when set.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
