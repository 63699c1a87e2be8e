//! hostwatch
//!
//! Agentless host monitoring daemon and its companion commands.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::error;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};
use tracing_subscriber::{EnvFilter, Layer, Registry};

mod commands;
mod config;
mod pid;

/// Agentless host monitoring
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration directory
    #[arg(long, env = "HOSTWATCH_CONFIG", default_value = "/etc/hostwatch")]
    config_path: PathBuf,

    /// Log level, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Also append logs to this file
    #[arg(short = 'f', long)]
    log_file: Option<PathBuf>,

    /// Prefix log lines with a timestamp
    #[arg(short = 't', long)]
    log_timestamp: bool,

    /// No log output on stderr (the log file is kept)
    #[arg(short, long)]
    quiet: bool,

    /// Write the daemon PID to this file, refusing to start if it names a running process
    #[arg(short, long)]
    pid_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the monitoring daemon (default)
    Run,
    /// Validate the configuration and test host connections
    Check {
        /// Only validate the files
        #[arg(long)]
        skip_connections: bool,
    },
    /// Show hosts, their probes, checks and receiving alerts
    Recap,
    /// Evaluate a constant expression
    Expr {
        /// Expression to evaluate, ex: "1 + 2 > 2"
        expression: String,
    },
    /// Run one probe on one host, without alerting
    Test {
        host: String,
        probe: String,
    },
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn fmt_layer<W>(writer: W, json: bool, timestamp: bool, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer().with_writer(writer).with_ansi(ansi);
    match (json, timestamp) {
        (true, true) => layer.json().boxed(),
        (true, false) => layer.json().without_time().boxed(),
        (false, true) => layer.boxed(),
        (false, false) => layer.without_time().boxed(),
    }
}

/// Appending, never rotated, log file
fn log_file_writer(path: &Path) -> anyhow::Result<RollingFileAppender> {
    let name = path
        .file_name()
        .with_context(|| format!("invalid log file '{}'", path.display()))?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(name.to_string_lossy())
        .build(dir)
        .with_context(|| format!("unable to open log file '{}'", path.display()))
}

fn init_tracing(args: &Args) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.as_str()));

    let mut layers: Vec<BoxedLayer> = Vec::new();
    if !args.quiet {
        layers.push(fmt_layer(
            std::io::stderr,
            args.log_json,
            args.log_timestamp,
            true,
        ));
    }
    if let Some(path) = &args.log_file {
        layers.push(fmt_layer(
            log_file_writer(path)?,
            args.log_json,
            args.log_timestamp,
            false,
        ));
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .init();
    Ok(())
}

/// Exit status for a failed command
fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<hostwatch_core::Error>() {
        Some(hostwatch_core::Error::Expression(_)) => 2,
        _ => 1,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();
    if let Err(e) = init_tracing(&args) {
        eprintln!("Error: {:#}", e);
        return ExitCode::from(1);
    }

    let result = match args.command.unwrap_or(Command::Run) {
        Command::Run => commands::run(&args.config_path, args.pid_file.as_deref()).await,
        Command::Check { skip_connections } => {
            commands::check(&args.config_path, !skip_connections).await
        }
        Command::Recap => commands::recap(&args.config_path),
        Command::Expr { expression } => commands::expr(&expression),
        Command::Test { host, probe } => commands::test(&args.config_path, &host, &probe).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}
