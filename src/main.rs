#![forbid(unsafe_code)]

//! `provider-session` — operator CLI for stdio tool providers.
//!
//! Connects every server in the configuration file, runs one command, and
//! disconnects. Results go to stdout as JSON; logs go to stderr.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use provider_session::manager::SessionManager;
use provider_session::{AppError, GlobalConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "provider-session", about = "Drive stdio tool providers", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the tools of every connected server.
    Tools,
    /// Ping every server and report which ones are healthy.
    Health,
    /// Call one tool and print its result.
    Call {
        /// Registration name of the server.
        server: String,
        /// Tool name.
        tool: String,
        /// Tool arguments as a JSON object.
        #[arg(long, default_value = "{}")]
        args: String,
    },
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config = GlobalConfig::load_from_path(&args.config)?;
    info!(servers = config.servers.len(), "configuration loaded");

    let manager = SessionManager::from_config(&config);
    let attempts = manager.connect_all(&config.servers).await;
    let failed = attempts.values().filter(|r| r.is_err()).count();
    if failed > 0 {
        warn!(failed, "some servers could not be connected");
    }

    let outcome = tokio::select! {
        outcome = execute(&manager, args.command) => outcome,
        () = shutdown_signal() => {
            info!("shutdown signal received");
            Err(AppError::Cancelled("interrupted".into()))
        }
    };

    manager.disconnect_all().await;

    match outcome {
        Ok(output) => {
            let text = serde_json::to_string_pretty(&output)?;
            println!("{text}");
            Ok(())
        }
        Err(err) => {
            error!(%err, "command failed");
            Err(err)
        }
    }
}

async fn execute(manager: &SessionManager, command: Command) -> Result<Value> {
    match command {
        Command::Tools => {
            let tools: Vec<Value> = manager
                .get_all_tools()
                .await
                .into_iter()
                .map(|t| json!({ "server": t.server, "tool": t.tool }))
                .collect();
            Ok(Value::Array(tools))
        }
        Command::Health => Ok(json!(manager.health_check().await)),
        Command::Call { server, tool, args } => {
            let arguments: Value = serde_json::from_str(&args)
                .map_err(|err| AppError::Config(format!("--args is not valid JSON: {err}")))?;
            let result = manager.call_tool(&server, &tool, arguments).await?;
            Ok(serde_json::to_value(result)?)
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
