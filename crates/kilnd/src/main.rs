//! kilnd — the kiln build daemon.
//!
//! Serves the streaming build API over HTTP/1.1, backed by the reference
//! context backend.
//!
//! # Usage
//!
//! ```text
//! kilnd serve --config /etc/kiln/kiln.toml --port 2375
//! kilnd print-config > kiln.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use kiln_api::{ApiState, build_router};
use kiln_core::DaemonConfig;
use kilnd::ContextBackend;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kilnd", about = "kiln build daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the build API server.
    Serve {
        /// Path to kiln.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on, overriding `server.listen`.
        #[arg(long)]
        port: Option<u16>,

        /// Parent directory for spooled build contexts.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Print the default configuration as TOML.
    PrintConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Serve {
            config,
            port,
            data_dir,
        } => {
            let config = load_config(config, port, data_dir)?;
            serve(config).await
        }
        Command::PrintConfig => {
            print!("{}", DaemonConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kilnd=debug,kiln=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(
    path: Option<PathBuf>,
    port: Option<u16>,
    data_dir: Option<PathBuf>,
) -> anyhow::Result<DaemonConfig> {
    let mut config = match &path {
        Some(path) => DaemonConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DaemonConfig::default(),
    };
    if let Some(port) = port {
        config.server.listen.set_port(port);
    }
    if let Some(dir) = data_dir {
        config.backend.spool_dir = Some(dir);
    }
    config.validate()?;
    Ok(config)
}

async fn serve(config: DaemonConfig) -> anyhow::Result<()> {
    info!("kiln daemon starting");

    let backend = ContextBackend::new(config.backend.spool_dir.as_deref())
        .context("creating spool directory")?;
    info!(spool = ?backend.spool_dir(), "context backend initialized");

    let state = ApiState::new(Arc::new(backend), &config);
    let router = build_router(state);

    let addr = config.server.listen;
    info!(
        %addr,
        full_duplex = config.build.full_duplex,
        progress_buffer = config.build.progress_buffer,
        "API server starting"
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C handler");
            info!("shutdown signal received");
        })
        .await?;

    info!("kiln daemon stopped");
    Ok(())
}
