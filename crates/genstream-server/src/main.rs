//! genstream-server binary
//!
//! Runs the session server with the scripted demo executor.

use anyhow::Context;
use clap::Parser;
use genstream_server::{
    shutdown_signal, ConfigLoader, GenStreamServer, ScriptedExecutor, ServerConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Command line arguments for the session server.
#[derive(Parser, Debug)]
#[command(name = "genstream-server")]
#[command(about = "Resumable generation sessions over WebSocket and Server-Sent Events")]
#[command(version)]
struct Args {
    /// YAML configuration file; flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server bind address
    #[arg(short, long)]
    bind: Option<String>,

    /// Enable CORS
    #[arg(long)]
    cors: Option<bool>,

    /// CORS allowed origins (comma-separated)
    #[arg(long)]
    cors_origins: Option<String>,

    /// Enable request logging
    #[arg(long)]
    logging: Option<bool>,

    /// SSE keep-alive interval in seconds
    #[arg(long)]
    keepalive: Option<u64>,

    /// Wall-clock ceiling per generation in seconds
    #[arg(long)]
    session_timeout: Option<u64>,

    /// Cancel a generation when its SSE stream is dropped
    #[arg(long)]
    cancel_on_disconnect: bool,

    /// Delay between demo executor steps in milliseconds
    #[arg(long, default_value = "750")]
    step_delay_ms: u64,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply(&self, mut config: ServerConfig) -> anyhow::Result<ServerConfig> {
        if let Some(ref bind) = self.bind {
            config = config.with_bind_addr_str(bind)?;
        }
        if let Some(cors) = self.cors {
            config = config.with_cors(cors);
        }
        if let Some(ref origins) = self.cors_origins {
            config = config.with_cors_origins(
                origins.split(',').map(|s| s.trim().to_string()).collect(),
            );
        }
        if let Some(logging) = self.logging {
            config = config.with_logging(logging);
        }
        if let Some(secs) = self.keepalive {
            config = config.with_sse_keepalive(Duration::from_secs(secs));
        }
        if let Some(secs) = self.session_timeout {
            config = config.with_session_timeout(Duration::from_secs(secs));
        }
        if self.cancel_on_disconnect {
            config = config.with_cancel_on_stream_disconnect(true);
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    let base = match args.config {
        Some(ref path) => ConfigLoader::from_file(path)
            .await
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => ServerConfig::default(),
    };
    let config = args.apply(base)?;

    let executor =
        ScriptedExecutor::demo().with_step_delay(Duration::from_millis(args.step_delay_ms));

    log::info!("Configuration:");
    log::info!("  Bind address: {}", config.bind_addr);
    log::info!("  CORS enabled: {}", config.enable_cors);
    log::info!("  Max events per session: {}", config.max_events);
    log::info!("  Max event age: {:?}", config.max_event_age);
    log::info!("  Session timeout: {:?}", config.session_timeout);
    log::info!("  Completion grace: {:?}", config.completion_grace);
    log::info!("  Cancel on stream disconnect: {}", config.cancel_on_stream_disconnect);

    let server = GenStreamServer::with_config(Arc::new(executor), config);
    server.serve_with_shutdown(shutdown_signal()).await?;

    Ok(())
}
