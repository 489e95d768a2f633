use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use genstream_cli::{exit_code, render_event, render_outcome, render_snapshot};
use genstream_client::{connect_to, FileSessionStore, HttpClient, SessionStore};
use log::LevelFilter;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[clap(
    name = "genstream",
    author,
    version = "0.1.0",
    about = "Follow resumable generation sessions"
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    #[clap(long, global = true, default_value = "http://127.0.0.1:3001")]
    server_url: String,

    #[clap(long, short, global = true, default_value = "warn")]
    log_level: String,

    #[clap(
        long,
        global = true,
        help = "File holding the active session and last seen event id"
    )]
    state_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a generation and follow it to the end
    Generate {
        prompt: String,

        #[clap(long)]
        session_id: Option<String>,
    },
    /// Reattach to the session left running by an earlier invocation
    Resume,
    /// Print a session snapshot
    Status { session_id: String },
    /// Cancel a running session
    Cancel { session_id: String },
    /// List sessions the server knows about
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // stdout carries session output; logs go to stderr
    env_logger::Builder::new()
        .filter_level(cli.log_level.parse().unwrap_or(LevelFilter::Warn))
        .target(env_logger::Target::Stderr)
        .init();

    let code = match cli.command {
        Commands::Generate {
            ref prompt,
            ref session_id,
        } => follow(&cli, Some((prompt.clone(), session_id.clone()))).await?,
        Commands::Resume => follow(&cli, None).await?,
        Commands::Status { ref session_id } => {
            let snapshot = HttpClient::new(&cli.server_url)
                .status(session_id)
                .await
                .with_context(|| format!("Failed to read session {}", session_id))?;
            println!("{}", render_snapshot(&snapshot));
            0
        }
        Commands::Cancel { ref session_id } => {
            let cancelled = HttpClient::new(&cli.server_url)
                .cancel(session_id)
                .await
                .with_context(|| format!("Failed to cancel session {}", session_id))?;
            if cancelled {
                println!("Cancellation requested for session {}", session_id);
            } else {
                println!("Session {} was not running", session_id);
            }
            0
        }
        Commands::List => {
            let sessions = HttpClient::new(&cli.server_url)
                .list()
                .await
                .context("Failed to list sessions")?;
            if sessions.is_empty() {
                println!("No sessions");
            }
            for snapshot in sessions {
                println!(
                    "{}  {:?}  {} events  {} images",
                    snapshot.session_id,
                    snapshot.status,
                    snapshot.latest_event_id,
                    snapshot.image_count
                );
            }
            0
        }
    };

    std::process::exit(code);
}

/// Follow a new session, or the persisted one when `start` is `None`.
async fn follow(cli: &Cli, start: Option<(String, Option<String>)>) -> Result<i32> {
    let path = cli
        .state_file
        .clone()
        .unwrap_or_else(FileSessionStore::default_path);
    log::debug!("Session state file: {}", path.display());
    let store: Arc<dyn SessionStore> = Arc::new(FileSessionStore::new(path));

    let (reconnector, mut events) = connect_to(&cli.server_url, store);
    let handle = reconnector.handle();

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Some(line) = render_event(&event) {
                println!("{}", line);
            }
        }
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupted, detaching from session");
            handle.close();
        }
    });

    let outcome = match start {
        Some((prompt, session_id)) => Some(
            reconnector
                .start(&prompt, session_id)
                .await
                .context("Failed to follow session")?,
        ),
        None => reconnector
            .resume()
            .await
            .context("Failed to resume session")?,
    };

    // Dropping the reconnector closes the event channel so the printer drains
    drop(reconnector);
    let _ = printer.await;

    Ok(match outcome {
        Some(outcome) => {
            println!("{}", render_outcome(&outcome));
            exit_code(&outcome)
        }
        None => {
            println!("No session to resume");
            1
        }
    })
}
