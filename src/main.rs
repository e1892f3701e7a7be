//! kindred binary: the engine behind a stdin/stdout adapter, plus
//! one-shot maintenance subcommands.
//!
//! The conversational HTTP/SSE surface lives outside this crate; the
//! CLI adapter here exists for local development and integration
//! testing, the same contract a server would call.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{info, warn};

use kindred::config::Config;
use kindred::context::Context;
use kindred::convo::{ConversationMode, TurnRequest};
use kindred::logging;

#[derive(Debug, Parser)]
#[command(name = "kindred", about = "Long-term memory and companion-conversation engine")]
struct Cli {
    /// Config file path (default: kindred.toml, then KINDRED_CONFIG).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the engine with the stdin chat adapter.
    Start {
        /// User id for the chat session.
        #[arg(long, default_value = "local")]
        user: String,
        /// Use graph-only context instead of hybrid.
        #[arg(long)]
        graph_only: bool,
    },
    /// Drain pending outbox events once and exit.
    Drain,
    /// Run one edge-decay pass and exit.
    Decay,
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    let path = path.or_else(|| std::env::var("KINDRED_CONFIG").ok().map(PathBuf::from));
    match path {
        Some(path) => Config::load(&path),
        None => {
            let default = PathBuf::from("kindred.toml");
            if default.exists() {
                Config::load(&default)
            } else {
                Ok(Config::default())
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = load_config(cli.config)?;

    match cli.command {
        Command::Start { user, graph_only } => {
            let logs_dir = directories::ProjectDirs::from("", "", "kindred")
                .map(|dirs| dirs.data_dir().join("logs"))
                .unwrap_or_else(|| PathBuf::from("logs"));
            let _guard = logging::init_service(&logs_dir)?;
            run_chat(config, user, graph_only).await
        }
        Command::Drain => {
            logging::init_cli();
            let ctx = Context::build(config).await.context("engine assembly failed")?;
            let mut total = 0_usize;
            loop {
                let drained = ctx.drainer.drain_once().await;
                total = total.saturating_add(drained);
                if drained == 0 {
                    break;
                }
            }
            info!(total, "outbox drained");
            Ok(())
        }
        Command::Decay => {
            logging::init_cli();
            let ctx = Context::build(config).await.context("engine assembly failed")?;
            let updated = ctx.graph.apply_decay(1000, chrono::Utc::now()).await?;
            info!(updated, "decay pass complete");
            Ok(())
        }
    }
}

/// The stdin chat loop: one line in, one reply out, with the drainer
/// and reconciler running alongside.
async fn run_chat(config: Config, user: String, graph_only: bool) -> Result<()> {
    let ctx = Context::build(config).await.context("engine assembly failed")?;
    info!("kindred starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let drainer_handle = tokio::spawn(Arc::clone(&ctx.drainer).run(shutdown_rx.clone()));
    let reconciler_handle = tokio::spawn(ctx.reconciler().run(shutdown_rx));

    let mode = if graph_only {
        ConversationMode::GraphOnly
    } else {
        ConversationMode::Hybrid
    };
    let session_id = uuid::Uuid::new_v4();

    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    println!("kindred ready (session {session_id}); empty line exits");

    while let Some(line) = lines.next_line().await? {
        let text = line.trim().to_owned();
        if text.is_empty() {
            break;
        }

        if !ctx.limiter.check(&user, unix_now()).is_allowed() {
            println!("(rate limited; wait a minute)");
            continue;
        }

        let request = TurnRequest {
            user_id: user.clone(),
            session_id: Some(session_id),
            text,
            idempotency_key: None,
            mode,
            memorize_only: false,
            eval_mode: false,
        };
        match ctx.engine.process_turn(request).await {
            Ok(reply) => {
                println!("{}", reply.reply);
                info!(
                    turn = %reply.turn_id,
                    affinity = reply.affinity.score,
                    tone = %reply.tone_type,
                    elapsed_ms = reply.response_time_ms,
                    "turn complete"
                );
            }
            Err(err) => {
                warn!(error = %err, "turn failed");
                println!("(something went wrong; trace {})", err.trace_id);
            }
        }
    }

    info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = drainer_handle.await;
    let _ = reconciler_handle.await;
    Ok(())
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}
