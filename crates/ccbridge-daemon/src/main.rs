//! ccbridged - Telegram <-> Claude Code bridge daemon.
//!
//! Owns the long-poll loop against the Telegram Bot API and hands every
//! update to the core coordinator. The only fatal startup error is a missing
//! bot token; everything else degrades at runtime.

mod openai;
mod telegram;

use std::sync::Arc;

use anyhow::{Context, Result};
use ccbridge_core::{BridgePaths, Coordinator, CoordinatorOptions, Polisher, SpeechService};
use tracing::{info, warn};

use openai::OpenAiClient;
use telegram::TelegramClient;

fn log_filter() -> tracing_subscriber::EnvFilter {
    let level = if let Ok(v) = std::env::var("RUST_LOG") {
        v
    } else if let Ok(v) = std::env::var("CCBRIDGE_LOG_LEVEL") {
        v
    } else {
        "info".to_string()
    };
    tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

fn bot_token() -> Result<String> {
    std::env::var("CCBRIDGE_TELEGRAM_TOKEN")
        .or_else(|_| std::env::var("TELEGRAM_BOT_TOKEN"))
        .context("CCBRIDGE_TELEGRAM_TOKEN (or TELEGRAM_BOT_TOKEN) is not set")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter())
        .init();

    let token = bot_token()?;
    let paths = BridgePaths::from_env();
    tokio::fs::create_dir_all(paths.home()).await.ok();
    info!(home = ?paths.home(), projects = ?paths.projects_root(), "ccbridged starting");

    let telegram = Arc::new(TelegramClient::new(&token));

    let (speech, polisher): (
        Option<Arc<dyn SpeechService>>,
        Option<Arc<dyn Polisher>>,
    ) = match OpenAiClient::from_env() {
        Some(client) => {
            info!("Speech/polish provider configured");
            let client = Arc::new(client);
            (Some(client.clone()), Some(client))
        }
        None => {
            info!("No OPENAI_API_KEY; voice transcription and polishing disabled");
            (None, None)
        }
    };

    let coordinator = Coordinator::new(
        CoordinatorOptions::from_env(paths),
        telegram.clone(),
        speech,
        polisher,
    );
    coordinator.spawn_permission_loop();
    coordinator.send_startup_notice().await;

    // Long-poll loop. Updates are handled strictly in arrival order; slow
    // side-work (launch waits, turn watching) runs on its own tasks.
    let mut offset = 0i64;
    loop {
        match telegram.poll_updates(offset).await {
            Ok(updates) => {
                for update in updates {
                    offset = offset.max(update.update_id + 1);
                    if let Some(event) = telegram.update_to_event(update) {
                        coordinator.handle_event(event).await;
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "getUpdates failed, backing off");
                tokio::time::sleep(std::time::Duration::from_secs(3)).await;
            }
        }
    }
}
