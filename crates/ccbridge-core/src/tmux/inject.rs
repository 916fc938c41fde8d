//! Keystroke injection into a located pane.
//!
//! User text goes through `send-keys -l --` so tmux treats it literally and
//! no shell ever re-parses it. Text and submit are always two separate
//! commands separated by [`KEYSTROKE_DELAY`]; a combined send makes the
//! submit fire before the text is registered.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, warn};

use super::locator::{NotFoundReason, PaneLocator, PaneLookup};

/// Delay between sending text and the submit key.
pub const KEYSTROKE_DELAY: Duration = Duration::from_millis(100);

/// The agent's universal cancel key.
pub const INTERRUPT_KEY: &str = "Escape";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectOutcome {
    Injected { pane_id: String },
    NotInjected { reason: NotFoundReason },
}

pub struct Injector {
    locator: Arc<PaneLocator>,
}

impl Injector {
    pub fn new(locator: Arc<PaneLocator>) -> Self {
        Self { locator }
    }

    /// Locate the pane for `cwd` and send `text` + submit. When the locator
    /// fails and `fallback_pane` is non-empty, try that pane instead.
    pub async fn inject(
        &self,
        cwd: &str,
        text: &str,
        fallback_pane: Option<&str>,
    ) -> InjectOutcome {
        let pane_id = match self.locator.find(cwd).await {
            PaneLookup::Found { pane_id } => pane_id,
            PaneLookup::NotFound { reason } => match fallback_pane {
                Some(pane) if !pane.is_empty() => {
                    debug!(pane_id = %pane, reason = reason.as_str(), "Locator missed, using launched pane fallback");
                    pane.to_string()
                }
                _ => return InjectOutcome::NotInjected { reason },
            },
        };

        match send_text_and_submit(&pane_id, text).await {
            Ok(()) => InjectOutcome::Injected { pane_id },
            Err(e) => {
                warn!(pane_id = %pane_id, error = %e, "Injection failed");
                InjectOutcome::NotInjected {
                    reason: NotFoundReason::NoClaudePane,
                }
            }
        }
    }

    /// Send the cancel keystroke into a pane.
    pub async fn send_interrupt(&self, pane_id: &str) {
        if let Err(e) = send_named_key(pane_id, INTERRUPT_KEY).await {
            warn!(pane_id = %pane_id, error = %e, "Interrupt send failed");
        }
    }

    /// Send a single named key without submit (permission deny, plan picks).
    pub async fn send_key(&self, pane_id: &str, key: &str) {
        if let Err(e) = send_named_key(pane_id, key).await {
            warn!(pane_id = %pane_id, key = %key, error = %e, "Key send failed");
        }
    }
}

/// Text then, after the inter-keystroke delay, Enter.
pub async fn send_text_and_submit(pane_id: &str, text: &str) -> Result<()> {
    send_literal(pane_id, text).await?;
    tokio::time::sleep(KEYSTROKE_DELAY).await;
    send_named_key(pane_id, "Enter").await
}

/// Send text literally (`-l`), with `--` so leading dashes survive.
pub async fn send_literal(pane_id: &str, text: &str) -> Result<()> {
    run_tmux(&["send-keys", "-t", pane_id, "-l", "--", text]).await
}

/// Send a named key (Enter, Escape, a digit).
pub async fn send_named_key(pane_id: &str, key: &str) -> Result<()> {
    run_tmux(&["send-keys", "-t", pane_id, key]).await
}

async fn run_tmux(args: &[&str]) -> Result<()> {
    let output = Command::new("tmux")
        .args(args)
        .output()
        .await
        .context("spawning tmux")?;
    if !output.status.success() {
        bail!(
            "tmux {} failed: {}",
            args.first().copied().unwrap_or(""),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}
