//! Recurring prompt timer.
//!
//! Each tick behaves exactly like a user message on the injection pipeline:
//! resolve the attached session, locate the pane, capture a baseline, send
//! keys, then arm the watcher manager with that same baseline. The manager
//! serialises turns, so ticks cannot race user messages.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::tmux::inject::{InjectOutcome, Injector};
use crate::transcript::index::SessionIndex;
use crate::watch::manager::{WatchHooks, WatcherManager};

/// Everything a tick needs, cloned into the timer task.
#[derive(Clone)]
pub struct TimerDeps {
    pub index: Arc<SessionIndex>,
    pub injector: Arc<Injector>,
    pub manager: Arc<WatcherManager>,
    pub chat_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerSettings {
    pub frequency_min: u64,
    pub prompt: String,
}

struct ActiveTimer {
    handle: JoinHandle<()>,
    settings: TimerSettings,
}

/// Holds at most one recurring prompt.
pub struct PromptTimer {
    inner: Mutex<Option<ActiveTimer>>,
}

impl PromptTimer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Start (or replace) the recurring prompt.
    pub fn start(&self, frequency_min: u64, prompt: String, deps: TimerDeps) {
        let settings = TimerSettings {
            frequency_min,
            prompt: prompt.clone(),
        };
        let handle = tokio::spawn(run_ticks(frequency_min, prompt, deps));

        let mut inner = self.inner.lock().unwrap();
        if let Some(previous) = inner.take() {
            previous.handle.abort();
        }
        *inner = Some(ActiveTimer { handle, settings });
        info!(frequency_min, "Prompt timer started");
    }

    /// Stop the timer, returning the settings it ran with for UI echo.
    pub fn stop(&self) -> Option<TimerSettings> {
        let active = self.inner.lock().unwrap().take()?;
        active.handle.abort();
        info!("Prompt timer stopped");
        Some(active.settings)
    }

    pub fn current(&self) -> Option<TimerSettings> {
        self.inner
            .lock()
            .unwrap()
            .as_ref()
            .map(|a| a.settings.clone())
    }
}

impl Default for PromptTimer {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_ticks(frequency_min: u64, prompt: String, deps: TimerDeps) {
    let period = Duration::from_secs(frequency_min.max(1) * 60);
    let mut interval = tokio::time::interval(period);
    // The immediate first tick of tokio's interval is skipped; the first
    // prompt fires one full period after start.
    interval.tick().await;

    loop {
        interval.tick().await;

        let Some(attached) = deps.index.attached_session().await else {
            debug!("Timer tick skipped: no attached session");
            continue;
        };
        let baseline = deps.index.snapshot_baseline(&attached.cwd).await;

        match deps.injector.inject(&attached.cwd, &prompt, None).await {
            InjectOutcome::Injected { pane_id } => {
                debug!(pane_id = %pane_id, "Timer prompt injected");
            }
            InjectOutcome::NotInjected { reason } => {
                debug!(reason = reason.as_str(), "Timer tick skipped: no pane");
                continue;
            }
        }

        deps.manager
            .start_injection_watcher(&attached, deps.chat_id, WatchHooks::default(), baseline)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgePaths;
    use crate::notify_surface::{spawn_notifier, test_support::RecordingSurface};
    use crate::tmux::locator::PaneLocator;
    use tempfile::tempdir;

    fn deps_for(root: &std::path::Path) -> TimerDeps {
        let paths = BridgePaths::new(root.join("cfg"), root.join("projects"));
        let index = Arc::new(SessionIndex::new(&paths));
        let locator = Arc::new(PaneLocator::new());
        let surface = Arc::new(RecordingSurface::default());
        let notifier = spawn_notifier(surface);
        TimerDeps {
            index: index.clone(),
            injector: Arc::new(Injector::new(locator)),
            manager: Arc::new(WatcherManager::new(index, notifier)),
            chat_id: 7,
        }
    }

    #[tokio::test]
    async fn test_start_replaces_and_stop_echoes_settings() {
        let dir = tempdir().unwrap();
        let timer = PromptTimer::new();
        let deps = deps_for(dir.path());

        timer.start(30, "status check".into(), deps.clone());
        timer.start(15, "ship it".into(), deps);

        let current = timer.current().unwrap();
        assert_eq!(current.frequency_min, 15);

        let stopped = timer.stop().unwrap();
        assert_eq!(stopped.prompt, "ship it");
        assert!(timer.stop().is_none());
        assert!(timer.current().is_none());
    }
}
