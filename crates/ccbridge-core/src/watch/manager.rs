//! Singleton owner of at most one active turn watcher.
//!
//! Serialises turns (a new watch first stops and flushes the previous one),
//! guarantees exactly-once completion across every termination path, rewrites
//! the attached marker when the session rotated between attach-time and
//! injection, and runs the compaction poll that re-arms observation when the
//! agent rotates to a new transcript file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::turn::{
    self, ImageAttachment, TextCallback, TurnCallbacks, TurnWatcherHandle, TurnWatcherOptions,
};
use crate::classify::WaitingKind;
use crate::notify_surface::Notifier;
use crate::transcript::index::SessionIndex;
use crate::transcript::types::{AttachedSession, Baseline};

/// How often the compaction poll re-resolves the latest session file.
pub const COMPACTION_POLL_INTERVAL: Duration = Duration::from_secs(3);
/// Total budget for the compaction poll before it gives up.
pub const COMPACTION_GIVE_UP: Duration = Duration::from_secs(60);

/// Fires its hook exactly once, no matter how many termination paths race.
#[derive(Clone)]
pub struct CompletionGuard {
    fired: Arc<AtomicBool>,
    hook: Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>,
}

impl CompletionGuard {
    pub fn new(hook: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            fired: Arc::new(AtomicBool::new(false)),
            hook: Arc::new(Mutex::new(Some(hook))),
        }
    }

    /// Run the hook if nobody has yet.
    pub fn fire(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            let hook = self.hook.lock().unwrap().take();
            if let Some(hook) = hook {
                hook();
            }
        }
    }

    /// Mark fired without running the hook (discard paths).
    pub fn disarm(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            self.hook.lock().unwrap().take();
        }
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

/// Caller-side overrides for one injection watch. Defaults route assistant
/// text to the chat surface and announce completion.
#[derive(Default)]
pub struct WatchHooks {
    pub on_text: Option<TextCallback>,
    pub on_complete: Option<Box<dyn FnOnce() + Send>>,
}

struct ActiveWatch {
    handle: TurnWatcherHandle,
    complete: CompletionGuard,
}

/// Internal fields are individually shared so watcher callbacks and the
/// compaction poll capture exactly what they need.
pub struct WatcherManager {
    index: Arc<SessionIndex>,
    notifier: Notifier,
    active: Arc<Mutex<Option<ActiveWatch>>>,
    generation: Arc<AtomicU64>,
    pending_images: Arc<Mutex<HashMap<String, Vec<ImageAttachment>>>>,
}

impl WatcherManager {
    pub fn new(index: Arc<SessionIndex>, notifier: Notifier) -> Self {
        Self {
            index,
            notifier,
            active: Arc::new(Mutex::new(None)),
            generation: Arc::new(AtomicU64::new(0)),
            pending_images: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn snapshot_baseline(&self, cwd: &str) -> Option<Baseline> {
        self.index.snapshot_baseline(cwd).await
    }

    /// Whether a watch is currently running and not yet completed.
    pub fn is_active(&self) -> bool {
        self.active
            .lock()
            .unwrap()
            .as_ref()
            .map(|a| !a.complete.is_fired())
            .unwrap_or(false)
    }

    /// Stop the active watch and fire its completion. Used when a new user
    /// message supersedes a running turn.
    pub fn stop_and_flush(&self) {
        if let Some(active) = self.active.lock().unwrap().take() {
            active.handle.stop();
            active.complete.fire();
        }
    }

    /// Stop the active watch without firing completion (detach/shutdown).
    pub fn clear(&self) {
        if let Some(active) = self.active.lock().unwrap().take() {
            active.handle.stop();
            active.complete.disarm();
        }
    }

    // ============ Pending images ============

    pub fn store_pending_images(&self, key: &str, images: Vec<ImageAttachment>) {
        self.pending_images
            .lock()
            .unwrap()
            .insert(key.to_string(), images);
    }

    /// Pop a batch by key; entries are single-use.
    pub fn take_pending_images(&self, key: &str) -> Option<Vec<ImageAttachment>> {
        self.pending_images.lock().unwrap().remove(key)
    }

    /// Newest pending batch (keys are timestamps): `(key, count)`.
    pub fn latest_pending_images(&self) -> Option<(String, usize)> {
        let pending = self.pending_images.lock().unwrap();
        pending
            .iter()
            .max_by(|a, b| a.0.cmp(b.0))
            .map(|(k, v)| (k.clone(), v.len()))
    }

    // ============ Watch lifecycle ============

    /// Arm a turn watcher for an injection that just happened. Supersedes any
    /// running watch, resolves the baseline, tracks session rotation, and
    /// starts the compaction poll.
    pub async fn start_injection_watcher(
        &self,
        attached: &AttachedSession,
        chat_id: i64,
        hooks: WatchHooks,
        pre_baseline: Option<Baseline>,
    ) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.stop_and_flush();

        let text_seen = Arc::new(AtomicBool::new(false));
        let guard = {
            let text_seen = text_seen.clone();
            let notifier = self.notifier.clone();
            let caller_complete = hooks.on_complete;
            CompletionGuard::new(Box::new(move || {
                if let Some(complete) = caller_complete {
                    complete();
                }
                // "Done" ping is suppressed when a text reply already went out.
                if !text_seen.load(Ordering::SeqCst) {
                    notifier.turn_done(chat_id);
                }
            }))
        };

        let baseline = match pre_baseline {
            Some(b) => Some(b),
            None => self.index.snapshot_baseline(&attached.cwd).await,
        };
        let Some(baseline) = baseline else {
            // Nothing to watch.
            debug!(cwd = %attached.cwd, "No session file for cwd, completing immediately");
            guard.fire();
            return;
        };

        // Session rotated between attach-time and now.
        if baseline.session_id != attached.session_id {
            info!(
                old = %attached.session_id,
                new = %baseline.session_id,
                "Session rotated before injection, rewriting attached marker"
            );
            if let Err(e) = self
                .index
                .write_attached(&baseline.session_id, &attached.cwd)
                .await
            {
                warn!(error = %e, "Failed to rewrite attached marker");
            }
        }

        let project_name = project_name_of(&attached.cwd);
        let callbacks = self.compose_callbacks(chat_id, hooks.on_text, &guard, &text_seen);

        let opts = TurnWatcherOptions::new(
            baseline.file_path.clone(),
            baseline.size,
            baseline.session_id.clone(),
            attached.cwd.clone(),
            project_name.clone(),
        );
        let handle = turn::spawn(opts, callbacks.clone());

        *self.active.lock().unwrap() = Some(ActiveWatch {
            handle,
            complete: guard.clone(),
        });

        self.spawn_compaction_poll(CompactionPoll {
            generation,
            cwd: attached.cwd.clone(),
            project_name,
            watched: baseline.file_path,
            callbacks,
            guard,
            text_seen,
        });
    }

    fn compose_callbacks(
        &self,
        chat_id: i64,
        custom_text: Option<TextCallback>,
        guard: &CompletionGuard,
        text_seen: &Arc<AtomicBool>,
    ) -> TurnCallbacks {
        let on_text: TextCallback = {
            let text_seen = text_seen.clone();
            match custom_text {
                Some(custom) => Arc::new(move |turn_text| {
                    text_seen.store(true, Ordering::SeqCst);
                    custom(turn_text);
                }),
                None => {
                    let notifier = self.notifier.clone();
                    Arc::new(move |turn_text| {
                        text_seen.store(true, Ordering::SeqCst);
                        notifier.assistant_text(chat_id, &turn_text);
                    })
                }
            }
        };

        let on_ping = {
            let notifier = self.notifier.clone();
            Arc::new(move || notifier.still_working(chat_id)) as turn::EventCallback
        };

        let on_images = {
            let pending = self.pending_images.clone();
            let notifier = self.notifier.clone();
            Arc::new(move |images: Vec<ImageAttachment>| {
                let key = chrono::Utc::now().timestamp_millis().to_string();
                let count = images.len();
                pending.lock().unwrap().insert(key.clone(), images);
                notifier.offer_images(chat_id, &key, count);
            }) as turn::ImagesCallback
        };

        let on_waiting = {
            let notifier = self.notifier.clone();
            Arc::new(move |kind: WaitingKind, tail: Option<String>| {
                notifier.waiting(chat_id, kind, tail.as_deref());
            }) as turn::WaitingCallback
        };

        let on_complete = {
            let guard = guard.clone();
            Arc::new(move || guard.fire()) as turn::EventCallback
        };

        TurnCallbacks {
            on_text,
            on_ping: Some(on_ping),
            on_complete: Some(on_complete),
            on_images: Some(on_images),
            on_waiting: Some(on_waiting),
        }
    }

    /// Every 3 s, re-resolve the latest session file for the cwd. A different
    /// file means the agent rotated (compaction or /clear): restart a watcher
    /// there with baseline 0 and the same callbacks. Polls from superseded
    /// generations exit on their next tick.
    fn spawn_compaction_poll(&self, mut poll: CompactionPoll) {
        let index = self.index.clone();
        let active = self.active.clone();
        let generation = self.generation.clone();

        tokio::spawn(async move {
            let mut rotated = false;
            let deadline = Instant::now() + COMPACTION_GIVE_UP;

            loop {
                tokio::time::sleep(COMPACTION_POLL_INTERVAL).await;

                if generation.load(Ordering::SeqCst) != poll.generation
                    || poll.guard.is_fired()
                {
                    return;
                }

                if Instant::now() >= deadline {
                    // A rotated watch that never produced output is a turn
                    // that died in compaction; close it out. An untouched or
                    // streaming watch is left to its own termination.
                    if rotated && !poll.text_seen.load(Ordering::SeqCst) {
                        {
                            let mut active = active.lock().unwrap();
                            if generation.load(Ordering::SeqCst) == poll.generation {
                                if let Some(watch) = active.take() {
                                    watch.handle.stop();
                                }
                            }
                        }
                        warn!(cwd = %poll.cwd, "Compaction poll gave up, completing turn");
                        poll.guard.fire();
                    }
                    return;
                }

                let Some((session_id, path)) =
                    index.latest_session_file_for_cwd(&poll.cwd).await
                else {
                    continue;
                };
                if path == poll.watched {
                    continue;
                }

                info!(
                    cwd = %poll.cwd,
                    old = ?poll.watched,
                    new = ?path,
                    "Transcript rotated, re-arming watch from byte 0"
                );

                {
                    let mut active = active.lock().unwrap();
                    if generation.load(Ordering::SeqCst) != poll.generation {
                        return;
                    }
                    if let Some(watch) = active.as_mut() {
                        watch.handle.stop();
                        let opts = TurnWatcherOptions::new(
                            path.clone(),
                            0,
                            session_id.clone(),
                            poll.cwd.clone(),
                            poll.project_name.clone(),
                        );
                        watch.handle = turn::spawn(opts, poll.callbacks.clone());
                    }
                }

                if let Err(e) = index.write_attached(&session_id, &poll.cwd).await {
                    warn!(error = %e, "Failed to rewrite attached marker after rotation");
                }
                poll.watched = path;
                rotated = true;
            }
        });
    }
}

struct CompactionPoll {
    generation: u64,
    cwd: String,
    project_name: String,
    watched: PathBuf,
    callbacks: TurnCallbacks,
    guard: CompletionGuard,
    text_seen: Arc<AtomicBool>,
}

fn project_name_of(cwd: &str) -> String {
    cwd.rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or(cwd)
        .to_string()
}
