//! Per-turn transcript watcher.
//!
//! Watches one session file from a byte baseline captured at injection time
//! and emits assistant output as it lands on disk. Filesystem change events
//! drive the fast path; a short poll tick catches missed events. The watcher
//! terminates on exactly one of: a `result` record (after a short grace for
//! trailing blocks), the hard idle timeout, or an external `stop()`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::classify::{classify_waiting, WaitingKind};
use crate::transcript::reader::{file_size, read_new_records};
use crate::transcript::types::{
    record_type, AssistantRecord, ContentBlock, EXIT_PLAN_MODE_TOOL, WRITE_TOOL,
};

/// "Still working" ping after this much silence with no text delivered.
pub const IDLE_PING: Duration = Duration::from_secs(60);
/// Hard termination after this much time without transcript growth.
pub const HARD_IDLE: Duration = Duration::from_secs(120);
/// Wait after a `result` record for trailing blocks in the same flush.
pub const RESULT_GRACE: Duration = Duration::from_millis(500);
/// Quiet window before the waiting classifier is consulted.
pub const QUIET_WINDOW: Duration = Duration::from_secs(3);
/// Size-poll safety net for missed filesystem events.
const POLL_TICK: Duration = Duration::from_millis(150);

/// Image file extensions the watcher collects from `Write` tool calls.
const IMAGE_EXTS: [&str; 5] = ["png", "jpg", "jpeg", "gif", "webp"];

/// One assistant text block, attributed to its session.
#[derive(Debug, Clone)]
pub struct TurnText {
    pub session_id: String,
    pub project_name: String,
    pub cwd: String,
    pub file_path: PathBuf,
    pub text: String,
}

/// An image referenced by the turn, read from disk and base64-encoded.
#[derive(Debug, Clone)]
pub struct ImageAttachment {
    pub media_type: String,
    pub data_b64: String,
}

pub type TextCallback = Arc<dyn Fn(TurnText) + Send + Sync>;
pub type EventCallback = Arc<dyn Fn() + Send + Sync>;
pub type ImagesCallback = Arc<dyn Fn(Vec<ImageAttachment>) + Send + Sync>;
pub type WaitingCallback = Arc<dyn Fn(WaitingKind, Option<String>) + Send + Sync>;

/// Fan-out targets for one watch. The manager composes its own wrappers
/// around caller-supplied callbacks before spawning.
#[derive(Clone)]
pub struct TurnCallbacks {
    pub on_text: TextCallback,
    pub on_ping: Option<EventCallback>,
    pub on_complete: Option<EventCallback>,
    pub on_images: Option<ImagesCallback>,
    pub on_waiting: Option<WaitingCallback>,
}

impl TurnCallbacks {
    pub fn new(on_text: TextCallback) -> Self {
        Self {
            on_text,
            on_ping: None,
            on_complete: None,
            on_images: None,
            on_waiting: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TurnWatcherOptions {
    pub file_path: PathBuf,
    pub baseline_size: u64,
    pub session_id: String,
    pub cwd: String,
    pub project_name: String,
    pub idle_ping: Duration,
    pub hard_idle: Duration,
    pub result_grace: Duration,
}

impl TurnWatcherOptions {
    pub fn new(
        file_path: PathBuf,
        baseline_size: u64,
        session_id: impl Into<String>,
        cwd: impl Into<String>,
        project_name: impl Into<String>,
    ) -> Self {
        Self {
            file_path,
            baseline_size,
            session_id: session_id.into(),
            cwd: cwd.into(),
            project_name: project_name.into(),
            idle_ping: IDLE_PING,
            hard_idle: HARD_IDLE,
            result_grace: RESULT_GRACE,
        }
    }
}

/// Handle to a running watcher. `stop()` is idempotent and never fires the
/// completion callback; completion belongs to the watcher's own termination
/// paths (or to whoever composes the callbacks).
#[derive(Clone)]
pub struct TurnWatcherHandle {
    stop: Arc<Notify>,
    stopped: Arc<AtomicBool>,
}

impl TurnWatcherHandle {
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.stop.notify_one();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Start watching. Returns immediately; all events arrive on the callbacks.
pub fn spawn(opts: TurnWatcherOptions, callbacks: TurnCallbacks) -> TurnWatcherHandle {
    let stop = Arc::new(Notify::new());
    let stopped = Arc::new(AtomicBool::new(false));
    let handle = TurnWatcherHandle {
        stop: stop.clone(),
        stopped: stopped.clone(),
    };
    tokio::spawn(run(opts, callbacks, stop, stopped));
    handle
}

struct WatchState {
    cursor: u64,
    emitted: HashSet<String>,
    text_delivered: bool,
    last_text: Option<String>,
    exit_plan_seen: bool,
    image_paths: Vec<PathBuf>,
    image_seen: HashSet<PathBuf>,
    result_seen: bool,
}

async fn run(
    opts: TurnWatcherOptions,
    callbacks: TurnCallbacks,
    stop: Arc<Notify>,
    stopped: Arc<AtomicBool>,
) {
    let (fs_tx, mut fs_rx) = mpsc::channel::<()>(16);

    // The notify watcher runs on its own thread; a full channel just means a
    // change event is already pending, which is fine to drop.
    let mut fs_watcher = match RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            if res.is_ok() {
                let _ = fs_tx.try_send(());
            }
        },
        NotifyConfig::default(),
    ) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!(error = %e, "Filesystem watcher unavailable, polling only");
            None
        }
    };

    if let Some(watcher) = fs_watcher.as_mut() {
        if let Err(e) = watcher.watch(&opts.file_path, RecursiveMode::NonRecursive) {
            // File may be gone or not yet visible; the poll tick covers it
            // and permanent disappearance surfaces as idle.
            debug!(path = ?opts.file_path, error = %e, "File watch unavailable, polling only");
        }
    }

    let mut state = WatchState {
        cursor: opts.baseline_size,
        emitted: HashSet::new(),
        text_delivered: false,
        last_text: None,
        exit_plan_seen: false,
        image_paths: Vec::new(),
        image_seen: HashSet::new(),
        result_seen: false,
    };

    let started = Instant::now();
    let mut last_progress = started;
    let mut last_change = started;
    let mut grace_deadline: Option<Instant> = None;
    let mut ping_fired = false;
    let mut waiting_checked = false;
    let mut fs_alive = fs_watcher.is_some();

    debug!(
        path = ?opts.file_path,
        baseline = opts.baseline_size,
        session_id = %opts.session_id,
        "Turn watch armed"
    );

    loop {
        let now = Instant::now();

        if let Some(deadline) = grace_deadline {
            if now >= deadline {
                finish(&opts, &callbacks, &state, "result").await;
                stopped.store(true, Ordering::SeqCst);
                return;
            }
        }
        if now.saturating_duration_since(last_progress) >= opts.hard_idle {
            finish(&opts, &callbacks, &state, "hard_idle").await;
            stopped.store(true, Ordering::SeqCst);
            return;
        }

        if !ping_fired
            && !state.text_delivered
            && now.saturating_duration_since(started) >= opts.idle_ping
        {
            ping_fired = true;
            if let Some(on_ping) = &callbacks.on_ping {
                on_ping();
            }
        }

        if !waiting_checked
            && grace_deadline.is_none()
            && now.saturating_duration_since(last_change) >= QUIET_WINDOW
        {
            waiting_checked = true;
            if let Some(on_waiting) = &callbacks.on_waiting {
                if let Some(kind) =
                    classify_waiting(state.last_text.as_deref(), state.exit_plan_seen)
                {
                    on_waiting(kind, state.last_text.clone());
                }
            }
        }

        let sleep_for = next_sleep(
            now,
            grace_deadline,
            last_progress + opts.hard_idle,
            (!ping_fired && !state.text_delivered).then(|| started + opts.idle_ping),
            (!waiting_checked).then(|| last_change + QUIET_WINDOW),
        );

        tokio::select! {
            _ = stop.notified() => {
                debug!(session_id = %opts.session_id, "Turn watch stopped externally");
                return;
            }
            event = fs_rx.recv(), if fs_alive => {
                if event.is_none() {
                    fs_alive = false;
                    continue;
                }
                if process_changes(&opts, &callbacks, &mut state).await {
                    last_progress = Instant::now();
                    last_change = last_progress;
                    waiting_checked = false;
                    if state.result_seen && grace_deadline.is_none() {
                        grace_deadline = Some(Instant::now() + opts.result_grace);
                    }
                }
            }
            _ = tokio::time::sleep(sleep_for) => {
                if process_changes(&opts, &callbacks, &mut state).await {
                    last_progress = Instant::now();
                    last_change = last_progress;
                    waiting_checked = false;
                    if state.result_seen && grace_deadline.is_none() {
                        grace_deadline = Some(Instant::now() + opts.result_grace);
                    }
                }
            }
        }
    }
}

/// Shortest wait that cannot overshoot a pending deadline.
fn next_sleep(
    now: Instant,
    grace: Option<Instant>,
    hard_idle_at: Instant,
    ping_at: Option<Instant>,
    quiet_at: Option<Instant>,
) -> Duration {
    let mut sleep_for = POLL_TICK.min(hard_idle_at.saturating_duration_since(now));
    if let Some(at) = grace {
        sleep_for = sleep_for.min(at.saturating_duration_since(now));
    }
    if let Some(at) = ping_at {
        sleep_for = sleep_for.min(at.saturating_duration_since(now));
    }
    if let Some(at) = quiet_at {
        sleep_for = sleep_for.min(at.saturating_duration_since(now));
    }
    sleep_for.max(Duration::from_millis(10))
}

/// Read and handle everything past the cursor. Returns whether the cursor
/// advanced. Read errors skip this round and keep the watch alive.
async fn process_changes(
    opts: &TurnWatcherOptions,
    callbacks: &TurnCallbacks,
    state: &mut WatchState,
) -> bool {
    let size = file_size(&opts.file_path).await;
    if size <= state.cursor {
        return false;
    }

    let (records, new_pos) = match read_new_records(&opts.file_path, state.cursor).await {
        Ok(result) => result,
        Err(e) => {
            debug!(path = ?opts.file_path, error = %e, "Transcript read failed, skipping event");
            return false;
        }
    };

    let progressed = new_pos > state.cursor;
    state.cursor = new_pos;

    for record in records {
        handle_record(opts, callbacks, state, record);
    }
    progressed
}

fn handle_record(
    opts: &TurnWatcherOptions,
    callbacks: &TurnCallbacks,
    state: &mut WatchState,
    record: Value,
) {
    match record_type(&record) {
        "assistant" => {
            let parsed: AssistantRecord = match serde_json::from_value(record) {
                Ok(r) => r,
                Err(_) => return,
            };
            for block in parsed.message.content {
                match block {
                    ContentBlock::Text { text } => {
                        state.last_text = Some(text.clone());
                        if state.emitted.insert(text.clone()) {
                            state.text_delivered = true;
                            (callbacks.on_text)(TurnText {
                                session_id: opts.session_id.clone(),
                                project_name: opts.project_name.clone(),
                                cwd: opts.cwd.clone(),
                                file_path: opts.file_path.clone(),
                                text,
                            });
                        }
                    }
                    ContentBlock::ToolUse { name, input } => {
                        if name == EXIT_PLAN_MODE_TOOL {
                            state.exit_plan_seen = true;
                        } else if name == WRITE_TOOL {
                            if let Some(path) = image_path_from_input(&input) {
                                if state.image_seen.insert(path.clone()) {
                                    state.image_paths.push(path);
                                }
                            }
                        }
                    }
                    ContentBlock::Other => {}
                }
            }
        }
        "result" => {
            state.result_seen = true;
        }
        _ => {}
    }
}

fn image_path_from_input(input: &Value) -> Option<PathBuf> {
    let path = input.get("file_path").and_then(|p| p.as_str())?;
    let ext = Path::new(path).extension()?.to_str()?.to_ascii_lowercase();
    if IMAGE_EXTS.contains(&ext.as_str()) {
        Some(PathBuf::from(path))
    } else {
        None
    }
}

pub fn media_type_for_extension(ext: &str) -> &'static str {
    match ext {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

async fn finish(
    opts: &TurnWatcherOptions,
    callbacks: &TurnCallbacks,
    state: &WatchState,
    cause: &str,
) {
    debug!(session_id = %opts.session_id, cause, "Turn watch finished");

    if let Some(on_images) = &callbacks.on_images {
        let images = collect_images(&state.image_paths).await;
        if !images.is_empty() {
            on_images(images);
        }
    }
    if let Some(on_complete) = &callbacks.on_complete {
        on_complete();
    }
}

/// Read referenced image files from disk. Files the agent moved or deleted in
/// the meantime are skipped silently.
async fn collect_images(paths: &[PathBuf]) -> Vec<ImageAttachment> {
    let mut images = Vec::new();
    for path in paths {
        match tokio::fs::read(path).await {
            Ok(bytes) => {
                let ext = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e.to_ascii_lowercase())
                    .unwrap_or_default();
                images.push(ImageAttachment {
                    media_type: media_type_for_extension(&ext).to_string(),
                    data_b64: base64::engine::general_purpose::STANDARD.encode(&bytes),
                });
            }
            Err(e) => {
                debug!(path = ?path, error = %e, "Referenced image unreadable, skipping");
            }
        }
    }
    if !images.is_empty() {
        debug!(count = images.len(), "Collected turn images");
    }
    images
}
