//! Coordinator: receives chat events, drives the injection pipeline, and
//! routes the out-of-band surfaces (session picker, permission approvals,
//! image offers, prompt timer, model switcher).
//!
//! The allowlist is applied before any handler. Every text turn follows the
//! same shape: ensure attached, interrupt a still-running turn, capture a
//! pre-injection baseline, inject, arm the watcher manager.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use tracing::{debug, info, warn};

use crate::config::{BridgeConfig, BridgePaths};
use crate::notify_surface::{
    spawn_notifier, ChatEvent, ChatSurface, InlineButton, Notifier, Polisher, SpeechService,
};
use crate::permission::{PermissionAction, PermissionBridge};
use crate::timer::{PromptTimer, TimerDeps};
use crate::tmux::inject::{send_text_and_submit, InjectOutcome, Injector};
use crate::tmux::locator::{wait_for_pane, PaneLocator, PaneLookup};
use crate::transcript::index::SessionIndex;
use crate::transcript::reader::last_assistant_entry;
use crate::transcript::types::AttachedSession;
use crate::watch::manager::{WatchHooks, WatcherManager};

/// Settle time after interrupting a running turn before the next injection.
const INTERRUPT_SETTLE: Duration = Duration::from_millis(600);
/// Cadence of the transient "typing" indicator while a turn runs.
const TYPING_PERIOD: Duration = Duration::from_secs(4);
/// How long to wait for a freshly launched pane to become visible.
const LAUNCH_WAIT_ATTEMPTS: u32 = 15;
/// Session picker depth.
const PICKER_LIMIT: usize = 8;

const HELP_TEXT: &str = "\
/sessions - pick or launch a session\n\
/detach - detach from the current session\n\
/status - bridge status\n\
/summarize - summarize the last assistant reply\n\
/compact - send /compact to the agent\n\
/clear - send /clear to the agent\n\
/close_session - close the agent window and detach\n\
/polishvoice - toggle voice-transcript polishing\n\
/images - send images captured from the last turn\n\
/timer [stop | <min> <prompt>] - recurring prompt\n\
/model - switch the agent model\n\
/escape - interrupt the current turn\n\
/restart - restart the bridge\n\
/help - this text";

/// Special states that consume the next plain text message.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PendingInput {
    None,
    ImageCount { key: String },
    TimerFrequency,
    TimerPrompt { frequency_min: u64 },
}

#[derive(Debug, Clone)]
struct PendingSession {
    cwd: String,
    project_name: String,
}

pub struct CoordinatorOptions {
    pub paths: BridgePaths,
    pub allowed_chat_id: Option<i64>,
    /// Env-guarded half of the permission double-dispatch: also press a key
    /// in the pane when answering a permission request.
    pub permission_keys: bool,
}

impl CoordinatorOptions {
    pub fn from_env(paths: BridgePaths) -> Self {
        let config = BridgeConfig::load(&paths);
        let permission_keys = std::env::var("CCBRIDGE_PERMISSION_KEYS")
            .map(|v| v != "off")
            .unwrap_or(true);
        Self {
            paths,
            allowed_chat_id: config.allowed_chat_id,
            permission_keys,
        }
    }
}

pub struct Coordinator {
    paths: BridgePaths,
    allowed_chat_id: Option<i64>,
    permission_keys: bool,
    index: Arc<SessionIndex>,
    locator: Arc<PaneLocator>,
    injector: Arc<Injector>,
    manager: Arc<WatcherManager>,
    timer: PromptTimer,
    permissions: PermissionBridge,
    surface: Arc<dyn ChatSurface>,
    notifier: Notifier,
    speech: Option<Arc<dyn SpeechService>>,
    polisher: Option<Arc<dyn Polisher>>,
    /// Pane created by the launch flow; fallback when the locator misses.
    launched_pane: Mutex<Option<String>>,
    pending_input: Mutex<PendingInput>,
    pending_sessions: Mutex<HashMap<String, PendingSession>>,
}

impl Coordinator {
    pub fn new(
        options: CoordinatorOptions,
        surface: Arc<dyn ChatSurface>,
        speech: Option<Arc<dyn SpeechService>>,
        polisher: Option<Arc<dyn Polisher>>,
    ) -> Arc<Self> {
        let index = Arc::new(SessionIndex::new(&options.paths));
        let locator = Arc::new(PaneLocator::new());
        let injector = Arc::new(Injector::new(locator.clone()));
        let notifier = spawn_notifier(surface.clone());
        let manager = Arc::new(WatcherManager::new(index.clone(), notifier.clone()));
        let permissions = PermissionBridge::new(options.paths.home().to_path_buf());

        Arc::new(Self {
            paths: options.paths,
            allowed_chat_id: options.allowed_chat_id,
            permission_keys: options.permission_keys,
            index,
            locator,
            injector,
            manager,
            timer: PromptTimer::new(),
            permissions,
            surface,
            notifier,
            speech,
            polisher,
            launched_pane: Mutex::new(None),
            pending_input: Mutex::new(PendingInput::None),
            pending_sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Dispatch one inbound event. Updates from other chats are dropped
    /// silently before anything else runs.
    pub async fn handle_event(&self, event: ChatEvent) {
        if let Some(allowed) = self.allowed_chat_id {
            if event.chat_id() != allowed {
                debug!(chat_id = event.chat_id(), "Dropping update from non-allowlisted chat");
                return;
            }
        }
        self.remember_chat_id(event.chat_id()).await;

        match event {
            ChatEvent::Text { chat_id, text } => self.handle_text(chat_id, text).await,
            ChatEvent::Command {
                chat_id,
                name,
                args,
            } => self.handle_command(chat_id, &name, &args).await,
            ChatEvent::Voice {
                chat_id,
                file_id,
                file_name_hint,
            } => {
                self.handle_voice(chat_id, &file_id, file_name_hint.as_deref())
                    .await
            }
            ChatEvent::Photo {
                chat_id,
                file_id,
                mime,
                caption,
            } => {
                self.handle_photo(chat_id, &file_id, mime.as_deref(), caption.as_deref())
                    .await
            }
            ChatEvent::Callback {
                chat_id,
                callback_id,
                data,
                ..
            } => self.handle_callback(chat_id, &callback_id, &data).await,
        }
    }

    /// Send the boot notice to the last-seen chat, if any.
    pub async fn send_startup_notice(&self) {
        if let Some(chat_id) = self.notify_chat_id().await {
            self.notifier.text(chat_id, "🌉 ccbridge is online.");
        }
    }

    /// Watch for permission request files and surface them for approval.
    pub fn spawn_permission_loop(&self) {
        let permissions = self.permissions.clone();
        let notifier = self.notifier.clone();
        let allowed_chat_id = self.allowed_chat_id;
        let chat_id_file = self.paths.chat_id_file();

        tokio::spawn(async move {
            let (_watch_handle, mut rx) = permissions.watch().await;
            while let Some(request) = rx.recv().await {
                let Some(chat_id) = resolve_chat_id(allowed_chat_id, &chat_id_file).await else {
                    warn!(
                        request_id = %request.request_id,
                        "Permission request with no chat to notify"
                    );
                    continue;
                };

                let mut text = format!("🔐 Permission request: {}", request.tool_name);
                if let Some(command) = &request.tool_command {
                    text.push('\n');
                    text.push_str(command);
                } else if !request.tool_input.is_null() {
                    let preview = request.tool_input.to_string();
                    let preview: String = preview.chars().take(200).collect();
                    text.push('\n');
                    text.push_str(&preview);
                }

                notifier.keyboard(
                    chat_id,
                    text,
                    vec![vec![
                        InlineButton::new(
                            "✅ Approve",
                            format!("perm:approve:{}", request.request_id),
                        ),
                        InlineButton::new("❌ Deny", format!("perm:deny:{}", request.request_id)),
                    ]],
                );
            }
        });
    }

    // ============ Text turns ============

    async fn handle_text(&self, chat_id: i64, text: String) {
        let pending =
            std::mem::replace(&mut *self.pending_input.lock().unwrap(), PendingInput::None);
        match pending {
            PendingInput::ImageCount { key } => {
                self.send_pending_images(chat_id, &key, text.trim()).await;
                return;
            }
            PendingInput::TimerFrequency => {
                match text.trim().parse::<u64>() {
                    Ok(minutes) if minutes > 0 => {
                        *self.pending_input.lock().unwrap() = PendingInput::TimerPrompt {
                            frequency_min: minutes,
                        };
                        self.notifier
                            .text(chat_id, "And what prompt should I send each time?");
                    }
                    _ => {
                        *self.pending_input.lock().unwrap() = PendingInput::TimerFrequency;
                        self.notifier
                            .text(chat_id, "Send a number of minutes (e.g. 30).");
                    }
                }
                return;
            }
            PendingInput::TimerPrompt { frequency_min } => {
                self.start_timer(chat_id, frequency_min, text);
                return;
            }
            PendingInput::None => {}
        }

        self.run_text_turn(chat_id, text).await;
    }

    async fn run_text_turn(&self, chat_id: i64, text: String) {
        let Some(attached) = self.ensure_attached(chat_id).await else {
            return;
        };

        // A still-running turn is interrupted first, then superseded.
        if self.manager.is_active() {
            if let PaneLookup::Found { pane_id } = self.locator.find(&attached.cwd).await {
                self.injector.send_interrupt(&pane_id).await;
            }
            self.manager.stop_and_flush();
            tokio::time::sleep(INTERRUPT_SETTLE).await;
        }

        let baseline = self.manager.snapshot_baseline(&attached.cwd).await;

        let fallback = self.launched_pane.lock().unwrap().clone();
        match self
            .injector
            .inject(&attached.cwd, &text, fallback.as_deref())
            .await
        {
            InjectOutcome::Injected { pane_id } => {
                debug!(pane_id = %pane_id, "User message injected");
            }
            InjectOutcome::NotInjected { reason } => {
                self.notifier.text(
                    chat_id,
                    format!(
                        "⚠️ No Claude Code running at {} ({}). Use /sessions to pick or launch one.",
                        attached.cwd,
                        reason.describe()
                    ),
                );
                return;
            }
        }

        // Transient typing indicator until the turn completes.
        let done = Arc::new(AtomicBool::new(false));
        {
            let done = done.clone();
            let notifier = self.notifier.clone();
            tokio::spawn(async move {
                while !done.load(Ordering::SeqCst) {
                    notifier.typing(chat_id);
                    tokio::time::sleep(TYPING_PERIOD).await;
                }
            });
        }

        let hooks = WatchHooks {
            on_text: None,
            on_complete: Some(Box::new(move || done.store(true, Ordering::SeqCst))),
        };
        self.manager
            .start_injection_watcher(&attached, chat_id, hooks, baseline)
            .await;
    }

    async fn ensure_attached(&self, chat_id: i64) -> Option<AttachedSession> {
        if let Some(attached) = self.index.attached_session().await {
            return Some(attached);
        }

        // Auto-attach to the single most recently modified session.
        let Some(session) = self.index.list_sessions(1).await.into_iter().next() else {
            self.notifier.text(
                chat_id,
                "No Claude Code sessions found. Start one in tmux, then /sessions.",
            );
            return None;
        };
        if let Err(e) = self
            .index
            .write_attached(&session.session_id, &session.cwd)
            .await
        {
            warn!(error = %e, "Auto-attach failed");
            self.notifier
                .text(chat_id, "Could not write the attached-session marker.");
            return None;
        }
        self.notifier.text(
            chat_id,
            format!("📌 Attached to {} ({})", session.project_name, session.cwd),
        );
        Some(AttachedSession {
            session_id: session.session_id,
            cwd: session.cwd,
        })
    }

    // ============ Commands ============

    async fn handle_command(&self, chat_id: i64, name: &str, args: &str) {
        match name {
            "sessions" => self.cmd_sessions(chat_id).await,
            "detach" => self.cmd_detach(chat_id).await,
            "status" => self.cmd_status(chat_id).await,
            "summarize" => self.cmd_summarize(chat_id).await,
            "compact" => self.cmd_agent_slash(chat_id, "/compact").await,
            "clear" => self.cmd_agent_slash(chat_id, "/clear").await,
            "close_session" => self.cmd_close_session(chat_id).await,
            "polishvoice" => self.cmd_polishvoice(chat_id).await,
            "images" => self.cmd_images(chat_id).await,
            "timer" => self.cmd_timer(chat_id, args).await,
            "model" => self.cmd_model(chat_id),
            "escape" => self.cmd_escape(chat_id).await,
            "restart" => self.cmd_restart(chat_id).await,
            "help" | "start" => self.notifier.text(chat_id, HELP_TEXT),
            _ => self
                .notifier
                .text(chat_id, "Unknown command. Try /help."),
        }
    }

    async fn cmd_sessions(&self, chat_id: i64) {
        let panes = self.locator.list_panes().await;
        let claude_panes: Vec<_> = panes
            .into_iter()
            .filter(|p| crate::tmux::locator::is_claude_command(&p.command))
            .collect();

        let mut rows: Vec<Vec<InlineButton>> = Vec::new();
        let mut entries: Vec<(String, PendingSession)> = Vec::new();
        let mut seen_cwds: HashSet<String> = HashSet::new();

        for pane in &claude_panes {
            if !seen_cwds.insert(pane.cwd.clone()) {
                continue;
            }
            let Some((session_id, _)) = self.index.latest_session_file_for_cwd(&pane.cwd).await
            else {
                continue;
            };
            let project_name = project_label(&pane.cwd);
            entries.push((
                session_id.clone(),
                PendingSession {
                    cwd: pane.cwd.clone(),
                    project_name: project_name.clone(),
                },
            ));
            rows.push(vec![InlineButton::new(
                format!("🟢 {}", project_name),
                format!("attach:{}", session_id),
            )]);
        }

        // Recent sessions with no running pane get the launch flow.
        for session in self.index.list_sessions(PICKER_LIMIT).await {
            if !seen_cwds.insert(session.cwd.clone()) {
                continue;
            }
            entries.push((
                session.session_id.clone(),
                PendingSession {
                    cwd: session.cwd.clone(),
                    project_name: session.project_name.clone(),
                },
            ));
            rows.push(vec![InlineButton::new(
                format!("⚪ {}", session.project_name),
                format!("attach:{}", session.session_id),
            )]);
        }

        {
            let mut pending = self.pending_sessions.lock().unwrap();
            pending.clear();
            pending.extend(entries);
        }

        if rows.is_empty() {
            self.notifier
                .text(chat_id, "No Claude Code sessions found.");
        } else {
            self.notifier.keyboard(chat_id, "Pick a session:", rows);
        }
    }

    async fn cmd_detach(&self, chat_id: i64) {
        let Some(attached) = self.index.attached_session().await else {
            self.notifier.text(chat_id, "Nothing is attached.");
            return;
        };
        match self.locator.find(&attached.cwd).await {
            PaneLookup::Found { pane_id } => {
                self.notifier.keyboard(
                    chat_id,
                    format!("Detach from {}?", attached.cwd),
                    vec![vec![
                        InlineButton::new("🪟 Close window", format!("detach:close:{}", pane_id)),
                        InlineButton::new("Keep running", "detach:keep".to_string()),
                    ]],
                );
            }
            PaneLookup::NotFound { .. } => {
                self.manager.clear();
                self.index.remove_attached().await;
                self.notifier.text(chat_id, "Detached.");
            }
        }
    }

    async fn cmd_status(&self, chat_id: i64) {
        let mut lines = Vec::new();
        match self.index.attached_session().await {
            Some(attached) => {
                lines.push(format!(
                    "📌 Attached: {} ({})",
                    project_label(&attached.cwd),
                    attached.cwd
                ));
                match self.locator.find(&attached.cwd).await {
                    PaneLookup::Found { pane_id } => {
                        lines.push(format!("🟢 Pane {} is running Claude Code", pane_id));
                    }
                    PaneLookup::NotFound { reason } => {
                        lines.push(format!("🔴 No pane: {}", reason.describe()));
                    }
                }
            }
            None => lines.push("📌 Not attached".to_string()),
        }
        lines.push(if self.manager.is_active() {
            "⏳ A turn is being watched".to_string()
        } else {
            "💤 No turn in flight".to_string()
        });
        if let Some(settings) = self.timer.current() {
            lines.push(format!(
                "⏰ Timer: every {} min - {}",
                settings.frequency_min, settings.prompt
            ));
        }
        self.notifier.text(chat_id, lines.join("\n"));
    }

    async fn cmd_summarize(&self, chat_id: i64) {
        let Some(attached) = self.index.attached_session().await else {
            self.notifier.text(chat_id, "Nothing is attached.");
            return;
        };
        let Some((_, file_path)) = self.index.latest_session_file_for_cwd(&attached.cwd).await
        else {
            self.notifier.text(chat_id, "No transcript found.");
            return;
        };
        let entry = last_assistant_entry(&file_path).await.unwrap_or_default();
        let Some(text) = entry.text else {
            self.notifier.text(chat_id, "No assistant output yet.");
            return;
        };

        // LLM summary when available, raw text block otherwise.
        let summary = match &self.polisher {
            Some(polisher) => match polisher.summarize(&text).await {
                Ok(summary) => summary,
                Err(e) => {
                    warn!(error = %e, "Summarize failed, falling back to raw text");
                    text
                }
            },
            None => text,
        };
        self.notifier.text(chat_id, format!("📝 {}", summary));
    }

    /// Send a literal agent slash command into the pane. Rotation caused by
    /// /clear or /compact is picked up when the next turn resolves its
    /// baseline (and by the compaction poll if a watch is active).
    async fn cmd_agent_slash(&self, chat_id: i64, command: &str) {
        let Some(attached) = self.index.attached_session().await else {
            self.notifier.text(chat_id, "Nothing is attached.");
            return;
        };
        match self.locator.find(&attached.cwd).await {
            PaneLookup::Found { pane_id } => {
                if let Err(e) = send_text_and_submit(&pane_id, command).await {
                    warn!(error = %e, "Slash command injection failed");
                    self.notifier
                        .text(chat_id, format!("Could not send {}.", command));
                } else {
                    self.notifier.text(chat_id, format!("Sent {}.", command));
                }
            }
            PaneLookup::NotFound { reason } => {
                self.notifier
                    .text(chat_id, format!("No pane: {}", reason.describe()));
            }
        }
    }

    async fn cmd_close_session(&self, chat_id: i64) {
        let Some(attached) = self.index.attached_session().await else {
            self.notifier.text(chat_id, "Nothing is attached.");
            return;
        };
        self.manager.clear();
        if let PaneLookup::Found { pane_id } = self.locator.find(&attached.cwd).await {
            self.locator.kill_window(&pane_id).await;
            self.notifier.text(chat_id, "🪟 Window closed and detached.");
        } else {
            self.notifier.text(chat_id, "Detached (no window found).");
        }
        self.index.remove_attached().await;
    }

    async fn cmd_polishvoice(&self, chat_id: i64) {
        let flag = self.paths.polish_voice_off();
        if flag.exists() {
            let _ = tokio::fs::remove_file(&flag).await;
            self.notifier.text(chat_id, "🗣 Voice polishing is ON.");
        } else {
            if let Some(parent) = flag.parent() {
                tokio::fs::create_dir_all(parent).await.ok();
            }
            let _ = tokio::fs::write(&flag, b"").await;
            self.notifier.text(chat_id, "🗣 Voice polishing is OFF.");
        }
    }

    async fn cmd_images(&self, chat_id: i64) {
        let Some((key, count)) = self.manager.latest_pending_images() else {
            self.notifier.text(chat_id, "No images pending.");
            return;
        };
        *self.pending_input.lock().unwrap() = PendingInput::ImageCount { key };
        let noun = if count == 1 { "image is" } else { "images are" };
        self.notifier.text(
            chat_id,
            format!("{} {} waiting. How many should I send?", count, noun),
        );
    }

    async fn send_pending_images(&self, chat_id: i64, key: &str, reply: &str) {
        let requested = match reply.parse::<usize>() {
            Ok(n) if n > 0 => n,
            _ => {
                self.notifier
                    .text(chat_id, "That wasn't a number; skipping the images.");
                return;
            }
        };
        let Some(images) = self.manager.take_pending_images(key) else {
            self.notifier.text(chat_id, "Those images are gone.");
            return;
        };

        let mut sent = 0usize;
        for image in images.into_iter().take(requested) {
            let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(&image.data_b64)
            else {
                continue;
            };
            match self.surface.send_photo(chat_id, bytes, None).await {
                Ok(()) => sent += 1,
                Err(e) => warn!(error = %e, "Photo upload failed"),
            }
        }
        if sent == 0 {
            self.notifier.text(chat_id, "Could not send the images.");
        }
    }

    async fn cmd_timer(&self, chat_id: i64, args: &str) {
        let args = args.trim();
        if args.is_empty() {
            *self.pending_input.lock().unwrap() = PendingInput::TimerFrequency;
            self.notifier
                .text(chat_id, "Every how many minutes should I prompt?");
            return;
        }
        if args == "stop" {
            match self.timer.stop() {
                Some(settings) => self.notifier.text(
                    chat_id,
                    format!(
                        "⏰ Timer stopped (was every {} min: {}).",
                        settings.frequency_min, settings.prompt
                    ),
                ),
                None => self.notifier.text(chat_id, "No timer is running."),
            }
            return;
        }

        let mut parts = args.splitn(2, ' ');
        let minutes = parts.next().and_then(|m| m.parse::<u64>().ok());
        match (minutes, parts.next()) {
            (Some(minutes), Some(prompt)) if minutes > 0 && !prompt.trim().is_empty() => {
                self.start_timer(chat_id, minutes, prompt.trim().to_string());
            }
            _ => {
                self.notifier
                    .text(chat_id, "Usage: /timer stop | /timer <minutes> <prompt>");
            }
        }
    }

    fn start_timer(&self, chat_id: i64, frequency_min: u64, prompt: String) {
        let deps = TimerDeps {
            index: self.index.clone(),
            injector: self.injector.clone(),
            manager: self.manager.clone(),
            chat_id,
        };
        self.timer.start(frequency_min, prompt.clone(), deps);
        self.notifier.text(
            chat_id,
            format!("⏰ Every {} min I'll send: {}", frequency_min, prompt),
        );
    }

    fn cmd_model(&self, chat_id: i64) {
        self.notifier.keyboard(
            chat_id,
            "Switch model:",
            vec![
                vec![
                    InlineButton::new("Opus", "model:opus"),
                    InlineButton::new("Sonnet", "model:sonnet"),
                ],
                vec![
                    InlineButton::new("Haiku", "model:haiku"),
                    InlineButton::new("Default", "model:default"),
                ],
            ],
        );
    }

    async fn cmd_escape(&self, chat_id: i64) {
        let Some(attached) = self.index.attached_session().await else {
            self.notifier.text(chat_id, "Nothing is attached.");
            return;
        };
        match self.locator.find(&attached.cwd).await {
            PaneLookup::Found { pane_id } => {
                self.injector.send_interrupt(&pane_id).await;
                self.manager.stop_and_flush();
                self.notifier.text(chat_id, "⎋ Interrupt sent.");
            }
            PaneLookup::NotFound { reason } => {
                self.notifier
                    .text(chat_id, format!("No pane: {}", reason.describe()));
            }
        }
    }

    async fn cmd_restart(&self, chat_id: i64) {
        let _ = self.surface.send_text(chat_id, "♻️ Restarting…").await;
        self.manager.clear();
        info!("Restart requested from chat");
        std::process::exit(0);
    }

    // ============ Callbacks ============

    async fn handle_callback(&self, chat_id: i64, callback_id: &str, data: &str) {
        let mut parts = data.splitn(3, ':');
        let kind = parts.next().unwrap_or("");
        let arg1 = parts.next().unwrap_or("");
        let arg2 = parts.next().unwrap_or("");

        match kind {
            "attach" => self.cb_attach(chat_id, callback_id, arg1).await,
            "launch" => self.cb_launch(chat_id, callback_id, arg1, false).await,
            "launchskip" => self.cb_launch(chat_id, callback_id, arg1, true).await,
            "cancel" => {
                let _ = self.surface.answer_callback(callback_id, "Cancelled").await;
            }
            "perm" => {
                let approve = arg1 == "approve";
                self.respond_permission(arg2, approve).await;
                let notice = if approve { "Approved" } else { "Denied" };
                let _ = self.surface.answer_callback(callback_id, notice).await;
            }
            "plan" => {
                self.send_pane_key(arg1).await;
                let _ = self.surface.answer_callback(callback_id, "Sent").await;
            }
            "reply" => {
                self.cb_quick_reply(arg1).await;
                let _ = self.surface.answer_callback(callback_id, "Sent").await;
            }
            "model" => {
                let command = if arg1 == "default" {
                    "/model".to_string()
                } else {
                    format!("/model {}", arg1)
                };
                self.cmd_agent_slash(chat_id, &command).await;
                let _ = self.surface.answer_callback(callback_id, "Model updated").await;
            }
            "images" => {
                if arg1 == "skip" {
                    let _ = self.surface.answer_callback(callback_id, "Skipped").await;
                } else if let Some(images) = self.manager.take_pending_images(arg1) {
                    let _ = self.surface.answer_callback(callback_id, "Sending…").await;
                    for image in images {
                        if let Ok(bytes) =
                            base64::engine::general_purpose::STANDARD.decode(&image.data_b64)
                        {
                            if let Err(e) = self.surface.send_photo(chat_id, bytes, None).await {
                                warn!(error = %e, "Photo upload failed");
                            }
                        }
                    }
                } else {
                    let _ = self.surface.answer_callback(callback_id, "Already gone").await;
                }
            }
            "detach" => {
                if arg1 == "keep" {
                    self.manager.clear();
                    self.index.remove_attached().await;
                    let _ = self.surface.answer_callback(callback_id, "Detached").await;
                    self.notifier.text(chat_id, "Detached; the agent keeps running.");
                } else if arg1 == "close" {
                    self.manager.clear();
                    self.locator.kill_window(arg2).await;
                    self.index.remove_attached().await;
                    let _ = self.surface.answer_callback(callback_id, "Closed").await;
                    self.notifier.text(chat_id, "🪟 Window closed and detached.");
                }
            }
            _ => {
                let _ = self.surface.answer_callback(callback_id, "").await;
            }
        }
    }

    async fn cb_attach(&self, chat_id: i64, callback_id: &str, session_id: &str) {
        let session = self
            .pending_sessions
            .lock()
            .unwrap()
            .get(session_id)
            .cloned();
        let Some(session) = session else {
            let _ = self.surface.answer_callback(callback_id, "Stale picker").await;
            return;
        };

        if let PaneLookup::Found { .. } = self.locator.find(&session.cwd).await {
            if self.index.write_attached(session_id, &session.cwd).await.is_ok() {
                let _ = self.surface.answer_callback(callback_id, "Attached").await;
                self.notifier.text(
                    chat_id,
                    format!("📌 Attached to {} ({})", session.project_name, session.cwd),
                );
            } else {
                let _ = self.surface.answer_callback(callback_id, "Failed").await;
            }
            return;
        }

        // No agent at that cwd: offer the launch flow.
        let _ = self.surface.answer_callback(callback_id, "").await;
        self.notifier.keyboard(
            chat_id,
            format!("No Claude Code is running in {}. Launch one?", session.cwd),
            vec![
                vec![
                    InlineButton::new("🚀 Launch", format!("launch:{}", session_id)),
                    InlineButton::new(
                        "🚀 Launch (skip permissions)",
                        format!("launchskip:{}", session_id),
                    ),
                ],
                vec![InlineButton::new("Cancel", "cancel".to_string())],
            ],
        );
    }

    async fn cb_launch(
        &self,
        chat_id: i64,
        callback_id: &str,
        session_id: &str,
        skip_permissions: bool,
    ) {
        let session = self
            .pending_sessions
            .lock()
            .unwrap()
            .get(session_id)
            .cloned();
        let Some(session) = session else {
            let _ = self.surface.answer_callback(callback_id, "Stale picker").await;
            return;
        };

        let pane_id = match self
            .locator
            .launch(&session.cwd, &session.project_name, skip_permissions)
            .await
        {
            Ok(pane_id) => pane_id,
            Err(e) => {
                warn!(error = %e, "Launch failed");
                let _ = self.surface.answer_callback(callback_id, "Launch failed").await;
                self.notifier
                    .text(chat_id, format!("Launch failed: {}", e));
                return;
            }
        };
        *self.launched_pane.lock().unwrap() = Some(pane_id);
        let _ = self.index.write_attached(session_id, &session.cwd).await;
        let _ = self.surface.answer_callback(callback_id, "Launching…").await;

        // The readiness wait runs off the event loop so later messages are
        // not held up behind it.
        let locator = self.locator.clone();
        let notifier = self.notifier.clone();
        let cwd = session.cwd;
        tokio::spawn(async move {
            if wait_for_pane(&locator, &cwd, LAUNCH_WAIT_ATTEMPTS).await {
                notifier.text(chat_id, format!("🚀 Claude Code is ready at {}.", cwd));
            } else {
                notifier.text(chat_id, "Launched, but the pane never showed up. Check tmux.");
            }
        });
    }

    async fn cb_quick_reply(&self, which: &str) {
        let Some(attached) = self.index.attached_session().await else {
            return;
        };
        let PaneLookup::Found { pane_id } = self.locator.find(&attached.cwd).await else {
            return;
        };
        match which {
            "enter" => self.injector.send_key(&pane_id, "Enter").await,
            "y" => {
                let _ = send_text_and_submit(&pane_id, "y").await;
            }
            "n" => {
                let _ = send_text_and_submit(&pane_id, "n").await;
            }
            _ => {}
        }
    }

    /// Press a single key (plan choice number) in the attached pane.
    async fn send_pane_key(&self, key: &str) {
        if key.is_empty() {
            return;
        }
        let Some(attached) = self.index.attached_session().await else {
            return;
        };
        if let PaneLookup::Found { pane_id } = self.locator.find(&attached.cwd).await {
            self.injector.send_key(&pane_id, key).await;
        }
    }

    /// Permission answers are double-dispatched: the response file for the
    /// hook plus a pane keystroke, because some agent prompts consume only
    /// one of the two. Both halves are fire-and-forget.
    async fn respond_permission(&self, request_id: &str, approve: bool) {
        let action = if approve {
            PermissionAction::Approve
        } else {
            PermissionAction::Deny
        };
        if let Err(e) = self.permissions.respond(request_id, action).await {
            warn!(request_id = %request_id, error = %e, "Permission response write failed");
        }

        if self.permission_keys {
            if let Some(attached) = self.index.attached_session().await {
                if let PaneLookup::Found { pane_id } = self.locator.find(&attached.cwd).await {
                    match action {
                        PermissionAction::Approve => self.injector.send_key(&pane_id, "1").await,
                        PermissionAction::Deny => self.injector.send_key(&pane_id, "Escape").await,
                    }
                }
            }
        }
    }

    // ============ Voice & images in ============

    async fn handle_voice(&self, chat_id: i64, file_id: &str, file_name_hint: Option<&str>) {
        let Some(speech) = &self.speech else {
            self.notifier
                .text(chat_id, "Voice input needs a configured speech service.");
            return;
        };

        let (bytes, path_hint) = match self.surface.download_file(file_id).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Voice download failed");
                self.notifier.text(chat_id, "Could not download the voice note.");
                return;
            }
        };
        let hint = file_name_hint.or(path_hint.as_deref());

        let raw = match speech.transcribe(bytes, hint).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Transcription failed");
                self.notifier
                    .text(chat_id, "Could not transcribe the voice note.");
                return;
            }
        };

        let polish_off = self.paths.polish_voice_off().exists();
        let text = match (&self.polisher, polish_off) {
            (Some(polisher), false) => match polisher.polish(&raw).await {
                Ok(polished) => polished,
                Err(e) => {
                    // Raw transcript substitutes for polish.
                    warn!(error = %e, "Polish failed, using raw transcript");
                    raw
                }
            },
            _ => raw,
        };

        self.notifier.text(chat_id, format!("🎙 {}", text));
        self.run_text_turn(chat_id, text).await;
    }

    async fn handle_photo(
        &self,
        chat_id: i64,
        file_id: &str,
        mime: Option<&str>,
        caption: Option<&str>,
    ) {
        let (bytes, path_hint) = match self.surface.download_file(file_id).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Image download failed");
                self.notifier.text(chat_id, "Could not download the image.");
                return;
            }
        };

        let ext = extension_for_image(mime, path_hint.as_deref());
        let dir = self.paths.images_dir();
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            warn!(error = %e, "Could not create images dir");
            return;
        }
        let path = dir.join(format!(
            "telegram-{}.{}",
            chrono::Utc::now().timestamp_millis(),
            ext
        ));
        if let Err(e) = tokio::fs::write(&path, &bytes).await {
            warn!(error = %e, "Could not stage image");
            return;
        }
        info!(path = ?path, "Image staged for agent");

        let prompt = match caption {
            Some(caption) if !caption.trim().is_empty() => format!(
                "{}\n\n[The user attached an image; it is saved at {}]",
                caption.trim(),
                path.display()
            ),
            _ => format!(
                "[The user sent an image; it is saved at {}]",
                path.display()
            ),
        };
        self.run_text_turn(chat_id, prompt).await;
    }

    // ============ Chat id persistence ============

    async fn remember_chat_id(&self, chat_id: i64) {
        let path = self.paths.chat_id_file();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        let _ = tokio::fs::write(&path, chat_id.to_string()).await;
    }

    async fn notify_chat_id(&self) -> Option<i64> {
        resolve_chat_id(self.allowed_chat_id, &self.paths.chat_id_file()).await
    }
}

/// The chat to address out-of-band notices to: the allowlisted chat when
/// configured, else the last-seen chat id on disk.
async fn resolve_chat_id(allowed: Option<i64>, chat_id_file: &std::path::Path) -> Option<i64> {
    if let Some(allowed) = allowed {
        return Some(allowed);
    }
    let content = tokio::fs::read_to_string(chat_id_file).await.ok()?;
    content.trim().parse().ok()
}

fn project_label(cwd: &str) -> String {
    cwd.rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or(cwd)
        .to_string()
}

fn extension_for_image(mime: Option<&str>, path_hint: Option<&str>) -> String {
    if let Some(mime) = mime {
        match mime {
            "image/png" => return "png".into(),
            "image/jpeg" => return "jpg".into(),
            "image/gif" => return "gif".into(),
            "image/webp" => return "webp".into(),
            _ => {}
        }
    }
    if let Some(hint) = path_hint {
        if let Some(ext) = std::path::Path::new(hint)
            .extension()
            .and_then(|e| e.to_str())
        {
            return ext.to_ascii_lowercase();
        }
    }
    "jpg".into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify_surface::test_support::RecordingSurface;
    use tempfile::tempdir;

    fn coordinator_for(
        root: &std::path::Path,
        allowed: Option<i64>,
    ) -> (Arc<Coordinator>, Arc<RecordingSurface>) {
        let paths = BridgePaths::new(root.join("cfg"), root.join("projects"));
        let surface = Arc::new(RecordingSurface::default());
        let coordinator = Coordinator::new(
            CoordinatorOptions {
                paths,
                allowed_chat_id: allowed,
                permission_keys: false,
            },
            surface.clone(),
            None,
            None,
        );
        (coordinator, surface)
    }

    async fn drain() {
        tokio::time::sleep(Duration::from_millis(60)).await;
    }

    #[tokio::test]
    async fn test_allowlist_drops_foreign_chats_silently() {
        let dir = tempdir().unwrap();
        let (coordinator, surface) = coordinator_for(dir.path(), Some(42));

        coordinator
            .handle_event(ChatEvent::Command {
                chat_id: 99,
                name: "help".into(),
                args: String::new(),
            })
            .await;
        drain().await;

        assert!(surface.texts.lock().unwrap().is_empty());
        assert!(surface.keyboards.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_help_replies_to_allowed_chat() {
        let dir = tempdir().unwrap();
        let (coordinator, surface) = coordinator_for(dir.path(), Some(42));

        coordinator
            .handle_event(ChatEvent::Command {
                chat_id: 42,
                name: "help".into(),
                args: String::new(),
            })
            .await;
        drain().await;

        let texts = surface.texts.lock().unwrap();
        assert_eq!(texts.len(), 1);
        assert!(texts[0].1.contains("/sessions"));
    }

    #[tokio::test]
    async fn test_text_without_any_session_reports_it() {
        let dir = tempdir().unwrap();
        let (coordinator, surface) = coordinator_for(dir.path(), None);

        coordinator
            .handle_event(ChatEvent::Text {
                chat_id: 7,
                text: "hello".into(),
            })
            .await;
        drain().await;

        let texts = surface.texts.lock().unwrap();
        assert!(
            texts.iter().any(|(_, t)| t.contains("No Claude Code sessions")),
            "expected a no-sessions notice, got {:?}",
            texts
        );
    }

    #[tokio::test]
    async fn test_auto_attach_informs_user() {
        let dir = tempdir().unwrap();
        let projects = dir.path().join("projects").join("-work-alpha");
        std::fs::create_dir_all(&projects).unwrap();
        std::fs::write(
            projects.join("s1.jsonl"),
            r#"{"type":"assistant","cwd":"/work/alpha","message":{"content":[{"type":"text","text":"hi"}]}}
"#,
        )
        .unwrap();

        let (coordinator, surface) = coordinator_for(dir.path(), None);
        coordinator
            .handle_event(ChatEvent::Text {
                chat_id: 7,
                text: "hello".into(),
            })
            .await;
        drain().await;

        let texts = surface.texts.lock().unwrap();
        assert!(
            texts.iter().any(|(_, t)| t.contains("Attached to alpha")),
            "expected attach notice, got {:?}",
            texts
        );
        // tmux is absent in the test environment, so injection must fail
        // loudly rather than arming a watcher.
        assert!(texts.iter().any(|(_, t)| t.contains("No Claude Code running")));

        // Marker was written by the auto-attach.
        let marker = std::fs::read_to_string(dir.path().join("cfg/attached")).unwrap();
        assert_eq!(marker.lines().next(), Some("s1"));
    }

    #[tokio::test]
    async fn test_timer_interactive_flow() {
        let dir = tempdir().unwrap();
        let (coordinator, surface) = coordinator_for(dir.path(), None);

        coordinator
            .handle_event(ChatEvent::Command {
                chat_id: 7,
                name: "timer".into(),
                args: String::new(),
            })
            .await;
        coordinator
            .handle_event(ChatEvent::Text {
                chat_id: 7,
                text: "30".into(),
            })
            .await;
        coordinator
            .handle_event(ChatEvent::Text {
                chat_id: 7,
                text: "any progress?".into(),
            })
            .await;
        drain().await;

        let texts = surface.texts.lock().unwrap();
        assert!(texts.iter().any(|(_, t)| t.contains("how many minutes")));
        assert!(texts.iter().any(|(_, t)| t.contains("what prompt")));
        assert!(texts
            .iter()
            .any(|(_, t)| t.contains("Every 30 min") && t.contains("any progress?")));
        assert_eq!(coordinator.timer.current().unwrap().frequency_min, 30);
        coordinator.timer.stop();
    }

    #[tokio::test]
    async fn test_timer_stop_without_timer() {
        let dir = tempdir().unwrap();
        let (coordinator, surface) = coordinator_for(dir.path(), None);

        coordinator
            .handle_event(ChatEvent::Command {
                chat_id: 7,
                name: "timer".into(),
                args: "stop".into(),
            })
            .await;
        drain().await;

        let texts = surface.texts.lock().unwrap();
        assert!(texts.iter().any(|(_, t)| t.contains("No timer")));
    }

    #[tokio::test]
    async fn test_polishvoice_toggles_flag_file() {
        let dir = tempdir().unwrap();
        let (coordinator, _surface) = coordinator_for(dir.path(), None);
        let flag = dir.path().join("cfg").join("polish-voice-off");

        coordinator
            .handle_event(ChatEvent::Command {
                chat_id: 7,
                name: "polishvoice".into(),
                args: String::new(),
            })
            .await;
        assert!(flag.exists());

        coordinator
            .handle_event(ChatEvent::Command {
                chat_id: 7,
                name: "polishvoice".into(),
                args: String::new(),
            })
            .await;
        assert!(!flag.exists());
    }

    #[tokio::test]
    async fn test_images_with_nothing_pending() {
        let dir = tempdir().unwrap();
        let (coordinator, surface) = coordinator_for(dir.path(), None);

        coordinator
            .handle_event(ChatEvent::Command {
                chat_id: 7,
                name: "images".into(),
                args: String::new(),
            })
            .await;
        drain().await;

        let texts = surface.texts.lock().unwrap();
        assert!(texts.iter().any(|(_, t)| t.contains("No images pending")));
    }

    #[tokio::test]
    async fn test_chat_id_is_persisted() {
        let dir = tempdir().unwrap();
        let (coordinator, _surface) = coordinator_for(dir.path(), None);

        coordinator
            .handle_event(ChatEvent::Command {
                chat_id: 4242,
                name: "help".into(),
                args: String::new(),
            })
            .await;

        let persisted = std::fs::read_to_string(dir.path().join("cfg/chat-id")).unwrap();
        assert_eq!(persisted.trim(), "4242");
    }

    #[test]
    fn test_extension_for_image() {
        assert_eq!(extension_for_image(Some("image/png"), None), "png");
        assert_eq!(extension_for_image(None, Some("voice/file_7.webp")), "webp");
        assert_eq!(extension_for_image(None, None), "jpg");
    }
}
