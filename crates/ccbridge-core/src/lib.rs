//! ccbridge-core - remote-control bridge between a chat client and a
//! Claude Code session hosted in a tmux pane.
//!
//! The core pipeline: locate the pane for a cwd, inject keystrokes, capture a
//! byte baseline of the session transcript, then watch the transcript for new
//! assistant output until the turn ends. Everything observes Claude Code
//! through its own JSONL transcript files; the pane's pseudo-terminal output
//! is never parsed.

pub mod classify;
pub mod config;
pub mod coordinator;
pub mod notify_surface;
pub mod permission;
pub mod timer;
pub mod tmux;
pub mod transcript;
pub mod watch;

pub use classify::{classify_waiting, WaitingKind, PLAN_CHOICES};
pub use config::{BridgeConfig, BridgePaths};
pub use coordinator::{Coordinator, CoordinatorOptions};
pub use notify_surface::{
    spawn_notifier, ChatEvent, ChatSurface, InlineButton, MessageRef, Notifier, Polisher,
    SpeechService,
};
pub use permission::{PermissionAction, PermissionBridge, PermissionRequest};
pub use timer::{PromptTimer, TimerDeps, TimerSettings};
pub use tmux::inject::{InjectOutcome, Injector, KEYSTROKE_DELAY};
pub use tmux::locator::{NotFoundReason, PaneInfo, PaneLocator, PaneLookup};
pub use transcript::index::SessionIndex;
pub use transcript::reader::{digest_lines, last_assistant_entry, LastAssistantEntry};
pub use transcript::types::{AttachedSession, Baseline, SessionOverview};
pub use watch::manager::{WatchHooks, WatcherManager};
pub use watch::turn::{ImageAttachment, TurnCallbacks, TurnText, TurnWatcherOptions};
