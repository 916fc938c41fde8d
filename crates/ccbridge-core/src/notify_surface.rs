//! Collaborator contracts: the chat surface, the speech/LLM helpers, and the
//! notifier that lets synchronous watcher callbacks reach the async surface.
//!
//! Components never talk to the chat SDK directly; they hold a [`Notifier`]
//! (cheap clone over an unbounded channel) and a drainer task owns the actual
//! `Arc<dyn ChatSurface>`. Send failures are retried once, then logged.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use crate::classify::{WaitingKind, PLAN_CHOICES};
use crate::watch::turn::TurnText;

/// An inline keyboard button: label + opaque callback payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineButton {
    pub text: String,
    pub data: String,
}

impl InlineButton {
    pub fn new(text: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            data: data.into(),
        }
    }
}

/// Reference to a previously sent chat message (for edits).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    pub chat_id: i64,
    pub message_id: i64,
}

/// Inbound chat events, already shaped by the transport.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    Text {
        chat_id: i64,
        text: String,
    },
    Command {
        chat_id: i64,
        name: String,
        args: String,
    },
    Voice {
        chat_id: i64,
        file_id: String,
        file_name_hint: Option<String>,
    },
    Photo {
        chat_id: i64,
        file_id: String,
        mime: Option<String>,
        caption: Option<String>,
    },
    Callback {
        chat_id: i64,
        callback_id: String,
        data: String,
        message: Option<MessageRef>,
    },
}

impl ChatEvent {
    pub fn chat_id(&self) -> i64 {
        match self {
            ChatEvent::Text { chat_id, .. }
            | ChatEvent::Command { chat_id, .. }
            | ChatEvent::Voice { chat_id, .. }
            | ChatEvent::Photo { chat_id, .. }
            | ChatEvent::Callback { chat_id, .. } => *chat_id,
        }
    }
}

/// Outbound contract the chat transport implements.
#[async_trait]
pub trait ChatSurface: Send + Sync {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<MessageRef>;
    async fn send_text_with_keyboard(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: &[Vec<InlineButton>],
    ) -> Result<MessageRef>;
    async fn edit_text(&self, message: &MessageRef, text: &str) -> Result<()>;
    async fn edit_keyboard(
        &self,
        message: &MessageRef,
        keyboard: &[Vec<InlineButton>],
    ) -> Result<()>;
    async fn send_photo(&self, chat_id: i64, data: Vec<u8>, caption: Option<&str>) -> Result<()>;
    async fn send_voice(&self, chat_id: i64, data: Vec<u8>) -> Result<()>;
    async fn send_typing(&self, chat_id: i64) -> Result<()>;
    async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<()>;
    /// Download a file by the transport's file id; returns bytes and the
    /// transport-side path hint (used to guess extensions).
    async fn download_file(&self, file_id: &str) -> Result<(Vec<u8>, Option<String>)>;
}

/// Speech-to-text / text-to-speech collaborator.
#[async_trait]
pub trait SpeechService: Send + Sync {
    async fn transcribe(&self, audio: Vec<u8>, file_name_hint: Option<&str>) -> Result<String>;
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>>;
}

/// Single-shot LLM collaborator for polishing transcripts and summaries.
#[async_trait]
pub trait Polisher: Send + Sync {
    async fn polish(&self, raw_transcript: &str) -> Result<String>;
    async fn summarize(&self, text: &str) -> Result<String>;
}

/// What the drainer task can be asked to send.
#[derive(Debug, Clone)]
enum Notification {
    Text {
        chat_id: i64,
        text: String,
    },
    Keyboard {
        chat_id: i64,
        text: String,
        keyboard: Vec<Vec<InlineButton>>,
    },
    Typing {
        chat_id: i64,
    },
}

/// Synchronous front to the chat surface. Clone freely; sends never block.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl Notifier {
    pub fn text(&self, chat_id: i64, text: impl Into<String>) {
        let _ = self.tx.send(Notification::Text {
            chat_id,
            text: text.into(),
        });
    }

    pub fn keyboard(&self, chat_id: i64, text: impl Into<String>, keyboard: Vec<Vec<InlineButton>>) {
        let _ = self.tx.send(Notification::Keyboard {
            chat_id,
            text: text.into(),
            keyboard,
        });
    }

    pub fn typing(&self, chat_id: i64) {
        let _ = self.tx.send(Notification::Typing { chat_id });
    }

    // ============ Turn-pipeline helpers ============

    pub fn assistant_text(&self, chat_id: i64, turn: &TurnText) {
        self.text(chat_id, turn.text.clone());
    }

    pub fn still_working(&self, chat_id: i64) {
        self.text(chat_id, "⏳ Still working…");
    }

    pub fn turn_done(&self, chat_id: i64) {
        self.text(chat_id, "✅ Done.");
    }

    pub fn offer_images(&self, chat_id: i64, key: &str, count: usize) {
        let noun = if count == 1 { "image" } else { "images" };
        self.keyboard(
            chat_id,
            format!("🖼 {} new {} from this turn.", count, noun),
            vec![vec![
                InlineButton::new("Send them", format!("images:{}", key)),
                InlineButton::new("Skip", "images:skip".to_string()),
            ]],
        );
    }

    pub fn waiting(&self, chat_id: i64, kind: WaitingKind, tail: Option<&str>) {
        match kind {
            WaitingKind::MultipleChoice => {
                let keyboard = PLAN_CHOICES
                    .iter()
                    .enumerate()
                    .map(|(i, label)| vec![InlineButton::new(*label, format!("plan:{}", i + 1))])
                    .collect();
                self.keyboard(chat_id, "📋 Claude is waiting for plan approval.", keyboard);
            }
            WaitingKind::YesNo => {
                self.keyboard(
                    chat_id,
                    "❓ Claude is waiting for a yes/no answer.",
                    vec![vec![
                        InlineButton::new("Yes", "reply:y"),
                        InlineButton::new("No", "reply:n"),
                    ]],
                );
            }
            WaitingKind::Enter => {
                self.keyboard(
                    chat_id,
                    "⏎ Claude is waiting for Enter.",
                    vec![vec![InlineButton::new("Press Enter", "reply:enter")]],
                );
            }
            WaitingKind::Question => {
                let mut text = String::from("❓ Claude asked a question");
                if let Some(tail) = tail {
                    text.push_str(":\n");
                    text.push_str(tail);
                } else {
                    text.push('.');
                }
                self.text(chat_id, text);
            }
        }
    }
}

/// Spawn the drainer task that performs sends against the surface.
pub fn spawn_notifier(surface: Arc<dyn ChatSurface>) -> Notifier {
    let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();

    tokio::spawn(async move {
        while let Some(notification) = rx.recv().await {
            let mut attempt = 0;
            loop {
                let result = match &notification {
                    Notification::Text { chat_id, text } => {
                        surface.send_text(*chat_id, text).await.map(|_| ())
                    }
                    Notification::Keyboard {
                        chat_id,
                        text,
                        keyboard,
                    } => surface
                        .send_text_with_keyboard(*chat_id, text, keyboard)
                        .await
                        .map(|_| ()),
                    Notification::Typing { chat_id } => surface.send_typing(*chat_id).await,
                };
                match result {
                    Ok(()) => break,
                    Err(e) if attempt == 0 => {
                        attempt = 1;
                        warn!(error = %e, "Chat send failed, retrying once");
                    }
                    Err(e) => {
                        warn!(error = %e, "Chat send failed after retry, dropping");
                        break;
                    }
                }
            }
        }
    });

    Notifier { tx }
}


#[cfg(test)]
mod tests {
    use super::test_support::RecordingSurface;
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_notifier_delivers_to_surface() {
        let surface = Arc::new(RecordingSurface::default());
        let notifier = spawn_notifier(surface.clone());

        notifier.text(7, "hello");
        notifier.still_working(7);
        notifier.typing(7);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let texts = surface.texts.lock().unwrap();
        assert_eq!(texts.len(), 2);
        assert_eq!(texts[0], (7, "hello".to_string()));
        assert_eq!(*surface.typing.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_waiting_multiple_choice_uses_keyboard() {
        let surface = Arc::new(RecordingSurface::default());
        let notifier = spawn_notifier(surface.clone());

        notifier.waiting(7, WaitingKind::MultipleChoice, None);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let keyboards = surface.keyboards.lock().unwrap();
        assert_eq!(keyboards.len(), 1);
        assert!(keyboards[0].1.contains("plan approval"));
    }
}
