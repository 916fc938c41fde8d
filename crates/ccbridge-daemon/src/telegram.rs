//! Minimal Telegram Bot API client: long-poll inbound, JSON/multipart
//! outbound. Implements the core's [`ChatSurface`] contract.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use ccbridge_core::notify_surface::{ChatEvent, ChatSurface, InlineButton, MessageRef};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

/// Long-poll duration requested from getUpdates.
const POLL_TIMEOUT_SECS: u64 = 30;

pub struct TelegramClient {
    http: Client,
    api_base: String,
    file_base: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    message: Option<Message>,
    #[serde(default)]
    callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Deserialize)]
struct Message {
    message_id: i64,
    chat: Chat,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    voice: Option<FileRef>,
    #[serde(default)]
    photo: Option<Vec<PhotoSize>>,
    #[serde(default)]
    document: Option<Document>,
}

#[derive(Debug, Clone, Deserialize)]
struct Chat {
    id: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct FileRef {
    file_id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct PhotoSize {
    file_id: String,
    width: i64,
    height: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct Document {
    file_id: String,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    file_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CallbackQuery {
    id: String,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    message: Option<Message>,
}

impl TelegramClient {
    pub fn new(token: &str) -> Self {
        Self {
            http: Client::new(),
            api_base: format!("https://api.telegram.org/bot{}", token),
            file_base: format!("https://api.telegram.org/file/bot{}", token),
        }
    }

    async fn call(&self, method: &str, payload: Value) -> Result<Value> {
        let url = format!("{}/{}", self.api_base, method);
        let response: Value = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("telegram {}", method))?
            .json()
            .await
            .with_context(|| format!("telegram {} response", method))?;

        if response.get("ok").and_then(|v| v.as_bool()) != Some(true) {
            let description = response
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            bail!("telegram {} failed: {}", method, description);
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Fetch updates past `offset`, blocking server-side up to the poll
    /// timeout.
    pub async fn poll_updates(&self, offset: i64) -> Result<Vec<Update>> {
        let result = self
            .call(
                "getUpdates",
                json!({ "offset": offset, "timeout": POLL_TIMEOUT_SECS }),
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Shape an update into a core event. Unsupported updates yield `None`.
    pub fn update_to_event(&self, update: Update) -> Option<ChatEvent> {
        if let Some(callback) = update.callback_query {
            let message = callback.message.map(|m| MessageRef {
                chat_id: m.chat.id,
                message_id: m.message_id,
            });
            let chat_id = message.as_ref().map(|m| m.chat_id)?;
            return Some(ChatEvent::Callback {
                chat_id,
                callback_id: callback.id,
                data: callback.data.unwrap_or_default(),
                message,
            });
        }

        let message = update.message?;
        let chat_id = message.chat.id;

        if let Some(voice) = message.voice {
            return Some(ChatEvent::Voice {
                chat_id,
                file_id: voice.file_id,
                file_name_hint: None,
            });
        }

        if let Some(photo) = message.photo {
            // Largest variant wins.
            let best = photo.into_iter().max_by_key(|p| p.width * p.height)?;
            return Some(ChatEvent::Photo {
                chat_id,
                file_id: best.file_id,
                mime: None,
                caption: message.caption,
            });
        }

        if let Some(document) = message.document {
            let is_image = document
                .mime_type
                .as_deref()
                .map(|m| m.starts_with("image/"))
                .unwrap_or(false);
            if is_image {
                return Some(ChatEvent::Photo {
                    chat_id,
                    file_id: document.file_id,
                    mime: document.mime_type,
                    caption: message.caption.or(document.file_name),
                });
            }
            debug!("Ignoring non-image document");
            return None;
        }

        let text = message.text?;
        if let Some(stripped) = text.strip_prefix('/') {
            let mut parts = stripped.splitn(2, char::is_whitespace);
            let raw_name = parts.next().unwrap_or("");
            // Commands may be addressed as /cmd@botname in groups.
            let name = raw_name.split('@').next().unwrap_or(raw_name);
            if !name.is_empty() {
                return Some(ChatEvent::Command {
                    chat_id,
                    name: name.to_string(),
                    args: parts.next().unwrap_or("").trim().to_string(),
                });
            }
        }
        Some(ChatEvent::Text { chat_id, text })
    }
}

fn keyboard_json(keyboard: &[Vec<InlineButton>]) -> Value {
    let rows: Vec<Vec<Value>> = keyboard
        .iter()
        .map(|row| {
            row.iter()
                .map(|button| json!({ "text": button.text, "callback_data": button.data }))
                .collect()
        })
        .collect();
    json!({ "inline_keyboard": rows })
}

#[async_trait]
impl ChatSurface for TelegramClient {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<MessageRef> {
        let result = self
            .call("sendMessage", json!({ "chat_id": chat_id, "text": text }))
            .await?;
        let message_id = result
            .get("message_id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| anyhow!("sendMessage returned no message_id"))?;
        Ok(MessageRef {
            chat_id,
            message_id,
        })
    }

    async fn send_text_with_keyboard(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: &[Vec<InlineButton>],
    ) -> Result<MessageRef> {
        let result = self
            .call(
                "sendMessage",
                json!({
                    "chat_id": chat_id,
                    "text": text,
                    "reply_markup": keyboard_json(keyboard),
                }),
            )
            .await?;
        let message_id = result
            .get("message_id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| anyhow!("sendMessage returned no message_id"))?;
        Ok(MessageRef {
            chat_id,
            message_id,
        })
    }

    async fn edit_text(&self, message: &MessageRef, text: &str) -> Result<()> {
        self.call(
            "editMessageText",
            json!({
                "chat_id": message.chat_id,
                "message_id": message.message_id,
                "text": text,
            }),
        )
        .await?;
        Ok(())
    }

    async fn edit_keyboard(
        &self,
        message: &MessageRef,
        keyboard: &[Vec<InlineButton>],
    ) -> Result<()> {
        self.call(
            "editMessageReplyMarkup",
            json!({
                "chat_id": message.chat_id,
                "message_id": message.message_id,
                "reply_markup": keyboard_json(keyboard),
            }),
        )
        .await?;
        Ok(())
    }

    async fn send_photo(&self, chat_id: i64, data: Vec<u8>, caption: Option<&str>) -> Result<()> {
        let mut form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .part(
                "photo",
                reqwest::multipart::Part::bytes(data).file_name("image.png"),
            );
        if let Some(caption) = caption {
            form = form.text("caption", caption.to_string());
        }

        let url = format!("{}/sendPhoto", self.api_base);
        let response: Value = self
            .http
            .post(&url)
            .multipart(form)
            .send()
            .await
            .context("telegram sendPhoto")?
            .json()
            .await?;
        if response.get("ok").and_then(|v| v.as_bool()) != Some(true) {
            bail!("telegram sendPhoto failed");
        }
        Ok(())
    }

    async fn send_voice(&self, chat_id: i64, data: Vec<u8>) -> Result<()> {
        let form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .part(
                "voice",
                reqwest::multipart::Part::bytes(data).file_name("voice.ogg"),
            );

        let url = format!("{}/sendVoice", self.api_base);
        let response: Value = self
            .http
            .post(&url)
            .multipart(form)
            .send()
            .await
            .context("telegram sendVoice")?
            .json()
            .await?;
        if response.get("ok").and_then(|v| v.as_bool()) != Some(true) {
            bail!("telegram sendVoice failed");
        }
        Ok(())
    }

    async fn send_typing(&self, chat_id: i64) -> Result<()> {
        self.call(
            "sendChatAction",
            json!({ "chat_id": chat_id, "action": "typing" }),
        )
        .await?;
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<()> {
        let mut payload = json!({ "callback_query_id": callback_id });
        if !text.is_empty() {
            payload["text"] = Value::String(text.to_string());
        }
        self.call("answerCallbackQuery", payload).await?;
        Ok(())
    }

    async fn download_file(&self, file_id: &str) -> Result<(Vec<u8>, Option<String>)> {
        let result = self.call("getFile", json!({ "file_id": file_id })).await?;
        let file_path = result
            .get("file_path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("getFile returned no file_path"))?
            .to_string();

        let url = format!("{}/{}", self.file_base, file_path);
        let bytes = self
            .http
            .get(&url)
            .send()
            .await
            .context("telegram file download")?
            .bytes()
            .await?
            .to_vec();
        Ok((bytes, Some(file_path)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> TelegramClient {
        TelegramClient::new("TEST:TOKEN")
    }

    fn update_from(json_str: &str) -> Update {
        serde_json::from_str(json_str).unwrap()
    }

    #[test]
    fn test_plain_text_event() {
        let update = update_from(
            r#"{"update_id":1,"message":{"message_id":10,"chat":{"id":42},"text":"hello there"}}"#,
        );
        match client().update_to_event(update) {
            Some(ChatEvent::Text { chat_id, text }) => {
                assert_eq!(chat_id, 42);
                assert_eq!(text, "hello there");
            }
            other => panic!("unexpected event: {:?}", other.is_some()),
        }
    }

    #[test]
    fn test_command_with_args_and_bot_suffix() {
        let update = update_from(
            r#"{"update_id":1,"message":{"message_id":10,"chat":{"id":42},"text":"/timer@mybot 30 check in"}}"#,
        );
        match client().update_to_event(update) {
            Some(ChatEvent::Command {
                name, args, ..
            }) => {
                assert_eq!(name, "timer");
                assert_eq!(args, "30 check in");
            }
            _ => panic!("expected a command"),
        }
    }

    #[test]
    fn test_photo_picks_largest_variant() {
        let update = update_from(
            r#"{"update_id":1,"message":{"message_id":10,"chat":{"id":42},
                "photo":[{"file_id":"small","width":90,"height":90},
                         {"file_id":"big","width":800,"height":600}],
                "caption":"look"}}"#,
        );
        match client().update_to_event(update) {
            Some(ChatEvent::Photo {
                file_id, caption, ..
            }) => {
                assert_eq!(file_id, "big");
                assert_eq!(caption.as_deref(), Some("look"));
            }
            _ => panic!("expected a photo"),
        }
    }

    #[test]
    fn test_image_document_becomes_photo() {
        let update = update_from(
            r#"{"update_id":1,"message":{"message_id":10,"chat":{"id":42},
                "document":{"file_id":"doc1","mime_type":"image/webp","file_name":"shot.webp"}}}"#,
        );
        match client().update_to_event(update) {
            Some(ChatEvent::Photo { file_id, mime, .. }) => {
                assert_eq!(file_id, "doc1");
                assert_eq!(mime.as_deref(), Some("image/webp"));
            }
            _ => panic!("expected a photo"),
        }
    }

    #[test]
    fn test_non_image_document_is_dropped() {
        let update = update_from(
            r#"{"update_id":1,"message":{"message_id":10,"chat":{"id":42},
                "document":{"file_id":"doc1","mime_type":"application/pdf"}}}"#,
        );
        assert!(client().update_to_event(update).is_none());
    }

    #[test]
    fn test_callback_event() {
        let update = update_from(
            r#"{"update_id":1,"callback_query":{"id":"cb9","data":"attach:s1",
                "message":{"message_id":10,"chat":{"id":42}}}}"#,
        );
        match client().update_to_event(update) {
            Some(ChatEvent::Callback {
                chat_id,
                callback_id,
                data,
                message,
            }) => {
                assert_eq!(chat_id, 42);
                assert_eq!(callback_id, "cb9");
                assert_eq!(data, "attach:s1");
                assert_eq!(message.unwrap().message_id, 10);
            }
            _ => panic!("expected a callback"),
        }
    }

    #[test]
    fn test_voice_event() {
        let update = update_from(
            r#"{"update_id":1,"message":{"message_id":10,"chat":{"id":42},
                "voice":{"file_id":"v1","duration":3}}}"#,
        );
        assert!(matches!(
            client().update_to_event(update),
            Some(ChatEvent::Voice { file_id, .. }) if file_id == "v1"
        ));
    }
}
