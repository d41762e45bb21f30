//! Telegram Bot API client: send text and photos, long-poll updates.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{multipart, Client};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use super::{Notification, NotificationChannel};
use crate::models::User;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
/// Telegram rejects longer message texts.
pub const MAX_MESSAGE_LEN: usize = 4096;
pub const MAX_CAPTION_LEN: usize = 1024;

/// Every Bot API response is wrapped in this envelope.
#[derive(Debug, Deserialize)]
pub struct TelegramResponse<T> {
    pub ok: bool,
    pub result: Option<T>,
    pub description: Option<String>,
    pub error_code: Option<i64>,
}

impl<T> TelegramResponse<T> {
    pub fn into_result(self, method: &str) -> Result<T> {
        if !self.ok {
            return Err(anyhow!(
                "telegram {} failed ({}): {}",
                method,
                self.error_code.unwrap_or_default(),
                self.description.unwrap_or_default()
            ));
        }
        self.result
            .ok_or_else(|| anyhow!("telegram {} returned no result", method))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    pub from: Option<TgUser>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgUser {
    pub id: i64,
    pub first_name: Option<String>,
    pub username: Option<String>,
}

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
    disable_web_page_preview: bool,
}

#[derive(Debug, Serialize)]
struct GetUpdates {
    offset: i64,
    timeout: u64,
    allowed_updates: [&'static str; 1],
}

/// Split text into chunks no longer than `max` bytes, preferring line breaks.
pub fn split_message(text: &str, max: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in text.split_inclusive('\n') {
        if current.len() + line.len() > max && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        if line.len() > max {
            // One oversized line: cut on char boundaries.
            let mut rest = line;
            while rest.len() > max {
                let mut cut = max;
                while !rest.is_char_boundary(cut) {
                    cut -= 1;
                }
                chunks.push(rest[..cut].to_string());
                rest = &rest[cut..];
            }
            current.push_str(rest);
        } else {
            current.push_str(line);
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[derive(Clone)]
pub struct TelegramClient {
    client: Client,
    base_url: String,
}

impl TelegramClient {
    pub fn new(bot_token: &str) -> Result<Self> {
        Self::with_base_url(TELEGRAM_API_BASE, bot_token)
    }

    pub fn with_base_url(base_url: &str, bot_token: &str) -> Result<Self> {
        if bot_token.trim().is_empty() {
            return Err(anyhow!("Telegram bot token is empty"));
        }
        let client = Client::builder()
            // long polls hold the connection for up to 30s
            .timeout(Duration::from_secs(60))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .context("Failed to build Telegram client")?;
        Ok(Self {
            client,
            base_url: format!("{}/bot{}", base_url.trim_end_matches('/'), bot_token.trim()),
        })
    }

    #[inline]
    fn url(&self, method: &str) -> String {
        format!("{}/{}", self.base_url, method)
    }

    async fn parse<T: DeserializeOwned>(resp: reqwest::Response, method: &str) -> Result<T> {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        let envelope: TelegramResponse<T> = serde_json::from_str(&text)
            .with_context(|| format!("telegram {} {}: {}", method, status, text))?;
        envelope.into_result(method)
    }

    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        for chunk in split_message(text, MAX_MESSAGE_LEN) {
            let body = SendMessage {
                chat_id,
                text: &chunk,
                disable_web_page_preview: true,
            };
            let resp = self
                .client
                .post(self.url("sendMessage"))
                .json(&body)
                .send()
                .await
                .context("POST sendMessage failed")?;
            Self::parse::<Message>(resp, "sendMessage").await?;
        }
        Ok(())
    }

    pub async fn send_photo(&self, chat_id: i64, path: &Path, caption: Option<&str>) -> Result<()> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "chart.png".to_string());

        let part = multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("image/png")?;
        let mut form = multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .part("photo", part);
        if let Some(caption) = caption {
            form = form.text("caption", caption.to_string());
        }

        let resp = self
            .client
            .post(self.url("sendPhoto"))
            .multipart(form)
            .send()
            .await
            .context("POST sendPhoto failed")?;
        Self::parse::<Message>(resp, "sendPhoto").await?;
        Ok(())
    }

    /// Long-poll for new messages after `offset`.
    pub async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Update>> {
        let body = GetUpdates {
            offset,
            timeout: timeout_secs,
            allowed_updates: ["message"],
        };
        let resp = self
            .client
            .post(self.url("getUpdates"))
            .json(&body)
            .send()
            .await
            .context("POST getUpdates failed")?;
        Self::parse(resp, "getUpdates").await
    }
}

#[async_trait]
impl NotificationChannel for TelegramClient {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn deliver(&self, user: &User, notification: &Notification) -> Result<()> {
        let chat_id = user
            .chat_id
            .ok_or_else(|| anyhow!("User {} has no Telegram chat id", user.name))?;
        let text = notification.text();

        if let Some(image) = notification.image.as_deref() {
            let caption = (text.len() <= MAX_CAPTION_LEN).then_some(text.as_str());
            match self.send_photo(chat_id, image, caption).await {
                Ok(()) if caption.is_some() => return Ok(()),
                Ok(()) => {}
                Err(e) => warn!(user = %user.name, "Chart upload failed, sending text only: {}", e),
            }
        }
        self.send_message(chat_id, &text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_ok_and_error() {
        let ok: TelegramResponse<Vec<Update>> = serde_json::from_str(
            r#"{"ok":true,"result":[{"update_id":10,"message":{"message_id":1,"chat":{"id":42},"text":"/list"}}]}"#,
        )
        .unwrap();
        let updates = ok.into_result("getUpdates").unwrap();
        assert_eq!(updates[0].update_id, 10);
        assert_eq!(updates[0].message.as_ref().unwrap().chat.id, 42);

        let err: TelegramResponse<Message> = serde_json::from_str(
            r#"{"ok":false,"error_code":400,"description":"Bad Request: chat not found"}"#,
        )
        .unwrap();
        let msg = err.into_result("sendMessage").unwrap_err().to_string();
        assert!(msg.contains("chat not found"));
    }

    #[test]
    fn test_split_message_on_lines() {
        let text = "aaaa\nbbbb\ncccc\n";
        let chunks = split_message(text, 10);
        assert_eq!(chunks, vec!["aaaa\nbbbb\n", "cccc\n"]);
        assert_eq!(split_message("short", 100), vec!["short"]);
    }

    #[test]
    fn test_split_message_long_line_keeps_char_boundaries() {
        let text = "가".repeat(10);
        let chunks = split_message(&text, 7);
        assert!(chunks.iter().all(|c| c.len() <= 7));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_empty_token_rejected() {
        assert!(TelegramClient::new("  ").is_err());
    }
}
