//! ntfy publisher (JSON publish to the server root).

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use super::{Notification, NotificationChannel, DEFAULT_PRIORITY};
use crate::models::User;

#[derive(Debug, Serialize, PartialEq)]
pub struct NtfyMessage<'a> {
    pub topic: &'a str,
    pub title: &'a str,
    pub message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    pub tags: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    pub click: Option<&'a str>,
}

impl<'a> NtfyMessage<'a> {
    pub fn from_notification(topic: &'a str, n: &'a Notification) -> Self {
        Self {
            topic,
            title: &n.title,
            message: &n.message,
            priority: (n.priority != DEFAULT_PRIORITY).then_some(n.priority),
            tags: &n.tags,
            click: n.click.as_deref(),
        }
    }
}

#[derive(Clone)]
pub struct NtfyClient {
    client: Client,
    server: String,
}

impl NtfyClient {
    pub fn new(server: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build ntfy client")?;
        Ok(Self {
            client,
            server: server.trim_end_matches('/').to_string(),
        })
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub async fn publish(&self, topic: &str, notification: &Notification) -> Result<()> {
        let body = NtfyMessage::from_notification(topic, notification);
        let resp = self
            .client
            .post(&self.server)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {} failed", self.server))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("POST {} {}: {}", self.server, status, text));
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationChannel for NtfyClient {
    fn name(&self) -> &'static str {
        "ntfy"
    }

    async fn deliver(&self, user: &User, notification: &Notification) -> Result<()> {
        let topic = user
            .ntfy_topic
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| anyhow!("No ntfy topic for user {}", user.name))?;
        self.publish(topic, notification).await
    }
}
