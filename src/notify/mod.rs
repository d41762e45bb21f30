//! Notifications
//! Mission: Deliver alert and report messages over Telegram or ntfy
//!
//! Channels implement [`NotificationChannel`]. The dispatcher picks one per
//! message from the `notification_method` setting so users can switch
//! without a restart.

pub mod ntfy;
pub mod telegram;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::models::User;
use crate::storage::StockDb;

pub use ntfy::NtfyClient;
pub use telegram::TelegramClient;

pub const SETTING_METHOD: &str = "notification_method";
pub const SETTING_NTFY_TOPIC: &str = "ntfy_topic";
pub const SETTING_NTFY_SERVER: &str = "ntfy_server";
pub const SETTING_BOT_TOKEN: &str = "telegram_bot_token";

/// ntfy's default priority; omitted from payloads.
pub const DEFAULT_PRIORITY: u8 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub title: String,
    pub message: String,
    /// 1 (min) to 5 (urgent).
    pub priority: u8,
    pub tags: Vec<String>,
    pub click: Option<String>,
    /// PNG sent along with the text where the channel supports it.
    pub image: Option<PathBuf>,
}

impl Notification {
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            priority: DEFAULT_PRIORITY,
            tags: Vec::new(),
            click: None,
            image: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.clamp(1, 5);
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_image(mut self, path: PathBuf) -> Self {
        self.image = Some(path);
        self
    }

    /// Title and body as one plain-text block.
    pub fn text(&self) -> String {
        if self.title.is_empty() {
            self.message.clone()
        } else {
            format!("{}\n\n{}", self.title, self.message)
        }
    }
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, user: &User, notification: &Notification) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Telegram,
    Ntfy,
}

impl Method {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "telegram" => Some(Method::Telegram),
            "ntfy" => Some(Method::Ntfy),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Telegram => "telegram",
            Method::Ntfy => "ntfy",
        }
    }
}

/// Outcome of a dispatch attempt that did not error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The user turned notifications off.
    Muted,
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    db: StockDb,
    telegram: Option<Arc<dyn NotificationChannel>>,
    ntfy: Option<Arc<dyn NotificationChannel>>,
}

impl NotificationDispatcher {
    pub fn new(
        db: StockDb,
        telegram: Option<Arc<dyn NotificationChannel>>,
        ntfy: Option<Arc<dyn NotificationChannel>>,
    ) -> Self {
        Self { db, telegram, ntfy }
    }

    pub fn method(&self) -> Result<Method> {
        let raw = self.db.get_setting_or(SETTING_METHOD, Method::Telegram.as_str())?;
        Ok(Method::parse(&raw).unwrap_or_else(|| {
            warn!("Unknown notification method '{}', using telegram", raw);
            Method::Telegram
        }))
    }

    fn channel(&self, method: Method) -> Result<&Arc<dyn NotificationChannel>> {
        let channel = match method {
            Method::Telegram => self.telegram.as_ref(),
            Method::Ntfy => self.ntfy.as_ref(),
        };
        channel.ok_or_else(|| anyhow!("{} channel is not configured", method.as_str()))
    }

    /// The user as the channel should see it: ntfy falls back to the
    /// `ntfy_topic` setting when the user has no topic of their own.
    fn recipient(&self, user: &User, method: Method) -> Result<User> {
        let mut user = user.clone();
        if method == Method::Ntfy && user.ntfy_topic.as_deref().map_or(true, str::is_empty) {
            user.ntfy_topic = self
                .db
                .get_setting(SETTING_NTFY_TOPIC)?
                .filter(|t| !t.trim().is_empty());
        }
        Ok(user)
    }

    pub async fn send(&self, user: &User, notification: &Notification) -> Result<Delivery> {
        if !user.enabled || !user.notification_enabled {
            debug!(user = %user.name, "Notifications off, skipping");
            return Ok(Delivery::Muted);
        }
        self.send_unchecked(user, notification).await?;
        Ok(Delivery::Sent)
    }

    /// Deliver regardless of the user's notification switch (test messages).
    pub async fn send_unchecked(&self, user: &User, notification: &Notification) -> Result<()> {
        let method = self.method()?;
        let channel = self.channel(method)?;
        let recipient = self.recipient(user, method)?;
        channel.deliver(&recipient, notification).await?;
        debug!(user = %user.name, channel = channel.name(), title = %notification.title, "📨 Notification delivered");
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingChannel;
    use super::*;
    use crate::models::NewUser;

    fn setup() -> (StockDb, User, Arc<RecordingChannel>, Arc<RecordingChannel>, NotificationDispatcher) {
        let db = StockDb::in_memory().unwrap();
        let user = db
            .add_user(&NewUser {
                name: "alice".to_string(),
                chat_id: Some(42),
                ntfy_topic: None,
            })
            .unwrap();
        let tg = Arc::new(RecordingChannel::default());
        let nt = Arc::new(RecordingChannel::default());
        let dispatcher = NotificationDispatcher::new(
            db.clone(),
            Some(tg.clone() as Arc<dyn NotificationChannel>),
            Some(nt.clone() as Arc<dyn NotificationChannel>),
        );
        (db, user, tg, nt, dispatcher)
    }

    #[tokio::test]
    async fn test_defaults_to_telegram() {
        let (_db, user, tg, nt, dispatcher) = setup();
        let outcome = dispatcher
            .send(&user, &Notification::new("t", "m"))
            .await
            .unwrap();
        assert_eq!(outcome, Delivery::Sent);
        assert_eq!(tg.count(), 1);
        assert_eq!(nt.count(), 0);
    }

    #[tokio::test]
    async fn test_ntfy_uses_setting_topic_fallback() {
        let (db, user, tg, nt, dispatcher) = setup();
        db.set_setting(SETTING_METHOD, "ntfy", None).unwrap();
        db.set_setting(SETTING_NTFY_TOPIC, "family-alerts", None).unwrap();

        dispatcher.send(&user, &Notification::new("t", "m")).await.unwrap();
        assert_eq!(tg.count(), 0);
        let sent = nt.sent.lock();
        assert_eq!(sent[0].0.ntfy_topic.as_deref(), Some("family-alerts"));
    }

    #[tokio::test]
    async fn test_muted_user_is_skipped() {
        let (db, user, tg, _nt, dispatcher) = setup();
        db.set_notification_enabled(user.id, false).unwrap();
        let user = db.get_user(user.id).unwrap().unwrap();

        let outcome = dispatcher
            .send(&user, &Notification::new("t", "m"))
            .await
            .unwrap();
        assert_eq!(outcome, Delivery::Muted);
        assert_eq!(tg.count(), 0);

        dispatcher
            .send_unchecked(&user, &Notification::new("test", "m"))
            .await
            .unwrap();
        assert_eq!(tg.count(), 1);
    }

    #[tokio::test]
    async fn test_missing_channel_is_error() {
        let db = StockDb::in_memory().unwrap();
        let user = db
            .add_user(&NewUser {
                name: "bob".to_string(),
                ..Default::default()
            })
            .unwrap();
        let dispatcher = NotificationDispatcher::new(db, None, None);
        assert!(dispatcher
            .send(&user, &Notification::new("t", "m"))
            .await
            .is_err());
    }

    #[test]
    fn test_notification_builder() {
        let n = Notification::new("Title", "Body").with_priority(9).with_tags(&["warning"]);
        assert_eq!(n.priority, 5);
        assert_eq!(n.tags, vec!["warning"]);
        assert_eq!(n.text(), "Title\n\nBody");
    }
}
