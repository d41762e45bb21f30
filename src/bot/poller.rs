use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{BotHandler, Reply};
use crate::notify::telegram::{TelegramClient, MAX_CAPTION_LEN};

const POLL_TIMEOUT_SECS: u64 = 30;
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

async fn send_reply(client: &TelegramClient, chat_id: i64, reply: Reply) -> anyhow::Result<()> {
    match reply {
        Reply::Text(text) => client.send_message(chat_id, &text).await,
        Reply::Photo { path, caption } => {
            if caption.len() <= MAX_CAPTION_LEN {
                client.send_photo(chat_id, &path, Some(&caption)).await
            } else {
                client.send_photo(chat_id, &path, None).await?;
                client.send_message(chat_id, &caption).await
            }
        }
    }
}

/// Long-poll Telegram forever, answering each message through `handler`.
pub async fn run_poller(client: TelegramClient, handler: Arc<BotHandler>) {
    info!("🤖 Telegram bot polling started");
    let mut offset = 0i64;

    loop {
        let updates = match client.get_updates(offset, POLL_TIMEOUT_SECS).await {
            Ok(updates) => updates,
            Err(e) => {
                warn!("getUpdates failed: {:#}", e);
                tokio::time::sleep(ERROR_BACKOFF).await;
                continue;
            }
        };

        for update in updates {
            offset = offset.max(update.update_id + 1);
            let Some(message) = update.message else { continue };
            let Some(text) = message.text else { continue };
            let chat_id = message.chat.id;
            debug!(chat_id, text = %text, "Bot message");

            for reply in handler.handle(chat_id, &text).await {
                if let Err(e) = send_reply(&client, chat_id, reply).await {
                    warn!(chat_id, "Reply failed: {:#}", e);
                }
            }
        }
    }
}
