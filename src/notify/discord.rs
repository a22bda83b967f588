use super::{DispatchError, Dispatcher};
use crate::config::DiscordConfig;
use crate::models::{Listing, MessageRef};
use crate::utils;
use chrono::Local;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const API_BASE: &str = "https://discord.com/api/v10";
const COLOR_NEW: u32 = 0x2e_cc_71;
const COLOR_REMOVED: u32 = 0xe7_4c_3c;
const COLOR_REACTIVATED: u32 = 0x34_98_db;
/// Discord error code for "Unknown Message".
const UNKNOWN_MESSAGE: u64 = 10008;

/// Bot-token client for one channel.
///
/// [`DiscordNotifier::connect`] blocks until the API accepts the token, so a
/// run never starts dispatching against a dead connection.
pub struct DiscordNotifier {
    client: Client,
    token: String,
    channel_id: String,
    max_retries: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    New,
    Removed,
    Reactivated,
}

#[derive(Debug, Serialize)]
struct EmbedImage {
    url: String,
}

#[derive(Debug, Serialize)]
struct Embed {
    title: String,
    url: String,
    description: String,
    color: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<EmbedImage>,
}

#[derive(Debug, Serialize)]
struct MessagePayload {
    embeds: Vec<Embed>,
}

#[derive(Debug, Deserialize)]
struct CreatedMessage {
    id: String,
    channel_id: String,
}

#[derive(Debug, Deserialize)]
struct ChannelMessage {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RateLimited {
    retry_after: f64,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: u64,
}

#[derive(Debug, Deserialize)]
struct CurrentUser {
    username: String,
}

impl DiscordNotifier {
    /// Wait for the API to accept the bot token, for at most `ready_timeout`.
    pub fn connect(config: &DiscordConfig, ready_timeout: Duration) -> Result<Self, DispatchError> {
        let client = Client::builder().timeout(Duration::from_secs(15)).build()?;
        let notifier = Self {
            client,
            token: config.token.clone(),
            channel_id: config.channel_id.to_string(),
            max_retries: 3,
        };

        let deadline = Instant::now() + ready_timeout;
        loop {
            match notifier.authorized(notifier.client.get(format!("{API_BASE}/users/@me"))).send() {
                Ok(response) if response.status().is_success() => {
                    let user: CurrentUser = response.json()?;
                    info!(user = %user.username, channel = %notifier.channel_id, "chat connection ready");
                    return Ok(notifier);
                }
                Ok(response) if response.status() == StatusCode::UNAUTHORIZED => {
                    return Err(DispatchError::NotReady("bot token rejected".to_string()));
                }
                Ok(response) => debug!(status = %response.status(), "chat API not ready yet"),
                Err(e) => debug!(error = %e, "chat API not reachable yet"),
            }
            if Instant::now() >= deadline {
                return Err(DispatchError::NotReady(format!(
                    "no answer within {}s",
                    ready_timeout.as_secs()
                )));
            }
            std::thread::sleep(Duration::from_secs(2).min(deadline.saturating_duration_since(Instant::now())));
        }
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.header("Authorization", format!("Bot {}", self.token))
    }

    fn message_url(&self, message_ref: &MessageRef) -> String {
        format!(
            "{API_BASE}/channels/{}/messages/{}",
            message_ref.channel_id, message_ref.message_id
        )
    }

    /// Send with retries on 429 and 5xx. Other statuses become errors.
    fn execute(&self, build: impl Fn() -> RequestBuilder) -> Result<Response, DispatchError> {
        let mut attempt: u8 = 0;
        loop {
            attempt += 1;
            let response = self.authorized(build()).send()?;
            let status = response.status();

            if status.is_success() {
                return Ok(response);
            }
            if status == StatusCode::TOO_MANY_REQUESTS && attempt < self.max_retries {
                let wait = response
                    .json::<RateLimited>()
                    .map(|body| Duration::from_secs_f64(body.retry_after.max(0.0)))
                    .unwrap_or(Duration::from_secs(1));
                warn!(wait_ms = wait.as_millis() as u64, "rate limited by chat API");
                std::thread::sleep(wait);
                continue;
            }
            if status.is_server_error() && attempt < self.max_retries {
                std::thread::sleep(Duration::from_millis(500u64 << (attempt - 1)));
                continue;
            }

            let body = response.text().unwrap_or_default();
            if status == StatusCode::NOT_FOUND && is_unknown_message(&body) {
                return Err(DispatchError::UnknownMessage(body));
            }
            return Err(DispatchError::Status {
                status: status.as_u16(),
                body,
            });
        }
    }

    fn edit(&self, listing: &Listing, state: MessageState) -> Result<(), DispatchError> {
        let message_ref = listing
            .message_ref
            .as_ref()
            .ok_or_else(|| DispatchError::NoMessage(listing.key().to_string()))?;
        let payload = payload_for(listing, state);
        let url = self.message_url(message_ref);
        self.execute(|| self.client.patch(&url).json(&payload))?;
        debug!(key = %listing.key(), ?state, "message updated");
        Ok(())
    }

    /// Ids of up to `limit` most recent messages in the channel (max 100 per call).
    pub fn recent_messages(&self, limit: u8) -> Result<Vec<MessageRef>, DispatchError> {
        let url = format!("{API_BASE}/channels/{}/messages", self.channel_id);
        let limit = limit.clamp(1, 100).to_string();
        let messages: Vec<ChannelMessage> = self
            .execute(|| self.client.get(&url).query(&[("limit", limit.as_str())]))?
            .json()?;
        Ok(messages
            .into_iter()
            .map(|message| MessageRef {
                channel_id: self.channel_id.clone(),
                message_id: message.id,
            })
            .collect())
    }
}

fn is_unknown_message(body: &str) -> bool {
    serde_json::from_str::<ApiError>(body)
        .map(|error| error.code == UNKNOWN_MESSAGE)
        .unwrap_or(false)
}

fn payload_for(listing: &Listing, state: MessageState) -> MessagePayload {
    let today = Local::now().date_naive();
    let (title, color) = match state {
        MessageState::New => (utils::notification_title(&listing.url, today), COLOR_NEW),
        MessageState::Removed => (
            format!("❌ Removed: {}", utils::company_name(&listing.url)),
            COLOR_REMOVED,
        ),
        MessageState::Reactivated => (
            format!("🔄 Available again: {}", utils::company_name(&listing.url)),
            COLOR_REACTIVATED,
        ),
    };

    let mut description = format!(
        "📍 {}\n💰 {}\n🛏️ {}\n📐 {}\n📅 {}",
        listing.address, listing.price, listing.rooms, listing.size, listing.available_text
    );
    if let (MessageState::Removed, Some(removed_at)) = (state, listing.removed_at) {
        description.push_str(&format!("\n🗓️ Removed {}", removed_at.format("%Y-%m-%d")));
    }

    MessagePayload {
        embeds: vec![Embed {
            title,
            url: listing.url.clone(),
            description,
            color,
            image: listing.image_url.clone().map(|url| EmbedImage { url }),
        }],
    }
}

impl Dispatcher for DiscordNotifier {
    fn send(&mut self, listing: &Listing) -> Result<MessageRef, DispatchError> {
        let url = format!("{API_BASE}/channels/{}/messages", self.channel_id);
        let payload = payload_for(listing, MessageState::New);
        let created: CreatedMessage = self.execute(|| self.client.post(&url).json(&payload))?.json()?;
        debug!(key = %listing.key(), message = %created.id, "message sent");
        Ok(MessageRef {
            channel_id: created.channel_id,
            message_id: created.id,
        })
    }

    fn update_removed(&mut self, listing: &Listing) -> Result<(), DispatchError> {
        self.edit(listing, MessageState::Removed)
    }

    fn update_reactivated(&mut self, listing: &Listing) -> Result<(), DispatchError> {
        self.edit(listing, MessageState::Reactivated)
    }

    fn delete(&mut self, message_ref: &MessageRef) -> Result<(), DispatchError> {
        let url = self.message_url(message_ref);
        self.execute(|| self.client.delete(&url))?;
        debug!(message = %message_ref.message_id, "message deleted");
        Ok(())
    }
}

impl Drop for DiscordNotifier {
    fn drop(&mut self) {
        debug!(channel = %self.channel_id, "chat connection released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Price;
    use chrono::NaiveDate;
    use serde_json::{json, Map};

    fn listing() -> Listing {
        Listing {
            source_id: "subo".to_string(),
            identity_key: "Storgatan 12, Sundsvall".to_string(),
            url: "https://www.subo.se/lagenhet/11/".to_string(),
            address: "Storgatan 12, Sundsvall".to_string(),
            price: Price::Known("6 540:-/månad".to_string()),
            rooms: "2 rum".to_string(),
            size: "54 kvm".to_string(),
            available_text: "Ledigt från 1 april".to_string(),
            image_url: Some("https://www.subo.se/a.jpg".to_string()),
            active: true,
            removed_at: None,
            manual_override: false,
            message_ref: None,
            first_seen: None,
            last_seen: None,
            extra: Map::new(),
        }
    }

    #[test]
    fn new_listing_payload_carries_fields_and_image() {
        let payload = serde_json::to_value(payload_for(&listing(), MessageState::New)).unwrap();
        let embed = &payload["embeds"][0];
        assert!(embed["title"].as_str().unwrap().contains("Sundsvalls Bostäder"));
        assert_eq!(embed["url"], "https://www.subo.se/lagenhet/11/");
        assert_eq!(embed["image"], json!({"url": "https://www.subo.se/a.jpg"}));
        let description = embed["description"].as_str().unwrap();
        assert!(description.contains("6 540:-/månad"));
        assert!(description.contains("54 kvm"));
    }

    #[test]
    fn removed_payload_mentions_the_date() {
        let mut removed = listing();
        removed.image_url = None;
        removed.deactivate(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        let payload = serde_json::to_value(payload_for(&removed, MessageState::Removed)).unwrap();
        let embed = &payload["embeds"][0];
        assert!(embed["title"].as_str().unwrap().starts_with("❌ Removed"));
        assert!(embed["description"].as_str().unwrap().contains("Removed 2024-03-01"));
        assert!(embed.get("image").is_none());
        assert_eq!(embed["color"], COLOR_REMOVED);
    }

    #[test]
    fn unknown_message_errors_are_recognised() {
        assert!(is_unknown_message(r#"{"message": "Unknown Message", "code": 10008}"#));
        assert!(!is_unknown_message(r#"{"message": "Unknown Channel", "code": 10003}"#));
        assert!(!is_unknown_message("not json"));
    }
}
