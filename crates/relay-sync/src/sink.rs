//! Chat delivery: the sink contract and the Discord bot REST implementation.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

pub const DEFAULT_DISCORD_API_BASE: &str = "https://discord.com/api/v10";

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("chat credential rejected (status {status})")]
    Unauthorized { status: u16 },
    #[error("channel {channel_id} could not be resolved (status {status}): {body}")]
    ChannelResolution {
        channel_id: String,
        status: u16,
        body: String,
    },
    #[error("message delivery failed with status {status}: {body}")]
    Delivery { status: u16, body: String },
    #[error("chat request failed: {0}")]
    Request(#[from] reqwest::Error),
}

#[async_trait]
pub trait ChatSink: Send + Sync {
    /// Posts one message. Returns only after the channel accepted it.
    async fn send(&self, payload: &str) -> Result<(), SinkError>;
}

#[derive(Debug, Clone)]
pub struct DiscordSinkConfig {
    pub api_base: String,
    pub token: String,
    pub channel_id: String,
}

#[derive(Debug, Deserialize)]
struct CurrentUser {
    #[serde(default)]
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChannelInfo {
    #[serde(default)]
    name: Option<String>,
}

/// Bot-authenticated Discord channel. Construction performs the login handshake.
#[derive(Debug, Clone)]
pub struct DiscordSink {
    client: reqwest::Client,
    api_base: String,
    token: String,
    channel_id: String,
}

impl DiscordSink {
    /// Authorizes the bot token and resolves the configured channel.
    pub async fn connect(
        client: reqwest::Client,
        config: DiscordSinkConfig,
    ) -> Result<Self, SinkError> {
        let sink = Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token: config.token,
            channel_id: config.channel_id.trim().to_string(),
        };

        let resp = sink
            .client
            .get(format!("{}/users/@me", sink.api_base))
            .header(reqwest::header::AUTHORIZATION, sink.auth_header())
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(SinkError::Unauthorized {
                status: resp.status().as_u16(),
            });
        }
        let user: CurrentUser = resp.json().await?;

        let resp = sink
            .client
            .get(format!("{}/channels/{}", sink.api_base, sink.channel_id))
            .header(reqwest::header::AUTHORIZATION, sink.auth_header())
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SinkError::ChannelResolution {
                channel_id: sink.channel_id.clone(),
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        let channel: ChannelInfo = resp.json().await?;

        info!(
            bot = user.username.as_deref().unwrap_or("unknown"),
            channel_id = %sink.channel_id,
            channel = channel.name.as_deref().unwrap_or("unnamed"),
            "chat channel resolved"
        );
        Ok(sink)
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    fn auth_header(&self) -> String {
        format!("Bot {}", self.token)
    }
}

#[async_trait]
impl ChatSink for DiscordSink {
    async fn send(&self, payload: &str) -> Result<(), SinkError> {
        let resp = self
            .client
            .post(format!("{}/channels/{}/messages", self.api_base, self.channel_id))
            .header(reqwest::header::AUTHORIZATION, self.auth_header())
            .json(&json!({
                "content": payload,
                "allowed_mentions": { "parse": [] },
            }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(SinkError::Delivery {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }
        debug!(chars = payload.chars().count(), "message delivered");
        Ok(())
    }
}
