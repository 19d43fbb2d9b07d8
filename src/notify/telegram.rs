//! Telegram Bot API delivery.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::warn;

use super::Notifier;
use crate::config::TelegramConfig;

const API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Clone)]
pub struct TelegramNotifier {
    client: Client,
    config: TelegramConfig,
    api_base: String,
}

impl TelegramNotifier {
    pub fn new(config: TelegramConfig) -> Self {
        Self {
            client: Client::new(),
            config,
            api_base: API_BASE.to_string(),
        }
    }

    /// Override the API host, for tests.
    pub fn with_api_base(mut self, api_base: String) -> Self {
        self.api_base = api_base;
        self
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, text: String) -> bool {
        if !self.config.enabled {
            return true;
        }

        let url = format!(
            "{}/bot{}/sendMessage",
            self.api_base, self.config.bot_token
        );
        let body = json!({
            "chat_id": self.config.chat_id,
            "text": text,
            "parse_mode": "HTML",
        });

        match self.client.post(&url).json(&body).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                warn!(status = %response.status(), "telegram rejected message");
                false
            }
            Err(e) => {
                warn!("telegram delivery failed: {e}");
                false
            }
        }
    }
}
