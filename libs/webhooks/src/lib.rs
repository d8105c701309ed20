//! Inbound webhook endpoints for the three platforms.
//!
//! Each handler authenticates the request, normalizes the platform payload
//! into hub operations (operator message, edit, delete, presence) and
//! acknowledges quickly; platform retries are driven by the status code.

mod command;
mod discord;
mod slack;
mod telegram;

use axum::routing::post;
use axum::{Json, Router};
use serde_json::{Value, json};
use std::sync::Arc;

use chatlink_hub::Hub;

pub use command::OperatorCommand;
pub use slack::verify_slack_signature;

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Compared against `X-Telegram-Bot-Api-Secret-Token` when set.
    pub telegram_secret_token: Option<String>,
    pub telegram_bot_token: Option<String>,
    pub telegram_api_base: String,
    pub slack_signing_secret: Option<String>,
    pub slack_bot_token: Option<String>,
    pub slack_api_base: String,
    /// Slack bot ids whose messages are processed instead of dropped,
    /// used by automated test operators.
    pub allowed_bot_ids: Vec<String>,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        WebhookConfig {
            telegram_secret_token: None,
            telegram_bot_token: None,
            telegram_api_base: "https://api.telegram.org".to_string(),
            slack_signing_secret: None,
            slack_bot_token: None,
            slack_api_base: "https://slack.com/api".to_string(),
            allowed_bot_ids: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct WebhookState {
    pub hub: Arc<Hub>,
    pub http: reqwest::Client,
    pub config: Arc<WebhookConfig>,
}

impl WebhookState {
    pub fn new(hub: Arc<Hub>, config: WebhookConfig) -> Self {
        WebhookState {
            hub,
            http: reqwest::Client::new(),
            config: Arc::new(config),
        }
    }
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/webhooks/telegram", post(telegram::handle))
        .route("/webhooks/slack", post(slack::handle))
        .route("/webhooks/discord", post(discord::handle))
        .with_state(state)
}

pub(crate) fn ok_body() -> Json<Value> {
    Json(json!({ "ok": true }))
}
