//! Chatlink bridge server: widget API plus platform webhooks in one binary.

mod api;
mod config;

use anyhow::Result;
use std::sync::Arc;
use time::OffsetDateTime;

use chatlink_bridges::{
    DiscordBridge, DiscordConfig, SharedBridge, SlackBridge, SlackConfig, TelegramBridge,
    TelegramConfig, ThreadIndex,
};
use chatlink_hub::{Hub, HubConfig};
use chatlink_storage::{MemoryStorage, SharedStorage};
use chatlink_telemetry::TelemetryConfig;
use chatlink_webhooks::{WebhookConfig, WebhookState};

use config::{DiscordSettings, ServerConfig, SlackSettings};

#[tokio::main]
async fn main() -> Result<()> {
    chatlink_telemetry::init(&TelemetryConfig::new("chatlink-server"));
    let config = ServerConfig::from_env();

    let storage: SharedStorage = Arc::new(MemoryStorage::new());
    let threads = Arc::new(ThreadIndex::new());
    let http = reqwest::Client::new();

    let mut bridges: Vec<SharedBridge> = Vec::new();
    if let Some(telegram) = &config.telegram {
        bridges.push(Arc::new(TelegramBridge::new(
            http.clone(),
            TelegramConfig::new(&telegram.bot_token, &telegram.chat_id),
            threads.clone(),
            storage.clone(),
        )));
        tracing::info!("telegram bridge enabled");
    }
    if let Some(discord) = &config.discord {
        let mut discord_config = match discord {
            DiscordSettings::Bot {
                bot_token,
                channel_id,
            } => DiscordConfig::bot(bot_token, channel_id),
            DiscordSettings::Webhook { url } => DiscordConfig::webhook(url),
        };
        discord_config.username = config.discord_username.clone();
        discord_config.avatar_url = config.discord_avatar_url.clone();
        bridges.push(Arc::new(DiscordBridge::new(
            http.clone(),
            discord_config,
            threads.clone(),
            storage.clone(),
        )));
        tracing::info!("discord bridge enabled");
    }
    if let Some(slack) = &config.slack {
        let mut slack_config = match slack {
            SlackSettings::Bot {
                bot_token,
                channel_id,
            } => SlackConfig::bot(bot_token, channel_id),
            SlackSettings::Webhook { url } => SlackConfig::webhook(url),
        };
        slack_config.username = config.slack_username.clone();
        slack_config.icon_emoji = config.slack_icon_emoji.clone();
        bridges.push(Arc::new(SlackBridge::new(
            http.clone(),
            slack_config,
            threads.clone(),
            storage.clone(),
        )));
        tracing::info!("slack bridge enabled");
    }
    if bridges.is_empty() {
        tracing::warn!("no bridges configured; conversations stay widget-only");
    }

    let hub = Arc::new(Hub::new(
        storage,
        bridges,
        threads,
        HubConfig {
            welcome_message: config.welcome_message.clone(),
            ..Default::default()
        },
    ));

    let webhook_state = WebhookState::new(
        hub.clone(),
        WebhookConfig {
            telegram_secret_token: config.telegram_secret_token.clone(),
            telegram_bot_token: config.telegram_bot_token(),
            slack_signing_secret: config.slack_signing_secret.clone(),
            slack_bot_token: config.slack_bot_token(),
            allowed_bot_ids: config.allowed_bot_ids.clone(),
            ..Default::default()
        },
    );

    let app = api::router(hub.clone()).merge(chatlink_webhooks::router(webhook_state));

    let cleanup_hub = hub.clone();
    let ttl = time::Duration::hours(config.session_ttl_hours as i64);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(3600));
        loop {
            tick.tick().await;
            let cutoff = OffsetDateTime::now_utc() - ttl;
            match cleanup_hub.cleanup_sessions(cutoff).await {
                Ok(0) => {}
                Ok(count) => tracing::info!(count, "expired sessions removed"),
                Err(err) => tracing::warn!(error = %err, "session cleanup failed"),
            }
        }
    });

    let addr: std::net::SocketAddr = config.bind.parse()?;
    tracing::info!("chatlink-server listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
