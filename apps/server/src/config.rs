//! Environment-driven server configuration.
//!
//! Each platform is enabled by its credentials. Discord and Slack prefer
//! bot credentials when both a bot and a webhook URL are present; the bot
//! mode carries more capabilities (threads, edits, deletes).

#[derive(Debug, Clone)]
pub struct TelegramSettings {
    pub bot_token: String,
    pub chat_id: String,
}

#[derive(Debug, Clone)]
pub enum DiscordSettings {
    Bot { bot_token: String, channel_id: String },
    Webhook { url: String },
}

#[derive(Debug, Clone)]
pub enum SlackSettings {
    Bot { bot_token: String, channel_id: String },
    Webhook { url: String },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub welcome_message: Option<String>,
    pub session_ttl_hours: u64,
    pub telegram: Option<TelegramSettings>,
    pub telegram_secret_token: Option<String>,
    pub discord: Option<DiscordSettings>,
    pub discord_username: Option<String>,
    pub discord_avatar_url: Option<String>,
    pub slack: Option<SlackSettings>,
    pub slack_username: Option<String>,
    pub slack_icon_emoji: Option<String>,
    pub slack_signing_secret: Option<String>,
    pub allowed_bot_ids: Vec<String>,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let get = |name: &str| get(name).filter(|value| !value.trim().is_empty());

        let telegram = match (get("TELEGRAM_BOT_TOKEN"), get("TELEGRAM_CHAT_ID")) {
            (Some(bot_token), Some(chat_id)) => Some(TelegramSettings { bot_token, chat_id }),
            _ => None,
        };

        let discord = match (get("DISCORD_BOT_TOKEN"), get("DISCORD_CHANNEL_ID")) {
            (Some(bot_token), Some(channel_id)) => Some(DiscordSettings::Bot {
                bot_token,
                channel_id,
            }),
            _ => get("DISCORD_WEBHOOK_URL").map(|url| DiscordSettings::Webhook { url }),
        };

        let slack = match (get("SLACK_BOT_TOKEN"), get("SLACK_CHANNEL_ID")) {
            (Some(bot_token), Some(channel_id)) => Some(SlackSettings::Bot {
                bot_token,
                channel_id,
            }),
            _ => get("SLACK_WEBHOOK_URL").map(|url| SlackSettings::Webhook { url }),
        };

        let allowed_bot_ids = get("BRIDGE_TEST_BOT_IDS")
            .map(|csv| {
                csv.split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        ServerConfig {
            bind: get("BIND").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            welcome_message: get("WELCOME_MESSAGE"),
            session_ttl_hours: get("SESSION_TTL_HOURS")
                .and_then(|value| value.parse().ok())
                .unwrap_or(24),
            telegram,
            telegram_secret_token: get("TELEGRAM_SECRET_TOKEN"),
            discord,
            discord_username: get("DISCORD_USERNAME"),
            discord_avatar_url: get("DISCORD_AVATAR_URL"),
            slack,
            slack_username: get("SLACK_USERNAME"),
            slack_icon_emoji: get("SLACK_ICON_EMOJI"),
            slack_signing_secret: get("SLACK_SIGNING_SECRET"),
            allowed_bot_ids,
        }
    }

    pub fn telegram_bot_token(&self) -> Option<String> {
        self.telegram.as_ref().map(|t| t.bot_token.clone())
    }

    pub fn slack_bot_token(&self) -> Option<String> {
        match &self.slack {
            Some(SlackSettings::Bot { bot_token, .. }) => Some(bot_token.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> ServerConfig {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn bot_credentials_beat_webhook_urls() {
        let cfg = config(&[
            ("DISCORD_BOT_TOKEN", "bot-t"),
            ("DISCORD_CHANNEL_ID", "chan"),
            ("DISCORD_WEBHOOK_URL", "https://discord.com/api/webhooks/x"),
            ("SLACK_WEBHOOK_URL", "https://hooks.slack.com/services/x"),
        ]);
        assert!(matches!(cfg.discord, Some(DiscordSettings::Bot { .. })));
        assert!(matches!(cfg.slack, Some(SlackSettings::Webhook { .. })));
    }

    #[test]
    fn partial_telegram_credentials_disable_the_bridge() {
        let cfg = config(&[("TELEGRAM_BOT_TOKEN", "123:abc")]);
        assert!(cfg.telegram.is_none());

        let cfg = config(&[
            ("TELEGRAM_BOT_TOKEN", "123:abc"),
            ("TELEGRAM_CHAT_ID", "-100555"),
        ]);
        assert_eq!(cfg.telegram.unwrap().chat_id, "-100555");
    }

    #[test]
    fn bot_id_csv_is_trimmed() {
        let cfg = config(&[("BRIDGE_TEST_BOT_IDS", "B1, B2 ,,B3")]);
        assert_eq!(cfg.allowed_bot_ids, vec!["B1", "B2", "B3"]);
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = config(&[]);
        assert_eq!(cfg.bind, "0.0.0.0:8080");
        assert_eq!(cfg.session_ttl_hours, 24);
        assert!(cfg.telegram.is_none());
        assert!(cfg.discord.is_none());
        assert!(cfg.slack.is_none());
    }
}
