//! Slash commands operators can type in a platform thread.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    /// Delete the replied-to message (Telegram reply context).
    Delete,
    /// Report engine presence back into the thread.
    Status,
    Online,
    Offline,
}

impl OperatorCommand {
    /// Parses `/command` text. Telegram appends `@botname` to commands in
    /// groups; the suffix is ignored.
    pub fn parse(text: &str) -> Option<Self> {
        let token = text.trim().strip_prefix('/')?.split_whitespace().next()?;
        let token = token.split('@').next().unwrap_or(token);
        match token {
            "delete" => Some(OperatorCommand::Delete),
            "status" => Some(OperatorCommand::Status),
            "online" => Some(OperatorCommand::Online),
            "offline" => Some(OperatorCommand::Offline),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_commands() {
        assert_eq!(OperatorCommand::parse("/delete"), Some(OperatorCommand::Delete));
        assert_eq!(OperatorCommand::parse("/status"), Some(OperatorCommand::Status));
        assert_eq!(OperatorCommand::parse("/online"), Some(OperatorCommand::Online));
        assert_eq!(OperatorCommand::parse("  /offline  "), Some(OperatorCommand::Offline));
    }

    #[test]
    fn strips_telegram_bot_suffix() {
        assert_eq!(
            OperatorCommand::parse("/delete@chatlink_bot"),
            Some(OperatorCommand::Delete)
        );
    }

    #[test]
    fn rejects_non_commands() {
        assert_eq!(OperatorCommand::parse("hello"), None);
        assert_eq!(OperatorCommand::parse("/unknown"), None);
        assert_eq!(OperatorCommand::parse("/"), None);
        assert_eq!(OperatorCommand::parse(""), None);
    }
}
