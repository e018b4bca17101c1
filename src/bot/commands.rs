//! Slash-command parsing.

/// Commands registered with Telegram, in menu order.
pub const COMMANDS: &[(&str, &str)] = &[
    ("start", "Start the bot"),
    ("help", "Show available commands"),
    ("setbusreminder", "Set a bus reminder"),
    ("list", "List your bus reminders"),
    ("buslist", "List the stops of a bus service"),
    ("deletereminder", "Delete a reminder by its number in /list"),
    ("cancel", "Cancel the current reminder setup"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    SetBusReminder,
    List,
    /// Raw arguments: `[page]` during setup, `<service> [page]` otherwise.
    BusList(String),
    /// Raw argument, validated by the handler so it can explain mistakes.
    DeleteReminder(String),
    Cancel,
    Unknown(String),
}

/// Parse a message as a command. `None` for plain text and for commands
/// addressed to another bot (`/list@otherbot`).
pub fn parse(text: &str, bot_username: &str) -> Option<Command> {
    let text = text.trim();
    let body = text.strip_prefix('/')?;

    let (head, args) = match body.split_once(char::is_whitespace) {
        Some((head, args)) => (head, args.trim()),
        None => (body, ""),
    };
    let (name, mention) = match head.split_once('@') {
        Some((name, mention)) => (name, Some(mention)),
        None => (head, None),
    };
    if mention.is_some_and(|m| !m.eq_ignore_ascii_case(bot_username)) || name.is_empty() {
        return None;
    }

    let command = match name.to_lowercase().as_str() {
        "start" => Command::Start,
        "help" => Command::Help,
        "setbusreminder" => Command::SetBusReminder,
        "list" => Command::List,
        "buslist" => Command::BusList(args.to_string()),
        "deletereminder" => Command::DeleteReminder(args.to_string()),
        "cancel" => Command::Cancel,
        other => Command::Unknown(other.to_string()),
    };
    Some(command)
}

pub fn help_text() -> String {
    let mut text = String::from("Available commands:\n");
    for (name, description) in COMMANDS {
        let usage = match *name {
            "buslist" => "/buslist [service] [page]".to_string(),
            "deletereminder" => "/deletereminder &lt;number&gt;".to_string(),
            _ => format!("/{name}"),
        };
        text.push_str(&format!("{usage} - {description}\n"));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_commands() {
        assert_eq!(parse("/start", "busbuddy_bot"), Some(Command::Start));
        assert_eq!(parse("/help", "busbuddy_bot"), Some(Command::Help));
        assert_eq!(parse("/setbusreminder", "busbuddy_bot"), Some(Command::SetBusReminder));
        assert_eq!(parse("/list", "busbuddy_bot"), Some(Command::List));
        assert_eq!(parse(" /cancel ", "busbuddy_bot"), Some(Command::Cancel));
        assert_eq!(parse("/LIST", "busbuddy_bot"), Some(Command::List));
    }

    #[test]
    fn test_arguments() {
        assert_eq!(
            parse("/deletereminder 2", "busbuddy_bot"),
            Some(Command::DeleteReminder("2".to_string()))
        );
        assert_eq!(
            parse("/deletereminder", "busbuddy_bot"),
            Some(Command::DeleteReminder(String::new()))
        );
        assert_eq!(
            parse("/buslist  965   2", "busbuddy_bot"),
            Some(Command::BusList("965   2".to_string()))
        );
    }

    #[test]
    fn test_bot_mentions() {
        assert_eq!(parse("/list@BusBuddy_Bot", "busbuddy_bot"), Some(Command::List));
        assert_eq!(
            parse("/deletereminder@busbuddy_bot 1", "busbuddy_bot"),
            Some(Command::DeleteReminder("1".to_string()))
        );
        assert_eq!(parse("/list@otherbot", "busbuddy_bot"), None);
    }

    #[test]
    fn test_not_commands() {
        assert_eq!(parse("965", "busbuddy_bot"), None);
        assert_eq!(parse("", "busbuddy_bot"), None);
        assert_eq!(parse("/", "busbuddy_bot"), None);
        assert_eq!(
            parse("/frobnicate", "busbuddy_bot"),
            Some(Command::Unknown("frobnicate".to_string()))
        );
    }

    #[test]
    fn test_help_lists_every_command() {
        let help = help_text();
        for (name, _) in COMMANDS {
            assert!(help.contains(&format!("/{name}")), "missing /{name}");
        }
    }
}
