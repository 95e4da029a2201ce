//! Slash command parsing for in-game chat. The room intercepts chat RPCs
//! whose text starts with the configured prefix, runs the command, and
//! answers the invoking player with a server-authored chat message.
//! Errors travel back the same way instead of being thrown around.

/// A parsed command invocation.
#[derive(Debug, PartialEq, Eq)]
pub struct Invocation<'a> {
    pub command: &'a str,
    pub args: Vec<&'a str>,
}

/// Splits a chat line into a command invocation, if it carries the prefix.
pub fn parse<'a>(prefix: &str, message: &'a str) -> Option<Invocation<'a>> {
    let rest = message.strip_prefix(prefix)?;
    let mut words = rest.split_whitespace();
    let command = words.next()?;
    Some(Invocation { command, args: words.collect() })
}

/// The commands a room understands. Handlers live on the room because
/// they need its state; this only carries the help catalogue.
pub const COMMANDS: &[(&str, &str)] = &[
    ("help", "list available commands"),
    ("kick <name>", "remove a player from the room"),
    ("ban <name>", "remove a player and ban their address"),
];

pub fn help_text(prefix: &str) -> String {
    COMMANDS
        .iter()
        .map(|(usage, description)| format!("{prefix}{usage} - {description}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_command_and_args() {
        let invocation = parse("/", "/kick Alice").unwrap();
        assert_eq!(invocation.command, "kick");
        assert_eq!(invocation.args, vec!["Alice"]);
    }

    #[test]
    fn plain_chat_is_not_a_command() {
        assert!(parse("/", "hello there").is_none());
        assert!(parse("/", "").is_none());
        assert!(parse("/", "/").is_none());
    }

    #[test]
    fn custom_prefix() {
        let invocation = parse("!", "!help").unwrap();
        assert_eq!(invocation.command, "help");
        assert!(invocation.args.is_empty());
    }
}
