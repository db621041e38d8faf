//! Slash-command parsing and access requirements

use regex::Regex;
use std::sync::LazyLock;

static COMMAND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^/(?P<name>[^\s@]*)(?:@(?P<bot>\S*))?(?:\s+(?P<args>.*))?$")
        .expect("command pattern is valid")
});

/// Who may run a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Anyone,
    User,
    Owner,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Auth(Option<String>),
    Search(Option<String>),
    Library(Option<String>),
    Wanted,
    Clear,
    Users,
    Revoke,
    Unrevoke,
    Unknown(String),
}

impl Command {
    /// Parses a `/command [args]` message. Returns `None` for text that is
    /// not a command, or for a command addressed to a different bot. Any
    /// other slash text, malformed names included, is `Unknown`.
    pub fn parse(text: &str, bot_name: Option<&str>) -> Option<Command> {
        let caps = COMMAND_RE.captures(text.trim())?;

        let mention = caps.name("bot").filter(|m| !m.as_str().is_empty());
        if let (Some(target), Some(own)) = (mention, bot_name) {
            if !target.as_str().eq_ignore_ascii_case(own.trim_start_matches('@')) {
                return None;
            }
        }

        let args = caps
            .name("args")
            .map(|m| m.as_str().trim().to_string())
            .filter(|value| !value.is_empty());
        let name = caps.name("name")?.as_str().to_lowercase();

        let command = match name.as_str() {
            "start" | "help" => Command::Help,
            "auth" => Command::Auth(args),
            "q" | "search" => Command::Search(args),
            "library" => Command::Library(args),
            "wanted" => Command::Wanted,
            "clear" | "cancel" => Command::Clear,
            "users" => Command::Users,
            "revoke" => Command::Revoke,
            "unrevoke" => Command::Unrevoke,
            _ => Command::Unknown(format!("/{}", name)),
        };
        Some(command)
    }

    /// Canonical name for logs. Arguments are left out so passwords never
    /// reach the log.
    pub fn name(&self) -> &str {
        match self {
            Command::Help => "help",
            Command::Auth(_) => "auth",
            Command::Search(_) => "q",
            Command::Library(_) => "library",
            Command::Wanted => "wanted",
            Command::Clear => "clear",
            Command::Users => "users",
            Command::Revoke => "revoke",
            Command::Unrevoke => "unrevoke",
            Command::Unknown(name) => name,
        }
    }

    pub fn access(&self) -> Access {
        match self {
            Command::Help | Command::Auth(_) | Command::Clear | Command::Unknown(_) => {
                Access::Anyone
            }
            Command::Search(_) | Command::Library(_) | Command::Wanted => Access::User,
            Command::Users | Command::Revoke | Command::Unrevoke => Access::Owner,
        }
    }
}
