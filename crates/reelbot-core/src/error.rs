//! Bot errors and the chat text each one produces

use reelbot_acl::AclError;
use thiserror::Error;

/// Prefix of every failure reply, so users can tell errors from answers.
pub const ERROR_MARKER: &str = "❌ ";

#[derive(Debug, Error)]
pub enum BotError {
    #[error("sender is not authorized")]
    NotAuthorized,
    #[error("command restricted to the owner")]
    AdminOnly,
    #[error("sender is already authorized")]
    AlreadyAuthorized,
    #[error("sender is revoked")]
    Banned,
    #[error("wrong password")]
    WrongPassword,
    #[error("free text without an active conversation")]
    NoActiveFlow,
    #[error("reply does not match any offered choice")]
    SelectionNotFound,
    #[error("catalog request failed: {0}")]
    UpstreamError(String),
    #[error("no results")]
    NoResults,
    #[error("movie already in library")]
    AlreadyInLibrary,
    #[error("unknown command {0}")]
    UnknownCommand(String),
    #[error("access list persistence failed: {0}")]
    PersistenceFailure(String),
}

impl BotError {
    pub fn upstream(err: impl std::fmt::Display) -> Self {
        BotError::UpstreamError(err.to_string())
    }

    /// Only persistence failures stop the bot.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BotError::PersistenceFailure(_))
    }

    /// Text sent to the chat, always starting with [`ERROR_MARKER`].
    pub fn user_message(&self) -> String {
        let body = match self {
            BotError::NotAuthorized => {
                "You are not authorized. Send `/auth <password>` first.".to_string()
            }
            BotError::AdminOnly => "Only the owner can use this command.".to_string(),
            BotError::AlreadyAuthorized => "You are already authorized.".to_string(),
            BotError::Banned => "Your access has been revoked.".to_string(),
            BotError::WrongPassword => "Wrong password.".to_string(),
            BotError::NoActiveFlow => {
                "Nothing is in progress. Start over with /q or see /help.".to_string()
            }
            BotError::SelectionNotFound => {
                "That is not one of the offered choices. Pick a button, or /clear to start over."
                    .to_string()
            }
            BotError::UpstreamError(_) => {
                "The movie server did not answer as expected. Please try again.".to_string()
            }
            BotError::NoResults => "Nothing found. Try another name.".to_string(),
            BotError::AlreadyInLibrary => {
                "That movie is already in the library. Send another movie name.".to_string()
            }
            BotError::UnknownCommand(name) => {
                format!("Unknown command {}. See /help.", name)
            }
            BotError::PersistenceFailure(_) => {
                "Could not save the user list. The bot is stopping.".to_string()
            }
        };
        format!("{}{}", ERROR_MARKER, body)
    }
}

impl From<AclError> for BotError {
    fn from(err: AclError) -> Self {
        match err {
            AclError::AlreadyAuthorized => BotError::AlreadyAuthorized,
            AclError::Banned => BotError::Banned,
            AclError::WrongPassword => BotError::WrongPassword,
            AclError::NotFound(_) => BotError::SelectionNotFound,
            err @ (AclError::Persistence { .. } | AclError::Load { .. }) => {
                BotError::PersistenceFailure(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_user_message_carries_marker() {
        let errors = [
            BotError::NotAuthorized,
            BotError::AdminOnly,
            BotError::AlreadyAuthorized,
            BotError::Banned,
            BotError::WrongPassword,
            BotError::NoActiveFlow,
            BotError::SelectionNotFound,
            BotError::upstream("timeout"),
            BotError::NoResults,
            BotError::AlreadyInLibrary,
            BotError::UnknownCommand("/nope".to_string()),
            BotError::PersistenceFailure("disk full".to_string()),
        ];
        for err in errors {
            assert!(err.user_message().starts_with(ERROR_MARKER), "{:?}", err);
        }
    }

    #[test]
    fn upstream_detail_stays_out_of_chat() {
        let err = BotError::upstream("HTTP 500 secret-api-key");
        assert!(!err.user_message().contains("secret-api-key"));
        assert!(err.to_string().contains("HTTP 500"));
    }

    #[test]
    fn only_persistence_failures_are_fatal() {
        let persistence: BotError = AclError::Persistence {
            path: "/tmp/acl.json".into(),
            source: std::io::Error::other("disk full"),
        }
        .into();
        assert!(persistence.is_fatal());
        assert!(!BotError::upstream("x").is_fatal());
        assert!(matches!(
            BotError::from(AclError::Banned),
            BotError::Banned
        ));
    }
}
