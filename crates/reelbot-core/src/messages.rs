//! Reply texts and custom keyboards
//!
//! Formatting follows Telegram legacy Markdown: `*bold*`, `_italic_`,
//! `[label](url)`. Backslash escapes only work outside entities, so text
//! placed inside one goes through [`bold`], [`italic`] or [`link`] instead of
//! [`escape_markdown`].

use crate::session::{MovieCandidate, ProfileCandidate, UserCandidate};
use reelbot_acl::AccessEntry;
use reelbot_catalog::Movie;
use reelbot_ipc::ReplyMarkup;

pub const LIBRARY_BATCH_SIZE: usize = 50;
pub const CONFIRM_YES: &str = "Yes";
pub const CONFIRM_NO: &str = "No";

/// Escapes characters that would open an entity. `]` needs no escape once
/// `[` is escaped, and Telegram would print the backslash.
pub fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '_' | '*' | '`' | '[') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Wraps each run between delimiters in its own entity and escapes the
/// delimiter between them: `2*2` becomes `*2*\**2*`.
fn wrap_entity(text: &str, delimiter: char) -> String {
    text.split(delimiter)
        .map(|part| {
            if part.is_empty() {
                String::new()
            } else {
                format!("{d}{}{d}", part, d = delimiter)
            }
        })
        .collect::<Vec<_>>()
        .join(&format!("\\{}", delimiter))
}

fn bold(text: &str) -> String {
    wrap_entity(text, '*')
}

fn italic(text: &str) -> String {
    wrap_entity(text, '_')
}

/// A bracket in the label would end it early.
fn link(label: &str, url: &str) -> String {
    let label: String = label
        .chars()
        .map(|c| match c {
            '[' => '(',
            ']' => ')',
            c => c,
        })
        .collect();
    format!("[{}]({})", label, url)
}

pub fn help_text(is_owner: bool) -> String {
    let mut text = "🎬 *Movie bot*\n\n\
/auth <password> - Get access\n\
/q <name> - Search a movie and request it\n\
/library <name> - Search the library\n\
/wanted - Search all missing movies\n\
/clear - Cancel the current conversation\n\
/help - Show this help"
        .to_string();

    if is_owner {
        text.push_str(
            "\n\n🛡️ *Owner commands*\n\
/users - List allowed and revoked users\n\
/revoke - Revoke a user\n\
/unrevoke - Restore a revoked user",
        );
    }

    text
}

pub fn authorized_text(name: &str) -> String {
    format!(
        "✅ Welcome {}! You can now search movies with /q.",
        escape_markdown(name)
    )
}

pub fn owner_claimed_text(user_id: i64) -> String {
    format!(
        "👑 You are the first user, so you are now the owner of this bot (id `{}`).\n\
Owner commands: /users, /revoke, /unrevoke.",
        user_id
    )
}

/// Shown with `AdminOnly` when no owner exists yet.
pub fn owner_claim_prompt(user_id: i64) -> String {
    format!(
        "ℹ️ This bot has no owner yet. To become the owner, set `owner_id = {}` in the `[auth]` section of the config and restart the bot.",
        user_id
    )
}

pub fn search_prompt() -> (String, ReplyMarkup) {
    (
        "🔎 Which movie are you looking for?".to_string(),
        ReplyMarkup::ForceReply,
    )
}

pub fn movie_list(candidates: &[MovieCandidate]) -> (String, ReplyMarkup) {
    let mut lines = vec!["🎞️ *Found movies:*".to_string(), String::new()];
    for candidate in candidates {
        let movie = &candidate.movie;
        let mut line = format!(
            "*{}*) {}",
            candidate.display_id,
            link(&movie.title_with_year(), &movie.link())
        );
        if let Some(rating) = movie.rating.filter(|r| *r > 0.0) {
            line.push_str(&format!(" _⭐ {:.1}_", rating));
        }
        if movie.in_library {
            line.push_str(" _(in library)_");
        }
        lines.push(line);
    }
    lines.push(String::new());
    lines.push("Pick a movie below.".to_string());

    (
        lines.join("\n"),
        ReplyMarkup::single_column(candidates.iter().map(|c| c.label.clone())),
    )
}

pub fn profile_prompt(
    selected: &MovieCandidate,
    profiles: &[ProfileCandidate],
) -> (String, ReplyMarkup) {
    let movie = &selected.movie;
    let mut text = format!("🎬 {}", bold(&movie.title_with_year()));
    if let Some(poster) = &movie.poster_url {
        text.push_str(&format!(" {}", link("poster", poster)));
    }
    text.push_str("\n\nWhich quality profile should be used?");

    (
        text,
        ReplyMarkup::single_column(profiles.iter().map(|p| p.label.clone())),
    )
}

pub fn movie_added_text(movie: &Movie, profile: &str) -> String {
    format!(
        "✅ {} was added with profile {}. The download starts as soon as a release is found.",
        bold(&movie.title_with_year()),
        italic(profile)
    )
}

pub fn wanted_text() -> String {
    "🔄 Searching for all missing movies. This can take a while.".to_string()
}

pub fn cleared_text() -> String {
    "🧹 Conversation cleared.".to_string()
}

/// Alphabetical listing split into one message per batch.
pub fn library_batches(mut movies: Vec<Movie>) -> Vec<String> {
    movies.sort_by(|a, b| {
        a.title
            .to_lowercase()
            .cmp(&b.title.to_lowercase())
            .then(a.year.cmp(&b.year))
    });
    let total = movies.len();
    movies
        .chunks(LIBRARY_BATCH_SIZE)
        .enumerate()
        .map(|(i, batch)| {
            let mut lines = Vec::with_capacity(batch.len() + 1);
            if i == 0 {
                lines.push(format!("📚 *Library* ({} movies)", total));
            }
            lines.extend(
                batch
                    .iter()
                    .map(|movie| format!("• {}", link(&movie.title_with_year(), &movie.link()))),
            );
            lines.join("\n")
        })
        .collect()
}

fn entry_line(entry: &AccessEntry, owner: Option<i64>) -> String {
    let mut line = format!(
        "• {} (`{}`)",
        escape_markdown(&entry.user.display_name()),
        entry.user.id
    );
    if owner == Some(entry.user.id) {
        line.push_str(" 👑");
    }
    line
}

pub fn users_text(allowed: &[AccessEntry], revoked: &[AccessEntry], owner: Option<i64>) -> String {
    let mut lines = vec![format!("👥 *Allowed users* ({})", allowed.len())];
    if allowed.is_empty() {
        lines.push("_none_".to_string());
    }
    lines.extend(allowed.iter().map(|entry| entry_line(entry, owner)));
    lines.push(String::new());
    lines.push(format!("🚫 *Revoked users* ({})", revoked.len()));
    if revoked.is_empty() {
        lines.push("_none_".to_string());
    }
    lines.extend(revoked.iter().map(|entry| entry_line(entry, owner)));
    lines.join("\n")
}

pub fn no_allowed_users_text() -> String {
    "There are no allowed users to revoke.".to_string()
}

pub fn no_revoked_users_text() -> String {
    "There are no revoked users.".to_string()
}

pub fn revoke_prompt(candidates: &[UserCandidate]) -> (String, ReplyMarkup) {
    (
        "Which user do you want to revoke?".to_string(),
        ReplyMarkup::single_column(candidates.iter().map(|c| c.label.clone())),
    )
}

pub fn unrevoke_prompt(candidates: &[UserCandidate]) -> (String, ReplyMarkup) {
    (
        "Which user do you want to restore?".to_string(),
        ReplyMarkup::single_column(candidates.iter().map(|c| c.label.clone())),
    )
}

fn confirm_keyboard() -> ReplyMarkup {
    ReplyMarkup::Keyboard(vec![vec![CONFIRM_YES.to_string(), CONFIRM_NO.to_string()]])
}

pub fn revoke_confirm(target: &UserCandidate) -> (String, ReplyMarkup) {
    (
        format!("Revoke access for {}?", bold(&target.label)),
        confirm_keyboard(),
    )
}

pub fn unrevoke_confirm(target: &UserCandidate) -> (String, ReplyMarkup) {
    (
        format!("Restore access for {}?", bold(&target.label)),
        confirm_keyboard(),
    )
}

pub fn revoked_text(name: &str) -> String {
    format!("🚫 {} can no longer use this bot.", escape_markdown(name))
}

pub fn unrevoked_text(name: &str) -> String {
    format!("✅ {} can use this bot again.", escape_markdown(name))
}

pub fn cancelled_text() -> String {
    "Cancelled.".to_string()
}
