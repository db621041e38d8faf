//! Conversation state machine and command handlers
//!
//! One inbound message is handled to completion before the next message of
//! the same user (the runtime serializes per user). Every transition writes
//! the whole session record.

use crate::commands::{Access, Command};
use crate::error::BotError;
use crate::messages;
use crate::session::{MovieCandidate, ProfileCandidate, Session, SessionState, UserCandidate};
use reelbot_acl::{AclStore, UserIdentity};
use reelbot_catalog::Catalog;
use reelbot_ipc::{Envelope, OutboundMessage, ReplyMarkup, Sender};
use reelbot_session::SessionCache;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// One outbound message produced by a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub text: String,
    pub markup: Option<ReplyMarkup>,
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Reply {
            text: text.into(),
            markup: None,
        }
    }

    pub fn with_markup((text, markup): (String, ReplyMarkup)) -> Self {
        Reply {
            text,
            markup: Some(markup),
        }
    }

    fn closing(text: impl Into<String>) -> Self {
        Reply {
            text: text.into(),
            markup: Some(ReplyMarkup::RemoveKeyboard),
        }
    }
}

type HandlerResult = Result<Vec<Reply>, BotError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdminAction {
    Revoke,
    Unrevoke,
}

impl AdminAction {
    fn target_state(self) -> SessionState {
        match self {
            AdminAction::Revoke => SessionState::RevokeTargetPending,
            AdminAction::Unrevoke => SessionState::UnrevokeTargetPending,
        }
    }

    fn confirm_state(self) -> SessionState {
        match self {
            AdminAction::Revoke => SessionState::RevokeConfirmPending,
            AdminAction::Unrevoke => SessionState::UnrevokeConfirmPending,
        }
    }
}

fn identity(sender: &Sender) -> UserIdentity {
    UserIdentity {
        id: sender.id,
        username: sender.username.clone(),
        first_name: sender.first_name.clone(),
        last_name: sender.last_name.clone(),
    }
}

pub struct Bot {
    acl: Arc<AclStore>,
    sessions: SessionCache<Session>,
    catalog: Arc<dyn Catalog>,
    bot_name: Option<String>,
}

impl Bot {
    pub fn new(
        acl: Arc<AclStore>,
        sessions: SessionCache<Session>,
        catalog: Arc<dyn Catalog>,
        bot_name: Option<String>,
    ) -> Self {
        Self {
            acl,
            sessions,
            catalog,
            bot_name,
        }
    }

    pub fn sessions(&self) -> &SessionCache<Session> {
        &self.sessions
    }

    pub fn acl(&self) -> &AclStore {
        &self.acl
    }

    pub async fn session_state(&self, user_id: i64) -> SessionState {
        self.sessions
            .get(user_id)
            .await
            .map(|session| session.state)
            .unwrap_or_default()
    }

    /// Handles one envelope and publishes the replies. Handler errors become
    /// one error reply; only fatal errors are returned.
    pub async fn respond(
        &self,
        envelope: &Envelope,
        outbound: &broadcast::Sender<OutboundMessage>,
    ) -> Result<(), BotError> {
        let user_id = envelope.from.id;
        let replies = match self.handle(envelope).await {
            Ok(replies) => replies,
            Err(err) => {
                if err.is_fatal() {
                    error!(user_id, trace_id = %envelope.trace_id, "Fatal error: {}", err);
                } else {
                    warn!(user_id, trace_id = %envelope.trace_id, "Request failed: {}", err);
                }
                let mut replies = vec![Reply::text(err.user_message())];
                if matches!(err, BotError::AdminOnly) && self.acl.owner().is_none() {
                    replies.push(Reply::text(messages::owner_claim_prompt(user_id)));
                }
                Self::publish(envelope, outbound, replies);
                return if err.is_fatal() { Err(err) } else { Ok(()) };
            }
        };

        Self::publish(envelope, outbound, replies);
        Ok(())
    }

    fn publish(
        envelope: &Envelope,
        outbound: &broadcast::Sender<OutboundMessage>,
        replies: Vec<Reply>,
    ) {
        for reply in replies {
            let mut msg = OutboundMessage::text(&envelope.channel, envelope.chat_id, reply.text)
                .reply_to(envelope.message_id);
            if let Some(markup) = reply.markup {
                msg = msg.with_markup(markup);
            }
            if let Err(e) = outbound.send(msg) {
                warn!(chat_id = envelope.chat_id, "Failed to queue reply: {}", e);
            }
        }
    }

    pub async fn handle(&self, envelope: &Envelope) -> HandlerResult {
        let user = identity(&envelope.from);
        let text = envelope.text.trim();

        if envelope.is_command() {
            return match Command::parse(text, self.bot_name.as_deref()) {
                Some(command) => self.handle_command(user, command).await,
                None => Ok(Vec::new()),
            };
        }

        self.handle_text(user, text).await
    }

    fn can_use(&self, user_id: i64) -> bool {
        self.acl.is_allowed(user_id) || self.acl.is_owner(user_id)
    }

    fn check_access(&self, user_id: i64, access: Access) -> Result<(), BotError> {
        match access {
            Access::Anyone => Ok(()),
            _ if self.acl.is_owner(user_id) => Ok(()),
            _ if self.acl.is_revoked(user_id) => Err(BotError::Banned),
            _ if !self.acl.is_allowed(user_id) => Err(BotError::NotAuthorized),
            Access::User => Ok(()),
            Access::Owner => Err(BotError::AdminOnly),
        }
    }

    async fn handle_command(&self, user: UserIdentity, command: Command) -> HandlerResult {
        self.check_access(user.id, command.access())?;
        info!(user_id = user.id, command = command.name(), "Handling command");

        match command {
            Command::Help => Ok(vec![Reply::text(messages::help_text(
                self.acl.is_owner(user.id),
            ))]),
            Command::Auth(password) => self.authorize(user, password.as_deref()),
            Command::Search(None) => {
                self.sessions.set(user.id, Session::search_pending()).await;
                Ok(vec![Reply::with_markup(messages::search_prompt())])
            }
            Command::Search(Some(query)) => self.search(&user, &query).await,
            Command::Library(query) => self.library(query.as_deref()).await,
            Command::Wanted => {
                self.catalog
                    .trigger_full_search()
                    .await
                    .map_err(BotError::upstream)?;
                Ok(vec![Reply::text(messages::wanted_text())])
            }
            Command::Clear => {
                self.sessions.clear(user.id).await;
                Ok(vec![Reply::closing(messages::cleared_text())])
            }
            Command::Users => Ok(vec![Reply::text(messages::users_text(
                &self.acl.allowed(),
                &self.acl.revoked(),
                self.acl.owner(),
            ))]),
            Command::Revoke => self.start_admin_flow(&user, AdminAction::Revoke).await,
            Command::Unrevoke => self.start_admin_flow(&user, AdminAction::Unrevoke).await,
            Command::Unknown(name) => Err(BotError::UnknownCommand(name)),
        }
    }

    fn authorize(&self, user: UserIdentity, password: Option<&str>) -> HandlerResult {
        let name = user.display_name();
        let outcome = self.acl.authorize(user, password.unwrap_or_default())?;

        let mut replies = vec![Reply::text(messages::authorized_text(&name))];
        if outcome.claimed_ownership {
            replies.push(Reply::text(messages::owner_claimed_text(
                outcome.entry.user.id,
            )));
        }
        Ok(replies)
    }

    async fn handle_text(&self, user: UserIdentity, text: &str) -> HandlerResult {
        let Some(session) = self
            .sessions
            .get(user.id)
            .await
            .filter(|session| session.state != SessionState::None)
        else {
            return Err(BotError::NoActiveFlow);
        };

        if !self.can_use(user.id) {
            self.sessions.clear(user.id).await;
            return Err(if self.acl.is_revoked(user.id) {
                BotError::Banned
            } else {
                BotError::NotAuthorized
            });
        }

        match session.state {
            SessionState::None => Err(BotError::NoActiveFlow),
            SessionState::SearchPending => self.search(&user, text).await,
            SessionState::MovieSelectionPending => self.select_movie(&user, session, text).await,
            SessionState::ProfileSelectionPending => {
                self.select_profile(&user, session, text).await
            }
            SessionState::RevokeTargetPending => {
                self.select_target(&user, session, text, AdminAction::Revoke).await
            }
            SessionState::UnrevokeTargetPending => {
                self.select_target(&user, session, text, AdminAction::Unrevoke).await
            }
            SessionState::RevokeConfirmPending => {
                self.confirm(&user, session, text, AdminAction::Revoke).await
            }
            SessionState::UnrevokeConfirmPending => {
                self.confirm(&user, session, text, AdminAction::Unrevoke).await
            }
        }
    }

    async fn search(&self, user: &UserIdentity, query: &str) -> HandlerResult {
        let movies = self
            .catalog
            .search_movies(query)
            .await
            .map_err(BotError::upstream)?;

        if movies.is_empty() {
            self.sessions.set(user.id, Session::search_pending()).await;
            return Err(BotError::NoResults);
        }

        let candidates = MovieCandidate::from_results(movies);
        let reply = Reply::with_markup(messages::movie_list(&candidates));
        info!(
            user_id = user.id,
            results = candidates.len(),
            "Search results cached"
        );
        self.sessions
            .set(user.id, Session::movie_selection(candidates))
            .await;
        Ok(vec![reply])
    }

    async fn select_movie(
        &self,
        user: &UserIdentity,
        session: Session,
        text: &str,
    ) -> HandlerResult {
        let selected = session
            .find_movie(text)
            .cloned()
            .ok_or(BotError::SelectionNotFound)?;

        let library = self
            .catalog
            .list_library()
            .await
            .map_err(BotError::upstream)?;
        if library.iter().any(|movie| movie.tmdb_id == selected.movie.tmdb_id) {
            self.sessions.set(user.id, Session::search_pending()).await;
            return Err(BotError::AlreadyInLibrary);
        }

        let profiles = self
            .catalog
            .list_profiles()
            .await
            .map_err(BotError::upstream)?;
        if profiles.is_empty() {
            self.sessions.clear(user.id).await;
            return Err(BotError::NoResults);
        }

        let profiles = ProfileCandidate::from_profiles(profiles);
        let reply = Reply::with_markup(messages::profile_prompt(&selected, &profiles));
        self.sessions
            .set(
                user.id,
                Session::profile_selection(session.scratch.movies, selected, profiles),
            )
            .await;
        Ok(vec![reply])
    }

    async fn select_profile(
        &self,
        user: &UserIdentity,
        mut session: Session,
        text: &str,
    ) -> HandlerResult {
        let Some(movie) = session.scratch.selected_movie.clone() else {
            self.sessions.clear(user.id).await;
            return Err(BotError::NoActiveFlow);
        };
        let profile = session
            .find_profile(text)
            .cloned()
            .ok_or(BotError::SelectionNotFound)?;

        session.scratch.selected_profile = Some(profile.id);
        self.sessions.set(user.id, session).await;

        let added = self
            .catalog
            .add_movie(movie.movie.tmdb_id, &movie.movie.title, profile.id)
            .await;
        self.sessions.clear(user.id).await;

        match added {
            Ok(true) => {
                info!(
                    user_id = user.id,
                    tmdb_id = movie.movie.tmdb_id,
                    profile_id = profile.id,
                    "Movie requested"
                );
                Ok(vec![Reply::closing(messages::movie_added_text(
                    &movie.movie,
                    &profile.label,
                ))])
            }
            Ok(false) => Err(BotError::upstream("catalog rejected the movie")),
            Err(e) => Err(BotError::upstream(e)),
        }
    }

    async fn library(&self, query: Option<&str>) -> HandlerResult {
        let library = self
            .catalog
            .list_library()
            .await
            .map_err(BotError::upstream)?;

        let needle = query.map(str::to_lowercase);
        let matches: Vec<_> = library
            .into_iter()
            .filter(|movie| {
                needle
                    .as_deref()
                    .is_none_or(|needle| movie.title.to_lowercase().contains(needle))
            })
            .collect();

        if matches.is_empty() {
            return Err(BotError::NoResults);
        }

        Ok(messages::library_batches(matches)
            .into_iter()
            .map(Reply::text)
            .collect())
    }

    async fn start_admin_flow(&self, user: &UserIdentity, action: AdminAction) -> HandlerResult {
        let entries = match action {
            AdminAction::Revoke => self.acl.allowed(),
            AdminAction::Unrevoke => self.acl.revoked(),
        };
        let entries: Vec<_> = entries
            .into_iter()
            .filter(|entry| !self.acl.is_owner(entry.user.id))
            .collect();

        if entries.is_empty() {
            let text = match action {
                AdminAction::Revoke => messages::no_allowed_users_text(),
                AdminAction::Unrevoke => messages::no_revoked_users_text(),
            };
            return Ok(vec![Reply::text(text)]);
        }

        let candidates = UserCandidate::from_entries(&entries);
        let prompt = match action {
            AdminAction::Revoke => messages::revoke_prompt(&candidates),
            AdminAction::Unrevoke => messages::unrevoke_prompt(&candidates),
        };
        self.sessions
            .set(
                user.id,
                Session::target_selection(action.target_state(), candidates),
            )
            .await;
        Ok(vec![Reply::with_markup(prompt)])
    }

    /// Admin flows re-check ownership on every step.
    fn ensure_owner(&self, user_id: i64) -> Result<(), BotError> {
        if self.acl.is_owner(user_id) {
            Ok(())
        } else {
            Err(BotError::AdminOnly)
        }
    }

    async fn select_target(
        &self,
        user: &UserIdentity,
        session: Session,
        text: &str,
        action: AdminAction,
    ) -> HandlerResult {
        if let Err(err) = self.ensure_owner(user.id) {
            self.sessions.clear(user.id).await;
            return Err(err);
        }
        let target = session
            .find_user(text)
            .cloned()
            .ok_or(BotError::SelectionNotFound)?;

        let prompt = match action {
            AdminAction::Revoke => messages::revoke_confirm(&target),
            AdminAction::Unrevoke => messages::unrevoke_confirm(&target),
        };
        self.sessions
            .set(
                user.id,
                Session::confirmation(
                    action.confirm_state(),
                    session.scratch.user_candidates,
                    target,
                ),
            )
            .await;
        Ok(vec![Reply::with_markup(prompt)])
    }

    async fn confirm(
        &self,
        user: &UserIdentity,
        session: Session,
        text: &str,
        action: AdminAction,
    ) -> HandlerResult {
        self.sessions.clear(user.id).await;
        self.ensure_owner(user.id)?;
        let target = session.scratch.target.ok_or(BotError::NoActiveFlow)?;

        if !text.trim().eq_ignore_ascii_case(messages::CONFIRM_YES) {
            return Ok(vec![Reply::closing(messages::cancelled_text())]);
        }

        let reply = match action {
            AdminAction::Revoke => {
                self.acl.revoke(target.user_id)?;
                messages::revoked_text(&target.label)
            }
            AdminAction::Unrevoke => {
                self.acl.unrevoke(target.user_id)?;
                messages::unrevoked_text(&target.label)
            }
        };
        info!(
            owner_id = user.id,
            target_id = target.user_id,
            action = ?action,
            "Access list changed"
        );
        Ok(vec![Reply::closing(reply)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ERROR_MARKER;
    use reelbot_catalog::{Movie, Profile};
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;

    const PASSWORD: &str = "letmein";

    #[derive(Default)]
    struct FakeCatalog {
        results: Vec<Movie>,
        library: Vec<Movie>,
        profiles: Vec<Profile>,
        accept_adds: bool,
        added: Mutex<Vec<(i64, i64)>>,
        full_searches: Mutex<usize>,
    }

    #[async_trait::async_trait]
    impl Catalog for FakeCatalog {
        async fn search_movies(&self, query: &str) -> anyhow::Result<Vec<Movie>> {
            let query = query.to_lowercase();
            Ok(self
                .results
                .iter()
                .filter(|movie| movie.title.to_lowercase().contains(&query))
                .cloned()
                .collect())
        }

        async fn list_library(&self) -> anyhow::Result<Vec<Movie>> {
            Ok(self.library.clone())
        }

        async fn add_movie(
            &self,
            tmdb_id: i64,
            _title: &str,
            profile_id: i64,
        ) -> anyhow::Result<bool> {
            self.added.lock().unwrap().push((tmdb_id, profile_id));
            Ok(self.accept_adds)
        }

        async fn list_profiles(&self) -> anyhow::Result<Vec<Profile>> {
            Ok(self.profiles.clone())
        }

        async fn trigger_full_search(&self) -> anyhow::Result<()> {
            *self.full_searches.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn movie(title: &str, year: i32, tmdb_id: i64) -> Movie {
        Movie {
            title: title.to_string(),
            year: Some(year),
            tmdb_id,
            imdb_id: None,
            rating: Some(8.1),
            poster_url: None,
            in_library: false,
        }
    }

    fn catalog() -> FakeCatalog {
        FakeCatalog {
            results: vec![movie("Alien", 1979, 348), movie("Aliens", 1986, 679)],
            library: vec![movie("Heat", 1995, 949)],
            profiles: vec![
                Profile {
                    id: 1,
                    name: "Any".to_string(),
                },
                Profile {
                    id: 4,
                    name: "HD-1080p".to_string(),
                },
            ],
            accept_adds: true,
            ..FakeCatalog::default()
        }
    }

    fn temp_acl_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "reelbot-flow-test-{}-{}",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir.join("acl.json")
    }

    fn bot_with(name: &str, catalog: FakeCatalog) -> (Bot, Arc<FakeCatalog>) {
        let acl = AclStore::open(temp_acl_path(name), PASSWORD, None).expect("open acl");
        let catalog = Arc::new(catalog);
        let bot = Bot::new(
            Arc::new(acl),
            SessionCache::new(Duration::from_secs(120)),
            Arc::clone(&catalog) as Arc<dyn Catalog>,
            Some("reel_bot".to_string()),
        );
        (bot, catalog)
    }

    fn msg(user_id: i64, text: &str) -> Envelope {
        Envelope::new(
            "telegram",
            user_id,
            Sender::new(user_id).with_username(&format!("user{}", user_id)),
            text,
        )
    }

    async fn authorize(bot: &Bot, user_id: i64) {
        bot.handle(&msg(user_id, &format!("/auth {}", PASSWORD)))
            .await
            .expect("authorize");
    }

    #[tokio::test]
    async fn first_authorized_user_becomes_owner() {
        let (bot, _) = bot_with("first-owner", catalog());

        let replies = bot.handle(&msg(1, "/auth letmein")).await.expect("auth");
        assert_eq!(replies.len(), 2);
        assert!(replies[1].text.contains("owner"));
        assert!(bot.acl().is_owner(1));

        let replies = bot.handle(&msg(2, "/auth letmein")).await.expect("auth");
        assert_eq!(replies.len(), 1);
        assert!(!bot.acl().is_owner(2));

        assert!(matches!(
            bot.handle(&msg(2, "/auth letmein")).await,
            Err(BotError::AlreadyAuthorized)
        ));
        assert!(matches!(
            bot.handle(&msg(3, "/auth guess")).await,
            Err(BotError::WrongPassword)
        ));
        assert!(matches!(
            bot.handle(&msg(3, "/auth")).await,
            Err(BotError::WrongPassword)
        ));
    }

    #[tokio::test]
    async fn strangers_cannot_search() {
        let (bot, _) = bot_with("strangers", catalog());
        assert!(matches!(
            bot.handle(&msg(5, "/q Alien")).await,
            Err(BotError::NotAuthorized)
        ));
        assert!(matches!(
            bot.handle(&msg(5, "/wanted")).await,
            Err(BotError::NotAuthorized)
        ));
        assert_eq!(bot.session_state(5).await, SessionState::None);

        // help and clear stay open to everyone
        assert!(bot.handle(&msg(5, "/help")).await.is_ok());
        assert!(bot.handle(&msg(5, "/clear")).await.is_ok());
    }

    #[tokio::test]
    async fn full_search_flow_adds_movie() {
        let (bot, catalog) = bot_with("search-flow", catalog());
        authorize(&bot, 1).await;

        let replies = bot.handle(&msg(1, "/q")).await.expect("prompt");
        assert_eq!(replies[0].markup, Some(ReplyMarkup::ForceReply));
        assert_eq!(bot.session_state(1).await, SessionState::SearchPending);

        let replies = bot.handle(&msg(1, "alien")).await.expect("results");
        assert_eq!(bot.session_state(1).await, SessionState::MovieSelectionPending);
        let text = &replies[0].text;
        assert!(text.contains("[Alien (1979)]("), "{}", text);
        assert!(text.contains("[Aliens (1986)]("), "{}", text);
        assert_eq!(text.matches("](").count(), 2);
        let rows = replies[0].markup.as_ref().and_then(|m| m.rows()).expect("keyboard");
        assert_eq!(
            rows,
            &[
                vec!["1) Alien (1979)".to_string()],
                vec!["2) Aliens (1986)".to_string()]
            ]
        );

        let replies = bot.handle(&msg(1, "2) Aliens (1986)")).await.expect("movie");
        assert_eq!(bot.session_state(1).await, SessionState::ProfileSelectionPending);
        let rows = replies[0].markup.as_ref().and_then(|m| m.rows()).expect("keyboard");
        assert_eq!(rows.len(), 2);

        let replies = bot.handle(&msg(1, "HD-1080p")).await.expect("profile");
        assert_eq!(replies[0].markup, Some(ReplyMarkup::RemoveKeyboard));
        assert!(replies[0].text.contains("Aliens (1986)"));
        assert_eq!(bot.session_state(1).await, SessionState::None);
        assert_eq!(*catalog.added.lock().unwrap(), vec![(679, 4)]);
    }

    #[tokio::test]
    async fn inline_query_skips_the_prompt() {
        let (bot, _) = bot_with("inline-query", catalog());
        authorize(&bot, 1).await;

        bot.handle(&msg(1, "/q@reel_bot Alien")).await.expect("results");
        assert_eq!(bot.session_state(1).await, SessionState::MovieSelectionPending);
    }

    #[tokio::test]
    async fn empty_results_keep_waiting_for_a_title() {
        let (bot, _) = bot_with("no-results", catalog());
        authorize(&bot, 1).await;

        assert!(matches!(
            bot.handle(&msg(1, "/q Zardoz")).await,
            Err(BotError::NoResults)
        ));
        assert_eq!(bot.session_state(1).await, SessionState::SearchPending);

        bot.handle(&msg(1, "Alien")).await.expect("retry");
        assert_eq!(bot.session_state(1).await, SessionState::MovieSelectionPending);
    }

    #[tokio::test]
    async fn unknown_selection_keeps_state() {
        let (bot, _) = bot_with("bad-selection", catalog());
        authorize(&bot, 1).await;
        bot.handle(&msg(1, "/q Alien")).await.expect("results");

        assert!(matches!(
            bot.handle(&msg(1, "Alien")).await,
            Err(BotError::SelectionNotFound)
        ));
        assert_eq!(bot.session_state(1).await, SessionState::MovieSelectionPending);
    }

    #[tokio::test]
    async fn unknown_profile_keeps_profile_selection() {
        let (bot, catalog) = bot_with("bad-profile", catalog());
        authorize(&bot, 1).await;
        bot.handle(&msg(1, "/q Alien")).await.expect("results");
        bot.handle(&msg(1, "1) Alien (1979)")).await.expect("movie");

        assert!(matches!(
            bot.handle(&msg(1, "Ultra-HD")).await,
            Err(BotError::SelectionNotFound)
        ));
        assert_eq!(bot.session_state(1).await, SessionState::ProfileSelectionPending);
        assert!(catalog.added.lock().unwrap().is_empty());

        bot.handle(&msg(1, "Any")).await.expect("profile");
        assert_eq!(*catalog.added.lock().unwrap(), vec![(348, 1)]);
    }

    #[tokio::test]
    async fn movie_in_library_restarts_search() {
        let mut fake = catalog();
        fake.library.push(movie("Alien", 1979, 348));
        let (bot, catalog) = bot_with("in-library", fake);
        authorize(&bot, 1).await;
        bot.handle(&msg(1, "/q Alien")).await.expect("results");

        assert!(matches!(
            bot.handle(&msg(1, "1) Alien (1979)")).await,
            Err(BotError::AlreadyInLibrary)
        ));
        assert_eq!(bot.session_state(1).await, SessionState::SearchPending);
        assert!(catalog.added.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejected_add_reports_upstream_error_and_resets() {
        let mut fake = catalog();
        fake.accept_adds = false;
        let (bot, _) = bot_with("rejected-add", fake);
        authorize(&bot, 1).await;
        bot.handle(&msg(1, "/q Alien")).await.expect("results");
        bot.handle(&msg(1, "1) Alien (1979)")).await.expect("movie");

        assert!(matches!(
            bot.handle(&msg(1, "Any")).await,
            Err(BotError::UpstreamError(_))
        ));
        assert_eq!(bot.session_state(1).await, SessionState::None);
    }

    #[tokio::test]
    async fn free_text_without_flow_is_rejected() {
        let (bot, _) = bot_with("no-flow", catalog());
        authorize(&bot, 1).await;
        assert!(matches!(
            bot.handle(&msg(1, "hello")).await,
            Err(BotError::NoActiveFlow)
        ));
    }

    #[tokio::test]
    async fn clear_resets_any_flow() {
        let (bot, _) = bot_with("clear", catalog());
        authorize(&bot, 1).await;
        bot.handle(&msg(1, "/q Alien")).await.expect("results");

        let replies = bot.handle(&msg(1, "/clear")).await.expect("clear");
        assert_eq!(replies[0].markup, Some(ReplyMarkup::RemoveKeyboard));
        assert_eq!(bot.session_state(1).await, SessionState::None);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_session_behaves_like_none() {
        let (bot, _) = bot_with("expired", catalog());
        authorize(&bot, 1).await;
        bot.handle(&msg(1, "/q")).await.expect("prompt");

        tokio::time::advance(Duration::from_secs(121)).await;
        assert!(matches!(
            bot.handle(&msg(1, "Alien")).await,
            Err(BotError::NoActiveFlow)
        ));
    }

    #[tokio::test]
    async fn library_filters_by_title() {
        let mut fake = catalog();
        fake.library = vec![
            movie("The Thing", 1982, 1091),
            movie("Thief", 1981, 11524),
            movie("Heat", 1995, 949),
        ];
        let (bot, _) = bot_with("library", fake);
        authorize(&bot, 1).await;

        let replies = bot.handle(&msg(1, "/library th")).await.expect("library");
        assert_eq!(replies.len(), 1);
        assert!(replies[0].text.contains("(2 movies)"));
        assert!(!replies[0].text.contains("Heat"));

        assert!(matches!(
            bot.handle(&msg(1, "/library zzz")).await,
            Err(BotError::NoResults)
        ));
    }

    #[tokio::test]
    async fn wanted_triggers_full_search() {
        let (bot, catalog) = bot_with("wanted", catalog());
        authorize(&bot, 1).await;
        bot.handle(&msg(1, "/wanted")).await.expect("wanted");
        assert_eq!(*catalog.full_searches.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn owner_revokes_and_restores_a_user() {
        let (bot, _) = bot_with("revoke", catalog());
        authorize(&bot, 1).await;
        authorize(&bot, 2).await;

        let replies = bot.handle(&msg(1, "/revoke")).await.expect("revoke");
        // the owner is never offered as a target
        let rows = replies[0].markup.as_ref().and_then(|m| m.rows()).expect("keyboard");
        assert_eq!(rows, &[vec!["@user2".to_string()]]);
        assert_eq!(bot.session_state(1).await, SessionState::RevokeTargetPending);

        bot.handle(&msg(1, "@user2")).await.expect("target");
        assert_eq!(bot.session_state(1).await, SessionState::RevokeConfirmPending);

        let replies = bot.handle(&msg(1, "yes")).await.expect("confirm");
        assert_eq!(replies[0].markup, Some(ReplyMarkup::RemoveKeyboard));
        assert!(bot.acl().is_revoked(2));
        assert_eq!(bot.session_state(1).await, SessionState::None);

        assert!(matches!(
            bot.handle(&msg(2, "/q Alien")).await,
            Err(BotError::Banned)
        ));
        assert!(matches!(
            bot.handle(&msg(2, "/auth letmein")).await,
            Err(BotError::Banned)
        ));

        bot.handle(&msg(1, "/unrevoke")).await.expect("unrevoke");
        assert_eq!(bot.session_state(1).await, SessionState::UnrevokeTargetPending);
        bot.handle(&msg(1, "@user2")).await.expect("target");
        bot.handle(&msg(1, "Yes")).await.expect("confirm");
        assert!(bot.acl().is_allowed(2));
    }

    #[tokio::test]
    async fn declining_confirmation_changes_nothing() {
        let (bot, _) = bot_with("decline", catalog());
        authorize(&bot, 1).await;
        authorize(&bot, 2).await;

        bot.handle(&msg(1, "/revoke")).await.expect("revoke");
        bot.handle(&msg(1, "@user2")).await.expect("target");
        let replies = bot.handle(&msg(1, "No")).await.expect("decline");
        assert!(replies[0].text.contains("Cancelled"));
        assert!(bot.acl().is_allowed(2));
        assert_eq!(bot.session_state(1).await, SessionState::None);
    }

    #[tokio::test]
    async fn revoke_without_candidates_replies_plainly() {
        let (bot, _) = bot_with("no-candidates", catalog());
        authorize(&bot, 1).await;

        let replies = bot.handle(&msg(1, "/revoke")).await.expect("revoke");
        assert!(replies[0].markup.is_none());
        assert_eq!(bot.session_state(1).await, SessionState::None);

        let replies = bot.handle(&msg(1, "/unrevoke")).await.expect("unrevoke");
        assert_eq!(replies[0].text, messages::no_revoked_users_text());
    }

    #[tokio::test]
    async fn owner_commands_are_refused_to_users() {
        let (bot, _) = bot_with("admin-only", catalog());
        authorize(&bot, 1).await;
        authorize(&bot, 2).await;

        for command in ["/users", "/revoke", "/unrevoke"] {
            assert!(matches!(
                bot.handle(&msg(2, command)).await,
                Err(BotError::AdminOnly)
            ));
        }
        assert!(bot.handle(&msg(1, "/users")).await.is_ok());
    }

    #[tokio::test]
    async fn revoked_user_mid_flow_loses_session() {
        let (bot, _) = bot_with("mid-flow", catalog());
        authorize(&bot, 1).await;
        authorize(&bot, 2).await;
        bot.handle(&msg(2, "/q Alien")).await.expect("results");

        bot.acl().revoke(2).expect("revoke");
        assert!(matches!(
            bot.handle(&msg(2, "1) Alien (1979)")).await,
            Err(BotError::Banned)
        ));
        assert_eq!(bot.session_state(2).await, SessionState::None);
    }

    #[tokio::test]
    async fn command_for_another_bot_is_ignored() {
        let (bot, _) = bot_with("other-bot", catalog());
        let replies = bot.handle(&msg(1, "/help@other_bot")).await.expect("ignored");
        assert!(replies.is_empty());
    }

    #[tokio::test]
    async fn malformed_commands_are_unknown() {
        let (bot, _) = bot_with("malformed", catalog());
        authorize(&bot, 1).await;

        for (text, name) in [("/q2 Alien", "/q2"), ("/", "/"), ("/foo-bar", "/foo-bar")] {
            match bot.handle(&msg(1, text)).await {
                Err(BotError::UnknownCommand(got)) => assert_eq!(got, name),
                other => panic!("{} gave {:?}", text, other.map(|r| r.len())),
            }
        }
        assert_eq!(bot.session_state(1).await, SessionState::None);
    }

    #[tokio::test]
    async fn strangers_get_a_reply_to_malformed_commands() {
        let (bot, _) = bot_with("malformed-reply", catalog());
        let (tx, mut rx) = broadcast::channel(16);

        bot.respond(&msg(6, "/q2 Alien").with_message_id(3), &tx)
            .await
            .expect("not fatal");

        let reply = rx.recv().await.expect("reply");
        assert_eq!(reply.reply_to, Some(3));
        assert!(reply.text.starts_with(ERROR_MARKER));
        assert!(reply.text.contains("/q2"));
    }

    #[tokio::test]
    async fn respond_publishes_marked_errors_as_replies() {
        let (bot, _) = bot_with("respond", catalog());
        let (tx, mut rx) = broadcast::channel(16);

        let envelope = msg(9, "/q Alien").with_message_id(77);
        bot.respond(&envelope, &tx).await.expect("not fatal");

        let reply = rx.recv().await.expect("reply");
        assert_eq!(reply.chat_id, 9);
        assert_eq!(reply.reply_to, Some(77));
        assert!(reply.text.starts_with(ERROR_MARKER));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn admin_only_without_owner_explains_how_to_claim() {
        let path = temp_acl_path("ownerless");
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(&path, r#"{"allowed":[{"id":4,"username":"neo"}]}"#).expect("seed");
        let acl = AclStore::open(&path, PASSWORD, None).expect("open acl");
        let bot = Bot::new(
            Arc::new(acl),
            SessionCache::new(Duration::from_secs(120)),
            Arc::new(catalog()),
            None,
        );
        let (tx, mut rx) = broadcast::channel(16);

        bot.respond(&msg(4, "/users"), &tx).await.expect("not fatal");

        let first = rx.recv().await.expect("error reply");
        assert!(first.text.starts_with(ERROR_MARKER));
        let second = rx.recv().await.expect("claim prompt");
        assert!(second.text.contains("owner_id = 4"));
    }

    #[tokio::test]
    async fn persistence_failure_is_fatal() {
        let path = temp_acl_path("fatal");
        // a directory where the file should be makes every write fail
        std::fs::create_dir_all(&path).expect("block path");
        let acl = AclStore::open(path.join("acl.json"), PASSWORD, None).expect("open acl");
        std::fs::create_dir_all(path.join("acl.json")).expect("block file");
        let bot = Bot::new(
            Arc::new(acl),
            SessionCache::new(Duration::from_secs(120)),
            Arc::new(catalog()),
            None,
        );
        let (tx, mut rx) = broadcast::channel(16);

        let err = bot
            .respond(&msg(1, "/auth letmein"), &tx)
            .await
            .expect_err("fatal");
        assert!(err.is_fatal());
        assert!(rx.recv().await.expect("reply").text.starts_with(ERROR_MARKER));
        assert!(!bot.acl().is_allowed(1));
    }
}
