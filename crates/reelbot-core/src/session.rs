//! Per-user conversation record kept in the session cache.
//!
//! State and scratch live in one value so a transition always replaces both
//! together.

use reelbot_acl::AccessEntry;
use reelbot_catalog::{Movie, Profile};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    None,
    SearchPending,
    MovieSelectionPending,
    ProfileSelectionPending,
    RevokeTargetPending,
    RevokeConfirmPending,
    UnrevokeTargetPending,
    UnrevokeConfirmPending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MovieCandidate {
    /// 1-based position in the result list.
    pub display_id: usize,
    pub movie: Movie,
    /// Exact keyboard label offered to the user.
    pub label: String,
}

impl MovieCandidate {
    pub fn from_results(movies: Vec<Movie>) -> Vec<MovieCandidate> {
        movies
            .into_iter()
            .enumerate()
            .map(|(i, movie)| {
                let display_id = i + 1;
                MovieCandidate {
                    label: format!("{}) {}", display_id, movie.title_with_year()),
                    display_id,
                    movie,
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileCandidate {
    pub id: i64,
    pub label: String,
}

impl ProfileCandidate {
    pub fn from_profiles(profiles: Vec<Profile>) -> Vec<ProfileCandidate> {
        profiles
            .into_iter()
            .map(|profile| ProfileCandidate {
                id: profile.id,
                label: profile.name,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserCandidate {
    pub user_id: i64,
    pub label: String,
}

impl UserCandidate {
    /// Labels are display names; clashing names get the numeric id appended.
    pub fn from_entries(entries: &[AccessEntry]) -> Vec<UserCandidate> {
        let mut seen = HashSet::new();
        let clashing: HashSet<String> = entries
            .iter()
            .map(|entry| entry.user.display_name())
            .filter(|name| !seen.insert(name.clone()))
            .collect();

        entries
            .iter()
            .map(|entry| {
                let name = entry.user.display_name();
                let label = if clashing.contains(&name) {
                    format!("{} ({})", name, entry.user.id)
                } else {
                    name
                };
                UserCandidate {
                    user_id: entry.user.id,
                    label,
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scratch {
    pub movies: Vec<MovieCandidate>,
    pub selected_movie: Option<MovieCandidate>,
    pub profiles: Vec<ProfileCandidate>,
    pub selected_profile: Option<i64>,
    pub user_candidates: Vec<UserCandidate>,
    pub target: Option<UserCandidate>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    pub state: SessionState,
    pub scratch: Scratch,
}

impl Session {
    pub fn search_pending() -> Self {
        Session {
            state: SessionState::SearchPending,
            scratch: Scratch::default(),
        }
    }

    pub fn movie_selection(movies: Vec<MovieCandidate>) -> Self {
        Session {
            state: SessionState::MovieSelectionPending,
            scratch: Scratch {
                movies,
                ..Scratch::default()
            },
        }
    }

    pub fn profile_selection(
        movies: Vec<MovieCandidate>,
        selected: MovieCandidate,
        profiles: Vec<ProfileCandidate>,
    ) -> Self {
        Session {
            state: SessionState::ProfileSelectionPending,
            scratch: Scratch {
                movies,
                selected_movie: Some(selected),
                profiles,
                ..Scratch::default()
            },
        }
    }

    pub fn target_selection(state: SessionState, user_candidates: Vec<UserCandidate>) -> Self {
        Session {
            state,
            scratch: Scratch {
                user_candidates,
                ..Scratch::default()
            },
        }
    }

    pub fn confirmation(
        state: SessionState,
        user_candidates: Vec<UserCandidate>,
        target: UserCandidate,
    ) -> Self {
        Session {
            state,
            scratch: Scratch {
                user_candidates,
                target: Some(target),
                ..Scratch::default()
            },
        }
    }

    pub fn find_movie(&self, label: &str) -> Option<&MovieCandidate> {
        self.scratch.movies.iter().find(|c| c.label == label)
    }

    pub fn find_profile(&self, label: &str) -> Option<&ProfileCandidate> {
        self.scratch.profiles.iter().find(|c| c.label == label)
    }

    pub fn find_user(&self, label: &str) -> Option<&UserCandidate> {
        self.scratch.user_candidates.iter().find(|c| c.label == label)
    }
}
