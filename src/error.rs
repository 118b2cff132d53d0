use serenity::model::id::UserId;
use thiserror::Error;

use crate::audio::player::PlayerState;

/// Failure reported by a [`MediaResolver`](crate::sources::MediaResolver).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResolutionError {
    #[error("could not extract media from `{spec}`: {reason}")]
    Extraction { spec: String, reason: String },

    /// No extractor claims the URL. Direct streams end up here.
    #[error("no extractor supports `{spec}`")]
    Unsupported { spec: String },

    #[error("the resolver returned no data for `{0}`")]
    Empty(String),
}

impl ResolutionError {
    pub fn extraction(spec: impl Into<String>, reason: impl ToString) -> Self {
        Self::Extraction {
            spec: spec.into(),
            reason: reason.to_string(),
        }
    }
}

/// Errors surfaced by the playlist, the player and the persistence layer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlayerError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// The request pointed at a playlist; retry with `use_url` as an import.
    #[error("`{url}` is a playlist, use `{use_url}` to queue it")]
    WrongEntryType { url: String, use_url: String },

    #[error("`{0}` is not a live stream")]
    NotAStream(String),

    /// `position` is the 1-based queue position the caller asked for.
    #[error("there is no entry at position {position} (queue holds {len})")]
    InvalidIndex { position: usize, len: usize },

    /// Every item of an import was unreadable or rejected.
    #[error("nothing from `{spec}` could be queued ({skipped} items skipped)")]
    NothingQueued { spec: String, skipped: usize },

    #[error("user {user} already has {queued} songs queued (limit {limit})")]
    QuotaExceeded {
        user: UserId,
        queued: usize,
        limit: usize,
    },

    #[error("{0}")]
    PermissionDenied(String),

    #[error("cannot {action} while the player is {state:?}")]
    InvalidState {
        action: &'static str,
        state: PlayerState,
    },

    #[error("playback failed: {0}")]
    Playback(String),

    #[error("could not download `{title}`: {reason}")]
    Prefetch { title: String, reason: String },

    #[error("queue persistence failed: {0}")]
    Persistence(String),

    #[error("the player has been shut down")]
    Dead,
}

impl From<std::io::Error> for PlayerError {
    fn from(err: std::io::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for PlayerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}
