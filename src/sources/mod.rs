//! # Sources
//!
//! Media resolution for the scheduler. A [`MediaResolver`] turns a URL or a
//! free-text search into track metadata, either as a lookup (`download:
//! false`) or as a full fetch that leaves a playable file behind (`download:
//! true`). [`YtDlpResolver`] is the production implementation.

pub mod ytdlp;

use async_trait::async_trait;
use regex::Regex;
use std::{sync::LazyLock, time::Duration};

use crate::{audio::entry::StreamRef, error::ResolutionError};

pub use ytdlp::YtDlpResolver;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Fetch the media and report where it landed, instead of metadata only.
    pub download: bool,
}

impl ResolveOptions {
    pub fn lookup() -> Self {
        Self { download: false }
    }

    pub fn download() -> Self {
        Self { download: true }
    }
}

/// Metadata for a single playable item.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackMetadata {
    /// Canonical page URL of the item.
    pub url: String,
    pub title: String,
    pub duration: Option<Duration>,
    /// Direct media URL on lookups, the downloaded file after a download.
    pub stream: Option<StreamRef>,
    pub extractor: Option<String>,
    pub is_live: bool,
}

impl TrackMetadata {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            duration: None,
            stream: None,
            extractor: None,
            is_live: false,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_stream(mut self, stream: StreamRef) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn with_extractor(mut self, extractor: impl Into<String>) -> Self {
        self.extractor = Some(extractor.into());
        self
    }

    pub fn live(mut self) -> Self {
        self.is_live = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedMedia {
    Track(TrackMetadata),
    /// A playlist, album or set. Items that could not be read are kept as
    /// errors so callers can skip them.
    Playlist {
        url: String,
        title: Option<String>,
        items: Vec<Result<TrackMetadata, ResolutionError>>,
    },
}

/// External media resolver.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaResolver: Send + Sync {
    async fn resolve(
        &self,
        spec: &str,
        options: ResolveOptions,
    ) -> Result<ResolvedMedia, ResolutionError>;
}

static LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^((https?://|www\.)[A-Za-z0-9/.~\-_]*)").expect("valid link regex")
});

static WATCH_IN_PLAYLIST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"watch\?v=.+&(list=[^&]+)").expect("valid playlist regex"));

pub fn is_link(spec: &str) -> bool {
    LINK.is_match(spec)
}

/// Cleans up a song request before it reaches the resolver.
///
/// Surrounding `<>` (Discord link suppression) are dropped, `watch?v=…&list=…`
/// becomes the playlist URL, and slashes in plain searches are escaped so
/// they are not mistaken for paths.
pub fn normalize_request(spec: &str) -> String {
    let spec = spec.trim().trim_start_matches('<').trim_end_matches('>');

    if !is_link(spec) {
        return spec.replace('/', "%2F");
    }

    match WATCH_IN_PLAYLIST.captures(spec).and_then(|c| c.get(1)) {
        Some(list) => format!("https://www.youtube.com/playlist?{}", list.as_str()),
        None => spec.to_string(),
    }
}
