use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serenity::model::id::{ChannelId, UserId};
use std::{
    fmt,
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::sources::TrackMetadata;

static NEXT_ENTRY_ID: AtomicU64 = AtomicU64::new(1);

/// Process-wide monotonic entry identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(u64);

impl EntryId {
    pub fn next() -> Self {
        Self(NEXT_ENTRY_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Reuses an id read back from disk and moves the counter past it.
    pub(crate) fn restore(raw: u64) -> Self {
        NEXT_ENTRY_ID.fetch_max(raw.saturating_add(1), Ordering::Relaxed);
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// A bounded track fetched ahead of playback.
    Track,
    /// A live source, playable as soon as it is queued.
    Stream,
}

/// Where the voice sink reads audio from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "location", rename_all = "snake_case")]
pub enum StreamRef {
    Remote(String),
    Local(PathBuf),
}

impl fmt::Display for StreamRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamRef::Remote(url) => f.write_str(url),
            StreamRef::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Download progress of an entry. The stream reference only exists once the
/// entry is `Ready`.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadState {
    Pending,
    Downloading { progress: Option<f32> },
    Ready(StreamRef),
    Failed(String),
}

impl DownloadState {
    pub fn is_settled(&self) -> bool {
        matches!(self, DownloadState::Ready(_) | DownloadState::Failed(_))
    }
}

/// Who queued an entry and from which text channel. Both are empty for
/// autoplaylist entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryOrigin {
    pub requester: Option<UserId>,
    pub channel: Option<ChannelId>,
}

impl EntryOrigin {
    pub fn new(requester: Option<UserId>, channel: Option<ChannelId>) -> Self {
        Self { requester, channel }
    }

    pub fn system() -> Self {
        Self::default()
    }

    pub fn is_user_request(&self) -> bool {
        self.requester.is_some() && self.channel.is_some()
    }
}

/// Immutable description of an entry, shared by every constructor.
#[derive(Debug, Clone)]
pub(crate) struct EntryParts {
    pub id: EntryId,
    pub kind: EntryKind,
    pub url: String,
    pub title: String,
    pub duration: Option<Duration>,
    pub extractor: Option<String>,
    pub origin: EntryOrigin,
    pub added_at: DateTime<Utc>,
}

/// One queueable unit. Everything but the download state is fixed at
/// creation.
#[derive(Debug)]
pub struct Entry {
    id: EntryId,
    kind: EntryKind,
    url: String,
    title: String,
    duration: Option<Duration>,
    extractor: Option<String>,
    origin: EntryOrigin,
    added_at: DateTime<Utc>,
    state: watch::Sender<DownloadState>,
    cancel: CancellationToken,
}

impl Entry {
    pub(crate) fn new(parts: EntryParts, state: DownloadState, cancel: CancellationToken) -> Self {
        Self {
            id: parts.id,
            kind: parts.kind,
            url: parts.url,
            title: parts.title,
            duration: parts.duration,
            extractor: parts.extractor,
            origin: parts.origin,
            added_at: parts.added_at,
            state: watch::Sender::new(state),
            cancel,
        }
    }

    /// A track entry waiting for its download.
    pub(crate) fn track(meta: &TrackMetadata, origin: EntryOrigin, cancel: CancellationToken) -> Self {
        let parts = EntryParts {
            id: EntryId::next(),
            kind: EntryKind::Track,
            url: meta.url.clone(),
            title: meta.title.clone(),
            duration: meta.duration,
            extractor: meta.extractor.clone(),
            origin,
            added_at: Utc::now(),
        };
        Self::new(parts, DownloadState::Pending, cancel)
    }

    /// A live entry, ready immediately.
    pub(crate) fn stream(
        url: String,
        title: String,
        destination: StreamRef,
        extractor: Option<String>,
        origin: EntryOrigin,
        cancel: CancellationToken,
    ) -> Self {
        let parts = EntryParts {
            id: EntryId::next(),
            kind: EntryKind::Stream,
            url,
            title,
            duration: None,
            extractor,
            origin,
            added_at: Utc::now(),
        };
        Self::new(parts, DownloadState::Ready(destination), cancel)
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn is_stream(&self) -> bool {
        self.kind == EntryKind::Stream
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// `None` for live streams and sources that did not report a length.
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    pub fn extractor(&self) -> Option<&str> {
        self.extractor.as_deref()
    }

    pub fn origin(&self) -> EntryOrigin {
        self.origin
    }

    pub fn requester(&self) -> Option<UserId> {
        self.origin.requester
    }

    pub fn channel(&self) -> Option<ChannelId> {
        self.origin.channel
    }

    pub fn added_at(&self) -> DateTime<Utc> {
        self.added_at
    }

    pub fn state(&self) -> DownloadState {
        self.state.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.state.borrow(), DownloadState::Ready(_))
    }

    pub fn is_downloading(&self) -> bool {
        matches!(*self.state.borrow(), DownloadState::Downloading { .. })
    }

    /// The playable source, once the entry is ready.
    pub fn stream_ref(&self) -> Option<StreamRef> {
        match &*self.state.borrow() {
            DownloadState::Ready(source) => Some(source.clone()),
            _ => None,
        }
    }

    /// Resolves once the entry is ready or its download failed or was
    /// cancelled.
    pub async fn wait_ready(&self) -> Result<StreamRef, String> {
        let mut rx = self.state.subscribe();
        let settled = tokio::select! {
            _ = self.cancel.cancelled() => return Err("entry was removed".to_string()),
            state = rx.wait_for(DownloadState::is_settled) => state.map(|s| s.clone()),
        };

        match settled {
            Ok(DownloadState::Ready(source)) => Ok(source),
            Ok(DownloadState::Failed(reason)) => Err(reason),
            Ok(_) | Err(_) => Err("download state was lost".to_string()),
        }
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Stops an in-flight download. A download that already finished is kept.
    pub fn cancel_prefetch(&self) {
        self.cancel.cancel();
    }

    /// Moves `Pending` to `Downloading`. Returns false if a download already
    /// started or settled.
    pub(crate) fn begin_download(&self) -> bool {
        self.state.send_if_modified(|state| {
            if matches!(state, DownloadState::Pending) {
                *state = DownloadState::Downloading { progress: None };
                true
            } else {
                false
            }
        })
    }

    pub fn set_progress(&self, progress: f32) {
        self.state.send_if_modified(|state| match state {
            DownloadState::Downloading { progress: current } => {
                *current = Some(progress.clamp(0.0, 1.0));
                true
            }
            _ => false,
        });
    }

    pub(crate) fn mark_ready(&self, source: StreamRef) {
        self.state.send_replace(DownloadState::Ready(source));
    }

    pub(crate) fn mark_failed(&self, reason: impl Into<String>) {
        self.state.send_replace(DownloadState::Failed(reason.into()));
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Entry {}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.id, self.title)
    }
}
