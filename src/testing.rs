//! Test doubles shared by the unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{oneshot, Semaphore};

use crate::{
    audio::{
        autoplaylist::AutoPlaylist,
        entry::{EntryOrigin, StreamRef},
        events::EventBus,
        player::{MusicPlayer, PlayerSettings, PlayerState},
        playlist::Playlist,
        sink::{TrackEnd, VoiceSink},
    },
    error::{PlayerError, ResolutionError},
    sources::{is_link, MediaResolver, ResolveOptions, ResolvedMedia, TrackMetadata},
};

pub fn test_guild() -> GuildId {
    GuildId::new(4242)
}

/// Resolver with canned answers. Unknown specs resolve to a three minute
/// track titled with the spec.
#[derive(Clone, Default)]
pub struct ScriptedResolver {
    playlists: HashMap<String, (usize, Vec<usize>)>,
    live: HashSet<String>,
    unsupported: HashSet<String>,
    failing: HashSet<String>,
    durations: HashMap<String, u64>,
    hold_downloads: bool,
    lookups: Arc<AtomicUsize>,
}

impl ScriptedResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// `url` resolves to `size` items; the 1-based positions in `broken`
    /// fail.
    pub fn playlist(mut self, url: &str, size: usize, broken: &[usize]) -> Self {
        self.playlists.insert(url.to_string(), (size, broken.to_vec()));
        self
    }

    pub fn live(mut self, url: &str) -> Self {
        self.live.insert(url.to_string());
        self
    }

    pub fn unsupported(mut self, url: &str) -> Self {
        self.unsupported.insert(url.to_string());
        self
    }

    pub fn failing(mut self, spec: &str) -> Self {
        self.failing.insert(spec.to_string());
        self
    }

    pub fn duration(mut self, spec: &str, secs: u64) -> Self {
        self.durations.insert(spec.to_string(), secs);
        self
    }

    /// Downloads never finish.
    pub fn hold_downloads(mut self) -> Self {
        self.hold_downloads = true;
        self
    }

    /// Shared counter of metadata lookups.
    pub fn lookups(&self) -> Arc<AtomicUsize> {
        self.lookups.clone()
    }

    fn track(&self, spec: &str) -> TrackMetadata {
        let url = if is_link(spec) {
            spec.to_string()
        } else {
            format!("https://media.example/{}", spec)
        };
        let secs = self.durations.get(spec).copied().unwrap_or(180);
        TrackMetadata::new(url, spec)
            .with_duration(Duration::from_secs(secs))
            .with_extractor("youtube")
    }
}

#[async_trait]
impl MediaResolver for ScriptedResolver {
    async fn resolve(
        &self,
        spec: &str,
        options: ResolveOptions,
    ) -> Result<ResolvedMedia, ResolutionError> {
        if self.failing.contains(spec) {
            return Err(ResolutionError::extraction(spec, "Video unavailable"));
        }

        if options.download {
            if self.hold_downloads {
                std::future::pending::<()>().await;
            }
            let file = PathBuf::from("/tmp/jukebox").join(spec.replace(['/', ':'], "_"));
            let meta = TrackMetadata::new(spec, spec).with_stream(StreamRef::Local(file));
            return Ok(ResolvedMedia::Track(meta));
        }

        self.lookups.fetch_add(1, Ordering::SeqCst);

        if self.unsupported.contains(spec) {
            return Err(ResolutionError::Unsupported {
                spec: spec.to_string(),
            });
        }

        if self.live.contains(spec) {
            let meta = TrackMetadata::new(spec, format!("Live: {}", spec))
                .with_extractor("twitch:stream")
                .with_stream(StreamRef::Remote(format!("{}/index.m3u8", spec)))
                .live();
            return Ok(ResolvedMedia::Track(meta));
        }

        if let Some((size, broken)) = self.playlists.get(spec) {
            let items = (1..=*size)
                .map(|i| {
                    if broken.contains(&i) {
                        Err(ResolutionError::extraction(format!("{}/{}", spec, i), "private video"))
                    } else {
                        Ok(TrackMetadata::new(format!("{}/{}", spec, i), format!("set item {}", i))
                            .with_duration(Duration::from_secs(60)))
                    }
                })
                .collect();
            return Ok(ResolvedMedia::Playlist {
                url: spec.to_string(),
                title: Some("set".to_string()),
                items,
            });
        }

        Ok(ResolvedMedia::Track(self.track(spec)))
    }
}

#[derive(Default)]
struct FakeSinkState {
    played: Vec<StreamRef>,
    pending: Option<oneshot::Sender<TrackEnd>>,
    paused: bool,
    volume: f32,
    refuse_next: Option<String>,
}

/// Voice sink that records what it was asked to play. Tracks only end when
/// the test says so.
#[derive(Default)]
pub struct FakeSink {
    state: Mutex<FakeSinkState>,
}

impl FakeSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn played(&self) -> Vec<StreamRef> {
        self.state.lock().played.clone()
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn volume(&self) -> f32 {
        self.state.lock().volume
    }

    pub fn finish_current(&self) {
        self.end_current(TrackEnd::Finished);
    }

    /// The next `play` call fails with `reason` instead of starting.
    pub fn refuse_next_play(&self, reason: &str) {
        self.state.lock().refuse_next = Some(reason.to_string());
    }

    pub fn fail_current(&self, reason: &str) {
        self.end_current(TrackEnd::Errored(reason.to_string()));
    }

    pub async fn wait_for_plays(&self, count: usize) {
        eventually(|| self.played().len() >= count).await;
    }

    fn end_current(&self, outcome: TrackEnd) {
        if let Some(done) = self.state.lock().pending.take() {
            let _ = done.send(outcome);
        }
    }
}

#[async_trait]
impl VoiceSink for FakeSink {
    async fn play(
        &self,
        source: &StreamRef,
        volume: f32,
        done: oneshot::Sender<TrackEnd>,
    ) -> Result<(), PlayerError> {
        let mut state = self.state.lock();
        if let Some(reason) = state.refuse_next.take() {
            return Err(PlayerError::Playback(reason));
        }
        state.played.push(source.clone());
        state.pending = Some(done);
        state.paused = false;
        state.volume = volume;
        Ok(())
    }

    fn pause(&self) {
        self.state.lock().paused = true;
    }

    fn resume(&self) {
        self.state.lock().paused = false;
    }

    fn stop(&self) {
        self.end_current(TrackEnd::Finished);
    }

    fn set_volume(&self, volume: f32) {
        self.state.lock().volume = volume;
    }
}

pub fn origin_for(user: u64) -> EntryOrigin {
    EntryOrigin::new(Some(UserId::new(user)), Some(ChannelId::new(900 + user)))
}

pub fn playlist_with<R: MediaResolver + 'static>(resolver: R) -> Playlist {
    Playlist::new(
        test_guild(),
        Arc::new(resolver),
        Arc::new(Semaphore::new(4)),
        Arc::new(EventBus::new(test_guild())),
    )
}

pub fn player_with<R: MediaResolver + 'static>(
    resolver: R,
    sink: Arc<FakeSink>,
    autoplaylist: &[&str],
    settings: PlayerSettings,
) -> Arc<MusicPlayer> {
    let playlist = Arc::new(playlist_with(resolver));
    let autoplaylist = AutoPlaylist::new(autoplaylist.iter().map(|u| u.to_string()).collect());
    MusicPlayer::new(playlist, sink, Arc::new(autoplaylist), settings)
}

pub async fn wait_for_state(player: &MusicPlayer, state: PlayerState) {
    eventually(|| player.state() == state).await;
}

/// Polls `check` until it holds, failing the test after five seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "condition not reached in time");
}
