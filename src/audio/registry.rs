//! Per-guild player registry.
//!
//! Owns one [`MusicPlayer`] per guild and is the entry point for song
//! requests coming from chat commands. Two kinds of locks live here:
//!
//! - a slot per guild, whose async lock serializes "get or create player"
//!   so two commands never build two players for the same guild;
//! - a lock per (guild, user), held for the whole of a song request so a
//!   user firing several requests at once cannot slip past their quota.

use dashmap::DashMap;
use parking_lot::RwLock;
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{sync::Arc, time::Duration};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

use super::{
    autoplaylist::AutoPlaylist,
    entry::{Entry, EntryOrigin},
    events::{EventBus, EventKind, PlayerEvent},
    player::{MusicPlayer, PlayerSettings, SkipOutcome, SkipRequest},
    playlist::Playlist,
    sink::VoiceSink,
};
use crate::{
    config::Config,
    error::PlayerError,
    sources::{normalize_request, MediaResolver, TrackMetadata},
    storage::{QueueSnapshot, QueueStore},
};

/// Per-user limits the command layer resolved from permissions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserLimits {
    /// Songs the user may have waiting in the queue.
    pub max_songs: Option<usize>,
    /// Longest track the user may queue. Streams are never checked.
    pub max_song_length: Option<Duration>,
    pub bypass_karaoke: bool,
}

impl UserLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_songs: config.max_songs(),
            max_song_length: config.max_song_length(),
            bypass_karaoke: false,
        }
    }
}

/// A song request as it arrives from a chat command.
#[derive(Debug, Clone)]
pub struct SongRequest {
    pub guild_id: GuildId,
    pub user: UserId,
    pub channel: Option<ChannelId>,
    pub spec: String,
    pub limits: UserLimits,
}

#[derive(Debug, Clone)]
pub enum Queued {
    Single { entry: Arc<Entry>, position: usize },
    /// A playlist was imported. `start` is the 1-based position of the
    /// first entry.
    Imported { entries: Vec<Arc<Entry>>, start: usize },
}

#[derive(Default)]
struct GuildSlot {
    lock: Mutex<()>,
    player: RwLock<Option<Arc<MusicPlayer>>>,
}

pub struct PlayerRegistry {
    resolver: Arc<dyn MediaResolver>,
    autoplaylist: Arc<AutoPlaylist>,
    store: Arc<QueueStore>,
    settings: PlayerSettings,
    download_permits: Arc<Semaphore>,
    persistent_queue: bool,
    write_current_song: bool,
    slots: DashMap<GuildId, Arc<GuildSlot>>,
    request_locks: DashMap<(GuildId, UserId), Arc<Mutex<()>>>,
}

impl PlayerRegistry {
    pub fn new(
        config: &Config,
        resolver: Arc<dyn MediaResolver>,
        autoplaylist: Arc<AutoPlaylist>,
        store: Arc<QueueStore>,
    ) -> Self {
        Self {
            resolver,
            autoplaylist,
            store,
            settings: PlayerSettings::from_config(config),
            download_permits: Arc::new(Semaphore::new(config.max_concurrent_downloads)),
            persistent_queue: config.persistent_queue,
            write_current_song: config.write_current_song,
            slots: DashMap::new(),
            request_locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<QueueStore> {
        &self.store
    }

    /// Returns the guild's live player, creating it on `sink` if there is
    /// none. With `deserialize`, a new player starts from the guild's saved
    /// queue, volume and karaoke flag.
    ///
    /// A restored queue does not start playing by itself; call
    /// [`MusicPlayer::start`].
    pub async fn get_or_create_player(
        &self,
        guild_id: GuildId,
        sink: Arc<dyn VoiceSink>,
        deserialize: bool,
    ) -> Result<Arc<MusicPlayer>, PlayerError> {
        let slot = self.slot(guild_id);
        let _guard = slot.lock.lock().await;

        if let Some(player) = slot.player.read().as_ref() {
            if !player.is_dead() {
                return Ok(player.clone());
            }
        }

        let events = Arc::new(EventBus::new(guild_id));
        let playlist = Arc::new(Playlist::new(
            guild_id,
            self.resolver.clone(),
            self.download_permits.clone(),
            events,
        ));
        let player = MusicPlayer::new(playlist, sink, self.autoplaylist.clone(), self.settings.clone());

        if deserialize {
            if let Some(snapshot) = self.store.load(guild_id).await {
                player.set_volume(snapshot.volume);
                player.set_karaoke_mode(snapshot.karaoke_mode);
                let restored = snapshot.restore_into(player.playlist())?;
                info!("📂 {} canciones restauradas en guild {}", restored, guild_id);
            }
        }

        self.attach_listeners(&player);
        *slot.player.write() = Some(player.clone());
        Ok(player)
    }

    /// The guild's player, if it has a live one.
    pub fn player(&self, guild_id: GuildId) -> Option<Arc<MusicPlayer>> {
        let slot = self.slots.get(&guild_id)?.clone();
        let player = slot.player.read().clone()?;
        (!player.is_dead()).then_some(player)
    }

    pub fn players(&self) -> Vec<Arc<MusicPlayer>> {
        let guilds: Vec<GuildId> = self.slots.iter().map(|slot| *slot.key()).collect();
        guilds.into_iter().filter_map(|guild| self.player(guild)).collect()
    }

    /// Queues a song for a user.
    ///
    /// Checks karaoke mode and the user's quota before anything is resolved,
    /// then queues the request. A playlist link is imported whole, skipping
    /// items longer than the user's limit; the import is refused if it would
    /// take the user past their quota.
    pub async fn queue_song(&self, request: SongRequest) -> Result<Queued, PlayerError> {
        let player = self.player(request.guild_id).ok_or(PlayerError::Dead)?;
        let lock = self.request_lock(request.guild_id, request.user);
        let _guard = lock.lock().await;

        self.check_request(&player, &request)?;

        let spec = normalize_request(&request.spec);
        let origin = EntryOrigin::new(Some(request.user), request.channel);
        let admit = length_limit(request.limits.max_song_length);
        let playlist = player.playlist();

        match playlist.add_entry_with(&spec, origin, admit).await {
            Ok((entry, position)) => Ok(Queued::Single { entry, position }),
            Err(PlayerError::WrongEntryType { use_url, .. }) => {
                debug!("📃 {} es una playlist, se importa", use_url);
                let quota = import_quota(playlist, request.user, request.limits.max_songs);
                let (entries, start) = playlist
                    .import_from_with(&use_url, origin, admit, quota)
                    .await?;
                Ok(Queued::Imported { entries, start })
            }
            Err(e) => Err(e),
        }
    }

    /// Queues a live stream for a user. Same checks as
    /// [`PlayerRegistry::queue_song`], without the length limit.
    pub async fn queue_stream(&self, request: SongRequest) -> Result<Arc<Entry>, PlayerError> {
        let player = self.player(request.guild_id).ok_or(PlayerError::Dead)?;
        let lock = self.request_lock(request.guild_id, request.user);
        let _guard = lock.lock().await;

        self.check_request(&player, &request)?;

        let spec = request.spec.trim().trim_start_matches('<').trim_end_matches('>');
        let origin = EntryOrigin::new(Some(request.user), request.channel);
        let entry = player.playlist().add_stream_entry(spec, origin).await?;
        info!("📡 Stream agregado a la cola: {}", entry.title());
        Ok(entry)
    }

    pub fn skip(&self, guild_id: GuildId, request: SkipRequest) -> Result<SkipOutcome, PlayerError> {
        self.player(guild_id).ok_or(PlayerError::Dead)?.skip(request)
    }

    /// Saves, kills and forgets the guild's player.
    pub async fn disconnect(&self, guild_id: GuildId) {
        let player = self
            .slots
            .get(&guild_id)
            .and_then(|slot| slot.player.write().take());
        self.request_locks.retain(|(guild, _), _| *guild != guild_id);

        let Some(player) = player else {
            return;
        };
        if self.persistent_queue && !player.is_dead() {
            self.store.save_player(&player).await;
        }
        player.kill();
        info!("👋 Desconectado de guild {}", guild_id);
    }

    /// Writes the guild's queue to disk now.
    pub async fn serialize_queue(&self, guild_id: GuildId) -> Result<(), PlayerError> {
        let Some(player) = self.player(guild_id) else {
            return Ok(());
        };
        let bytes = QueueSnapshot::capture(&player).to_bytes()?;
        self.store.save(guild_id, &bytes).await
    }

    /// The guild's saved queue, or `None` if there is nothing usable.
    pub async fn deserialize_queue(&self, guild_id: GuildId) -> Option<QueueSnapshot> {
        self.store.load(guild_id).await
    }

    /// Saves every live player. Used on shutdown.
    pub async fn serialize_all(&self) {
        let players = self.players();
        for player in &players {
            self.store.save_player(player).await;
        }
        info!("💾 Colas guardadas: {}", players.len());
    }

    /// Appends `url` to the shared autoplaylist. `false` if it was already
    /// there.
    pub async fn save_to_autoplaylist(&self, url: &str) -> anyhow::Result<bool> {
        let added = self.autoplaylist.add(url).await?;
        if added {
            info!("📻 Agregado a la autoplaylist: {}", url);
        }
        Ok(added)
    }

    fn check_request(&self, player: &MusicPlayer, request: &SongRequest) -> Result<(), PlayerError> {
        if player.karaoke_mode() && !request.limits.bypass_karaoke {
            return Err(PlayerError::PermissionDenied(
                "karaoke mode is on, only permitted users can queue songs".to_string(),
            ));
        }

        if let Some(limit) = request.limits.max_songs {
            let queued = player.playlist().count_for(request.user);
            if queued >= limit {
                return Err(PlayerError::QuotaExceeded {
                    user: request.user,
                    queued,
                    limit,
                });
            }
        }

        Ok(())
    }

    fn attach_listeners(&self, player: &Arc<MusicPlayer>) {
        if self.persistent_queue {
            let events = player.events();
            events
                .on(EventKind::Play, save_queue(player, &self.store))
                .on(EventKind::FinishedPlaying, save_queue(player, &self.store));

            let save = save_queue(player, &self.store);
            events.on(EventKind::EntryAdded, move |event| {
                if event.entry().is_some_and(|e| e.origin().is_user_request()) {
                    save(event);
                }
            });
        }

        if self.write_current_song {
            let store = self.store.clone();
            let guild_id = player.guild_id();
            player.on(EventKind::Play, move |event| {
                let Some(entry) = event.entry() else {
                    return;
                };
                let store = store.clone();
                let title = entry.title().to_string();
                tokio::spawn(async move {
                    if let Err(e) = store.write_now_playing(guild_id, &title).await {
                        warn!("⚠️ No se pudo escribir la canción actual: {}", e);
                    }
                });
            });
        }
    }

    fn slot(&self, guild_id: GuildId) -> Arc<GuildSlot> {
        self.slots.entry(guild_id).or_default().clone()
    }

    fn request_lock(&self, guild_id: GuildId, user: UserId) -> Arc<Mutex<()>> {
        self.request_locks.entry((guild_id, user)).or_default().clone()
    }
}

/// Listener que guarda la cola en segundo plano
fn save_queue(
    player: &Arc<MusicPlayer>,
    store: &Arc<QueueStore>,
) -> impl Fn(&PlayerEvent) + Send + Sync + 'static {
    let player = Arc::downgrade(player);
    let store = store.clone();
    move |_| {
        let Some(player) = player.upgrade() else {
            return;
        };
        let store = store.clone();
        tokio::spawn(async move { store.save_player(&player).await });
    }
}

/// Rechaza importaciones que superan la cuota del usuario
fn import_quota(
    playlist: &Playlist,
    user: UserId,
    limit: Option<usize>,
) -> impl FnOnce(usize) -> Result<(), PlayerError> + '_ {
    move |incoming| {
        let Some(limit) = limit else {
            return Ok(());
        };
        let queued = playlist.count_for(user);
        if queued + incoming > limit {
            return Err(PlayerError::QuotaExceeded { user, queued, limit });
        }
        Ok(())
    }
}

fn length_limit(limit: Option<Duration>) -> impl Fn(&TrackMetadata) -> Result<(), PlayerError> + Copy {
    move |meta| match (limit, meta.duration) {
        (Some(limit), Some(duration)) if duration > limit => Err(PlayerError::PermissionDenied(format!(
            "`{}` is longer than the limit ({} > {})",
            meta.title,
            humantime::format_duration(duration),
            humantime::format_duration(limit),
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::{entry::StreamRef, player::PlayerState},
        sources::{MockMediaResolver, ResolvedMedia},
        storage::SNAPSHOT_VERSION,
        testing::{eventually, test_guild, wait_for_state, FakeSink, ScriptedResolver},
    };
    use pretty_assertions::assert_eq;

    struct Harness {
        registry: PlayerRegistry,
        sink: Arc<FakeSink>,
        _dir: tempfile::TempDir,
    }

    fn harness<R: MediaResolver + 'static>(resolver: R, persistent: bool) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            persistent_queue: persistent,
            auto_playlist: false,
            ..Config::default()
        };
        let registry = PlayerRegistry::new(
            &config,
            Arc::new(resolver),
            Arc::new(AutoPlaylist::new(Vec::new())),
            Arc::new(QueueStore::new(dir.path())),
        );
        Harness {
            registry,
            sink: FakeSink::new(),
            _dir: dir,
        }
    }

    impl Harness {
        async fn player(&self) -> Arc<MusicPlayer> {
            let sink: Arc<dyn VoiceSink> = self.sink.clone();
            self.registry
                .get_or_create_player(test_guild(), sink, false)
                .await
                .unwrap()
        }
    }

    fn request(user: u64, spec: &str, limits: UserLimits) -> SongRequest {
        SongRequest {
            guild_id: test_guild(),
            user: UserId::new(user),
            channel: Some(ChannelId::new(77)),
            spec: spec.to_string(),
            limits,
        }
    }

    #[tokio::test]
    async fn test_same_player_until_disconnect() {
        let h = harness(ScriptedResolver::new(), false);
        let first = h.player().await;
        let again = h.player().await;
        assert!(Arc::ptr_eq(&first, &again));

        h.registry.disconnect(test_guild()).await;
        assert_eq!(first.state(), PlayerState::Dead);
        assert!(h.registry.player(test_guild()).is_none());

        let fresh = h.player().await;
        assert!(!Arc::ptr_eq(&first, &fresh));
    }

    #[tokio::test]
    async fn test_quota_is_checked_before_resolving() {
        let mut resolver = MockMediaResolver::new();
        for spec in ["filler", "mine"] {
            resolver
                .expect_resolve()
                .withf(move |s, options| s == spec && !options.download)
                .times(1)
                .returning(|s, _| Ok(ResolvedMedia::Track(TrackMetadata::new(s, s))));
        }
        // "another" has no expectation: resolving it would fail the test
        resolver
            .expect_resolve()
            .withf(|_, options| options.download)
            .returning(|s, _| {
                Ok(ResolvedMedia::Track(
                    TrackMetadata::new(s, s).with_stream(StreamRef::Local("/tmp/q.opus".into())),
                ))
            });
        let h = harness(resolver, false);
        let player = h.player().await;
        let limits = UserLimits {
            max_songs: Some(1),
            ..UserLimits::default()
        };

        // The filler plays and never ends, so the user's song stays queued
        player.playlist().add_entry("filler", EntryOrigin::system()).await.unwrap();
        h.sink.wait_for_plays(1).await;
        h.registry.queue_song(request(5, "mine", limits)).await.unwrap();
        assert_eq!(player.playlist().count_for(UserId::new(5)), 1);

        let err = h.registry.queue_song(request(5, "another", limits)).await.unwrap_err();
        assert_eq!(
            err,
            PlayerError::QuotaExceeded {
                user: UserId::new(5),
                queued: 1,
                limit: 1
            }
        );
    }

    #[tokio::test]
    async fn test_karaoke_mode_needs_bypass() {
        let h = harness(ScriptedResolver::new(), false);
        let player = h.player().await;
        player.set_karaoke_mode(true);

        let err = h
            .registry
            .queue_song(request(1, "song", UserLimits::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, PlayerError::PermissionDenied(_)));

        let limits = UserLimits {
            bypass_karaoke: true,
            ..UserLimits::default()
        };
        assert!(h.registry.queue_song(request(1, "song", limits)).await.is_ok());
    }

    #[tokio::test]
    async fn test_playlist_link_is_imported() {
        let resolver = ScriptedResolver::new().playlist("https://list.example/set", 3, &[]);
        let h = harness(resolver, false);
        h.player().await;

        let queued = h
            .registry
            .queue_song(request(1, "<https://list.example/set>", UserLimits::default()))
            .await
            .unwrap();

        match queued {
            Queued::Imported { entries, start } => {
                assert_eq!(entries.len(), 3);
                assert_eq!(start, 1);
                assert_eq!(entries[0].requester(), Some(UserId::new(1)));
            }
            other => panic!("expected an import, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_import_over_quota_is_refused_whole() {
        let resolver = ScriptedResolver::new().playlist("https://list.example/big", 5, &[]);
        let h = harness(resolver, false);
        let player = h.player().await;
        let limits = UserLimits {
            max_songs: Some(2),
            ..UserLimits::default()
        };

        let err = h
            .registry
            .queue_song(request(5, "https://list.example/big", limits))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            PlayerError::QuotaExceeded {
                user: UserId::new(5),
                queued: 0,
                limit: 2
            }
        );
        assert!(player.playlist().is_empty());
        assert_eq!(player.state(), PlayerState::Stopped);
    }

    #[tokio::test]
    async fn test_import_with_every_item_too_long_fails() {
        // Los elementos de la playlist duran 60 segundos
        let resolver = ScriptedResolver::new().playlist("https://list.example/set", 3, &[]);
        let h = harness(resolver, false);
        let player = h.player().await;
        let limits = UserLimits {
            max_song_length: Some(Duration::from_secs(30)),
            ..UserLimits::default()
        };

        let err = h
            .registry
            .queue_song(request(1, "https://list.example/set", limits))
            .await
            .unwrap_err();
        assert!(matches!(err, PlayerError::NothingQueued { skipped: 3, .. }));
        assert!(player.playlist().is_empty());
    }

    #[tokio::test]
    async fn test_song_length_limit() {
        let resolver = ScriptedResolver::new()
            .duration("long", 600)
            .live("https://live.example/radio");
        let h = harness(resolver, false);
        h.player().await;
        let limits = UserLimits {
            max_song_length: Some(Duration::from_secs(300)),
            ..UserLimits::default()
        };

        let err = h.registry.queue_song(request(1, "long", limits)).await.unwrap_err();
        assert!(matches!(err, PlayerError::PermissionDenied(_)));

        // Streams have no length to check
        let queued = h
            .registry
            .queue_song(request(1, "https://live.example/radio", limits))
            .await
            .unwrap();
        assert!(matches!(queued, Queued::Single { ref entry, .. } if entry.is_stream()));
    }

    #[tokio::test]
    async fn test_queue_survives_reconnect() {
        let h = harness(ScriptedResolver::new(), false);
        let player = h.player().await;
        player.set_volume(0.4);
        for spec in ["A", "B", "C"] {
            h.registry
                .queue_song(request(1, spec, UserLimits::default()))
                .await
                .unwrap();
        }
        h.sink.wait_for_plays(1).await;

        h.registry.serialize_queue(test_guild()).await.unwrap();
        let saved = h.registry.deserialize_queue(test_guild()).await.unwrap();
        assert_eq!(saved.version, SNAPSHOT_VERSION);
        assert_eq!(saved.current.as_ref().map(|c| c.entry.title.as_str()), Some("A"));

        h.registry.disconnect(test_guild()).await;
        let sink: Arc<dyn VoiceSink> = FakeSink::new();
        let restored = h
            .registry
            .get_or_create_player(test_guild(), sink, true)
            .await
            .unwrap();

        let titles: Vec<String> = restored
            .playlist()
            .entries()
            .iter()
            .map(|e| e.title().to_string())
            .collect();
        assert_eq!(titles, vec!["A", "B", "C"]);
        assert!((restored.volume() - 0.4).abs() < f32::EPSILON);
        assert_eq!(restored.state(), PlayerState::Stopped);
    }

    #[tokio::test]
    async fn test_user_requests_are_saved() {
        let h = harness(ScriptedResolver::new(), true);
        h.player().await;
        h.registry
            .queue_song(request(1, "saved", UserLimits::default()))
            .await
            .unwrap();

        let path = h.registry.store().queue_path(test_guild());
        eventually(|| path.exists()).await;
        wait_for_state(&h.registry.player(test_guild()).unwrap(), PlayerState::Playing).await;
    }
}
