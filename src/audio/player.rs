use parking_lot::Mutex;
use rand::Rng;
use serenity::model::id::{GuildId, MessageId, UserId};
use std::{
    sync::{Arc, Weak},
    time::{Duration, Instant},
};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    autoplaylist::AutoPlaylist,
    entry::{Entry, EntryOrigin},
    events::{EventBus, EventKind, PlayerEvent},
    playlist::Playlist,
    sink::{TrackEnd, VoiceSink},
    skip::{SkipRules, SkipState},
};
use crate::{config::Config, error::PlayerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Stopped,
    Playing,
    Paused,
    /// Terminal
    Dead,
}

/// Ajustes de reproducción por servidor, derivados de [`Config`]
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerSettings {
    pub volume: f32,
    pub skip_rules: SkipRules,
    pub autoplaylist: bool,
    pub autoplaylist_random: bool,
}

impl PlayerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            volume: config.default_volume,
            skip_rules: SkipRules::new(config.skips_required, config.skip_ratio_required),
            autoplaylist: config.auto_playlist,
            autoplaylist_random: config.auto_playlist_random,
        }
    }
}

impl Default for PlayerSettings {
    fn default() -> Self {
        Self {
            volume: 0.15,
            skip_rules: SkipRules::default(),
            autoplaylist: true,
            autoplaylist_random: true,
        }
    }
}

/// Who is asking to skip, and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipRequest {
    /// Sin votación; los permisos se revisan antes
    Force,
    Vote {
        voter: UserId,
        message: Option<MessageId>,
        /// Oyentes en el canal, sin bots ni ensordecidos
        listeners: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipOutcome {
    Skipped { entry: Arc<Entry> },
    Voted { votes: usize, required: usize },
    Idle,
}

/// Reloj de reproducción que descuenta las pausas
#[derive(Debug, Default)]
struct PlaybackClock {
    started: Option<Instant>,
    accumulated: Duration,
}

impl PlaybackClock {
    fn start(&mut self) {
        self.accumulated = Duration::ZERO;
        self.started = Some(Instant::now());
    }

    fn pause(&mut self) {
        if let Some(started) = self.started.take() {
            self.accumulated += started.elapsed();
        }
    }

    fn resume(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    fn reset(&mut self) {
        self.started = None;
        self.accumulated = Duration::ZERO;
    }

    fn elapsed(&self) -> Duration {
        self.accumulated + self.started.map_or(Duration::ZERO, |s| s.elapsed())
    }
}

struct PlayerCore {
    state: PlayerState,
    current: Option<Arc<Entry>>,
    /// Sube en cada inicio, stop y kill; los finales viejos se ignoran
    session: u64,
    volume: f32,
    karaoke_mode: bool,
    skip_state: SkipState,
    clock: PlaybackClock,
    autoplaylist: Vec<String>,
    autoplaylist_enabled: bool,
}

/// Reproductor de un servidor: toma la cabeza de la cola, espera su descarga
/// y la manda al sink. El lock de estado nunca cruza un `.await`.
pub struct MusicPlayer {
    guild_id: GuildId,
    playlist: Arc<Playlist>,
    sink: Arc<dyn VoiceSink>,
    events: Arc<EventBus>,
    autoplaylist: Arc<AutoPlaylist>,
    settings: PlayerSettings,
    core: Mutex<PlayerCore>,
    play_lock: AsyncMutex<()>,
    dead: CancellationToken,
    this: Weak<MusicPlayer>,
}

impl MusicPlayer {
    pub fn new(
        playlist: Arc<Playlist>,
        sink: Arc<dyn VoiceSink>,
        autoplaylist: Arc<AutoPlaylist>,
        settings: PlayerSettings,
    ) -> Arc<Self> {
        let player = Arc::new_cyclic(|this| Self {
            guild_id: playlist.guild_id(),
            events: playlist.events().clone(),
            playlist,
            sink,
            autoplaylist,
            core: Mutex::new(PlayerCore {
                state: PlayerState::Stopped,
                current: None,
                session: 0,
                volume: settings.volume.clamp(0.0, 1.0),
                karaoke_mode: false,
                skip_state: SkipState::new(),
                clock: PlaybackClock::default(),
                autoplaylist: Vec::new(),
                autoplaylist_enabled: settings.autoplaylist,
            }),
            settings,
            play_lock: AsyncMutex::new(()),
            dead: CancellationToken::new(),
            this: this.clone(),
        });

        // Arranca solo cuando llega una canción con el reproductor detenido
        let weak = Arc::downgrade(&player);
        player.events.on(EventKind::EntryAdded, move |_| {
            if let Some(player) = weak.upgrade() {
                if player.state() == PlayerState::Stopped {
                    tokio::spawn(async move {
                        if let Err(e) = player.play().await {
                            debug!("No se pudo iniciar la reproducción: {}", e);
                        }
                    });
                }
            }
        });

        info!("🎛️ Reproductor creado para guild {}", player.guild_id);
        player
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn playlist(&self) -> &Arc<Playlist> {
        &self.playlist
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Registra un listener
    pub fn on<F>(&self, kind: EventKind, listener: F) -> &EventBus
    where
        F: Fn(&PlayerEvent) + Send + Sync + 'static,
    {
        self.events.on(kind, listener)
    }

    pub fn state(&self) -> PlayerState {
        self.core.lock().state
    }

    pub fn is_dead(&self) -> bool {
        self.state() == PlayerState::Dead
    }

    pub fn current_entry(&self) -> Option<Arc<Entry>> {
        self.core.lock().current.clone()
    }

    /// Tiempo reproducido de la canción actual
    pub fn progress(&self) -> Duration {
        let core = self.core.lock();
        match core.current {
            Some(_) => core.clock.elapsed(),
            None => Duration::ZERO,
        }
    }

    /// Lo que falta de la canción actual, cero si no se sabe
    pub fn current_remaining(&self) -> Duration {
        let core = self.core.lock();
        if core.state == PlayerState::Stopped {
            return Duration::ZERO;
        }
        core.current
            .as_ref()
            .and_then(|entry| entry.duration())
            .map_or(Duration::ZERO, |d| d.saturating_sub(core.clock.elapsed()))
    }

    pub fn volume(&self) -> f32 {
        self.core.lock().volume
    }

    /// Ajusta el volumen (0.0 a 1.0) y devuelve el aplicado
    pub fn set_volume(&self, volume: f32) -> f32 {
        let volume = volume.clamp(0.0, 1.0);
        self.core.lock().volume = volume;
        self.sink.set_volume(volume);
        info!("🔊 Volumen ajustado a {}%", (volume * 100.0).round() as u8);
        volume
    }

    pub fn karaoke_mode(&self) -> bool {
        self.core.lock().karaoke_mode
    }

    pub fn set_karaoke_mode(&self, enabled: bool) {
        self.core.lock().karaoke_mode = enabled;
        info!("🎤 Modo karaoke {}", if enabled { "activado" } else { "desactivado" });
    }

    pub fn skip_votes(&self) -> usize {
        self.core.lock().skip_state.count()
    }

    pub fn skip_messages(&self) -> Vec<MessageId> {
        self.core.lock().skip_state.messages().to_vec()
    }

    pub fn autoplaylist_enabled(&self) -> bool {
        self.core.lock().autoplaylist_enabled
    }

    /// Reactiva la autoplaylist
    pub fn reset_autoplaylist(&self) {
        let mut core = self.core.lock();
        core.autoplaylist = self.autoplaylist.snapshot();
        core.autoplaylist_enabled = self.settings.autoplaylist;
        info!("🔄 Autoplaylist reiniciada ({} canciones)", core.autoplaylist.len());
    }

    /// Inicia o reanuda la reproducción; espera la descarga de la cabeza
    pub async fn play(&self) -> Result<(), PlayerError> {
        self.play_next(false).await
    }

    /// Como `play`, pero rellena una cola vacía con la autoplaylist
    pub async fn start(&self) -> Result<(), PlayerError> {
        if self.playlist.is_empty() {
            self.continue_with_autoplaylist().await;
        }
        self.play().await
    }

    pub fn pause(&self) -> Result<(), PlayerError> {
        let entry = {
            let mut core = self.core.lock();
            match (core.state, core.current.clone()) {
                (PlayerState::Playing, Some(entry)) => {
                    core.state = PlayerState::Paused;
                    core.clock.pause();
                    entry
                }
                (PlayerState::Paused, _) => return Ok(()),
                // Entre canciones no hay nada que pausar
                (state, _) => return Err(PlayerError::InvalidState { action: "pause", state }),
            }
        };

        self.sink.pause();
        info!("⏸️ Reproducción pausada");
        self.events.emit(&PlayerEvent::Pause { entry });
        Ok(())
    }

    pub fn resume(&self) -> Result<(), PlayerError> {
        let entry = {
            let mut core = self.core.lock();
            match core.state {
                PlayerState::Paused => {
                    core.state = PlayerState::Playing;
                    core.clock.resume();
                    core.current.clone()
                }
                PlayerState::Playing => return Ok(()),
                state => return Err(PlayerError::InvalidState { action: "resume", state }),
            }
        };

        if let Some(entry) = entry {
            self.sink.resume();
            info!("▶️ Reproducción reanudada");
            self.events.emit(&PlayerEvent::Resume { entry });
        }
        Ok(())
    }

    /// Detiene la reproducción sin tocar la cola
    pub fn stop(&self) -> Result<(), PlayerError> {
        let (was_active, current) = {
            let mut core = self.core.lock();
            if core.state == PlayerState::Dead {
                return Err(PlayerError::Dead);
            }
            let was_active = matches!(core.state, PlayerState::Playing | PlayerState::Paused);
            core.state = PlayerState::Stopped;
            core.session += 1;
            core.clock.reset();
            (was_active, core.current.take())
        };

        if current.is_some() {
            self.sink.stop();
        }
        if was_active {
            info!("⏹️ Reproducción detenida");
            self.events.emit(&PlayerEvent::Stop);
        }
        Ok(())
    }

    /// Salta la canción actual o registra el voto. El salto pasa por el
    /// mismo camino que un final normal.
    pub fn skip(&self, request: SkipRequest) -> Result<SkipOutcome, PlayerError> {
        let entry = {
            let mut core = self.core.lock();
            if core.state == PlayerState::Dead {
                return Err(PlayerError::Dead);
            }
            if core.current.is_none() {
                return Ok(SkipOutcome::Idle);
            }

            if let SkipRequest::Vote {
                voter,
                message,
                listeners,
            } = request
            {
                let votes = core.skip_state.add_skipper(voter, message);
                let required = self.settings.skip_rules.votes_needed(listeners);
                if votes < required {
                    debug!("🗳️ Voto para saltar: {}/{}", votes, required);
                    return Ok(SkipOutcome::Voted { votes, required });
                }
            }

            match core.current.take() {
                Some(entry) => entry,
                None => return Ok(SkipOutcome::Idle),
            }
        };

        info!("⏭️ Saltando: {}", entry.title());
        self.sink.stop();
        Ok(SkipOutcome::Skipped { entry })
    }

    /// Termina el reproductor y cancela descargas pendientes
    pub fn kill(&self) {
        {
            let mut core = self.core.lock();
            if core.state == PlayerState::Dead {
                return;
            }
            core.state = PlayerState::Dead;
            core.session += 1;
            core.current = None;
            core.clock.reset();
        }

        self.events.clear();
        self.dead.cancel();
        self.playlist.close();
        self.sink.stop();
        info!("💀 Reproductor de guild {} terminado", self.guild_id);
    }

    async fn play_next(&self, mut continuing: bool) -> Result<(), PlayerError> {
        loop {
            let (state, has_current) = {
                let core = self.core.lock();
                (core.state, core.current.is_some())
            };
            match state {
                PlayerState::Dead => return Err(PlayerError::Dead),
                PlayerState::Paused if !continuing && has_current => return self.resume(),
                PlayerState::Playing | PlayerState::Paused if !continuing => return Ok(()),
                _ => {}
            }

            let drained = {
                // Otro ciclo ya está avanzando la cola
                let Ok(_guard) = self.play_lock.try_lock() else {
                    debug!("Reproducción ya en curso en guild {}", self.guild_id);
                    return Ok(());
                };
                self.advance().await?
            };

            // Una canción pudo llegar entre la cola vacía y el stop
            if !drained || self.playlist.is_empty() {
                return Ok(());
            }
            debug!("🔁 Llegó una canción mientras se detenía, reintentando");
            continuing = false;
        }
    }

    /// Reproduce la siguiente entrada lista. `true` si la cola quedó vacía
    /// y el reproductor se detuvo.
    async fn advance(&self) -> Result<bool, PlayerError> {
        loop {
            let session = {
                let core = self.core.lock();
                if core.state == PlayerState::Dead {
                    return Err(PlayerError::Dead);
                }
                core.session
            };

            let Some(entry) = self.playlist.pop_next() else {
                debug!("📭 Cola vacía en guild {}", self.guild_id);
                self.stop()?;
                return Ok(true);
            };

            let source = match entry.wait_ready().await {
                Ok(source) => source,
                Err(reason) => {
                    if self.is_dead() {
                        return Err(PlayerError::Dead);
                    }
                    warn!("⚠️ Se omite {}: {}", entry, reason);
                    continue;
                }
            };

            let (session, volume) = {
                let mut core = self.core.lock();
                if core.state == PlayerState::Dead {
                    return Err(PlayerError::Dead);
                }
                if core.session != session {
                    // stop() mientras se descargaba
                    drop(core);
                    self.playlist.requeue_front(entry);
                    return Ok(false);
                }
                core.session += 1;
                core.state = PlayerState::Playing;
                core.current = Some(entry.clone());
                core.skip_state.reset();
                core.clock.start();
                (core.session, core.volume)
            };

            let (done_tx, done_rx) = oneshot::channel();
            if let Err(e) = self.sink.play(&source, volume, done_tx).await {
                error!("❌ No se pudo reproducir {}: {}", entry, e);
                {
                    let mut core = self.core.lock();
                    if core.session == session {
                        core.current = None;
                        core.clock.reset();
                    }
                }
                self.events.emit(&PlayerEvent::Error {
                    entry: Some(entry),
                    error: Arc::new(e),
                });
                continue;
            }

            info!("🎵 Reproduciendo: {}", entry.title());
            self.events.emit(&PlayerEvent::Play {
                entry: entry.clone(),
            });
            self.watch_completion(session, entry, done_rx);
            return Ok(false);
        }
    }

    fn watch_completion(&self, session: u64, entry: Arc<Entry>, done: oneshot::Receiver<TrackEnd>) {
        let this = self.this.clone();
        let dead = self.dead.clone();

        tokio::spawn(async move {
            let outcome = tokio::select! {
                _ = dead.cancelled() => return,
                outcome = done => outcome.unwrap_or(TrackEnd::Finished),
            };
            if let Some(player) = this.upgrade() {
                player.finish_track(session, entry, outcome).await;
            }
        });
    }

    async fn finish_track(&self, session: u64, entry: Arc<Entry>, outcome: TrackEnd) {
        {
            let mut core = self.core.lock();
            if core.session != session || core.state == PlayerState::Dead {
                debug!("Fin de {} ignorado, la sesión ya cambió", entry);
                return;
            }
            core.current = None;
            core.clock.reset();
        }

        if let TrackEnd::Errored(reason) = outcome {
            self.events.emit(&PlayerEvent::Error {
                entry: Some(entry.clone()),
                error: Arc::new(PlayerError::Playback(reason)),
            });
        }

        debug!("✔️ Terminó: {}", entry.title());
        self.events.emit(&PlayerEvent::FinishedPlaying { entry: Some(entry) });

        if self.playlist.is_empty() {
            self.continue_with_autoplaylist().await;
        }

        if matches!(self.state(), PlayerState::Playing | PlayerState::Paused) {
            if let Err(e) = self.play_next(true).await {
                debug!("No se pudo continuar la reproducción: {}", e);
            }
        }
    }

    /// Encola una canción de la autoplaylist si todo está inactivo. Las URLs
    /// rotas se quitan; si ninguna sirve, se desactiva.
    async fn continue_with_autoplaylist(&self) {
        {
            let mut core = self.core.lock();
            if !core.autoplaylist_enabled
                || core.state == PlayerState::Dead
                || core.current.is_some()
                || !self.playlist.is_empty()
            {
                return;
            }
            if core.autoplaylist.is_empty() {
                core.autoplaylist = self.autoplaylist.snapshot();
                if core.autoplaylist.is_empty() {
                    warn!("⚠️ La autoplaylist no tiene canciones, se desactiva");
                    core.autoplaylist_enabled = false;
                    return;
                }
                debug!("🔄 Working set de la autoplaylist recargado");
            }
        }

        loop {
            let url = {
                let mut core = self.core.lock();
                if core.state == PlayerState::Dead {
                    return;
                }
                pick(&mut core.autoplaylist, self.settings.autoplaylist_random)
            };
            let Some(url) = url else { break };

            match self.playlist.add_entry(&url, EntryOrigin::system()).await {
                Ok((entry, _)) => {
                    info!("📻 Autoplaylist: {}", entry.title());
                    return;
                }
                Err(PlayerError::Dead) => return,
                Err(e) => {
                    error!("❌ Error procesando \"{}\" de la autoplaylist: {}", url, e);
                    if matches!(e, PlayerError::Resolution(_)) {
                        self.autoplaylist.remove(&url, &e.to_string()).await;
                    }
                    self.events.emit(&PlayerEvent::Error {
                        entry: None,
                        error: Arc::new(e),
                    });
                }
            }
        }

        warn!("⚠️ Ninguna canción de la autoplaylist se pudo reproducir, se desactiva");
        self.core.lock().autoplaylist_enabled = false;
    }
}

/// Saca un candidato del working set
fn pick(working: &mut Vec<String>, random: bool) -> Option<String> {
    if working.is_empty() {
        return None;
    }
    let index = if random {
        rand::thread_rng().gen_range(0..working.len())
    } else {
        0
    };
    Some(working.remove(index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::entry::{EntryId, EntryKind, EntryParts, StreamRef},
        testing::{eventually, origin_for, player_with, wait_for_state, FakeSink, ScriptedResolver},
    };
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn without_autoplaylist() -> PlayerSettings {
        PlayerSettings {
            autoplaylist: false,
            ..PlayerSettings::default()
        }
    }

    fn record(player: &MusicPlayer, kinds: &[EventKind]) -> Arc<Mutex<Vec<EventKind>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        for &kind in kinds {
            let seen = seen.clone();
            player.on(kind, move |event| seen.lock().push(event.kind()));
        }
        seen
    }

    fn counter(player: &MusicPlayer, kind: EventKind) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        player.on(kind, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[tokio::test]
    async fn test_first_entry_starts_playback() {
        let sink = FakeSink::new();
        let player = player_with(ScriptedResolver::new(), sink.clone(), &[], PlayerSettings::default());
        let plays = counter(&player, EventKind::Play);

        let (_, position) = player
            .playlist()
            .add_entry("track-A", EntryOrigin::system())
            .await
            .unwrap();
        assert_eq!(position, 1);

        wait_for_state(&player, PlayerState::Playing).await;
        assert_eq!(player.current_entry().unwrap().title(), "track-A");
        assert_eq!(plays.load(Ordering::SeqCst), 1);
        assert_eq!(sink.played().len(), 1);
    }

    #[tokio::test]
    async fn test_finished_track_falls_back_to_autoplaylist() {
        let sink = FakeSink::new();
        let player = player_with(
            ScriptedResolver::new(),
            sink.clone(),
            &["https://ap.example/one"],
            PlayerSettings::default(),
        );
        let finished = counter(&player, EventKind::FinishedPlaying);

        player.playlist().add_entry("track-A", EntryOrigin::system()).await.unwrap();
        wait_for_state(&player, PlayerState::Playing).await;

        sink.finish_current();
        sink.wait_for_plays(2).await;

        assert_eq!(finished.load(Ordering::SeqCst), 1);
        let current = player.current_entry().unwrap();
        assert_eq!(current.url(), "https://ap.example/one");
        assert_eq!(current.requester(), None);
    }

    #[tokio::test]
    async fn test_finished_track_without_autoplaylist_stops() {
        let sink = FakeSink::new();
        let settings = PlayerSettings {
            autoplaylist: false,
            ..PlayerSettings::default()
        };
        let player = player_with(ScriptedResolver::new(), sink.clone(), &[], settings);
        let stops = counter(&player, EventKind::Stop);

        player.playlist().add_entry("track-A", EntryOrigin::system()).await.unwrap();
        wait_for_state(&player, PlayerState::Playing).await;

        sink.finish_current();
        wait_for_state(&player, PlayerState::Stopped).await;
        assert!(player.current_entry().is_none());
        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_forced_skip_ignores_vote_threshold() {
        let sink = FakeSink::new();
        let settings = PlayerSettings {
            skip_rules: SkipRules::new(4, 1.0),
            autoplaylist: false,
            ..PlayerSettings::default()
        };
        let player = player_with(ScriptedResolver::new(), sink.clone(), &[], settings);

        player.playlist().add_entry("track-A", EntryOrigin::system()).await.unwrap();
        player.playlist().add_entry("track-B", EntryOrigin::system()).await.unwrap();
        wait_for_state(&player, PlayerState::Playing).await;

        let outcome = player
            .skip(SkipRequest::Vote {
                voter: UserId::new(1),
                message: None,
                listeners: 10,
            })
            .unwrap();
        assert_eq!(outcome, SkipOutcome::Voted { votes: 1, required: 4 });

        let outcome = player.skip(SkipRequest::Force).unwrap();
        assert!(matches!(outcome, SkipOutcome::Skipped { ref entry } if entry.title() == "track-A"));

        sink.wait_for_plays(2).await;
        assert_eq!(player.current_entry().unwrap().title(), "track-B");
        // Los votos no pasan a la siguiente canción
        assert_eq!(player.skip_votes(), 0);
    }

    #[tokio::test]
    async fn test_vote_skip_counts_each_user_once() {
        let sink = FakeSink::new();
        let settings = PlayerSettings {
            skip_rules: SkipRules::new(4, 0.5),
            autoplaylist: false,
            ..PlayerSettings::default()
        };
        let player = player_with(ScriptedResolver::new(), sink.clone(), &[], settings);
        player.playlist().add_entry("track-A", EntryOrigin::system()).await.unwrap();
        wait_for_state(&player, PlayerState::Playing).await;

        let vote = |user| SkipRequest::Vote {
            voter: UserId::new(user),
            message: None,
            listeners: 4,
        };
        assert_eq!(player.skip(vote(1)).unwrap(), SkipOutcome::Voted { votes: 1, required: 2 });
        assert_eq!(player.skip(vote(1)).unwrap(), SkipOutcome::Voted { votes: 1, required: 2 });
        assert!(matches!(player.skip(vote(2)).unwrap(), SkipOutcome::Skipped { .. }));
    }

    #[tokio::test]
    async fn test_stop_clears_current_and_keeps_queue() {
        let sink = FakeSink::new();
        let player = player_with(ScriptedResolver::new(), sink.clone(), &[], PlayerSettings::default());
        player.playlist().add_entry("track-A", EntryOrigin::system()).await.unwrap();
        wait_for_state(&player, PlayerState::Playing).await;
        player.playlist().add_entry("track-B", EntryOrigin::system()).await.unwrap();

        player.stop().unwrap();
        assert_eq!(player.state(), PlayerState::Stopped);
        assert!(player.current_entry().is_none());
        assert_eq!(player.playlist().len(), 1);

        // La finalización del track detenido no avanza la cola
        tokio::task::yield_now().await;
        assert_eq!(player.state(), PlayerState::Stopped);
        assert_eq!(sink.played().len(), 1);
    }

    #[tokio::test]
    async fn test_pause_and_resume_transitions() {
        let sink = FakeSink::new();
        let player = player_with(ScriptedResolver::new(), sink.clone(), &[], PlayerSettings::default());
        assert!(matches!(player.pause(), Err(PlayerError::InvalidState { .. })));

        player.playlist().add_entry("track-A", EntryOrigin::system()).await.unwrap();
        wait_for_state(&player, PlayerState::Playing).await;

        player.pause().unwrap();
        assert_eq!(player.state(), PlayerState::Paused);
        assert!(sink.is_paused());

        player.play().await.unwrap();
        assert_eq!(player.state(), PlayerState::Playing);
        assert!(!sink.is_paused());
    }

    #[tokio::test]
    async fn test_kill_is_terminal_and_idempotent() {
        let sink = FakeSink::new();
        let player = player_with(ScriptedResolver::new(), sink.clone(), &[], PlayerSettings::default());
        player.playlist().add_entry("track-A", EntryOrigin::system()).await.unwrap();
        wait_for_state(&player, PlayerState::Playing).await;

        player.kill();
        player.kill();
        assert_eq!(player.state(), PlayerState::Dead);
        assert!(player.current_entry().is_none());
        assert_eq!(player.stop(), Err(PlayerError::Dead));
        assert!(player.resume().is_err());

        let err = player
            .playlist()
            .add_entry("track-B", origin_for(1))
            .await
            .unwrap_err();
        assert_eq!(err, PlayerError::Dead);
    }

    #[tokio::test]
    async fn test_broken_autoplaylist_urls_are_dropped() {
        let sink = FakeSink::new();
        let resolver = ScriptedResolver::new().failing("https://ap.example/broken");
        let settings = PlayerSettings {
            autoplaylist_random: false,
            ..PlayerSettings::default()
        };
        let player = player_with(
            resolver,
            sink.clone(),
            &["https://ap.example/broken", "https://ap.example/good"],
            settings,
        );
        let errors = counter(&player, EventKind::Error);

        player.start().await.unwrap();
        sink.wait_for_plays(1).await;

        assert_eq!(player.current_entry().unwrap().url(), "https://ap.example/good");
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(!player.autoplaylist.contains("https://ap.example/broken"));
    }

    #[tokio::test]
    async fn test_exhausted_autoplaylist_disables_itself() {
        let sink = FakeSink::new();
        let resolver = ScriptedResolver::new().failing("https://ap.example/broken");
        let player = player_with(resolver, sink.clone(), &["https://ap.example/broken"], PlayerSettings::default());

        player.start().await.unwrap();
        assert_eq!(player.state(), PlayerState::Stopped);
        assert!(!player.autoplaylist_enabled());

        player.reset_autoplaylist();
        assert!(player.autoplaylist_enabled());
    }

    #[tokio::test]
    async fn test_errored_track_counts_as_finished() {
        let sink = FakeSink::new();
        let player = player_with(ScriptedResolver::new(), sink.clone(), &[], without_autoplaylist());
        player.playlist().add_entry("track-A", EntryOrigin::system()).await.unwrap();
        player.playlist().add_entry("track-B", EntryOrigin::system()).await.unwrap();
        sink.wait_for_plays(1).await;

        let seen = record(
            &player,
            &[EventKind::Error, EventKind::FinishedPlaying, EventKind::Play],
        );
        sink.fail_current("decoder error");
        sink.wait_for_plays(2).await;

        assert_eq!(
            *seen.lock(),
            vec![EventKind::Error, EventKind::FinishedPlaying, EventKind::Play]
        );
        assert_eq!(player.current_entry().unwrap().title(), "track-B");
        assert_eq!(player.state(), PlayerState::Playing);
    }

    #[tokio::test]
    async fn test_sink_refusal_moves_on_to_next_entry() {
        let sink = FakeSink::new();
        sink.refuse_next_play("no voice connection");
        let player = player_with(ScriptedResolver::new(), sink.clone(), &[], without_autoplaylist());
        let errors = counter(&player, EventKind::Error);

        player.playlist().add_entry("track-A", EntryOrigin::system()).await.unwrap();
        player.playlist().add_entry("track-B", EntryOrigin::system()).await.unwrap();
        sink.wait_for_plays(1).await;

        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(sink.played(), vec![StreamRef::Local("/tmp/jukebox/track-B".into())]);
        assert_eq!(player.current_entry().unwrap().title(), "track-B");
        assert_eq!(player.state(), PlayerState::Playing);
    }

    #[tokio::test]
    async fn test_entry_queued_while_stopping_still_plays() {
        let sink = FakeSink::new();
        let player = player_with(ScriptedResolver::new(), sink.clone(), &[], without_autoplaylist());
        player.playlist().add_entry("track-A", EntryOrigin::system()).await.unwrap();
        sink.wait_for_plays(1).await;

        // Llega una canción cuando la cola vacía ya detuvo al reproductor,
        // sin un EntryAdded que lo vuelva a arrancar
        let playlist = player.playlist().clone();
        player.events().once(EventKind::Stop, move |_| {
            let parts = EntryParts {
                id: EntryId::next(),
                kind: EntryKind::Track,
                url: "track-B".to_string(),
                title: "track-B".to_string(),
                duration: None,
                extractor: None,
                origin: EntryOrigin::system(),
                added_at: Utc::now(),
            };
            playlist.restore([(parts, None)]).unwrap();
        });

        sink.finish_current();
        sink.wait_for_plays(2).await;
        assert_eq!(player.current_entry().unwrap().title(), "track-B");
        assert_eq!(player.state(), PlayerState::Playing);
    }

    #[tokio::test]
    async fn test_pause_between_entries_is_refused() {
        let sink = FakeSink::new();
        let resolver = ScriptedResolver::new()
            .live("https://radio.example/live")
            .hold_downloads();
        let player = player_with(resolver, sink.clone(), &[], without_autoplaylist());
        player
            .playlist()
            .add_entry("https://radio.example/live", EntryOrigin::system())
            .await
            .unwrap();
        sink.wait_for_plays(1).await;
        player.playlist().add_entry("track-B", EntryOrigin::system()).await.unwrap();

        // track-B nunca termina de descargarse
        sink.finish_current();
        eventually(|| player.current_entry().is_none()).await;
        assert_eq!(player.state(), PlayerState::Playing);

        assert!(matches!(player.pause(), Err(PlayerError::InvalidState { .. })));
        assert_eq!(player.state(), PlayerState::Playing);
        assert!(!sink.is_paused());
    }

    #[tokio::test]
    async fn test_volume_is_clamped_and_reaches_the_sink() {
        let sink = FakeSink::new();
        let player = player_with(ScriptedResolver::new(), sink.clone(), &[], without_autoplaylist());
        player.playlist().add_entry("track-A", EntryOrigin::system()).await.unwrap();
        sink.wait_for_plays(1).await;
        assert!((sink.volume() - 0.15).abs() < f32::EPSILON);

        assert_eq!(player.set_volume(1.7), 1.0);
        assert_eq!(sink.volume(), 1.0);
        assert_eq!(player.set_volume(-0.2), 0.0);
        assert_eq!(sink.volume(), 0.0);
    }

    #[tokio::test]
    async fn test_estimate_counts_queue_ahead_and_current_remaining() {
        let sink = FakeSink::new();
        let resolver = ScriptedResolver::new()
            .duration("track-A", 200)
            .duration("track-B", 100)
            .live("https://radio.example/live")
            .duration("track-C", 50);
        let player = player_with(resolver, sink.clone(), &[], PlayerSettings::default());
        let playlist = player.playlist().clone();

        playlist.add_entry("track-A", EntryOrigin::system()).await.unwrap();
        wait_for_state(&player, PlayerState::Playing).await;
        player.pause().unwrap();

        playlist.add_entry("track-B", EntryOrigin::system()).await.unwrap();
        playlist.add_entry("https://radio.example/live", EntryOrigin::system()).await.unwrap();
        playlist.add_entry("track-C", EntryOrigin::system()).await.unwrap();

        let eta = playlist.estimate_time_until(3, &player);
        // 100 de track-B, el stream no suma, y lo que falta de track-A
        assert!(eta > Duration::from_secs(299) && eta <= Duration::from_secs(300));
        assert!(playlist.estimate_time_until(1, &player) <= Duration::from_secs(200));
    }
}
