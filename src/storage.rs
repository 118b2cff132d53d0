//! # Queue persistence
//!
//! Best-effort warm restart. Each guild's queue is dumped to
//! `<data_dir>/<guild_id>/queue.json` on playback events and on shutdown,
//! and read back when the guild's player is created again.
//!
//! Writes go to a temporary file first and are moved into place, so a crash
//! mid-write leaves the previous snapshot intact. Reads never fail: a
//! missing, unreadable or corrupt file simply means "no saved queue".

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{fs, sync::Mutex};
use tracing::{debug, info, warn};

use crate::{
    audio::{
        entry::{Entry, EntryId, EntryKind, EntryOrigin, EntryParts, StreamRef},
        player::MusicPlayer,
        playlist::Playlist,
    },
    error::PlayerError,
};

/// Versión del formato en disco
pub const SNAPSHOT_VERSION: u32 = 1;

/// One entry as stored on disk. Download progress is not kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub id: EntryId,
    pub kind: EntryKind,
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub duration_secs: Option<f64>,
    #[serde(default)]
    pub requester: Option<u64>,
    #[serde(default)]
    pub channel: Option<u64>,
    #[serde(default)]
    pub extractor: Option<String>,
    pub added_at: DateTime<Utc>,
    /// Stream entries only; tracks are downloaded again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<StreamRef>,
}

impl EntryRecord {
    pub fn from_entry(entry: &Entry) -> Self {
        Self {
            id: entry.id(),
            kind: entry.kind(),
            url: entry.url().to_string(),
            title: entry.title().to_string(),
            duration_secs: entry.duration().map(|d| d.as_secs_f64()),
            requester: entry.requester().map(|u| u.get()),
            channel: entry.channel().map(|c| c.get()),
            extractor: entry.extractor().map(str::to_string),
            added_at: entry.added_at(),
            destination: if entry.is_stream() { entry.stream_ref() } else { None },
        }
    }

    pub(crate) fn into_parts(self) -> (EntryParts, Option<StreamRef>) {
        let origin = EntryOrigin::new(
            self.requester.filter(|&id| id != 0).map(UserId::new),
            self.channel.filter(|&id| id != 0).map(ChannelId::new),
        );
        let parts = EntryParts {
            id: EntryId::restore(self.id.get()),
            kind: self.kind,
            url: self.url,
            title: self.title,
            duration: self
                .duration_secs
                .filter(|secs| secs.is_finite() && *secs > 0.0)
                .map(Duration::from_secs_f64),
            extractor: self.extractor,
            origin,
            added_at: self.added_at,
        };
        (parts, self.destination)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentRecord {
    pub entry: EntryRecord,
    pub progress_secs: f64,
}

/// Everything needed to rebuild a guild's queue and player settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub version: u32,
    pub guild_id: u64,
    pub volume: f32,
    pub karaoke_mode: bool,
    #[serde(default)]
    pub current: Option<CurrentRecord>,
    #[serde(default)]
    pub entries: Vec<EntryRecord>,
}

impl QueueSnapshot {
    pub fn capture(player: &MusicPlayer) -> Self {
        let current = player.current_entry().map(|entry| CurrentRecord {
            entry: EntryRecord::from_entry(&entry),
            progress_secs: player.progress().as_secs_f64(),
        });

        Self {
            version: SNAPSHOT_VERSION,
            guild_id: player.guild_id().get(),
            volume: player.volume(),
            karaoke_mode: player.karaoke_mode(),
            current,
            entries: player
                .playlist()
                .entries()
                .iter()
                .map(|entry| EntryRecord::from_entry(entry))
                .collect(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, PlayerError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// `None` when the bytes are not a snapshot this version understands.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match serde_json::from_slice::<Self>(bytes) {
            Ok(snapshot) if snapshot.version == SNAPSHOT_VERSION => Some(snapshot),
            Ok(snapshot) => {
                warn!("⚠️ Versión de cola desconocida: {}", snapshot.version);
                None
            }
            Err(e) => {
                warn!("⚠️ Cola guardada ilegible: {}", e);
                None
            }
        }
    }

    /// Number of entries that would be queued on restore.
    pub fn len(&self) -> usize {
        self.entries.len() + usize::from(self.current.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queues the saved entries, the interrupted one first.
    pub fn restore_into(self, playlist: &Playlist) -> Result<usize, PlayerError> {
        let records = self
            .current
            .map(|current| current.entry)
            .into_iter()
            .chain(self.entries);
        playlist.restore(records.map(EntryRecord::into_parts))
    }
}

/// Archivos por servidor bajo `data_dir`
pub struct QueueStore {
    data_dir: PathBuf,
    locks: DashMap<GuildId, Arc<Mutex<()>>>,
}

impl QueueStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            locks: DashMap::new(),
        }
    }

    pub fn queue_path(&self, guild_id: GuildId) -> PathBuf {
        self.data_dir.join(guild_id.to_string()).join("queue.json")
    }

    pub fn now_playing_path(&self, guild_id: GuildId) -> PathBuf {
        self.data_dir.join(guild_id.to_string()).join("current.txt")
    }

    /// Writes `bytes` atomically as the guild's saved queue.
    pub async fn save(&self, guild_id: GuildId, bytes: &[u8]) -> Result<(), PlayerError> {
        let lock = self.lock_for(guild_id);
        let _guard = lock.lock().await;

        let path = self.queue_path(guild_id);
        write_atomic(&path, bytes).await?;
        debug!("💾 Cola guardada para guild {} ({} bytes)", guild_id, bytes.len());
        Ok(())
    }

    /// Captures and saves `player`. Failures are logged and swallowed.
    pub async fn save_player(&self, player: &MusicPlayer) {
        let guild_id = player.guild_id();
        let result = match QueueSnapshot::capture(player).to_bytes() {
            Ok(bytes) => self.save(guild_id, &bytes).await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            warn!("⚠️ No se pudo guardar la cola de guild {}: {}", guild_id, e);
        }
    }

    /// Reads the guild's saved queue, or `None` if there is none usable.
    pub async fn load(&self, guild_id: GuildId) -> Option<QueueSnapshot> {
        let lock = self.lock_for(guild_id);
        let _guard = lock.lock().await;

        let path = self.queue_path(guild_id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Sin cola guardada para guild {}", guild_id);
                return None;
            }
            Err(e) => {
                warn!("⚠️ No se pudo leer {}: {}", path.display(), e);
                return None;
            }
        };

        let snapshot = QueueSnapshot::from_bytes(&bytes)?;
        info!("📂 Cola recuperada para guild {}: {} canciones", guild_id, snapshot.len());
        Some(snapshot)
    }

    /// Writes the current title to `current.txt`.
    pub async fn write_now_playing(&self, guild_id: GuildId, title: &str) -> Result<(), PlayerError> {
        let path = self.now_playing_path(guild_id);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        fs::write(&path, title).await?;
        Ok(())
    }

    /// Guilds with a saved queue on disk.
    pub async fn saved_guilds(&self) -> Vec<GuildId> {
        let mut guilds = Vec::new();
        let Ok(mut dirs) = fs::read_dir(&self.data_dir).await else {
            return guilds;
        };

        while let Ok(Some(dir)) = dirs.next_entry().await {
            let Some(id) = dir.file_name().to_str().and_then(|n| n.parse::<u64>().ok()) else {
                continue;
            };
            if id != 0 && fs::try_exists(dir.path().join("queue.json")).await.unwrap_or(false) {
                guilds.push(GuildId::new(id));
            }
        }
        guilds
    }

    fn lock_for(&self, guild_id: GuildId) -> Arc<Mutex<()>> {
        self.locks.entry(guild_id).or_default().clone()
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PlayerError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).await?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}
