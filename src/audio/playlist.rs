use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serenity::model::id::{GuildId, UserId};
use std::{collections::VecDeque, sync::Arc, time::Duration};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    entry::{DownloadState, Entry, EntryKind, EntryOrigin, EntryParts, StreamRef},
    events::{EventBus, PlayerEvent},
    player::MusicPlayer,
    prefetch::Prefetcher,
};
use crate::{
    error::{PlayerError, ResolutionError},
    sources::{MediaResolver, ResolveOptions, ResolvedMedia, TrackMetadata},
};

/// Extractores que sirven audio en vivo aunque no lo declaren
const DIRECT_STREAM_EXTRACTORS: &[&str] = &["generic", "Dropbox"];

/// Cola de reproducción de un servidor.
///
/// Las mutaciones toman un lock corto y nunca esperan I/O con él tomado; la
/// resolución de metadatos ocurre antes de tocar la cola.
pub struct Playlist {
    guild_id: GuildId,
    entries: Mutex<VecDeque<Arc<Entry>>>,
    resolver: Arc<dyn MediaResolver>,
    prefetcher: Prefetcher,
    events: Arc<EventBus>,
    closed: CancellationToken,
}

impl Playlist {
    pub fn new(
        guild_id: GuildId,
        resolver: Arc<dyn MediaResolver>,
        download_permits: Arc<Semaphore>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            guild_id,
            entries: Mutex::new(VecDeque::new()),
            prefetcher: Prefetcher::new(resolver.clone(), download_permits, events.clone()),
            resolver,
            events,
            closed: CancellationToken::new(),
        }
    }

    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Resuelve y encola una canción; devuelve la posición (desde 1).
    /// Una playlist falla con `WrongEntryType`.
    pub async fn add_entry(
        &self,
        spec: &str,
        origin: EntryOrigin,
    ) -> Result<(Arc<Entry>, usize), PlayerError> {
        self.add_entry_with(spec, origin, |_| Ok(())).await
    }

    /// Como `add_entry`, filtrando la canción con `admit`
    pub async fn add_entry_with<F>(
        &self,
        spec: &str,
        origin: EntryOrigin,
        admit: F,
    ) -> Result<(Arc<Entry>, usize), PlayerError>
    where
        F: FnOnce(&TrackMetadata) -> Result<(), PlayerError>,
    {
        let meta = match self.resolve(spec, ResolveOptions::lookup()).await? {
            ResolvedMedia::Track(meta) => meta,
            ResolvedMedia::Playlist { url, .. } => {
                return Err(PlayerError::WrongEntryType {
                    url: spec.to_string(),
                    use_url: url,
                })
            }
        };

        let entry = if meta.is_live {
            debug!("📡 {} es una transmisión en vivo", meta.url);
            self.stream_entry(&meta, origin)
        } else {
            admit(&meta)?;
            Arc::new(Entry::track(&meta, origin, self.closed.child_token()))
        };

        let position = self.push(entry.clone())?;
        Ok((entry, position))
    }

    /// Queues a live source. Never prefetched, ready at once.
    ///
    /// URLs no extractor supports are taken as direct streams titled with the
    /// URL itself. A supported URL that is neither live nor a direct file
    /// fails with [`PlayerError::NotAStream`].
    pub async fn add_stream_entry(
        &self,
        spec: &str,
        origin: EntryOrigin,
    ) -> Result<Arc<Entry>, PlayerError> {
        let entry = match self.resolve(spec, ResolveOptions::lookup()).await {
            Ok(ResolvedMedia::Track(meta)) => {
                let direct = meta
                    .extractor
                    .as_deref()
                    .is_some_and(|e| DIRECT_STREAM_EXTRACTORS.contains(&e));
                if !meta.is_live && !direct {
                    return Err(PlayerError::NotAStream(spec.to_string()));
                }
                self.stream_entry(&meta, origin)
            }
            Ok(ResolvedMedia::Playlist { .. }) => {
                return Err(PlayerError::NotAStream(spec.to_string()))
            }
            Err(PlayerError::Resolution(ResolutionError::Unsupported { .. })) => {
                debug!("🔗 {} no tiene extractor, se reproduce directo", spec);
                Arc::new(Entry::stream(
                    spec.to_string(),
                    spec.to_string(),
                    StreamRef::Remote(spec.to_string()),
                    None,
                    origin,
                    self.closed.child_token(),
                ))
            }
            Err(e) => return Err(e),
        };

        self.push(entry.clone())?;
        Ok(entry)
    }

    /// Importa una playlist completa, saltando los elementos rotos
    pub async fn import_from(
        &self,
        spec: &str,
        origin: EntryOrigin,
    ) -> Result<(Vec<Arc<Entry>>, usize), PlayerError> {
        self.import_from_with(spec, origin, |_| Ok(()), |_| Ok(())).await
    }

    /// Like [`Playlist::import_from`]; items rejected by `admit` are skipped
    /// too. `accept` sees how many items survived and can refuse the whole
    /// batch before anything is queued.
    pub async fn import_from_with<F, A>(
        &self,
        spec: &str,
        origin: EntryOrigin,
        admit: F,
        accept: A,
    ) -> Result<(Vec<Arc<Entry>>, usize), PlayerError>
    where
        F: Fn(&TrackMetadata) -> Result<(), PlayerError>,
        A: FnOnce(usize) -> Result<(), PlayerError>,
    {
        let items = match self.resolve(spec, ResolveOptions::lookup()).await? {
            ResolvedMedia::Track(meta) => vec![Ok(meta)],
            ResolvedMedia::Playlist { items, .. } => items,
        };

        let total = items.len();
        let mut entries = Vec::with_capacity(total);
        for (index, item) in items.into_iter().enumerate() {
            let meta = match item {
                Ok(meta) => meta,
                Err(e) => {
                    warn!("⚠️ Se omite el elemento {} de {}: {}", index + 1, spec, e);
                    continue;
                }
            };

            if meta.is_live {
                entries.push(self.stream_entry(&meta, origin));
                continue;
            }
            if let Err(e) = admit(&meta) {
                debug!("Se omite {}: {}", meta.title, e);
                continue;
            }
            entries.push(Arc::new(Entry::track(&meta, origin, self.closed.child_token())));
        }

        if entries.is_empty() {
            return Err(PlayerError::NothingQueued {
                spec: spec.to_string(),
                skipped: total,
            });
        }
        accept(entries.len())?;

        let start = self.push_many(&entries)?;
        info!(
            "➕ Importadas {} de {} canciones desde {}",
            entries.len(),
            total,
            spec
        );
        Ok((entries, start))
    }

    /// Removes the entry at the 0-based `index`, cancelling its download.
    pub fn remove_at(&self, index: usize) -> Result<Arc<Entry>, PlayerError> {
        let (removed, head) = {
            let mut entries = self.entries.lock();
            let len = entries.len();
            let removed = entries.remove(index).ok_or(PlayerError::InvalidIndex {
                position: index + 1,
                len,
            })?;
            (removed, entries.front().cloned())
        };

        removed.cancel_prefetch();
        if index == 0 {
            self.prefetch_head(head);
        }
        info!("🗑️ Eliminado de la cola: {}", removed.title());
        Ok(removed)
    }

    /// Removes by the 1-based position users see.
    pub fn remove_position(&self, position: usize) -> Result<Arc<Entry>, PlayerError> {
        match position.checked_sub(1) {
            Some(index) => self.remove_at(index),
            None => Err(PlayerError::InvalidIndex {
                position,
                len: self.len(),
            }),
        }
    }

    /// Elimina todas las canciones de un usuario
    pub fn remove_all_by(&self, user: UserId) -> Vec<Arc<Entry>> {
        let (removed, head) = {
            let mut entries = self.entries.lock();
            let (removed, kept): (VecDeque<_>, VecDeque<_>) = entries
                .drain(..)
                .partition(|entry| entry.requester() == Some(user));
            *entries = kept;
            (removed, entries.front().cloned())
        };

        for entry in &removed {
            entry.cancel_prefetch();
        }
        self.prefetch_head(head);

        if !removed.is_empty() {
            info!("🗑️ Eliminadas {} canciones del usuario {}", removed.len(), user);
        }
        removed.into()
    }

    /// Limpia la cola
    pub fn clear(&self) -> usize {
        let removed: Vec<_> = self.entries.lock().drain(..).collect();
        for entry in &removed {
            entry.cancel_prefetch();
        }
        info!("🗑️ Cola limpiada ({} canciones)", removed.len());
        removed.len()
    }

    /// Mezcla la cola
    pub fn shuffle(&self) {
        let head = {
            let mut entries = self.entries.lock();
            entries.make_contiguous().shuffle(&mut rand::thread_rng());
            entries.front().cloned()
        };
        self.prefetch_head(head);
        info!("🔀 Cola mezclada");
    }

    /// Moves the entry at 0-based `from` to 0-based `to`.
    pub fn move_entry(&self, from: usize, to: usize) -> Result<Arc<Entry>, PlayerError> {
        let (moved, head) = {
            let mut entries = self.entries.lock();
            let len = entries.len();
            if to >= len {
                return Err(PlayerError::InvalidIndex {
                    position: to + 1,
                    len,
                });
            }
            let moved = entries.remove(from).ok_or(PlayerError::InvalidIndex {
                position: from + 1,
                len,
            })?;
            entries.insert(to, moved.clone());
            (moved, entries.front().cloned())
        };

        self.prefetch_head(head);
        info!("↕️ {} movida a la posición {}", moved.title(), to + 1);
        Ok(moved)
    }

    pub fn peek(&self) -> Option<Arc<Entry>> {
        self.entries.lock().front().cloned()
    }

    /// Canciones en cola pedidas por `user`
    pub fn count_for(&self, user: UserId) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.requester() == Some(user))
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn entries(&self) -> Vec<Arc<Entry>> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Wait before the entry at 1-based `position` starts: the durations
    /// queued ahead of it plus what is left of the current entry.
    ///
    /// Entries of unknown length, live streams included, add nothing, so the
    /// result is a lower bound.
    pub fn estimate_time_until(&self, position: usize, player: &MusicPlayer) -> Duration {
        let queued: Duration = self
            .entries
            .lock()
            .iter()
            .take(position.saturating_sub(1))
            .filter_map(|entry| entry.duration())
            .sum();

        queued + player.current_remaining()
    }

    /// Pops the head for playback and starts downloading it and the next
    /// entry.
    pub(crate) fn pop_next(&self) -> Option<Arc<Entry>> {
        let (next, head) = {
            let mut entries = self.entries.lock();
            let next = entries.pop_front();
            (next, entries.front().cloned())
        };

        if let Some(next) = &next {
            self.prefetcher.prefetch(next);
        }
        self.prefetch_head(head);
        next
    }

    /// Puts an entry back at the head without announcing it.
    pub(crate) fn requeue_front(&self, entry: Arc<Entry>) {
        self.entries.lock().push_front(entry);
    }

    /// Rebuilds saved entries at the back of the queue. Nothing is resolved
    /// or downloaded until playback reaches them.
    pub(crate) fn restore<I>(&self, saved: I) -> Result<usize, PlayerError>
    where
        I: IntoIterator<Item = (EntryParts, Option<StreamRef>)>,
    {
        if self.closed.is_cancelled() {
            return Err(PlayerError::Dead);
        }

        let restored: Vec<_> = saved
            .into_iter()
            .map(|(parts, destination)| {
                let state = match (parts.kind, destination) {
                    (EntryKind::Stream, Some(destination)) => DownloadState::Ready(destination),
                    (EntryKind::Stream, None) => {
                        DownloadState::Ready(StreamRef::Remote(parts.url.clone()))
                    }
                    (EntryKind::Track, _) => DownloadState::Pending,
                };
                Arc::new(Entry::new(parts, state, self.closed.child_token()))
            })
            .collect();

        let count = restored.len();
        self.entries.lock().extend(restored);
        debug!("♻️ Restauradas {} canciones en guild {}", count, self.guild_id);
        Ok(count)
    }

    /// Cancela descargas pendientes y rechaza nuevas canciones
    pub(crate) fn close(&self) {
        self.closed.cancel();
        self.entries.lock().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn stream_entry(&self, meta: &TrackMetadata, origin: EntryOrigin) -> Arc<Entry> {
        let destination = meta
            .stream
            .clone()
            .unwrap_or_else(|| StreamRef::Remote(meta.url.clone()));
        Arc::new(Entry::stream(
            meta.url.clone(),
            meta.title.clone(),
            destination,
            meta.extractor.clone(),
            origin,
            self.closed.child_token(),
        ))
    }

    /// Resolves `spec`, giving up as soon as the playlist is closed.
    async fn resolve(&self, spec: &str, options: ResolveOptions) -> Result<ResolvedMedia, PlayerError> {
        if self.closed.is_cancelled() {
            return Err(PlayerError::Dead);
        }

        tokio::select! {
            _ = self.closed.cancelled() => Err(PlayerError::Dead),
            resolved = self.resolver.resolve(spec, options) => resolved.map_err(PlayerError::from),
        }
    }

    fn push(&self, entry: Arc<Entry>) -> Result<usize, PlayerError> {
        self.push_many(std::slice::from_ref(&entry))
    }

    /// Appends in order and announces each entry. Returns the 1-based
    /// position of the first.
    fn push_many(&self, batch: &[Arc<Entry>]) -> Result<usize, PlayerError> {
        // Un reproductor muerto no revive por una resolución tardía
        if self.closed.is_cancelled() {
            return Err(PlayerError::Dead);
        }

        let (start, head) = {
            let mut entries = self.entries.lock();
            let start = entries.len() + 1;
            entries.extend(batch.iter().cloned());
            (start, entries.front().cloned())
        };

        self.prefetch_head(head);

        for (offset, entry) in batch.iter().enumerate() {
            info!("➕ Agregado a la cola: {} (posición {})", entry.title(), start + offset);
            self.events.emit(&PlayerEvent::EntryAdded {
                entry: entry.clone(),
                position: start + offset,
            });
        }
        Ok(start)
    }

    fn prefetch_head(&self, head: Option<Arc<Entry>>) {
        if let Some(head) = head {
            self.prefetcher.prefetch(&head);
        }
    }
}
