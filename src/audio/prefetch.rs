use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::{
    entry::{Entry, StreamRef},
    events::{EventBus, PlayerEvent},
};
use crate::{
    error::PlayerError,
    sources::{MediaResolver, ResolveOptions, ResolvedMedia},
};

/// Descargas en segundo plano de las entradas de un servidor.
///
/// Una entrada se descarga una sola vez. El resultado se publica en su
/// estado (`Ready` o `Failed`); los fallos además se emiten como evento
/// `Error`, nunca vuelven a quien encoló la canción.
pub struct Prefetcher {
    resolver: Arc<dyn MediaResolver>,
    permits: Arc<Semaphore>,
    events: Arc<EventBus>,
}

impl Prefetcher {
    /// `permits` is shared by every guild and bounds concurrent downloads.
    pub fn new(resolver: Arc<dyn MediaResolver>, permits: Arc<Semaphore>, events: Arc<EventBus>) -> Self {
        Self {
            resolver,
            permits,
            events,
        }
    }

    /// Starts the download of `entry` unless it already started or settled.
    /// Streams are ready from the start, so this is a no-op for them.
    pub fn prefetch(&self, entry: &Arc<Entry>) -> bool {
        if !entry.begin_download() {
            return false;
        }

        debug!("⬇️ Pre-descargando {}", entry);
        let entry = entry.clone();
        let resolver = self.resolver.clone();
        let permits = self.permits.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let cancel = entry.cancellation().clone();
            let outcome = tokio::select! {
                _ = cancel.cancelled() => None,
                outcome = download(resolver.as_ref(), &permits, &entry) => Some(outcome),
            };

            match outcome {
                None => {
                    debug!("🗑️ Descarga cancelada: {}", entry);
                    entry.mark_failed("entry was removed");
                }
                Some(Ok(source)) => {
                    info!("✅ Listo para reproducir: {}", entry.title());
                    entry.mark_ready(source);
                }
                Some(Err(reason)) => {
                    warn!("❌ Falló la descarga de {}: {}", entry, reason);
                    entry.mark_failed(reason.clone());
                    events.emit(&PlayerEvent::Error {
                        entry: Some(entry.clone()),
                        error: Arc::new(PlayerError::Prefetch {
                            title: entry.title().to_string(),
                            reason,
                        }),
                    });
                }
            }
        });

        true
    }
}

async fn download(
    resolver: &dyn MediaResolver,
    permits: &Semaphore,
    entry: &Entry,
) -> Result<StreamRef, String> {
    let _permit = permits.acquire().await.map_err(|e| e.to_string())?;

    match resolver.resolve(entry.url(), ResolveOptions::download()).await {
        Ok(ResolvedMedia::Track(meta)) => meta
            .stream
            .ok_or_else(|| "the resolver reported no playable source".to_string()),
        Ok(ResolvedMedia::Playlist { .. }) => Err("expected a single track, got a playlist".to_string()),
        Err(e) => Err(e.to_string()),
    }
}
