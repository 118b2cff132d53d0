//! # Voice sink
//!
//! The player never touches songbird directly. It drives a [`VoiceSink`],
//! which plays one source at a time and reports how that playback ended
//! through a oneshot channel. [`SongbirdSink`] wraps a songbird [`Call`].

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use songbird::{
    input::{File, HttpRequest, Input},
    tracks::{PlayMode, TrackHandle, TrackResult},
    Call, Event, EventContext, EventHandler as VoiceEventHandler, TrackEvent,
};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, warn};

use super::entry::StreamRef;
use crate::error::PlayerError;

/// How a playback ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackEnd {
    /// Reached the end of the source or was stopped.
    Finished,
    /// The decoder or the connection failed mid-stream.
    Errored(String),
}

/// Salida de audio de un servidor. El final del track llega por `done`.
#[async_trait]
pub trait VoiceSink: Send + Sync {
    async fn play(
        &self,
        source: &StreamRef,
        volume: f32,
        done: oneshot::Sender<TrackEnd>,
    ) -> Result<(), PlayerError>;

    fn pause(&self);

    fn resume(&self);

    /// Ends the current playback. The pending `done` fires with `Finished`.
    fn stop(&self);

    fn set_volume(&self, volume: f32);
}

type DoneSlot = Arc<SyncMutex<Option<oneshot::Sender<TrackEnd>>>>;

pub struct SongbirdSink {
    call: Arc<Mutex<Call>>,
    http: reqwest::Client,
    current: SyncMutex<Option<TrackHandle>>,
}

impl SongbirdSink {
    pub fn new(call: Arc<Mutex<Call>>, http: reqwest::Client) -> Self {
        Self {
            call,
            http,
            current: SyncMutex::new(None),
        }
    }

    fn input_for(&self, source: &StreamRef) -> Input {
        match source {
            StreamRef::Local(path) => Input::from(File::new(path.clone())),
            StreamRef::Remote(url) => Input::from(HttpRequest::new(self.http.clone(), url.clone())),
        }
    }

    fn with_current(&self, action: &str, f: impl FnOnce(&TrackHandle) -> TrackResult<()>) {
        if let Some(track) = self.current.lock().as_ref() {
            if let Err(e) = f(track) {
                debug!("No se pudo {} el track: {:?}", action, e);
            }
        }
    }
}

#[async_trait]
impl VoiceSink for SongbirdSink {
    async fn play(
        &self,
        source: &StreamRef,
        volume: f32,
        done: oneshot::Sender<TrackEnd>,
    ) -> Result<(), PlayerError> {
        let input = self.input_for(source);

        let track = {
            let mut call = self.call.lock().await;
            // Un solo track activo por llamada
            call.stop();
            call.play_input(input)
        };

        if let Err(e) = track.set_volume(volume) {
            warn!("No se pudo ajustar el volumen: {:?}", e);
        }

        let slot: DoneSlot = Arc::new(SyncMutex::new(Some(done)));
        for event in [TrackEvent::End, TrackEvent::Error] {
            track
                .add_event(Event::Track(event), TrackEndHandler { slot: slot.clone() })
                .map_err(|e| PlayerError::Playback(format!("no se pudo registrar el handler: {}", e)))?;
        }

        info!("🔊 Enviando audio a songbird: {}", source);
        *self.current.lock() = Some(track);
        Ok(())
    }

    fn pause(&self) {
        self.with_current("pausar", |track| track.pause());
    }

    fn resume(&self) {
        self.with_current("reanudar", |track| track.play());
    }

    fn stop(&self) {
        self.with_current("detener", |track| track.stop());
        self.current.lock().take();
    }

    fn set_volume(&self, volume: f32) {
        self.with_current("ajustar volumen de", |track| track.set_volume(volume));
    }
}

/// Handler para cuando termina una canción
struct TrackEndHandler {
    slot: DoneSlot,
}

#[async_trait]
impl VoiceEventHandler for TrackEndHandler {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let outcome = match ctx {
            EventContext::Track(tracks) => match tracks.first() {
                Some((state, _)) if matches!(state.playing, PlayMode::Errored(_)) => {
                    TrackEnd::Errored(format!("{:?}", state.playing))
                }
                _ => TrackEnd::Finished,
            },
            _ => TrackEnd::Finished,
        };

        if let TrackEnd::Errored(reason) = &outcome {
            error!("❌ Error de reproducción: {}", reason);
        } else {
            debug!("Track terminado");
        }

        // End y Error pueden llegar los dos; gana el primero
        if let Some(done) = self.slot.lock().take() {
            let _ = done.send(outcome);
        }
        None
    }
}
