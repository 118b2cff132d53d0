use parking_lot::RwLock;
use serenity::model::id::GuildId;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::debug;

use super::entry::Entry;
use crate::error::PlayerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Play,
    Resume,
    Pause,
    Stop,
    FinishedPlaying,
    EntryAdded,
    Error,
}

/// Lifecycle notification emitted by a guild's player or playlist.
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    Play {
        entry: Arc<Entry>,
    },
    Resume {
        entry: Arc<Entry>,
    },
    Pause {
        entry: Arc<Entry>,
    },
    Stop,
    FinishedPlaying {
        entry: Option<Arc<Entry>>,
    },
    EntryAdded {
        entry: Arc<Entry>,
        position: usize,
    },
    /// Background failure: a download, a decoder, an autoplaylist lookup.
    Error {
        entry: Option<Arc<Entry>>,
        error: Arc<PlayerError>,
    },
}

impl PlayerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            PlayerEvent::Play { .. } => EventKind::Play,
            PlayerEvent::Resume { .. } => EventKind::Resume,
            PlayerEvent::Pause { .. } => EventKind::Pause,
            PlayerEvent::Stop => EventKind::Stop,
            PlayerEvent::FinishedPlaying { .. } => EventKind::FinishedPlaying,
            PlayerEvent::EntryAdded { .. } => EventKind::EntryAdded,
            PlayerEvent::Error { .. } => EventKind::Error,
        }
    }

    pub fn entry(&self) -> Option<&Arc<Entry>> {
        match self {
            PlayerEvent::Play { entry }
            | PlayerEvent::Resume { entry }
            | PlayerEvent::Pause { entry }
            | PlayerEvent::EntryAdded { entry, .. } => Some(entry),
            PlayerEvent::FinishedPlaying { entry } | PlayerEvent::Error { entry, .. } => {
                entry.as_ref()
            }
            PlayerEvent::Stop => None,
        }
    }
}

pub type Listener = Arc<dyn Fn(&PlayerEvent) + Send + Sync>;

/// Listeners por tipo de evento. Corren en la tarea que emite y no deben
/// bloquear.
pub struct EventBus {
    guild_id: GuildId,
    listeners: RwLock<HashMap<EventKind, Vec<Listener>>>,
}

impl EventBus {
    pub fn new(guild_id: GuildId) -> Self {
        Self {
            guild_id,
            listeners: RwLock::new(HashMap::new()),
        }
    }

    /// Registra un listener, encadenable
    pub fn on<F>(&self, kind: EventKind, listener: F) -> &Self
    where
        F: Fn(&PlayerEvent) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .entry(kind)
            .or_default()
            .push(Arc::new(listener));
        self
    }

    /// Like [`EventBus::on`], but the listener fires at most once.
    pub fn once<F>(&self, kind: EventKind, listener: F) -> &Self
    where
        F: Fn(&PlayerEvent) + Send + Sync + 'static,
    {
        let fired = AtomicBool::new(false);
        self.on(kind, move |event| {
            if !fired.swap(true, Ordering::AcqRel) {
                listener(event);
            }
        })
    }

    pub fn emit(&self, event: &PlayerEvent) {
        let kind = event.kind();
        // Clone the list so listeners may register more listeners
        let listeners = match self.listeners.read().get(&kind) {
            Some(listeners) => listeners.clone(),
            None => return,
        };

        debug!(
            "guild {}: {:?} -> {} listener(s)",
            self.guild_id,
            kind,
            listeners.len()
        );
        for listener in listeners {
            listener(event);
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.read().get(&kind).map_or(0, Vec::len)
    }

    pub fn clear(&self) {
        self.listeners.write().clear();
    }
}
