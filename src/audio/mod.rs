//! # Audio Module
//!
//! Per-guild playback scheduling.
//!
//! This module decides what plays next in each guild and drives the voice
//! connection through it:
//! - Queue management with prefetching of the next song
//! - A playback state machine with vote skipping and volume control
//! - Autoplaylist fallback when the queue runs dry
//! - Multi-guild operation through a registry of players
//!
//! ## Architecture
//!
//! ### [`entry`] - Queue entries
//! - Resolved songs and live streams, with their download state
//!
//! ### [`playlist`] - Queue Management
//! - Thread-safe queue operations for concurrent access
//! - Resolves requests, imports playlists, prefetches the head
//!
//! ### [`player`] - Music Player
//! - `Stopped`, `Playing`, `Paused` and the terminal `Dead`
//! - Hands ready entries to a [`sink::VoiceSink`] and advances on completion
//! - Emits events through an [`events::EventBus`]
//!
//! ### [`registry`] - Players per guild
//! - Get-or-create with queue restore, per-user request locks, quotas
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use guild_jukebox::audio::{entry::EntryOrigin, events::EventKind, player::MusicPlayer};
//! use std::sync::Arc;
//!
//! # async fn example(player: Arc<MusicPlayer>) -> anyhow::Result<()> {
//! player.on(EventKind::Play, |event| {
//!     if let Some(entry) = event.entry() {
//!         println!("Now playing {}", entry.title());
//!     }
//! });
//!
//! let (entry, position) = player
//!     .playlist()
//!     .add_entry("never gonna give you up", EntryOrigin::system())
//!     .await?;
//! println!("{} queued at {}", entry.title(), position);
//!
//! player.pause()?;
//! player.resume()?;
//! # Ok(())
//! # }
//! ```

pub mod autoplaylist;
pub mod entry;
pub mod events;
pub mod player;
pub mod playlist;
pub mod prefetch;
pub mod registry;
pub mod sink;
pub mod skip;
