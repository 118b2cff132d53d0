//! Per-guild music queue and playback scheduler for Discord voice.
//!
//! Song requests are resolved through yt-dlp, queued per guild, downloaded
//! ahead of time and played through Songbird. Queues survive restarts.

pub mod audio;
pub mod bot;
pub mod cache;
pub mod config;
pub mod error;
pub mod sources;
pub mod storage;

#[cfg(test)]
mod testing;
