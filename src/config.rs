use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord
    pub discord_token: String,

    // Paths
    pub data_dir: PathBuf,
    pub audio_cache_dir: PathBuf,
    pub ytdlp_path: String,

    // Reproducción
    pub default_volume: f32,
    pub skips_required: usize,
    pub skip_ratio_required: f64,
    /// Quien pidió la canción puede saltarla sin votación
    pub allow_author_skip: bool,
    /// Todo /skip intenta saltar sin votación
    pub legacy_skip: bool,

    // Límites (0 = sin límite)
    pub max_songs_per_user: usize,
    pub max_song_duration: u64, // En segundos
    pub max_concurrent_downloads: usize,
    pub connect_timeout: u64, // En segundos

    // Autoplaylist
    pub auto_playlist: bool,
    pub auto_playlist_random: bool,
    pub auto_playlist_file: PathBuf,
    pub remove_from_ap_on_error: bool,

    // Features
    pub auto_pause: bool,
    pub persistent_queue: bool,
    pub write_current_song: bool,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            // Discord
            discord_token: std::env::var("DISCORD_TOKEN").context("DISCORD_TOKEN no está definido")?,

            // Paths
            data_dir: env_or("DATA_DIR", "data")?,
            audio_cache_dir: env_or("AUDIO_CACHE_DIR", "audio_cache")?,
            ytdlp_path: env_or("YTDLP_PATH", "yt-dlp")?,

            // Reproducción
            default_volume: env_or("DEFAULT_VOLUME", "0.15")?,
            skips_required: env_or("SKIPS_REQUIRED", "4")?,
            skip_ratio_required: env_or("SKIP_RATIO", "0.5")?,
            allow_author_skip: env_or("ALLOW_AUTHOR_SKIP", "true")?,
            legacy_skip: env_or("LEGACY_SKIP", "false")?,

            // Límites
            max_songs_per_user: env_or("MAX_SONGS_PER_USER", "0")?,
            max_song_duration: env_or("MAX_SONG_DURATION", "0")?,
            max_concurrent_downloads: match std::env::var("MAX_CONCURRENT_DOWNLOADS") {
                Ok(val) if !val.trim().is_empty() => val
                    .trim()
                    .parse()
                    .context("MAX_CONCURRENT_DOWNLOADS inválido")?,
                _ => num_cpus::get().min(4),
            },
            connect_timeout: env_or("CONNECT_TIMEOUT", "60")?,

            // Autoplaylist
            auto_playlist: env_or("AUTO_PLAYLIST", "true")?,
            auto_playlist_random: env_or("AUTO_PLAYLIST_RANDOM", "true")?,
            auto_playlist_file: env_or("AUTO_PLAYLIST_FILE", "config/autoplaylist.txt")?,
            remove_from_ap_on_error: env_or("REMOVE_FROM_AP_ON_ERROR", "true")?,

            // Features
            auto_pause: env_or("AUTO_PAUSE", "true")?,
            persistent_queue: env_or("PERSISTENT_QUEUE", "true")?,
            write_current_song: env_or("WRITE_CURRENT_SONG", "false")?,
        };

        // Create directories if they don't exist
        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(&config.audio_cache_dir)?;

        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Volume must be between 0.0 and 1.0
    /// - At least one skip vote is required, and the ratio is in (0.0, 1.0]
    /// - At least one download may run at a time
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.default_volume) {
            anyhow::bail!("Default volume must be between 0.0 and 1.0, got: {}", self.default_volume);
        }

        if self.skips_required == 0 {
            anyhow::bail!("SKIPS_REQUIRED must be greater than 0");
        }

        if !(self.skip_ratio_required > 0.0 && self.skip_ratio_required <= 1.0) {
            anyhow::bail!("SKIP_RATIO must be in (0.0, 1.0], got: {}", self.skip_ratio_required);
        }

        if self.max_concurrent_downloads == 0 {
            anyhow::bail!("MAX_CONCURRENT_DOWNLOADS must be greater than 0");
        }

        if self.connect_timeout == 0 {
            anyhow::bail!("CONNECT_TIMEOUT must be greater than 0");
        }

        Ok(())
    }

    /// Where unplayable autoplaylist URLs are logged: the autoplaylist file
    /// name with `_removed` before the extension.
    pub fn autoplaylist_removed_file(&self) -> PathBuf {
        removed_file_for(&self.auto_playlist_file)
    }

    pub fn max_song_length(&self) -> Option<Duration> {
        (self.max_song_duration > 0).then(|| Duration::from_secs(self.max_song_duration))
    }

    pub fn max_songs(&self) -> Option<usize> {
        (self.max_songs_per_user > 0).then_some(self.max_songs_per_user)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// The token is never included.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Audio: {}% vol, skips {} / {:.0}% (author skip={}, legacy={})\n  \
            Limits: {} songs/user, {} max duration, {} downloads\n  \
            Autoplaylist: {} (random={}, remove on error={}) from {}\n  \
            Features: auto-pause={}, persistent queue={}, now playing file={}\n  \
            Paths: data {}, audio {}",
            (self.default_volume * 100.0) as u32,
            self.skips_required,
            self.skip_ratio_required * 100.0,
            self.allow_author_skip,
            self.legacy_skip,
            self.max_songs().map_or("∞".to_string(), |n| n.to_string()),
            self.max_song_length()
                .map_or("∞".to_string(), |d| humantime::format_duration(d).to_string()),
            self.max_concurrent_downloads,
            self.auto_playlist,
            self.auto_playlist_random,
            self.remove_from_ap_on_error,
            self.auto_playlist_file.display(),
            self.auto_pause,
            self.persistent_queue,
            self.write_current_song,
            self.data_dir.display(),
            self.audio_cache_dir.display(),
        )
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        Self {
            // Discord (no defaults - must be provided)
            discord_token: String::new(),

            // Path defaults
            data_dir: "data".into(),
            audio_cache_dir: "audio_cache".into(),
            ytdlp_path: "yt-dlp".into(),

            // Playback defaults
            default_volume: 0.15,
            skips_required: 4,
            skip_ratio_required: 0.5,
            allow_author_skip: true,
            legacy_skip: false,

            // Limit defaults
            max_songs_per_user: 0,
            max_song_duration: 0,
            max_concurrent_downloads: num_cpus::get().min(4),
            connect_timeout: 60,

            // Autoplaylist defaults
            auto_playlist: true,
            auto_playlist_random: true,
            auto_playlist_file: "config/autoplaylist.txt".into(),
            remove_from_ap_on_error: true,

            // Feature defaults
            auto_pause: true,
            persistent_queue: true,
            write_current_song: false,
        }
    }
}

fn env_or<T>(key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = std::env::var(key).unwrap_or_else(|_| default.to_string());
    raw.trim()
        .parse()
        .with_context(|| format!("{} inválido: {:?}", key, raw))
}

fn removed_file_for(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "autoplaylist".to_string());
    let name = match path.extension() {
        Some(ext) => format!("{}_removed.{}", stem, ext.to_string_lossy()),
        None => format!("{}_removed", stem),
    };
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_songs(), None);
        assert_eq!(config.max_song_length(), None);
    }

    #[test]
    fn test_removed_file_sits_next_to_the_autoplaylist() {
        let config = Config::default();
        assert_eq!(
            config.autoplaylist_removed_file(),
            PathBuf::from("config/autoplaylist_removed.txt")
        );
        assert_eq!(removed_file_for(Path::new("lists/ap")), PathBuf::from("lists/ap_removed"));
    }

    #[test]
    fn test_validation_rejects_out_of_range_values() {
        let config = Config {
            default_volume: 1.5,
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            skip_ratio_required: 0.0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_summary_hides_the_token() {
        let config = Config {
            discord_token: "secret-token".into(),
            max_song_duration: 600,
            ..Config::default()
        };
        let summary = config.summary();
        assert!(!summary.contains("secret-token"));
        assert!(summary.contains("10m"));
    }
}
