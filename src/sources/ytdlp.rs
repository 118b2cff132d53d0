use anyhow::Context;
use async_process::Command;
use async_trait::async_trait;
use serde::Deserialize;
use std::{path::PathBuf, time::Duration};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::{is_link, MediaResolver, ResolveOptions, ResolvedMedia, TrackMetadata};
use crate::{audio::entry::StreamRef, error::ResolutionError};

/// Resolver backed by the `yt-dlp` binary.
pub struct YtDlpResolver {
    binary: String,
    download_dir: PathBuf,
    // Limit concurrent yt-dlp processes to avoid rate limiting
    rate_limiter: Semaphore,
}

/// Fields of yt-dlp's JSON output we care about.
#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    id: Option<String>,
    title: Option<String>,
    duration: Option<f64>,
    webpage_url: Option<String>,
    url: Option<String>,
    extractor: Option<String>,
    ie_key: Option<String>,
    is_live: Option<bool>,
    #[serde(rename = "_type")]
    kind: Option<String>,
    #[serde(alias = "_filename")]
    filename: Option<String>,
    entries: Option<Vec<Option<YtDlpInfo>>>,
}

impl YtDlpResolver {
    pub fn new(binary: impl Into<String>, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            download_dir: download_dir.into(),
            rate_limiter: Semaphore::new(3),
        }
    }

    /// Checks that the binary runs, returning its version string.
    pub async fn version(&self) -> anyhow::Result<String> {
        let output = Command::new(&self.binary)
            .arg("--version")
            .output()
            .await
            .with_context(|| format!("could not run {}", self.binary))?;

        if !output.status.success() {
            anyhow::bail!("{} --version exited with {}", self.binary, output.status);
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn lookup_args(spec: &str) -> Vec<String> {
        if is_link(spec) {
            vec![
                "--dump-single-json".into(),
                "--flat-playlist".into(),
                "--no-warnings".into(),
                spec.into(),
            ]
        } else {
            vec![
                "--no-playlist".into(),
                "--dump-json".into(),
                "--no-warnings".into(),
                format!("ytsearch1:{}", spec),
            ]
        }
    }

    fn download_args(&self, spec: &str) -> Vec<String> {
        let template = self.download_dir.join("%(extractor)s-%(id)s.%(ext)s");
        vec![
            "--no-playlist".into(),
            "-f".into(),
            "bestaudio/best".into(),
            "--no-progress".into(),
            "--no-warnings".into(),
            "--print-json".into(),
            "-o".into(),
            template.to_string_lossy().into_owned(),
            spec.into(),
        ]
    }

    async fn run(&self, spec: &str, args: Vec<String>) -> Result<YtDlpInfo, ResolutionError> {
        let _permit = self
            .rate_limiter
            .acquire()
            .await
            .map_err(|e| ResolutionError::extraction(spec, e))?;

        // Si la descarga se cancela, yt-dlp muere con ella
        let output = Command::new(&self.binary)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ResolutionError::extraction(spec, format!("could not run yt-dlp: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(spec, &stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout
            .lines()
            .find(|line| !line.trim().is_empty())
            .ok_or_else(|| ResolutionError::Empty(spec.to_string()))?;

        serde_json::from_str(line)
            .map_err(|e| ResolutionError::extraction(spec, format!("unreadable yt-dlp output: {}", e)))
    }
}

#[async_trait]
impl MediaResolver for YtDlpResolver {
    async fn resolve(
        &self,
        spec: &str,
        options: ResolveOptions,
    ) -> Result<ResolvedMedia, ResolutionError> {
        if options.download {
            info!("⬇️ Descargando: {}", spec);
            let info = self.run(spec, self.download_args(spec)).await?;
            let mut meta = info_to_metadata(spec, &info);
            match info.filename {
                Some(path) => meta.stream = Some(StreamRef::Local(PathBuf::from(path))),
                None => {
                    warn!("⚠️ yt-dlp no reportó un archivo para {}, usando streaming", spec);
                }
            }
            return Ok(ResolvedMedia::Track(meta));
        }

        debug!("📊 Resolviendo: {}", spec);
        let info = self.run(spec, Self::lookup_args(spec)).await?;
        Ok(into_resolved(spec, info))
    }
}

fn classify_failure(spec: &str, stderr: &str) -> ResolutionError {
    if stderr.contains("Unsupported URL") {
        ResolutionError::Unsupported {
            spec: spec.to_string(),
        }
    } else {
        let reason = stderr
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("yt-dlp failed")
            .trim()
            .to_string();
        ResolutionError::Extraction {
            spec: spec.to_string(),
            reason,
        }
    }
}

fn into_resolved(spec: &str, info: YtDlpInfo) -> ResolvedMedia {
    if info.kind.as_deref() != Some("playlist") {
        return ResolvedMedia::Track(info_to_metadata(spec, &info));
    }

    let url = info
        .webpage_url
        .clone()
        .or_else(|| info.url.clone())
        .unwrap_or_else(|| spec.to_string());

    let items = info
        .entries
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(index, item)| match item {
            Some(item) => Ok(info_to_metadata(spec, &item)),
            None => Err(ResolutionError::Extraction {
                spec: format!("{} [item {}]", url, index + 1),
                reason: "entry is unavailable".to_string(),
            }),
        })
        .collect();

    ResolvedMedia::Playlist {
        url,
        title: info.title,
        items,
    }
}

fn info_to_metadata(spec: &str, info: &YtDlpInfo) -> TrackMetadata {
    let url = page_url(info).unwrap_or_else(|| spec.to_string());
    let title = info.title.clone().unwrap_or_else(|| "Untitled".to_string());

    let mut meta = TrackMetadata::new(url, title);
    meta.duration = info
        .duration
        .filter(|secs| secs.is_finite() && *secs > 0.0)
        .map(Duration::from_secs_f64);
    meta.extractor = info.extractor.clone().or_else(|| info.ie_key.clone());
    meta.is_live = info.is_live.unwrap_or(false);
    // On single lookups `url` is the direct media URL
    if info.webpage_url.is_some() {
        meta.stream = info.url.clone().map(StreamRef::Remote);
    }
    meta
}

/// Flat playlist items only carry `url` (sometimes a bare id) and `ie_key`.
fn page_url(info: &YtDlpInfo) -> Option<String> {
    if let Some(url) = &info.webpage_url {
        return Some(url.clone());
    }

    match (&info.url, info.ie_key.as_deref(), &info.id) {
        (Some(url), _, _) if is_link(url) => Some(url.clone()),
        (_, Some("Youtube"), Some(id)) => Some(format!("https://www.youtube.com/watch?v={}", id)),
        (Some(url), _, _) => Some(url.clone()),
        _ => None,
    }
}
