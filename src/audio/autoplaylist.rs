//! # Autoplaylist
//!
//! The fallback list played when a guild's queue runs dry. One
//! [`AutoPlaylist`] is shared by every guild as a read-mostly snapshot; each
//! player consumes its own working copy, so one guild's picks never change
//! another guild's order.
//!
//! The only write path is [`AutoPlaylist::remove`], taken when a URL turns
//! out to be unplayable. It is serialized by a dedicated lock, appends to the
//! removed-URL log and, when configured, rewrites the list file.

use anyhow::{Context, Result};
use chrono::Local;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};
use tracing::{debug, info, warn};

pub struct AutoPlaylist {
    urls: RwLock<Vec<String>>,
    source_file: Option<PathBuf>,
    removed_log: Option<PathBuf>,
    rewrite_on_removal: bool,
    write_lock: Mutex<()>,
}

impl AutoPlaylist {
    /// Lista en memoria, sin archivos asociados
    pub fn new(urls: Vec<String>) -> Self {
        Self {
            urls: RwLock::new(urls),
            source_file: None,
            removed_log: None,
            rewrite_on_removal: false,
            write_lock: Mutex::new(()),
        }
    }

    /// Reads the list from `source_file`. A missing file yields an empty list.
    pub async fn load(
        source_file: impl Into<PathBuf>,
        removed_log: impl Into<PathBuf>,
        rewrite_on_removal: bool,
    ) -> Result<Self> {
        let source_file = source_file.into();

        let urls = match fs::read_to_string(&source_file).await {
            Ok(contents) => Self::parse(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("⚠️ No existe {}, autoplaylist vacía", source_file.display());
                Vec::new()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("No se pudo leer {}", source_file.display()))
            }
        };

        info!("📜 Autoplaylist cargada: {} canciones", urls.len());
        Ok(Self {
            urls: RwLock::new(urls),
            source_file: Some(source_file),
            removed_log: Some(removed_log.into()),
            rewrite_on_removal,
            write_lock: Mutex::new(()),
        })
    }

    /// One URL per line. Blank lines and `#` comments are ignored.
    pub fn parse(contents: &str) -> Vec<String> {
        contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect()
    }

    /// Copia para el working set de un jugador
    pub fn snapshot(&self) -> Vec<String> {
        self.urls.read().clone()
    }

    pub fn len(&self) -> usize {
        self.urls.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.read().is_empty()
    }

    pub fn contains(&self, url: &str) -> bool {
        self.urls.read().iter().any(|u| u == url)
    }

    /// Permanently drops an unplayable URL. Returns false if it was already
    /// gone, in which case nothing is written.
    pub async fn remove(&self, url: &str, reason: &str) -> bool {
        let _guard = self.write_lock.lock().await;

        let remaining = {
            let mut urls = self.urls.write();
            let before = urls.len();
            urls.retain(|u| u != url);
            if urls.len() == before {
                debug!("La URL {} no está en la autoplaylist, se ignora", url);
                return false;
            }
            urls.clone()
        };

        info!("🗑️ Quitando de la autoplaylist: {}", url);

        if let Some(log) = &self.removed_log {
            if let Err(e) = append(log, &removal_record(url, reason)).await {
                warn!("No se pudo escribir {}: {:?}", log.display(), e);
            }
        }

        if self.rewrite_on_removal {
            if let Some(file) = &self.source_file {
                if let Err(e) = write_list(file, &remaining).await {
                    warn!("No se pudo actualizar {}: {:?}", file.display(), e);
                }
            }
        }

        true
    }

    /// Adds `url` to the list and its file. Returns false if already listed.
    pub async fn add(&self, url: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;

        {
            let mut urls = self.urls.write();
            if urls.iter().any(|u| u == url) {
                return Ok(false);
            }
            urls.push(url.to_string());
        }

        if let Some(file) = &self.source_file {
            append(file, &format!("{}\n", url))
                .await
                .with_context(|| format!("No se pudo escribir {}", file.display()))?;
        }

        info!("➕ Agregado a la autoplaylist: {}", url);
        Ok(true)
    }
}

fn removal_record(url: &str, reason: &str) -> String {
    // Alinea las líneas siguientes con "# Reason: "
    let reason = reason.replace('\n', &format!("\n#{}", " ".repeat(10)));
    format!(
        "# Entry removed {}\n# Reason: {}\n{}\n\n{}\n\n",
        Local::now().format("%a %b %e %H:%M:%S %Y"),
        reason,
        url,
        "#".repeat(32)
    )
}

async fn append(path: &Path, text: &str) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(text.as_bytes()).await?;
    file.flush().await
}

async fn write_list(path: &Path, urls: &[String]) -> std::io::Result<()> {
    let mut contents = urls.join("\n");
    contents.push('\n');
    fs::write(path, contents).await
}
