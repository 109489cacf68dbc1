//! Share configuration.
//!
//! Loaded from TOML. Only the stream limits are hot-reloadable; the
//! watcher re-reads the file on change and mutates the shared
//! [`StreamLimits`] in place.
//!
//! ```toml
//! share_name = "kura"
//! temp_dir = "/var/tmp/kura"
//!
//! [limits]
//! client_download = 10485760   # bytes/second, omit for unlimited
//! client_upload = 5242880
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::limit::StreamLimits;

/// Stream limits in bytes per second. `None` means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    pub client_download: Option<u64>,
    pub client_upload: Option<u64>,
    pub server_download: Option<u64>,
    pub server_upload: Option<u64>,
}

/// Top-level share configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShareConfig {
    /// Name the protocol server exports the share under.
    pub share_name: String,
    /// Directory for staged upload scratch files.
    pub temp_dir: PathBuf,
    /// Stream rate limits.
    pub limits: LimitSettings,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            share_name: "kura".to_string(),
            temp_dir: std::env::temp_dir(),
            limits: LimitSettings::default(),
        }
    }
}

/// Error type for config operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),
}

impl ShareConfig {
    /// Parse a TOML document.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }
}

/// Handle to a running config watcher.
pub struct ConfigWatcherHandle {
    /// The watcher itself (keep alive to continue watching).
    _watcher: RecommendedWatcher,
    /// Sender to signal shutdown.
    shutdown_tx: tokio::sync::oneshot::Sender<()>,
}

impl ConfigWatcherHandle {
    /// Stop the watcher.
    pub fn stop(self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Watch `path` and re-apply its `[limits]` table whenever it changes.
///
/// The parent directory is watched rather than the file so editors that
/// replace the file on save are still picked up. Must be called from
/// within a tokio runtime.
pub fn watch_limits(
    path: impl Into<PathBuf>,
    limits: Arc<StreamLimits>,
) -> Result<ConfigWatcherHandle, ConfigError> {
    let path: PathBuf = path.into();
    let file_name = path.file_name().map(|n| n.to_os_string());
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let (tx, mut rx) = mpsc::channel::<()>(16);

    let mut watcher = RecommendedWatcher::new(
        move |result: Result<Event, notify::Error>| {
            let Ok(event) = result else { return };
            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                return;
            }
            let touches_config = event
                .paths
                .iter()
                .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
            if touches_config {
                let _ = tx.try_send(());
            }
        },
        notify::Config::default().with_poll_interval(Duration::from_millis(500)),
    )?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    tracing::info!("limit watcher shutting down");
                    break;
                }
                event = rx.recv() => {
                    if event.is_none() {
                        break;
                    }
                    match ShareConfig::load(&path) {
                        Ok(config) => {
                            limits.apply(&config.limits);
                            tracing::info!(path = %path.display(), limits = ?config.limits, "stream limits reloaded");
                        }
                        Err(e) => {
                            tracing::warn!(path = %path.display(), error = %e, "failed to reload stream limits");
                        }
                    }
                }
            }
        }
    });

    Ok(ConfigWatcherHandle {
        _watcher: watcher,
        shutdown_tx,
    })
}
