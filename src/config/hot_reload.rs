//! Configuration hot-reload functionality.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, RwLock};

use super::loader::load_and_validate;
use super::model::AppConfig;
use crate::error::ConfigError;

/// Watches the configuration file and triggers reloads on changes.
pub struct ConfigWatcher {
    config: Arc<RwLock<AppConfig>>,
    config_path: PathBuf,
    reload_tx: mpsc::Sender<ConfigReloadEvent>,
}

/// Events emitted by the configuration watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigReloadEvent {
    /// Configuration was successfully reloaded.
    Reloaded,
    /// Configuration reload failed; the previous configuration stays live.
    ValidationFailed { error_count: usize },
}

impl ConfigWatcher {
    /// Creates a new configuration watcher.
    pub fn new(
        config: Arc<RwLock<AppConfig>>,
        config_path: &Path,
        reload_tx: mpsc::Sender<ConfigReloadEvent>,
    ) -> Self {
        Self {
            config,
            config_path: config_path.to_path_buf(),
            reload_tx,
        }
    }

    /// Starts watching the configuration file for changes.
    ///
    /// The returned watcher must be kept alive for events to keep flowing.
    pub fn start(self) -> Result<RecommendedWatcher> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<notify::Event>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            },
            Config::default(),
        )
        .map_err(ConfigError::Watch)?;

        watcher
            .watch(&self.config_path, RecursiveMode::NonRecursive)
            .map_err(ConfigError::Watch)?;

        tokio::spawn(async move {
            self.handle_changes(rx).await;
        });

        Ok(watcher)
    }

    /// Handles file change events with debouncing.
    async fn handle_changes(self, mut rx: mpsc::UnboundedReceiver<notify::Event>) {
        let debounce_duration = Duration::from_millis(500);

        while let Some(event) = rx.recv().await {
            if !(event.kind.is_modify() || event.kind.is_create()) {
                continue;
            }

            // Wait for the write to settle, then drop the burst it produced
            tokio::time::sleep(debounce_duration).await;
            while rx.try_recv().is_ok() {}

            let outcome = match self.try_reload().await {
                Ok(()) => {
                    tracing::info!(path = %self.config_path.display(), "Configuration reloaded");
                    ConfigReloadEvent::Reloaded
                }
                Err(e) => {
                    let error_count = match e.downcast_ref::<ConfigError>() {
                        Some(ConfigError::ValidationFailed { error_count }) => *error_count,
                        _ => 1,
                    };
                    tracing::error!(error = %e, "Configuration reload failed, keeping previous configuration");
                    ConfigReloadEvent::ValidationFailed { error_count }
                }
            };

            if self.reload_tx.send(outcome).await.is_err() {
                break;
            }
        }

        tracing::warn!("Config watcher channel closed");
    }

    /// Attempts to reload and validate the configuration.
    async fn try_reload(&self) -> Result<()> {
        let new_config = load_and_validate(&self.config_path)?;

        let mut config = self.config.write().await;
        *config = new_config;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failed_reload_keeps_previous_config() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "recovery:\n  batch_size: 0\n").unwrap();

        let mut initial = AppConfig::default();
        initial.recovery.batch_size = 7;
        let config = Arc::new(RwLock::new(initial));
        let (tx, _rx) = mpsc::channel(1);

        let watcher = ConfigWatcher::new(config.clone(), file.path(), tx);
        assert!(watcher.try_reload().await.is_err());
        assert_eq!(config.read().await.recovery.batch_size, 7);

        std::fs::write(file.path(), "recovery:\n  batch_size: 20\n").unwrap();
        watcher.try_reload().await.unwrap();
        assert_eq!(config.read().await.recovery.batch_size, 20);
    }
}
