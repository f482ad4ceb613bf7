//! Process-wide log sink: stdout plus an append-only numbered log file.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use psvd_storage::ArtifactStore;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::PipelineConfig;

/// Owns the active subscriber for the lifetime of the process run. Dropping it
/// uninstalls the subscriber and closes the log file.
pub struct LoggerHandle {
    log_path: Option<PathBuf>,
    _guard: DefaultGuard,
}

impl LoggerHandle {
    /// Allocates `logs/log_<n>.txt` (when logging is enabled) and installs a
    /// subscriber writing to stdout and that file. Must be created on the
    /// thread that drives the pipeline.
    pub async fn install(config: &PipelineConfig, store: &ArtifactStore) -> anyhow::Result<Self> {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let stdout_layer = fmt::layer().with_target(false).with_writer(std::io::stdout);

        let (file_layer, log_path) = if config.enable_logging {
            let path = store
                .allocate_numbered_path(&config.logs_dir, "log", "txt")
                .await?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            let layer = fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file));
            (Some(layer), Some(path))
        } else {
            (None, None)
        };

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(stdout_layer)
            .with(file_layer);
        let guard = tracing::subscriber::set_default(subscriber);

        Ok(Self {
            log_path,
            _guard: guard,
        })
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test(flavor = "current_thread")]
    async fn log_lines_land_in_a_numbered_file() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        std::fs::create_dir_all(dir.path().join("logs")).unwrap();
        std::fs::write(dir.path().join("logs/log_0.txt"), "earlier run\n").unwrap();

        let config = PipelineConfig::defaults(dir.path());
        let handle = LoggerHandle::install(&config, &store).await.unwrap();
        assert_eq!(handle.log_path(), Some(dir.path().join("logs/log_1.txt").as_path()));

        tracing::info!("Attempting to load in data...");
        drop(handle);

        let text = std::fs::read_to_string(dir.path().join("logs/log_1.txt")).unwrap();
        assert!(text.contains("INFO"));
        assert!(text.contains("Attempting to load in data..."));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn disabled_logging_creates_no_file() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let mut config = PipelineConfig::defaults(dir.path());
        config.enable_logging = false;

        let handle = LoggerHandle::install(&config, &store).await.unwrap();
        assert!(handle.log_path().is_none());
        assert!(!dir.path().join("logs").exists());
    }
}
