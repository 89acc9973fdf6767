//! Data directory layout: `settings.json` and the `jobs.db` ledger

use crate::error::FetchError;
use fetchq_types::Settings;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

const SETTINGS_FILE: &str = "settings.json";
const LEDGER_FILE: &str = "jobs.db";

/// Storage manager for fetchq data
#[derive(Clone, Debug)]
pub struct Storage {
    data_dir: PathBuf,
}

impl Storage {
    /// Create the data directory if needed
    pub async fn new(data_dir: PathBuf) -> Result<Self, FetchError> {
        fs::create_dir_all(&data_dir).await?;
        Ok(Self { data_dir })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_dir.join(SETTINGS_FILE)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join(LEDGER_FILE)
    }

    /// Load settings, falling back to defaults when the file is missing.
    /// The returned settings always point at this data directory.
    pub async fn load_settings(&self) -> Result<Settings, FetchError> {
        let path = self.settings_path();

        let mut settings = match fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str::<Settings>(&content)
                .map_err(|e| FetchError::Serialization(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No settings at {}, using defaults", path.display());
                Settings::default()
            }
            Err(e) => return Err(e.into()),
        };

        settings.data_dir = Some(self.data_dir.clone());
        Ok(settings)
    }

    pub async fn save_settings(&self, settings: &Settings) -> Result<(), FetchError> {
        let content = serde_json::to_string_pretty(settings)?;
        fs::write(self.settings_path(), content).await?;
        Ok(())
    }
}
