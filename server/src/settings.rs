use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dirs::home_dir;
use downloader::{ManagerConfig, YtDlpConfig};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, RwLockReadGuard};

pub const SETTINGS_ENV: &str = "MEDIAQ_SETTINGS";
pub const PORT_ENV: &str = "PORT";

fn default_download_dir() -> PathBuf {
    std::env::temp_dir().join("mediaq")
}

fn default_max_concurrent_downloads() -> usize {
    3
}

fn default_job_pacing_ms() -> u64 {
    200
}

fn default_bind_address() -> String {
    "0.0.0.0:5000".to_owned()
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct Settings {
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,
    #[serde(default = "default_job_pacing_ms")]
    pub job_pacing_ms: u64,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default)]
    pub fetcher: YtDlpConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            max_concurrent_downloads: default_max_concurrent_downloads(),
            job_pacing_ms: default_job_pacing_ms(),
            bind_address: default_bind_address(),
            fetcher: YtDlpConfig::default(),
        }
    }
}

impl Settings {
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            workers: self.max_concurrent_downloads.max(1),
            job_pacing: Duration::from_millis(self.job_pacing_ms),
        }
    }

    /// `bind_address` with its port replaced by `port` when given.
    pub fn listen_address(&self, port: Option<&str>) -> String {
        match port.map(str::trim).filter(|p| !p.is_empty()) {
            Some(port) => {
                let host = self
                    .bind_address
                    .rsplit_once(':')
                    .map(|(host, _)| host)
                    .unwrap_or(&self.bind_address);
                format!("{host}:{port}")
            }
            None => self.bind_address.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SettingManager {
    inner: Arc<RwLock<Settings>>,
    settings_path: PathBuf,
}

fn default_settings_path() -> PathBuf {
    if let Some(path) = std::env::var_os(SETTINGS_ENV) {
        return PathBuf::from(path);
    }
    home_dir().unwrap_or_default().join(".mediaq/settings.yaml")
}

impl SettingManager {
    /// Loads the settings file at `p`, falling back to `MEDIAQ_SETTINGS` and then
    /// `~/.mediaq/settings.yaml`. A missing file is created with the defaults.
    pub async fn load(p: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = p.unwrap_or_else(default_settings_path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Couldn't create {}", parent.display()))?;
        }
        let settings = load_settings(&path).await?;
        tokio::fs::create_dir_all(&settings.download_dir)
            .await
            .with_context(|| {
                format!(
                    "Couldn't create download directory {}",
                    settings.download_dir.display()
                )
            })?;
        Ok(Self {
            inner: Arc::new(RwLock::new(settings)),
            settings_path: path,
        })
    }

    pub async fn read(&self) -> RwLockReadGuard<Settings> {
        self.inner.read().await
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }
}

async fn load_settings(p: &Path) -> anyhow::Result<Settings> {
    if tokio::fs::try_exists(p).await.unwrap_or(false) {
        log::info!("Found settings file at {}, reading...", p.display());
        let file = tokio::fs::read_to_string(p)
            .await
            .with_context(|| format!("Couldn't read {}", p.display()))?;
        let settings: Settings = serde_yaml::from_str(&file)
            .with_context(|| format!("Invalid settings file {}", p.display()))?;
        log::info!("Settings loaded: {:?}", settings);
        return Ok(settings);
    }
    log::info!("No settings file found at {}, creating...", p.display());
    let settings = Settings::default();
    let settings_str = serde_yaml::to_string(&settings)?;
    tokio::fs::write(p, settings_str)
        .await
        .with_context(|| format!("Couldn't write {}", p.display()))?;
    Ok(settings)
}
