pub mod config;
pub mod ytdlp;

use std::path::PathBuf;
use std::process::ExitStatus;

use async_trait::async_trait;

pub use self::config::YtDlpConfig;
pub use self::ytdlp::YtDlpFetcher;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to launch '{}': {}", .0.display(), .1)]
    Spawn(PathBuf, #[source] std::io::Error),
    #[error("File IO operation failed, error: '{0}'")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Failed(String),
    #[error("Downloader exited with {0}")]
    Exited(ExitStatus),
    #[error("Download finished but no output file was found")]
    NoOutputFile,
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPhase {
    Downloading,
    /// The raw transfer is done, merging or remuxing may still follow.
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchProgress {
    pub phase: FetchPhase,
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
}

impl FetchProgress {
    /// Percentage of the transfer, only known when the total size is.
    pub fn percent(&self) -> Option<f64> {
        match self.bytes_total {
            Some(total) if total > 0 => Some(self.bytes_done as f64 * 100.0 / total as f64),
            _ => None,
        }
    }
}

/// The operation that actually retrieves a media url.
/// `progress` may be called any number of times while the fetch runs, on success the absolute
/// path of the final file is returned.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, progress: &(dyn Fn(FetchProgress) + Send + Sync))
        -> Result<PathBuf>;
}
