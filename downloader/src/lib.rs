pub mod fetch;
pub mod job;
pub mod manager;
pub mod observer;
pub mod util;

pub use fetch::{Fetcher, YtDlpConfig, YtDlpFetcher};
pub use job::{JobId, JobRecord, JobStatus, Snapshot};
pub use manager::{DownloadManager, ManagerConfig};
