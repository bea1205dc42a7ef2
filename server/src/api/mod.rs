use serde::{Deserialize, Serialize};

pub use downloader::{JobRecord, JobStatus, Snapshot};

/// Body of `POST /api/queue`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueRequest {
    #[serde(default)]
    pub urls: Vec<String>,
}

/// Body of every failed request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
}
