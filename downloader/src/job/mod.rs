use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub type JobId = u64;

/// Identifies a job inside one generation of the job table.
/// Every clear of the table starts a new generation, tickets of older generations never match a
/// record again even if the numeric id gets handed out a second time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobTicket {
    pub id: JobId,
    pub(crate) generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Starting,
    Downloading,
    Merging,
    Completed,
    Error,
}

impl JobStatus {
    /// Completed and Error are final, nothing but a clear touches the record afterwards.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }

    /// Whether a worker currently holds a job in this state.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobStatus::Starting | JobStatus::Downloading | JobStatus::Merging
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Queued => "Queued",
            JobStatus::Starting => "Starting",
            JobStatus::Downloading => "Downloading",
            JobStatus::Merging => "Merging",
            JobStatus::Completed => "Completed",
            JobStatus::Error => "Error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub url: String,
    pub status: JobStatus,
    /// Percentage in [0, 100]
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filepath: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobRecord {
    pub fn new(id: JobId, url: String) -> Self {
        Self {
            id,
            url,
            status: JobStatus::Queued,
            progress: 0.0,
            filename: None,
            filepath: None,
            error: None,
        }
    }
}

/// Point in time copy of the job table.
/// Field names follow the JSON the web front-end reads, `downloading` is the number of jobs
/// currently held by a worker and `queue` lists every record in submission order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub total: usize,
    pub completed: usize,
    pub downloading: usize,
    pub queue: Vec<JobRecord>,
}

impl Snapshot {
    pub fn job(&self, id: JobId) -> Option<&JobRecord> {
        self.queue.iter().find(|job| job.id == id)
    }
}
