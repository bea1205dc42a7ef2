pub mod queue;
pub mod table;

mod pool;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use url::Url;

use crate::fetch::Fetcher;
use crate::job::{JobId, JobStatus, Snapshot};
use crate::observer::{DownloadObserver, Subscription};

use self::pool::Worker;
use self::queue::SubmissionQueue;
use self::table::JobTable;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No URLs provided")]
    EmptySubmission,
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("Job {0} not found")]
    NotFound(JobId),
    #[error("Job {id} is not ready for download, status: {status}")]
    NotReady { id: JobId, status: JobStatus },
    #[error("File not found: {}", .0.display())]
    FileMissing(PathBuf),
    #[error("Submission queue is closed")]
    QueueClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Number of workers, at least one is always started.
    pub workers: usize,
    /// Pause of a worker after each job it processed.
    pub job_pacing: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            job_pacing: Duration::from_millis(200),
        }
    }
}

/// File of a completed job, ready to be served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedFile {
    pub path: PathBuf,
    pub filename: String,
}

/// Owns the job table, the submission queue and the worker pool.
/// This struct is supposed to be cloned, it uses an Arc internally.
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<Inner>,
}

struct Inner {
    table: Arc<JobTable>,
    queue: SubmissionQueue,
    observer: DownloadObserver,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl DownloadManager {
    /// Starts the worker pool on the current tokio runtime.
    pub fn new(config: ManagerConfig, fetcher: Arc<dyn Fetcher>) -> Self {
        let table = Arc::new(JobTable::new());
        let queue = SubmissionQueue::new();
        let observer = DownloadObserver::new(table.clone());
        let count = config.workers.max(1);
        log::info!(
            "Starting {} workers, pacing {:?}",
            count,
            config.job_pacing
        );
        let workers = pool::spawn(
            count,
            Worker {
                id: 0,
                table: table.clone(),
                queue: queue.clone(),
                observer: observer.clone(),
                fetcher,
                pacing: config.job_pacing,
            },
        );
        Self {
            inner: Arc::new(Inner {
                table,
                queue,
                observer,
                workers: Mutex::new(workers),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.observer.subscribe()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.inner.table.snapshot()
    }

    /// Validates `urls`, inserts a Queued job per url and hands the jobs to the workers.
    /// Either every url is accepted or nothing is inserted. Fails with [`Error::QueueClosed`]
    /// once [`DownloadManager::shutdown`] was called.
    pub fn submit<I, S>(&self, urls: I) -> Result<Snapshot>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let urls = validate_urls(urls)?;
        if self.inner.stopped.load(Ordering::Acquire) {
            log::warn!("Rejected {} urls, the workers are shut down", urls.len());
            return Err(Error::QueueClosed);
        }
        let queue = &self.inner.queue;
        let mut closed = false;
        let tickets = self.inner.table.insert_many(urls, |ticket| {
            closed |= queue.enqueue(ticket).is_err();
        });
        self.inner.observer.publish();
        if closed {
            log::error!("Submission queue closed, {} jobs stay queued", tickets.len());
            return Err(Error::QueueClosed);
        }
        log::info!(
            "Queued {} jobs, ids {:?}",
            tickets.len(),
            tickets.iter().map(|t| t.id).collect::<Vec<_>>()
        );
        Ok(self.snapshot())
    }

    /// Looks up the output file of job `id`, only completed jobs have one.
    pub async fn file(&self, id: JobId) -> Result<CompletedFile> {
        let job = self.inner.table.get(id).ok_or(Error::NotFound(id))?;
        let (JobStatus::Completed, Some(path)) = (job.status, job.filepath) else {
            return Err(Error::NotReady {
                id,
                status: job.status,
            });
        };
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(Error::FileMissing(path));
        }
        let filename = job.filename.unwrap_or_else(|| {
            path.file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("job-{id}"))
        });
        Ok(CompletedFile { path, filename })
    }

    /// Drops every job and deletes the files of the dropped jobs.
    /// Jobs still being fetched keep running, their results are discarded.
    pub async fn clear(&self) -> Snapshot {
        let cleared = self.inner.table.clear();
        self.inner.observer.publish();
        let snapshot = self.snapshot();
        log::info!("Cleared {} jobs", cleared.len());
        for path in cleared.into_iter().filter_map(|job| job.filepath) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => log::debug!("Removed {}", path.display()),
                Err(e) => log::warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
        snapshot
    }

    /// Lets every worker finish what is already queued, then stops them.
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        let workers = std::mem::take(
            &mut *self
                .inner
                .workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        if workers.is_empty() {
            return;
        }
        log::info!("Shutting down {} workers", workers.len());
        for _ in 0..workers.len() {
            if let Err(e) = self.inner.queue.shutdown_one() {
                log::error!("Failed to stop worker: {}", e);
            }
        }
        for handle in workers {
            if let Err(e) = handle.await {
                log::error!("Worker task failed: {}", e);
            }
        }
    }
}

/// Trims every entry and drops blank ones. Anything that isn't an absolute http(s) url rejects
/// the whole batch.
pub fn validate_urls<I, S>(urls: I) -> Result<Vec<String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut valid = Vec::new();
    for entry in urls {
        let url = entry.as_ref().trim();
        if url.is_empty() {
            continue;
        }
        let invalid = |reason: String| Error::InvalidUrl {
            url: url.to_owned(),
            reason,
        };
        let parsed = Url::parse(url).map_err(|e| invalid(e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(invalid(format!("unsupported scheme '{}'", parsed.scheme())));
        }
        valid.push(url.to_owned());
    }
    if valid.is_empty() {
        return Err(Error::EmptySubmission);
    }
    Ok(valid)
}
