use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::job::{JobId, JobRecord, JobStatus, JobTicket, Snapshot};

/// State change requested by a worker for the job it holds.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Download progress in percent, only carried when the total size is known.
    Downloading(f64),
    /// Raw transfer finished, merging/remuxing may follow.
    Merging,
    Completed(PathBuf),
    Failed(String),
}

#[derive(Debug)]
struct Inner {
    generation: u64,
    next_id: JobId,
    jobs: Vec<JobRecord>,
    total: usize,
    completed: usize,
    active: usize,
}

impl Default for Inner {
    fn default() -> Self {
        Inner {
            generation: 0,
            next_id: 1,
            jobs: Vec::new(),
            total: 0,
            completed: 0,
            active: 0,
        }
    }
}

impl Inner {
    fn insert(&mut self, url: String) -> JobTicket {
        let id = self.next_id;
        self.next_id += 1;
        self.jobs.push(JobRecord::new(id, url));
        self.total += 1;
        JobTicket {
            id,
            generation: self.generation,
        }
    }

    fn find_mut(&mut self, ticket: JobTicket) -> Option<&mut JobRecord> {
        if ticket.generation != self.generation {
            return None;
        }
        // ids are handed out in increasing order, so the vector stays sorted by id
        let idx = self
            .jobs
            .binary_search_by_key(&ticket.id, |job| job.id)
            .ok()?;
        self.jobs.get_mut(idx)
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            total: self.total,
            completed: self.completed,
            downloading: self.active,
            queue: self.jobs.clone(),
        }
    }
}

/// Shared table of every submitted job and the aggregate counters.
/// A single lock guards records and counters, it is only ever held for the in-memory update and
/// never across an await point.
#[derive(Debug, Default)]
pub struct JobTable {
    inner: Mutex<Inner>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // the critical sections never leave the table half-updated, a poisoned lock is still usable
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a Queued record for `url` and returns its ticket.
    pub fn insert(&self, url: impl Into<String>) -> JobTicket {
        self.lock().insert(url.into())
    }

    /// Inserts all `urls` under one lock acquisition, `on_insert` sees each ticket before the lock
    /// is released so whatever it enqueues ends up in id order.
    pub fn insert_many<I, F>(&self, urls: I, mut on_insert: F) -> Vec<JobTicket>
    where
        I: IntoIterator<Item = String>,
        F: FnMut(JobTicket),
    {
        let mut inner = self.lock();
        urls.into_iter()
            .map(|url| {
                let ticket = inner.insert(url);
                on_insert(ticket);
                ticket
            })
            .collect()
    }

    /// Moves a Queued job to Starting and returns the url the worker has to fetch.
    /// Returns None when the ticket is stale or the job was already claimed.
    pub fn claim(&self, ticket: JobTicket) -> Option<String> {
        let mut inner = self.lock();
        let job = inner.find_mut(ticket)?;
        if job.status != JobStatus::Queued {
            return None;
        }
        job.status = JobStatus::Starting;
        let url = job.url.clone();
        inner.active += 1;
        Some(url)
    }

    /// Applies `transition` to the job behind `ticket`.
    /// Returns true if the record changed. Unknown or stale tickets and transitions the state
    /// machine doesn't allow are ignored.
    pub fn mutate(&self, ticket: JobTicket, transition: Transition) -> bool {
        let mut inner = self.lock();
        let Some(job) = inner.find_mut(ticket) else {
            return false;
        };
        let held = job.status.is_active();
        let changed = apply(job, transition);
        let status = job.status;
        if held && status.is_terminal() {
            inner.active -= 1;
            if status == JobStatus::Completed {
                inner.completed += 1;
            }
        }
        changed
    }

    pub fn get(&self, id: JobId) -> Option<JobRecord> {
        self.lock().jobs.iter().find(|job| job.id == id).cloned()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.lock().snapshot()
    }

    /// Removes every record, resets the counters and the id allocator and starts a new generation.
    /// The removed records are returned so the caller can delete their files outside the lock.
    pub fn clear(&self) -> Vec<JobRecord> {
        let mut inner = self.lock();
        let generation = inner.generation + 1;
        let cleared = std::mem::take(&mut inner.jobs);
        *inner = Inner {
            generation,
            ..Inner::default()
        };
        cleared
    }
}

fn clamp_progress(value: f64) -> Option<f64> {
    if value.is_finite() {
        Some(value.clamp(0.0, 100.0))
    } else {
        None
    }
}

fn apply(job: &mut JobRecord, transition: Transition) -> bool {
    use JobStatus::*;
    match (job.status, transition) {
        (Starting, Transition::Downloading(pct)) => {
            let Some(pct) = clamp_progress(pct) else {
                return false;
            };
            job.status = Downloading;
            job.progress = job.progress.max(pct);
            true
        }
        (Downloading, Transition::Downloading(pct)) => match clamp_progress(pct) {
            Some(pct) if pct > job.progress => {
                job.progress = pct;
                true
            }
            _ => false,
        },
        (Starting | Downloading, Transition::Merging) => {
            job.status = Merging;
            job.progress = 100.0;
            true
        }
        (Starting | Downloading | Merging, Transition::Completed(path)) => {
            job.status = Completed;
            job.progress = 100.0;
            job.filename = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned());
            job.filepath = Some(path);
            true
        }
        (Starting | Downloading | Merging, Transition::Failed(error)) => {
            job.status = Error;
            job.error = Some(error);
            true
        }
        _ => false,
    }
}
