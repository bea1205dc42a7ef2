use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;

use crate::fetch::{FetchPhase, FetchProgress, Fetcher};
use crate::job::JobTicket;
use crate::observer::DownloadObserver;

use super::queue::{QueueMessage, SubmissionQueue};
use super::table::{JobTable, Transition};

/// Everything a worker needs, each worker owns a clone.
#[derive(Clone)]
pub(crate) struct Worker {
    pub id: usize,
    pub table: Arc<JobTable>,
    pub queue: SubmissionQueue,
    pub observer: DownloadObserver,
    pub fetcher: Arc<dyn Fetcher>,
    pub pacing: Duration,
}

/// Spawns `count` workers on the current runtime.
pub(crate) fn spawn(count: usize, template: Worker) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|id| {
            let worker = Worker {
                id,
                ..template.clone()
            };
            tokio::spawn(worker.run())
        })
        .collect()
}

impl Worker {
    async fn run(self) {
        log::info!("Worker {} started", self.id);
        while let Some(message) = self.queue.dequeue().await {
            let ticket = match message {
                QueueMessage::Job(ticket) => ticket,
                QueueMessage::Shutdown => break,
            };
            if self.process(ticket).await && !self.pacing.is_zero() {
                tokio::time::sleep(self.pacing).await;
            }
        }
        log::info!("Worker {} exiting", self.id);
    }

    /// Runs one job to a terminal state. Returns false if the ticket was skipped without fetching.
    async fn process(&self, ticket: JobTicket) -> bool {
        let Some(url) = self.table.claim(ticket) else {
            log::debug!("Worker {} skipping stale job {}", self.id, ticket.id);
            return false;
        };
        log::info!("Worker {} claimed job {}: {}", self.id, ticket.id, url);
        self.observer.publish();

        let table = &self.table;
        let observer = &self.observer;
        let on_progress = move |progress: FetchProgress| {
            let transition = match progress.phase {
                FetchPhase::Downloading => progress.percent().map(Transition::Downloading),
                FetchPhase::Finished => Some(Transition::Merging),
            };
            if let Some(transition) = transition {
                if table.mutate(ticket, transition) {
                    log::debug!("Job {} progress: {:?}", ticket.id, progress);
                    observer.publish();
                }
            }
        };

        let outcome = AssertUnwindSafe(self.fetcher.fetch(&url, &on_progress))
            .catch_unwind()
            .await;
        let transition = match outcome {
            Ok(Ok(path)) => {
                log::info!("Job {} finished: {}", ticket.id, path.display());
                Transition::Completed(path)
            }
            Ok(Err(e)) => {
                log::error!("Job {} failed: {}", ticket.id, e);
                Transition::Failed(e.to_string())
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::error!("Job {} panicked: {}", ticket.id, message);
                Transition::Failed(message)
            }
        };
        if self.table.mutate(ticket, transition) {
            self.observer.publish();
        } else {
            log::debug!("Job {} is gone, dropping its result", ticket.id);
        }
        true
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "Download task panicked".to_owned()
    }
}
