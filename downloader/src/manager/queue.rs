use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::job::JobTicket;

use super::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMessage {
    Job(JobTicket),
    /// Tells the worker that receives it to exit.
    Shutdown,
}

/// Unbounded FIFO of job tickets shared by all workers.
/// The receiving half sits behind an async mutex, the worker holding it waits for the next
/// message while the others wait for the mutex, so every message goes to exactly one worker.
/// This is independent from the job table lock, a waiting worker never blocks submissions.
#[derive(Debug, Clone)]
pub struct SubmissionQueue {
    tx: mpsc::UnboundedSender<QueueMessage>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<QueueMessage>>>,
}

impl Default for SubmissionQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SubmissionQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    pub fn enqueue(&self, ticket: JobTicket) -> Result<()> {
        self.send(QueueMessage::Job(ticket))
    }

    pub fn shutdown_one(&self) -> Result<()> {
        self.send(QueueMessage::Shutdown)
    }

    fn send(&self, message: QueueMessage) -> Result<()> {
        self.tx.send(message).map_err(|_| Error::QueueClosed)
    }

    /// Waits for the next message. None means every sender is gone, which can't happen while the
    /// queue itself is alive.
    pub async fn dequeue(&self) -> Option<QueueMessage> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::manager::table::JobTable;
    use pretty_assertions::assert_eq;
    use test_log::test;

    #[test(tokio::test)]
    async fn messages_come_out_in_fifo_order() {
        let table = JobTable::new();
        let queue = SubmissionQueue::new();
        let tickets = table.insert_many(
            vec!["a".to_owned(), "b".to_owned()],
            |t| queue.enqueue(t).unwrap(),
        );
        queue.shutdown_one().unwrap();
        assert_eq!(queue.dequeue().await, Some(QueueMessage::Job(tickets[0])));
        assert_eq!(queue.dequeue().await, Some(QueueMessage::Job(tickets[1])));
        assert_eq!(queue.dequeue().await, Some(QueueMessage::Shutdown));
    }

    #[test(tokio::test)]
    async fn each_message_reaches_one_consumer() {
        let table = JobTable::new();
        let queue = SubmissionQueue::new();
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    let mut got = Vec::new();
                    while let Some(QueueMessage::Job(ticket)) = queue.dequeue().await {
                        got.push(ticket.id);
                    }
                    got
                })
            })
            .collect();
        for i in 0..100 {
            queue.enqueue(table.insert(format!("u{i}"))).unwrap();
        }
        for _ in 0..4 {
            queue.shutdown_one().unwrap();
        }
        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.await.unwrap());
        }
        all.sort_unstable();
        assert_eq!(all, (1..=100).collect::<Vec<_>>());
    }
}
