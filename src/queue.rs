//! Message queue operations: named wrappers around [`MessageRepository`]'s
//! `SELECT ... FOR UPDATE SKIP LOCKED`-backed ready/in-flight/retry sets,
//! plus the retry backoff schedule.
//!
//! No teacher or pack repo implements a message queue as such — the closest
//! analogue is the teacher's `periodically.rs` retry loop. The backoff
//! numbers are taken verbatim from `original_source/smtp-server/src/message_queue.py`'s
//! `_calculate_retry_delay`.

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::models::{Error, Message, MessageId, MessageRepository, NewMessage};

/// Delay, in seconds, before each successive retry attempt. Index 0 is the
/// delay before the first retry (i.e. after the first failed delivery).
pub const RETRY_BACKOFF_SECONDS: [i64; 7] = [300, 900, 2700, 7200, 21600, 43200, 86400];

/// A message that has exhausted this many attempts is marked failed instead
/// of retrying again.
pub const MAX_ATTEMPTS: i32 = RETRY_BACKOFF_SECONDS.len() as i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    Retrying { attempt: i32, next_retry: DateTime<Utc> },
    Failed,
}

fn retry_delay(attempt: i32) -> ChronoDuration {
    let idx = ((attempt - 1).max(0) as usize).min(RETRY_BACKOFF_SECONDS.len() - 1);
    ChronoDuration::seconds(RETRY_BACKOFF_SECONDS[idx])
}

#[derive(Debug, Clone)]
pub struct MessageQueue {
    repo: MessageRepository,
}

impl MessageQueue {
    pub fn new(repo: MessageRepository) -> Self {
        Self { repo }
    }

    /// Adds a new message to the ready set.
    pub async fn enqueue(&self, message: &NewMessage) -> Result<Message, Error> {
        self.repo.create(message).await
    }

    /// Atomically claims up to `limit` ready messages, moving them to the
    /// in-flight set.
    pub async fn dequeue(&self, limit: i64) -> Result<Vec<Message>, Error> {
        self.repo.dequeue(limit).await
    }

    /// Marks a message permanently delivered.
    pub async fn mark_completed(&self, id: MessageId) -> Result<(), Error> {
        self.repo.mark_sent(id).await
    }

    /// Marks a message permanently undeliverable: a 5xx response, or retry
    /// exhaustion. Bypasses the retry schedule.
    pub async fn mark_failed(&self, id: MessageId) -> Result<(), Error> {
        self.repo.mark_failed(id).await
    }

    /// After a failed delivery attempt: schedules the next retry per the
    /// backoff schedule, or marks the message failed once attempts are
    /// exhausted. Whichever happens, the whole message is requeued or
    /// failed as a unit — per-recipient partial delivery is not tracked.
    pub async fn requeue_failed(&self, message: &Message) -> Result<QueueOutcome, Error> {
        let attempt = message.attempts + 1;
        if attempt > MAX_ATTEMPTS {
            self.repo.mark_failed(message.id).await?;
            return Ok(QueueOutcome::Failed);
        }

        let next_retry = Utc::now() + retry_delay(attempt);
        self.repo.record_retry(message.id, attempt, next_retry).await?;
        Ok(QueueOutcome::Retrying { attempt, next_retry })
    }

    /// Requeues any message stuck in-flight longer than `timeout`.
    pub async fn reap_stale(&self, timeout: chrono::Duration) -> Result<Vec<MessageId>, Error> {
        self.repo.reap_stale(timeout).await
    }

    /// Deletes terminal messages older than `retention`, backing
    /// `message_retention_days`. Returns the number of rows removed.
    pub async fn purge_expired(&self, retention: chrono::Duration) -> Result<u64, Error> {
        self.repo.purge_older_than(retention).await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn retry_delay_follows_backoff_schedule() {
        assert_eq!(retry_delay(1), ChronoDuration::seconds(300));
        assert_eq!(retry_delay(2), ChronoDuration::seconds(900));
        assert_eq!(retry_delay(7), ChronoDuration::seconds(86400));
    }

    #[test]
    fn retry_delay_clamps_beyond_table_length() {
        assert_eq!(retry_delay(99), ChronoDuration::seconds(86400));
    }
}
