//! Dead letters and where they are reported

use crate::queue::offline::QueueItem;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A queue item that ran out of retries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub item: QueueItem,
    /// Error from the final attempt
    pub reason: String,
    pub dead_at: DateTime<Utc>,
}

/// Operator-facing collaborator told about every dead letter
pub trait DeadLetterSink: Send + Sync {
    fn report(&self, letter: &DeadLetter);
}

/// Reports dead letters to the log
#[derive(Debug, Default)]
pub struct LogDeadLetterSink;

impl DeadLetterSink for LogDeadLetterSink {
    fn report(&self, letter: &DeadLetter) {
        log::error!(
            "Transaction {} dead-lettered after {} attempts: {}",
            letter.item.hash,
            letter.item.retry_count,
            letter.reason
        );
    }
}
