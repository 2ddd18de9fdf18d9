//! Offline queue for outbound transactions
//!
//! Holds transactions submitted while the node cannot reach enough healthy
//! peers and replays them, in order, once it can.

pub mod dead_letter;
pub mod offline;

pub use dead_letter::{DeadLetter, DeadLetterSink, LogDeadLetterSink};
pub use offline::{
    read_snapshot, DistributionTarget, DrainReport, OfflineQueue, QueueError, QueueItem,
    QueueSnapshot,
};
