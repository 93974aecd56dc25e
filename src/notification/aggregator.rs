//! Buffers config events until the commit end marker.
//!
//! The config subscription delivers leaf changes as a flat sequence; only the
//! commit end marker says the preceding changes form a complete commit.
//! Everything pushed between two markers is handed out as a single
//! [`Transaction`], so the applier never sees part of a commit.

use tracing::debug;

use crate::ndk::{ConfigEvent, Notification, NotificationStreamResponse};

/// The events of one commit, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    /// Counts flushed transactions, starting at 1.
    pub sequence: u64,
    pub events: Vec<ConfigEvent>,
}

impl Transaction {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

pub struct ConfigAggregator {
    commit_end_path: String,
    buffer: Vec<ConfigEvent>,
    flushed: u64,
}

impl ConfigAggregator {
    pub fn new(commit_end_path: impl Into<String>) -> Self {
        Self {
            commit_end_path: commit_end_path.into(),
            buffer: Vec::new(),
            flushed: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn is_commit_end(&self, event: &ConfigEvent) -> bool {
        event.path == self.commit_end_path
    }

    /// Buffers `event`, or flushes the buffer when `event` is the commit end
    /// marker. A marker arriving on an empty buffer yields nothing.
    pub fn push(&mut self, event: ConfigEvent) -> Option<Transaction> {
        if !self.is_commit_end(&event) {
            debug!(path = %event.path, "Storing config notification in buffer");
            self.buffer.push(event);
            return None;
        }

        if self.buffer.is_empty() {
            debug!("commit end on empty buffer, nothing to apply");
            return None;
        }

        self.flushed += 1;
        let events = std::mem::take(&mut self.buffer);
        debug!(
            sequence = self.flushed,
            events = events.len(),
            "Received commit end notification"
        );
        Some(Transaction {
            sequence: self.flushed,
            events,
        })
    }

    /// Feeds every config notification of a stream response, returning the
    /// transactions completed by it. Other notifications are skipped.
    pub fn push_response(&mut self, response: NotificationStreamResponse) -> Vec<Transaction> {
        let mut transactions = Vec::new();
        for notification in response.notifications {
            match notification {
                Notification::Config(event) => {
                    if let Some(transaction) = self.push(event) {
                        transactions.push(transaction);
                    }
                }
                other => {
                    debug!("Skipping non-config notification: {:?}", other);
                }
            }
        }
        transactions
    }

    /// Drops a partially received commit. Returns how many events were dropped.
    pub fn discard(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        dropped
    }
}
