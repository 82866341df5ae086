//! Bounded in-memory journal of security events.
//!
//! Serves as the default log source for SNAPSHOT_LOGS.
//!
//! # Data Flow
//! ```text
//! record() ── try_send ──▶ bounded channel ──▶ drained into the ring on read
//! ```
//! Writers never take the ring lock, so violations for unrelated identities
//! do not contend on it. Readers drain pending events before answering.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::security::incident::alert::CollaboratorError;

/// One security-relevant event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityEvent {
    pub timestamp: u64,
    pub identity: String,
    pub kind: String,
    pub message: String,
}

/// Read access to a time-ordered log.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Events with `from <= timestamp <= to`.
    async fn snapshot(&self, from: u64, to: u64) -> Result<Vec<SecurityEvent>, CollaboratorError>;
}

#[derive(Debug)]
struct Ring {
    pending: mpsc::Receiver<SecurityEvent>,
    events: VecDeque<SecurityEvent>,
}

impl Ring {
    fn drain(&mut self, capacity: usize) {
        while let Ok(event) = self.pending.try_recv() {
            if self.events.len() >= capacity {
                self.events.pop_front();
            }
            self.events.push_back(event);
        }
    }
}

/// Ring buffer of the most recent security events.
#[derive(Debug)]
pub struct EventJournal {
    capacity: usize,
    sender: mpsc::Sender<SecurityEvent>,
    ring: Mutex<Ring>,
    dropped: AtomicU64,
}

impl EventJournal {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, pending) = mpsc::channel(capacity);
        Self {
            capacity,
            sender,
            ring: Mutex::new(Ring {
                pending,
                events: VecDeque::with_capacity(capacity.min(1024)),
            }),
            dropped: AtomicU64::new(0),
        }
    }

    /// Never blocks. When the channel is full and a reader holds the ring,
    /// the event is dropped and counted.
    pub fn record(&self, timestamp: u64, identity: &str, kind: &str, message: impl Into<String>) {
        let event = SecurityEvent {
            timestamp,
            identity: identity.to_string(),
            kind: kind.to_string(),
            message: message.into(),
        };

        let event = match self.sender.try_send(event) {
            Ok(()) => return,
            Err(TrySendError::Full(event)) | Err(TrySendError::Closed(event)) => event,
        };

        let ring = match self.ring.try_lock() {
            Ok(ring) => Some(ring),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        };
        match ring {
            Some(mut ring) => {
                ring.drain(self.capacity);
                if self.sender.try_send(event).is_err() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            None => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn drained(&self) -> MutexGuard<'_, Ring> {
        let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        ring.drain(self.capacity);
        ring
    }

    /// Move pending events into the ring.
    pub fn flush(&self) {
        drop(self.drained());
    }

    pub fn window(&self, from: u64, to: u64) -> Vec<SecurityEvent> {
        self.drained()
            .events
            .iter()
            .filter(|e| e.timestamp >= from && e.timestamp <= to)
            .cloned()
            .collect()
    }

    pub fn recent(&self, limit: usize) -> Vec<SecurityEvent> {
        self.drained().events.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.drained().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events lost because the channel was full while a reader held the ring.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl LogSource for EventJournal {
    async fn snapshot(&self, from: u64, to: u64) -> Result<Vec<SecurityEvent>, CollaboratorError> {
        Ok(self.window(from, to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_journal_is_bounded() {
        let journal = EventJournal::new(3);
        for i in 0..5 {
            journal.record(i, "ip", "violation", format!("event {}", i));
        }
        assert_eq!(journal.len(), 3);
        assert_eq!(journal.recent(1)[0].message, "event 4");
    }

    #[test]
    fn test_full_channel_drains_into_ring() {
        let journal = EventJournal::new(2);
        for i in 0..10 {
            journal.record(i, "ip", "violation", format!("event {}", i));
        }
        assert_eq!(journal.dropped(), 0);
        let messages: Vec<_> = journal.recent(5).into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["event 9", "event 8"]);
    }

    #[test]
    fn test_concurrent_writers_do_not_block() {
        let journal = EventJournal::new(10_000);
        std::thread::scope(|scope| {
            for t in 0..8 {
                let journal = &journal;
                scope.spawn(move || {
                    for i in 0..500 {
                        journal.record(i, &format!("identity-{}", t), "violation", "x");
                    }
                });
            }
        });
        assert_eq!(journal.dropped(), 0);
        assert_eq!(journal.len(), 4_000);
    }

    #[tokio::test]
    async fn test_snapshot_window_is_inclusive() {
        let journal = EventJournal::new(10);
        journal.record(100, "a", "k", "before");
        journal.record(200, "a", "k", "start");
        journal.record(300, "a", "k", "end");
        journal.record(400, "a", "k", "after");

        let events = journal.snapshot(200, 300).await.unwrap();
        let messages: Vec<_> = events.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["start", "end"]);
    }
}
