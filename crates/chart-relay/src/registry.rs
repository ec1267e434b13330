//! Process-local subscriber registry with exact-partition fan-out

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::event::{Event, SessionKey};

/// Per-subscriber buffer. A subscriber this far behind is treated as dead.
const SUBSCRIBER_BUFFER: usize = 128;

/// Handle returned by `subscribe`, used to deterministically deregister a
/// subscriber on disconnect. No reliance on write-failure detection alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberToken {
    session: SessionKey,
    serial: u64,
}

impl SubscriberToken {
    pub fn session(&self) -> &SessionKey {
        &self.session
    }
}

/// Maps session partitions to their live subscriber channels.
///
/// Delivery is strictly partition-exact: a global subscriber never sees
/// session-scoped events and vice versa.
#[derive(Clone)]
pub struct SessionRegistry {
    partitions: Arc<DashMap<SessionKey, HashMap<u64, mpsc::Sender<Event>>>>,
    next_serial: Arc<AtomicU64>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            partitions: Arc::new(DashMap::new()),
            next_serial: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Register a subscriber for one exact partition. The partition's set is
    /// created lazily on first use.
    pub fn subscribe(&self, session: SessionKey) -> (SubscriberToken, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        self.partitions
            .entry(session.clone())
            .or_default()
            .insert(serial, tx);
        debug!(session = ?session.as_option(), serial, "Subscriber registered");
        (SubscriberToken { session, serial }, rx)
    }

    /// Remove a subscriber. Idempotent; drops the partition entry once empty.
    pub fn unsubscribe(&self, token: &SubscriberToken) {
        if let Some(mut set) = self.partitions.get_mut(&token.session) {
            if set.remove(&token.serial).is_some() {
                info!(session = ?token.session.as_option(), serial = token.serial, "Subscriber unregistered");
            }
        }
        self.partitions
            .remove_if(&token.session, |_, set| set.is_empty());
    }

    /// Deliver an event to every subscriber of its exact partition.
    ///
    /// Senders are cloned out before delivery so no map lock is held while
    /// sending. `try_send` keeps producers non-blocking; a closed or full
    /// subscriber channel is treated as disconnected and pruned, which never
    /// prevents delivery to the remaining subscribers.
    pub fn fanout(&self, event: &Event) -> usize {
        let targets: Vec<(u64, mpsc::Sender<Event>)> = match self.partitions.get(&event.session) {
            Some(set) => set.iter().map(|(s, tx)| (*s, tx.clone())).collect(),
            None => return 0,
        };

        let mut sent = 0;
        let mut dead: Vec<u64> = Vec::new();
        for (serial, tx) in targets {
            match tx.try_send(event.clone()) {
                Ok(()) => sent += 1,
                Err(e) => {
                    debug!(session = ?event.session.as_option(), serial, error = %e, "Pruning dead subscriber");
                    dead.push(serial);
                }
            }
        }

        if !dead.is_empty() {
            if let Some(mut set) = self.partitions.get_mut(&event.session) {
                for serial in &dead {
                    set.remove(serial);
                }
            }
            self.partitions
                .remove_if(&event.session, |_, set| set.is_empty());
        }
        sent
    }

    /// Total live subscribers across all partitions
    pub fn subscriber_count(&self) -> usize {
        self.partitions.iter().map(|e| e.value().len()).sum()
    }

    /// Live subscribers for one partition
    pub fn session_subscriber_count(&self, session: &SessionKey) -> usize {
        self.partitions.get(session).map(|s| s.len()).unwrap_or(0)
    }

    /// Number of partitions with at least one subscriber
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Drop every subscriber channel for a partition, returning how many were
    /// removed. Their streams observe a closed channel and finish.
    pub fn drop_partition(&self, session: &SessionKey) -> usize {
        self.partitions
            .remove(session)
            .map(|(_, set)| set.len())
            .unwrap_or(0)
    }
}
