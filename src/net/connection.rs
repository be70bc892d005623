//! Connection lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Keep a registry of open connections for the admin API
//! - Let shutdown wait until every connection has closed
//! - Keep the active connection gauge current

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::watch;

use crate::observability::metrics::record_active_connections;

/// Relaxed ordering is enough: only uniqueness matters.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    peer: SocketAddr,
    opened: Instant,
    request_id: Option<String>,
    destination: Option<String>,
}

/// Point-in-time view of one open connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer: String,
    pub request_id: Option<String>,
    pub destination: Option<String>,
    pub age_ms: u64,
}

type Registry = Arc<Mutex<HashMap<ConnectionId, Entry>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<ConnectionId, Entry>> {
    match registry.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Tracks open connections for graceful shutdown and the admin API.
///
/// The watch channel carries the live count, so draining waits on changes
/// instead of polling.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    registry: Registry,
    count_tx: Arc<watch::Sender<u64>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        let (count_tx, _) = watch::channel(0);
        Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
            count_tx: Arc::new(count_tx),
        }
    }

    /// Record a new connection. The returned guard unregisters it on drop.
    pub fn track(&self, peer: SocketAddr) -> ConnectionGuard {
        let id = ConnectionId::new();
        let count = {
            let mut registry = lock(&self.registry);
            registry.insert(
                id,
                Entry {
                    peer,
                    opened: Instant::now(),
                    request_id: None,
                    destination: None,
                },
            );
            registry.len() as u64
        };
        self.publish(count);
        tracing::trace!(connection_id = %id, peer_addr = %peer, "Connection opened");

        ConnectionGuard {
            id,
            tracker: self.clone(),
        }
    }

    pub fn active_count(&self) -> u64 {
        *self.count_tx.borrow()
    }

    /// Open connections, oldest first.
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let registry = lock(&self.registry);
        let mut list: Vec<ConnectionInfo> = registry
            .iter()
            .map(|(id, entry)| ConnectionInfo {
                id: *id,
                peer: entry.peer.to_string(),
                request_id: entry.request_id.clone(),
                destination: entry.destination.clone(),
                age_ms: entry.opened.elapsed().as_millis() as u64,
            })
            .collect();
        list.sort_by(|a, b| b.age_ms.cmp(&a.age_ms).then(a.id.0.cmp(&b.id.0)));
        list
    }

    /// Wait until every tracked connection has closed, up to `deadline`.
    ///
    /// Returns `false` if connections were still open when the deadline passed.
    pub async fn wait_for_drain(&self, deadline: Duration) -> bool {
        let mut count_rx = self.count_tx.subscribe();
        let drained = tokio::time::timeout(deadline, count_rx.wait_for(|count| *count == 0)).await;
        matches!(drained, Ok(Ok(_)))
    }

    fn publish(&self, count: u64) {
        self.count_tx.send_replace(count);
        record_active_connections(count);
    }

    fn describe(&self, id: ConnectionId, request_id: &str, destination: String) {
        if let Some(entry) = lock(&self.registry).get_mut(&id) {
            entry.request_id = Some(request_id.to_string());
            entry.destination = Some(destination);
        }
    }

    fn remove(&self, id: ConnectionId) {
        let count = {
            let mut registry = lock(&self.registry);
            registry.remove(&id);
            registry.len() as u64
        };
        self.publish(count);
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that tracks a connection's lifetime.
#[derive(Debug)]
pub struct ConnectionGuard {
    id: ConnectionId,
    tracker: ConnectionTracker,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Attach the request being served to this connection's registry entry.
    pub fn describe(&self, request_id: &str, destination: impl ToString) {
        self.tracker.describe(self.id, request_id, destination.to_string());
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.remove(self.id);
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn connection_id_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn connection_tracker_counts() {
        let tracker = ConnectionTracker::new();
        assert_eq!(tracker.active_count(), 0);

        let guard1 = tracker.track(peer());
        let guard2 = tracker.track(peer());
        assert_eq!(tracker.active_count(), 2);

        drop(guard1);
        assert_eq!(tracker.active_count(), 1);
        drop(guard2);
        assert_eq!(tracker.active_count(), 0);
    }

    #[test]
    fn snapshot_carries_request_details() {
        let tracker = ConnectionTracker::new();
        let guard = tracker.track(peer());
        guard.describe("req-7", "backend:80");

        let list = tracker.snapshot();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, guard.id());
        assert_eq!(list[0].request_id.as_deref(), Some("req-7"));
        assert_eq!(list[0].destination.as_deref(), Some("backend:80"));
        assert_eq!(list[0].peer, "127.0.0.1:40000");
    }

    #[tokio::test]
    async fn drain_waits_for_last_guard() {
        let tracker = ConnectionTracker::new();
        let guard = tracker.track(peer());

        assert!(!tracker.wait_for_drain(Duration::from_millis(20)).await);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        });
        assert!(tracker.wait_for_drain(Duration::from_secs(5)).await);
    }
}
