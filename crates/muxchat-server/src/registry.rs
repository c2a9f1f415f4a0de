//! Registry of online connections.
//!
//! - Key: client identity (e.g. user id)
//! - Value: the client's `Connection`
//!
//! A key is present iff that client is considered online. All map access
//! goes through one `RwLock`; sends only hold the read lock long enough to
//! resolve the handle, and the write itself happens outside the lock so a
//! slow client cannot stall registry operations.
//!
//! The `full` flag is advisory. It is recomputed by the supervisor on a
//! timer, not on every add/remove, and may briefly lag the real count.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::transport::{Connection, TransportError};

/// One recipient that could not be reached by `send_many`.
#[derive(Debug, Error)]
#[error("{key}: {error}")]
pub struct SendFailure {
    pub key: String,
    #[source]
    pub error: TransportError,
}

/// Every non-EOF failure of one `send_many` call.
#[derive(Debug, Error)]
#[error("send failed for {} recipient(s): {}", .failures.len(), join_failures(.failures))]
pub struct SendManyError {
    pub failures: Vec<SendFailure>,
}

impl SendManyError {
    pub fn failed_keys(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.key.as_str()).collect()
    }
}

fn join_failures(failures: &[SendFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Connection>>,
    full: AtomicBool,
    max_online: usize,
}

impl ConnectionRegistry {
    pub fn new(max_online: usize) -> Self {
        ConnectionRegistry {
            connections: RwLock::new(HashMap::new()),
            full: AtomicBool::new(false),
            max_online,
        }
    }

    /// Register `conn` under `key`.
    ///
    /// An existing entry is never replaced: a second connect for an online
    /// key is ignored and `false` is returned. Remove first to replace.
    pub async fn add(&self, key: impl Into<String>, conn: Connection) -> bool {
        let key = key.into();
        let mut guard = self.connections.write().await;
        if guard.contains_key(&key) {
            debug!(key = %key, "already online, keeping existing connection");
            return false;
        }
        guard.insert(key, conn);
        true
    }

    /// Remove `key`. Absent keys are a no-op.
    pub async fn remove(&self, key: &str) -> bool {
        self.connections.write().await.remove(key).is_some()
    }

    /// Remove `key` only while it still maps to `conn`.
    ///
    /// Used when a connection ends, so that a connection orphaned by a
    /// duplicate connect does not take the registered one offline.
    pub async fn remove_if_same(&self, key: &str, conn: &Connection) -> bool {
        let mut guard = self.connections.write().await;
        match guard.get(key) {
            Some(current) if Arc::ptr_eq(current, conn) => {
                guard.remove(key);
                true
            }
            _ => false,
        }
    }

    pub async fn get(&self, key: &str) -> Option<Connection> {
        self.connections.read().await.get(key).cloned()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.connections.read().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn keys(&self) -> Vec<String> {
        self.connections.read().await.keys().cloned().collect()
    }

    pub fn max_online(&self) -> usize {
        self.max_online
    }

    /// Last published capacity flag. May be stale by up to one
    /// supervisor interval.
    pub fn is_full(&self) -> bool {
        self.full.load(Ordering::Relaxed)
    }

    pub fn set_full(&self, state: bool) {
        self.full.store(state, Ordering::Relaxed);
    }

    /// Recompute and publish the capacity flag once.
    pub async fn refresh_capacity(&self) -> bool {
        let online = self.len().await;
        let full = online > self.max_online;
        let was = self.full.swap(full, Ordering::Relaxed);
        if was != full {
            if full {
                warn!(online, max = self.max_online, "connection registry is full");
            } else {
                info!(online, max = self.max_online, "connection registry has room again");
            }
        }
        full
    }

    /// Send `payload` to `key`.
    ///
    /// An offline recipient is not an error, nor is a peer that already
    /// hung up (`TransportError::Eof`).
    pub async fn send_one(&self, payload: &[u8], key: &str) -> Result<(), TransportError> {
        let Some(conn) = self.get(key).await else {
            return Ok(());
        };
        match conn.send(payload).await {
            Err(e) if e.is_eof() => Ok(()),
            other => other,
        }
    }

    /// Send `payload` to every key concurrently, one task per recipient.
    ///
    /// Returns once every send has finished. Offline recipients and clean
    /// EOFs are skipped; all other failures are collected.
    pub async fn send_many<S>(&self, payload: Bytes, keys: &[S]) -> Result<(), SendManyError>
    where
        S: AsRef<str>,
    {
        let targets: Vec<(String, Connection)> = {
            let guard = self.connections.read().await;
            keys.iter()
                .filter_map(|k| {
                    let k = k.as_ref();
                    guard.get(k).map(|c| (k.to_string(), c.clone()))
                })
                .collect()
        };

        let tasks: Vec<_> = targets
            .into_iter()
            .map(|(key, conn)| {
                let payload = payload.clone();
                let task = tokio::spawn(async move { conn.send(&payload).await });
                (key, task)
            })
            .collect();

        let mut failures = Vec::new();
        for (key, task) in tasks {
            let error = match task.await {
                Ok(Ok(())) => continue,
                Ok(Err(e)) if e.is_eof() => continue,
                Ok(Err(e)) => e,
                Err(join_err) => {
                    TransportError::Io(io::Error::new(io::ErrorKind::Other, join_err.to_string()))
                }
            };
            failures.push(SendFailure { key, error });
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SendManyError { failures })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MemoryTransport, Transport};

    fn conn() -> (Connection, MemoryTransport) {
        let (server, client) = MemoryTransport::pair();
        (Arc::new(server), client)
    }

    #[tokio::test]
    async fn add_then_get_returns_same_handle() {
        let registry = ConnectionRegistry::new(10);
        let (a, _peer) = conn();

        assert!(registry.add("alice", a.clone()).await);
        let got = registry.get("alice").await.unwrap();
        assert!(Arc::ptr_eq(&got, &a));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn add_does_not_replace() {
        let registry = ConnectionRegistry::new(10);
        let (first, _p1) = conn();
        let (second, _p2) = conn();

        assert!(registry.add("alice", first.clone()).await);
        assert!(!registry.add("alice", second).await);
        assert!(Arc::ptr_eq(&registry.get("alice").await.unwrap(), &first));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = ConnectionRegistry::new(10);
        let (a, _peer) = conn();
        registry.add("alice", a).await;

        assert!(registry.remove("alice").await);
        assert!(registry.get("alice").await.is_none());
        assert!(!registry.remove("alice").await);
        assert!(!registry.remove("nobody").await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn remove_if_same_leaves_other_connection() {
        let registry = ConnectionRegistry::new(10);
        let (first, _p1) = conn();
        let (orphan, _p2) = conn();
        registry.add("alice", first.clone()).await;

        assert!(!registry.remove_if_same("alice", &orphan).await);
        assert!(registry.contains("alice").await);
        assert!(registry.remove_if_same("alice", &first).await);
        assert!(!registry.contains("alice").await);
    }

    #[tokio::test]
    async fn send_one_to_absent_key_is_ok() {
        let registry = ConnectionRegistry::new(10);
        registry.send_one(b"hello", "ghost").await.unwrap();
    }

    #[tokio::test]
    async fn send_one_delivers() {
        let registry = ConnectionRegistry::new(10);
        let (a, peer) = conn();
        registry.add("alice", a).await;

        registry.send_one(b"hello", "alice").await.unwrap();
        assert_eq!(&peer.receive().await.unwrap().unwrap()[..], b"hello");
    }

    #[tokio::test]
    async fn send_one_to_hung_up_peer_is_ok() {
        let registry = ConnectionRegistry::new(10);
        let (a, peer) = conn();
        registry.add("alice", a).await;
        peer.close().await;

        registry.send_one(b"hello", "alice").await.unwrap();
    }

    #[test]
    fn send_failure_names_the_key_and_keeps_the_cause() {
        use std::error::Error as _;

        let failure = SendFailure {
            key: "bob".to_string(),
            error: TransportError::Closed,
        };
        assert_eq!(failure.to_string(), "bob: connection closed");
        assert!(failure.source().is_some());

        let err = SendManyError {
            failures: vec![failure],
        };
        assert_eq!(
            err.to_string(),
            "send failed for 1 recipient(s): bob: connection closed"
        );
    }

    #[tokio::test]
    async fn refresh_capacity_compares_against_max() {
        let registry = ConnectionRegistry::new(1);
        let (a, _p1) = conn();
        let (b, _p2) = conn();

        registry.add("a", a).await;
        assert!(!registry.refresh_capacity().await);
        registry.add("b", b).await;
        assert!(!registry.is_full(), "flag only moves on a refresh");
        assert!(registry.refresh_capacity().await);
        assert!(registry.is_full());

        registry.set_full(false);
        assert!(!registry.is_full());
    }
}
