//! Advisory object-scoped locks
//!
//! Locks are keyed by logical object identity and released when the returned
//! [`ObjectLock`] is dropped, on every exit path including `?` and panics.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

use lattice_common::Error;

use crate::model::FederatedKind;
use crate::Result;

/// Lock key for template-level attach/detach/delete
pub fn template_key(kind: FederatedKind, template_id: &str) -> String {
    format!("template/{}/{}", kind.keyword(), template_id)
}

/// Lock key serializing reconciles of one join
pub fn reconcile_key(kind: FederatedKind, template_id: &str, cluster_id: &str) -> String {
    format!("reconcile/{}/{}/{}", kind.keyword(), template_id, cluster_id)
}

/// Lock key for a freshly created remote resource
pub fn resource_key(kind: FederatedKind, resource_id: &str) -> String {
    format!("resource/{}/{}", kind.resource_kind(), resource_id)
}

/// Exclusive lock capability
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Block until `key` is held; `Internal` if it cannot be acquired
    async fn lock_object(&self, key: &str) -> Result<ObjectLock>;
}

type LockTable = Arc<DashMap<String, Arc<Mutex<()>>>>;

/// Held lock; released on drop
#[derive(Debug)]
pub struct ObjectLock {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    table: LockTable,
}

impl ObjectLock {
    /// Key this lock holds
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for ObjectLock {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the table still references the mutex: nobody holds or waits on it.
        self.table
            .remove_if(&self.key, |_, m| Arc::strong_count(m) == 1);
        trace!(key = %self.key, "released object lock");
    }
}

/// In-process [`LockManager`] with one tokio mutex per key
pub struct KeyedLockManager {
    table: LockTable,
    timeout: Duration,
}

impl KeyedLockManager {
    /// Lock manager that gives up after `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            table: Arc::new(DashMap::new()),
            timeout,
        }
    }

    /// Number of keys currently held or awaited
    pub fn active_keys(&self) -> usize {
        self.table.len()
    }
}

#[async_trait]
impl LockManager for KeyedLockManager {
    async fn lock_object(&self, key: &str) -> Result<ObjectLock> {
        let mutex = self
            .table
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        match tokio::time::timeout(self.timeout, mutex.lock_owned()).await {
            Ok(guard) => {
                trace!(key, "acquired object lock");
                Ok(ObjectLock {
                    key: key.to_string(),
                    guard: Some(guard),
                    table: self.table.clone(),
                })
            }
            Err(_) => {
                self.table.remove_if(key, |_, m| Arc::strong_count(m) == 1);
                Err(Error::internal_with_context(
                    "lock",
                    format!("timed out after {:?} waiting for {}", self.timeout, key),
                )
                .into())
            }
        }
    }
}
