//! Session key-value store
//!
//! Per-session state (pending actions, node pins) lives behind an
//! explicit key-value service passed by reference into the components
//! that need it. Last-writer-wins is acceptable: a session has at most
//! one active human driver at a time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

/// Key-value store with per-entry TTL
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>);
    async fn delete(&self, key: &str);
}

/// In-memory store backed by a read-write lock.
///
/// Expired entries are dropped lazily on read, which bounds memory for
/// abandoned sessions without a background sweeper.
#[derive(Default)]
pub struct MemoryKvStore {
    inner: RwLock<HashMap<String, Entry>>,
}

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Option<String> {
        let expired = {
            let map = self.inner.read().await;
            match map.get(key) {
                Some(entry) => match entry.expires_at {
                    Some(deadline) if Instant::now() >= deadline => true,
                    _ => return Some(entry.value.clone()),
                },
                None => return None,
            }
        };

        if expired {
            self.inner.write().await.remove(key);
        }
        None
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) {
        let entry = Entry {
            value,
            expires_at: ttl.map(|d| Instant::now() + d),
        };
        self.inner.write().await.insert(key.to_string(), entry);
    }

    async fn delete(&self, key: &str) {
        self.inner.write().await.remove(key);
    }
}
