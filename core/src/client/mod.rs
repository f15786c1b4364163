pub mod kafka;
pub mod mock;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::errors::ClientError;

/// A record received from the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Record<K, V> {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<K>,
    pub value: V,
    pub timestamp: Option<DateTime<Utc>>,
}

impl<K, V> Record<K, V> {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, key: K, value: V) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: Some(key),
            value,
            timestamp: None,
        }
    }
}

/// The records returned by a single poll, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<K, V> {
    records: Vec<Record<K, V>>,
}

impl<K, V> Batch<K, V> {
    pub fn new(records: Vec<Record<K, V>>) -> Self {
        Self { records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl<K, V> IntoIterator for Batch<K, V> {
    type Item = Record<K, V>;
    type IntoIter = std::vec::IntoIter<Record<K, V>>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

/// Capability the collector needs from a broker client.
///
/// All methods take `&self` so that `wakeup` can be called from another task
/// while `poll` is pending.
#[async_trait]
pub trait ConsumerClient<K, V>: Send + Sync {
    /// Replaces the current subscription with `topics`.
    fn subscribe(&self, topics: &[&str]) -> Result<(), ClientError>;

    /// Waits up to `timeout` for records.
    ///
    /// An empty batch means the timeout elapsed. Returns [`ClientError::Wakeup`]
    /// if `wakeup` was called while waiting, or before this call started.
    async fn poll(&self, timeout: Duration) -> Result<Batch<K, V>, ClientError>;

    /// Requests a commit of every position consumed so far without waiting for it.
    fn commit_async(&self) -> Result<(), ClientError>;

    /// Interrupts a pending poll, or the next one if none is pending.
    fn wakeup(&self);

    /// Releases the client. Any later call fails with [`ClientError::Closed`].
    async fn close(&self) -> Result<(), ClientError>;
}
