use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use crate::client::{Batch, ConsumerClient, Record};
use crate::errors::ClientError;

/// Work run at the start of a poll, before the wakeup check.
pub type PollTask<K, V> = Box<dyn FnOnce(&MockClient<K, V>) + Send>;

/// Deterministic in-memory client.
///
/// Each `poll` runs at most one scheduled task, then reports a pending wakeup,
/// then an injected poll error, then returns every queued record for the
/// subscribed topics. When nothing is queued or scheduled the poll waits for
/// the timeout or a wakeup, like a real broker client would.
pub struct MockClient<K, V> {
    state: Mutex<MockState<K, V>>,
    wakeup_requested: AtomicBool,
    wakeup: Notify,
    close_count: AtomicUsize,
}

struct MockState<K, V> {
    subscription: Vec<String>,
    records: VecDeque<Record<K, V>>,
    poll_tasks: VecDeque<PollTask<K, V>>,
    consumed: HashMap<(String, i32), i64>,
    committed: HashMap<(String, i32), i64>,
    subscribe_error: Option<ClientError>,
    poll_error: Option<ClientError>,
    commit_error: Option<ClientError>,
    closed: bool,
    polls: usize,
    commits: usize,
    last_poll_timeout: Option<Duration>,
}

impl<K, V> Default for MockClient<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> MockClient<K, V> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                subscription: Vec::new(),
                records: VecDeque::new(),
                poll_tasks: VecDeque::new(),
                consumed: HashMap::new(),
                committed: HashMap::new(),
                subscribe_error: None,
                poll_error: None,
                commit_error: None,
                closed: false,
                polls: 0,
                commits: 0,
                last_poll_timeout: None,
            }),
            wakeup_requested: AtomicBool::new(false),
            wakeup: Notify::new(),
            close_count: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState<K, V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_wakeup(&self) -> bool {
        self.wakeup_requested.swap(false, Ordering::AcqRel)
    }

    /// Queues `task` to run at the start of a later poll, one task per poll.
    pub fn schedule_poll_task<F>(&self, task: F)
    where
        F: FnOnce(&MockClient<K, V>) + Send + 'static,
    {
        self.state().poll_tasks.push_back(Box::new(task));
    }

    pub fn add_record(&self, record: Record<K, V>) {
        self.state().records.push_back(record);
    }

    /// Makes the next `subscribe` fail with `error`.
    pub fn set_subscribe_error(&self, error: ClientError) {
        self.state().subscribe_error = Some(error);
    }

    /// Makes the next `poll` fail with `error`.
    pub fn set_poll_error(&self, error: ClientError) {
        self.state().poll_error = Some(error);
    }

    /// Makes the next `commit_async` fail with `error`.
    pub fn set_commit_error(&self, error: ClientError) {
        self.state().commit_error = Some(error);
    }

    pub fn closed(&self) -> bool {
        self.state().closed
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::Acquire)
    }

    pub fn subscription(&self) -> Vec<String> {
        self.state().subscription.clone()
    }

    /// Next offset to read for the partition, as of the last successful commit.
    pub fn committed(&self, topic: &str, partition: i32) -> Option<i64> {
        self.state()
            .committed
            .get(&(topic.to_string(), partition))
            .copied()
    }

    pub fn commit_count(&self) -> usize {
        self.state().commits
    }

    pub fn poll_count(&self) -> usize {
        self.state().polls
    }

    pub fn last_poll_timeout(&self) -> Option<Duration> {
        self.state().last_poll_timeout
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.state().closed {
            return Err(ClientError::Closed);
        }
        Ok(())
    }

    /// Drains queued records for subscribed topics and records their positions.
    fn take_ready(&self) -> Vec<Record<K, V>> {
        let mut guard = self.state();
        let state = &mut *guard;

        let (ready, pending): (Vec<_>, Vec<_>) = state
            .records
            .drain(..)
            .partition(|r| state.subscription.contains(&r.topic));
        state.records = pending.into();

        for record in &ready {
            state
                .consumed
                .insert((record.topic.clone(), record.partition), record.offset + 1);
        }
        ready
    }

    fn has_scheduled_work(&self) -> bool {
        let state = self.state();
        !state.poll_tasks.is_empty() || state.poll_error.is_some()
    }
}

#[async_trait]
impl<K, V> ConsumerClient<K, V> for MockClient<K, V>
where
    K: Send + 'static,
    V: Send + 'static,
{
    fn subscribe(&self, topics: &[&str]) -> Result<(), ClientError> {
        self.ensure_open()?;

        let mut state = self.state();
        if let Some(error) = state.subscribe_error.take() {
            return Err(error);
        }
        state.subscription = topics.iter().map(|t| t.to_string()).collect();
        debug!("Mock client subscribed to {:?}", state.subscription);
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> Result<Batch<K, V>, ClientError> {
        let task = {
            let mut state = self.state();
            if state.closed {
                return Err(ClientError::Closed);
            }
            if state.subscription.is_empty() {
                return Err(ClientError::NotSubscribed);
            }
            state.polls += 1;
            state.last_poll_timeout = Some(timeout);
            state.poll_tasks.pop_front()
        };

        if let Some(task) = task {
            task(self);
        }

        if self.take_wakeup() {
            return Err(ClientError::Wakeup);
        }

        if let Some(error) = self.state().poll_error.take() {
            return Err(error);
        }

        let ready = self.take_ready();
        if !ready.is_empty() || self.has_scheduled_work() {
            return Ok(Batch::new(ready));
        }

        let notified = self.wakeup.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if !self.wakeup_requested.load(Ordering::Acquire) {
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(timeout) => {}
            }
        }

        if self.take_wakeup() {
            return Err(ClientError::Wakeup);
        }
        Ok(Batch::new(self.take_ready()))
    }

    fn commit_async(&self) -> Result<(), ClientError> {
        let mut state = self.state();
        if state.closed {
            return Err(ClientError::Closed);
        }
        if let Some(error) = state.commit_error.take() {
            return Err(error);
        }
        state.committed = state.consumed.clone();
        state.commits += 1;
        Ok(())
    }

    fn wakeup(&self) {
        self.wakeup_requested.store(true, Ordering::Release);
        self.wakeup.notify_waiters();
    }

    async fn close(&self) -> Result<(), ClientError> {
        self.state().closed = true;
        self.close_count.fetch_add(1, Ordering::AcqRel);
        debug!("Mock client closed");
        Ok(())
    }
}
