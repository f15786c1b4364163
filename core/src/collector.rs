use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::client::{Batch, ConsumerClient};
use crate::config::{ConsumerProperties, RunConfig};
use crate::errors::{ClientError, CollectorError, Result};
use crate::telemetry::CollectorMetrics;

/// Where a collector is in its current (or last) run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Subscribed,
    Polling,
    Buffering,
    Closed(ExitReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// `max_polls` was reached.
    Completed,
    /// `stop` interrupted the run.
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    pub poll_timeout: Duration,
    /// Ends the run after this many polls. Unbounded when `None`.
    pub max_polls: Option<u64>,
}

impl RunOptions {
    pub fn new(poll_timeout: Duration) -> Self {
        Self {
            poll_timeout,
            max_polls: None,
        }
    }

    pub fn with_max_polls(mut self, max_polls: u64) -> Self {
        self.max_polls = Some(max_polls);
        self
    }
}

impl From<&RunConfig> for RunOptions {
    fn from(config: &RunConfig) -> Self {
        Self {
            poll_timeout: config.poll_timeout(),
            max_polls: config.max_polls,
        }
    }
}

/// Outcome of a run that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub exit: ExitReason,
    pub polls: usize,
    pub records: usize,
}

/// Polls a bound client, buffering record values until stopped.
///
/// The buffer is never cleared: consecutive runs append to the same sequence.
/// `stop` may be called from any task while `run` is in progress.
pub struct Collector<K, V> {
    properties: Option<ConsumerProperties>,
    client: RwLock<Option<Arc<dyn ConsumerClient<K, V>>>>,
    values: Mutex<Vec<V>>,
    state: Mutex<RunState>,
    metrics: Mutex<CollectorMetrics>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K, V> Default for Collector<K, V>
where
    K: Send + 'static,
    V: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Collector<K, V>
where
    K: Send + 'static,
    V: Send + 'static,
{
    /// A collector without connection properties. Bind a client before running.
    pub fn new() -> Self {
        Self {
            properties: None,
            client: RwLock::new(None),
            values: Mutex::new(Vec::new()),
            state: Mutex::new(RunState::Idle),
            metrics: Mutex::new(CollectorMetrics::default()),
        }
    }

    /// A collector carrying fresh properties for `brokers`.
    pub fn with_brokers(brokers: impl Into<String>) -> Self {
        Self::from_properties(ConsumerProperties::new(brokers))
    }

    pub fn from_properties(properties: ConsumerProperties) -> Self {
        Self {
            properties: Some(properties),
            ..Self::new()
        }
    }

    pub fn properties(&self) -> Option<&ConsumerProperties> {
        self.properties.as_ref()
    }

    /// Replaces the client used by subsequent runs.
    pub fn bind<C>(&self, client: Arc<C>)
    where
        C: ConsumerClient<K, V> + 'static,
    {
        let client: Arc<dyn ConsumerClient<K, V>> = client;
        *self.client.write().unwrap_or_else(PoisonError::into_inner) = Some(client);
    }

    fn client(&self) -> Option<Arc<dyn ConsumerClient<K, V>>> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Runs until `stop` is called, with no bound on the number of polls.
    pub async fn run(&self, topic: &str, poll_timeout_secs: u64) -> Result<RunSummary> {
        self.run_with(topic, RunOptions::new(Duration::from_secs(poll_timeout_secs)))
            .await
    }

    /// Subscribes to `topic` and loops poll, buffer, commit.
    ///
    /// The client is closed before this returns on every path past the
    /// precondition checks. Cancellation returns `Ok` with
    /// [`ExitReason::Cancelled`].
    pub async fn run_with(&self, topic: &str, options: RunOptions) -> Result<RunSummary> {
        if options.poll_timeout.is_zero() {
            return Err(CollectorError::InvalidPollTimeout);
        }
        let client = self.client().ok_or(CollectorError::NoClient)?;

        self.set_state(RunState::Idle);
        lock(&self.metrics).runs += 1;

        let mut summary = RunSummary {
            exit: ExitReason::Completed,
            polls: 0,
            records: 0,
        };
        let outcome = self
            .poll_loop(client.as_ref(), topic, &options, &mut summary)
            .await;

        if let Err(e) = client.close().await {
            warn!("Failed to close consumer client: {}", e);
        }

        match outcome {
            Ok(exit) => {
                summary.exit = exit;
                self.set_state(RunState::Closed(exit));
                match exit {
                    ExitReason::Cancelled => info!(
                        "Shutting down: run on topic {} cancelled after {} polls, {} records",
                        topic, summary.polls, summary.records
                    ),
                    _ => info!(
                        "Run on topic {} completed after {} polls, {} records",
                        topic, summary.polls, summary.records
                    ),
                }
                Ok(summary)
            }
            Err(err) => {
                self.set_state(RunState::Closed(ExitReason::Failed));
                error!("Run on topic {} failed: {}", topic, err);
                Err(err)
            }
        }
    }

    async fn poll_loop(
        &self,
        client: &dyn ConsumerClient<K, V>,
        topic: &str,
        options: &RunOptions,
        summary: &mut RunSummary,
    ) -> Result<ExitReason> {
        client.subscribe(&[topic])?;
        self.set_state(RunState::Subscribed);
        debug!("Subscribed to topic {}", topic);

        loop {
            if let Some(max_polls) = options.max_polls {
                if summary.polls as u64 >= max_polls {
                    return Ok(ExitReason::Completed);
                }
            }

            self.set_state(RunState::Polling);
            let batch = match client.poll(options.poll_timeout).await {
                Ok(batch) => batch,
                Err(ClientError::Wakeup) => return Ok(ExitReason::Cancelled),
                Err(e) => return Err(e.into()),
            };

            self.set_state(RunState::Buffering);
            let count = self.buffer(batch);
            summary.polls += 1;
            summary.records += count;

            let committed = client.commit_async();
            let mut metrics = lock(&self.metrics);
            metrics.polls += 1;
            metrics.records += count;
            if count == 0 {
                metrics.empty_polls += 1;
            }
            match committed {
                Ok(()) => metrics.commits += 1,
                Err(e) => {
                    metrics.commit_failures += 1;
                    warn!("Async commit failed, continuing: {}", e);
                }
            }
        }
    }

    /// Appends the batch values in arrival order and returns how many were added.
    fn buffer(&self, batch: Batch<K, V>) -> usize {
        let count = batch.len();
        if count > 0 {
            lock(&self.values).extend(batch.into_iter().map(|record| record.value));
            debug!("Buffered {} values", count);
        }
        count
    }

    fn set_state(&self, state: RunState) {
        *lock(&self.state) = state;
    }

    /// Interrupts the current run at its next poll boundary.
    ///
    /// With no run in progress the bound client remembers the wakeup, so the
    /// next run ends at its first poll.
    pub fn stop(&self) {
        match self.client() {
            Some(client) => {
                debug!("Stop requested");
                client.wakeup();
            }
            None => debug!("Stop requested with no client bound"),
        }
    }

    pub fn state(&self) -> RunState {
        *lock(&self.state)
    }

    pub fn metrics(&self) -> CollectorMetrics {
        lock(&self.metrics).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.values).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.values).is_empty()
    }
}

impl<K, V> Collector<K, V>
where
    K: Send + 'static,
    V: Clone + Send + 'static,
{
    /// A copy of every value collected so far, in arrival order.
    pub fn values(&self) -> Vec<V> {
        lock(&self.values).clone()
    }
}
