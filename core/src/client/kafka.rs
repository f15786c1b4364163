use std::borrow::Cow;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Message};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::client::{Batch, ConsumerClient, Record};
use crate::codec::FromPayload;
use crate::config::ConsumerProperties;
use crate::errors::ClientError;

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_MAX_POLL_RECORDS: usize = 500;
/// How long a poll keeps draining once the first record has arrived.
const FETCH_LINGER: Duration = Duration::from_millis(100);
/// Port librdkafka assumes for bootstrap entries that name none.
const DEFAULT_BROKER_PORT: u16 = 9092;
/// Stand-in deadline for timeouts too large to add to `Instant::now()`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Holds the consumer until `close` takes it.
///
/// Callers get a shared handle so the lock is never held across an await.
struct ConsumerSlot<T> {
    inner: Mutex<Option<Arc<T>>>,
}

impl<T> ConsumerSlot<T> {
    fn new(consumer: T) -> Self {
        Self {
            inner: Mutex::new(Some(Arc::new(consumer))),
        }
    }

    fn get(&self) -> Result<Arc<T>, ClientError> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ClientError::Closed)
    }

    fn take(&self) -> Option<Arc<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// Broker client backed by an rdkafka [`StreamConsumer`].
pub struct KafkaClient<K, V> {
    consumer: ConsumerSlot<StreamConsumer>,
    wakeup_requested: AtomicBool,
    wakeup: Notify,
    uncommitted: AtomicUsize,
    max_poll_records: usize,
    _codec: PhantomData<fn() -> (K, V)>,
}

impl<K, V> KafkaClient<K, V>
where
    K: FromPayload,
    V: FromPayload,
{
    /// Creates the consumer and checks that the cluster answers.
    ///
    /// Fails with [`ClientError::BrokerUnavailable`] when no bootstrap server
    /// resolves or the metadata request does not complete.
    pub async fn connect(props: &ConsumerProperties) -> Result<Self, ClientError> {
        props.validate().map_err(|e| ClientError::Other {
            reason: e.to_string(),
        })?;

        if props.key_codec != K::CODEC || props.value_codec != V::CODEC {
            warn!(
                "Configured codecs ({:?}, {:?}) differ from client types ({:?}, {:?})",
                props.key_codec,
                props.value_codec,
                K::CODEC,
                V::CODEC
            );
        }

        ensure_resolvable(props).await?;

        let consumer: StreamConsumer = props.to_client_config().create()?;

        let consumer = tokio::task::spawn_blocking(move || {
            consumer
                .fetch_metadata(None, METADATA_TIMEOUT)
                .map(|metadata| (consumer, metadata.brokers().len()))
        })
        .await
        .map_err(|e| ClientError::Other {
            reason: e.to_string(),
        })?;

        let (consumer, brokers) = consumer.map_err(|e| ClientError::BrokerUnavailable {
            reason: e.to_string(),
        })?;

        info!(
            "Connected to Kafka cluster with {} broker(s), group {}",
            brokers, props.group_id
        );

        Ok(Self {
            consumer: ConsumerSlot::new(consumer),
            wakeup_requested: AtomicBool::new(false),
            wakeup: Notify::new(),
            uncommitted: AtomicUsize::new(0),
            max_poll_records: props
                .max_poll_records
                .map(|n| n as usize)
                .unwrap_or(DEFAULT_MAX_POLL_RECORDS),
            _codec: PhantomData,
        })
    }

    fn take_wakeup(&self) -> bool {
        self.wakeup_requested.swap(false, Ordering::AcqRel)
    }

    fn convert_message(&self, message: &BorrowedMessage<'_>) -> Result<Record<K, V>, ClientError> {
        let key = message.key().map(K::from_payload).transpose()?;
        let value = V::from_payload(message.payload().unwrap_or_default())?;

        Ok(Record {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key,
            value,
            timestamp: message
                .timestamp()
                .to_millis()
                .and_then(DateTime::from_timestamp_millis),
        })
    }
}

#[async_trait]
impl<K, V> ConsumerClient<K, V> for KafkaClient<K, V>
where
    K: FromPayload + Send + 'static,
    V: FromPayload + Send + 'static,
{
    fn subscribe(&self, topics: &[&str]) -> Result<(), ClientError> {
        let consumer = self.consumer.get()?;

        consumer.subscribe(topics).map_err(map_kafka_error)?;
        info!("Subscribed to Kafka topics: {:?}", topics);
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> Result<Batch<K, V>, ClientError> {
        let consumer = self.consumer.get()?;

        if consumer.subscription()?.count() == 0 {
            return Err(ClientError::NotSubscribed);
        }

        let notified = self.wakeup.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.take_wakeup() {
            return Err(ClientError::Wakeup);
        }

        let mut records = Vec::new();
        let mut deadline = poll_deadline(timeout);

        loop {
            tokio::select! {
                biased;
                _ = &mut notified => {
                    if records.is_empty() {
                        self.take_wakeup();
                        return Err(ClientError::Wakeup);
                    }
                    // hand out what was already read; the next poll reports the wakeup
                    break;
                }
                _ = tokio::time::sleep_until(deadline) => break,
                message = consumer.recv() => {
                    let message = message.map_err(map_kafka_error)?;
                    debug!(
                        "Received message from partition {} offset {}",
                        message.partition(),
                        message.offset()
                    );
                    records.push(self.convert_message(&message)?);

                    if records.len() >= self.max_poll_records {
                        break;
                    }
                    if records.len() == 1 {
                        deadline = deadline.min(Instant::now() + FETCH_LINGER);
                    }
                }
            }
        }

        if !records.is_empty() {
            self.uncommitted.fetch_add(records.len(), Ordering::AcqRel);
            debug!("Consumed batch of {} messages", records.len());
        }

        Ok(Batch::new(records))
    }

    fn commit_async(&self) -> Result<(), ClientError> {
        let consumer = self.consumer.get()?;

        let pending = self.uncommitted.swap(0, Ordering::AcqRel);
        if pending == 0 {
            return Ok(());
        }

        consumer
            .commit_consumer_state(CommitMode::Async)
            .map_err(map_kafka_error)?;
        debug!("Requested async commit covering {} messages", pending);
        Ok(())
    }

    fn wakeup(&self) {
        self.wakeup_requested.store(true, Ordering::Release);
        self.wakeup.notify_waiters();
    }

    async fn close(&self) -> Result<(), ClientError> {
        let consumer = self.consumer.take();

        if let Some(consumer) = consumer {
            consumer.unsubscribe();
            // dropping the consumer leaves the group and may block on librdkafka
            tokio::task::spawn_blocking(move || drop(consumer))
                .await
                .map_err(|e| ClientError::Other {
                    reason: e.to_string(),
                })?;
            info!("Kafka consumer closed");
        }
        Ok(())
    }
}

fn poll_deadline(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Strips any `scheme://` prefix and adds the default port when none is given.
fn lookup_target(server: &str) -> Cow<'_, str> {
    let host_port = server.rsplit("://").next().unwrap_or(server);

    let has_port = if let Some(rest) = host_port.strip_prefix('[') {
        rest.contains("]:")
    } else {
        host_port.matches(':').count() == 1
    };

    if has_port {
        Cow::Borrowed(host_port)
    } else if host_port.starts_with('[') {
        Cow::Owned(format!("{}:{}", host_port, DEFAULT_BROKER_PORT))
    } else if host_port.contains(':') {
        // bare IPv6 address
        Cow::Owned(format!("[{}]:{}", host_port, DEFAULT_BROKER_PORT))
    } else {
        Cow::Owned(format!("{}:{}", host_port, DEFAULT_BROKER_PORT))
    }
}

/// Fails unless at least one bootstrap server resolves to an address.
async fn ensure_resolvable(props: &ConsumerProperties) -> Result<(), ClientError> {
    for server in props.bootstrap_servers() {
        let target = lookup_target(server);
        match tokio::net::lookup_host(target.as_ref()).await {
            Ok(mut addrs) => {
                if addrs.next().is_some() {
                    return Ok(());
                }
                warn!("Bootstrap server {} resolved to no addresses", server)
            }
            Err(e) => warn!("Couldn't resolve bootstrap server {}: {}", server, e),
        }
    }

    Err(ClientError::BrokerUnavailable {
        reason: format!(
            "No resolvable bootstrap urls given in bootstrap.servers: {}",
            props.bootstrap_servers
        ),
    })
}

fn map_kafka_error(err: KafkaError) -> ClientError {
    match err.rdkafka_error_code() {
        Some(RDKafkaErrorCode::AllBrokersDown)
        | Some(RDKafkaErrorCode::BrokerTransportFailure)
        | Some(RDKafkaErrorCode::Resolve) => ClientError::BrokerUnavailable {
            reason: err.to_string(),
        },
        _ => ClientError::Kafka(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::ClientConfig;
    use rdkafka::producer::{FutureProducer, FutureRecord};

    const TEST_TOPIC: &str = "test-topic";
    const KAFKA_BOOTSTRAP_SERVERS: &str = "localhost:9092";

    #[tokio::test]
    async fn test_unresolvable_broker_fails_before_poll() {
        let props = ConsumerProperties::new("bad.server:4040");

        let result = KafkaClient::<i32, String>::connect(&props).await;
        match result {
            Err(ClientError::BrokerUnavailable { reason }) => {
                assert!(reason.contains("bad.server:4040"));
            }
            Err(other) => panic!("unexpected error: {:?}", other),
            Ok(_) => panic!("connect should fail for an unresolvable broker"),
        }
    }

    #[tokio::test]
    async fn test_empty_bootstrap_servers_rejected() {
        let props = ConsumerProperties::new("");
        let result = KafkaClient::<i32, String>::connect(&props).await;
        assert!(matches!(result, Err(ClientError::Other { .. })));
    }

    #[tokio::test]
    async fn test_portless_bootstrap_server_resolves() {
        let props = ConsumerProperties::new("localhost");
        ensure_resolvable(&props)
            .await
            .expect("a host without a port should use the default broker port");
    }

    #[test]
    fn test_lookup_target_adds_default_port() {
        assert_eq!(lookup_target("kafka1"), "kafka1:9092");
        assert_eq!(lookup_target("kafka1:19092"), "kafka1:19092");
        assert_eq!(lookup_target("PLAINTEXT://kafka1"), "kafka1:9092");
        assert_eq!(lookup_target("SSL://kafka1:9093"), "kafka1:9093");
        assert_eq!(lookup_target("[::1]:9093"), "[::1]:9093");
        assert_eq!(lookup_target("[::1]"), "[::1]:9092");
        assert_eq!(lookup_target("::1"), "[::1]:9092");
    }

    #[test]
    fn test_huge_poll_timeout_does_not_overflow() {
        let deadline = poll_deadline(Duration::from_secs(u64::MAX));
        assert!(deadline > Instant::now() + Duration::from_secs(86400));

        let short = poll_deadline(Duration::from_millis(10));
        assert!(short <= Instant::now() + Duration::from_millis(10));
    }

    #[test]
    fn test_slot_stays_open_until_taken() {
        let slot = ConsumerSlot::new(7u32);

        // a pending poll keeps its own handle
        let in_flight = slot.get().unwrap();
        assert_eq!(*slot.get().unwrap(), 7);

        let taken = slot.take().expect("first take returns the consumer");
        assert!(matches!(slot.get(), Err(ClientError::Closed)));
        assert!(slot.take().is_none());
        assert_eq!(Arc::strong_count(&taken), 2);
        drop(in_flight);
        assert_eq!(Arc::strong_count(&taken), 1);
    }

    #[test]
    fn test_transport_errors_map_to_broker_unavailable() {
        let err = map_kafka_error(KafkaError::MessageConsumption(
            RDKafkaErrorCode::AllBrokersDown,
        ));
        assert!(matches!(err, ClientError::BrokerUnavailable { .. }));

        let err = map_kafka_error(KafkaError::MessageConsumption(
            RDKafkaErrorCode::UnknownTopicOrPartition,
        ));
        assert!(matches!(err, ClientError::Kafka(_)));
    }

    async fn produce_messages(topic: &str, count: i32) {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", KAFKA_BOOTSTRAP_SERVERS)
            .set("message.timeout.ms", "5000")
            .create()
            .expect("Failed to create producer");

        for i in 0..count {
            let payload = format!("message-{}", i);
            producer
                .send(
                    FutureRecord::to(topic)
                        .payload(&payload)
                        .key(&i.to_be_bytes()[..]),
                    Duration::from_secs(5),
                )
                .await
                .expect("Failed to send message");
        }
    }

    #[tokio::test]
    #[ignore = "requires a Kafka broker on localhost:9092"]
    async fn test_kafka_client_consume_and_commit() {
        produce_messages(TEST_TOPIC, 10).await;

        let props = ConsumerProperties::new(KAFKA_BOOTSTRAP_SERVERS);
        let client = KafkaClient::<i32, String>::connect(&props)
            .await
            .expect("Failed to connect");
        client.subscribe(&[TEST_TOPIC]).unwrap();

        let deadline = Instant::now() + Duration::from_secs(30);
        let mut values = Vec::new();
        while values.len() < 10 && Instant::now() < deadline {
            let batch = client.poll(Duration::from_secs(5)).await.unwrap();
            values.extend(batch.into_iter().map(|r| r.value));
            client.commit_async().unwrap();
        }

        assert_eq!(values.len(), 10, "Should have consumed all 10 messages");
        assert_eq!(values[0], "message-0");

        client.close().await.unwrap();
        assert!(matches!(
            client.poll(Duration::from_millis(10)).await,
            Err(ClientError::Closed)
        ));
    }
}
