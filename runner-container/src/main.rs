use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use collector_core::codec::{Codec, FromPayload};
use collector_core::config::{CollectorConfig, load_config};
use collector_core::errors::CollectorError;
use collector_core::telemetry::init_tracing;
use collector_core::{Collector, KafkaClient, RunOptions};
use serde_json::Value;
use tracing::{error, info, warn};

/// Entry point for running a long-lived collector on container hosting
/// services like AWS EKS, ECS, etc.
///
/// Loads the config from the file given as first argument, or from the
/// `COLLECTOR_CONFIG` env var, then polls the configured topic until Ctrl-C.
/// Broker outages end the run; the runner reconnects after a delay.
#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = load_config(config_path.as_deref()).await?;

    match (config.kafka.key_codec, config.kafka.value_codec) {
        (Codec::Integer, Codec::String) => collect::<i32, String>(config).await,
        (Codec::Integer, Codec::Json) => collect::<i32, Value>(config).await,
        (Codec::Integer, Codec::Bytes) => collect::<i32, Vec<u8>>(config).await,
        (Codec::Bytes, Codec::String) => collect::<Vec<u8>, String>(config).await,
        (Codec::Bytes, Codec::Json) => collect::<Vec<u8>, Value>(config).await,
        (Codec::Bytes, Codec::Bytes) => collect::<Vec<u8>, Vec<u8>>(config).await,
        (key, value) => bail!("Unsupported codec pair: key {:?}, value {:?}", key, value),
    }
}

async fn collect<K, V>(config: CollectorConfig) -> Result<()>
where
    K: FromPayload + Send + 'static,
    V: FromPayload + Clone + Debug + Send + 'static,
{
    let collector = Arc::new(Collector::<K, V>::from_properties(config.kafka.clone()));
    let options = RunOptions::from(&config.run);
    let shutting_down = Arc::new(AtomicBool::new(false));

    let stopper = collector.clone();
    let flag = shutting_down.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            flag.store(true, Ordering::Release);
            stopper.stop();
        }
    });

    while !shutting_down.load(Ordering::Acquire) {
        let outcome = match KafkaClient::<K, V>::connect(&config.kafka).await {
            Ok(client) => {
                collector.bind(Arc::new(client));
                // a stop issued before the bind never reached this client
                if shutting_down.load(Ordering::Acquire) {
                    break;
                }
                collector.run_with(&config.run.topic, options).await
            }
            Err(e) => Err(CollectorError::from(e)),
        };

        match outcome {
            Ok(summary) => {
                info!(
                    "Collector stopped ({:?}) after {} polls, {} records",
                    summary.exit, summary.polls, summary.records
                );
                break;
            }
            Err(e) if shutting_down.load(Ordering::Acquire) => {
                warn!("Shutting down after error: {}", e);
                break;
            }
            Err(e) if e.is_retryable() => {
                warn!("A transient error occurred, will retry: {}", e);
                tokio::time::sleep(Duration::from_millis(e.get_retry_delay_ms())).await;
            }
            Err(e) => {
                error!("A fatal error occurred: {}", e);
                return Err(e).context("Collector run failed");
            }
        }
    }

    let metrics = collector.metrics();
    info!(
        "Collected {} values over {} runs ({} polls, {} commit failures)",
        collector.len(),
        metrics.runs,
        metrics.polls,
        metrics.commit_failures
    );
    if let Some(last) = collector.values().last() {
        info!("Last value: {:?}", last);
    }
    Ok(())
}
