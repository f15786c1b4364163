pub mod client;
pub mod codec;
pub mod collector;
pub mod config;
pub mod errors;
pub mod telemetry;

pub use client::kafka::KafkaClient;
pub use client::mock::MockClient;
pub use client::{Batch, ConsumerClient, Record};
pub use collector::{Collector, ExitReason, RunOptions, RunState, RunSummary};
pub use config::{CollectorConfig, ConsumerProperties};
pub use errors::{CollectorError, Result};
