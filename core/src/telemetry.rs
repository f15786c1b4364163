use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "collector_core=info,runner_container=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct CollectorMetrics {
    pub runs: usize,
    pub polls: usize,
    pub empty_polls: usize,
    pub records: usize,
    pub commits: usize,
    pub commit_failures: usize,
}

impl CollectorMetrics {
    pub fn avg_batch_size(&self) -> f64 {
        let non_empty = self.polls.saturating_sub(self.empty_polls);
        if non_empty == 0 {
            0.0
        } else {
            self.records as f64 / non_empty as f64
        }
    }
}
