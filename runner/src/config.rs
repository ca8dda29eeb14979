use std::time::Duration;

use history::HistoryWindow;
use partition::{AggregatorConfig, LocalDispatcherConfig};

#[derive(Clone, Debug, PartialEq)]
pub struct AppConfig {
    /// SQLite connection string. `None` keeps every record in memory, which
    /// is lost when the process exits.
    pub database_url: Option<String>,

    /// `APP_ENV=production` switches logging to JSON.
    pub production: bool,

    // =========================
    // Worker pool
    // =========================
    /// Number of in-process workers behind the round-robin pool.
    ///
    /// With two or more workers the last one is reached through the channel
    /// transport, the way a remote worker would be.
    pub workers: usize,

    /// Per-worker threshold multipliers, in pool order.
    ///
    /// Missing entries default to 1. A worker with weight 2 admits twice as
    /// many concurrent partitions as a weight-1 worker at the same threshold.
    pub worker_weights: Vec<f64>,

    /// Pause (ms) a local worker takes after accepting a partition before it
    /// reports its spare capacity.
    ///
    /// Short partitions may finish inside the pause, so the reported
    /// capacity is closer to the truth. Zero disables it.
    pub settle_delay_ms: u64,

    // =========================
    // Partitioning
    // =========================
    /// Partitions created per master step execution.
    pub grid_size: usize,

    /// Hard wall-clock bound (ms) for one partition batch, from submission
    /// to the last result.
    ///
    /// On expiry the master step fails; partitions already running are left
    /// to finish and their results are discarded.
    pub aggregation_timeout_ms: u64,

    /// How often (ms) the coordinator re-reads an outstanding partition.
    pub poll_interval_ms: u64,

    /// Pause (ms) before a rejected partition request is sent again.
    pub retry_delay_ms: u64,

    // =========================
    // Launch control and metrics
    // =========================
    /// Job names that may only have one running execution at a time.
    pub tracked_jobs: Vec<String>,

    /// Recent executions used for statistics.
    pub history_window: usize,

    /// Of those, how many are considered when picking the latest by start
    /// time.
    pub latest_window: usize,

    /// Interval (ms) of the periodic metrics report. Zero disables it.
    pub metrics_interval_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        let aggregator = AggregatorConfig::default();
        let window = HistoryWindow::default();

        Self {
            database_url: None,
            production: false,

            workers: 3,
            worker_weights: Vec::new(),
            settle_delay_ms: LocalDispatcherConfig::default().settle_delay.as_millis() as u64,

            grid_size: 8,
            aggregation_timeout_ms: aggregator.timeout.as_millis() as u64,
            poll_interval_ms: aggregator.poll_interval.as_millis() as u64,
            retry_delay_ms: aggregator.retry_delay.as_millis() as u64,

            tracked_jobs: Vec::new(),
            history_window: window.executions,
            latest_window: window.latest,
            metrics_interval_ms: 5_000,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup. Unparseable values fall
    /// back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let number = |key: &str, default: u64| -> u64 {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        let count = |key: &str, default: usize| -> usize {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };

        Self {
            database_url: lookup("BATCHD_DATABASE_URL").filter(|v| !v.trim().is_empty()),
            production: lookup("APP_ENV").as_deref() == Some("production"),

            workers: count("BATCHD_WORKERS", d.workers).max(1),
            worker_weights: lookup("BATCHD_WORKER_WEIGHTS")
                .map(|v| {
                    split_list(&v)
                        .map(|w| w.parse().unwrap_or(1.0))
                        .collect()
                })
                .unwrap_or_default(),
            settle_delay_ms: number("BATCHD_SETTLE_DELAY_MS", d.settle_delay_ms),

            grid_size: count("BATCHD_GRID_SIZE", d.grid_size),
            aggregation_timeout_ms: number("BATCHD_AGGREGATION_TIMEOUT_MS", d.aggregation_timeout_ms),
            poll_interval_ms: number("BATCHD_POLL_INTERVAL_MS", d.poll_interval_ms),
            retry_delay_ms: number("BATCHD_RETRY_DELAY_MS", d.retry_delay_ms),

            tracked_jobs: lookup("BATCHD_TRACKED_JOBS")
                .map(|v| split_list(&v).map(str::to_string).collect())
                .unwrap_or_default(),
            history_window: count("BATCHD_HISTORY_WINDOW", d.history_window),
            latest_window: count("BATCHD_LATEST_WINDOW", d.latest_window),
            metrics_interval_ms: number("BATCHD_METRICS_INTERVAL_MS", d.metrics_interval_ms),
        }
    }

    pub fn weight_for(&self, worker: usize) -> f64 {
        self.worker_weights.get(worker).copied().unwrap_or(1.0)
    }

    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig {
            timeout: Duration::from_millis(self.aggregation_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            expected_pool_size: self.workers,
        }
    }

    /// Weights are applied by the pool wrapper, so every local worker runs
    /// with weight 1.
    pub fn dispatcher_config(&self) -> LocalDispatcherConfig {
        LocalDispatcherConfig {
            weight: 1.0,
            settle_delay: Duration::from_millis(self.settle_delay_ms),
        }
    }

    pub fn history_window(&self) -> HistoryWindow {
        HistoryWindow {
            executions: self.history_window,
            latest: self.latest_window,
        }
    }

    pub fn metrics_interval(&self) -> Option<Duration> {
        (self.metrics_interval_ms > 0).then(|| Duration::from_millis(self.metrics_interval_ms))
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}
