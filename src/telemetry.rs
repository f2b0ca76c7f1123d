use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tokio::time::sleep;

use crate::clock::Clock;

#[cfg(feature = "metrics")]
fn metric_gauge(name: &'static str, value: f64) {
    metrics::gauge!(name, value);
}

#[cfg(not(feature = "metrics"))]
fn metric_gauge(_name: &'static str, _value: f64) {}

/// Process-wide count of outbound HTTP attempts, keyed by millisecond.
#[derive(Debug, Default)]
pub struct RequestLedger {
    entries: Mutex<BTreeMap<i64, u64>>,
}

impl RequestLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one HTTP attempt made at `at`.
    pub async fn record(&self, at: DateTime<Utc>) {
        let mut entries = self.entries.lock().await;
        *entries.entry(at.timestamp_millis()).or_insert(0) += 1;
    }

    /// Number of attempts within `window` before `now` (inclusive).
    pub async fn requests_within(&self, now: DateTime<Utc>, window: Duration) -> u64 {
        let cutoff = window_start(now, window);
        let entries = self.entries.lock().await;
        entries.range(cutoff..).map(|(_, count)| count).sum()
    }

    /// Average requests per second over the trailing window, dropping every
    /// entry older than the window.
    pub async fn report(&self, now: DateTime<Utc>, window: Duration) -> f64 {
        let cutoff = window_start(now, window);
        let mut entries = self.entries.lock().await;
        *entries = entries.split_off(&cutoff);

        let total: u64 = entries.values().sum();
        let secs = window.as_secs_f64();
        if secs == 0.0 {
            0.0
        } else {
            total as f64 / secs
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

fn window_start(now: DateTime<Utc>, window: Duration) -> i64 {
    now.timestamp_millis() - window.as_millis() as i64
}

/// Periodic request-rate reporter.
pub struct Telemetry {
    ledger: Arc<RequestLedger>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    window: Duration,
}

impl Telemetry {
    pub fn new(
        ledger: Arc<RequestLedger>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        window: Duration,
    ) -> Self {
        Self {
            ledger,
            clock,
            interval,
            window,
        }
    }

    /// Report once and prune the ledger.
    pub async fn tick(&self) -> f64 {
        let rate = self.ledger.report(self.clock.now(), self.window).await;
        tracing::info!(
            requests_per_second = format_args!("{rate:.2}"),
            window_secs = self.window.as_secs(),
            "estimated average webhook request rate"
        );
        metric_gauge("webhook.requests_per_second", rate);
        rate
    }

    /// Sleep, report, repeat until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = sleep(self.interval) => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            self.tick().await;
        }
        tracing::debug!("telemetry loop stopped");
    }
}
