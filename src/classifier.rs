use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::clock::elapsed_between;
use crate::types::SourceId;

/// Tuning for busy/light classification and batch aging.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Idle time after which a source's count decays to zero.
    pub window: Duration,
    pub base_threshold: f64,
    pub min_threshold: f64,
    pub base_interval: Duration,
    /// Events per interval step.
    pub interval_step_events: u64,
    /// Interval growth per step, as a fraction of the base interval.
    pub interval_step_factor: f64,
    pub advisory_base: u64,
    pub advisory_cap: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            base_threshold: 100.0,
            min_threshold: 10.0,
            base_interval: Duration::from_secs(10),
            interval_step_events: 10,
            interval_step_factor: 0.5,
            advisory_base: 10,
            advisory_cap: 50,
        }
    }
}

/// Recent event volume of one source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventCounter {
    pub count: u64,
    pub last_event: Option<DateTime<Utc>>,
    /// Informational threshold written by the ramp-up controller.
    pub advisory_threshold: u64,
}

/// Decides which sources are busy enough to batch.
///
/// The threshold is shared: when the average source is over the base
/// threshold, every source's bar drops, pushing more traffic into batches.
#[derive(Debug, Default)]
pub struct BusynessClassifier {
    counters: Mutex<HashMap<SourceId, EventCounter>>,
    config: ClassifierConfig,
}

impl BusynessClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Whether `source` currently counts as busy.
    ///
    /// Decays a stale counter first but never increments it.
    pub async fn is_busy(&self, source: &SourceId, now: DateTime<Utc>) -> bool {
        let mut counters = self.counters.lock().await;
        let counter = counters.entry(source.clone()).or_default();
        if let Some(last) = counter.last_event {
            if elapsed_between(last, now) > self.config.window {
                counter.count = 0;
            }
        }
        let count = counter.count;

        let total: u64 = counters.values().map(|c| c.count).sum();
        let mean = total as f64 / counters.len() as f64;
        let threshold = self.effective_threshold(mean);

        tracing::debug!(source = %source, count, threshold, "busyness check");
        count as f64 >= threshold
    }

    /// Per-source threshold given the mean count across all sources.
    pub fn effective_threshold(&self, mean: f64) -> f64 {
        let base = self.config.base_threshold;
        if mean > base {
            (base - (mean - base) / 2.0).max(self.config.min_threshold)
        } else {
            base
        }
    }

    /// Account one handled unit for `source`.
    pub async fn record_event(&self, source: &SourceId, now: DateTime<Utc>) {
        let mut counters = self.counters.lock().await;
        let counter = counters.entry(source.clone()).or_default();
        counter.count += 1;
        counter.last_event = Some(now);
    }

    /// How long a batch for `source` may age before it is force-flushed.
    ///
    /// Busier sources wait longer so their deliveries are denser.
    pub async fn batch_interval(&self, source: &SourceId) -> Duration {
        let count = self.count(source).await;
        self.interval_for_count(count)
    }

    pub fn interval_for_count(&self, count: u64) -> Duration {
        let steps = count / self.config.interval_step_events.max(1);
        let multiplier = 1.0 + steps as f64 * self.config.interval_step_factor;
        self.config.base_interval.mul_f64(multiplier)
    }

    pub async fn count(&self, source: &SourceId) -> u64 {
        let counters = self.counters.lock().await;
        counters.get(source).map(|c| c.count).unwrap_or(0)
    }

    pub async fn counter(&self, source: &SourceId) -> Option<EventCounter> {
        self.counters.lock().await.get(source).copied()
    }

    /// Rescale every known source's advisory threshold by `factor` in `[0, 1]`.
    pub async fn apply_ramp(&self, factor: f64) {
        let factor = factor.clamp(0.0, 1.0);
        let mut counters = self.counters.lock().await;
        for counter in counters.values_mut() {
            let target =
                (self.config.advisory_base + counter.count / 10).min(self.config.advisory_cap);
            counter.advisory_threshold = (target as f64 * factor) as u64;
        }
    }

    pub(crate) async fn forget(&self, source: &SourceId) {
        self.counters.lock().await.remove(source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    async fn bump(classifier: &BusynessClassifier, source: &SourceId, n: u64, at: DateTime<Utc>) {
        for _ in 0..n {
            classifier.record_event(source, at).await;
        }
    }

    #[test]
    fn threshold_drops_with_mean_and_floors() {
        let classifier = BusynessClassifier::default();
        assert_eq!(classifier.effective_threshold(0.0), 100.0);
        assert_eq!(classifier.effective_threshold(100.0), 100.0);

        let mut previous = classifier.effective_threshold(100.0);
        for mean in [100.5, 101.0, 120.0, 150.0, 270.0] {
            let threshold = classifier.effective_threshold(mean);
            assert!(threshold < previous, "{mean} -> {threshold}");
            previous = threshold;
        }
        assert_eq!(classifier.effective_threshold(120.0), 90.0);
        assert_eq!(classifier.effective_threshold(280.0), 10.0);
        assert_eq!(classifier.effective_threshold(10_000.0), 10.0);
    }

    #[tokio::test]
    async fn busy_iff_count_reaches_threshold() {
        let classifier = BusynessClassifier::default();
        let busy = SourceId::from("busy");
        let quiet = SourceId::from("quiet");
        let now = t0();

        // Two sources: mean stays at or below 100 while busy has up to 200.
        assert!(!classifier.is_busy(&quiet, now).await);
        bump(&classifier, &busy, 99, now).await;
        assert!(!classifier.is_busy(&busy, now).await);
        bump(&classifier, &busy, 1, now).await;
        assert!(classifier.is_busy(&busy, now).await);
        assert!(!classifier.is_busy(&quiet, now).await);
    }

    #[tokio::test]
    async fn high_mean_lowers_everyones_bar() {
        let classifier = BusynessClassifier::default();
        let a = SourceId::from("a");
        let b = SourceId::from("b");
        let now = t0();

        bump(&classifier, &a, 300, now).await;
        bump(&classifier, &b, 60, now).await;
        // mean 180 -> threshold max(10, 100 - 40) = 60
        assert!(classifier.is_busy(&b, now).await);
    }

    #[tokio::test]
    async fn stale_counts_decay_on_check() {
        let classifier = BusynessClassifier::default();
        let source = SourceId::from("s");
        bump(&classifier, &source, 150, t0()).await;
        assert!(classifier.is_busy(&source, t0() + chrono::Duration::seconds(60)).await);
        assert!(!classifier.is_busy(&source, t0() + chrono::Duration::seconds(61)).await);
        assert_eq!(classifier.count(&source).await, 0);
    }

    #[tokio::test]
    async fn interval_grows_in_steps() {
        let classifier = BusynessClassifier::default();
        assert_eq!(classifier.interval_for_count(0), Duration::from_secs(10));
        assert_eq!(classifier.interval_for_count(9), Duration::from_secs(10));
        assert_eq!(classifier.interval_for_count(10), Duration::from_secs(15));
        assert_eq!(classifier.interval_for_count(120), Duration::from_secs(70));

        let source = SourceId::from("s");
        bump(&classifier, &source, 25, t0()).await;
        assert_eq!(classifier.batch_interval(&source).await, Duration::from_secs(20));
    }

    #[tokio::test]
    async fn ramp_scales_advisory_thresholds() {
        let classifier = BusynessClassifier::default();
        let small = SourceId::from("small");
        let huge = SourceId::from("huge");
        bump(&classifier, &small, 30, t0()).await;
        bump(&classifier, &huge, 1_000, t0()).await;

        classifier.apply_ramp(0.5).await;
        assert_eq!(classifier.counter(&small).await.map(|c| c.advisory_threshold), Some(6));
        assert_eq!(classifier.counter(&huge).await.map(|c| c.advisory_threshold), Some(25));

        classifier.apply_ramp(1.0).await;
        assert_eq!(classifier.counter(&small).await.map(|c| c.advisory_threshold), Some(13));
        assert_eq!(classifier.counter(&huge).await.map(|c| c.advisory_threshold), Some(50));
    }
}
