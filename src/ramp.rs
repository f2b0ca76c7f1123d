use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{sleep, Instant};

use crate::classifier::BusynessClassifier;

/// Fraction of the ramp-up window that has elapsed, capped at 1.
pub fn ramp_factor(elapsed: Duration, window: Duration) -> f64 {
    if window.is_zero() {
        return 1.0;
    }
    (elapsed.as_secs_f64() / window.as_secs_f64()).min(1.0)
}

/// Startup controller that scales advisory thresholds from zero to their
/// full value over a fixed window, then exits for good.
pub struct RampUpController {
    classifier: Arc<BusynessClassifier>,
    window: Duration,
    tick: Duration,
}

impl RampUpController {
    pub fn new(classifier: Arc<BusynessClassifier>, window: Duration, tick: Duration) -> Self {
        Self {
            classifier,
            window,
            tick,
        }
    }

    /// Apply the ramp for `elapsed` and return the factor used.
    pub async fn step(&self, elapsed: Duration) -> f64 {
        let factor = ramp_factor(elapsed, self.window);
        self.classifier.apply_ramp(factor).await;
        factor
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let started = Instant::now();
        tracing::info!(window_secs = self.window.as_secs(), "ramp-up started");
        loop {
            if self.step(started.elapsed()).await >= 1.0 {
                tracing::info!("ramp-up complete");
                return;
            }
            tokio::select! {
                _ = sleep(self.tick) => {}
                _ = shutdown.changed() => {
                    tracing::debug!("ramp-up interrupted by shutdown");
                    return;
                }
            }
        }
    }
}
