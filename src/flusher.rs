use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::sleep;

use crate::clock::elapsed_between;
use crate::context::EngineContext;
use crate::error::DeliveryError;
use crate::store::{BatchAge, Destination, FlushReport};
use crate::types::SourceId;

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// Background scanner that force-flushes batches once they have aged past
/// their source's adaptive interval.
pub struct PeriodicFlusher {
    ctx: Arc<EngineContext>,
}

impl PeriodicFlusher {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Scan every destination once and flush the due ones concurrently.
    ///
    /// Returns how many batches were flushed successfully. Failures are
    /// logged and never stop the scan.
    pub async fn tick(&self) -> usize {
        let now = self.ctx.clock.now();
        let mut due: JoinSet<(SourceId, Result<FlushReport, DeliveryError>)> = JoinSet::new();

        for destination in self.ctx.store.snapshot().await {
            let since = match destination.batch_age().await {
                BatchAge::Empty => continue,
                BatchAge::Unstamped => {
                    let dropped = destination.discard_if_unstamped().await;
                    if dropped > 0 {
                        metric_inc("webhook.batch.discarded");
                        tracing::warn!(
                            source = %destination.id(),
                            dropped,
                            "discarding batch without timestamp"
                        );
                    }
                    continue;
                }
                BatchAge::Since(since) => since,
            };

            let interval = self.ctx.classifier.batch_interval(destination.id()).await;
            if elapsed_between(since, now) < interval {
                continue;
            }

            let Some(url) = self.ctx.registry.resolve_endpoint(destination.id()).await else {
                let dropped = destination.discard().await;
                metric_inc("webhook.batch.discarded");
                tracing::warn!(
                    source = %destination.id(),
                    dropped,
                    "endpoint gone, discarding batch"
                );
                continue;
            };
            destination.sender().set_url(&url).await;

            due.spawn(flush_one(destination));
        }

        let mut flushed = 0;
        while let Some(joined) = due.join_next().await {
            match joined {
                Ok((source, Ok(report))) => {
                    flushed += 1;
                    metric_inc("webhook.batch.flushed");
                    tracing::debug!(
                        source = %source,
                        units = report.units,
                        chunks = report.chunks,
                        "flushed aged batch"
                    );
                }
                Ok((source, Err(err))) => {
                    tracing::error!(source = %source, error = %err, "error flushing pending batch");
                }
                Err(err) => {
                    tracing::error!(error = %err, "batch flush task panicked");
                }
            }
        }
        flushed
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let period = self.ctx.config.flush_tick();
        tracing::info!(tick_ms = period.as_millis() as u64, "periodic flusher started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.tick().await;
            tokio::select! {
                _ = sleep(period) => {}
                _ = shutdown.changed() => break,
            }
        }
        tracing::info!("periodic flusher stopped");
    }
}

async fn flush_one(
    destination: Arc<Destination>,
) -> (SourceId, Result<FlushReport, DeliveryError>) {
    let result = destination.flush().await;
    (destination.id().clone(), result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::dispatcher::DispatcherConfig;
    use crate::registry::InMemoryRegistry;
    use crate::sender::{Transport, TransportResponse};
    use crate::types::{Color, NotificationUnit, WebhookPayload};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingTransport {
        posts: AtomicUsize,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn post(
            &self,
            _url: &str,
            _payload: &WebhookPayload,
        ) -> Result<TransportResponse, DeliveryError> {
            self.posts.fetch_add(1, Ordering::SeqCst);
            Ok(TransportResponse::new(204))
        }
    }

    #[tokio::test]
    async fn unstamped_batches_are_discarded_unsent() {
        let registry = Arc::new(InMemoryRegistry::new());
        let source = SourceId::from("guild");
        registry.register(source.clone(), "https://hooks.test/guild").await;
        let transport = Arc::new(CountingTransport::default());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let ctx = Arc::new(EngineContext::new(
            DispatcherConfig::default(),
            registry,
            transport.clone(),
            clock,
        ));

        let destination = ctx.destination(&source, "https://hooks.test/guild").await;
        destination
            .push_raw(NotificationUnit::new("no stamp", Color::Blue).with_field("a", "b"))
            .await;

        let flusher = PeriodicFlusher::new(ctx);
        assert_eq!(flusher.tick().await, 0);
        assert_eq!(destination.pending().await, 0);
        assert_eq!(transport.posts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn batches_of_removed_sources_are_dropped() {
        let registry = Arc::new(InMemoryRegistry::new());
        let source = SourceId::from("gone");
        let transport = Arc::new(CountingTransport::default());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let ctx = Arc::new(EngineContext::new(
            DispatcherConfig::default(),
            registry,
            transport.clone(),
            clock.clone(),
        ));

        let destination = ctx.destination(&source, "https://hooks.test/gone").await;
        destination
            .enqueue(NotificationUnit::new("t", Color::Red).with_field("a", "b"), clock.now())
            .await
            .expect("no flush");
        clock.advance(std::time::Duration::from_secs(30));

        assert_eq!(PeriodicFlusher::new(ctx).tick().await, 0);
        assert_eq!(destination.pending().await, 0);
        assert_eq!(transport.posts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unstamped_discard_rechecks_under_lock() {
        let registry = Arc::new(InMemoryRegistry::new());
        let source = SourceId::from("raced");
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let ctx = Arc::new(EngineContext::new(
            DispatcherConfig::default(),
            registry,
            Arc::new(CountingTransport::default()),
            clock.clone(),
        ));
        let destination = ctx.destination(&source, "https://hooks.test/raced").await;

        // a flush emptied the batch and a stamped unit arrived since the age check
        destination
            .enqueue(NotificationUnit::new("fresh", Color::Green).with_field("a", "b"), clock.now())
            .await
            .expect("no flush");
        assert_eq!(destination.discard_if_unstamped().await, 0);
        assert_eq!(destination.pending().await, 1);

        destination.discard().await;
        destination
            .push_raw(NotificationUnit::new("no stamp", Color::Blue).with_field("a", "b"))
            .await;
        assert_eq!(destination.discard_if_unstamped().await, 1);
        assert_eq!(destination.pending().await, 0);
    }
}
