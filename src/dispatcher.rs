use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::classifier::{BusynessClassifier, ClassifierConfig};
use crate::clock::{Clock, SystemClock};
use crate::context::EngineContext;
use crate::error::DispatchError;
use crate::flusher::PeriodicFlusher;
use crate::ramp::RampUpController;
use crate::registry::Registry;
use crate::sender::{RateLimitState, RetryPolicy, Transport};
use crate::store::{Destination, FlushReport};
use crate::telemetry::{RequestLedger, Telemetry};
use crate::types::{EventKind, NotificationUnit, SourceId};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// Tunables for the dispatcher. Every field has a default, so partial
/// configuration files deserialize cleanly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Idle seconds after which a source's event count resets.
    pub busy_window_secs: u64,
    pub base_busy_threshold: u64,
    pub min_busy_threshold: u64,
    /// Hard cap on one message, and the rendered batch size that triggers
    /// an immediate flush.
    pub max_message_len: usize,
    pub flush_tick_ms: u64,
    pub base_batch_interval_secs: u64,
    pub interval_step_events: u64,
    pub interval_step_factor: f64,
    pub ramp_up_secs: u64,
    pub ramp_tick_ms: u64,
    pub advisory_base: u64,
    pub advisory_cap: u64,
    pub telemetry_interval_secs: u64,
    pub telemetry_window_secs: u64,
    pub default_retry_after_ms: u64,
    pub throttle_grace_ms: u64,
    pub max_throttle_attempts: u32,
    pub max_throttle_delay_secs: u64,
    pub throttle_jitter_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            busy_window_secs: 60,
            base_busy_threshold: 100,
            min_busy_threshold: 10,
            max_message_len: 2_000,
            flush_tick_ms: 1_000,
            base_batch_interval_secs: 10,
            interval_step_events: 10,
            interval_step_factor: 0.5,
            ramp_up_secs: 300,
            ramp_tick_ms: 1_000,
            advisory_base: 10,
            advisory_cap: 50,
            telemetry_interval_secs: 60,
            telemetry_window_secs: 60,
            default_retry_after_ms: 1_000,
            throttle_grace_ms: 1_000,
            max_throttle_attempts: 5,
            max_throttle_delay_secs: 120,
            throttle_jitter_ms: 0,
            request_timeout_ms: 10_000,
        }
    }
}

impl DispatcherConfig {
    pub fn classifier_config(&self) -> ClassifierConfig {
        ClassifierConfig {
            window: Duration::from_secs(self.busy_window_secs),
            base_threshold: self.base_busy_threshold as f64,
            min_threshold: self.min_busy_threshold as f64,
            base_interval: Duration::from_secs(self.base_batch_interval_secs),
            interval_step_events: self.interval_step_events,
            interval_step_factor: self.interval_step_factor,
            advisory_base: self.advisory_base,
            advisory_cap: self.advisory_cap,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_throttle_attempts.max(1),
            max_total_delay: Duration::from_secs(self.max_throttle_delay_secs),
            default_retry_after: Duration::from_millis(self.default_retry_after_ms),
            grace: Duration::from_millis(self.throttle_grace_ms),
            jitter: Duration::from_millis(self.throttle_jitter_ms),
        }
    }

    pub fn flush_tick(&self) -> Duration {
        Duration::from_millis(self.flush_tick_ms.max(1))
    }

    pub fn ramp_tick(&self) -> Duration {
        Duration::from_millis(self.ramp_tick_ms.max(1))
    }

    pub fn ramp_up(&self) -> Duration {
        Duration::from_secs(self.ramp_up_secs)
    }

    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry_interval_secs.max(1))
    }

    pub fn telemetry_window(&self) -> Duration {
        Duration::from_secs(self.telemetry_window_secs.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// What happened to a dispatched unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The source has this event kind switched off.
    Disabled,
    /// Delivered on its own.
    Sent,
    /// Queued in the source's batch; `flushed` when the batch went out
    /// immediately because it hit the size cap.
    Batched { flushed: bool },
}

/// Adaptive webhook dispatcher.
///
/// Light sources get one message per unit. Busy sources get their units
/// coalesced into text batches, flushed when they grow too large or too old.
pub struct Dispatcher {
    ctx: Arc<EngineContext>,
    is_running: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Dispatcher delivering over HTTP with `reqwest`.
    #[cfg(feature = "http")]
    pub fn new(
        config: DispatcherConfig,
        registry: Arc<dyn Registry>,
    ) -> Result<Self, DispatchError> {
        let transport = crate::sender::HttpTransport::new(config.request_timeout())
            .map_err(|err| DispatchError::Transport(err.to_string()))?;
        Ok(Self::with_transport(config, registry, Arc::new(transport)))
    }

    pub fn with_transport(
        config: DispatcherConfig,
        registry: Arc<dyn Registry>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self::with_clock(config, registry, transport, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: DispatcherConfig,
        registry: Arc<dyn Registry>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            ctx: Arc::new(EngineContext::new(config, registry, transport, clock)),
            is_running: Arc::new(AtomicBool::new(true)),
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    /// Spawn the periodic flusher, ramp-up controller and telemetry loops.
    /// Calling it again is a no-op.
    pub fn start(&mut self) {
        if !self.handles.is_empty() || !self.is_running() {
            return;
        }

        let flusher = PeriodicFlusher::new(self.ctx.clone());
        self.handles
            .push(tokio::spawn(flusher.run(self.shutdown_tx.subscribe())));

        let ramp = RampUpController::new(
            self.ctx.classifier.clone(),
            self.ctx.config.ramp_up(),
            self.ctx.config.ramp_tick(),
        );
        self.handles
            .push(tokio::spawn(ramp.run(self.shutdown_tx.subscribe())));

        let telemetry = Telemetry::new(
            self.ctx.ledger.clone(),
            self.ctx.clock.clone(),
            self.ctx.config.telemetry_interval(),
            self.ctx.config.telemetry_window(),
        );
        self.handles
            .push(tokio::spawn(telemetry.run(self.shutdown_tx.subscribe())));
    }

    /// Route one unit for `source`: straight out for light sources, into the
    /// batch for busy ones.
    pub async fn dispatch(
        &self,
        source: &SourceId,
        event: EventKind,
        unit: NotificationUnit,
    ) -> Result<DispatchOutcome, DispatchError> {
        if !self.is_running() {
            return Err(DispatchError::Shutdown);
        }

        if !self.ctx.registry.is_event_enabled(source, event).await {
            tracing::debug!(source = %source, event = %event, "event disabled for source");
            return Ok(DispatchOutcome::Disabled);
        }

        let destination = self.resolve(source).await?;
        let now = self.ctx.clock.now();

        if self.ctx.classifier.is_busy(source, now).await {
            tracing::debug!(source = %source, event = %event, "batching event");
            let queued = destination.enqueue(unit, now).await;
            self.ctx.classifier.record_event(source, now).await;
            metric_inc("webhook.dispatch.batched");
            let flushed = queued?;
            if flushed {
                metric_inc("webhook.batch.flushed");
            }
            Ok(DispatchOutcome::Batched { flushed })
        } else {
            tracing::debug!(source = %source, event = %event, "sending individual event");
            destination.send_unit(unit).await?;
            self.ctx.classifier.record_event(source, now).await;
            metric_inc("webhook.dispatch.sent");
            Ok(DispatchOutcome::Sent)
        }
    }

    /// Queue `unit` in the batch of `source` regardless of busyness.
    /// Returns whether the batch was flushed on size.
    pub async fn enqueue(
        &self,
        source: &SourceId,
        unit: NotificationUnit,
    ) -> Result<bool, DispatchError> {
        if !self.is_running() {
            return Err(DispatchError::Shutdown);
        }
        let destination = self.resolve(source).await?;
        let flushed = destination.enqueue(unit, self.ctx.clock.now()).await?;
        Ok(flushed)
    }

    /// Flush whatever `source` has pending, right now.
    pub async fn flush(&self, source: &SourceId) -> Result<FlushReport, DispatchError> {
        let Some(destination) = self.ctx.store.get(source).await else {
            return Ok(FlushReport::default());
        };
        if destination.pending().await == 0 {
            return Ok(FlushReport::default());
        }
        let url = match self.endpoint(source).await {
            Ok(url) => url,
            Err(err) => {
                let dropped = destination.discard().await;
                metric_inc("webhook.batch.discarded");
                tracing::warn!(source = %source, dropped, "endpoint gone, discarding batch");
                return Err(err);
            }
        };
        destination.sender().set_url(&url).await;
        Ok(destination.flush().await?)
    }

    /// Run one periodic flusher pass; returns the number of batches flushed.
    pub async fn flush_due(&self) -> usize {
        PeriodicFlusher::new(self.ctx.clone()).tick().await
    }

    pub async fn is_busy(&self, source: &SourceId) -> bool {
        self.ctx.classifier.is_busy(source, self.ctx.clock.now()).await
    }

    pub async fn batch_interval(&self, source: &SourceId) -> Duration {
        self.ctx.classifier.batch_interval(source).await
    }

    /// Units waiting in the batch of `source`.
    pub async fn pending(&self, source: &SourceId) -> usize {
        match self.ctx.store.get(source).await {
            Some(destination) => destination.pending().await,
            None => 0,
        }
    }

    pub async fn rate_limit_state(&self, source: &SourceId) -> Option<RateLimitState> {
        let destination = self.ctx.store.get(source).await?;
        Some(destination.sender().state().await)
    }

    /// Average outbound requests per second over the telemetry window.
    pub async fn request_rate(&self) -> f64 {
        let window = self.ctx.config.telemetry_window();
        let total = self
            .ctx
            .ledger
            .requests_within(self.ctx.clock.now(), window)
            .await;
        total as f64 / window.as_secs_f64()
    }

    /// Forget all state for `source`, discarding its pending batch.
    pub async fn remove_destination(&self, source: &SourceId) -> usize {
        self.ctx.classifier.forget(source).await;
        match self.ctx.store.remove(source).await {
            Some(destination) => destination.discard().await,
            None => 0,
        }
    }

    pub fn classifier(&self) -> &BusynessClassifier {
        &self.ctx.classifier
    }

    pub fn ledger(&self) -> &RequestLedger {
        &self.ctx.ledger
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.ctx.config
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Stop the background loops, then make one best-effort attempt to
    /// deliver every pending batch.
    pub async fn shutdown(&mut self) {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.send_replace(true);
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }

        for destination in self.ctx.store.snapshot().await {
            if destination.pending().await == 0 {
                continue;
            }
            let source = destination.id().clone();
            if let Err(err) = self.flush(&source).await {
                tracing::warn!(source = %source, error = %err, "dropping batch at shutdown");
                destination.discard().await;
            }
        }
        tracing::info!("dispatcher shut down");
    }

    async fn endpoint(&self, source: &SourceId) -> Result<String, DispatchError> {
        match self.ctx.registry.resolve_endpoint(source).await {
            Some(url) => Ok(url),
            None => {
                tracing::warn!(source = %source, "webhook URL not found");
                Err(DispatchError::NoEndpoint {
                    source_id: source.clone(),
                })
            }
        }
    }

    async fn resolve(&self, source: &SourceId) -> Result<Arc<Destination>, DispatchError> {
        let url = self.endpoint(source).await?;
        Ok(self.ctx.destination(source, &url).await)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}
