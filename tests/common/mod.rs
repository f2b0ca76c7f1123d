#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::time::Instant;
use webhook_coalescer::{
    Color, DeliveryError, Dispatcher, DispatcherConfig, InMemoryRegistry, ManualClock,
    NotificationUnit, SourceId, Transport, TransportResponse, WebhookPayload,
};

/// One POST seen by [`ScriptedTransport`].
#[derive(Debug, Clone)]
pub struct Call {
    pub at: Instant,
    pub url: String,
    pub payload: WebhookPayload,
}

/// Fake transport replaying scripted responses, then a default one.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<TransportResponse, DeliveryError>>>,
    fallback: Result<TransportResponse, DeliveryError>,
    failing_urls: Mutex<HashSet<String>>,
    calls: Mutex<Vec<Call>>,
    latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedTransport {
    pub fn ok() -> Self {
        Self::with_fallback(Ok(TransportResponse::new(204)))
    }

    pub fn with_fallback(fallback: Result<TransportResponse, DeliveryError>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            failing_urls: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            latency: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn push(&self, response: Result<TransportResponse, DeliveryError>) {
        self.script.lock().unwrap().push_back(response);
    }

    pub fn fail_url(&self, url: &str) {
        self.failing_urls.lock().unwrap().insert(url.to_string());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn contents(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| call.payload.content)
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn post(
        &self,
        url: &str,
        payload: &WebhookPayload,
    ) -> Result<TransportResponse, DeliveryError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        self.calls.lock().unwrap().push(Call {
            at: Instant::now(),
            url: url.to_string(),
            payload: payload.clone(),
        });
        let response = if self.failing_urls.lock().unwrap().contains(url) {
            Err(DeliveryError::Network("connection reset".to_string()))
        } else {
            let scripted = self.script.lock().unwrap().pop_front();
            scripted.unwrap_or_else(|| self.fallback.clone())
        };

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        response
    }
}

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

pub fn hook_url(source: &SourceId) -> String {
    format!("https://hooks.test/{source}")
}

pub struct Harness {
    pub dispatcher: Dispatcher,
    pub registry: Arc<InMemoryRegistry>,
    pub transport: Arc<ScriptedTransport>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub async fn new(sources: &[&SourceId], transport: ScriptedTransport) -> Self {
        Self::with_config(sources, transport, DispatcherConfig::default()).await
    }

    pub async fn with_config(
        sources: &[&SourceId],
        transport: ScriptedTransport,
        config: DispatcherConfig,
    ) -> Self {
        let registry = Arc::new(InMemoryRegistry::new());
        for source in sources {
            registry.register((*source).clone(), hook_url(source)).await;
        }
        let transport = Arc::new(transport);
        let clock = Arc::new(ManualClock::new(epoch()));
        let dispatcher =
            Dispatcher::with_clock(config, registry.clone(), transport.clone(), clock.clone());
        Self {
            dispatcher,
            registry,
            transport,
            clock,
        }
    }

    /// Push `source`'s event count up by `n` at the current time.
    pub async fn bump(&self, source: &SourceId, n: u64) {
        let now = webhook_coalescer::Clock::now(self.clock.as_ref());
        for _ in 0..n {
            self.dispatcher.classifier().record_event(source, now).await;
        }
    }
}

pub fn unit(title: &str) -> NotificationUnit {
    NotificationUnit::new(title, Color::Blue)
        .with_field("Channel", "#general")
        .with_block_field("After", "renamed")
}
