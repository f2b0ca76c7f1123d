use std::sync::Arc;

use crate::classifier::BusynessClassifier;
use crate::clock::Clock;
use crate::dispatcher::DispatcherConfig;
use crate::registry::Registry;
use crate::sender::{RateLimitedSender, Transport};
use crate::store::{Destination, DestinationStore};
use crate::telemetry::RequestLedger;
use crate::types::SourceId;

/// Shared state for the dispatcher and its background loops.
pub struct EngineContext {
    pub config: DispatcherConfig,
    pub clock: Arc<dyn Clock>,
    pub registry: Arc<dyn Registry>,
    pub transport: Arc<dyn Transport>,
    pub store: DestinationStore,
    pub classifier: Arc<BusynessClassifier>,
    pub ledger: Arc<RequestLedger>,
}

impl EngineContext {
    pub fn new(
        config: DispatcherConfig,
        registry: Arc<dyn Registry>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let classifier = Arc::new(BusynessClassifier::new(config.classifier_config()));
        Self {
            config,
            clock,
            registry,
            transport,
            store: DestinationStore::new(),
            classifier,
            ledger: Arc::new(RequestLedger::new()),
        }
    }

    /// Destination for `source`, created on first use and pointed at `url`.
    pub async fn destination(&self, source: &SourceId, url: &str) -> Arc<Destination> {
        let destination = self
            .store
            .get_or_insert_with(source, || {
                tracing::debug!(source = %source, "creating destination state");
                let sender = RateLimitedSender::new(
                    url,
                    self.transport.clone(),
                    self.ledger.clone(),
                    self.clock.clone(),
                    self.config.retry_policy(),
                );
                Destination::new(source.clone(), sender, self.config.max_message_len)
            })
            .await;
        destination.sender().set_url(url).await;
        destination
    }
}
