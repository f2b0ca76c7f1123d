use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

use async_trait::async_trait;
use strum::IntoEnumIterator;
use tokio::sync::RwLock;

use crate::error::RegistryError;
use crate::types::{EventKind, SourceId};

/// Upstream configuration oracle.
///
/// Persisting and editing per-source configuration belongs to the embedding
/// application; the dispatcher only asks these two questions.
#[async_trait]
pub trait Registry: Send + Sync {
    async fn is_event_enabled(&self, source: &SourceId, event: EventKind) -> bool;
    async fn resolve_endpoint(&self, source: &SourceId) -> Option<String>;
}

/// Per-source settings held by [`InMemoryRegistry`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceConfig {
    pub endpoint: Option<String>,
    pub events: BTreeSet<EventKind>,
}

/// In-memory registry for lightweight deployments and tests.
#[derive(Default)]
pub struct InMemoryRegistry {
    sources: RwLock<HashMap<SourceId, SourceConfig>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source with every event enabled.
    pub async fn register(&self, source: SourceId, endpoint: impl Into<String>) {
        let config = SourceConfig {
            endpoint: Some(endpoint.into()),
            events: EventKind::iter().collect(),
        };
        self.sources.write().await.insert(source, config);
    }

    pub async fn set_endpoint(&self, source: &SourceId, endpoint: Option<String>) {
        let mut guard = self.sources.write().await;
        guard.entry(source.clone()).or_default().endpoint = endpoint;
    }

    pub async fn set_events(&self, source: &SourceId, events: BTreeSet<EventKind>) {
        let mut guard = self.sources.write().await;
        guard.entry(source.clone()).or_default().events = events;
    }

    /// Replace the enabled events from a comma-separated list.
    pub async fn set_events_from_str(
        &self,
        source: &SourceId,
        list: &str,
    ) -> Result<(), RegistryError> {
        let events = parse_event_list(list)?;
        self.set_events(source, events).await;
        Ok(())
    }

    pub async fn remove(&self, source: &SourceId) -> Option<SourceConfig> {
        self.sources.write().await.remove(source)
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn is_event_enabled(&self, source: &SourceId, event: EventKind) -> bool {
        let guard = self.sources.read().await;
        guard
            .get(source)
            .map(|config| config.events.contains(&event))
            .unwrap_or(false)
    }

    async fn resolve_endpoint(&self, source: &SourceId) -> Option<String> {
        let guard = self.sources.read().await;
        guard.get(source).and_then(|config| config.endpoint.clone())
    }
}

/// Parse a comma-separated event list such as `"member_join, member_ban"`.
///
/// `"none"` (any case) or an empty string disables everything. All unknown
/// names are reported together.
pub fn parse_event_list(list: &str) -> Result<BTreeSet<EventKind>, RegistryError> {
    let trimmed = list.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
        return Ok(BTreeSet::new());
    }

    let mut events = BTreeSet::new();
    let mut invalid = Vec::new();
    for name in trimmed.split(',').map(str::trim) {
        match EventKind::from_str(name) {
            Ok(event) => {
                events.insert(event);
            }
            Err(_) => invalid.push(name.to_string()),
        }
    }

    if invalid.is_empty() {
        Ok(events)
    } else {
        Err(RegistryError::UnknownEvent(invalid))
    }
}
