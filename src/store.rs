use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::batch::{chunk_text, Batch};
use crate::error::DeliveryError;
use crate::sender::{Delivery, RateLimitedSender};
use crate::types::{NotificationUnit, SourceId, WebhookPayload};

/// Summary of one batch flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub units: usize,
    pub chunks: usize,
}

/// State of a destination's batch as seen by the periodic flusher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchAge {
    Empty,
    /// First unit carries no timestamp; the batch cannot be aged.
    Unstamped,
    Since(DateTime<Utc>),
}

/// One delivery target: its sender and its pending batch.
pub struct Destination {
    id: SourceId,
    sender: RateLimitedSender,
    batch: Mutex<Batch>,
    max_message_len: usize,
}

impl Destination {
    pub fn new(id: SourceId, sender: RateLimitedSender, max_message_len: usize) -> Self {
        Self {
            id,
            sender,
            batch: Mutex::new(Batch::new()),
            max_message_len,
        }
    }

    pub fn id(&self) -> &SourceId {
        &self.id
    }

    pub fn sender(&self) -> &RateLimitedSender {
        &self.sender
    }

    /// Deliver a single unit as an embed, bypassing the batch.
    pub async fn send_unit(&self, unit: NotificationUnit) -> Result<Delivery, DeliveryError> {
        self.sender.send(&WebhookPayload::embed(unit)).await
    }

    /// Stamp and queue `unit`, flushing right away when the batch grows past
    /// the message cap. Returns whether a flush happened.
    pub async fn enqueue(
        &self,
        mut unit: NotificationUnit,
        now: DateTime<Utc>,
    ) -> Result<bool, DeliveryError> {
        unit.timestamp = Some(now);
        let mut batch = self.batch.lock().await;
        batch.push(unit);

        if batch.rendered_size() > self.max_message_len {
            tracing::debug!(
                source = %self.id,
                units = batch.len(),
                "batch over size cap, flushing"
            );
            self.flush_locked(&mut batch).await?;
            return Ok(true);
        }
        Ok(false)
    }

    pub async fn flush(&self) -> Result<FlushReport, DeliveryError> {
        let mut batch = self.batch.lock().await;
        self.flush_locked(&mut batch).await
    }

    /// Render, chunk and send the batch, then clear it whatever happened.
    async fn flush_locked(&self, batch: &mut Batch) -> Result<FlushReport, DeliveryError> {
        if batch.is_empty() {
            return Ok(FlushReport::default());
        }

        let units = batch.len();
        let chunks = chunk_text(&batch.render(), self.max_message_len);
        let mut result = Ok(FlushReport {
            units,
            chunks: chunks.len(),
        });
        for chunk in chunks {
            if let Err(err) = self.sender.send(&WebhookPayload::content(chunk)).await {
                result = Err(err);
                break;
            }
        }

        batch.clear();
        result
    }

    pub async fn batch_age(&self) -> BatchAge {
        let batch = self.batch.lock().await;
        if batch.is_empty() {
            BatchAge::Empty
        } else {
            batch
                .first_timestamp()
                .map(BatchAge::Since)
                .unwrap_or(BatchAge::Unstamped)
        }
    }

    /// Drop the pending batch without sending it. Returns the number of units lost.
    pub async fn discard(&self) -> usize {
        let mut batch = self.batch.lock().await;
        let dropped = batch.len();
        batch.clear();
        dropped
    }

    /// Drop the batch only if its first unit is still unstamped, checked
    /// under the same lock. Returns the number of units lost.
    pub async fn discard_if_unstamped(&self) -> usize {
        let mut batch = self.batch.lock().await;
        if batch.is_empty() || batch.first_timestamp().is_some() {
            return 0;
        }
        let dropped = batch.len();
        batch.clear();
        dropped
    }

    pub async fn pending(&self) -> usize {
        self.batch.lock().await.len()
    }

    #[cfg(test)]
    pub(crate) async fn push_raw(&self, unit: NotificationUnit) {
        self.batch.lock().await.push(unit);
    }
}

/// Lazily populated map of destinations keyed by source.
#[derive(Default)]
pub struct DestinationStore {
    destinations: RwLock<HashMap<SourceId, Arc<Destination>>>,
}

impl DestinationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, source: &SourceId) -> Option<Arc<Destination>> {
        self.destinations.read().await.get(source).cloned()
    }

    /// Existing destination for `source`, or the one built by `create`.
    pub async fn get_or_insert_with<F>(&self, source: &SourceId, create: F) -> Arc<Destination>
    where
        F: FnOnce() -> Destination,
    {
        if let Some(existing) = self.get(source).await {
            return existing;
        }
        let mut guard = self.destinations.write().await;
        guard
            .entry(source.clone())
            .or_insert_with(|| Arc::new(create()))
            .clone()
    }

    pub async fn remove(&self, source: &SourceId) -> Option<Arc<Destination>> {
        self.destinations.write().await.remove(source)
    }

    pub async fn snapshot(&self) -> Vec<Arc<Destination>> {
        self.destinations.read().await.values().cloned().collect()
    }
}
