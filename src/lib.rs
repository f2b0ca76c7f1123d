//! An in-process webhook dispatcher that adapts to load.
//!
//! Events are delivered to one webhook endpoint per source. Each endpoint
//! enforces a remote rate limit, and bursty sources are better served by a
//! few dense messages than by many small ones.
//!
//! ## Behavior
//! - Light sources: every unit is sent on its own, as an embed.
//! - Busy sources: units are coalesced into text batches. A batch is flushed
//!   when it outgrows the message cap, or when it has aged past an interval
//!   that grows with the source's volume.
//! - The bar for "busy" drops for everyone when the average source is busy.
//! - Per-endpoint sends are serialized. They honor `X-RateLimit-*` headers
//!   and retry `429`s within a bounded budget.
//!
//! ## Non-Guarantees
//! - Exactly-once delivery
//! - Ordering across sources
//! - Durability of pending batches across restarts
//!
//! Delivery is best-effort: a batch whose delivery fails is dropped rather
//! than allowed to block the source.

mod batch;
mod classifier;
mod clock;
mod context;
mod dispatcher;
mod error;
mod flusher;
mod ramp;
mod registry;
mod sender;
mod store;
mod telemetry;
mod types;

pub use batch::{chunk_text, render_units, rendered_size, Batch};
pub use classifier::{BusynessClassifier, ClassifierConfig, EventCounter};
pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatcher::{DispatchOutcome, Dispatcher, DispatcherConfig};
pub use error::{DeliveryError, DispatchError, RegistryError};
pub use ramp::{ramp_factor, RampUpController};
pub use registry::{parse_event_list, InMemoryRegistry, Registry, SourceConfig};
pub use sender::{
    Delivery, RateLimitState, RateLimitedSender, RetryPolicy, Transport, TransportResponse,
};
pub use store::FlushReport;
pub use telemetry::{RequestLedger, Telemetry};
pub use types::{Color, EventKind, Field, NotificationUnit, SourceId, WebhookPayload};

#[cfg(feature = "http")]
pub use sender::HttpTransport;
