//! MemberSync - membership event relay from Source sites to Sink lists.
//!
//! Relays membership lifecycle webhooks from content-platform sites
//! ("Source") into per-site email-marketing lists ("Sink"), keeping
//! subscriber records eventually consistent with idempotent upserts.
//!
//! ## Architecture
//!
//! ```text
//! Source → Signature Verifier → Normalizer → Durable Queue → Worker
//!              → Circuit Breaker (gate) → Sink Client
//!              → success | Retry Scheduler → Queue | Dead Letter Store
//! ```
//!
//! Ingestion is request-scoped and never touches the Sink; enqueue is the
//! only blocking call on the hot path. Workers pull per-site FIFO
//! partitions concurrently; out-of-order redeliveries are made safe by the
//! processor's ordering guard rather than locks.
//!
//! Operational tooling links this library directly: full resync drives
//! [`processor::Processor::process_event`] with synthesized events, and
//! dead-letter replay uses [`queue::DurableQueue::list_dead_letters`] /
//! [`queue::DurableQueue::replay`].

pub mod breaker;
pub mod config;
pub mod error;
pub mod metrics;
pub mod model;
pub mod normalize;
pub mod processor;
pub mod queue;
pub mod retry;
pub mod signature;
pub mod sink;
pub mod util;
pub mod web;
pub mod worker;

// Re-export commonly used types
pub use breaker::{BreakerConfig, CircuitBreaker};
pub use config::{Config, SiteContext};
pub use error::SyncError;
pub use metrics::Metrics;
pub use model::{
    DeadLetterEntry, EventType, MemberEvent, MemberStatus, SubscriberRecord, WorkItem,
};
pub use processor::Processor;
pub use queue::{DurableQueue, MemoryQueue, RedisQueue};
pub use retry::RetryPolicy;
pub use sink::{SinkApi, SinkError, SinkRegistry};
pub use web::AppState;
