//! # chart-relay
//!
//! A session-partitioned real-time relay: accepts webhook messages and chart
//! configuration updates from producers and fans them out to concurrently
//! connected streaming consumers, persisting recent history to an external
//! key-value store so late or reconnecting consumers can replay what they
//! missed.
//!
//! ## Design
//!
//! - **Partitioning**: every event and every subscriber carries a
//!   [`SessionKey`]; delivery is strictly partition-exact, and the
//!   "no session" partition is its own bucket.
//! - **Durability is best-effort**: producers never block or fail on storage
//!   problems; an outage degrades to in-memory delivery.
//! - **Replay then live**: a connecting consumer receives an ack, then its
//!   partition's retained history tagged as replay, then live deliveries,
//!   deduplicated by event id across the boundary.
//! - **Two live transports**: in-process fan-out via [`SessionRegistry`], or
//!   a fixed-interval poll of the durable log with a high-water-mark cursor.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use chart_relay::{MemoryKv, RelayConfig, RelayService, SessionKey};
//!
//! #[tokio::main]
//! async fn main() {
//!     let relay = RelayService::new(MemoryKv::new(), RelayConfig::default());
//!     let session = SessionKey::Named("s1".into());
//!
//!     relay.publish_message("hello", session.clone()).unwrap();
//!     let _stream = relay.connect(session).await; // Stream<Item = Frame>
//! }
//! ```

mod error;
mod event;
pub mod kv;
pub mod log;
mod poll;
mod registry;
mod relay;
mod stream;

// Re-exports
pub use error::{Error, PublishError, Result, StorageError};
pub use event::{Event, EventKind, LogFamily, SessionKey};
pub use kv::{KvStore, MemoryKv};
pub use log::{collapse_charts, ChartState, DurableLog, LogConfig};
pub use poll::DEFAULT_POLL_INTERVAL;
pub use registry::{SessionRegistry, SubscriberToken};
pub use relay::{ChartAction, RelayConfig, RelayHealth, RelayService};
pub use stream::{Frame, StreamSession};

// Re-export commonly used types from dependencies
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
