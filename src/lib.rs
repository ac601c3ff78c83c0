//! Adaptive real-time data sync for the tracking backend.
//!
//! Two delivery paths share one facade:
//!
//! * pull: JSON resources polled over HTTP, either at a fixed cadence or adaptively within a
//!   [`PollProfile`], with change detection and a global concurrency ceiling;
//! * push: one long-lived event stream per client (SSE or WebSocket) multiplexed over device
//!   topics, with exponential-backoff reconnection.
//!
//! [`SyncFacade`] is the entry point. Subscriptions are scoped by the [`SubscriptionGuard`] it
//! returns.

pub mod backend;
pub mod config;
pub mod stream;
pub mod sync;
pub mod utils;

pub use config::{ConfigError, StreamSettings, SyncSettings};
pub use stream::{ConnectionStatus, StreamClient, StreamEvent};
pub use sync::{PollProfile, SubscriptionGuard, SubscriptionId, SyncError, SyncFacade};
