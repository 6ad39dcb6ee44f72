//! Hirewire Core - real-time notification state for the job marketplace client
//!
//! This crate holds the runtime-independent half of the notification subsystem:
//!
//! - **Entry**: notification records and lenient push/pull payload parsing
//! - **Reconcile**: merge rules that keep entries deduplicated and sorted
//! - **Store**: the session-scoped notification store with derived unread count
//! - **Read state**: the optimistic mark-as-read protocol with rollback
//! - **Backoff**: reconnect delays for the push channel
//! - **Config**: endpoints, backoff, periodic pull and acknowledgement settings
//!
//! # Architecture
//!
//! ```text
//! pull ──▶ replace_all ─┐
//!                       ├─▶ NotificationStore ──▶ listeners (dashboards)
//! push ──▶ ingest_push ─┘          ▲
//!                                  │ mark_read / restore_read_state
//!                             ReadBatch
//! ```
//!
//! The store never caches the unread count; it is derived from the entries
//! every time it is read, so pull and push can never make it drift.

pub mod backoff;
pub mod config;
pub mod entry;
pub mod error;
pub mod read_state;
pub mod reconcile;
pub mod store;

pub use backoff::Backoff;
pub use config::{AckConfig, ConfigError, NotifyConfig, ReconnectConfig, RefreshConfig, ServiceConfig};
pub use entry::{extract_items, parse_batch, NotificationEntry, NotificationId, ParsedBatch, SourceEvent};
pub use error::{MalformedPayload, NotifyError, Result, TransientError};
pub use read_state::{ack_chunks, AckReport, BatchId, ReadBatch, ReadSyncOutcome, ReadSyncPhase};
pub use reconcile::MergeOutcome;
pub use store::{
    ConnectionState, Listener, NotificationStore, ReadSnapshot, StoreChange, StoreSnapshot,
    SubscriptionId,
};
