//! Hirewire Client - the I/O half of the notification subsystem
//!
//! - **Backend**: authoritative pull and read acknowledgements over HTTP
//! - **Channel**: the per-session push connection with room join and reconnect
//! - **Runtime**: the single reaction queue that owns the store
//! - **Surface**: dashboard adapters sharing one runtime
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use hirewire_client::{Credentials, HttpBackend, NotificationRuntime, WsTransport};
//! use hirewire_core::NotifyConfig;
//!
//! # async fn run() -> hirewire_core::Result<()> {
//! let config = NotifyConfig::default();
//! let backend = Arc::new(HttpBackend::new(&config.service)?);
//! let transport = Arc::new(WsTransport::new(config.service.push_url.clone()));
//! let handle = NotificationRuntime::spawn(config, backend, transport);
//!
//! handle.initialize(Credentials::new("user-42", "token")).await?;
//! println!("{} unread", handle.unread_count());
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod channel;
pub mod identity;
pub mod runtime;
pub mod surface;

pub use backend::{HttpBackend, NotificationBackend};
pub use channel::{
    ChannelConnection, ChannelFrame, EventHandler, HandlerId, PushLink, PushTransport, WsLink,
    WsTransport, JOIN_EVENT,
};
pub use identity::{Credentials, IdentityProvider, SessionId, StaticIdentity};
pub use runtime::{NotificationHandle, NotificationRuntime};
pub use surface::{age_label, badge_label, PanelItem, SurfaceAdapter, SurfaceNotice, SurfaceRole};
