//! Dashboard surface adapters
//!
//! Client, freelancer and admin dashboards each bind an adapter to the same
//! [`NotificationHandle`], so they all render from one store and one push
//! connection.

use std::fmt;

use chrono::{DateTime, Utc};

use hirewire_core::{
    NotificationEntry, NotificationId, ReadSyncOutcome, SourceEvent, StoreSnapshot,
    SubscriptionId,
};

use crate::runtime::NotificationHandle;

/// Which dashboard an adapter renders for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurfaceRole {
    Client,
    Freelancer,
    Admin,
}

impl SurfaceRole {
    /// Panel headline for an entry
    pub fn headline(&self, entry: &NotificationEntry) -> String {
        match (self, &entry.source_event) {
            (SurfaceRole::Client, SourceEvent::ApplicationCreated) => {
                format!("New applicant: {}", entry.message)
            }
            (SurfaceRole::Client, SourceEvent::ApplicationStatusChanged) => {
                format!("Application update: {}", entry.message)
            }
            (SurfaceRole::Freelancer, SourceEvent::ApplicationStatusChanged) => {
                format!("Your application: {}", entry.message)
            }
            (SurfaceRole::Admin, source) => format!("[{}] {}", source.as_wire(), entry.message),
            _ => entry.message.clone(),
        }
    }
}

impl fmt::Display for SurfaceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SurfaceRole::Client => write!(f, "client"),
            SurfaceRole::Freelancer => write!(f, "freelancer"),
            SurfaceRole::Admin => write!(f, "admin"),
        }
    }
}

/// One row of the notifications panel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelItem {
    pub id: NotificationId,
    pub headline: String,
    pub age: String,
    pub is_read: bool,
    pub timestamp: DateTime<Utc>,
}

/// Non-blocking warning for the dashboard
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceNotice {
    ReadSyncFailed { restored: usize, error: String },
}

impl fmt::Display for SurfaceNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SurfaceNotice::ReadSyncFailed { restored: 1, .. } => {
                write!(f, "Couldn't mark 1 notification as read")
            }
            SurfaceNotice::ReadSyncFailed { restored, .. } => {
                write!(f, "Couldn't mark {} notifications as read", restored)
            }
        }
    }
}

/// Relative age, e.g. "5m ago"
pub fn age_label(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - timestamp).num_seconds();
    match secs {
        s if s < 60 => "just now".to_string(),
        s if s < 3_600 => format!("{}m ago", s / 60),
        s if s < 86_400 => format!("{}h ago", s / 3_600),
        s if s < 7 * 86_400 => format!("{}d ago", s / 86_400),
        _ => timestamp.format("%Y-%m-%d").to_string(),
    }
}

/// Badge text; `None` hides the badge
pub fn badge_label(unread: usize) -> Option<String> {
    match unread {
        0 => None,
        1..=9 => Some(unread.to_string()),
        _ => Some("9+".to_string()),
    }
}

/// One dashboard's view of the shared notification state
pub struct SurfaceAdapter {
    role: SurfaceRole,
    handle: NotificationHandle,
    subscriptions: Vec<SubscriptionId>,
}

impl SurfaceAdapter {
    pub fn new(role: SurfaceRole, handle: NotificationHandle) -> Self {
        Self {
            role,
            handle,
            subscriptions: Vec::new(),
        }
    }

    pub fn role(&self) -> SurfaceRole {
        self.role
    }

    /// Unread count
    pub fn badge(&self) -> usize {
        self.handle.unread_count()
    }

    pub fn badge_label(&self) -> Option<String> {
        badge_label(self.badge())
    }

    /// Newest `limit` entries as panel rows
    pub fn panel_items(&self, limit: usize) -> Vec<PanelItem> {
        self.panel_items_at(limit, Utc::now())
    }

    pub fn panel_items_at(&self, limit: usize, now: DateTime<Utc>) -> Vec<PanelItem> {
        self.handle
            .entries()
            .iter()
            .take(limit)
            .map(|entry| PanelItem {
                id: entry.id.clone(),
                headline: self.role.headline(entry),
                age: age_label(entry.timestamp, now),
                is_read: entry.is_read,
                timestamp: entry.timestamp,
            })
            .collect()
    }

    /// Run the mark-as-read gesture.
    ///
    /// Returns a notice when acknowledgements failed and entries went back to
    /// unread.
    pub async fn open_panel(&self) -> Option<SurfaceNotice> {
        match self.handle.open_panel().await {
            Ok(ReadSyncOutcome::RolledBack {
                restored, error, ..
            }) => Some(SurfaceNotice::ReadSyncFailed {
                restored: restored.len(),
                error,
            }),
            Ok(_) => None,
            Err(err) => {
                tracing::warn!("{} panel could not open: {}", self.role, err);
                None
            }
        }
    }

    /// Render now and after every store change until detached
    pub async fn on_render<F>(&mut self, mut render: F) -> Option<SubscriptionId>
    where
        F: FnMut(&StoreSnapshot) + Send + 'static,
    {
        match self.handle.subscribe(move |_, snapshot| render(snapshot)).await {
            Ok(id) => {
                self.subscriptions.push(id);
                Some(id)
            }
            Err(err) => {
                tracing::warn!("{} surface could not subscribe: {}", self.role, err);
                None
            }
        }
    }

    /// Drop every render callback
    pub fn detach(&mut self) {
        for id in self.subscriptions.drain(..) {
            self.handle.unsubscribe(id);
        }
    }
}

impl Drop for SurfaceAdapter {
    fn drop(&mut self) {
        self.detach();
    }
}
