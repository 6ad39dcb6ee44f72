//! Shared entry builders for integration tests

use chrono::{TimeZone, Utc};
use hirewire_core::{NotificationEntry, NotificationId};

/// Entry with a timestamp in whole seconds since the epoch
pub fn entry(id: &str, secs: i64, is_read: bool) -> NotificationEntry {
    NotificationEntry::new(
        id,
        format!("notification {id}"),
        Utc.timestamp_opt(secs, 0).unwrap(),
    )
    .read(is_read)
}

pub fn id(s: &str) -> NotificationId {
    NotificationId::new(s)
}

/// `(id, seconds, is_read)` triples for compact assertions
#[allow(dead_code)]
pub fn view(entries: &[NotificationEntry]) -> Vec<(String, i64, bool)> {
    entries
        .iter()
        .map(|e| (e.id.to_string(), e.timestamp.timestamp(), e.is_read))
        .collect()
}
