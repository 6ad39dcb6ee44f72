//! The notification store
//!
//! Sole owner of the entry list and the connection state. All reads and
//! writes go through it; the unread count is derived on demand from the
//! entries and never stored on its own.

use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entry::{NotificationEntry, NotificationId};
use crate::reconcile::{self, MergeOutcome};

/// State of the push channel as seen by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    /// `connect()` is a no-op in these states
    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Immutable view handed to observers.
///
/// Entries and unread count are computed together from the same list, so an
/// observer can never see them disagree.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub entries: Arc<[NotificationEntry]>,
    pub unread_count: usize,
    pub connection_state: ConnectionState,
    pub last_full_sync_at: Option<DateTime<Utc>>,
    /// Bumped on every mutation
    pub version: u64,
}

impl StoreSnapshot {
    pub fn unread(&self) -> impl Iterator<Item = &NotificationEntry> {
        self.entries.iter().filter(|e| !e.is_read)
    }

    pub fn get(&self, id: &NotificationId) -> Option<&NotificationEntry> {
        self.entries.iter().find(|e| &e.id == id)
    }
}

/// What a mutation did, passed to listeners alongside the snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    /// Full pull applied
    Replaced { total: usize },
    /// Push merged
    Ingested {
        id: NotificationId,
        outcome: MergeOutcome,
    },
    /// Optimistic read flip
    MarkedRead { ids: Vec<NotificationId> },
    /// Rollback of an optimistic read flip
    ReadStateRestored { ids: Vec<NotificationId> },
    ConnectionChanged(ConnectionState),
    /// Session ended
    Cleared,
    /// Current state handed to a listener as it is attached
    Attached,
}

/// Read flags as they were before `mark_read`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadSnapshot {
    previous: HashMap<NotificationId, bool>,
}

impl ReadSnapshot {
    /// Read flag before the optimistic flip
    pub fn previous(&self, id: &NotificationId) -> Option<bool> {
        self.previous.get(id).copied()
    }

    pub fn ids(&self) -> impl Iterator<Item = &NotificationId> {
        self.previous.keys()
    }

    pub fn len(&self) -> usize {
        self.previous.len()
    }

    pub fn is_empty(&self) -> bool {
        self.previous.is_empty()
    }
}

/// Handle returned by [`NotificationStore::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Callback invoked after every mutation
pub type Listener = Box<dyn FnMut(&StoreChange, &StoreSnapshot) + Send>;

/// Session-scoped notification state
pub struct NotificationStore {
    entries: Vec<NotificationEntry>,
    connection_state: ConnectionState,
    last_full_sync_at: Option<DateTime<Utc>>,
    version: u64,
    listeners: Vec<(SubscriptionId, Listener)>,
    next_subscription: u64,
}

impl NotificationStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            connection_state: ConnectionState::Disconnected,
            last_full_sync_at: None,
            version: 0,
            listeners: Vec::new(),
            next_subscription: 0,
        }
    }

    // ==================== Reads ====================

    /// Entries, newest first
    pub fn entries(&self) -> &[NotificationEntry] {
        &self.entries
    }

    pub fn get(&self, id: &NotificationId) -> Option<&NotificationEntry> {
        self.entries.iter().find(|e| &e.id == id)
    }

    /// Derived from the entries on every call
    pub fn unread_count(&self) -> usize {
        reconcile::unread_count(&self.entries)
    }

    /// Ids of unread entries, newest first
    pub fn unread_ids(&self) -> Vec<NotificationId> {
        self.entries
            .iter()
            .filter(|e| !e.is_read)
            .map(|e| e.id.clone())
            .collect()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    pub fn last_full_sync_at(&self) -> Option<DateTime<Utc>> {
        self.last_full_sync_at
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Build an observer view of the current state
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            entries: Arc::from(self.entries.as_slice()),
            unread_count: self.unread_count(),
            connection_state: self.connection_state,
            last_full_sync_at: self.last_full_sync_at,
            version: self.version,
        }
    }

    // ==================== Mutations ====================

    /// Replace every entry with a full pull result.
    ///
    /// Only for complete lists; a partial pull must go through
    /// [`ingest_push`](Self::ingest_push) instead.
    pub fn replace_all(&mut self, list: Vec<NotificationEntry>) {
        self.replace_all_at(list, Utc::now());
    }

    /// [`replace_all`](Self::replace_all) with an explicit sync instant
    pub fn replace_all_at(&mut self, list: Vec<NotificationEntry>, synced_at: DateTime<Utc>) {
        self.entries = reconcile::normalize_full_list(list);
        self.last_full_sync_at = Some(synced_at);
        let total = self.entries.len();
        self.commit(StoreChange::Replaced { total });
    }

    /// Full pull that keeps optimistic read flags for `pending` ids.
    ///
    /// Used when a pull lands while an acknowledgement is still in flight; the
    /// server may not have recorded those reads yet.
    pub fn replace_all_pending(
        &mut self,
        list: Vec<NotificationEntry>,
        pending: &[NotificationId],
        synced_at: DateTime<Utc>,
    ) {
        let mut entries = reconcile::normalize_full_list(list);
        for entry in entries.iter_mut() {
            if pending.contains(&entry.id) {
                entry.is_read = true;
            }
        }
        self.entries = entries;
        self.last_full_sync_at = Some(synced_at);
        let total = self.entries.len();
        self.commit(StoreChange::Replaced { total });
    }

    /// Merge one pushed entry
    pub fn ingest_push(&mut self, entry: NotificationEntry) -> MergeOutcome {
        let id = entry.id.clone();
        let outcome = reconcile::merge_push(&mut self.entries, entry);
        self.commit(StoreChange::Ingested { id, outcome });
        outcome
    }

    /// Optimistically flip the given ids to read.
    ///
    /// Returns the read flags as they were, for rollback. Ids that are not in
    /// the store are ignored.
    pub fn mark_read(&mut self, ids: &[NotificationId]) -> ReadSnapshot {
        let mut snapshot = ReadSnapshot::default();
        let mut touched = Vec::new();

        for entry in self.entries.iter_mut() {
            if ids.contains(&entry.id) && !snapshot.previous.contains_key(&entry.id) {
                snapshot.previous.insert(entry.id.clone(), entry.is_read);
                entry.is_read = true;
                touched.push(entry.id.clone());
            }
        }

        if !touched.is_empty() {
            self.commit(StoreChange::MarkedRead { ids: touched });
        }
        snapshot
    }

    /// Reapply the pre-`mark_read` flags to `ids` only.
    ///
    /// Entries ingested since the snapshot are untouched. Returns the ids that
    /// were actually restored.
    pub fn restore_read_state(
        &mut self,
        snapshot: &ReadSnapshot,
        ids: &[NotificationId],
    ) -> Vec<NotificationId> {
        let mut restored = Vec::new();

        for entry in self.entries.iter_mut() {
            if !ids.contains(&entry.id) {
                continue;
            }
            if let Some(previous) = snapshot.previous(&entry.id) {
                entry.is_read = previous;
                restored.push(entry.id.clone());
            }
        }

        if !restored.is_empty() {
            self.commit(StoreChange::ReadStateRestored {
                ids: restored.clone(),
            });
        }
        restored
    }

    /// Record a push channel transition
    pub fn set_connection_state(&mut self, state: ConnectionState) {
        if self.connection_state == state {
            return;
        }
        self.connection_state = state;
        self.commit(StoreChange::ConnectionChanged(state));
    }

    /// Drop all session state. Listeners stay registered.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.last_full_sync_at = None;
        self.connection_state = ConnectionState::Disconnected;
        self.commit(StoreChange::Cleared);
    }

    // ==================== Listeners ====================

    /// Register a listener for every subsequent mutation
    pub fn subscribe<F>(&mut self, listener: F) -> SubscriptionId
    where
        F: FnMut(&StoreChange, &StoreSnapshot) + Send + 'static,
    {
        self.next_subscription += 1;
        let id = SubscriptionId(self.next_subscription);
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Subscribe, first calling the listener with the current state
    pub fn attach<F>(&mut self, mut listener: F) -> SubscriptionId
    where
        F: FnMut(&StoreChange, &StoreSnapshot) + Send + 'static,
    {
        let snapshot = self.snapshot();
        let result = catch_unwind(AssertUnwindSafe(|| {
            listener(&StoreChange::Attached, &snapshot)
        }));
        let id = self.subscribe(listener);
        if result.is_err() {
            tracing::error!("Store listener {:?} panicked on {:?}", id, StoreChange::Attached);
        }
        id
    }

    /// Remove a listener; false if it was already gone
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(sid, _)| *sid != id);
        self.listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Invariants hold here; only then are listeners told
    fn commit(&mut self, change: StoreChange) {
        debug_assert!(reconcile::is_sorted_desc(&self.entries));
        debug_assert!(reconcile::has_unique_ids(&self.entries));

        self.version += 1;
        if self.listeners.is_empty() {
            return;
        }

        let snapshot = self.snapshot();
        for (id, listener) in self.listeners.iter_mut() {
            let result = catch_unwind(AssertUnwindSafe(|| listener(&change, &snapshot)));
            if result.is_err() {
                tracing::error!("Store listener {:?} panicked on {:?}", id, change);
            }
        }
    }
}

impl Default for NotificationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for NotificationStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationStore")
            .field("entries", &self.entries.len())
            .field("unread", &self.unread_count())
            .field("connection_state", &self.connection_state)
            .field("last_full_sync_at", &self.last_full_sync_at)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
