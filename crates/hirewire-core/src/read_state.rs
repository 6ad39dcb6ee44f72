//! Read-state protocol for the "open notifications panel" gesture
//!
//! ```text
//! Idle ─open panel─▶ OptimisticApplied ─acks sent─▶ Confirming ─all ok─▶ Idle
//!                                                        │
//!                                                        └─any failed─▶ RollingBack ─▶ Idle
//! ```
//!
//! A batch only ever references the ids captured when the panel was opened,
//! so pushes ingested while it is in flight are never touched by it.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entry::NotificationId;
use crate::error::NotifyError;
use crate::store::{NotificationStore, ReadSnapshot};

/// Identifies one mark-as-read gesture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId(pub Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Phase of one gesture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReadSyncPhase {
    Idle,
    OptimisticApplied,
    Confirming,
    RollingBack,
}

impl ReadSyncPhase {
    /// Check if a transition to the target phase is valid
    pub fn can_transition_to(&self, target: &ReadSyncPhase) -> bool {
        use ReadSyncPhase::*;
        matches!(
            (self, target),
            (Idle, OptimisticApplied)
                | (OptimisticApplied, Confirming)
                | (Confirming, Idle)
                | (Confirming, RollingBack)
                | (RollingBack, Idle)
        )
    }
}

/// How a gesture settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadSyncOutcome {
    /// Nothing was unread when the panel opened
    NothingToAck,
    /// Every acknowledgement succeeded
    Confirmed { ids: Vec<NotificationId> },
    /// Some acknowledgements failed; those ids were flipped back
    RolledBack {
        acknowledged: Vec<NotificationId>,
        restored: Vec<NotificationId>,
        error: String,
    },
    /// The session ended before the gesture settled
    Abandoned,
}

impl ReadSyncOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, ReadSyncOutcome::RolledBack { .. })
    }
}

/// Accumulates per-chunk acknowledgement results
#[derive(Debug, Default)]
pub struct AckReport {
    acknowledged: Vec<NotificationId>,
    failed: Vec<NotificationId>,
    first_error: Option<String>,
}

impl AckReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the result of acknowledging one chunk
    pub fn record(&mut self, chunk: &[NotificationId], result: Result<(), NotifyError>) {
        match result {
            Ok(()) => self.acknowledged.extend_from_slice(chunk),
            Err(err) => {
                self.failed.extend_from_slice(chunk);
                if self.first_error.is_none() {
                    self.first_error = Some(err.to_string());
                }
            }
        }
    }

    pub fn failed(&self) -> &[NotificationId] {
        &self.failed
    }

    pub fn acknowledged(&self) -> &[NotificationId] {
        &self.acknowledged
    }

    pub fn all_ok(&self) -> bool {
        self.failed.is_empty()
    }
}

/// One in-flight mark-as-read gesture
#[derive(Debug)]
pub struct ReadBatch {
    id: BatchId,
    ids: Vec<NotificationId>,
    snapshot: ReadSnapshot,
    phase: ReadSyncPhase,
}

impl ReadBatch {
    /// Capture the unread ids and flip them optimistically.
    ///
    /// Returns `None` when nothing is unread.
    pub fn begin(store: &mut NotificationStore) -> Option<Self> {
        let ids = store.unread_ids();
        if ids.is_empty() {
            return None;
        }
        let snapshot = store.mark_read(&ids);
        Some(Self {
            id: BatchId::new(),
            ids,
            snapshot,
            phase: ReadSyncPhase::OptimisticApplied,
        })
    }

    pub fn id(&self) -> BatchId {
        self.id
    }

    /// Ids captured when the panel was opened
    pub fn ids(&self) -> &[NotificationId] {
        &self.ids
    }

    pub fn phase(&self) -> ReadSyncPhase {
        self.phase
    }

    /// Split the captured ids into acknowledgement requests
    pub fn chunks(&self, batch_size: usize) -> Vec<Vec<NotificationId>> {
        ack_chunks(&self.ids, batch_size)
    }

    /// Acknowledgements are on the wire
    pub fn confirming(&mut self) {
        self.transition(ReadSyncPhase::Confirming);
    }

    /// Apply the backend's verdict. Failed ids get their previous read flag
    /// back; everything else stays read.
    pub fn settle(mut self, store: &mut NotificationStore, report: AckReport) -> ReadSyncOutcome {
        if self.phase == ReadSyncPhase::OptimisticApplied {
            self.confirming();
        }

        if report.all_ok() {
            self.transition(ReadSyncPhase::Idle);
            return ReadSyncOutcome::Confirmed { ids: self.ids };
        }

        self.transition(ReadSyncPhase::RollingBack);
        let restored = store.restore_read_state(&self.snapshot, report.failed());
        self.transition(ReadSyncPhase::Idle);

        tracing::warn!(
            "Read acknowledgement failed for {} of {} notifications, rolled back",
            restored.len(),
            self.ids.len()
        );

        ReadSyncOutcome::RolledBack {
            acknowledged: report.acknowledged,
            restored,
            error: report
                .first_error
                .unwrap_or_else(|| "acknowledgement failed".to_string()),
        }
    }

    fn transition(&mut self, target: ReadSyncPhase) {
        debug_assert!(
            self.phase.can_transition_to(&target),
            "invalid read-state transition {:?} -> {:?}",
            self.phase,
            target
        );
        self.phase = target;
    }
}

/// Group ids into requests of at most `batch_size` (a size of 0 is treated as 1)
pub fn ack_chunks(ids: &[NotificationId], batch_size: usize) -> Vec<Vec<NotificationId>> {
    ids.chunks(batch_size.max(1)).map(<[_]>::to_vec).collect()
}
