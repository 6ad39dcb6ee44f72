//! Merge rules for the two producers (pull and push)
//!
//! Pull and push are not coordinated upstream: the same event can arrive
//! through either, in any order, any number of times. Everything that writes
//! entries goes through these functions so the dedup and ordering invariants
//! hold no matter which producer delivered what.
//!
//! Invariants after every function here returns:
//! - at most one entry per id
//! - entries sorted by timestamp, newest first

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::entry::{NotificationEntry, NotificationId};

/// What a push did to the entry list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// New id, inserted at `index`
    Inserted { index: usize },
    /// Known id, fields overwritten; the entry now sits at `index`
    Updated { index: usize },
}

impl MergeOutcome {
    pub fn index(&self) -> usize {
        match self {
            MergeOutcome::Inserted { index } | MergeOutcome::Updated { index } => *index,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, MergeOutcome::Inserted { .. })
    }
}

/// Merge one pushed entry into a sorted, deduplicated list.
///
/// A redelivered id overwrites the existing entry (the push is authoritative
/// for recency). A new id is inserted where it keeps the list sorted, which is
/// usually but not always the head.
pub fn merge_push(entries: &mut Vec<NotificationEntry>, entry: NotificationEntry) -> MergeOutcome {
    if let Some(pos) = entries.iter().position(|e| e.id == entry.id) {
        if entries[pos].timestamp == entry.timestamp {
            entries[pos] = entry;
            return MergeOutcome::Updated { index: pos };
        }

        // Timestamp moved: reposition so the list stays sorted
        entries.remove(pos);
        let index = insertion_index(entries, &entry.timestamp);
        entries.insert(index, entry);
        return MergeOutcome::Updated { index };
    }

    let index = insertion_index(entries, &entry.timestamp);
    entries.insert(index, entry);
    MergeOutcome::Inserted { index }
}

/// Position that keeps descending order; ties go in front of older equals
fn insertion_index(entries: &[NotificationEntry], timestamp: &DateTime<Utc>) -> usize {
    entries.partition_point(|e| e.timestamp > *timestamp)
}

/// Prepare a full pull list for wholesale replacement.
///
/// Duplicate ids collapse to the last occurrence in the list; the result is
/// stably sorted newest first.
pub fn normalize_full_list(list: Vec<NotificationEntry>) -> Vec<NotificationEntry> {
    let mut seen: HashMap<NotificationId, usize> = HashMap::with_capacity(list.len());
    let mut out: Vec<NotificationEntry> = Vec::with_capacity(list.len());

    for entry in list {
        match seen.get(&entry.id) {
            Some(&idx) => out[idx] = entry,
            None => {
                seen.insert(entry.id.clone(), out.len());
                out.push(entry);
            }
        }
    }

    out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    out
}

/// The only unread derivation; never cached, never incremented
pub fn unread_count(entries: &[NotificationEntry]) -> usize {
    entries.iter().filter(|e| !e.is_read).count()
}

/// Check the ordering invariant
pub fn is_sorted_desc(entries: &[NotificationEntry]) -> bool {
    entries.windows(2).all(|w| w[0].timestamp >= w[1].timestamp)
}

/// Check the dedup invariant
pub fn has_unique_ids(entries: &[NotificationEntry]) -> bool {
    let mut seen = HashSet::with_capacity(entries.len());
    entries.iter().all(|e| seen.insert(&e.id))
}
