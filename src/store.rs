//! The materialized, ordered attachment history for one conversation.
//!
//! This module contains:
//! - `OrderedHistoryStore`: the canonical deduplicated record sequence
//! - `ChangeKind` / `StoreChange`: the change notifications sent to consumers
//!
//! Records are kept sorted by `message_index` descending: position 0 is the
//! newest record, position `count - 1` the oldest. Completed pages of older
//! history therefore land at the tail end.

use log::{debug, warn};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::{AttachmentRecord, RecordKey};

/// What a change notification describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ChangeKind {
    /// A completed page of older history was prepended to the history
    /// (appended at the old end of the sequence)
    BatchPrepended,
    /// A single record was inserted at `position`
    Inserted,
    /// The record at `position` was replaced in place
    Updated,
    /// The record at `position` was removed
    Removed,
    /// The whole store was cleared
    Cleared,
}

/// One change notification delivered to subscribers.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct StoreChange {
    pub kind: ChangeKind,
    /// Position the change took effect at (the landing position of the
    /// first record for `BatchPrepended`, 0 for `Cleared`)
    pub position: usize,
    /// Number of records affected
    pub count: usize,
    /// The record involved, for single-record changes
    pub record: Option<AttachmentRecord>,
}

/// The single source of truth for a conversation's materialized
/// attachment history.
#[derive(Debug, Default)]
pub struct OrderedHistoryStore {
    records: Vec<AttachmentRecord>,
    subscribers: Vec<UnboundedSender<StoreChange>>,
}

impl OrderedHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to change notifications.
    ///
    /// Dropped receivers are pruned on the next notification.
    pub fn subscribe(&mut self) -> UnboundedReceiver<StoreChange> {
        let (tx, rx) = unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    fn notify(&mut self, change: StoreChange) {
        // Prune subscribers whose receiver has been dropped
        self.subscribers.retain(|tx| tx.send(change.clone()).is_ok());
    }

    /// Merge a completed page of older history at the old (tail) end.
    ///
    /// Records whose identity is already present are skipped rather than
    /// re-added: live events racing with the in-flight page may have landed
    /// the same records already. A shrunken batch is therefore no evidence
    /// of exhausted history; only the source state decides that.
    ///
    /// Returns the number of records actually added.
    pub fn merge_batch(&mut self, batch: Vec<AttachmentRecord>) -> usize {
        let landing = self.records.len();
        let mut added = 0;

        for record in batch {
            // Make sure we don't add the same record twice
            if self.records.iter().any(|r| r.same_identity(&record)) {
                debug!("Skipping batch record already present in store");
                continue;
            }

            // Pages of older history continue past the current oldest
            // record, so appending keeps the order. Guard the invariant
            // anyway: anything out of line goes through the ordered insert.
            let out_of_line = self
                .records
                .last()
                .map_or(false, |oldest| record.message_index > oldest.message_index);
            if out_of_line {
                let position = self.scan_insert_position(&record);
                self.records.insert(position, record);
            } else {
                self.records.push(record);
            }
            added += 1;
        }

        if added > 0 {
            self.notify(StoreChange {
                kind: ChangeKind::BatchPrepended,
                position: landing,
                count: added,
                record: None,
            });
        }
        added
    }

    /// Apply an unsolicited "new record" event.
    ///
    /// If the identity already exists (a record transitioning from temp id
    /// to final id, or a status change) the entry is replaced in place and
    /// an `Updated` change is emitted. Otherwise the record is inserted at
    /// its sorted position and `Inserted` is emitted.
    ///
    /// Returns `true` when a new entry was inserted.
    pub fn apply_live_insert(&mut self, record: AttachmentRecord) -> bool {
        if let Some(position) = self.records.iter().position(|r| r.same_identity(&record)) {
            // Replace in place; keep the temp id as a lookup key while the
            // transition is still settling on the backend side
            let mut updated = record;
            if updated.temp_id.is_none() {
                updated.temp_id = self.records[position].temp_id;
            }
            self.records[position] = updated.clone();
            self.notify(StoreChange {
                kind: ChangeKind::Updated,
                position,
                count: 1,
                record: Some(updated),
            });
            return false;
        }

        let position = self.scan_insert_position(&record);
        self.records.insert(position, record.clone());
        self.notify(StoreChange {
            kind: ChangeKind::Inserted,
            position,
            count: 1,
            record: Some(record),
        });
        true
    }

    /// Find the sorted position for a record by scanning from the newest
    /// end while existing records are newer than the incoming one.
    fn scan_insert_position(&self, record: &AttachmentRecord) -> usize {
        let mut position = 0;
        while position < self.records.len()
            && self.records[position].message_index > record.message_index
        {
            position += 1;
        }
        position
    }

    /// Remove the record addressed by `key`.
    ///
    /// An unknown identifier is a no-op: deletions may race with an
    /// unrelated truncation that already evicted the record.
    pub fn apply_delete(&mut self, key: RecordKey) -> Option<AttachmentRecord> {
        let position = self.records.iter().position(|r| r.matches(key));
        self.remove_at(position, || format!("{:?}", key))
    }

    /// Remove the record a raw backend handle addresses, matching either
    /// the temp or the final identifier.
    pub fn apply_delete_raw(&mut self, id: u64) -> Option<AttachmentRecord> {
        let position = self.records.iter().position(|r| r.matches_raw(id));
        self.remove_at(position, || id.to_string())
    }

    fn remove_at(
        &mut self,
        position: Option<usize>,
        describe: impl Fn() -> String,
    ) -> Option<AttachmentRecord> {
        match position {
            Some(position) => {
                let record = self.records.remove(position);
                self.notify(StoreChange {
                    kind: ChangeKind::Removed,
                    position,
                    count: 1,
                    record: Some(record.clone()),
                });
                Some(record)
            }
            None => {
                warn!("Delete for unknown identifier {} ignored", describe());
                None
            }
        }
    }

    /// Clear the whole store unconditionally (remote "history cleared").
    pub fn apply_truncate(&mut self) {
        let dropped = self.records.len();
        self.records.clear();
        self.notify(StoreChange {
            kind: ChangeKind::Cleared,
            position: 0,
            count: dropped,
            record: None,
        });
    }

    pub fn count(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The record at `position` (0 = newest)
    pub fn record_at(&self, position: usize) -> Option<&AttachmentRecord> {
        self.records.get(position)
    }

    /// Find a record by either identifier
    pub fn find(&self, key: RecordKey) -> Option<&AttachmentRecord> {
        self.records.iter().find(|r| r.matches(key))
    }

    /// An owned copy of the current contents, safe to hand to another
    /// thread (e.g. a rendering thread reading while the engine mutates).
    pub fn snapshot(&self) -> Vec<AttachmentRecord> {
        self.records.clone()
    }
}
