//! Attachment record types and data structures.
//!
//! This module contains:
//! - AttachmentRecord, AttachedFile, RecordStatus structs
//! - RecordKey lookup keys spanning the temp-id → final-id transition

/// One file descriptor attached to a record.
///
/// Opaque to the engine beyond identity and count; downloading, thumbnails
/// and storage of the actual bytes are handled elsewhere.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq)]
pub struct AttachedFile {
    /// The display name of the file
    pub name: String,
    /// The file size in bytes
    pub size: u64,
    /// Opaque backend handle for the stored file
    pub handle: u64,
}

/// Delivery status of an attachment record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RecordStatus {
    /// Still in the client-side sending phase (only `temp_id` is set)
    Sending,
    /// Committed by the backend (`message_id` assigned)
    Sent,
    /// Soft-deleted; stays visible until the backend confirms removal
    Deleted,
}

/// A lookup key for a record, by either identifier.
///
/// During the sending phase a record is only addressable by its client-side
/// temp id; once the backend commits it, the final message id takes over.
/// Both remain valid lookup keys while the transition is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RecordKey {
    /// The backend-assigned final message id
    Message(u64),
    /// The client-assigned id used before the backend commits
    Temp(u64),
}

/// One file-sharing event in a conversation's history.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq)]
pub struct AttachmentRecord {
    /// Stable backend identifier; `None` while the record is still sending
    pub message_id: Option<u64>,
    /// Client-assigned identifier covering the sending phase
    pub temp_id: Option<u64>,
    /// Backend-assigned monotonic position within the conversation;
    /// larger index = newer message
    pub message_index: i64,
    /// The files carried by this record
    pub attached_files: Vec<AttachedFile>,
    pub status: RecordStatus,
    /// Unix timestamp (seconds) of the message, carried for consumers
    pub at: u64,
}

impl Default for AttachmentRecord {
    fn default() -> Self {
        Self {
            message_id: None,
            temp_id: None,
            message_index: 0,
            attached_files: Vec::new(),
            status: RecordStatus::Sent,
            at: 0,
        }
    }
}

impl AttachmentRecord {
    /// A committed record, addressable by its final message id
    pub fn sent(message_id: u64, message_index: i64) -> Self {
        Self {
            message_id: Some(message_id),
            message_index,
            ..Default::default()
        }
    }

    /// A record still in the sending phase, addressable only by its temp id
    pub fn sending(temp_id: u64, message_index: i64) -> Self {
        Self {
            temp_id: Some(temp_id),
            message_index,
            status: RecordStatus::Sending,
            ..Default::default()
        }
    }

    pub fn with_files(mut self, files: Vec<AttachedFile>) -> Self {
        self.attached_files = files;
        self
    }

    /// The authoritative lookup key: the final message id once assigned,
    /// the temp id before that.
    pub fn key(&self) -> Option<RecordKey> {
        if let Some(id) = self.message_id {
            Some(RecordKey::Message(id))
        } else {
            self.temp_id.map(RecordKey::Temp)
        }
    }

    /// Check whether this record is addressed by the given key
    pub fn matches(&self, key: RecordKey) -> bool {
        match key {
            RecordKey::Message(id) => self.message_id == Some(id),
            RecordKey::Temp(id) => self.temp_id == Some(id),
        }
    }

    /// Check a raw backend handle against both identifiers.
    ///
    /// Deletions arrive as a single handle that may name either the temp or
    /// the final id, depending on where the record was in its transition.
    pub fn matches_raw(&self, id: u64) -> bool {
        self.message_id == Some(id) || self.temp_id == Some(id)
    }

    /// Whether two records describe the same logical attachment.
    ///
    /// A re-delivery carrying the freshly assigned final id still matches
    /// the stored temp-keyed entry through the shared temp id.
    pub fn same_identity(&self, other: &AttachmentRecord) -> bool {
        if let (Some(a), Some(b)) = (self.message_id, other.message_id) {
            if a == b {
                return true;
            }
        }
        if let (Some(a), Some(b)) = (self.temp_id, other.temp_id) {
            if a == b {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_prefers_final_id() {
        let mut record = AttachmentRecord::sending(7, 10);
        assert_eq!(record.key(), Some(RecordKey::Temp(7)));

        record.message_id = Some(42);
        assert_eq!(record.key(), Some(RecordKey::Message(42)));
    }

    #[test]
    fn test_matches_raw_checks_both_ids() {
        let mut record = AttachmentRecord::sending(7, 10);
        record.message_id = Some(42);

        assert!(record.matches_raw(7));
        assert!(record.matches_raw(42));
        assert!(!record.matches_raw(99));
    }

    #[test]
    fn test_same_identity_across_transition() {
        // Stored while sending, re-delivered once committed
        let stored = AttachmentRecord::sending(7, 10);
        let mut redelivered = AttachmentRecord::sending(7, 10);
        redelivered.message_id = Some(42);
        redelivered.status = RecordStatus::Sent;

        assert!(stored.same_identity(&redelivered));
        assert!(redelivered.same_identity(&stored));

        // Unrelated records never match
        let other = AttachmentRecord::sent(43, 11);
        assert!(!stored.same_identity(&other));
        assert!(!redelivered.same_identity(&other));
    }

    #[test]
    fn test_matches_is_exact_per_field() {
        let mut record = AttachmentRecord::sending(7, 10);
        record.message_id = Some(42);

        assert!(record.matches(RecordKey::Temp(7)));
        assert!(record.matches(RecordKey::Message(42)));
        assert!(!record.matches(RecordKey::Message(7)));
        assert!(!record.matches(RecordKey::Temp(42)));
    }
}
