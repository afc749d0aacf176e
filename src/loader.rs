//! Page-request state machine for backward history loading.
//!
//! This module contains:
//! - `LoaderState`: the loader's lifecycle states
//! - `HistoryLoader`: owns the single in-flight request and its buffer
//! - `CompletedBatch`: a drained buffer ready to merge into the store

use log::{debug, warn};

use crate::{AttachmentRecord, BatchBuffer, HistorySource, HistorySourceState};

/// How many records one page request asks for
pub const DEFAULT_PAGE_SIZE: usize = 20;

/// Lifecycle state of the history loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum LoaderState {
    /// No request in flight; more history may be available
    Idle,
    /// Exactly one page request is in flight
    Loading,
    /// The source reported the start of history; further requests are
    /// no-ops until the loader is reset
    Exhausted,
    /// The last page request failed; `request_more` retries from here
    Error,
}

/// A completed page, drained from the buffer and ready to merge.
#[derive(Debug)]
pub struct CompletedBatch {
    pub records: Vec<AttachmentRecord>,
    /// The acknowledgment recorded when the request was issued
    pub source_state: HistorySourceState,
}

/// Owns the at-most-one in-flight page request for a conversation.
///
/// The synchronous acknowledgment of `request_page` is recorded at request
/// time; the transition out of `Loading` happens only once the end-of-batch
/// sentinel arrives, because records may still stream in before it even
/// when the acknowledgment was already terminal.
#[derive(Debug)]
pub struct HistoryLoader {
    state: LoaderState,
    has_more: bool,
    page_size: usize,
    buffer: Option<BatchBuffer>,
    pending_ack: HistorySourceState,
}

impl Default for HistoryLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryLoader {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            state: LoaderState::Idle,
            has_more: true,
            page_size,
            buffer: None,
            pending_ack: HistorySourceState::HasMore,
        }
    }

    /// Issue one page request, if none is in flight.
    ///
    /// A call while `Loading` or `Exhausted` is a no-op; a call in `Error`
    /// retries. The buffer opened here is bound to `generation` so a batch
    /// superseded by a truncation can be recognised and dropped.
    ///
    /// Returns `true` when a request was actually issued.
    pub fn request_more<S: HistorySource>(
        &mut self,
        source: &S,
        conversation_id: u64,
        generation: u64,
    ) -> bool {
        match self.state {
            LoaderState::Loading => {
                debug!("request_more ignored: a page request is already in flight");
                return false;
            }
            LoaderState::Exhausted => {
                debug!("request_more ignored: history is exhausted");
                return false;
            }
            LoaderState::Idle | LoaderState::Error => {}
        }

        self.buffer = Some(BatchBuffer::new(generation));
        self.pending_ack = source.request_page(conversation_id, self.page_size);
        self.state = LoaderState::Loading;
        true
    }

    /// Feed one streamed record into the in-flight buffer.
    pub fn on_record(&mut self, record: AttachmentRecord) {
        match (&self.state, self.buffer.as_mut()) {
            (LoaderState::Loading, Some(buffer)) => buffer.push(record),
            _ => warn!("Dropping record streamed outside an in-flight page request"),
        }
    }

    /// Handle the end-of-batch sentinel.
    ///
    /// A buffer from a stale generation (superseded by a truncation) is
    /// dropped and the loader returns to `Idle` with more-available: the
    /// cleared history says nothing about what the backend still holds.
    ///
    /// Otherwise the buffer is drained — a partial final page still carries
    /// valid records — and the loader transitions on the recorded
    /// acknowledgment. Record count never decides exhaustion: dedup against
    /// live-received records can shrink a page below the requested size.
    pub fn on_end_of_batch(&mut self, current_generation: u64) -> Option<CompletedBatch> {
        if self.state != LoaderState::Loading {
            warn!("End-of-batch sentinel outside an in-flight page request");
            return None;
        }

        let mut buffer = self.buffer.take()?;
        if buffer.generation() != current_generation {
            debug!(
                "Dropping stale batch of {} records (generation {} < {})",
                buffer.len(),
                buffer.generation(),
                current_generation
            );
            self.state = LoaderState::Idle;
            self.has_more = true;
            return None;
        }

        let records = buffer.complete();
        self.state = match self.pending_ack {
            HistorySourceState::HasMore => {
                self.has_more = true;
                LoaderState::Idle
            }
            HistorySourceState::NoMore | HistorySourceState::InvalidSource => {
                self.has_more = false;
                LoaderState::Exhausted
            }
            HistorySourceState::Error => LoaderState::Error,
        };

        Some(CompletedBatch {
            records,
            source_state: self.pending_ack,
        })
    }

    /// Return to `Idle` with more-available, discarding any buffer.
    ///
    /// Used when the history was cleared or the channel reopened.
    pub fn reset(&mut self) {
        self.state = LoaderState::Idle;
        self.has_more = true;
        self.buffer = None;
    }

    pub fn state(&self) -> LoaderState {
        self.state
    }

    pub fn is_loading(&self) -> bool {
        self.state == LoaderState::Loading
    }

    /// Whether a further page request is meaningful
    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }
}
