//! Backend history source abstraction.
//!
//! This module contains:
//! - The `HistorySource` trait the engine drives page requests through
//! - `HistorySourceState`, the synchronous acknowledgment of a page request
//! - `SourceEvent`, the tagged callback stream delivered by the backend
//!
//! The engine is protocol-agnostic above this surface: authentication,
//! encryption and the wire format all live behind the trait.

use tokio::sync::mpsc::UnboundedSender;

use crate::AttachmentRecord;

/// Backend-reported terminal code for a page request.
///
/// Returned synchronously by [`HistorySource::request_page`] and consulted
/// once the end-of-batch sentinel arrives to decide whether a further page
/// request is meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum HistorySourceState {
    /// More history exists beyond this page
    HasMore,
    /// This page reaches the start of history
    NoMore,
    /// Transient backend failure; the request may be retried
    Error,
    /// The conversation's history source is invalid or gone
    InvalidSource,
}

/// One callback from the backend channel.
///
/// The source protocol marks end-of-batch with a null record; here that is
/// a dedicated variant so the sentinel can't be confused with data.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    /// One record streamed in response to the in-flight page request
    Record(AttachmentRecord),
    /// The in-flight page is exhausted
    EndOfBatch,
    /// Unsolicited new attachment, or a re-delivery carrying the final id
    LiveInsert(AttachmentRecord),
    /// Unsolicited deletion; the raw handle may name either identifier
    LiveDelete(u64),
    /// Remote "history cleared" event
    Truncate,
}

/// The asynchronous backend channel providing history data.
///
/// One source instance serves a conversation for its whole lifetime; all
/// callbacks for that conversation arrive on the single listener channel
/// handed to [`open_history_source`](Self::open_history_source), in the
/// order the backend sent them. Live events may interleave with an
/// in-flight page's record callbacks.
pub trait HistorySource {
    /// Establish the callback channel for a conversation.
    ///
    /// Returns `false` when the source cannot be opened.
    fn open_history_source(
        &self,
        conversation_id: u64,
        listener: UnboundedSender<SourceEvent>,
    ) -> bool;

    /// Issue one page request for up to `count` records.
    ///
    /// Records stream back as [`SourceEvent::Record`] callbacks terminated
    /// by [`SourceEvent::EndOfBatch`]; the returned state is the
    /// acknowledgment consulted at that sentinel.
    fn request_page(&self, conversation_id: u64, count: usize) -> HistorySourceState;

    /// Tear down the callback channel for a conversation
    fn close_history_source(&self, conversation_id: u64);
}
