//! Chat attachment history engine — the single source of truth for a
//! conversation's file-attachment timeline.
//!
//! Reconstructs a stable, gap-free, chronologically ordered view of a
//! conversation's attachment history from a backend that only delivers
//! history through an asynchronous, page-oriented callback channel.
//!
//! One [`HistoryEngine`] instance serves one conversation: it owns the
//! at-most-one in-flight page request ([`HistoryLoader`]), the buffered
//! accumulation of each page ([`BatchBuffer`]), the materialized record
//! sequence ([`OrderedHistoryStore`]) and the viewport-driven pagination
//! trigger ([`PaginationPolicy`]). Backends plug in behind the
//! [`HistorySource`] trait; consumers subscribe to [`StoreChange`]
//! notifications and read positions or snapshots.

mod buffer;
mod engine;
mod loader;
mod policy;
mod record;
mod source;
mod store;

pub use buffer::BatchBuffer;
pub use engine::{spawn_event_loop, HistoryEngine};
pub use loader::{CompletedBatch, HistoryLoader, LoaderState, DEFAULT_PAGE_SIZE};
pub use policy::{PaginationPolicy, ScrollDirection, Viewport, DEFAULT_LOOKAHEAD};
pub use record::{AttachedFile, AttachmentRecord, RecordKey, RecordStatus};
pub use source::{HistorySource, HistorySourceState, SourceEvent};
pub use store::{ChangeKind, OrderedHistoryStore, StoreChange};
