//! Pagination trigger policy fed by consumer viewport updates.

use crate::{HistoryLoader, LoaderState};

/// How close (in records) the viewport's leading edge must get to the
/// oldest materialized record before another page is requested
pub const DEFAULT_LOOKAHEAD: usize = 8;

/// Which end of history the consumer is moving toward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ScrollDirection {
    /// Toward older history (the paging direction)
    Older,
    /// Toward recent history
    Newer,
}

/// The consumer's current view into the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewport {
    /// Store position of the leading visible record (0 = newest)
    pub leading_position: usize,
    pub direction: ScrollDirection,
}

/// Decides when the consumer's position warrants requesting more history.
#[derive(Debug, Clone, Copy)]
pub struct PaginationPolicy {
    lookahead: usize,
}

impl Default for PaginationPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl PaginationPolicy {
    pub fn new() -> Self {
        Self::with_lookahead(DEFAULT_LOOKAHEAD)
    }

    pub fn with_lookahead(lookahead: usize) -> Self {
        Self { lookahead }
    }

    /// Whether another page should be requested.
    ///
    /// Fires only when scrolling toward older history with the loader idle
    /// and more history available, and the leading edge within `lookahead`
    /// records of the oldest materialized record. The loader enforces the
    /// at-most-one-in-flight invariant itself; checking here just avoids
    /// generating redundant calls.
    pub fn should_request(
        &self,
        viewport: Viewport,
        store_len: usize,
        loader: &HistoryLoader,
    ) -> bool {
        if viewport.direction != ScrollDirection::Older {
            return false;
        }
        if loader.state() != LoaderState::Idle || !loader.has_more() {
            return false;
        }
        // The initial page is requested at open time, not by viewport
        if store_len == 0 {
            return false;
        }

        let records_behind = store_len - 1 - viewport.leading_position.min(store_len - 1);
        records_behind <= self.lookahead
    }

    pub fn lookahead(&self) -> usize {
        self.lookahead
    }
}
