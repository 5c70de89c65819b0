//! Pagination cursor for truncating historical APIs
//!
//! The cursor walks `[range_start, range_end)` in windows of at most
//! `max_query_span_ms`. Window bounds are inclusive query bounds. A page that
//! comes back holding the API's record cap is treated as truncated: the window
//! end is pulled in to just before the oldest record of that page and the same
//! window start is queried again. Once a page comes back below the cap, forward
//! progress resumes from the highest bound ever fully drained.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// What the cursor did with the last page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorStep {
    /// Page was truncated; the window end was narrowed and the start re-queried
    Backtracked,
    /// Page was complete; the window moved forward
    Advanced,
    /// Page was complete and the range is exhausted
    Finished,
}

/// Mutable position state for a paginated backfill
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillCursor {
    range_start: i64,
    range_end: i64,
    max_query_span_ms: i64,
    window_start: i64,
    window_end: i64,
    max_emitted_bound: i64,
    is_backtracking: bool,
    pages: u64,
    backtracks: u64,
    pivots: u64,
    unresolved_truncations: u64,
}

impl BackfillCursor {
    /// Create a cursor over `[range_start, range_end)`
    pub fn new(range_start: i64, range_end: i64, max_query_span_ms: i64) -> Self {
        let mut cursor = Self {
            range_start,
            range_end,
            max_query_span_ms: max_query_span_ms.max(1),
            window_start: range_start,
            window_end: range_start,
            max_emitted_bound: range_start.saturating_sub(1),
            is_backtracking: false,
            pages: 0,
            backtracks: 0,
            pivots: 0,
            unresolved_truncations: 0,
        };
        cursor.window_end = cursor.forward_end();
        cursor
    }

    /// Overall range start
    pub fn range_start(&self) -> i64 {
        self.range_start
    }

    /// Overall range end (exclusive)
    pub fn range_end(&self) -> i64 {
        self.range_end
    }

    /// Current query start (inclusive)
    pub fn window_start(&self) -> i64 {
        self.window_start
    }

    /// Current query end (inclusive)
    pub fn window_end(&self) -> i64 {
        self.window_end
    }

    /// Highest window end whose page has been fully drained
    pub fn max_emitted_bound(&self) -> i64 {
        self.max_emitted_bound
    }

    /// Whether the cursor is narrowing a truncated window
    pub fn is_backtracking(&self) -> bool {
        self.is_backtracking
    }

    /// Whether the range has been fully walked
    pub fn is_finished(&self) -> bool {
        self.window_start >= self.range_end
    }

    /// Pages observed
    pub fn pages(&self) -> u64 {
        self.pages
    }

    /// Truncated pages that narrowed the window
    pub fn backtracks(&self) -> u64 {
        self.backtracks
    }

    /// Forward moves into a new query window
    pub fn pivots(&self) -> u64 {
        self.pivots
    }

    /// Truncated pages whose records all share the window start timestamp
    pub fn unresolved_truncations(&self) -> u64 {
        self.unresolved_truncations
    }

    /// Apply the result of fetching the current window.
    ///
    /// `oldest_timestamp` is the smallest record timestamp in the page and is
    /// only consulted when the page holds `record_cap` records or more.
    pub fn advance(
        &mut self,
        page_len: usize,
        oldest_timestamp: Option<i64>,
        record_cap: usize,
    ) -> CursorStep {
        self.pages += 1;
        self.max_emitted_bound = self.max_emitted_bound.max(self.window_end);

        if record_cap > 0 && page_len >= record_cap {
            let narrowed = oldest_timestamp.map(|ts| ts.saturating_sub(1));
            match narrowed {
                Some(end) if end >= self.window_start => {
                    debug!(
                        window_start = self.window_start,
                        from = self.window_end,
                        to = end,
                        "Page truncated; narrowing window"
                    );
                    self.is_backtracking = true;
                    self.window_end = end;
                    self.backtracks += 1;
                    return CursorStep::Backtracked;
                }
                _ => {
                    // Every record sits on the window start; narrowing cannot make progress
                    warn!(
                        window_start = self.window_start,
                        window_end = self.window_end,
                        page_len,
                        "Truncated page cannot be narrowed further; moving on"
                    );
                    self.unresolved_truncations += 1;
                }
            }
        }

        self.window_start = if self.is_backtracking {
            self.max_emitted_bound.saturating_add(1)
        } else {
            self.window_end.saturating_add(1)
        };
        self.is_backtracking = false;

        if self.is_finished() {
            return CursorStep::Finished;
        }

        self.window_end = self.forward_end();
        self.pivots += 1;
        CursorStep::Advanced
    }

    fn forward_end(&self) -> i64 {
        self.window_start
            .saturating_add(self.max_query_span_ms)
            .min(self.range_end.saturating_sub(1))
    }
}
