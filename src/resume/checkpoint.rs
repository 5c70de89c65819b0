//! Checkpoint taken after each fully drained backfill page

use crate::backfill::BackfillCursor;
use serde::{Deserialize, Serialize};

/// Position reached by a backfill, safe to resume from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    cursor: BackfillCursor,
    records_emitted: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_trade_id: Option<i64>,
    completed_at: i64,
}

impl Checkpoint {
    /// Create a checkpoint for the given cursor position
    pub fn new(cursor: BackfillCursor, records_emitted: u64, last_trade_id: Option<i64>) -> Self {
        Self {
            cursor,
            records_emitted,
            last_trade_id,
            completed_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Cursor state at the checkpoint
    pub fn cursor(&self) -> &BackfillCursor {
        &self.cursor
    }

    /// Records emitted up to the checkpoint
    pub fn records_emitted(&self) -> u64 {
        self.records_emitted
    }

    /// Id of the last trade written to the sink
    pub fn last_trade_id(&self) -> Option<i64> {
        self.last_trade_id
    }

    /// When the checkpoint was taken (Unix ms)
    pub fn completed_at(&self) -> i64 {
        self.completed_at
    }
}
