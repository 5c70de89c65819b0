//! Bounded sequence reorder buffer
//!
//! Batches from a push feed are keyed by `seq` in a `BTreeMap`. When the
//! buffer reaches capacity it drains the oldest 90% in ascending order and
//! keeps the newest 10% as a margin for stragglers. Missing sequence numbers
//! at drain time are reported as gaps and skipped; the buffer never waits
//! for them beyond its capacity.
//!
//! The emission floor is `max(baseline, last emitted seq)`. Anything at or
//! below it is dropped on arrival, so no `seq` is emitted twice and nothing
//! at or below a baseline is ever emitted.

use crate::metrics;
use crate::sink::SinkWriter;
use crate::DataRecord;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use super::StreamError;

/// Share of a full buffer kept back on a normal drain, as a divisor (1/10)
const RETAIN_DIVISOR: usize = 10;

/// One push delivery
#[derive(Debug, Clone, PartialEq)]
pub struct SequencedBatch {
    /// Strictly increasing per source
    pub seq: u64,
    /// Records in delivery order
    pub records: Vec<DataRecord>,
    /// Arrival wall-clock time (ms); diagnostics and sink timestamps only
    pub received_at: i64,
}

/// What happened to an incoming batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchDisposition {
    /// Held for ordering
    Buffered,
    /// Triggered a drain that emitted this many records
    Drained(usize),
    /// At or below the emission floor; dropped
    Late,
    /// Same seq already buffered; dropped
    Duplicate,
}

/// Reorder buffer counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReorderStats {
    /// Batches handed to the sink
    pub batches_emitted: u64,
    /// Records handed to the sink
    pub records_emitted: u64,
    /// Drains performed
    pub drains: u64,
    /// Gap occurrences seen while draining
    pub gaps: u64,
    /// Sequence numbers skipped across all gaps
    pub missing_seqs: u64,
    /// Batches dropped for arriving at or below the floor
    pub late_batches: u64,
    /// Batches dropped as duplicates of a buffered seq
    pub duplicate_batches: u64,
    /// Buffered batches discarded by a baseline
    pub discarded_by_baseline: u64,
}

/// Orders live batches by sequence number before they reach the sink
#[derive(Debug)]
pub struct StreamReorderBuffer {
    topic: String,
    capacity: usize,
    batches: BTreeMap<u64, SequencedBatch>,
    baseline: Option<u64>,
    last_emitted: Option<u64>,
    next_expected: Option<u64>,
    closed: bool,
    stats: ReorderStats,
}

impl StreamReorderBuffer {
    /// Buffer that drains once it holds `capacity` batches
    pub fn new(topic: impl Into<String>, capacity: usize) -> Self {
        Self {
            topic: topic.into(),
            capacity: capacity.max(1),
            batches: BTreeMap::new(),
            baseline: None,
            last_emitted: None,
            next_expected: None,
            closed: false,
            stats: ReorderStats::default(),
        }
    }

    /// Batches currently held
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Drain threshold
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Next sequence number the buffer expects to emit, once known
    pub fn next_expected(&self) -> Option<u64> {
        self.next_expected
    }

    /// Highest sequence number emitted so far
    pub fn last_emitted(&self) -> Option<u64> {
        self.last_emitted
    }

    /// Whether `on_cancel` has run
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Counters
    pub fn stats(&self) -> &ReorderStats {
        &self.stats
    }

    /// Highest seq that may no longer be emitted
    fn floor(&self) -> Option<u64> {
        match (self.baseline, self.last_emitted) {
            (Some(b), Some(e)) => Some(b.max(e)),
            (b, e) => b.or(e),
        }
    }

    /// Apply an authoritative baseline from a snapshot.
    ///
    /// Drops buffered batches with `seq <= baseline` and expects `baseline + 1`
    /// next. A baseline below what was already emitted never moves the floor back.
    pub fn on_baseline(&mut self, seq: u64) {
        if let Some(emitted) = self.last_emitted {
            if seq < emitted {
                warn!(
                    topic = %self.topic,
                    baseline = seq,
                    last_emitted = emitted,
                    "Baseline behind emitted sequence; keeping emitted floor"
                );
            }
        }

        self.baseline = Some(self.baseline.map_or(seq, |b| b.max(seq)));
        let floor = self.floor().unwrap_or(seq);

        // A floor of u64::MAX leaves nothing that may still be emitted
        let next = floor.checked_add(1);
        let keep = match next {
            Some(next) => self.batches.split_off(&next),
            None => BTreeMap::new(),
        };
        let discarded = std::mem::replace(&mut self.batches, keep).len();
        self.stats.discarded_by_baseline += discarded as u64;
        self.next_expected = next;

        info!(
            topic = %self.topic,
            baseline = seq,
            next_expected = ?next,
            discarded,
            buffered = self.batches.len(),
            "Baseline applied"
        );
    }

    /// Accept one batch; drains into `sink` when the buffer reaches capacity.
    pub fn on_batch(
        &mut self,
        batch: SequencedBatch,
        sink: &mut dyn SinkWriter,
    ) -> Result<BatchDisposition, StreamError> {
        if self.closed {
            return Err(StreamError::BufferClosed);
        }

        if let Some(floor) = self.floor() {
            if batch.seq <= floor {
                self.stats.late_batches += 1;
                metrics::record_late_batch(&self.topic);
                warn!(
                    topic = %self.topic,
                    seq = batch.seq,
                    floor,
                    "Late batch discarded"
                );
                return Ok(BatchDisposition::Late);
            }
        }

        if self.batches.contains_key(&batch.seq) {
            self.stats.duplicate_batches += 1;
            debug!(topic = %self.topic, seq = batch.seq, "Duplicate batch discarded");
            return Ok(BatchDisposition::Duplicate);
        }

        self.batches.insert(batch.seq, batch);

        if self.batches.len() >= self.capacity {
            let emitted = self.drain(false, sink)?;
            return Ok(BatchDisposition::Drained(emitted));
        }
        Ok(BatchDisposition::Buffered)
    }

    /// Emit buffered batches in ascending `seq` order.
    ///
    /// A normal drain emits the oldest 90% and keeps the newest 10%; a flush
    /// emits everything. Returns the number of records written.
    pub fn drain(&mut self, flush: bool, sink: &mut dyn SinkWriter) -> Result<usize, StreamError> {
        let buffered = self.batches.len();
        let count = if flush {
            buffered
        } else {
            buffered - buffered / RETAIN_DIVISOR
        };
        if count == 0 {
            return Ok(0);
        }

        let mut written = 0usize;
        for _ in 0..count {
            let Some((&seq, batch)) = self.batches.first_key_value() else {
                break;
            };

            // Removed only once every record reached the sink
            for record in &batch.records {
                let timestamp = record.timestamp().unwrap_or(batch.received_at);
                sink.write(timestamp, record)?;
            }
            let records = batch.records.len();

            if let Some(expected) = self.next_expected {
                if seq > expected {
                    let missing = seq - expected;
                    self.stats.gaps += 1;
                    self.stats.missing_seqs += missing;
                    metrics::record_stream_gap(&self.topic, missing);
                    warn!(
                        topic = %self.topic,
                        expected,
                        seq,
                        missing,
                        "Sequence gap at drain; continuing with available data"
                    );
                }
            }

            self.batches.remove(&seq);
            written += records;
            self.last_emitted = Some(seq);
            self.next_expected = seq.checked_add(1);
            self.stats.batches_emitted += 1;
            self.stats.records_emitted += records as u64;
        }

        self.stats.drains += 1;
        debug!(
            topic = %self.topic,
            flush,
            batches = count,
            records = written,
            retained = self.batches.len(),
            "Drained reorder buffer"
        );
        Ok(written)
    }

    /// Flush everything and stop accepting batches
    pub fn on_cancel(&mut self, sink: &mut dyn SinkWriter) -> Result<usize, StreamError> {
        if self.closed {
            return Ok(0);
        }
        let written = self.drain(true, sink)?;
        self.closed = true;
        info!(topic = %self.topic, records = written, "Reorder buffer flushed and closed");
        Ok(written)
    }
}
