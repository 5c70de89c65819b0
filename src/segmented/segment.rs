//! Segment lifecycle and the window that owns a batch of segments

use std::collections::HashMap;

/// Lifecycle of one segment request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentState {
    /// Created, not yet transmitted
    Pending,
    /// Request transmitted, no acknowledgment yet
    Sent,
    /// Source acknowledged the request
    Accepted {
        /// Source-side chunk identifier
        chunk_id: String,
    },
    /// Data delivered and written (terminal)
    Recorded {
        /// Records written for this segment
        records: usize,
    },
}

impl SegmentState {
    /// Whether the segment reached its terminal state
    pub fn is_recorded(&self) -> bool {
        matches!(self, SegmentState::Recorded { .. })
    }
}

/// One fixed-width, half-open time range request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Current request id; replaced on every resend
    pub request_id: String,
    /// Range start (ms, inclusive)
    pub range_start: i64,
    /// Range end (ms, exclusive)
    pub range_end: i64,
    /// Lifecycle state
    pub state: SegmentState,
    /// How many times this segment has been re-sent
    pub resends: u32,
}

impl Segment {
    /// Whether `timestamp` falls inside this segment
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.range_start && timestamp < self.range_end
    }
}

/// Result of applying a source event to the window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The event moved the segment forward
    Applied,
    /// The segment was already recorded; the event was dropped
    AlreadyRecorded,
    /// No segment carries this request id
    Unknown,
}

/// A contiguous batch of segments advanced together
#[derive(Debug, Clone)]
pub struct DownloadWindow {
    segments: Vec<Segment>,
    by_request: HashMap<String, usize>,
}

impl DownloadWindow {
    /// Build `count` contiguous segments of `width_ms` starting at `range_start`.
    ///
    /// The last segment is clipped to `limit` when one is given; segments that
    /// would start at or beyond `limit` are not created.
    pub fn new(
        range_start: i64,
        count: usize,
        width_ms: i64,
        limit: Option<i64>,
        mut next_id: impl FnMut() -> String,
    ) -> Self {
        let mut segments = Vec::with_capacity(count);
        let mut by_request = HashMap::with_capacity(count);

        for i in 0..count {
            let start = range_start + i as i64 * width_ms;
            let mut end = start + width_ms;
            if let Some(limit) = limit {
                if start >= limit {
                    break;
                }
                end = end.min(limit);
            }
            let request_id = next_id();
            by_request.insert(request_id.clone(), segments.len());
            segments.push(Segment {
                request_id,
                range_start: start,
                range_end: end,
                state: SegmentState::Pending,
                resends: 0,
            });
        }

        Self {
            segments,
            by_request,
        }
    }

    /// Segments in range order
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Number of segments
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Whether the window has no segments
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// End of the last segment, or `None` for an empty window
    pub fn range_end(&self) -> Option<i64> {
        self.segments.last().map(|s| s.range_end)
    }

    /// Whether every segment is recorded
    pub fn is_complete(&self) -> bool {
        self.segments.iter().all(|s| s.state.is_recorded())
    }

    /// Recorded segment count
    pub fn recorded(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| s.state.is_recorded())
            .count()
    }

    /// Look up a segment by its current request id
    pub fn get(&self, request_id: &str) -> Option<&Segment> {
        self.by_request.get(request_id).map(|&i| &self.segments[i])
    }

    /// Index of a segment by its current request id
    pub fn index_of(&self, request_id: &str) -> Option<usize> {
        self.by_request.get(request_id).copied()
    }

    /// Segment at `index`
    pub fn segment(&self, index: usize) -> Option<&Segment> {
        self.segments.get(index)
    }

    /// `Pending → Sent`. Resent segments are already `Sent`.
    pub fn mark_sent(&mut self, index: usize) {
        if let Some(segment) = self.segments.get_mut(index) {
            if segment.state == SegmentState::Pending {
                segment.state = SegmentState::Sent;
            }
        }
    }

    /// `Sent → Accepted`, recording the chunk id
    pub fn accept(&mut self, request_id: &str, chunk_id: String) -> Transition {
        let Some(&index) = self.by_request.get(request_id) else {
            return Transition::Unknown;
        };
        let segment = &mut self.segments[index];
        if segment.state.is_recorded() {
            return Transition::AlreadyRecorded;
        }
        segment.state = SegmentState::Accepted { chunk_id };
        Transition::Applied
    }

    /// Any non-terminal state `→ Recorded`
    pub fn record(&mut self, request_id: &str, records: usize) -> Transition {
        let Some(&index) = self.by_request.get(request_id) else {
            return Transition::Unknown;
        };
        let segment = &mut self.segments[index];
        if segment.state.is_recorded() {
            return Transition::AlreadyRecorded;
        }
        segment.state = SegmentState::Recorded { records };
        Transition::Applied
    }

    /// Indices of segments that are not yet recorded
    pub fn outstanding(&self) -> Vec<usize> {
        self.segments
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.state.is_recorded())
            .map(|(i, _)| i)
            .collect()
    }

    /// Give a non-recorded segment a fresh request id and put it back to `Sent`.
    ///
    /// The old id is forgotten, so late events for it are treated as unknown.
    /// Returns `None` if the segment is recorded or out of range.
    pub fn reissue(&mut self, index: usize, request_id: String) -> Option<&Segment> {
        let segment = self.segments.get_mut(index)?;
        if segment.state.is_recorded() {
            return None;
        }
        self.by_request.remove(&segment.request_id);
        self.by_request.insert(request_id.clone(), index);
        segment.request_id = request_id;
        segment.state = SegmentState::Sent;
        segment.resends += 1;
        Some(&self.segments[index])
    }
}
