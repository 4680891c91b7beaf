use crate::job::JobParams;

/// Smallest allowed distance between consecutive segment starts, in seconds
pub const MIN_HOP_SECS: f64 = 1.0;

/// One planned segment
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlannedSegment {
    /// 1-based sequence number
    pub index: u32,
    /// Offset into the source, in seconds
    pub start: f64,
    /// Intended length, in seconds
    pub length: f64,
}

impl PlannedSegment {
    /// End offset of the segment
    pub fn end(&self) -> f64 {
        self.start + self.length
    }

    /// Recompute entry `index` directly from job params
    pub fn nth(params: &JobParams, duration: Option<f64>, index: u32) -> Option<PlannedSegment> {
        if index == 0 {
            return None;
        }
        plan_for(params, duration).nth(index as usize - 1)
    }
}

/// Distance between segment starts: `segment_length - overlap`, floored at one second
pub fn hop(segment_length: f64, overlap: f64) -> f64 {
    let hop = segment_length - overlap;
    if hop.is_nan() || hop < MIN_HOP_SECS {
        MIN_HOP_SECS
    } else {
        hop
    }
}

/// Lazy sequence of planned segments
#[derive(Debug, Clone)]
pub struct SegmentPlan {
    duration: Option<f64>,
    segment_length: f64,
    hop: f64,
    max_segments: Option<u32>,
    next_index: u32,
    empty: bool,
}

/// Plan segments for a source.
///
/// With a known duration the sequence is finite: it ends once a segment
/// reaches the source end, and that last entry is clamped to it. With an
/// unknown duration it is unbounded and the caller stops it (end of source or
/// `max_segments`).
pub fn plan(
    duration: Option<f64>,
    segment_length: f64,
    overlap: f64,
    max_segments: Option<u32>,
) -> SegmentPlan {
    let bad_length = !segment_length.is_finite() || segment_length <= 0.0;
    let bad_duration = matches!(duration, Some(d) if !d.is_finite() || d <= 0.0);

    SegmentPlan {
        duration,
        segment_length,
        hop: hop(segment_length, overlap),
        max_segments,
        next_index: 1,
        empty: bad_length || bad_duration || max_segments == Some(0),
    }
}

/// Plan from a job's parameter snapshot
pub fn plan_for(params: &JobParams, duration: Option<f64>) -> SegmentPlan {
    plan(duration, params.segment_time, params.overlap_seconds, params.max_segments)
}

impl SegmentPlan {
    /// Number of entries when the plan is finite
    pub fn len_hint(&self) -> Option<u32> {
        if self.duration.is_none() && self.max_segments.is_none() {
            return None;
        }
        Some(self.clone().count() as u32)
    }
}

impl Iterator for SegmentPlan {
    type Item = PlannedSegment;

    fn next(&mut self) -> Option<PlannedSegment> {
        if self.empty {
            return None;
        }
        if let Some(cap) = self.max_segments {
            if self.next_index > cap {
                return None;
            }
        }

        // multiply rather than accumulate so offsets never drift
        let start = (self.next_index - 1) as f64 * self.hop;
        let length = match self.duration {
            Some(duration) => {
                if start >= duration {
                    self.empty = true;
                    return None;
                }
                if start + self.segment_length >= duration {
                    // this one already covers the tail; an overlap-only remainder is not a segment
                    self.empty = true;
                }
                self.segment_length.min(duration - start)
            }
            None => self.segment_length,
        };

        let segment = PlannedSegment {
            index: self.next_index,
            start,
            length,
        };
        self.next_index += 1;
        Some(segment)
    }
}
