//! Alignment chains between two builds
//!
//! Coordinates are 1-based closed intervals. A segment maps
//! `old_start..=old_end` onto a run of the same length starting at
//! `new_start`. On forward chains new positions increase with old ones; on
//! reverse chains `new_start` is the new position aligned with `old_start`
//! and positions decrease from there.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainSegment {
    pub old_start: i64,
    pub old_end: i64,
    pub new_start: i64,
}

impl ChainSegment {
    pub fn len(&self) -> i64 {
        self.old_end - self.old_start + 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 0
    }

    /// Number of positions of `start..=end` inside this segment
    pub fn overlap(&self, start: i64, end: i64) -> i64 {
        (self.old_end.min(end) - self.old_start.max(start) + 1).max(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chain {
    pub id: i64,
    pub old_build: i64,
    pub old_chr: String,
    pub old_start: i64,
    pub old_end: i64,
    pub new_build: i64,
    pub new_chr: String,
    pub new_start: i64,
    pub new_end: i64,
    pub score: i64,
    pub forward: bool,
    /// Disjoint, sorted by `old_start`
    pub segments: Vec<ChainSegment>,
}

impl Chain {
    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        self.old_start <= end && self.old_end >= start
    }

    /// Map `start..=end` through this chain.
    ///
    /// Returns `None` unless the segments cover at least `min_coverage` of
    /// the interval. Offsets of the interval ends are clamped into the first
    /// and last overlapping segments, so a boundary falling in a gap lands
    /// on the nearest aligned base.
    pub fn map_interval(&self, start: i64, end: i64, min_coverage: f64) -> Option<(i64, i64)> {
        let first_idx = self.segments.partition_point(|s| s.old_end < start);

        let mut covered = 0i64;
        let mut first: Option<&ChainSegment> = None;
        let mut last: Option<&ChainSegment> = None;
        for seg in &self.segments[first_idx..] {
            if seg.old_start > end {
                break;
            }
            covered += seg.overlap(start, end);
            first.get_or_insert(seg);
            last = Some(seg);
        }

        let (first, last) = (first?, last?);
        let total = end - start + 1;
        if (covered as f64) < (total as f64) * min_coverage {
            return None;
        }

        let front = (start - first.old_start).clamp(0, first.len() - 1);
        let back = (end - last.old_start).clamp(0, last.len() - 1);

        let (new_start, new_end) = if self.forward {
            (first.new_start + front, last.new_start + back)
        } else {
            (last.new_start - back, first.new_start - front)
        };
        Some((new_start.min(new_end), new_start.max(new_end)))
    }
}

/// Chain to be written to the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewChain {
    pub old_build: i64,
    pub old_chr: String,
    pub new_build: i64,
    pub new_chr: String,
    pub score: i64,
    pub forward: bool,
    pub segments: Vec<ChainSegment>,
}

impl NewChain {
    /// Old-build span covered by the segments
    pub fn old_span(&self) -> Option<(i64, i64)> {
        let start = self.segments.iter().map(|s| s.old_start).min()?;
        let end = self.segments.iter().map(|s| s.old_end).max()?;
        Some((start, end))
    }

    /// New-build span covered by the segments
    pub fn new_span(&self) -> Option<(i64, i64)> {
        let ends = self.segments.iter().flat_map(|s| {
            let far = if self.forward {
                s.new_start + s.len() - 1
            } else {
                s.new_start - (s.len() - 1)
            };
            [s.new_start, far]
        });
        let (mut lo, mut hi) = (i64::MAX, i64::MIN);
        for pos in ends {
            lo = lo.min(pos);
            hi = hi.max(pos);
        }
        (lo <= hi).then_some((lo, hi))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn chain(forward: bool, segments: Vec<ChainSegment>) -> Chain {
        Chain {
            id: 1,
            old_build: 18,
            old_chr: "chr1".into(),
            old_start: segments.first().map(|s| s.old_start).unwrap_or(0),
            old_end: segments.last().map(|s| s.old_end).unwrap_or(0),
            new_build: 19,
            new_chr: "chr1".into(),
            new_start: 0,
            new_end: 0,
            score: 100,
            forward,
            segments,
        }
    }

    fn seg(old_start: i64, old_end: i64, new_start: i64) -> ChainSegment {
        ChainSegment {
            old_start,
            old_end,
            new_start,
        }
    }

    #[test]
    fn test_region_inside_single_forward_segment() {
        let c = chain(true, vec![seg(900, 2100, 5900)]);
        assert_eq!(c.map_interval(1000, 2000, 0.95), Some((6000, 7000)));
    }

    #[test]
    fn test_point_maps_to_point() {
        let c = chain(true, vec![seg(900, 2100, 5900)]);
        assert_eq!(c.map_interval(1500, 1500, 0.95), Some((6500, 6500)));
    }

    #[test]
    fn test_reverse_chain_flips_offsets() {
        // old 100 aligns with new 1000, old 200 with new 900
        let c = chain(false, vec![seg(100, 200, 1000)]);
        assert_eq!(c.map_interval(110, 150, 0.95), Some((950, 990)));
    }

    #[test]
    fn test_coverage_threshold() {
        // 100-position region, 94 covered
        let c = chain(true, vec![seg(1, 47, 1001), seg(54, 200, 1060)]);
        assert_eq!(c.map_interval(1, 100, 0.95), None);
        // 96 covered
        let c = chain(true, vec![seg(1, 48, 1001), seg(53, 200, 1060)]);
        assert_eq!(c.map_interval(1, 100, 0.95), Some((1001, 1107)));
    }

    #[test]
    fn test_gap_boundary_is_clamped() {
        let c = chain(true, vec![seg(10, 100, 1010), seg(102, 300, 1105)]);
        // end lands in the second segment, start before the first
        assert_eq!(c.map_interval(9, 200, 0.95), Some((1010, 1203)));
    }

    #[test]
    fn test_new_chain_spans() {
        let fwd = NewChain {
            old_build: 18,
            old_chr: "chr1".into(),
            new_build: 19,
            new_chr: "chr1".into(),
            score: 1,
            forward: true,
            segments: vec![seg(10, 19, 110), seg(30, 39, 130)],
        };
        assert_eq!(fwd.old_span(), Some((10, 39)));
        assert_eq!(fwd.new_span(), Some((110, 139)));

        let rev = NewChain {
            forward: false,
            segments: vec![seg(10, 19, 500)],
            ..fwd
        };
        assert_eq!(rev.new_span(), Some((491, 500)));
    }
}
