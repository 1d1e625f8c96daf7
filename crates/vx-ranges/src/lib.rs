#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vx_types::{binary_search_by, Address, Lookup};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RangesError {
    #[error("interval ({low}, {high}) has its low bound above its high bound")]
    InvertedInterval { low: i64, high: i64 },
    #[error("intervals must be given in ascending order: ({low}, {high}) follows high bound {previous_high}")]
    UnsortedIntervals {
        low: i64,
        high: i64,
        previous_high: i64,
    },
    #[error("combined ranges overlap: interval starting at {low} begins at or before previous high bound {previous_high}")]
    OverlappingIntervals { low: i64, previous_high: i64 },
    #[error("key {0} is not covered by any interval")]
    KeyNotCovered(i64),
}

/// Ordered, non-overlapping closed `i64` intervals describing a virtualized
/// address space.
///
/// Each interval covers `high - low + 1` contiguous keys; the structure maps
/// between the sparse key space and a dense zero-based address space without
/// materializing every key. A per-interval cumulative offset (the address of
/// the interval's first element) is precomputed at construction, so both
/// translation directions are O(log n) in the interval count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ranges {
    intervals: Vec<(i64, i64)>,
    offsets: Vec<usize>,
    size: usize,
}

fn interval_len(low: i64, high: i64) -> usize {
    (i128::from(high) - i128::from(low) + 1) as usize
}

fn compute_offsets(intervals: &[(i64, i64)]) -> (Vec<usize>, usize) {
    let mut offsets = Vec::with_capacity(intervals.len());
    let mut total = 0_usize;
    for &(low, high) in intervals {
        offsets.push(total);
        total += interval_len(low, high);
    }
    (offsets, total)
}

impl Ranges {
    /// Builds a `Ranges` from intervals already in ascending, non-overlapping
    /// order. Does not sort for the caller; malformed input fails here, never
    /// lazily at lookup time.
    pub fn create(intervals: Vec<(i64, i64)>) -> Result<Self, RangesError> {
        for &(low, high) in &intervals {
            if low > high {
                return Err(RangesError::InvertedInterval { low, high });
            }
        }
        for window in intervals.windows(2) {
            let (_, previous_high) = window[0];
            let (low, high) = window[1];
            if low <= previous_high {
                return Err(RangesError::UnsortedIntervals {
                    low,
                    high,
                    previous_high,
                });
            }
        }
        Ok(Self::from_validated(intervals))
    }

    /// A `Ranges` covering no keys at all.
    #[must_use]
    pub fn empty() -> Self {
        Self::from_validated(Vec::new())
    }

    fn from_validated(intervals: Vec<(i64, i64)>) -> Self {
        let (offsets, size) = compute_offsets(&intervals);
        Self {
            intervals,
            offsets,
            size,
        }
    }

    /// Total number of covered keys.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[must_use]
    pub fn intervals(&self) -> &[(i64, i64)] {
        &self.intervals
    }

    /// Lowest and highest covered key, or `None` when empty.
    #[must_use]
    pub fn key_range(&self) -> Option<(i64, i64)> {
        let first = self.intervals.first()?;
        let last = self.intervals.last()?;
        Some((first.0, last.1))
    }

    /// Interval position containing `key`, or the insertion point.
    fn locate_interval(&self, key: i64) -> Result<usize, usize> {
        binary_search_by(self.intervals.len(), |i| {
            let (low, high) = self.intervals[i];
            if high < key {
                Ordering::Less
            } else if low > key {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        })
    }

    /// Dense address of a covered key. Callers are expected to have
    /// established containment; an uncovered key is an error.
    pub fn address_of_key(&self, key: i64) -> Result<Address, RangesError> {
        match self.locate_interval(key) {
            Ok(i) => {
                let (low, _) = self.intervals[i];
                Ok(Address::new(self.offsets[i] + interval_len(low, key) - 1))
            }
            Err(_) => Err(RangesError::KeyNotCovered(key)),
        }
    }

    /// Key at a dense address in `[0, size)`, or `None` out of bounds.
    #[must_use]
    pub fn key_of_address(&self, address: Address) -> Option<i64> {
        let offset = address.as_usize();
        if offset >= self.size {
            return None;
        }
        let interval = match binary_search_by(self.offsets.len(), |i| self.offsets[i].cmp(&offset))
        {
            Ok(i) => i,
            Err(insertion) => insertion - 1,
        };
        let (low, _) = self.intervals[interval];
        Some(low + (offset - self.offsets[interval]) as i64)
    }

    /// Every covered key in ascending order. Lazy and restartable: each call
    /// produces a fresh iterator over the same intervals.
    pub fn keys(&self) -> impl Iterator<Item = i64> + '_ {
        self.intervals.iter().flat_map(|&(low, high)| low..=high)
    }

    /// Address of the smallest covered key `>= key`, or `None` past the end.
    fn seek_forward(&self, key: i64) -> Option<usize> {
        match self.locate_interval(key) {
            Ok(i) => {
                let (low, _) = self.intervals[i];
                Some(self.offsets[i] + interval_len(low, key) - 1)
            }
            Err(insertion) => {
                if insertion == self.intervals.len() {
                    None
                } else {
                    Some(self.offsets[insertion])
                }
            }
        }
    }

    /// Address of the largest covered key `<= key`, or `None` before the start.
    fn seek_backward(&self, key: i64) -> Option<usize> {
        match self.locate_interval(key) {
            Ok(i) => {
                let (low, _) = self.intervals[i];
                Some(self.offsets[i] + interval_len(low, key) - 1)
            }
            Err(insertion) => {
                if insertion == 0 {
                    None
                } else {
                    let (low, high) = self.intervals[insertion - 1];
                    Some(self.offsets[insertion - 1] + interval_len(low, high) - 1)
                }
            }
        }
    }

    /// Directional search for a key under the given lookup kind.
    ///
    /// The `check` predicate is consulted for every candidate address in the
    /// scan direction until it succeeds or the range boundary is exceeded.
    /// Keys in a gap resolve to the neighboring interval in the scan
    /// direction; keys entirely outside the covered span clamp to the first
    /// or last address for the `ExactOr*` kinds and are missing for the
    /// strict kinds. Out-of-bounds and predicate exhaustion are `None`,
    /// never an error.
    #[must_use]
    pub fn lookup(
        &self,
        key: i64,
        semantics: Lookup,
        check: impl Fn(Address) -> bool,
    ) -> Option<(i64, Address)> {
        if self.is_empty() {
            return None;
        }
        match semantics {
            Lookup::Exact => {
                let address = self.address_of_key(key).ok()?;
                check(address).then_some((key, address))
            }
            Lookup::Greater => {
                let start = self.seek_forward(key.checked_add(1)?)?;
                self.scan_forward(start, check)
            }
            Lookup::ExactOrGreater => {
                let start = self.seek_forward(key)?;
                self.scan_forward(start, check)
            }
            Lookup::Smaller => {
                let start = self.seek_backward(key.checked_sub(1)?)?;
                self.scan_backward(start, check)
            }
            Lookup::ExactOrSmaller => {
                let start = self.seek_backward(key)?;
                self.scan_backward(start, check)
            }
        }
    }

    fn scan_forward(
        &self,
        start: usize,
        check: impl Fn(Address) -> bool,
    ) -> Option<(i64, Address)> {
        (start..self.size).find_map(|offset| {
            let address = Address::new(offset);
            check(address).then(|| (self.key_of_address(address), address))
        })
        .and_then(|(key, address)| Some((key?, address)))
    }

    fn scan_backward(
        &self,
        start: usize,
        check: impl Fn(Address) -> bool,
    ) -> Option<(i64, Address)> {
        (0..=start).rev().find_map(|offset| {
            let address = Address::new(offset);
            check(address).then(|| (self.key_of_address(address), address))
        })
        .and_then(|(key, address)| Some((key?, address)))
    }

    /// Merges multiple `Ranges` into one unified virtualized space.
    ///
    /// Intervals are k-way merged by low bound (each input must already be
    /// internally sorted and non-overlapping; that is an input invariant and
    /// is not re-validated here). Overlap across inputs is an error; exactly
    /// adjacent intervals are merged into one. Offsets are recomputed from
    /// scratch over the merged list.
    pub fn combine(inputs: &[Ranges]) -> Result<Ranges, RangesError> {
        // Min-heap of (interval, input, position), ordered by low bound.
        let mut heap = BinaryHeap::new();
        for (source, ranges) in inputs.iter().enumerate() {
            if let Some(&interval) = ranges.intervals.first() {
                heap.push(std::cmp::Reverse((interval, source, 0_usize)));
            }
        }

        let total: usize = inputs.iter().map(|r| r.intervals.len()).sum();
        let mut merged: Vec<(i64, i64)> = Vec::with_capacity(total);

        while let Some(std::cmp::Reverse(((low, high), source, position))) = heap.pop() {
            match merged.last_mut() {
                Some(last) if low <= last.1 => {
                    return Err(RangesError::OverlappingIntervals {
                        low,
                        previous_high: last.1,
                    });
                }
                Some(last) if low == last.1 + 1 => {
                    last.1 = high;
                }
                _ => merged.push((low, high)),
            }

            let next = position + 1;
            if let Some(&interval) = inputs[source].intervals.get(next) {
                heap.push(std::cmp::Reverse((interval, source, next)));
            }
        }

        Ok(Ranges::from_validated(merged))
    }

    /// Clips to the inclusive key window `[lo_key, hi_key]`, producing a new
    /// `Ranges` (possibly empty).
    #[must_use]
    pub fn restrict(&self, lo_key: i64, hi_key: i64) -> Ranges {
        let clipped: Vec<(i64, i64)> = self
            .intervals
            .iter()
            .filter_map(|&(low, high)| {
                let lo = low.max(lo_key);
                let hi = high.min(hi_key);
                (lo <= hi).then_some((lo, hi))
            })
            .collect();
        Ranges::from_validated(clipped)
    }
}
