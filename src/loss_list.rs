use crate::sequence_number::SequenceNumber;
use std::cmp::Ordering;

/// An ordered set of missing sequence numbers, stored as disjoint, non-adjacent
///  inclusive intervals `[lo, hi]`.
///
/// All ordering is the circular order of [SequenceNumber::cmp_seq], so the set stays
///  correct across the 27-bit wrap point as long as its total span stays below a quarter
///  of the sequence circle (which the receive and flow windows guarantee).
///
/// Intervals are coalesced on every mutation; reads on an empty list return `None`.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct LossList {
    intervals: Vec<(SequenceNumber, SequenceNumber)>,
    length: u32,
}

impl LossList {
    pub fn new() -> LossList {
        LossList::default()
    }

    /// Insert a single missing sequence number.
    pub fn append(&mut self, seq: SequenceNumber) {
        self.append_range(seq, seq);
    }

    /// Insert the inclusive range `[lo, hi]` of missing sequence numbers. `hi` must not
    ///  be before `lo` in circular order.
    pub fn append_range(&mut self, lo: SequenceNumber, hi: SequenceNumber) {
        debug_assert!(!hi.is_before(lo));

        // find the first interval that ends at or after (lo - 1) - everything before it is
        //  untouched by the insert
        let mut idx = self.intervals
            .partition_point(|&(_, existing_hi)| existing_hi.is_before(lo.prev()));

        let mut lo = lo;
        let mut hi = hi;

        // swallow every interval that overlaps or is adjacent to [lo, hi]
        while idx < self.intervals.len() {
            let (existing_lo, existing_hi) = self.intervals[idx];
            if hi.next().is_before(existing_lo) {
                break;
            }
            if existing_lo.is_before(lo) {
                lo = existing_lo;
            }
            if existing_hi.is_after(hi) {
                hi = existing_hi;
            }
            self.length -= existing_lo.span_to(existing_hi);
            self.intervals.remove(idx);
        }

        self.length += lo.span_to(hi);
        self.intervals.insert(idx, (lo, hi));
    }

    /// Remove a single sequence number, returning whether it was present.
    pub fn remove(&mut self, seq: SequenceNumber) -> bool {
        let idx = self.intervals
            .partition_point(|&(_, existing_hi)| existing_hi.is_before(seq));
        let Some(&(lo, hi)) = self.intervals.get(idx) else {
            return false;
        };
        if seq.is_before(lo) {
            return false;
        }

        match (seq == lo, seq == hi) {
            (true, true) => {
                self.intervals.remove(idx);
            }
            (true, false) => {
                self.intervals[idx].0 = lo.next();
            }
            (false, true) => {
                self.intervals[idx].1 = hi.prev();
            }
            (false, false) => {
                self.intervals[idx].1 = seq.prev();
                self.intervals.insert(idx + 1, (seq.next(), hi));
            }
        }
        self.length -= 1;
        true
    }

    /// Drop every entry strictly before `seq`.
    pub fn remove_up_to(&mut self, seq: SequenceNumber) {
        while let Some(&(lo, hi)) = self.intervals.first() {
            if !lo.is_before(seq) {
                break;
            }
            if hi.is_before(seq) {
                self.length -= lo.span_to(hi);
                self.intervals.remove(0);
            }
            else {
                self.length -= lo.span_to(seq.prev());
                self.intervals[0].0 = seq;
                break;
            }
        }
    }

    /// Remove and return the smallest missing sequence number.
    pub fn pop_front(&mut self) -> Option<SequenceNumber> {
        let &(lo, hi) = self.intervals.first()?;
        if lo == hi {
            self.intervals.remove(0);
        }
        else {
            self.intervals[0].0 = lo.next();
        }
        self.length -= 1;
        Some(lo)
    }

    /// The smallest missing sequence number, if any.
    pub fn first(&self) -> Option<SequenceNumber> {
        self.intervals.first().map(|&(lo, _)| lo)
    }

    pub fn contains(&self, seq: SequenceNumber) -> bool {
        let idx = self.intervals
            .partition_point(|&(_, existing_hi)| existing_hi.is_before(seq));
        match self.intervals.get(idx) {
            Some(&(lo, _)) => lo.cmp_seq(seq) != Ordering::Greater,
            None => false,
        }
    }

    /// Total count of missing sequence numbers (not intervals).
    pub fn len(&self) -> u32 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn clear(&mut self) {
        self.intervals.clear();
        self.length = 0;
    }

    /// The stored intervals, for loss reporting.
    pub fn intervals(&self) -> &[(SequenceNumber, SequenceNumber)] {
        &self.intervals
    }
}
