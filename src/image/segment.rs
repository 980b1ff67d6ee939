//! Sorted sets of non-overlapping byte ranges
//!
//! A [SegmentSet] never holds two segments which overlap or touch: every
//! mutation coalesces neighbouring ranges, so a lookup by address finds at
//! most one segment.

use std::{fmt, ops::Range};

/// A contiguous run of bytes at some address
#[derive(Clone, PartialEq, Eq)]
pub struct Segment {
    address: u32,
    data: Vec<u8>,
}

impl Segment {
    pub fn new(address: u32, data: Vec<u8>) -> Self {
        Segment { address, data }
    }

    /// Address of the first byte
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Address one past the last byte
    pub fn end(&self) -> u64 {
        self.address as u64 + self.data.len() as u64
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn contains(&self, address: u32) -> bool {
        address >= self.address && (address as u64) < self.end()
    }

    fn range(&self) -> Range<u64> {
        self.address as u64..self.end()
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Segment({:#x}..{:#x})", self.address, self.end())
    }
}

/// Which side wins when an inserted segment overlaps existing data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Bytes already in the set are kept
    Existing,
    /// Incoming bytes replace what is already in the set
    Incoming,
}

/// An ordered set of non-overlapping, non-touching segments
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentSet {
    segments: Vec<Segment>,
}

impl SegmentSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter()
    }

    /// Total number of bytes held by the set
    pub fn byte_count(&self) -> usize {
        self.segments.iter().map(Segment::len).sum()
    }

    /// Remove and return all segments in ascending address order
    pub fn take(&mut self) -> Vec<Segment> {
        std::mem::take(&mut self.segments)
    }

    /// Find the segment covering `address`
    pub fn find(&self, address: u32) -> Option<&Segment> {
        let idx = self
            .segments
            .partition_point(|s| s.end() <= address as u64);

        self.segments.get(idx).filter(|s| s.contains(address))
    }

    fn find_mut(&mut self, address: u32) -> Option<&mut Segment> {
        let idx = self
            .segments
            .partition_point(|s| s.end() <= address as u64);

        self.segments.get_mut(idx).filter(|s| s.contains(address))
    }

    /// Start address of the first segment beginning after `address`
    pub fn next_start_after(&self, address: u32) -> Option<u32> {
        let idx = self.segments.partition_point(|s| s.address <= address);
        self.segments.get(idx).map(|s| s.address)
    }

    pub fn byte_at(&self, address: u32) -> Option<u8> {
        self.find(address)
            .map(|s| s.data[(address - s.address) as usize])
    }

    /// Whether every byte of `range` is present in the set
    pub fn covers(&self, range: Range<u64>) -> bool {
        if range.is_empty() {
            return true;
        }
        if range.start > u32::MAX as u64 {
            return false;
        }

        self.find(range.start as u32)
            .is_some_and(|s| s.end() >= range.end)
    }

    /// Copy the bytes this set holds for `range` into `buf`, leaving bytes
    /// outside of any segment untouched
    pub fn overlay(&self, start: u64, buf: &mut [u8]) {
        let end = start + buf.len() as u64;
        let first = self.segments.partition_point(|s| s.end() <= start);

        for segment in self.segments[first..]
            .iter()
            .take_while(|s| (s.address as u64) < end)
        {
            let from = start.max(segment.address as u64);
            let to = end.min(segment.end());
            let src = &segment.data[(from - segment.address as u64) as usize..]
                [..(to - from) as usize];

            buf[(from - start) as usize..][..src.len()].copy_from_slice(src);
        }
    }

    /// Overwrite bytes of an existing segment in place, returning how many
    /// bytes were written (stops at the end of the covering segment)
    pub fn overwrite(&mut self, address: u32, bytes: &[u8]) -> usize {
        match self.find_mut(address) {
            Some(segment) => {
                let offset = (address - segment.address) as usize;
                let n = bytes.len().min(segment.data.len() - offset);
                segment.data[offset..][..n].copy_from_slice(&bytes[..n]);
                n
            }
            None => 0,
        }
    }

    /// Insert a segment, coalescing it with every segment it overlaps or
    /// touches
    pub fn insert(&mut self, segment: Segment, priority: Priority) {
        if segment.is_empty() {
            return;
        }

        let new = segment.range();
        let lo = self.segments.partition_point(|s| s.end() < new.start);
        let hi = self.segments.partition_point(|s| s.address as u64 <= new.end);

        if lo == hi {
            self.segments.insert(lo, segment);
            return;
        }

        let start = new.start.min(self.segments[lo].address as u64);
        let end = new.end.max(self.segments[hi - 1].end());
        let mut data = vec![0xFF; (end - start) as usize];

        let place = |s: &Segment, data: &mut Vec<u8>| {
            let offset = (s.address as u64 - start) as usize;
            data[offset..][..s.len()].copy_from_slice(&s.data);
        };

        match priority {
            Priority::Incoming => {
                for s in &self.segments[lo..hi] {
                    place(s, &mut data);
                }
                place(&segment, &mut data);
            }
            Priority::Existing => {
                place(&segment, &mut data);
                for s in &self.segments[lo..hi] {
                    place(s, &mut data);
                }
            }
        }

        self.segments
            .splice(lo..hi, [Segment::new(start as u32, data)]);
    }

    /// Merge every segment of `other` into this set
    pub fn merge(&mut self, other: SegmentSet, priority: Priority) {
        for segment in other.segments {
            self.insert(segment, priority);
        }
    }

    /// Drop all bytes in `range`, splitting segments which straddle it
    pub fn remove_range(&mut self, range: Range<u64>) {
        if range.is_empty() {
            return;
        }

        let lo = self.segments.partition_point(|s| s.end() <= range.start);
        let hi = self
            .segments
            .partition_point(|s| (s.address as u64) < range.end);
        if lo >= hi {
            return;
        }

        let mut replacement = Vec::with_capacity(2);
        let first = &self.segments[lo];
        if (first.address as u64) < range.start {
            let keep = (range.start - first.address as u64) as usize;
            replacement.push(Segment::new(first.address, first.data[..keep].to_vec()));
        }
        let last = &self.segments[hi - 1];
        if last.end() > range.end {
            let skip = (range.end - last.address as u64) as usize;
            replacement.push(Segment::new(range.end as u32, last.data[skip..].to_vec()));
        }

        self.segments.splice(lo..hi, replacement);
    }

    /// Check the ordering invariant: sorted, no overlaps, no touching
    pub fn is_canonical(&self) -> bool {
        self.segments.iter().all(|s| !s.is_empty())
            && self
                .segments
                .windows(2)
                .all(|w| w[0].end() < w[1].address as u64)
    }
}

impl FromIterator<Segment> for SegmentSet {
    fn from_iter<T: IntoIterator<Item = Segment>>(iter: T) -> Self {
        let mut set = SegmentSet::new();
        for segment in iter {
            set.insert(segment, Priority::Incoming);
        }
        set
    }
}
