//! Lazily populated, write-buffered view of a flash chip
//!
//! A [FlashImage] keeps two [SegmentSet]s: bytes known to be on the device
//! (the read cache) and bytes staged to be written. Missing ranges are
//! fetched through a [FlashIo] implementation on demand, and staged writes
//! are pushed back through it on [FlashImage::flush].
//!
//! Codecs only ever talk to the image, so they work the same against a live
//! device and against a dump loaded into memory.

use std::{
    ops::Range,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use log::{debug, trace};

pub use self::segment::{Priority, Segment, SegmentSet};
use crate::error::{CoverageError, Error};

pub mod segment;

/// Value of erased flash
pub const ERASED: u8 = 0xFF;
/// Default write granularity of the image
pub const DEFAULT_BLOCK_SIZE: u32 = 0x1000;
/// Default number of read callback invocations allowed per cache fill
pub const DEFAULT_FILL_RETRY_LIMIT: usize = 4096;

/// Data returned by a read callback
///
/// The callback may answer with a different (usually larger, aligned) range
/// than the one requested; the bytes are recorded at `address`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub address: u32,
    pub data: Vec<u8>,
}

/// Backing storage of a [FlashImage]
#[async_trait]
pub trait FlashIo: Send + Sync {
    /// Fetch (at least the start of) `length` bytes at `address`
    async fn read_range(&self, address: u32, length: u32) -> Result<Fetched, Error>;

    /// Persist `data` at `address`
    async fn write_range(&self, address: u32, data: &[u8]) -> Result<(), Error>;

    /// Called by [FlashImage::flush] before any data is written, for example
    /// to re-align the staged writes to the device's erase size
    async fn prepare_flush(&self, _image: &FlashImage) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Segments {
    read: SegmentSet,
    write: SegmentSet,
}

impl Segments {
    fn effective_byte(&self, address: u32) -> Option<u8> {
        self.write
            .byte_at(address)
            .or_else(|| self.read.byte_at(address))
    }

    /// Effective bytes of `range`, uncovered bytes read as erased
    fn materialize(&self, range: Range<u64>) -> Vec<u8> {
        let mut buf = vec![ERASED; (range.end - range.start) as usize];
        self.read.overlay(range.start, &mut buf);
        self.write.overlay(range.start, &mut buf);
        buf
    }

    /// First sub-range of `range` present in neither set
    fn first_gap(&self, range: Range<u64>) -> Option<Range<u64>> {
        let mut pos = range.start;

        while pos < range.end {
            let addr = pos as u32;
            let covered_to = [self.read.find(addr), self.write.find(addr)]
                .into_iter()
                .flatten()
                .map(Segment::end)
                .max();

            match covered_to {
                Some(end) => pos = end,
                None => {
                    let gap_end = [self.read.next_start_after(addr), self.write.next_start_after(addr)]
                        .into_iter()
                        .flatten()
                        .map(u64::from)
                        .chain([range.end])
                        .min()
                        .unwrap_or(range.end);

                    return Some(pos..gap_end);
                }
            }
        }

        None
    }

    /// Next address after `pos` where coverage of either set changes
    fn next_boundary(&self, pos: u32, limit: u64) -> u64 {
        [
            self.read.next_start_after(pos).map(u64::from),
            self.write.next_start_after(pos).map(u64::from),
            self.read.find(pos).map(Segment::end),
        ]
        .into_iter()
        .flatten()
        .chain([limit])
        .min()
        .unwrap_or(limit)
    }
}

/// A sparse, cacheable, byte-addressable view of a flash region
pub struct FlashImage {
    size: u32,
    block_size: u32,
    fill_retry_limit: usize,
    io: Option<Arc<dyn FlashIo>>,
    segments: Mutex<Segments>,
    fill_lock: tokio::sync::Mutex<()>,
    flush_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for FlashImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlashImage")
            .field("size", &self.size)
            .field("block_size", &self.block_size)
            .field("has_io", &self.io.is_some())
            .finish()
    }
}

impl FlashImage {
    /// Create an empty image of `size` bytes backed by `io`
    ///
    /// Without `io`, missing ranges are filled with erased flash and flushes
    /// only commit the staged writes into the cache.
    pub fn new(size: u32, io: Option<Arc<dyn FlashIo>>) -> Self {
        Self {
            size,
            block_size: DEFAULT_BLOCK_SIZE,
            fill_retry_limit: DEFAULT_FILL_RETRY_LIMIT,
            io,
            segments: Mutex::new(Segments::default()),
            fill_lock: tokio::sync::Mutex::new(()),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Wrap a complete dump
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let image = Self::new(data.len() as u32, None);
        image.seed(0, data);
        image
    }

    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size.max(1);
        self
    }

    pub fn with_fill_retry_limit(mut self, limit: usize) -> Self {
        self.fill_retry_limit = limit.max(1);
        self
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    fn lock(&self) -> MutexGuard<'_, Segments> {
        // A poisoned lock only means another thread panicked mid-operation;
        // the sets themselves are still canonical
        self.segments.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_range(&self, address: u32, length: usize) -> Result<Range<u64>, CoverageError> {
        let start = address as u64;
        let end = start + length as u64;

        if end > self.size as u64 {
            return Err(CoverageError::OutOfRange {
                address: start,
                end,
                size: self.size,
            });
        }

        Ok(start..end)
    }

    /// Add known device contents to the read cache
    pub fn seed(&self, address: u32, data: Vec<u8>) {
        let mut data = data;
        let limit = (self.size as u64).saturating_sub(address as u64) as usize;
        data.truncate(limit);

        self.lock()
            .read
            .insert(Segment::new(address, data), Priority::Incoming);
    }

    /// Make sure every byte in the range is present in the cache or the
    /// staged writes
    pub async fn ensure_cached(&self, address: u32, length: usize) -> Result<(), Error> {
        let range = self.check_range(address, length)?;
        if range.is_empty() {
            return Ok(());
        }

        let _guard = self.fill_lock.lock().await;
        let mut attempts = 0;

        loop {
            let Some(gap) = self.lock().first_gap(range.clone()) else {
                return Ok(());
            };

            let gap_start = gap.start as u32;
            let gap_len = (gap.end - gap.start) as u32;

            let Some(io) = &self.io else {
                self.lock().read.insert(
                    Segment::new(gap_start, vec![ERASED; gap_len as usize]),
                    Priority::Existing,
                );
                continue;
            };

            if attempts >= self.fill_retry_limit {
                return Err(CoverageError::RetryLimit(attempts).into());
            }
            attempts += 1;

            trace!("Fetching {:#x} bytes at {:#x}", gap_len, gap_start);
            let fetched = io.read_range(gap_start, gap_len).await?;

            let mut data = fetched.data;
            let limit = (self.size as u64).saturating_sub(fetched.address as u64) as usize;
            data.truncate(limit);
            let progressed = fetched.address <= gap_start
                && fetched.address as u64 + data.len() as u64 > gap.start;

            self.lock()
                .read
                .insert(Segment::new(fetched.address, data), Priority::Incoming);

            if !progressed {
                return Err(CoverageError::NoProgress {
                    address: gap_start,
                    length: gap_len,
                }
                .into());
            }
        }
    }

    /// Effective byte at `address`; uncached bytes read as erased flash
    pub fn byte_at(&self, address: u32) -> Result<u8, Error> {
        self.check_range(address, 1)?;
        Ok(self.lock().effective_byte(address).unwrap_or(ERASED))
    }

    /// Effective contents of a range without fetching anything
    pub fn read_range(&self, address: u32, length: usize) -> Result<Vec<u8>, Error> {
        let range = self.check_range(address, length)?;
        Ok(self.lock().materialize(range))
    }

    /// Fetch a range if needed, then return its effective contents
    pub async fn read_range_async(&self, address: u32, length: usize) -> Result<Vec<u8>, Error> {
        self.ensure_cached(address, length).await?;
        self.read_range(address, length)
    }

    /// Shorthand for [FlashImage::read_range_async]
    pub async fn read(&self, address: u32, length: usize) -> Result<Vec<u8>, Error> {
        self.read_range_async(address, length).await
    }

    pub async fn read_u8(&self, address: u32) -> Result<u8, Error> {
        self.ensure_cached(address, 1).await?;
        self.byte_at(address)
    }

    pub async fn read_u16(&self, address: u32) -> Result<u16, Error> {
        let bytes = self.read(address, 2).await?;
        Ok(u16::from_le_bytes(bytes[..2].try_into()?))
    }

    pub async fn read_u32(&self, address: u32) -> Result<u32, Error> {
        let bytes = self.read(address, 4).await?;
        Ok(u32::from_le_bytes(bytes[..4].try_into()?))
    }

    /// Full contents of the image
    pub async fn to_vec(&self) -> Result<Vec<u8>, Error> {
        self.read(0, self.size as usize).await
    }

    /// Stage `bytes` at `address` without touching the backing storage
    pub fn write(&self, address: u32, bytes: &[u8]) -> Result<(), Error> {
        let range = self.check_range(address, bytes.len())?;
        if range.is_empty() {
            return Ok(());
        }

        let bs = self.block_size as u64;
        let mut segments = self.lock();
        let mut pos = range.start;

        while pos < range.end {
            let addr = pos as u32;
            let src = |from: u64, to: u64| slice_at(bytes, range.start, from..to);

            // Already staged: overwrite in place
            if segments.write.find(addr).is_some() {
                let written = segments.write.overwrite(addr, src(pos, range.end));
                pos += written as u64;
                continue;
            }

            let boundary = segments.next_boundary(addr, range.end);

            let Some(cached) = segments.read.find(addr) else {
                segments
                    .write
                    .insert(Segment::new(addr, src(pos, boundary).to_vec()), Priority::Incoming);
                pos = boundary;
                continue;
            };

            // Skip over bytes which already hold the right value
            let offset = (pos - cached.address() as u64) as usize;
            let same = cached.data()[offset..]
                .iter()
                .zip(src(pos, boundary))
                .take_while(|(a, b)| a == b)
                .count() as u64;
            pos += same;
            if pos >= boundary {
                continue;
            }

            let block_start = pos / bs * bs;
            let block_end = (block_start + bs).min(self.size as u64);

            if segments.read.covers(block_start..block_end) {
                let mut block = segments.materialize(block_start..block_end);
                let from = range.start.max(block_start);
                let to = range.end.min(block_end);
                block[(from - block_start) as usize..(to - block_start) as usize]
                    .copy_from_slice(src(from, to));

                segments
                    .write
                    .insert(Segment::new(block_start as u32, block), Priority::Incoming);
                pos = to;
            } else {
                segments
                    .write
                    .insert(Segment::new(pos as u32, src(pos, boundary).to_vec()), Priority::Incoming);
                pos = boundary;
            }
        }

        // Drop staged blocks which ended up identical to the device contents
        let first_block = range.start / bs;
        let last_block = (range.end - 1) / bs;
        for block in first_block..=last_block {
            let block_range = block * bs..((block + 1) * bs).min(self.size as u64);
            prune_block(&mut segments, block_range);
        }

        Ok(())
    }

    /// Whether there are staged writes
    pub fn is_dirty(&self) -> bool {
        !self.lock().write.is_empty()
    }

    /// Snapshot of the staged writes
    pub fn pending_writes(&self) -> SegmentSet {
        self.lock().write.clone()
    }

    /// Snapshot of the read cache
    pub fn cached_segments(&self) -> SegmentSet {
        self.lock().read.clone()
    }

    /// Forget all staged writes
    pub fn discard_pending(&self) {
        self.lock().write.take();
    }

    /// Expand every staged write to whole `block`-sized blocks
    ///
    /// Bytes around the staged data are taken from the cache, so the caller
    /// should make sure the surrounding blocks are cached first (see
    /// [FlashImage::ensure_pending_blocks_cached]).
    pub fn align_pending_writes(&self, block: u32) {
        let block = block.max(1) as u64;
        let mut segments = self.lock();
        let staged = segments.write.take();
        let mut aligned = SegmentSet::new();

        for segment in &staged {
            let start = segment.address() as u64 / block * block;
            let end = segment.end().div_ceil(block) * block;
            let end = end.min(self.size as u64);
            let mut buf = vec![ERASED; (end - start) as usize];
            segments.read.overlay(start, &mut buf);
            aligned.insert(Segment::new(start as u32, buf), Priority::Existing);
        }
        for segment in staged {
            aligned.insert(segment, Priority::Incoming);
        }

        segments.write = aligned;
    }

    /// Fetch the blocks surrounding every staged write
    pub async fn ensure_pending_blocks_cached(&self, block: u32) -> Result<(), Error> {
        let block = block.max(1) as u64;
        let ranges: Vec<_> = self
            .lock()
            .write
            .iter()
            .map(|s| {
                let start = s.address() as u64 / block * block;
                let end = (s.end().div_ceil(block) * block).min(self.size as u64);
                start..end
            })
            .collect();

        for range in ranges {
            self.ensure_read_cached(range).await?;
        }

        Ok(())
    }

    /// Like [FlashImage::ensure_cached] but only considers the read cache,
    /// so staged bytes do not hide the device contents beneath them
    async fn ensure_read_cached(&self, range: Range<u64>) -> Result<(), Error> {
        let Some(io) = &self.io else {
            return Ok(());
        };
        let _guard = self.fill_lock.lock().await;

        for _ in 0..self.fill_retry_limit {
            let gap = {
                let segments = self.lock();
                let mut pos = range.start;
                loop {
                    if pos >= range.end {
                        break None;
                    }
                    match segments.read.find(pos as u32) {
                        Some(s) => pos = s.end(),
                        None => {
                            let end = segments
                                .read
                                .next_start_after(pos as u32)
                                .map(u64::from)
                                .unwrap_or(range.end)
                                .min(range.end);
                            break Some(pos..end);
                        }
                    }
                }
            };
            let Some(gap) = gap else {
                return Ok(());
            };

            let fetched = io
                .read_range(gap.start as u32, (gap.end - gap.start) as u32)
                .await?;
            let progressed = fetched.address as u64 <= gap.start
                && fetched.address as u64 + fetched.data.len() as u64 > gap.start;
            self.seed(fetched.address, fetched.data);

            if !progressed {
                return Err(CoverageError::NoProgress {
                    address: gap.start as u32,
                    length: (gap.end - gap.start) as u32,
                }
                .into());
            }
        }

        Err(CoverageError::RetryLimit(self.fill_retry_limit).into())
    }

    /// Push all staged writes to the backing storage
    ///
    /// Segments are written in ascending address order; once written they
    /// become part of the read cache.
    pub async fn flush(&self) -> Result<(), Error> {
        let _guard = self.flush_lock.lock().await;

        if !self.is_dirty() {
            return Ok(());
        }

        let Some(io) = &self.io else {
            let mut segments = self.lock();
            let staged = std::mem::take(&mut segments.write);
            segments.read.merge(staged, Priority::Incoming);
            return Ok(());
        };

        io.prepare_flush(self).await?;

        let staged = self.pending_writes();
        debug!(
            "Flushing {} segment(s), {:#x} bytes",
            staged.len(),
            staged.byte_count()
        );

        for segment in staged.iter() {
            io.write_range(segment.address(), segment.data()).await?;

            let mut segments = self.lock();
            let range = segment.address() as u64..segment.end();
            segments.write.remove_range(range);
            segments.read.insert(segment.clone(), Priority::Incoming);
        }

        Ok(())
    }
}

fn slice_at(bytes: &[u8], base: u64, range: Range<u64>) -> &[u8] {
    &bytes[(range.start - base) as usize..(range.end - base) as usize]
}

/// Remove the staged bytes of `block` if they equal the cached bytes
fn prune_block(segments: &mut Segments, block: Range<u64>) {
    let mut staged = vec![];
    for segment in segments.write.iter() {
        let from = block.start.max(segment.address() as u64);
        let to = block.end.min(segment.end());
        if from < to {
            staged.push(from..to);
        }
    }
    if staged.is_empty() {
        return;
    }

    let identical = staged.iter().all(|r| {
        if !segments.read.covers(r.clone()) {
            return false;
        }
        let mut cached = vec![0; (r.end - r.start) as usize];
        let mut pending = cached.clone();
        segments.read.overlay(r.start, &mut cached);
        segments.write.overlay(r.start, &mut pending);
        cached == pending
    });

    if identical {
        trace!("Pruning no-op write to {:#x}..{:#x}", block.start, block.end);
        for r in staged {
            segments.write.remove_range(r);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;

    use super::*;

    /// Backing storage which records every call
    #[derive(Default)]
    struct MemoryIo {
        data: Mutex<Vec<u8>>,
        reads: AtomicUsize,
        writes: Mutex<Vec<(u32, usize)>>,
        align: Option<u32>,
        latency: Option<std::time::Duration>,
        fail_write_at: Option<u32>,
    }

    impl MemoryIo {
        fn new(data: Vec<u8>) -> Self {
            MemoryIo {
                data: Mutex::new(data),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl FlashIo for MemoryIo {
        async fn read_range(&self, address: u32, length: u32) -> Result<Fetched, Error> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if let Some(latency) = self.latency {
                tokio::time::sleep(latency).await;
            }
            let data = self.data.lock().unwrap();
            let (start, end) = match self.align {
                Some(a) => (
                    address / a * a,
                    ((address + length).div_ceil(a) * a).min(data.len() as u32),
                ),
                None => (address, address + length),
            };
            Ok(Fetched {
                address: start,
                data: data[start as usize..end as usize].to_vec(),
            })
        }

        async fn write_range(&self, address: u32, bytes: &[u8]) -> Result<(), Error> {
            if self.fail_write_at == Some(address) {
                return Err(std::io::Error::other("write failed").into());
            }
            self.writes.lock().unwrap().push((address, bytes.len()));
            self.data.lock().unwrap()[address as usize..][..bytes.len()].copy_from_slice(bytes);
            Ok(())
        }
    }

    struct StuckIo;

    #[async_trait]
    impl FlashIo for StuckIo {
        async fn read_range(&self, address: u32, _length: u32) -> Result<Fetched, Error> {
            Ok(Fetched {
                address: address + 1,
                data: vec![0; 4],
            })
        }

        async fn write_range(&self, _address: u32, _data: &[u8]) -> Result<(), Error> {
            Ok(())
        }
    }

    /// Answers every read with a single byte
    struct TrickleIo;

    #[async_trait]
    impl FlashIo for TrickleIo {
        async fn read_range(&self, address: u32, _length: u32) -> Result<Fetched, Error> {
            Ok(Fetched {
                address,
                data: vec![0x5A],
            })
        }

        async fn write_range(&self, _address: u32, _data: &[u8]) -> Result<(), Error> {
            Ok(())
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let io = Arc::new(MemoryIo::new(pattern(0x3000)));
        let image = FlashImage::new(0x3000, Some(io.clone()));

        image.write(0x0ffe, &[0xAA; 5]).unwrap();
        assert_eq!(image.read(0x0ffe, 5).await.unwrap(), vec![0xAA; 5]);

        image.ensure_cached(0, 0x3000).await.unwrap();
        image.write(0x1800, &[1, 2, 3]).unwrap();
        assert_eq!(image.read(0x1800, 3).await.unwrap(), vec![1, 2, 3]);
        assert!(image.pending_writes().is_canonical());
        assert!(image.cached_segments().is_canonical());
    }

    #[tokio::test]
    async fn fully_cached_block_is_staged_whole() {
        let io = Arc::new(MemoryIo::new(pattern(0x2000)));
        let image = FlashImage::new(0x2000, Some(io.clone()));
        image.ensure_cached(0, 0x1000).await.unwrap();

        image.write(0x10, &[0xEE]).unwrap();

        let pending = image.pending_writes();
        assert_eq!(pending.len(), 1);
        let segment = pending.iter().next().unwrap();
        assert_eq!(segment.address(), 0);
        assert_eq!(segment.len(), 0x1000);
        assert_eq!(segment.data()[0x10], 0xEE);
        assert_eq!(segment.data()[0x11], pattern(0x12)[0x11]);
    }

    #[tokio::test]
    async fn identical_write_is_pruned() {
        let data = pattern(0x2000);
        let image = FlashImage::from_bytes(data.clone());

        image.write(0x100, &data[0x100..0x180]).unwrap();
        assert!(!image.is_dirty());

        image.write(0x100, &[0x00]).unwrap();
        assert!(image.is_dirty());
        image.write(0x100, &data[0x100..0x101]).unwrap();
        assert!(!image.is_dirty());
    }

    #[tokio::test]
    async fn uncached_write_stages_only_the_bytes() {
        let io = Arc::new(MemoryIo::new(pattern(0x2000)));
        let image = FlashImage::new(0x2000, Some(io.clone()));

        image.write(0x1ff0, &[1, 2, 3, 4]).unwrap();

        let pending = image.pending_writes();
        let segment = pending.iter().next().unwrap();
        assert_eq!((segment.address(), segment.len()), (0x1ff0, 4));
        assert_eq!(io.reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn flush_writes_in_order_and_merges_into_cache() {
        let io = Arc::new(MemoryIo::new(vec![0; 0x4000]));
        let image = FlashImage::new(0x4000, Some(io.clone()));

        image.write(0x3000, &[3; 4]).unwrap();
        image.write(0x0100, &[1; 4]).unwrap();
        image.flush().await.unwrap();

        assert_eq!(
            *io.writes.lock().unwrap(),
            vec![(0x0100, 4), (0x3000, 4)]
        );
        assert!(!image.is_dirty());
        assert_eq!(image.byte_at(0x3001).unwrap(), 3);
        assert_eq!(io.data.lock().unwrap()[0x0102], 1);
    }

    #[tokio::test]
    async fn empty_flush_does_not_call_io() {
        let io = Arc::new(MemoryIo::new(vec![0; 0x1000]));
        let image = FlashImage::new(0x1000, Some(io.clone()));

        image.flush().await.unwrap();
        image.flush().await.unwrap();
        assert!(io.writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn superset_reads_are_recorded_at_their_address() {
        let io = Arc::new(MemoryIo {
            align: Some(0x1000),
            ..MemoryIo::new(pattern(0x3000))
        });
        let image = FlashImage::new(0x3000, Some(io.clone()));

        assert_eq!(
            image.read(0x1234, 2).await.unwrap(),
            pattern(0x1236)[0x1234..].to_vec()
        );
        assert_eq!(io.reads.load(Ordering::SeqCst), 1);

        image.read(0x1000, 0x1000).await.unwrap();
        assert_eq!(io.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_progress_is_a_coverage_error() {
        let image = FlashImage::new(0x100, Some(Arc::new(StuckIo)));

        let err = image.ensure_cached(0, 0x10).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Coverage(CoverageError::NoProgress { address: 0, .. })
        ));
    }

    #[tokio::test]
    async fn fills_give_up_after_retry_limit() {
        let image = FlashImage::new(0x100, Some(Arc::new(TrickleIo))).with_fill_retry_limit(4);

        let err = image.ensure_cached(0, 0x10).await.unwrap_err();
        assert!(matches!(err, Error::Coverage(CoverageError::RetryLimit(4))));
        // Whatever arrived before giving up is kept
        assert_eq!(image.read_range(0, 4).unwrap(), vec![0x5A; 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_fills_fetch_once() {
        let io = Arc::new(MemoryIo {
            latency: Some(std::time::Duration::from_millis(10)),
            ..MemoryIo::new(pattern(0x2000))
        });
        let image = FlashImage::new(0x2000, Some(io.clone()));

        let (whole, part) = tokio::join!(image.read(0, 0x1000), image.read(0x400, 0x400));
        assert_eq!(whole.unwrap(), pattern(0x1000));
        assert_eq!(part.unwrap(), pattern(0x800)[0x400..].to_vec());
        assert_eq!(io.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_flush_keeps_remaining_writes_pending() {
        let io = Arc::new(MemoryIo {
            fail_write_at: Some(0x2000),
            ..MemoryIo::new(vec![0; 0x4000])
        });
        let image = FlashImage::new(0x4000, Some(io.clone()));

        image.write(0x0100, &[1; 4]).unwrap();
        image.write(0x2000, &[2; 4]).unwrap();
        image.write(0x3000, &[3; 4]).unwrap();
        assert!(matches!(image.flush().await, Err(Error::Io(_))));

        assert_eq!(*io.writes.lock().unwrap(), vec![(0x0100, 4)]);
        let pending: Vec<_> = image
            .pending_writes()
            .iter()
            .map(|s| (s.address(), s.len()))
            .collect();
        assert_eq!(pending, vec![(0x2000, 4), (0x3000, 4)]);
        assert!(image.cached_segments().covers(0x0100..0x0104));
        assert_eq!(image.byte_at(0x0101).unwrap(), 1);
        assert_eq!(image.byte_at(0x3000).unwrap(), 3);
    }

    #[tokio::test]
    async fn out_of_range_access_fails() {
        let image = FlashImage::from_bytes(vec![0; 0x10]);

        assert!(matches!(
            image.byte_at(0x10),
            Err(Error::Coverage(CoverageError::OutOfRange { .. }))
        ));
        assert!(image.write(0x0c, &[0; 8]).is_err());
    }

    #[tokio::test]
    async fn without_io_gaps_read_as_erased() {
        let image = FlashImage::new(0x100, None);
        assert_eq!(image.read(0x10, 4).await.unwrap(), vec![ERASED; 4]);
    }

    #[tokio::test]
    async fn segment_sets_stay_canonical_under_mixed_writes() {
        let io = Arc::new(MemoryIo::new(pattern(0x8000)));
        let image = FlashImage::new(0x8000, Some(io.clone()));
        image.ensure_cached(0x1000, 0x2000).await.unwrap();

        let mut expected = pattern(0x8000);
        let mut seed = 0x1234_5678u32;
        for _ in 0..200 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
            let addr = (seed >> 8) % 0x7f00;
            let len = 1 + (seed % 0x90) as usize;
            let value = (seed >> 24) as u8;
            let bytes = vec![value; len];

            image.write(addr, &bytes).unwrap();
            expected[addr as usize..][..len].copy_from_slice(&bytes);

            assert!(image.pending_writes().is_canonical());
            assert!(image.cached_segments().is_canonical());

            if seed % 7 == 0 {
                image.flush().await.unwrap();
                assert!(image.cached_segments().is_canonical());
            }
        }

        assert_eq!(image.to_vec().await.unwrap(), expected);
        image.flush().await.unwrap();
        assert_eq!(*io.data.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn align_pending_writes_expands_to_blocks() {
        let io = Arc::new(MemoryIo::new(pattern(0x3000)));
        let image = FlashImage::new(0x3000, Some(io.clone()));

        image.write(0x1ffe, &[9; 4]).unwrap();
        image.ensure_pending_blocks_cached(0x1000).await.unwrap();
        image.align_pending_writes(0x1000);

        let pending = image.pending_writes();
        let segment = pending.iter().next().unwrap();
        assert_eq!((segment.address(), segment.len()), (0x1000, 0x2000));
        assert_eq!(segment.data()[0xffe..0x1002].to_vec(), vec![9, 9, 9, 9]);
        assert_eq!(segment.data()[0], pattern(0x1001)[0x1000]);
    }
}
