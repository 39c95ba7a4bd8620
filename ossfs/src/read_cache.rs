//! Read-side caching for file handles.
//!
//! Cached bytes are kept as sorted, non-overlapping extents. The cache does
//! no I/O: a read first asks [`ReadCache::plan`] which spans to fetch, hands
//! the fetched bytes back through [`ReadCache::fill`], and then takes its
//! answer from [`ReadCache::take`], which also applies the retention rule
//! of the policy.

use std::ops::Range;

use bytes::{Bytes, BytesMut};

use crate::config::CacheType;

#[derive(Debug, Clone)]
struct Extent {
    start: u64,
    data: Bytes,
}

impl Extent {
    fn end(&self) -> u64 {
        self.start + self.data.len() as u64
    }
}

#[derive(Debug)]
pub struct ReadCache {
    policy: CacheType,
    block_size: u64,
    size: u64,
    extents: Vec<Extent>,
}

impl ReadCache {
    pub fn new(policy: CacheType, block_size: usize, size: u64) -> Self {
        Self {
            policy,
            block_size: block_size.max(1) as u64,
            size,
            extents: Vec::new(),
        }
    }

    pub fn policy(&self) -> CacheType {
        self.policy
    }

    pub fn cached_bytes(&self) -> u64 {
        self.extents.iter().map(|e| e.data.len() as u64).sum()
    }

    /// Sub-ranges of `want` not held by any extent.
    fn missing(&self, want: &Range<u64>) -> Vec<Range<u64>> {
        let mut missing = Vec::new();
        let mut cursor = want.start;
        for extent in &self.extents {
            if extent.start >= want.end {
                break;
            }
            if extent.end() <= cursor {
                continue;
            }
            if extent.start > cursor {
                missing.push(cursor..extent.start.min(want.end));
            }
            cursor = cursor.max(extent.end());
        }
        if cursor < want.end {
            missing.push(cursor..want.end);
        }
        missing
    }

    /// Spans to fetch so that `want` can be served. `want` must already be
    /// clamped to the object size.
    pub fn plan(&self, want: &Range<u64>) -> Vec<Range<u64>> {
        if want.start >= want.end {
            return Vec::new();
        }
        let missing = self.missing(want);
        if missing.is_empty() {
            return missing;
        }
        match self.policy {
            CacheType::None => missing,
            CacheType::All => {
                if self.extents.is_empty() {
                    vec![0..self.size]
                } else {
                    missing
                }
            }
            CacheType::Readahead => vec![want.start..self.lookahead_end(want.end)],
            CacheType::Bytes => {
                let mut spans = missing;
                if let Some(last) = spans.last_mut() {
                    if last.end == want.end {
                        last.end = self.lookahead_end(want.end);
                    }
                }
                spans
            }
        }
    }

    /// Block-aligned end of a lookahead window past `end`.
    fn lookahead_end(&self, end: u64) -> u64 {
        let target = end.saturating_add(self.block_size);
        let aligned = target.div_ceil(self.block_size).saturating_mul(self.block_size);
        aligned.min(self.size)
    }

    /// Store fetched bytes starting at `start`, merging with neighbours.
    pub fn fill(&mut self, start: u64, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let new_end = start + data.len() as u64;
        let mut merged_start = start;
        let mut merged_end = new_end;
        let mut overlapping = Vec::new();
        let mut kept = Vec::with_capacity(self.extents.len() + 1);
        for extent in self.extents.drain(..) {
            if extent.end() < start || extent.start > new_end {
                kept.push(extent);
            } else {
                merged_start = merged_start.min(extent.start);
                merged_end = merged_end.max(extent.end());
                overlapping.push(extent);
            }
        }
        let merged = if overlapping.is_empty() {
            Extent { start, data }
        } else {
            let mut buf = BytesMut::zeroed((merged_end - merged_start) as usize);
            for extent in overlapping.iter().chain(std::iter::once(&Extent { start, data })) {
                let offset = (extent.start - merged_start) as usize;
                buf[offset..offset + extent.data.len()].copy_from_slice(&extent.data);
            }
            Extent {
                start: merged_start,
                data: buf.freeze(),
            }
        };
        let pos = kept.partition_point(|e| e.start < merged.start);
        kept.insert(pos, merged);
        self.extents = kept;
    }

    /// Serve `want` from the extents and apply retention. `None` when the
    /// range is not fully held, which only happens if the fetch came up short.
    pub fn take(&mut self, want: &Range<u64>) -> Option<Bytes> {
        if want.start >= want.end {
            return Some(Bytes::new());
        }
        let idx = self
            .extents
            .iter()
            .position(|e| e.start <= want.start && e.end() >= want.end)?;
        let extent = &self.extents[idx];
        let offset = (want.start - extent.start) as usize;
        let out = extent.data.slice(offset..offset + (want.end - want.start) as usize);
        match self.policy {
            CacheType::None => self.extents.clear(),
            CacheType::Bytes | CacheType::Readahead => {
                let keep = self.extents.swap_remove(idx);
                self.extents.clear();
                self.extents.push(keep);
            }
            CacheType::All => {}
        }
        Some(out)
    }

    /// Whatever contiguous bytes from `start` are held, up to `end`.
    pub fn take_partial(&mut self, want: &Range<u64>) -> Bytes {
        let Some(extent) = self
            .extents
            .iter()
            .find(|e| e.start <= want.start && e.end() > want.start)
        else {
            return Bytes::new();
        };
        let end = want.end.min(extent.end());
        let offset = (want.start - extent.start) as usize;
        let out = extent.data.slice(offset..offset + (end - want.start) as usize);
        if self.policy == CacheType::None {
            self.extents.clear();
        }
        out
    }
}
