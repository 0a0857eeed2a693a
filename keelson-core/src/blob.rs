//! Segmented byte containers optimized for zero-copy operations.
//!
//! A [`Blob`] holds multiple `Bytes` segments and provides efficient
//! extraction without unnecessary copies. When data is requested and fits
//! within a single segment, it can be returned with zero copies (just a
//! refcount increment on the underlying `Bytes`).
//!
//! A [`ConstBufferArray`] is a flat gather-list of segment references handed
//! to vectored socket writes.

use bytes::{Buf, Bytes, BytesMut};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::io::IoSlice;

/// Default segment size used when a blob materializes external bytes.
pub const DEFAULT_SEGMENT_SIZE: usize = 8192;

/// A segmented buffer.
///
/// # Tradeoffs
///
/// - **Fast path**: single-segment extraction is O(1) with no copy
/// - **Slow path**: multi-segment extraction copies into a contiguous buffer
#[derive(Debug, Clone)]
pub struct Blob {
    segs: VecDeque<Bytes>,
    len: usize,
    segment_size: usize,
}

impl Default for Blob {
    fn default() -> Self {
        Self::new()
    }
}

impl Blob {
    #[must_use]
    pub fn new() -> Self {
        Self {
            segs: VecDeque::new(),
            len: 0,
            segment_size: DEFAULT_SEGMENT_SIZE,
        }
    }

    /// Create a blob whose materializing operations chunk by `segment_size`.
    #[must_use]
    pub fn with_segment_size(segment_size: usize) -> Self {
        Self {
            segs: VecDeque::new(),
            len: 0,
            segment_size: segment_size.max(1),
        }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Preferred segment size for chunked fills.
    #[inline]
    #[must_use]
    pub const fn segment_size(&self) -> usize {
        self.segment_size
    }

    #[inline]
    pub fn push(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        self.len += bytes.len();
        self.segs.push_back(bytes);
    }

    /// Append a copy of `data`, chunked by the preferred segment size.
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        for chunk in data.chunks(self.segment_size) {
            self.push(Bytes::copy_from_slice(chunk));
        }
    }

    /// Append every segment of `other` by reference.
    pub fn extend_from_blob(&mut self, other: &Blob) {
        for seg in &other.segs {
            self.push(seg.clone());
        }
    }

    /// Iterate the segments in order.
    pub fn segments(&self) -> impl Iterator<Item = &Bytes> {
        self.segs.iter()
    }

    /// Copy the first `n` bytes into `dst`.
    ///
    /// Returns `false` if fewer than `n` bytes are available.
    pub fn copy_prefix(&self, n: usize, dst: &mut [u8]) -> bool {
        if n > self.len || dst.len() < n {
            return false;
        }

        let mut remaining = n;
        let mut out_off = 0;
        for seg in &self.segs {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(seg.len());
            dst[out_off..out_off + take].copy_from_slice(&seg[..take]);
            out_off += take;
            remaining -= take;
        }
        true
    }

    /// Advance the queue by `n` bytes, dropping fully-consumed segments.
    ///
    /// # Panics
    ///
    /// Panics if `n > self.len`.
    pub fn advance(&mut self, mut n: usize) {
        assert!(n <= self.len);
        self.len -= n;

        while n > 0 {
            let Some(mut front) = self.segs.pop_front() else {
                break;
            };
            if n >= front.len() {
                n -= front.len();
                continue;
            }
            // partially consumed
            front.advance(n);
            self.segs.push_front(front);
            break;
        }
    }

    /// Take exactly `n` bytes from the front of the queue.
    ///
    /// If the first segment contains all `n` bytes, this is zero-copy.
    /// If the bytes span multiple segments, this copies into a contiguous
    /// buffer.
    pub fn take_bytes(&mut self, n: usize) -> Option<Bytes> {
        if n == 0 {
            return Some(Bytes::new());
        }
        if n > self.len {
            return None;
        }

        let front = self.segs.front_mut()?;

        if front.len() >= n {
            self.len -= n;
            let out = front.split_to(n);
            if front.is_empty() {
                self.segs.pop_front();
            }
            return Some(out);
        }

        // Spans segments: copy.
        let mut out = BytesMut::with_capacity(n);
        let mut remaining = n;
        while remaining > 0 {
            let seg = self.segs.pop_front().expect("len check ensures segments exist");
            let take = remaining.min(seg.len());
            out.extend_from_slice(&seg[..take]);
            remaining -= take;
            self.len -= take;
            if take < seg.len() {
                let mut rest = seg;
                rest.advance(take);
                self.segs.push_front(rest);
            }
        }

        Some(out.freeze())
    }

    /// Materialize the whole blob as one contiguous buffer.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        if self.segs.len() == 1 {
            return self.segs[0].clone();
        }
        let mut out = BytesMut::with_capacity(self.len);
        for seg in &self.segs {
            out.extend_from_slice(seg);
        }
        out.freeze()
    }
}

impl PartialEq for Blob {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.to_bytes() == other.to_bytes()
    }
}

impl Eq for Blob {}

/// A gather-list of immutable buffer references for vectored sends.
#[derive(Debug, Default, Clone)]
pub struct ConstBufferArray {
    bufs: SmallVec<[Bytes; 8]>,
    total: usize,
}

impl ConstBufferArray {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn num_buffers(&self) -> usize {
        self.bufs.len()
    }

    /// Total number of bytes across all buffers.
    #[inline]
    #[must_use]
    pub const fn total(&self) -> usize {
        self.total
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    #[inline]
    pub fn push(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        self.total += bytes.len();
        self.bufs.push(bytes);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bytes> {
        self.bufs.iter()
    }

    /// Borrow the buffers as `IoSlice`s for a vectored system call.
    #[must_use]
    pub fn io_slices(&self) -> SmallVec<[IoSlice<'_>; 8]> {
        self.bufs.iter().map(|b| IoSlice::new(b)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_len() {
        let mut blob = Blob::new();
        assert!(blob.is_empty());
        blob.push(Bytes::from_static(b"hello"));
        blob.push(Bytes::new());
        blob.push(Bytes::from_static(b", world"));
        assert_eq!(blob.len(), 12);
    }

    #[test]
    fn take_bytes_fast_path() {
        let mut blob = Blob::new();
        blob.push(Bytes::from_static(b"hello world"));
        let taken = blob.take_bytes(5).unwrap();
        assert_eq!(&taken[..], b"hello");
        assert_eq!(blob.len(), 6);
    }

    #[test]
    fn take_bytes_spanning_segments() {
        let mut blob = Blob::new();
        blob.push(Bytes::from_static(b"abc"));
        blob.push(Bytes::from_static(b"def"));
        blob.push(Bytes::from_static(b"ghi"));
        let taken = blob.take_bytes(7).unwrap();
        assert_eq!(&taken[..], b"abcdefg");
        assert_eq!(blob.len(), 2);
        assert_eq!(&blob.take_bytes(2).unwrap()[..], b"hi");
    }

    #[test]
    fn take_bytes_insufficient() {
        let mut blob = Blob::new();
        blob.push(Bytes::from_static(b"abc"));
        assert!(blob.take_bytes(4).is_none());
    }

    #[test]
    fn advance_drops_consumed_segments() {
        let mut blob = Blob::new();
        blob.push(Bytes::from_static(b"abc"));
        blob.push(Bytes::from_static(b"def"));
        blob.advance(4);
        assert_eq!(blob.len(), 2);
        assert_eq!(&blob.to_bytes()[..], b"ef");
    }

    #[test]
    fn copy_prefix_bounds() {
        let mut blob = Blob::new();
        blob.push(Bytes::from_static(b"abc"));
        blob.push(Bytes::from_static(b"def"));

        let mut out = [0u8; 8];
        assert!(blob.copy_prefix(5, &mut out));
        assert_eq!(&out[..5], b"abcde");
        assert!(!blob.copy_prefix(7, &mut out));
    }

    #[test]
    fn extend_from_slice_chunks() {
        let mut blob = Blob::with_segment_size(4);
        blob.extend_from_slice(b"0123456789");
        assert_eq!(blob.len(), 10);
        assert_eq!(blob.segments().count(), 3);
        assert_eq!(&blob.to_bytes()[..], b"0123456789");
    }

    #[test]
    fn const_buffer_array_totals() {
        let mut arr = ConstBufferArray::new();
        arr.push(Bytes::from_static(b"abc"));
        arr.push(Bytes::new());
        arr.push(Bytes::from_static(b"de"));
        assert_eq!(arr.num_buffers(), 2);
        assert_eq!(arr.total(), 5);
        assert_eq!(arr.io_slices().len(), 2);
    }
}
