//! Tagged container over the byte-sequence representations a socket can send.
//!
//! The representation determines how bytes move: `Bytes`-backed variants
//! append to a destination blob by sharing segment references, while a
//! [`FileRegion`] is read from disk chunked by the destination's preferred
//! segment size. `copy` always materializes fresh bytes.

use bytes::{Bytes, BytesMut};
use std::fs::File;
use std::sync::Arc;

use crate::blob::Blob;
use crate::error::{Error, Result};

/// A region of an open file: descriptor, starting offset, remaining length.
///
/// Reads are positional and never move the shared descriptor's cursor, so
/// one file may back several in-flight regions.
#[derive(Debug, Clone)]
pub struct FileRegion {
    file: Arc<File>,
    offset: u64,
    length: u64,
}

impl FileRegion {
    #[must_use]
    pub fn new(file: Arc<File>, offset: u64, length: u64) -> Self {
        Self { file, offset, length }
    }

    #[inline]
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    #[must_use]
    pub const fn length(&self) -> u64 {
        self.length
    }

    /// Drop `n` leading bytes from the region.
    pub fn advance(&mut self, n: u64) {
        let n = n.min(self.length);
        self.offset += n;
        self.length -= n;
    }

    /// Read up to `max` bytes from the front of the region without
    /// consuming it.
    pub fn read_front(&self, max: usize) -> Result<Bytes> {
        let want = (self.length.min(max as u64)) as usize;
        let mut buf = BytesMut::zeroed(want);
        let mut filled = 0;
        while filled < want {
            let n = self.read_at(&mut buf[filled..], self.offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf.freeze())
    }

    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        use std::os::unix::fs::FileExt;
        self.file.read_at(buf, offset).map_err(Error::from)
    }

    #[cfg(not(unix))]
    fn read_at(&self, _buf: &mut [u8], _offset: u64) -> Result<usize> {
        Err(Error::NotSupported)
    }
}

/// Tagged union of the byte-sequence representations.
#[derive(Debug, Clone, Default)]
pub enum Data {
    /// No data.
    #[default]
    None,
    /// A single contiguous buffer; `Bytes::from_static` covers borrowed
    /// bytes, everything else is owned.
    Buffer(Bytes),
    /// An ordered gather-list of buffers.
    BufferArray(Vec<Bytes>),
    /// A gather-list shared between producers.
    SharedBufferArray(Arc<[Bytes]>),
    /// A segmented blob.
    Blob(Blob),
    /// A segmented blob shared between producers.
    SharedBlob(Arc<Blob>),
    /// Text payload.
    Text(String),
    /// A file region streamed from disk at send time.
    File(FileRegion),
}

impl Data {
    /// Total number of bytes represented.
    #[must_use]
    pub fn size(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Buffer(b) => b.len(),
            Self::BufferArray(bufs) => bufs.iter().map(Bytes::len).sum(),
            Self::SharedBufferArray(bufs) => bufs.iter().map(Bytes::len).sum(),
            Self::Blob(blob) => blob.len(),
            Self::SharedBlob(blob) => blob.len(),
            Self::Text(s) => s.len(),
            Self::File(region) => region.length() as usize,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Returns true when the representation can join a gather-list without
    /// touching the file system.
    #[must_use]
    pub const fn is_batchable(&self) -> bool {
        !matches!(self, Self::File(_))
    }

    /// Access the single-buffer representation.
    pub fn as_buffer(&self) -> Result<&Bytes> {
        match self {
            Self::Buffer(b) => Ok(b),
            _ => Err(Error::Invalid),
        }
    }

    /// Access the blob representation.
    pub fn as_blob(&self) -> Result<&Blob> {
        match self {
            Self::Blob(b) => Ok(b),
            _ => Err(Error::Invalid),
        }
    }

    /// Access the text representation.
    pub fn as_text(&self) -> Result<&str> {
        match self {
            Self::Text(s) => Ok(s),
            _ => Err(Error::Invalid),
        }
    }

    /// Access the file-region representation.
    pub fn as_file(&self) -> Result<&FileRegion> {
        match self {
            Self::File(f) => Ok(f),
            _ => Err(Error::Invalid),
        }
    }

    /// Append this data to `dst`, sharing buffer references where the
    /// representation allows it. A file region is read in chunks of the
    /// destination's preferred segment size. Returns the number of bytes
    /// appended.
    pub fn append(&self, dst: &mut Blob) -> Result<usize> {
        let before = dst.len();
        match self {
            Self::None => {}
            Self::Buffer(b) => dst.push(b.clone()),
            Self::BufferArray(bufs) => {
                for b in bufs {
                    dst.push(b.clone());
                }
            }
            Self::SharedBufferArray(bufs) => {
                for b in bufs.iter() {
                    dst.push(b.clone());
                }
            }
            Self::Blob(blob) => dst.extend_from_blob(blob),
            Self::SharedBlob(blob) => dst.extend_from_blob(blob),
            Self::Text(s) => dst.extend_from_slice(s.as_bytes()),
            Self::File(region) => {
                let mut cursor = region.clone();
                while cursor.length() > 0 {
                    let chunk = cursor.read_front(dst.segment_size())?;
                    if chunk.is_empty() {
                        // short file; region extends past end of file
                        return Err(Error::EndOfStream);
                    }
                    cursor.advance(chunk.len() as u64);
                    dst.push(chunk);
                }
            }
        }
        Ok(dst.len() - before)
    }

    /// Append a deep copy of this data to `dst`: the destination never
    /// shares memory with the source. Returns the number of bytes appended.
    pub fn copy(&self, dst: &mut Blob) -> Result<usize> {
        let before = dst.len();
        match self {
            Self::None => {}
            Self::Buffer(b) => dst.extend_from_slice(b),
            Self::BufferArray(bufs) => {
                for b in bufs {
                    dst.extend_from_slice(b);
                }
            }
            Self::SharedBufferArray(bufs) => {
                for b in bufs.iter() {
                    dst.extend_from_slice(b);
                }
            }
            Self::Blob(blob) => {
                for seg in blob.segments() {
                    dst.extend_from_slice(seg);
                }
            }
            Self::SharedBlob(blob) => {
                for seg in blob.segments() {
                    dst.extend_from_slice(seg);
                }
            }
            Self::Text(s) => dst.extend_from_slice(s.as_bytes()),
            Self::File(_) => {
                // reading from disk always materializes
                return self.append(dst);
            }
        }
        Ok(dst.len() - before)
    }

    /// Drop `n` leading bytes in place. Used when a partial write consumed
    /// the front of the payload.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the represented size for in-memory variants.
    pub fn pop_front(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        match self {
            Self::None => panic!("pop_front on empty data"),
            Self::Buffer(b) => {
                *b = b.slice(n..);
            }
            Self::BufferArray(bufs) => {
                let mut remaining = n;
                while remaining > 0 {
                    let front = bufs.first_mut().expect("pop_front exceeds data size");
                    if front.len() <= remaining {
                        remaining -= front.len();
                        bufs.remove(0);
                    } else {
                        *front = front.slice(remaining..);
                        remaining = 0;
                    }
                }
            }
            Self::SharedBufferArray(bufs) => {
                // shared representations are copied-on-pop
                let mut data = Self::BufferArray(bufs.iter().cloned().collect());
                data.pop_front(n);
                *self = data;
            }
            Self::Blob(blob) => blob.advance(n),
            Self::SharedBlob(blob) => {
                let mut owned = (**blob).clone();
                owned.advance(n);
                *self = Self::Blob(owned);
            }
            Self::Text(s) => {
                let mut bytes = Bytes::copy_from_slice(s.as_bytes());
                bytes = bytes.slice(n..);
                *self = Self::Buffer(bytes);
            }
            Self::File(region) => region.advance(n as u64),
        }
    }

    /// Collect the in-memory segments into `out`. Fails for file regions.
    pub fn gather_segments(&self, out: &mut Vec<Bytes>) -> Result<()> {
        match self {
            Self::None => {}
            Self::Buffer(b) => out.push(b.clone()),
            Self::BufferArray(bufs) => out.extend(bufs.iter().cloned()),
            Self::SharedBufferArray(bufs) => out.extend(bufs.iter().cloned()),
            Self::Blob(blob) => out.extend(blob.segments().cloned()),
            Self::SharedBlob(blob) => out.extend(blob.segments().cloned()),
            Self::Text(s) => out.push(Bytes::copy_from_slice(s.as_bytes())),
            Self::File(_) => return Err(Error::Invalid),
        }
        Ok(())
    }

    /// Compare logical byte content, regardless of representation.
    pub fn content_eq(&self, other: &Self) -> Result<bool> {
        if self.size() != other.size() {
            return Ok(false);
        }
        let mut lhs = Blob::new();
        self.copy(&mut lhs)?;
        let mut rhs = Blob::new();
        other.copy(&mut rhs)?;
        Ok(lhs.to_bytes() == rhs.to_bytes())
    }
}

impl From<Bytes> for Data {
    fn from(b: Bytes) -> Self {
        Self::Buffer(b)
    }
}

impl From<&'static [u8]> for Data {
    fn from(b: &'static [u8]) -> Self {
        Self::Buffer(Bytes::from_static(b))
    }
}

impl From<&'static str> for Data {
    fn from(s: &'static str) -> Self {
        Self::Buffer(Bytes::from_static(s.as_bytes()))
    }
}

impl From<String> for Data {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Blob> for Data {
    fn from(b: Blob) -> Self {
        Self::Blob(b)
    }
}
