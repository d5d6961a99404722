//! Raw object streams
//!
//! A raw stream is read xor write. Reads are translated one-to-one into
//! range requests against the backend; a short read signals end of stream
//! and is never an error. Writes accumulate in a growable in-memory buffer
//! addressed by absolute position and reach the store only on an explicit
//! flush. Append mode downloads the existing object up front so writes
//! continue the current content.

use std::io::SeekFrom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing::debug;

use crate::error::{Error, Result};

/// Provider-side primitive a raw stream drives.
///
/// `read_range` may return fewer bytes than requested (short read); reading
/// entirely past the end returns an empty buffer. `upload` replaces the whole
/// remote object with the given bytes.
pub trait ObjectBackend: Send + Sync {
    /// Object size in bytes. Fails `NotFound` when the object does not exist.
    fn size(&self) -> Result<u64>;

    /// Read the byte range `[start, end)`, or from `start` to the end of the
    /// object when `end` is `None`.
    fn read_range(&self, start: u64, end: Option<u64>) -> Result<Vec<u8>>;

    /// Replace the remote object content.
    fn upload(&self, data: &[u8]) -> Result<()>;

    /// Whether the backend honors byte ranges, and therefore whether streams
    /// over it can seek.
    fn seekable(&self) -> bool {
        true
    }

    /// Whether the object exists. `Permission` errors propagate: without read
    /// access, existence cannot be determined.
    fn exists(&self) -> Result<bool> {
        match self.size() {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Format the HTTP `Range` header value for `[start, end)`.
/// `None` end leaves the range open.
pub fn http_range(start: u64, end: Option<u64>) -> String {
    match end {
        Some(end) => format!("bytes={}-{}", start, end - 1),
        None => format!("bytes={}-", start),
    }
}

/// Stream open mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Random-access reads
    Read,
    /// Buffered writes, object replaced on flush
    Write,
    /// Writes continuing the existing content
    Append,
    /// Like `Write`, but fails if the object already exists
    Exclusive,
}

impl OpenMode {
    pub fn writable(self) -> bool {
        !matches!(self, OpenMode::Read)
    }
}

/// Raw byte stream over an [`ObjectBackend`].
///
/// `tell` is byte-accurate at this layer. All position bookkeeping happens
/// under one mutex per stream, so concurrent use of a single stream stays
/// consistent even when transfers overlap.
pub struct RawStream<B: ObjectBackend> {
    backend: B,
    mode: OpenMode,
    seekable: bool,
    pos: Mutex<u64>,
    write_buffer: Mutex<Vec<u8>>,
    size: Mutex<Option<u64>>,
    closed: AtomicBool,
}

impl<B: ObjectBackend> RawStream<B> {
    /// Open a stream over the backend.
    ///
    /// Read mode verifies the object exists. Append mode eagerly downloads
    /// the whole existing object into the write buffer and positions at its
    /// end. Exclusive mode fails `AlreadyExists` when the object is present.
    pub fn open(backend: B, mode: OpenMode, name: &str) -> Result<Self> {
        let seekable = backend.seekable();
        let mut pos = 0u64;
        let mut write_buffer = Vec::new();
        let mut size = None;

        match mode {
            OpenMode::Read => {
                size = Some(backend.size()?);
            }
            OpenMode::Write => {}
            OpenMode::Exclusive => {
                if backend.exists()? {
                    return Err(Error::AlreadyExists(name.to_string()));
                }
            }
            OpenMode::Append => {
                if backend.exists()? {
                    write_buffer = backend.read_range(0, None)?;
                    pos = write_buffer.len() as u64;
                    debug!(name = name, size = pos, "append mode: existing content loaded");
                }
            }
        }

        Ok(Self {
            backend,
            mode,
            seekable,
            pos: Mutex::new(pos),
            write_buffer: Mutex::new(write_buffer),
            size: Mutex::new(size),
            closed: AtomicBool::new(false),
        })
    }

    /// Stream open mode
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Whether the stream supports seeking
    pub fn seekable(&self) -> bool {
        self.seekable
    }

    /// Current byte position
    pub fn tell(&self) -> u64 {
        *self.pos.lock().unwrap()
    }

    /// Object size in bytes, memoized after the first backend call.
    pub fn size(&self) -> Result<u64> {
        let mut size = self.size.lock().unwrap();
        if let Some(size) = *size {
            return Ok(size);
        }
        let fetched = self.backend.size()?;
        *size = Some(fetched);
        Ok(fetched)
    }

    /// Change the stream position.
    ///
    /// In write mode, seeking past the end of the write buffer zero-fills the
    /// gap so later flushes upload contiguous content.
    pub fn seek(&self, target: SeekFrom) -> Result<u64> {
        if !self.seekable {
            return Err(Error::Unsupported("seek"));
        }

        let new_pos = {
            let mut pos = self.pos.lock().unwrap();
            let base = match target {
                SeekFrom::Start(offset) => offset as i64,
                SeekFrom::Current(delta) => *pos as i64 + delta,
                SeekFrom::End(delta) => self.size()? as i64 + delta,
            };
            if base < 0 {
                return Err(Error::Unsupported("seek before start of stream"));
            }
            *pos = base as u64;
            *pos
        };

        if self.mode.writable() {
            let mut buffer = self.write_buffer.lock().unwrap();
            if new_pos as usize > buffer.len() {
                buffer.resize(new_pos as usize, 0);
            }
        }

        Ok(new_pos)
    }

    /// Read and return all bytes from the current position to end of stream,
    /// advancing the position by the number of bytes returned.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        if self.mode.writable() {
            return Err(Error::Unsupported("read"));
        }

        let mut pos = self.pos.lock().unwrap();
        let data = if *pos > 0 && self.seekable {
            self.backend.read_range(*pos, None)?
        } else {
            self.backend.read_range(0, None)?
        };
        *pos += data.len() as u64;
        Ok(data)
    }

    /// Read bytes into `buf` and return the number of bytes read.
    ///
    /// A short read (fewer bytes than `buf.len()`) signals end of stream; the
    /// position advances only by the bytes actually received.
    pub fn read_into(&self, buf: &mut [u8]) -> Result<usize> {
        if self.mode.writable() {
            return Err(Error::Unsupported("read"));
        }

        let wanted = buf.len() as u64;
        let start = {
            let mut pos = self.pos.lock().unwrap();
            let start = *pos;
            *pos = start + wanted;
            start
        };

        let data = match self.backend.read_range(start, Some(start + wanted)) {
            Ok(data) => data,
            Err(e) => {
                // Roll the optimistic advance back so the caller can retry
                *self.pos.lock().unwrap() = start;
                return Err(e);
            }
        };

        let read = data.len().min(buf.len());
        buf[..read].copy_from_slice(&data[..read]);

        if read as u64 != wanted {
            *self.pos.lock().unwrap() = start + read as u64;
        }
        Ok(read)
    }

    /// Read up to `size` bytes from the current position without advancing it.
    pub fn peek(&self, size: usize) -> Result<Vec<u8>> {
        if self.mode.writable() {
            return Err(Error::Unsupported("read"));
        }
        let start = self.tell();
        let mut data = self.backend.read_range(start, Some(start + size as u64))?;
        data.truncate(size);
        Ok(data)
    }

    /// Write bytes at the current position into the in-memory write buffer
    /// and return the number of bytes written. Nothing reaches the remote
    /// store until [`flush`](Self::flush).
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        if !self.mode.writable() {
            return Err(Error::Unsupported("write"));
        }

        let (start, end) = {
            let mut pos = self.pos.lock().unwrap();
            let start = *pos as usize;
            let end = start + data.len();
            *pos = end as u64;
            (start, end)
        };

        let mut buffer = self.write_buffer.lock().unwrap();
        if end > buffer.len() {
            buffer.resize(end, 0);
        }
        buffer[start..end].copy_from_slice(data);
        Ok(data.len())
    }

    /// Upload the whole write buffer to the store.
    pub fn flush(&self) -> Result<()> {
        if !self.mode.writable() {
            return Err(Error::Unsupported("flush"));
        }
        let buffer = self.write_buffer.lock().unwrap();
        debug!(bytes = buffer.len(), "flushing raw stream");
        self.backend.upload(&buffer)
    }

    /// Flush pending written content (if any) and mark the stream closed.
    /// Later closes are no-ops.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.mode.writable() && !self.write_buffer.lock().unwrap().is_empty() {
            self.flush()?;
        }
        Ok(())
    }

    /// Borrow the backend (used by buffered wrappers).
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Consume the stream, returning the backend.
    pub fn into_backend(self) -> B {
        self.backend
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// In-memory backend recording uploads.
    pub(crate) struct MemBackend {
        pub data: Mutex<Option<Vec<u8>>>,
        pub uploads: Mutex<Vec<Vec<u8>>>,
        pub seekable: bool,
    }

    impl MemBackend {
        pub fn new(content: Option<&[u8]>) -> Self {
            Self {
                data: Mutex::new(content.map(|c| c.to_vec())),
                uploads: Mutex::new(Vec::new()),
                seekable: true,
            }
        }
    }

    impl ObjectBackend for MemBackend {
        fn size(&self) -> Result<u64> {
            match &*self.data.lock().unwrap() {
                Some(data) => Ok(data.len() as u64),
                None => Err(Error::NotFound("mem".to_string())),
            }
        }

        fn read_range(&self, start: u64, end: Option<u64>) -> Result<Vec<u8>> {
            let guard = self.data.lock().unwrap();
            let data = guard
                .as_ref()
                .ok_or_else(|| Error::NotFound("mem".to_string()))?;
            let start = (start as usize).min(data.len());
            let end = end
                .map(|e| (e as usize).min(data.len()))
                .unwrap_or(data.len());
            Ok(data[start..end.max(start)].to_vec())
        }

        fn upload(&self, bytes: &[u8]) -> Result<()> {
            self.uploads.lock().unwrap().push(bytes.to_vec());
            *self.data.lock().unwrap() = Some(bytes.to_vec());
            Ok(())
        }

        fn seekable(&self) -> bool {
            self.seekable
        }
    }

    #[test]
    fn test_read_into_and_position() {
        let stream =
            RawStream::open(MemBackend::new(Some(b"hello world")), OpenMode::Read, "mem").unwrap();

        let mut buf = [0u8; 5];
        assert_eq!(stream.read_into(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(stream.tell(), 5);
    }

    #[test]
    fn test_short_read_past_end_is_not_an_error() {
        let stream =
            RawStream::open(MemBackend::new(Some(b"abcdef")), OpenMode::Read, "mem").unwrap();
        stream.seek(SeekFrom::Start(4)).unwrap();

        let mut buf = [0u8; 10];
        let read = stream.read_into(&mut buf).unwrap();
        assert_eq!(read, 2);
        assert_eq!(&buf[..2], b"ef");
        // Position advanced only by the bytes actually received
        assert_eq!(stream.tell(), 6);

        // Fully past the end: empty read, position unchanged
        assert_eq!(stream.read_into(&mut buf).unwrap(), 0);
        assert_eq!(stream.tell(), 6);
    }

    #[test]
    fn test_read_all_from_position() {
        let stream =
            RawStream::open(MemBackend::new(Some(b"0123456789")), OpenMode::Read, "mem").unwrap();
        stream.seek(SeekFrom::Start(6)).unwrap();
        assert_eq!(stream.read_all().unwrap(), b"6789");
        assert_eq!(stream.tell(), 10);
    }

    #[test]
    fn test_seek_whence_variants() {
        let stream =
            RawStream::open(MemBackend::new(Some(b"0123456789")), OpenMode::Read, "mem").unwrap();
        assert_eq!(stream.seek(SeekFrom::Start(4)).unwrap(), 4);
        assert_eq!(stream.seek(SeekFrom::Current(2)).unwrap(), 6);
        assert_eq!(stream.seek(SeekFrom::End(-3)).unwrap(), 7);
    }

    #[test]
    fn test_overlapping_out_of_order_writes() {
        let backend = MemBackend::new(None);
        let stream = RawStream::open(backend, OpenMode::Write, "mem").unwrap();

        stream.write(b"aaaaaaaa").unwrap();
        stream.seek(SeekFrom::Start(2)).unwrap();
        stream.write(b"bbb").unwrap();
        stream.seek(SeekFrom::Start(10)).unwrap();
        stream.write(b"cc").unwrap();
        stream.flush().unwrap();

        let data = stream.backend().data.lock().unwrap().clone().unwrap();
        // Last writer wins at each offset; the seek gap is zero-filled
        assert_eq!(data, b"aabbbaaa\0\0cc");
    }

    #[test]
    fn test_nothing_uploaded_before_flush() {
        let stream = RawStream::open(MemBackend::new(None), OpenMode::Write, "mem").unwrap();
        stream.write(b"data").unwrap();
        assert!(stream.backend().uploads.lock().unwrap().is_empty());
        stream.flush().unwrap();
        assert_eq!(stream.backend().uploads.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_append_loads_existing_content() {
        let stream =
            RawStream::open(MemBackend::new(Some(b"begin-")), OpenMode::Append, "mem").unwrap();
        assert_eq!(stream.tell(), 6);
        stream.write(b"end").unwrap();
        stream.flush().unwrap();

        let data = stream.backend().data.lock().unwrap().clone().unwrap();
        assert_eq!(data, b"begin-end");
    }

    #[test]
    fn test_append_on_missing_object_starts_empty() {
        let stream = RawStream::open(MemBackend::new(None), OpenMode::Append, "mem").unwrap();
        assert_eq!(stream.tell(), 0);
    }

    #[test]
    fn test_exclusive_fails_when_object_exists() {
        let result = RawStream::open(MemBackend::new(Some(b"x")), OpenMode::Exclusive, "mem");
        assert!(matches!(result, Err(Error::AlreadyExists(_))));

        let stream = RawStream::open(MemBackend::new(None), OpenMode::Exclusive, "mem").unwrap();
        stream.write(b"fresh").unwrap();
    }

    #[test]
    fn test_unsupported_operations() {
        let read =
            RawStream::open(MemBackend::new(Some(b"x")), OpenMode::Read, "mem").unwrap();
        assert!(matches!(read.write(b"y"), Err(Error::Unsupported("write"))));

        let write = RawStream::open(MemBackend::new(None), OpenMode::Write, "mem").unwrap();
        let mut buf = [0u8; 1];
        assert!(matches!(
            write.read_into(&mut buf),
            Err(Error::Unsupported("read"))
        ));

        let mut backend = MemBackend::new(Some(b"x"));
        backend.seekable = false;
        let unseekable = RawStream::open(backend, OpenMode::Read, "mem").unwrap();
        assert!(matches!(
            unseekable.seek(SeekFrom::Start(1)),
            Err(Error::Unsupported("seek"))
        ));
        // Forward reads still work without seeking
        assert_eq!(unseekable.read_into(&mut buf).unwrap(), 1);
    }

    #[test]
    fn test_peek_does_not_advance() {
        let stream =
            RawStream::open(MemBackend::new(Some(b"peekable")), OpenMode::Read, "mem").unwrap();
        assert_eq!(stream.peek(4).unwrap(), b"peek");
        assert_eq!(stream.tell(), 0);
    }

    #[test]
    fn test_read_missing_object_fails_on_open() {
        let result = RawStream::open(MemBackend::new(None), OpenMode::Read, "mem");
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_close_flushes_pending_writes_once() {
        let stream = RawStream::open(MemBackend::new(None), OpenMode::Write, "mem").unwrap();
        stream.write(b"data").unwrap();
        stream.close().unwrap();
        stream.close().unwrap();
        assert_eq!(stream.backend().uploads.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_http_range_format() {
        assert_eq!(http_range(0, Some(500)), "bytes=0-499");
        assert_eq!(http_range(256, None), "bytes=256-");
    }
}
