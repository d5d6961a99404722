//! Buffered object streams
//!
//! Fixed-size chunking over the raw layer. The reader keeps a window of
//! chunks in flight on the worker pool ahead of the consumer so a logical
//! read blocks on at most the one chunk holding the current position. The
//! writer fills a chunk-sized buffer and hands full chunks to the pool for
//! upload, so transfer overlaps with the caller producing the next chunk.
//!
//! Position semantics differ per layer: [`BufferedWriter::chunks_flushed`]
//! counts flushed chunks, not bytes. The byte-accurate position lives on
//! [`RawStream::tell`](crate::io::raw::RawStream::tell).

use std::collections::{HashMap, VecDeque};
use std::io::SeekFrom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::{Error, Result};
use crate::io::pool::{TaskHandle, WorkerPool};
use crate::io::raw::ObjectBackend;

/// Provider-side primitive receiving flushed chunks.
///
/// `upload_chunk` is called from worker threads, possibly out of order;
/// `finalize` runs once from `close` after every chunk upload completed
/// (committing a multipart upload, for providers that need it).
pub trait ChunkSink: Send + Sync + 'static {
    fn upload_chunk(&self, index: u64, data: Vec<u8>) -> Result<()>;

    fn finalize(&self, chunk_count: u64) -> Result<()> {
        let _ = chunk_count;
        Ok(())
    }
}

struct WriterState {
    buffer: Vec<u8>,
    chunks_flushed: u64,
}

/// Write-behind chunked stream over a [`ChunkSink`].
pub struct BufferedWriter<S: ChunkSink> {
    sink: Arc<S>,
    chunk_size: usize,
    pool: WorkerPool,
    state: Mutex<WriterState>,
    pending: Mutex<VecDeque<TaskHandle<Result<()>>>>,
    closed: AtomicBool,
}

impl<S: ChunkSink> BufferedWriter<S> {
    /// Create a writer flushing `chunk_size`-byte chunks through a pool of
    /// `workers` threads.
    pub fn new(sink: Arc<S>, chunk_size: usize, workers: usize) -> Self {
        Self {
            sink,
            chunk_size: chunk_size.max(1),
            pool: WorkerPool::new(workers),
            state: Mutex::new(WriterState {
                buffer: Vec::new(),
                chunks_flushed: 0,
            }),
            pending: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of chunks flushed so far. This counts chunks, not bytes; track
    /// byte positions at the raw layer if you need them.
    pub fn chunks_flushed(&self) -> u64 {
        self.state.lock().unwrap().chunks_flushed
    }

    /// Write bytes, flushing the chunk buffer through the pool whenever a
    /// write would overflow it. Returns the number of bytes written.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Unsupported("write"));
        }

        let mut state = self.state.lock().unwrap();
        let mut rest = data;
        while !rest.is_empty() {
            if state.buffer.len() == self.chunk_size {
                // The next byte would overflow the current buffer
                self.flush_chunk(&mut state)?;
            }
            let take = rest.len().min(self.chunk_size - state.buffer.len());
            state.buffer.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
        }
        Ok(data.len())
    }

    /// Flush the current (possibly partial) buffer as one chunk.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.buffer.is_empty() {
            self.flush_chunk(&mut state)?;
        }
        Ok(())
    }

    /// Flush any partial final buffer, wait for in-flight chunk uploads, then
    /// run the sink's finalize step. Always performs both, whether or not
    /// `flush` was ever called. Later closes are no-ops.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let chunk_count = {
            let mut state = self.state.lock().unwrap();
            if !state.buffer.is_empty() {
                self.flush_chunk(&mut state)?;
            }
            state.chunks_flushed
        };

        let mut first_error = None;
        let mut pending = self.pending.lock().unwrap();
        while let Some(handle) = pending.pop_front() {
            if let Err(e) = handle.wait() {
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        debug!(chunks = chunk_count, "finalizing buffered writer");
        self.sink.finalize(chunk_count)
    }

    fn flush_chunk(&self, state: &mut WriterState) -> Result<()> {
        let index = state.chunks_flushed;
        state.chunks_flushed += 1;
        let chunk = std::mem::replace(&mut state.buffer, Vec::with_capacity(self.chunk_size));
        debug!(index = index, bytes = chunk.len(), "flushing chunk");

        let sink = Arc::clone(&self.sink);
        let handle = self.pool.submit(move || sink.upload_chunk(index, chunk));

        let mut pending = self.pending.lock().unwrap();
        pending.push_back(handle);
        // Bound the number of chunks awaiting upload so a fast writer cannot
        // hold an unbounded backlog in memory
        if pending.len() > self.pool.workers() {
            if let Some(oldest) = pending.pop_front() {
                oldest.wait()?;
            }
        }
        Ok(())
    }
}

enum Slot {
    InFlight(TaskHandle<Result<Vec<u8>>>),
    Ready(Vec<u8>),
}

struct ReaderState {
    pos: u64,
    queue: HashMap<u64, Slot>,
}

/// Read-ahead chunked stream over an [`ObjectBackend`].
pub struct BufferedReader<B: ObjectBackend + 'static> {
    backend: Arc<B>,
    chunk_size: u64,
    size: u64,
    readahead: u64,
    pool: WorkerPool,
    state: Mutex<ReaderState>,
}

impl<B: ObjectBackend + 'static> BufferedReader<B> {
    /// Create a reader over the backend with `chunk_size`-byte chunks and a
    /// pool of `workers` threads. Prefetch depth equals the worker count.
    pub fn new(backend: Arc<B>, chunk_size: usize, workers: usize) -> Result<Self> {
        let size = backend.size()?;
        Ok(Self {
            backend,
            chunk_size: chunk_size.max(1) as u64,
            size,
            readahead: workers.max(1) as u64,
            pool: WorkerPool::new(workers),
            state: Mutex::new(ReaderState {
                pos: 0,
                queue: HashMap::new(),
            }),
        })
    }

    /// Object size in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Current byte position
    pub fn tell(&self) -> u64 {
        self.state.lock().unwrap().pos
    }

    /// Change the stream position and refresh the prefetch window.
    pub fn seek(&self, target: SeekFrom) -> Result<u64> {
        if !self.backend.seekable() {
            return Err(Error::Unsupported("seek"));
        }
        let mut state = self.state.lock().unwrap();
        let base = match target {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(delta) => state.pos as i64 + delta,
            SeekFrom::End(delta) => self.size as i64 + delta,
        };
        if base < 0 {
            return Err(Error::Unsupported("seek before start of stream"));
        }
        state.pos = base as u64;
        self.preload(&mut state);
        Ok(state.pos)
    }

    /// Read up to `size` bytes from the current position.
    pub fn read(&self, size: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; size];
        let read = self.read_into(&mut buf)?;
        buf.truncate(read);
        Ok(buf)
    }

    /// Read from the current position to the end of the object.
    pub fn read_to_end(&self) -> Result<Vec<u8>> {
        let remaining = self.size.saturating_sub(self.tell()) as usize;
        self.read(remaining)
    }

    /// Read up to `size` bytes without advancing the position. Issues one
    /// direct range request and leaves the prefetch window untouched.
    pub fn peek(&self, size: usize) -> Result<Vec<u8>> {
        let pos = self.tell();
        let mut data = self
            .backend
            .read_range(pos, Some(pos + size as u64))?;
        data.truncate(size);
        Ok(data)
    }

    /// Read bytes into `buf`, returning the number of bytes read. A short
    /// read signals end of stream. Consumed chunks immediately trigger the
    /// prefetch of the next chunk beyond the window.
    pub fn read_into(&self, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.state.lock().unwrap();
        if state.queue.is_empty() {
            self.preload(&mut state);
        }

        let mut copied = 0;
        while copied < buf.len() && state.pos < self.size {
            let chunk_start = state.pos - state.pos % self.chunk_size;
            let chunk = match self.take_ready(&mut state, chunk_start)? {
                Some(chunk) => chunk,
                None => break,
            };

            let offset = (state.pos - chunk_start) as usize;
            if offset >= chunk.len() {
                // Chunk shorter than expected: end of stream
                state.queue.insert(chunk_start, Slot::Ready(chunk));
                break;
            }

            let take = chunk.len().saturating_sub(offset).min(buf.len() - copied);
            buf[copied..copied + take].copy_from_slice(&chunk[offset..offset + take]);
            copied += take;
            state.pos += take as u64;

            if offset + take >= chunk.len() {
                // Chunk fully consumed: recycle its slot into the window tail
                let next = chunk_start + self.chunk_size * self.readahead;
                if next < self.size {
                    self.submit_fetch(&mut state, next);
                }
            } else {
                state.queue.insert(chunk_start, Slot::Ready(chunk));
            }
        }

        Ok(copied)
    }

    /// Ensure every chunk of the window starting at the current position is
    /// queued, dropping queued chunks that fell outside the window.
    fn preload(&self, state: &mut ReaderState) {
        let first = state.pos - state.pos % self.chunk_size;
        let window: Vec<u64> = (0..self.readahead)
            .map(|i| first + i * self.chunk_size)
            .filter(|start| *start < self.size)
            .collect();

        state.queue.retain(|start, _| window.contains(start));
        for start in window {
            self.submit_fetch(state, start);
        }
    }

    fn submit_fetch(&self, state: &mut ReaderState, start: u64) {
        if state.queue.contains_key(&start) {
            return;
        }
        let backend = Arc::clone(&self.backend);
        let end = (start + self.chunk_size).min(self.size);
        let handle = self.pool.submit(move || backend.read_range(start, Some(end)));
        state.queue.insert(start, Slot::InFlight(handle));
    }

    /// Take the chunk at `start` out of the queue, blocking on its transfer
    /// if it is still in flight.
    fn take_ready(&self, state: &mut ReaderState, start: u64) -> Result<Option<Vec<u8>>> {
        if !state.queue.contains_key(&start) {
            if start >= self.size {
                return Ok(None);
            }
            self.submit_fetch(state, start);
        }
        match state.queue.remove(&start) {
            Some(Slot::Ready(chunk)) => Ok(Some(chunk)),
            Some(Slot::InFlight(handle)) => Ok(Some(handle.wait()?)),
            None => Ok(None),
        }
    }
}
