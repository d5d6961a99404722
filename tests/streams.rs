//! End-to-end checks over the public stream and cache API, as an external
//! caller sees it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;

use cloudfs::cache::{CacheHandle, CacheMode};
use cloudfs::error::Error;
use cloudfs::io::raw::{ObjectBackend, OpenMode, RawStream};
use cloudfs::io::{BufferedReader, BufferedWriter, ChunkSink};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Backend over an in-memory object table, standing in for a remote store.
struct TableBackend {
    content: Mutex<Option<Vec<u8>>>,
}

impl TableBackend {
    fn new(content: Option<&[u8]>) -> Self {
        Self {
            content: Mutex::new(content.map(|c| c.to_vec())),
        }
    }
}

impl ObjectBackend for TableBackend {
    fn size(&self) -> cloudfs::Result<u64> {
        match &*self.content.lock().unwrap() {
            Some(data) => Ok(data.len() as u64),
            None => Err(Error::NotFound("object".to_string())),
        }
    }

    fn read_range(&self, start: u64, end: Option<u64>) -> cloudfs::Result<Vec<u8>> {
        let guard = self.content.lock().unwrap();
        let data = guard
            .as_ref()
            .ok_or_else(|| Error::NotFound("object".to_string()))?;
        let start = (start as usize).min(data.len());
        let end = end
            .map(|e| (e as usize).min(data.len()))
            .unwrap_or(data.len())
            .max(start);
        Ok(data[start..end].to_vec())
    }

    fn upload(&self, data: &[u8]) -> cloudfs::Result<()> {
        *self.content.lock().unwrap() = Some(data.to_vec());
        Ok(())
    }
}

/// Sink collecting flushed chunks for reassembly.
#[derive(Default)]
struct CollectSink {
    chunks: Mutex<Vec<(u64, Vec<u8>)>>,
    committed: Mutex<Option<u64>>,
}

impl ChunkSink for CollectSink {
    fn upload_chunk(&self, index: u64, data: Vec<u8>) -> cloudfs::Result<()> {
        self.chunks.lock().unwrap().push((index, data));
        Ok(())
    }

    fn finalize(&self, chunk_count: u64) -> cloudfs::Result<()> {
        *self.committed.lock().unwrap() = Some(chunk_count);
        Ok(())
    }
}

#[test]
fn buffered_writer_reassembles_into_original_content() -> Result<()> {
    init_tracing();
    let payload: Vec<u8> = (0..10_000u32).flat_map(|n| n.to_le_bytes()).collect();
    let sink = Arc::new(CollectSink::default());
    let writer = BufferedWriter::new(Arc::clone(&sink), 1024, 4);

    // Write in awkwardly sized pieces to cross chunk boundaries
    for piece in payload.chunks(700) {
        writer.write(piece)?;
    }
    writer.close()?;

    let mut chunks = sink.chunks.lock().unwrap().clone();
    chunks.sort_by_key(|(index, _)| *index);
    let reassembled: Vec<u8> = chunks.into_iter().flat_map(|(_, data)| data).collect();
    assert_eq!(reassembled, payload);

    let expected_chunks = (payload.len() as u64).div_ceil(1024);
    assert_eq!(*sink.committed.lock().unwrap(), Some(expected_chunks));
    Ok(())
}

#[test]
fn raw_write_then_buffered_read_back() -> Result<()> {
    init_tracing();
    let backend = TableBackend::new(None);
    let stream = RawStream::open(backend, OpenMode::Write, "object")?;
    let payload: Vec<u8> = (0..5000).map(|n| (n % 251) as u8).collect();
    stream.write(&payload)?;
    stream.flush()?;

    let reader = BufferedReader::new(Arc::new(stream.into_backend()), 512, 3)?;
    assert_eq!(reader.size(), payload.len() as u64);
    assert_eq!(reader.read_to_end()?, payload);
    Ok(())
}

#[test]
fn append_continues_existing_object() -> Result<()> {
    let backend = TableBackend::new(Some(b"hello "));
    let stream = RawStream::open(backend, OpenMode::Append, "object")?;
    stream.write(b"world")?;
    stream.close()?;

    let reader = RawStream::open(stream.into_backend(), OpenMode::Read, "object")?;
    assert_eq!(reader.read_all()?, b"hello world");
    Ok(())
}

#[test]
fn cache_entries_survive_across_handles() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let first = CacheHandle::with_dir(
        dir.path().to_path_buf(),
        Duration::from_secs(60),
        Duration::from_secs(60),
    )?;
    first.set("shared/key", &vec![1u32, 2, 3], CacheMode::Long)?;

    // A second handle over the same directory sees the entry
    let second = CacheHandle::with_dir(
        dir.path().to_path_buf(),
        Duration::from_secs(60),
        Duration::from_secs(60),
    )?;
    let value: Vec<u32> = second.get("shared/key")?;
    assert_eq!(value, vec![1, 2, 3]);
    Ok(())
}
