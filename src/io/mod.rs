//! Object I/O core
//!
//! Turns range-addressable remote objects into seekable byte streams with
//! bounded memory use. [`raw::RawStream`] translates reads into range
//! requests and buffers writes in memory until an explicit flush;
//! [`buffered::BufferedReader`] and [`buffered::BufferedWriter`] add
//! fixed-size chunking with a worker pool for parallel transfer.

pub mod buffered;
pub mod pool;
pub mod raw;

pub use buffered::{BufferedReader, BufferedWriter, ChunkSink};
pub use pool::WorkerPool;
pub use raw::{ObjectBackend, OpenMode, RawStream};
