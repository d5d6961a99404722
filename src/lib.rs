//! cloudfs - POSIX-like filesystem view over REST-backed object stores
//!
//! Exposes remote object stores that are only reachable through paginated,
//! rate-limited REST APIs as a virtual filesystem: path lookups, metadata
//! queries, directory listings, symlink resolution and seekable byte streams.
//!
//! Two storage providers are included: [`github::GithubFs`] maps GitHub
//! owners, repositories, git references, releases and archives onto a virtual
//! tree, and [`http::HttpFs`] serves single objects over plain `http(s)://`
//! URLs.
//!
//! All operations are blocking and run on the caller's thread; the only
//! concurrency is a worker pool used by buffered streams for parallel chunk
//! transfer. Metadata responses are cached on disk (see [`cache`]) so that
//! repeated lookups cost no API quota.

pub mod cache;
pub mod config;
pub mod error;
pub mod github;
pub mod http;
pub mod io;
pub mod rest;
pub mod system;

pub use config::Config;
pub use error::{Error, Result};
pub use system::{Entry, Headers, StorageSystem};
