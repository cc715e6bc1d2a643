//! Markdown-native hybrid retrieval: indexes a vault of `.md` files and
//! answers semantic+lexical queries with byte-exact excerpts and heading
//! provenance.

pub mod chunker;
pub mod config;
pub mod embeddings;
pub mod engine;
pub mod error;
pub mod fence;
pub mod hashing;
pub mod index;
pub mod parser;
pub mod scanner;
pub mod search;
pub mod shard;
pub mod snapshot;
pub mod store;
pub mod types;
pub mod watcher;

pub use config::EngineConfig;
pub use engine::{Engine, ReindexOutcome};
pub use error::EngineError;
pub use types::{
    ChangeSet, DocUri, EngineState, EngineStatus, FileEntry, IndexStats, QueryFilters, QueryParams,
    QueryMeta, QueryResponse, SearchResult, WatchEvent, WatchEventKind, WatcherStatus,
};

pub use anyhow::{Error, Result};
pub use uuid::Uuid;
