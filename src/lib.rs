//! emberdb is a persistent key-value store organized as a
//! log-structured merge tree.
//!
//! Keys and values are opaque byte strings. Writes land in an in-memory
//! skiplist; full skiplists are frozen and flushed into immutable sorted
//! files (SSTs) on disk, and a tiered compaction folds overgrown levels
//! into the next. Reads and scans merge every layer into one sorted,
//! newest-wins view, with deletes expressed as tombstones that readers
//! never observe.
//!
//! ```text
//!         writes                     reads / scans
//!            │                            │
//!            ▼                            ▼
//!      ┌───────────┐              ┌───────────────┐
//!      │ MemTable  │◄─────────────┤ merge cursors │
//!      └─────┬─────┘              └───────┬───────┘
//!            │ flush                      │
//!            ▼                            │
//!      ┌───────────┐   ┌───────────┐      │
//!      │  Level 0  │──►│ Level 1..N│◄─────┘
//!      └───────────┘   └───────────┘
//!        (compaction moves runs down)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use emberdb::{LsmConfig, LsmEngine};
//!
//! # fn main() -> emberdb::Result<()> {
//! let engine = LsmEngine::open(LsmConfig::new("./data"))?;
//! engine.put(b"hello", b"world")?;
//! assert_eq!(engine.get(b"hello")?, Some(b"world".to_vec()));
//! engine.remove(b"hello")?;
//! assert_eq!(engine.get(b"hello")?, None);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod iterator;
pub mod memtable;
pub mod skiplist;
pub mod sstable;

pub use cache::BlockCache;
pub use config::LsmConfig;
pub use engine::{EngineStats, LsmEngine, ScanIterator};
pub use error::{Error, Result};
pub use memtable::MemTable;
pub use skiplist::SkipList;
pub use sstable::{Sst, SstBuilder};
