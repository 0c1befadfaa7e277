//! # CellarDB
//!
//! An embeddable column-family store built on a log-structured merge tree:
//! - Tables of column families; cells addressed by (row, family, qualifier,
//!   timestamp)
//! - Write-Ahead Logging (WAL) for durability, replayed on open
//! - Block-indexed segments with Bloom filters
//! - Size-tiered compaction with version and tombstone retention
//! - Snapshot reads: a read never observes a partially applied batch
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Store                               │
//! │           (catalog, tables, maintenance worker)             │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                         Table                               │
//! │            (Single Writer / Multi Reader)                   │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │     WAL     │          │  MemTable   │
//!   │  (Append)   │          │  (RwLock)   │
//!   └─────────────┘          └──────┬──────┘
//!                                   │ flush
//!                                   ▼
//!                           ┌─────────────┐      ┌────────────┐
//!                           │  Segments   │◄────►│ Compaction │
//!                           │ (+ Bloom)   │      └────────────┘
//!                           └─────────────┘
//! ```
//!
//! ## Example
//! ```no_run
//! use cellar::{Config, Store};
//!
//! # fn main() -> cellar::Result<()> {
//! let store = Store::open(Config::builder().data_dir("./data").build())?;
//! store.create_table("users", &["info"])?;
//! store.put("users", b"alice", "info", b"email", b"alice@example.com")?;
//! assert!(store.get("users", b"alice", "info", b"email")?.is_some());
//! # Ok(())
//! # }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod encoding;
mod fsutil;

pub mod wal;
pub mod memtable;
pub mod storage;
pub mod compaction;

pub mod catalog;
pub mod table;
pub mod query;
pub mod maintenance;
pub mod store;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use catalog::TableDescriptor;
pub use compaction::{CompactionHandle, CompactionOutcome};
pub use config::{CompactionConfig, Config, ConfigBuilder, WalSyncStrategy};
pub use encoding::{Cell, CellKey, CellValue};
pub use error::{CellarError, Result};
pub use query::{Row, RowScanner, Scan};
pub use store::Store;
pub use table::{RowMutation, Table, TableState};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of CellarDB
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
