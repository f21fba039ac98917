//! tidemark - incremental keyset extraction from relational tables
//!
//! A job reads a mutable table in key order, one bounded range query per poll,
//! and hands each batch to an emitter before persisting how far it got. The
//! persisted position (the watermark) lets the next run pick up where the
//! last one stopped without re-reading rows or skipping concurrent inserts.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐   ┌─────────┐   ┌──────────────┐   ┌─────────┐
//! │ Key        │──▶│ Query   │──▶│ Extraction   │──▶│ Emitter │
//! │ resolver   │   │ planner │   │ loop         │   └─────────┘
//! └────────────┘   └─────────┘   └──────┬───────┘
//!                                       │ get / put
//!                                ┌──────▼───────┐
//!                                │ Watermark    │
//!                                │ store        │
//!                                └──────────────┘
//! ```
//!
//! # Library usage
//!
//! ```rust,ignore
//! use tidemark::prelude::*;
//!
//! let options = JobOptions::new("db:3306/shop/orders", TableRef::new("orders"))
//!     .with_key_columns(["id"]);
//! let report = Extractor::new(options, Box::new(reader), store, emitter)
//!     .with_shutdown(token)
//!     .run()
//!     .await?;
//! ```
//!
//! # CLI usage
//!
//! ```bash
//! # Extract until the table is exhausted (or forever in continuous mode)
//! tidemark -c job.yaml run
//!
//! # Validate configuration
//! tidemark -c job.yaml validate
//!
//! # Show the next query for the stored watermark
//! tidemark -c job.yaml plan
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod emitter;
pub mod engine;
pub mod error;
pub mod key;
pub mod planner;
pub mod retry;
pub mod source;
pub mod testing;
pub mod watermark;

pub use config::{SensitiveString, TidemarkConfig};
pub use emitter::{Batch, EmitError, Emitter, JsonLinesEmitter, StdoutEmitter};
pub use engine::{Completion, ExtractReport, ExtractStats, Extractor, JobOptions, Mode};
pub use error::{ExtractError, ExtractState, JobFailure, Result};
pub use key::{resolve_keys, KeySet, KeyTuple, Watermark};
pub use planner::{plan, Query};
pub use retry::{BackoffPolicy, RetryContext};
pub use source::{RdbcReader, TableReader, TableRef};
pub use watermark::{FileWatermarkStore, MemoryWatermarkStore, StoreError, WatermarkStore};

/// Commonly used types
pub mod prelude {
    pub use crate::emitter::{Batch, Emitter};
    pub use crate::engine::{Completion, ExtractReport, Extractor, JobOptions, Mode};
    pub use crate::error::{ExtractError, JobFailure};
    pub use crate::key::{KeySet, Watermark};
    pub use crate::retry::BackoffPolicy;
    pub use crate::source::{TableReader, TableRef};
    pub use crate::watermark::WatermarkStore;
    pub use tidemark_rdbc::types::Row;
    pub use tidemark_rdbc::Value;
}
