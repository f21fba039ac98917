//! # Watermark stores
//!
//! Durable mapping from a job identity (`host:port/database/[schema.]table`) to the
//! last key tuple the job advanced to.
//!
//! | Store | Use Case |
//! |-------|----------|
//! | `MemoryWatermarkStore` | Testing, ephemeral runs |
//! | `FileWatermarkStore` | Single-node production |
//!
//! ## File layout
//!
//! ```text
//! watermark_dir/
//!   localhost_3306_shop_orders.json
//! ```
//!
//! Each file holds the job identity, the watermark and the time it was
//! written. Writes go to a temp file that is fsynced, then renamed into place.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::key::Watermark;

/// Watermark store failure
#[derive(Error, Debug)]
pub enum StoreError {
    /// Filesystem or backend I/O failed
    #[error("watermark I/O error for {job}: {source}")]
    Io {
        /// Job identity
        job: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Stored data could not be encoded or decoded
    #[error("watermark encoding error for {job}: {source}")]
    Encoding {
        /// Job identity
        job: String,
        /// Underlying error
        #[source]
        source: serde_json::Error,
    },

    /// Backend-specific failure
    #[error("watermark store unavailable: {0}")]
    Unavailable(String),
}

/// Persistence boundary for watermarks
#[async_trait]
pub trait WatermarkStore: Send + Sync {
    /// Read the watermark for a job, `None` if never written
    async fn get(&self, job: &str) -> Result<Option<Watermark>, StoreError>;

    /// Replace the watermark for a job
    async fn put(&self, job: &str, watermark: &Watermark) -> Result<(), StoreError>;
}

// ============================================================================
// In-memory store
// ============================================================================

/// In-memory watermark store (testing, single-process runs)
#[derive(Debug, Default)]
pub struct MemoryWatermarkStore {
    marks: RwLock<HashMap<String, Watermark>>,
}

impl MemoryWatermarkStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs with a stored watermark
    pub async fn len(&self) -> usize {
        self.marks.read().await.len()
    }

    /// Whether no watermark has been stored
    pub async fn is_empty(&self) -> bool {
        self.marks.read().await.is_empty()
    }
}

#[async_trait]
impl WatermarkStore for MemoryWatermarkStore {
    async fn get(&self, job: &str) -> Result<Option<Watermark>, StoreError> {
        Ok(self.marks.read().await.get(job).cloned())
    }

    async fn put(&self, job: &str, watermark: &Watermark) -> Result<(), StoreError> {
        self.marks
            .write()
            .await
            .insert(job.to_string(), watermark.clone());
        Ok(())
    }
}

// ============================================================================
// File-based store
// ============================================================================

/// On-disk record
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredWatermark {
    job: String,
    watermark: Watermark,
    updated_at: DateTime<Utc>,
}

/// File-based watermark store
///
/// # Features
///
/// - Automatic directory creation
/// - Atomic, durable writes (fsynced temp file + rename + directory fsync)
/// - In-memory cache for fast reads
/// - Existing watermarks loaded on open
pub struct FileWatermarkStore {
    dir: PathBuf,
    cache: RwLock<HashMap<String, Watermark>>,
}

impl FileWatermarkStore {
    /// Open a store in `dir`, creating it if needed and loading existing files
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();

        fs::create_dir_all(&dir).await.map_err(|source| StoreError::Io {
            job: dir.display().to_string(),
            source,
        })?;

        let store = Self {
            dir,
            cache: RwLock::new(HashMap::new()),
        };
        store.load_all().await?;
        Ok(store)
    }

    /// Directory holding the watermark files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File a job's watermark is stored in
    pub fn file_path(&self, job: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(job)))
    }

    async fn load_all(&self) -> Result<(), StoreError> {
        let dir_err = |source| StoreError::Io {
            job: self.dir.display().to_string(),
            source,
        };
        let mut entries = fs::read_dir(&self.dir).await.map_err(dir_err)?;

        let mut cache = self.cache.write().await;
        let mut loaded = 0;

        while let Some(entry) = entries.next_entry().await.map_err(dir_err)? {
            let path = entry.path();
            if !path.extension().is_some_and(|ext| ext == "json") {
                continue;
            }
            // Unreadable records are an error, never an absent watermark
            let content = fs::read_to_string(&path)
                .await
                .map_err(|source| StoreError::Io {
                    job: path.display().to_string(),
                    source,
                })?;
            let record: StoredWatermark =
                serde_json::from_str(&content).map_err(|source| StoreError::Encoding {
                    job: path.display().to_string(),
                    source,
                })?;
            cache.insert(record.job, record.watermark);
            loaded += 1;
        }

        if loaded > 0 {
            debug!(dir = %self.dir.display(), loaded, "Loaded watermark files");
        }
        Ok(())
    }
}

#[async_trait]
impl WatermarkStore for FileWatermarkStore {
    async fn get(&self, job: &str) -> Result<Option<Watermark>, StoreError> {
        Ok(self.cache.read().await.get(job).cloned())
    }

    async fn put(&self, job: &str, watermark: &Watermark) -> Result<(), StoreError> {
        let path = self.file_path(job);
        let record = StoredWatermark {
            job: job.to_string(),
            watermark: watermark.clone(),
            updated_at: Utc::now(),
        };

        let content =
            serde_json::to_string_pretty(&record).map_err(|source| StoreError::Encoding {
                job: job.to_string(),
                source,
            })?;

        let temp_path = path.with_extension("json.tmp");
        if let Err(e) = replace_durably(&temp_path, &path, content.as_bytes()).await {
            if let Err(cleanup) = fs::remove_file(&temp_path).await {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %temp_path.display(), error = %cleanup, "Failed to remove temp watermark file");
                }
            }
            return Err(StoreError::Io {
                job: job.to_string(),
                source: e,
            });
        }

        self.cache
            .write()
            .await
            .insert(job.to_string(), watermark.clone());
        debug!(job, watermark = %watermark, "Saved watermark");
        Ok(())
    }
}

/// Write `temp`, fsync it, rename it over `path`, then fsync the directory
/// so neither a partial file nor a lost rename survives a crash.
async fn replace_durably(temp: &Path, path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(temp).await?;
    file.write_all(content).await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(temp, path).await?;

    if let Some(parent) = path.parent() {
        // Directory fsync is unsupported on some platforms
        if let Ok(dir) = fs::File::open(parent).await {
            if let Err(e) = dir.sync_all().await {
                debug!(dir = %parent.display(), error = %e, "Directory fsync failed");
            }
        }
    }
    Ok(())
}

/// Filesystem-safe file stem for a job identity
fn file_stem(job: &str) -> String {
    job.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
