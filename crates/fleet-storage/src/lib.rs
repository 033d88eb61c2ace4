//! Persisted listing catalog, photo lookup and the immutable snapshot archive.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_core::{ChangeSet, FieldMap, Listing};
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fleet-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("refusing to persist a listing with an empty key")]
    EmptyKey,
    #[error("listing {variant}/{key} already exists")]
    Duplicate { variant: String, key: String },
    #[error("listing {variant}/{key} not found")]
    NotFound { variant: String, key: String },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Keyed listing storage. Keys are unique within a variant.
#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn find_by_key(&self, variant: &str, key: &str) -> Result<Option<Listing>, StoreError>;

    /// Inserts a new listing and returns the identity the store assigned to it.
    async fn insert(&self, listing: &Listing) -> Result<i64, StoreError>;

    async fn update(&self, listing: &Listing) -> Result<(), StoreError>;

    /// Returns whether a listing existed for the key.
    async fn delete_by_key(&self, variant: &str, key: &str) -> Result<bool, StoreError>;

    async fn delete_all(&self, variant: &str) -> Result<u64, StoreError>;

    async fn clear_change_sets(&self, variant: &str) -> Result<u64, StoreError>;

    /// All listings of a variant, most recently updated first.
    async fn list(&self, variant: &str) -> Result<Vec<Listing>, StoreError>;
}

/// External photo lookup keyed by vehicle identifier. An empty result is normal.
#[async_trait]
pub trait PhotoResolver: Send + Sync {
    async fn resolve(&self, key: &str) -> Vec<String>;
}

/// Resolver used until a real photo source is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPhotos;

#[async_trait]
impl PhotoResolver for NoPhotos {
    async fn resolve(&self, _key: &str) -> Vec<String> {
        Vec::new()
    }
}

#[derive(Debug, Clone)]
struct MemoryRecord {
    listing: Listing,
    seq: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    seq: u64,
    rows: BTreeMap<(String, String), MemoryRecord>,
}

impl MemoryState {
    fn tick(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

/// Process-local store used when no database is configured, and in tests.
#[derive(Debug, Default)]
pub struct MemoryListingStore {
    state: Mutex<MemoryState>,
}

impl MemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ListingStore for MemoryListingStore {
    async fn find_by_key(&self, variant: &str, key: &str) -> Result<Option<Listing>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .rows
            .get(&(variant.to_string(), key.to_string()))
            .map(|r| r.listing.clone()))
    }

    async fn insert(&self, listing: &Listing) -> Result<i64, StoreError> {
        if listing.key.is_empty() {
            return Err(StoreError::EmptyKey);
        }
        let mut state = self.state.lock().await;
        let slot = (listing.variant.clone(), listing.key.clone());
        if state.rows.contains_key(&slot) {
            return Err(StoreError::Duplicate {
                variant: listing.variant.clone(),
                key: listing.key.clone(),
            });
        }
        state.next_id += 1;
        let id = state.next_id;
        let seq = state.tick();
        let now = Utc::now();
        let mut stored = listing.clone();
        stored.id = Some(id);
        stored.created_at = Some(now);
        stored.updated_at = Some(now);
        state.rows.insert(slot, MemoryRecord { listing: stored, seq });
        Ok(id)
    }

    async fn update(&self, listing: &Listing) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let seq = state.tick();
        let slot = (listing.variant.clone(), listing.key.clone());
        let Some(record) = state.rows.get_mut(&slot) else {
            return Err(StoreError::NotFound {
                variant: listing.variant.clone(),
                key: listing.key.clone(),
            });
        };
        let created_at = record.listing.created_at;
        let id = record.listing.id;
        record.listing = listing.clone();
        record.listing.id = id;
        record.listing.created_at = created_at;
        record.listing.updated_at = Some(Utc::now());
        record.seq = seq;
        Ok(())
    }

    async fn delete_by_key(&self, variant: &str, key: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        Ok(state
            .rows
            .remove(&(variant.to_string(), key.to_string()))
            .is_some())
    }

    async fn delete_all(&self, variant: &str) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.rows.len();
        state.rows.retain(|(v, _), _| v != variant);
        Ok((before - state.rows.len()) as u64)
    }

    async fn clear_change_sets(&self, variant: &str) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let mut touched = 0u64;
        let slots = state
            .rows
            .keys()
            .filter(|(v, _)| v == variant)
            .cloned()
            .collect::<Vec<_>>();
        for slot in slots {
            let seq = state.tick();
            if let Some(record) = state.rows.get_mut(&slot) {
                record.listing.changed_fields = ChangeSet::new();
                record.listing.updated_at = Some(now);
                record.seq = seq;
                touched += 1;
            }
        }
        Ok(touched)
    }

    async fn list(&self, variant: &str) -> Result<Vec<Listing>, StoreError> {
        let state = self.state.lock().await;
        let mut records = state
            .rows
            .iter()
            .filter(|((v, _), _)| v == variant)
            .map(|(_, r)| r.clone())
            .collect::<Vec<_>>();
        records.sort_by(|a, b| b.seq.cmp(&a.seq));
        Ok(records.into_iter().map(|r| r.listing).collect())
    }
}

/// Postgres-backed catalog. One `listings` table holds every variant,
/// unique on `(variant, vin)`.
#[derive(Debug, Clone)]
pub struct PgListingStore {
    pool: PgPool,
}

const LISTING_COLUMNS: &str = "id, variant, vin, fields, old_price, status, photos, is_new, \
                               changed_columns, created_at, updated_at";

impl PgListingStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("listing schema migrations applied");
        Ok(())
    }
}

fn listing_from_row(row: &PgRow) -> Result<Listing, StoreError> {
    let fields: Json<FieldMap> = row.try_get("fields")?;
    let changed: Vec<String> = row.try_get("changed_columns")?;
    Ok(Listing {
        id: Some(row.try_get("id")?),
        key: row.try_get("vin")?,
        variant: row.try_get("variant")?,
        fields: fields.0,
        previous_price: row.try_get("old_price")?,
        status: row.try_get("status")?,
        photos: row.try_get("photos")?,
        is_new: row.try_get("is_new")?,
        changed_fields: changed.into_iter().collect(),
        created_at: Some(row.try_get::<DateTime<Utc>, _>("created_at")?),
        updated_at: Some(row.try_get::<DateTime<Utc>, _>("updated_at")?),
    })
}

#[async_trait]
impl ListingStore for PgListingStore {
    async fn find_by_key(&self, variant: &str, key: &str) -> Result<Option<Listing>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {LISTING_COLUMNS} FROM listings WHERE variant = $1 AND vin = $2"
        ))
        .bind(variant)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(listing_from_row).transpose()
    }

    async fn insert(&self, listing: &Listing) -> Result<i64, StoreError> {
        if listing.key.is_empty() {
            return Err(StoreError::EmptyKey);
        }
        let result = sqlx::query(
            r#"
            INSERT INTO listings
                   (variant, vin, fields, old_price, status, photos, is_new, changed_columns)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(&listing.variant)
        .bind(&listing.key)
        .bind(Json(&listing.fields))
        .bind(listing.previous_price.as_deref())
        .bind(&listing.status)
        .bind(&listing.photos)
        .bind(listing.is_new)
        .bind(listing.changed_fields.as_slice())
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(row) => Ok(row.try_get("id")?),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::Duplicate {
                    variant: listing.variant.clone(),
                    key: listing.key.clone(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn update(&self, listing: &Listing) -> Result<(), StoreError> {
        let done = sqlx::query(
            r#"
            UPDATE listings
               SET fields = $3,
                   old_price = $4,
                   status = $5,
                   photos = $6,
                   is_new = $7,
                   changed_columns = $8,
                   updated_at = NOW()
             WHERE variant = $1
               AND vin = $2
            "#,
        )
        .bind(&listing.variant)
        .bind(&listing.key)
        .bind(Json(&listing.fields))
        .bind(listing.previous_price.as_deref())
        .bind(&listing.status)
        .bind(&listing.photos)
        .bind(listing.is_new)
        .bind(listing.changed_fields.as_slice())
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                variant: listing.variant.clone(),
                key: listing.key.clone(),
            });
        }
        Ok(())
    }

    async fn delete_by_key(&self, variant: &str, key: &str) -> Result<bool, StoreError> {
        let done = sqlx::query("DELETE FROM listings WHERE variant = $1 AND vin = $2")
            .bind(variant)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn delete_all(&self, variant: &str) -> Result<u64, StoreError> {
        let done = sqlx::query("DELETE FROM listings WHERE variant = $1")
            .bind(variant)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }

    async fn clear_change_sets(&self, variant: &str) -> Result<u64, StoreError> {
        let done = sqlx::query(
            "UPDATE listings SET changed_columns = '{}', updated_at = NOW() WHERE variant = $1",
        )
        .bind(variant)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }

    async fn list(&self, variant: &str) -> Result<Vec<Listing>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {LISTING_COLUMNS} FROM listings WHERE variant = $1 ORDER BY updated_at DESC, id DESC"
        ))
        .bind(variant)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(listing_from_row).collect()
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Write-once archive of uploaded snapshot files, addressed by content hash.
#[derive(Debug, Clone)]
pub struct SnapshotArchive {
    root: PathBuf,
}

impl SnapshotArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn relative_path_for(
        received_at: DateTime<Utc>,
        variant: &str,
        content_hash: &str,
        file_name: &str,
    ) -> PathBuf {
        let ext = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .filter(|e| !e.is_empty())
            .unwrap_or_else(|| "bin".to_string());
        PathBuf::from(received_at.format("%Y%m%d_%H%M%S").to_string())
            .join(variant)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Stores the snapshot under its hash path. Identical bytes archived
    /// within the same second land on the same path and are written once.
    pub async fn archive(
        &self,
        received_at: DateTime<Utc>,
        variant: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedSnapshot> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::relative_path_for(received_at, variant, &content_hash, file_name);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .with_context(|| format!("archive path {} has no parent", absolute_path.display()))?;

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating archive directory {}", parent.display()))?;

        let archived = |deduplicated| ArchivedSnapshot {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            debug!(path = %relative_path.display(), "snapshot already archived");
            return Ok(archived(true));
        }

        let temp_path = parent.join(format!(".{}.partial", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            if err.kind() == std::io::ErrorKind::AlreadyExists {
                return Ok(archived(true));
            }
            return Err(err).with_context(|| {
                format!(
                    "renaming {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }
        Ok(archived(false))
    }
}
