//! Snapshot reconciliation: change detection, per-row reconcile decisions and
//! the batch coordinator that drives them over a whole snapshot.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fleet_adapters::{parse_snapshot, SnapshotError, SnapshotFormat, SpreadsheetSource, Workbook};
use fleet_core::{ChangeSet, FieldSource, Listing, SchemaVariant, SnapshotRow, VariantRegistry};
use fleet_storage::{
    ListingStore, MemoryListingStore, NoPhotos, PgListingStore, PhotoResolver, SnapshotArchive,
    StoreError,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fleet-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub variants_file: Option<PathBuf>,
    pub archive_dir: Option<PathBuf>,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            db_max_connections: std::env::var("FLEET_DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            variants_file: std::env::var("FLEET_VARIANTS_FILE").ok().map(PathBuf::from),
            archive_dir: std::env::var("FLEET_ARCHIVE_DIR").ok().map(PathBuf::from),
        }
    }

    pub fn load_variants(&self) -> Result<VariantRegistry> {
        VariantRegistry::load(self.variants_file.as_deref()).with_context(|| match &self.variants_file {
            Some(path) => format!("loading variants from {}", path.display()),
            None => "loading built-in variants".to_string(),
        })
    }

    /// Opens the configured store: Postgres when `DATABASE_URL` is set,
    /// otherwise a process-local memory store.
    pub async fn open_store(&self, run_migrations: bool) -> Result<Arc<dyn ListingStore>> {
        let Some(url) = &self.database_url else {
            warn!("DATABASE_URL not set; listings are kept in memory only");
            return Ok(Arc::new(MemoryListingStore::new()));
        };
        let store = PgListingStore::connect(url, self.db_max_connections)
            .await
            .context("connecting to postgres")?;
        if run_migrations {
            store.migrate().await.context("running migrations")?;
        }
        Ok(Arc::new(store))
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("unknown variant `{0}`")]
    UnknownVariant(String),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Tracked fields whose values differ byte-for-byte between `old` and `new`,
/// in tracked order. Fields missing from either side are not compared.
pub fn detect_changes<O, N>(tracked: &[String], old: &O, new: &N) -> ChangeSet
where
    O: FieldSource + ?Sized,
    N: FieldSource + ?Sized,
{
    tracked
        .iter()
        .filter(|field| match (old.value(field), new.value(field)) {
            (Some(before), Some(after)) => before != after,
            _ => false,
        })
        .collect()
}

#[derive(Debug)]
pub enum RowOutcome {
    SkippedEmptyKey,
    Retired { existed: bool },
    Created(Listing),
    Updated(Listing),
    Unchanged,
    Failed { key: String, error: StoreError },
}

impl RowOutcome {
    pub fn listing(&self) -> Option<&Listing> {
        match self {
            Self::Created(listing) | Self::Updated(listing) => Some(listing),
            _ => None,
        }
    }
}

/// Decides and applies the store effect for one snapshot row of one variant.
pub struct Reconciler<'a> {
    variant: &'a SchemaVariant,
    store: &'a dyn ListingStore,
    photos: &'a dyn PhotoResolver,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        variant: &'a SchemaVariant,
        store: &'a dyn ListingStore,
        photos: &'a dyn PhotoResolver,
    ) -> Self {
        Self {
            variant,
            store,
            photos,
        }
    }

    pub async fn reconcile_row(&self, row: &SnapshotRow) -> RowOutcome {
        if !row.has_key() {
            debug!(row = row.row_number, "skipping row without key");
            return RowOutcome::SkippedEmptyKey;
        }
        match self.apply(row).await {
            Ok(outcome) => outcome,
            Err(error) => {
                warn!(row = row.row_number, key = %row.key, %error, "row skipped");
                RowOutcome::Failed {
                    key: row.key.clone(),
                    error,
                }
            }
        }
    }

    async fn apply(&self, row: &SnapshotRow) -> Result<RowOutcome, StoreError> {
        let variant = self.variant.name();

        if !self.variant.is_accepted(&row.status) {
            let existed = self.store.delete_by_key(variant, &row.key).await?;
            if existed {
                info!(key = %row.key, status = %row.status, "listing retired");
            }
            return Ok(RowOutcome::Retired { existed });
        }

        let Some(existing) = self.store.find_by_key(variant, &row.key).await? else {
            return self.create(row).await;
        };

        let changes = detect_changes(self.variant.tracked_fields(), &existing, row);
        if changes.is_empty() {
            return Ok(RowOutcome::Unchanged);
        }

        let price = self.variant.price_field();
        let previous_price = if changes.contains(price) {
            existing.value(price).map(str::to_string)
        } else {
            None
        };

        let updated = Listing {
            id: existing.id,
            key: existing.key.clone(),
            variant: variant.to_string(),
            fields: row.fields.clone(),
            previous_price,
            status: row.status.clone(),
            photos: existing.photos.clone(),
            is_new: false,
            changed_fields: changes,
            created_at: existing.created_at,
            updated_at: Some(Utc::now()),
        };
        self.store.update(&updated).await?;
        debug!(key = %updated.key, changed = ?updated.changed_fields, "listing updated");
        Ok(RowOutcome::Updated(updated))
    }

    async fn create(&self, row: &SnapshotRow) -> Result<RowOutcome, StoreError> {
        let photos = if self.variant.photo_columns().is_empty() {
            self.photos.resolve(&row.key).await
        } else {
            row.photos.clone()
        };
        let mut listing = Listing::from_row(self.variant.name(), row, photos);
        let id = self.store.insert(&listing).await?;
        let now = Utc::now();
        listing.id = Some(id);
        listing.created_at = Some(now);
        listing.updated_at = Some(now);
        debug!(key = %listing.key, id, "listing created");
        Ok(RowOutcome::Created(listing))
    }
}

/// Names of snapshots accepted for one variant, in first-seen order.
#[derive(Debug, Default)]
pub struct SourceNameRegistry {
    names: RwLock<Vec<String>>,
}

impl SourceNameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `name` unless already present and returns the registry contents.
    pub fn record(&self, name: &str) -> Vec<String> {
        let mut names = self.names.write().unwrap_or_else(PoisonError::into_inner);
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
        names.clone()
    }

    pub fn list(&self) -> Vec<String> {
        self.names
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.names
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// One source-name registry per configured variant.
#[derive(Debug, Default)]
pub struct RegistrySet {
    registries: BTreeMap<String, SourceNameRegistry>,
}

impl RegistrySet {
    pub fn for_variants<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            registries: names
                .into_iter()
                .map(|n| (n.into(), SourceNameRegistry::new()))
                .collect(),
        }
    }

    pub fn get(&self, variant: &str) -> Option<&SourceNameRegistry> {
        self.registries.get(variant)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub retired: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl OutcomeCounts {
    pub fn record(&mut self, outcome: &RowOutcome) {
        match outcome {
            RowOutcome::SkippedEmptyKey | RowOutcome::Retired { existed: false } => self.skipped += 1,
            RowOutcome::Retired { existed: true } => self.retired += 1,
            RowOutcome::Created(_) => self.created += 1,
            RowOutcome::Updated(_) => self.updated += 1,
            RowOutcome::Unchanged => self.unchanged += 1,
            RowOutcome::Failed { .. } => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub run_id: Uuid,
    pub variant: String,
    pub source_name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Data rows examined, skipped rows included.
    pub rows_processed: usize,
    pub counts: OutcomeCounts,
    /// New and changed listings, in row order.
    pub listings: Vec<Listing>,
    /// Source-name registry contents after this run.
    pub files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived_path: Option<String>,
}

pub struct BatchCoordinator {
    variants: Arc<VariantRegistry>,
    store: Arc<dyn ListingStore>,
    photos: Arc<dyn PhotoResolver>,
    registries: RegistrySet,
    archive: Option<SnapshotArchive>,
}

impl BatchCoordinator {
    pub fn new(variants: VariantRegistry, store: Arc<dyn ListingStore>) -> Self {
        let registries = RegistrySet::for_variants(variants.names());
        Self {
            variants: Arc::new(variants),
            store,
            photos: Arc::new(NoPhotos),
            registries,
            archive: None,
        }
    }

    pub fn with_photo_resolver(mut self, photos: Arc<dyn PhotoResolver>) -> Self {
        self.photos = photos;
        self
    }

    pub fn with_archive(mut self, archive: SnapshotArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub async fn from_config(config: &SyncConfig, run_migrations: bool) -> Result<Self> {
        let variants = config.load_variants()?;
        let store = config.open_store(run_migrations).await?;
        let mut coordinator = Self::new(variants, store);
        if let Some(dir) = &config.archive_dir {
            info!(dir = %dir.display(), "archiving uploaded snapshots");
            coordinator = coordinator.with_archive(SnapshotArchive::new(dir.clone()));
        }
        Ok(coordinator)
    }

    pub fn variants(&self) -> &VariantRegistry {
        &self.variants
    }

    pub fn store(&self) -> &dyn ListingStore {
        self.store.as_ref()
    }

    pub fn variant(&self, name: &str) -> Result<Arc<SchemaVariant>, SyncError> {
        self.variants
            .get(name)
            .ok_or_else(|| SyncError::UnknownVariant(name.to_string()))
    }

    fn registry(&self, variant: &str) -> Result<&SourceNameRegistry, SyncError> {
        self.registries
            .get(variant)
            .ok_or_else(|| SyncError::UnknownVariant(variant.to_string()))
    }

    /// Reconciles every data row of the first sheet of `source`.
    pub async fn run(
        &self,
        variant: &str,
        source_name: &str,
        source: &dyn SpreadsheetSource,
    ) -> Result<BatchReport, SyncError> {
        let schema = self.variant(variant)?;
        let rows = parse_snapshot(source, &schema)?;
        self.reconcile_rows(&schema, source_name, rows, None).await
    }

    /// Loads a snapshot file from raw bytes, picking the reader by file
    /// extension, archives it when an archive is configured, and reconciles it.
    pub async fn run_bytes(
        &self,
        variant: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<BatchReport, SyncError> {
        let schema = self.variant(variant)?;
        let format = SnapshotFormat::from_file_name(file_name)?;
        let workbook = Workbook::from_bytes(bytes, format)?;
        let rows = parse_snapshot(&workbook, &schema)?;

        let mut archived_path = None;
        if let Some(archive) = &self.archive {
            match archive.archive(Utc::now(), variant, file_name, bytes).await {
                Ok(stored) => {
                    debug!(path = %stored.relative_path.display(), deduplicated = stored.deduplicated, "snapshot archived");
                    archived_path = Some(stored.relative_path.display().to_string());
                }
                Err(err) => warn!(error = %format!("{err:#}"), file_name, "snapshot archive failed"),
            }
        }

        self.reconcile_rows(&schema, file_name, rows, archived_path)
            .await
    }

    async fn reconcile_rows(
        &self,
        schema: &SchemaVariant,
        source_name: &str,
        rows: Vec<SnapshotRow>,
        archived_path: Option<String>,
    ) -> Result<BatchReport, SyncError> {
        let registry = self.registry(schema.name())?;
        let run_id = Uuid::new_v4();
        let span = info_span!("batch", %run_id, variant = schema.name(), source = source_name);

        async move {
            let started_at = Utc::now();
            let reconciler = Reconciler::new(schema, self.store.as_ref(), self.photos.as_ref());
            let mut counts = OutcomeCounts::default();
            let mut listings = Vec::new();

            for row in &rows {
                let outcome = reconciler.reconcile_row(row).await;
                counts.record(&outcome);
                if let RowOutcome::Created(listing) | RowOutcome::Updated(listing) = outcome {
                    listings.push(listing);
                }
            }

            let files = registry.record(source_name);
            let finished_at = Utc::now();
            info!(
                rows = rows.len(),
                created = counts.created,
                updated = counts.updated,
                unchanged = counts.unchanged,
                retired = counts.retired,
                skipped = counts.skipped,
                failed = counts.failed,
                "batch reconciled"
            );

            Ok(BatchReport {
                run_id,
                variant: schema.name().to_string(),
                source_name: source_name.to_string(),
                started_at,
                finished_at,
                rows_processed: rows.len(),
                counts,
                listings,
                files,
                archived_path,
            })
        }
        .instrument(span)
        .await
    }

    /// Persisted listings, most recently updated first. With `changed_only`,
    /// only new listings and those with a non-empty change set.
    pub async fn list(&self, variant: &str, changed_only: bool) -> Result<Vec<Listing>, SyncError> {
        self.variant(variant)?;
        let mut listings = self.store.list(variant).await?;
        if changed_only {
            listings.retain(|l| l.is_new || !l.changed_fields.is_empty());
        }
        Ok(listings)
    }

    pub fn files(&self, variant: &str) -> Result<Vec<String>, SyncError> {
        Ok(self.registry(variant)?.list())
    }

    pub async fn clear_change_sets(&self, variant: &str) -> Result<u64, SyncError> {
        self.variant(variant)?;
        let rows = self.store.clear_change_sets(variant).await?;
        info!(variant, rows, "change sets cleared");
        Ok(rows)
    }

    /// Deletes every listing of the variant and forgets its source names.
    pub async fn delete_all(&self, variant: &str) -> Result<u64, SyncError> {
        let registry = self.registry(variant)?;
        let rows = self.store.delete_all(variant).await?;
        registry.clear();
        warn!(variant, rows, "all listings deleted");
        Ok(rows)
    }
}
