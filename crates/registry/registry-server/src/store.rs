//! # `store`
//!
//! Durable record of the entity behind each transaction hash.
//!
//! The store is a cache over the chain: rows are written after successful
//! submissions and after cold chain lookups, and read before the chain is
//! consulted. Writes are upserts keyed by transaction hash.

use alloy::primitives::B256;
use async_trait::async_trait;
use parking_lot::Mutex;
use registry_core::EntityDetail;
use sqlx::{
    PgPool,
    postgres::{
        PgConnectOptions,
        PgPoolOptions,
        PgSslMode,
    },
};
use std::{
    collections::HashMap,
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use tokio::sync::OnceCell;
use tracing::{
    debug,
    info,
    warn,
};

use crate::chain::OnchainEntity;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// One row of `registry_entities`.
#[derive(Debug, Clone, Default, PartialEq, Eq, sqlx::FromRow)]
pub struct PersistedEntityRecord {
    pub tx_hash: String,
    pub id: Option<String>,
    pub entity_type: Option<String>,
    pub data_json: Option<String>,
    pub version: Option<String>,
    pub previous_id: Option<String>,
    pub timestamp: Option<String>,
    pub submitter: Option<String>,
    pub tx_url: Option<String>,
    pub chain_name: Option<String>,
}

impl PersistedEntityRecord {
    pub fn from_entity(
        tx_hash: B256,
        entity: &OnchainEntity,
        tx_url: impl Into<String>,
        chain_name: &str,
    ) -> Self {
        let detail = entity.to_detail();
        Self {
            tx_hash: tx_key(&tx_hash),
            id: Some(detail.id),
            entity_type: Some(detail.entity_type),
            data_json: Some(detail.data_json),
            version: Some(detail.version),
            previous_id: Some(detail.previous_id),
            timestamp: Some(detail.timestamp),
            submitter: Some(detail.submitter),
            tx_url: Some(tx_url.into()),
            chain_name: (!chain_name.is_empty()).then(|| chain_name.to_string()),
        }
    }

    /// Null columns render as empty strings.
    pub fn to_detail(&self) -> EntityDetail {
        EntityDetail {
            id: self.id.clone().unwrap_or_default(),
            entity_type: self.entity_type.clone().unwrap_or_default(),
            data_json: self.data_json.clone().unwrap_or_default(),
            version: self.version.clone().unwrap_or_default(),
            previous_id: self.previous_id.clone().unwrap_or_default(),
            timestamp: self.timestamp.clone().unwrap_or_default(),
            submitter: self.submitter.clone().unwrap_or_default(),
        }
    }
}

/// Row key for a transaction hash: lowercase, `0x`-prefixed hex.
pub fn tx_key(tx_hash: &B256) -> String {
    tx_hash.to_string()
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get_by_tx(&self, tx_hash: &B256)
    -> Result<Option<PersistedEntityRecord>, StoreError>;
    /// Inserts the row or overwrites every column of the existing one.
    async fn save_by_tx(&self, record: &PersistedEntityRecord) -> Result<(), StoreError>;
    /// Cheap round trip used by the readiness probe.
    async fn ping(&self) -> Result<(), StoreError>;
}

pub type SharedEntityStore = Arc<dyn EntityStore>;

/// Saves `record`. Failures are logged and counted, never returned.
pub async fn persist_best_effort(store: &dyn EntityStore, record: &PersistedEntityRecord) {
    match store.save_by_tx(record).await {
        Ok(()) => debug!(tx_hash = %record.tx_hash, "Persisted entity record"),
        Err(err) => {
            metrics::counter!("store_persist_failures_total").increment(1);
            warn!(tx_hash = %record.tx_hash, error = %err, "Failed to persist entity record");
        }
    }
}

/// Connection settings for [`PgEntityStore`].
#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub database_url: String,
    pub max_connections: u32,
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
    pub ssl: bool,
}

/// Postgres-backed [`EntityStore`].
///
/// The pool connects lazily and the schema is created before the first
/// query. A failed schema creation is retried on the next access.
#[derive(Debug, Clone)]
pub struct PgEntityStore {
    pool: PgPool,
    schema: Arc<OnceCell<()>>,
}

impl PgEntityStore {
    /// Builds the pool without opening a connection.
    pub fn connect_lazy(settings: &StoreSettings) -> Result<Self, StoreError> {
        let mut options = PgConnectOptions::from_str(&settings.database_url)?;
        if settings.ssl {
            options = options.ssl_mode(PgSslMode::Require);
        }

        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .idle_timeout(settings.idle_timeout)
            .acquire_timeout(settings.acquire_timeout)
            .connect_lazy_with(options);

        info!(
            max_connections = settings.max_connections,
            ssl = settings.ssl,
            "Configured Postgres pool"
        );

        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            schema: Arc::new(OnceCell::new()),
        }
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.schema
            .get_or_try_init(|| Self::run_migrations(&self.pool))
            .await?;
        Ok(())
    }

    pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS registry_entities (
                tx_hash TEXT PRIMARY KEY,
                id TEXT,
                entity_type TEXT,
                data_json TEXT,
                version TEXT,
                previous_id TEXT,
                timestamp TEXT,
                submitter TEXT,
                tx_url TEXT,
                chain_name TEXT,
                created_at TIMESTAMPTZ DEFAULT now()
            )
            ",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_registry_entities_id ON registry_entities(id)",
        )
        .execute(pool)
        .await?;

        debug!("Ensured registry_entities schema");
        Ok(())
    }
}

#[async_trait]
impl EntityStore for PgEntityStore {
    async fn get_by_tx(
        &self,
        tx_hash: &B256,
    ) -> Result<Option<PersistedEntityRecord>, StoreError> {
        self.ensure_schema().await?;
        let record = sqlx::query_as::<_, PersistedEntityRecord>(
            r"
            SELECT tx_hash, id, entity_type, data_json, version, previous_id,
                   timestamp, submitter, tx_url, chain_name
            FROM registry_entities
            WHERE tx_hash = $1
            LIMIT 1
            ",
        )
        .bind(tx_key(tx_hash))
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn save_by_tx(&self, record: &PersistedEntityRecord) -> Result<(), StoreError> {
        self.ensure_schema().await?;
        sqlx::query(
            r"
            INSERT INTO registry_entities (
                tx_hash, id, entity_type, data_json, version, previous_id,
                timestamp, submitter, tx_url, chain_name
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (tx_hash) DO UPDATE SET
                id = EXCLUDED.id,
                entity_type = EXCLUDED.entity_type,
                data_json = EXCLUDED.data_json,
                version = EXCLUDED.version,
                previous_id = EXCLUDED.previous_id,
                timestamp = EXCLUDED.timestamp,
                submitter = EXCLUDED.submitter,
                tx_url = EXCLUDED.tx_url,
                chain_name = EXCLUDED.chain_name
            ",
        )
        .bind(&record.tx_hash)
        .bind(&record.id)
        .bind(&record.entity_type)
        .bind(&record.data_json)
        .bind(&record.version)
        .bind(&record.previous_id)
        .bind(&record.timestamp)
        .bind(&record.submitter)
        .bind(&record.tx_url)
        .bind(&record.chain_name)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Process-local store with the same upsert semantics as Postgres.
#[derive(Debug, Default)]
pub struct MemoryEntityStore {
    rows: Mutex<HashMap<String, PersistedEntityRecord>>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn get_by_tx(
        &self,
        tx_hash: &B256,
    ) -> Result<Option<PersistedEntityRecord>, StoreError> {
        Ok(self.rows.lock().get(&tx_key(tx_hash)).cloned())
    }

    async fn save_by_tx(&self, record: &PersistedEntityRecord) -> Result<(), StoreError> {
        self.rows
            .lock()
            .insert(record.tx_hash.clone(), record.clone());
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
