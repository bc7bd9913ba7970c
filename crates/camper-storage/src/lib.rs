//! Identity mapping ledger, entity persistence, and partner HTTP fetch utilities.

use std::collections::BTreeMap;

use async_trait::async_trait;
use camper_core::{Assignment, ColumnKind, ColumnValue, EntityType};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod fetch;
mod memory;
mod pg;

pub use fetch::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, HttpClientConfig,
    HttpFetcher, RetryDisposition,
};
pub use memory::MemoryStore;
pub use pg::{run_migrations, PgStore, PgStoreFactory};

pub const CRATE_NAME: &str = "camper-storage";

/// One external-to-internal identity binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartnerMapping {
    pub partner_name: String,
    pub entity_type: EntityType,
    pub internal_id: i64,
    pub external_id: String,
}

/// A persisted entity row keyed by column name, including `id`.
pub type EntityRow = BTreeMap<String, Option<ColumnValue>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    pub email: String,
    pub role: String,
}

impl UserRecord {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity_type} {external_id} is already mapped for partner {partner}")]
    DuplicateMapping {
        partner: String,
        entity_type: EntityType,
        external_id: String,
    },
    #[error("{entity_type} {id} does not exist")]
    NotFound { entity_type: EntityType, id: i64 },
    #[error("column {column} is not writable on {entity_type}")]
    UnknownColumn {
        entity_type: EntityType,
        column: String,
    },
    #[error("{entity_type}.{column} expects a {expected:?} value")]
    TypeMismatch {
        entity_type: EntityType,
        column: String,
        expected: ColumnKind,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Append-only ledger of `(partner, entity_type, external_id) -> internal_id`.
#[async_trait]
pub trait MappingStore: Send {
    async fn resolve(
        &mut self,
        partner: &str,
        entity_type: EntityType,
        external_id: &str,
    ) -> Result<Option<i64>, StoreError>;

    /// Fails with [`StoreError::DuplicateMapping`] when the triple already exists.
    async fn register(
        &mut self,
        partner: &str,
        entity_type: EntityType,
        internal_id: i64,
        external_id: &str,
    ) -> Result<(), StoreError>;

    /// All bindings for one partner and entity type, ordered by internal id.
    async fn mappings_for(
        &mut self,
        partner: &str,
        entity_type: EntityType,
    ) -> Result<Vec<PartnerMapping>, StoreError>;
}

#[async_trait]
pub trait EntityStore: Send {
    /// Inserts a row and returns its generated id.
    async fn insert_entity(
        &mut self,
        entity_type: EntityType,
        row: &[Assignment],
    ) -> Result<i64, StoreError>;

    /// Sets only the given columns. Returns the number of rows touched.
    async fn update_entity(
        &mut self,
        entity_type: EntityType,
        id: i64,
        row: &[Assignment],
    ) -> Result<u64, StoreError>;

    async fn fetch_entity(
        &mut self,
        entity_type: EntityType,
        id: i64,
    ) -> Result<Option<EntityRow>, StoreError>;

    async fn count_entities(&mut self, entity_type: EntityType) -> Result<i64, StoreError>;
}

#[async_trait]
pub trait UserDirectory: Send {
    async fn find_user(&mut self, id: i64) -> Result<Option<UserRecord>, StoreError>;
}

/// Everything one unit of work needs from the data store.
#[async_trait]
pub trait Store: MappingStore + EntityStore + UserDirectory {
    /// Inserts a new entity and binds it to `external_id`.
    ///
    /// Backends that support transactions apply both writes or neither.
    async fn insert_mapped(
        &mut self,
        partner: &str,
        entity_type: EntityType,
        external_id: &str,
        row: &[Assignment],
    ) -> Result<i64, StoreError> {
        let id = self.insert_entity(entity_type, row).await?;
        self.register(partner, entity_type, id, external_id).await?;
        Ok(id)
    }
}

/// Hands out one store handle per unit of work. Dropping the handle releases it.
#[async_trait]
pub trait StoreFactory: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn Store>, StoreError>;
}

pub(crate) fn check_columns(entity_type: EntityType, row: &[Assignment]) -> Result<(), StoreError> {
    for (column, value) in row {
        let Some(kind) = entity_type.column_kind(column) else {
            return Err(StoreError::UnknownColumn {
                entity_type,
                column: column.to_string(),
            });
        };
        if let Some(value) = value {
            if value.kind() != kind {
                return Err(StoreError::TypeMismatch {
                    entity_type,
                    column: column.to_string(),
                    expected: kind,
                });
            }
        }
    }
    Ok(())
}
