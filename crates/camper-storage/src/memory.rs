use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use camper_core::{Assignment, ColumnValue, EntityType};
use tokio::sync::Mutex;

use crate::{
    check_columns, EntityRow, EntityStore, MappingStore, PartnerMapping, Store, StoreError,
    StoreFactory, UserDirectory, UserRecord,
};

/// In-process store with the same ledger rules as the Postgres schema.
///
/// Clones share state, so a test can hand a clone to a factory and inspect
/// the original afterwards.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: HashMap<EntityType, i64>,
    rows: HashMap<EntityType, BTreeMap<i64, EntityRow>>,
    mappings: Vec<PartnerMapping>,
    users: BTreeMap<i64, UserRecord>,
}

impl MemoryState {
    fn find_mapping(&self, partner: &str, entity_type: EntityType, external_id: &str) -> Option<i64> {
        self.mappings
            .iter()
            .find(|m| {
                m.partner_name == partner
                    && m.entity_type == entity_type
                    && m.external_id == external_id
            })
            .map(|m| m.internal_id)
    }

    fn insert(&mut self, entity_type: EntityType, row: &[Assignment]) -> i64 {
        let next = self.next_id.entry(entity_type).or_insert(0);
        *next += 1;
        let id = *next;

        let mut stored = EntityRow::new();
        stored.insert("id".to_string(), Some(ColumnValue::Int(id)));
        for column in entity_type.reference_columns() {
            stored.insert(column.to_string(), None);
        }
        for spec in entity_type.payload_columns() {
            stored.insert(spec.name.to_string(), None);
        }
        for (column, value) in row {
            stored.insert(column.to_string(), value.clone());
        }
        self.rows.entry(entity_type).or_default().insert(id, stored);
        id
    }

    fn register(
        &mut self,
        partner: &str,
        entity_type: EntityType,
        internal_id: i64,
        external_id: &str,
    ) -> Result<(), StoreError> {
        if self.find_mapping(partner, entity_type, external_id).is_some() {
            return Err(StoreError::DuplicateMapping {
                partner: partner.to_string(),
                entity_type,
                external_id: external_id.to_string(),
            });
        }
        self.mappings.push(PartnerMapping {
            partner_name: partner.to_string(),
            entity_type,
            internal_id,
            external_id: external_id.to_string(),
        });
        Ok(())
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_user(&self, id: i64, email: &str, role: &str) {
        let mut state = self.state.lock().await;
        state.users.insert(
            id,
            UserRecord {
                id,
                email: email.to_string(),
                role: role.to_string(),
            },
        );
    }

    pub async fn all_mappings(&self) -> Vec<PartnerMapping> {
        self.state.lock().await.mappings.clone()
    }

    pub async fn rows(&self, entity_type: EntityType) -> Vec<EntityRow> {
        self.state
            .lock()
            .await
            .rows
            .get(&entity_type)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MappingStore for MemoryStore {
    async fn resolve(
        &mut self,
        partner: &str,
        entity_type: EntityType,
        external_id: &str,
    ) -> Result<Option<i64>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .find_mapping(partner, entity_type, external_id))
    }

    async fn register(
        &mut self,
        partner: &str,
        entity_type: EntityType,
        internal_id: i64,
        external_id: &str,
    ) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .register(partner, entity_type, internal_id, external_id)
    }

    async fn mappings_for(
        &mut self,
        partner: &str,
        entity_type: EntityType,
    ) -> Result<Vec<PartnerMapping>, StoreError> {
        let state = self.state.lock().await;
        let mut out = state
            .mappings
            .iter()
            .filter(|m| m.partner_name == partner && m.entity_type == entity_type)
            .cloned()
            .collect::<Vec<_>>();
        out.sort_by_key(|m| m.internal_id);
        Ok(out)
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn insert_entity(
        &mut self,
        entity_type: EntityType,
        row: &[Assignment],
    ) -> Result<i64, StoreError> {
        check_columns(entity_type, row)?;
        Ok(self.state.lock().await.insert(entity_type, row))
    }

    async fn update_entity(
        &mut self,
        entity_type: EntityType,
        id: i64,
        row: &[Assignment],
    ) -> Result<u64, StoreError> {
        check_columns(entity_type, row)?;
        let mut state = self.state.lock().await;
        let Some(stored) = state.rows.get_mut(&entity_type).and_then(|rows| rows.get_mut(&id)) else {
            return Ok(0);
        };
        for (column, value) in row {
            stored.insert(column.to_string(), value.clone());
        }
        Ok(1)
    }

    async fn fetch_entity(
        &mut self,
        entity_type: EntityType,
        id: i64,
    ) -> Result<Option<EntityRow>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .rows
            .get(&entity_type)
            .and_then(|rows| rows.get(&id))
            .cloned())
    }

    async fn count_entities(&mut self, entity_type: EntityType) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        Ok(state.rows.get(&entity_type).map_or(0, |rows| rows.len() as i64))
    }
}

#[async_trait]
impl UserDirectory for MemoryStore {
    async fn find_user(&mut self, id: i64) -> Result<Option<UserRecord>, StoreError> {
        Ok(self.state.lock().await.users.get(&id).cloned())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_mapped(
        &mut self,
        partner: &str,
        entity_type: EntityType,
        external_id: &str,
        row: &[Assignment],
    ) -> Result<i64, StoreError> {
        check_columns(entity_type, row)?;
        let mut state = self.state.lock().await;
        if state.find_mapping(partner, entity_type, external_id).is_some() {
            return Err(StoreError::DuplicateMapping {
                partner: partner.to_string(),
                entity_type,
                external_id: external_id.to_string(),
            });
        }
        let id = state.insert(entity_type, row);
        state.register(partner, entity_type, id, external_id)?;
        Ok(id)
    }
}

#[async_trait]
impl StoreFactory for MemoryStore {
    async fn acquire(&self) -> Result<Box<dyn Store>, StoreError> {
        Ok(Box::new(self.clone()))
    }
}
