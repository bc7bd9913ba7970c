//! Upsert reconciliation of partner records against the identity ledger.
//!
//! Each record is resolved through the mapping store: a known external id
//! becomes an `UPDATE` of the payload's columns, an unseen one becomes an
//! `INSERT` plus a new mapping. Stations and campers resolve their parents
//! through [`IdentityIndex`]es built before the batch starts, so parents must
//! be imported first.

use std::collections::HashMap;

use camper_core::{Assignment, ColumnValue, EntityType, Field, PartnerRecord};
use camper_storage::{Store, StoreError};
use serde::Serialize;
use tracing::{debug, warn};

/// In-memory `external_id -> internal_id` view of one partner's mappings.
#[derive(Debug, Clone, Default)]
pub struct IdentityIndex {
    ids: HashMap<String, i64>,
}

impl IdentityIndex {
    pub async fn load<S: Store + ?Sized>(
        store: &mut S,
        partner: &str,
        entity_type: EntityType,
    ) -> Result<Self, StoreError> {
        let ids = store
            .mappings_for(partner, entity_type)
            .await?
            .into_iter()
            .map(|m| (m.external_id, m.internal_id))
            .collect();
        Ok(Self { ids })
    }

    pub fn get(&self, external_id: &str) -> Option<i64> {
        self.ids.get(external_id).copied()
    }

    pub fn insert(&mut self, external_id: impl Into<String>, internal_id: i64) {
        self.ids.insert(external_id.into(), internal_id);
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Parent lookups a batch needs: providers for stations, providers and stations for campers.
#[derive(Debug, Clone, Default)]
pub struct ParentIndexes {
    pub providers: IdentityIndex,
    pub stations: IdentityIndex,
}

impl ParentIndexes {
    pub async fn load_for<S: Store + ?Sized>(
        store: &mut S,
        partner: &str,
        entity_type: EntityType,
    ) -> Result<Self, StoreError> {
        let mut parents = Self::default();
        if entity_type != EntityType::Provider {
            parents.providers = IdentityIndex::load(store, partner, EntityType::Provider).await?;
        }
        if entity_type == EntityType::Camper {
            parents.stations = IdentityIndex::load(store, partner, EntityType::Station).await?;
        }
        Ok(parents)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Inserted { id: i64 },
    Updated { id: i64 },
    Skipped { reason: String },
}

/// Reconciles one record and appends a human-readable line to `log`.
pub async fn reconcile_record<S: Store + ?Sized>(
    store: &mut S,
    partner: &str,
    record: &PartnerRecord,
    parents: &ParentIndexes,
    log: &mut Vec<String>,
) -> Result<ReconcileOutcome, StoreError> {
    match record.entity_type {
        EntityType::Provider => reconcile_provider(store, partner, record, log).await,
        EntityType::Station => {
            reconcile_station(store, partner, record, &parents.providers, log).await
        }
        EntityType::Camper => {
            reconcile_camper(store, partner, record, &parents.providers, &parents.stations, log)
                .await
        }
    }
}

pub async fn reconcile_provider<S: Store + ?Sized>(
    store: &mut S,
    partner: &str,
    record: &PartnerRecord,
    log: &mut Vec<String>,
) -> Result<ReconcileOutcome, StoreError> {
    upsert(store, partner, record, Vec::new(), log).await
}

pub async fn reconcile_station<S: Store + ?Sized>(
    store: &mut S,
    partner: &str,
    record: &PartnerRecord,
    providers: &IdentityIndex,
    log: &mut Vec<String>,
) -> Result<ReconcileOutcome, StoreError> {
    let provider_id = match resolve_parent(record, EntityType::Provider, record.provider_ref.as_deref(), providers) {
        Ok(id) => id,
        Err(reason) => return Ok(skip(record, reason, log)),
    };
    let references = vec![("provider_id", Some(ColumnValue::Int(provider_id)))];
    upsert(store, partner, record, references, log).await
}

pub async fn reconcile_camper<S: Store + ?Sized>(
    store: &mut S,
    partner: &str,
    record: &PartnerRecord,
    providers: &IdentityIndex,
    stations: &IdentityIndex,
    log: &mut Vec<String>,
) -> Result<ReconcileOutcome, StoreError> {
    let provider_id = match resolve_parent(record, EntityType::Provider, record.provider_ref.as_deref(), providers) {
        Ok(id) => id,
        Err(reason) => return Ok(skip(record, reason, log)),
    };
    let mut references = vec![("provider_id", Some(ColumnValue::Int(provider_id)))];

    // A camper without a home station is fine; one pointing at an unknown station is not.
    match &record.station_ref {
        Field::Missing => {}
        Field::Null => references.push(("station_id", None)),
        Field::Value(station_ref) => {
            match resolve_parent(record, EntityType::Station, Some(station_ref), stations) {
                Ok(station_id) => {
                    references.push(("station_id", Some(ColumnValue::Int(station_id))))
                }
                Err(reason) => return Ok(skip(record, reason, log)),
            }
        }
    }
    upsert(store, partner, record, references, log).await
}

fn resolve_parent(
    record: &PartnerRecord,
    parent_type: EntityType,
    external_ref: Option<&str>,
    index: &IdentityIndex,
) -> Result<i64, String> {
    let Some(external_ref) = external_ref else {
        return Err(format!("no {parent_type} reference"));
    };
    index.get(external_ref).ok_or_else(|| {
        debug!(
            entity = %record.entity_type,
            external_id = %record.external_id,
            parent = %parent_type,
            parent_ref = external_ref,
            "parent not mapped"
        );
        format!("{parent_type} {external_ref} has not been imported")
    })
}

fn skip(record: &PartnerRecord, reason: String, log: &mut Vec<String>) -> ReconcileOutcome {
    warn!(
        entity = %record.entity_type,
        external_id = %record.external_id,
        reason = %reason,
        "skipping partner record"
    );
    log.push(format!(
        "Skipped {} {}: {}",
        record.entity_type, record.external_id, reason
    ));
    ReconcileOutcome::Skipped { reason }
}

async fn upsert<S: Store + ?Sized>(
    store: &mut S,
    partner: &str,
    record: &PartnerRecord,
    references: Vec<Assignment>,
    log: &mut Vec<String>,
) -> Result<ReconcileOutcome, StoreError> {
    let entity_type = record.entity_type;
    let existing = store
        .resolve(partner, entity_type, &record.external_id)
        .await?;

    match existing {
        Some(id) => {
            let mut row = record.update_assignments();
            row.extend(references);
            let touched = store.update_entity(entity_type, id, &row).await?;
            if touched == 0 {
                return Err(StoreError::NotFound { entity_type, id });
            }
            debug!(entity = %entity_type, external_id = %record.external_id, id, "updated");
            log.push(format!("Updated {} {} (id {})", entity_type, record.external_id, id));
            Ok(ReconcileOutcome::Updated { id })
        }
        None => {
            let mut row = record.insert_assignments();
            row.extend(references);
            let id = store
                .insert_mapped(partner, entity_type, &record.external_id, &row)
                .await?;
            debug!(entity = %entity_type, external_id = %record.external_id, id, "inserted");
            log.push(format!(
                "Inserted new {} {} (id {})",
                entity_type, record.external_id, id
            ));
            Ok(ReconcileOutcome::Inserted { id })
        }
    }
}
