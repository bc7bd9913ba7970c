use camper_adapters::{adapter_for_partner, AdapterContext, AdapterError, PartnerAdapter};
use camper_core::EntityType;
use camper_storage::{FetchError, HttpClientConfig, HttpFetcher, Store, StoreError};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::reconcile::{reconcile_record, ParentIndexes, ReconcileOutcome};
use crate::PartnerRegistry;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("unknown partner {0}")]
    UnknownPartner(String),
    #[error("partner {0} is disabled")]
    PartnerDisabled(String),
    #[error("{partner} does not serve {entity_type} records")]
    UnsupportedEntity {
        partner: String,
        entity_type: EntityType,
    },
    #[error("missing api key for {partner}: env var {env} is not set")]
    MissingCredential { partner: String, env: String },
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of one partner/entity batch. `changes` is in payload order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub run_id: Uuid,
    pub partner: String,
    pub entity_type: EntityType,
    pub inserted: usize,
    pub updated: usize,
    pub skipped: usize,
    pub changes: Vec<String>,
}

impl ImportReport {
    fn new(run_id: Uuid, partner: &str, entity_type: EntityType) -> Self {
        Self {
            run_id,
            partner: partner.to_string(),
            entity_type,
            inserted: 0,
            updated: 0,
            skipped: 0,
            changes: Vec::new(),
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "{} {}: {} inserted, {} updated, {} skipped",
            self.partner, self.entity_type, self.inserted, self.updated, self.skipped
        )
    }
}

pub struct Importer {
    registry: PartnerRegistry,
    http: HttpFetcher,
}

impl Importer {
    pub fn new(registry: PartnerRegistry, http: HttpClientConfig) -> Result<Self, FetchError> {
        Ok(Self {
            registry,
            http: HttpFetcher::new(http)?,
        })
    }

    pub fn registry(&self) -> &PartnerRegistry {
        &self.registry
    }

    /// Fetches one listing from the partner and reconciles it.
    pub async fn import_entity<S: Store + ?Sized>(
        &self,
        store: &mut S,
        partner: &str,
        entity_type: EntityType,
    ) -> Result<ImportReport, ImportError> {
        let adapter = self.adapter(partner)?;
        if !adapter.supports(entity_type) {
            return Err(ImportError::UnsupportedEntity {
                partner: partner.to_string(),
                entity_type,
            });
        }
        self.fetch_and_reconcile(store, adapter.as_ref(), entity_type, Uuid::new_v4())
            .await
    }

    /// Providers, then stations, then campers; the first failure stops the run.
    pub async fn import_partner<S: Store + ?Sized>(
        &self,
        store: &mut S,
        partner: &str,
    ) -> Result<Vec<ImportReport>, ImportError> {
        let adapter = self.adapter(partner)?;
        let run_id = Uuid::new_v4();
        let mut reports = Vec::new();
        for entity_type in EntityType::ALL {
            if !adapter.supports(entity_type) {
                continue;
            }
            let report = self
                .fetch_and_reconcile(store, adapter.as_ref(), entity_type, run_id)
                .await?;
            reports.push(report);
        }
        Ok(reports)
    }

    fn adapter(&self, partner: &str) -> Result<Box<dyn PartnerAdapter>, ImportError> {
        let config = self
            .registry
            .get(partner)
            .ok_or_else(|| ImportError::UnknownPartner(partner.to_string()))?;
        if !config.enabled {
            return Err(ImportError::PartnerDisabled(partner.to_string()));
        }
        adapter_for_partner(partner).ok_or_else(|| ImportError::UnknownPartner(partner.to_string()))
    }

    async fn fetch_and_reconcile<S: Store + ?Sized>(
        &self,
        store: &mut S,
        adapter: &dyn PartnerAdapter,
        entity_type: EntityType,
        run_id: Uuid,
    ) -> Result<ImportReport, ImportError> {
        let partner = adapter.partner();
        let config = self
            .registry
            .get(partner)
            .ok_or_else(|| ImportError::UnknownPartner(partner.to_string()))?;
        let default_path = adapter.default_path(entity_type).unwrap_or_default();
        let target = config.fetch_target(entity_type, default_path)?;

        let ctx = AdapterContext { run_id };
        async move {
            let raw = adapter.fetch(&self.http, &ctx, entity_type, &target).await?;
            reconcile_batch(store, adapter, entity_type, &raw, run_id).await
        }
        .instrument(info_span!("import_run", %run_id, partner, entity = %entity_type))
        .await
    }
}

/// Reconciles an already-fetched partner payload, e.g. a saved response file.
pub async fn import_payload<S: Store + ?Sized>(
    store: &mut S,
    adapter: &dyn PartnerAdapter,
    entity_type: EntityType,
    payload: JsonValue,
    run_id: Uuid,
) -> Result<ImportReport, ImportError> {
    let partner = adapter.partner();
    async move {
        let raw = adapter.extract_records(entity_type, payload)?;
        reconcile_batch(store, adapter, entity_type, &raw, run_id).await
    }
    .instrument(info_span!("import_run", %run_id, partner, entity = %entity_type, source = "payload"))
    .await
}

async fn reconcile_batch<S: Store + ?Sized>(
    store: &mut S,
    adapter: &dyn PartnerAdapter,
    entity_type: EntityType,
    raw: &[JsonValue],
    run_id: Uuid,
) -> Result<ImportReport, ImportError> {
    let partner = adapter.partner();
    let records = adapter.normalize_all(entity_type, raw)?;
    let parents = ParentIndexes::load_for(store, partner, entity_type).await?;

    let mut report = ImportReport::new(run_id, partner, entity_type);
    for record in &records {
        match reconcile_record(store, partner, record, &parents, &mut report.changes).await? {
            ReconcileOutcome::Inserted { .. } => report.inserted += 1,
            ReconcileOutcome::Updated { .. } => report.updated += 1,
            ReconcileOutcome::Skipped { .. } => report.skipped += 1,
        }
    }

    info!(
        records = records.len(),
        inserted = report.inserted,
        updated = report.updated,
        skipped = report.skipped,
        "partner batch reconciled"
    );
    Ok(report)
}
