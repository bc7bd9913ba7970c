use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use camper_adapters::{adapter_for_partner, AdapterError};
use camper_core::{Assignment, ColumnValue, EntityType};
use camper_storage::{
    EntityRow, EntityStore, FetchError, HttpClientConfig, MappingStore, MemoryStore,
    PartnerMapping, Store, StoreError, UserDirectory, UserRecord,
};
use camper_sync::{import_payload, ImportError, Importer, PartnerConfig, PartnerRegistry};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;
use uuid::Uuid;

const CU_PROVIDERS: &str = include_str!("../../../fixtures/cu-camper/providers.json");
const CU_STATIONS: &str = include_str!("../../../fixtures/cu-camper/stations.json");
const CU_CAMPERS: &str = include_str!("../../../fixtures/cu-camper/campers.json");
const RCM_PROVIDERS: &str = include_str!("../../../fixtures/rcm/providers.json");

#[derive(Clone, Default)]
struct MockPartner {
    responses: Arc<Mutex<HashMap<String, (StatusCode, String)>>>,
}

impl MockPartner {
    fn respond(&self, path: &str, status: StatusCode, body: impl Into<String>) {
        self.responses
            .lock()
            .unwrap()
            .insert(path.to_string(), (status, body.into()));
    }

    fn cu_camper_fixtures() -> Self {
        let mock = Self::default();
        mock.respond("/rental-companies", StatusCode::OK, CU_PROVIDERS);
        mock.respond("/stations", StatusCode::OK, CU_STATIONS);
        mock.respond("/campers", StatusCode::OK, CU_CAMPERS);
        mock
    }

    async fn spawn(&self) -> String {
        let router = Router::new().fallback(serve_mock).with_state(self.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }
}

async fn serve_mock(State(mock): State<MockPartner>, uri: Uri) -> Response {
    let responses = mock.responses.lock().unwrap();
    match responses.get(uri.path()) {
        Some((status, body)) => {
            (*status, [(CONTENT_TYPE, "application/json")], body.clone()).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn registry(partner: &str, base_url: &str, enabled: bool) -> PartnerRegistry {
    PartnerRegistry {
        partners: vec![PartnerConfig {
            partner_name: partner.to_string(),
            display_name: partner.to_uppercase(),
            enabled,
            base_url: base_url.to_string(),
            api_key_env: None,
            api_key_header: None,
            paths: BTreeMap::new(),
            notes: None,
        }],
    }
}

fn importer(partner: &str, base_url: &str) -> Importer {
    Importer::new(registry(partner, base_url, true), HttpClientConfig::default()).unwrap()
}

/// Records every `import_run` span opened and which of them each event ran under.
#[derive(Clone, Default)]
struct ImportRunSpans {
    opened: Arc<Mutex<Vec<u64>>>,
    events: Arc<Mutex<Vec<(String, Option<u64>)>>>,
}

struct MessageVisitor(String);

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

impl<S> Layer<S> for ImportRunSpans
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, _ctx: Context<'_, S>) {
        if attrs.metadata().name() == "import_run" {
            self.opened.lock().unwrap().push(id.into_u64());
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let mut message = MessageVisitor(String::new());
        event.record(&mut message);
        let run_span = ctx.event_scope(event).and_then(|scope| {
            scope
                .into_iter()
                .find(|span| span.name() == "import_run")
                .map(|span| span.id().into_u64())
        });
        self.events.lock().unwrap().push((message.0, run_span));
    }
}

impl ImportRunSpans {
    fn span_of(&self, message: &str) -> Option<u64> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .find(|(m, _)| m == message)
            .and_then(|(_, span)| *span)
    }
}

fn text(value: &str) -> Option<ColumnValue> {
    Some(ColumnValue::Text(value.to_string()))
}

#[tokio::test]
async fn full_partner_import_links_children_to_parents() {
    let base = MockPartner::cu_camper_fixtures().spawn().await;
    let importer = importer("cu-camper", &base);
    let mut store = MemoryStore::new();

    let reports = importer.import_partner(&mut store, "cu-camper").await.unwrap();
    let order = reports.iter().map(|r| r.entity_type).collect::<Vec<_>>();
    assert_eq!(order, EntityType::ALL.to_vec());
    for report in &reports {
        assert_eq!((report.inserted, report.updated, report.skipped), (2, 0, 0), "{}", report.summary());
    }
    assert_eq!(reports[0].changes[0], "Inserted new provider 42 (id 1)");
    assert_eq!(reports[0].run_id, reports[2].run_id);

    assert_eq!(store.count_entities(EntityType::Provider).await.unwrap(), 2);
    assert_eq!(store.count_entities(EntityType::Station).await.unwrap(), 2);
    assert_eq!(store.count_entities(EntityType::Camper).await.unwrap(), 2);
    assert_eq!(store.all_mappings().await.len(), 6);

    let acme = store.resolve("cu-camper", EntityType::Provider, "42").await.unwrap().unwrap();
    let berlin = store.resolve("cu-camper", EntityType::Station, "S-100").await.unwrap().unwrap();
    let c1 = store.resolve("cu-camper", EntityType::Camper, "C-1").await.unwrap().unwrap();
    let row = store.fetch_entity(EntityType::Camper, c1).await.unwrap().unwrap();
    assert_eq!(row["provider_id"], Some(ColumnValue::Int(acme)));
    assert_eq!(row["station_id"], Some(ColumnValue::Int(berlin)));
    assert_eq!(row["seats"], Some(ColumnValue::Int(4)));
    assert_eq!(row["has_shower"], Some(ColumnValue::Bool(false)));

    let c2 = store.resolve("cu-camper", EntityType::Camper, "C-2").await.unwrap().unwrap();
    let row = store.fetch_entity(EntityType::Camper, c2).await.unwrap().unwrap();
    assert_eq!(row["station_id"], None);
}

#[tokio::test]
async fn second_import_updates_in_place() {
    let mock = MockPartner::cu_camper_fixtures();
    let base = mock.spawn().await;
    let importer = importer("cu-camper", &base);
    let mut store = MemoryStore::new();

    importer.import_partner(&mut store, "cu-camper").await.unwrap();
    let before = store.rows(EntityType::Provider).await;

    mock.respond(
        "/rental-companies",
        StatusCode::OK,
        json!({ "data": [{ "id": 42, "name": "Acme Campers" }] }).to_string(),
    );
    let report = importer
        .import_entity(&mut store, "cu-camper", EntityType::Provider)
        .await
        .unwrap();
    assert_eq!((report.inserted, report.updated), (0, 1));
    assert_eq!(report.changes, vec!["Updated provider 42 (id 1)".to_string()]);

    let after = store.rows(EntityType::Provider).await;
    assert_eq!(after.len(), before.len());
    assert_eq!(after[0]["company_name"], text("Acme Campers"));
    // Untouched columns survive the partial payload.
    assert_eq!(after[0]["city"], before[0]["city"]);
    assert_eq!(store.all_mappings().await.len(), 6);
}

#[tokio::test]
async fn explicit_null_station_clears_the_link_on_reimport() {
    let mock = MockPartner::cu_camper_fixtures();
    let base = mock.spawn().await;
    let importer = importer("cu-camper", &base);
    let mut store = MemoryStore::new();

    importer.import_partner(&mut store, "cu-camper").await.unwrap();
    let c1 = store.resolve("cu-camper", EntityType::Camper, "C-1").await.unwrap().unwrap();
    let row = store.fetch_entity(EntityType::Camper, c1).await.unwrap().unwrap();
    assert!(row["station_id"].is_some());

    mock.respond(
        "/campers",
        StatusCode::OK,
        json!({ "data": [{ "id": "C-1", "rental_company_id": "42", "station_id": null }] })
            .to_string(),
    );
    let report = importer
        .import_entity(&mut store, "cu-camper", EntityType::Camper)
        .await
        .unwrap();
    assert_eq!((report.inserted, report.updated, report.skipped), (0, 1, 0));
    assert_eq!(report.changes, vec![format!("Updated camper C-1 (id {c1})")]);

    let row = store.fetch_entity(EntityType::Camper, c1).await.unwrap().unwrap();
    assert_eq!(row["station_id"], None);
    assert_eq!(row["seats"], Some(ColumnValue::Int(4)));
    assert_eq!(store.count_entities(EntityType::Camper).await.unwrap(), 2);
}

#[tokio::test]
async fn fetch_and_reconcile_share_one_import_run_span() {
    let spans = ImportRunSpans::default();
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(spans.clone()));

    let base = MockPartner::cu_camper_fixtures().spawn().await;
    let importer = importer("cu-camper", &base);
    let mut store = MemoryStore::new();
    importer
        .import_entity(&mut store, "cu-camper", EntityType::Provider)
        .await
        .unwrap();

    let opened = spans.opened.lock().unwrap().clone();
    assert_eq!(opened.len(), 1);
    let run_span = Some(opened[0]);
    assert_eq!(spans.span_of("partner response received"), run_span);
    assert_eq!(spans.span_of("partner batch reconciled"), run_span);
}

#[tokio::test]
async fn rerunning_an_unchanged_feed_changes_nothing() {
    let base = MockPartner::cu_camper_fixtures().spawn().await;
    let importer = importer("cu-camper", &base);
    let mut store = MemoryStore::new();

    importer.import_partner(&mut store, "cu-camper").await.unwrap();
    let snapshot = (
        store.rows(EntityType::Provider).await,
        store.rows(EntityType::Station).await,
        store.rows(EntityType::Camper).await,
        store.all_mappings().await,
    );

    let reports = importer.import_partner(&mut store, "cu-camper").await.unwrap();
    assert!(reports.iter().all(|r| r.inserted == 0 && r.updated == 2));
    assert_eq!(
        snapshot,
        (
            store.rows(EntityType::Provider).await,
            store.rows(EntityType::Station).await,
            store.rows(EntityType::Camper).await,
            store.all_mappings().await,
        )
    );
}

#[tokio::test]
async fn stations_before_providers_are_skipped() {
    let base = MockPartner::cu_camper_fixtures().spawn().await;
    let importer = importer("cu-camper", &base);
    let mut store = MemoryStore::new();

    let report = importer
        .import_entity(&mut store, "cu-camper", EntityType::Station)
        .await
        .unwrap();
    assert_eq!((report.inserted, report.skipped), (0, 2));
    assert_eq!(
        report.changes[0],
        "Skipped station S-100: provider 42 has not been imported"
    );
    assert_eq!(store.count_entities(EntityType::Station).await.unwrap(), 0);
    assert!(store.all_mappings().await.is_empty());
}

#[tokio::test]
async fn partner_failure_aborts_before_any_write() {
    let mock = MockPartner::default();
    mock.respond("/rental-companies", StatusCode::BAD_GATEWAY, "{}");
    let base = mock.spawn().await;
    let importer = importer("cu-camper", &base);
    let mut store = MemoryStore::new();

    let err = importer
        .import_entity(&mut store, "cu-camper", EntityType::Provider)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ImportError::Adapter(AdapterError::Fetch(FetchError::HttpStatus { status: 502, .. }))
    ));
    assert_eq!(store.count_entities(EntityType::Provider).await.unwrap(), 0);
}

#[tokio::test]
async fn malformed_record_fails_the_page_before_any_write() {
    let mock = MockPartner::default();
    mock.respond(
        "/rental-companies",
        StatusCode::OK,
        json!({ "data": [
            { "id": 1, "name": "Fine" },
            { "id": 2, "name": "Broken", "latitude": "north-ish" }
        ]})
        .to_string(),
    );
    let base = mock.spawn().await;
    let importer = importer("cu-camper", &base);
    let mut store = MemoryStore::new();

    let err = importer
        .import_entity(&mut store, "cu-camper", EntityType::Provider)
        .await
        .unwrap_err();
    assert!(matches!(err, ImportError::Adapter(AdapterError::InvalidField { .. })));
    assert_eq!(store.count_entities(EntityType::Provider).await.unwrap(), 0);
}

#[tokio::test]
async fn unknown_and_disabled_partners_are_refused() {
    let importer = Importer::new(
        registry("jucy", "http://127.0.0.1:9", false),
        HttpClientConfig::default(),
    )
    .unwrap();
    let mut store = MemoryStore::new();

    let err = importer.import_partner(&mut store, "nope").await.unwrap_err();
    assert!(matches!(err, ImportError::UnknownPartner(_)));

    let err = importer.import_partner(&mut store, "jucy").await.unwrap_err();
    assert!(matches!(err, ImportError::PartnerDisabled(_)));
}

#[tokio::test]
async fn saved_payloads_import_without_fetching() {
    let adapter = adapter_for_partner("rcm").unwrap();
    let payload = serde_json::from_str(RCM_PROVIDERS).unwrap();
    let mut store = MemoryStore::new();

    let report = import_payload(&mut store, adapter.as_ref(), EntityType::Provider, payload, Uuid::new_v4())
        .await
        .unwrap();
    assert_eq!(report.inserted, 1);

    let id = store.resolve("rcm", EntityType::Provider, "7").await.unwrap().unwrap();
    let row = store.fetch_entity(EntityType::Provider, id).await.unwrap().unwrap();
    assert_eq!(row["company_name"], text("Southern Campers"));
}

/// Delegates to a `MemoryStore` but fails every insert after the first `budget`.
struct FlakyStore {
    inner: MemoryStore,
    budget: usize,
}

impl FlakyStore {
    fn spend(&mut self) -> Result<(), StoreError> {
        if self.budget == 0 {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        self.budget -= 1;
        Ok(())
    }
}

#[async_trait]
impl MappingStore for FlakyStore {
    async fn resolve(&mut self, partner: &str, entity_type: EntityType, external_id: &str) -> Result<Option<i64>, StoreError> {
        self.inner.resolve(partner, entity_type, external_id).await
    }

    async fn register(&mut self, partner: &str, entity_type: EntityType, internal_id: i64, external_id: &str) -> Result<(), StoreError> {
        self.inner.register(partner, entity_type, internal_id, external_id).await
    }

    async fn mappings_for(&mut self, partner: &str, entity_type: EntityType) -> Result<Vec<PartnerMapping>, StoreError> {
        self.inner.mappings_for(partner, entity_type).await
    }
}

#[async_trait]
impl EntityStore for FlakyStore {
    async fn insert_entity(&mut self, entity_type: EntityType, row: &[Assignment]) -> Result<i64, StoreError> {
        self.spend()?;
        self.inner.insert_entity(entity_type, row).await
    }

    async fn update_entity(&mut self, entity_type: EntityType, id: i64, row: &[Assignment]) -> Result<u64, StoreError> {
        self.inner.update_entity(entity_type, id, row).await
    }

    async fn fetch_entity(&mut self, entity_type: EntityType, id: i64) -> Result<Option<EntityRow>, StoreError> {
        self.inner.fetch_entity(entity_type, id).await
    }

    async fn count_entities(&mut self, entity_type: EntityType) -> Result<i64, StoreError> {
        self.inner.count_entities(entity_type).await
    }
}

#[async_trait]
impl UserDirectory for FlakyStore {
    async fn find_user(&mut self, id: i64) -> Result<Option<UserRecord>, StoreError> {
        self.inner.find_user(id).await
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn insert_mapped(&mut self, partner: &str, entity_type: EntityType, external_id: &str, row: &[Assignment]) -> Result<i64, StoreError> {
        self.spend()?;
        self.inner.insert_mapped(partner, entity_type, external_id, row).await
    }
}

#[tokio::test]
async fn store_failure_mid_batch_keeps_earlier_records() {
    let base = MockPartner::cu_camper_fixtures().spawn().await;
    let importer = importer("cu-camper", &base);
    let inner = MemoryStore::new();
    let mut store = FlakyStore {
        inner: inner.clone(),
        budget: 1,
    };

    let err = importer
        .import_entity(&mut store, "cu-camper", EntityType::Provider)
        .await
        .unwrap_err();
    assert!(matches!(err, ImportError::Store(StoreError::Database(_))));

    // The first provider was committed together with its mapping; the second never started.
    assert_eq!(inner.rows(EntityType::Provider).await.len(), 1);
    let mappings = inner.all_mappings().await;
    assert_eq!(mappings.len(), 1);
    assert_eq!(mappings[0].external_id, "42");
}
