//! Partner adapter contracts + the CU Camper, Jucy and Rental Car Manager adapters.
//!
//! An adapter knows where a partner serves each entity type, how its JSON
//! envelope is shaped, and how its field names map onto local columns. It
//! turns raw partner JSON into [`PartnerRecord`]s; it never touches the store.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use camper_core::{coerce, CoerceError, EntityType, Field, PartnerRecord};
use camper_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "camper-adapters";

pub const CU_CAMPER: &str = "cu-camper";
pub const JUCY: &str = "jucy";
pub const RENTAL_CAR_MANAGER: &str = "rcm";

pub const KNOWN_PARTNERS: [&str; 3] = [CU_CAMPER, JUCY, RENTAL_CAR_MANAGER];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
}

/// Where to GET one entity listing and which credentials to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTarget {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{partner} does not serve {entity_type} records")]
    Unsupported {
        partner: String,
        entity_type: EntityType,
    },
    #[error("unexpected {partner} {entity_type} payload: {detail}")]
    UnexpectedPayload {
        partner: String,
        entity_type: EntityType,
        detail: String,
    },
    #[error("{partner} {entity_type} record #{index} has no external id")]
    MissingExternalId {
        partner: String,
        entity_type: EntityType,
        index: usize,
    },
    #[error("{partner} {entity_type} {external_id}: field {field}: {source}")]
    InvalidField {
        partner: String,
        entity_type: EntityType,
        external_id: String,
        field: String,
        #[source]
        source: CoerceError,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

#[async_trait]
pub trait PartnerAdapter: Send + Sync {
    fn partner(&self) -> &'static str;

    fn supports(&self, entity_type: EntityType) -> bool;

    /// Path below the partner base url serving `entity_type`.
    fn default_path(&self, entity_type: EntityType) -> Option<&'static str>;

    /// Unwraps the partner's response envelope into individual raw records.
    fn extract_records(
        &self,
        entity_type: EntityType,
        payload: JsonValue,
    ) -> Result<Vec<JsonValue>, AdapterError>;

    /// Converts one raw record; `index` is its position in the payload.
    fn normalize(
        &self,
        entity_type: EntityType,
        index: usize,
        raw: &JsonValue,
    ) -> Result<PartnerRecord, AdapterError>;

    async fn fetch(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
        entity_type: EntityType,
        target: &FetchTarget,
    ) -> Result<Vec<JsonValue>, AdapterError> {
        if !self.supports(entity_type) {
            return Err(AdapterError::Unsupported {
                partner: self.partner().to_string(),
                entity_type,
            });
        }
        let payload = http
            .fetch_json(ctx.run_id, self.partner(), &target.url, &target.headers)
            .await?;
        self.extract_records(entity_type, payload)
    }

    /// Normalizes a whole page up front so a malformed record fails before any write.
    fn normalize_all(
        &self,
        entity_type: EntityType,
        raw: &[JsonValue],
    ) -> Result<Vec<PartnerRecord>, AdapterError> {
        raw.iter()
            .enumerate()
            .map(|(index, record)| self.normalize(entity_type, index, record))
            .collect()
    }
}

/// Maps one partner key (dot-separated for nested objects) onto a local column.
#[derive(Debug, Clone, Copy)]
struct FieldMap {
    key: &'static str,
    column: &'static str,
}

const fn map(key: &'static str, column: &'static str) -> FieldMap {
    FieldMap { key, column }
}

#[derive(Debug, Clone, Copy)]
struct EntityMap {
    entity_type: EntityType,
    path: &'static str,
    id_key: &'static str,
    provider_ref_key: Option<&'static str>,
    station_ref_key: Option<&'static str>,
    fields: &'static [FieldMap],
}

/// Adapter driven entirely by static field tables.
#[derive(Debug, Clone, Copy)]
struct FieldMapAdapter {
    partner: &'static str,
    envelope_key: &'static str,
    entities: &'static [EntityMap],
}

impl FieldMapAdapter {
    fn entity_map(&self, entity_type: EntityType) -> Result<&EntityMap, AdapterError> {
        self.entities
            .iter()
            .find(|e| e.entity_type == entity_type)
            .ok_or_else(|| AdapterError::Unsupported {
                partner: self.partner.to_string(),
                entity_type,
            })
    }

    fn unexpected(&self, entity_type: EntityType, detail: impl Into<String>) -> AdapterError {
        AdapterError::UnexpectedPayload {
            partner: self.partner.to_string(),
            entity_type,
            detail: detail.into(),
        }
    }
}

#[async_trait]
impl PartnerAdapter for FieldMapAdapter {
    fn partner(&self) -> &'static str {
        self.partner
    }

    fn supports(&self, entity_type: EntityType) -> bool {
        self.entities.iter().any(|e| e.entity_type == entity_type)
    }

    fn default_path(&self, entity_type: EntityType) -> Option<&'static str> {
        self.entity_map(entity_type).ok().map(|e| e.path)
    }

    fn extract_records(
        &self,
        entity_type: EntityType,
        payload: JsonValue,
    ) -> Result<Vec<JsonValue>, AdapterError> {
        self.entity_map(entity_type)?;
        let inner = match payload {
            JsonValue::Object(mut obj) => match obj.remove(self.envelope_key) {
                Some(inner) => inner,
                None => JsonValue::Object(obj),
            },
            other => other,
        };
        match inner {
            JsonValue::Array(items) => {
                if let Some(pos) = items.iter().position(|item| !item.is_object()) {
                    return Err(self.unexpected(entity_type, format!("record #{pos} is not an object")));
                }
                Ok(items)
            }
            JsonValue::Object(obj) => Ok(vec![JsonValue::Object(obj)]),
            JsonValue::Null => Ok(Vec::new()),
            other => Err(self.unexpected(entity_type, format!("expected object or array, got {other}"))),
        }
    }

    fn normalize(
        &self,
        entity_type: EntityType,
        index: usize,
        raw: &JsonValue,
    ) -> Result<PartnerRecord, AdapterError> {
        let spec = self.entity_map(entity_type)?;
        let external_id = json_identifier(raw, spec.id_key).ok_or_else(|| {
            AdapterError::MissingExternalId {
                partner: self.partner.to_string(),
                entity_type,
                index,
            }
        })?;

        let mut record = PartnerRecord::new(entity_type, external_id);
        record.provider_ref = spec.provider_ref_key.and_then(|key| json_identifier(raw, key));
        record.station_ref = spec
            .station_ref_key
            .map_or(Field::Missing, |key| json_reference(raw, key));

        for field in spec.fields {
            let Some(kind) = entity_type.column_kind(field.column) else {
                continue;
            };
            let value = coerce(kind, json_path(raw, field.key)).map_err(|source| {
                AdapterError::InvalidField {
                    partner: self.partner.to_string(),
                    entity_type,
                    external_id: record.external_id.clone(),
                    field: field.key.to_string(),
                    source,
                }
            })?;
            record.set(field.column, value);
        }

        debug!(
            partner = self.partner,
            entity = %entity_type,
            external_id = %record.external_id,
            fields = record.fields.len(),
            "normalized partner record"
        );
        Ok(record)
    }
}

fn json_path<'a>(value: &'a JsonValue, path: &str) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path.split('.') {
        cur = cur.get(segment)?;
    }
    Some(cur)
}

/// Like [`json_identifier`], but keeps an explicit `null` (or empty string) apart from an absent key.
fn json_reference(value: &JsonValue, path: &str) -> Field<String> {
    match json_path(value, path) {
        None => Field::Missing,
        Some(JsonValue::Null) => Field::Null,
        Some(JsonValue::String(_) | JsonValue::Number(_)) => {
            json_identifier(value, path).map_or(Field::Null, Field::Value)
        }
        Some(_) => Field::Missing,
    }
}

/// Partner ids arrive as strings or numbers; both become trimmed strings.
fn json_identifier(value: &JsonValue, path: &str) -> Option<String> {
    let id = match json_path(value, path)? {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        _ => return None,
    };
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

const CU_CAMPER_ENTITIES: &[EntityMap] = &[
    EntityMap {
        entity_type: EntityType::Provider,
        path: "/rental-companies",
        id_key: "id",
        provider_ref_key: None,
        station_ref_key: None,
        fields: &[
            map("name", "company_name"),
            map("email", "email"),
            map("phone", "phone"),
            map("website", "website"),
            map("street", "street"),
            map("city", "city"),
            map("zip", "zip"),
            map("country", "country"),
            map("latitude", "latitude"),
            map("longitude", "longitude"),
            map("description", "description"),
            map("active", "is_active"),
        ],
    },
    EntityMap {
        entity_type: EntityType::Station,
        path: "/stations",
        id_key: "id",
        provider_ref_key: Some("rental_company_id"),
        station_ref_key: None,
        fields: &[
            map("name", "name"),
            map("email", "email"),
            map("phone", "phone"),
            map("street", "street"),
            map("city", "city"),
            map("zip", "zip"),
            map("country", "country"),
            map("latitude", "latitude"),
            map("longitude", "longitude"),
            map("opening_hours", "opening_hours"),
            map("active", "is_active"),
        ],
    },
    EntityMap {
        entity_type: EntityType::Camper,
        path: "/campers",
        id_key: "id",
        provider_ref_key: Some("rental_company_id"),
        station_ref_key: Some("station_id"),
        fields: &[
            map("name", "name"),
            map("brand", "brand"),
            map("model", "model"),
            map("category", "category"),
            map("seats", "seats"),
            map("beds", "beds"),
            map("length", "length_cm"),
            map("transmission", "transmission"),
            map("fuel", "fuel_type"),
            map("toilet", "has_toilet"),
            map("shower", "has_shower"),
            map("kitchen", "has_kitchen"),
            map("air_condition", "has_air_conditioning"),
            map("pets_allowed", "pets_allowed"),
            map("min_driver_age", "min_driver_age"),
            map("description", "description"),
            map("active", "is_active"),
        ],
    },
];

const JUCY_ENTITIES: &[EntityMap] = &[
    EntityMap {
        entity_type: EntityType::Provider,
        path: "/companies",
        id_key: "companyId",
        provider_ref_key: None,
        station_ref_key: None,
        fields: &[
            map("companyName", "company_name"),
            map("contactEmail", "email"),
            map("contactPhone", "phone"),
            map("websiteUrl", "website"),
            map("address.street", "street"),
            map("address.city", "city"),
            map("address.postcode", "zip"),
            map("address.countryCode", "country"),
            map("address.lat", "latitude"),
            map("address.lng", "longitude"),
            map("about", "description"),
            map("isActive", "is_active"),
        ],
    },
    EntityMap {
        entity_type: EntityType::Station,
        path: "/sites",
        id_key: "siteId",
        provider_ref_key: Some("companyId"),
        station_ref_key: None,
        fields: &[
            map("siteName", "name"),
            map("email", "email"),
            map("phone", "phone"),
            map("address.street", "street"),
            map("address.city", "city"),
            map("address.postcode", "zip"),
            map("address.countryCode", "country"),
            map("address.lat", "latitude"),
            map("address.lng", "longitude"),
            map("openingHours", "opening_hours"),
            map("isActive", "is_active"),
        ],
    },
    EntityMap {
        entity_type: EntityType::Camper,
        path: "/vehicles",
        id_key: "vehicleCode",
        provider_ref_key: Some("companyId"),
        station_ref_key: Some("homeSiteId"),
        fields: &[
            map("displayName", "name"),
            map("make", "brand"),
            map("model", "model"),
            map("vehicleClass", "category"),
            map("seatbelts", "seats"),
            map("sleeps", "beds"),
            map("lengthCm", "length_cm"),
            map("transmission", "transmission"),
            map("fuelType", "fuel_type"),
            map("features.toilet", "has_toilet"),
            map("features.shower", "has_shower"),
            map("features.kitchen", "has_kitchen"),
            map("features.airConditioning", "has_air_conditioning"),
            map("features.petFriendly", "pets_allowed"),
            map("minimumDriverAge", "min_driver_age"),
            map("description", "description"),
            map("isActive", "is_active"),
        ],
    },
];

const RCM_ENTITIES: &[EntityMap] = &[
    EntityMap {
        entity_type: EntityType::Provider,
        path: "/company",
        id_key: "companyid",
        provider_ref_key: None,
        station_ref_key: None,
        fields: &[
            map("companyname", "company_name"),
            map("email", "email"),
            map("phone", "phone"),
            map("website", "website"),
            map("address", "street"),
            map("city", "city"),
            map("postcode", "zip"),
            map("country", "country"),
            map("latitude", "latitude"),
            map("longitude", "longitude"),
            map("notes", "description"),
            map("active", "is_active"),
        ],
    },
    EntityMap {
        entity_type: EntityType::Station,
        path: "/locations",
        id_key: "id",
        provider_ref_key: Some("companyid"),
        station_ref_key: None,
        fields: &[
            map("location", "name"),
            map("email", "email"),
            map("phone", "phone"),
            map("address", "street"),
            map("city", "city"),
            map("postcode", "zip"),
            map("country", "country"),
            map("latitude", "latitude"),
            map("longitude", "longitude"),
            map("officehours", "opening_hours"),
            map("active", "is_active"),
        ],
    },
    EntityMap {
        entity_type: EntityType::Camper,
        path: "/vehiclecategories",
        id_key: "id",
        provider_ref_key: Some("companyid"),
        station_ref_key: Some("locationid"),
        fields: &[
            map("vehiclecategory", "name"),
            map("make", "brand"),
            map("model", "model"),
            map("categorytype", "category"),
            map("numberofadults", "seats"),
            map("numberofbeds", "beds"),
            map("lengthcm", "length_cm"),
            map("transmission", "transmission"),
            map("fueltype", "fuel_type"),
            map("hastoilet", "has_toilet"),
            map("hasshower", "has_shower"),
            map("haskitchen", "has_kitchen"),
            map("hasaircon", "has_air_conditioning"),
            map("petsallowed", "pets_allowed"),
            map("minimumage", "min_driver_age"),
            map("description", "description"),
            map("active", "is_active"),
        ],
    },
];

pub fn cu_camper_adapter() -> impl PartnerAdapter {
    FieldMapAdapter {
        partner: CU_CAMPER,
        envelope_key: "data",
        entities: CU_CAMPER_ENTITIES,
    }
}

pub fn jucy_adapter() -> impl PartnerAdapter {
    FieldMapAdapter {
        partner: JUCY,
        envelope_key: "items",
        entities: JUCY_ENTITIES,
    }
}

pub fn rental_car_manager_adapter() -> impl PartnerAdapter {
    FieldMapAdapter {
        partner: RENTAL_CAR_MANAGER,
        envelope_key: "results",
        entities: RCM_ENTITIES,
    }
}

pub fn adapter_for_partner(partner: &str) -> Option<Box<dyn PartnerAdapter>> {
    match partner {
        CU_CAMPER => Some(Box::new(cu_camper_adapter())),
        JUCY => Some(Box::new(jucy_adapter())),
        RENTAL_CAR_MANAGER => Some(Box::new(rental_car_manager_adapter())),
        _ => None,
    }
}

/// Reads a saved partner response, e.g. for manual imports.
pub fn load_payload_file(path: impl AsRef<Path>) -> Result<JsonValue> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use camper_core::{ColumnValue, Field};
    use serde_json::json;
    use std::path::PathBuf;

    fn fixture_path(partner: &str, file: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures")
            .join(partner)
            .join(file)
    }

    fn text(record: &PartnerRecord, column: &str) -> Option<String> {
        match record.fields.get(column)?.value()? {
            ColumnValue::Text(s) => Some(s.clone()),
            _ => None,
        }
    }

    fn load(adapter: &dyn PartnerAdapter, entity_type: EntityType, file: &str) -> Vec<PartnerRecord> {
        let payload = load_payload_file(fixture_path(adapter.partner(), file)).unwrap();
        let raw = adapter.extract_records(entity_type, payload).unwrap();
        adapter.normalize_all(entity_type, &raw).unwrap()
    }

    #[test]
    fn every_mapped_column_is_allow_listed() {
        for entities in [CU_CAMPER_ENTITIES, JUCY_ENTITIES, RCM_ENTITIES] {
            for entity in entities {
                for field in entity.fields {
                    assert!(
                        entity
                            .entity_type
                            .payload_columns()
                            .iter()
                            .any(|c| c.name == field.column),
                        "{} is not a {} column",
                        field.column,
                        entity.entity_type
                    );
                }
            }
        }
    }

    #[test]
    fn cu_camper_providers_fixture() {
        let adapter = cu_camper_adapter();
        let records = load(&adapter, EntityType::Provider, "providers.json");
        assert_eq!(records.len(), 2);

        let acme = &records[0];
        assert_eq!(acme.external_id, "42");
        assert_eq!(text(acme, "company_name").as_deref(), Some("Acme RV"));
        assert_eq!(
            acme.fields.get("is_active"),
            Some(&Field::Value(ColumnValue::Bool(true)))
        );
        assert_eq!(
            acme.fields.get("latitude"),
            Some(&Field::Value(ColumnValue::Float(52.52)))
        );
        // "website" is absent from the payload and must stay absent.
        assert!(!acme.fields.contains_key("website"));
    }

    #[test]
    fn cu_camper_campers_carry_parent_references() {
        let adapter = cu_camper_adapter();
        let records = load(&adapter, EntityType::Camper, "campers.json");
        let first = &records[0];
        assert_eq!(first.provider_ref.as_deref(), Some("42"));
        assert_eq!(first.station_ref.value().map(String::as_str), Some("S-100"));
        assert_eq!(first.fields.get("seats"), Some(&Field::Value(ColumnValue::Int(4))));
        assert_eq!(
            first.fields.get("has_shower"),
            Some(&Field::Value(ColumnValue::Bool(false)))
        );
    }

    #[test]
    fn jucy_nested_fields_are_flattened() {
        let adapter = jucy_adapter();
        let records = load(&adapter, EntityType::Station, "stations.json");
        let site = &records[0];
        assert_eq!(site.external_id, "AKL");
        assert_eq!(site.provider_ref.as_deref(), Some("JUCY-NZ"));
        assert_eq!(text(site, "city").as_deref(), Some("Auckland"));
        assert_eq!(text(site, "country").as_deref(), Some("NZ"));

        let campers = load(&adapter, EntityType::Camper, "campers.json");
        assert_eq!(
            campers[0].fields.get("pets_allowed"),
            Some(&Field::Value(ColumnValue::Bool(false)))
        );
        assert_eq!(campers[0].station_ref.value().map(String::as_str), Some("AKL"));
        assert!(campers[1].station_ref.is_missing());
    }

    #[test]
    fn rcm_single_company_object_is_one_record() {
        let adapter = rental_car_manager_adapter();
        let records = load(&adapter, EntityType::Provider, "providers.json");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].external_id, "7");
        assert_eq!(text(&records[0], "company_name").as_deref(), Some("Southern Campers"));
    }

    #[test]
    fn explicit_nulls_and_empty_strings_are_kept_as_nulls() {
        let adapter = cu_camper_adapter();
        let record = adapter
            .normalize(
                EntityType::Provider,
                0,
                &json!({"id": 42, "name": "Acme RV", "phone": null, "email": ""}),
            )
            .unwrap();
        assert_eq!(record.external_id, "42");
        assert_eq!(record.fields.get("phone"), Some(&Field::Null));
        assert_eq!(record.fields.get("email"), Some(&Field::Null));
        assert!(!record.fields.contains_key("city"));
    }

    #[test]
    fn explicit_null_station_is_distinct_from_an_absent_one() {
        let adapter = cu_camper_adapter();
        let unlinked = adapter
            .normalize(
                EntityType::Camper,
                0,
                &json!({"id": "C-1", "rental_company_id": "42", "station_id": null}),
            )
            .unwrap();
        assert_eq!(unlinked.station_ref, Field::Null);

        let blank = adapter
            .normalize(
                EntityType::Camper,
                0,
                &json!({"id": "C-1", "rental_company_id": "42", "station_id": " "}),
            )
            .unwrap();
        assert_eq!(blank.station_ref, Field::Null);

        let absent = adapter
            .normalize(EntityType::Camper, 0, &json!({"id": "C-1", "rental_company_id": "42"}))
            .unwrap();
        assert!(absent.station_ref.is_missing());
    }

    #[test]
    fn malformed_values_fail_the_page() {
        let adapter = cu_camper_adapter();
        let raw = vec![
            json!({"id": "1", "name": "Fine", "seats": "4", "rental_company_id": "42"}),
            json!({"id": "2", "name": "Broken", "seats": "four", "rental_company_id": "42"}),
        ];
        let err = adapter.normalize_all(EntityType::Camper, &raw).unwrap_err();
        assert!(matches!(
            err,
            AdapterError::InvalidField { ref external_id, ref field, .. } if external_id == "2" && field == "seats"
        ));
    }

    #[test]
    fn records_without_ids_are_rejected() {
        let adapter = jucy_adapter();
        let err = adapter
            .normalize(EntityType::Camper, 3, &json!({"displayName": "Nameless"}))
            .unwrap_err();
        assert!(matches!(err, AdapterError::MissingExternalId { index: 3, .. }));
    }

    #[test]
    fn envelope_must_hold_objects() {
        let adapter = rental_car_manager_adapter();
        let err = adapter
            .extract_records(EntityType::Station, json!({"results": [1, 2]}))
            .unwrap_err();
        assert!(matches!(err, AdapterError::UnexpectedPayload { .. }));

        let none = adapter
            .extract_records(EntityType::Station, json!({"results": null}))
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn registry_knows_all_partners() {
        for partner in KNOWN_PARTNERS {
            let adapter = adapter_for_partner(partner).unwrap();
            assert_eq!(adapter.partner(), partner);
            for entity_type in EntityType::ALL {
                assert!(adapter.supports(entity_type));
                assert!(adapter.default_path(entity_type).is_some());
            }
        }
        assert!(adapter_for_partner("mcrent").is_none());
    }
}
