//! Core domain model for partner imports: entity kinds, column allow-lists,
//! and the typed record shape adapters hand to the reconciler.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "camper-core";

/// Local entity kinds that partners can feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Provider,
    Station,
    Camper,
}

impl EntityType {
    /// Import order; parents before children.
    pub const ALL: [EntityType; 3] = [EntityType::Provider, EntityType::Station, EntityType::Camper];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Provider => "provider",
            EntityType::Station => "station",
            EntityType::Camper => "camper",
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            EntityType::Provider => "providers",
            EntityType::Station => "stations",
            EntityType::Camper => "campers",
        }
    }

    /// Columns a partner payload is allowed to write.
    pub fn payload_columns(self) -> &'static [ColumnSpec] {
        match self {
            EntityType::Provider => PROVIDER_COLUMNS,
            EntityType::Station => STATION_COLUMNS,
            EntityType::Camper => CAMPER_COLUMNS,
        }
    }

    /// Foreign keys set by the reconciler after identity resolution.
    pub fn reference_columns(self) -> &'static [&'static str] {
        match self {
            EntityType::Provider => &[],
            EntityType::Station => &["provider_id"],
            EntityType::Camper => &["provider_id", "station_id"],
        }
    }

    pub fn column_kind(self, column: &str) -> Option<ColumnKind> {
        if self.reference_columns().contains(&column) {
            return Some(ColumnKind::Int);
        }
        self.payload_columns()
            .iter()
            .find(|c| c.name == column)
            .map(|c| c.kind)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown entity type: {0}")]
pub struct UnknownEntityType(pub String);

impl FromStr for EntityType {
    type Err = UnknownEntityType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "provider" | "providers" => Ok(EntityType::Provider),
            "station" | "stations" => Ok(EntityType::Station),
            "camper" | "campers" => Ok(EntityType::Camper),
            other => Err(UnknownEntityType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnKind {
    Text,
    Bool,
    Int,
    Float,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub kind: ColumnKind,
}

const fn col(name: &'static str, kind: ColumnKind) -> ColumnSpec {
    ColumnSpec { name, kind }
}

pub const PROVIDER_COLUMNS: &[ColumnSpec] = &[
    col("company_name", ColumnKind::Text),
    col("email", ColumnKind::Text),
    col("phone", ColumnKind::Text),
    col("website", ColumnKind::Text),
    col("street", ColumnKind::Text),
    col("city", ColumnKind::Text),
    col("zip", ColumnKind::Text),
    col("country", ColumnKind::Text),
    col("latitude", ColumnKind::Float),
    col("longitude", ColumnKind::Float),
    col("description", ColumnKind::Text),
    col("is_active", ColumnKind::Bool),
];

pub const STATION_COLUMNS: &[ColumnSpec] = &[
    col("name", ColumnKind::Text),
    col("email", ColumnKind::Text),
    col("phone", ColumnKind::Text),
    col("street", ColumnKind::Text),
    col("city", ColumnKind::Text),
    col("zip", ColumnKind::Text),
    col("country", ColumnKind::Text),
    col("latitude", ColumnKind::Float),
    col("longitude", ColumnKind::Float),
    col("opening_hours", ColumnKind::Text),
    col("is_active", ColumnKind::Bool),
];

pub const CAMPER_COLUMNS: &[ColumnSpec] = &[
    col("name", ColumnKind::Text),
    col("brand", ColumnKind::Text),
    col("model", ColumnKind::Text),
    col("category", ColumnKind::Text),
    col("seats", ColumnKind::Int),
    col("beds", ColumnKind::Int),
    col("length_cm", ColumnKind::Int),
    col("transmission", ColumnKind::Text),
    col("fuel_type", ColumnKind::Text),
    col("has_toilet", ColumnKind::Bool),
    col("has_shower", ColumnKind::Bool),
    col("has_kitchen", ColumnKind::Bool),
    col("has_air_conditioning", ColumnKind::Bool),
    col("pets_allowed", ColumnKind::Bool),
    col("min_driver_age", ColumnKind::Int),
    col("description", ColumnKind::Text),
    col("is_active", ColumnKind::Bool),
];

/// A single typed column value. `NULL` is expressed one level up as `Option`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ColumnValue {
    pub fn kind(&self) -> ColumnKind {
        match self {
            ColumnValue::Text(_) => ColumnKind::Text,
            ColumnValue::Bool(_) => ColumnKind::Bool,
            ColumnValue::Int(_) => ColumnKind::Int,
            ColumnValue::Float(_) => ColumnKind::Float,
        }
    }
}

/// A column write: name plus value, where `None` writes `NULL`.
pub type Assignment = (&'static str, Option<ColumnValue>);

/// Tri-state payload field: the key may be absent, explicitly null, or set.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Field<T> {
    #[default]
    Missing,
    Null,
    Value(T),
}

impl<T> Field<T> {
    pub fn is_missing(&self) -> bool {
        matches!(self, Field::Missing)
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Field::Value(v) => Some(v),
            _ => None,
        }
    }

    /// `None` when absent; `Some(None)` for an explicit null.
    pub fn into_present(self) -> Option<Option<T>> {
        match self {
            Field::Missing => None,
            Field::Null => Some(None),
            Field::Value(v) => Some(Some(v)),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("cannot read {found} as {expected:?}")]
pub struct CoerceError {
    pub expected: ColumnKind,
    pub found: String,
}

/// Converts a raw partner JSON value into a typed field.
///
/// Partners send booleans as `"true"`/`"false"` strings and numbers as numeric
/// strings; both are accepted. An empty string counts as an explicit null.
pub fn coerce(kind: ColumnKind, raw: Option<&JsonValue>) -> Result<Field<ColumnValue>, CoerceError> {
    let Some(raw) = raw else {
        return Ok(Field::Missing);
    };
    if raw.is_null() {
        return Ok(Field::Null);
    }
    if let JsonValue::String(s) = raw {
        if s.trim().is_empty() {
            return Ok(Field::Null);
        }
    }

    let fail = || CoerceError {
        expected: kind,
        found: raw.to_string(),
    };

    let value = match kind {
        ColumnKind::Text => match raw {
            JsonValue::String(s) => ColumnValue::Text(s.trim().to_string()),
            JsonValue::Number(n) => ColumnValue::Text(n.to_string()),
            JsonValue::Bool(b) => ColumnValue::Text(b.to_string()),
            _ => return Err(fail()),
        },
        ColumnKind::Bool => ColumnValue::Bool(parse_bool(raw).ok_or_else(fail)?),
        ColumnKind::Int => ColumnValue::Int(parse_int(raw).ok_or_else(fail)?),
        ColumnKind::Float => ColumnValue::Float(parse_float(raw).ok_or_else(fail)?),
    };
    Ok(Field::Value(value))
}

fn parse_bool(raw: &JsonValue) -> Option<bool> {
    match raw {
        JsonValue::Bool(b) => Some(*b),
        JsonValue::Number(n) => match n.as_i64()? {
            0 => Some(false),
            1 => Some(true),
            _ => None,
        },
        JsonValue::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "y" => Some(true),
            "false" | "0" | "no" | "n" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn parse_float(raw: &JsonValue) -> Option<f64> {
    let v = match raw {
        JsonValue::Number(n) => n.as_f64()?,
        JsonValue::String(s) => s.trim().replace(',', ".").parse::<f64>().ok()?,
        _ => return None,
    };
    v.is_finite().then_some(v)
}

fn parse_int(raw: &JsonValue) -> Option<i64> {
    if let JsonValue::Number(n) = raw {
        if let Some(i) = n.as_i64() {
            return Some(i);
        }
    }
    if let JsonValue::String(s) = raw {
        if let Ok(i) = s.trim().parse::<i64>() {
            return Some(i);
        }
    }
    let f = parse_float(raw)?;
    (f.fract() == 0.0 && f.abs() < i64::MAX as f64).then_some(f as i64)
}

/// Partner-agnostic record produced by an adapter and consumed by the reconciler.
#[derive(Debug, Clone, PartialEq)]
pub struct PartnerRecord {
    pub entity_type: EntityType,
    pub external_id: String,
    /// Partner's id for the owning provider (stations, campers).
    pub provider_ref: Option<String>,
    /// Partner's id for the home station (campers). An explicit null unlinks the station.
    pub station_ref: Field<String>,
    /// Only allow-listed columns; absent keys are never stored here.
    pub fields: BTreeMap<&'static str, Field<ColumnValue>>,
}

impl PartnerRecord {
    pub fn new(entity_type: EntityType, external_id: impl Into<String>) -> Self {
        Self {
            entity_type,
            external_id: external_id.into(),
            provider_ref: None,
            station_ref: Field::Missing,
            fields: BTreeMap::new(),
        }
    }

    /// Sets an allow-listed column. Unknown columns and `Missing` are ignored.
    pub fn set(&mut self, column: &str, field: Field<ColumnValue>) {
        if field.is_missing() {
            return;
        }
        if let Some(spec) = self
            .entity_type
            .payload_columns()
            .iter()
            .find(|c| c.name == column)
        {
            self.fields.insert(spec.name, field);
        }
    }

    pub fn with(mut self, column: &str, value: ColumnValue) -> Self {
        self.set(column, Field::Value(value));
        self
    }

    /// Columns for the update path: only what the payload carried.
    pub fn update_assignments(&self) -> Vec<Assignment> {
        self.fields
            .iter()
            .filter_map(|(name, field)| field.clone().into_present().map(|v| (*name, v)))
            .collect()
    }

    /// Columns for the insert path: the full allow-list, absent ones as `NULL`.
    pub fn insert_assignments(&self) -> Vec<Assignment> {
        self.entity_type
            .payload_columns()
            .iter()
            .map(|spec| {
                let value = self.fields.get(spec.name).and_then(|f| f.value().cloned());
                (spec.name, value)
            })
            .collect()
    }

    pub fn display_name(&self) -> Option<&str> {
        let key = match self.entity_type {
            EntityType::Provider => "company_name",
            EntityType::Station | EntityType::Camper => "name",
        };
        match self.fields.get(key)?.value()? {
            ColumnValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn string_booleans_are_typed() {
        assert_eq!(
            coerce(ColumnKind::Bool, Some(&json!("true"))).unwrap(),
            Field::Value(ColumnValue::Bool(true))
        );
        assert_eq!(
            coerce(ColumnKind::Bool, Some(&json!("FALSE"))).unwrap(),
            Field::Value(ColumnValue::Bool(false))
        );
        assert_eq!(
            coerce(ColumnKind::Bool, Some(&json!(1))).unwrap(),
            Field::Value(ColumnValue::Bool(true))
        );
        assert!(coerce(ColumnKind::Bool, Some(&json!("maybe"))).is_err());
    }

    #[test]
    fn numeric_strings_are_typed() {
        assert_eq!(
            coerce(ColumnKind::Int, Some(&json!("4"))).unwrap(),
            Field::Value(ColumnValue::Int(4))
        );
        assert_eq!(
            coerce(ColumnKind::Int, Some(&json!(6.0))).unwrap(),
            Field::Value(ColumnValue::Int(6))
        );
        assert_eq!(
            coerce(ColumnKind::Float, Some(&json!("52,52"))).unwrap(),
            Field::Value(ColumnValue::Float(52.52))
        );
        assert!(coerce(ColumnKind::Int, Some(&json!("4.5"))).is_err());
    }

    #[test]
    fn absent_null_and_empty_are_distinguished() {
        assert_eq!(coerce(ColumnKind::Text, None).unwrap(), Field::Missing);
        assert_eq!(coerce(ColumnKind::Text, Some(&JsonValue::Null)).unwrap(), Field::Null);
        assert_eq!(coerce(ColumnKind::Float, Some(&json!("  "))).unwrap(), Field::Null);
    }

    #[test]
    fn record_rejects_columns_outside_allow_list() {
        let mut record = PartnerRecord::new(EntityType::Station, "S1");
        record.set("provider_id", Field::Value(ColumnValue::Int(99)));
        record.set("name", Field::Value(ColumnValue::Text("Depot".into())));
        assert_eq!(record.fields.len(), 1);
        assert_eq!(record.display_name(), Some("Depot"));
    }

    #[test]
    fn update_assignments_skip_absent_but_keep_explicit_nulls() {
        let mut record = PartnerRecord::new(EntityType::Provider, "42")
            .with("company_name", ColumnValue::Text("Acme RV".into()));
        record.set("phone", Field::Null);

        let update = record.update_assignments();
        assert_eq!(
            update,
            vec![
                ("company_name", Some(ColumnValue::Text("Acme RV".into()))),
                ("phone", None),
            ]
        );

        let insert = record.insert_assignments();
        assert_eq!(insert.len(), PROVIDER_COLUMNS.len());
        assert!(insert.iter().any(|(c, v)| *c == "email" && v.is_none()));
    }

    #[test]
    fn entity_type_parses_singular_and_plural() {
        assert_eq!("stations".parse::<EntityType>().unwrap(), EntityType::Station);
        assert_eq!("Camper".parse::<EntityType>().unwrap(), EntityType::Camper);
        assert!("addons".parse::<EntityType>().is_err());
        assert_eq!(EntityType::Camper.column_kind("station_id"), Some(ColumnKind::Int));
    }
}
