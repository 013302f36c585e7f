//! Flattening occurrence records into index documents
//!
//! A record's attribute bag is open-ended and its labels differ between
//! modules. Flattening lifts a fixed set of domain fields out of the bag
//! using a per-deployment alias table, builds one free-text blob for
//! keyword search, and carries the bag through unchanged.

use crate::outcome::{Diagnostic, DiagnosticKind, Outcome};
use crate::records::{AttributeBag, AttributeValue, PromotedField, RawRecord, Reporter, Urgency};
use crate::storage::SourceRow;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Alias table shipped for the reference deployment
const REFERENCE_RULES: &str = include_str!("../../config/promotion.toml");

/// Form labels feeding each promoted field, tried in order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PromotionRules {
    aliases: BTreeMap<PromotedField, Vec<String>>,
}

impl PromotionRules {
    pub fn new(aliases: BTreeMap<PromotedField, Vec<String>>) -> Self {
        Self { aliases }
    }

    /// The alias table of the reference deployment
    pub fn reference() -> Self {
        toml::from_str(REFERENCE_RULES).unwrap_or_else(|e| {
            tracing::warn!("Bundled promotion table is invalid, promoting nothing: {}", e);
            Self::default()
        })
    }

    pub fn aliases(&self, field: PromotedField) -> &[String] {
        self.aliases.get(&field).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn targets(&self) -> impl Iterator<Item = (PromotedField, &[String])> {
        self.aliases.iter().map(|(f, a)| (*f, a.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}

/// Uniform, engine-ready view of one record
#[derive(Debug, Clone, PartialEq)]
pub struct IndexDocument {
    pub id: i64,
    pub case_number: Option<String>,
    pub module_id: i64,
    pub module_name: Option<String>,
    pub location: Option<String>,
    pub urgency: Option<String>,
    pub narrative: Option<String>,
    /// Seconds since the epoch, UTC
    pub submitted_at: Option<i64>,
    pub promoted: BTreeMap<PromotedField, AttributeValue>,
    pub searchable_text: String,
    pub fields: AttributeBag,
}

impl IndexDocument {
    /// Engine JSON form
    ///
    /// Core and promoted names are written first and win over bag keys of the
    /// same name. Every promoted field is present, null when unset, so
    /// presence filters see a uniform document shape.
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert("id".into(), Value::from(self.id));
        map.insert("case_number".into(), opt_string(&self.case_number));
        map.insert("module_id".into(), Value::from(self.module_id));
        map.insert("module_name".into(), opt_string(&self.module_name));
        map.insert("location".into(), opt_string(&self.location));
        map.insert("urgency".into(), opt_string(&self.urgency));
        map.insert("narrative".into(), opt_string(&self.narrative));
        map.insert(
            "submitted_at".into(),
            self.submitted_at.map(Value::from).unwrap_or(Value::Null),
        );

        for field in PromotedField::ALL {
            let value = self
                .promoted
                .get(&field)
                .map(AttributeValue::to_json)
                .unwrap_or(Value::Null);
            map.insert(field.as_str().into(), value);
        }

        map.insert("searchable_text".into(), Value::String(self.searchable_text.clone()));
        map.insert("fields".into(), self.fields.to_json());

        for (key, value) in self.fields.iter() {
            map.entry(key.to_string()).or_insert_with(|| value.to_json());
        }

        Value::Object(map)
    }
}

fn opt_string(value: &Option<String>) -> Value {
    value.clone().map(Value::String).unwrap_or(Value::Null)
}

/// Turns records into [`IndexDocument`]s; holds only the alias table
#[derive(Debug, Clone)]
pub struct RecordFlattener {
    rules: Arc<PromotionRules>,
}

impl RecordFlattener {
    pub fn new(rules: Arc<PromotionRules>) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &PromotionRules {
        &self.rules
    }

    /// Pure and deterministic
    pub fn flatten(&self, record: &RawRecord) -> IndexDocument {
        // First alias carrying a real value wins
        let mut promoted = BTreeMap::new();
        for (target, aliases) in self.rules.targets() {
            let found = aliases
                .iter()
                .filter_map(|alias| record.attributes.get(alias))
                .find(|value| value.is_present());
            if let Some(value) = found {
                promoted.insert(target, value.clone());
            }
        }

        // Bag values in stored order, then location, then narrative
        let mut parts: Vec<String> = record
            .attributes
            .iter()
            .filter_map(|(_, value)| value.as_search_text())
            .collect();
        for extra in [&record.location, &record.narrative] {
            if let Some(text) = extra.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
                parts.push(text.to_string());
            }
        }

        IndexDocument {
            id: record.id,
            case_number: record.case_number.clone(),
            module_id: record.module_id,
            module_name: record.module_name.clone(),
            location: record.location.clone(),
            urgency: record.urgency.as_ref().map(|u| u.as_str().to_string()),
            narrative: record.narrative.clone(),
            submitted_at: record.submitted_at.map(|ts| ts.timestamp()),
            promoted,
            searchable_text: parts.join(" "),
            fields: record.attributes.clone(),
        }
    }

    /// Decode and flatten one stored row; never fails
    pub fn flatten_row(&self, row: &SourceRow) -> Outcome<IndexDocument> {
        decode_row(row).map(|record| self.flatten(&record))
    }

    pub fn flatten_rows(&self, rows: &[SourceRow]) -> Outcome<Vec<IndexDocument>> {
        rows.iter().map(|row| self.flatten_row(row)).collect()
    }
}

/// Convert a storage row into a [`RawRecord`]
///
/// A bag that is not a JSON object and a timestamp that cannot be read are
/// both replaced by empty values and reported as anomalies.
pub fn decode_row(row: &SourceRow) -> Outcome<RawRecord> {
    let mut diagnostics = Vec::new();

    let attributes = match row.form_data.as_deref().map(str::trim) {
        None | Some("") | Some("null") => AttributeBag::new(),
        Some(text) => match serde_json::from_str::<Value>(text) {
            Ok(value) => AttributeBag::from_json(&value).unwrap_or_else(|| {
                tracing::warn!("Record {} has a non-object attribute bag", row.id);
                diagnostics.push(Diagnostic::for_record(
                    DiagnosticKind::FlattenAnomaly,
                    row.id,
                    "attribute bag is not a JSON object, indexed without attributes",
                ));
                AttributeBag::new()
            }),
            Err(e) => {
                tracing::warn!("Record {} has an unreadable attribute bag: {}", row.id, e);
                diagnostics.push(Diagnostic::for_record(
                    DiagnosticKind::FlattenAnomaly,
                    row.id,
                    format!("attribute bag is not valid JSON ({}), indexed without attributes", e),
                ));
                AttributeBag::new()
            }
        },
    };

    let submitted_at = match row.submitted_at.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(text) => {
            let parsed = parse_timestamp(text);
            if parsed.is_none() {
                tracing::warn!("Record {} has an unreadable submission date '{}'", row.id, text);
                diagnostics.push(Diagnostic::for_record(
                    DiagnosticKind::FlattenAnomaly,
                    row.id,
                    format!("submission date '{}' is not a recognised timestamp", text),
                ));
            }
            parsed
        }
    };

    // Reporter columns come from a LEFT JOIN and may all be null
    let reporter_name = [&row.reporter_first_name, &row.reporter_last_name]
        .into_iter()
        .filter_map(|part| part.as_deref().map(str::trim).filter(|p| !p.is_empty()))
        .collect::<Vec<_>>()
        .join(" ");
    let reporter = if reporter_name.is_empty() && row.reporter_id_number.is_none() {
        None
    } else {
        Some(Reporter {
            name: Some(reporter_name).filter(|n| !n.is_empty()),
            id_number: row.reporter_id_number.clone(),
        })
    };

    let record = RawRecord {
        id: row.id,
        case_number: row.case_number.clone(),
        submitted_at,
        module_id: row.module_id,
        module_name: row.module_name.clone(),
        location: row.location.clone(),
        urgency: row.urgency.as_deref().and_then(Urgency::parse),
        narrative: row.narrative.clone(),
        attributes,
        reporter,
    };

    Outcome::with_diagnostics(record, diagnostics)
}

/// RFC 3339, then SQL-style `YYYY-MM-DD HH:MM:SS[.f]` as UTC, then a bare date
fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .map(|d| d.and_time(NaiveTime::MIN).and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn flattener() -> RecordFlattener {
        RecordFlattener::new(Arc::new(PromotionRules::reference()))
    }

    fn row(id: i64, form_data: Option<&str>) -> SourceRow {
        SourceRow {
            id,
            case_number: Some(format!("OB/{}/2025", id)),
            submitted_at: Some("2025-06-09T10:00:00Z".into()),
            module_id: 3,
            module_name: Some("Motor Vehicle Theft".into()),
            form_data: form_data.map(String::from),
            location: Some("Nairobi CBD".into()),
            urgency: Some("high".into()),
            narrative: Some("Car taken from parking".into()),
            reporter_first_name: Some("Jane".into()),
            reporter_last_name: None,
            reporter_id_number: None,
        }
    }

    #[test]
    fn test_reference_rules_parse() {
        let rules = PromotionRules::reference();
        assert_eq!(rules.targets().count(), PromotedField::ALL.len());
        assert_eq!(
            rules.aliases(PromotedField::VictimName),
            ["Name of the casualty", "Name of the victim", "Name of the deceased", "Name"]
        );
    }

    #[test]
    fn test_promotion_uses_first_present_alias() {
        let mut record = RawRecord::new(1, 2);
        record.attributes.insert("Name of the casualty", AttributeValue::Null);
        record.attributes.insert("Name of the victim", "null");
        record.attributes.insert("Name", "John Kamau");

        let doc = flattener().flatten(&record);
        assert_eq!(
            doc.promoted.get(&PromotedField::VictimName),
            Some(&AttributeValue::from("John Kamau"))
        );
        assert!(!doc.promoted.contains_key(&PromotedField::SuspectName));
    }

    #[test]
    fn test_searchable_text_order() {
        let mut record = RawRecord::new(1, 3);
        record.attributes.insert("Make", "Toyota");
        record.attributes.insert("Color", AttributeValue::Null);
        record.attributes.insert("Doors", 4i64);
        record.location = Some("Westlands".into());
        record.narrative = Some("Taken overnight".into());

        let doc = flattener().flatten(&record);
        assert_eq!(doc.searchable_text, "Toyota 4 Westlands Taken overnight");
    }

    #[test]
    fn test_flatten_is_deterministic() {
        let mut record = RawRecord::new(9, 3);
        record.attributes.insert("Registration number", "KDA 123A");
        record.submitted_at = Some(Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap());

        let f = flattener();
        assert_eq!(f.flatten(&record), f.flatten(&record));
        assert_eq!(f.flatten(&record).submitted_at, Some(1_735_787_045));
    }

    #[test]
    fn test_core_fields_win_key_collisions() {
        let mut record = RawRecord::new(4, 1);
        record.location = Some("Kisumu".into());
        record.attributes.insert("location", "bag location");
        record.attributes.insert("Make", "Mazda");

        let json = flattener().flatten(&record).to_json();
        assert_eq!(json["location"], "Kisumu");
        assert_eq!(json["fields"]["location"], "bag location");
        assert_eq!(json["Make"], "Mazda");
        assert_eq!(json["victim_name"], Value::Null);
    }

    #[test]
    fn test_non_object_bag_is_an_anomaly() {
        let outcome = flattener().flatten_row(&row(5, Some(r#"["a","b"]"#)));
        assert_eq!(outcome.count(DiagnosticKind::FlattenAnomaly), 1);
        assert!(outcome.value.fields.is_empty());
        assert_eq!(outcome.value.searchable_text, "Nairobi CBD Car taken from parking");
    }

    #[test]
    fn test_invalid_json_bag_is_an_anomaly() {
        let outcome = flattener().flatten_row(&row(6, Some("{not json")));
        assert_eq!(outcome.count(DiagnosticKind::FlattenAnomaly), 1);
        assert_eq!(outcome.diagnostics[0].record_id, Some(6));
    }

    #[test]
    fn test_missing_bag_is_clean() {
        let outcome = flattener().flatten_row(&row(7, None));
        assert!(outcome.is_clean());
    }

    #[test]
    fn test_flatten_rows_aggregates_diagnostics() {
        let rows = vec![
            row(1, Some(r#"{"Make": "Toyota"}"#)),
            row(2, Some("42")),
            row(3, Some("oops")),
        ];
        let outcome = flattener().flatten_rows(&rows);
        assert_eq!(outcome.value.len(), 3);
        assert_eq!(outcome.count(DiagnosticKind::FlattenAnomaly), 2);
        assert_eq!(
            outcome.value[0].promoted.get(&PromotedField::VehicleMake),
            Some(&AttributeValue::from("Toyota"))
        );
    }

    #[test]
    fn test_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2025, 6, 9, 10, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2025-06-09T10:00:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2025-06-09T13:00:00+03:00"), Some(expected));
        assert_eq!(parse_timestamp("2025-06-09 10:00:00"), Some(expected));
        assert_eq!(parse_timestamp("2025-06-09 10:00:00.000"), Some(expected));
        assert!(parse_timestamp("yesterday").is_none());

        let mut bad = row(8, None);
        bad.submitted_at = Some("last tuesday".into());
        let outcome = decode_row(&bad);
        assert_eq!(outcome.value.submitted_at, None);
        assert_eq!(outcome.count(DiagnosticKind::FlattenAnomaly), 1);
    }

    #[test]
    fn test_decoded_urgency_and_reporter() {
        let outcome = decode_row(&row(1, None));
        assert_eq!(outcome.value.urgency, Some(Urgency::High));
        assert_eq!(
            outcome.value.reporter.and_then(|r| r.name),
            Some("Jane".to_string())
        );
    }
}
