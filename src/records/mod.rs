//! Occurrence records as read from the relational source
//!
//! A record is a fixed set of columns plus an open attribute bag whose keys are
//! the form labels of the record's module. The bag is kept in storage order.

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A single attribute value
///
/// Storage holds arbitrary JSON, but only scalars are meaningful for
/// indexing. Nested arrays and objects are kept as their JSON text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Text(String),
    Number(serde_json::Number),
    Boolean(bool),
    Null,
}

impl AttributeValue {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Boolean(*b),
            Value::Number(n) => Self::Number(n.clone()),
            Value::String(s) => Self::Text(s.clone()),
            nested => Self::Text(nested.to_string()),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Text(s) => Value::String(s.clone()),
            Self::Number(n) => Value::Number(n.clone()),
            Self::Boolean(b) => Value::Bool(*b),
            Self::Null => Value::Null,
        }
    }

    /// String form used for text search, `None` for values that carry nothing
    ///
    /// Null, blank text and the literal text `null` are all treated as absent.
    pub fn as_search_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Text(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() || trimmed == "null" {
                    None
                } else {
                    Some(s.clone())
                }
            }
            Self::Number(n) => Some(n.to_string()),
            Self::Boolean(b) => Some(b.to_string()),
        }
    }

    pub fn is_present(&self) -> bool {
        self.as_search_text().is_some()
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => f.write_str(s),
            Self::Number(n) => write!(f, "{}", n),
            Self::Boolean(b) => write!(f, "{}", b),
            Self::Null => f.write_str("null"),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<i64> for AttributeValue {
    fn from(n: i64) -> Self {
        Self::Number(n.into())
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

/// Ordered mapping of form label to value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeBag {
    entries: Vec<(String, AttributeValue)>,
}

impl AttributeBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a stored JSON value; `None` when it is not an object
    pub fn from_json(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        let mut bag = Self::new();
        for (key, value) in map {
            bag.insert(key.clone(), AttributeValue::from_json(value));
        }
        Some(bag)
    }

    pub fn to_json(&self) -> Value {
        let map: serde_json::Map<String, Value> = self
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        Value::Object(map)
    }

    /// Insert or replace, keeping the original position of an existing key
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttributeValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<AttributeValue>> FromIterator<(K, V)> for AttributeBag {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut bag = Self::new();
        for (k, v) in iter {
            bag.insert(k, v);
        }
        bag
    }
}

impl Serialize for AttributeBag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (k, v) in &self.entries {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for AttributeBag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_json(&value).ok_or_else(|| de::Error::custom("attribute bag must be an object"))
    }
}

/// Urgency level of an occurrence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Urgency {
    Low,
    Medium,
    High,
    /// Levels outside the usual three are kept verbatim
    Other(String),
}

impl Urgency {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Low => "Low",
            Self::Medium => "Medium",
            Self::High => "High",
            Self::Other(s) => s,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self::from(trimmed.to_string()))
    }
}

impl From<String> for Urgency {
    fn from(s: String) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Self::Low,
            "medium" => Self::Medium,
            "high" => Self::High,
            _ => Self::Other(s),
        }
    }
}

impl From<Urgency> for String {
    fn from(u: Urgency) -> Self {
        u.as_str().to_string()
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Person who reported the occurrence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reporter {
    pub name: Option<String>,
    pub id_number: Option<String>,
}

/// One occurrence row with its attribute bag decoded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub id: i64,
    /// Human-readable OB number
    pub case_number: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub module_id: i64,
    pub module_name: Option<String>,
    pub location: Option<String>,
    pub urgency: Option<Urgency>,
    pub narrative: Option<String>,
    #[serde(default)]
    pub attributes: AttributeBag,
    pub reporter: Option<Reporter>,
}

impl RawRecord {
    /// Minimal record, mainly for fixtures
    pub fn new(id: i64, module_id: i64) -> Self {
        Self {
            id,
            case_number: None,
            submitted_at: None,
            module_id,
            module_name: None,
            location: None,
            urgency: None,
            narrative: None,
            attributes: AttributeBag::new(),
            reporter: None,
        }
    }
}

/// Domain fields lifted out of the attribute bag for filtering
///
/// Which form labels feed each field is deployment configuration, see
/// [`crate::flatten::PromotionRules`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotedField {
    VictimName,
    SuspectName,
    SuspectDescription,
    SuspectPresence,
    VehicleRegistration,
    VehicleMake,
    VehicleModel,
    CauseOfDeath,
    StolenItems,
    ElectronicType,
    DocumentType,
    GbvType,
    MentalCondition,
    PropertyType,
    Description,
    CyberIncident,
    DigitalPlatform,
}

impl PromotedField {
    pub const ALL: [PromotedField; 17] = [
        Self::VictimName,
        Self::SuspectName,
        Self::SuspectDescription,
        Self::SuspectPresence,
        Self::VehicleRegistration,
        Self::VehicleMake,
        Self::VehicleModel,
        Self::CauseOfDeath,
        Self::StolenItems,
        Self::ElectronicType,
        Self::DocumentType,
        Self::GbvType,
        Self::MentalCondition,
        Self::PropertyType,
        Self::Description,
        Self::CyberIncident,
        Self::DigitalPlatform,
    ];

    /// Document field name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VictimName => "victim_name",
            Self::SuspectName => "suspect_name",
            Self::SuspectDescription => "suspect_description",
            Self::SuspectPresence => "suspect_presence",
            Self::VehicleRegistration => "vehicle_registration",
            Self::VehicleMake => "vehicle_make",
            Self::VehicleModel => "vehicle_model",
            Self::CauseOfDeath => "cause_of_death",
            Self::StolenItems => "stolen_items",
            Self::ElectronicType => "electronic_type",
            Self::DocumentType => "document_type",
            Self::GbvType => "gbv_type",
            Self::MentalCondition => "mental_condition",
            Self::PropertyType => "property_type",
            Self::Description => "description",
            Self::CyberIncident => "cyber_incident",
            Self::DigitalPlatform => "digital_platform",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.as_str() == s)
    }
}

impl fmt::Display for PromotedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bag_keeps_storage_order() {
        let stored = json!({"Make": "Toyota", "Registration number": "KDA 123A", "Color": null});
        let bag = AttributeBag::from_json(&stored).unwrap();

        let keys: Vec<&str> = bag.keys().collect();
        assert_eq!(keys, vec!["Make", "Registration number", "Color"]);
        assert_eq!(bag.get("Color"), Some(&AttributeValue::Null));
    }

    #[test]
    fn test_bag_rejects_non_objects() {
        assert!(AttributeBag::from_json(&json!(["a", "b"])).is_none());
        assert!(AttributeBag::from_json(&json!("text")).is_none());
    }

    #[test]
    fn test_nested_values_become_text() {
        let bag = AttributeBag::from_json(&json!({"items": ["phone", "laptop"]})).unwrap();
        assert_eq!(
            bag.get("items"),
            Some(&AttributeValue::Text(r#"["phone","laptop"]"#.to_string()))
        );
    }

    #[test]
    fn test_search_text_skips_empty_values() {
        assert_eq!(AttributeValue::Null.as_search_text(), None);
        assert_eq!(AttributeValue::from("null").as_search_text(), None);
        assert_eq!(AttributeValue::from("   ").as_search_text(), None);
        assert_eq!(AttributeValue::from(42i64).as_search_text(), Some("42".into()));
        assert_eq!(AttributeValue::from(true).as_search_text(), Some("true".into()));
    }

    #[test]
    fn test_bag_serde_roundtrip_preserves_order() {
        let bag: AttributeBag = vec![("b", "2"), ("a", "1")].into_iter().collect();
        let text = serde_json::to_string(&bag).unwrap();
        assert_eq!(text, r#"{"b":"2","a":"1"}"#);

        let back: AttributeBag = serde_json::from_str(&text).unwrap();
        assert_eq!(back, bag);
    }

    #[test]
    fn test_urgency_parse() {
        assert_eq!(Urgency::parse("HIGH"), Some(Urgency::High));
        assert_eq!(Urgency::parse(" low "), Some(Urgency::Low));
        assert_eq!(
            Urgency::parse("Critical"),
            Some(Urgency::Other("Critical".into()))
        );
        assert_eq!(Urgency::parse(""), None);
    }

    #[test]
    fn test_promoted_field_names() {
        for field in PromotedField::ALL {
            assert_eq!(PromotedField::parse(field.as_str()), Some(field));
        }
        assert_eq!(
            serde_json::to_string(&PromotedField::VehicleRegistration).unwrap(),
            "\"vehicle_registration\""
        );
    }
}
