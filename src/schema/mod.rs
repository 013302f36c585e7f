//! Module schema registry
//!
//! Every occurrence type ("Arson", "Motor Vehicle Theft", ...) is a module with
//! its own form definition. The registry reads those definitions once from the
//! relational source and serves them from a cache until refreshed.

use crate::error::{ObsearchError, Result};
use crate::outcome::{Diagnostic, DiagnosticKind};
use crate::storage::{ModuleRow, RecordSource};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Number of enumerated options shown before truncating with `...`
const DESCRIBE_OPTION_LIMIT: usize = 5;

/// Declared type of a form field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Text,
    Number,
    Enum,
    Date,
    /// Any type label the registry does not interpret
    Other(String),
}

impl FieldKind {
    pub fn parse(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "" | "text" => Self::Text,
            "number" => Self::Number,
            "enum" => Self::Enum,
            "date" => Self::Date,
            _ => Self::Other(label.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Text => "text",
            Self::Number => "number",
            Self::Enum => "enum",
            Self::Date => "date",
            Self::Other(label) => label,
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One field of a module's form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    pub kind: FieldKind,
    pub required: bool,
    pub options: Vec<String>,
}

/// Form definition of one occurrence type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleSchema {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub fields: Vec<FieldDefinition>,
}

impl ModuleSchema {
    /// Human-readable field list
    pub fn describe(&self) -> String {
        let mut out = format!(
            "Module: {} - {}\nTotal fields: {}\n\nFields:\n",
            self.name,
            self.description,
            self.fields.len()
        );

        for field in &self.fields {
            out.push_str(&format!("- {} ({})", field.name, field.kind));
            if field.required {
                out.push_str(" [REQUIRED]");
            }
            if !field.options.is_empty() {
                let shown: Vec<&str> = field
                    .options
                    .iter()
                    .take(DESCRIBE_OPTION_LIMIT)
                    .map(String::as_str)
                    .collect();
                let more = if field.options.len() > DESCRIBE_OPTION_LIMIT {
                    "..."
                } else {
                    ""
                };
                out.push_str(&format!(" Options: {}{}", shown.join(", "), more));
            }
            out.push('\n');
        }

        out
    }

    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Immutable view of all module schemas at one load
#[derive(Debug, Clone, Default)]
pub struct SchemaSnapshot {
    modules: BTreeMap<i64, ModuleSchema>,
    diagnostics: Vec<Diagnostic>,
}

impl SchemaSnapshot {
    /// Build from raw module rows
    ///
    /// Rows without an id or name, and field lists that are not JSON arrays,
    /// fail the whole load. Unnamed or duplicate fields are dropped and
    /// reported as schema drift.
    pub fn from_rows(rows: Vec<ModuleRow>) -> Result<Self> {
        let mut modules = BTreeMap::new();
        let mut diagnostics = Vec::new();

        for (position, row) in rows.into_iter().enumerate() {
            let id = row.id.ok_or_else(|| {
                ObsearchError::SchemaLoad(format!("module row {} has no id", position))
            })?;
            let name = row
                .name
                .filter(|n| !n.trim().is_empty())
                .ok_or_else(|| ObsearchError::SchemaLoad(format!("module {} has no name", id)))?;

            // A module with no declared fields is valid
            let fields = match row.fields.as_deref() {
                None => Vec::new(),
                Some(text) if text.trim().is_empty() || text.trim() == "null" => Vec::new(),
                Some(text) => {
                    let value: Value = serde_json::from_str(text).map_err(|e| {
                        ObsearchError::SchemaLoad(format!(
                            "module {} ({}) has malformed fields: {}",
                            id, name, e
                        ))
                    })?;
                    parse_fields(id, &value, &mut diagnostics)?
                }
            };

            modules.insert(
                id,
                ModuleSchema {
                    id,
                    name,
                    description: row.description.unwrap_or_default(),
                    fields,
                },
            );
        }

        for d in &diagnostics {
            tracing::warn!("{}", d);
        }

        Ok(Self {
            modules,
            diagnostics,
        })
    }

    pub fn get(&self, module_id: i64) -> Option<&ModuleSchema> {
        self.modules.get(&module_id)
    }

    /// Case-insensitive lookup by display name
    pub fn module_by_name(&self, name: &str) -> Option<&ModuleSchema> {
        self.modules
            .values()
            .find(|m| m.name.eq_ignore_ascii_case(name.trim()))
    }

    pub fn modules(&self) -> impl Iterator<Item = &ModuleSchema> {
        self.modules.values()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn describe(&self, module_id: i64) -> String {
        match self.modules.get(&module_id) {
            Some(module) => module.describe(),
            None => "No schema information available".to_string(),
        }
    }

    /// Union of field names across every module
    pub fn all_field_names(&self) -> BTreeSet<String> {
        self.modules
            .values()
            .flat_map(|m| m.fields.iter().map(|f| f.name.clone()))
            .collect()
    }

    /// One `name: description` line per module
    pub fn summary(&self) -> String {
        self.modules
            .values()
            .map(|m| format!("{}: {}", m.name, m.description))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }
}

fn parse_fields(
    module_id: i64,
    value: &Value,
    diagnostics: &mut Vec<Diagnostic>,
) -> Result<Vec<FieldDefinition>> {
    let entries = value.as_array().ok_or_else(|| {
        ObsearchError::SchemaLoad(format!("module {} fields are not a list", module_id))
    })?;

    let mut fields: Vec<FieldDefinition> = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(name) = entry
            .get("name")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|n| !n.is_empty())
        else {
            diagnostics.push(Diagnostic::new(
                DiagnosticKind::SchemaDrift,
                format!("module {} has a field without a name", module_id),
            ));
            continue;
        };

        if fields.iter().any(|f| f.name == name) {
            diagnostics.push(Diagnostic::new(
                DiagnosticKind::SchemaDrift,
                format!("module {} declares field '{}' twice", module_id, name),
            ));
            continue;
        }

        let kind = entry
            .get("type")
            .and_then(Value::as_str)
            .map(FieldKind::parse)
            .unwrap_or(FieldKind::Text);
        let required = entry
            .get("required")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let options = entry
            .get("options")
            .and_then(Value::as_array)
            .map(|opts| {
                opts.iter()
                    .map(|o| match o {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        fields.push(FieldDefinition {
            name: name.to_string(),
            kind,
            required,
            options,
        });
    }

    Ok(fields)
}

/// Loads module schemas once and serves them from a cache
pub struct SchemaRegistry {
    source: Arc<dyn RecordSource>,
    cache: RwLock<Option<Arc<SchemaSnapshot>>>,
}

impl SchemaRegistry {
    pub fn new(source: Arc<dyn RecordSource>) -> Self {
        Self {
            source,
            cache: RwLock::new(None),
        }
    }

    /// Return the cached snapshot, reading the source on first use
    pub async fn load(&self) -> Result<Arc<SchemaSnapshot>> {
        if let Some(snapshot) = self.cache.read().await.as_ref() {
            return Ok(snapshot.clone());
        }
        self.refresh().await
    }

    /// Re-read module definitions from the source
    pub async fn refresh(&self) -> Result<Arc<SchemaSnapshot>> {
        let mut cache = self.cache.write().await;

        let rows = self
            .source
            .module_rows()
            .await
            .map_err(|e| match e {
                ObsearchError::SchemaLoad(_) => e,
                other => ObsearchError::SchemaLoad(other.to_string()),
            })?;

        let snapshot = Arc::new(SchemaSnapshot::from_rows(rows)?);
        tracing::info!("Loaded schemas for {} modules", snapshot.len());

        *cache = Some(snapshot.clone());
        Ok(snapshot)
    }

    pub async fn describe(&self, module_id: i64) -> Result<String> {
        Ok(self.load().await?.describe(module_id))
    }

    pub async fn all_field_names(&self) -> Result<BTreeSet<String>> {
        Ok(self.load().await?.all_field_names())
    }
}
