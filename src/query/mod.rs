//! Structured query building
//!
//! One set of [`Predicates`] renders to two targets: a parameterized SQL
//! query for the relational source and a filter expression for the search
//! engine. Both come from the same [`FilterExpr`]-style decomposition so the
//! two paths select the same records.

pub mod filter;

pub use filter::{CompareOp, FilterExpr, FilterParseError, FilterValue};

use crate::flatten::PromotionRules;
use crate::records::{PromotedField, Urgency};
use chrono::{DateTime, Days, NaiveDate, NaiveTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Projection shared by every record query, in [`crate::storage::SourceRow`] order
pub const RECORD_SELECT: &str = "SELECT smd.id, smd.ob_number, smd.submission_date, \
smd.sub_module_id, sm.name, smd.form_data, smd.location, smd.urgency, smd.narrative, \
r.first_name, r.last_name, r.id_no \
FROM sub_module_data smd \
LEFT JOIN sub_module sm ON sm.id = smd.sub_module_id \
LEFT JOIN reporter r ON r.id = smd.reporter_id";

/// Per-module totals; `?1` is the lower bound of the recent window, `?2`
/// the urgency counted as high
pub const MODULE_STATISTICS: &str = "SELECT smd.sub_module_id, sm.name, COUNT(*), \
     COUNT(CASE WHEN julianday(smd.submission_date) >= julianday(?1) THEN 1 END), \
     COUNT(CASE WHEN smd.urgency = ?2 COLLATE NOCASE THEN 1 END) \
     FROM sub_module_data smd LEFT JOIN sub_module sm ON smd.sub_module_id = sm.id \
     GROUP BY smd.sub_module_id, sm.name \
     ORDER BY COUNT(*) DESC, smd.sub_module_id";

/// Core document fields usable as filters
pub const CORE_FILTER_FIELDS: [&str; 6] = [
    "module_name",
    "location",
    "urgency",
    "submitted_at",
    "case_number",
    "narrative",
];

/// Inclusive range of calendar days, interpreted in UTC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn single_day(day: NaiveDate) -> Self {
        Self { start: day, end: day }
    }

    /// Half-open instant bounds: start of `start` up to start of the day after `end`
    pub fn bounds(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let lower = self.start.and_time(NaiveTime::MIN).and_utc();
        let next = self.end.checked_add_days(Days::new(1)).unwrap_or(self.end);
        let upper = next.and_time(NaiveTime::MIN).and_utc();
        (lower, upper)
    }
}

/// A field whose presence can be required
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterField {
    Core(CoreField),
    Promoted(PromotedField),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreField {
    ModuleName,
    Location,
    Urgency,
    CaseNumber,
    Narrative,
}

impl FilterField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Core(CoreField::ModuleName) => "module_name",
            Self::Core(CoreField::Location) => "location",
            Self::Core(CoreField::Urgency) => "urgency",
            Self::Core(CoreField::CaseNumber) => "case_number",
            Self::Core(CoreField::Narrative) => "narrative",
            Self::Promoted(field) => field.as_str(),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let core = match s {
            "module_name" => Some(CoreField::ModuleName),
            "location" => Some(CoreField::Location),
            "urgency" => Some(CoreField::Urgency),
            "case_number" => Some(CoreField::CaseNumber),
            "narrative" => Some(CoreField::Narrative),
            _ => None,
        };
        core.map(Self::Core)
            .or_else(|| PromotedField::parse(s).map(Self::Promoted))
    }
}

impl fmt::Display for FilterField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured constraints derived from a question or supplied by a caller
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Predicates {
    /// Module names, matched exactly
    #[serde(default)]
    pub modules: Vec<String>,
    /// Free text matched against attributes, location and narrative
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub date_range: Option<DateRange>,
    #[serde(default)]
    pub urgency: Option<Urgency>,
    /// Fields that must carry a value
    #[serde(default)]
    pub present: Vec<FilterField>,
}

impl Predicates {
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
            && self.text().is_none()
            && self.date_range.is_none()
            && self.urgency.is_none()
            && self.present.is_empty()
    }

    /// Trimmed free text, `None` when blank
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }

    /// Query string for the engine; the filter carries everything else
    pub fn query_text(&self) -> &str {
        self.text().unwrap_or("")
    }
}

/// A value bound to a `?N` placeholder
#[derive(Debug, Clone, PartialEq)]
pub enum SqlParam {
    Text(String),
    Integer(i64),
}

/// SQL text plus its bound parameters, in placeholder order
#[derive(Debug, Clone, PartialEq)]
pub struct RelationalQuery {
    pub sql: String,
    pub params: Vec<SqlParam>,
}

impl RelationalQuery {
    fn bind(&mut self, param: SqlParam) -> String {
        self.params.push(param);
        format!("?{}", self.params.len())
    }
}

/// Renders predicates for the relational source and the search engine
pub struct StructuredQueryBuilder {
    rules: Arc<PromotionRules>,
}

impl StructuredQueryBuilder {
    pub fn new(rules: Arc<PromotionRules>) -> Self {
        Self { rules }
    }

    /// Parameterized SQL over the record projection
    ///
    /// User-supplied values never appear in the SQL text.
    pub fn relational(&self, predicates: &Predicates, limit: usize) -> RelationalQuery {
        let mut query = RelationalQuery {
            sql: String::new(),
            params: Vec::new(),
        };
        let mut clauses = Vec::new();

        if !predicates.modules.is_empty() {
            let placeholders: Vec<String> = predicates
                .modules
                .iter()
                .map(|m| query.bind(SqlParam::Text(m.clone())))
                .collect();
            clauses.push(format!("sm.name IN ({})", placeholders.join(", ")));
        }

        if let Some(text) = predicates.text() {
            let p = query.bind(SqlParam::Text(like_pattern(text)));
            clauses.push(format!(
                "(smd.form_data LIKE {p} ESCAPE '\\' OR smd.narrative LIKE {p} ESCAPE '\\' \
                 OR smd.location LIKE {p} ESCAPE '\\')"
            ));
        }

        if let Some(range) = &predicates.date_range {
            let (lower, upper) = range.bounds();
            let lo = query.bind(SqlParam::Text(lower.to_rfc3339_opts(SecondsFormat::Secs, true)));
            let hi = query.bind(SqlParam::Text(upper.to_rfc3339_opts(SecondsFormat::Secs, true)));
            // Stored timestamps come in several textual forms, so compare as instants
            clauses.push(format!(
                "julianday(smd.submission_date) >= julianday({lo}) \
                 AND julianday(smd.submission_date) < julianday({hi})"
            ));
        }

        if let Some(urgency) = &predicates.urgency {
            let p = query.bind(SqlParam::Text(urgency.as_str().to_string()));
            clauses.push(format!("smd.urgency = {p} COLLATE NOCASE"));
        }

        for field in &predicates.present {
            let clause = match field {
                FilterField::Core(CoreField::ModuleName) => "sm.name IS NOT NULL".to_string(),
                FilterField::Core(CoreField::Location) => {
                    "COALESCE(smd.location, '') <> ''".to_string()
                }
                FilterField::Core(CoreField::Urgency) => {
                    "COALESCE(smd.urgency, '') <> ''".to_string()
                }
                FilterField::Core(CoreField::CaseNumber) => {
                    "COALESCE(smd.ob_number, '') <> ''".to_string()
                }
                FilterField::Core(CoreField::Narrative) => {
                    "COALESCE(smd.narrative, '') <> ''".to_string()
                }
                FilterField::Promoted(target) => {
                    let aliases = self.rules.aliases(*target);
                    if aliases.is_empty() {
                        // Nothing can feed this field
                        "0".to_string()
                    } else {
                        let checks: Vec<String> = aliases
                            .iter()
                            .map(|alias| {
                                let p = query.bind(SqlParam::Text(json_path(alias)));
                                format!(
                                    "COALESCE(CASE WHEN json_valid(smd.form_data) \
                                     THEN json_extract(smd.form_data, {p}) END, '') NOT IN ('', 'null')"
                                )
                            })
                            .collect();
                        format!("({})", checks.join(" OR "))
                    }
                }
            };
            clauses.push(clause);
        }

        let mut sql = RECORD_SELECT.to_string();
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        let lim = query.bind(SqlParam::Integer(limit as i64));
        sql.push_str(&format!(
            " ORDER BY julianday(smd.submission_date) DESC, smd.id DESC LIMIT {lim}"
        ));

        query.sql = sql;
        tracing::debug!("Relational query: {} ({} params)", query.sql, query.params.len());
        query
    }

    /// Filter expression for the engine, `None` when nothing constrains
    pub fn filter_expr(&self, predicates: &Predicates) -> Option<FilterExpr> {
        let mut clauses = Vec::new();

        match predicates.modules.as_slice() {
            [] => {}
            [only] => clauses.push(FilterExpr::eq("module_name", only.as_str())),
            many => clauses.push(FilterExpr::In {
                field: "module_name".to_string(),
                values: many.iter().map(|m| FilterValue::from(m.as_str())).collect(),
            }),
        }

        if let Some(range) = &predicates.date_range {
            let (lower, upper) = range.bounds();
            clauses.push(FilterExpr::compare("submitted_at", CompareOp::Ge, lower.timestamp()));
            clauses.push(FilterExpr::compare("submitted_at", CompareOp::Lt, upper.timestamp()));
        }

        if let Some(urgency) = &predicates.urgency {
            clauses.push(FilterExpr::eq("urgency", urgency.as_str()));
        }

        for field in &predicates.present {
            clauses.push(FilterExpr::is_not_null(field.as_str()));
        }

        match clauses.len() {
            0 => None,
            1 => clauses.pop(),
            _ => Some(FilterExpr::And(clauses)),
        }
    }

    /// Rendered engine filter
    pub fn filter(&self, predicates: &Predicates) -> Option<String> {
        let rendered = self.filter_expr(predicates).map(|expr| expr.to_string());
        if let Some(filter) = &rendered {
            tracing::debug!("Engine filter: {}", filter);
        }
        rendered
    }
}

fn like_pattern(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() + 2);
    escaped.push('%');
    for ch in text.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

fn json_path(label: &str) -> String {
    format!("$.\"{}\"", label.replace('\\', "\\\\").replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> StructuredQueryBuilder {
        let rules: PromotionRules = toml::from_str(
            r#"
            vehicle_registration = ["Registration number"]
            victim_name = ["Name of the victim", "Name"]
            "#,
        )
        .unwrap();
        StructuredQueryBuilder::new(Arc::new(rules))
    }

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_empty_predicates() {
        let b = builder();
        let predicates = Predicates::default();
        assert!(predicates.is_empty());
        assert_eq!(b.filter(&predicates), None);

        let query = b.relational(&predicates, 20);
        assert!(!query.sql.contains("WHERE"));
        assert_eq!(query.params, vec![SqlParam::Integer(20)]);
    }

    #[test]
    fn test_filter_for_single_module_and_presence() {
        let predicates = Predicates {
            modules: vec!["Motor Vehicle Theft".into()],
            present: vec![FilterField::Promoted(PromotedField::VehicleRegistration)],
            ..Default::default()
        };
        assert_eq!(
            builder().filter(&predicates).unwrap(),
            "module_name = 'Motor Vehicle Theft' AND vehicle_registration IS NOT NULL"
        );
    }

    #[test]
    fn test_filter_for_many_modules() {
        let predicates = Predicates {
            modules: vec!["Arson".into(), "Death".into()],
            ..Default::default()
        };
        assert_eq!(
            builder().filter(&predicates).unwrap(),
            "module_name IN ['Arson', 'Death']"
        );
    }

    #[test]
    fn test_date_range_is_half_open_in_utc() {
        let range = DateRange::new(day(2025, 6, 1), day(2025, 6, 30));
        let (lower, upper) = range.bounds();
        assert_eq!(lower.to_rfc3339(), "2025-06-01T00:00:00+00:00");
        assert_eq!(upper.to_rfc3339(), "2025-07-01T00:00:00+00:00");

        let predicates = Predicates {
            date_range: Some(range),
            ..Default::default()
        };
        let filter = builder().filter(&predicates).unwrap();
        assert_eq!(
            filter,
            format!(
                "submitted_at >= {} AND submitted_at < {}",
                lower.timestamp(),
                upper.timestamp()
            )
        );
    }

    #[test]
    fn test_relational_binds_every_value() {
        let hostile = "x' OR 1=1 --";
        let predicates = Predicates {
            modules: vec![hostile.into()],
            text: Some("50%_off".into()),
            urgency: Some(Urgency::High),
            present: vec![FilterField::Promoted(PromotedField::VictimName)],
            ..Default::default()
        };
        let query = builder().relational(&predicates, 5);

        assert!(!query.sql.contains(hostile));
        assert!(!query.sql.contains("Name of the victim"));
        assert_eq!(query.params[0], SqlParam::Text(hostile.into()));
        assert_eq!(query.params[1], SqlParam::Text(r"%50\%\_off%".into()));
        assert_eq!(query.params[2], SqlParam::Text("High".into()));
        assert_eq!(query.params[3], SqlParam::Text("$.\"Name of the victim\"".into()));
        assert_eq!(query.params[4], SqlParam::Text("$.\"Name\"".into()));
        assert_eq!(query.params[5], SqlParam::Integer(5));
        assert!(query.sql.ends_with("LIMIT ?6"));
    }

    #[test]
    fn test_unmapped_promoted_field_matches_nothing() {
        let predicates = Predicates {
            present: vec![FilterField::Promoted(PromotedField::GbvType)],
            ..Default::default()
        };
        let query = builder().relational(&predicates, 10);
        assert!(query.sql.contains("WHERE 0"));
    }

    #[test]
    fn test_filter_field_parse() {
        assert_eq!(
            FilterField::parse("location"),
            Some(FilterField::Core(CoreField::Location))
        );
        assert_eq!(
            FilterField::parse("suspect_name"),
            Some(FilterField::Promoted(PromotedField::SuspectName))
        );
        assert_eq!(FilterField::parse("shoe_size"), None);
    }

    #[test]
    fn test_blank_text_is_ignored() {
        let predicates = Predicates {
            text: Some("   ".into()),
            ..Default::default()
        };
        assert!(predicates.is_empty());
        assert_eq!(predicates.query_text(), "");
    }
}
