//! Heuristic predicates from a free-text question
//!
//! Used when the structured path runs without caller-supplied predicates.
//! Recognizes module names from the schema registry, urgency phrases,
//! relative date windows and a few field-presence phrases.

use crate::error::{ObsearchError, Result};
use crate::query::{DateRange, FilterField, Predicates};
use crate::records::{PromotedField, Urgency};
use crate::schema::SchemaSnapshot;
use chrono::{Datelike, Days, NaiveDate, Utc};
use regex::Regex;

pub struct PredicateExtractor {
    today: Option<NaiveDate>,
    urgency: Regex,
    last_days: Regex,
    presence: Vec<(Regex, PromotedField)>,
}

impl PredicateExtractor {
    pub fn new() -> Result<Self> {
        Ok(Self {
            today: None,
            urgency: build(r"(?i)\b(high|medium|low)[\s-]+(?:urgency|priority)\b|\b(urgent)\b")?,
            last_days: build(r"(?i)\b(?:last|past)\s+(\d{1,4})\s+days?\b")?,
            presence: vec![
                (
                    build(r"(?i)\bwith\s+(?:a\s+|an\s+)?(?:named\s+|known\s+)?suspects?\b")?,
                    PromotedField::SuspectName,
                ),
                (
                    build(r"(?i)\bwith\s+(?:a\s+|the\s+)?(?:registration|number\s+plate|plate)s?\b")?,
                    PromotedField::VehicleRegistration,
                ),
                (
                    build(r"(?i)\bcause\s+of\s+death\b")?,
                    PromotedField::CauseOfDeath,
                ),
            ],
        })
    }

    /// Pin "today" for relative dates
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    /// Anchor for relative windows
    pub fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Utc::now().date_naive())
    }

    pub fn extract(&self, question: &str, schemas: &SchemaSnapshot) -> Predicates {
        let mut predicates = Predicates::default();

        for module in schemas.modules() {
            let pattern = format!(r"(?i)\b{}\b", regex::escape(module.name.trim()));
            if Regex::new(&pattern).is_ok_and(|re| re.is_match(question))
                && !predicates.modules.contains(&module.name)
            {
                predicates.modules.push(module.name.clone());
            }
        }

        if let Some(caps) = self.urgency.captures(question) {
            predicates.urgency = match (caps.get(1), caps.get(2)) {
                (Some(level), _) => Urgency::parse(level.as_str()),
                (None, Some(_)) => Some(Urgency::High),
                _ => None,
            };
        }

        predicates.date_range = self.date_range(question);

        for (pattern, field) in &self.presence {
            if pattern.is_match(question) {
                predicates.present.push(FilterField::Promoted(*field));
            }
        }

        tracing::debug!("Extracted predicates: {:?}", predicates);
        predicates
    }

    fn date_range(&self, question: &str) -> Option<DateRange> {
        let today = self.today();
        let lower = question.to_lowercase();
        let back = |days: u64| today.checked_sub_days(Days::new(days)).unwrap_or(today);

        if let Some(caps) = self.last_days.captures(&lower) {
            let days: u64 = caps[1].parse().ok()?;
            return Some(DateRange::new(back(days.saturating_sub(1)), today));
        }
        if contains_word(&lower, "yesterday") {
            return Some(DateRange::single_day(back(1)));
        }
        if contains_word(&lower, "today") {
            return Some(DateRange::single_day(today));
        }
        if lower.contains("last week") || lower.contains("past week") {
            return Some(DateRange::new(back(6), today));
        }
        if lower.contains("last month") || lower.contains("past month") {
            return Some(DateRange::new(back(29), today));
        }
        if lower.contains("this month") {
            return Some(DateRange::new(today.with_day(1).unwrap_or(today), today));
        }
        if lower.contains("this year") {
            return Some(DateRange::new(today.with_ordinal(1).unwrap_or(today), today));
        }
        None
    }
}

fn contains_word(text: &str, word: &str) -> bool {
    text.split(|c: char| !c.is_alphanumeric()).any(|w| w == word)
}

fn build(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| ObsearchError::Config(format!("Invalid question pattern '{}': {}", pattern, e)))
}
