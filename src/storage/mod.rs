//! Relational source of modules and occurrence records
//!
//! The core only reads through [`RecordSource`]. [`Database`] is the SQLite
//! implementation; its seeding helpers exist for fixtures and the `seed`
//! command.

pub mod database;

use crate::error::Result;
use crate::query::RelationalQuery;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use database::{Database, DbPool, DbStats};

/// A `sub_module` row as stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleRow {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub description: Option<String>,
    /// JSON list of field definitions
    pub fields: Option<String>,
}

/// An occurrence row joined with its module and reporter, before decoding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRow {
    pub id: i64,
    pub case_number: Option<String>,
    pub submitted_at: Option<String>,
    pub module_id: i64,
    pub module_name: Option<String>,
    /// Attribute bag as stored JSON text
    pub form_data: Option<String>,
    pub location: Option<String>,
    pub urgency: Option<String>,
    pub narrative: Option<String>,
    pub reporter_first_name: Option<String>,
    pub reporter_last_name: Option<String>,
    pub reporter_id_number: Option<String>,
}

/// Record counts for one module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleStatistics {
    pub module_id: i64,
    pub module_name: Option<String>,
    pub total: usize,
    /// Records submitted at or after the `since` instant of the query
    pub recent: usize,
    pub high_urgency: usize,
}

/// Read-only access to the relational collaborator
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// All module definitions
    async fn module_rows(&self) -> Result<Vec<ModuleRow>>;

    /// Number of occurrence records available for indexing
    async fn count_records(&self) -> Result<usize>;

    /// One page of occurrence records, ordered by id
    async fn fetch_records(&self, offset: usize, limit: usize) -> Result<Vec<SourceRow>>;

    /// Execute a parameterized record query
    async fn run_query(&self, query: &RelationalQuery) -> Result<Vec<SourceRow>>;

    /// Per-module counts over every record, largest module first
    async fn module_statistics(&self, since: DateTime<Utc>) -> Result<Vec<ModuleStatistics>>;
}
