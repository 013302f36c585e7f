//! obsearch - hybrid search over occurrence book records
//!
//! Flattens heterogeneous incident records into uniform documents, bulk-loads
//! them into a search index, and answers free-text questions by routing them
//! to structured filtering, semantic similarity, or both.

pub mod cli;
pub mod config;
pub mod deadline;
pub mod error;
pub mod flatten;
pub mod index;
pub mod outcome;
pub mod query;
pub mod records;
pub mod retrieval;
pub mod schema;
pub mod storage;

pub use error::{ObsearchError, Result};
