//! CLI command definitions and parsing
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "obsearch",
    version,
    about = "Hybrid search and question answering over occurrence book records",
    long_about = "obsearch flattens occurrence book records into a search index and answers \
                  questions by routing them to structured filtering, semantic similarity, \
                  or both."
)]
pub struct Cli {
    /// Global config file path (defaults to ~/.config/obsearch/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Flatten every record and load it into the search index
    Reindex {
        /// Delete and recreate the index first
        #[arg(long)]
        reset: bool,
    },

    /// Keyword search with optional filters
    Search {
        /// Search text (may be empty to list by filters)
        #[arg(default_value = "")]
        query: String,

        /// Restrict to these modules (repeatable)
        #[arg(short, long)]
        module: Vec<String>,

        /// Restrict to one urgency level
        #[arg(short, long)]
        urgency: Option<String>,

        /// First submission day, inclusive (YYYY-MM-DD)
        #[arg(long)]
        from: Option<NaiveDate>,

        /// Last submission day, inclusive (YYYY-MM-DD)
        #[arg(long)]
        to: Option<NaiveDate>,

        /// Only records carrying a value for this field (repeatable)
        #[arg(long = "has", value_name = "FIELD")]
        has: Vec<String>,

        /// Page number, starting at 1
        #[arg(short, long, default_value = "1")]
        page: usize,

        /// Show results in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Answer a question from the indexed records
    Ask {
        /// Question to ask
        question: String,

        /// Skip classification and synthesis, print the retrieved context
        #[arg(long)]
        no_llm: bool,

        /// Show the answer and its context in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show which retrieval strategy a question would use
    Classify {
        question: String,
    },

    /// Describe module schemas
    Schema {
        /// Describe a single module by id
        #[arg(short, long)]
        module: Option<i64>,
    },

    /// Run smoke-test queries against the index
    Verify {
        /// Queries to probe (defaults to a built-in set)
        queries: Vec<String>,
    },

    /// Load a JSON fixture of modules and records into the database
    Seed {
        fixture: PathBuf,
    },

    /// Show database and index counts
    Status,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Validate configuration file
    Validate {
        /// Path to config file (defaults to standard location)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Initialize default configuration
    Init {
        /// Force overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

impl Cli {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
