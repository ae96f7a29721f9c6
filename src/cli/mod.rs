//! CLI command definitions and parsing
use crate::retrieval::RetrieverKindChoice;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "stratum",
    version,
    author = "neur0map",
    about = "Hierarchical multi-path retrieval over per-knowledge-base document indices",
    long_about = "Stratum answers natural-language queries with ranked document fragments. Each \
                  knowledge base keeps a flat chunk index and, once rebuilt, a hierarchical index \
                  of group summaries over chunks that drives entity-aware multi-path search."
)]
pub struct Cli {
    /// Global config file path (defaults to ~/.config/stratum/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Configuration profile to apply
    #[arg(short, long, global = true)]
    pub profile: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Search one or more knowledge bases
    Search {
        /// Search query text
        query: String,

        /// Knowledge base ids to search
        #[arg(short, long = "kb", required = true, num_args = 1..)]
        kb: Vec<String>,

        /// Maximum number of results to return
        #[arg(short = 'n', long)]
        top_k: Option<usize>,

        /// Retriever kind: auto, hierarchical, keyword_ensemble or flat_vector
        #[arg(long)]
        kind: Option<RetrieverKindChoice>,

        /// Drop results scoring below this
        #[arg(long)]
        threshold: Option<f32>,

        /// Show results in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Rebuild the hierarchical index of a knowledge base
    Rebuild {
        /// Knowledge base id
        kb: String,

        /// Rebuild even when the fragment count barely changed
        #[arg(short, long)]
        force: bool,

        /// Start the rebuild and poll its status until it finishes
        #[arg(long)]
        background: bool,
    },

    /// Show registered knowledge bases and their index state
    Status {
        /// Only this knowledge base
        kb: Option<String>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show {
        /// Show only a specific section
        #[arg(short, long)]
        section: Option<String>,
    },

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
