//! CLI command definitions and subcommands

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::dispatcher::Endpoint;
use crate::jobs::DEFAULT_QUERY_MAX_TOKENS;
use crate::neighbors::DEFAULT_K;
use crate::results::DEFAULT_CHUNK_SIZE;

/// querycurate - search-query curation for e-commerce catalogs
#[derive(Parser)]
#[command(
    name = "qc",
    about = "Build, dispatch and post-process rate-limited OpenAI jobs for search-query curation",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Write one embedding request per product
    EmbedJobs {
        /// Products file (.jsonl)
        #[arg(long)]
        products: PathBuf,

        /// Requests file to write
        #[arg(long)]
        out: PathBuf,

        /// Embedding model
        #[arg(long, default_value = "text-embedding-3-small")]
        model: String,

        /// Product fields to embed, in order
        #[arg(long, value_delimiter = ',', default_value = "title,description")]
        keys: Vec<String>,

        /// Product field holding the id
        #[arg(long, default_value = "item_id")]
        id_key: String,

        /// Read at most this many product lines
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Write one query-generation request per product
    QueryJobs {
        /// Products file (.jsonl)
        #[arg(long)]
        products: PathBuf,

        /// Requests file to write
        #[arg(long)]
        out: PathBuf,

        /// Chat model
        #[arg(long, default_value = "gpt-4o-mini")]
        model: String,

        /// Product fields shown to the model, in order
        #[arg(long, value_delimiter = ',', default_value = "title,description")]
        keys: Vec<String>,

        /// Product field holding the id
        #[arg(long, default_value = "item_id")]
        id_key: String,

        /// Product field holding the category path
        #[arg(long, default_value = "main_category")]
        category_key: String,

        /// Completion budget per request
        #[arg(long, default_value_t = DEFAULT_QUERY_MAX_TOKENS)]
        max_tokens: u64,

        /// Read at most this many product lines
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Run a requests file against the API under the model's rate limits
    Dispatch {
        /// Requests file (.jsonl)
        #[arg(long)]
        requests: PathBuf,

        /// Results file to append to
        #[arg(long)]
        results: PathBuf,

        /// Model whose limits apply
        #[arg(long)]
        model: String,

        /// API the requests target
        #[arg(long, value_enum, default_value_t = EndpointArg::Embedding)]
        endpoint: EndpointArg,

        /// Override the configured endpoint URL
        #[arg(long)]
        url: Option<String>,
    },

    /// Pull embeddings out of a results file into chunk files
    ExtractEmbeddings {
        /// Results file written by `dispatch`
        #[arg(long)]
        results: PathBuf,

        /// Directory for chunk_{i}.jsonl files
        #[arg(long)]
        out_dir: PathBuf,

        /// Metadata field holding the id
        #[arg(long, default_value = "item_id")]
        id_key: String,

        /// Rows per chunk file
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
    },

    /// Pull generated query pairs out of a results file
    ExtractQueries {
        /// Results file written by `dispatch`
        #[arg(long)]
        results: PathBuf,

        /// Queries file to write
        #[arg(long)]
        out: PathBuf,

        /// Metadata field holding the id
        #[arg(long, default_value = "item_id")]
        id_key: String,
    },

    /// Find the nearest products for every embedded product
    Neighbors {
        /// Directory of chunk_{i}.jsonl files
        #[arg(long)]
        chunks: PathBuf,

        /// Neighbors file to write
        #[arg(long)]
        out: PathBuf,

        /// Neighbors per product, counting the product itself
        #[arg(short, long, default_value_t = DEFAULT_K)]
        k: usize,

        /// Products searched per batch
        #[arg(long, default_value_t = 5000)]
        batch_size: usize,
    },
}

/// Endpoint choice on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EndpointArg {
    Embedding,
    Chat,
}

impl From<EndpointArg> for Endpoint {
    fn from(arg: EndpointArg) -> Self {
        match arg {
            EndpointArg::Embedding => Endpoint::Embeddings,
            EndpointArg::Chat => Endpoint::ChatCompletions,
        }
    }
}
