//! qc - search-query curation toolkit
//!
//! CLI entry point: builds request files, dispatches them under rate limits
//! and post-processes the results.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use tracing::{debug, info};

use querycurate::cli::{Cli, Command};
use querycurate::config::Config;
use querycurate::dispatcher::{
    DEFAULT_CONTEXT_TOKENS, Dispatcher, Endpoint, JsonlSink, TokenCostEstimator, read_jobs,
};
use querycurate::jobs::{create_embedding_jobs, create_query_jobs, load_products, save_jsonl};
use querycurate::llm::OpenAiClient;
use querycurate::neighbors::{batch_search_and_save, build_index, load_chunks};
use querycurate::prompts::PromptLoader;
use querycurate::results::{Extraction, extract_embeddings, extract_queries};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>) -> Result<()> {
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("querycurate")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    // Priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::File::create(log_dir.join("querycurate.log")).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_log_level = Config::load_log_level(cli.config.as_ref());
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref()).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    debug!(command = ?cli.command, "main: dispatching command");
    match cli.command {
        Command::EmbedJobs {
            products,
            out,
            model,
            keys,
            id_key,
            limit,
        } => cmd_embed_jobs(&config, &products, &out, &model, &keys, &id_key, limit),
        Command::QueryJobs {
            products,
            out,
            model,
            keys,
            id_key,
            category_key,
            max_tokens,
            limit,
        } => {
            let products = load_products(&products, limit)?;
            let loader = PromptLoader::new(Path::new("."));
            let jobs = create_query_jobs(&loader, &products, &model, &keys, &id_key, &category_key, max_tokens)?;
            save_jsonl(&jobs, &out)?;
            println!(
                "{} Wrote {} query jobs to {}",
                "✓".green(),
                jobs.len().to_string().cyan(),
                out.display()
            );
            Ok(())
        }
        Command::Dispatch {
            requests,
            results,
            model,
            endpoint,
            url,
        } => cmd_dispatch(&config, &requests, &results, &model, endpoint.into(), url).await,
        Command::ExtractEmbeddings {
            results,
            out_dir,
            id_key,
            chunk_size,
        } => {
            let extraction = extract_embeddings(&results, &id_key, chunk_size, &out_dir)?;
            print_extraction("embeddings", &extraction);
            Ok(())
        }
        Command::ExtractQueries { results, out, id_key } => {
            let extraction = extract_queries(&results, &id_key, &out)?;
            print_extraction("query pairs", &extraction);
            Ok(())
        }
        Command::Neighbors {
            chunks,
            out,
            k,
            batch_size,
        } => {
            let rows = load_chunks(&chunks)?;
            let index = build_index(&rows)?;
            let written = batch_search_and_save(&index, &rows, k, batch_size, &out)?;
            println!(
                "{} Wrote neighbors for {} items to {}",
                "✓".green(),
                written.to_string().cyan(),
                out.display()
            );
            Ok(())
        }
    }
}

/// Token encoder for a model, falling back to cl100k when it has no limits entry
fn encoder_for(config: &Config, model: &str, endpoint: Endpoint) -> Result<TokenCostEstimator> {
    match config.model_limits(model) {
        Ok(limits) => TokenCostEstimator::new(&limits.token_encoding, endpoint, limits.context_tokens),
        Err(_) => {
            info!(%model, "No limits configured for model, using cl100k_base");
            TokenCostEstimator::new("cl100k_base", endpoint, DEFAULT_CONTEXT_TOKENS)
        }
    }
}

fn cmd_embed_jobs(
    config: &Config,
    products: &Path,
    out: &Path,
    model: &str,
    keys: &[String],
    id_key: &str,
    limit: Option<usize>,
) -> Result<()> {
    debug!(?products, ?out, %model, "cmd_embed_jobs: called");
    let products = load_products(products, limit)?;
    let encoder = encoder_for(config, model, Endpoint::Embeddings)?;
    let jobs = create_embedding_jobs(&products, model, keys, id_key, &encoder);
    save_jsonl(&jobs, out)?;
    println!(
        "{} Wrote {} embedding jobs to {}",
        "✓".green(),
        jobs.len().to_string().cyan(),
        out.display()
    );
    Ok(())
}

async fn cmd_dispatch(
    config: &Config,
    requests: &Path,
    results: &Path,
    model: &str,
    endpoint: Endpoint,
    url: Option<String>,
) -> Result<()> {
    debug!(?requests, ?results, %model, ?endpoint, "cmd_dispatch: called");

    // Missing .env is fine; the key may already be in the environment
    dotenvy::dotenv().ok();
    config.validate()?;

    let url = url.unwrap_or_else(|| config.openai.url_for(endpoint).to_string());
    let endpoint = Endpoint::from_url(&url).unwrap_or(endpoint);
    let dispatch_config = config.dispatcher_config(model)?;
    let limits = config.model_limits(model)?;

    let estimator = TokenCostEstimator::new(&limits.token_encoding, endpoint, limits.context_tokens)?;
    let client = OpenAiClient::new(url.clone(), config.api_key()?, dispatch_config.request_timeout())
        .context("Failed to build HTTP client")?;
    let dispatcher = Dispatcher::new(dispatch_config, Arc::new(client), Box::new(estimator))?;

    let (jobs, skipped) = read_jobs(requests, dispatcher.config().max_attempts)?;
    let total = jobs.len();
    let mut sink = JsonlSink::open(results)?;

    println!(
        "Dispatching {} requests to {} ({} rpm, {} tpm)",
        total.to_string().cyan(),
        url,
        dispatcher.config().max_requests_per_minute,
        dispatcher.config().max_tokens_per_minute
    );
    let stats = dispatcher.run(jobs, &mut sink).await?;

    println!(
        "{} {} succeeded, {} failed, {} retried",
        "✓".green(),
        stats.total_succeeded.to_string().green(),
        if stats.total_failed > 0 {
            stats.total_failed.to_string().red()
        } else {
            stats.total_failed.to_string().normal()
        },
        stats.total_retried
    );
    if stats.rate_limit_errors > 0 {
        println!(
            "{} {} rate limit errors; consider a lower scale-factor",
            "!".yellow(),
            stats.rate_limit_errors
        );
    }
    if skipped > 0 {
        println!("{} {} malformed request lines skipped", "!".yellow(), skipped);
    }
    println!("Results in {}", sink.path().display().to_string().dimmed());
    Ok(())
}

fn print_extraction(what: &str, extraction: &Extraction) {
    println!(
        "{} Extracted {} {} into {} file(s)",
        "✓".green(),
        extraction.written.to_string().cyan(),
        what,
        extraction.files.len()
    );
    if !extraction.failed_ids.is_empty() {
        let ids: Vec<String> = extraction.failed_ids.iter().map(|id| id.to_string()).collect();
        println!("{} {} failed: {}", "!".yellow(), ids.len(), ids.join(", ").dimmed());
    }
    if extraction.malformed > 0 {
        println!("{} {} malformed lines skipped", "!".yellow(), extraction.malformed);
    }
}
