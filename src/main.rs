use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use qna_kbase::commands::{
    ask, collect_garbage, get_entries, ingest_file, init_config, repair, search_entries,
    show_status,
};
use qna_kbase::config::{Config, get_config_dir, show_config};
use qna_kbase::knowledge::AppContext;

#[derive(Parser)]
#[command(name = "qna-kbase")]
#[command(about = "A versioned question/answer knowledge base with vector search")]
#[command(version)]
struct Cli {
    /// Directory holding config.toml and the default databases
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration, or show the current one
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Store a JSON, JSON Lines or CSV batch file as a new version
    Ingest {
        /// Path to a .json, .jsonl or .csv file
        file: PathBuf,
    },
    /// Look up current entries by exact field value
    Get { field: String, value: String },
    /// Find the entries most similar to a problem description
    Search {
        query: String,
        /// Maximum number of entries to return
        #[arg(long, default_value_t = 4)]
        limit: usize,
    },
    /// Answer a question with formatted knowledge base entries
    Ask { query: String },
    /// Delete rows and documents of old versions
    Gc,
    /// Fix differences between the relational store and the vector index
    Repair,
    /// Show versions, index state and consistency
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config_dir = match cli.config_dir {
        Some(dir) => dir,
        None => get_config_dir()?,
    };
    let config = Config::load(&config_dir)?;

    if let Commands::Config { show } = cli.command {
        if show {
            show_config(&config)?;
        } else {
            init_config(&config)?;
        }
        return Ok(());
    }

    let context = AppContext::initialize(config).await?;

    let result = match cli.command {
        Commands::Config { .. } => Ok(()),
        Commands::Ingest { file } => ingest_file(&context, &file).await,
        Commands::Get { field, value } => get_entries(&context, &field, &value).await,
        Commands::Search { query, limit } => search_entries(&context, &query, limit).await,
        Commands::Ask { query } => ask(&context, &query).await,
        Commands::Gc => collect_garbage(&context).await,
        Commands::Repair => repair(&context).await,
        Commands::Status => show_status(&context).await,
    };

    context.shutdown().await;
    result
}
