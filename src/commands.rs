use anyhow::{Context, Result};
use std::path::Path;
use tracing::{info, warn};

use crate::config::{Config, EmbeddingProvider};
use crate::database::sqlite::models::KnowledgeRow;
use crate::embeddings::OllamaClient;
use crate::knowledge::AppContext;
use crate::vectorizer::SearchConfig;

/// Write the effective configuration to `config.toml`
#[inline]
pub fn init_config(config: &Config) -> Result<()> {
    let path = config.config_file_path();
    if path.exists() {
        println!("Configuration already exists: {}", path.display());
        println!("Use 'qna-kbase config --show' to inspect it.");
        return Ok(());
    }

    config.save()?;
    println!("Wrote default configuration to {}", path.display());
    Ok(())
}

/// Store the batch file at `path` as a new version
#[inline]
pub async fn ingest_file(context: &AppContext, path: &Path) -> Result<()> {
    let base = context.default_knowledge_base().await?;
    let batch = crate::ingest::load_batch(path)
        .with_context(|| format!("Failed to load batch file {}", path.display()))?;

    info!("Ingesting {} records from {}", batch.len(), path.display());
    let stored = base
        .store()
        .store_dataframe(batch)
        .await
        .context("Failed to store batch")?;

    println!(
        "Stored {} rows as version {}",
        stored.ids.len(),
        stored.version
    );
    Ok(())
}

/// Print current-version rows whose `field` equals `value`
#[inline]
pub async fn get_entries(context: &AppContext, field: &str, value: &str) -> Result<()> {
    let base = context.default_knowledge_base().await?;
    let records = base.store().get(field, value).await;

    if records.is_empty() {
        println!("No entries with {} = {:?}", field, value);
        return Ok(());
    }

    for record in &records {
        println!("{}", serde_json::to_string_pretty(record)?);
    }
    Ok(())
}

/// Print the rows most similar to `query`
#[inline]
pub async fn search_entries(context: &AppContext, query: &str, limit: usize) -> Result<()> {
    let base = context.default_knowledge_base().await?;
    let config = SearchConfig::from_settings(&context.config().search).with_k(limit);

    let rows = base
        .store()
        .get_entries_similar_to_problem(query, &config)
        .await
        .context("Search failed")?;

    if rows.is_empty() {
        println!("No matching entries found.");
        return Ok(());
    }

    println!("Found {} entries:", rows.len());
    println!();
    for (rank, row) in rows.iter().enumerate() {
        print_row(rank + 1, row);
    }
    Ok(())
}

fn print_row(rank: usize, row: &KnowledgeRow) {
    println!("{}. Row {} (version {})", rank, row.id, row.version);
    for (field, value) in row.record.fields() {
        println!("   {}: {}", field, value);
    }
    println!();
}

/// Print the formatted answers the knowledge base returns for `query`
#[inline]
pub async fn ask(context: &AppContext, query: &str) -> Result<()> {
    let base = context.default_knowledge_base().await?;
    let answers = base.query(query).await?;

    if answers.is_empty() {
        println!("The knowledge base has no answer for this question.");
    }
    for answer in answers {
        println!("{}", answer);
    }
    Ok(())
}

/// Remove rows and documents of superseded versions
#[inline]
pub async fn collect_garbage(context: &AppContext) -> Result<()> {
    let base = context.default_knowledge_base().await?;
    let report = base.store().clear_old_versions().await?;

    match report.current_version {
        Some(version) => {
            println!("Current version: {}", version);
            println!("   Rows deleted: {}", report.rows_deleted);
            println!("   Documents deleted: {}", report.documents_deleted);
        }
        None => println!("The knowledge base is empty, nothing to collect."),
    }
    Ok(())
}

/// Fix orphaned, missing and duplicated vector documents
#[inline]
pub async fn repair(context: &AppContext) -> Result<()> {
    let base = context.default_knowledge_base().await?;
    let report = base.store().repair().await?;

    println!("Repair finished:");
    println!("   Orphaned documents deleted: {}", report.orphans_deleted);
    println!("   Rows requeued: {}", report.rows_requeued);
    println!("   Rows vectorized: {}", report.catch_up.indexed);
    if report.catch_up.failed > 0 {
        warn!("{} rows could not be vectorized", report.catch_up.failed);
        println!("   Rows still failing: {}", report.catch_up.failed);
    }
    Ok(())
}

/// Show versions, index state and embedding service health
#[inline]
pub async fn show_status(context: &AppContext) -> Result<()> {
    let config = context.config();
    let base = context.default_knowledge_base().await?;
    let store = base.store();

    println!("📊 Knowledge Base Status Report");
    println!("{}", "=".repeat(50));
    println!();

    println!("🗄️  Relational Store:");
    if store.engine().is_configured() {
        println!("   ✅ Table: {}", store.engine().table_name());
        println!("   📋 Schema: {}", store.schema().name());

        match store.engine().versions().await {
            Ok(versions) if versions.is_empty() => println!("   📭 No rows stored yet"),
            Ok(versions) => {
                for summary in versions {
                    println!(
                        "   📦 Version {}: {} rows, {} vectorized",
                        summary.version, summary.rows, summary.vectorized_rows
                    );
                }
            }
            Err(e) => println!("   ❌ Failed to list versions: {}", e),
        }

        if let Ok(Some(ledger)) = store.engine().version_ledger().await {
            println!(
                "   🔢 Last issued version: {} ({})",
                ledger.last_version,
                ledger.issued_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
        }
    } else {
        println!("   ⚠️  No connection string configured, the store is read-only and empty");
    }

    println!();
    println!("🔍 Vector Index:");
    println!("   Backend: {}", store.vectorizer().index_name());
    match store.vectorizer().count().await {
        Ok(count) => println!("   📄 Documents: {}", count),
        Err(e) => println!("   ❌ Failed to count documents: {}", e),
    }

    println!();
    println!("🤖 Embeddings:");
    match config.embedding.provider {
        EmbeddingProvider::Hashing => {
            println!(
                "   Local hashing model ({} dimensions)",
                config.embedding.embedding_dimension
            );
        }
        EmbeddingProvider::Ollama => match OllamaClient::new(&config.embedding) {
            Ok(client) => match client.health_check() {
                Ok(()) => {
                    println!(
                        "   ✅ Ollama: Connected ({}:{})",
                        config.embedding.host, config.embedding.port
                    );
                    println!("   📋 Model: {}", config.embedding.model);
                    println!("   🔢 Batch Size: {}", config.embedding.batch_size);
                }
                Err(e) => println!("   ⚠️  Ollama: Connected but unhealthy - {}", e),
            },
            Err(e) => println!("   ❌ Ollama: Failed to connect - {}", e),
        },
    }

    println!();
    println!("🔍 Consistency:");
    match store.consistency_report().await {
        Ok(report) => {
            println!("   📊 Relational rows: {}", report.relational_rows);
            println!("   📊 Vector documents: {}", report.vector_documents);
            if !report.pending_rows.is_empty() {
                println!("   ⏳ Waiting for vectorization: {}", report.pending_rows.len());
            }
            if report.is_consistent {
                println!("   ✅ Stores are consistent");
            } else {
                println!("   ⚠️  Consistency issues found:");
                if !report.missing_in_index.is_empty() {
                    println!("   🚫 Missing in index: {}", report.missing_in_index.len());
                }
                if !report.orphaned_in_index.is_empty() {
                    println!("   👻 Orphaned in index: {}", report.orphaned_in_index.len());
                }
                if !report.duplicated_in_index.is_empty() {
                    println!("   ♊ Duplicated in index: {}", report.duplicated_in_index.len());
                }
                println!("   Run 'qna-kbase repair' to fix them.");
            }
        }
        Err(e) => println!("   ❌ Failed to check consistency: {}", e),
    }

    Ok(())
}
