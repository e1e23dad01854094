use super::*;
use crate::config::{EmbeddingProvider, VectorStoreKind};
use std::fs;
use tempfile::TempDir;

const SEED: &str = r#"[
    {"Question": "printer out of toner", "Description": "the office printer shows a toner warning", "Solution": "replace the toner cartridge"},
    {"Question": "vpn certificate expired", "Description": "remote access fails with certificate error", "Solution": "renew the vpn certificate"},
    {"Question": "laptop battery drains fast", "Description": "battery lasts under an hour", "Solution": "recalibrate the battery"}
]"#;

fn test_config(temp_dir: &TempDir) -> Config {
    let mut config = Config::local(temp_dir.path().to_path_buf());
    config.vector_store.kind = VectorStoreKind::Memory;
    config.embedding.provider = EmbeddingProvider::Hashing;
    config.embedding.embedding_dimension = 256;
    config
}

fn write_seed(temp_dir: &TempDir) -> std::path::PathBuf {
    let path = temp_dir.path().join("seed.json");
    fs::write(&path, SEED).expect("should write seed file");
    path
}

#[tokio::test]
async fn initialize_registers_and_seeds_the_configured_store() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let mut config = test_config(&temp_dir);
    config.store.seed_file = Some(write_seed(&temp_dir));

    let context = AppContext::initialize(config)
        .await
        .expect("should initialize context");

    assert_eq!(context.manager().names().await, vec!["sample_kbase".to_string()]);

    let base = context
        .default_knowledge_base()
        .await
        .expect("default knowledge base should be registered");
    assert_eq!(base.store().rows().await.len(), 3);

    let answers = base
        .query("vpn certificate expired")
        .await
        .expect("should query");
    assert!(!answers.is_empty());
    assert_eq!(
        answers[0],
        "Q:vpn certificate expired;Desc:remote access fails with certificate error;Sol.:renew the vpn certificate"
    );

    context.shutdown().await;
    assert!(context.manager().names().await.is_empty());
}

#[tokio::test]
async fn populate_if_empty_only_loads_once() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let seed = write_seed(&temp_dir);
    let context = AppContext::initialize(test_config(&temp_dir))
        .await
        .expect("should initialize context");
    let base = context
        .default_knowledge_base()
        .await
        .expect("should be registered");

    let first = base
        .populate_if_empty(&seed)
        .await
        .expect("should populate")
        .expect("empty store should be populated");
    assert_eq!(first.version, 1);
    assert_eq!(first.ids.len(), 3);

    let second = base.populate_if_empty(&seed).await.expect("should skip");
    assert!(second.is_none());
    assert_eq!(base.store().current_version().await, Some(1));
}

#[tokio::test]
async fn unknown_knowledge_base_is_an_error() {
    let manager = KnowledgeBaseManager::new();
    let err = manager.get("missing").await.expect_err("nothing registered");
    assert!(matches!(err, KbError::NoSuchKnowledgeBase(name) if name == "missing"));
}

#[tokio::test]
async fn query_on_empty_store_returns_nothing() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let context = AppContext::initialize(test_config(&temp_dir))
        .await
        .expect("should initialize context");
    let base = context
        .default_knowledge_base()
        .await
        .expect("should be registered");

    assert!(base.query("anything").await.expect("should query").is_empty());
}
