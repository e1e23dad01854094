use super::*;
use crate::database::memory::faulty::{Fault, FaultyIndex};
use crate::database::vector_index::DocumentMetadata;
use crate::entity::SupportTicket;
use std::error::Error as _;
use tempfile::TempDir;

fn ticket(question: &str, description: &str, solution: &str) -> Record {
    Record::new()
        .with("Question", question)
        .with("Description", description)
        .with("Solution", solution)
}

fn sample_batch() -> Batch {
    Batch::new(vec![
        ticket(
            "printer out of toner",
            "the office printer shows a toner warning",
            "replace the toner cartridge",
        ),
        ticket(
            "vpn certificate expired",
            "remote access fails with certificate error",
            "renew the vpn certificate",
        ),
        ticket(
            "laptop battery drains fast",
            "battery lasts under an hour",
            "recalibrate the battery",
        ),
    ])
}

fn simple_batch(questions: &[&str]) -> Batch {
    Batch::new(
        questions
            .iter()
            .enumerate()
            .map(|(i, q)| ticket(q, &format!("d{}", i + 1), &format!("s{}", i + 1)))
            .collect(),
    )
}

async fn create_engine(temp_dir: &TempDir) -> RelationalEngine {
    let url = format!("sqlite://{}/kb.db", temp_dir.path().display());
    RelationalEngine::new(&url, "sample_kbase", Arc::new(SupportTicket))
        .await
        .expect("should open relational engine")
}

fn wire(engine: RelationalEngine, timeout: Duration) -> (Store, Arc<FaultyIndex>) {
    let index = Arc::new(FaultyIndex::new());
    let vectorizer = Vectorizer::new(
        Arc::clone(&index) as Arc<dyn VectorIndex>,
        Arc::new(SupportTicket),
        timeout,
    );
    (Store::new(engine, vectorizer), index)
}

async fn create_test_store() -> (TempDir, Store, Arc<FaultyIndex>) {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let (store, index) = wire(create_engine(&temp_dir).await, Duration::from_secs(10));
    store.on_init().await.expect("should reconcile empty store");
    (temp_dir, store, index)
}

async fn count_rows_of_version(store: &Store, version: i64) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM sample_kbase WHERE version = ?")
        .bind(version)
        .fetch_one(store.engine().pool().expect("engine is configured"))
        .await
        .expect("should count rows directly")
}

#[tokio::test]
async fn get_follows_the_current_version() {
    let (_temp_dir, store, _index) = create_test_store().await;

    let first = store
        .store_dataframe(simple_batch(&["q1", "q2", "q3"]))
        .await
        .expect("should store version 1");
    assert_eq!(first.version, 1);

    let rows = store.get("Question", "q1").await;
    assert_eq!(rows, vec![ticket("q1", "d1", "s1")]);

    let second = store
        .store_dataframe(simple_batch(&["Q1", "Q2", "Q3"]))
        .await
        .expect("should store version 2");
    assert_eq!(second.version, 2);

    assert!(store.get("Question", "q1").await.is_empty());
    assert_eq!(
        store.get("Question", "Q1").await,
        vec![ticket("Q1", "d1", "s1")]
    );
    assert_eq!(store.current_version().await, Some(2));
}

#[tokio::test]
async fn load_after_store_returns_exactly_the_batch() {
    let (_temp_dir, store, _index) = create_test_store().await;
    store
        .store_dataframe(simple_batch(&["old"]))
        .await
        .expect("should store version 1");

    let batch = sample_batch();
    let stored = store
        .store_dataframe(batch.clone())
        .await
        .expect("should store version 2");

    let loaded = store.engine().load().await.expect("should load");
    assert_eq!(
        loaded.iter().map(|r| r.record.clone()).collect::<Vec<_>>(),
        batch.records
    );
    assert!(loaded.iter().all(|r| r.version == stored.version && r.vectorized));
    assert!(stored.version > 1);
}

#[tokio::test]
async fn similar_entries_round_trip_to_rows() {
    let (_temp_dir, store, _index) = create_test_store().await;
    let batch = sample_batch();
    store
        .store_dataframe(batch.clone())
        .await
        .expect("should store batch");

    let rows = store
        .get_entries_similar_to_problem("vpn certificate expired", &SearchConfig::default().with_k(1))
        .await
        .expect("should search");

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].record, batch.records[1]);

    let documents = store
        .similarity_search("battery", &SearchConfig::default())
        .await
        .expect("should search");
    assert_eq!(documents.len(), 3);
    assert!(documents[0].text.contains("battery"));
}

#[tokio::test]
async fn similar_entries_are_deduplicated_and_current() {
    let (_temp_dir, store, _index) = create_test_store().await;
    store
        .store_dataframe(sample_batch())
        .await
        .expect("should store version 1");
    let current = store
        .store_dataframe(sample_batch())
        .await
        .expect("should store version 2");

    // A second document for the same row, as left behind by an interrupted catch-up
    let duplicate = store.vectorizer().to_document(
        &sample_batch().records[0],
        current.version,
        current.ids[0],
    );
    store
        .vectorizer()
        .index(vec![duplicate])
        .await
        .expect("should index duplicate");

    let rows = store
        .get_entries_similar_to_problem("printer toner", &SearchConfig::default().with_k(10))
        .await
        .expect("should search");

    let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
    assert_eq!(ids.len(), 3);
    assert_eq!(ids[0], current.ids[0]);
    assert!(rows.iter().all(|r| r.version == current.version));
}

#[tokio::test]
async fn clear_old_versions_leaves_one_version_on_each_side() {
    let (_temp_dir, store, index) = create_test_store().await;
    for round in 0..3 {
        store
            .store_dataframe(simple_batch(&[&format!("q{}", round)]))
            .await
            .expect("should store batch");
    }

    let report = store.clear_old_versions().await.expect("should gc");
    assert_eq!(report.current_version, Some(3));
    assert_eq!(report.rows_deleted, 2);
    assert_eq!(report.documents_deleted, 2);
    assert_eq!(index.optimizations(), 1, "deletes should compact the index");

    let versions = store.engine().versions().await.expect("should list versions");
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].version, 3);

    let document_versions: HashSet<i64> = store
        .vectorizer()
        .list_metadata(None)
        .await
        .expect("should list metadata")
        .into_iter()
        .map(|m| m.version)
        .collect();
    assert_eq!(document_versions, HashSet::from([3]));

    let again = store.clear_old_versions().await.expect("should gc again");
    assert_eq!(again.rows_deleted, 0);
    assert_eq!(again.documents_deleted, 0);
    assert_eq!(index.optimizations(), 1, "nothing deleted, nothing to compact");
}

#[tokio::test]
async fn failed_indexing_rolls_back_the_version() {
    let (_temp_dir, store, index) = create_test_store().await;
    store
        .store_dataframe(simple_batch(&["q1"]))
        .await
        .expect("should store version 1");

    index.set_fault(Fault::RejectAdds);
    let err = store
        .store_dataframe(simple_batch(&["q2", "q3"]))
        .await
        .expect_err("indexing should fail");
    assert!(matches!(err, KbError::VectorIndex(_)));

    assert_eq!(count_rows_of_version(&store, 2).await, 0);
    assert_eq!(store.current_version().await, Some(1));
    assert_eq!(store.get("Question", "q1").await.len(), 1);

    index.set_fault(Fault::None);
    let next = store
        .store_dataframe(simple_batch(&["q4"]))
        .await
        .expect("should store after failure");
    assert_eq!(next.version, 3);
}

#[tokio::test]
async fn partially_indexed_documents_are_removed_on_rollback() {
    let (_temp_dir, store, index) = create_test_store().await;

    index.set_fault(Fault::IndexThenFail);
    store
        .store_dataframe(sample_batch())
        .await
        .expect_err("index reports failure after writing");

    assert_eq!(count_rows_of_version(&store, 1).await, 0);
    assert_eq!(index.count().await.expect("should count"), 0);
    assert!(store.is_empty().await);
}

#[tokio::test]
async fn stalled_indexing_times_out_and_rolls_back() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let (store, index) = wire(create_engine(&temp_dir).await, Duration::from_millis(50));

    index.set_fault(Fault::Stall(Duration::from_secs(30)));
    let err = store
        .store_dataframe(sample_batch())
        .await
        .expect_err("indexing should time out");

    assert!(err.to_string().contains("timed out"));
    assert_eq!(count_rows_of_version(&store, 1).await, 0);
}

#[tokio::test]
async fn failed_rollback_keeps_both_causes() {
    let (_temp_dir, store, index) = create_test_store().await;
    store
        .store_dataframe(simple_batch(&["q1"]))
        .await
        .expect("should store version 1");

    sqlx::query("CREATE TRIGGER no_deletes BEFORE DELETE ON sample_kbase BEGIN SELECT RAISE(ABORT, 'deletes disabled'); END")
        .execute(store.engine().pool().expect("engine is configured"))
        .await
        .expect("should create trigger");

    index.set_fault(Fault::RejectAdds);
    let err = store
        .store_dataframe(simple_batch(&["q2"]))
        .await
        .expect_err("indexing and rollback should fail");

    match &err {
        KbError::RollbackFailure {
            version,
            reason,
            vectorization,
        } => {
            assert_eq!(*version, 2);
            assert!(reason.contains("deletes disabled"));
            assert!(matches!(**vectorization, KbError::VectorIndex(_)));
        }
        other => panic!("expected RollbackFailure, got {:?}", other),
    }

    let source = err.source().expect("rollback failure keeps its cause");
    assert_eq!(source.to_string(), "Vector index error: index unavailable");
}

#[tokio::test]
async fn startup_vectorizes_rows_left_behind() {
    let temp_dir = TempDir::new().expect("should create temp dir");

    // Rows committed relationally, then the process died before indexing
    let engine = create_engine(&temp_dir).await;
    engine
        .store(&sample_batch())
        .await
        .expect("should store rows");
    engine.close().await;

    let (store, index) = wire(create_engine(&temp_dir).await, Duration::from_secs(10));
    let report = store.on_init().await.expect("should reconcile");

    assert_eq!(report.loaded_rows, 3);
    assert_eq!(report.catch_up, CatchUpReport { indexed: 3, failed: 0 });
    assert_eq!(index.count().await.expect("should count"), 3);
    assert!(store.rows().await.iter().all(|row| row.vectorized));

    let rows = store
        .get_entries_similar_to_problem("laptop battery", &SearchConfig::default().with_k(1))
        .await
        .expect("should search");
    assert_eq!(rows[0].record.get("Question"), Some("laptop battery drains fast"));
}

#[tokio::test]
async fn catch_up_skips_rows_that_fail() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let engine = create_engine(&temp_dir).await;
    engine
        .store(&simple_batch(&["fine", "poison", "also fine"]))
        .await
        .expect("should store rows");

    let (store, index) = wire(engine, Duration::from_secs(10));
    index.set_fault(Fault::RejectText("poison".to_string()));

    let report = store.on_init().await.expect("should reconcile");
    assert_eq!(report.catch_up, CatchUpReport { indexed: 2, failed: 1 });

    let consistency = store.consistency_report().await.expect("should validate");
    assert_eq!(consistency.pending_rows.len(), 1);
    assert!(consistency.is_consistent);

    index.set_fault(Fault::None);
    let retry = store.on_init().await.expect("should reconcile again");
    assert_eq!(retry.catch_up, CatchUpReport { indexed: 1, failed: 0 });
    assert_eq!(index.count().await.expect("should count"), 3);
}

#[tokio::test]
async fn startup_collects_old_versions() {
    let temp_dir = TempDir::new().expect("should create temp dir");
    let (store, _index) = wire(create_engine(&temp_dir).await, Duration::from_secs(10));
    store.on_init().await.expect("should reconcile");
    store
        .store_dataframe(simple_batch(&["q1"]))
        .await
        .expect("should store version 1");
    store
        .store_dataframe(simple_batch(&["q2", "q3"]))
        .await
        .expect("should store version 2");
    store.close().await;

    let (reopened, index) = wire(create_engine(&temp_dir).await, Duration::from_secs(10));
    let report = reopened.on_init().await.expect("should reconcile");

    assert_eq!(report.gc.current_version, Some(2));
    assert_eq!(report.gc.rows_deleted, 1);
    assert_eq!(report.loaded_rows, 2);

    // The in-memory index starts empty, so both current rows are indexed again
    assert_eq!(report.requeued, 2);
    assert_eq!(report.catch_up.indexed, 2);
    assert_eq!(index.optimizations(), 1);
}

#[tokio::test]
async fn repair_removes_orphans_and_restores_missing_documents() {
    let (_temp_dir, store, index) = create_test_store().await;
    let stored = store
        .store_dataframe(sample_batch())
        .await
        .expect("should store batch");

    store
        .vectorizer()
        .index(vec![Document {
            text: "left over".to_string(),
            metadata: DocumentMetadata {
                db_id: 999,
                version: stored.version,
            },
        }])
        .await
        .expect("should index orphan");
    store
        .vectorizer()
        .delete_rows(vec![stored.ids[1]])
        .await
        .expect("should delete a document");

    let report = store.consistency_report().await.expect("should validate");
    assert!(!report.is_consistent);
    assert_eq!(report.missing_in_index, vec![stored.ids[1]]);
    assert_eq!(
        report.orphaned_in_index,
        vec![DocumentMetadata {
            db_id: 999,
            version: stored.version
        }]
    );

    let repair = store.repair().await.expect("should repair");
    assert_eq!(repair.orphans_deleted, 1);
    assert_eq!(repair.rows_requeued, 1);
    assert_eq!(repair.catch_up.indexed, 1);

    assert!(
        store
            .consistency_report()
            .await
            .expect("should validate")
            .is_consistent
    );
    assert_eq!(index.count().await.expect("should count"), 3);
}

#[tokio::test]
async fn reads_degrade_gracefully() {
    let (_temp_dir, store, _index) = create_test_store().await;

    assert!(store.is_empty().await);
    assert_eq!(store.current_version().await, None);
    assert!(
        store
            .get_entries_similar_to_problem("anything", &SearchConfig::default())
            .await
            .expect("empty store searches")
            .is_empty()
    );
    assert_eq!(
        store.clear_old_versions().await.expect("should gc"),
        GcReport::default()
    );

    store
        .store_dataframe(sample_batch())
        .await
        .expect("should store batch");
    assert!(store.get("Priority", "high").await.is_empty());
}

#[tokio::test]
async fn unconfigured_store_refuses_writes() {
    let engine = RelationalEngine::unconfigured("sample_kbase", Arc::new(SupportTicket))
        .expect("valid table name");
    let (store, index) = wire(engine, Duration::from_secs(10));

    let report = store.on_init().await.expect("should reconcile");
    assert_eq!(report, ReconcileReport::default());

    let err = store
        .store_dataframe(sample_batch())
        .await
        .expect_err("nothing to write to");
    assert!(matches!(err, KbError::StoreFailure(_)));
    assert_eq!(index.count().await.expect("should count"), 0);
}
