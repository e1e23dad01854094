use super::*;
use crate::database::memory::InMemoryIndex;
use crate::database::memory::faulty::{Fault, FaultyIndex};
use crate::embeddings::HashingEmbedder;
use crate::entity::SupportTicket;

fn ticket(question: &str, solution: &str) -> Record {
    Record::new()
        .with("Question", question)
        .with("Description", "reported by the service desk")
        .with("Solution", solution)
}

fn vectorizer() -> Vectorizer {
    Vectorizer::new(
        Arc::new(InMemoryIndex::new(Arc::new(HashingEmbedder::new(128)))),
        Arc::new(SupportTicket),
        DEFAULT_INDEX_TIMEOUT,
    )
}

#[test]
fn documents_carry_row_identity() {
    let document = vectorizer().to_document(&ticket("q1", "s1"), 4, 17);

    assert_eq!(document.metadata, DocumentMetadata { db_id: 17, version: 4 });
    assert_eq!(
        document.text,
        "Question: q1\nDescription: reported by the service desk\nSolution: s1"
    );
}

#[tokio::test]
async fn search_respects_filter_and_threshold() {
    let vectorizer = vectorizer();
    vectorizer
        .index(vec![
            vectorizer.to_document(&ticket("printer out of toner", "replace cartridge"), 1, 1),
            vectorizer.to_document(&ticket("printer out of toner", "replace cartridge"), 2, 2),
            vectorizer.to_document(&ticket("vpn certificate expired", "renew it"), 2, 3),
        ])
        .await
        .expect("should index documents");

    let config = SearchConfig::default().with_filter(MetadataFilter::VersionEquals(2));
    let hits = vectorizer
        .search_with_scores("printer toner cartridge", &config)
        .await
        .expect("should search");
    assert!(hits.iter().all(|h| h.document.metadata.version == 2));
    assert_eq!(hits[0].document.metadata.db_id, 2);

    let strict = SearchConfig {
        score_threshold: Some(0.99),
        ..config
    };
    let documents = vectorizer
        .search("printer toner cartridge", &strict)
        .await
        .expect("should search");
    assert!(documents.is_empty());
}

#[tokio::test]
async fn gc_removes_only_older_versions() {
    let vectorizer = vectorizer();
    let documents = (1..=3)
        .map(|version| vectorizer.to_document(&ticket("q", "s"), version, version))
        .collect();
    vectorizer
        .index(documents)
        .await
        .expect("should index documents");

    assert_eq!(
        vectorizer
            .delete_versions_older_than(3)
            .await
            .expect("should gc"),
        2
    );
    assert_eq!(
        vectorizer
            .delete_versions_older_than(3)
            .await
            .expect("should gc"),
        0
    );
    assert_eq!(
        vectorizer.list_metadata(None).await.expect("should list"),
        vec![DocumentMetadata { db_id: 3, version: 3 }]
    );
}

#[tokio::test]
async fn index_errors_are_returned_unchanged() {
    let index = Arc::new(FaultyIndex::new());
    index.set_fault(Fault::RejectAdds);
    let vectorizer = Vectorizer::new(index, Arc::new(SupportTicket), DEFAULT_INDEX_TIMEOUT);

    let err = vectorizer
        .index(vec![vectorizer.to_document(&ticket("q", "s"), 1, 1)])
        .await
        .expect_err("index rejects adds");
    assert_eq!(err.to_string(), "Vector index error: index unavailable");
}

#[tokio::test]
async fn slow_index_times_out() {
    let index = Arc::new(FaultyIndex::new());
    index.set_fault(Fault::Stall(Duration::from_secs(30)));
    let vectorizer = Vectorizer::new(
        Arc::clone(&index) as Arc<dyn VectorIndex>,
        Arc::new(SupportTicket),
        Duration::from_millis(50),
    );

    let err = vectorizer
        .index(vec![vectorizer.to_document(&ticket("q", "s"), 1, 1)])
        .await
        .expect_err("stalled index should time out");
    assert!(err.to_string().contains("timed out"));
    assert_eq!(index.count().await.expect("should count"), 0);
}
