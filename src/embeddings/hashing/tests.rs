use super::*;

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[test]
fn embeddings_are_deterministic_and_normalised() {
    let embedder = HashingEmbedder::new(128);

    let first = embedder.embed_text("How do I connect to the VM?");
    let second = embedder.embed_text("How do I connect to the VM?");
    assert_eq!(first, second);
    assert_eq!(first.len(), 128);

    let norm = first.iter().map(|x| x * x).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() < 1e-5);
}

#[test]
fn shared_words_are_closer_than_unrelated_text() {
    let embedder = HashingEmbedder::new(256);

    let query = embedder.embed_text("printer is out of toner");
    let related = embedder.embed_text("Question: the printer shows toner empty");
    let unrelated = embedder.embed_text("Question: VPN certificate expired");

    assert!(cosine(&query, &related) > cosine(&query, &unrelated));
}

#[test]
fn empty_text_is_the_zero_vector() {
    let embedder = HashingEmbedder::new(16);
    assert!(embedder.embed_text("").iter().all(|x| *x == 0.0));
}

#[tokio::test]
async fn batch_preserves_input_order() {
    let embedder = HashingEmbedder::new(32);
    let texts = vec!["alpha".to_string(), "beta".to_string()];

    let embeddings = embedder
        .embed_batch(&texts)
        .await
        .expect("hashing never fails");

    assert_eq!(embeddings.len(), 2);
    assert_eq!(embeddings[0], embedder.embed_text("alpha"));
    assert_eq!(embeddings[1], embedder.embed_text("beta"));
}
