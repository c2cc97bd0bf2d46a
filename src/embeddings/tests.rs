use super::normalize as normalize_impl;
use super::tokenize as tokenize_impl;
use super::truncate_input as truncate_input_impl;
use super::*;

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[test]
fn truncate_input() {
    assert_eq!(truncate_input_impl("short", 10), "short");
    assert_eq!(truncate_input_impl("exactly10!", 10), "exactly10!");
    assert_eq!(truncate_input_impl("abcdefghijkl", 4), "abcd");
    assert_eq!(truncate_input_impl("ünïcödé", 3), "ünï");
    assert_eq!(truncate_input_impl("anything", 0), "");
}

#[test]
fn tokenize() {
    let tokens: Vec<String> = tokenize_impl("Flow-rate (GPM): 42, Ströme!").collect();
    assert_eq!(tokens, vec!["flow", "rate", "gpm", "42", "ströme"]);
    assert_eq!(tokenize_impl("  ... ").count(), 0);
}

#[test]
fn normalize() {
    let mut vector = vec![3.0, 4.0];
    normalize_impl(&mut vector);
    assert!((vector[0] - 0.6).abs() < 1e-6);
    assert!((vector[1] - 0.8).abs() < 1e-6);

    let mut zero = vec![0.0, 0.0];
    normalize_impl(&mut zero);
    assert_eq!(zero, vec![0.0, 0.0]);
}

#[test]
fn hashed_embedder_shape() {
    let embedder = HashedEmbedder::new(64);
    assert_eq!(embedder.model_id(), "hashed-64");
    assert_eq!(embedder.dimension(), Some(64));

    let vector = embedder
        .embed("pressure transmitter calibration")
        .expect("hashing never fails");
    assert_eq!(vector.len(), 64);
    assert!((cosine(&vector, &vector) - 1.0).abs() < 1e-5);
}

#[test]
fn hashed_embedder_single_and_batch_agree() {
    let embedder = HashedEmbedder::new(128);
    let texts = vec![
        "Open the bypass valve.".to_string(),
        "Close the isolation valve.".to_string(),
    ];

    let batch = embedder.embed_batch(&texts).expect("hashing never fails");
    for (text, vector) in texts.iter().zip(&batch) {
        assert_eq!(&embedder.embed(text).expect("hashing never fails"), vector);
    }
}

#[test]
fn hashed_embedder_similarity() {
    let embedder = HashedEmbedder::new(384);
    let query = embedder
        .embed("how do I calibrate the pressure transmitter")
        .expect("hashing never fails");
    let related = embedder
        .embed("To calibrate a pressure transmitter, apply a known pressure.")
        .expect("hashing never fails");
    let unrelated = embedder
        .embed("Invoices are archived after ninety days.")
        .expect("hashing never fails");

    assert!(cosine(&query, &related) > cosine(&query, &unrelated));
}

#[test]
fn hashed_embedder_is_case_insensitive() {
    let embedder = HashedEmbedder::new(32);
    assert_eq!(
        embedder.embed("Valve Sizing").expect("hashing never fails"),
        embedder.embed("valve sizing").expect("hashing never fails")
    );
}

#[test]
fn hashed_embedder_without_tokens() {
    let embedder = HashedEmbedder::new(16);
    let vector = embedder.embed("?!").expect("hashing never fails");
    assert!(vector.iter().all(|value| *value == 0.0));
}

#[test]
fn build_embedder_from_config() {
    let mut config = Config::default();
    config.embedding.provider = EmbeddingProvider::Hashed;
    config.embedding.dimension = 48;

    let embedder = build_embedder(&config).expect("hashed embedder always builds");
    assert_eq!(embedder.model_id(), "hashed-48");
    assert_eq!(embedder.dimension(), Some(48));

    config.embedding.provider = EmbeddingProvider::Ollama;
    let embedder = build_embedder(&config).expect("ollama embedder builds without a server");
    assert_eq!(embedder.model_id(), "nomic-embed-text:latest");
    assert_eq!(embedder.dimension(), None);
}
