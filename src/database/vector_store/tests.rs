use super::*;
use crate::loader::SourceKind;
use tempfile::TempDir;

const MODEL: &str = "test-model";

fn entry(chunk_id: &str, document_id: &str, vector: Vec<f32>) -> IndexEntry {
    IndexEntry {
        chunk_id: chunk_id.to_string(),
        document_id: document_id.to_string(),
        source_uri: format!("docs/{}.txt", document_id),
        ordinal: 0,
        text: format!("text of {}", chunk_id),
        char_span: CharSpan { start: 0, end: 10 },
        page: None,
        model_id: MODEL.to_string(),
        vector,
    }
}

fn record(document_id: &str, chunk_count: usize) -> DocumentRecord {
    DocumentRecord {
        source_uri: format!("docs/{}.txt", document_id),
        source_kind: SourceKind::File,
        fingerprint: format!("fp-{}", document_id),
        chunk_count,
        indexed_at: Utc::now(),
    }
}

async fn empty_store(dimension: Option<usize>, metric: Metric) -> (TempDir, VectorStore) {
    let dir = TempDir::new().expect("should create TempDir successfully");
    let store = VectorStore::create(&dir.path().join("index"), MODEL, dimension, metric)
        .await
        .expect("create should succeed");
    (dir, store)
}

/// Store an entry batch along with records for every document in it
async fn index(store: &mut VectorStore, entries: &[IndexEntry]) {
    store.upsert(entries).await.expect("valid batch");
    let mut documents: Vec<&str> = entries.iter().map(|e| e.document_id.as_str()).collect();
    documents.dedup();
    for document_id in documents {
        let count = entries
            .iter()
            .filter(|e| e.document_id == document_id)
            .count();
        store
            .record_document(document_id, record(document_id, count))
            .await
            .expect("record should succeed");
    }
}

async fn three_chunk_store() -> (TempDir, VectorStore) {
    let (dir, mut store) = empty_store(Some(2), Metric::Cosine).await;
    index(
        &mut store,
        &[
            entry("chunk-a", "doc-1", vec![0.99, 0.05]),
            entry("chunk-c", "doc-1", vec![0.7, 0.7]),
            entry("chunk-b", "doc-2", vec![0.04, 1.0]),
        ],
    )
    .await;
    (dir, store)
}

fn ids(results: &[QueryResult]) -> Vec<&str> {
    results.iter().map(|result| result.chunk_id.as_str()).collect()
}

#[tokio::test]
async fn nearest_neighbors_ranked() {
    let (_dir, store) = three_chunk_store().await;

    let results = store
        .search(&[1.0, 0.0], 2, None)
        .await
        .expect("search should succeed");

    assert_eq!(ids(&results), vec!["chunk-a", "chunk-c"]);
    assert!(results[0].score > results[1].score);
    assert!(results[0].score > 0.99);
    assert_eq!(results[0].text, "text of chunk-a");
    assert_eq!(results[0].source_uri, "docs/doc-1.txt");
    assert_eq!(results[0].document_id, "doc-1");
}

#[tokio::test]
async fn search_returns_at_most_k_sorted() {
    let (_dir, store) = three_chunk_store().await;

    for k in 1..=5 {
        let results = store
            .search(&[0.3, 0.8], k, None)
            .await
            .expect("search should succeed");
        assert_eq!(results.len(), k.min(3));
        assert!(results.windows(2).all(|pair| pair[0].score >= pair[1].score));
    }
}

#[tokio::test]
async fn zero_k_and_empty_index() {
    let (_dir, store) = three_chunk_store().await;
    assert!(
        store
            .search(&[1.0, 0.0], 0, None)
            .await
            .expect("k = 0 is fine")
            .is_empty()
    );

    let (_empty_dir, empty) = empty_store(None, Metric::Cosine).await;
    assert!(empty.is_empty());
    assert!(
        empty
            .search(&[1.0, 0.0, 0.0], 3, None)
            .await
            .expect("empty index")
            .is_empty()
    );
}

#[tokio::test]
async fn ties_break_by_chunk_id() {
    let (_dir, mut store) = empty_store(Some(2), Metric::Cosine).await;
    index(
        &mut store,
        &[
            entry("zeta", "doc", vec![1.0, 0.0]),
            entry("alpha", "doc", vec![1.0, 0.0]),
            entry("mid", "doc", vec![1.0, 0.0]),
        ],
    )
    .await;

    let results = store
        .search(&[1.0, 0.0], 3, None)
        .await
        .expect("search should succeed");
    assert_eq!(ids(&results), vec!["alpha", "mid", "zeta"]);
}

#[tokio::test]
async fn inner_product_metric() {
    let (_dir, mut store) = empty_store(Some(2), Metric::InnerProduct).await;
    index(
        &mut store,
        &[
            entry("long", "doc", vec![3.0, 0.0]),
            entry("short", "doc", vec![1.0, 0.0]),
            entry("zero", "doc", vec![0.0, 0.0]),
        ],
    )
    .await;

    let results = store
        .search(&[1.0, 0.0], 3, None)
        .await
        .expect("zero vectors are allowed for inner product");
    assert_eq!(ids(&results), vec!["long", "short", "zero"]);
    assert!(results[0].score > results[1].score);
}

#[tokio::test]
async fn zero_query_rejected_under_cosine() {
    let (_dir, store) = three_chunk_store().await;

    let result = store.search(&[0.0, 0.0], 3, None).await;

    let Err(RagError::Validation(message)) = result else {
        panic!("a zero query has no cosine similarity to anything");
    };
    assert!(message.contains("zero vector"), "{}", message);
}

#[tokio::test]
async fn upsert_is_idempotent() {
    let (_dir, mut store) = three_chunk_store().await;
    let before = store
        .search(&[0.6, 0.4], 3, None)
        .await
        .expect("search should succeed");

    store
        .upsert(&[entry("chunk-a", "doc-1", vec![0.99, 0.05])])
        .await
        .expect("valid batch");

    assert_eq!(store.len(), 3);
    assert_eq!(
        store
            .search(&[0.6, 0.4], 3, None)
            .await
            .expect("search should succeed"),
        before
    );
}

#[tokio::test]
async fn upsert_replaces_by_chunk_id() {
    let (_dir, mut store) = three_chunk_store().await;
    let mut replacement = entry("chunk-b", "doc-2", vec![1.0, 0.0]);
    replacement.text = "updated".to_string();

    store.upsert(&[replacement]).await.expect("valid batch");

    assert_eq!(store.len(), 3);
    let results = store
        .search(&[1.0, 0.0], 1, Some(&SearchFilter::Document("doc-2".to_string())))
        .await
        .expect("search should succeed");
    assert_eq!(results[0].text, "updated");
}

#[tokio::test]
async fn malformed_entry_rejects_whole_batch() {
    let (_dir, mut store) = three_chunk_store().await;

    let cases = vec![
        entry("", "doc-9", vec![1.0, 0.0]),
        entry("bad-dim", "doc-9", vec![1.0, 0.0, 0.0]),
        entry("bad-value", "doc-9", vec![f32::NAN, 0.0]),
        entry("bad-inf", "doc-9", vec![f32::INFINITY, 0.0]),
        entry("zero", "doc-9", vec![0.0, 0.0]),
        IndexEntry {
            model_id: "other-model".to_string(),
            ..entry("bad-model", "doc-9", vec![1.0, 0.0])
        },
    ];

    for bad in cases {
        let bad_id = bad.chunk_id.clone();
        let result = store
            .upsert(&[entry("good", "doc-9", vec![0.5, 0.5]), bad])
            .await;

        let Err(RagError::Validation(message)) = result else {
            panic!("expected validation error for {:?}", bad_id);
        };
        assert!(message.contains("entry 1"), "{}", message);
        assert_eq!(store.len(), 3);
    }
}

#[tokio::test]
async fn first_upsert_fixes_dimension() {
    let (_dir, mut store) = empty_store(None, Metric::Cosine).await;
    assert_eq!(store.dimension(), None);

    index(&mut store, &[entry("a", "doc", vec![1.0, 0.0, 0.0])]).await;
    assert_eq!(store.dimension(), Some(3));

    assert!(matches!(
        store.upsert(&[entry("b", "doc", vec![1.0, 0.0])]).await,
        Err(RagError::Validation(_))
    ));
    assert!(matches!(
        store.search(&[1.0, 0.0], 1, None).await,
        Err(RagError::Validation(_))
    ));
}

#[tokio::test]
async fn first_batch_must_agree_on_dimension() {
    let (_dir, mut store) = empty_store(None, Metric::Cosine).await;
    let result = store
        .upsert(&[
            entry("a", "doc", vec![1.0, 0.0]),
            entry("b", "doc", vec![1.0, 0.0, 0.0]),
        ])
        .await;

    assert!(matches!(result, Err(RagError::Validation(_))));
    assert_eq!(store.dimension(), None);
    assert!(store.is_empty());
}

#[tokio::test]
async fn validate_does_not_write() {
    let (_dir, store) = empty_store(None, Metric::Cosine).await;

    let dimension = store
        .validate(&[entry("a", "doc", vec![1.0, 0.0])])
        .expect("valid batch");

    assert_eq!(dimension, 2);
    assert!(store.is_empty());
    assert_eq!(store.dimension(), None);
    assert!(matches!(
        store.validate(&[entry("b", "doc", vec![0.0, 0.0])]),
        Err(RagError::Validation(_))
    ));
}

#[tokio::test]
async fn filters() {
    let (_dir, store) = three_chunk_store().await;

    let by_document = store
        .search(
            &[1.0, 0.0],
            5,
            Some(&SearchFilter::Document("doc-2".to_string())),
        )
        .await
        .expect("search should succeed");
    assert_eq!(ids(&by_document), vec!["chunk-b"]);

    let by_source = store
        .search(
            &[0.0, 1.0],
            5,
            Some(&SearchFilter::Source("docs/doc-1.txt".to_string())),
        )
        .await
        .expect("search should succeed");
    assert_eq!(ids(&by_source), vec!["chunk-c", "chunk-a"]);
}

#[tokio::test]
async fn unrecorded_chunks_are_not_returned() {
    let (_dir, mut store) = three_chunk_store().await;
    store
        .upsert(&[entry("orphan", "doc-3", vec![1.0, 0.0])])
        .await
        .expect("valid batch");

    let results = store
        .search(&[1.0, 0.0], 4, None)
        .await
        .expect("search should succeed");
    assert!(!ids(&results).contains(&"orphan"));
}

#[tokio::test]
async fn delete_document() {
    let (_dir, mut store) = three_chunk_store().await;

    assert_eq!(store.delete("doc-1").await.expect("delete should succeed"), 2);
    assert_eq!(store.len(), 1);
    assert!(store.document("doc-1").is_none());
    assert_eq!(
        ids(&store
            .search(&[1.0, 0.0], 3, None)
            .await
            .expect("search should succeed")),
        vec!["chunk-b"]
    );

    assert_eq!(store.delete("doc-1").await.expect("delete should succeed"), 0);
}

#[tokio::test]
async fn model_check() {
    let (_dir, store) = three_chunk_store().await;
    store.check_model(MODEL).expect("same model");

    let error = store.check_model("another-model").expect_err("different model");
    assert!(matches!(error, RagError::ModelMismatch { .. }));
    assert!(error.is_fatal());
}

#[tokio::test]
async fn documents_for_source() {
    let (_dir, mut store) = empty_store(Some(2), Metric::Cosine).await;
    for (id, uri) in [("d1", "a.txt"), ("d2", "b.txt"), ("d3", "a.txt")] {
        store
            .record_document(
                id,
                DocumentRecord {
                    source_uri: uri.to_string(),
                    ..record(id, 0)
                },
            )
            .await
            .expect("record should succeed");
    }

    assert_eq!(store.documents_for_source("a.txt"), vec!["d1", "d3"]);
    assert!(store.documents_for_source("c.txt").is_empty());
    assert_eq!(store.documents().count(), 3);
}

#[tokio::test]
async fn status_counts() {
    let (_dir, store) = three_chunk_store().await;

    let status = store.status();
    assert_eq!(status.model_id, MODEL);
    assert_eq!(status.metric, Metric::Cosine);
    assert_eq!(status.dimension, Some(2));
    assert_eq!(status.document_count, 2);
    assert_eq!(status.chunk_count, 3);
    assert!(status.updated_at >= status.created_at);
}

#[tokio::test]
async fn load_round_trip() {
    let (dir, mut store) = three_chunk_store().await;
    let query = [0.4, 0.9];
    let expected = store
        .search(&query, 3, None)
        .await
        .expect("search should succeed");
    store.persist().await.expect("persist should succeed");
    let status = store.status();
    drop(store);

    let loaded = VectorStore::load(&dir.path().join("index"))
        .await
        .expect("load should succeed");

    assert_eq!(
        loaded
            .search(&query, 3, None)
            .await
            .expect("search should succeed"),
        expected
    );
    let reloaded = loaded.status();
    assert_eq!(reloaded.model_id, status.model_id);
    assert_eq!(reloaded.metric, status.metric);
    assert_eq!(reloaded.dimension, status.dimension);
    assert_eq!(reloaded.document_count, status.document_count);
    assert_eq!(reloaded.chunk_count, status.chunk_count);
    let document = loaded.document("doc-1").expect("doc-1 should be recorded");
    assert_eq!(document.fingerprint, "fp-doc-1");
    assert_eq!(document.chunk_count, 2);
    assert_eq!(document.source_kind, SourceKind::File);
}

#[tokio::test]
async fn deletes_survive_reload() {
    let (dir, mut store) = three_chunk_store().await;
    store.delete("doc-2").await.expect("delete should succeed");
    drop(store);

    let loaded = VectorStore::load(&dir.path().join("index"))
        .await
        .expect("load should succeed");
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded.status().document_count, 1);
}

#[tokio::test]
async fn create_replaces_existing_index() {
    let (dir, store) = three_chunk_store().await;
    drop(store);

    let root = dir.path().join("index");
    let fresh = VectorStore::create(&root, "other-model", None, Metric::InnerProduct)
        .await
        .expect("create should succeed");
    assert!(fresh.is_empty());
    assert_eq!(fresh.documents().count(), 0);

    let loaded = VectorStore::load(&root).await.expect("load should succeed");
    assert_eq!(loaded.model_id(), "other-model");
    assert_eq!(loaded.metric(), Metric::InnerProduct);
}

#[tokio::test]
async fn load_missing_index() {
    let dir = TempDir::new().expect("should create TempDir successfully");
    let result = VectorStore::load(&dir.path().join("index")).await;

    let Err(error) = result else {
        panic!("missing index must not load");
    };
    assert!(matches!(error, RagError::IndexUnavailable(_)));
    assert!(error.is_fatal());
}

#[tokio::test]
async fn load_corrupt_metadata() {
    let dir = TempDir::new().expect("should create TempDir successfully");
    let root = dir.path().join("index");
    fs::create_dir_all(&root).expect("create index dir");
    fs::write(root.join(METADATA_FILE), "not a database").expect("write file");

    assert!(matches!(
        VectorStore::load(&root).await,
        Err(RagError::IndexUnavailable(_))
    ));
}

#[tokio::test]
async fn load_rejects_dimension_mismatch() {
    let (dir, store) = three_chunk_store().await;
    drop(store);
    let root = dir.path().join("index");

    let metadata = IndexMetadata::open(&root.join(METADATA_FILE), false)
        .await
        .expect("metadata should open");
    metadata.set_dimension(3).await.expect("update should succeed");

    assert!(matches!(
        VectorStore::load(&root).await,
        Err(RagError::IndexUnavailable(_))
    ));
}
