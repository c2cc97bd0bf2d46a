use super::*;
use crate::embeddings::chunking::CharSpan;
use tempfile::TempDir;

fn entry(chunk_id: &str, document_id: &str, page: Option<u32>, vector: Vec<f32>) -> IndexEntry {
    IndexEntry {
        chunk_id: chunk_id.to_string(),
        document_id: document_id.to_string(),
        source_uri: format!("https://docs.example.com/{}", document_id),
        ordinal: 2,
        text: format!("text of {}", chunk_id),
        char_span: CharSpan { start: 10, end: 20 },
        page,
        model_id: "test-model".to_string(),
        vector,
    }
}

async fn table_with_rows() -> (TempDir, ChunkTable) {
    let dir = TempDir::new().expect("should create TempDir successfully");
    let mut table = ChunkTable::connect(&dir.path().join("vectors"))
        .await
        .expect("connect should succeed");
    table.create(2).await.expect("create should succeed");
    table
        .upsert(&[
            entry("a", "doc-1", Some(4), vec![1.0, 0.0]),
            entry("b", "doc-2", None, vec![0.0, 1.0]),
            entry("c", "doc-it's", None, vec![0.6, 0.8]),
        ])
        .await
        .expect("upsert should succeed");
    (dir, table)
}

#[tokio::test]
async fn new_directory_has_no_table() {
    let dir = TempDir::new().expect("should create TempDir successfully");
    let table = ChunkTable::connect(&dir.path().join("vectors"))
        .await
        .expect("connect should succeed");

    assert!(!table.exists());
    assert_eq!(table.dimension(), None);
    assert_eq!(table.count().await.expect("count"), 0);
    table.delete_document("doc").await.expect("nothing to delete");
}

#[tokio::test]
async fn reconnect_reads_dimension_from_schema() {
    let (dir, table) = table_with_rows().await;
    drop(table);

    let reopened = ChunkTable::connect(&dir.path().join("vectors"))
        .await
        .expect("connect should succeed");
    assert!(reopened.exists());
    assert_eq!(reopened.dimension(), Some(2));
    assert_eq!(reopened.count().await.expect("count"), 3);
}

#[tokio::test]
async fn search_returns_row_metadata() {
    let (_dir, table) = table_with_rows().await;

    let results = table
        .search(&[1.0, 0.0], 1, Metric::Cosine, None)
        .await
        .expect("search should succeed");

    assert_eq!(results.len(), 1);
    let hit = &results[0];
    assert_eq!(hit.chunk_id, "a");
    assert_eq!(hit.document_id, "doc-1");
    assert_eq!(hit.source_uri, "https://docs.example.com/doc-1");
    assert_eq!(hit.ordinal, 2);
    assert_eq!(hit.page, Some(4));
    assert!((hit.score - 1.0).abs() < 1e-4);
}

#[tokio::test]
async fn merge_replaces_matching_chunk_ids() {
    let (_dir, table) = table_with_rows().await;

    table
        .upsert(&[entry("b", "doc-2", Some(1), vec![1.0, 0.0])])
        .await
        .expect("upsert should succeed");

    assert_eq!(table.count().await.expect("count"), 3);
    let results = table
        .search(
            &[1.0, 0.0],
            3,
            Metric::Cosine,
            Some(&SearchFilter::Document("doc-2".to_string())),
        )
        .await
        .expect("search should succeed");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].page, Some(1));
}

#[tokio::test]
async fn filters_quote_literals() {
    let (_dir, table) = table_with_rows().await;

    let results = table
        .search(
            &[0.0, 1.0],
            3,
            Metric::Cosine,
            Some(&SearchFilter::Document("doc-it's".to_string())),
        )
        .await
        .expect("search should succeed");
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].chunk_id, "c");

    let by_source = table
        .search(
            &[0.0, 1.0],
            3,
            Metric::Cosine,
            Some(&SearchFilter::Source(
                "https://docs.example.com/doc-2".to_string(),
            )),
        )
        .await
        .expect("search should succeed");
    assert_eq!(by_source.len(), 1);
    assert_eq!(by_source[0].chunk_id, "b");
}

#[tokio::test]
async fn delete_and_optimize() {
    let (_dir, table) = table_with_rows().await;

    table.delete_document("doc-1").await.expect("delete");
    table.optimize().await.expect("optimize");

    assert_eq!(table.count().await.expect("count"), 2);
    let results = table
        .search(&[1.0, 0.0], 3, Metric::Cosine, None)
        .await
        .expect("search should succeed");
    assert!(results.iter().all(|result| result.document_id != "doc-1"));
}

#[test]
fn sql_literal_escapes_quotes() {
    assert_eq!(sql_literal("plain"), "'plain'");
    assert_eq!(sql_literal("it's"), "'it''s'");
}
