use super::document_id as document_id_impl;
use super::*;
use std::fs;
use tempfile::TempDir;

fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent dirs");
    }
    fs::write(&path, contents).expect("write file");
    path
}

#[test]
fn document_id_is_stable() {
    let first = document_id_impl("docs/a.txt", "Pump curves.");
    let second = document_id_impl("docs/a.txt", "Pump curves.");
    assert_eq!(first, second);
    assert_eq!(first.len(), 64);
    assert!(first.chars().all(|c| c.is_ascii_hexdigit()));

    assert_ne!(first, document_id_impl("docs/b.txt", "Pump curves."));
    assert_ne!(first, document_id_impl("docs/a.txt", "Pump curves!"));
    // The separator keeps uri/text splits from colliding
    assert_ne!(
        document_id_impl("ab", "c"),
        document_id_impl("a", "bc")
    );
}

#[test]
fn page_lookup() {
    let plain = Document::new("notes.txt", "no pages here", SourceKind::File);
    assert_eq!(plain.page_at(3), None);

    let paged =
        Document::new("manual.pdf", "0123456789", SourceKind::File).with_page_starts(vec![0, 4, 8]);
    assert_eq!(paged.page_at(0), Some(1));
    assert_eq!(paged.page_at(3), Some(1));
    assert_eq!(paged.page_at(4), Some(2));
    assert_eq!(paged.page_at(9), Some(3));
}

#[test]
fn source_parsing() {
    assert_eq!(
        Source::parse("https://docs.example.com/manual/").expect("url source"),
        Source::Web(Url::parse("https://docs.example.com/manual/").expect("valid url"))
    );
    assert_eq!(
        Source::parse("  ./docs  ").expect("path source"),
        Source::File(PathBuf::from("./docs"))
    );
    assert!(matches!(
        Source::parse("https://"),
        Err(RagError::Fetch { .. })
    ));

    let web = Source::parse("http://example.com/a").expect("url source");
    assert_eq!(web.kind(), SourceKind::Web);
    assert_eq!(web.to_string(), "http://example.com/a");
}

#[test]
fn load_single_file() {
    let dir = TempDir::new().expect("should create TempDir successfully");
    let path = write(dir.path(), "valves.txt", "Globe valves throttle flow.");

    let document = load_file(&path).expect("file should load");
    assert_eq!(document.raw_text, "Globe valves throttle flow.");
    assert_eq!(document.source_kind, SourceKind::File);
    assert_eq!(document.source_uri, path.display().to_string());
    assert_eq!(
        document.id,
        document_id_impl(&document.source_uri, &document.raw_text)
    );
}

#[test]
fn load_file_rejects_directory() {
    let dir = TempDir::new().expect("should create TempDir successfully");
    assert!(matches!(
        load_file(dir.path()),
        Err(RagError::Read { .. })
    ));
}

#[tokio::test]
async fn load_all_walks_directory() {
    let dir = TempDir::new().expect("should create TempDir successfully");
    write(dir.path(), "b.md", "# Heading\n\nBody text.");
    write(dir.path(), "a.txt", "Alpha document.");
    write(dir.path(), "nested/c.txt", "Nested document.");
    write(dir.path(), "diagram.dwg", "binary-ish");
    fs::write(dir.path().join("broken.txt"), [0xff_u8, 0xfe, 0xfd]).expect("write file");

    let loader = Loader::default();
    let report = loader
        .load_all(&[Source::File(dir.path().to_path_buf())])
        .await;

    let texts: Vec<&str> = report
        .documents
        .iter()
        .map(|document| document.raw_text.as_str())
        .collect();
    assert_eq!(
        texts,
        vec!["Alpha document.", "Heading\n\nBody text.", "Nested document."]
    );

    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].source_uri.ends_with("broken.txt"));
    assert!(matches!(report.failures[0].error, RagError::Read { .. }));

    assert_eq!(report.skipped.len(), 1);
    assert!(report.skipped[0].ends_with("diagram.dwg"));

    assert_eq!(report.seen_files.len(), 4);
    assert!(report.walk_complete);
}

#[tokio::test]
async fn load_all_missing_directory_is_incomplete() {
    let dir = TempDir::new().expect("should create TempDir successfully");
    let missing = dir.path().join("not-there");

    let report = Loader::default().load_all(&[Source::File(missing)]).await;

    assert!(report.documents.is_empty());
    assert_eq!(report.failures.len(), 1);
    assert!(!report.walk_complete);
}

#[tokio::test]
async fn cancelled_load_stops_before_walking() {
    let dir = TempDir::new().expect("should create TempDir successfully");
    write(dir.path(), "a.txt", "Alpha document.");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = Loader::default()
        .with_cancellation(cancel)
        .load_all(&[Source::File(dir.path().to_path_buf())])
        .await;

    assert!(report.cancelled);
    assert!(!report.walk_complete);
    assert!(report.documents.is_empty());
}

#[test]
fn cancelled_walk_stops_between_files() {
    let dir = TempDir::new().expect("should create TempDir successfully");
    write(dir.path(), "a.txt", "Alpha document.");
    write(dir.path(), "b.txt", "Beta document.");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = load_path(dir.path(), &cancel);

    assert!(report.cancelled);
    assert!(!report.walk_complete);
    assert!(report.documents.is_empty());
    assert!(report.seen_files.is_empty());
}

#[tokio::test]
async fn load_is_idempotent() {
    let dir = TempDir::new().expect("should create TempDir successfully");
    let path = write(dir.path(), "same.txt", "Unchanged content.");
    let loader = Loader::default();

    let first = loader
        .load(&Source::File(path.clone()))
        .await
        .expect("file should load");
    let second = loader
        .load(&Source::File(path))
        .await
        .expect("file should load");
    assert_eq!(first.id, second.id);
}

mod web {
    use serial_test::serial;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    use super::*;

    fn fast_loader() -> Loader {
        Loader::new(CrawlerConfig {
            rate_limit_ms: 1,
            retry_delay_ms: 10,
            max_retries: 0,
            ..Default::default()
        })
    }

    #[tokio::test]
    #[serial]
    async fn load_all_crawls_seed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                r#"<html><body><p>Seed page. <a href="/next">Next</a> <a href="/gone">Gone</a></p></body></html>"#,
                "text/html",
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/next"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("<html><body><p>Next page.</p></body></html>", "text/html"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let seed = Url::parse(&format!("{}/", server.uri())).expect("valid url");
        let report = fast_loader().load_all(&[Source::Web(seed)]).await;

        let texts: Vec<&str> = report
            .documents
            .iter()
            .map(|document| document.raw_text.as_str())
            .collect();
        assert_eq!(texts, vec!["Seed page. Next Gone", "Next page."]);
        assert!(
            report
                .documents
                .iter()
                .all(|document| document.source_kind == SourceKind::Web)
        );
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].source_uri.ends_with("/gone"));
        assert!(report.seen_files.is_empty());
    }

    #[tokio::test]
    #[serial]
    async fn cancelled_crawl_marks_report() {
        let server = MockServer::start().await;
        let links: String = (0..10)
            .map(|i| format!(r#"<a href="/p{}">Page {}</a>"#, i, i))
            .collect();
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(
                format!("<html><body><p>Seed page.</p>{}</body></html>", links),
                "text/html",
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("<html><body><p>Slow page.</p></body></html>", "text/html")
                    .set_delay(std::time::Duration::from_millis(200)),
            )
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let seed = Url::parse(&format!("{}/", server.uri())).expect("valid url");
        let start = std::time::Instant::now();
        let report = fast_loader()
            .with_cancellation(cancel)
            .load_all(&[Source::Web(seed)])
            .await;

        assert!(report.cancelled);
        assert!(!report.walk_complete);
        assert!(report.documents.len() < 11);
        assert!(start.elapsed() < std::time::Duration::from_millis(1500));
    }

    #[tokio::test]
    #[serial]
    async fn load_single_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/empty"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw("<html><body></body></html>", "text/html"),
            )
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/empty", server.uri())).expect("valid url");
        let result = fast_loader().load(&Source::Web(url)).await;
        assert!(matches!(result, Err(RagError::Fetch { .. })));
    }
}
