use anyhow::{Context, Result};
use console::style;
use dialoguer::Input;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::RagError;
use crate::config::Config;
use crate::database::vector_store::VectorStore;
use crate::embeddings::{Embedder, build_embedder};
use crate::generation::{AnswerResult, Answerer, Generator, Grounding, OllamaGenerator};
use crate::indexer::{Indexer, SetupReport};
use crate::retrieval::Retriever;

/// Answerer over the persisted index, or `None` when there is no usable
/// index yet
#[inline]
pub async fn open_answerer(
    config: &Config,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
) -> crate::Result<Option<Answerer>> {
    let store = match VectorStore::load(&config.index_path()).await {
        Ok(store) => store,
        Err(RagError::IndexUnavailable(reason)) => {
            info!("Index unavailable: {}", reason);
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    let retriever = Retriever::new(
        embedder,
        Arc::new(RwLock::new(store)),
        config.retrieval.clone(),
    );
    Ok(Some(Answerer::new(
        retriever,
        generator,
        config.answer.clone(),
    )))
}

/// Answer a question against the persisted index.
///
/// A missing or unreadable index yields a "not indexed" answer instead of an
/// error, so callers can point the user at `setup`.
#[inline]
pub async fn answer_question(
    config: &Config,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn Generator>,
    question: &str,
    k: Option<usize>,
) -> crate::Result<AnswerResult> {
    match open_answerer(config, embedder, generator).await? {
        Some(answerer) => {
            answerer
                .answer(question, k.unwrap_or(config.retrieval.top_k))
                .await
        }
        None => Ok(AnswerResult::not_indexed()),
    }
}

/// Build or refresh the index from the configured sources
#[inline]
pub async fn run_setup(config_dir: &Path, rebuild: bool, cancel: CancellationToken) -> Result<()> {
    let config = Config::load(config_dir).context("Failed to load configuration")?;
    let embedder = build_embedder(&config)?;

    eprintln!(
        "{} Indexing {} with {}",
        style("→").cyan(),
        style(config.docs_path().display()).cyan(),
        style(embedder.model_id()).cyan()
    );
    if !config.sources.urls.is_empty() {
        eprintln!("  plus {} web source(s)", config.sources.urls.len());
    }

    let report = Indexer::new(config, embedder)
        .with_cancellation(cancel)
        .setup(rebuild)
        .await?;

    print_setup_report(&report);
    Ok(())
}

fn print_setup_report(report: &SetupReport) {
    eprintln!();
    if report.cancelled {
        eprintln!(
            "{}",
            style("⚠ Setup interrupted; completed documents were saved").yellow()
        );
    } else {
        eprintln!("{}", style("✓ Setup complete").green());
    }
    eprintln!("  Documents indexed: {}", report.documents_indexed);
    eprintln!("  Unchanged: {}", report.skipped_unchanged);
    eprintln!("  Chunks written: {}", report.chunks_written);
    eprintln!("  Removed: {}", report.removed);
    eprintln!(
        "  Index: {} documents, {} chunks",
        report.status.document_count, report.status.chunk_count
    );

    if !report.skipped_files.is_empty() {
        eprintln!(
            "  Skipped {} unsupported file(s)",
            report.skipped_files.len()
        );
    }

    if report.has_failures() {
        eprintln!();
        eprintln!(
            "{}",
            style(format!("{} source(s) failed:", report.failures.len())).yellow()
        );
        for failure in &report.failures {
            eprintln!("  {} {}", style("✗").red(), failure.error);
        }
    }
}

fn query_components(config: &Config) -> Result<(Arc<dyn Embedder>, Arc<dyn Generator>)> {
    let embedder = build_embedder(config)?;
    let generator: Arc<dyn Generator> = Arc::new(OllamaGenerator::new(&config.ollama)?);
    Ok((embedder, generator))
}

/// Answer one question and print it with its sources
#[inline]
pub async fn run_query(config_dir: &Path, question: &str, k: Option<usize>) -> Result<()> {
    let config = Config::load(config_dir).context("Failed to load configuration")?;
    let (embedder, generator) = query_components(&config)?;

    let answer = answer_question(&config, embedder, generator, question, k).await?;
    print_answer(&answer);
    Ok(())
}

/// Prompt for questions until the user quits
#[inline]
pub async fn run_interactive(config_dir: &Path) -> Result<()> {
    let config = Config::load(config_dir).context("Failed to load configuration")?;
    let (embedder, generator) = query_components(&config)?;
    let answerer = open_answerer(&config, embedder, generator).await?;

    eprintln!("{}", style("📚 Ask about the documentation").bold().cyan());
    eprintln!("Type 'quit' or 'exit' to leave.");

    loop {
        eprintln!();
        let question: String = Input::new()
            .with_prompt("Question")
            .allow_empty(true)
            .interact_text()?;
        let question = question.trim();

        if question.is_empty() {
            continue;
        }
        if question.eq_ignore_ascii_case("quit") || question.eq_ignore_ascii_case("exit") {
            break;
        }

        let answer = match &answerer {
            Some(answerer) => answerer.answer(question, config.retrieval.top_k).await,
            None => Ok(AnswerResult::not_indexed()),
        };
        match answer {
            Ok(answer) => print_answer(&answer),
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                warn!("Query failed: {}", e);
                eprintln!("{} {}", style("✗").red(), e);
            }
        }
    }

    Ok(())
}

fn print_answer(answer: &AnswerResult) {
    println!("{}", answer.text);

    match answer.grounding {
        Grounding::Grounded => {}
        Grounding::Ungrounded => eprintln!(
            "\n{}",
            style("⚠ No documentation matched; this answer is not grounded in it").yellow()
        ),
        Grounding::NoRelevantDocuments | Grounding::NotIndexed => return,
    }

    if answer.results.is_empty() {
        return;
    }

    println!();
    println!("{}", style("Sources:").bold());
    for (rank, result) in answer.results.iter().enumerate() {
        let page = result
            .page
            .map(|page| format!(" (page {})", page))
            .unwrap_or_default();
        println!(
            "  [{}] {}{} {}",
            rank + 1,
            result.source_uri,
            page,
            style(format!("relevance {:.3}", result.score)).dim()
        );
    }
}

/// Show the index and model state
#[inline]
pub async fn show_status(config_dir: &Path) -> Result<()> {
    let config = Config::load(config_dir).context("Failed to load configuration")?;

    println!("📊 Docs RAG Status");
    println!("{}", "=".repeat(50));
    println!();

    println!("🔍 Index ({}):", config.index_path().display());
    match VectorStore::load(&config.index_path()).await {
        Ok(store) => {
            let status = store.status();
            println!("   ✅ Model: {}", status.model_id);
            println!("   📐 Metric: {:?}", status.metric);
            match status.dimension {
                Some(dimension) => println!("   🔢 Dimension: {}", dimension),
                None => println!("   🔢 Dimension: not fixed yet"),
            }
            println!("   📚 Documents: {}", status.document_count);
            println!("   📄 Chunks: {}", status.chunk_count);
            println!(
                "   🕒 Updated: {}",
                status.updated_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
        Err(e) => {
            println!("   ❌ Not indexed - {}", e);
        }
    }

    println!();
    println!("🤖 Models:");
    let embedder = build_embedder(&config)?;
    let health = tokio::task::spawn_blocking({
        let embedder = Arc::clone(&embedder);
        move || embedder.health_check()
    })
    .await?;
    match health {
        Ok(()) => println!("   ✅ Embedding: {}", embedder.model_id()),
        Err(e) => println!("   ❌ Embedding: {} - {}", embedder.model_id(), e),
    }

    let generator = OllamaGenerator::new(&config.ollama)?;
    let model = generator.model_id().to_string();
    match tokio::task::spawn_blocking(move || generator.health_check()).await? {
        Ok(()) => println!("   ✅ Generation: {}", model),
        Err(e) => println!("   ❌ Generation: {} - {}", model, e),
    }

    println!();
    println!("💡 Next Steps:");
    println!("   • Put documents in {}", config.docs_path().display());
    println!("   • Use 'docs-rag setup' to build or refresh the index");
    println!("   • Use 'docs-rag query \"<question>\"' to ask a question");

    Ok(())
}
