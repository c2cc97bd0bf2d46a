
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::OllamaConfig;
use crate::database::vector_store::QueryResult;
use crate::embeddings::ollama::OllamaClient;
use crate::retrieval::Retriever;
use crate::{RagError, Result};

pub const NO_DOCUMENTS_MESSAGE: &str = "No relevant documentation found for your question.";
pub const NOT_INDEXED_MESSAGE: &str =
    "The documentation has not been indexed yet. Run `docs-rag setup` first.";

const CONTEXT_HEADER: &str = "Context from the documentation:\n";
const PREVIEW_CHARS: usize = 500;

/// Text generation model, opaque to the pipeline
pub trait Generator: Send + Sync {
    fn model_id(&self) -> &str;

    fn generate(&self, prompt: &str) -> Result<String>;

    #[inline]
    fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

/// Generator backed by Ollama's `/api/generate` endpoint
#[derive(Debug)]
pub struct OllamaGenerator {
    client: OllamaClient,
    model: String,
}

impl OllamaGenerator {
    #[inline]
    pub fn new(config: &OllamaConfig) -> Result<Self> {
        Ok(Self::with_client(OllamaClient::new(config)?, config))
    }

    #[inline]
    pub fn with_client(client: OllamaClient, config: &OllamaConfig) -> Self {
        Self {
            client,
            model: config.generation_model.clone(),
        }
    }
}

impl Generator for OllamaGenerator {
    #[inline]
    fn model_id(&self) -> &str {
        &self.model
    }

    #[inline]
    fn generate(&self, prompt: &str) -> Result<String> {
        debug!(
            "Generating with {} (prompt: {} chars)",
            self.model,
            prompt.chars().count()
        );

        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
        };
        let response: GenerateResponse = self
            .client
            .post_json("/api/generate", &request)
            .map_err(|e| RagError::Generation(format!("{:#}", e)))?;

        Ok(response.response.trim().to_string())
    }

    #[inline]
    fn health_check(&self) -> Result<()> {
        self.client.ensure_model(&self.model)
    }
}

/// What to do when retrieval finds nothing to ground an answer on
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EmptyContextPolicy {
    /// Reply with a fixed message, without calling the generator
    #[default]
    NoAnswer,
    /// Ask the generator the bare question and flag the answer as ungrounded
    Ungrounded,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AnswerConfig {
    /// Upper bound on prompt length in characters; the question always fits
    pub max_prompt_chars: usize,
    pub empty_context_policy: EmptyContextPolicy,
}

impl Default for AnswerConfig {
    #[inline]
    fn default() -> Self {
        Self {
            max_prompt_chars: 12_000,
            empty_context_policy: EmptyContextPolicy::NoAnswer,
        }
    }
}

/// How an answer relates to the indexed documentation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Grounding {
    /// Generated from retrieved chunks
    Grounded,
    /// Retrieval found nothing and no generation happened
    NoRelevantDocuments,
    /// Generated without any retrieved context
    Ungrounded,
    /// There is no index to search
    NotIndexed,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AnswerResult {
    pub text: String,
    /// Distinct source URIs in rank order
    pub sources: Vec<String>,
    pub grounding: Grounding,
    /// Chunks that made it into the prompt, with their scores
    pub results: Vec<QueryResult>,
    pub context_preview: String,
}

impl AnswerResult {
    #[inline]
    pub fn not_indexed() -> Self {
        Self::without_context(NOT_INDEXED_MESSAGE.to_string(), Grounding::NotIndexed)
    }

    fn without_context(text: String, grounding: Grounding) -> Self {
        Self {
            text,
            sources: Vec::new(),
            grounding,
            results: Vec::new(),
            context_preview: String::new(),
        }
    }
}

/// A composed prompt and how many ranked chunks it includes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub text: String,
    pub context: String,
    pub included: usize,
}

/// Composes length-bounded prompts from ranked chunks
#[derive(Debug, Clone, Copy)]
pub struct PromptBuilder {
    max_chars: usize,
}

impl PromptBuilder {
    #[inline]
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }

    /// Prompt without any documentation context
    #[inline]
    pub fn bare(question: &str) -> String {
        format!("Question: {}\n\nAnswer:", question)
    }

    /// Add numbered context blocks in rank order while the whole prompt
    /// stays within the limit. The first block that does not fit ends the
    /// context; nothing below it is considered.
    #[inline]
    pub fn build(&self, question: &str, results: &[QueryResult]) -> Prompt {
        let fixed = CONTEXT_HEADER.chars().count() + Self::bare(question).chars().count() + 2;

        let mut context = String::new();
        let mut used = fixed;
        let mut included = 0;

        for (rank, result) in results.iter().enumerate() {
            let block = context_block(rank + 1, result);
            let separator = if context.is_empty() { 0 } else { 2 };
            let cost = separator + block.chars().count();

            if used + cost > self.max_chars {
                debug!(
                    "Prompt limit reached, excluding {} of {} chunks",
                    results.len() - rank,
                    results.len()
                );
                break;
            }

            if separator > 0 {
                context.push_str("\n\n");
            }
            context.push_str(&block);
            used += cost;
            included += 1;
        }

        let text = format!(
            "{}{}\n\n{}",
            CONTEXT_HEADER,
            context,
            Self::bare(question)
        );

        Prompt {
            text,
            context,
            included,
        }
    }
}

fn context_block(number: usize, result: &QueryResult) -> String {
    let page = result
        .page
        .map(|page| format!(" (page {})", page))
        .unwrap_or_default();
    format!(
        "[{}] {}{}\n{}",
        number,
        result.source_uri,
        page,
        result.text.trim()
    )
}

/// First `PREVIEW_CHARS` characters of the context, marked when cut
#[inline]
pub fn context_preview(context: &str) -> String {
    match context.char_indices().nth(PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", context.get(..cut).unwrap_or(context)),
        None => context.to_string(),
    }
}

/// Answers questions from retrieved documentation
pub struct Answerer {
    retriever: Retriever,
    generator: Arc<dyn Generator>,
    config: AnswerConfig,
}

impl Answerer {
    #[inline]
    pub fn new(retriever: Retriever, generator: Arc<dyn Generator>, config: AnswerConfig) -> Self {
        Self {
            retriever,
            generator,
            config,
        }
    }

    /// Retrieve up to `k` chunks for `question` and generate an answer from them
    #[inline]
    pub async fn answer(&self, question: &str, k: usize) -> Result<AnswerResult> {
        info!("Processing query: {}", question);

        if self.retriever.store().read().await.is_empty() {
            return Ok(AnswerResult::not_indexed());
        }

        let results = self.retriever.retrieve(question, k).await?;
        let prompt = PromptBuilder::new(self.config.max_prompt_chars).build(question, &results);

        if prompt.included == 0 {
            if !results.is_empty() {
                warn!(
                    "No retrieved chunk fits within {} prompt characters",
                    self.config.max_prompt_chars
                );
            }
            return self.answer_without_context(question).await;
        }

        let text = self.generate(prompt.text).await?;
        let mut results = results;
        results.truncate(prompt.included);
        let sources = results
            .iter()
            .map(|result| result.source_uri.clone())
            .unique()
            .collect();

        Ok(AnswerResult {
            text,
            sources,
            grounding: Grounding::Grounded,
            results,
            context_preview: context_preview(&prompt.context),
        })
    }

    async fn answer_without_context(&self, question: &str) -> Result<AnswerResult> {
        match self.config.empty_context_policy {
            EmptyContextPolicy::NoAnswer => Ok(AnswerResult::without_context(
                NO_DOCUMENTS_MESSAGE.to_string(),
                Grounding::NoRelevantDocuments,
            )),
            EmptyContextPolicy::Ungrounded => {
                let text = self.generate(PromptBuilder::bare(question)).await?;
                Ok(AnswerResult::without_context(text, Grounding::Ungrounded))
            }
        }
    }

    async fn generate(&self, prompt: String) -> Result<String> {
        let generator = Arc::clone(&self.generator);
        tokio::task::spawn_blocking(move || generator.generate(&prompt))
            .await
            .map_err(|e| RagError::Other(e.into()))?
    }
}
