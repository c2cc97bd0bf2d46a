pub mod extractor;


use anyhow::{Context, Result, anyhow};
use indicatif::{ProgressBar, ProgressStyle};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ureq::Agent;
use url::Url;

use self::extractor::{ExtractedPage, extract_page};
use crate::RagError;

/// Link targets that never lead to a text page
const ASSET_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "svg", "webp", "ico", "css", "js", "json", "zip", "gz", "tar",
    "tgz", "woff", "woff2", "ttf", "mp3", "mp4", "pdf",
];

/// Configuration and request budget for the web crawler
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CrawlerConfig {
    /// User agent string to use for requests
    pub user_agent: String,
    /// Timeout for a single HTTP request in seconds
    pub timeout_seconds: u64,
    /// Wall-clock budget for crawling one seed URL in seconds
    pub crawl_timeout_seconds: u64,
    /// Rate limit delay between requests in milliseconds
    pub rate_limit_ms: u64,
    /// Maximum number of retry attempts for retryable errors
    pub max_retries: u32,
    /// Delay between retry attempts in milliseconds
    pub retry_delay_ms: u64,
    /// Link hops followed from a seed URL; 0 fetches only the seed
    pub max_depth: usize,
    /// Maximum number of pages requested per seed URL
    pub max_pages: usize,
    /// Only follow links below the seed URL's directory
    pub stay_under_seed_path: bool,
}

impl Default for CrawlerConfig {
    #[inline]
    fn default() -> Self {
        Self {
            user_agent: "docs-rag/0.0.1 (Documentation Indexer)".to_string(),
            timeout_seconds: 10,
            crawl_timeout_seconds: 300,
            rate_limit_ms: 1000,
            max_retries: 2,
            retry_delay_ms: 1000,
            max_depth: 3,
            max_pages: 50,
            stay_under_seed_path: false,
        }
    }
}

/// HTTP client wrapper with rate limiting, retry logic and an optional deadline
#[derive(Debug)]
pub struct HttpClient {
    agent: Agent,
    config: CrawlerConfig,
    last_request_time: Option<Instant>,
    deadline: Option<Instant>,
}

impl HttpClient {
    /// Create a new HTTP client with the given configuration
    #[inline]
    pub fn new(config: CrawlerConfig) -> Self {
        let agent = Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(config.timeout_seconds)))
            .user_agent(&config.user_agent)
            .build()
            .into();

        Self {
            agent,
            config,
            last_request_time: None,
            deadline: None,
        }
    }

    /// Refuse to start requests or retries after `deadline`
    #[inline]
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    #[inline]
    pub fn budget_exhausted(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Perform an HTTP GET request with rate limiting and retry logic.
    /// Responses that are not text are rejected.
    #[inline]
    pub async fn get(&mut self, url: &str) -> Result<String> {
        self.apply_rate_limit().await;

        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            if self.budget_exhausted() {
                return Err(anyhow!("Crawl budget exhausted before fetching {}", url));
            }

            if attempt > 0 {
                debug!("Retrying request to {} (attempt {})", url, attempt + 1);
                sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
            }

            let agent = self.agent.clone();
            let target = url.to_string();
            let response = match tokio::task::spawn_blocking(move || try_get(&agent, &target)).await {
                Ok(response) => response,
                Err(e) => Err(anyhow!("HTTP request task failed: {}", e)),
            };

            match response {
                Ok(response) => {
                    debug!("Successfully fetched {} (attempt {})", url, attempt + 1);
                    return Ok(response);
                }
                Err(e) if is_retryable_error(&e) && attempt < self.config.max_retries => {
                    warn!("Retryable error for {}: {}", url, e);
                    last_error = Some(e);
                }
                Err(e) => {
                    error!("Non-retryable error for {}: {}", url, e);
                    return Err(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("All retry attempts failed")))
    }

    /// Apply rate limiting by sleeping if necessary
    async fn apply_rate_limit(&mut self) {
        if let Some(last_time) = self.last_request_time {
            let elapsed = last_time.elapsed();
            let rate_limit_duration = Duration::from_millis(self.config.rate_limit_ms);

            if elapsed < rate_limit_duration {
                let sleep_duration = rate_limit_duration - elapsed;
                debug!("Rate limiting: sleeping for {:?}", sleep_duration);
                sleep(sleep_duration).await;
            }
        }

        self.last_request_time = Some(Instant::now());
    }
}

/// Attempt a single HTTP GET request without retry logic
fn try_get(agent: &Agent, url: &str) -> Result<String> {
    debug!("Making HTTP GET request to: {}", url);

    match agent.get(url).call() {
        Ok(mut response) => {
            let content_type = response
                .headers()
                .get("content-type")
                .and_then(|value| value.to_str().ok())
                .unwrap_or("")
                .to_ascii_lowercase();

            if !is_text_content_type(&content_type) {
                return Err(anyhow!(
                    "Non-text content type '{}' at {}",
                    content_type,
                    url
                ));
            }

            let text = response
                .body_mut()
                .read_to_string()
                .with_context(|| format!("Failed to read response body from {}", url))?;
            debug!("Successfully read {} bytes from {}", text.len(), url);
            Ok(text)
        }
        Err(ureq::Error::StatusCode(status)) => {
            debug!("HTTP request failed with status {}: {}", status, url);
            Err(anyhow!("HTTP error {}", status))
        }
        Err(e) => {
            debug!("HTTP request failed with transport error: {}", e);
            Err(anyhow::Error::from(e))
                .with_context(|| format!("Failed to make HTTP request to {}", url))
        }
    }
}

impl Default for HttpClient {
    /// Create a new HTTP client with default configuration
    #[inline]
    fn default() -> Self {
        Self::new(CrawlerConfig::default())
    }
}

/// A missing content type is accepted and treated as text
fn is_text_content_type(content_type: &str) -> bool {
    content_type.is_empty()
        || content_type.starts_with("text/")
        || content_type.contains("html")
        || content_type.contains("xml")
}

/// Check if an error is retryable (network timeouts, 5xx errors)
fn is_retryable_error(error: &anyhow::Error) -> bool {
    let error_str = format!("{:#}", error).to_lowercase();

    // Network timeouts and connection errors
    if error_str.contains("timeout")
        || error_str.contains("timed out")
        || error_str.contains("connection")
        || error_str.contains("network")
    {
        return true;
    }

    // HTTP 5xx server errors and rate limiting
    error_str.contains("http error 5") || error_str.contains("http error 429")
}

/// Validate and normalize a URL
#[inline]
pub fn validate_url(url_str: &str) -> Result<Url> {
    let url = Url::parse(url_str).with_context(|| format!("Invalid URL format: {}", url_str))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(anyhow!("URL must use HTTP or HTTPS scheme: {}", url_str));
    }

    if url.host_str().is_none() {
        return Err(anyhow!("URL must have a valid host: {}", url_str));
    }

    Ok(url)
}

/// Check if a URL is on the seed's domain, and optionally below its path
#[inline]
pub fn should_crawl_url(url: &Url, seed_url: &Url, stay_under_seed_path: bool) -> bool {
    if url.scheme() != seed_url.scheme() || url.host() != seed_url.host() {
        return false;
    }

    if url.port_or_known_default() != seed_url.port_or_known_default() {
        return false;
    }

    if is_asset_path(url.path()) {
        return false;
    }

    if !stay_under_seed_path {
        return true;
    }

    let base_path = normalize_path_for_filtering(seed_url.path());
    url.path().starts_with(base_path.as_ref())
}

fn is_asset_path(path: &str) -> bool {
    path.rsplit('/')
        .next()
        .and_then(|segment| segment.rsplit_once('.'))
        .is_some_and(|(_, extension)| {
            ASSET_EXTENSIONS.contains(&extension.to_ascii_lowercase().as_str())
        })
}

/// Normalize a URL path for filtering by removing trailing filename if present
fn normalize_path_for_filtering(path: &str) -> Cow<'_, str> {
    if path.ends_with('/') {
        Cow::Borrowed(path)
    } else {
        path.rfind('/').map_or_else(
            || Cow::Owned(format!("{}/", path)),
            #[expect(clippy::string_slice, reason = "we know the split point is one byte")]
            |last_slash| {
                let last_segment = &path[last_slash + 1..];
                if last_segment.contains('.') {
                    Cow::Borrowed(&path[..=last_slash])
                } else {
                    Cow::Owned(format!("{}/", path))
                }
            },
        )
    }
}

/// Extract followable links from HTML content
#[inline]
pub fn extract_links(
    html: &str,
    source_url: &Url,
    seed_url: &Url,
    stay_under_seed_path: bool,
) -> Result<Vec<Url>> {
    let document = Html::parse_document(html);
    let link_selector = Selector::parse("a[href]")
        .map_err(|e| anyhow!("Failed to create CSS selector: {:?}", e))?;

    let mut links = Vec::new();

    for element in document.select(&link_selector) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };

        if href.starts_with("mailto:")
            || href.starts_with("javascript:")
            || href.starts_with("tel:")
            || href.starts_with('#')
        {
            continue;
        }

        match source_url.join(href) {
            Ok(mut absolute_url) => {
                absolute_url.set_fragment(None);
                if should_crawl_url(&absolute_url, seed_url, stay_under_seed_path) {
                    links.push(absolute_url);
                }
            }
            Err(e) => {
                debug!(
                    "Failed to resolve URL '{}' relative to '{}': {}",
                    href, source_url, e
                );
            }
        }
    }

    links.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    links.dedup();

    debug!("Extracted {} valid links from {}", links.len(), source_url);
    Ok(links)
}

/// A successfully fetched page with non-empty text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawledPage {
    pub url: Url,
    pub title: String,
    pub text: String,
    /// Link hops from the seed URL
    pub depth: usize,
}

/// Statistics about a crawl session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrawlStats {
    /// Total URLs discovered, including the seed
    pub total_urls: usize,
    /// Pages fetched successfully
    pub successful_crawls: usize,
    /// Pages that failed to fetch
    pub failed_crawls: usize,
    /// Pages fetched but without any text
    pub empty_pages: usize,
    /// Whether the page cap or deadline stopped the crawl with URLs still queued
    pub budget_exhausted: bool,
    /// Whether the crawl stopped because it was cancelled
    pub cancelled: bool,
    pub duration: Duration,
}

impl CrawlStats {
    #[inline]
    pub fn total_crawled(&self) -> usize {
        self.successful_crawls + self.failed_crawls + self.empty_pages
    }
}

/// Everything a crawl produced, failures included
#[derive(Debug, Default)]
pub struct CrawlOutcome {
    pub pages: Vec<CrawledPage>,
    pub failures: Vec<RagError>,
    pub stats: CrawlStats,
}

/// Bounded breadth-first crawler over a single site
pub struct SiteCrawler {
    http_client: HttpClient,
    config: CrawlerConfig,
    cancel: CancellationToken,
}

impl SiteCrawler {
    #[inline]
    pub fn new(config: CrawlerConfig) -> Self {
        Self {
            http_client: HttpClient::new(config.clone()),
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop crawling, even mid-request, once `cancel` fires
    #[inline]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Fetch and extract a single page without following links
    #[inline]
    pub async fn fetch_page(&mut self, url: &Url) -> crate::Result<ExtractedPage> {
        let html = self
            .http_client
            .get(url.as_str())
            .await
            .map_err(|e| fetch_error(url, &e))?;
        extract_page(&html).map_err(|e| fetch_error(url, &e))
    }

    /// Crawl from `seed` breadth-first, following same-domain links until the
    /// depth, page or time budget runs out.
    #[inline]
    pub async fn crawl(&mut self, seed: &str) -> crate::Result<CrawlOutcome> {
        let start_time = Instant::now();
        let seed_url = validate_url(seed).map_err(|e| RagError::Fetch {
            url: seed.to_string(),
            message: format!("{:#}", e),
        })?;

        let deadline = start_time + Duration::from_secs(self.config.crawl_timeout_seconds);
        self.http_client.set_deadline(Some(deadline));

        info!(
            "Starting crawl at {} (depth {}, {} pages, {}s)",
            seed_url, self.config.max_depth, self.config.max_pages, self.config.crawl_timeout_seconds
        );

        let mut outcome = CrawlOutcome::default();
        let mut queue = VecDeque::from([(seed_url.clone(), 0_usize)]);
        let mut discovered = HashSet::from([seed_url.as_str().to_string()]);
        outcome.stats.total_urls = 1;

        let bar = if console::user_attended_stderr() {
            ProgressBar::new_spinner().with_style(
                ProgressStyle::with_template("{spinner} [{pos}/{len}] Crawling {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            )
        } else {
            ProgressBar::hidden()
        };
        bar.set_length(1);

        let cancel = self.cancel.clone();
        while let Some((url, depth)) = queue.pop_front() {
            if cancel.is_cancelled() {
                info!("Crawl of {} cancelled", seed_url);
                outcome.stats.cancelled = true;
                break;
            }
            if outcome.stats.total_crawled() >= self.config.max_pages {
                info!("Page budget of {} reached", self.config.max_pages);
                outcome.stats.budget_exhausted = true;
                break;
            }
            if self.http_client.budget_exhausted() {
                warn!("Crawl deadline reached for {}", seed_url);
                outcome.stats.budget_exhausted = true;
                break;
            }

            bar.set_message(url.to_string());
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!("Crawl of {} cancelled while fetching {}", seed_url, url);
                    outcome.stats.cancelled = true;
                    break;
                }
                result = self.crawl_page(&url, &seed_url) => result,
            };
            match result {
                Ok((page, links)) => {
                    if page.text.is_empty() {
                        debug!("No text extracted from {}", url);
                        outcome.stats.empty_pages += 1;
                    } else {
                        outcome.stats.successful_crawls += 1;
                        outcome.pages.push(CrawledPage {
                            url: url.clone(),
                            title: page.title,
                            text: page.text,
                            depth,
                        });
                    }

                    if depth < self.config.max_depth {
                        for link in links {
                            if discovered.insert(link.as_str().to_string()) {
                                queue.push_back((link, depth + 1));
                                outcome.stats.total_urls += 1;
                            }
                        }
                        bar.set_length(outcome.stats.total_urls as u64);
                    }
                }
                Err(e) => {
                    warn!("Failed to crawl {}: {}", url, e);
                    outcome.stats.failed_crawls += 1;
                    outcome.failures.push(e);
                }
            }
            bar.set_position(outcome.stats.total_crawled() as u64);
        }

        self.http_client.set_deadline(None);
        outcome.stats.duration = start_time.elapsed();
        bar.finish_and_clear();

        info!(
            "Crawl completed for {}: {} pages, {} failed, {} empty, took {:?}",
            seed_url,
            outcome.stats.successful_crawls,
            outcome.stats.failed_crawls,
            outcome.stats.empty_pages,
            outcome.stats.duration
        );

        Ok(outcome)
    }

    async fn crawl_page(
        &mut self,
        url: &Url,
        seed_url: &Url,
    ) -> crate::Result<(ExtractedPage, Vec<Url>)> {
        let html = self
            .http_client
            .get(url.as_str())
            .await
            .map_err(|e| fetch_error(url, &e))?;

        let page = extract_page(&html).map_err(|e| fetch_error(url, &e))?;

        let links = extract_links(&html, url, seed_url, self.config.stay_under_seed_path)
            .unwrap_or_else(|e| {
                warn!("Failed to extract links from {}: {}", url, e);
                Vec::new()
            });

        Ok((page, links))
    }
}

fn fetch_error(url: &Url, error: &anyhow::Error) -> RagError {
    RagError::Fetch {
        url: url.to_string(),
        message: format!("{:#}", error),
    }
}
