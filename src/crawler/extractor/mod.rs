
use anyhow::{Result, anyhow};
use scraper::{ElementRef, Html, Node, Selector};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Elements whose content never reaches the extracted text
const SKIPPED_TAGS: &[&str] = &[
    "script", "style", "noscript", "template", "iframe", "svg", "nav", "header", "footer",
    "aside", "button", "form",
];

/// Elements that end a paragraph
const BLOCK_TAGS: &[&str] = &[
    "p", "div", "section", "article", "main", "h1", "h2", "h3", "h4", "h5", "h6", "pre",
    "blockquote", "ul", "ol", "table", "dl", "figure", "hr",
];

/// Elements that end a line
const LINE_TAGS: &[&str] = &["br", "li", "tr", "dt", "dd", "caption"];

/// Text content of a page
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedPage {
    pub title: String,
    /// Paragraphs separated by blank lines, whitespace collapsed outside `<pre>`
    pub text: String,
}

/// Strip markup from an HTML document, keeping the main content as text
#[inline]
pub fn extract_page(html: &str) -> Result<ExtractedPage> {
    let document = Html::parse_document(html);
    let title = extract_title(&document)?;

    let cleaned = clean_content(&document)?;
    let mut builder = TextBuilder::default();
    render(cleaned.root_element(), &mut builder, false);
    let text = builder.finish();

    debug!(
        "Extracted page: title='{}', {} chars of text",
        title,
        text.len()
    );

    Ok(ExtractedPage { title, text })
}

fn extract_title(document: &Html) -> Result<String> {
    let title_selector = selector("title")?;
    let heading_selector = selector("h1, h2")?;

    let title = document
        .select(&title_selector)
        .chain(document.select(&heading_selector))
        .map(|element| collapse_whitespace(&element.text().collect::<String>()))
        .find(|text| !text.is_empty());

    Ok(title.unwrap_or_else(|| "Untitled Document".to_string()))
}

/// Narrow the document to its main content area and drop page chrome
fn clean_content(document: &Html) -> Result<Html> {
    let unwanted_selector = selector(
        ".advertisement, .ads, .sidebar, .menu, .navigation, .breadcrumbs, .toc, [aria-hidden=true]",
    )?;
    let main_content_selector =
        selector("main, article, [role=main], .content, .main-content, #content, #main")?;
    let body_selector = selector("body")?;

    let scope = document
        .select(&main_content_selector)
        .next()
        .or_else(|| document.select(&body_selector).next());

    let mut cleaned = scope.map_or_else(
        || document.clone(),
        |element| Html::parse_fragment(&element.html()),
    );
    remove_unwanted_elements(&mut cleaned, &unwanted_selector);
    Ok(cleaned)
}

fn remove_unwanted_elements(document: &mut Html, unwanted_selector: &Selector) {
    // Collect ids first, detaching while selecting would invalidate the iterator
    let unwanted_node_ids: Vec<_> = document
        .select(unwanted_selector)
        .map(|element| element.id())
        .collect();

    for node_id in unwanted_node_ids {
        if let Some(mut node) = document.tree.get_mut(node_id) {
            node.detach();
        }
    }
}

fn render(element: ElementRef<'_>, builder: &mut TextBuilder, in_pre: bool) {
    let name = element.value().name();
    if SKIPPED_TAGS.contains(&name) {
        return;
    }

    let is_pre = in_pre || name == "pre";
    let is_block = BLOCK_TAGS.contains(&name);

    if is_block {
        builder.paragraph_break();
    }

    for child in element.children() {
        match child.value() {
            Node::Text(text) => builder.push_text(text, is_pre),
            Node::Element(_) => {
                if let Some(child_element) = ElementRef::wrap(child) {
                    render(child_element, builder, is_pre);
                }
            }
            _ => {}
        }
    }

    if is_block {
        builder.paragraph_break();
    } else if LINE_TAGS.contains(&name) {
        builder.line_break();
    }
}

#[derive(Debug, Default)]
struct TextBuilder {
    out: String,
    pending_space: bool,
}

impl TextBuilder {
    fn push_text(&mut self, text: &str, preformatted: bool) {
        if preformatted {
            self.pending_space = false;
            self.out.push_str(text);
            return;
        }

        for c in text.chars() {
            if c.is_whitespace() {
                self.pending_space = true;
                continue;
            }
            if self.pending_space && !self.out.is_empty() && !self.out.ends_with(char::is_whitespace)
            {
                self.out.push(' ');
            }
            self.pending_space = false;
            self.out.push(c);
        }
    }

    fn line_break(&mut self) {
        self.trim_trailing_spaces();
        if !self.out.is_empty() && !self.out.ends_with('\n') {
            self.out.push('\n');
        }
        self.pending_space = false;
    }

    fn paragraph_break(&mut self) {
        self.trim_trailing_spaces();
        if !self.out.is_empty() && !self.out.ends_with("\n\n") {
            self.out
                .push_str(if self.out.ends_with('\n') { "\n" } else { "\n\n" });
        }
        self.pending_space = false;
    }

    fn trim_trailing_spaces(&mut self) {
        let trimmed = self.out.trim_end_matches([' ', '\t']).len();
        self.out.truncate(trimmed);
    }

    fn finish(self) -> String {
        self.out.trim().to_string()
    }
}

/// Collapse runs of whitespace into single spaces and trim the ends
#[inline]
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("Failed to create CSS selector '{}': {:?}", css, e))
}
