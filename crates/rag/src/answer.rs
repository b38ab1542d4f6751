use anyhow::{bail, Result};

use crate::retrieval::RetrievalResult;

pub const FALLBACK_ANSWER: &str = "I could not find lab documentation relevant to this question. \
Try rephrasing it, or remove the document type filter to search all documents.";

const SNIPPET_CHARS: usize = 400;

/// The answer-producing collaborator. Implementations may block on I/O;
/// an error makes the pipeline fall back to [`FALLBACK_ANSWER`].
pub trait AnswerGenerator: Send + Sync {
    fn generate(&self, query: &str, sources: &[RetrievalResult]) -> Result<String>;
}

/// Grounded prompt for a completion backend: numbered sources followed by
/// the question.
pub fn build_prompt(query: &str, sources: &[RetrievalResult]) -> String {
    let mut prompt = String::from(
        "You are a laboratory assistant. Answer only from the provided sources \
and cite them by number.\n\n=== SOURCES START ===\n",
    );
    for (idx, source) in sources.iter().enumerate() {
        let meta = &source.metadata;
        let page = meta
            .page
            .map(|p| format!(", page {p}"))
            .unwrap_or_default();
        prompt.push_str(&format!(
            "[{}] {} ({}{})\n{}\n\n",
            idx + 1,
            meta.title,
            meta.doc_type,
            page,
            source.content.trim()
        ));
    }
    prompt.push_str("=== SOURCES END ===\n\n");
    prompt.push_str(&format!("Question: {}\nAnswer:", query.trim()));
    prompt
}

/// Answers by quoting the highest-ranked passages with numbered citations.
#[derive(Debug, Clone)]
pub struct ExtractiveAnswerer {
    max_passages: usize,
}

impl ExtractiveAnswerer {
    pub fn new(max_passages: usize) -> Self {
        Self {
            max_passages: max_passages.max(1),
        }
    }
}

impl Default for ExtractiveAnswerer {
    fn default() -> Self {
        Self::new(3)
    }
}

impl AnswerGenerator for ExtractiveAnswerer {
    fn generate(&self, query: &str, sources: &[RetrievalResult]) -> Result<String> {
        if sources.is_empty() {
            bail!("no sources to answer from");
        }
        let mut lines = vec![format!(
            "Based on the lab documentation, for \"{}\":",
            query.trim()
        )];
        for (idx, source) in sources.iter().take(self.max_passages).enumerate() {
            let snippet = snippet(&source.content);
            if snippet.is_empty() {
                continue;
            }
            lines.push(format!("- {snippet} [{}]", idx + 1));
        }
        if lines.len() == 1 {
            bail!("sources contain no text");
        }
        Ok(lines.join("\n"))
    }
}

fn snippet(content: &str) -> String {
    let collapsed = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= SNIPPET_CHARS {
        return collapsed;
    }
    let cut: String = collapsed.chars().take(SNIPPET_CHARS).collect();
    match cut.rfind(' ') {
        Some(space) => format!("{}...", &cut[..space]),
        None => format!("{cut}..."),
    }
}
