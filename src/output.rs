//! Result types returned by the pipeline, and output-file writing.

use crate::{completion::ProcessedOcr, prelude::*};

/// Terminal status of a single page.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PageStatus {
    Success,
    Error,
}

/// One page of OCR output (or one sheet, for structured-data sources).
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    /// 1-based page number in source order.
    pub page_number: usize,

    /// The page's markdown. Empty for error pages.
    pub content: String,

    /// Character count of `content` after code-fence stripping.
    pub content_length: usize,

    /// Whether this page was produced successfully.
    pub status: PageStatus,

    /// The error string, present only for error pages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Page {
    /// Build a successful page from processed OCR content.
    pub fn success(page_number: usize, processed: ProcessedOcr) -> Self {
        Self {
            page_number,
            content: processed.content,
            content_length: processed.content_length,
            status: PageStatus::Success,
            error: None,
        }
    }

    /// Build an error page. Error pages carry no content.
    pub fn error(page_number: usize, error: impl Into<String>) -> Self {
        Self {
            page_number,
            content: String::new(),
            content_length: 0,
            status: PageStatus::Error,
            error: Some(error.into()),
        }
    }
}

/// Token logprobs for one LLM call. `page: None` identifies the
/// full-document extraction call.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogprobPage {
    pub page: Option<usize>,
    pub value: Value,
}

/// Logprobs for the whole run, grouped by call kind.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Logprobs {
    pub ocr: Vec<LogprobPage>,
    pub extracted: Vec<LogprobPage>,
}

/// Success/failure counts for one stage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageCounts {
    pub successful: usize,
    pub failed: usize,
}

/// Per-run summary, so callers can detect partial success without
/// inspecting each page.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub total_pages: usize,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ocr: Option<StageCounts>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted: Option<StageCounts>,
}

/// Everything the pipeline produces for one document.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    /// Wall-clock duration of the whole run, in milliseconds.
    pub completion_time_ms: u64,

    /// Base name of the input file.
    pub file_name: String,

    /// Prompt tokens summed over every successful LLM call.
    pub input_tokens: u64,

    /// Completion tokens summed over every successful LLM call.
    pub output_tokens: u64,

    /// Pages in page-number order.
    pub pages: Vec<Page>,

    /// The merged extraction object, when a schema was supplied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted: Option<Value>,

    /// Per-token logprobs, when requested via `llm_params`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<Logprobs>,

    pub summary: Summary,
}

/// Derive the output file stem from a source file name: non-word characters
/// removed, whitespace collapsed to underscores, lowercased, truncated to
/// 255 characters.
pub fn sanitize_file_name(name: &str) -> String {
    let kept = name
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || c.is_whitespace())
        .collect::<String>();
    let mut out = String::with_capacity(kept.len());
    let mut in_whitespace = false;
    for ch in kept.chars() {
        if ch.is_whitespace() {
            if !in_whitespace && !out.is_empty() {
                out.push('_');
            }
            in_whitespace = true;
        } else {
            out.extend(ch.to_lowercase());
            in_whitespace = false;
        }
    }
    let out = out.trim_end_matches('_').to_owned();
    out.chars().take(255).collect()
}

/// Write the concatenated page markdown to `{sanitized}.md` under
/// `output_dir`, creating the directory if needed.
pub async fn write_markdown(
    output_dir: &Path,
    source_file_name: &str,
    pages: &[Page],
) -> Result<PathBuf> {
    let stem = sanitize_file_name(source_file_name);
    let path = output_dir.join(format!("{stem}.md"));
    let body = pages
        .iter()
        .map(|page| page.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    tokio::fs::create_dir_all(output_dir)
        .await
        .with_context(|| format!("failed to create {:?}", output_dir.display()))?;
    tokio::fs::write(&path, body)
        .await
        .with_context(|| format!("failed to write {:?}", path.display()))?;
    debug!(path = %path.display(), "wrote markdown output");
    Ok(path)
}
