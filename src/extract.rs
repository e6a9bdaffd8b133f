//! Schema-driven extraction over OCR text, page images, or both.
//!
//! The user schema is split into a per-page side and a full-document side.
//! One task runs per page for the per-page side, plus at most one task for
//! the full-document side; all of them share the concurrency and retry
//! budgets. Per-page values are wrapped as `{page, value}` lists; the
//! full-document result merges in as bare values.

use std::sync::atomic::{AtomicU64, Ordering};

use futures::StreamExt as _;
use serde_json::Map;

use crate::{
    completion::{process_extraction_value, schema_is_object},
    error::ZeroxError,
    image_utils::{CleanupOptions, cleanup_image},
    model::{ExtractionInput, ExtractionRequest, ModelClient, RawExtraction},
    output::{LogprobPage, Page, StageCounts},
    prelude::*,
    rasterize::PageImage,
    retry::{retry_transient, run_retries, try_retry},
    schema::SplitSchema,
    tesseract::TesseractPool,
};

/// How extraction inputs are constructed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtractionMode {
    /// Page markdown in, per page and concatenated.
    TextOnly,

    /// Raw page images in.
    DirectImage,

    /// Both images and markdown.
    Hybrid,
}

/// Separator between page contents in the full-document text input.
const PAGE_JOIN: &str = "\n<hr><hr>\n";

/// Options for [`run_extraction`].
#[derive(Clone, Debug)]
pub struct ExtractOptions {
    pub mode: ExtractionMode,
    pub concurrency: usize,
    pub max_retries: usize,
    pub prompt: Option<String>,
    pub collect_logprobs: bool,

    /// Image cleanup applied before images are sent for extraction, same
    /// as in the OCR stage.
    pub cleanup: CleanupOptions,
}

/// Everything the extraction stage produces.
#[derive(Debug, Default)]
pub struct ExtractOutcome {
    /// The merged extraction object.
    pub extracted: Value,

    pub input_tokens: u64,
    pub output_tokens: u64,
    pub logprobs: Vec<LogprobPage>,
    pub counts: StageCounts,
}

/// One unit of extraction work.
enum Task {
    /// Index into the page/image lists.
    PerPage(usize),
    FullDoc,
}

/// Run the extraction stage. Any task that fails after retries fails the
/// whole stage.
#[instrument(level = "debug", skip_all)]
pub async fn run_extraction(
    client: &ModelClient,
    pool: Option<&TesseractPool>,
    split: &SplitSchema,
    pages: &[Page],
    image_paths: &[PageImage],
    options: &ExtractOptions,
) -> Result<ExtractOutcome> {
    let page_count = match options.mode {
        ExtractionMode::TextOnly => pages.len(),
        _ => image_paths.len(),
    };

    let mut tasks = Vec::new();
    if split.per_page.is_some() {
        tasks.extend((0..page_count).map(Task::PerPage));
    }
    if split.full_doc.is_some() {
        tasks.push(Task::FullDoc);
    }
    if tasks.is_empty() {
        return Ok(ExtractOutcome {
            extracted: Value::Object(Map::new()),
            ..ExtractOutcome::default()
        });
    }

    let input_tokens = AtomicU64::new(0);
    let output_tokens = AtomicU64::new(0);

    let results = futures::stream::iter(tasks.into_iter().map(|task| {
        let input_tokens = &input_tokens;
        let output_tokens = &output_tokens;
        async move {
            match task {
                Task::PerPage(index) => {
                    let page_number = page_number_at(pages, image_paths, index);
                    let schema = split
                        .per_page
                        .clone()
                        .expect("per-page tasks imply a per-page schema");
                    let input = per_page_input(options.mode, pages, image_paths, index);
                    let raw = extract_one(
                        client,
                        pool,
                        schema,
                        input,
                        options,
                        &format!("page {page_number}"),
                    )
                    .await?;
                    input_tokens.fetch_add(raw.input_tokens, Ordering::SeqCst);
                    output_tokens.fetch_add(raw.output_tokens, Ordering::SeqCst);
                    Ok::<_, anyhow::Error>((Some(page_number), raw))
                }
                Task::FullDoc => {
                    let schema = split
                        .full_doc
                        .clone()
                        .expect("the full-document task implies a schema");
                    let input = full_doc_input(options.mode, pages, image_paths);
                    let raw =
                        extract_one(client, pool, schema, input, options, "full document")
                            .await?;
                    input_tokens.fetch_add(raw.input_tokens, Ordering::SeqCst);
                    output_tokens.fetch_add(raw.output_tokens, Ordering::SeqCst);
                    Ok((None, raw))
                }
            }
        }
    }))
    .buffer_unordered(options.concurrency)
    .collect::<Vec<_>>()
    .await;

    let mut outcome = ExtractOutcome::default();
    let mut per_page_values = Vec::new();
    let mut full_doc_value = None;
    let mut first_error = None;
    for result in results {
        match result {
            Ok((page, raw)) => {
                outcome.counts.successful += 1;
                if options.collect_logprobs {
                    if let Some(value) = raw.logprobs {
                        outcome.logprobs.push(LogprobPage { page, value });
                    }
                }
                match page {
                    Some(page_number) => per_page_values.push((page_number, raw.value)),
                    None => full_doc_value = Some(raw.value),
                }
            }
            Err(err) => {
                outcome.counts.failed += 1;
                first_error.get_or_insert(err);
            }
        }
    }
    // Extraction is all-or-nothing per task; one exhausted task fails the
    // stage.
    if let Some(err) = first_error {
        return Err(anyhow!(ZeroxError::Extraction(format!("{err:#}"))));
    }

    outcome.extracted = merge_results(per_page_values, full_doc_value);
    outcome.input_tokens = input_tokens.load(Ordering::SeqCst);
    outcome.output_tokens = output_tokens.load(Ordering::SeqCst);
    Ok(outcome)
}

/// One extraction call under the retry runner, with schema validation.
async fn extract_one(
    client: &ModelClient,
    pool: Option<&TesseractPool>,
    schema: Value,
    input: ExtractionInput,
    options: &ExtractOptions,
    tag: &str,
) -> Result<RawExtraction> {
    let validator = jsonschema::validator_for(&schema)
        .map_err(|err| anyhow!(ZeroxError::Schema(err.to_string())))?;
    let is_object = schema_is_object(&schema);
    let (text, image_buffers) = resolve_input(input, pool, options.cleanup).await?;
    let request = ExtractionRequest {
        text,
        image_buffers,
        prompt: options.prompt.clone(),
        schema,
    };
    run_retries(options.max_retries, tag, || {
        let request = request.clone();
        let validator = &validator;
        async move {
            let mut raw = try_retry!(client.get_extraction(request).await);
            let value = match process_extraction_value(raw.value, is_object) {
                Ok(value) => value,
                Err(err) => return retry_transient(err),
            };
            // Schema validation failure usually means a dodgy structured-
            // output implementation on the endpoint; let it try again.
            if let Err(err) = validator.validate(&value) {
                return retry_transient(anyhow!(
                    "extraction response failed schema validation: {err}"
                ));
            }
            raw.value = value;
            crate::retry::retry_ok(raw)
        }
    })
    .await
}

/// Turn a mode-selected input into text plus cleaned image buffers.
async fn resolve_input(
    input: ExtractionInput,
    pool: Option<&TesseractPool>,
    cleanup: CleanupOptions,
) -> Result<(Option<String>, Vec<Vec<u8>>)> {
    let (text, paths) = match input {
        ExtractionInput::TextOnly(text) => (Some(text), Vec::new()),
        ExtractionInput::ImagesOnly(paths) => (None, paths),
        ExtractionInput::Hybrid { image_paths, text } => (Some(text), image_paths),
    };
    let mut buffers = Vec::with_capacity(paths.len());
    for path in paths {
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("failed to read {:?}", path.display()))?;
        buffers.extend(cleanup_image(pool, &bytes, cleanup).await?);
    }
    Ok((text, buffers))
}

fn page_number_at(pages: &[Page], image_paths: &[PageImage], index: usize) -> usize {
    image_paths
        .get(index)
        .map(|image| image.page_number)
        .or_else(|| pages.get(index).map(|page| page.page_number))
        .unwrap_or(index + 1)
}

/// Build the input for one page's extraction task.
fn per_page_input(
    mode: ExtractionMode,
    pages: &[Page],
    image_paths: &[PageImage],
    index: usize,
) -> ExtractionInput {
    match mode {
        ExtractionMode::TextOnly => {
            ExtractionInput::TextOnly(pages[index].content.clone())
        }
        ExtractionMode::DirectImage => {
            ExtractionInput::ImagesOnly(vec![image_paths[index].path.clone()])
        }
        ExtractionMode::Hybrid => ExtractionInput::Hybrid {
            image_paths: vec![image_paths[index].path.clone()],
            text: pages
                .get(index)
                .map(|page| page.content.clone())
                .unwrap_or_default(),
        },
    }
}

/// Build the input for the full-document task.
fn full_doc_input(
    mode: ExtractionMode,
    pages: &[Page],
    image_paths: &[PageImage],
) -> ExtractionInput {
    let joined = || {
        pages
            .iter()
            .map(|page| page.content.as_str())
            .collect::<Vec<_>>()
            .join(PAGE_JOIN)
    };
    match mode {
        ExtractionMode::TextOnly => ExtractionInput::TextOnly(joined()),
        ExtractionMode::DirectImage => ExtractionInput::ImagesOnly(
            image_paths.iter().map(|image| image.path.clone()).collect(),
        ),
        ExtractionMode::Hybrid => ExtractionInput::Hybrid {
            image_paths: image_paths.iter().map(|image| image.path.clone()).collect(),
            text: joined(),
        },
    }
}

/// Merge per-page and full-document results into the final object.
///
/// Per-page properties become lists of `{page, value}` entries in page
/// order, with null/absent values dropped. Full-document properties merge
/// as bare values and replace any per-page entry of the same name.
fn merge_results(
    mut per_page: Vec<(usize, Value)>,
    full_doc: Option<Value>,
) -> Value {
    per_page.sort_by_key(|(page_number, _)| *page_number);
    let mut merged = Map::new();
    for (page_number, value) in per_page {
        let Value::Object(object) = value else {
            continue;
        };
        for (property, value) in object {
            if value.is_null() {
                continue;
            }
            let entry = merged
                .entry(property)
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(list) = entry {
                list.push(json!({ "page": page_number, "value": value }));
            }
        }
    }
    if let Some(Value::Object(object)) = full_doc {
        for (property, value) in object {
            merged.insert(property, value);
        }
    }
    Value::Object(merged)
}
