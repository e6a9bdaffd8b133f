//! The per-page OCR loop.
//!
//! Two shapes: format maintenance processes pages strictly in order, feeding
//! each page's markdown into the next page's prompt; otherwise pages run
//! concurrently up to the configured limit. Either way the result vector is
//! in page order: concurrent tasks write their slot by index, so completion
//! order never matters.

use std::sync::atomic::{AtomicU64, Ordering};

use futures::StreamExt as _;

use crate::{
    args::ErrorMode,
    completion::{ProcessedOcr, process_ocr_content},
    error::ZeroxError,
    image_utils::{CleanupOptions, cleanup_image},
    model::{CustomModelFn, ModelClient, OcrRequest, RawCompletion},
    output::{LogprobPage, Page, StageCounts},
    prelude::*,
    rasterize::PageImage,
    retry::{retry_transient, run_retries},
    tesseract::TesseractPool,
};

/// Options for [`run_ocr`].
#[derive(Clone, Debug)]
pub struct OcrOptions {
    pub concurrency: usize,
    pub maintain_format: bool,
    pub max_retries: usize,
    pub error_mode: ErrorMode,
    pub cleanup: CleanupOptions,
    pub prompt: Option<String>,
    pub collect_logprobs: bool,
}

/// Everything the OCR stage produces.
#[derive(Debug, Default)]
pub struct OcrOutcome {
    /// One entry per input image, in page order.
    pub pages: Vec<Page>,

    pub input_tokens: u64,
    pub output_tokens: u64,
    pub logprobs: Vec<LogprobPage>,
    pub counts: StageCounts,
}

/// What one successful page call yields.
struct PageSuccess {
    processed: ProcessedOcr,
    logprobs: Option<Value>,
}

/// Run OCR over the rendered pages.
#[instrument(level = "debug", skip_all, fields(pages = image_paths.len()))]
pub async fn run_ocr(
    client: &ModelClient,
    custom_model_function: Option<&CustomModelFn>,
    pool: Option<&TesseractPool>,
    image_paths: &[PageImage],
    options: &OcrOptions,
) -> Result<OcrOutcome> {
    if options.maintain_format {
        run_sequential(client, custom_model_function, pool, image_paths, options).await
    } else {
        run_concurrent(client, custom_model_function, pool, image_paths, options).await
    }
}

/// Strictly-ordered processing with format carryover. A page may only start
/// once its predecessor succeeded; on the first failure OCR stops.
async fn run_sequential(
    client: &ModelClient,
    custom_model_function: Option<&CustomModelFn>,
    pool: Option<&TesseractPool>,
    image_paths: &[PageImage],
    options: &OcrOptions,
) -> Result<OcrOutcome> {
    let mut outcome = OcrOutcome::default();
    let mut prior_page: Option<String> = None;
    let input_tokens = AtomicU64::new(0);
    let output_tokens = AtomicU64::new(0);

    for (index, page_image) in image_paths.iter().enumerate() {
        let result = ocr_one_page(
            client,
            custom_model_function,
            pool,
            page_image,
            prior_page.clone(),
            options,
            &input_tokens,
            &output_tokens,
        )
        .await;
        match result {
            Ok(success) => {
                prior_page = Some(success.processed.content.clone());
                record_success(&mut outcome, page_image.page_number, success);
            }
            Err(err) => {
                if options.error_mode == ErrorMode::Throw {
                    return Err(anyhow!(ZeroxError::Ocr {
                        page: page_image.page_number,
                        message: format!("{err:#}"),
                    }));
                }
                // Carryover is broken, so later pages cannot run; record
                // them all so the result still covers every selected page.
                outcome
                    .pages
                    .push(Page::error(page_image.page_number, format!("{err:#}")));
                outcome.counts.failed += 1;
                for skipped in &image_paths[index + 1..] {
                    outcome.pages.push(Page::error(
                        skipped.page_number,
                        "not processed: an earlier page failed while maintaining format",
                    ));
                    outcome.counts.failed += 1;
                }
                break;
            }
        }
    }
    outcome.input_tokens = input_tokens.load(Ordering::SeqCst);
    outcome.output_tokens = output_tokens.load(Ordering::SeqCst);
    Ok(outcome)
}

/// Concurrent processing. Results are written by index, so the output is in
/// page order regardless of completion order.
async fn run_concurrent(
    client: &ModelClient,
    custom_model_function: Option<&CustomModelFn>,
    pool: Option<&TesseractPool>,
    image_paths: &[PageImage],
    options: &OcrOptions,
) -> Result<OcrOutcome> {
    let input_tokens = AtomicU64::new(0);
    let output_tokens = AtomicU64::new(0);

    let results = futures::stream::iter(image_paths.iter().enumerate())
        .map(|(index, page_image)| {
            let input_tokens = &input_tokens;
            let output_tokens = &output_tokens;
            async move {
                let result = ocr_one_page(
                    client,
                    custom_model_function,
                    pool,
                    page_image,
                    None,
                    options,
                    input_tokens,
                    output_tokens,
                )
                .await;
                (index, result)
            }
        })
        .buffer_unordered(options.concurrency)
        .collect::<Vec<_>>()
        .await;

    let mut slots: Vec<Option<Page>> = Vec::new();
    slots.resize_with(image_paths.len(), || None);
    let mut outcome = OcrOutcome::default();
    let mut logprob_slots: Vec<Option<LogprobPage>> = Vec::new();
    logprob_slots.resize_with(image_paths.len(), || None);

    for (index, result) in results {
        let page_number = image_paths[index].page_number;
        match result {
            Ok(success) => {
                outcome.counts.successful += 1;
                if let Some(value) = success.logprobs {
                    logprob_slots[index] = Some(LogprobPage {
                        page: Some(page_number),
                        value,
                    });
                }
                slots[index] = Some(Page::success(page_number, success.processed));
            }
            Err(err) if options.error_mode == ErrorMode::Throw => {
                // In-flight work has already drained into `results`; its
                // pages are simply discarded.
                return Err(anyhow!(ZeroxError::Ocr {
                    page: page_number,
                    message: format!("{err:#}"),
                }));
            }
            Err(err) => {
                outcome.counts.failed += 1;
                slots[index] = Some(Page::error(page_number, format!("{err:#}")));
            }
        }
    }

    outcome.pages = slots
        .into_iter()
        .map(|slot| slot.expect("every page slot is written exactly once"))
        .collect();
    outcome.logprobs = logprob_slots.into_iter().flatten().collect();
    outcome.input_tokens = input_tokens.load(Ordering::SeqCst);
    outcome.output_tokens = output_tokens.load(Ordering::SeqCst);
    Ok(outcome)
}

fn record_success(outcome: &mut OcrOutcome, page_number: usize, success: PageSuccess) {
    outcome.counts.successful += 1;
    if let Some(value) = success.logprobs {
        outcome.logprobs.push(LogprobPage {
            page: Some(page_number),
            value,
        });
    }
    outcome
        .pages
        .push(Page::success(page_number, success.processed));
}

/// OCR one page: read, clean up, call the model under the retry runner, and
/// normalize the result. Token counts land in the shared atomic counters as
/// each call completes.
#[allow(clippy::too_many_arguments)]
async fn ocr_one_page(
    client: &ModelClient,
    custom_model_function: Option<&CustomModelFn>,
    pool: Option<&TesseractPool>,
    page_image: &PageImage,
    prior_page: Option<String>,
    options: &OcrOptions,
    input_tokens: &AtomicU64,
    output_tokens: &AtomicU64,
) -> Result<PageSuccess> {
    let buffer = tokio::fs::read(&page_image.path)
        .await
        .with_context(|| format!("failed to read {:?}", page_image.path.display()))?;
    let buffers = cleanup_image(pool, &buffer, options.cleanup).await?;

    let request = OcrRequest {
        buffers,
        maintain_format: options.maintain_format,
        prior_page,
        prompt: options.prompt.clone(),
    };
    let page_tag = format!("page {}", page_image.page_number);
    let raw: RawCompletion = run_retries(options.max_retries, &page_tag, || {
        let request = request.clone();
        async move {
            match custom_model_function {
                // The custom function bypasses the provider adapters but
                // still runs under this retry layer.
                Some(custom) => match custom(request).await {
                    Ok(raw) => crate::retry::retry_ok(raw),
                    Err(err) => retry_transient(err),
                },
                None => client.get_ocr_completion(request).await,
            }
        }
    })
    .await?;

    input_tokens.fetch_add(raw.input_tokens, Ordering::SeqCst);
    output_tokens.fetch_add(raw.output_tokens, Ordering::SeqCst);
    let logprobs = if options.collect_logprobs {
        raw.logprobs
    } else {
        None
    };
    Ok(PageSuccess {
        processed: process_ocr_content(&raw.content),
        logprobs,
    })
}
