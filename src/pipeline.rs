//! The orchestrator: argument validation, resource lifecycles, and stage
//! sequencing.

use std::time::Instant;

use crate::{
    acquire::acquire_file,
    args::{ModelProvider, ZeroxArgs},
    completion::ProcessedOcr,
    extract::{ExtractOptions, ExtractOutcome, ExtractionMode, run_extraction},
    image_utils::CleanupOptions,
    model::ModelClient,
    ocr::{OcrOptions, OcrOutcome, run_ocr},
    output::{Logprobs, Page, PipelineResult, StageCounts, Summary, write_markdown},
    prelude::*,
    rasterize::{DEFAULT_DENSITY, RasterizeOptions, rasterize_document},
    schema::split_schema,
    sheets::{is_structured_extension, read_sheet_pages},
    tesseract::TesseractPool,
};

/// Convert a document to page-structured markdown and, optionally, to
/// schema-shaped JSON.
///
/// This is the crate's one entrypoint. The per-run temp directory and the
/// Tesseract pool are torn down on every exit path; when `cleanup` is
/// false the temp directory is kept for inspection.
#[instrument(level = "debug", skip_all, fields(file = %args.file_path))]
pub async fn zerox(args: ZeroxArgs) -> Result<PipelineResult> {
    let started = Instant::now();
    let args = args.validated()?;

    let temp_dir = match &args.temp_dir {
        Some(root) => {
            tokio::fs::create_dir_all(root)
                .await
                .with_context(|| format!("failed to create {:?}", root.display()))?;
            tempfile::TempDir::with_prefix_in("zerox-", root)
        }
        None => tempfile::TempDir::with_prefix("zerox-"),
    }
    .context("failed to create temp directory")?;

    let mut pool: Option<TesseractPool> = None;
    let result = run_pipeline(&args, temp_dir.path(), started, &mut pool).await;

    // The guaranteed-release block: runs on success and on failure.
    if let Some(pool) = &pool {
        pool.shutdown();
    }
    if args.cleanup {
        let path = temp_dir.path().to_owned();
        if let Err(err) = temp_dir.close() {
            error!(
                directory = %path.display(),
                "failed to delete temporary directory: {err}"
            );
        }
    } else {
        let kept = temp_dir.keep();
        debug!(directory = %kept.display(), "keeping temporary directory");
    }

    result
}

/// The pipeline body, separated so the caller can guarantee teardown.
async fn run_pipeline(
    args: &ZeroxArgs,
    temp_dir: &Path,
    started: Instant,
    pool: &mut Option<TesseractPool>,
) -> Result<PipelineResult> {
    let acquired = acquire_file(&args.file_path, temp_dir).await?;
    let file_name = acquired
        .local_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_owned());
    let structured = is_structured_extension(&acquired.extension);

    let collect_ocr_logprobs =
        crate::model::params::logprobs_requested(&args.llm_params);

    // Stage 1: pages. Workbooks bypass rasterization and OCR entirely;
    // everything else renders to images and goes through the OCR loop.
    let mut image_paths = Vec::new();
    let mut ocr_ran = false;
    let (pages, ocr_outcome) = if structured {
        let pages = read_sheet_pages(&acquired.local_path, &acquired.extension).await?;
        (pages, OcrOutcome::default())
    } else {
        image_paths = rasterize_document(
            &acquired,
            temp_dir,
            &RasterizeOptions {
                image_density: args.image_density,
                image_height: args.image_height,
                pages: args.pages_to_convert.clone(),
                max_image_size_mb: args.max_image_size_mb,
            },
        )
        .await?;

        if args.correct_orientation {
            *pool = Some(TesseractPool::new(
                args.max_tesseract_workers,
                image_paths.len(),
                args.image_density.unwrap_or(DEFAULT_DENSITY),
            ));
        }

        if args.extract_only {
            // No OCR output is wanted; pages exist only to carry numbering.
            let pages = image_paths
                .iter()
                .map(|image| Page::success(image.page_number, ProcessedOcr::default()))
                .collect();
            (pages, OcrOutcome::default())
        } else {
            let credentials = args
                .credentials
                .as_ref()
                .expect("validation guarantees credentials");
            let client = ModelClient::new(
                args.model_provider,
                credentials,
                args.model.clone(),
                args.llm_params.clone(),
            )
            .await?;
            let mut outcome = run_ocr(
                &client,
                args.custom_model_function.as_ref(),
                pool.as_ref(),
                &image_paths,
                &OcrOptions {
                    concurrency: args.concurrency,
                    maintain_format: args.maintain_format,
                    max_retries: args.max_retries,
                    error_mode: args.error_mode,
                    cleanup: CleanupOptions {
                        correct_orientation: args.correct_orientation,
                        trim_edges: args.trim_edges,
                    },
                    prompt: args.prompt.clone(),
                    collect_logprobs: collect_ocr_logprobs,
                },
            )
            .await?;
            ocr_ran = true;
            let pages = std::mem::take(&mut outcome.pages);
            (pages, outcome)
        }
    };

    // Stage 2: extraction, only when a schema is present.
    let extraction_params = args.extraction_llm_params.clone().unwrap_or_default();
    let collect_extraction_logprobs =
        crate::model::params::logprobs_requested(&extraction_params);
    let extract_outcome = match &args.schema {
        Some(schema) => {
            let split = split_schema(schema, &args.extract_per_page)?;
            let client = ModelClient::new(
                args.extraction_model_provider
                    .unwrap_or(ModelProvider::OpenAi),
                args.extraction_credentials
                    .as_ref()
                    .expect("validation resolves extraction credentials"),
                args.extraction_model
                    .clone()
                    .expect("validation resolves the extraction model"),
                extraction_params.clone(),
            )
            .await?;
            let mode = if args.enable_hybrid_extraction {
                ExtractionMode::Hybrid
            } else if args.direct_image_extraction && !structured {
                ExtractionMode::DirectImage
            } else {
                ExtractionMode::TextOnly
            };
            Some(
                run_extraction(
                    &client,
                    pool.as_ref(),
                    &split,
                    &pages,
                    &image_paths,
                    &ExtractOptions {
                        mode,
                        concurrency: args.concurrency,
                        max_retries: args.max_retries,
                        prompt: args.extraction_prompt.clone(),
                        collect_logprobs: collect_extraction_logprobs,
                        cleanup: CleanupOptions {
                            correct_orientation: args.correct_orientation,
                            trim_edges: args.trim_edges,
                        },
                    },
                )
                .await?,
            )
        }
        None => None,
    };

    // Extract-only runs return pages for numbering only, whatever the
    // source type. Sheet text has already served as the extraction input
    // by this point, so it is safe to drop.
    let pages = if args.extract_only {
        pages
            .into_iter()
            .map(|page| Page::success(page.page_number, ProcessedOcr::default()))
            .collect::<Vec<_>>()
    } else {
        pages
    };

    // Stage 3: assembly.
    if let Some(output_dir) = &args.output_dir {
        write_markdown(output_dir, &file_name, &pages).await?;
    }

    let structured_counts = StageCounts {
        successful: pages.len(),
        failed: 0,
    };
    let summary = Summary {
        total_pages: pages.len(),
        ocr: if ocr_ran {
            Some(ocr_outcome.counts)
        } else if structured && !args.extract_only {
            Some(structured_counts)
        } else {
            None
        },
        extracted: extract_outcome
            .as_ref()
            .map(|outcome| outcome.counts),
    };

    let (extracted, extract_tokens, extract_logprobs) = match extract_outcome {
        Some(ExtractOutcome {
            extracted,
            input_tokens,
            output_tokens,
            logprobs,
            ..
        }) => (Some(extracted), (input_tokens, output_tokens), logprobs),
        None => (None, (0, 0), Vec::new()),
    };

    let logprobs = if collect_ocr_logprobs || collect_extraction_logprobs {
        Some(Logprobs {
            ocr: ocr_outcome.logprobs,
            extracted: extract_logprobs,
        })
    } else {
        None
    };

    Ok(PipelineResult {
        completion_time_ms: started.elapsed().as_millis() as u64,
        file_name,
        input_tokens: ocr_outcome.input_tokens + extract_tokens.0,
        output_tokens: ocr_outcome.output_tokens + extract_tokens.1,
        pages,
        extracted,
        logprobs,
        summary,
    })
}
