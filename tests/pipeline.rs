//! End-to-end pipeline tests.
//!
//! These drive the pipeline through `custom_model_function`, so no network
//! access or API keys are needed. Paths that require external conversion
//! binaries (Poppler, LibreOffice, Tesseract) are covered by `#[ignore]`d
//! tests in the library's unit suites instead.

#![recursion_limit = "256"]

use std::{
    process::Command,
    sync::{Arc, Mutex},
};

use futures::FutureExt as _;
use zerox::{
    Credentials, CustomModelFn, ErrorMode, Page, PageStatus, RawCompletion, ZeroxArgs,
    image_utils::CleanupOptions,
    model::ModelClient,
    ocr::{OcrOptions, run_ocr},
    rasterize::PageImage,
    zerox,
};

/// Write a small PNG to `path`.
fn write_png(path: &std::path::Path) {
    let img = image::RgbaImage::from_pixel(40, 30, image::Rgba([255, 255, 255, 255]));
    image::DynamicImage::ImageRgba8(img)
        .save_with_format(path, image::ImageFormat::Png)
        .unwrap();
}

/// A custom model function that answers every page with `content`.
fn answering(content: &str) -> CustomModelFn {
    let content = content.to_owned();
    Arc::new(move |_request| {
        let content = content.clone();
        async move {
            Ok(RawCompletion {
                content,
                input_tokens: 11,
                output_tokens: 7,
                logprobs: None,
            })
        }
        .boxed()
    })
}

fn base_args(file_path: &str) -> ZeroxArgs {
    ZeroxArgs {
        file_path: file_path.into(),
        credentials: Some(Credentials::ApiKey {
            api_key: "sk-test".into(),
            endpoint: None,
        }),
        correct_orientation: false,
        trim_edges: false,
        ..ZeroxArgs::default()
    }
}

async fn test_client() -> ModelClient {
    ModelClient::new(
        zerox::ModelProvider::OpenAi,
        &Credentials::ApiKey {
            api_key: "sk-test".into(),
            endpoint: None,
        },
        "gpt-4o".into(),
        serde_json::Map::new(),
    )
    .await
    .unwrap()
}

fn ocr_options(concurrency: usize, maintain_format: bool, error_mode: ErrorMode) -> OcrOptions {
    OcrOptions {
        concurrency,
        maintain_format,
        max_retries: 0,
        error_mode,
        cleanup: CleanupOptions {
            correct_orientation: false,
            trim_edges: false,
        },
        prompt: None,
        collect_logprobs: false,
    }
}

/// Build `count` page images on disk.
fn make_pages(dir: &std::path::Path, count: usize) -> Vec<PageImage> {
    (1..=count)
        .map(|page_number| {
            let path = dir.join(format!("page-{page_number:02}.png"));
            write_png(&path);
            PageImage { page_number, path }
        })
        .collect()
}

#[tokio::test]
async fn single_image_round_trip() {
    let tmp = tempfile::TempDir::new().unwrap();
    let input = tmp.path().join("scan.png");
    write_png(&input);

    let mut args = base_args(input.to_str().unwrap());
    args.custom_model_function = Some(answering("```markdown\n# Scanned page\n```"));
    let result = zerox(args).await.unwrap();

    assert_eq!(result.pages.len(), 1);
    assert_eq!(result.pages[0].page_number, 1);
    assert_eq!(result.pages[0].status, PageStatus::Success);
    // Code fences are stripped and the length reflects the cleaned content.
    assert_eq!(result.pages[0].content, "# Scanned page");
    assert_eq!(result.pages[0].content_length, "# Scanned page".chars().count());
    assert_eq!(result.input_tokens, 11);
    assert_eq!(result.output_tokens, 7);
    assert_eq!(result.summary.ocr.unwrap().successful, 1);
    assert!(result.extracted.is_none());
}

#[tokio::test]
async fn temp_directory_is_removed_on_success_and_failure() {
    let root = tempfile::TempDir::new().unwrap();
    let input = root.path().join("scan.png");
    write_png(&input);

    // Success path.
    let mut args = base_args(input.to_str().unwrap());
    args.temp_dir = Some(root.path().join("runs"));
    args.custom_model_function = Some(answering("ok"));
    zerox(args).await.unwrap();
    assert_no_run_dirs(&root.path().join("runs"));

    // Failure path: the input file does not exist.
    let mut args = base_args(root.path().join("missing.png").to_str().unwrap());
    args.temp_dir = Some(root.path().join("runs"));
    let err = zerox(args).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<zerox::ZeroxError>(),
        Some(zerox::ZeroxError::Acquisition(_))
    ));
    assert_no_run_dirs(&root.path().join("runs"));
}

fn assert_no_run_dirs(runs_root: &std::path::Path) {
    if let Ok(entries) = std::fs::read_dir(runs_root) {
        let leftover: Vec<_> = entries.flatten().map(|e| e.path()).collect();
        assert!(leftover.is_empty(), "temp dirs left behind: {leftover:?}");
    }
}

#[tokio::test]
async fn output_dir_gets_sanitized_markdown() {
    let tmp = tempfile::TempDir::new().unwrap();
    let input = tmp.path().join("Q3 Report.png");
    write_png(&input);

    let out_dir = tmp.path().join("out");
    let mut args = base_args(input.to_str().unwrap());
    args.output_dir = Some(out_dir.clone());
    args.custom_model_function = Some(answering("# Q3"));
    zerox(args).await.unwrap();

    let written = std::fs::read_to_string(out_dir.join("q3_reportpng.md")).unwrap();
    assert_eq!(written, "# Q3");
}

#[tokio::test]
async fn csv_inputs_bypass_rasterization() {
    let tmp = tempfile::TempDir::new().unwrap();
    let input = tmp.path().join("sales.csv");
    std::fs::write(&input, "region,total\nwest,42\n").unwrap();

    let mut args = base_args(input.to_str().unwrap());
    args.cleanup = false;
    args.temp_dir = Some(tmp.path().join("runs"));
    let result = zerox(args).await.unwrap();

    assert_eq!(result.pages.len(), 1);
    assert!(result.pages[0].content.starts_with("sales"));
    assert!(result.pages[0].content.contains("west,42"));

    // No page images were rendered anywhere under the kept run directory.
    let mut stack = vec![tmp.path().join("runs")];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir).unwrap().flatten() {
            let path = entry.path();
            if path.is_dir() {
                assert_ne!(path.file_name().unwrap(), "pages");
                stack.push(path);
            }
        }
    }
}

/// Serve every chat-completion request on a local port with the same canned
/// assistant content, so extraction tests never touch a real endpoint.
async fn spawn_stub_llm(reply_content: &str) -> String {
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let body = serde_json::json!({
        "id": "chatcmpl-stub",
        "object": "chat.completion",
        "created": 0,
        "model": "gpt-4o",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": reply_content },
            "finish_reason": "stop",
        }],
        "usage": { "prompt_tokens": 5, "completion_tokens": 3, "total_tokens": 8 },
    })
    .to_string();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let body = body.clone();
            tokio::spawn(async move {
                // Read headers plus a content-length body; ignore the rest.
                let mut request = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    let n = match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    request.extend_from_slice(&chunk[..n]);
                    if let Some(end) =
                        request.windows(4).position(|w| w == b"\r\n\r\n")
                    {
                        let headers = String::from_utf8_lossy(&request[..end]);
                        let content_length = headers
                            .lines()
                            .find_map(|line| {
                                line.to_ascii_lowercase()
                                    .strip_prefix("content-length:")
                                    .and_then(|v| v.trim().parse::<usize>().ok())
                            })
                            .unwrap_or(0);
                        if request.len() >= end + 4 + content_length {
                            break;
                        }
                    }
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    format!("http://{addr}/v1")
}

#[tokio::test]
async fn extract_only_blanks_structured_pages_but_still_extracts() {
    let tmp = tempfile::TempDir::new().unwrap();
    let input = tmp.path().join("totals.csv");
    std::fs::write(&input, "metric,value\ntotal,42\n").unwrap();

    let endpoint = spawn_stub_llm(r#"{"total": 42}"#).await;
    let mut args = base_args(input.to_str().unwrap());
    args.credentials = Some(Credentials::ApiKey {
        api_key: "sk-test".into(),
        endpoint: Some(endpoint),
    });
    args.extract_only = true;
    args.schema = Some(serde_json::json!({
        "type": "object",
        "properties": { "total": { "type": "number" } },
    }));

    let result = zerox(args).await.unwrap();

    // The sheet text fed extraction, but the returned pages carry only
    // numbering.
    assert_eq!(result.pages.len(), 1);
    assert_eq!(result.pages[0].page_number, 1);
    assert_eq!(result.pages[0].status, PageStatus::Success);
    assert_eq!(result.pages[0].content, "");
    assert_eq!(result.pages[0].content_length, 0);

    assert_eq!(result.extracted, Some(serde_json::json!({"total": 42})));
    assert_eq!(result.summary.extracted.unwrap().successful, 1);
    assert!(result.summary.ocr.is_none());
    assert_eq!(result.input_tokens, 5);
    assert_eq!(result.output_tokens, 3);
}

#[tokio::test]
async fn concurrent_results_stay_in_page_order() {
    let tmp = tempfile::TempDir::new().unwrap();
    let pages = make_pages(tmp.path(), 10);
    let client = test_client().await;

    // Answer with the page's own number, after a jittered delay so
    // completion order differs from page order.
    let custom: CustomModelFn = Arc::new(move |request| {
        async move {
            let delay = 5 + (request.buffers[0].len() % 7) as u64 * 3;
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
            Ok(RawCompletion {
                content: format!("page body {}", request.buffers.len()),
                input_tokens: 1,
                output_tokens: 1,
                logprobs: None,
            })
        }
        .boxed()
    });

    let outcome = run_ocr(
        &client,
        Some(&custom),
        None,
        &pages,
        &ocr_options(5, false, ErrorMode::Ignore),
    )
    .await
    .unwrap();

    assert_eq!(outcome.pages.len(), 10);
    for (index, page) in outcome.pages.iter().enumerate() {
        assert_eq!(page.page_number, index + 1);
        assert_eq!(page.status, PageStatus::Success);
    }
    assert_eq!(outcome.input_tokens, 10);
    assert_eq!(outcome.counts.successful, 10);
}

#[tokio::test]
async fn one_failing_page_is_recorded_in_place() {
    let tmp = tempfile::TempDir::new().unwrap();
    let pages = make_pages(tmp.path(), 10);
    let client = test_client().await;

    let calls = Arc::new(Mutex::new(0usize));
    let calls_in_fn = calls.clone();
    let custom: CustomModelFn = Arc::new(move |_request| {
        let calls = calls_in_fn.clone();
        async move {
            let call_number = {
                let mut calls = calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            if call_number == 7 {
                anyhow::bail!("model permanently unavailable");
            }
            Ok(RawCompletion {
                content: "fine".into(),
                input_tokens: 1,
                output_tokens: 1,
                logprobs: None,
            })
        }
        .boxed()
    });

    let outcome = run_ocr(
        &client,
        Some(&custom),
        None,
        &pages,
        &ocr_options(5, false, ErrorMode::Ignore),
    )
    .await
    .unwrap();

    assert_eq!(outcome.counts.successful, 9);
    assert_eq!(outcome.counts.failed, 1);
    let error_pages: Vec<&Page> = outcome
        .pages
        .iter()
        .filter(|page| page.status == PageStatus::Error)
        .collect();
    assert_eq!(error_pages.len(), 1);
    assert_eq!(error_pages[0].content, "");
    assert!(error_pages[0].error.as_deref().unwrap().contains("unavailable"));
    // The slot index still matches the page number.
    let error_index = outcome
        .pages
        .iter()
        .position(|page| page.status == PageStatus::Error)
        .unwrap();
    assert_eq!(outcome.pages[error_index].page_number, error_index + 1);
}

#[tokio::test]
async fn maintain_format_feeds_each_page_the_prior_one() {
    let tmp = tempfile::TempDir::new().unwrap();
    let pages = make_pages(tmp.path(), 3);
    let client = test_client().await;

    let seen_priors = Arc::new(Mutex::new(Vec::<Option<String>>::new()));
    let seen_in_fn = seen_priors.clone();
    let counter = Arc::new(Mutex::new(0usize));
    let counter_in_fn = counter.clone();
    let custom: CustomModelFn = Arc::new(move |request| {
        let seen = seen_in_fn.clone();
        let counter = counter_in_fn.clone();
        async move {
            seen.lock().unwrap().push(request.prior_page.clone());
            let n = {
                let mut counter = counter.lock().unwrap();
                *counter += 1;
                *counter
            };
            Ok(RawCompletion {
                content: format!("content of page {n}"),
                input_tokens: 1,
                output_tokens: 1,
                logprobs: None,
            })
        }
        .boxed()
    });

    let outcome = run_ocr(
        &client,
        Some(&custom),
        None,
        &pages,
        &ocr_options(4, true, ErrorMode::Ignore),
    )
    .await
    .unwrap();

    assert_eq!(outcome.counts.successful, 3);
    let priors = seen_priors.lock().unwrap();
    assert_eq!(priors[0], None);
    assert_eq!(priors[1].as_deref(), Some("content of page 1"));
    assert_eq!(priors[2].as_deref(), Some("content of page 2"));
}

#[tokio::test]
async fn maintain_format_halts_after_a_failure() {
    let tmp = tempfile::TempDir::new().unwrap();
    let pages = make_pages(tmp.path(), 3);
    let client = test_client().await;

    let counter = Arc::new(Mutex::new(0usize));
    let counter_in_fn = counter.clone();
    let custom: CustomModelFn = Arc::new(move |_request| {
        let counter = counter_in_fn.clone();
        async move {
            let n = {
                let mut counter = counter.lock().unwrap();
                *counter += 1;
                *counter
            };
            if n == 2 {
                anyhow::bail!("page two is cursed");
            }
            Ok(RawCompletion {
                content: format!("content {n}"),
                input_tokens: 1,
                output_tokens: 1,
                logprobs: None,
            })
        }
        .boxed()
    });

    // Ignore mode: the failed page and everything after it become error
    // pages, but the call succeeds and the first page survives.
    let outcome = run_ocr(
        &client,
        Some(&custom),
        None,
        &pages,
        &ocr_options(1, true, ErrorMode::Ignore),
    )
    .await
    .unwrap();
    assert_eq!(outcome.pages.len(), 3);
    assert_eq!(outcome.pages[0].status, PageStatus::Success);
    assert_eq!(outcome.pages[1].status, PageStatus::Error);
    assert_eq!(outcome.pages[2].status, PageStatus::Error);
    assert_eq!(outcome.counts.failed, 2);

    // Throw mode: the failure propagates as an OCR error naming the page.
    *counter.lock().unwrap() = 0;
    let err = run_ocr(
        &client,
        Some(&custom),
        None,
        &pages,
        &ocr_options(1, true, ErrorMode::Throw),
    )
    .await
    .unwrap_err();
    match err.downcast_ref::<zerox::ZeroxError>() {
        Some(zerox::ZeroxError::Ocr { page, .. }) => assert_eq!(*page, 2),
        other => panic!("expected an OCR error, got {other:?}"),
    }
}

#[tokio::test]
async fn retries_recover_flaky_pages() {
    let tmp = tempfile::TempDir::new().unwrap();
    let pages = make_pages(tmp.path(), 1);
    let client = test_client().await;

    let attempts = Arc::new(Mutex::new(0usize));
    let attempts_in_fn = attempts.clone();
    let custom: CustomModelFn = Arc::new(move |_request| {
        let attempts = attempts_in_fn.clone();
        async move {
            let n = {
                let mut attempts = attempts.lock().unwrap();
                *attempts += 1;
                *attempts
            };
            if n == 1 {
                anyhow::bail!("first attempt flakes");
            }
            Ok(RawCompletion {
                content: "recovered".into(),
                input_tokens: 1,
                output_tokens: 1,
                logprobs: None,
            })
        }
        .boxed()
    });

    let mut options = ocr_options(1, false, ErrorMode::Throw);
    options.max_retries = 2;
    let outcome = run_ocr(&client, Some(&custom), None, &pages, &options)
        .await
        .unwrap();
    assert_eq!(outcome.pages[0].content, "recovered");
    assert_eq!(*attempts.lock().unwrap(), 2);
}

#[test]
fn cli_help_and_version() {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin("zerox"));
    cmd.arg("--help");
    assert!(cmd.output().unwrap().status.success());

    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin("zerox"));
    cmd.arg("--version");
    assert!(cmd.output().unwrap().status.success());
}
