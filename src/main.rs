#![recursion_limit = "256"]

use std::str::FromStr;

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing::{debug, instrument};
use tracing_subscriber::{EnvFilter, filter::Directive, fmt::format::FmtSpan};
use zerox::{
    Credentials, ErrorMode, ModelProvider, PageSelection, ZeroxArgs, zerox,
};

/// OCR documents into page-structured Markdown with a vision LLM.
#[derive(Debug, Parser)]
#[clap(
    version,
    author,
    after_help = r#"
Credentials are passed explicitly; nothing is read from provider-specific
environment variables. An `--api-key` may be set in a standard `.env` file
as ZEROX_API_KEY.
"#
)]
struct Opts {
    /// Input document: a local path or an HTTP(S) URL.
    file_path: String,

    /// Model to use.
    #[clap(short = 'm', long, default_value = "gpt-4o")]
    model: String,

    /// Provider serving the model.
    #[clap(long, value_enum, default_value = "openai")]
    provider: ProviderOpt,

    /// API key for the provider.
    #[clap(long, env = "ZEROX_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Endpoint override (required for Azure).
    #[clap(long)]
    endpoint: Option<String>,

    /// Max number of concurrent model calls.
    #[clap(short = 'j', long = "jobs", default_value = "10")]
    concurrency: usize,

    /// Process pages sequentially, carrying formatting context forward.
    #[clap(long)]
    maintain_format: bool,

    /// Abort the run on the first failed page instead of recording it.
    #[clap(long)]
    fail_fast: bool,

    /// Retry budget per model call.
    #[clap(long, default_value = "1")]
    max_retries: usize,

    /// Pages to convert: "-1" for all, "3", or "1,3,5".
    #[clap(long, default_value = "-1")]
    pages: String,

    /// DPI for PDF rasterization.
    #[clap(long)]
    density: Option<u32>,

    /// Directory to write the assembled markdown into.
    #[clap(short = 'o', long = "out")]
    output_dir: Option<std::path::PathBuf>,

    /// Skip orientation correction.
    #[clap(long)]
    no_correct_orientation: bool,

    /// Skip edge trimming.
    #[clap(long)]
    no_trim_edges: bool,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum ProviderOpt {
    Openai,
    Azure,
    Google,
}

impl From<ProviderOpt> for ModelProvider {
    fn from(value: ProviderOpt) -> Self {
        match value {
            ProviderOpt::Openai => ModelProvider::OpenAi,
            ProviderOpt::Azure => ModelProvider::Azure,
            ProviderOpt::Google => ModelProvider::Google,
        }
    }
}

/// Parse the `--pages` flag.
fn parse_pages(value: &str) -> Result<PageSelection> {
    if value == "-1" {
        return Ok(PageSelection::All);
    }
    let pages = value
        .split(',')
        .map(|part| usize::from_str(part.trim()).context("invalid page number"))
        .collect::<Result<Vec<_>>>()?;
    Ok(match pages.as_slice() {
        [single] => PageSelection::Single(*single),
        _ => PageSelection::List(pages),
    })
}

/// Our entry point, which can return an error. [`anyhow::Result`] will
/// automatically print a nice error message with optional backtrace.
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing.
    let directive =
        Directive::from_str("info").expect("built-in directive should be valid");
    let env_filter = EnvFilter::builder()
        .with_default_directive(directive)
        .from_env_lossy();
    tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .init();

    // Call our real `main` function now that logging is set up.
    real_main().await
}

/// Our real entry point.
#[instrument(level = "debug", name = "main")]
async fn real_main() -> Result<()> {
    // Load environment variables from a `.env` file, if it exists.
    dotenvy::dotenv().ok();

    // Parse command-line arguments.
    let opts = Opts::parse();

    let args = ZeroxArgs {
        file_path: opts.file_path.clone(),
        credentials: Some(Credentials::ApiKey {
            api_key: opts.api_key.clone(),
            endpoint: opts.endpoint.clone(),
        }),
        model: opts.model.clone(),
        model_provider: opts.provider.into(),
        concurrency: opts.concurrency,
        maintain_format: opts.maintain_format,
        error_mode: if opts.fail_fast {
            ErrorMode::Throw
        } else {
            ErrorMode::Ignore
        },
        max_retries: opts.max_retries,
        image_density: opts.density,
        pages_to_convert: parse_pages(&opts.pages)?,
        output_dir: opts.output_dir.clone(),
        correct_orientation: !opts.no_correct_orientation,
        trim_edges: !opts.no_trim_edges,
        ..ZeroxArgs::default()
    };
    // ZeroxArgs redacts credentials in its Debug output.
    debug!("Pipeline arguments: {:?}", args);

    let result = zerox(args).await?;
    eprintln!(
        "{} pages in {}ms ({} input tokens, {} output tokens)",
        result.summary.total_pages,
        result.completion_time_ms,
        result.input_tokens,
        result.output_tokens,
    );
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
