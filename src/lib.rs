//! # zerox
//!
//! Convert documents (PDFs, office files, images, HEIC, spreadsheets) into
//! page-structured Markdown, and optionally into JSON conforming to a
//! caller-supplied schema, using vision LLMs for OCR.
//!
//! The pipeline: acquire → normalize → rasterize → clean → OCR via vision
//! LLM → (optionally) schema-driven extraction. Office formats are
//! normalized through LibreOffice, PDFs are rendered with Poppler, and
//! Tesseract is used only to detect page rotation before the vision model
//! sees an image.
//!
//! ```rust,no_run
//! #![recursion_limit = "256"]
//! use zerox::{Credentials, ZeroxArgs, zerox};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let result = zerox(ZeroxArgs {
//!         file_path: "invoice.pdf".into(),
//!         credentials: Some(Credentials::ApiKey {
//!             api_key: "sk-...".into(),
//!             endpoint: None,
//!         }),
//!         ..ZeroxArgs::default()
//!     })
//!     .await?;
//!     for page in &result.pages {
//!         println!("{}", page.content);
//!     }
//!     Ok(())
//! }
//! ```

#![recursion_limit = "256"]

pub mod acquire;
pub mod args;
mod async_utils;
pub mod completion;
mod data_url;
pub mod error;
pub mod extract;
pub mod image_utils;
pub mod model;
pub mod ocr;
pub mod output;
pub mod pipeline;
mod prelude;
mod prompts;
pub mod rasterize;
mod retry;
pub mod schema;
pub mod sheets;
pub mod tesseract;

pub use args::{Credentials, ErrorMode, LlmParams, ModelProvider, PageSelection, ZeroxArgs};
pub use error::ZeroxError;
pub use model::{CustomModelFn, OcrRequest, RawCompletion};
pub use output::{Page, PageStatus, PipelineResult, StageCounts, Summary};
pub use pipeline::zerox;
