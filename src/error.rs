//! The pipeline's error taxonomy.
//!
//! Internally we pass errors around as [`anyhow::Error`], adding context as
//! they bubble up. Failures that callers need to tell apart are created as
//! [`ZeroxError`] values, so a caller (or a test) can classify any returned
//! error with `err.downcast_ref::<ZeroxError>()`.

use thiserror::Error;

/// Failure kinds surfaced by the document pipeline.
#[derive(Debug, Error)]
pub enum ZeroxError {
    /// Invalid or conflicting arguments. Raised before any work starts.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The input file could not be read or downloaded.
    #[error("could not acquire input file: {0}")]
    Acquisition(String),

    /// Office/HEIC conversion to an intermediate format failed.
    #[error("document conversion failed: {0}")]
    Conversion(String),

    /// PDF-to-image rendering failed.
    #[error("rasterization failed: {0}")]
    Rasterization(String),

    /// A vision-model OCR call failed after exhausting retries.
    #[error("OCR failed on page {page}: {message}")]
    Ocr { page: usize, message: String },

    /// An extraction call failed after exhausting retries, or its response
    /// could not be parsed against the schema.
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// The caller-supplied schema is not a valid JSON Schema object.
    #[error("invalid schema: {0}")]
    Schema(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_survives_anyhow_roundtrip() {
        let err = anyhow::Error::new(ZeroxError::Config("missing file_path".into()));
        let kind = err.downcast_ref::<ZeroxError>();
        assert!(matches!(kind, Some(ZeroxError::Config(_))));
    }

    #[test]
    fn ocr_error_names_the_page() {
        let err = ZeroxError::Ocr {
            page: 3,
            message: "timed out".into(),
        };
        assert!(err.to_string().contains("page 3"));
    }
}
