//! Input resolution: materialize a local path or URL into the run's temp
//! directory.
//!
//! Downstream converters (`soffice`, `pdftocairo`) need a real filesystem
//! path, and rasterization writes page files next to the source, so even
//! local inputs are copied into a fresh subdirectory of the per-run temp
//! dir. The copy also means the pipeline never writes anywhere near the
//! caller's original file.

use std::time::Duration;

use crate::{error::ZeroxError, prelude::*};

/// Magic bytes of a compound-file binary (legacy Office container).
const COMPOUND_FILE_MAGIC: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

/// How long to wait for a remote document download.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// The resolved input file.
#[derive(Clone, Debug)]
pub struct AcquiredFile {
    /// Lowercase extension without the dot, e.g. `pdf`.
    pub extension: String,

    /// Path of the materialized copy inside the temp directory.
    pub local_path: PathBuf,
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Materialize `file_path` (local path or URL) into `temp_dir` and detect
/// its type.
#[instrument(level = "debug", skip(temp_dir))]
pub async fn acquire_file(file_path: &str, temp_dir: &Path) -> Result<AcquiredFile> {
    let source_dir = temp_dir.join("source");
    tokio::fs::create_dir_all(&source_dir)
        .await
        .with_context(|| format!("failed to create {:?}", source_dir.display()))?;

    let file_name = if is_url(file_path) {
        file_name_from_url(file_path)
    } else {
        Path::new(file_path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_owned())
    };
    let local_path = source_dir.join(&file_name);

    let bytes = if is_url(file_path) {
        download(file_path).await?
    } else {
        tokio::fs::read(file_path).await.map_err(|err| {
            anyhow!(ZeroxError::Acquisition(format!(
                "cannot read {file_path}: {err}"
            )))
        })?
    };
    tokio::fs::write(&local_path, &bytes)
        .await
        .with_context(|| format!("failed to write {:?}", local_path.display()))?;

    let mut extension = Path::new(&file_name)
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    // Some legacy Office documents circulate with a `.pdf` extension. Their
    // container signature gives them away; route them through the office
    // converter instead of the PDF renderer.
    if extension == "pdf" && bytes.len() >= 8 && bytes[..8] == COMPOUND_FILE_MAGIC {
        debug!(
            path = %local_path.display(),
            "input has a .pdf extension but a compound-file signature"
        );
        extension = "doc".to_owned();
    }

    debug!(extension, path = %local_path.display(), "acquired input file");
    Ok(AcquiredFile {
        extension,
        local_path,
    })
}

/// Download a remote document.
async fn download(url: &str) -> Result<Vec<u8>> {
    let client = reqwest::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
        .context("failed to build HTTP client")?;
    let response = client.get(url).send().await.map_err(|err| {
        anyhow!(ZeroxError::Acquisition(format!(
            "failed to download {url}: {err}"
        )))
    })?;
    let status = response.status();
    if !status.is_success() {
        return Err(anyhow!(ZeroxError::Acquisition(format!(
            "failed to download {url}: HTTP {status}"
        ))));
    }
    let bytes = response.bytes().await.map_err(|err| {
        anyhow!(ZeroxError::Acquisition(format!(
            "failed to download {url}: {err}"
        )))
    })?;
    Ok(bytes.to_vec())
}

/// Pick a filename for a downloaded document from the last URL path
/// segment.
fn file_name_from_url(url: &str) -> String {
    let trimmed = url.split(['?', '#']).next().unwrap_or(url);
    let last = trimmed.rsplit('/').next().unwrap_or("");
    if last.contains('.') && !last.is_empty() {
        last.to_owned()
    } else {
        "downloaded.pdf".to_owned()
    }
}
