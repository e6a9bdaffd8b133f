//! Turning an acquired document into an ordered list of PNG page images.
//!
//! Images pass through untouched, HEIC goes through `heif-convert`, and
//! everything else is normalized to PDF (office formats via `soffice`)
//! before Poppler's `pdftocairo` renders the selected pages. All conversion
//! work happens inside the per-run temp directory.

use std::collections::BTreeMap;

use tokio::process::Command;

use crate::{
    acquire::AcquiredFile,
    args::PageSelection,
    async_utils::check_for_command_failure,
    error::ZeroxError,
    image_utils,
    prelude::*,
};

/// Default rendering DPI when the caller doesn't specify one.
pub const DEFAULT_DENSITY: u32 = 300;

/// One rendered page image.
#[derive(Clone, Debug)]
pub struct PageImage {
    /// 1-based page number in the source document.
    pub page_number: usize,

    /// Path of the rendered PNG (or original image file).
    pub path: PathBuf,
}

/// Rendering options for [`rasterize_document`].
#[derive(Clone, Debug)]
pub struct RasterizeOptions {
    /// Rendering DPI.
    pub image_density: Option<u32>,

    /// Target page height in pixels, aspect-preserving. Overrides density.
    pub image_height: Option<u32>,

    /// Which pages to render.
    pub pages: PageSelection,

    /// Recompress rendered pages above this many megabytes. `0` disables.
    pub max_image_size_mb: f64,
}

/// Convert the acquired document into page images, ordered by page number.
#[instrument(level = "debug", skip_all, fields(extension = %acquired.extension))]
pub async fn rasterize_document(
    acquired: &AcquiredFile,
    temp_dir: &Path,
    options: &RasterizeOptions,
) -> Result<Vec<PageImage>> {
    let mut pages = match acquired.extension.as_str() {
        "png" | "jpg" | "jpeg" => vec![PageImage {
            page_number: 1,
            path: acquired.local_path.clone(),
        }],
        "heic" => vec![PageImage {
            page_number: 1,
            path: convert_heic(&acquired.local_path, temp_dir).await?,
        }],
        "pdf" => {
            pdf_to_page_images(&acquired.local_path, temp_dir, options).await?
        }
        _ => {
            let pdf_path = office_to_pdf(&acquired.local_path, temp_dir).await?;
            pdf_to_page_images(&pdf_path, temp_dir, options).await?
        }
    };

    if options.max_image_size_mb > 0.0 {
        let max_bytes = (options.max_image_size_mb * 1024.0 * 1024.0) as u64;
        for page in pages.iter_mut() {
            if let Some(compressed) = compress_page(&page.path, max_bytes).await? {
                page.path = compressed;
            }
        }
    }

    Ok(pages)
}

/// Convert an office document to PDF using LibreOffice.
async fn office_to_pdf(path: &Path, temp_dir: &Path) -> Result<PathBuf> {
    let out_dir = temp_dir.join("converted");
    tokio::fs::create_dir_all(&out_dir)
        .await
        .with_context(|| format!("failed to create {:?}", out_dir.display()))?;

    let output = Command::new("soffice")
        .arg("--headless")
        .arg("--convert-to")
        .arg("pdf")
        .arg("--outdir")
        .arg(&out_dir)
        .arg(path)
        .output()
        .await
        .context("cannot run soffice (is LibreOffice installed?)")?;
    check_for_command_failure("soffice", &output)
        .map_err(|err| anyhow!(ZeroxError::Conversion(format!("{err:#}"))))?;

    let stem = path
        .file_stem()
        .context("input file has no name")?
        .to_string_lossy();
    let pdf_path = out_dir.join(format!("{stem}.pdf"));
    if !pdf_path.exists() {
        return Err(anyhow!(ZeroxError::Conversion(format!(
            "soffice reported success but produced no {:?}",
            pdf_path.display()
        ))));
    }
    debug!(path = %pdf_path.display(), "converted office document to PDF");
    Ok(pdf_path)
}

/// Convert a HEIC image to JPEG.
async fn convert_heic(path: &Path, temp_dir: &Path) -> Result<PathBuf> {
    let out_path = temp_dir.join("converted.jpg");
    let output = Command::new("heif-convert")
        .arg(path)
        .arg(&out_path)
        .output()
        .await
        .context("cannot run heif-convert (is libheif installed?)")?;
    check_for_command_failure("heif-convert", &output)
        .map_err(|err| anyhow!(ZeroxError::Conversion(format!("{err:#}"))))?;
    Ok(out_path)
}

/// Get the number of pages in a PDF file.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn pdf_page_count(path: &Path) -> Result<usize> {
    let output = Command::new("pdfinfo")
        .arg(path)
        .output()
        .await
        .with_context(|| format!("failed to run pdfinfo on {:?}", path.display()))?;
    check_for_command_failure("pdfinfo", &output)
        .map_err(|err| anyhow!(ZeroxError::Rasterization(format!("{err:#}"))))?;

    let stdout =
        String::from_utf8(output.stdout).context("pdfinfo output was not valid UTF-8")?;
    let mut properties = BTreeMap::new();
    for line in stdout.lines() {
        let mut parts = line.splitn(2, ':');
        let key = parts.next().unwrap_or("").trim();
        let value = parts.next().unwrap_or("").trim();
        properties.insert(key.to_string(), value.to_string());
    }
    let page_count = properties
        .get("Pages")
        .ok_or_else(|| anyhow!("failed to find page count in pdfinfo output"))?;
    page_count.parse::<usize>().with_context(|| {
        format!(
            "failed to parse page count for {:?} from pdfinfo output",
            path.display()
        )
    })
}

/// Render the selected PDF pages to PNG files, returning them in ascending
/// page order.
async fn pdf_to_page_images(
    pdf_path: &Path,
    temp_dir: &Path,
    options: &RasterizeOptions,
) -> Result<Vec<PageImage>> {
    let total_pages = pdf_page_count(pdf_path).await?;
    let selected = options.pages.selected_pages(total_pages);
    if selected.is_empty() {
        return Err(anyhow!(ZeroxError::Rasterization(format!(
            "page selection matched none of the document's {total_pages} pages"
        ))));
    }

    let pages_dir = temp_dir.join("pages");
    tokio::fs::create_dir_all(&pages_dir)
        .await
        .with_context(|| format!("failed to create {:?}", pages_dir.display()))?;

    if selected.len() == total_pages {
        let paths = render_all_pages(pdf_path, &pages_dir, options).await?;
        if paths.len() != total_pages {
            return Err(anyhow!(ZeroxError::Rasterization(format!(
                "expected {total_pages} rendered pages, found {}",
                paths.len()
            ))));
        }
        Ok(paths
            .into_iter()
            .zip(1..)
            .map(|(path, page_number)| PageImage { page_number, path })
            .collect())
    } else {
        // Poppler only takes contiguous ranges, so arbitrary selections are
        // rendered one page at a time.
        let mut pages = Vec::with_capacity(selected.len());
        for page_number in selected {
            let path =
                render_single_page(pdf_path, &pages_dir, options, page_number).await?;
            pages.push(PageImage { page_number, path });
        }
        Ok(pages)
    }
}

/// One `pdftocairo` run over the whole document.
async fn render_all_pages(
    pdf_path: &Path,
    pages_dir: &Path,
    options: &RasterizeOptions,
) -> Result<Vec<PathBuf>> {
    let prefix = pages_dir.join("page");
    let mut cmd = Command::new("pdftocairo");
    cmd.arg("-png");
    add_scaling_args(&mut cmd, options);
    let output = cmd
        .arg(pdf_path)
        .arg(&prefix)
        .output()
        .await
        .with_context(|| format!("failed to run pdftocairo on {:?}", pdf_path.display()))?;
    check_for_command_failure("pdftocairo", &output)
        .map_err(|err| anyhow!(ZeroxError::Rasterization(format!("{err:#}"))))?;

    // pdftocairo zero-pads page numbers, so lexical order is page order.
    let mut paths = Vec::new();
    let mut entries = tokio::fs::read_dir(pages_dir)
        .await
        .with_context(|| format!("failed to read {:?}", pages_dir.display()))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .context("failed to read page directory entry")?
    {
        paths.push(entry.path());
    }
    paths.sort();
    Ok(paths)
}

/// Render exactly one page.
async fn render_single_page(
    pdf_path: &Path,
    pages_dir: &Path,
    options: &RasterizeOptions,
    page: usize,
) -> Result<PathBuf> {
    let prefix = pages_dir.join(format!("page_{page:04}"));
    let mut cmd = Command::new("pdftocairo");
    cmd.arg("-png")
        .arg("-singlefile")
        .arg("-f")
        .arg(page.to_string())
        .arg("-l")
        .arg(page.to_string());
    add_scaling_args(&mut cmd, options);
    let output = cmd
        .arg(pdf_path)
        .arg(&prefix)
        .output()
        .await
        .with_context(|| format!("failed to run pdftocairo on {:?}", pdf_path.display()))?;
    check_for_command_failure("pdftocairo", &output)
        .map_err(|err| anyhow!(ZeroxError::Rasterization(format!("{err:#}"))))?;
    Ok(prefix.with_extension("png"))
}

/// Apply the caller's density/height knobs to a `pdftocairo` invocation.
fn add_scaling_args(cmd: &mut Command, options: &RasterizeOptions) {
    if let Some(height) = options.image_height {
        cmd.arg("-scale-to-y")
            .arg(height.to_string())
            .arg("-scale-to-x")
            .arg("-1");
    } else {
        cmd.arg("-r")
            .arg(options.image_density.unwrap_or(DEFAULT_DENSITY).to_string());
    }
}

/// Recompress one rendered page to fit the size bound, writing the result
/// alongside the original with a `_compressed.png` suffix.
async fn compress_page(path: &Path, max_bytes: u64) -> Result<Option<PathBuf>> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {:?}", path.display()))?;
    let Some(compressed) = image_utils::compress_to_bound(&bytes, max_bytes)? else {
        return Ok(None);
    };
    let out_path = compressed_path(path);
    tokio::fs::write(&out_path, &compressed)
        .await
        .with_context(|| format!("failed to write {:?}", out_path.display()))?;
    debug!(
        from = bytes.len(),
        to = compressed.len(),
        path = %out_path.display(),
        "recompressed oversized page image"
    );
    Ok(Some(out_path))
}

/// `pages/page-01.png` → `pages/page-01_compressed.png`.
fn compressed_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "page".to_owned());
    path.with_file_name(format!("{stem}_compressed.png"))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A minimal two-page PDF. Poppler reconstructs the xref table, so the
    /// offsets don't need to be exact.
    const TWO_PAGE_PDF: &str = "%PDF-1.4\n\
1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n\
2 0 obj << /Type /Pages /Kids [3 0 R 4 0 R] /Count 2 >> endobj\n\
3 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] >> endobj\n\
4 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] >> endobj\n\
trailer << /Size 5 /Root 1 0 R >>\n\
%%EOF\n";

    #[test]
    fn compressed_path_keeps_the_directory() {
        let path = compressed_path(Path::new("/tmp/run/pages/page-03.png"));
        assert_eq!(
            path,
            Path::new("/tmp/run/pages/page-03_compressed.png")
        );
    }

    #[tokio::test]
    #[ignore = "Requires poppler-utils to be installed"]
    async fn page_count_reads_pdfinfo_output() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pdf = tmp.path().join("two.pdf");
        tokio::fs::write(&pdf, TWO_PAGE_PDF).await.unwrap();
        assert_eq!(pdf_page_count(&pdf).await.unwrap(), 2);
    }

    #[tokio::test]
    #[ignore = "Requires poppler-utils to be installed"]
    async fn renders_selected_pages_in_order() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pdf = tmp.path().join("two.pdf");
        tokio::fs::write(&pdf, TWO_PAGE_PDF).await.unwrap();

        let options = RasterizeOptions {
            image_density: Some(72),
            image_height: None,
            pages: PageSelection::All,
            max_image_size_mb: 0.0,
        };
        let acquired = AcquiredFile {
            extension: "pdf".into(),
            local_path: pdf,
        };
        let pages = rasterize_document(&acquired, tmp.path(), &options)
            .await
            .unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].page_number, 1);
        assert_eq!(pages[1].page_number, 2);
    }

    #[tokio::test]
    #[ignore = "Requires poppler-utils to be installed"]
    async fn out_of_range_pages_are_dropped() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pdf = tmp.path().join("two.pdf");
        tokio::fs::write(&pdf, TWO_PAGE_PDF).await.unwrap();

        let options = RasterizeOptions {
            image_density: Some(72),
            image_height: None,
            pages: PageSelection::List(vec![2, 9]),
            max_image_size_mb: 0.0,
        };
        let acquired = AcquiredFile {
            extension: "pdf".into(),
            local_path: pdf,
        };
        let pages = rasterize_document(&acquired, tmp.path(), &options)
            .await
            .unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].page_number, 2);
    }
}
