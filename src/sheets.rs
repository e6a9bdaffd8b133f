//! Direct text extraction for spreadsheet and workbook inputs.
//!
//! Workbooks already contain their text, so rasterizing them for a vision
//! model would only lose structure. Each sheet becomes one page: the sheet
//! name on the first line, then tab-separated rows in sheet order. The
//! extraction stage treats these pages exactly like OCR output.

use calamine::{Data, Reader, open_workbook_auto};

use crate::{
    completion::ProcessedOcr,
    error::ZeroxError,
    output::Page,
    prelude::*,
};

/// Extensions handled here instead of by the rasterizer.
const STRUCTURED_EXTENSIONS: &[&str] = &["xlsx", "xls", "xlsm", "xlsb", "ods", "csv", "tsv"];

/// Does this extension identify a structured-data source?
pub fn is_structured_extension(extension: &str) -> bool {
    STRUCTURED_EXTENSIONS.contains(&extension)
}

/// Read a workbook into one [`Page`] per sheet.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn read_sheet_pages(path: &Path, extension: &str) -> Result<Vec<Page>> {
    if extension == "csv" || extension == "tsv" {
        return read_delimited_page(path).await;
    }

    let path = path.to_owned();
    // Workbook parsing is synchronous; keep it off the async executor.
    let contents = tokio::task::spawn_blocking(move || -> Result<Vec<(String, String)>> {
        let mut workbook = open_workbook_auto(&path).map_err(|err| {
            anyhow!(ZeroxError::Conversion(format!(
                "cannot open workbook {:?}: {err}",
                path.display()
            )))
        })?;
        let sheet_names = workbook.sheet_names().to_owned();
        let mut sheets = Vec::with_capacity(sheet_names.len());
        for name in sheet_names {
            let range = workbook.worksheet_range(&name).map_err(|err| {
                anyhow!(ZeroxError::Conversion(format!(
                    "cannot read sheet {name:?}: {err}"
                )))
            })?;
            sheets.push((name, serialize_range(&range)));
        }
        Ok(sheets)
    })
    .await
    .context("workbook reader task panicked")??;

    Ok(contents
        .into_iter()
        .enumerate()
        .map(|(index, (name, body))| sheet_page(index + 1, &name, &body))
        .collect())
}

/// CSV and TSV files are a single already-textual sheet.
async fn read_delimited_page(path: &Path) -> Result<Vec<Page>> {
    let text = tokio::fs::read_to_string(path).await.map_err(|err| {
        anyhow!(ZeroxError::Conversion(format!(
            "cannot read {:?}: {err}",
            path.display()
        )))
    })?;
    let name = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "sheet".to_owned());
    Ok(vec![sheet_page(1, &name, text.trim_end())])
}

/// Serialize cells as tab-separated rows, dropping trailing empty cells.
fn serialize_range(range: &calamine::Range<Data>) -> String {
    range
        .rows()
        .map(|row| {
            let mut cells = row
                .iter()
                .map(|cell| match cell {
                    Data::Empty => String::new(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>();
            while cells.last().is_some_and(String::is_empty) {
                cells.pop();
            }
            cells.join("\t")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn sheet_page(page_number: usize, sheet_name: &str, body: &str) -> Page {
    let content = if body.is_empty() {
        sheet_name.to_owned()
    } else {
        format!("{sheet_name}\n\n{body}")
    };
    let content_length = content.chars().count();
    Page::success(
        page_number,
        ProcessedOcr {
            content,
            content_length,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_workbook_extensions() {
        assert!(is_structured_extension("xlsx"));
        assert!(is_structured_extension("ods"));
        assert!(!is_structured_extension("pdf"));
        assert!(!is_structured_extension("png"));
    }

    #[test]
    fn pages_start_with_the_sheet_name() {
        let page = sheet_page(1, "Q1", "Revenue\t100\nCosts\t40");
        assert!(page.content.starts_with("Q1"));
        assert!(page.content.contains("Revenue\t100"));
        assert_eq!(page.content_length, page.content.chars().count());
    }

    #[test]
    fn empty_sheets_still_get_a_page() {
        let page = sheet_page(2, "Notes", "");
        assert_eq!(page.content, "Notes");
        assert_eq!(page.page_number, 2);
    }

    #[tokio::test]
    async fn csv_inputs_become_a_single_page() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("sales.csv");
        tokio::fs::write(&path, "region,total\nwest,42\n").await.unwrap();
        let pages = read_sheet_pages(&path, "csv").await.unwrap();
        assert_eq!(pages.len(), 1);
        assert!(pages[0].content.starts_with("sales"));
        assert!(pages[0].content.contains("west,42"));
    }
}
