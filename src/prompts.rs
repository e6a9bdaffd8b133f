//! Built-in system prompts and the format-carryover context message.

/// The default OCR system prompt, used when the caller does not supply one.
pub const DEFAULT_OCR_PROMPT: &str = "\
Convert the following image to markdown.
Return only the markdown with no explanation text. Do not include delimiters like ```markdown or ```html.

RULES:
- You must include all information on the page. Do not exclude headers, footers, or subtext.
- Return tables in an HTML format.
- Charts and infographics must be interpreted to a markdown format. Prefer table format when applicable.
- Logos should be wrapped in brackets. Ex: <logo>Coca-Cola<logo>
- Watermarks should be wrapped in brackets. Ex: <watermark>OFFICIAL COPY<watermark>
- Page numbers should be wrapped in brackets. Ex: <page_number>14<page_number> or <page_number>9/22<page_number>
- Prefer using unicode characters for checkboxes over images. Ex: \u{2610} or \u{2611}.";

/// The default extraction system prompt.
pub const DEFAULT_EXTRACTION_PROMPT: &str = "\
Extract the following JSON schema from the provided content. \
Return only valid JSON matching the schema, with no explanation text.";

/// Build the consistency message passed along with each page when format
/// maintenance is enabled. The previous page's markdown is included verbatim
/// so the model keeps numbering, heading levels, and table style consistent.
pub fn consistency_prompt(prior_page: &str) -> String {
    format!(
        "Markdown must maintain consistent formatting with the following page: \n\n \"\"\"{prior_page}\"\"\""
    )
}
