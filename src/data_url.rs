//! Converting binary data to and from `data:` URLs.

use base64::{Engine as _, prelude::BASE64_STANDARD};

/// Convert binary data to a `data:` URL.
pub fn data_url(mime_type: &str, data: &[u8]) -> String {
    let base64_data = BASE64_STANDARD.encode(data);
    // Some sources indicate that the Base64 data should be percent-encoded, but
    // in practice this breaks Gemini and probably several other LLMs.
    format!("data:{};base64,{}", mime_type, base64_data)
}

/// Split a `data:` URL into its MIME type and raw Base64 payload.
///
/// Returns `None` for anything that isn't a Base64 data URL.
pub fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (mime_type, data) = rest.split_once(";base64,")?;
    Some((mime_type.to_owned(), data.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let url = data_url("image/png", b"fake png bytes");
        let (mime_type, payload) = parse_data_url(&url).unwrap();
        assert_eq!(mime_type, "image/png");
        assert_eq!(
            BASE64_STANDARD.decode(payload).unwrap(),
            b"fake png bytes"
        );
    }

    #[test]
    fn rejects_plain_urls() {
        assert!(parse_data_url("https://example.com/a.png").is_none());
    }
}
