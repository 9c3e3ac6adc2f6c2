//! # HTTP Utilities
//!
//! URL construction and response parsing shared by connectors.

use indexmap::IndexMap;
use serde_json::Value;
use url::Url;

/// Return a user-friendly error message for common HTTP status codes.
///
/// ```rust
/// use toolflow_util::status_error_message;
///
/// assert!(status_error_message(401).unwrap().contains("credentials"));
/// assert!(status_error_message(200).is_none());
/// ```
pub fn status_error_message(status_code: u16) -> Option<String> {
    match status_code {
        401 => Some("Unauthorized (401). Hint: check the credentials configured for this system".into()),
        403 => Some("Forbidden (403). Hint: the credentials lack permission for this resource".into()),
        404 => Some("Not Found (404). Hint: verify the url and any path placeholders".into()),
        429 => Some("Too Many Requests (429). Hint: lower loop concurrency or the page size".into()),
        _ => None,
    }
}

/// Parse a base URL and append query parameters in declaration order.
///
/// Parameters already present in the URL are kept; new pairs are appended after them.
pub fn build_request_url(base: &str, query: &IndexMap<String, String>) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(base.trim())?;
    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (name, value) in query {
            pairs.append_pair(name, value);
        }
    }
    Ok(url)
}

/// Parse a response body leniently: JSON when it parses, otherwise the raw text.
///
/// An empty body becomes `null`.
pub fn parse_response_body(text: &str) -> Value {
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str::<Value>(text).unwrap_or_else(|_| Value::String(text.to_string()))
}
