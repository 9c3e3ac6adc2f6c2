//! Helpers shared by the Toolflow engine, registry and CLI.

pub mod http;
pub mod json_path;
pub mod text_processing;

pub use http::{build_request_url, parse_response_body, status_error_message};
pub use json_path::{canonical_string, select_path};
pub use text_processing::{redact_sensitive, truncate_preview};
