//! Utility functions shared by the parser and the dispatcher.
//!
//! - **URL validation**: SSRF checks for feed URLs arriving in work items
//! - **Text processing**: HTML-to-snippet conversion and char-safe truncation

mod text;
mod url_validator;

pub use text::{first_inline_image, strip_html, truncate_chars};
pub use url_validator::{validate_url, UrlValidationError};

/// Current wall-clock time as unix seconds
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
