//! Add-Bookmark Form
//!
//! Validation and URL normalization for the add form.

use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// Shown when the store rejects an insert; the underlying detail is logged only
pub const INSERT_FAILED: &str = "Failed to add bookmark. Try again.";

/// Why a submission was refused before reaching the store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Both URL and title are required.")]
    MissingField,
}

/// A submission that passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidBookmark {
    pub title: String,
    pub url: String,
}

/// Current contents of the add form
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddForm {
    pub title: String,
    pub url: String,
}

impl AddForm {
    pub fn new(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
        }
    }

    pub fn validate(&self) -> Result<ValidBookmark, ValidationError> {
        validate(&self.title, &self.url)
    }

    pub fn clear(&mut self) {
        self.title.clear();
        self.url.clear();
    }
}

fn has_web_scheme(url: &str) -> bool {
    static SCHEME: OnceLock<Option<Regex>> = OnceLock::new();
    SCHEME
        .get_or_init(|| Regex::new(r"(?i)^https?://").ok())
        .as_ref()
        .map_or(false, |re| re.is_match(url))
}

/// Prefix `https://` unless the URL already names http or https
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    if has_web_scheme(url) {
        url.to_string()
    } else {
        format!("https://{}", url)
    }
}

/// Both fields must be non-blank; the URL comes back normalized
pub fn validate(title: &str, url: &str) -> Result<ValidBookmark, ValidationError> {
    let title = title.trim();
    let url = url.trim();
    if title.is_empty() || url.is_empty() {
        return Err(ValidationError::MissingField);
    }
    Ok(ValidBookmark {
        title: title.to_string(),
        url: normalize_url(url),
    })
}
