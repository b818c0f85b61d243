//! Posted configuration errors
//!
//! Non-fatal problems found while fetching or compiling are posted here against
//! the rkey of the resource that caused them, and surface in the overview.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Key errors are filed under when no resource is responsible
pub const GLOBAL_ERROR_KEY: &str = "-global-";

/// A single posted error
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PostedError {
    /// First line of the text
    pub summary: String,
    pub text: String,
}

impl PostedError {
    fn new(text: String) -> Self {
        let summary = text.lines().next().unwrap_or_default().to_string();
        Self { summary, text }
    }
}

/// Errors and notices accumulated during one fetch/compile cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ErrorLog {
    errors: BTreeMap<String, Vec<PostedError>>,
    notices: BTreeMap<String, Vec<String>>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Post an error against `rkey`, or the global key when there is none.
    ///
    /// Exact duplicates for the same key are dropped.
    pub fn post_error(&mut self, rkey: Option<&str>, text: impl Into<String>) {
        let key = rkey.unwrap_or(GLOBAL_ERROR_KEY);
        let text = text.into();

        let errors = self.errors.entry(key.to_string()).or_default();
        if errors.iter().any(|e| e.text == text) {
            return;
        }

        tracing::info!("{}: {}", key, text);
        errors.push(PostedError::new(text));
    }

    /// Post an informational notice; deduplicated like errors
    pub fn post_notice(&mut self, rkey: Option<&str>, text: impl Into<String>) {
        let key = rkey.unwrap_or(GLOBAL_ERROR_KEY);
        let text = text.into();

        let notices = self.notices.entry(key.to_string()).or_default();
        if notices.contains(&text) {
            return;
        }

        tracing::info!("{}: NOTICE: {}", key, text);
        notices.push(text);
    }

    /// Errors posted against `rkey`
    pub fn errors_for(&self, rkey: &str) -> &[PostedError] {
        self.errors.get(rkey).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn notices_for(&self, rkey: &str) -> &[String] {
        self.notices.get(rkey).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn errors(&self) -> &BTreeMap<String, Vec<PostedError>> {
        &self.errors
    }

    pub fn notices(&self) -> &BTreeMap<String, Vec<String>> {
        &self.notices
    }

    /// Total number of posted errors across all keys
    pub fn error_count(&self) -> usize {
        self.errors.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.error_count() == 0
    }

    /// Fold another log into this one, keeping deduplication
    pub fn absorb(&mut self, other: &ErrorLog) {
        for (key, errors) in &other.errors {
            for error in errors {
                self.post_error(Some(key), error.text.clone());
            }
        }
        for (key, notices) in &other.notices {
            for notice in notices {
                self.post_notice(Some(key), notice.clone());
            }
        }
    }

    /// Errors as a JSON map of rkey to `[{summary, text}]`
    pub fn errors_value(&self) -> Value {
        serde_json::to_value(&self.errors).unwrap_or(Value::Null)
    }
}
