use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

static ERROR_MARKERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:bugs?|security|critical)\b").expect("valid error marker regex")
});

static INFO_MARKERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:consider|minor|style)\b").expect("valid info marker regex")
});

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    #[default]
    Warning,
    Error,
}

impl Severity {
    /// Keyword-based guess. Error markers win over info markers.
    pub fn infer(text: &str) -> Self {
        if ERROR_MARKERS.is_match(text) {
            Severity::Error
        } else if INFO_MARKERS.is_match(text) {
            Severity::Info
        } else {
            Severity::Warning
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        f.write_str(s)
    }
}

/// A single problem a reviewer raised against a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub file_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub description: String,
    /// Follow-up lines the reviewer wrote under the issue. Not fingerprinted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub severity: Severity,
    /// Heading the issue was listed under, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    pub fingerprint: String,
}

impl Issue {
    /// Builds an issue with an inferred severity and a computed fingerprint.
    /// A line of 0 is treated as absent.
    pub fn new(file_path: impl Into<String>, line: Option<u32>, description: impl Into<String>) -> Self {
        let file_path = file_path.into();
        let description = description.into();
        let line = line.filter(|&n| n > 0);
        Self {
            fingerprint: fingerprint(&file_path, line, &description),
            severity: Severity::infer(&description),
            file_path,
            line,
            description,
            details: None,
            section: None,
        }
    }

    pub fn with_section(mut self, section: impl Into<String>) -> Self {
        self.section = Some(section.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn location(&self) -> String {
        match self.line {
            Some(line) => format!("{}:{line}", self.file_path),
            None => self.file_path.clone(),
        }
    }
}

/// Lowercases, drops everything that is not a letter, and collapses whitespace.
pub fn canonicalize_description(description: &str) -> String {
    let mapped: String = description
        .chars()
        .map(|c| if c.is_alphabetic() { c } else { ' ' })
        .collect::<String>()
        .to_lowercase();
    mapped.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn line_bucket(line: Option<u32>) -> String {
    match line {
        Some(n) => format!("L{n}"),
        None => "file-level".to_string(),
    }
}

/// Stable identity of an issue: sha256 over path, line bucket and canonical
/// description, truncated to 16 hex chars.
pub fn fingerprint(file_path: &str, line: Option<u32>, description: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(file_path.as_bytes());
    hasher.update(b"\0");
    hasher.update(line_bucket(line).as_bytes());
    hasher.update(b"\0");
    hasher.update(canonicalize_description(description).as_bytes());
    let hex = format!("{:x}", hasher.finalize());
    hex[..16].to_string()
}
