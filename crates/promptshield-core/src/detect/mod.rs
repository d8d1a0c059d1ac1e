use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod engine;
pub mod homoglyph;
pub mod injection;
pub mod invisible;
pub mod location;
pub mod normalization;
pub mod smuggling;
pub mod trojan;

pub use location::{LineIndex, ScanContext};

/// Ordinal threat severity. The derived `Ord` gives `Low < Medium < High <
/// Critical`, which every severity-floor comparison relies on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

/// Threat classification buckets emitted by the detectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThreatCategory {
    #[serde(rename = "INVISIBLE_CHAR")]
    Invisible,
    #[serde(rename = "HOMOGLYPH")]
    Homoglyph,
    #[serde(rename = "SMUGGLING")]
    Smuggling,
    #[serde(rename = "PROMPT_INJECTION")]
    Injection,
    #[serde(rename = "TROJAN_SOURCE")]
    Trojan,
    #[serde(rename = "NORMALIZATION")]
    Normalization,
}

/// Static metadata attached to each category: the rule-id namespace, the
/// severity a rule defaults to, and the documentation link surfaced in
/// reports.
#[derive(Debug, Clone, Copy)]
pub struct CategoryInfo {
    pub prefix: &'static str,
    pub default_severity: Severity,
    pub reference_url: &'static str,
}

const INVISIBLE_INFO: CategoryInfo = CategoryInfo {
    prefix: "PSU",
    default_severity: Severity::High,
    reference_url: "https://www.unicode.org/reports/tr36/",
};
const HOMOGLYPH_INFO: CategoryInfo = CategoryInfo {
    prefix: "PSH",
    default_severity: Severity::Critical,
    reference_url: "https://www.unicode.org/reports/tr39/",
};
const SMUGGLING_INFO: CategoryInfo = CategoryInfo {
    prefix: "PSS",
    default_severity: Severity::Medium,
    reference_url: "https://owasp.org/www-project-top-10-for-large-language-model-applications/",
};
const INJECTION_INFO: CategoryInfo = CategoryInfo {
    prefix: "PSI",
    default_severity: Severity::High,
    reference_url: "https://owasp.org/www-project-top-10-for-large-language-model-applications/",
};
const TROJAN_INFO: CategoryInfo = CategoryInfo {
    prefix: "PST",
    default_severity: Severity::Critical,
    reference_url: "https://trojansource.codes/",
};
const NORMALIZATION_INFO: CategoryInfo = CategoryInfo {
    prefix: "PSN",
    default_severity: Severity::High,
    reference_url: "https://www.unicode.org/reports/tr15/",
};

impl ThreatCategory {
    pub fn info(self) -> &'static CategoryInfo {
        match self {
            Self::Invisible => &INVISIBLE_INFO,
            Self::Homoglyph => &HOMOGLYPH_INFO,
            Self::Smuggling => &SMUGGLING_INFO,
            Self::Injection => &INJECTION_INFO,
            Self::Trojan => &TROJAN_INFO,
            Self::Normalization => &NORMALIZATION_INFO,
        }
    }

    /// Namespaced rule id, e.g. `PST001`.
    pub fn rule_id(self, number: u16) -> String {
        format!("{}{:03}", self.info().prefix, number)
    }
}

/// Position of a threat within the scanned text. `line` and `column` are
/// 1-based; `index` is the 0-based char offset into the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub line: usize,
    pub column: usize,
    pub index: usize,
}

/// A single finding produced by one detector. Immutable after creation:
/// consumers may reorder or group reports but never rewrite their fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreatReport {
    pub category: ThreatCategory,
    pub severity: Severity,
    pub message: String,
    pub location: Location,
    /// The exact matched substring of the input.
    pub offending_text: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub readable_label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub decoded_payload: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub suggestion: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub rule_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reference_url: Option<String>,
}

impl ThreatReport {
    /// Construct a report for rule `number` in `category`, filling the rule
    /// id and reference URL from the category metadata table.
    pub fn new(
        category: ThreatCategory,
        number: u16,
        severity: Severity,
        message: impl Into<String>,
        location: Location,
        offending_text: impl Into<String>,
    ) -> Self {
        Self {
            category,
            severity,
            message: message.into(),
            location,
            offending_text: offending_text.into(),
            readable_label: None,
            decoded_payload: None,
            suggestion: None,
            rule_id: Some(category.rule_id(number)),
            reference_url: Some(category.info().reference_url.to_string()),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.readable_label = Some(label.into());
        self
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.decoded_payload = Some(payload.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Validate location and span invariants.
    pub fn validate(&self) -> Result<(), ThreatValidationError> {
        if self.location.line == 0 || self.location.column == 0 {
            return Err(ThreatValidationError::InvalidLocation {
                line: self.location.line,
                column: self.location.column,
            });
        }
        if self.offending_text.is_empty() {
            return Err(ThreatValidationError::EmptyOffendingText {
                rule_id: self.rule_id.clone().unwrap_or_default(),
            });
        }
        Ok(())
    }
}

/// Validation errors for reports emitted by the detectors.
#[derive(Debug, Error, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ThreatValidationError {
    #[error("location must be 1-based (got line {line}, column {column})")]
    InvalidLocation { line: usize, column: usize },
    #[error("report for rule `{rule_id}` has an empty offending span")]
    EmptyOffendingText { rule_id: String },
}

/// Per-call scan configuration.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Halt after the first detector that yields at least one threat.
    pub stop_on_first_threat: bool,
    /// Severity floor; threats below it are never reported.
    pub min_severity: Severity,
    pub detect_trojan: bool,
    pub detect_invisible: bool,
    pub detect_homoglyph: bool,
    pub detect_normalization: bool,
    pub detect_smuggling: bool,
    pub detect_injection: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            stop_on_first_threat: false,
            min_severity: Severity::Low,
            detect_trojan: true,
            detect_invisible: true,
            detect_homoglyph: true,
            detect_normalization: true,
            detect_smuggling: true,
            detect_injection: true,
        }
    }
}

/// Timing and size counters for one scan call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanStats {
    pub duration_ms: u64,
    pub total_chars: usize,
}

/// Aggregated output of the detector pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    pub threats: Vec<ThreatReport>,
    pub stats: ScanStats,
    pub is_clean: bool,
}
