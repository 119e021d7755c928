//! Error types for the deal underwriting engine

use thiserror::Error;

/// Result type alias for underwriting operations
pub type Result<T> = std::result::Result<T, UnderwritingError>;

/// Severity bucket for a summary-vs-line-items discrepancy.
///
/// `High` gaps (over the configured dollar threshold) drive the retry loop;
/// `Medium` gaps are recorded and lower confidence but do not block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Severity {
    Medium,
    High,
}

#[derive(Error, Debug)]
pub enum UnderwritingError {

    // =============================
    // Retryable Pipeline Errors
    // =============================
    // These feed the retry budget and are recorded on the deal's audit
    // trail; they never abort the pipeline on their own.

    #[error("Extraction timed out after {0}s")]
    ExtractionTimeout(u64),

    #[error("Extraction response could not be parsed: {0}")]
    ExtractionParseError(String),

    #[error("Verification mismatch in {category}: claimed vs computed differ by ${gap:.2} ({severity:?})")]
    VerificationMismatch {
        category: String,
        gap: f64,
        severity: Severity,
    },

    #[error("Extraction service unavailable: {0}")]
    ServiceUnavailable(String),

    // =============================
    // Non-Error Outcomes
    // =============================

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Rule conflict on '{signature}': kept rule {kept}, skipped rule {skipped}")]
    RuleConflict {
        signature: String,
        kept: uuid::Uuid,
        skipped: uuid::Uuid,
    },

    // =============================
    // Fatal Errors
    // =============================

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    // =============================
    // Infrastructure Errors
    // =============================

    #[error("Advisor error: {0}")]
    AdvisorError(String),

    #[error("Registry error: {0}")]
    RegistryError(String),

    #[error("State persistence error: {0}")]
    StateError(String),

    #[error("Audit error: {0}")]
    AuditError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("UUID parse error: {0}")]
    UuidError(#[from] uuid::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl UnderwritingError {
    /// Whether this error consumes retry budget instead of failing the deal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UnderwritingError::ExtractionTimeout(_)
                | UnderwritingError::ExtractionParseError(_)
                | UnderwritingError::VerificationMismatch { .. }
                | UnderwritingError::ServiceUnavailable(_)
        )
    }
}
