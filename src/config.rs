//! Engine settings
//!
//! Loaded once at startup from environment variables (with `.env` support in
//! the binaries) into a typed struct. Validation failures are fatal and abort
//! before any extraction call.

use crate::error::UnderwritingError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Tunable thresholds for the analysis and verification pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Additional extraction attempts permitted after the first.
    pub max_retry_attempts: u32,
    /// Transfer pairing window, in days either side of the debit date.
    pub transfer_window_days: i64,
    /// Require transfer amounts to match to the cent.
    pub transfer_exact_amount: bool,
    /// Amount tolerance band for recurring clusters and MCA validation.
    pub amount_tolerance_pct: f64,
    /// Occurrences required before a cluster counts as recurring.
    pub min_pattern_occurrences: usize,
    /// Vendor match acceptance threshold on the 0-100 similarity scale.
    pub vendor_match_threshold: u8,
    /// Relative tolerance when comparing claimed summary totals to line sums.
    pub summary_tolerance_pct: f64,
    /// Absolute tolerance floor for the same comparison, in dollars.
    pub summary_tolerance_abs: f64,
    /// Dollar gap above which a discrepancy is high severity.
    pub high_severity_threshold: f64,
    /// Seconds between extraction polls.
    pub extraction_poll_interval_secs: u64,
    /// Polling ceiling; expiry is a retryable timeout.
    pub extraction_poll_ceiling_secs: u64,
    /// Base delay before resubmitting after a transport failure; grows
    /// linearly with the attempt number.
    pub retry_backoff_secs: u64,
    /// Underwriting floor for annualized income.
    pub min_annual_income: f64,
    /// Underwriting floor for average monthly revenue.
    pub min_monthly_revenue: f64,
    /// NSF occurrences tolerated before a warning.
    pub max_nsf_count: u32,
    /// Monthly diesel/fuel spend that flags a fuel-heavy operation.
    pub diesel_monthly_threshold: f64,
    /// Assumed holdback percentage for new-advance sizing.
    pub holdback_pct: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_retry_attempts: 2,
            transfer_window_days: 2,
            transfer_exact_amount: true,
            amount_tolerance_pct: 0.15,
            min_pattern_occurrences: 4,
            vendor_match_threshold: 80,
            summary_tolerance_pct: 0.01,
            summary_tolerance_abs: 1.00,
            high_severity_threshold: 100.0,
            extraction_poll_interval_secs: 5,
            extraction_poll_ceiling_secs: 120,
            retry_backoff_secs: 5,
            min_annual_income: 100_000.0,
            min_monthly_revenue: 20_000.0,
            max_nsf_count: 3,
            diesel_monthly_threshold: 5_000.0,
            holdback_pct: 10.0,
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse::<T>().map_err(|_| {
            UnderwritingError::ConfigurationError(format!("{} has invalid value '{}'", key, raw))
        }),
        Err(_) => Ok(default),
    }
}

impl Settings {
    /// Build settings from the environment, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let settings = Self {
            max_retry_attempts: env_parse("MAX_RETRY_ATTEMPTS", defaults.max_retry_attempts)?,
            transfer_window_days: env_parse(
                "TRANSFER_WINDOW_DAYS",
                defaults.transfer_window_days,
            )?,
            transfer_exact_amount: env_parse(
                "TRANSFER_EXACT_AMOUNT",
                defaults.transfer_exact_amount,
            )?,
            amount_tolerance_pct: env_parse(
                "AMOUNT_TOLERANCE_PCT",
                defaults.amount_tolerance_pct,
            )?,
            min_pattern_occurrences: env_parse(
                "MIN_PATTERN_OCCURRENCES",
                defaults.min_pattern_occurrences,
            )?,
            vendor_match_threshold: env_parse(
                "VENDOR_MATCH_THRESHOLD",
                defaults.vendor_match_threshold,
            )?,
            summary_tolerance_pct: env_parse(
                "SUMMARY_TOLERANCE_PCT",
                defaults.summary_tolerance_pct,
            )?,
            summary_tolerance_abs: env_parse(
                "SUMMARY_TOLERANCE_ABS",
                defaults.summary_tolerance_abs,
            )?,
            high_severity_threshold: env_parse(
                "HIGH_SEVERITY_THRESHOLD",
                defaults.high_severity_threshold,
            )?,
            extraction_poll_interval_secs: env_parse(
                "EXTRACTION_POLL_INTERVAL_SECS",
                defaults.extraction_poll_interval_secs,
            )?,
            extraction_poll_ceiling_secs: env_parse(
                "EXTRACTION_POLL_CEILING_SECS",
                defaults.extraction_poll_ceiling_secs,
            )?,
            retry_backoff_secs: env_parse("RETRY_BACKOFF_SECS", defaults.retry_backoff_secs)?,
            min_annual_income: env_parse("MIN_ANNUAL_INCOME", defaults.min_annual_income)?,
            min_monthly_revenue: env_parse("MIN_MONTHLY_REVENUE", defaults.min_monthly_revenue)?,
            max_nsf_count: env_parse("MAX_NSF_COUNT", defaults.max_nsf_count)?,
            diesel_monthly_threshold: env_parse(
                "DIESEL_MONTHLY_THRESHOLD",
                defaults.diesel_monthly_threshold,
            )?,
            holdback_pct: env_parse("HOLDBACK_PCT", defaults.holdback_pct)?,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Reject settings the pipeline cannot run under.
    pub fn validate(&self) -> Result<()> {
        if self.transfer_window_days < 0 {
            return Err(UnderwritingError::ConfigurationError(
                "TRANSFER_WINDOW_DAYS must be >= 0".into(),
            ));
        }
        if !(self.amount_tolerance_pct > 0.0 && self.amount_tolerance_pct < 1.0) {
            return Err(UnderwritingError::ConfigurationError(
                "AMOUNT_TOLERANCE_PCT must be in (0, 1)".into(),
            ));
        }
        if !(self.summary_tolerance_pct > 0.0 && self.summary_tolerance_pct < 1.0) {
            return Err(UnderwritingError::ConfigurationError(
                "SUMMARY_TOLERANCE_PCT must be in (0, 1)".into(),
            ));
        }
        if self.summary_tolerance_abs < 0.0 {
            return Err(UnderwritingError::ConfigurationError(
                "SUMMARY_TOLERANCE_ABS must be >= 0".into(),
            ));
        }
        if self.high_severity_threshold <= 0.0 {
            return Err(UnderwritingError::ConfigurationError(
                "HIGH_SEVERITY_THRESHOLD must be > 0".into(),
            ));
        }
        if self.min_pattern_occurrences == 0 {
            return Err(UnderwritingError::ConfigurationError(
                "MIN_PATTERN_OCCURRENCES must be >= 1".into(),
            ));
        }
        if self.vendor_match_threshold > 100 {
            return Err(UnderwritingError::ConfigurationError(
                "VENDOR_MATCH_THRESHOLD must be <= 100".into(),
            ));
        }
        if self.extraction_poll_interval_secs == 0 {
            return Err(UnderwritingError::ConfigurationError(
                "EXTRACTION_POLL_INTERVAL_SECS must be >= 1".into(),
            ));
        }
        if self.extraction_poll_ceiling_secs < self.extraction_poll_interval_secs {
            return Err(UnderwritingError::ConfigurationError(
                "EXTRACTION_POLL_CEILING_SECS must be >= the poll interval".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.holdback_pct) {
            return Err(UnderwritingError::ConfigurationError(
                "HOLDBACK_PCT must be in [0, 100]".into(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.extraction_poll_interval_secs)
    }

    pub fn poll_ceiling(&self) -> Duration {
        Duration::from_secs(self.extraction_poll_ceiling_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }
}
