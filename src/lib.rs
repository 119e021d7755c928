//! Deal Underwriting Engine
//!
//! A bank-statement underwriting service for merchant cash advance deals:
//! - Extracts statements through an external OCR vendor, then audits the
//!   arithmetic before trusting a single number
//! - Retries extraction with targeted corrections, under a bounded budget
//! - Excludes internal transfers from revenue and clusters recurring debits
//! - Classifies existing advance positions through layered, auditable rules
//! - Learns from human corrections without ever self-approving a deal
//!
//! DEAL LOOP:
//! SUBMIT → EXTRACT → VERIFY → RETRY? → ANALYZE → PENDING APPROVAL

pub mod advisor;
pub mod analysis;
pub mod api;
pub mod audit;
pub mod classifier;
pub mod config;
pub mod engine;
pub mod error;
pub mod extraction;
pub mod memory;
pub mod models;
pub mod normalize;
pub mod patterns;
pub mod state;
pub mod transfers;
pub mod vendors;
pub mod verification;

pub use error::Result;

// Re-export common types
pub use config::Settings;
pub use engine::UnderwritingEngine;
pub use models::*;
