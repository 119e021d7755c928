//! Pattern memory
//!
//! Cross-deal store for learned classification rules and correction
//! examples. Rules generalize human corrections into reusable overrides;
//! training examples are the raw (original, corrected) pairs consumed as
//! few-shot context by the advisor. Postgres-backed when a database URL is
//! configured, otherwise in-process.

use crate::error::UnderwritingError;
use crate::models::{GoldStandardRule, TrainingExample};
use crate::Result;
use chrono::Utc;
use sqlx::{PgPool, Row};
use std::collections::HashSet;
use std::env;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

/// Rules below this confidence are dormant: kept for audit, never applied.
pub const CONFIDENCE_FLOOR: f64 = 0.2;

const SUCCESS_INCREMENT: f64 = 0.05;
const FAILURE_FACTOR: f64 = 0.8;

struct InMemoryState {
    rules: Vec<GoldStandardRule>,
    examples: Vec<TrainingExample>,
    /// (rule_id, subject_id) pairs already counted, for idempotent feedback.
    applications: HashSet<(Uuid, Uuid)>,
}

enum MemoryBackend {
    InMemory {
        state: Arc<RwLock<InMemoryState>>,
    },
    Postgres {
        pool: PgPool,
        schema_ready: Arc<OnceCell<()>>,
    },
}

pub struct PatternMemory {
    backend: MemoryBackend,
}

impl PatternMemory {
    pub fn in_memory() -> Self {
        Self {
            backend: MemoryBackend::InMemory {
                state: Arc::new(RwLock::new(InMemoryState {
                    rules: Vec::new(),
                    examples: Vec::new(),
                    applications: HashSet::new(),
                })),
            },
        }
    }

    /// Use Postgres when `POSTGRES_URL`/`DATABASE_URL` is set, otherwise
    /// fall back to the in-process store.
    pub fn from_env() -> Self {
        let database_url = env::var("POSTGRES_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok();

        if let Some(url) = database_url {
            match sqlx::postgres::PgPoolOptions::new()
                .max_connections(5)
                .connect_lazy(&url)
            {
                Ok(pool) => {
                    info!("Pattern memory backend: postgres");
                    return Self {
                        backend: MemoryBackend::Postgres {
                            pool,
                            schema_ready: Arc::new(OnceCell::new()),
                        },
                    };
                }
                Err(error) => {
                    warn!(
                        "Failed to initialize postgres pattern memory, falling back to in-memory: {}",
                        error
                    );
                }
            }
        }

        info!("Pattern memory backend: in-memory");
        Self::in_memory()
    }

    async fn ensure_schema_if_needed(&self) -> Result<()> {
        let MemoryBackend::Postgres { pool, schema_ready } = &self.backend else {
            return Ok(());
        };

        schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS gold_standard_rules (
                      id UUID PRIMARY KEY,
                      pattern TEXT NOT NULL,
                      rule_type TEXT NOT NULL,
                      original_classification TEXT,
                      correct_classification TEXT NOT NULL,
                      confidence DOUBLE PRECISION NOT NULL,
                      times_applied BIGINT NOT NULL DEFAULT 0,
                      success_count BIGINT NOT NULL DEFAULT 0,
                      failure_count BIGINT NOT NULL DEFAULT 0,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                      updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS training_examples (
                      id UUID PRIMARY KEY,
                      field TEXT NOT NULL,
                      original_value TEXT NOT NULL,
                      corrected_value TEXT NOT NULL,
                      deal_id UUID,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS rule_applications (
                      rule_id UUID NOT NULL,
                      subject_id UUID NOT NULL,
                      success BOOLEAN NOT NULL,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                      PRIMARY KEY (rule_id, subject_id)
                    );
                    "#,
                )
                .execute(pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                UnderwritingError::StateError(format!(
                    "Failed to initialize pattern memory schema: {}",
                    e
                ))
            })?;

        Ok(())
    }

    //
    // ================= Rules =================
    //

    pub async fn add_rule(
        &self,
        pattern: &str,
        rule_type: &str,
        original_classification: Option<&str>,
        correct_classification: &str,
        confidence: f64,
    ) -> Result<GoldStandardRule> {
        let now = Utc::now();
        let rule = GoldStandardRule {
            id: Uuid::new_v4(),
            pattern: pattern.to_uppercase(),
            rule_type: rule_type.to_string(),
            original_classification: original_classification.map(str::to_string),
            correct_classification: correct_classification.to_string(),
            confidence: confidence.clamp(0.0, 1.0),
            times_applied: 0,
            success_count: 0,
            failure_count: 0,
            created_at: now,
            updated_at: now,
        };

        match &self.backend {
            MemoryBackend::InMemory { state } => {
                state.write().await.rules.push(rule.clone());
                Ok(rule)
            }
            MemoryBackend::Postgres { pool, .. } => {
                self.ensure_schema_if_needed().await?;
                sqlx::query(
                    r#"
                    INSERT INTO gold_standard_rules
                      (id, pattern, rule_type, original_classification, correct_classification,
                       confidence, times_applied, success_count, failure_count, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, 0, 0, 0, $7, $7)
                    "#,
                )
                .bind(rule.id)
                .bind(&rule.pattern)
                .bind(&rule.rule_type)
                .bind(&rule.original_classification)
                .bind(&rule.correct_classification)
                .bind(rule.confidence)
                .bind(rule.created_at)
                .execute(pool)
                .await
                .map_err(|e| {
                    UnderwritingError::StateError(format!("Failed to store rule: {}", e))
                })?;
                Ok(rule)
            }
        }
    }

    /// Active rules whose pattern appears in the given merchant signature,
    /// dormant rules excluded.
    pub async fn rules_for(&self, signature: &str) -> Result<Vec<GoldStandardRule>> {
        let upper = signature.to_uppercase();
        let all = self.all_rules().await?;
        Ok(all
            .into_iter()
            .filter(|r| r.confidence >= CONFIDENCE_FLOOR && upper.contains(&r.pattern))
            .collect())
    }

    /// Highest-confidence applicable rule. When applicable rules disagree
    /// on the target classification the conflict is logged and the
    /// higher-confidence rule wins.
    pub async fn best_rule(&self, signature: &str) -> Result<Option<GoldStandardRule>> {
        let mut rules = self.rules_for(signature).await?;
        if rules.is_empty() {
            return Ok(None);
        }

        rules.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.times_applied.cmp(&a.times_applied))
                .then_with(|| a.created_at.cmp(&b.created_at))
        });

        let best = rules[0].clone();
        for other in &rules[1..] {
            if other.correct_classification != best.correct_classification {
                warn!(
                    "{}",
                    UnderwritingError::RuleConflict {
                        signature: signature.to_string(),
                        kept: best.id,
                        skipped: other.id,
                    }
                );
            }
        }

        Ok(Some(best))
    }

    /// Record one application outcome for a rule against a subject.
    /// Idempotent: repeated calls for the same (rule, subject) pair change
    /// nothing after the first.
    pub async fn record_application(
        &self,
        rule_id: Uuid,
        subject_id: Uuid,
        success: bool,
    ) -> Result<()> {
        match &self.backend {
            MemoryBackend::InMemory { state } => {
                let mut locked = state.write().await;
                if !locked.applications.insert((rule_id, subject_id)) {
                    return Ok(());
                }
                if let Some(rule) = locked.rules.iter_mut().find(|r| r.id == rule_id) {
                    apply_feedback(rule, success);
                }
                Ok(())
            }
            MemoryBackend::Postgres { pool, .. } => {
                self.ensure_schema_if_needed().await?;
                let inserted = sqlx::query(
                    r#"
                    INSERT INTO rule_applications (rule_id, subject_id, success)
                    VALUES ($1, $2, $3)
                    ON CONFLICT (rule_id, subject_id) DO NOTHING
                    "#,
                )
                .bind(rule_id)
                .bind(subject_id)
                .bind(success)
                .execute(pool)
                .await
                .map_err(|e| {
                    UnderwritingError::StateError(format!(
                        "Failed to record rule application: {}",
                        e
                    ))
                })?;

                if inserted.rows_affected() == 0 {
                    return Ok(());
                }

                let update = if success {
                    r#"
                    UPDATE gold_standard_rules SET
                      confidence = LEAST(confidence + $2, 1.0),
                      times_applied = times_applied + 1,
                      success_count = success_count + 1,
                      updated_at = NOW()
                    WHERE id = $1
                    "#
                } else {
                    r#"
                    UPDATE gold_standard_rules SET
                      confidence = GREATEST(confidence * $2, 0.2),
                      times_applied = times_applied + 1,
                      failure_count = failure_count + 1,
                      updated_at = NOW()
                    WHERE id = $1
                    "#
                };
                let factor = if success { SUCCESS_INCREMENT } else { FAILURE_FACTOR };
                sqlx::query(update)
                    .bind(rule_id)
                    .bind(factor)
                    .execute(pool)
                    .await
                    .map_err(|e| {
                        UnderwritingError::StateError(format!(
                            "Failed to adjust rule confidence: {}",
                            e
                        ))
                    })?;
                Ok(())
            }
        }
    }

    async fn all_rules(&self) -> Result<Vec<GoldStandardRule>> {
        match &self.backend {
            MemoryBackend::InMemory { state } => Ok(state.read().await.rules.clone()),
            MemoryBackend::Postgres { pool, .. } => {
                self.ensure_schema_if_needed().await?;
                let rows = sqlx::query(
                    r#"
                    SELECT id, pattern, rule_type, original_classification,
                           correct_classification, confidence, times_applied,
                           success_count, failure_count, created_at, updated_at
                    FROM gold_standard_rules
                    "#,
                )
                .fetch_all(pool)
                .await
                .map_err(|e| {
                    UnderwritingError::StateError(format!("Failed to load rules: {}", e))
                })?;

                Ok(rows.into_iter().map(rule_from_row).collect())
            }
        }
    }

    //
    // ================= Training Examples =================
    //

    pub async fn add_example(
        &self,
        field: &str,
        original_value: &str,
        corrected_value: &str,
        deal_id: Option<Uuid>,
    ) -> Result<TrainingExample> {
        let example = TrainingExample {
            id: Uuid::new_v4(),
            field: field.to_string(),
            original_value: original_value.to_string(),
            corrected_value: corrected_value.to_string(),
            deal_id,
            created_at: Utc::now(),
        };

        match &self.backend {
            MemoryBackend::InMemory { state } => {
                state.write().await.examples.push(example.clone());
                Ok(example)
            }
            MemoryBackend::Postgres { pool, .. } => {
                self.ensure_schema_if_needed().await?;
                sqlx::query(
                    r#"
                    INSERT INTO training_examples
                      (id, field, original_value, corrected_value, deal_id, created_at)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(example.id)
                .bind(&example.field)
                .bind(&example.original_value)
                .bind(&example.corrected_value)
                .bind(example.deal_id)
                .bind(example.created_at)
                .execute(pool)
                .await
                .map_err(|e| {
                    UnderwritingError::StateError(format!("Failed to store example: {}", e))
                })?;
                Ok(example)
            }
        }
    }

    /// Most recent corrections for a field, newest first.
    pub async fn examples_for(&self, field: &str, limit: usize) -> Result<Vec<TrainingExample>> {
        match &self.backend {
            MemoryBackend::InMemory { state } => {
                let locked = state.read().await;
                let mut matching: Vec<TrainingExample> = locked
                    .examples
                    .iter()
                    .filter(|e| e.field == field)
                    .cloned()
                    .collect();
                matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                matching.truncate(limit);
                Ok(matching)
            }
            MemoryBackend::Postgres { pool, .. } => {
                self.ensure_schema_if_needed().await?;
                let rows = sqlx::query(
                    r#"
                    SELECT id, field, original_value, corrected_value, deal_id, created_at
                    FROM training_examples
                    WHERE field = $1
                    ORDER BY created_at DESC
                    LIMIT $2
                    "#,
                )
                .bind(field)
                .bind(limit as i64)
                .fetch_all(pool)
                .await
                .map_err(|e| {
                    UnderwritingError::StateError(format!("Failed to load examples: {}", e))
                })?;

                Ok(rows
                    .into_iter()
                    .map(|row| TrainingExample {
                        id: row.try_get("id").unwrap_or_else(|_| Uuid::new_v4()),
                        field: row.try_get("field").unwrap_or_default(),
                        original_value: row.try_get("original_value").unwrap_or_default(),
                        corrected_value: row.try_get("corrected_value").unwrap_or_default(),
                        deal_id: row.try_get("deal_id").ok().flatten(),
                        created_at: row.try_get("created_at").unwrap_or_else(|_| Utc::now()),
                    })
                    .collect())
            }
        }
    }
}

fn apply_feedback(rule: &mut GoldStandardRule, success: bool) {
    if success {
        rule.confidence = (rule.confidence + SUCCESS_INCREMENT).min(1.0);
        rule.success_count += 1;
    } else {
        rule.confidence = (rule.confidence * FAILURE_FACTOR).max(CONFIDENCE_FLOOR);
        rule.failure_count += 1;
    }
    rule.times_applied += 1;
    rule.updated_at = Utc::now();
}

fn rule_from_row(row: sqlx::postgres::PgRow) -> GoldStandardRule {
    let times_applied: i64 = row.try_get("times_applied").unwrap_or(0);
    let success_count: i64 = row.try_get("success_count").unwrap_or(0);
    let failure_count: i64 = row.try_get("failure_count").unwrap_or(0);

    GoldStandardRule {
        id: row.try_get("id").unwrap_or_else(|_| Uuid::new_v4()),
        pattern: row.try_get("pattern").unwrap_or_default(),
        rule_type: row.try_get("rule_type").unwrap_or_default(),
        original_classification: row.try_get("original_classification").ok().flatten(),
        correct_classification: row.try_get("correct_classification").unwrap_or_default(),
        confidence: row.try_get("confidence").unwrap_or(0.0),
        times_applied: times_applied.max(0) as u64,
        success_count: success_count.max(0) as u64,
        failure_count: failure_count.max(0) as u64,
        created_at: row.try_get("created_at").unwrap_or_else(|_| Utc::now()),
        updated_at: row.try_get("updated_at").unwrap_or_else(|_| Utc::now()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rules_match_by_pattern_containment() {
        let memory = PatternMemory::in_memory();
        memory
            .add_rule("XYZ CAPITAL", "position_classification", None, "Not MCA", 1.0)
            .await
            .unwrap();

        let hits = memory.rules_for("XYZ CAPITAL FUNDING").await.unwrap();
        assert_eq!(hits.len(), 1);

        let misses = memory.rules_for("ABC HOLDINGS").await.unwrap();
        assert!(misses.is_empty());
    }

    #[tokio::test]
    async fn dormant_rules_are_never_applied() {
        let memory = PatternMemory::in_memory();
        memory
            .add_rule("XYZ CAPITAL", "position_classification", None, "Not MCA", 0.1)
            .await
            .unwrap();

        assert!(memory.best_rule("XYZ CAPITAL FUNDING").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn conflicting_rules_resolve_to_higher_confidence() {
        let memory = PatternMemory::in_memory();
        memory
            .add_rule("XYZ", "position_classification", None, "MCA", 0.6)
            .await
            .unwrap();
        memory
            .add_rule("XYZ CAPITAL", "position_classification", None, "Not MCA", 0.9)
            .await
            .unwrap();

        let best = memory
            .best_rule("XYZ CAPITAL FUNDING")
            .await
            .unwrap()
            .expect("rule expected");
        assert_eq!(best.correct_classification, "Not MCA");
    }

    #[tokio::test]
    async fn feedback_adjusts_confidence_within_bounds() {
        let memory = PatternMemory::in_memory();
        let rule = memory
            .add_rule("ACME", "position_classification", None, "MCA", 0.98)
            .await
            .unwrap();

        // Success saturates at 1.0.
        memory
            .record_application(rule.id, Uuid::new_v4(), true)
            .await
            .unwrap();
        let after = memory.best_rule("ACME FUNDING").await.unwrap().unwrap();
        assert_eq!(after.confidence, 1.0);
        assert_eq!(after.success_count, 1);

        // Failures decay multiplicatively but hold the floor.
        for _ in 0..20 {
            memory
                .record_application(rule.id, Uuid::new_v4(), false)
                .await
                .unwrap();
        }
        let decayed = memory.rules_for("ACME FUNDING").await.unwrap();
        assert_eq!(decayed.len(), 1);
        assert!((decayed[0].confidence - CONFIDENCE_FLOOR).abs() < 1e-9);
    }

    #[tokio::test]
    async fn repeated_feedback_for_one_subject_counts_once() {
        let memory = PatternMemory::in_memory();
        let rule = memory
            .add_rule("ACME", "position_classification", None, "MCA", 0.5)
            .await
            .unwrap();
        let subject = Uuid::new_v4();

        memory.record_application(rule.id, subject, true).await.unwrap();
        memory.record_application(rule.id, subject, true).await.unwrap();

        let stored = memory.best_rule("ACME FUNDING").await.unwrap().unwrap();
        assert!((stored.confidence - 0.55).abs() < 1e-9);
        assert_eq!(stored.times_applied, 1);
    }

    #[tokio::test]
    async fn examples_return_newest_first_with_limit() {
        let memory = PatternMemory::in_memory();
        for i in 0..5 {
            memory
                .add_example("total_deposits", &format!("{}", i), &format!("{}", i + 1), None)
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let examples = memory.examples_for("total_deposits", 3).await.unwrap();
        assert_eq!(examples.len(), 3);
        assert_eq!(examples[0].original_value, "4");

        assert!(memory.examples_for("other_field", 3).await.unwrap().is_empty());
    }
}
