//! Vendor registry
//!
//! Shared, learning store of known payees. Every deal reads from it when
//! categorizing transactions, and human labeling writes through a single
//! path so concurrent deals always see a consistent view. Backed by
//! Postgres when a database URL is configured, otherwise an in-process map.

use crate::classifier::{MCA_LENDERS, NON_MCA_PAYEES};
use crate::config::Settings;
use crate::error::UnderwritingError;
use crate::models::{Frequency, KnownVendor, MatchKind};
use crate::normalize::{merchant_key, similarity};
use crate::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

/// A registry hit for one transaction description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorMatch {
    pub vendor: KnownVendor,
    pub score: u8,
    pub kind: MatchKind,
}

enum RegistryBackend {
    InMemory {
        vendors: Arc<RwLock<HashMap<String, KnownVendor>>>,
    },
    Postgres {
        pool: PgPool,
        schema_ready: Arc<OnceCell<()>>,
    },
}

pub struct VendorRegistry {
    backend: RegistryBackend,
    threshold: u8,
}

impl VendorRegistry {
    pub fn in_memory(settings: &Settings) -> Self {
        Self {
            backend: RegistryBackend::InMemory {
                vendors: Arc::new(RwLock::new(HashMap::new())),
            },
            threshold: settings.vendor_match_threshold,
        }
    }

    /// Use Postgres when `POSTGRES_URL`/`DATABASE_URL` is set, otherwise
    /// fall back to the in-process map.
    pub fn from_env(settings: &Settings) -> Self {
        let database_url = env::var("POSTGRES_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok();

        if let Some(url) = database_url {
            match sqlx::postgres::PgPoolOptions::new()
                .max_connections(5)
                .connect_lazy(&url)
            {
                Ok(pool) => {
                    info!("Vendor registry backend: postgres");
                    return Self {
                        backend: RegistryBackend::Postgres {
                            pool,
                            schema_ready: Arc::new(OnceCell::new()),
                        },
                        threshold: settings.vendor_match_threshold,
                    };
                }
                Err(error) => {
                    warn!(
                        "Failed to initialize postgres vendor registry, falling back to in-memory: {}",
                        error
                    );
                }
            }
        }

        info!("Vendor registry backend: in-memory");
        Self::in_memory(settings)
    }

    async fn ensure_schema_if_needed(&self) -> Result<()> {
        let RegistryBackend::Postgres { pool, schema_ready } = &self.backend else {
            return Ok(());
        };

        schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS known_vendors (
                      id UUID PRIMARY KEY,
                      name TEXT NOT NULL UNIQUE,
                      category TEXT NOT NULL,
                      match_kind TEXT NOT NULL,
                      is_mca_lender BOOLEAN NOT NULL,
                      default_frequency TEXT,
                      match_count BIGINT NOT NULL DEFAULT 0,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                UnderwritingError::RegistryError(format!(
                    "Failed to initialize vendor registry schema: {}",
                    e
                ))
            })?;

        Ok(())
    }

    /// Seed the registry with the built-in lender whitelist and non-MCA
    /// payee list. Existing entries are left untouched.
    pub async fn seed_defaults(&self) -> Result<()> {
        for (name, frequency) in MCA_LENDERS {
            self.insert_if_absent(name, "MCA Lender", MatchKind::Contains, true, Some(*frequency))
                .await?;
        }
        for (name, category) in NON_MCA_PAYEES {
            self.insert_if_absent(name, category, MatchKind::Contains, false, None)
                .await?;
        }
        Ok(())
    }

    async fn insert_if_absent(
        &self,
        name: &str,
        category: &str,
        match_kind: MatchKind,
        is_mca_lender: bool,
        default_frequency: Option<Frequency>,
    ) -> Result<()> {
        let vendor = KnownVendor {
            id: Uuid::new_v4(),
            name: name.to_string(),
            category: category.to_string(),
            match_kind,
            is_mca_lender,
            default_frequency,
            match_count: 0,
            created_at: Utc::now(),
        };

        match &self.backend {
            RegistryBackend::InMemory { vendors } => {
                let mut locked = vendors.write().await;
                locked.entry(vendor.name.clone()).or_insert(vendor);
                Ok(())
            }
            RegistryBackend::Postgres { pool, .. } => {
                self.ensure_schema_if_needed().await?;
                sqlx::query(
                    r#"
                    INSERT INTO known_vendors
                      (id, name, category, match_kind, is_mca_lender, default_frequency, match_count, created_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    ON CONFLICT (name) DO NOTHING
                    "#,
                )
                .bind(vendor.id)
                .bind(&vendor.name)
                .bind(&vendor.category)
                .bind(kind_to_db(vendor.match_kind))
                .bind(vendor.is_mca_lender)
                .bind(vendor.default_frequency.map(frequency_to_db))
                .bind(vendor.match_count as i64)
                .bind(vendor.created_at)
                .execute(pool)
                .await
                .map_err(|e| {
                    UnderwritingError::RegistryError(format!("Failed to seed vendor: {}", e))
                })?;
                Ok(())
            }
        }
    }

    /// Single write path for human labeling. Upserts by canonical name.
    pub async fn label(
        &self,
        name: &str,
        category: &str,
        is_mca_lender: bool,
        default_frequency: Option<Frequency>,
    ) -> Result<KnownVendor> {
        let canonical = merchant_key(name);
        if canonical.is_empty() {
            return Err(UnderwritingError::RegistryError(format!(
                "vendor name '{}' normalizes to nothing identifying",
                name
            )));
        }

        let vendor = KnownVendor {
            id: Uuid::new_v4(),
            name: canonical.clone(),
            category: category.to_string(),
            match_kind: MatchKind::Contains,
            is_mca_lender,
            default_frequency,
            match_count: 0,
            created_at: Utc::now(),
        };

        match &self.backend {
            RegistryBackend::InMemory { vendors } => {
                let mut locked = vendors.write().await;
                let entry = locked.entry(canonical).or_insert_with(|| vendor.clone());
                entry.category = category.to_string();
                entry.is_mca_lender = is_mca_lender;
                entry.default_frequency = default_frequency;
                Ok(entry.clone())
            }
            RegistryBackend::Postgres { pool, .. } => {
                self.ensure_schema_if_needed().await?;
                sqlx::query(
                    r#"
                    INSERT INTO known_vendors
                      (id, name, category, match_kind, is_mca_lender, default_frequency, match_count, created_at)
                    VALUES ($1, $2, $3, $4, $5, $6, 0, $7)
                    ON CONFLICT (name) DO UPDATE SET
                      category = EXCLUDED.category,
                      is_mca_lender = EXCLUDED.is_mca_lender,
                      default_frequency = EXCLUDED.default_frequency
                    "#,
                )
                .bind(vendor.id)
                .bind(&vendor.name)
                .bind(&vendor.category)
                .bind(kind_to_db(vendor.match_kind))
                .bind(vendor.is_mca_lender)
                .bind(vendor.default_frequency.map(frequency_to_db))
                .bind(vendor.created_at)
                .execute(pool)
                .await
                .map_err(|e| {
                    UnderwritingError::RegistryError(format!("Failed to label vendor: {}", e))
                })?;
                self.find_by_name(&vendor.name).await?.ok_or_else(|| {
                    UnderwritingError::RegistryError("labeled vendor not found after upsert".into())
                })
            }
        }
    }

    /// Best registry match for a raw transaction description, or `None`
    /// when no vendor clears the acceptance threshold. Ties on score go to
    /// the vendor with more prior matches.
    pub async fn match_description(&self, description: &str) -> Result<Option<VendorMatch>> {
        let key = merchant_key(description);
        if key.is_empty() {
            return Ok(None);
        }

        let vendors = self.all().await?;
        let mut best: Option<VendorMatch> = None;

        for vendor in vendors {
            let (score, kind) = similarity(&key, &vendor.name);
            if score < self.threshold {
                continue;
            }
            let better = match &best {
                None => true,
                Some(current) => {
                    score > current.score
                        || (score == current.score
                            && vendor.match_count > current.vendor.match_count)
                }
            };
            if better {
                best = Some(VendorMatch {
                    vendor,
                    score,
                    kind,
                });
            }
        }

        Ok(best)
    }

    /// Record a successful match; increments the tie-break counter.
    pub async fn record_match(&self, vendor_id: Uuid) -> Result<()> {
        match &self.backend {
            RegistryBackend::InMemory { vendors } => {
                let mut locked = vendors.write().await;
                if let Some(vendor) = locked.values_mut().find(|v| v.id == vendor_id) {
                    vendor.match_count += 1;
                }
                Ok(())
            }
            RegistryBackend::Postgres { pool, .. } => {
                self.ensure_schema_if_needed().await?;
                sqlx::query("UPDATE known_vendors SET match_count = match_count + 1 WHERE id = $1")
                    .bind(vendor_id)
                    .execute(pool)
                    .await
                    .map_err(|e| {
                        UnderwritingError::RegistryError(format!(
                            "Failed to record vendor match: {}",
                            e
                        ))
                    })?;
                Ok(())
            }
        }
    }

    pub async fn all(&self) -> Result<Vec<KnownVendor>> {
        match &self.backend {
            RegistryBackend::InMemory { vendors } => {
                let locked = vendors.read().await;
                Ok(locked.values().cloned().collect())
            }
            RegistryBackend::Postgres { pool, .. } => {
                self.ensure_schema_if_needed().await?;
                let rows = sqlx::query(
                    r#"
                    SELECT id, name, category, match_kind, is_mca_lender,
                           default_frequency, match_count, created_at
                    FROM known_vendors
                    "#,
                )
                .fetch_all(pool)
                .await
                .map_err(|e| {
                    UnderwritingError::RegistryError(format!("Failed to load vendors: {}", e))
                })?;

                Ok(rows.into_iter().map(vendor_from_row).collect())
            }
        }
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<KnownVendor>> {
        match &self.backend {
            RegistryBackend::InMemory { vendors } => {
                let locked = vendors.read().await;
                Ok(locked.get(name).cloned())
            }
            RegistryBackend::Postgres { pool, .. } => {
                self.ensure_schema_if_needed().await?;
                let row = sqlx::query(
                    r#"
                    SELECT id, name, category, match_kind, is_mca_lender,
                           default_frequency, match_count, created_at
                    FROM known_vendors
                    WHERE name = $1
                    "#,
                )
                .bind(name)
                .fetch_optional(pool)
                .await
                .map_err(|e| {
                    UnderwritingError::RegistryError(format!("Failed to look up vendor: {}", e))
                })?;

                Ok(row.map(vendor_from_row))
            }
        }
    }
}

fn kind_to_db(kind: MatchKind) -> &'static str {
    match kind {
        MatchKind::Exact => "exact",
        MatchKind::Contains => "contains",
        MatchKind::Fuzzy => "fuzzy",
    }
}

fn kind_from_db(kind: &str) -> MatchKind {
    match kind {
        "exact" => MatchKind::Exact,
        "contains" => MatchKind::Contains,
        _ => MatchKind::Fuzzy,
    }
}

fn frequency_to_db(frequency: Frequency) -> &'static str {
    match frequency {
        Frequency::Daily => "daily",
        Frequency::Weekly => "weekly",
        Frequency::Monthly => "monthly",
        Frequency::Irregular => "irregular",
    }
}

fn frequency_from_db(frequency: &str) -> Frequency {
    match frequency {
        "daily" => Frequency::Daily,
        "weekly" => Frequency::Weekly,
        "monthly" => Frequency::Monthly,
        _ => Frequency::Irregular,
    }
}

fn vendor_from_row(row: sqlx::postgres::PgRow) -> KnownVendor {
    let match_kind: String = row.try_get("match_kind").unwrap_or_else(|_| "fuzzy".into());
    let default_frequency: Option<String> = row.try_get("default_frequency").ok().flatten();
    let match_count: i64 = row.try_get("match_count").unwrap_or(0);

    KnownVendor {
        id: row.try_get("id").unwrap_or_else(|_| Uuid::new_v4()),
        name: row.try_get("name").unwrap_or_default(),
        category: row.try_get("category").unwrap_or_default(),
        match_kind: kind_from_db(&match_kind),
        is_mca_lender: row.try_get("is_mca_lender").unwrap_or(false),
        default_frequency: default_frequency.as_deref().map(frequency_from_db),
        match_count: match_count.max(0) as u64,
        created_at: row.try_get("created_at").unwrap_or_else(|_| Utc::now()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> VendorRegistry {
        VendorRegistry::in_memory(&Settings::default())
    }

    #[tokio::test]
    async fn seeded_lender_matches_noisy_description() {
        let registry = registry();
        registry.seed_defaults().await.unwrap();

        let hit = registry
            .match_description("ACH DEBIT ONDECK CAPITAL 4417")
            .await
            .unwrap()
            .expect("seeded lender should match");

        assert_eq!(hit.vendor.name, "ONDECK");
        assert!(hit.vendor.is_mca_lender);
        assert_eq!(hit.kind, MatchKind::Contains);
        assert!(hit.score >= 80);
    }

    #[tokio::test]
    async fn below_threshold_descriptions_do_not_match() {
        let registry = registry();
        registry.seed_defaults().await.unwrap();

        let hit = registry
            .match_description("POS PURCHASE CORNER BODEGA 1123")
            .await
            .unwrap();
        assert!(hit.is_none());
    }

    #[tokio::test]
    async fn labeling_upserts_by_canonical_name() {
        let registry = registry();

        let first = registry
            .label("Acme Fuel Stop LLC", "Fuel", false, None)
            .await
            .unwrap();
        assert_eq!(first.name, "ACME FUEL STOP");

        // Relabeling the same payee updates in place.
        let second = registry
            .label("ACME FUEL STOP", "Diesel", false, None)
            .await
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.category, "Diesel");
        assert_eq!(registry.all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn score_ties_break_on_match_count() {
        let registry = registry();
        let cold = registry
            .label("SUMMIT CAPITAL GROUP EAST", "MCA Lender", true, None)
            .await
            .unwrap();
        let warm = registry
            .label("SUMMIT CAPITAL GROUP WEST", "MCA Lender", true, None)
            .await
            .unwrap();
        registry.record_match(warm.id).await.unwrap();
        registry.record_match(warm.id).await.unwrap();

        // Token overlap scores both names identically; neither is a
        // substring of the query.
        let hit = registry
            .match_description("SUMMIT EAST WEST CAPITAL GROUP")
            .await
            .unwrap()
            .expect("match expected");
        assert_eq!(hit.vendor.id, warm.id);
        assert_ne!(hit.vendor.id, cold.id);
    }

    #[tokio::test]
    async fn unlabelable_name_is_rejected() {
        let err = registry().label("POS DEBIT 9981", "Misc", false, None).await;
        assert!(matches!(err, Err(UnderwritingError::RegistryError(_))));
    }
}
