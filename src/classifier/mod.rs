//! Position Classifier
//!
//! Decides which recurring clusters are merchant-cash-advance debt using an
//! explicit ordered chain of classification layers with early exit:
//! whitelist, blacklist, then statistical pattern validation. The first two
//! layers are authoritative; learned rules may only override the third.

use crate::memory::PatternMemory;
use crate::models::Frequency;
use crate::patterns::RecurringCluster;
use crate::Result;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Known MCA lenders with their typical debit cadence.
pub const MCA_LENDERS: &[(&str, Frequency)] = &[
    ("CAN CAPITAL", Frequency::Daily),
    ("ONDECK", Frequency::Daily),
    ("CREDIBLY", Frequency::Daily),
    ("KALAMATA CAPITAL", Frequency::Daily),
    ("HEADWAY CAPITAL", Frequency::Weekly),
    ("YELLOWSTONE CAPITAL", Frequency::Daily),
    ("LIBERTAS FUNDING", Frequency::Daily),
    ("CLEARVIEW FUNDING", Frequency::Daily),
    ("RAPID FINANCE", Frequency::Daily),
    ("BIZFUND", Frequency::Daily),
    ("FORWARD FINANCING", Frequency::Daily),
    ("KING COMMERCIAL", Frequency::Daily),
    ("HUNTER CAROLINE", Frequency::Daily),
    ("MERCHANT ADVANCE", Frequency::Daily),
    ("CASH ADVANCE", Frequency::Daily),
    ("DAILY ACH", Frequency::Daily),
    ("WORLD BUSINESS LENDERS", Frequency::Weekly),
    ("NEWTEK", Frequency::Monthly),
    ("KABBAGE", Frequency::Weekly),
    ("BLUEVINE", Frequency::Weekly),
];

/// Known non-MCA payees that would otherwise trip generic debt keywords.
pub const NON_MCA_PAYEES: &[(&str, &str)] = &[
    ("DISCOVER CARD", "Credit Card"),
    ("AMEX", "Credit Card"),
    ("AMERICAN EXPRESS", "Credit Card"),
    ("CHASE CARD", "Credit Card"),
    ("CAPITAL ONE CARD", "Credit Card"),
    ("UTICA INSURANCE", "Insurance"),
    ("PROGRESSIVE", "Insurance"),
    ("STATE FARM", "Insurance"),
    ("ALLSTATE", "Insurance"),
    ("GEICO", "Insurance"),
    ("LIBERTY MUTUAL", "Insurance"),
    ("ADP PAYROLL", "Payroll"),
    ("PAYCHEX", "Payroll"),
    ("GUSTO", "Payroll"),
    ("RENT PAYMENT", "Rent"),
    ("COMMERCIAL RENT", "Rent"),
    ("UTILITY BILL", "Utilities"),
    ("ELECTRIC BILL", "Utilities"),
    ("GAS BILL", "Utilities"),
];

lazy_static! {
    /// Generic debt-adjacent keywords gating the pattern-validation layer.
    static ref DEBT_KEYWORDS: Vec<&'static str> =
        vec!["CAPITAL", "FUNDING", "ADVANCE", "FINANCING", "LENDING", "MERCHANT"];
}

/// Pattern-validation thresholds from §4.3.
const MIN_PAYMENT_COUNT: usize = 10;
const MAX_VARIANCE_PCT: f64 = 0.15;
const AMOUNT_BAND: (f64, f64) = (50.0, 5000.0);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PositionClass {
    ConfirmedMca,
    ConfirmedNotMca,
    Unclassified,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub class: PositionClass,
    pub confidence: f64,
    pub layer: &'static str,
    pub reason: String,
}

/// One layer in the ordered chain. Returning `None` passes the cluster to
/// the next layer.
pub trait ClassificationLayer: Send + Sync {
    fn name(&self) -> &'static str;
    fn classify(&self, cluster: &RecurringCluster) -> Option<Classification>;
}

/// Layer 1: whitelist of known MCA lenders. Authoritative regardless of
/// pattern statistics.
pub struct WhitelistLayer;

impl ClassificationLayer for WhitelistLayer {
    fn name(&self) -> &'static str {
        "whitelist"
    }

    fn classify(&self, cluster: &RecurringCluster) -> Option<Classification> {
        let (lender, _) = MCA_LENDERS
            .iter()
            .find(|(name, _)| cluster.merchant.contains(name))?;
        Some(Classification {
            class: PositionClass::ConfirmedMca,
            confidence: 1.0,
            layer: self.name(),
            reason: format!("merchant matches known MCA lender '{}'", lender),
        })
    }
}

/// Layer 2: blacklist of known non-MCA payees. Authoritative even when
/// generic debt keywords are present.
pub struct BlacklistLayer;

impl ClassificationLayer for BlacklistLayer {
    fn name(&self) -> &'static str {
        "blacklist"
    }

    fn classify(&self, cluster: &RecurringCluster) -> Option<Classification> {
        let (payee, category) = NON_MCA_PAYEES
            .iter()
            .find(|(name, _)| cluster.merchant.contains(name))?;
        Some(Classification {
            class: PositionClass::ConfirmedNotMca,
            confidence: 1.0,
            layer: self.name(),
            reason: format!("merchant matches known {} payee '{}'", category, payee),
        })
    }
}

/// Layer 3: generic debt keyword plus statistical validation of the
/// cluster. Confidence scales with how tightly the amounts fit.
pub struct PatternValidationLayer;

impl ClassificationLayer for PatternValidationLayer {
    fn name(&self) -> &'static str {
        "pattern_validation"
    }

    fn classify(&self, cluster: &RecurringCluster) -> Option<Classification> {
        let keyword = DEBT_KEYWORDS
            .iter()
            .find(|kw| cluster.merchant.contains(*kw))?;

        let count_ok = cluster.occurrence_count() >= MIN_PAYMENT_COUNT;
        let variance_ok = cluster.max_deviation_pct <= MAX_VARIANCE_PCT;
        let band_ok =
            cluster.mean_amount >= AMOUNT_BAND.0 && cluster.mean_amount <= AMOUNT_BAND.1;

        if !(count_ok && variance_ok && band_ok) {
            return None;
        }

        // Tighter variance means higher confidence: 0.7 at the tolerance
        // edge, approaching 1.0 for perfectly even payments.
        let tightness = 1.0 - (cluster.max_deviation_pct / MAX_VARIANCE_PCT);
        let confidence = 0.7 + 0.3 * tightness;

        Some(Classification {
            class: PositionClass::ConfirmedMca,
            confidence,
            layer: self.name(),
            reason: format!(
                "keyword '{}' with {} payments, {:.1}% max variance, ${:.2} mean",
                keyword,
                cluster.occurrence_count(),
                cluster.max_deviation_pct * 100.0,
                cluster.mean_amount
            ),
        })
    }
}

pub struct PositionClassifier {
    layers: Vec<Box<dyn ClassificationLayer>>,
}

impl PositionClassifier {
    pub fn new() -> Self {
        Self {
            layers: vec![
                Box::new(WhitelistLayer),
                Box::new(BlacklistLayer),
                Box::new(PatternValidationLayer),
            ],
        }
    }

    /// Run the ordered layer chain with early exit.
    pub fn classify(&self, cluster: &RecurringCluster) -> Classification {
        for layer in &self.layers {
            if let Some(result) = layer.classify(cluster) {
                debug!(
                    merchant = %cluster.merchant,
                    layer = result.layer,
                    class = ?result.class,
                    "cluster classified"
                );
                return result;
            }
        }
        Classification {
            class: PositionClass::Unclassified,
            confidence: 0.0,
            layer: "none",
            reason: "no layer matched".to_string(),
        }
    }

    /// Classify with learned-rule override. A rule may replace the
    /// pattern-validation outcome when its recorded confidence is higher;
    /// whitelist and blacklist verdicts are never overridden.
    pub async fn classify_with_rules(
        &self,
        cluster: &RecurringCluster,
        memory: &PatternMemory,
    ) -> Result<Classification> {
        let base = self.classify(cluster);
        if base.layer == "whitelist" || base.layer == "blacklist" {
            return Ok(base);
        }

        let Some(rule) = memory.best_rule(&cluster.merchant).await? else {
            return Ok(base);
        };
        if rule.confidence <= base.confidence {
            return Ok(base);
        }

        let class = match rule.correct_classification.as_str() {
            "MCA" => PositionClass::ConfirmedMca,
            "Not MCA" => PositionClass::ConfirmedNotMca,
            other => {
                // A malformed rule never blocks the deal.
                warn!(
                    rule_id = %rule.id,
                    classification = other,
                    "rule has unknown classification target, ignoring"
                );
                return Ok(base);
            }
        };

        Ok(Classification {
            class,
            confidence: rule.confidence,
            layer: "learned_rule",
            reason: format!("rule '{}' (confidence {:.2})", rule.pattern, rule.confidence),
        })
    }
}

impl Default for PositionClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::{ClusterPayment, ClusterStatus};
    use chrono::NaiveDate;

    fn cluster(merchant: &str, count: usize, mean: f64, deviation: f64) -> RecurringCluster {
        let base = NaiveDate::from_ymd_opt(2025, 2, 3).unwrap();
        let payments: Vec<ClusterPayment> = (0..count)
            .map(|i| ClusterPayment {
                date: base + chrono::Duration::days(i as i64 * 7),
                amount: if i % 2 == 0 {
                    mean * (1.0 + deviation)
                } else {
                    mean * (1.0 - deviation)
                },
            })
            .collect();

        RecurringCluster {
            merchant: merchant.to_string(),
            sample_description: merchant.to_string(),
            mean_amount: mean,
            max_deviation_pct: deviation,
            frequency: Frequency::Weekly,
            modal_interval_days: 7,
            first_seen: base,
            last_seen: payments.last().map(|p| p.date).unwrap_or(base),
            payments,
            pauses: Vec::new(),
            status: ClusterStatus::Active,
            refinance: None,
        }
    }

    #[test]
    fn whitelisted_lender_is_mca_even_with_failing_statistics() {
        // Two payments and wild variance would fail pattern validation.
        let result = PositionClassifier::new().classify(&cluster("ONDECK", 2, 40000.0, 0.8));
        assert_eq!(result.class, PositionClass::ConfirmedMca);
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.layer, "whitelist");
    }

    #[test]
    fn blacklisted_payee_is_not_mca_despite_debt_keyword() {
        // "CAPITAL ONE CARD" carries the generic keyword "CAPITAL" and the
        // statistics pass, but the blacklist is authoritative.
        let result =
            PositionClassifier::new().classify(&cluster("CAPITAL ONE CARD", 12, 1200.0, 0.05));
        assert_eq!(result.class, PositionClass::ConfirmedNotMca);
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.layer, "blacklist");
    }

    #[test]
    fn keyword_and_statistics_confirm_unlisted_lender() {
        // 12 payments of ~$1,200 +-10% weekly from an unlisted funder.
        let result =
            PositionClassifier::new().classify(&cluster("XYZ CAPITAL FUNDING", 12, 1200.0, 0.10));
        assert_eq!(result.class, PositionClass::ConfirmedMca);
        assert_eq!(result.layer, "pattern_validation");
        assert!(result.confidence > 0.7 && result.confidence < 1.0);
    }

    #[test]
    fn tighter_variance_scores_higher_confidence() {
        let classifier = PositionClassifier::new();
        let tight = classifier.classify(&cluster("XYZ CAPITAL FUNDING", 12, 1200.0, 0.02));
        let loose = classifier.classify(&cluster("XYZ CAPITAL FUNDING", 12, 1200.0, 0.14));
        assert!(tight.confidence > loose.confidence);
    }

    #[test]
    fn statistics_failures_leave_cluster_unclassified() {
        let classifier = PositionClassifier::new();

        // Too few payments.
        let few = classifier.classify(&cluster("XYZ CAPITAL FUNDING", 6, 1200.0, 0.05));
        assert_eq!(few.class, PositionClass::Unclassified);

        // Amount outside the $50-$5000 band.
        let big = classifier.classify(&cluster("XYZ CAPITAL FUNDING", 12, 9000.0, 0.05));
        assert_eq!(big.class, PositionClass::Unclassified);

        // Variance too loose.
        let loose = classifier.classify(&cluster("XYZ CAPITAL FUNDING", 12, 1200.0, 0.30));
        assert_eq!(loose.class, PositionClass::Unclassified);
    }

    #[test]
    fn no_keyword_means_no_pattern_validation() {
        let result = PositionClassifier::new().classify(&cluster("ACME SUPPLIES", 12, 1200.0, 0.05));
        assert_eq!(result.class, PositionClass::Unclassified);
    }

    #[tokio::test]
    async fn rule_overrides_pattern_layer_but_not_whitelist() {
        let memory = PatternMemory::in_memory();
        memory
            .add_rule(
                "XYZ CAPITAL",
                "position_classification",
                None,
                "Not MCA",
                1.0,
            )
            .await
            .unwrap();
        memory
            .add_rule("ONDECK", "position_classification", None, "Not MCA", 1.0)
            .await
            .unwrap();

        let classifier = PositionClassifier::new();

        // Pattern-layer verdict (confidence < 1.0) yields to the rule.
        let overridden = classifier
            .classify_with_rules(&cluster("XYZ CAPITAL FUNDING", 12, 1200.0, 0.10), &memory)
            .await
            .unwrap();
        assert_eq!(overridden.class, PositionClass::ConfirmedNotMca);
        assert_eq!(overridden.layer, "learned_rule");

        // Whitelist verdict stands no matter what the rule says.
        let kept = classifier
            .classify_with_rules(&cluster("ONDECK", 2, 40000.0, 0.8), &memory)
            .await
            .unwrap();
        assert_eq!(kept.class, PositionClass::ConfirmedMca);
        assert_eq!(kept.layer, "whitelist");
    }
}
