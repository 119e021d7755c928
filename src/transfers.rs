//! Transfer Hunter
//!
//! Pairs opposite-signed transactions across accounts so money moved
//! between the applicant's own accounts is not double-counted as revenue.
//! Pairs are disjoint: once matched, a transaction leaves the candidate
//! pool. Chained transfers across three or more accounts are resolved only
//! as pairwise direct matches; cascade legs with no direct partner stay
//! unflagged.

use crate::config::Settings;
use crate::models::{amounts_equal_cents, Transaction};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

/// One detected internal-transfer pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferPair {
    pub debit_id: Uuid,
    pub credit_id: Uuid,
    pub amount: f64,
    pub debit_account: String,
    pub credit_account: String,
    pub debit_date: NaiveDate,
    pub credit_date: NaiveDate,
    pub days_apart: i64,
}

pub struct TransferHunter {
    window_days: i64,
    exact_amount: bool,
}

impl TransferHunter {
    pub fn new(settings: &Settings) -> Self {
        Self {
            window_days: settings.transfer_window_days,
            exact_amount: settings.transfer_exact_amount,
        }
    }

    /// Find disjoint transfer pairs and mark both members of each pair
    /// `is_internal_transfer = true`.
    pub fn mark_transfers(&self, transactions: &mut [Transaction]) -> Vec<TransferPair> {
        let pairs = self.find_pairs(transactions);

        for pair in &pairs {
            for txn in transactions.iter_mut() {
                if txn.id == pair.debit_id {
                    txn.is_internal_transfer = true;
                    txn.matched_transfer_id = Some(pair.credit_id);
                } else if txn.id == pair.credit_id {
                    txn.is_internal_transfer = true;
                    txn.matched_transfer_id = Some(pair.debit_id);
                }
            }
        }

        debug!(pair_count = pairs.len(), "transfer pairing complete");
        pairs
    }

    fn find_pairs(&self, transactions: &[Transaction]) -> Vec<TransferPair> {
        let mut debits: Vec<&Transaction> = transactions.iter().filter(|t| t.is_debit()).collect();
        let credits: Vec<&Transaction> = transactions.iter().filter(|t| t.is_credit()).collect();

        // Deterministic scan order: by date, then id.
        debits.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.id.cmp(&b.id)));

        let mut matched: Vec<Uuid> = Vec::new();
        let mut pairs: Vec<TransferPair> = Vec::new();

        for debit in debits {
            if matched.contains(&debit.id) {
                continue;
            }

            let target = debit.abs_amount();
            let mut candidates: Vec<&&Transaction> = credits
                .iter()
                .filter(|credit| {
                    credit.account != debit.account
                        && !matched.contains(&credit.id)
                        && self.amount_matches(credit.amount, target)
                        && (credit.date - debit.date).num_days().abs() <= self.window_days
                })
                .collect();

            if candidates.is_empty() {
                continue;
            }

            // Tie-break: smallest day distance, then earliest credit date,
            // then smallest id. Deterministic even for ambiguous 3-way
            // matches at equal distance across different accounts.
            candidates.sort_by(|a, b| {
                let da = (a.date - debit.date).num_days().abs();
                let db = (b.date - debit.date).num_days().abs();
                da.cmp(&db)
                    .then_with(|| a.date.cmp(&b.date))
                    .then_with(|| a.id.cmp(&b.id))
            });

            let credit = candidates[0];
            matched.push(debit.id);
            matched.push(credit.id);

            pairs.push(TransferPair {
                debit_id: debit.id,
                credit_id: credit.id,
                amount: target,
                debit_account: debit.account.clone(),
                credit_account: credit.account.clone(),
                debit_date: debit.date,
                credit_date: credit.date,
                days_apart: (credit.date - debit.date).num_days().abs(),
            });
        }

        pairs
    }

    fn amount_matches(&self, credit_amount: f64, debit_abs: f64) -> bool {
        if self.exact_amount {
            amounts_equal_cents(credit_amount, debit_abs)
        } else {
            (credit_amount - debit_abs).abs() <= debit_abs * 0.01
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn txn(account: &str, day: u32, amount: f64) -> Transaction {
        Transaction {
            id: Uuid::new_v4(),
            account: account.to_string(),
            date: NaiveDate::from_ymd_opt(2025, 3, day).unwrap(),
            amount,
            description: "ONLINE TRANSFER".to_string(),
            category: None,
            is_internal_transfer: false,
            matched_transfer_id: None,
            source_line: 0,
        }
    }

    fn hunter() -> TransferHunter {
        TransferHunter::new(&Settings::default())
    }

    #[test]
    fn cross_account_pair_within_window_is_flagged() {
        // -$5,000 on day 10 in account 1, +$5,000 on day 11 in account 2.
        let mut txns = vec![txn("1111", 10, -5000.0), txn("2222", 11, 5000.0)];
        let pairs = hunter().mark_transfers(&mut txns);

        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].days_apart, 1);
        assert!(txns.iter().all(|t| t.is_internal_transfer));
        assert_eq!(txns[0].matched_transfer_id, Some(txns[1].id));
    }

    #[test]
    fn same_account_equal_amounts_are_not_a_transfer() {
        let mut txns = vec![txn("1111", 10, -900.0), txn("1111", 11, 900.0)];
        let pairs = hunter().mark_transfers(&mut txns);
        assert!(pairs.is_empty());
        assert!(txns.iter().all(|t| !t.is_internal_transfer));
    }

    #[test]
    fn amounts_must_match_to_the_cent() {
        let mut txns = vec![txn("1111", 10, -5000.00), txn("2222", 10, 5000.01)];
        assert!(hunter().mark_transfers(&mut txns).is_empty());
    }

    #[test]
    fn dates_outside_window_do_not_match() {
        let mut txns = vec![txn("1111", 10, -750.0), txn("2222", 14, 750.0)];
        assert!(hunter().mark_transfers(&mut txns).is_empty());
    }

    #[test]
    fn no_transaction_appears_in_two_pairs() {
        // Two debits compete for one credit; only one pair forms.
        let mut txns = vec![
            txn("1111", 10, -300.0),
            txn("3333", 10, -300.0),
            txn("2222", 10, 300.0),
        ];
        let pairs = hunter().mark_transfers(&mut txns);
        assert_eq!(pairs.len(), 1);

        let mut seen: Vec<Uuid> = Vec::new();
        for pair in &pairs {
            assert!(!seen.contains(&pair.debit_id));
            assert!(!seen.contains(&pair.credit_id));
            seen.push(pair.debit_id);
            seen.push(pair.credit_id);
        }
        assert_eq!(txns.iter().filter(|t| t.is_internal_transfer).count(), 2);
    }

    #[test]
    fn closest_date_wins_among_candidates() {
        let far = txn("2222", 12, 1200.0);
        let near = txn("3333", 10, 1200.0);
        let mut txns = vec![txn("1111", 10, -1200.0), far.clone(), near.clone()];

        let pairs = hunter().mark_transfers(&mut txns);
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].credit_id, near.id);
    }

    #[test]
    fn equal_distance_tie_falls_back_to_earliest_date() {
        // Credits one day before and one day after the debit: the earlier
        // transaction wins the documented tie-break.
        let before = txn("2222", 9, 640.0);
        let after = txn("3333", 11, 640.0);
        let mut txns = vec![txn("1111", 10, -640.0), after.clone(), before.clone()];

        let pairs = hunter().mark_transfers(&mut txns);
        assert_eq!(pairs[0].credit_id, before.id);
    }

    #[test]
    fn three_way_cascade_only_resolves_direct_pairs() {
        // A -> B -> C cascade of $2,000: A/B and B/C both match directly,
        // but B's single credit can only pair once.
        let mut txns = vec![
            txn("AAAA", 10, -2000.0),
            txn("BBBB", 10, 2000.0),
            txn("BBBB", 11, -2000.0),
            txn("CCCC", 11, 2000.0),
        ];
        let pairs = hunter().mark_transfers(&mut txns);
        assert_eq!(pairs.len(), 2);
        assert_eq!(txns.iter().filter(|t| t.is_internal_transfer).count(), 4);
    }
}
