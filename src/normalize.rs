//! Description normalization and similarity scoring
//!
//! Extracted bank descriptions carry processor boilerplate, reference
//! numbers, and inconsistent casing. Everything that groups or matches
//! transactions goes through this module first.

use crate::models::MatchKind;
use lazy_static::lazy_static;
use std::collections::HashSet;

lazy_static! {
    /// Processor boilerplate tokens that carry no merchant identity.
    static ref NOISE_TOKENS: HashSet<&'static str> = [
        "POS", "DEBIT", "CREDIT", "CARD", "PURCHASE", "ACH", "ONLINE",
        "PAYMENT", "WITHDRAWAL", "DEPOSIT", "CHECK", "ATM", "AUTH",
        "PENDING", "VISA", "MC", "TRX", "TXN", "WIRE", "EFT",
    ]
    .into_iter()
    .collect();

    /// Corporate suffixes stripped from merchant keys.
    static ref CORPORATE_SUFFIXES: HashSet<&'static str> =
        ["LLC", "INC", "CORP", "CO", "LTD"].into_iter().collect();
}

/// Normalize a raw description: uppercase, collapse non-alphanumerics to
/// single spaces, mask runs of four or more digits, drop `#123`-style
/// reference markers.
pub fn normalize_description(raw: &str) -> String {
    let mut output = String::with_capacity(raw.len());
    let mut previous_space = true;
    let mut chars = raw.trim().chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '#' {
            // Reference marker: swallow the digits that follow.
            while chars.peek().is_some_and(|c| c.is_ascii_digit()) {
                chars.next();
            }
            continue;
        }
        if ch.is_ascii_alphanumeric() {
            output.push(ch.to_ascii_uppercase());
            previous_space = false;
        } else if !previous_space {
            output.push(' ');
            previous_space = true;
        }
    }

    let mut masked: Vec<String> = Vec::new();
    for token in output.split_whitespace() {
        if token.len() >= 4 && token.chars().all(|c| c.is_ascii_digit()) {
            masked.push("XXXX".to_string());
        } else {
            masked.push(token.to_string());
        }
    }
    masked.join(" ")
}

/// Stable grouping key for a merchant: normalized description with noise
/// tokens, masked numbers, and corporate suffixes removed. Empty when
/// nothing identifying remains.
pub fn merchant_key(raw: &str) -> String {
    let normalized = normalize_description(raw);
    let tokens: Vec<&str> = normalized
        .split_whitespace()
        .filter(|t| !NOISE_TOKENS.contains(*t) && *t != "XXXX")
        .collect();

    let trimmed: Vec<&str> = match tokens.split_last() {
        Some((last, rest)) if CORPORATE_SUFFIXES.contains(*last) && !rest.is_empty() => {
            rest.to_vec()
        }
        _ => tokens,
    };

    trimmed.join(" ")
}

/// True when any keyword appears as whole words of the normalized
/// description. Multi-word keywords must appear as adjacent tokens.
/// Substring matching is wrong here: "TRANSFER" contains "NSF".
pub fn contains_keyword(description: &str, keywords: &[&str]) -> bool {
    let normalized = normalize_description(description);
    let tokens: Vec<&str> = normalized.split_whitespace().collect();

    keywords.iter().any(|keyword| {
        let wanted: Vec<&str> = keyword.split_whitespace().collect();
        !wanted.is_empty()
            && wanted.len() <= tokens.len()
            && tokens.windows(wanted.len()).any(|w| w == wanted.as_slice())
    })
}

/// Score two normalized names on a 0-100 scale with the match tier that
/// produced the score. Exact equality scores 100; containment of the
/// shorter name in the longer scores 95; otherwise token overlap (Dice
/// coefficient) scaled to 0-100.
pub fn similarity(a: &str, b: &str) -> (u8, MatchKind) {
    if a.is_empty() || b.is_empty() {
        return (0, MatchKind::Fuzzy);
    }
    if a == b {
        return (100, MatchKind::Exact);
    }

    let (shorter, longer) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    if shorter.len() >= 4 && longer.contains(shorter) {
        return (95, MatchKind::Contains);
    }

    let tokens_a: HashSet<&str> = a.split_whitespace().collect();
    let tokens_b: HashSet<&str> = b.split_whitespace().collect();
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return (0, MatchKind::Fuzzy);
    }

    let common = tokens_a.intersection(&tokens_b).count();
    let score = (200 * common) / (tokens_a.len() + tokens_b.len());
    (score.min(100) as u8, MatchKind::Fuzzy)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_masks_long_digit_runs() {
        assert_eq!(
            normalize_description("ACH DEBIT ABC FUNDING 123456789"),
            "ACH DEBIT ABC FUNDING XXXX"
        );
        assert_eq!(normalize_description("Whole-Foods #123"), "WHOLE FOODS");
    }

    #[test]
    fn merchant_key_strips_noise_and_suffixes() {
        assert_eq!(
            merchant_key("ACH DEBIT XYZ CAPITAL FUNDING LLC 4417"),
            "XYZ CAPITAL FUNDING"
        );
        assert_eq!(merchant_key("POS PURCHASE 9981"), "");
    }

    #[test]
    fn same_merchant_different_references_share_a_key() {
        let a = merchant_key("ACH DEBIT XYZ CAPITAL FUNDING LLC #1001");
        let b = merchant_key("xyz capital funding llc 20250114");
        assert_eq!(a, b);
    }

    #[test]
    fn similarity_tiers() {
        assert_eq!(
            similarity("ONDECK", "ONDECK"),
            (100, MatchKind::Exact)
        );
        assert_eq!(
            similarity("ONDECK", "ONDECK CAPITAL SERVICES"),
            (95, MatchKind::Contains)
        );
        let (score, kind) = similarity("RAPID FINANCE GROUP", "RAPID FUNDING GROUP");
        assert_eq!(kind, MatchKind::Fuzzy);
        assert!(score > 50 && score < 80);
    }

    #[test]
    fn keyword_matching_is_whole_word() {
        assert!(!contains_keyword("ONLINE TRANSFER OUT", &["NSF"]));
        assert!(contains_keyword("NSF RETURNED ITEM", &["NSF"]));
        assert!(contains_keyword("nsf fee #221", &["NSF"]));
        assert!(contains_keyword("MONTHLY SERVICE CHARGE", &["SERVICE CHARGE"]));
        assert!(!contains_keyword("SERVICE DEPT INVOICE", &["SERVICE CHARGE"]));
    }

    #[test]
    fn short_fragments_do_not_count_as_containment() {
        let (score, kind) = similarity("CO", "COMMERCIAL RENT CO HOLDINGS");
        assert_ne!(kind, MatchKind::Contains);
        assert!(score < 80);
    }
}
