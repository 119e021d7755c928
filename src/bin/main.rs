use deal_underwriting_engine::{
    advisor::MockAdvisor,
    audit::AuditTrail,
    engine::UnderwritingEngine,
    extraction::{ExtractedStatement, PollOutcome, ScriptedExtraction},
    memory::PatternMemory,
    models::{StatementSummary, Submission, Transaction},
    state::InMemoryDealStore,
    vendors::VendorRegistry,
    Settings,
};
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

fn txn(month: u32, day: u32, amount: f64, description: &str) -> Transaction {
    Transaction {
        id: Uuid::new_v4(),
        account: "4417".to_string(),
        date: NaiveDate::from_ymd_opt(2025, month, day).unwrap(),
        amount,
        description: description.to_string(),
        category: None,
        is_internal_transfer: false,
        matched_transfer_id: None,
        source_line: 0,
    }
}

/// Statement whose claimed deposits disagree with its line items.
fn first_extraction() -> ExtractedStatement {
    ExtractedStatement {
        summary: StatementSummary {
            total_deposits: 45_000.0,
            account_number: Some("4417".to_string()),
            ..Default::default()
        },
        transactions: vec![txn(1, 3, 43_500.0, "REMOTE DEPOSIT")],
        field_confidence: HashMap::new(),
    }
}

/// Corrected re-extraction with a full quarter of activity.
fn second_extraction() -> ExtractedStatement {
    let mut transactions = vec![
        txn(1, 3, 45_000.0, "REMOTE DEPOSIT"),
        txn(2, 3, 44_000.0, "REMOTE DEPOSIT"),
        txn(3, 3, 46_000.0, "REMOTE DEPOSIT"),
    ];
    for month in 1..=3 {
        for week in 0..4 {
            transactions.push(txn(
                month,
                3 + week * 7,
                -1200.0,
                "ACH DEBIT XYZ CAPITAL FUNDING LLC",
            ));
        }
    }

    ExtractedStatement {
        summary: StatementSummary {
            total_deposits: 135_000.0,
            total_withdrawals: 14_400.0,
            account_number: Some("4417".to_string()),
            ..Default::default()
        },
        transactions,
        field_confidence: HashMap::new(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    info!("Deal Underwriting Engine starting");

    let settings = Settings::from_env()?;

    // Scripted extraction: a mismatched first pass, then a clean one.
    let extraction = Arc::new(ScriptedExtraction::new(vec![
        PollOutcome::Complete(first_extraction()),
        PollOutcome::Complete(second_extraction()),
    ]));

    let vendors = Arc::new(VendorRegistry::in_memory(&settings));
    vendors.seed_defaults().await?;

    let engine = UnderwritingEngine::new(
        settings,
        extraction,
        Arc::new(MockAdvisor),
        vendors,
        Arc::new(PatternMemory::in_memory()),
        Arc::new(InMemoryDealStore::new()),
        Arc::new(AuditTrail::new()),
    );

    let submission = Submission {
        sender: "broker@example.com".to_string(),
        document: b"sample statement bytes".to_vec(),
        content_hash: String::new(),
    };

    let receipt = engine.process(submission).await?;

    println!("\n=== SUBMISSION RECEIPT ===");
    println!("Deal ID: {}", receipt.deal_id);
    println!("Status: {}", receipt.status);
    println!("Retries used: {}", receipt.retry_count);
    if let Some(account) = &receipt.account_number {
        println!("Account: {}", account);
    }

    if let Some(deal) = engine.deals().get(receipt.deal_id).await? {
        println!("\nReasoning Log:");
        for (i, entry) in deal.reasoning_log.iter().enumerate() {
            println!("  {}: {}", i + 1, entry);
        }
        if let Some(narrative) = &deal.narrative {
            println!("\nNarrative: {}", narrative);
        }
    }

    Ok(())
}
