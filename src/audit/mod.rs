//! Audit trail
//!
//! Append-only record of every engine decision per deal, plus the content
//! hashing used for duplicate detection and snapshot integrity.

use crate::models::Deal;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// One audited engine decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub deal_id: Uuid,
    pub stage: String,
    pub detail: String,
    /// Hash of the deal snapshot at the time of the event.
    pub snapshot_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Audit trail storage
pub struct AuditTrail {
    events: Arc<RwLock<HashMap<Uuid, Vec<AuditEvent>>>>,
}

impl AuditTrail {
    pub fn new() -> Self {
        Self {
            events: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Append one event for a deal, hashing its current snapshot.
    pub async fn record(&self, deal: &Deal, stage: &str, detail: impl Into<String>) -> Result<()> {
        let event = AuditEvent {
            deal_id: deal.id,
            stage: stage.to_string(),
            detail: detail.into(),
            snapshot_hash: snapshot_hash(deal),
            created_at: Utc::now(),
        };

        let mut events = self.events.write().await;
        events.entry(deal.id).or_default().push(event);
        Ok(())
    }

    /// Events for one deal in append order.
    pub async fn events_for(&self, deal_id: Uuid) -> Result<Vec<AuditEvent>> {
        let events = self.events.read().await;
        Ok(events.get(&deal_id).cloned().unwrap_or_default())
    }

    /// Check whether the latest recorded snapshot still matches the deal.
    pub async fn verify_integrity(&self, deal: &Deal) -> Result<bool> {
        let events = self.events.read().await;
        let Some(latest) = events.get(&deal.id).and_then(|e| e.last()) else {
            return Ok(false);
        };
        Ok(latest.snapshot_hash == snapshot_hash(deal))
    }
}

impl Default for AuditTrail {
    fn default() -> Self {
        Self::new()
    }
}

/// SHA256 of a raw submitted document, used as the duplicate-detection key.
pub fn content_hash(document: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document);
    hex::encode(hasher.finalize())
}

/// SHA256 hash of a deal snapshot for integrity verification.
/// Streams JSON directly into the hasher, no intermediate String.
pub fn snapshot_hash(deal: &Deal) -> String {
    let mut hasher = Sha256::new();
    if serde_json::to_writer(&mut HashWriter(&mut hasher), deal).is_err() {
        return String::new();
    }
    hex::encode(hasher.finalize())
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DealStatus;

    #[test]
    fn content_hash_is_stable_and_collision_sensitive() {
        let a = content_hash(b"statement bytes");
        let b = content_hash(b"statement bytes");
        let c = content_hash(b"different bytes");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn events_append_in_order() {
        let trail = AuditTrail::new();
        let deal = Deal::new("broker@example.com".to_string(), "h1".to_string());

        trail.record(&deal, "extraction", "attempt 1").await.unwrap();
        trail.record(&deal, "verification", "clean pass").await.unwrap();

        let events = trail.events_for(deal.id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].stage, "extraction");
        assert_eq!(events[1].stage, "verification");
    }

    #[tokio::test]
    async fn integrity_check_detects_mutation_after_recording() {
        let trail = AuditTrail::new();
        let mut deal = Deal::new("broker@example.com".to_string(), "h1".to_string());

        trail.record(&deal, "final", "pending approval").await.unwrap();
        assert!(trail.verify_integrity(&deal).await.unwrap());

        deal.status = DealStatus::Approved;
        assert!(!trail.verify_integrity(&deal).await.unwrap());
    }
}
