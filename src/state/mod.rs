//! Deal persistence layer
//!
//! Responsible for storing and loading deals, including the content-hash
//! index used for duplicate detection.

use crate::error::UnderwritingError;
use crate::models::Deal;
use crate::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Trait for deal persistence
#[async_trait::async_trait]
pub trait DealStore: Send + Sync {
    async fn insert(&self, deal: Deal) -> Result<()>;
    async fn update(&self, deal: &Deal) -> Result<()>;
    async fn get(&self, deal_id: Uuid) -> Result<Option<Deal>>;
    /// Earliest deal submitted with the same document hash, if any.
    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<Deal>>;
    async fn list(&self) -> Result<Vec<Deal>>;
}

/// In-memory deal store for development and tests.
pub struct InMemoryDealStore {
    deals: Arc<RwLock<HashMap<Uuid, Deal>>>,
    by_hash: Arc<RwLock<HashMap<String, Uuid>>>,
}

impl InMemoryDealStore {
    pub fn new() -> Self {
        Self {
            deals: Arc::new(RwLock::new(HashMap::new())),
            by_hash: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryDealStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DealStore for InMemoryDealStore {
    async fn insert(&self, deal: Deal) -> Result<()> {
        let mut by_hash = self.by_hash.write().await;
        let mut deals = self.deals.write().await;

        // First submission of a document owns the hash slot.
        by_hash
            .entry(deal.content_hash.clone())
            .or_insert(deal.id);
        deals.insert(deal.id, deal);
        Ok(())
    }

    async fn update(&self, deal: &Deal) -> Result<()> {
        let mut deals = self.deals.write().await;
        let existing = deals.get_mut(&deal.id).ok_or_else(|| {
            UnderwritingError::StateError(format!("deal {} not found for update", deal.id))
        })?;
        let mut updated = deal.clone();
        updated.updated_at = Utc::now();
        *existing = updated;
        Ok(())
    }

    async fn get(&self, deal_id: Uuid) -> Result<Option<Deal>> {
        let deals = self.deals.read().await;
        Ok(deals.get(&deal_id).cloned())
    }

    async fn find_by_hash(&self, content_hash: &str) -> Result<Option<Deal>> {
        let by_hash = self.by_hash.read().await;
        let Some(deal_id) = by_hash.get(content_hash) else {
            return Ok(None);
        };
        let deals = self.deals.read().await;
        Ok(deals.get(deal_id).cloned())
    }

    async fn list(&self) -> Result<Vec<Deal>> {
        let deals = self.deals.read().await;
        let mut all: Vec<Deal> = deals.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DealStatus;

    #[tokio::test]
    async fn insert_and_fetch_round_trip() {
        let store = InMemoryDealStore::new();
        let deal = Deal::new("broker@example.com".to_string(), "abc123".to_string());
        let id = deal.id;

        store.insert(deal).await.unwrap();
        let fetched = store.get(id).await.unwrap().expect("deal expected");
        assert_eq!(fetched.status, DealStatus::Extracting);
    }

    #[tokio::test]
    async fn hash_lookup_returns_the_original_deal() {
        let store = InMemoryDealStore::new();
        let original = Deal::new("a@example.com".to_string(), "samehash".to_string());
        let original_id = original.id;
        let resubmission = Deal::new("b@example.com".to_string(), "samehash".to_string());

        store.insert(original).await.unwrap();
        store.insert(resubmission).await.unwrap();

        let found = store.find_by_hash("samehash").await.unwrap().unwrap();
        assert_eq!(found.id, original_id);
        assert!(store.find_by_hash("otherhash").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_replaces_and_touches_timestamp() {
        let store = InMemoryDealStore::new();
        let mut deal = Deal::new("broker@example.com".to_string(), "h1".to_string());
        store.insert(deal.clone()).await.unwrap();

        deal.status = DealStatus::PendingApproval;
        store.update(&deal).await.unwrap();

        let fetched = store.get(deal.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, DealStatus::PendingApproval);
        assert!(fetched.updated_at >= deal.created_at);
    }

    #[tokio::test]
    async fn updating_a_missing_deal_fails() {
        let store = InMemoryDealStore::new();
        let deal = Deal::new("broker@example.com".to_string(), "h1".to_string());
        assert!(matches!(
            store.update(&deal).await,
            Err(UnderwritingError::StateError(_))
        ));
    }
}
