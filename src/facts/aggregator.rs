//! Read-side cache of every fact across every shard.
//!
//! Loaded once at startup and kept in step by the fact store after each
//! successful mutation. Consumers render a loading state until `load_all`
//! resolves. The cache is never authoritative — conflict detection always
//! goes back to the shards.

use tokio::sync::RwLock;

use crate::error::Result;
use crate::facts::{Fact, FactStore};

#[derive(Default)]
pub struct FactCache {
    // None until the first load completes.
    facts: RwLock<Option<Vec<Fact>>>,
}

impl FactCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enumerate every shard and flatten into the working set. One read per
    /// shard key, so cost grows with the number of distinct owners.
    pub async fn load_all(&self, store: &FactStore) -> Result<Vec<Fact>> {
        let facts = store.all_facts().await?;
        *self.facts.write().await = Some(facts.clone());
        Ok(facts)
    }

    /// Re-derive the working set from the shards. Invoked after mutations
    /// that may have touched many facts at once.
    pub async fn refresh(&self, store: &FactStore) -> Result<()> {
        self.load_all(store).await?;
        Ok(())
    }

    pub async fn is_loaded(&self) -> bool {
        self.facts.read().await.is_some()
    }

    /// `None` while the initial load is still pending.
    pub async fn snapshot(&self) -> Option<Vec<Fact>> {
        self.facts.read().await.clone()
    }

    pub async fn append(&self, fact: Fact) {
        if let Some(facts) = self.facts.write().await.as_mut() {
            facts.push(fact);
        }
    }

    pub async fn replace_by_id(&self, fact: Fact) {
        if let Some(facts) = self.facts.write().await.as_mut() {
            if let Some(slot) = facts.iter_mut().find(|f| f.id == fact.id) {
                *slot = fact;
            }
        }
    }

    pub async fn remove_by_id(&self, id: &str) {
        if let Some(facts) = self.facts.write().await.as_mut() {
            facts.retain(|f| f.id != id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::FactOwner;
    use crate::store::{KvStore, MemoryKvStore};
    use std::sync::Arc;

    #[tokio::test]
    async fn load_all_flattens_every_shard() {
        let cache = Arc::new(FactCache::new());
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let facts = FactStore::new(store, Arc::clone(&cache));

        facts
            .create_fact("User's name is Boris", FactOwner::Global)
            .await
            .unwrap();
        facts
            .create_fact(
                "afraid of storms",
                FactOwner::Character {
                    id: "char-1".into(),
                    name: None,
                },
            )
            .await
            .unwrap();

        let loaded = cache.load_all(&facts).await.unwrap();
        assert_eq!(loaded.len(), 2);

        let boris: Vec<_> = loaded
            .iter()
            .filter(|f| f.content == "User's name is Boris")
            .collect();
        assert_eq!(boris.len(), 1);
        assert_eq!(boris[0].scope, crate::facts::FactScope::Global);
    }

    #[tokio::test]
    async fn mutators_are_inert_before_first_load() {
        let cache = FactCache::new();
        assert!(!cache.is_loaded().await);

        cache
            .append(Fact {
                id: "f1".into(),
                content: "early".into(),
                timestamp: chrono::Utc::now(),
                scope: crate::facts::FactScope::Global,
                character_id: None,
                character_name: None,
                conversation_id: None,
                conversation_preview: None,
            })
            .await;

        // Still unloaded; the store remains the source of truth.
        assert!(cache.snapshot().await.is_none());
    }
}
