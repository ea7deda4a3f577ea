//! Offline sweep for facts that have gone bad.
//!
//! Orphans point at characters or conversations that no longer exist;
//! near-duplicates are repeated knowledge from a non-deterministic author.
//! Both scans are read-only — flagged facts are surfaced for manual deletion
//! through the fact store's normal delete path. Scans walk shard by shard,
//! so aborting between reads never leaves a shard half-written.

use std::collections::HashSet;
use std::sync::Arc;

use crate::collections::{record_id, Collections, CHARACTERS_KEY, CONVERSATIONS_KEY};
use crate::error::Result;
use crate::facts::{Fact, FactScope, FactStore};

/// Content comparator returning a similarity in [0.0, 1.0]. The default is
/// exact matching after normalization; an embedding-backed comparator can be
/// injected in its place.
pub type SimilarityFn = dyn Fn(&str, &str) -> f64 + Send + Sync;

pub fn exact_match_similarity(a: &str, b: &str) -> f64 {
    if normalize(a) == normalize(b) {
        1.0
    } else {
        0.0
    }
}

fn normalize(content: &str) -> String {
    content.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

#[derive(Debug, Clone)]
pub struct DuplicatePair {
    pub first: Fact,
    pub second: Fact,
    pub score: f64,
}

pub struct MaintenanceScanner {
    facts: Arc<FactStore>,
    collections: Arc<Collections>,
}

impl MaintenanceScanner {
    pub fn new(facts: Arc<FactStore>, collections: Arc<Collections>) -> Self {
        Self { facts, collections }
    }

    /// Facts whose owning character or conversation no longer resolves.
    pub async fn find_orphans(&self) -> Result<Vec<Fact>> {
        let live_characters = self.live_ids(CHARACTERS_KEY).await?;
        let live_conversations = self.live_ids(CONVERSATIONS_KEY).await?;

        let mut orphans = Vec::new();
        for shard_key in self.facts.shard_keys().await? {
            for fact in self.facts.facts_in_shard(&shard_key).await? {
                let orphaned = match fact.scope {
                    FactScope::Global => false,
                    FactScope::Character => fact
                        .character_id
                        .as_ref()
                        .map_or(true, |id| !live_characters.contains(id)),
                    FactScope::Conversation => fact
                        .conversation_id
                        .as_ref()
                        .map_or(true, |id| !live_conversations.contains(id)),
                };
                if orphaned {
                    orphans.push(fact);
                }
            }
        }
        if !orphans.is_empty() {
            tracing::info!(count = orphans.len(), "orphaned facts found");
        }
        Ok(orphans)
    }

    /// Candidate duplicate pairs within the same scope/owner. Facts from
    /// different owners are never compared — the same detail learned about
    /// two characters is not a duplicate.
    pub async fn find_duplicates(
        &self,
        similarity: &SimilarityFn,
        threshold: f64,
    ) -> Result<Vec<DuplicatePair>> {
        let mut pairs = Vec::new();
        for shard_key in self.facts.shard_keys().await? {
            let shard = self.facts.facts_in_shard(&shard_key).await?;
            for i in 0..shard.len() {
                for j in (i + 1)..shard.len() {
                    let score = similarity(&shard[i].content, &shard[j].content);
                    if score >= threshold {
                        pairs.push(DuplicatePair {
                            first: shard[i].clone(),
                            second: shard[j].clone(),
                            score,
                        });
                    }
                }
            }
        }
        Ok(pairs)
    }

    async fn live_ids(&self, collection_key: &str) -> Result<HashSet<String>> {
        Ok(self
            .collections
            .list(collection_key)
            .await?
            .iter()
            .filter_map(|r| record_id(r).map(String::from))
            .collect())
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::aggregator::FactCache;
    use crate::facts::FactOwner;
    use crate::store::{KvStore, MemoryKvStore};
    use serde_json::json;

    fn setup() -> (Arc<FactStore>, Arc<Collections>, MaintenanceScanner) {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let facts = Arc::new(FactStore::new(
            Arc::clone(&store),
            Arc::new(FactCache::new()),
        ));
        let collections = Arc::new(Collections::new(store));
        let scanner = MaintenanceScanner::new(Arc::clone(&facts), Arc::clone(&collections));
        (facts, collections, scanner)
    }

    #[tokio::test]
    async fn orphan_detection_flags_only_dead_owners() {
        let (facts, collections, scanner) = setup();
        collections
            .insert(CHARACTERS_KEY, json!({ "id": "char-1", "name": "Mira" }))
            .await
            .unwrap();

        facts
            .create_fact(
                "alive",
                FactOwner::Character {
                    id: "char-1".into(),
                    name: None,
                },
            )
            .await
            .unwrap();
        let ghost = facts
            .create_fact(
                "haunted",
                FactOwner::Character {
                    id: "ghost".into(),
                    name: None,
                },
            )
            .await
            .unwrap();
        facts.create_fact("global", FactOwner::Global).await.unwrap();

        let orphans = scanner.find_orphans().await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, ghost.id);
    }

    #[tokio::test]
    async fn duplicates_only_pair_within_one_shard() {
        let (facts, _, scanner) = setup();
        facts
            .create_fact("User's name is Boris", FactOwner::Global)
            .await
            .unwrap();
        facts
            .create_fact("user's  name is  boris", FactOwner::Global)
            .await
            .unwrap();
        // Same content under a different owner is not a duplicate.
        facts
            .create_fact(
                "User's name is Boris",
                FactOwner::Character {
                    id: "char-1".into(),
                    name: None,
                },
            )
            .await
            .unwrap();

        let pairs = scanner
            .find_duplicates(&exact_match_similarity, 0.99)
            .await
            .unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].score, 1.0);
    }

    #[tokio::test]
    async fn injected_comparator_drives_the_threshold() {
        let (facts, _, scanner) = setup();
        facts
            .create_fact("likes green tea", FactOwner::Global)
            .await
            .unwrap();
        facts
            .create_fact("likes black tea", FactOwner::Global)
            .await
            .unwrap();

        // Toy comparator: shared-word ratio.
        let overlap = |a: &str, b: &str| {
            let left: HashSet<&str> = a.split_whitespace().collect();
            let right: HashSet<&str> = b.split_whitespace().collect();
            left.intersection(&right).count() as f64 / left.union(&right).count() as f64
        };

        let pairs = scanner.find_duplicates(&overlap, 0.4).await.unwrap();
        assert_eq!(pairs.len(), 1);
        assert!(pairs[0].score > 0.4);
    }

    #[tokio::test]
    async fn flagged_orphans_delete_through_the_normal_path() {
        let (facts, _, scanner) = setup();
        facts
            .create_fact(
                "haunted",
                FactOwner::Conversation {
                    id: "gone".into(),
                    preview: None,
                },
            )
            .await
            .unwrap();

        let orphans = scanner.find_orphans().await.unwrap();
        for orphan in &orphans {
            facts.delete_fact(&orphan.id).await.unwrap();
        }
        assert!(scanner.find_orphans().await.unwrap().is_empty());
        assert!(facts.all_facts().await.unwrap().is_empty());
    }
}
