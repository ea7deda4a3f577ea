//! Sharded fact storage.
//!
//! Facts ("memories") are atomic pieces of learned knowledge. Each shard is
//! one key in the substrate holding the facts for one scope/owner: global
//! facts under a fixed key, character and conversation facts under keys
//! namespaced by owner id. Enumerating one owner is a single lookup; global
//! enumeration walks the fact keyspace.

pub mod aggregator;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::facts::aggregator::FactCache;
use crate::store::KvStore;

pub const GLOBAL_FACTS_KEY: &str = "facts:global";
pub const CHARACTER_FACTS_PREFIX: &str = "facts:character:";
pub const CONVERSATION_FACTS_PREFIX: &str = "facts:conversation:";

/// Secondary id -> shard-key index, maintained alongside every write so
/// update/delete usually skip the full keyspace scan.
const FACT_INDEX_KEY: &str = "facts:index";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactScope {
    Global,
    Character,
    Conversation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub scope: FactScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_preview: Option<String>,
}

impl Fact {
    /// Exactly one of {no owner, character_id, conversation_id} must be
    /// populated, matching the scope.
    pub fn ownership_valid(&self) -> bool {
        match self.scope {
            FactScope::Global => self.character_id.is_none() && self.conversation_id.is_none(),
            FactScope::Character => self.character_id.is_some() && self.conversation_id.is_none(),
            FactScope::Conversation => {
                self.conversation_id.is_some() && self.character_id.is_none()
            }
        }
    }
}

/// Who a new fact belongs to. Scope is derived from the owner, so a fact
/// violating the ownership invariant cannot be constructed.
#[derive(Debug, Clone)]
pub enum FactOwner {
    Global,
    Character {
        id: String,
        name: Option<String>,
    },
    Conversation {
        id: String,
        preview: Option<String>,
    },
}

impl FactOwner {
    fn shard_key(&self) -> String {
        match self {
            FactOwner::Global => GLOBAL_FACTS_KEY.to_string(),
            FactOwner::Character { id, .. } => format!("{CHARACTER_FACTS_PREFIX}{id}"),
            FactOwner::Conversation { id, .. } => format!("{CONVERSATION_FACTS_PREFIX}{id}"),
        }
    }
}

pub fn is_fact_shard_key(key: &str) -> bool {
    key == GLOBAL_FACTS_KEY
        || key.starts_with(CHARACTER_FACTS_PREFIX)
        || key.starts_with(CONVERSATION_FACTS_PREFIX)
}

pub struct FactStore {
    store: Arc<dyn KvStore>,
    cache: Arc<FactCache>,
    /// Single-writer queue. The locate-then-overwrite sequence is not atomic
    /// against interleaved writers, so all mutations serialize here.
    write_lock: Mutex<()>,
}

impl FactStore {
    pub fn new(store: Arc<dyn KvStore>, cache: Arc<FactCache>) -> Self {
        Self {
            store,
            cache,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn create_fact(&self, content: &str, owner: FactOwner) -> Result<Fact> {
        self.create_fact_with_id(Uuid::new_v4().to_string(), content, owner)
            .await
    }

    /// Create a fact under a caller-supplied stable id.
    pub async fn create_fact_with_id(
        &self,
        id: String,
        content: &str,
        owner: FactOwner,
    ) -> Result<Fact> {
        let fact = match &owner {
            FactOwner::Global => Fact {
                id,
                content: content.to_string(),
                timestamp: Utc::now(),
                scope: FactScope::Global,
                character_id: None,
                character_name: None,
                conversation_id: None,
                conversation_preview: None,
            },
            FactOwner::Character { id: owner_id, name } => Fact {
                id,
                content: content.to_string(),
                timestamp: Utc::now(),
                scope: FactScope::Character,
                character_id: Some(owner_id.clone()),
                character_name: name.clone(),
                conversation_id: None,
                conversation_preview: None,
            },
            FactOwner::Conversation {
                id: owner_id,
                preview,
            } => Fact {
                id,
                content: content.to_string(),
                timestamp: Utc::now(),
                scope: FactScope::Conversation,
                character_id: None,
                character_name: None,
                conversation_id: Some(owner_id.clone()),
                conversation_preview: preview.clone(),
            },
        };

        let _guard = self.write_lock.lock().await;
        // A fact id is unique across shards; a second create under the same
        // id would leave update/delete touching only the first copy.
        if self.locate(&fact.id).await.is_ok() {
            return Err(EngineError::Validation(format!(
                "fact {} already exists",
                fact.id
            )));
        }
        let shard_key = owner.shard_key();
        let mut shard = self.read_shard(&shard_key).await?;
        shard.push(fact.clone());
        self.write_shard(&shard_key, &shard).await?;
        self.index_insert(&fact.id, &shard_key).await?;
        self.cache.append(fact.clone()).await;
        tracing::debug!(fact_id = %fact.id, shard = %shard_key, "fact created");
        Ok(fact)
    }

    pub async fn update_fact(&self, id: &str, content: &str) -> Result<Fact> {
        let _guard = self.write_lock.lock().await;
        let (shard_key, mut shard, position) = self.locate(id).await?;
        let fact = &mut shard[position];
        fact.content = content.to_string();
        fact.timestamp = Utc::now();
        let updated = fact.clone();
        self.write_shard(&shard_key, &shard).await?;
        self.cache.replace_by_id(updated.clone()).await;
        tracing::debug!(fact_id = %id, shard = %shard_key, "fact updated");
        Ok(updated)
    }

    pub async fn delete_fact(&self, id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let (shard_key, mut shard, position) = self.locate(id).await?;
        shard.remove(position);
        if shard.is_empty() {
            self.store
                .delete(&shard_key)
                .await
                .map_err(EngineError::StoreUnavailable)?;
        } else {
            self.write_shard(&shard_key, &shard).await?;
        }
        self.index_remove(id).await?;
        self.cache.remove_by_id(id).await;
        tracing::debug!(fact_id = %id, shard = %shard_key, "fact deleted");
        Ok(())
    }

    pub async fn get_fact(&self, id: &str) -> Result<Fact> {
        let (_, shard, position) = self.locate(id).await?;
        Ok(shard[position].clone())
    }

    /// Every fact across every shard. Used by the aggregator and the
    /// maintenance scanner; ordering follows key order, not recency.
    pub async fn all_facts(&self) -> Result<Vec<Fact>> {
        let mut facts = Vec::new();
        for key in self.shard_keys().await? {
            facts.extend(self.read_shard(&key).await?);
        }
        Ok(facts)
    }

    /// Contents of one shard. Each read is self-contained, so callers can
    /// walk the keyspace and stop between shards.
    pub async fn facts_in_shard(&self, shard_key: &str) -> Result<Vec<Fact>> {
        self.read_shard(shard_key).await
    }

    pub async fn shard_keys(&self) -> Result<Vec<String>> {
        let keys = self
            .store
            .keys()
            .await
            .map_err(EngineError::StoreUnavailable)?;
        Ok(keys.into_iter().filter(|k| is_fact_shard_key(k)).collect())
    }

    /// Find the shard holding `id`. The index is consulted first; a miss
    /// (or stale entry) falls back to scanning every fact shard, stopping at
    /// the first one containing the id. A fact is unique across shards, so
    /// scanning past the first hit would only mask a data-integrity bug.
    async fn locate(&self, id: &str) -> Result<(String, Vec<Fact>, usize)> {
        let index = self.read_index().await?;
        if let Some(shard_key) = index.get(id) {
            let shard = self.read_shard(shard_key).await?;
            if let Some(position) = shard.iter().position(|f| f.id == id) {
                return Ok((shard_key.clone(), shard, position));
            }
            tracing::warn!(fact_id = %id, shard = %shard_key, "stale fact index entry, rescanning");
        }

        for shard_key in self.shard_keys().await? {
            let shard = self.read_shard(&shard_key).await?;
            if let Some(position) = shard.iter().position(|f| f.id == id) {
                return Ok((shard_key, shard, position));
            }
        }
        Err(EngineError::NotFound(format!("fact {id}")))
    }

    async fn read_shard(&self, key: &str) -> Result<Vec<Fact>> {
        Ok(self
            .store
            .get_json::<Vec<Fact>>(key)
            .await
            .map_err(EngineError::StoreUnavailable)?
            .unwrap_or_default())
    }

    async fn write_shard(&self, key: &str, facts: &[Fact]) -> Result<()> {
        self.store
            .set_json(key, &facts)
            .await
            .map_err(EngineError::StoreUnavailable)
    }

    async fn read_index(&self) -> Result<HashMap<String, String>> {
        Ok(self
            .store
            .get_json::<HashMap<String, String>>(FACT_INDEX_KEY)
            .await
            .map_err(EngineError::StoreUnavailable)?
            .unwrap_or_default())
    }

    async fn index_insert(&self, id: &str, shard_key: &str) -> Result<()> {
        let mut index = self.read_index().await?;
        index.insert(id.to_string(), shard_key.to_string());
        self.store
            .set_json(FACT_INDEX_KEY, &index)
            .await
            .map_err(EngineError::StoreUnavailable)
    }

    async fn index_remove(&self, id: &str) -> Result<()> {
        let mut index = self.read_index().await?;
        if index.remove(id).is_some() {
            self.store
                .set_json(FACT_INDEX_KEY, &index)
                .await
                .map_err(EngineError::StoreUnavailable)?;
        }
        Ok(())
    }
}
