//! Applies reviewer decisions to the knowledge base.
//!
//! A rejection only touches the proposal's own status. An approval runs
//! validate -> mutate target -> flip status, in that order, so an
//! interruption leaves the proposal Pending with the target either
//! untouched or fully written — re-presenting the proposal is always a safe
//! recovery. Approving an already-resolved proposal fails, so no effect can
//! land twice.

use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::collections::{self, record_id, Collections};
use crate::error::{EngineError, Result};
use crate::facts::{FactOwner, FactStore};
use crate::proposals::{
    OwnerRef, Proposal, ProposalAction, ProposalKind, ProposalStatus, Reflection, ReflectionStore,
};

pub const NO_OP_REJECTION_REASON: &str =
    "auto-rejected: edit would not change the target's current state";
pub const OWNER_DELETED_REASON: &str = "auto-rejected: owning record was deleted";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Target mutated and proposal marked Approved.
    Applied { target_id: Option<String> },
    /// Stale no-op edit; proposal auto-rejected, target untouched.
    AutoRejected { reason: String },
}

#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub proposal_id: String,
    pub kind: ProposalKind,
    pub action: ProposalAction,
    pub outcome: ApplyOutcome,
}

pub struct Reconciler {
    facts: Arc<FactStore>,
    collections: Arc<Collections>,
    reflections: Arc<ReflectionStore>,
    /// Serializes the pending-check, target mutation and status flip.
    /// Without it two interleaved approvals of one proposal both pass the
    /// pending check and the target mutates twice.
    apply_lock: Mutex<()>,
}

impl Reconciler {
    pub fn new(
        facts: Arc<FactStore>,
        collections: Arc<Collections>,
        reflections: Arc<ReflectionStore>,
    ) -> Self {
        Self {
            facts,
            collections,
            reflections,
            apply_lock: Mutex::new(()),
        }
    }

    /// Approve a pending proposal and apply it to its target store.
    pub async fn approve(&self, proposal_id: &str) -> Result<ApplyReport> {
        let _guard = self.apply_lock.lock().await;
        let (reflection, proposal) = self.reflections.find_proposal(proposal_id).await?;
        if !proposal.is_pending() {
            return Err(EngineError::AlreadyResolved(proposal_id.to_string()));
        }
        // Ingestion already vetted the proposal, but approval is the only
        // path that mutates targets, so it re-checks the matrix.
        proposal.validate()?;

        match self.apply_target(&reflection, &proposal).await {
            Ok(target_id) => {
                self.reflections
                    .set_status(proposal_id, ProposalStatus::Approved, None)
                    .await?;
                tracing::info!(
                    proposal_id,
                    kind = proposal.kind.label(),
                    action = ?proposal.action,
                    "proposal applied"
                );
                Ok(ApplyReport {
                    proposal_id: proposal_id.to_string(),
                    kind: proposal.kind,
                    action: proposal.action,
                    outcome: ApplyOutcome::Applied { target_id },
                })
            }
            Err(EngineError::NoOpEdit) => {
                self.reflections
                    .set_status(
                        proposal_id,
                        ProposalStatus::Rejected,
                        Some(NO_OP_REJECTION_REASON.to_string()),
                    )
                    .await?;
                tracing::warn!(proposal_id, "no-op edit auto-rejected");
                Ok(ApplyReport {
                    proposal_id: proposal_id.to_string(),
                    kind: proposal.kind,
                    action: proposal.action,
                    outcome: ApplyOutcome::AutoRejected {
                        reason: NO_OP_REJECTION_REASON.to_string(),
                    },
                })
            }
            // Target untouched, proposal stays Pending, caller may retry.
            Err(error) => Err(error),
        }
    }

    /// Reject a pending proposal. Never touches target data.
    pub async fn reject(&self, proposal_id: &str, reason: Option<String>) -> Result<()> {
        self.reflections
            .set_status(proposal_id, ProposalStatus::Rejected, reason)
            .await?;
        tracing::info!(proposal_id, "proposal rejected");
        Ok(())
    }

    /// Closed dispatch table: every proposal kind binds to exactly one
    /// target store. Returns the id of the touched record where one exists.
    async fn apply_target(
        &self,
        reflection: &Reflection,
        proposal: &Proposal,
    ) -> Result<Option<String>> {
        match proposal.kind {
            ProposalKind::Memory => self.apply_memory(reflection, proposal).await,
            ProposalKind::LorebookEntry => self.apply_lorebook_entry(proposal).await,
            ProposalKind::AppSetting => self.apply_app_setting(proposal).await,
            ProposalKind::InstructionalPrompt => {
                let content = required(&proposal.content, "content")?;
                if self.collections.instructional_prompt().await?.as_deref() == Some(content) {
                    return Err(EngineError::NoOpEdit);
                }
                self.collections.set_instructional_prompt(content).await?;
                Ok(None)
            }
            ProposalKind::StylePreference => self.apply_style_preference(reflection, proposal).await,
            ProposalKind::Lorebook
            | ProposalKind::Character
            | ProposalKind::Persona
            | ProposalKind::Prompt
            | ProposalKind::Conversation
            | ProposalKind::Item
            | ProposalKind::World => self.apply_collection_record(proposal).await,
        }
    }

    async fn apply_memory(
        &self,
        reflection: &Reflection,
        proposal: &Proposal,
    ) -> Result<Option<String>> {
        match proposal.action {
            ProposalAction::Add => {
                let content = required(&proposal.content, "content")?;
                let scope = proposal
                    .scope
                    .ok_or_else(|| EngineError::Validation("memory add requires scope".into()))?;
                let owner = match scope {
                    crate::facts::FactScope::Global => FactOwner::Global,
                    crate::facts::FactScope::Character => FactOwner::Character {
                        id: reflection.character_id.clone(),
                        name: Some(reflection.character_name.clone()),
                    },
                    crate::facts::FactScope::Conversation => FactOwner::Conversation {
                        id: reflection.conversation_id.clone(),
                        preview: Some(reflection.conversation_preview.clone()),
                    },
                };
                // A supplied id is kept stable; otherwise one is minted.
                let fact = match &proposal.target_id {
                    Some(id) => {
                        self.facts
                            .create_fact_with_id(id.clone(), content, owner)
                            .await?
                    }
                    None => self.facts.create_fact(content, owner).await?,
                };
                Ok(Some(fact.id))
            }
            ProposalAction::Edit => {
                let target_id = required(&proposal.target_id, "target_id")?;
                let content = required(&proposal.content, "content")?;
                let current = self.facts.get_fact(target_id).await?;
                if current.content == *content {
                    return Err(EngineError::NoOpEdit);
                }
                let updated = self.facts.update_fact(target_id, content).await?;
                Ok(Some(updated.id))
            }
            ProposalAction::Delete => {
                let target_id = required(&proposal.target_id, "target_id")?;
                self.facts.delete_fact(target_id).await?;
                Ok(Some(target_id.clone()))
            }
        }
    }

    async fn apply_lorebook_entry(&self, proposal: &Proposal) -> Result<Option<String>> {
        match proposal.action {
            ProposalAction::Add => {
                let lorebook_id = required(&proposal.lorebook_id, "lorebook_id")?;
                let content = required(&proposal.content, "content")?;
                let lorebook = self
                    .collections
                    .find(collections::LOREBOOKS_KEY, lorebook_id)
                    .await?
                    .ok_or_else(|| EngineError::NotFound(format!("lorebook {lorebook_id}")))?;

                let mut entries = entries_of(&lorebook);
                let entry_id = Uuid::new_v4().to_string();
                entries.push(json!({
                    "id": entry_id.clone(),
                    "content": content,
                    "keywords": proposal.keywords.clone().unwrap_or_default(),
                }));
                self.write_entries(lorebook_id, entries).await?;
                Ok(Some(entry_id))
            }
            ProposalAction::Edit => {
                let entry_id = required(&proposal.target_id, "target_id")?;
                let (lorebook_id, mut entries, position) =
                    self.locate_entry(proposal, entry_id).await?;

                let entry = entries[position]
                    .as_object()
                    .cloned()
                    .unwrap_or_default();
                let same_content = proposal
                    .content
                    .as_ref()
                    .map_or(true, |c| entry.get("content") == Some(&json!(c)));
                let same_keywords = proposal
                    .keywords
                    .as_ref()
                    .map_or(true, |k| entry.get("keywords") == Some(&json!(k)));
                if same_content && same_keywords {
                    return Err(EngineError::NoOpEdit);
                }

                let mut updated = entry;
                if let Some(content) = &proposal.content {
                    updated.insert("content".to_string(), json!(content));
                }
                if let Some(keywords) = &proposal.keywords {
                    updated.insert("keywords".to_string(), json!(keywords));
                }
                entries[position] = Value::Object(updated);
                self.write_entries(&lorebook_id, entries).await?;
                Ok(Some(entry_id.clone()))
            }
            ProposalAction::Delete => {
                let entry_id = required(&proposal.target_id, "target_id")?;
                let (lorebook_id, mut entries, position) =
                    self.locate_entry(proposal, entry_id).await?;
                entries.remove(position);
                self.write_entries(&lorebook_id, entries).await?;
                Ok(Some(entry_id.clone()))
            }
        }
    }

    /// Find the lorebook holding `entry_id`. With a lorebook_id on the
    /// proposal this is a direct lookup; without one, every lorebook is
    /// scanned, stopping at the first hit.
    async fn locate_entry(
        &self,
        proposal: &Proposal,
        entry_id: &str,
    ) -> Result<(String, Vec<Value>, usize)> {
        let lorebooks = match &proposal.lorebook_id {
            Some(id) => vec![self
                .collections
                .find(collections::LOREBOOKS_KEY, id)
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("lorebook {id}")))?],
            None => self.collections.list(collections::LOREBOOKS_KEY).await?,
        };
        for lorebook in lorebooks {
            let entries = entries_of(&lorebook);
            if let Some(position) = entries
                .iter()
                .position(|e| record_id(e) == Some(entry_id))
            {
                let lorebook_id = record_id(&lorebook)
                    .ok_or_else(|| {
                        EngineError::Validation("lorebook record missing id".to_string())
                    })?
                    .to_string();
                return Ok((lorebook_id, entries, position));
            }
        }
        Err(EngineError::NotFound(format!("lorebook entry {entry_id}")))
    }

    async fn write_entries(&self, lorebook_id: &str, entries: Vec<Value>) -> Result<()> {
        let patch = Map::from_iter([("entries".to_string(), Value::Array(entries))]);
        self.collections
            .merge_fields(collections::LOREBOOKS_KEY, lorebook_id, &patch)
            .await?;
        Ok(())
    }

    async fn apply_app_setting(&self, proposal: &Proposal) -> Result<Option<String>> {
        let key = required(&proposal.key, "key")?;
        match proposal.action {
            ProposalAction::Add | ProposalAction::Edit => {
                let value = proposal
                    .value
                    .clone()
                    .ok_or_else(|| EngineError::Validation("app_setting requires value".into()))?;
                if self.collections.get_setting(key).await?.as_ref() == Some(&value) {
                    return Err(EngineError::NoOpEdit);
                }
                self.collections.set_setting(key, value).await?;
            }
            ProposalAction::Delete => self.collections.remove_setting(key).await?,
        }
        Ok(Some(key.clone()))
    }

    async fn apply_style_preference(
        &self,
        reflection: &Reflection,
        proposal: &Proposal,
    ) -> Result<Option<String>> {
        match proposal.action {
            ProposalAction::Add => {
                let content = required(&proposal.content, "content")?;
                let id = Uuid::new_v4().to_string();
                self.collections
                    .insert(
                        collections::STYLE_PREFERENCES_KEY,
                        json!({
                            "id": id.clone(),
                            "content": content,
                            "timestamp": chrono::Utc::now(),
                            "character_name": reflection.character_name,
                        }),
                    )
                    .await?;
                Ok(Some(id))
            }
            ProposalAction::Edit => {
                let target_id = required(&proposal.target_id, "target_id")?;
                let content = required(&proposal.content, "content")?;
                let current = self
                    .collections
                    .find(collections::STYLE_PREFERENCES_KEY, target_id)
                    .await?
                    .ok_or_else(|| {
                        EngineError::NotFound(format!("style preference {target_id}"))
                    })?;
                if current.get("content") == Some(&json!(content)) {
                    return Err(EngineError::NoOpEdit);
                }
                let patch = Map::from_iter([("content".to_string(), json!(content))]);
                self.collections
                    .merge_fields(collections::STYLE_PREFERENCES_KEY, target_id, &patch)
                    .await?;
                Ok(Some(target_id.clone()))
            }
            ProposalAction::Delete => {
                let target_id = required(&proposal.target_id, "target_id")?;
                self.collections
                    .remove(collections::STYLE_PREFERENCES_KEY, target_id)
                    .await?;
                Ok(Some(target_id.clone()))
            }
        }
    }

    async fn apply_collection_record(&self, proposal: &Proposal) -> Result<Option<String>> {
        let collection_key = collection_key_for(proposal.kind).ok_or_else(|| {
            EngineError::Validation(format!("{} has no collection", proposal.kind.label()))
        })?;
        match proposal.action {
            ProposalAction::Add => {
                let fields = proposal
                    .updated_fields
                    .clone()
                    .filter(|f| !f.is_empty())
                    .ok_or_else(|| {
                        EngineError::Validation("add requires non-empty updated_fields".into())
                    })?;
                let id = proposal
                    .target_id
                    .clone()
                    .unwrap_or_else(|| Uuid::new_v4().to_string());
                let mut record = fields;
                record.insert("id".to_string(), json!(id));
                record.insert("created_at".to_string(), json!(chrono::Utc::now()));
                self.collections
                    .insert(collection_key, Value::Object(record))
                    .await?;
                Ok(Some(id))
            }
            ProposalAction::Edit => {
                let target_id = required(&proposal.target_id, "target_id")?;
                let patch = proposal.updated_fields.as_ref().ok_or_else(|| {
                    EngineError::Validation("edit requires updated_fields".into())
                })?;
                let current = self
                    .collections
                    .find(collection_key, target_id)
                    .await?
                    .ok_or_else(|| {
                        EngineError::NotFound(format!("{collection_key}/{target_id}"))
                    })?;
                if patch_is_noop(&current, patch) {
                    return Err(EngineError::NoOpEdit);
                }
                self.collections
                    .merge_fields(collection_key, target_id, patch)
                    .await?;
                Ok(Some(target_id.clone()))
            }
            ProposalAction::Delete => {
                let target_id = required(&proposal.target_id, "target_id")?;
                self.collections.remove(collection_key, target_id).await?;
                // A deleted owner leaves pending proposals with nowhere to
                // land; cascade-reject them rather than strand them.
                match proposal.kind {
                    ProposalKind::Character => {
                        self.reflections
                            .reject_pending_for_owner(
                                OwnerRef::Character(target_id),
                                OWNER_DELETED_REASON,
                                Some(&proposal.id),
                            )
                            .await?;
                    }
                    ProposalKind::Conversation => {
                        self.reflections
                            .reject_pending_for_owner(
                                OwnerRef::Conversation(target_id),
                                OWNER_DELETED_REASON,
                                Some(&proposal.id),
                            )
                            .await?;
                    }
                    _ => {}
                }
                Ok(Some(target_id.clone()))
            }
        }
    }
}

fn entries_of(lorebook: &Value) -> Vec<Value> {
    lorebook
        .get("entries")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn collection_key_for(kind: ProposalKind) -> Option<&'static str> {
    match kind {
        ProposalKind::Lorebook => Some(collections::LOREBOOKS_KEY),
        ProposalKind::Character => Some(collections::CHARACTERS_KEY),
        ProposalKind::Persona => Some(collections::PERSONAS_KEY),
        ProposalKind::Prompt => Some(collections::PROMPTS_KEY),
        ProposalKind::Conversation => Some(collections::CONVERSATIONS_KEY),
        ProposalKind::Item => Some(collections::ITEMS_KEY),
        ProposalKind::World => Some(collections::WORLDS_KEY),
        // Memory, lorebook entries, settings, the instructional prompt and
        // style preferences all dispatch to their own apply paths.
        ProposalKind::Memory
        | ProposalKind::LorebookEntry
        | ProposalKind::AppSetting
        | ProposalKind::InstructionalPrompt
        | ProposalKind::StylePreference => None,
    }
}

/// A patch that repeats the record's current values changes nothing; such a
/// stale proposal slipped past the author-side redundancy filter and must be
/// rejected, not applied.
fn patch_is_noop(current: &Value, patch: &Map<String, Value>) -> bool {
    patch.is_empty() || patch.iter().all(|(key, value)| current.get(key) == Some(value))
}

fn required<'a>(field: &'a Option<String>, name: &str) -> Result<&'a String> {
    field
        .as_ref()
        .ok_or_else(|| EngineError::Validation(format!("missing {name}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::aggregator::FactCache;
    use crate::proposals::IncomingReflection;
    use crate::store::{KvStore, MemoryKvStore};

    struct Harness {
        facts: Arc<FactStore>,
        collections: Arc<Collections>,
        reflections: Arc<ReflectionStore>,
        reconciler: Reconciler,
    }

    fn harness() -> Harness {
        harness_over(Arc::new(MemoryKvStore::new()))
    }

    fn harness_over(store: Arc<dyn KvStore>) -> Harness {
        let facts = Arc::new(FactStore::new(
            Arc::clone(&store),
            Arc::new(FactCache::new()),
        ));
        let collections = Arc::new(Collections::new(Arc::clone(&store)));
        let reflections = Arc::new(ReflectionStore::new(Arc::clone(&store)));
        let reconciler = Reconciler::new(
            Arc::clone(&facts),
            Arc::clone(&collections),
            Arc::clone(&reflections),
        );
        Harness {
            facts,
            collections,
            reflections,
            reconciler,
        }
    }

    fn base_proposal(kind: ProposalKind, action: ProposalAction) -> Proposal {
        Proposal {
            id: String::new(),
            kind,
            action,
            rationale: "test".to_string(),
            target_id: None,
            content: None,
            keywords: None,
            lorebook_id: None,
            scope: None,
            updated_fields: None,
            key: None,
            value: None,
            status: ProposalStatus::Pending,
            rejection_reason: None,
        }
    }

    async fn ingest_one(h: &Harness, proposal: Proposal) -> String {
        let stored = h
            .reflections
            .ingest(IncomingReflection {
                conversation_id: "conv-1".to_string(),
                conversation_preview: "At the harbor".to_string(),
                character_id: "char-1".to_string(),
                character_name: "Mira".to_string(),
                thoughts: "…".to_string(),
                proposals: vec![proposal],
            })
            .await
            .unwrap();
        stored.proposals[0].id.clone()
    }

    #[tokio::test]
    async fn approved_memory_add_lands_in_the_character_shard() {
        let h = harness();
        let mut p = base_proposal(ProposalKind::Memory, ProposalAction::Add);
        p.content = Some("afraid of storms".to_string());
        p.scope = Some(crate::facts::FactScope::Character);
        let id = ingest_one(&h, p).await;

        let report = h.reconciler.approve(&id).await.unwrap();
        let target_id = match report.outcome {
            ApplyOutcome::Applied { target_id } => target_id.unwrap(),
            other => panic!("unexpected outcome: {other:?}"),
        };

        let fact = h.facts.get_fact(&target_id).await.unwrap();
        assert_eq!(fact.character_id.as_deref(), Some("char-1"));
        assert_eq!(fact.character_name.as_deref(), Some("Mira"));
    }

    #[tokio::test]
    async fn approval_is_at_most_once() {
        let h = harness();
        let mut p = base_proposal(ProposalKind::Memory, ProposalAction::Add);
        p.content = Some("User's name is Boris".to_string());
        p.scope = Some(crate::facts::FactScope::Global);
        let id = ingest_one(&h, p).await;

        h.reconciler.approve(&id).await.unwrap();
        let err = h.reconciler.approve(&id).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyResolved(_)));

        // The fact landed exactly once.
        assert_eq!(h.facts.all_facts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn strictly_equal_edit_is_auto_rejected_as_noop() {
        let h = harness();
        h.collections
            .insert(
                collections::CHARACTERS_KEY,
                json!({ "id": "char-1", "appearance": "wears a blue shirt" }),
            )
            .await
            .unwrap();

        let mut p = base_proposal(ProposalKind::Character, ProposalAction::Edit);
        p.target_id = Some("char-1".to_string());
        p.updated_fields = Some(Map::from_iter([(
            "appearance".to_string(),
            json!("wears a blue shirt"),
        )]));
        let id = ingest_one(&h, p).await;

        let report = h.reconciler.approve(&id).await.unwrap();
        assert!(matches!(report.outcome, ApplyOutcome::AutoRejected { .. }));

        let (_, proposal) = h.reflections.find_proposal(&id).await.unwrap();
        assert_eq!(proposal.status, ProposalStatus::Rejected);
        assert_eq!(
            proposal.rejection_reason.as_deref(),
            Some(NO_OP_REJECTION_REASON)
        );

        // Target untouched.
        let record = h
            .collections
            .find(collections::CHARACTERS_KEY, "char-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record["appearance"], json!("wears a blue shirt"));
    }

    #[tokio::test]
    async fn edit_merge_preserves_unrelated_fields() {
        let h = harness();
        h.collections
            .insert(
                collections::CHARACTERS_KEY,
                json!({ "id": "char-1", "name": "Mira", "appearance": "wears a blue shirt" }),
            )
            .await
            .unwrap();

        let mut p = base_proposal(ProposalKind::Character, ProposalAction::Edit);
        p.target_id = Some("char-1".to_string());
        p.updated_fields = Some(Map::from_iter([(
            "appearance".to_string(),
            json!("wears a blue shirt and a red hat"),
        )]));
        let id = ingest_one(&h, p).await;
        h.reconciler.approve(&id).await.unwrap();

        let record = h
            .collections
            .find(collections::CHARACTERS_KEY, "char-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record["name"], json!("Mira"));
        assert_eq!(
            record["appearance"],
            json!("wears a blue shirt and a red hat")
        );
    }

    #[tokio::test]
    async fn missing_edit_target_leaves_proposal_pending() {
        let h = harness();
        let mut p = base_proposal(ProposalKind::Persona, ProposalAction::Edit);
        p.target_id = Some("ghost".to_string());
        p.updated_fields = Some(Map::from_iter([("bio".to_string(), json!("sailor"))]));
        let id = ingest_one(&h, p).await;

        let err = h.reconciler.approve(&id).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));

        let (_, proposal) = h.reflections.find_proposal(&id).await.unwrap();
        assert_eq!(proposal.status, ProposalStatus::Pending);
    }

    #[tokio::test]
    async fn delete_of_missing_fact_is_not_silently_ignored() {
        let h = harness();
        let mut p = base_proposal(ProposalKind::Memory, ProposalAction::Delete);
        p.target_id = Some("ghost-fact".to_string());
        let id = ingest_one(&h, p).await;

        let err = h.reconciler.approve(&id).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn lorebook_entry_add_and_edit() {
        let h = harness();
        h.collections
            .insert(
                collections::LOREBOOKS_KEY,
                json!({ "id": "lb-1", "name": "Harbor lore", "entries": [] }),
            )
            .await
            .unwrap();

        let mut add = base_proposal(ProposalKind::LorebookEntry, ProposalAction::Add);
        add.lorebook_id = Some("lb-1".to_string());
        add.content = Some("The lighthouse keeper is blind.".to_string());
        add.keywords = Some(vec!["lighthouse".to_string()]);
        let add_id = ingest_one(&h, add).await;
        let report = h.reconciler.approve(&add_id).await.unwrap();
        let entry_id = match report.outcome {
            ApplyOutcome::Applied { target_id } => target_id.unwrap(),
            other => panic!("unexpected outcome: {other:?}"),
        };

        // Edit without naming the lorebook; the scan must find the entry.
        let mut edit = base_proposal(ProposalKind::LorebookEntry, ProposalAction::Edit);
        edit.target_id = Some(entry_id.clone());
        edit.content = Some("The lighthouse keeper only pretends to be blind.".to_string());
        let edit_id = ingest_one(&h, edit).await;
        h.reconciler.approve(&edit_id).await.unwrap();

        let lorebook = h
            .collections
            .find(collections::LOREBOOKS_KEY, "lb-1")
            .await
            .unwrap()
            .unwrap();
        let entries = lorebook["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(
            entries[0]["content"],
            json!("The lighthouse keeper only pretends to be blind.")
        );
        assert_eq!(entries[0]["keywords"], json!(["lighthouse"]));
    }

    #[tokio::test]
    async fn app_setting_write_and_noop() {
        let h = harness();
        let mut p = base_proposal(ProposalKind::AppSetting, ProposalAction::Add);
        p.key = Some("temperature".to_string());
        p.value = Some(json!(0.9));
        let id = ingest_one(&h, p.clone()).await;
        h.reconciler.approve(&id).await.unwrap();
        assert_eq!(
            h.collections.get_setting("temperature").await.unwrap(),
            Some(json!(0.9))
        );

        // Same value again: auto-rejected as a no-op.
        p.action = ProposalAction::Edit;
        let second = ingest_one(&h, p).await;
        let report = h.reconciler.approve(&second).await.unwrap();
        assert!(matches!(report.outcome, ApplyOutcome::AutoRejected { .. }));
    }

    #[tokio::test]
    async fn instructional_prompt_edit_replaces_single_record() {
        let h = harness();
        let mut p = base_proposal(ProposalKind::InstructionalPrompt, ProposalAction::Edit);
        p.content = Some("Prefer shorter replies.".to_string());
        let id = ingest_one(&h, p).await;
        h.reconciler.approve(&id).await.unwrap();

        assert_eq!(
            h.collections.instructional_prompt().await.unwrap().as_deref(),
            Some("Prefer shorter replies.")
        );
    }

    #[tokio::test]
    async fn character_delete_cascades_to_pending_proposals() {
        let h = harness();
        h.collections
            .insert(collections::CHARACTERS_KEY, json!({ "id": "char-1" }))
            .await
            .unwrap();

        // A second pending proposal bound to the same character.
        let mut orphan = base_proposal(ProposalKind::Memory, ProposalAction::Add);
        orphan.content = Some("afraid of storms".to_string());
        orphan.scope = Some(crate::facts::FactScope::Character);
        let orphan_id = ingest_one(&h, orphan).await;

        let mut delete = base_proposal(ProposalKind::Character, ProposalAction::Delete);
        delete.target_id = Some("char-1".to_string());
        let delete_id = ingest_one(&h, delete).await;

        h.reconciler.approve(&delete_id).await.unwrap();

        let (_, proposal) = h.reflections.find_proposal(&orphan_id).await.unwrap();
        assert_eq!(proposal.status, ProposalStatus::Rejected);
        assert_eq!(
            proposal.rejection_reason.as_deref(),
            Some(OWNER_DELETED_REASON)
        );
    }

    /// Yields before every store operation so two tasks interleave at each
    /// await point, the worst case for the approve sequence.
    struct YieldingStore {
        inner: MemoryKvStore,
    }

    #[async_trait::async_trait]
    impl KvStore for YieldingStore {
        async fn get(&self, key: &str) -> anyhow::Result<Option<Value>> {
            tokio::task::yield_now().await;
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: Value) -> anyhow::Result<()> {
            tokio::task::yield_now().await;
            self.inner.set(key, value).await
        }

        async fn keys(&self) -> anyhow::Result<Vec<String>> {
            tokio::task::yield_now().await;
            self.inner.keys().await
        }

        async fn delete(&self, key: &str) -> anyhow::Result<()> {
            tokio::task::yield_now().await;
            self.inner.delete(key).await
        }
    }

    #[tokio::test]
    async fn concurrent_approvals_apply_exactly_once() {
        let h = harness_over(Arc::new(YieldingStore {
            inner: MemoryKvStore::new(),
        }));
        let mut p = base_proposal(ProposalKind::Memory, ProposalAction::Add);
        p.content = Some("User's name is Boris".to_string());
        p.scope = Some(crate::facts::FactScope::Global);
        let id = ingest_one(&h, p).await;

        let (first, second) = tokio::join!(
            h.reconciler.approve(&id),
            h.reconciler.approve(&id)
        );

        let results = [first, second];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(EngineError::AlreadyResolved(_)))));

        // The target reflects the effect once, not twice.
        assert_eq!(h.facts.all_facts().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn memory_edit_applies_and_equal_edit_is_noop() {
        let h = harness();
        let fact = h
            .facts
            .create_fact("likes tea", FactOwner::Global)
            .await
            .unwrap();

        let mut edit = base_proposal(ProposalKind::Memory, ProposalAction::Edit);
        edit.target_id = Some(fact.id.clone());
        edit.content = Some("likes green tea".to_string());
        let edit_id = ingest_one(&h, edit.clone()).await;
        h.reconciler.approve(&edit_id).await.unwrap();
        assert_eq!(
            h.facts.get_fact(&fact.id).await.unwrap().content,
            "likes green tea"
        );

        // The same content again changes nothing and must auto-reject.
        let second_id = ingest_one(&h, edit).await;
        let report = h.reconciler.approve(&second_id).await.unwrap();
        assert!(matches!(report.outcome, ApplyOutcome::AutoRejected { .. }));
        let (_, proposal) = h.reflections.find_proposal(&second_id).await.unwrap();
        assert_eq!(
            proposal.rejection_reason.as_deref(),
            Some(NO_OP_REJECTION_REASON)
        );
    }

    #[tokio::test]
    async fn reject_never_touches_target_data() {
        let h = harness();
        let mut p = base_proposal(ProposalKind::Memory, ProposalAction::Add);
        p.content = Some("never lands".to_string());
        p.scope = Some(crate::facts::FactScope::Global);
        let id = ingest_one(&h, p).await;

        h.reconciler
            .reject(&id, Some("not convinced".to_string()))
            .await
            .unwrap();

        assert!(h.facts.all_facts().await.unwrap().is_empty());
        let (_, proposal) = h.reflections.find_proposal(&id).await.unwrap();
        assert_eq!(proposal.status, ProposalStatus::Rejected);
        assert_eq!(proposal.rejection_reason.as_deref(), Some("not convinced"));
    }
}
