//! Structured change-proposals against the knowledge base.
//!
//! The model author emits one Reflection per analyzed conversation turn:
//! free-text reasoning plus zero or more Proposals, each a patch against one
//! entity kind. Proposals are validated against a closed kind/action matrix
//! at ingestion, then sit Pending until a reviewer decision resolves them
//! exactly once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::facts::FactScope;
use crate::store::KvStore;

pub const REFLECTIONS_KEY: &str = "reflections";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalKind {
    Memory,
    LorebookEntry,
    Lorebook,
    Character,
    Persona,
    Prompt,
    AppSetting,
    Conversation,
    InstructionalPrompt,
    StylePreference,
    Item,
    World,
}

impl ProposalKind {
    pub fn label(self) -> &'static str {
        match self {
            ProposalKind::Memory => "Memory",
            ProposalKind::LorebookEntry => "Lorebook Entry",
            ProposalKind::Lorebook => "Lorebook",
            ProposalKind::Character => "Character",
            ProposalKind::Persona => "Persona",
            ProposalKind::Prompt => "Prompt",
            ProposalKind::AppSetting => "App Setting",
            ProposalKind::Conversation => "Conversation",
            ProposalKind::InstructionalPrompt => "Instructional Prompt",
            ProposalKind::StylePreference => "Style Preference",
            ProposalKind::Item => "Item",
            ProposalKind::World => "World",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalAction {
    Add,
    Edit,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    #[default]
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ProposalKind,
    pub action: ProposalAction,
    pub rationale: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keywords: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lorebook_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<FactScope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_fields: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default)]
    pub status: ProposalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
}

fn require(condition: bool, message: &str) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(EngineError::Validation(message.to_string()))
    }
}

impl Proposal {
    /// Check the closed kind/action matrix and per-kind required fields.
    /// Invalid proposals never reach Pending status.
    pub fn validate(&self) -> Result<()> {
        use ProposalAction::*;
        use ProposalKind::*;

        match (self.kind, self.action) {
            (InstructionalPrompt, Add) | (InstructionalPrompt, Delete) => {
                return Err(EngineError::Validation(
                    "instructional_prompt only supports edit".to_string(),
                ));
            }
            (Conversation, Add) => {
                return Err(EngineError::Validation(
                    "conversations are created by chatting, not by proposal".to_string(),
                ));
            }
            _ => {}
        }

        // AppSetting addresses its target by key, the instructional prompt
        // is a single record; everything else needs a target id to edit or
        // delete.
        if matches!(self.action, Edit | Delete)
            && !matches!(self.kind, AppSetting | InstructionalPrompt)
        {
            require(self.target_id.is_some(), "edit/delete requires target_id")?;
        }

        match self.kind {
            Memory => match self.action {
                Add => {
                    require(self.content.is_some(), "memory add requires content")?;
                    require(self.scope.is_some(), "memory add requires scope")
                }
                Edit => require(self.content.is_some(), "memory edit requires content"),
                Delete => Ok(()),
            },
            LorebookEntry => match self.action {
                Add => {
                    require(
                        self.lorebook_id.is_some(),
                        "lorebook_entry add requires lorebook_id",
                    )?;
                    require(self.content.is_some(), "lorebook_entry add requires content")
                }
                Edit => require(
                    self.content.is_some() || self.keywords.is_some(),
                    "lorebook_entry edit requires content or keywords",
                ),
                Delete => Ok(()),
            },
            AppSetting => {
                require(self.key.is_some(), "app_setting requires key")?;
                match self.action {
                    Add | Edit => require(self.value.is_some(), "app_setting requires value"),
                    Delete => Ok(()),
                }
            }
            InstructionalPrompt => require(
                self.content.is_some(),
                "instructional_prompt edit requires content",
            ),
            StylePreference => match self.action {
                Add | Edit => require(
                    self.content.is_some(),
                    "style_preference requires content",
                ),
                Delete => Ok(()),
            },
            Conversation => match self.action {
                Edit => {
                    let fields = self.updated_fields.as_ref();
                    require(
                        fields.is_some_and(|f| !f.is_empty()),
                        "conversation edit requires updated_fields",
                    )?;
                    // Title is the only conversation field a proposal may touch.
                    require(
                        fields.is_some_and(|f| f.keys().all(|k| k == "preview")),
                        "conversation edit may only touch the preview field",
                    )
                }
                _ => Ok(()),
            },
            Lorebook | Character | Persona | Prompt | Item | World => match self.action {
                Add | Edit => require(
                    self.updated_fields
                        .as_ref()
                        .is_some_and(|f| !f.is_empty()),
                    "add/edit requires non-empty updated_fields",
                ),
                Delete => Ok(()),
            },
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == ProposalStatus::Pending
    }
}

/// One analysis pass over one conversation turn, bundling the author's
/// reasoning with its proposals. Owns the proposals for their lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reflection {
    pub id: String,
    pub conversation_id: String,
    pub conversation_preview: String,
    pub character_id: String,
    pub character_name: String,
    pub thoughts: String,
    pub proposals: Vec<Proposal>,
    pub timestamp: DateTime<Utc>,
}

/// The shape the author hands over: no id or timestamp yet, proposal ids
/// optional.
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingReflection {
    pub conversation_id: String,
    #[serde(default)]
    pub conversation_preview: String,
    pub character_id: String,
    #[serde(default)]
    pub character_name: String,
    pub thoughts: String,
    #[serde(default)]
    pub proposals: Vec<Proposal>,
}

/// Which owning record a reflection (or fact) hangs off.
#[derive(Debug, Clone, Copy)]
pub enum OwnerRef<'a> {
    Character(&'a str),
    Conversation(&'a str),
}

pub struct ReflectionStore {
    store: Arc<dyn KvStore>,
    write_lock: Mutex<()>,
}

impl ReflectionStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Validate and persist an incoming reflection. Any invalid proposal
    /// rejects the whole reflection with a diagnostic — a bad patch must
    /// never be silently dropped on the floor.
    pub async fn ingest(&self, incoming: IncomingReflection) -> Result<Reflection> {
        for proposal in &incoming.proposals {
            if let Err(error) = proposal.validate() {
                tracing::warn!(
                    kind = proposal.kind.label(),
                    action = ?proposal.action,
                    %error,
                    "rejected proposal at ingestion"
                );
                return Err(error);
            }
        }

        let reflection = Reflection {
            id: Uuid::new_v4().to_string(),
            conversation_id: incoming.conversation_id,
            conversation_preview: incoming.conversation_preview,
            character_id: incoming.character_id,
            character_name: incoming.character_name,
            thoughts: incoming.thoughts,
            proposals: incoming
                .proposals
                .into_iter()
                .map(|mut p| {
                    if p.id.is_empty() {
                        p.id = Uuid::new_v4().to_string();
                    }
                    p.status = ProposalStatus::Pending;
                    p.rejection_reason = None;
                    p
                })
                .collect(),
            timestamp: Utc::now(),
        };

        let _guard = self.write_lock.lock().await;
        let mut reflections = self.read_all().await?;
        reflections.push(reflection.clone());
        self.write_all(&reflections).await?;
        tracing::info!(
            reflection_id = %reflection.id,
            proposals = reflection.proposals.len(),
            "reflection ingested"
        );
        Ok(reflection)
    }

    pub async fn list(&self) -> Result<Vec<Reflection>> {
        self.read_all().await
    }

    pub async fn find_proposal(&self, proposal_id: &str) -> Result<(Reflection, Proposal)> {
        for reflection in self.read_all().await? {
            if let Some(proposal) = reflection.proposals.iter().find(|p| p.id == proposal_id) {
                let proposal = proposal.clone();
                return Ok((reflection, proposal));
            }
        }
        Err(EngineError::NotFound(format!("proposal {proposal_id}")))
    }

    /// Flip a Pending proposal to its final status. Transitions happen
    /// exactly once; a second resolution attempt fails.
    pub async fn set_status(
        &self,
        proposal_id: &str,
        status: ProposalStatus,
        rejection_reason: Option<String>,
    ) -> Result<Proposal> {
        let _guard = self.write_lock.lock().await;
        let mut reflections = self.read_all().await?;
        let mut updated = None;
        for reflection in &mut reflections {
            if let Some(proposal) = reflection
                .proposals
                .iter_mut()
                .find(|p| p.id == proposal_id)
            {
                if !proposal.is_pending() {
                    return Err(EngineError::AlreadyResolved(proposal_id.to_string()));
                }
                proposal.status = status;
                proposal.rejection_reason = rejection_reason.clone();
                updated = Some(proposal.clone());
                break;
            }
        }
        match updated {
            Some(proposal) => {
                self.write_all(&reflections).await?;
                Ok(proposal)
            }
            None => Err(EngineError::NotFound(format!("proposal {proposal_id}"))),
        }
    }

    /// Cascade policy for deleted owners: still-Pending proposals in
    /// reflections bound to the owner are auto-rejected. The proposal that
    /// drove the deletion is excluded so its own approval can still land.
    /// Returns how many were flipped.
    pub async fn reject_pending_for_owner(
        &self,
        owner: OwnerRef<'_>,
        reason: &str,
        exclude_proposal: Option<&str>,
    ) -> Result<usize> {
        let _guard = self.write_lock.lock().await;
        let mut reflections = self.read_all().await?;
        let mut flipped = 0;
        for reflection in &mut reflections {
            let owned = match owner {
                OwnerRef::Character(id) => reflection.character_id == id,
                OwnerRef::Conversation(id) => reflection.conversation_id == id,
            };
            if !owned {
                continue;
            }
            for proposal in reflection
                .proposals
                .iter_mut()
                .filter(|p| p.is_pending() && Some(p.id.as_str()) != exclude_proposal)
            {
                proposal.status = ProposalStatus::Rejected;
                proposal.rejection_reason = Some(reason.to_string());
                flipped += 1;
            }
        }
        if flipped > 0 {
            self.write_all(&reflections).await?;
            tracing::info!(count = flipped, "auto-rejected pending proposals for deleted owner");
        }
        Ok(flipped)
    }

    pub async fn delete_reflection(&self, reflection_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut reflections = self.read_all().await?;
        let before = reflections.len();
        reflections.retain(|r| r.id != reflection_id);
        if reflections.len() == before {
            return Err(EngineError::NotFound(format!(
                "reflection {reflection_id}"
            )));
        }
        self.write_all(&reflections).await
    }

    async fn read_all(&self) -> Result<Vec<Reflection>> {
        Ok(self
            .store
            .get_json::<Vec<Reflection>>(REFLECTIONS_KEY)
            .await
            .map_err(EngineError::StoreUnavailable)?
            .unwrap_or_default())
    }

    async fn write_all(&self, reflections: &[Reflection]) -> Result<()> {
        self.store
            .set_json(REFLECTIONS_KEY, &reflections)
            .await
            .map_err(EngineError::StoreUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKvStore;

    fn proposal(kind: ProposalKind, action: ProposalAction) -> Proposal {
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

    fn reflection_with(proposals: Vec<Proposal>) -> IncomingReflection {
        IncomingReflection {
            conversation_id: "conv-1".to_string(),
            conversation_preview: "At the harbor".to_string(),
            character_id: "char-1".to_string(),
            character_name: "Mira".to_string(),
            thoughts: "Noticed a recurring detail.".to_string(),
            proposals,
        }
    }

    fn store() -> ReflectionStore {
        ReflectionStore::new(Arc::new(MemoryKvStore::new()))
    }

    #[tokio::test]
    async fn instructional_prompt_add_is_rejected_at_ingestion() {
        let reflections = store();
        let mut bad = proposal(ProposalKind::InstructionalPrompt, ProposalAction::Add);
        bad.content = Some("always speak in riddles".to_string());

        let err = reflections
            .ingest(reflection_with(vec![bad]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        // Nothing reached Pending.
        assert!(reflections.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn edit_without_target_fails_validation() {
        let mut p = proposal(ProposalKind::Character, ProposalAction::Edit);
        p.updated_fields = Some(Map::from_iter([(
            "appearance".to_string(),
            Value::String("wears a red hat".to_string()),
        )]));
        assert!(matches!(
            p.validate(),
            Err(EngineError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn conversation_edit_may_only_touch_preview() {
        let mut p = proposal(ProposalKind::Conversation, ProposalAction::Edit);
        p.target_id = Some("conv-1".to_string());
        p.updated_fields = Some(Map::from_iter([(
            "messages".to_string(),
            Value::Array(vec![]),
        )]));
        assert!(p.validate().is_err());

        p.updated_fields = Some(Map::from_iter([(
            "preview".to_string(),
            Value::String("Harbor talk".to_string()),
        )]));
        assert!(p.validate().is_ok());
    }

    #[tokio::test]
    async fn ingest_mints_ids_and_forces_pending() {
        let reflections = store();
        let mut p = proposal(ProposalKind::Memory, ProposalAction::Add);
        p.content = Some("User's name is Boris".to_string());
        p.scope = Some(FactScope::Global);
        p.status = ProposalStatus::Approved; // author cannot pre-approve

        let stored = reflections.ingest(reflection_with(vec![p])).await.unwrap();
        assert!(!stored.proposals[0].id.is_empty());
        assert_eq!(stored.proposals[0].status, ProposalStatus::Pending);
    }

    #[tokio::test]
    async fn status_transition_happens_exactly_once() {
        let reflections = store();
        let mut p = proposal(ProposalKind::Memory, ProposalAction::Add);
        p.content = Some("likes tea".to_string());
        p.scope = Some(FactScope::Global);
        let stored = reflections.ingest(reflection_with(vec![p])).await.unwrap();
        let id = stored.proposals[0].id.clone();

        reflections
            .set_status(&id, ProposalStatus::Rejected, Some("dup".to_string()))
            .await
            .unwrap();
        let err = reflections
            .set_status(&id, ProposalStatus::Approved, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyResolved(_)));
    }

    #[tokio::test]
    async fn cascade_rejects_pending_proposals_of_deleted_owner() {
        let reflections = store();
        let mut p = proposal(ProposalKind::Memory, ProposalAction::Add);
        p.content = Some("met at the docks".to_string());
        p.scope = Some(FactScope::Conversation);
        reflections.ingest(reflection_with(vec![p])).await.unwrap();

        let flipped = reflections
            .reject_pending_for_owner(
                OwnerRef::Conversation("conv-1"),
                "conversation deleted",
                None,
            )
            .await
            .unwrap();
        assert_eq!(flipped, 1);

        let all = reflections.list().await.unwrap();
        assert_eq!(all[0].proposals[0].status, ProposalStatus::Rejected);
        assert_eq!(
            all[0].proposals[0].rejection_reason.as_deref(),
            Some("conversation deleted")
        );
    }
}
