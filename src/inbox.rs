//! Review surface for pending proposals.
//!
//! Flattens every reflection's pending proposals into one list, groups them
//! for display, tracks a multi-select set, and runs batch rejection with an
//! aggregate outcome — per-id failures are collected and reported, never
//! swallowed, so the reviewer can retry exactly the failed subset.

use chrono::{DateTime, Duration, Local, NaiveDate, Utc};
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::Result;
use crate::proposals::{Proposal, ReflectionStore};
use crate::reconciler::Reconciler;

/// A pending proposal carrying its parent reflection's display context.
#[derive(Debug, Clone)]
pub struct PendingProposal {
    pub proposal: Proposal,
    pub reflection_id: String,
    pub conversation_id: String,
    pub conversation_preview: String,
    pub character_id: String,
    pub character_name: String,
    pub reflected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupBy {
    None,
    Character,
    Conversation,
    Date,
    ProposalKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateBucket {
    Today,
    Yesterday,
    ThisWeek,
    Older,
}

impl DateBucket {
    pub fn label(self) -> &'static str {
        match self {
            DateBucket::Today => "Today",
            DateBucket::Yesterday => "Yesterday",
            DateBucket::ThisWeek => "This Week",
            DateBucket::Older => "Older",
        }
    }

    fn rank(self) -> u8 {
        match self {
            DateBucket::Today => 0,
            DateBucket::Yesterday => 1,
            DateBucket::ThisWeek => 2,
            DateBucket::Older => 3,
        }
    }
}

/// Bucket a reflection's local calendar date relative to today. Clock skew
/// can put a timestamp in the future; those sort with Today. `week_days`
/// sets how far back "This Week" reaches.
pub fn bucket_for(entry: NaiveDate, today: NaiveDate, week_days: i64) -> DateBucket {
    if entry >= today {
        DateBucket::Today
    } else if entry == today - Duration::days(1) {
        DateBucket::Yesterday
    } else if entry > today - Duration::days(week_days) {
        DateBucket::ThisWeek
    } else {
        DateBucket::Older
    }
}

#[derive(Debug, Clone)]
pub struct ProposalGroup {
    pub label: String,
    pub proposals: Vec<PendingProposal>,
}

impl ProposalGroup {
    pub fn proposal_ids(&self) -> Vec<String> {
        self.proposals.iter().map(|p| p.proposal.id.clone()).collect()
    }
}

/// Group pending proposals for display.
///
/// Ordering is part of the contract: date buckets rank Today first,
/// conversation groups sort by most recent activity, character and kind
/// groups sort by label.
pub fn group_pending(
    pending: &[PendingProposal],
    mode: GroupBy,
    today: NaiveDate,
    week_days: i64,
) -> Vec<ProposalGroup> {
    match mode {
        GroupBy::None => {
            if pending.is_empty() {
                Vec::new()
            } else {
                vec![ProposalGroup {
                    label: "All".to_string(),
                    proposals: pending.to_vec(),
                }]
            }
        }
        GroupBy::Date => {
            let mut buckets: Vec<(DateBucket, Vec<PendingProposal>)> = Vec::new();
            for entry in pending {
                let date = entry.reflected_at.with_timezone(&Local).date_naive();
                let bucket = bucket_for(date, today, week_days);
                match buckets.iter_mut().find(|(b, _)| *b == bucket) {
                    Some((_, members)) => members.push(entry.clone()),
                    None => buckets.push((bucket, vec![entry.clone()])),
                }
            }
            buckets.sort_by_key(|(bucket, _)| bucket.rank());
            buckets
                .into_iter()
                .map(|(bucket, proposals)| ProposalGroup {
                    label: bucket.label().to_string(),
                    proposals,
                })
                .collect()
        }
        GroupBy::Character | GroupBy::Conversation | GroupBy::ProposalKind => {
            let mut groups: Vec<ProposalGroup> = Vec::new();
            for entry in pending {
                let label = match mode {
                    GroupBy::Character => {
                        if entry.character_name.is_empty() {
                            entry.character_id.clone()
                        } else {
                            entry.character_name.clone()
                        }
                    }
                    GroupBy::Conversation => {
                        if entry.conversation_preview.is_empty() {
                            entry.conversation_id.clone()
                        } else {
                            entry.conversation_preview.clone()
                        }
                    }
                    _ => entry.proposal.kind.label().to_string(),
                };
                match groups.iter_mut().find(|g| g.label == label) {
                    Some(group) => group.proposals.push(entry.clone()),
                    None => groups.push(ProposalGroup {
                        label,
                        proposals: vec![entry.clone()],
                    }),
                }
            }
            if mode == GroupBy::Conversation {
                // Most recently active conversation first, not alphabetical.
                groups.sort_by_key(|g| {
                    std::cmp::Reverse(
                        g.proposals.iter().map(|p| p.reflected_at).max(),
                    )
                });
            } else {
                groups.sort_by(|a, b| a.label.cmp(&b.label));
            }
            groups
        }
    }
}

/// Mutable multi-select over proposal ids. Group operations are plain set
/// union and difference, so overlapping groupings cannot corrupt each other.
#[derive(Debug, Default)]
pub struct Selection {
    ids: HashSet<String>,
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select_all<I>(&mut self, ids: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.ids.extend(ids);
    }

    pub fn deselect_all<'a, I>(&mut self, ids: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        for id in ids {
            self.ids.remove(id);
        }
    }

    pub fn toggle(&mut self, id: &str) {
        if !self.ids.remove(id) {
            self.ids.insert(id.to_string());
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    /// Sorted for deterministic iteration order.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.ids.iter().cloned().collect();
        ids.sort();
        ids
    }
}

#[derive(Debug, Clone)]
pub struct BatchFailure {
    pub proposal_id: String,
    pub error: String,
}

/// Aggregate outcome of a batch operation: counts, never silence.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub rejected: usize,
    pub failures: Vec<BatchFailure>,
}

impl BatchOutcome {
    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct Inbox {
    reflections: Arc<ReflectionStore>,
    reconciler: Arc<Reconciler>,
    week_days: i64,
}

impl Inbox {
    pub fn new(
        reflections: Arc<ReflectionStore>,
        reconciler: Arc<Reconciler>,
        week_days: i64,
    ) -> Self {
        Self {
            reflections,
            reconciler,
            week_days,
        }
    }

    pub async fn list_pending(&self) -> Result<Vec<PendingProposal>> {
        let mut pending = Vec::new();
        for reflection in self.reflections.list().await? {
            for proposal in reflection.proposals.iter().filter(|p| p.is_pending()) {
                pending.push(PendingProposal {
                    proposal: proposal.clone(),
                    reflection_id: reflection.id.clone(),
                    conversation_id: reflection.conversation_id.clone(),
                    conversation_preview: reflection.conversation_preview.clone(),
                    character_id: reflection.character_id.clone(),
                    character_name: reflection.character_name.clone(),
                    reflected_at: reflection.timestamp,
                });
            }
        }
        Ok(pending)
    }

    pub async fn group_by(&self, mode: GroupBy) -> Result<Vec<ProposalGroup>> {
        let pending = self.list_pending().await?;
        Ok(group_pending(
            &pending,
            mode,
            Local::now().date_naive(),
            self.week_days,
        ))
    }

    /// Reject every selected id with the same reason. Failures do not stop
    /// the batch; they are collected into the outcome so the reviewer can
    /// retry exactly that subset.
    pub async fn batch_reject(&self, ids: &[String], reason: &str) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for id in ids {
            match self
                .reconciler
                .reject(id, Some(reason.to_string()))
                .await
            {
                Ok(()) => outcome.rejected += 1,
                Err(error) => outcome.failures.push(BatchFailure {
                    proposal_id: id.clone(),
                    error: error.to_string(),
                }),
            }
        }
        if !outcome.all_succeeded() {
            tracing::warn!(
                rejected = outcome.rejected,
                failed = outcome.failures.len(),
                "batch reject finished with failures"
            );
        }
        outcome
    }
}
