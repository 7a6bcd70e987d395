//! Core domain model for task duplicate reconciliation.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "recon-core";

/// A task-like entity as read from a record store.
///
/// `created_time` and `last_edited_time` are store-assigned; the reconciler
/// never writes them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub record_id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub assignee_label: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub deadline: Option<NaiveDate>,
    #[serde(default)]
    pub description: String,
    pub created_time: DateTime<Utc>,
    pub last_edited_time: DateTime<Utc>,
}

impl Record {
    pub fn equivalence_key(&self) -> Option<EquivalenceKey> {
        EquivalenceKey::for_record(self)
    }
}

/// Normalized `(title, assignee)` pair. Two records with equal keys describe
/// the same intent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EquivalenceKey {
    pub normalized_title: String,
    pub assignee_label: String,
}

impl EquivalenceKey {
    pub fn normalize_title(title: &str) -> String {
        title.to_lowercase().trim().to_string()
    }

    /// Returns `None` for records whose title normalizes to the empty string;
    /// those never take part in grouping.
    pub fn for_record(record: &Record) -> Option<Self> {
        let normalized_title = Self::normalize_title(&record.title);
        if normalized_title.is_empty() {
            return None;
        }
        Some(Self {
            normalized_title,
            assignee_label: record.assignee_label.clone(),
        })
    }
}

impl fmt::Display for EquivalenceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.normalized_title, self.assignee_label)
    }
}

/// Half-open `[start, end)` range of creation timestamps belonging to the most
/// recent trusted bulk import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ImportWindow {
    /// Returns `None` when `end` is not after `start`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts < self.end
    }
}

/// One bounded page of a store listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Page {
    pub items: Vec<Record>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum ArchiveOutcome {
    Archived,
    Failed(String),
}

impl ArchiveOutcome {
    pub fn is_archived(&self) -> bool {
        matches!(self, Self::Archived)
    }
}

/// Tie-break rule that settled a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecidingRule {
    ImportWindow,
    LaterDeadline,
    MostRecentlyEdited,
    FirstSeen,
}

impl fmt::Display for DecidingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::ImportWindow => "import-window",
            Self::LaterDeadline => "later-deadline",
            Self::MostRecentlyEdited => "most-recently-edited",
            Self::FirstSeen => "first-seen",
        };
        f.write_str(label)
    }
}

/// Survivor choice for one duplicate group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub key: EquivalenceKey,
    pub survivor_id: String,
    pub retire_ids: Vec<String>,
    pub decided_by: DecidingRule,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetirementFailure {
    pub record_id: String,
    pub reason: String,
}

/// Two keys close enough to deserve a human look; never retired automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewCandidate {
    pub key_a: EquivalenceKey,
    pub key_b: EquivalenceKey,
    pub confidence_score: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    NoDuplicates,
    Reconciled,
    PartialFailure,
    DryRun,
    Cancelled,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NoDuplicates => "no duplicates found",
            Self::Reconciled => "duplicates retired",
            Self::PartialFailure => "duplicates found, some retirements failed",
            Self::DryRun => "dry run, nothing archived",
            Self::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Summary of one reconciliation pass. Built once per run and handed back to
/// the caller; the core never persists it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub cancelled: bool,
    pub total_records_scanned: usize,
    pub groups_with_duplicates: usize,
    pub records_retired: usize,
    pub records_failed: usize,
    pub snapshot_digest: Option<String>,
    #[serde(default)]
    pub decisions: Vec<Decision>,
    #[serde(default)]
    pub failures: Vec<RetirementFailure>,
    #[serde(default)]
    pub review_candidates: Vec<ReviewCandidate>,
}

impl ReconciliationReport {
    /// All-zero report, the shape of an empty snapshot or an early cancel.
    pub fn empty(run_id: Uuid, started_at: DateTime<Utc>, dry_run: bool) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            dry_run,
            cancelled: false,
            total_records_scanned: 0,
            groups_with_duplicates: 0,
            records_retired: 0,
            records_failed: 0,
            snapshot_digest: None,
            decisions: Vec::new(),
            failures: Vec::new(),
            review_candidates: Vec::new(),
        }
    }

    pub fn outcome(&self) -> RunOutcome {
        if self.cancelled {
            RunOutcome::Cancelled
        } else if self.groups_with_duplicates == 0 {
            RunOutcome::NoDuplicates
        } else if self.dry_run {
            RunOutcome::DryRun
        } else if self.records_failed > 0 {
            RunOutcome::PartialFailure
        } else {
            RunOutcome::Reconciled
        }
    }
}
