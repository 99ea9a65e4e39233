//! Core domain model and status-mapping rules for CPS.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cps-core";

/// The fixed recruitment pipeline. Every synced candidate lands on exactly
/// one of these values; the raw remote status string is kept alongside but
/// never used as the stage itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineStage {
    #[serde(rename = "New Candidate")]
    NewCandidate,
    #[serde(rename = "Screening")]
    Screening,
    #[serde(rename = "Interview Scheduled")]
    InterviewScheduled,
    #[serde(rename = "Interview Completed")]
    InterviewCompleted,
    #[serde(rename = "Assessment")]
    Assessment,
    #[serde(rename = "Onboarding")]
    Onboarding,
    #[serde(rename = "Active")]
    Active,
    #[serde(rename = "Inactive")]
    Inactive,
    #[serde(rename = "Rejected")]
    Rejected,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 9] = [
        PipelineStage::NewCandidate,
        PipelineStage::Screening,
        PipelineStage::InterviewScheduled,
        PipelineStage::InterviewCompleted,
        PipelineStage::Assessment,
        PipelineStage::Onboarding,
        PipelineStage::Active,
        PipelineStage::Inactive,
        PipelineStage::Rejected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::NewCandidate => "New Candidate",
            PipelineStage::Screening => "Screening",
            PipelineStage::InterviewScheduled => "Interview Scheduled",
            PipelineStage::InterviewCompleted => "Interview Completed",
            PipelineStage::Assessment => "Assessment",
            PipelineStage::Onboarding => "Onboarding",
            PipelineStage::Active => "Active",
            PipelineStage::Inactive => "Inactive",
            PipelineStage::Rejected => "Rejected",
        }
    }

    pub fn parse(value: &str) -> Option<PipelineStage> {
        PipelineStage::ALL.iter().copied().find(|s| s.as_str() == value)
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterviewStatus {
    Scheduled,
    Completed,
    NoShow,
    Cancelled,
}

impl InterviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterviewStatus::Scheduled => "scheduled",
            InterviewStatus::Completed => "completed",
            InterviewStatus::NoShow => "no_show",
            InterviewStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<InterviewStatus> {
        match value {
            "scheduled" => Some(InterviewStatus::Scheduled),
            "completed" => Some(InterviewStatus::Completed),
            "no_show" => Some(InterviewStatus::NoShow),
            "cancelled" => Some(InterviewStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for InterviewStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which remote modules a sync run covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncScope {
    Candidates,
    Interviews,
    Both,
}

impl SyncScope {
    pub fn includes_candidates(&self) -> bool {
        matches!(self, SyncScope::Candidates | SyncScope::Both)
    }

    pub fn includes_interviews(&self) -> bool {
        matches!(self, SyncScope::Interviews | SyncScope::Both)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncScope::Candidates => "candidates",
            SyncScope::Interviews => "interviews",
            SyncScope::Both => "both",
        }
    }

    pub fn parse(value: &str) -> Option<SyncScope> {
        match value {
            "candidates" => Some(SyncScope::Candidates),
            "interviews" => Some(SyncScope::Interviews),
            "both" => Some(SyncScope::Both),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Running,
    Success,
    Partial,
    Failed,
}

impl SyncOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOutcome::Running => "running",
            SyncOutcome::Success => "success",
            SyncOutcome::Partial => "partial",
            SyncOutcome::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<SyncOutcome> {
        match value {
            "running" => Some(SyncOutcome::Running),
            "success" => Some(SyncOutcome::Success),
            "partial" => Some(SyncOutcome::Partial),
            "failed" => Some(SyncOutcome::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local cache row for one recruitment pipeline entrant. The remote CRM is
/// the source of truth for everything except the locally-owned fields listed
/// in [`Candidate::LOCALLY_OWNED_FIELDS`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: i64,
    /// Stable primary key assigned by the remote CRM; reconciliation join key.
    pub external_id: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub full_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub mobile: Option<String>,
    /// Raw remote status string, kept for diagnostics.
    pub remote_status: Option<String>,
    pub stage: PipelineStage,
    pub tier: Option<String>,
    pub languages: Option<String>,
    pub recruitment_owner: Option<String>,
    pub assessment_passed: Option<bool>,
    pub background_check_passed: Option<bool>,
    pub specs_approved: Option<bool>,
    pub offer_accepted: Option<bool>,
    pub needs_training: bool,
    pub has_pending_documents: bool,
    /// Locally owned: set by follow-up workflows, never by sync.
    pub is_unresponsive: bool,
    /// Locally owned: free-text operator notes, never by sync.
    pub notes: Option<String>,
    pub remote_created_at: Option<DateTime<Utc>>,
    pub remote_modified_at: Option<DateTime<Utc>>,
    pub last_activity_at: Option<DateTime<Utc>>,
    /// When the candidate entered the current stage; reset on observed
    /// stage transitions.
    pub stage_entered_at: Option<DateTime<Utc>>,
    pub days_in_stage: i64,
    pub last_synced_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Candidate {
    /// Fields the reconciler must never overwrite on update. Everything else
    /// on the row is remote-owned and fully replaced each sync.
    pub const LOCALLY_OWNED_FIELDS: [&'static str; 2] = ["is_unresponsive", "notes"];
}

/// One scheduled or past interview event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interview {
    pub id: i64,
    pub external_event_id: String,
    /// Local candidate row, when the event could be resolved to one.
    pub candidate_id: Option<i64>,
    pub candidate_name: String,
    pub candidate_email: Option<String>,
    pub remote_candidate_id: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub duration_minutes: i64,
    pub interview_type: String,
    pub status: InterviewStatus,
    pub is_no_show: bool,
    /// Monotone across syncs; incremented only on a transition into no_show.
    pub no_show_count: i64,
    /// Locally owned: follow-up workflow flag.
    pub followup_sent: bool,
    /// Locally owned: bumped by the rescheduling endpoints.
    pub reschedule_count: i64,
    pub interviewer: Option<String>,
    /// Locally owned: passed/failed/needs_review, set after the fact.
    pub outcome: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only record of one orchestrator invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub run_id: Uuid,
    pub scope: SyncScope,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub records_fetched: i64,
    pub records_created: i64,
    pub records_updated: i64,
    pub errors: Vec<String>,
    pub outcome: SyncOutcome,
}

impl SyncRun {
    pub fn begin(run_id: Uuid, scope: SyncScope, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            scope,
            started_at,
            finished_at: None,
            records_fetched: 0,
            records_created: 0,
            records_updated: 0,
            errors: Vec::new(),
            outcome: SyncOutcome::Running,
        }
    }
}

// ---------------------------------------------------------------------------
// Status mapping
// ---------------------------------------------------------------------------

/// Past-event grace window for the date-based interview status fallback.
/// Events older than this with no check-in are assumed completed; more recent
/// ones are assumed no-shows. Known to produce false no-shows; kept for
/// behavioral parity with the upstream CRM workflows.
pub const NO_SHOW_FALLBACK_DAYS: i64 = 7;

/// Ordered substring fallbacks applied after the exact stage table misses.
/// First match wins. "qualified" is handled separately because it must not
/// fire on "not qualified".
pub const STAGE_SUBSTRING_RULES: &[(&str, PipelineStage)] = &[
    ("tier 1", PipelineStage::Active),
    ("tier 2", PipelineStage::Active),
    ("tier 3", PipelineStage::Active),
    ("interview", PipelineStage::InterviewScheduled),
    ("screening", PipelineStage::Screening),
    ("assessment", PipelineStage::Assessment),
    ("language", PipelineStage::Assessment),
    ("training", PipelineStage::Onboarding),
    ("onboarding", PipelineStage::Onboarding),
    ("document", PipelineStage::Onboarding),
    ("lost", PipelineStage::Inactive),
    ("declined", PipelineStage::Inactive),
];

/// Event titles must contain one of these (case-insensitive) to be treated
/// as interviews at all; anything else is skipped by the reconciler.
pub const INTERVIEW_KEYWORDS: &[&str] = &[
    "interview",
    "screening",
    "auto interview",
    "candidate call",
    "hiring call",
    "recruitment call",
    "phone screen",
];

/// Map a raw remote candidate status to a pipeline stage.
///
/// Exact table first, then the ordered substring fallbacks in
/// [`STAGE_SUBSTRING_RULES`]. Unrecognized or empty input maps to
/// `New Candidate` rather than being preserved or dropped.
pub fn map_status_to_stage(remote_status: &str) -> PipelineStage {
    let exact = match remote_status {
        "New Candidate" | "LinkedIn Applicants" | "ZipRecruiter Leads" | "LinkedIn Leads"
        | "Requested Resume" => Some(PipelineStage::NewCandidate),

        "Screening" | "Automated Ai Review" | "Pre-Qualified" | "Qualified" => {
            Some(PipelineStage::Screening)
        }

        "To be invited for auto interview"
        | "Auto Interview - Invited"
        | "Invited to schedule interview"
        | "Interview Scheduled"
        | "Auto Interview - In progress"
        | "Invited to reschedule the interview" => Some(PipelineStage::InterviewScheduled),

        "Auto Interview - Done" => Some(PipelineStage::InterviewCompleted),

        "Language assessment assigned"
        | "Lang. Assessment Assigned"
        | "Language assessment to be graded"
        | "Language assessment to be graded."
        | "Language assessment to be assigned"
        | "Failed Lang. Assessment" => Some(PipelineStage::Assessment),

        "Offer Accepted"
        | "Offer Accepted Tier 2 (training)"
        | "Offer Accepted Tier 3 (training)"
        | "Documents Downloaded"
        | "ID Verification"
        | "Waiting Training"
        | "Waiting for Training"
        | "Invited for Upcoming Training"
        | "Booked for training"
        | "On training"
        | "Waiting for System Specs Approval"
        | "Invited to AlfaOne" => Some(PipelineStage::Onboarding),

        "Training Completed" | "Tier 1" | "Tier 2" | "Tier 3" => Some(PipelineStage::Active),

        "Offer Declined" | "Failed Training" | "Training No Show" | "Failed Onboarding"
        | "Lost Lead" | "Lost Candidate" | "Contact in Future" => Some(PipelineStage::Inactive),

        "Not Qualified" | "Junk Lead" => Some(PipelineStage::Rejected),

        _ => None,
    };
    if let Some(stage) = exact {
        return stage;
    }

    let lower = remote_status.to_lowercase();
    for (needle, stage) in STAGE_SUBSTRING_RULES {
        if lower.contains(needle) {
            return *stage;
        }
    }
    if lower.contains("qualified") && !lower.contains("not") {
        return PipelineStage::Screening;
    }

    PipelineStage::NewCandidate
}

/// Derive an interview status from the remote check-in field and the event's
/// scheduled time relative to `now`.
///
/// Check-in signals win; without one the status falls back to the event date,
/// assuming completion for events more than [`NO_SHOW_FALLBACK_DAYS`] in the
/// past and a no-show for anything more recent.
pub fn derive_interview_status(
    check_in_status: Option<&str>,
    scheduled_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> InterviewStatus {
    if let Some(check_in) = check_in_status.filter(|s| !s.trim().is_empty()) {
        let lower = check_in.to_lowercase();
        if lower.contains("checked in") || lower.contains("completed") {
            return InterviewStatus::Completed;
        }
        if lower.contains("no show") || lower.contains("absent") {
            return InterviewStatus::NoShow;
        }
        if lower.contains("cancelled") {
            return InterviewStatus::Cancelled;
        }
        // Unrecognized check-in value: a past event with no usable signal is
        // treated as a no-show, a future one is still scheduled.
        return if scheduled_at < now {
            InterviewStatus::NoShow
        } else {
            InterviewStatus::Scheduled
        };
    }

    if scheduled_at >= now {
        return InterviewStatus::Scheduled;
    }
    let days_ago = (now - scheduled_at).num_days();
    if days_ago > NO_SHOW_FALLBACK_DAYS {
        InterviewStatus::Completed
    } else {
        InterviewStatus::NoShow
    }
}

/// Whether an event title identifies a genuine interview event.
pub fn is_interview_event(title: &str) -> bool {
    if title.is_empty() {
        return false;
    }
    let lower = title.to_lowercase();
    INTERVIEW_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

/// Classify the interview type from the event title.
pub fn classify_interview_type(title: &str) -> &'static str {
    let lower = title.to_lowercase();
    if lower.contains("auto interview") {
        "Auto Interview"
    } else if lower.contains("screening") || lower.contains("phone screen") {
        "Initial Screening"
    } else if lower.contains("final") {
        "Final Interview"
    } else {
        "Interview"
    }
}
