//! Record-level reconciliation: one remote record in, one upsert out.

use chrono::{DateTime, Utc};
use cps_core::{
    classify_interview_type, derive_interview_status, is_interview_event, map_status_to_stage,
    Candidate, Interview, InterviewStatus,
};
use cps_crm::{EventRecord, LeadRecord, NameRef};
use cps_store::{Store, StoreError};
use tracing::{debug, info};

/// Fallback length for events without an end time.
const DEFAULT_DURATION_MINUTES: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Created,
    Updated,
    Skipped,
}

/// Upserts remote records into the store.
///
/// Updates replace every remote-owned field wholesale and leave the
/// locally-owned workflow fields alone; the store's update statements
/// enforce the split, the reconciler only decides created-vs-updated and
/// the derived fields (stage, interview status, counters).
pub struct Reconciler {
    store: Store,
}

impl Reconciler {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn reconcile_lead(
        &self,
        lead: &LeadRecord,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, StoreError> {
        let Some(external_id) = lead.id.as_deref().filter(|id| !id.is_empty()) else {
            debug!("lead without id skipped");
            return Ok(ReconcileOutcome::Skipped);
        };

        let remote_status = lead.lead_status.as_deref().unwrap_or("");
        let stage = map_status_to_stage(remote_status);
        let full_name = lead_full_name(lead);
        let languages = joined_languages(lead);
        let lower_status = remote_status.to_lowercase();
        let needs_training =
            lower_status.contains("training") && !lower_status.contains("completed");
        let has_pending_documents =
            lower_status.contains("document") || lower_status.contains("id verification");

        match self.store.find_candidate_by_external_id(external_id).await? {
            Some(existing) => {
                let stage_changed = existing.stage != stage;
                if stage_changed {
                    info!(
                        candidate = external_id,
                        from = existing.stage.as_str(),
                        to = stage.as_str(),
                        "stage transition"
                    );
                }
                let candidate = Candidate {
                    id: existing.id,
                    external_id: existing.external_id.clone(),
                    first_name: lead.first_name.clone(),
                    last_name: lead.last_name.clone(),
                    full_name,
                    email: lead.email.clone(),
                    phone: lead.phone.clone(),
                    mobile: lead.mobile.clone(),
                    remote_status: lead.lead_status.clone(),
                    stage,
                    tier: lead.tier_level.clone(),
                    languages,
                    recruitment_owner: owner_name(lead.recruitment_owner.as_ref()),
                    assessment_passed: lead.assessment_passed,
                    background_check_passed: lead.background_check_passed,
                    specs_approved: lead.specs_approved,
                    offer_accepted: lead.offer_accepted,
                    needs_training,
                    has_pending_documents,
                    is_unresponsive: existing.is_unresponsive,
                    notes: existing.notes.clone(),
                    remote_created_at: lead.created_time,
                    remote_modified_at: lead.modified_time,
                    last_activity_at: lead.last_activity_time,
                    // On a transition the entry time is the remote's last
                    // activity when known; rows synced before transition
                    // tracking existed get backfilled from creation time.
                    stage_entered_at: if stage_changed {
                        Some(lead.last_activity_time.unwrap_or(now))
                    } else {
                        existing.stage_entered_at.or(lead.created_time)
                    },
                    days_in_stage: if stage_changed { 0 } else { existing.days_in_stage },
                    last_synced_at: now,
                    created_at: existing.created_at,
                    updated_at: now,
                };
                self.store.update_candidate(&candidate).await?;
                Ok(ReconcileOutcome::Updated)
            }
            None => {
                let candidate = Candidate {
                    id: 0,
                    external_id: external_id.to_string(),
                    first_name: lead.first_name.clone(),
                    last_name: lead.last_name.clone(),
                    full_name,
                    email: lead.email.clone(),
                    phone: lead.phone.clone(),
                    mobile: lead.mobile.clone(),
                    remote_status: lead.lead_status.clone(),
                    stage,
                    tier: lead.tier_level.clone(),
                    languages,
                    recruitment_owner: owner_name(lead.recruitment_owner.as_ref()),
                    assessment_passed: lead.assessment_passed,
                    background_check_passed: lead.background_check_passed,
                    specs_approved: lead.specs_approved,
                    offer_accepted: lead.offer_accepted,
                    needs_training,
                    has_pending_documents,
                    is_unresponsive: false,
                    notes: None,
                    remote_created_at: lead.created_time,
                    remote_modified_at: lead.modified_time,
                    last_activity_at: lead.last_activity_time,
                    stage_entered_at: Some(lead.created_time.unwrap_or(now)),
                    days_in_stage: 0,
                    last_synced_at: now,
                    created_at: now,
                    updated_at: now,
                };
                self.store.insert_candidate(&candidate).await?;
                Ok(ReconcileOutcome::Created)
            }
        }
    }

    pub async fn reconcile_event(
        &self,
        event: &EventRecord,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, StoreError> {
        let title = event.title();
        if !is_interview_event(title) {
            return Ok(ReconcileOutcome::Skipped);
        }
        let Some(event_id) = event.id.as_deref().filter(|id| !id.is_empty()) else {
            debug!("event without id skipped");
            return Ok(ReconcileOutcome::Skipped);
        };
        let Some(scheduled_at) = event.start_at else {
            debug!(event = event_id, "event without start time skipped");
            return Ok(ReconcileOutcome::Skipped);
        };

        let duration_minutes = event
            .end_at
            .map(|end| (end - scheduled_at).num_minutes())
            .filter(|m| *m > 0)
            .unwrap_or(DEFAULT_DURATION_MINUTES);
        let status = derive_interview_status(event.check_in_status.as_deref(), scheduled_at, now);
        let is_no_show = status == InterviewStatus::NoShow;

        let remote_candidate_id = event
            .related_record
            .as_ref()
            .and_then(|r| r.id_or_text())
            .map(str::to_string);
        let candidate = match remote_candidate_id.as_deref() {
            Some(id) => self.store.find_candidate_by_external_id(id).await?,
            None => None,
        };
        // Second-chance resolution through the participant list.
        let candidate = match candidate {
            Some(found) => Some(found),
            None => match event.participant_email() {
                Some(email) => self.store.find_candidate_by_email(email).await?,
                None => None,
            },
        };
        let candidate_name = candidate
            .as_ref()
            .map(|c| c.full_name.clone())
            .or_else(|| related_record_name(event.related_record.as_ref()))
            .or_else(|| name_from_title(title))
            .unwrap_or_else(|| "Unknown".to_string());
        let candidate_email = candidate
            .as_ref()
            .and_then(|c| c.email.clone())
            .or_else(|| event.participant_email().map(str::to_string));
        let interviewer = event.owner.as_ref().and_then(|o| o.name()).map(str::to_string);

        match self.store.find_interview_by_event_id(event_id).await? {
            Some(existing) => {
                let entering_no_show = is_no_show && existing.status != InterviewStatus::NoShow;
                let interview = Interview {
                    id: existing.id,
                    external_event_id: existing.external_event_id.clone(),
                    candidate_id: candidate.as_ref().map(|c| c.id).or(existing.candidate_id),
                    candidate_name,
                    candidate_email: candidate_email.or_else(|| existing.candidate_email.clone()),
                    remote_candidate_id: remote_candidate_id
                        .or_else(|| existing.remote_candidate_id.clone()),
                    scheduled_at,
                    duration_minutes,
                    interview_type: classify_interview_type(title).to_string(),
                    status,
                    is_no_show,
                    no_show_count: existing.no_show_count + i64::from(entering_no_show),
                    followup_sent: existing.followup_sent,
                    reschedule_count: existing.reschedule_count,
                    interviewer,
                    outcome: existing.outcome.clone(),
                    notes: event.description.clone().or_else(|| existing.notes.clone()),
                    created_at: existing.created_at,
                    updated_at: now,
                };
                self.store.update_interview(&interview).await?;
                Ok(ReconcileOutcome::Updated)
            }
            None => {
                let interview = Interview {
                    id: 0,
                    external_event_id: event_id.to_string(),
                    candidate_id: candidate.as_ref().map(|c| c.id),
                    candidate_name,
                    candidate_email,
                    remote_candidate_id,
                    scheduled_at,
                    duration_minutes,
                    interview_type: classify_interview_type(title).to_string(),
                    status,
                    is_no_show,
                    no_show_count: i64::from(is_no_show),
                    followup_sent: false,
                    reschedule_count: 0,
                    interviewer,
                    outcome: None,
                    notes: event.description.clone(),
                    created_at: now,
                    updated_at: now,
                };
                self.store.insert_interview(&interview).await?;
                Ok(ReconcileOutcome::Created)
            }
        }
    }
}

fn lead_full_name(lead: &LeadRecord) -> String {
    let joined = [lead.first_name.as_deref(), lead.last_name.as_deref()]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if !joined.is_empty() {
        return joined;
    }
    lead.email.clone().unwrap_or_else(|| "Unknown".to_string())
}

fn joined_languages(lead: &LeadRecord) -> Option<String> {
    let parts = [lead.language.as_deref(), lead.other_languages.as_deref()]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("; "))
    }
}

fn owner_name(owner: Option<&NameRef>) -> Option<String> {
    owner.and_then(|o| o.name()).map(str::to_string)
}

/// Only structured references carry a display name; bare-string references
/// are ids and must not leak into the name column.
fn related_record_name(related: Option<&NameRef>) -> Option<String> {
    match related? {
        NameRef::Record { name, .. } => name.clone(),
        NameRef::Text(_) => None,
    }
}

/// "Phone Screen - J. Doe" style titles carry the candidate after the dash.
fn name_from_title(title: &str) -> Option<String> {
    title
        .split(" - ")
        .nth(1)
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn full_name_falls_back_to_email_then_unknown() {
        let mut lead = LeadRecord {
            first_name: Some(" Maya ".into()),
            last_name: Some("Rivera".into()),
            ..LeadRecord::default()
        };
        assert_eq!(lead_full_name(&lead), "Maya Rivera");

        lead.first_name = None;
        lead.last_name = Some("".into());
        lead.email = Some("maya@example.com".into());
        assert_eq!(lead_full_name(&lead), "maya@example.com");

        lead.email = None;
        assert_eq!(lead_full_name(&lead), "Unknown");
    }

    #[test]
    fn languages_join_primary_and_other() {
        let lead = LeadRecord {
            language: Some("English".into()),
            other_languages: Some("Spanish".into()),
            ..LeadRecord::default()
        };
        assert_eq!(joined_languages(&lead).as_deref(), Some("English; Spanish"));
        assert_eq!(joined_languages(&LeadRecord::default()), None);
    }

    #[test]
    fn title_name_extraction() {
        assert_eq!(name_from_title("Phone Screen - J. Doe").as_deref(), Some("J. Doe"));
        assert_eq!(name_from_title("Interview"), None);
    }

    #[tokio::test]
    async fn derived_flags_follow_remote_status() {
        let store = Store::open_in_memory().await.unwrap();
        let reconciler = Reconciler::new(store.clone());
        let now = Utc::now();

        let cases = [
            ("L-1", "On training", true, false),
            ("L-2", "Failed Training", true, false),
            ("L-3", "Training Completed", false, false),
            ("L-4", "ID Verification", false, true),
            ("L-5", "Documents Downloaded", false, true),
        ];
        for (id, status, training, documents) in cases {
            let lead = LeadRecord {
                id: Some(id.into()),
                lead_status: Some(status.into()),
                ..LeadRecord::default()
            };
            reconciler.reconcile_lead(&lead, now).await.unwrap();
            let c = store.find_candidate_by_external_id(id).await.unwrap().unwrap();
            assert_eq!(c.needs_training, training, "needs_training for {status}");
            assert_eq!(c.has_pending_documents, documents, "documents for {status}");
        }
    }

    #[tokio::test]
    async fn lead_without_id_is_skipped() {
        let store = Store::open_in_memory().await.unwrap();
        let reconciler = Reconciler::new(store.clone());
        let outcome = reconciler
            .reconcile_lead(&LeadRecord::default(), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Skipped);
        assert_eq!(store.count_candidates().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn event_without_start_is_skipped() {
        let store = Store::open_in_memory().await.unwrap();
        let reconciler = Reconciler::new(store.clone());
        let event = EventRecord {
            id: Some("E-1".into()),
            event_title: Some("Interview - Maya".into()),
            ..EventRecord::default()
        };
        let outcome = reconciler.reconcile_event(&event, Utc::now()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Skipped);
    }

    #[tokio::test]
    async fn duration_from_event_end_time() {
        let store = Store::open_in_memory().await.unwrap();
        let reconciler = Reconciler::new(store.clone());
        let start = Utc::now() + Duration::days(1);
        let event = EventRecord {
            id: Some("E-1".into()),
            event_title: Some("Interview - Maya".into()),
            start_at: Some(start),
            end_at: Some(start + Duration::minutes(45)),
            ..EventRecord::default()
        };
        reconciler.reconcile_event(&event, Utc::now()).await.unwrap();
        let iv = store.find_interview_by_event_id("E-1").await.unwrap().unwrap();
        assert_eq!(iv.duration_minutes, 45);
        assert_eq!(iv.candidate_name, "Maya");
        assert_eq!(iv.interview_type, "Interview");
    }
}
