//! Sync orchestration: pulls Leads and Events from the remote CRM and
//! reconciles them into the local store, one run at a time.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cps_core::{SyncOutcome, SyncRun, SyncScope};
use cps_crm::{CrmClient, CrmError, EventRecord, LeadRecord, MAX_PAGES};
use cps_store::{Store, StoreError};
use tracing::{info, warn};
use uuid::Uuid;

mod reconcile;
mod scheduler;

pub use reconcile::{ReconcileOutcome, Reconciler};
pub use scheduler::{
    Scheduler, SchedulerError, SchedulerStatus, TriggerError, MAX_INTERVAL_MINUTES,
    MIN_INTERVAL_MINUTES,
};

pub const CRATE_NAME: &str = "cps-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_path: PathBuf,
    pub scheduler_enabled: bool,
    pub interval_minutes: u64,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_path: std::env::var("CPS_DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/cps.db")),
            scheduler_enabled: std::env::var("CPS_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            interval_minutes: std::env::var("CPS_SYNC_INTERVAL_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Crm(#[from] CrmError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Paginated access to the remote modules, one page at a time. The bool is
/// the remote's more-records signal.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch_leads(&self, page: u32) -> Result<(Vec<LeadRecord>, bool), CrmError>;
    async fn fetch_events(&self, page: u32) -> Result<(Vec<EventRecord>, bool), CrmError>;
}

#[async_trait]
impl RecordSource for CrmClient {
    async fn fetch_leads(&self, page: u32) -> Result<(Vec<LeadRecord>, bool), CrmError> {
        CrmClient::fetch_leads(self, page).await
    }

    async fn fetch_events(&self, page: u32) -> Result<(Vec<EventRecord>, bool), CrmError> {
        CrmClient::fetch_events(self, page).await
    }
}

/// One-shot sync runner. Fetches the requested scope page by page, feeds
/// every record through the [`Reconciler`], and writes an append-only
/// [`SyncRun`] record with per-record errors collected rather than aborting.
///
/// Only bookkeeping failures (the run log itself) abort a run; a failed page
/// ends its module and a failed record is logged and skipped.
pub struct SyncEngine {
    source: Arc<dyn RecordSource>,
    store: Store,
    reconciler: Reconciler,
}

impl SyncEngine {
    pub fn new(source: Arc<dyn RecordSource>, store: Store) -> Self {
        let reconciler = Reconciler::new(store.clone());
        Self { source, store, reconciler }
    }

    pub async fn run(&self, scope: SyncScope) -> Result<SyncRun, SyncError> {
        let now = Utc::now();
        let mut run = SyncRun::begin(Uuid::new_v4(), scope, now);
        self.store.record_run_started(&run).await?;
        info!(run_id = %run.run_id, scope = scope.as_str(), "sync started");

        let mut auth_failed = false;
        if scope.includes_candidates() {
            auth_failed = self.sync_candidates(&mut run, now).await;
            if let Err(err) = self.store.refresh_days_in_stage(now).await {
                run.errors.push(format!("days-in-stage refresh: {err}"));
            }
        }
        if scope.includes_interviews() {
            if auth_failed {
                // The same credentials back both modules; don't burn retries
                // on a second doomed scope.
                run.errors.push("interviews skipped: authentication failed".into());
            } else {
                self.sync_interviews(&mut run, now).await;
            }
        }

        run.finished_at = Some(Utc::now());
        run.outcome = if run.errors.is_empty() {
            SyncOutcome::Success
        } else if run.records_fetched > 0 {
            SyncOutcome::Partial
        } else {
            SyncOutcome::Failed
        };
        self.store.record_run_finished(&run).await?;
        info!(
            run_id = %run.run_id,
            fetched = run.records_fetched,
            created = run.records_created,
            updated = run.records_updated,
            errors = run.errors.len(),
            outcome = run.outcome.as_str(),
            "sync finished"
        );
        Ok(run)
    }

    /// Returns true when the module failed with an authentication error.
    async fn sync_candidates(&self, run: &mut SyncRun, now: DateTime<Utc>) -> bool {
        let mut page = 1;
        loop {
            match self.source.fetch_leads(page).await {
                Ok((records, more)) => {
                    run.records_fetched += records.len() as i64;
                    for lead in &records {
                        match self.reconciler.reconcile_lead(lead, now).await {
                            Ok(ReconcileOutcome::Created) => run.records_created += 1,
                            Ok(ReconcileOutcome::Updated) => run.records_updated += 1,
                            Ok(ReconcileOutcome::Skipped) => {}
                            Err(err) => run.errors.push(format!(
                                "lead {}: {err}",
                                lead.id.as_deref().unwrap_or("?")
                            )),
                        }
                    }
                    if !more {
                        return false;
                    }
                    page += 1;
                    if page > MAX_PAGES {
                        warn!("leads pagination stopped at the page cap");
                        return false;
                    }
                }
                Err(err) => {
                    let auth = err.is_auth();
                    run.errors.push(format!("leads page {page}: {err}"));
                    return auth;
                }
            }
        }
    }

    async fn sync_interviews(&self, run: &mut SyncRun, now: DateTime<Utc>) {
        let mut page = 1;
        loop {
            match self.source.fetch_events(page).await {
                Ok((records, more)) => {
                    run.records_fetched += records.len() as i64;
                    for event in &records {
                        match self.reconciler.reconcile_event(event, now).await {
                            Ok(ReconcileOutcome::Created) => run.records_created += 1,
                            Ok(ReconcileOutcome::Updated) => run.records_updated += 1,
                            Ok(ReconcileOutcome::Skipped) => {}
                            Err(err) => run.errors.push(format!(
                                "event {}: {err}",
                                event.id.as_deref().unwrap_or("?")
                            )),
                        }
                    }
                    if !more {
                        return;
                    }
                    page += 1;
                    if page > MAX_PAGES {
                        warn!("events pagination stopped at the page cap");
                        return;
                    }
                }
                Err(err) => {
                    run.errors.push(format!("events page {page}: {err}"));
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    type PageResult<T> = Result<(Vec<T>, bool), CrmError>;

    /// Replays queued page results in order; an exhausted queue yields empty
    /// final pages.
    #[derive(Default)]
    pub struct ScriptedSource {
        lead_pages: Mutex<VecDeque<PageResult<LeadRecord>>>,
        event_pages: Mutex<VecDeque<PageResult<EventRecord>>>,
        pub lead_calls: AtomicU32,
        pub event_calls: AtomicU32,
    }

    impl ScriptedSource {
        pub fn push_leads(&self, page: PageResult<LeadRecord>) {
            self.lead_pages.lock().unwrap().push_back(page);
        }

        pub fn push_events(&self, page: PageResult<EventRecord>) {
            self.event_pages.lock().unwrap().push_back(page);
        }
    }

    #[async_trait]
    impl RecordSource for ScriptedSource {
        async fn fetch_leads(&self, _page: u32) -> PageResult<LeadRecord> {
            self.lead_calls.fetch_add(1, Ordering::SeqCst);
            self.lead_pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok((Vec::new(), false)))
        }

        async fn fetch_events(&self, _page: u32) -> PageResult<EventRecord> {
            self.event_calls.fetch_add(1, Ordering::SeqCst);
            self.event_pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok((Vec::new(), false)))
        }
    }

    /// Empty source that holds every fetch for a fixed delay, to observe
    /// in-flight behavior.
    pub struct SlowSource {
        pub delay: Duration,
    }

    #[async_trait]
    impl RecordSource for SlowSource {
        async fn fetch_leads(&self, _page: u32) -> PageResult<LeadRecord> {
            tokio::time::sleep(self.delay).await;
            Ok((Vec::new(), false))
        }

        async fn fetch_events(&self, _page: u32) -> PageResult<EventRecord> {
            tokio::time::sleep(self.delay).await;
            Ok((Vec::new(), false))
        }
    }

    pub fn lead(id: &str, status: &str) -> LeadRecord {
        LeadRecord {
            id: Some(id.to_string()),
            first_name: Some("Maya".into()),
            last_name: Some("Rivera".into()),
            email: Some(format!("{}@example.com", id.to_lowercase())),
            lead_status: Some(status.to_string()),
            ..LeadRecord::default()
        }
    }

    pub fn event(id: &str, title: &str, start: DateTime<Utc>) -> EventRecord {
        EventRecord {
            id: Some(id.to_string()),
            event_title: Some(title.to_string()),
            start_at: Some(start),
            ..EventRecord::default()
        }
    }

    pub async fn engine_with(source: ScriptedSource) -> (SyncEngine, Store) {
        let store = Store::open_in_memory().await.unwrap();
        let engine = SyncEngine::new(Arc::new(source), store.clone());
        (engine, store)
    }
}
