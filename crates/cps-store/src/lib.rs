//! SQLite persistence for the candidate pipeline cache.
//!
//! The database is a read-optimized mirror of the remote CRM plus an
//! append-only log of sync runs. Writers are the reconciler and the handful
//! of local workflow endpoints; everything else reads. WAL with relaxed
//! durability is acceptable because every remote-owned row can be rebuilt by
//! the next sync.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cps_core::{
    Candidate, Interview, InterviewStatus, PipelineStage, SyncOutcome, SyncRun, SyncScope,
};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cps-store";

/// How long a writer waits on a locked database before giving up.
pub const BUSY_TIMEOUT_SECS: u64 = 30;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS candidates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    external_id TEXT NOT NULL UNIQUE,
    first_name TEXT,
    last_name TEXT,
    full_name TEXT NOT NULL,
    email TEXT,
    phone TEXT,
    mobile TEXT,
    remote_status TEXT,
    stage TEXT NOT NULL,
    tier TEXT,
    languages TEXT,
    recruitment_owner TEXT,
    assessment_passed INTEGER,
    background_check_passed INTEGER,
    specs_approved INTEGER,
    offer_accepted INTEGER,
    needs_training INTEGER NOT NULL DEFAULT 0,
    has_pending_documents INTEGER NOT NULL DEFAULT 0,
    is_unresponsive INTEGER NOT NULL DEFAULT 0,
    notes TEXT,
    remote_created_at TEXT,
    remote_modified_at TEXT,
    last_activity_at TEXT,
    stage_entered_at TEXT,
    days_in_stage INTEGER NOT NULL DEFAULT 0,
    last_synced_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_candidates_email ON candidates(email);
CREATE INDEX IF NOT EXISTS idx_candidates_stage ON candidates(stage);

CREATE TABLE IF NOT EXISTS interviews (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    external_event_id TEXT NOT NULL UNIQUE,
    candidate_id INTEGER REFERENCES candidates(id),
    candidate_name TEXT NOT NULL,
    candidate_email TEXT,
    remote_candidate_id TEXT,
    scheduled_at TEXT NOT NULL,
    duration_minutes INTEGER NOT NULL DEFAULT 30,
    interview_type TEXT NOT NULL,
    status TEXT NOT NULL,
    is_no_show INTEGER NOT NULL DEFAULT 0,
    no_show_count INTEGER NOT NULL DEFAULT 0,
    followup_sent INTEGER NOT NULL DEFAULT 0,
    reschedule_count INTEGER NOT NULL DEFAULT 0,
    interviewer TEXT,
    outcome TEXT,
    notes TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_interviews_scheduled_at ON interviews(scheduled_at);
CREATE INDEX IF NOT EXISTS idx_interviews_candidate_id ON interviews(candidate_id);

CREATE TABLE IF NOT EXISTS sync_runs (
    run_id TEXT PRIMARY KEY,
    scope TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    records_fetched INTEGER NOT NULL DEFAULT 0,
    records_created INTEGER NOT NULL DEFAULT 0,
    records_updated INTEGER NOT NULL DEFAULT 0,
    errors TEXT NOT NULL DEFAULT '[]',
    outcome TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sync_runs_started_at ON sync_runs(started_at);
"#;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("error log encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) the database file and ensure the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        debug!(path = %path.as_ref().display(), "opening candidate store");
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(BUSY_TIMEOUT_SECS));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// In-memory database, single connection so every query sees the same db.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new().in_memory(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        debug!("schema ensured");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // -- candidates ---------------------------------------------------------

    pub async fn find_candidate_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Candidate>, StoreError> {
        let row = sqlx::query("SELECT * FROM candidates WHERE external_id = ?1")
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(candidate_from_row).transpose()
    }

    pub async fn find_candidate_by_email(
        &self,
        email: &str,
    ) -> Result<Option<Candidate>, StoreError> {
        let row = sqlx::query("SELECT * FROM candidates WHERE email = ?1 LIMIT 1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(candidate_from_row).transpose()
    }

    /// Insert a new candidate row, returning its local id.
    pub async fn insert_candidate(&self, c: &Candidate) -> Result<i64, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO candidates (
                external_id, first_name, last_name, full_name, email, phone,
                mobile, remote_status, stage, tier, languages, recruitment_owner,
                assessment_passed, background_check_passed, specs_approved,
                offer_accepted, needs_training, has_pending_documents,
                is_unresponsive, notes, remote_created_at, remote_modified_at,
                last_activity_at, stage_entered_at, days_in_stage,
                last_synced_at, created_at, updated_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26,
                ?27, ?28
            )
            "#,
        )
        .bind(&c.external_id)
        .bind(&c.first_name)
        .bind(&c.last_name)
        .bind(&c.full_name)
        .bind(&c.email)
        .bind(&c.phone)
        .bind(&c.mobile)
        .bind(&c.remote_status)
        .bind(c.stage.as_str())
        .bind(&c.tier)
        .bind(&c.languages)
        .bind(&c.recruitment_owner)
        .bind(c.assessment_passed)
        .bind(c.background_check_passed)
        .bind(c.specs_approved)
        .bind(c.offer_accepted)
        .bind(c.needs_training)
        .bind(c.has_pending_documents)
        .bind(c.is_unresponsive)
        .bind(&c.notes)
        .bind(c.remote_created_at)
        .bind(c.remote_modified_at)
        .bind(c.last_activity_at)
        .bind(c.stage_entered_at)
        .bind(c.days_in_stage)
        .bind(c.last_synced_at)
        .bind(c.created_at)
        .bind(c.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Replace the remote-owned fields of an existing candidate row.
    ///
    /// `is_unresponsive` and `notes` are deliberately absent from the SET
    /// list; they belong to local workflows and survive every sync.
    pub async fn update_candidate(&self, c: &Candidate) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE candidates SET
                first_name = ?1,
                last_name = ?2,
                full_name = ?3,
                email = ?4,
                phone = ?5,
                mobile = ?6,
                remote_status = ?7,
                stage = ?8,
                tier = ?9,
                languages = ?10,
                recruitment_owner = ?11,
                assessment_passed = ?12,
                background_check_passed = ?13,
                specs_approved = ?14,
                offer_accepted = ?15,
                needs_training = ?16,
                has_pending_documents = ?17,
                remote_created_at = ?18,
                remote_modified_at = ?19,
                last_activity_at = ?20,
                stage_entered_at = ?21,
                days_in_stage = ?22,
                last_synced_at = ?23,
                updated_at = ?24
            WHERE id = ?25
            "#,
        )
        .bind(&c.first_name)
        .bind(&c.last_name)
        .bind(&c.full_name)
        .bind(&c.email)
        .bind(&c.phone)
        .bind(&c.mobile)
        .bind(&c.remote_status)
        .bind(c.stage.as_str())
        .bind(&c.tier)
        .bind(&c.languages)
        .bind(&c.recruitment_owner)
        .bind(c.assessment_passed)
        .bind(c.background_check_passed)
        .bind(c.specs_approved)
        .bind(c.offer_accepted)
        .bind(c.needs_training)
        .bind(c.has_pending_documents)
        .bind(c.remote_created_at)
        .bind(c.remote_modified_at)
        .bind(c.last_activity_at)
        .bind(c.stage_entered_at)
        .bind(c.days_in_stage)
        .bind(c.last_synced_at)
        .bind(c.updated_at)
        .bind(c.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Set a candidate's locally-owned workflow fields.
    pub async fn set_candidate_workflow_fields(
        &self,
        id: i64,
        is_unresponsive: bool,
        notes: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE candidates SET is_unresponsive = ?1, notes = ?2, updated_at = ?3 WHERE id = ?4",
        )
        .bind(is_unresponsive)
        .bind(notes)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Recompute `days_in_stage` for every candidate with a known stage entry
    /// time. Run once per sync so the column stays fresh without per-read
    /// arithmetic.
    pub async fn refresh_days_in_stage(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE candidates
               SET days_in_stage = CAST(julianday(?1) - julianday(stage_entered_at) AS INTEGER)
             WHERE stage_entered_at IS NOT NULL
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn count_candidates(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM candidates")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    // -- interviews ---------------------------------------------------------

    pub async fn find_interview_by_event_id(
        &self,
        external_event_id: &str,
    ) -> Result<Option<Interview>, StoreError> {
        let row = sqlx::query("SELECT * FROM interviews WHERE external_event_id = ?1")
            .bind(external_event_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(interview_from_row).transpose()
    }

    pub async fn insert_interview(&self, iv: &Interview) -> Result<i64, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO interviews (
                external_event_id, candidate_id, candidate_name,
                candidate_email, remote_candidate_id, scheduled_at,
                duration_minutes, interview_type, status, is_no_show,
                no_show_count, followup_sent, reschedule_count, interviewer,
                outcome, notes, created_at, updated_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                ?15, ?16, ?17, ?18
            )
            "#,
        )
        .bind(&iv.external_event_id)
        .bind(iv.candidate_id)
        .bind(&iv.candidate_name)
        .bind(&iv.candidate_email)
        .bind(&iv.remote_candidate_id)
        .bind(iv.scheduled_at)
        .bind(iv.duration_minutes)
        .bind(&iv.interview_type)
        .bind(iv.status.as_str())
        .bind(iv.is_no_show)
        .bind(iv.no_show_count)
        .bind(iv.followup_sent)
        .bind(iv.reschedule_count)
        .bind(&iv.interviewer)
        .bind(&iv.outcome)
        .bind(&iv.notes)
        .bind(iv.created_at)
        .bind(iv.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Replace the remote-owned fields of an interview row. `followup_sent`,
    /// `reschedule_count` and `outcome` are local workflow state and are left
    /// untouched.
    pub async fn update_interview(&self, iv: &Interview) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE interviews SET
                candidate_id = ?1,
                candidate_name = ?2,
                candidate_email = ?3,
                remote_candidate_id = ?4,
                scheduled_at = ?5,
                duration_minutes = ?6,
                interview_type = ?7,
                status = ?8,
                is_no_show = ?9,
                no_show_count = ?10,
                interviewer = ?11,
                notes = ?12,
                updated_at = ?13
            WHERE id = ?14
            "#,
        )
        .bind(iv.candidate_id)
        .bind(&iv.candidate_name)
        .bind(&iv.candidate_email)
        .bind(&iv.remote_candidate_id)
        .bind(iv.scheduled_at)
        .bind(iv.duration_minutes)
        .bind(&iv.interview_type)
        .bind(iv.status.as_str())
        .bind(iv.is_no_show)
        .bind(iv.no_show_count)
        .bind(&iv.interviewer)
        .bind(&iv.notes)
        .bind(iv.updated_at)
        .bind(iv.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn count_interviews(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM interviews")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    // -- sync runs ----------------------------------------------------------

    pub async fn record_run_started(&self, run: &SyncRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_runs (run_id, scope, started_at, outcome)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(run.run_id.to_string())
        .bind(run.scope.as_str())
        .bind(run.started_at)
        .bind(run.outcome.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_run_finished(&self, run: &SyncRun) -> Result<(), StoreError> {
        let errors = serde_json::to_string(&run.errors)?;
        sqlx::query(
            r#"
            UPDATE sync_runs SET
                finished_at = ?1,
                records_fetched = ?2,
                records_created = ?3,
                records_updated = ?4,
                errors = ?5,
                outcome = ?6
            WHERE run_id = ?7
            "#,
        )
        .bind(run.finished_at)
        .bind(run.records_fetched)
        .bind(run.records_created)
        .bind(run.records_updated)
        .bind(errors)
        .bind(run.outcome.as_str())
        .bind(run.run_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent run that reached a terminal outcome.
    pub async fn latest_finished_run(&self) -> Result<Option<SyncRun>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT * FROM sync_runs
             WHERE finished_at IS NOT NULL
             ORDER BY started_at DESC
             LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(sync_run_from_row).transpose()
    }

    pub async fn recent_runs(&self, limit: i64) -> Result<Vec<SyncRun>, StoreError> {
        let rows = sqlx::query("SELECT * FROM sync_runs ORDER BY started_at DESC LIMIT ?1")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(sync_run_from_row).collect()
    }
}

fn candidate_from_row(row: &SqliteRow) -> Result<Candidate, StoreError> {
    let stage_raw: String = row.try_get("stage")?;
    let stage = PipelineStage::parse(&stage_raw)
        .ok_or_else(|| StoreError::CorruptRow(format!("unknown stage {stage_raw:?}")))?;
    Ok(Candidate {
        id: row.try_get("id")?,
        external_id: row.try_get("external_id")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        full_name: row.try_get("full_name")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        mobile: row.try_get("mobile")?,
        remote_status: row.try_get("remote_status")?,
        stage,
        tier: row.try_get("tier")?,
        languages: row.try_get("languages")?,
        recruitment_owner: row.try_get("recruitment_owner")?,
        assessment_passed: row.try_get("assessment_passed")?,
        background_check_passed: row.try_get("background_check_passed")?,
        specs_approved: row.try_get("specs_approved")?,
        offer_accepted: row.try_get("offer_accepted")?,
        needs_training: row.try_get("needs_training")?,
        has_pending_documents: row.try_get("has_pending_documents")?,
        is_unresponsive: row.try_get("is_unresponsive")?,
        notes: row.try_get("notes")?,
        remote_created_at: row.try_get("remote_created_at")?,
        remote_modified_at: row.try_get("remote_modified_at")?,
        last_activity_at: row.try_get("last_activity_at")?,
        stage_entered_at: row.try_get("stage_entered_at")?,
        days_in_stage: row.try_get("days_in_stage")?,
        last_synced_at: row.try_get("last_synced_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn interview_from_row(row: &SqliteRow) -> Result<Interview, StoreError> {
    let status_raw: String = row.try_get("status")?;
    let status = InterviewStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::CorruptRow(format!("unknown status {status_raw:?}")))?;
    Ok(Interview {
        id: row.try_get("id")?,
        external_event_id: row.try_get("external_event_id")?,
        candidate_id: row.try_get("candidate_id")?,
        candidate_name: row.try_get("candidate_name")?,
        candidate_email: row.try_get("candidate_email")?,
        remote_candidate_id: row.try_get("remote_candidate_id")?,
        scheduled_at: row.try_get("scheduled_at")?,
        duration_minutes: row.try_get("duration_minutes")?,
        interview_type: row.try_get("interview_type")?,
        status,
        is_no_show: row.try_get("is_no_show")?,
        no_show_count: row.try_get("no_show_count")?,
        followup_sent: row.try_get("followup_sent")?,
        reschedule_count: row.try_get("reschedule_count")?,
        interviewer: row.try_get("interviewer")?,
        outcome: row.try_get("outcome")?,
        notes: row.try_get("notes")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn sync_run_from_row(row: &SqliteRow) -> Result<SyncRun, StoreError> {
    let run_id_raw: String = row.try_get("run_id")?;
    let run_id = Uuid::parse_str(&run_id_raw)
        .map_err(|e| StoreError::CorruptRow(format!("bad run id {run_id_raw:?}: {e}")))?;
    let scope_raw: String = row.try_get("scope")?;
    let scope = SyncScope::parse(&scope_raw)
        .ok_or_else(|| StoreError::CorruptRow(format!("unknown scope {scope_raw:?}")))?;
    let outcome_raw: String = row.try_get("outcome")?;
    let outcome = SyncOutcome::parse(&outcome_raw)
        .ok_or_else(|| StoreError::CorruptRow(format!("unknown outcome {outcome_raw:?}")))?;
    let errors_raw: String = row.try_get("errors")?;
    let errors: Vec<String> = serde_json::from_str(&errors_raw)?;
    Ok(SyncRun {
        run_id,
        scope,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        records_fetched: row.try_get("records_fetched")?,
        records_created: row.try_get("records_created")?,
        records_updated: row.try_get("records_updated")?,
        errors,
        outcome,
    })
}
