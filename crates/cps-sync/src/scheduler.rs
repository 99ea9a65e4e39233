//! Interval scheduler for periodic full syncs, with manual trigger support.
//!
//! At most one sync is in flight at any time: the timer loop and manual
//! triggers contend on the same `try_lock` guard, and a loser is skipped
//! (timer) or rejected (manual) rather than queued.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cps_core::{SyncOutcome, SyncRun, SyncScope};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, error, info, warn};

use crate::{SyncEngine, SyncError};

pub const MIN_INTERVAL_MINUTES: u64 = 5;
pub const MAX_INTERVAL_MINUTES: u64 = 24 * 60;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(
        "interval out of range: {0} minutes (allowed {MIN_INTERVAL_MINUTES}-{MAX_INTERVAL_MINUTES})"
    )]
    IntervalOutOfRange(u64),
    #[error("scheduler is already running")]
    AlreadyRunning,
    #[error("scheduler is not running")]
    NotRunning,
}

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("a sync is already in flight")]
    InFlight,
    #[error(transparent)]
    Sync(#[from] SyncError),
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub syncing: bool,
    pub interval_minutes: u64,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<SyncOutcome>,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct Snapshot {
    next_run_at: Option<DateTime<Utc>>,
    last_run_at: Option<DateTime<Utc>>,
    last_outcome: Option<SyncOutcome>,
    last_error: Option<String>,
}

fn validate_interval(minutes: u64) -> Result<Duration, SchedulerError> {
    if !(MIN_INTERVAL_MINUTES..=MAX_INTERVAL_MINUTES).contains(&minutes) {
        return Err(SchedulerError::IntervalOutOfRange(minutes));
    }
    Ok(Duration::from_secs(minutes * 60))
}

pub struct Scheduler {
    engine: Arc<SyncEngine>,
    in_flight: AsyncMutex<()>,
    interval_tx: watch::Sender<Duration>,
    running: AtomicBool,
    shutdown_tx: StdMutex<Option<watch::Sender<bool>>>,
    snapshot: StdMutex<Snapshot>,
}

impl Scheduler {
    pub fn new(engine: Arc<SyncEngine>, interval_minutes: u64) -> Result<Arc<Self>, SchedulerError> {
        let period = validate_interval(interval_minutes)?;
        let (interval_tx, _) = watch::channel(period);
        Ok(Arc::new(Self {
            engine,
            in_flight: AsyncMutex::new(()),
            interval_tx,
            running: AtomicBool::new(false),
            shutdown_tx: StdMutex::new(None),
            snapshot: StdMutex::new(Snapshot::default()),
        }))
    }

    pub fn interval_minutes(&self) -> u64 {
        self.interval_tx.borrow().as_secs() / 60
    }

    /// Change the interval; a running timer re-arms with the new period.
    pub fn set_interval(&self, minutes: u64) -> Result<(), SchedulerError> {
        let period = validate_interval(minutes)?;
        self.interval_tx.send_replace(period);
        info!(minutes, "sync interval updated");
        Ok(())
    }

    /// Start the timer loop, optionally changing the interval first.
    pub fn start(self: &Arc<Self>, interval_minutes: Option<u64>) -> Result<(), SchedulerError> {
        if let Some(minutes) = interval_minutes {
            self.set_interval(minutes)?;
        }
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(SchedulerError::AlreadyRunning);
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown_tx.lock().unwrap() = Some(shutdown_tx);
        let this = Arc::clone(self);
        tokio::spawn(async move { this.run_loop(shutdown_rx).await });
        info!(minutes = self.interval_minutes(), "scheduler started");
        Ok(())
    }

    /// Stop the timer loop. An in-flight run finishes on its own.
    pub fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Err(SchedulerError::NotRunning);
        }
        if let Some(tx) = self.shutdown_tx.lock().unwrap().take() {
            let _ = tx.send(true);
        }
        self.snapshot.lock().unwrap().next_run_at = None;
        info!("scheduler stopped");
        Ok(())
    }

    /// Run a sync now, regardless of whether the timer loop is running.
    /// Rejected when another sync holds the guard.
    pub async fn trigger(&self, scope: SyncScope) -> Result<SyncRun, TriggerError> {
        let _guard = self.in_flight.try_lock().map_err(|_| TriggerError::InFlight)?;
        match self.engine.run(scope).await {
            Ok(run) => {
                self.note_run(&run);
                Ok(run)
            }
            Err(err) => {
                self.snapshot.lock().unwrap().last_error = Some(err.to_string());
                Err(err.into())
            }
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        let snap = self.snapshot.lock().unwrap();
        SchedulerStatus {
            running: self.running.load(Ordering::Acquire),
            syncing: self.in_flight.try_lock().is_err(),
            interval_minutes: self.interval_minutes(),
            next_run_at: snap.next_run_at,
            last_run_at: snap.last_run_at,
            last_outcome: snap.last_outcome,
            last_error: snap.last_error.clone(),
        }
    }

    fn note_run(&self, run: &SyncRun) {
        let mut snap = self.snapshot.lock().unwrap();
        snap.last_run_at = Some(run.started_at);
        snap.last_outcome = Some(run.outcome);
        snap.last_error = run.errors.last().cloned();
    }

    async fn run_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut interval_rx = self.interval_tx.subscribe();
        loop {
            let period = *interval_rx.borrow_and_update();
            self.snapshot.lock().unwrap().next_run_at =
                Some(Utc::now() + chrono::Duration::seconds(period.as_secs() as i64));

            tokio::select! {
                _ = tokio::time::sleep(period) => {
                    match self.in_flight.try_lock() {
                        Ok(_guard) => {
                            debug!("scheduled sync tick");
                            match self.engine.run(SyncScope::Both).await {
                                Ok(run) => self.note_run(&run),
                                Err(err) => {
                                    error!(error = %err, "scheduled sync failed");
                                    self.snapshot.lock().unwrap().last_error =
                                        Some(err.to_string());
                                }
                            }
                        }
                        // A manual run is in flight; this tick is dropped,
                        // not queued.
                        Err(_) => warn!("sync already in flight, skipping tick"),
                    }
                }
                changed = interval_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    // loop back around to re-arm with the new period
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("scheduler loop exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{ScriptedSource, SlowSource};
    use cps_store::Store;

    async fn idle_scheduler(interval_minutes: u64) -> Result<Arc<Scheduler>, SchedulerError> {
        let store = Store::open_in_memory().await.unwrap();
        let engine = Arc::new(SyncEngine::new(Arc::new(ScriptedSource::default()), store));
        Scheduler::new(engine, interval_minutes)
    }

    #[tokio::test]
    async fn interval_bounds_are_enforced() {
        assert!(matches!(
            idle_scheduler(4).await,
            Err(SchedulerError::IntervalOutOfRange(4))
        ));
        assert!(idle_scheduler(5).await.is_ok());
        assert!(idle_scheduler(1440).await.is_ok());

        let scheduler = idle_scheduler(60).await.unwrap();
        assert!(matches!(
            scheduler.set_interval(1441),
            Err(SchedulerError::IntervalOutOfRange(1441))
        ));
        scheduler.set_interval(30).unwrap();
        assert_eq!(scheduler.interval_minutes(), 30);
    }

    #[tokio::test]
    async fn start_stop_lifecycle() {
        let scheduler = idle_scheduler(60).await.unwrap();
        assert!(!scheduler.status().running);

        scheduler.start(None).unwrap();
        assert!(scheduler.status().running);
        assert!(scheduler.status().next_run_at.is_some());
        assert!(matches!(scheduler.start(None), Err(SchedulerError::AlreadyRunning)));

        scheduler.stop().unwrap();
        assert!(!scheduler.status().running);
        assert!(scheduler.status().next_run_at.is_none());
        assert!(matches!(scheduler.stop(), Err(SchedulerError::NotRunning)));
    }

    #[tokio::test]
    async fn manual_trigger_works_while_stopped() {
        let scheduler = idle_scheduler(60).await.unwrap();
        let run = scheduler.trigger(SyncScope::Both).await.unwrap();
        assert_eq!(run.outcome, SyncOutcome::Success);
        let status = scheduler.status();
        assert!(!status.running);
        assert_eq!(status.last_outcome, Some(SyncOutcome::Success));
        assert!(status.last_run_at.is_some());
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn concurrent_trigger_is_rejected() {
        let store = Store::open_in_memory().await.unwrap();
        let engine = Arc::new(SyncEngine::new(
            Arc::new(SlowSource { delay: Duration::from_millis(200) }),
            store,
        ));
        let scheduler = Scheduler::new(engine, 60).unwrap();

        let background = Arc::clone(&scheduler);
        let first = tokio::spawn(async move { background.trigger(SyncScope::Both).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(scheduler.status().syncing);
        assert!(matches!(
            scheduler.trigger(SyncScope::Candidates).await,
            Err(TriggerError::InFlight)
        ));

        let run = first.await.unwrap().unwrap();
        assert_eq!(run.outcome, SyncOutcome::Success);
        assert!(!scheduler.status().syncing);
        scheduler.trigger(SyncScope::Candidates).await.unwrap();
    }
}
