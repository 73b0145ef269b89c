//! Sync controller: the periodic fetch loop and its control surface.
//!
//! ```text
//!   Idle ── start_sync ──► SyncRunning ◄──► FetchRunning
//!    ▲                         │
//!    └──── stop_sync / cancel ─┘ (emits Stopped)
//! ```
//!
//! The first pass runs as soon as the loop starts; later passes run
//! `fetch_interval` seconds after the previous one finished. Changing the
//! interval while the loop runs reschedules the next pass to
//! `now + new interval`.
//!
//! The loop is split in two so callers can learn about a rejected start
//! before spawning anything: [`SyncController::begin_sync`] acquires the
//! sync flag and returns a [`SyncRun`], and [`SyncRun::run`] drives the
//! loop to completion.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Activity, SyncError, SyncResult};
use crate::pipeline::{FetchPipeline, PassSummary};
use crate::progress::ProgressEvent;
use crate::sync_state::{Flag, FlagLease, SyncState, SyncStateStore, SyncStatus};

/// Deadline used when `now + interval` does not fit in an [`Instant`].
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// Handle on a running loop, held by the controller so other callers can
/// stop or reschedule it.
struct TimerControl {
    id: u64,
    stop: CancellationToken,
    reschedule: Arc<Notify>,
    finished: watch::Receiver<bool>,
}

/// Checkpoint snapshot plus the time of the next scheduled pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControllerStatus {
    #[serde(flatten)]
    pub state: SyncState,
    pub next_fetch_at: Option<DateTime<Utc>>,
}

pub struct SyncController {
    state: Arc<SyncStateStore>,
    pipeline: Arc<FetchPipeline>,
    timer: Mutex<Option<TimerControl>>,
    next_run_id: AtomicU64,
    next_fetch_at: watch::Sender<Option<DateTime<Utc>>>,
}

impl SyncController {
    pub fn new(pipeline: Arc<FetchPipeline>) -> Arc<Self> {
        let (next_fetch_at, _) = watch::channel(None);
        Arc::new(Self {
            state: Arc::clone(pipeline.state()),
            pipeline,
            timer: Mutex::new(None),
            next_run_id: AtomicU64::new(1),
            next_fetch_at,
        })
    }

    pub fn state(&self) -> &Arc<SyncStateStore> {
        &self.state
    }

    /// Run the sync loop until [`stop_sync`](Self::stop_sync) is called or
    /// `cancel` fires.
    ///
    /// Returns `Ok(())` after a stop and `Err(Cancelled)` after
    /// cancellation. `Stopped` is the last event sent in both cases.
    pub async fn start_sync(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        events: mpsc::Sender<ProgressEvent>,
    ) -> SyncResult<()> {
        self.begin_sync(cancel).await?.run(events).await
    }

    /// Acquire the sync flag and register the loop's control handle.
    ///
    /// Fails with `AlreadyInProgress(Sync)` if a loop is already running in
    /// this or any other process sharing the checkpoint store.
    pub async fn begin_sync(self: &Arc<Self>, cancel: &CancellationToken) -> SyncResult<SyncRun> {
        let mut timer = self.timer.lock().await;
        if let Some(control) = timer.as_ref() {
            // A run that was dropped without finishing closes its sender.
            let alive = control.finished.has_changed().is_ok() && !*control.finished.borrow();
            if alive {
                return Err(SyncError::AlreadyInProgress(Activity::Sync));
            }
            *timer = None;
        }

        let interval = self.state.fetch_interval().await?;
        let lease = self.state.acquire(Flag::Sync).await?;

        let id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        let token = cancel.child_token();
        let reschedule = Arc::new(Notify::new());
        let (finished_tx, finished_rx) = watch::channel(false);

        *timer = Some(TimerControl {
            id,
            stop: token.clone(),
            reschedule: Arc::clone(&reschedule),
            finished: finished_rx,
        });

        info!(interval_secs = interval, "sync started");
        Ok(SyncRun {
            controller: Arc::clone(self),
            lease: Some(lease),
            id,
            parent: cancel.clone(),
            token,
            reschedule,
            finished: finished_tx,
            interval,
        })
    }

    /// Stop the loop started by this controller and wait for it to exit.
    ///
    /// Returns whether a loop was running. Calling it again is a no-op that
    /// returns `false`.
    pub async fn stop_sync(&self) -> SyncResult<bool> {
        let control = self.timer.lock().await.take();
        let Some(control) = control else {
            debug!("stop requested but no sync loop is running");
            return Ok(false);
        };

        control.stop.cancel();
        let mut finished = control.finished;
        // The loop may already have dropped its sender on exit.
        let _ = finished.wait_for(|done| *done).await;
        Ok(true)
    }

    /// Persist a new interval and, if the loop runs, reschedule its next
    /// pass to `now + secs`.
    pub async fn update_fetch_interval(&self, secs: i64) -> SyncResult<u64> {
        let secs = self.state.set_fetch_interval(secs).await?;
        if let Some(control) = self.timer.lock().await.as_ref() {
            control.reschedule.notify_one();
        }
        info!(interval_secs = secs, "fetch interval updated");
        Ok(secs)
    }

    /// Run a single pass outside the loop.
    pub async fn start_fetch(
        &self,
        cancel: &CancellationToken,
        events: &mpsc::Sender<ProgressEvent>,
    ) -> SyncResult<PassSummary> {
        self.pipeline.run_pass(cancel, events).await
    }

    pub async fn get_is_sync_in_progress(&self) -> SyncResult<bool> {
        self.state.flag(Flag::Sync).await
    }

    pub async fn get_is_fetch_in_progress(&self) -> SyncResult<bool> {
        self.state.flag(Flag::Fetch).await
    }

    pub async fn get_fetch_interval(&self) -> SyncResult<u64> {
        self.state.fetch_interval().await
    }

    pub async fn status(&self) -> SyncResult<ControllerStatus> {
        Ok(ControllerStatus {
            state: self.state.snapshot().await?,
            next_fetch_at: *self.next_fetch_at.borrow(),
        })
    }

    /// Flag changes, published the moment they happen.
    pub fn status_changes(&self) -> watch::Receiver<SyncStatus> {
        self.state.subscribe_status()
    }

    async fn detach(&self, id: u64) {
        let mut timer = self.timer.lock().await;
        if timer.as_ref().is_some_and(|c| c.id == id) {
            *timer = None;
        }
    }
}

/// A started sync loop, returned by [`SyncController::begin_sync`].
pub struct SyncRun {
    controller: Arc<SyncController>,
    lease: Option<FlagLease>,
    id: u64,
    parent: CancellationToken,
    token: CancellationToken,
    reschedule: Arc<Notify>,
    finished: watch::Sender<bool>,
    interval: u64,
}

impl SyncRun {
    pub async fn run(mut self, events: mpsc::Sender<ProgressEvent>) -> SyncResult<()> {
        let controller = Arc::clone(&self.controller);
        let token = self.token.clone();
        let reschedule = Arc::clone(&self.reschedule);
        let mut deadline = Instant::now();
        controller.next_fetch_at.send_replace(Some(Utc::now()));

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = reschedule.notified() => {
                    self.interval = self.current_interval().await;
                    deadline = self.schedule_next();
                    debug!(interval_secs = self.interval, "next pass rescheduled");
                    continue;
                }
                _ = sleep_until(deadline) => {}
            }

            controller.next_fetch_at.send_replace(None);
            match controller.pipeline.run_pass(&token, &events).await {
                Ok(_) => {}
                Err(SyncError::AlreadyInProgress(Activity::Fetch)) => {
                    debug!("previous fetch still running; skipping tick");
                }
                Err(SyncError::Cancelled) => {}
                Err(e) => warn!(error = %e, "fetch pass failed; retrying on next tick"),
            }

            self.interval = self.current_interval().await;
            deadline = self.schedule_next();
        }

        controller.detach(self.id).await;
        controller.next_fetch_at.send_replace(None);
        if let Some(lease) = self.lease.take() {
            lease.release().await;
        }
        let _ = self.finished.send(true);
        let _ = events.send(ProgressEvent::Stopped).await;

        if self.parent.is_cancelled() {
            info!("sync cancelled");
            Err(SyncError::Cancelled)
        } else {
            info!("sync stopped");
            Ok(())
        }
    }

    async fn current_interval(&self) -> u64 {
        match self.controller.state.fetch_interval().await {
            Ok(secs) => secs,
            Err(e) => {
                warn!(error = %e, interval_secs = self.interval, "could not read fetch interval; keeping previous");
                self.interval
            }
        }
    }

    fn schedule_next(&self) -> Instant {
        let now = Instant::now();
        let deadline = now
            .checked_add(Duration::from_secs(self.interval))
            .unwrap_or_else(|| now + FAR_FUTURE);
        let at = i64::try_from(self.interval)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|wait| Utc::now().checked_add_signed(wait));
        self.controller.next_fetch_at.send_replace(at);
        deadline
    }
}
