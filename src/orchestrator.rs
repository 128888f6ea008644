//! Entry points for callers: single and bulk solves, bulk rematch, and the
//! janitor that fails images stuck in flight.
//!
//! Provider load is bounded by a semaphore. A slot is held from upload until
//! the monitor settles the image, so at most `max_concurrent_submissions`
//! images are in flight with the provider at once.

use chrono::{DateTime, Utc};
use derive_more::Display;
use thiserror::Error;
use tokio::sync::{AcquireError, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{error, info, warn};
use uuid::Uuid;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::matcher::MatchError;
use crate::progress::{progress_key, Progress, ProgressKind, ProgressStatus, ProgressStore};
use crate::solve::{SolveError, SolveMachine, SolveOutcome, Submission, SubmitOptions};
use crate::state::data::{AstrometryStatus, Image};
use crate::state::library::LibraryError;

/// Handle for a background bulk run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub struct TaskId(Uuid);

impl TaskId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    pub max_concurrent_submissions: usize,
    pub stale_after: Duration,
    pub janitor_interval: Duration,
    pub progress_ttl: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrent_submissions: config.max_concurrent_submissions.max(1),
            stale_after: config.stale_after,
            janitor_interval: config.janitor_interval,
            progress_ttl: config.progress_ttl,
        }
    }
}

/// A single solve that has been accepted by the provider
pub struct Triggered {
    pub submission: Submission,
    /// Monitor running in the background; dropping it detaches the task
    pub monitor: JoinHandle<Result<SolveOutcome, SolveError>>,
}

#[derive(Clone)]
pub struct Orchestrator {
    machine: SolveMachine,
    progress: Arc<dyn ProgressStore>,
    submissions: Arc<Semaphore>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        machine: SolveMachine,
        progress: Arc<dyn ProgressStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            machine,
            progress,
            submissions: Arc::new(Semaphore::new(settings.max_concurrent_submissions.max(1))),
            settings,
        }
    }

    /// Submit one image and keep monitoring it in the background.
    /// Returns as soon as the provider has accepted the upload.
    pub async fn trigger_solve(
        &self,
        image_id: i64,
        options: SubmitOptions,
    ) -> Result<Triggered, OrchestratorError> {
        let permit = Arc::clone(&self.submissions).acquire_owned().await?;
        let submission = self.machine.submit(image_id, options).await?;

        let machine = self.machine.clone();
        let monitored = submission.clone();
        let monitor = tokio::spawn(async move {
            let _permit = permit;
            machine.monitor(monitored).await
        });

        Ok(Triggered {
            submission,
            monitor,
        })
    }

    /// Start [Orchestrator::run_bulk_solve] in the background
    pub fn trigger_bulk_solve(&self, scope: &str, force: bool) -> TaskId {
        let task_id = TaskId::new();
        let this = self.clone();
        let scope = scope.to_string();
        self.progress
            .set(&progress_key(ProgressKind::Solve, &scope), Progress::running(0));
        tokio::spawn(async move {
            if let Err(e) = this.run_bulk_solve(&scope, force).await {
                error!("Bulk solve {task_id} for {scope:?} failed: {e}");
            }
        });
        task_id
    }

    /// Solve every eligible image under `scope`.
    ///
    /// Images with an imported solution that are not yet SOLVED go first. Without
    /// `force` only unsolved and failed images are eligible; images already in
    /// flight are always skipped. A configuration error from the provider stops
    /// further submissions.
    pub async fn run_bulk_solve(&self, scope: &str, force: bool) -> Result<Progress, OrchestratorError> {
        let key = progress_key(ProgressKind::Solve, scope);
        let images = match self.machine.library().images_in_scope(scope) {
            Ok(images) => images,
            Err(e) => return Err(self.fail_progress(&key, Progress::running(0), e.into())),
        };

        let mut progress = Progress::running(images.len());
        let (mut priority, mut standard) = (Vec::new(), Vec::new());
        for image in &images {
            if image.status.is_in_flight() {
                progress.skipped += 1;
            } else if image.solution_imported && image.status != AstrometryStatus::Solved {
                priority.push(image.id);
            } else if force || is_unsolved(image) {
                standard.push(image.id);
            } else {
                progress.skipped += 1;
            }
        }
        info!(
            "Bulk solve {scope:?}: {} priority, {} standard, {} skipped",
            priority.len(),
            standard.len(),
            progress.skipped
        );
        self.progress.set(&key, progress.clone());

        let options = SubmitOptions { force, blind: false };
        let mut tasks = JoinSet::new();
        let mut halted: Option<String> = None;
        for image_id in priority.into_iter().chain(standard) {
            let permit = Arc::clone(&self.submissions).acquire_owned().await?;
            while let Some(joined) = tasks.try_join_next() {
                self.record_solve(&mut progress, joined, &mut halted);
            }
            if halted.is_some() {
                break;
            }

            let machine = self.machine.clone();
            tasks.spawn(async move {
                let _permit = permit;
                machine.solve(image_id, options).await
            });
            progress.queued += 1;
            self.progress.set(&key, progress.clone());
        }

        while let Some(joined) = tasks.join_next().await {
            self.record_solve(&mut progress, joined, &mut halted);
            self.progress.set(&key, progress.clone());
        }

        match halted {
            Some(reason) => {
                progress.status = ProgressStatus::Failed;
                progress.error = Some(reason);
            }
            None => progress.status = ProgressStatus::Completed,
        }
        self.progress.set(&key, progress.clone());
        self.progress.expire(&key, self.settings.progress_ttl);
        info!(
            "Bulk solve {scope:?} finished: {} processed, {} errors, {} skipped",
            progress.processed, progress.errors, progress.skipped
        );
        Ok(progress)
    }

    fn record_solve(
        &self,
        progress: &mut Progress,
        joined: Result<Result<SolveOutcome, SolveError>, JoinError>,
        halted: &mut Option<String>,
    ) {
        match joined {
            Ok(Ok(_)) => progress.processed += 1,
            // Claimed by someone else since the scope was listed
            Ok(Err(SolveError::AlreadyInFlight(_) | SolveError::NotEligible { .. })) => {
                progress.skipped += 1
            }
            Ok(Err(e)) => {
                progress.processed += 1;
                progress.errors += 1;
                if e.is_config() && halted.is_none() {
                    error!("Bulk solve halted: {e}");
                    *halted = Some(e.to_string());
                } else {
                    warn!("Bulk solve error: {e}");
                }
            }
            Err(e) => {
                progress.processed += 1;
                progress.errors += 1;
                error!("Bulk solve task failed: {e}");
            }
        }
    }

    /// Start [Orchestrator::run_bulk_rematch] in the background
    pub fn trigger_bulk_rematch(&self, scope: &str) -> TaskId {
        let task_id = TaskId::new();
        let this = self.clone();
        let scope = scope.to_string();
        self.progress
            .set(&progress_key(ProgressKind::Match, &scope), Progress::running(0));
        tokio::spawn(async move {
            if let Err(e) = this.run_bulk_rematch(&scope).await {
                error!("Bulk rematch {task_id} for {scope:?} failed: {e}");
            }
        });
        task_id
    }

    /// Rerun catalog matching for every solved image under `scope`.
    /// Unsolved images count as skipped; a failing image does not stop the run.
    pub async fn run_bulk_rematch(&self, scope: &str) -> Result<Progress, OrchestratorError> {
        let key = progress_key(ProgressKind::Match, scope);
        let this = self.clone();
        let scope = scope.to_string();
        let result = tokio::task::spawn_blocking(move || this.rematch_blocking(&scope)).await;
        match result {
            Ok(result) => result,
            Err(e) => Err(self.fail_progress(&key, Progress::running(0), e.into())),
        }
    }

    fn rematch_blocking(&self, scope: &str) -> Result<Progress, OrchestratorError> {
        let key = progress_key(ProgressKind::Match, scope);
        let images = match self.machine.library().images_in_scope(scope) {
            Ok(images) => images,
            Err(e) => return Err(self.fail_progress(&key, Progress::running(0), e.into())),
        };

        let mut progress = Progress::running(images.len());
        self.progress.set(&key, progress.clone());
        let matcher = self.machine.matcher();
        for image in images {
            if !image.is_plate_solved() {
                progress.skipped += 1;
            } else {
                match matcher.match_image(image.id) {
                    Ok(_) => progress.processed += 1,
                    Err(e) => {
                        warn!("Rematch of image {} failed: {e}", image.id);
                        progress.processed += 1;
                        progress.errors += 1;
                    }
                }
            }
            self.progress.set(&key, progress.clone());
        }

        progress.status = ProgressStatus::Completed;
        self.progress.set(&key, progress.clone());
        self.progress.expire(&key, self.settings.progress_ttl);
        info!(
            "Bulk rematch {scope:?} finished: {} processed, {} errors, {} skipped",
            progress.processed, progress.errors, progress.skipped
        );
        Ok(progress)
    }

    pub fn progress(&self, kind: ProgressKind, scope: &str) -> Option<Progress> {
        self.progress.get(&progress_key(kind, scope))
    }

    fn fail_progress(&self, key: &str, mut progress: Progress, e: OrchestratorError) -> OrchestratorError {
        progress.status = ProgressStatus::Failed;
        progress.error = Some(e.to_string());
        self.progress.set(key, progress);
        self.progress.expire(key, self.settings.progress_ttl);
        e
    }

    /// Fail every image that has been in flight longer than the staleness
    /// threshold as of `now`. Returns the rescued image ids.
    pub fn sweep_stuck(&self, now: DateTime<Utc>) -> Result<Vec<i64>, OrchestratorError> {
        let stale_after = chrono::Duration::from_std(self.settings.stale_after)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        let reason = format!("no progress for {:?}", self.settings.stale_after);
        let rescued = self
            .machine
            .library()
            .fail_stale(now - stale_after, &reason)?;
        for image in &rescued {
            warn!(
                "Janitor: image {} ({}) stuck in {} since {}, marked FAILED",
                image.id, image.file_path, image.status, image.updated_at
            );
        }
        Ok(rescued.into_iter().map(|image| image.id).collect())
    }

    /// Sweep on every janitor interval until `shutdown` resolves
    pub async fn run_janitor(&self, shutdown: impl Future<Output = ()>) {
        let mut interval = tokio::time::interval(self.settings.janitor_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    match self.sweep_stuck(Utc::now()) {
                        Ok(rescued) if !rescued.is_empty() => {
                            info!("Janitor rescued {} images", rescued.len())
                        }
                        Ok(_) => {}
                        Err(e) => error!("Janitor sweep failed: {e}"),
                    }
                }
            }
        }
        info!("Janitor stopped");
    }

    pub fn spawn_janitor(
        &self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move { this.run_janitor(shutdown).await })
    }
}

fn is_unsolved(image: &Image) -> bool {
    matches!(
        image.status,
        AstrometryStatus::None | AstrometryStatus::Failed
    )
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(transparent)]
    Library(#[from] LibraryError),
    #[error(transparent)]
    Solve(#[from] SolveError),
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error("Submission slots closed")]
    Closed(#[from] AcquireError),
    #[error(transparent)]
    Join(#[from] JoinError),
}
