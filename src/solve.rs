//! Drives one image through plate solving
//!
//! [SolveMachine::submit] claims the image and uploads it; [SolveMachine::monitor]
//! polls the provider until the job settles, stores the solution and runs the
//! catalog matcher. A failed hinted attempt is resubmitted blind exactly once.
//! Network blips are retried with exponential backoff, everything else settles
//! the image as FAILED.

use thiserror::Error;
use tracing::{debug, info, warn};

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::matcher::CatalogMatcher;
use crate::solver::common::{
    JobId, JobStatus, PlateSolver, SolveHints, SolverError, SubmissionId,
};
use crate::state::data::{AstrometryStatus, Image};
use crate::state::library::{Library, LibraryError};

#[derive(Debug, Clone, PartialEq)]
pub struct SolveSettings {
    pub poll_interval: Duration,
    /// Polls per attempt before giving up on the provider
    pub max_polls: u32,
    /// Wall-clock bound for a whole monitor run, fallback included
    pub monitor_timeout: Duration,
    pub network_retries: u32,
    /// First retry delay, doubled on each further retry
    pub retry_backoff: Duration,
    /// Position hint radius when the image has no field radius, degrees
    pub hint_radius: f64,
    /// Where upload copies are staged, the system temp dir when unset
    pub upload_dir: Option<PathBuf>,
}

impl Default for SolveSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl SolveSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval,
            max_polls: config.max_polls,
            monitor_timeout: config.monitor_timeout,
            network_retries: config.network_retries,
            retry_backoff: config.retry_backoff,
            hint_radius: config.hint_radius,
            upload_dir: None,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Allow re-solving an image that is already SOLVED
    pub force: bool,
    /// Never send hints
    pub blind: bool,
}

/// An accepted upload
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub image_id: i64,
    pub submission_id: SubmissionId,
    /// Hints reached the solver, so a failure earns a blind retry
    pub hinted: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SolveOutcome {
    Solved {
        job_id: JobId,
        /// `None` when matching failed; the image stays SOLVED
        matches: Option<usize>,
    },
    Failed {
        reason: String,
    },
}

enum Attempt {
    Solved(JobId),
    /// The provider could not solve the image
    Unsolved(String),
    /// Gave up talking to the provider
    Aborted(String),
    /// Someone else settled the image while it was being polled
    Lost(String),
}

/// Lets the provider drop what it keeps for a submission once nobody polls it,
/// including when the monitor is cancelled by its timeout.
struct Release<'a> {
    solver: &'a dyn PlateSolver,
    id: SubmissionId,
}

impl Drop for Release<'_> {
    fn drop(&mut self) {
        self.solver.release(&self.id);
    }
}

/// Status writes are single-row statements and run inline on the async
/// runtime; catalog matching scans the catalogs and goes to the blocking pool.
#[derive(Clone)]
pub struct SolveMachine {
    library: Arc<Library>,
    solver: Arc<dyn PlateSolver>,
    matcher: CatalogMatcher,
    settings: SolveSettings,
}

impl SolveMachine {
    pub fn new(
        library: Arc<Library>,
        solver: Arc<dyn PlateSolver>,
        matcher: CatalogMatcher,
        settings: SolveSettings,
    ) -> Self {
        Self {
            library,
            solver,
            matcher,
            settings,
        }
    }

    pub fn library(&self) -> &Arc<Library> {
        &self.library
    }

    pub fn matcher(&self) -> &CatalogMatcher {
        &self.matcher
    }

    /// Submit then monitor to completion
    pub async fn solve(&self, image_id: i64, options: SubmitOptions) -> Result<SolveOutcome, SolveError> {
        let submission = self.submit(image_id, options).await?;
        self.monitor(submission).await
    }

    /// Claim the image and upload it to the provider.
    ///
    /// A FAILED image is resubmitted without hints. If the upload fails the
    /// image is settled as FAILED before the error is returned.
    pub async fn submit(&self, image_id: i64, options: SubmitOptions) -> Result<Submission, SolveError> {
        let image = self.library.image(image_id)?;
        let previous = self
            .library
            .claim_submission(image_id, options.force, None)
            .map_err(|e| match e {
                LibraryError::InvalidTransition { from, .. } if from.is_in_flight() => {
                    SolveError::AlreadyInFlight(image_id)
                }
                LibraryError::InvalidTransition { from, .. } => SolveError::NotEligible {
                    id: image_id,
                    status: from,
                },
                e => e.into(),
            })?;

        let hints = if options.blind || previous == AstrometryStatus::Failed {
            None
        } else {
            image.hints(self.settings.hint_radius)
        };
        let hinted = hints.is_some() && self.solver.accepts_hints();

        match self.upload(&image, hints.as_ref()).await {
            Ok(submission_id) => {
                self.library.set_submission_id(image_id, &submission_id)?;
                info!(
                    "Image {image_id} submitted to {} as {submission_id} ({})",
                    self.solver.name(),
                    if hinted { "hinted" } else { "blind" }
                );
                Ok(Submission {
                    image_id,
                    submission_id,
                    hinted,
                })
            }
            Err(e) => {
                let reason = format!("upload failed: {e}");
                warn!("Image {image_id}: {reason}");
                self.settle_failed(image_id, &reason);
                Err(e)
            }
        }
    }

    /// Upload a private copy of the image. The copy is removed when this returns.
    async fn upload(&self, image: &Image, hints: Option<&SolveHints>) -> Result<SubmissionId, SolveError> {
        let source = Path::new(&image.file_path);
        let suffix = source
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| format!(".{ext}"))
            .unwrap_or_default();
        let mut builder = tempfile::Builder::new();
        builder.prefix("astrocat-upload-").suffix(&suffix);
        let artifact = match &self.settings.upload_dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        tokio::fs::copy(source, artifact.path()).await?;

        let solver = &self.solver;
        let path = artifact.path();
        let id = self
            .with_retry("upload", move || solver.upload(path, hints))
            .await?;
        Ok(id)
    }

    /// Poll a submission until it settles.
    ///
    /// Returns `Failed` for every provider-side outcome; `Err` only when the
    /// library itself fails.
    pub async fn monitor(&self, submission: Submission) -> Result<SolveOutcome, SolveError> {
        let image_id = submission.image_id;
        let outcome =
            match tokio::time::timeout(self.settings.monitor_timeout, self.drive(submission)).await {
                Ok(outcome) => outcome,
                Err(_) => return self.settle_timeout(image_id),
            };
        match outcome {
            Err(SolveError::Library(LibraryError::InvalidTransition { from, .. }))
                if !from.is_in_flight() =>
            {
                Ok(SolveOutcome::Failed {
                    reason: self.lost_reason(image_id, from)?,
                })
            }
            outcome => outcome,
        }
    }

    /// The monitor ran out of time. An image that reached SOLVED just before
    /// stays solved; its matching may still be running.
    pub(crate) fn settle_timeout(&self, image_id: i64) -> Result<SolveOutcome, SolveError> {
        let image = self.library.image(image_id)?;
        if image.status == AstrometryStatus::Solved {
            info!("Image {image_id}: monitor timed out after the solution was stored");
            return Ok(SolveOutcome::Solved {
                job_id: JobId::new(image.job_id.unwrap_or_default()),
                matches: None,
            });
        }

        let reason = format!(
            "no result within {}s",
            self.settings.monitor_timeout.as_secs_f64()
        );
        warn!("Image {image_id}: {reason}");
        self.settle_failed(image_id, &reason);
        Ok(SolveOutcome::Failed { reason })
    }

    fn lost_reason(&self, image_id: i64, status: AstrometryStatus) -> Result<String, SolveError> {
        let image = self.library.image(image_id)?;
        let reason = image
            .failure_reason
            .unwrap_or_else(|| format!("settled elsewhere as {status}"));
        warn!("Image {image_id}: stopped monitoring, {reason}");
        Ok(reason)
    }

    async fn drive(&self, mut submission: Submission) -> Result<SolveOutcome, SolveError> {
        let image_id = submission.image_id;
        loop {
            let _release = Release {
                solver: self.solver.as_ref(),
                id: submission.submission_id.clone(),
            };
            let reason = match self.poll(&submission).await? {
                Attempt::Solved(job_id) => return self.finish_solved(&submission, job_id).await,
                Attempt::Aborted(reason) => {
                    self.library.mark_failed(image_id, &reason)?;
                    warn!("Image {image_id}: {reason}");
                    return Ok(SolveOutcome::Failed { reason });
                }
                Attempt::Lost(reason) => return Ok(SolveOutcome::Failed { reason }),
                Attempt::Unsolved(reason) => reason,
            };

            self.library.mark_failed(image_id, &reason)?;
            if !submission.hinted {
                warn!("Image {image_id}: {reason}");
                return Ok(SolveOutcome::Failed { reason });
            }

            info!("Image {image_id}: hinted solve failed ({reason}), retrying blind");
            submission = match self
                .submit(
                    image_id,
                    SubmitOptions {
                        force: false,
                        blind: true,
                    },
                )
                .await
            {
                Ok(submission) => submission,
                Err(SolveError::Solver(e)) => {
                    return Ok(SolveOutcome::Failed {
                        reason: format!("blind resubmission failed: {e}"),
                    })
                }
                Err(e) => return Err(e),
            };
        }
    }

    async fn poll(&self, submission: &Submission) -> Result<Attempt, SolveError> {
        let image_id = submission.image_id;
        let solver = &self.solver;
        let submission_id = &submission.submission_id;
        let mut job: Option<JobId> = None;

        for attempt in 1..=self.settings.max_polls {
            tokio::time::sleep(self.settings.poll_interval).await;
            if !self.library.heartbeat(image_id)? {
                let status = self.library.image(image_id)?.status;
                return Ok(Attempt::Lost(self.lost_reason(image_id, status)?));
            }

            if job.is_none() {
                let status = match self
                    .with_retry("submission status", move || {
                        solver.submission_status(submission_id)
                    })
                    .await
                {
                    Ok(status) => status,
                    Err(e) => return Ok(Attempt::Aborted(format!("polling failed: {e}"))),
                };
                debug!("Image {image_id}: poll {attempt}, submission {submission_id}: {status:?}");
                if let Some(job_id) = status.job_id {
                    self.library.mark_processing(image_id, &job_id)?;
                    info!("Image {image_id}: job {job_id} started");
                    job = Some(job_id);
                }
            }
            let Some(job_id) = &job else {
                continue;
            };

            let status = match self
                .with_retry("job status", move || solver.job_status(job_id))
                .await
            {
                Ok(status) => status,
                Err(e) => return Ok(Attempt::Aborted(format!("polling failed: {e}"))),
            };
            debug!("Image {image_id}: poll {attempt}, job {job_id}: {status:?}");
            match status {
                JobStatus::Processing => {}
                JobStatus::Success => return Ok(Attempt::Solved(job_id.clone())),
                JobStatus::Failure => {
                    return Ok(Attempt::Unsolved(format!(
                        "{} could not solve the image",
                        solver.name()
                    )))
                }
            }
        }

        Ok(Attempt::Aborted(format!(
            "no result after {} polls",
            self.settings.max_polls
        )))
    }

    async fn finish_solved(&self, submission: &Submission, job_id: JobId) -> Result<SolveOutcome, SolveError> {
        let image_id = submission.image_id;
        let solver = &self.solver;
        let job = &job_id;
        let calibration = match self
            .with_retry("calibration", move || solver.calibration(job))
            .await
        {
            Ok(calibration) => calibration,
            Err(e) => {
                let reason = format!("calibration unavailable: {e}");
                self.library.mark_failed(image_id, &reason)?;
                warn!("Image {image_id}: {reason}");
                return Ok(SolveOutcome::Failed { reason });
            }
        };

        let wcs_header = match self
            .with_retry("WCS header", move || solver.wcs_header(job))
            .await
        {
            Ok(header) => header,
            Err(e) => {
                warn!("Image {image_id}: WCS header unavailable: {e}");
                None
            }
        };

        let result_url = self.solver.result_url(&submission.submission_id);
        self.library.mark_solved(
            image_id,
            &calibration,
            result_url.as_deref(),
            wcs_header.as_ref(),
        )?;
        info!(
            "Image {image_id} solved: ra={} dec={} scale={:.3}\"/px",
            calibration.ra.degrees(),
            calibration.dec.degrees(),
            calibration.pixel_scale.arcsec()
        );

        let matcher = self.matcher.clone();
        let matches = match tokio::task::spawn_blocking(move || matcher.match_image(image_id)).await {
            Ok(Ok(count)) => {
                info!("Image {image_id}: {count} catalog matches");
                Some(count)
            }
            Ok(Err(e)) => {
                warn!("Image {image_id}: catalog matching failed: {e}");
                None
            }
            Err(e) => {
                warn!("Image {image_id}: catalog matching panicked: {e}");
                None
            }
        };

        Ok(SolveOutcome::Solved { job_id, matches })
    }

    /// Run a provider call, retrying transient failures with exponential backoff
    async fn with_retry<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T, SolverError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SolverError>>,
    {
        let mut retries = 0;
        loop {
            match call().await {
                Err(e) if e.is_transient() && retries < self.settings.network_retries => {
                    let delay = self.settings.retry_backoff * 2u32.saturating_pow(retries);
                    retries += 1;
                    warn!(
                        "{what} failed: {e}, retry {retries}/{} in {delay:?}",
                        self.settings.network_retries
                    );
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }

    /// Best effort FAILED, for paths that already have an error to report
    fn settle_failed(&self, image_id: i64, reason: &str) {
        if let Err(e) = self.library.mark_failed(image_id, reason) {
            debug!("Image {image_id}: not marked failed: {e}");
        }
    }
}

#[derive(Error, Debug)]
pub enum SolveError {
    #[error("Image {0} already has a submission in flight")]
    AlreadyInFlight(i64),
    #[error("Image {id} is {status} and cannot be submitted")]
    NotEligible { id: i64, status: AstrometryStatus },
    #[error(transparent)]
    Library(#[from] LibraryError),
    #[error(transparent)]
    Solver(#[from] SolverError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SolveError {
    /// Missing credentials or provider setup
    pub fn is_config(&self) -> bool {
        matches!(self, SolveError::Solver(e) if e.is_config())
    }
}
