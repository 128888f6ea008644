//! End-to-end lifecycle tests against a scripted provider

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::common::Parity;
use crate::math::Degree;
use crate::matcher::CatalogMatcher;
use crate::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::progress::{MemoryProgressStore, ProgressKind, ProgressStatus};
use crate::solve::{SolveError, SolveMachine, SolveOutcome, SolveSettings, SubmitOptions};
use crate::solver::common::{
    Calibration, Declination, JobId, JobStatus, Orientation, PixelScale, PlateSolver,
    RightAscention, SolveHints, SolverError, SubmissionId, SubmissionStatus, WcsHeader,
};
use crate::state::data::{AstrometryStatus as S, CatalogEntry, CatalogType, NewImage};
use crate::state::library::Library;

struct Upload {
    /// Contents of the staged copy, which names the source image
    content: String,
    path: PathBuf,
    hints: Option<SolveHints>,
}

struct Job {
    solves: bool,
    polls: u32,
    settled: bool,
}

/// Provider whose answers are set up front. Every upload gets a job on the
/// first poll; the job finishes after `processing_polls` further polls.
#[derive(Default)]
struct ScriptedSolver {
    /// Per upload: does it solve. Solves once the script runs out.
    outcomes: Mutex<VecDeque<bool>>,
    nova_like: bool,
    reject_auth: bool,
    never_finish: bool,
    no_wcs_file: bool,
    processing_polls: u32,
    transient_job_errors: AtomicU32,
    next_id: AtomicU64,
    jobs: Mutex<HashMap<String, Job>>,
    uploads: Mutex<Vec<Upload>>,
    upload_calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    released: Mutex<Vec<String>>,
}

impl ScriptedSolver {
    fn solving() -> Self {
        Self {
            processing_polls: 1,
            ..Default::default()
        }
    }

    fn with_outcomes(self, outcomes: &[bool]) -> Self {
        *self.outcomes.lock() = outcomes.iter().copied().collect();
        self
    }

    fn upload_hints(&self) -> Vec<Option<SolveHints>> {
        self.uploads.lock().iter().map(|u| u.hints).collect()
    }

    fn released(&self) -> Vec<String> {
        self.released.lock().clone()
    }
}

#[async_trait]
impl PlateSolver for ScriptedSolver {
    fn name(&self) -> &str {
        "scripted"
    }

    fn accepts_hints(&self) -> bool {
        !self.nova_like
    }

    async fn upload(
        &self,
        img: &Path,
        hints: Option<&SolveHints>,
    ) -> Result<SubmissionId, SolverError> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        if self.reject_auth {
            return Err(SolverError::Auth("invalid api key".into()));
        }
        let content = std::fs::read_to_string(img)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let solves = self.outcomes.lock().pop_front().unwrap_or(true);
        self.jobs.lock().insert(
            id.clone(),
            Job {
                solves,
                polls: 0,
                settled: false,
            },
        );
        self.uploads.lock().push(Upload {
            content,
            path: img.to_path_buf(),
            hints: hints.copied().filter(|_| self.accepts_hints()),
        });

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        Ok(SubmissionId::new(id))
    }

    async fn submission_status(
        &self,
        id: &SubmissionId,
    ) -> Result<SubmissionStatus, SolverError> {
        if !self.jobs.lock().contains_key(id.as_str()) {
            return Err(SolverError::UnknownSubmission(id.to_string()));
        }
        Ok(SubmissionStatus {
            job_id: Some(JobId::new(id.to_string())),
        })
    }

    async fn job_status(&self, id: &JobId) -> Result<JobStatus, SolverError> {
        let remaining = self.transient_job_errors.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_job_errors.store(remaining - 1, Ordering::SeqCst);
            return Err(SolverError::Http {
                status: 503,
                url: format!("http://solver.test/api/jobs/{id}"),
            });
        }

        let mut jobs = self.jobs.lock();
        let job = jobs
            .get_mut(id.as_str())
            .ok_or_else(|| SolverError::UnknownSubmission(id.to_string()))?;
        job.polls += 1;
        if self.never_finish || job.polls <= self.processing_polls {
            return Ok(JobStatus::Processing);
        }
        if !job.settled {
            job.settled = true;
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(if job.solves {
            JobStatus::Success
        } else {
            JobStatus::Failure
        })
    }

    async fn calibration(&self, _id: &JobId) -> Result<Calibration, SolverError> {
        Ok(Calibration {
            ra: RightAscention::new(83.82),
            dec: Declination::new(-5.39),
            pixel_scale: PixelScale::from_arcsec(1.5),
            orientation: Orientation::new(0.0),
            parity: Parity::Normal,
            radius: Some(Degree::new(0.5)),
        })
    }

    async fn wcs_header(&self, id: &JobId) -> Result<Option<WcsHeader>, SolverError> {
        if self.no_wcs_file {
            return Err(SolverError::Http {
                status: 404,
                url: format!("http://solver.test/wcs_file/{id}"),
            });
        }
        let header = [
            ("CTYPE1".to_string(), serde_json::json!("RA---TAN-SIP")),
            ("CRVAL1".to_string(), serde_json::json!(83.82)),
        ];
        Ok(Some(header.into_iter().collect()))
    }

    fn result_url(&self, id: &SubmissionId) -> Option<String> {
        Some(format!("http://solver.test/status/{id}"))
    }

    fn release(&self, id: &SubmissionId) {
        self.released.lock().push(id.to_string());
    }
}

fn fast_settings(upload_dir: &Path) -> SolveSettings {
    SolveSettings {
        poll_interval: Duration::from_millis(1),
        max_polls: 50,
        monitor_timeout: Duration::from_secs(10),
        network_retries: 5,
        retry_backoff: Duration::from_millis(1),
        hint_radius: 5.0,
        upload_dir: Some(upload_dir.to_path_buf()),
    }
}

struct Harness {
    library: Arc<Library>,
    solver: Arc<ScriptedSolver>,
    machine: SolveMachine,
    images: TempDir,
    uploads: TempDir,
}

impl Harness {
    fn new(solver: ScriptedSolver) -> Self {
        Self::with_settings(solver, |_| {})
    }

    fn with_settings(solver: ScriptedSolver, tweak: impl FnOnce(&mut SolveSettings)) -> Self {
        let library = Arc::new(Library::open_in_memory().unwrap());
        let solver = Arc::new(solver);
        let images = tempfile::tempdir().unwrap();
        let uploads = tempfile::tempdir().unwrap();
        let mut settings = fast_settings(uploads.path());
        tweak(&mut settings);
        let machine = SolveMachine::new(
            library.clone(),
            solver.clone(),
            CatalogMatcher::new(library.clone()),
            settings,
        );
        Self {
            library,
            solver,
            machine,
            images,
            uploads,
        }
    }

    fn scope(&self) -> String {
        self.images.path().to_string_lossy().into_owned()
    }

    /// Catalog an image file; with `hinted` it carries an approximate position
    fn add_image(&self, name: &str, hinted: bool) -> i64 {
        let path = self.images.path().join(format!("{name}.fits"));
        std::fs::write(&path, name).unwrap();
        self.library
            .insert_image(&NewImage {
                file_path: path.to_string_lossy().into_owned(),
                width: Some(4000),
                height: Some(3000),
                ra_center: hinted.then_some(83.8),
                dec_center: hinted.then_some(-5.4),
                ..Default::default()
            })
            .unwrap()
    }

    fn add_orion_nebula(&self) {
        self.library
            .insert_catalog_entry(&CatalogEntry {
                catalog: CatalogType::Messier,
                designation: "M 42".into(),
                ra: 83.82,
                dec: -5.39,
                common_name: Some("Orion Nebula".into()),
                object_type: None,
                magnitude: Some(4.0),
            })
            .unwrap();
    }

    fn orchestrator(&self, max_concurrent_submissions: usize) -> Orchestrator {
        self.orchestrator_with(max_concurrent_submissions, Duration::from_secs(300))
    }

    fn orchestrator_with(&self, max_concurrent_submissions: usize, stale_after: Duration) -> Orchestrator {
        Orchestrator::new(
            self.machine.clone(),
            Arc::new(MemoryProgressStore::new(Duration::from_secs(3600))),
            OrchestratorSettings {
                max_concurrent_submissions,
                stale_after,
                janitor_interval: Duration::from_millis(10),
                progress_ttl: Duration::from_secs(3600),
            },
        )
    }

    fn status(&self, id: i64) -> S {
        self.library.image(id).unwrap().status
    }

    fn path(&self, id: i64) -> Vec<(S, S)> {
        self.library
            .transitions(id)
            .unwrap()
            .into_iter()
            .map(|t| (t.from, t.to))
            .collect()
    }

    fn staged_files(&self) -> usize {
        std::fs::read_dir(self.uploads.path()).unwrap().count()
    }
}

#[tokio::test]
async fn solved_image_gets_solution_and_matches() {
    let h = Harness::new(ScriptedSolver::solving());
    let id = h.add_image("m42", true);
    h.add_orion_nebula();

    let outcome = h.machine.solve(id, SubmitOptions::default()).await.unwrap();
    assert!(matches!(outcome, SolveOutcome::Solved { matches: Some(1), .. }));

    let image = h.library.image(id).unwrap();
    assert_eq!(image.status, S::Solved);
    assert_eq!(image.result_url.as_deref(), Some("http://solver.test/status/0"));
    assert_eq!(image.field_radius, Some(0.5));
    let header = image.wcs_header.unwrap();
    assert_eq!(header["CTYPE1"], "RA---TAN-SIP");
    assert_eq!(
        h.path(id),
        vec![
            (S::None, S::Submitted),
            (S::Submitted, S::Processing),
            (S::Processing, S::Solved)
        ]
    );

    let hints = h.solver.upload_hints();
    let position = hints[0].unwrap().position.unwrap();
    assert!((position.ra.degrees() - 83.8).abs() < 1e-9);
    assert_eq!(position.radius.degrees(), 5.0);

    let stored = h.library.matches_for_image(id).unwrap();
    assert!((stored[0].pixel_x.unwrap() - 2000.0).abs() < 1e-6);
    assert_eq!(h.solver.released(), vec!["0"]);
}

#[tokio::test]
async fn missing_wcs_file_still_solves() {
    let h = Harness::new(ScriptedSolver {
        no_wcs_file: true,
        ..ScriptedSolver::solving()
    });
    let id = h.add_image("m43", true);

    let outcome = h.machine.solve(id, SubmitOptions::default()).await.unwrap();
    assert!(matches!(outcome, SolveOutcome::Solved { .. }));
    let image = h.library.image(id).unwrap();
    assert_eq!(image.status, S::Solved);
    assert_eq!(image.wcs_header, None);
    assert_eq!(image.ra_center, Some(83.82));
}

#[tokio::test]
async fn failed_resolve_drops_old_matches() {
    let h = Harness::new(ScriptedSolver::solving().with_outcomes(&[true, false, false]));
    let id = h.add_image("m42", true);
    h.add_orion_nebula();

    let outcome = h.machine.solve(id, SubmitOptions::default()).await.unwrap();
    assert!(matches!(outcome, SolveOutcome::Solved { matches: Some(1), .. }));

    // Hinted and blind attempts both fail
    let forced = h
        .machine
        .solve(id, SubmitOptions { force: true, blind: false })
        .await
        .unwrap();
    assert!(matches!(forced, SolveOutcome::Failed { .. }));
    assert_eq!(h.solver.upload_calls.load(Ordering::SeqCst), 3);

    let image = h.library.image(id).unwrap();
    assert_eq!(image.status, S::Failed);
    assert!(!image.is_plate_solved());
    assert_eq!(image.wcs_header, None);
    assert!(h.library.matches_for_image(id).unwrap().is_empty());
}

#[tokio::test]
async fn hinted_failure_falls_back_to_blind_once() {
    let h = Harness::new(ScriptedSolver::solving().with_outcomes(&[false, true]));
    let id = h.add_image("ngc2024", true);

    let outcome = h.machine.solve(id, SubmitOptions::default()).await.unwrap();
    assert!(matches!(outcome, SolveOutcome::Solved { .. }));

    let hints = h.solver.upload_hints();
    assert_eq!(hints.len(), 2);
    assert!(hints[0].is_some());
    assert!(hints[1].is_none());
    assert_eq!(h.solver.released(), vec!["0", "1"]);
    assert_eq!(
        h.path(id),
        vec![
            (S::None, S::Submitted),
            (S::Submitted, S::Processing),
            (S::Processing, S::Failed),
            (S::Failed, S::Submitted),
            (S::Submitted, S::Processing),
            (S::Processing, S::Solved)
        ]
    );
}

#[tokio::test]
async fn blind_fallback_failure_is_final() {
    let h = Harness::new(ScriptedSolver::solving().with_outcomes(&[false, false, true]));
    let id = h.add_image("ic434", true);

    let outcome = h.machine.solve(id, SubmitOptions::default()).await.unwrap();
    assert!(matches!(outcome, SolveOutcome::Failed { .. }));
    assert_eq!(h.solver.upload_calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.status(id), S::Failed);
}

#[tokio::test]
async fn blind_failure_is_not_retried() {
    let h = Harness::new(ScriptedSolver::solving().with_outcomes(&[false]));
    let id = h.add_image("unknown", false);

    let outcome = h.machine.solve(id, SubmitOptions::default()).await.unwrap();
    assert!(matches!(outcome, SolveOutcome::Failed { .. }));
    assert_eq!(h.solver.upload_calls.load(Ordering::SeqCst), 1);

    let image = h.library.image(id).unwrap();
    assert_eq!(image.status, S::Failed);
    assert_eq!(image.failure_reason.as_deref(), Some("scripted could not solve the image"));
}

#[tokio::test]
async fn provider_without_hints_counts_as_blind() {
    let h = Harness::new(ScriptedSolver {
        nova_like: true,
        ..ScriptedSolver::solving().with_outcomes(&[false])
    });
    let id = h.add_image("m1", true);

    let outcome = h.machine.solve(id, SubmitOptions::default()).await.unwrap();
    assert!(matches!(outcome, SolveOutcome::Failed { .. }));
    assert_eq!(h.solver.upload_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn retrying_a_failed_image_is_blind() {
    let h = Harness::new(ScriptedSolver::solving().with_outcomes(&[false, false, true]));
    let id = h.add_image("m78", true);
    h.machine.solve(id, SubmitOptions::default()).await.unwrap();
    assert_eq!(h.status(id), S::Failed);

    let outcome = h.machine.solve(id, SubmitOptions::default()).await.unwrap();
    assert!(matches!(outcome, SolveOutcome::Solved { .. }));
    assert_eq!(h.solver.upload_hints()[2], None);
}

#[tokio::test]
async fn transient_errors_are_retried_within_budget() {
    let solver = ScriptedSolver::solving();
    solver.transient_job_errors.store(5, Ordering::SeqCst);
    let h = Harness::new(solver);
    let id = h.add_image("m33", true);

    let outcome = h.machine.solve(id, SubmitOptions::default()).await.unwrap();
    assert!(matches!(outcome, SolveOutcome::Solved { .. }));
}

#[tokio::test]
async fn exhausted_retries_fail_without_fallback() {
    let solver = ScriptedSolver::solving();
    solver.transient_job_errors.store(6, Ordering::SeqCst);
    let h = Harness::new(solver);
    let id = h.add_image("m81", true);

    match h.machine.solve(id, SubmitOptions::default()).await.unwrap() {
        SolveOutcome::Failed { reason } => assert!(reason.starts_with("polling failed")),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(h.status(id), S::Failed);
    assert_eq!(h.solver.upload_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn auth_errors_fail_fast() {
    let h = Harness::new(ScriptedSolver {
        reject_auth: true,
        ..ScriptedSolver::solving()
    });
    let id = h.add_image("m51", true);

    let err = h.machine.submit(id, SubmitOptions::default()).await.unwrap_err();
    assert!(err.is_config());
    assert_eq!(h.solver.upload_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.status(id), S::Failed);
    assert_eq!(h.staged_files(), 0);
}

#[tokio::test]
async fn one_submission_per_image() {
    let h = Harness::new(ScriptedSolver::solving());
    let id = h.add_image("m101", false);

    let submission = h.machine.submit(id, SubmitOptions::default()).await.unwrap();
    assert!(!submission.hinted);
    assert!(matches!(
        h.machine.submit(id, SubmitOptions { force: true, blind: false }).await,
        Err(SolveError::AlreadyInFlight(_))
    ));

    h.machine.monitor(submission).await.unwrap();
    assert!(matches!(
        h.machine.submit(id, SubmitOptions::default()).await,
        Err(SolveError::NotEligible { status: S::Solved, .. })
    ));
    let forced = h
        .machine
        .solve(id, SubmitOptions { force: true, blind: false })
        .await
        .unwrap();
    assert!(matches!(forced, SolveOutcome::Solved { .. }));
}

#[tokio::test]
async fn monitor_timeout_fails_the_image() {
    let h = Harness::with_settings(
        ScriptedSolver {
            never_finish: true,
            ..ScriptedSolver::solving()
        },
        |s| {
            s.max_polls = u32::MAX;
            s.monitor_timeout = Duration::from_millis(50);
        },
    );
    let id = h.add_image("m104", true);

    match h.machine.solve(id, SubmitOptions::default()).await.unwrap() {
        SolveOutcome::Failed { reason } => assert!(reason.starts_with("no result within")),
        other => panic!("expected timeout, got {other:?}"),
    }
    assert_eq!(h.status(id), S::Failed);
    // Cancelled mid-poll, the submission is still handed back
    assert_eq!(h.solver.released(), vec!["0"]);
}

#[tokio::test]
async fn timeout_after_storing_the_solution_reports_solved() {
    let h = Harness::new(ScriptedSolver::solving());
    let solved = h.add_image("m45", false);
    let pending = h.add_image("m44", false);
    h.machine.solve(solved, SubmitOptions::default()).await.unwrap();
    h.machine.submit(pending, SubmitOptions::default()).await.unwrap();

    match h.machine.settle_timeout(solved).unwrap() {
        SolveOutcome::Solved { job_id, matches } => {
            assert_eq!(job_id, JobId::new("0"));
            assert_eq!(matches, None);
        }
        other => panic!("expected solved, got {other:?}"),
    }
    assert_eq!(h.status(solved), S::Solved);

    assert!(matches!(
        h.machine.settle_timeout(pending).unwrap(),
        SolveOutcome::Failed { .. }
    ));
    assert_eq!(h.status(pending), S::Failed);
}

#[tokio::test]
async fn poll_budget_bounds_a_stuck_job() {
    let h = Harness::with_settings(
        ScriptedSolver {
            never_finish: true,
            ..ScriptedSolver::solving()
        },
        |s| s.max_polls = 3,
    );
    let id = h.add_image("m63", true);

    match h.machine.solve(id, SubmitOptions::default()).await.unwrap() {
        SolveOutcome::Failed { reason } => assert_eq!(reason, "no result after 3 polls"),
        other => panic!("expected failure, got {other:?}"),
    }
    // Giving up on the provider is not a domain failure, so no blind retry
    assert_eq!(h.solver.upload_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn staged_uploads_are_removed() {
    let h = Harness::new(ScriptedSolver::solving().with_outcomes(&[true, false]));
    let solved = h.add_image("m13", false);
    let failed = h.add_image("m92", false);

    h.machine.solve(solved, SubmitOptions::default()).await.unwrap();
    h.machine.solve(failed, SubmitOptions::default()).await.unwrap();

    let uploads = h.solver.uploads.lock();
    assert_eq!(uploads[0].content, "m13");
    assert!(uploads[0].path.starts_with(h.uploads.path()));
    assert!(uploads.iter().all(|u| !u.path.exists()));
    drop(uploads);
    assert_eq!(h.staged_files(), 0);
}

#[tokio::test]
async fn missing_image_file_fails_the_submission() {
    let h = Harness::new(ScriptedSolver::solving());
    let id = h.add_image("gone", false);
    std::fs::remove_file(h.images.path().join("gone.fits")).unwrap();

    assert!(matches!(
        h.machine.submit(id, SubmitOptions::default()).await,
        Err(SolveError::Io(_))
    ));
    assert_eq!(h.status(id), S::Failed);
    assert_eq!(h.solver.upload_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn trigger_solve_returns_before_the_solve_finishes() {
    let h = Harness::new(ScriptedSolver {
        processing_polls: 5,
        ..Default::default()
    });
    let id = h.add_image("m57", false);
    let orchestrator = h.orchestrator(2);

    let triggered = orchestrator
        .trigger_solve(id, SubmitOptions::default())
        .await
        .unwrap();
    assert_eq!(triggered.submission.submission_id, SubmissionId::new("0"));
    assert_eq!(h.status(id), S::Submitted);

    let outcome = triggered.monitor.await.unwrap().unwrap();
    assert!(matches!(outcome, SolveOutcome::Solved { .. }));
    assert_eq!(h.status(id), S::Solved);
}

#[tokio::test]
async fn bulk_solve_bounds_concurrency_and_reports_progress() {
    let h = Harness::new(ScriptedSolver {
        processing_polls: 3,
        ..Default::default()
    });
    let scope = h.scope();
    let plain: Vec<_> = (0..5).map(|i| h.add_image(&format!("plain{i}"), false)).collect();
    let imported = h
        .library
        .insert_image(&NewImage {
            file_path: h.images.path().join("imported.fits").to_string_lossy().into_owned(),
            ra_center: Some(10.0),
            dec_center: Some(41.0),
            solution_imported: true,
            ..Default::default()
        })
        .unwrap();
    std::fs::write(h.images.path().join("imported.fits"), "imported").unwrap();
    let in_flight = h.add_image("busy", false);
    h.library.claim_submission(in_flight, false, None).unwrap();

    let orchestrator = h.orchestrator(2);
    let progress = orchestrator.run_bulk_solve(&scope, false).await.unwrap();

    assert_eq!(progress.status, ProgressStatus::Completed);
    assert_eq!(progress.total, 7);
    assert_eq!(progress.queued, 6);
    assert_eq!(progress.processed, 6);
    assert_eq!(progress.skipped, 1);
    assert_eq!(progress.errors, 0);
    let stored = orchestrator.progress(ProgressKind::Solve, &scope).unwrap();
    assert_eq!(stored.status, ProgressStatus::Completed);
    assert_eq!(stored.processed, progress.processed);

    let max_active = h.solver.max_active.load(Ordering::SeqCst);
    assert!((1..=2).contains(&max_active), "max active {max_active}");
    for id in plain.into_iter().chain([imported]) {
        assert_eq!(h.status(id), S::Solved);
    }

    // Everything solved now, so nothing is eligible without force
    let again = orchestrator.run_bulk_solve(&scope, false).await.unwrap();
    assert_eq!(again.queued, 0);
    assert_eq!(again.skipped, 7);
}

#[tokio::test]
async fn bulk_solve_submits_imported_solutions_first() {
    let h = Harness::new(ScriptedSolver::solving());
    let scope = h.scope();
    h.add_image("first", false);
    h.add_image("second", false);
    let reimported = h
        .library
        .insert_image(&NewImage {
            file_path: h.images.path().join("reimported.fits").to_string_lossy().into_owned(),
            ra_center: Some(83.8),
            dec_center: Some(-5.4),
            solution_imported: true,
            ..Default::default()
        })
        .unwrap();
    std::fs::write(h.images.path().join("reimported.fits"), "reimported").unwrap();

    let progress = h.orchestrator(1).run_bulk_solve(&scope, false).await.unwrap();
    assert_eq!(progress.processed, 3);
    assert_eq!(h.solver.uploads.lock()[0].content, "reimported");
    assert_eq!(h.status(reimported), S::Solved);
}

#[tokio::test]
async fn bulk_solve_stops_on_configuration_errors() {
    let h = Harness::new(ScriptedSolver {
        reject_auth: true,
        ..ScriptedSolver::solving()
    });
    let scope = h.scope();
    for i in 0..4 {
        h.add_image(&format!("img{i}"), false);
    }

    let progress = h.orchestrator(1).run_bulk_solve(&scope, false).await.unwrap();
    assert_eq!(progress.status, ProgressStatus::Failed);
    assert!(progress.error.unwrap().contains("invalid api key"));
    assert!(h.solver.upload_calls.load(Ordering::SeqCst) < 4);
}

#[tokio::test]
async fn trigger_bulk_solve_runs_in_background() {
    let h = Harness::new(ScriptedSolver::solving());
    let scope = h.scope();
    let id = h.add_image("m27", false);
    let orchestrator = h.orchestrator(4);

    let solve_task = orchestrator.trigger_bulk_solve(&scope, false);
    let solved = wait_finished(&orchestrator, ProgressKind::Solve, &scope).await;
    assert_eq!(solved.processed, 1);
    assert_eq!(h.status(id), S::Solved);

    let rematch_task = orchestrator.trigger_bulk_rematch(&scope);
    assert_ne!(solve_task, rematch_task);
    let rematched = wait_finished(&orchestrator, ProgressKind::Match, &scope).await;
    assert_eq!(rematched.status, ProgressStatus::Completed);
    assert_eq!(rematched.processed, 1);
}

async fn wait_finished(
    orchestrator: &Orchestrator,
    kind: ProgressKind,
    scope: &str,
) -> crate::progress::Progress {
    for _ in 0..500 {
        match orchestrator.progress(kind, scope) {
            Some(p) if p.is_finished() => return p,
            _ => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    }
    panic!("bulk {kind} for {scope} did not finish");
}

#[tokio::test]
async fn bulk_rematch_skips_unsolved_images() {
    let h = Harness::new(ScriptedSolver::solving());
    let scope = h.scope();
    let solved = h.add_image("solved", false);
    h.machine.solve(solved, SubmitOptions::default()).await.unwrap();
    h.add_image("pending", false);
    h.library
        .insert_catalog_entry(&CatalogEntry {
            catalog: CatalogType::Ngc,
            designation: "NGC 1976".into(),
            ra: 83.82,
            dec: -5.39,
            common_name: None,
            object_type: None,
            magnitude: None,
        })
        .unwrap();
    assert!(h.library.matches_for_image(solved).unwrap().is_empty());

    let orchestrator = h.orchestrator(2);
    let progress = orchestrator.run_bulk_rematch(&scope).await.unwrap();
    assert_eq!(progress.status, ProgressStatus::Completed);
    assert_eq!(progress.total, 2);
    assert_eq!(progress.processed, 1);
    assert_eq!(progress.skipped, 1);
    assert_eq!(progress.errors, 0);
    assert_eq!(h.library.matches_for_image(solved).unwrap().len(), 1);
    assert!(orchestrator.progress(ProgressKind::Match, &scope).is_some());
}

#[tokio::test]
async fn janitor_fails_stale_images_once() {
    let h = Harness::new(ScriptedSolver::solving());
    let id = h.add_image("m16", false);
    h.machine.submit(id, SubmitOptions::default()).await.unwrap();
    let orchestrator = h.orchestrator(2);

    // Fresh submissions are left alone
    assert!(orchestrator.sweep_stuck(chrono::Utc::now()).unwrap().is_empty());
    assert_eq!(h.status(id), S::Submitted);

    let later = chrono::Utc::now() + chrono::Duration::minutes(10);
    assert_eq!(orchestrator.sweep_stuck(later).unwrap(), vec![id]);
    assert!(orchestrator.sweep_stuck(later).unwrap().is_empty());
    assert_eq!(h.status(id), S::Failed);
    let failures = h.path(id).into_iter().filter(|(_, to)| *to == S::Failed).count();
    assert_eq!(failures, 1);
    assert_eq!(
        h.library.image(id).unwrap().failure_reason.as_deref(),
        Some("no progress for 300s")
    );
}

#[tokio::test]
async fn janitor_spares_images_under_active_monitoring() {
    let h = Harness::with_settings(
        ScriptedSolver {
            processing_polls: 80,
            ..Default::default()
        },
        |s| {
            s.poll_interval = Duration::from_millis(5);
            s.max_polls = 200;
        },
    );
    let id = h.add_image("m20", true);
    let orchestrator = h.orchestrator_with(1, Duration::from_millis(250));

    let submission = h.machine.submit(id, SubmitOptions::default()).await.unwrap();
    let machine = h.machine.clone();
    let monitor = tokio::spawn(async move { machine.monitor(submission).await });

    // Longer in flight than the threshold, but polled all along
    while !monitor.is_finished() {
        assert!(orchestrator.sweep_stuck(chrono::Utc::now()).unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let outcome = monitor.await.unwrap().unwrap();
    assert!(matches!(outcome, SolveOutcome::Solved { .. }));
    assert_eq!(h.status(id), S::Solved);
}

#[tokio::test]
async fn monitor_stops_once_the_janitor_fails_its_image() {
    let h = Harness::new(ScriptedSolver {
        processing_polls: 5,
        ..Default::default()
    });
    let id = h.add_image("m8", true);
    let orchestrator = h.orchestrator(1);
    let submission = h.machine.submit(id, SubmitOptions::default()).await.unwrap();

    let later = chrono::Utc::now() + chrono::Duration::minutes(10);
    assert_eq!(orchestrator.sweep_stuck(later).unwrap(), vec![id]);

    match h.machine.monitor(submission).await.unwrap() {
        SolveOutcome::Failed { reason } => assert_eq!(reason, "no progress for 300s"),
        other => panic!("expected failure, got {other:?}"),
    }
    // No blind fallback for an image someone else settled
    assert_eq!(h.solver.upload_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.path(id), vec![(S::None, S::Submitted), (S::Submitted, S::Failed)]);
    assert_eq!(h.solver.released(), vec!["0"]);
}

#[tokio::test]
async fn janitor_loop_runs_until_shutdown() {
    let h = Harness::new(ScriptedSolver::solving());
    let id = h.add_image("m17", false);
    h.library.claim_submission(id, false, None).unwrap();
    let orchestrator = Orchestrator::new(
        h.machine.clone(),
        Arc::new(MemoryProgressStore::new(Duration::from_secs(3600))),
        OrchestratorSettings {
            max_concurrent_submissions: 1,
            stale_after: Duration::ZERO,
            janitor_interval: Duration::from_millis(10),
            progress_ttl: Duration::from_secs(3600),
        },
    );

    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let janitor = orchestrator.spawn_janitor(async move {
        let _ = stopped.await;
    });

    for _ in 0..200 {
        if h.status(id) == S::Failed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.status(id), S::Failed);

    stop.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), janitor)
        .await
        .unwrap()
        .unwrap();
}
