//! Solver wrapper for [ASTAP](https://www.hnsky.org/astap.htm), the Astrometric STAcking Program
//!
//! ASTAP's command line interface provides a ready-to-go plate solving implementation and star database.
//! This is a wrapper around the `astap_cli` command line program that fits it to the
//! submit/poll contract of [PlateSolver]: an upload copies the image into a private
//! working directory and starts `astap_cli` in the background, the submission gains a
//! job once the process has exited, and the calibration is read from the `.wcs` file
//! the solver leaves next to the image.
//!
//! # Setup
//! There is some setup required to use this wrapper.
//!
//! 1. Download the appropriate `astap_cli` application for your OS from the "Alternative links & development version"
//! section of the ASTAP website.
//! 2. Download a corresponding star database (H18, H17, G17, ..)
//! 3. Place *both* the cli executable and the star database files directly in the appropriate location for your OS,
//! or point [AstapSolver::with_cli_path] at a custom install
//!
//! | OS        | ASTAP Folder              |
//! |-----------|---------------------------|
//! | Windows   | `C:/Program Files/astap/` |
//! | MacOS     | `/usr/local/opt/astap/`   |
//! | Linux     | `/opt/astap/`             |
//!

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader as StdBufReader};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::common::{
    Calibration, Declination, JobId, JobStatus, Orientation, PixelScale, PlateSolver,
    RightAscention, SolveHints, SolverError, SubmissionId, SubmissionStatus,
};
use crate::common::Parity;
use crate::math::Degree;

/// ASTAP restarts its search with a wider field each round; give up after this many.
const MAX_SOLVER_ROUNDS: u8 = 3;

/// ASTAP solver wrapper
pub struct AstapSolver {
    cli_path: PathBuf,
    next_id: AtomicU64,
    jobs: Arc<Mutex<HashMap<String, AstapJob>>>,
}

struct AstapJob {
    /// Owns the copied image and the `.wcs` output; removed with the job
    _workdir: TempDir,
    image: PathBuf,
    state: RunState,
    /// Task that owns the `astap_cli` child process
    watcher: Option<AbortHandle>,
}

impl Drop for AstapJob {
    fn drop(&mut self) {
        // The child is killed when its owning task is dropped
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum RunState {
    Running,
    Exited { solved: bool },
}

impl AstapSolver {
    /// Create a new instance of the ASTAP solver wrapper
    /// This does not consume any resources but does check
    /// that the cli application and star database files can be found.
    pub fn new() -> Result<Self, AstapInitError> {
        let (base_path, extension) = Self::base_path()?;

        // /base/path/../astap_cli[.ext]
        let mut cli_path: PathBuf = [base_path, Path::new("astap_cli")].iter().collect();
        if let Some(extension) = extension {
            cli_path.set_extension(extension);
        }
        Self::with_cli_path(cli_path)
    }

    /// Use an `astap_cli` executable at a custom location. The star database
    /// is expected in the same directory.
    pub fn with_cli_path(cli_path: impl Into<PathBuf>) -> Result<Self, AstapInitError> {
        let cli_path = cli_path.into();
        // Check the solver exists
        if !cli_path.try_exists()? {
            return Err(AstapInitError::SolverNotFound);
        }

        let base_path = cli_path.parent().unwrap_or(Path::new("."));
        if !std::fs::read_dir(base_path)?
            .filter_map(|p| p.ok())
            .any(|p| match p.path().extension() {
                None => false,
                Some(os_str) => {
                    matches!(os_str.to_str(), Some("290") | Some("1476") | Some("001"))
                }
            })
        {
            return Err(AstapInitError::DatabaseNotFound);
        }

        Ok(Self {
            cli_path,
            next_id: AtomicU64::new(1),
            jobs: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn base_path() -> Result<(&'static Path, Option<&'static str>), AstapInitError> {
        Ok(match std::env::consts::OS {
            "linux" => (Path::new("/opt/astap/"), None),
            "macos" => (Path::new("/usr/local/opt/astap/"), None),
            "windows" => (Path::new("C:/Program Files/astap/"), Some("exe")),
            os => return Err(AstapInitError::UnsupportedOs(os.to_string())),
        })
    }

    fn state_of(&self, id: &str) -> Result<(RunState, PathBuf), SolverError> {
        let jobs = self.jobs.lock();
        let job = jobs
            .get(id)
            .ok_or_else(|| SolverError::UnknownSubmission(id.to_string()))?;
        Ok((job.state.clone(), job.image.clone()))
    }
}

/// Command line arguments for the optional hints
fn hint_args(hints: &SolveHints) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(position) = hints.position {
        // ASTAP wants RA in hours and declination as south pole distance
        args.push("-ra".to_string());
        args.push((position.ra.degrees() / 15.0).to_string());
        args.push("-spd".to_string());
        args.push((position.dec.degrees() + 90.0).to_string());
        args.push("-r".to_string());
        args.push(position.radius.degrees().to_string());
    }
    args
}

#[async_trait]
impl PlateSolver for AstapSolver {
    fn name(&self) -> &str {
        "astap"
    }

    async fn upload(
        &self,
        img: &Path,
        hints: Option<&SolveHints>,
    ) -> Result<SubmissionId, SolverError> {
        let workdir = tempfile::Builder::new().prefix("astap-").tempdir()?;
        let file_name = img
            .file_name()
            .ok_or_else(|| SolverError::Rejected(format!("not a file: {}", img.display())))?;
        let image = workdir.path().join(file_name);
        tokio::fs::copy(img, &image).await?;

        let mut cmd = Command::new(&self.cli_path);
        cmd.arg("-f")
            .arg(&image)
            .stdout(Stdio::piped())
            .kill_on_drop(true);
        if let Some(hints) = hints {
            cmd.args(hint_args(hints));
        }
        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take();

        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        self.jobs.lock().insert(
            id.clone(),
            AstapJob {
                _workdir: workdir,
                image: image.clone(),
                state: RunState::Running,
                watcher: None,
            },
        );

        // Monitor process
        let jobs = Arc::clone(&self.jobs);
        let job_key = id.clone();
        let watcher = tokio::spawn(async move {
            let mut rounds: u8 = 0;
            let mut exceeded = false;
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.starts_with("ASTAP solver version") {
                        rounds += 1;
                        if rounds >= MAX_SOLVER_ROUNDS {
                            exceeded = true;
                            if let Err(e) = child.start_kill() {
                                warn!("Failed to stop astap_cli: {e}");
                            }
                            break;
                        }
                    }
                }
            }

            let exit_ok = match child.wait().await {
                Ok(status) => status.success(),
                Err(e) => {
                    warn!("astap_cli did not exit cleanly: {e}");
                    false
                }
            };
            let solved = !exceeded && exit_ok && image.with_extension("wcs").exists();
            debug!("astap job {job_key} finished, solved={solved}");

            if let Some(job) = jobs.lock().get_mut(&job_key) {
                job.state = RunState::Exited { solved };
            }
        });
        if let Some(job) = self.jobs.lock().get_mut(&id) {
            job.watcher = Some(watcher.abort_handle());
        }

        info!("Started astap_cli for {}, submission {}", img.display(), id);
        Ok(SubmissionId::new(id))
    }

    async fn submission_status(
        &self,
        id: &SubmissionId,
    ) -> Result<SubmissionStatus, SolverError> {
        let (state, _) = self.state_of(id)?;
        Ok(SubmissionStatus {
            job_id: match state {
                RunState::Running => None,
                RunState::Exited { .. } => Some(JobId::new(id.to_string())),
            },
        })
    }

    async fn job_status(&self, id: &JobId) -> Result<JobStatus, SolverError> {
        let (state, _) = self.state_of(id)?;
        Ok(match state {
            RunState::Running => JobStatus::Processing,
            RunState::Exited { solved: true } => JobStatus::Success,
            RunState::Exited { solved: false } => {
                self.jobs.lock().remove(id.as_str());
                JobStatus::Failure
            }
        })
    }

    async fn calibration(&self, id: &JobId) -> Result<Calibration, SolverError> {
        let (_, image) = self.state_of(id)?;
        // Read wcs
        let result = parse_wcs(&image.with_extension("wcs"));
        // The working copy is no longer needed once the solution is read
        self.jobs.lock().remove(id.as_str());
        result
    }

    fn release(&self, id: &SubmissionId) {
        if self.jobs.lock().remove(id.as_str()).is_some() {
            debug!("astap job {id} released");
        }
    }
}

/// Get value out of string of the format
/// CDELT1  = -6.526249307470E-003 / X pixel size (deg)
fn extract_value(s: &str) -> Option<&str> {
    let (_, rest) = s.split_once('=')?;
    let value = rest.split('/').next()?.trim();
    let value = value.trim_matches('\'').trim();
    (!value.is_empty()).then_some(value)
}

fn parse_card(line: &str) -> Result<f64, SolverError> {
    let value = extract_value(line)
        .ok_or_else(|| SolverError::Protocol(format!("malformed WCS card: {line}")))?;
    Ok(value.parse::<f64>()?)
}

fn parse_wcs(wcs_path: &Path) -> Result<Calibration, SolverError> {
    // Parse resulting .wcs file
    let mut result = Calibration::default();
    let mut seen_center = (false, false);
    let mut cd = [0.0f64; 4];
    let mut cdelt1: Option<f64> = None;
    let mut cdelt2: Option<f64> = None;
    let mut size = (None, None);
    let mut fov: Option<f64> = None;

    let reader = StdBufReader::new(File::open(wcs_path)?);
    for line in reader.lines() {
        let line = line?;
        let key = line.split('=').next().unwrap_or_default().trim();
        match key {
            "CRVAL1" => {
                result.ra = RightAscention::new(parse_card(&line)?);
                seen_center.0 = true;
            }
            "CRVAL2" => {
                result.dec = Declination::new(parse_card(&line)?);
                seen_center.1 = true;
            }
            // Pixel Size
            "CDELT1" => {
                let value = parse_card(&line)?;
                result.pixel_scale = PixelScale::from_degrees(value.abs());
                cdelt1 = Some(value);
            }
            "CDELT2" => cdelt2 = Some(parse_card(&line)?),
            // Image twist
            "CROTA2" => result.orientation = Orientation::new(parse_card(&line)?),
            "CD1_1" => cd[0] = parse_card(&line)?,
            "CD1_2" => cd[1] = parse_card(&line)?,
            "CD2_1" => cd[2] = parse_card(&line)?,
            "CD2_2" => cd[3] = parse_card(&line)?,
            "NAXIS1" => size.0 = Some(parse_card(&line)?),
            "NAXIS2" => size.1 = Some(parse_card(&line)?),
            _ if line.starts_with("WARNING") => {
                if let Some(fov_idx) = line.find("FOV=") {
                    let digits: String = line[fov_idx + 4..]
                        .chars()
                        .take_while(|c| c.is_ascii_digit() || *c == '.')
                        .collect();
                    fov = digits.parse::<f64>().ok();
                }
            }
            _ => {}
        }
    }

    if !(seen_center.0 && seen_center.1) {
        return Err(SolverError::Protocol(format!(
            "{} has no solution",
            wcs_path.display()
        )));
    }

    // Sky images have a negative CD determinant; a positive one is mirrored
    let det = cd[0] * cd[3] - cd[1] * cd[2];
    result.parity = if det != 0.0 {
        Parity::from_sign(-det)
    } else {
        match (cdelt1, cdelt2) {
            (Some(c1), Some(c2)) => Parity::from_sign(-(c1 * c2)),
            _ => Parity::Normal,
        }
    };

    let scale_deg = result.pixel_scale.arcsec() / 3600.0;
    result.radius = match size {
        (Some(w), Some(h)) if scale_deg > 0.0 => Some(Degree::new(0.5 * w.hypot(h) * scale_deg)),
        _ => fov.map(|fov| Degree::new(fov / 2.0)),
    };

    Ok(result)
}

/// Errors from creating the wrapper
/// Likely to occur if you have not followed setup instructions
#[derive(Error, Debug)]
pub enum AstapInitError {
    #[error("Unsupported OS: {0}")]
    UnsupportedOs(String),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Solver not found")]
    SolverNotFound,
    #[error("Star database not found")]
    DatabaseNotFound,
}
