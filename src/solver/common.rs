//! Primitives and traits for plate solving
//!
//! Provides the [PlateSolver] trait as well as the [Calibration] type
//! to help standardize plate solver implementations.
//!
//! Solving is asynchronous on every provider: an image is uploaded, the
//! returned submission is polled until a job appears, and the job is polled
//! until it reaches a terminal state. Most value types are simple newtype
//! wrappers around [crate::math::Degree].
//!

use async_trait::async_trait;
use derive_more::{Deref, Display, From};
use serde_json::Value;
use thiserror::Error;

use std::collections::BTreeMap;
use std::path::Path;

use crate::common::Parity;
use crate::math::Degree;

/// Plate Solver Trait
#[async_trait]
pub trait PlateSolver: Send + Sync {
    /// Short provider name used in logs
    fn name(&self) -> &str;

    /// Whether hints passed to [PlateSolver::upload] are forwarded to the solver.
    /// A provider that drops them always performs a blind solve.
    fn accepts_hints(&self) -> bool {
        true
    }

    async fn upload(
        &self,
        img: &Path,
        hints: Option<&SolveHints>,
    ) -> Result<SubmissionId, SolverError>;

    async fn submission_status(&self, id: &SubmissionId)
        -> Result<SubmissionStatus, SolverError>;

    async fn job_status(&self, id: &JobId) -> Result<JobStatus, SolverError>;

    async fn calibration(&self, id: &JobId) -> Result<Calibration, SolverError>;

    /// Full WCS header of a solved job, including any SIP distortion terms
    async fn wcs_header(&self, _id: &JobId) -> Result<Option<WcsHeader>, SolverError> {
        Ok(None)
    }

    /// User-facing page for a submission, if the provider has one
    fn result_url(&self, _id: &SubmissionId) -> Option<String> {
        None
    }

    /// The caller has stopped monitoring `id`; drop anything held for it
    fn release(&self, _id: &SubmissionId) {}
}

/// FITS header cards by keyword
pub type WcsHeader = BTreeMap<String, Value>;

const FITS_CARD_LEN: usize = 80;
const SKIPPED_CARDS: [&str; 3] = ["HISTORY", "COMMENT", "ExifOffset"];

/// Read the primary header of a FITS file into keyword/value pairs.
/// Commentary cards are dropped; reading stops at `END`.
pub fn parse_fits_header(bytes: &[u8]) -> WcsHeader {
    let mut header = WcsHeader::new();
    for card in bytes.chunks(FITS_CARD_LEN) {
        let card = String::from_utf8_lossy(card);
        let key = card.get(..8).unwrap_or(card.as_ref()).trim();
        if key == "END" {
            break;
        }
        if key.is_empty() || SKIPPED_CARDS.contains(&key) || card.get(8..10) != Some("= ") {
            continue;
        }
        if let Some(value) = card.get(10..).and_then(fits_value) {
            header.insert(key.to_string(), value);
        }
    }
    header
}

fn fits_value(raw: &str) -> Option<Value> {
    let raw = raw.trim_start();
    if let Some(quoted) = raw.strip_prefix('\'') {
        // '' is an escaped quote inside a string
        let mut text = String::new();
        let mut chars = quoted.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    chars.next();
                } else {
                    break;
                }
            }
            text.push(c);
        }
        return Some(Value::String(text.trim_end().to_string()));
    }

    let value = raw.split('/').next()?.trim();
    match value {
        "" => None,
        "T" => Some(Value::Bool(true)),
        "F" => Some(Value::Bool(false)),
        _ => Some(if let Ok(int) = value.parse::<i64>() {
            Value::from(int)
        } else if let Ok(float) = value.replace(['D', 'd'], "E").parse::<f64>() {
            Value::from(float)
        } else {
            Value::String(value.to_string())
        }),
    }
}

/// Opaque provider handle for an upload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, From, Deref)]
pub struct SubmissionId(String);
impl SubmissionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

/// Opaque provider handle for a solve job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display, From, Deref)]
pub struct JobId(String);
impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubmissionStatus {
    /// Set once the provider has started a job for the submission
    pub job_id: Option<JobId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Queued or running
    Processing,
    Success,
    Failure,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Processing)
    }
}

/// Common hints to give to plate solvers
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct SolveHints {
    /// Approximate field center.
    /// If this value is too inaccurate plate solving may fail.
    pub position: Option<PositionHint>,
    pub scale: Option<ScaleHint>,
}

impl SolveHints {
    pub fn is_empty(&self) -> bool {
        self.position.is_none() && self.scale.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionHint {
    pub ra: RightAscention,
    pub dec: Declination,
    /// Search radius around the center
    pub radius: Degree,
}

/// Pixel scale search window, arcsec per pixel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScaleHint {
    pub lower: f64,
    pub upper: f64,
}

impl ScaleHint {
    /// Window of +/-10% around a known scale
    pub fn around(arcsec_per_pixel: f64) -> Self {
        Self {
            lower: arcsec_per_pixel * 0.9,
            upper: arcsec_per_pixel * 1.1,
        }
    }
}

/// Results of plate solving an image
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Calibration {
    pub ra: RightAscention,
    pub dec: Declination,
    pub pixel_scale: PixelScale,
    pub orientation: Orientation,
    pub parity: Parity,
    /// Radius of the solved field, when the provider reports one
    pub radius: Option<Degree>,
}

/// Right ascention
#[derive(Debug, Default, Clone, Copy, PartialEq, PartialOrd, Deref)]
pub struct RightAscention(Degree);
impl RightAscention {
    pub fn new(deg: f64) -> Self {
        Self(Degree::new(deg))
    }
}

/// Declination
#[derive(Debug, Default, Clone, Copy, PartialEq, PartialOrd, Deref)]
pub struct Declination(Degree);
impl Declination {
    pub fn new(deg: f64) -> Self {
        Self(Degree::new(deg))
    }
}

/// Image frame rotation
///
/// units: angle east of north
#[derive(Debug, Default, Clone, Copy, PartialEq, PartialOrd, Deref)]
pub struct Orientation(Degree);
impl Orientation {
    pub fn new(deg: f64) -> Self {
        Self(Degree::new(deg))
    }
}

/// Pixel Scale
///
/// units: arcseconds per pixel
#[derive(Debug, Default, Clone, Copy, PartialEq, PartialOrd)]
pub struct PixelScale(f64);
impl PixelScale {
    pub fn from_arcsec(arcsec: f64) -> Self {
        Self(arcsec)
    }
    pub fn from_degrees(deg: f64) -> Self {
        Self(deg * 3600.0)
    }
    pub fn arcsec(&self) -> f64 {
        self.0
    }
}

/// Errors shared by every solver provider
#[derive(Error, Debug)]
pub enum SolverError {
    #[error("Solver not configured: {0}")]
    Config(String),
    #[error("Solver authentication failed: {0}")]
    Auth(String),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },
    #[error("Unexpected solver response: {0}")]
    Protocol(String),
    #[error("Solver rejected the request: {0}")]
    Rejected(String),
    #[error("Unknown submission {0}")]
    UnknownSubmission(String),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    ParseFloatError(#[from] std::num::ParseFloatError),
}

impl SolverError {
    /// Network blips worth retrying, as opposed to answers from the provider
    pub fn is_transient(&self) -> bool {
        match self {
            SolverError::Transport(e) => !e.is_decode() && !e.is_builder(),
            SolverError::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Missing credentials or configuration; never retried
    pub fn is_config(&self) -> bool {
        matches!(self, SolverError::Config(_) | SolverError::Auth(_))
    }
}
