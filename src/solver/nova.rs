//! Client for the [astrometry.net](https://nova.astrometry.net/api_help) web API
//!
//! The same API is served by the public Nova instance and by self-hosted
//! astrometry.net servers; only the base URL and API key differ. The public
//! instance is always asked for a fully blind solve, a local server gets
//! default scale bounds plus whatever hints the caller has.

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::multipart;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use super::common::{
    parse_fits_header, Calibration, Declination, JobId, JobStatus, Orientation, PixelScale,
    PlateSolver, RightAscention, SolveHints, SolverError, SubmissionId, SubmissionStatus,
    WcsHeader,
};
use crate::common::Parity;
use crate::math::Degree;

pub const NOVA_API_URL: &str = "http://nova.astrometry.net/api";
const NOVA_ROOT_URL: &str = "http://nova.astrometry.net";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// astrometry.net API client
#[derive(Debug)]
pub struct AstrometryNetClient {
    api_key: String,
    base_url: String,
    session_key: Mutex<Option<String>>,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    status: String,
    session: Option<String>,
    #[serde(default, alias = "errormessage")]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    status: String,
    subid: Option<u64>,
    #[serde(default, alias = "errormessage")]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubmissionStatusResponse {
    #[serde(default)]
    jobs: Vec<Option<u64>>,
}

#[derive(Debug, Deserialize)]
struct JobStatusResponse {
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CalibrationResponse {
    ra: Option<f64>,
    dec: Option<f64>,
    radius: Option<f64>,
    pixscale: Option<f64>,
    orientation: Option<f64>,
    parity: Option<f64>,
}

impl AstrometryNetClient {
    /// Create a client for the API rooted at `base_url` (e.g. `http://host/api`).
    /// Fails if either the key or the URL is missing.
    pub fn new(api_key: &str, base_url: &str) -> Result<Self, SolverError> {
        if api_key.trim().is_empty() {
            return Err(SolverError::Config("astrometry.net API key is empty".into()));
        }
        let base_url = base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(SolverError::Config("astrometry.net API URL is empty".into()));
        }

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            api_key: api_key.trim().to_string(),
            base_url: base_url.to_string(),
            session_key: Mutex::new(None),
            client,
        })
    }

    /// Client for the public Nova service
    pub fn nova(api_key: &str) -> Result<Self, SolverError> {
        Self::new(api_key, NOVA_API_URL)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Whether this client talks to the public Nova instance
    pub fn is_nova(&self) -> bool {
        self.base_url.contains("nova.astrometry.net")
    }

    /// Site root, without the `/api` suffix
    fn root_url(&self) -> String {
        if self.is_nova() {
            NOVA_ROOT_URL.to_string()
        } else {
            self.base_url.trim_end_matches("/api").to_string()
        }
    }

    /// Login to the API for a new session key.
    async fn login(&self) -> Result<String, SolverError> {
        let url = format!("{}/login", self.base_url);
        let request_json = json!({ "apikey": self.api_key });

        let response = self
            .client
            .post(&url)
            .form(&[("request-json", request_json.to_string())])
            .send()
            .await?;
        let login: LoginResponse = Self::read_json(response, &url).await?;

        if login.status != "success" {
            return Err(SolverError::Auth(
                login.message.unwrap_or_else(|| "Unknown error".to_string()),
            ));
        }
        let session = login
            .session
            .ok_or_else(|| SolverError::Protocol("login response carried no session".into()))?;

        info!("Logged in to {}", self.base_url);
        Ok(session)
    }

    async fn upload_with_session(
        &self,
        img: &Path,
        hints: Option<&SolveHints>,
        session: String,
    ) -> Result<SubmissionId, SolverError> {
        let url = format!("{}/upload", self.base_url);

        let request_json = upload_request_json(&session, hints, self.is_nova());
        let mut logged = request_json.clone();
        logged["session"] = json!("REDACTED");
        debug!("Submitting to {} with payload {}", self.base_url, logged);

        let file_name = img
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        let file_contents = tokio::fs::read(img).await?;

        let form = multipart::Form::new()
            .text("request-json", request_json.to_string())
            .part(
                "file",
                multipart::Part::bytes(file_contents)
                    .file_name(file_name)
                    .mime_str("application/octet-stream")?,
            );

        let response = self.client.post(&url).multipart(form).send().await?;
        let upload: UploadResponse = Self::read_json(response, &url).await?;

        if upload.status != "success" {
            return Err(SolverError::Rejected(
                upload.message.unwrap_or_else(|| "Unknown error".to_string()),
            ));
        }

        let subid = upload
            .subid
            .ok_or_else(|| SolverError::Protocol("no submission ID in upload response".into()))?;
        info!("Uploaded {}, submission {}", img.display(), subid);
        Ok(SubmissionId::new(subid.to_string()))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, SolverError> {
        let response = self.client.get(url).send().await?;
        Self::read_json(response, url).await
    }

    async fn read_json<T: DeserializeOwned>(
        response: reqwest::Response,
        url: &str,
    ) -> Result<T, SolverError> {
        Ok(Self::check_status(response, url)?.json().await?)
    }

    fn check_status(
        response: reqwest::Response,
        url: &str,
    ) -> Result<reqwest::Response, SolverError> {
        let status = response.status();
        if !status.is_success() {
            return Err(SolverError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response)
    }
}

/// Run `call` with the cached session, logging in first when there is none.
/// A rejection under a cached session is retried once with a fresh login,
/// since sessions expire server-side.
async fn with_session<T, L, LF, C, CF>(
    cache: &Mutex<Option<String>>,
    login: L,
    call: C,
) -> Result<T, SolverError>
where
    L: Fn() -> LF,
    LF: Future<Output = Result<String, SolverError>>,
    C: Fn(String) -> CF,
    CF: Future<Output = Result<T, SolverError>>,
{
    let cached = cache.lock().clone();
    let from_cache = cached.is_some();
    let session = match cached {
        Some(session) => session,
        None => {
            let session = login().await?;
            *cache.lock() = Some(session.clone());
            session
        }
    };

    match call(session).await {
        Err(SolverError::Rejected(message)) => {
            *cache.lock() = None;
            if !from_cache {
                return Err(SolverError::Rejected(message));
            }
            warn!("Request rejected with a cached session ({message}), logging in again");
            let session = login().await?;
            *cache.lock() = Some(session.clone());
            let result = call(session).await;
            if matches!(result, Err(SolverError::Rejected(_))) {
                *cache.lock() = None;
            }
            result
        }
        other => other,
    }
}

/// Build the `request-json` payload for an upload
fn upload_request_json(session: &str, hints: Option<&SolveHints>, blind_only: bool) -> Value {
    let mut req = Map::new();
    req.insert("publicly_visible".into(), json!("n"));
    req.insert("allow_commercial_use".into(), json!("d"));
    req.insert("allow_modifications".into(), json!("d"));
    req.insert("session".into(), json!(session));

    if blind_only {
        return Value::Object(req);
    }

    req.insert("scale_units".into(), json!("degwidth"));
    req.insert("scale_lower".into(), json!(0.1));
    req.insert("scale_upper".into(), json!(180.0));

    if let Some(hints) = hints {
        if let Some(position) = hints.position {
            req.insert("center_ra".into(), json!(position.ra.degrees()));
            req.insert("center_dec".into(), json!(position.dec.degrees()));
            req.insert("radius".into(), json!(position.radius.degrees()));
        }
        if let Some(scale) = hints.scale {
            req.insert("scale_units".into(), json!("arcsecperpix"));
            req.insert("scale_lower".into(), json!(scale.lower));
            req.insert("scale_upper".into(), json!(scale.upper));
        }
    }
    Value::Object(req)
}

fn parse_calibration(raw: CalibrationResponse) -> Result<Calibration, SolverError> {
    let missing = |field: &str| SolverError::Protocol(format!("calibration missing `{field}`"));
    Ok(Calibration {
        ra: RightAscention::new(raw.ra.ok_or_else(|| missing("ra"))?),
        dec: Declination::new(raw.dec.ok_or_else(|| missing("dec"))?),
        pixel_scale: PixelScale::from_arcsec(raw.pixscale.ok_or_else(|| missing("pixscale"))?),
        orientation: Orientation::new(raw.orientation.unwrap_or(0.0)),
        parity: Parity::from_sign(raw.parity.unwrap_or(1.0)),
        radius: raw.radius.map(Degree::new),
    })
}

#[async_trait]
impl PlateSolver for AstrometryNetClient {
    fn name(&self) -> &str {
        if self.is_nova() {
            "nova"
        } else {
            "local"
        }
    }

    fn accepts_hints(&self) -> bool {
        !self.is_nova()
    }

    async fn upload(
        &self,
        img: &Path,
        hints: Option<&SolveHints>,
    ) -> Result<SubmissionId, SolverError> {
        if self.is_nova() && hints.is_some() {
            info!("Uploading to the public Nova server, dropping hints for a blind solve");
        }
        with_session(
            &self.session_key,
            || self.login(),
            |session| self.upload_with_session(img, hints, session),
        )
        .await
    }

    async fn submission_status(
        &self,
        id: &SubmissionId,
    ) -> Result<SubmissionStatus, SolverError> {
        let url = format!("{}/submissions/{}", self.base_url, id);
        let status: SubmissionStatusResponse = self.get_json(&url).await?;

        let job_id = status
            .jobs
            .into_iter()
            .flatten()
            .next()
            .map(|job| JobId::new(job.to_string()));
        Ok(SubmissionStatus { job_id })
    }

    async fn job_status(&self, id: &JobId) -> Result<JobStatus, SolverError> {
        let url = format!("{}/jobs/{}", self.base_url, id);
        let status: JobStatusResponse = self.get_json(&url).await?;

        Ok(match status.status.as_deref() {
            Some("success") => JobStatus::Success,
            Some("failure") => JobStatus::Failure,
            _ => JobStatus::Processing,
        })
    }

    async fn calibration(&self, id: &JobId) -> Result<Calibration, SolverError> {
        let url = format!("{}/jobs/{}/calibration", self.base_url, id);
        let raw: CalibrationResponse = self.get_json(&url).await?;
        parse_calibration(raw)
    }

    async fn wcs_header(&self, id: &JobId) -> Result<Option<WcsHeader>, SolverError> {
        let url = format!("{}/wcs_file/{}", self.root_url(), id);
        let response = Self::check_status(self.client.get(&url).send().await?, &url)?;
        let header = parse_fits_header(&response.bytes().await?);
        Ok((!header.is_empty()).then_some(header))
    }

    fn result_url(&self, id: &SubmissionId) -> Option<String> {
        Some(format!("{}/status/{}", self.root_url(), id))
    }
}
