/// Shared data structures for the persisted state
///
/// These structs represent the data model that flows between
/// the database layer and the solve/match workflow.
use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use std::fmt;
use std::str::FromStr;

use crate::common::{AstroCoord, Parity, WcsParams};
use crate::math::Degree;
use crate::solver::common::{
    Declination, PositionHint, RightAscention, ScaleHint, SolveHints, WcsHeader,
};

/// Where an image stands in the plate solving workflow
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AstrometryStatus {
    #[default]
    None,
    Submitted,
    Processing,
    Solved,
    Failed,
}

impl AstrometryStatus {
    pub const ALL: [AstrometryStatus; 5] = [
        AstrometryStatus::None,
        AstrometryStatus::Submitted,
        AstrometryStatus::Processing,
        AstrometryStatus::Solved,
        AstrometryStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AstrometryStatus::None => "NONE",
            AstrometryStatus::Submitted => "SUBMITTED",
            AstrometryStatus::Processing => "PROCESSING",
            AstrometryStatus::Solved => "SOLVED",
            AstrometryStatus::Failed => "FAILED",
        }
    }

    /// Edges of the status graph. Nothing re-enters NONE, and SOLVED is only
    /// left for a forced re-solve.
    pub fn can_transition_to(&self, next: AstrometryStatus, force: bool) -> bool {
        use AstrometryStatus::*;
        matches!(
            (self, next),
            (None, Submitted)
                | (Submitted, Processing)
                | (Submitted, Failed)
                | (Processing, Solved)
                | (Processing, Failed)
                | (Failed, Submitted)
        ) || (force && *self == Solved && next == Submitted)
    }

    /// A submission is outstanding with the provider
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            AstrometryStatus::Submitted | AstrometryStatus::Processing
        )
    }
}

impl fmt::Display for AstrometryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AstrometryStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AstrometryStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownVariant(s.to_string()))
    }
}

impl ToSql for AstrometryStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for AstrometryStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// The static catalogs objects are matched against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CatalogType {
    Messier,
    Ngc,
    NamedStar,
}

impl CatalogType {
    pub const ALL: [CatalogType; 3] = [CatalogType::Messier, CatalogType::Ngc, CatalogType::NamedStar];

    pub fn as_str(&self) -> &'static str {
        match self {
            CatalogType::Messier => "MESSIER",
            CatalogType::Ngc => "NGC",
            CatalogType::NamedStar => "NAMED_STAR",
        }
    }
}

impl fmt::Display for CatalogType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CatalogType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CatalogType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownVariant(s.to_string()))
    }
}

impl ToSql for CatalogType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for CatalogType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

/// Represents a single image in the library
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    /// Unique database ID
    pub id: i64,
    /// Full path to the image file
    pub file_path: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub status: AstrometryStatus,
    pub submission_id: Option<String>,
    pub job_id: Option<String>,
    pub result_url: Option<String>,
    /// Why the last attempt failed, for display only
    pub failure_reason: Option<String>,
    /// degrees
    pub ra_center: Option<f64>,
    /// degrees
    pub dec_center: Option<f64>,
    /// arcsec per pixel
    pub pixel_scale: Option<f64>,
    /// degrees
    pub rotation: Option<f64>,
    /// +1 or -1
    pub parity: Option<i8>,
    /// degrees
    pub field_radius: Option<f64>,
    /// Solution came from the file header or a sidecar rather than a solver
    pub solution_imported: bool,
    /// Full header of the solver's WCS file, when it could be fetched
    pub wcs_header: Option<WcsHeader>,
    pub updated_at: DateTime<Utc>,
}

impl Image {
    pub fn is_plate_solved(&self) -> bool {
        self.status == AstrometryStatus::Solved || self.solution_imported
    }

    pub fn center(&self) -> Option<AstroCoord> {
        Some(AstroCoord::from_degrees(self.ra_center?, self.dec_center?))
    }

    /// Hints from whatever is already known about the image.
    /// `fallback_radius` is used when the field radius is unknown.
    pub fn hints(&self, fallback_radius: f64) -> Option<SolveHints> {
        let hints = SolveHints {
            position: self.center().map(|center| PositionHint {
                ra: RightAscention::new(center.ra().degrees()),
                dec: Declination::new(center.dec().degrees()),
                radius: Degree::new(self.field_radius.unwrap_or(fallback_radius)),
            }),
            scale: self
                .pixel_scale
                .filter(|scale| *scale > 0.0)
                .map(ScaleHint::around),
        };
        (!hints.is_empty()).then_some(hints)
    }

    /// Projection inputs, if the stored solution is complete.
    /// A missing rotation is taken as 0°.
    pub fn wcs_params(&self) -> Option<WcsParams> {
        Some(WcsParams {
            center: self.center()?,
            pixel_scale: self.pixel_scale?,
            rotation: self.rotation.unwrap_or(0.0),
            parity: self
                .parity
                .map(|p| Parity::from_sign(p as f64))
                .unwrap_or_default(),
            width: self.width?,
            height: self.height?,
        })
    }
}

/// Fields set by the ingestion pipeline when an image is first cataloged
#[derive(Debug, Default, Clone, PartialEq)]
pub struct NewImage {
    pub file_path: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub ra_center: Option<f64>,
    pub dec_center: Option<f64>,
    pub pixel_scale: Option<f64>,
    pub rotation: Option<f64>,
    pub parity: Option<i8>,
    pub field_radius: Option<f64>,
    pub solution_imported: bool,
}

/// A reference object from one of the static catalogs
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub catalog: CatalogType,
    pub designation: String,
    /// degrees
    pub ra: f64,
    /// degrees
    pub dec: f64,
    pub common_name: Option<String>,
    pub object_type: Option<String>,
    pub magnitude: Option<f64>,
}

impl CatalogEntry {
    pub fn position(&self) -> AstroCoord {
        AstroCoord::from_degrees(self.ra, self.dec)
    }
}

/// A match about to be written
#[derive(Debug, Clone, PartialEq)]
pub struct NewMatch {
    pub catalog: CatalogType,
    pub designation: String,
    /// degrees from the image center
    pub angular_separation: f64,
    pub pixel_x: Option<f64>,
    pub pixel_y: Option<f64>,
    pub confidence: f64,
}

/// A catalog object seen in an image
#[derive(Debug, Clone, PartialEq)]
pub struct ImageCatalogMatch {
    pub id: i64,
    pub image_id: i64,
    pub catalog: CatalogType,
    pub designation: String,
    pub angular_separation: f64,
    pub pixel_x: Option<f64>,
    pub pixel_y: Option<f64>,
    pub confidence: f64,
    pub matched_at: DateTime<Utc>,
}

/// One row of the status audit trail
#[derive(Debug, Clone, PartialEq)]
pub struct StatusTransition {
    pub from: AstrometryStatus,
    pub to: AstrometryStatus,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("Unknown stored value {0:?}")]
pub struct UnknownVariant(pub String);
