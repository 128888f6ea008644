//! Catalog matching for solved images
//!
//! A match run does a coarse circular search of every catalog around the image
//! center, then projects each candidate into pixel space and keeps only those
//! that land on the image (plus [MATCH_MARGIN_PX]). The stored set is replaced
//! in one transaction so readers never see a half-written list.

use thiserror::Error;
use tracing::{debug, warn};

use std::collections::HashSet;
use std::sync::Arc;

use crate::common::{WcsError, WorldTransform};
use crate::state::data::{CatalogType, NewMatch};
use crate::state::library::{Library, LibraryError};

/// Slack around the image bounds, in pixels. Matches the overlay renderer's margin.
pub const MATCH_MARGIN_PX: f64 = 100.0;

/// Search radius when the image has no field radius, degrees
pub const DEFAULT_SEARCH_RADIUS_DEG: f64 = 1.0;

/// Separation at which confidence drops to zero, degrees
const CONFIDENCE_FALLOFF_DEG: f64 = 5.0;

/// Cap on candidates for the large catalogs
const LARGE_CATALOG_LIMIT: usize = 50;

fn query_limit(catalog: CatalogType) -> Option<usize> {
    match catalog {
        CatalogType::Messier => None,
        CatalogType::Ngc | CatalogType::NamedStar => Some(LARGE_CATALOG_LIMIT),
    }
}

fn confidence(separation: f64) -> f64 {
    (1.0 - separation / CONFIDENCE_FALLOFF_DEG).max(0.0)
}

fn in_bounds((x, y): (f64, f64), width: u32, height: u32) -> bool {
    (-MATCH_MARGIN_PX..=width as f64 + MATCH_MARGIN_PX).contains(&x)
        && (-MATCH_MARGIN_PX..=height as f64 + MATCH_MARGIN_PX).contains(&y)
}

#[derive(Debug, Clone)]
pub struct CatalogMatcher {
    library: Arc<Library>,
    default_radius: f64,
}

impl CatalogMatcher {
    pub fn new(library: Arc<Library>) -> Self {
        Self::with_default_radius(library, DEFAULT_SEARCH_RADIUS_DEG)
    }

    pub fn with_default_radius(library: Arc<Library>, default_radius: f64) -> Self {
        Self {
            library,
            default_radius,
        }
    }

    /// Find, validate and store the catalog objects visible in an image.
    /// Returns the number of matches stored.
    pub fn match_image(&self, image_id: i64) -> Result<usize, MatchError> {
        let image = self.library.image(image_id)?;
        if !image.is_plate_solved() {
            return Err(MatchError::NotPlateSolved(image_id));
        }
        let center = image.center().ok_or(MatchError::MissingCenter(image_id))?;
        let radius = image
            .field_radius
            .filter(|r| *r > 0.0)
            .unwrap_or(self.default_radius);

        let projection = image
            .wcs_params()
            .ok_or(WcsError::Incomplete)
            .and_then(|params| Ok((WorldTransform::new(&params)?, params)));
        let projection = match projection {
            Ok(p) => Some(p),
            Err(e) => {
                warn!(
                    "Image {image_id}: no usable WCS ({e}), keeping circular matches without pixel validation"
                );
                None
            }
        };

        let mut seen = HashSet::new();
        let mut accepted = Vec::new();
        for catalog in CatalogType::ALL {
            let candidates =
                self.library
                    .catalog_entries_near(catalog, center, radius, query_limit(catalog))?;
            for (entry, separation) in candidates {
                if !seen.insert((catalog, entry.designation.clone())) {
                    continue;
                }

                let pixel = match &projection {
                    None => None,
                    Some((transform, params)) => match transform.world_to_pixel(entry.position()) {
                        Ok(pixel) if in_bounds(pixel, params.width, params.height) => Some(pixel),
                        Ok(_) => continue,
                        Err(e) => {
                            debug!("Image {image_id}: skipping {}: {e}", entry.designation);
                            continue;
                        }
                    },
                };

                accepted.push(NewMatch {
                    catalog,
                    designation: entry.designation,
                    angular_separation: separation,
                    pixel_x: pixel.map(|p| p.0),
                    pixel_y: pixel.map(|p| p.1),
                    confidence: confidence(separation),
                });
            }
        }

        let count = self.library.replace_matches(image_id, &accepted)?;
        debug!("Image {image_id}: {count} catalog matches");
        Ok(count)
    }

    /// Recompute stored pixel positions from the current solution.
    /// Returns how many matches were updated.
    pub fn recompute_pixels(&self, image_id: i64) -> Result<usize, MatchError> {
        let image = self.library.image(image_id)?;
        if !image.is_plate_solved() {
            return Err(MatchError::NotPlateSolved(image_id));
        }
        let params = image.wcs_params().ok_or(WcsError::Incomplete)?;
        let transform = WorldTransform::new(&params)?;

        let matches = self.library.matches_for_image(image_id)?;
        let mut updates = Vec::with_capacity(matches.len());
        for m in matches {
            let pixel = self
                .library
                .catalog_entry(m.catalog, &m.designation)?
                .and_then(|entry| transform.world_to_pixel(entry.position()).ok());
            updates.push((m.id, pixel));
        }
        Ok(self.library.update_match_pixels(&updates)?)
    }
}

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("Image {0} is not plate solved")]
    NotPlateSolved(i64),
    #[error("Image {0} has no center coordinates")]
    MissingCenter(i64),
    #[error(transparent)]
    Library(#[from] LibraryError),
    #[error(transparent)]
    Wcs(#[from] WcsError),
}
