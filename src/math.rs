//! Mathy related things
//!

use derive_more::{Add, Display, Neg, Sub};

/// The base angle type used in the crate
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Add, Sub, Neg, Display)]
#[display(fmt = "{}°", _0)]
pub struct Degree(f64);
impl Default for Degree {
    fn default() -> Self {
        Self(0.0)
    }
}
impl Degree {
    pub fn new(deg: f64) -> Self {
        Self(deg)
    }
    pub fn degrees(&self) -> f64 {
        self.0
    }
    pub fn radians(&self) -> f64 {
        self.0.to_radians()
    }
    pub fn from_radians(rad: f64) -> Self {
        Self(rad.to_degrees())
    }
}

/// Wraps a right ascension into `[0, 360)`.
pub fn wrap_ra(ra: f64) -> f64 {
    let wrapped = ra.rem_euclid(360.0);
    // rem_euclid can return exactly 360.0 for tiny negative inputs
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}

/// Signed RA difference `ra - ra_ref` folded into `[-180, 180)`.
pub fn ra_delta(ra: f64, ra_ref: f64) -> f64 {
    (ra - ra_ref + 180.0).rem_euclid(360.0) - 180.0
}

/// Great-circle distance between two equatorial positions, all in degrees.
///
/// Haversine form, stable for the small separations catalog matching cares about.
pub fn angular_separation(ra1: f64, dec1: f64, ra2: f64, dec2: f64) -> f64 {
    let (ra1, dec1, ra2, dec2) = (
        ra1.to_radians(),
        dec1.to_radians(),
        ra2.to_radians(),
        dec2.to_radians(),
    );
    let half_ddec = ((dec2 - dec1) / 2.0).sin();
    let half_dra = ((ra2 - ra1) / 2.0).sin();
    let h = half_ddec * half_ddec + dec1.cos() * dec2.cos() * half_dra * half_dra;
    (2.0 * h.sqrt().min(1.0).asin()).to_degrees()
}
