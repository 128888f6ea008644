use glam::{DMat2, DVec2};
use thiserror::Error;

use crate::math::{self, Degree};

/// Declinations this close to a pole skip the `cos(dec)` RA correction.
const POLE_GUARD_DEG: f64 = 89.9;

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct AstroCoord {
    ra: Degree,
    dec: Degree,
}
impl AstroCoord {
    pub fn from_ra_dec(ra: Degree, dec: Degree) -> Self {
        Self { ra, dec }
    }

    pub fn from_degrees(ra: f64, dec: f64) -> Self {
        Self::from_ra_dec(Degree::new(ra), Degree::new(dec))
    }

    pub fn ra(&self) -> Degree {
        self.ra
    }

    pub fn dec(&self) -> Degree {
        self.dec
    }

    /// Great-circle distance to `other`
    pub fn separation(&self, other: &AstroCoord) -> Degree {
        Degree::new(math::angular_separation(
            self.ra.degrees(),
            self.dec.degrees(),
            other.ra.degrees(),
            other.dec.degrees(),
        ))
    }
}

/// Image handedness relative to the standard sky orientation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    #[default]
    Normal,
    Flipped,
}
impl Parity {
    /// Solvers report parity as a signed number; anything negative is mirrored.
    pub fn from_sign(value: f64) -> Self {
        if value < 0.0 {
            Parity::Flipped
        } else {
            Parity::Normal
        }
    }

    pub fn sign(&self) -> f64 {
        match self {
            Parity::Normal => 1.0,
            Parity::Flipped => -1.0,
        }
    }
}

/// Inputs needed to build a [WorldTransform].
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct WcsParams {
    pub center: AstroCoord,
    /// arcsec per pixel
    pub pixel_scale: f64,
    /// degrees, applied as-is (not negated)
    pub rotation: f64,
    pub parity: Parity,
    pub width: u32,
    pub height: u32,
}

/// Stores the tangent-plane transform between pixel (x, y) and world (ra, dec).
///
/// Pixel origin is the top-left corner with y growing downward. The reference
/// pixel is the image center. This is the linear gnomonic approximation, which
/// is accurate for sub-degree fields.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorldTransform {
    center: AstroCoord,
    crpix: DVec2,
    cd: DMat2,
    cd_inv: DMat2,
    ra_scale: f64,
}
impl WorldTransform {
    pub fn new(params: &WcsParams) -> Result<Self, WcsError> {
        let ra_c = params.center.ra().degrees();
        let dec_c = params.center.dec().degrees();
        if !ra_c.is_finite() || !dec_c.is_finite() || dec_c.abs() > 90.0 {
            return Err(WcsError::InvalidCenter(ra_c, dec_c));
        }
        if !params.pixel_scale.is_finite() || params.pixel_scale <= 0.0 {
            return Err(WcsError::InvalidPixelScale(params.pixel_scale));
        }
        if !params.rotation.is_finite() {
            return Err(WcsError::InvalidRotation(params.rotation));
        }
        if params.width == 0 || params.height == 0 {
            return Err(WcsError::EmptyImage(params.width, params.height));
        }

        let s = params.pixel_scale / 3600.0;
        let s_x = -s * params.parity.sign();
        let s_y = -s;
        let (sin, cos) = params.rotation.to_radians().sin_cos();

        // CD = [[s_x cos, -s_y sin], [s_x sin, s_y cos]], stored column-major
        let cd = DMat2::from_cols(
            DVec2::new(s_x * cos, s_x * sin),
            DVec2::new(-s_y * sin, s_y * cos),
        );
        if cd.determinant() == 0.0 {
            return Err(WcsError::SingularMatrix);
        }

        let ra_scale = if dec_c.abs() > POLE_GUARD_DEG {
            1.0
        } else {
            dec_c.to_radians().cos()
        };

        Ok(Self {
            center: params.center,
            crpix: DVec2::new(params.width as f64 / 2.0, params.height as f64 / 2.0),
            cd,
            cd_inv: cd.inverse(),
            ra_scale,
        })
    }

    pub fn center(&self) -> AstroCoord {
        self.center
    }

    pub fn pixel_to_world(&self, coords: (f64, f64)) -> AstroCoord {
        let d = DVec2::new(coords.0, coords.1) - self.crpix;
        let iwc = self.cd * d;

        let ra = math::wrap_ra(self.center.ra().degrees() + iwc.x / self.ra_scale);
        let dec = (self.center.dec().degrees() + iwc.y).clamp(-90.0, 90.0);
        AstroCoord::from_degrees(ra, dec)
    }

    pub fn world_to_pixel(&self, coords: AstroCoord) -> Result<(f64, f64), WcsError> {
        let ra = coords.ra().degrees();
        let dec = coords.dec().degrees();
        if !ra.is_finite() || !dec.is_finite() {
            return Err(WcsError::NonFiniteCoordinate(ra, dec));
        }

        let xi = math::ra_delta(ra, self.center.ra().degrees()) * self.ra_scale;
        let eta = dec - self.center.dec().degrees();
        let p = self.cd_inv * DVec2::new(xi, eta) + self.crpix;
        if !p.is_finite() {
            return Err(WcsError::NonFiniteCoordinate(ra, dec));
        }
        Ok((p.x, p.y))
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WcsError {
    #[error("Solution is missing center, scale or image size")]
    Incomplete,
    #[error("Invalid field center: ra={0}, dec={1}")]
    InvalidCenter(f64, f64),
    #[error("Invalid pixel scale: {0} arcsec/px")]
    InvalidPixelScale(f64),
    #[error("Invalid rotation: {0}")]
    InvalidRotation(f64),
    #[error("Image has no area: {0}x{1}")]
    EmptyImage(u32, u32),
    #[error("CD matrix is singular")]
    SingularMatrix,
    #[error("Cannot project non-finite coordinate ra={0}, dec={1}")]
    NonFiniteCoordinate(f64, f64),
}
