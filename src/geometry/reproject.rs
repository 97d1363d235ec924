//! Coordinate reference system transforms.
//!
//! A small built-in registry covers the CRSs boundaries and feature services
//! commonly use: geographic WGS 84 / GDA94 / GDA2020 / NAD83 / ETRS89, Web
//! Mercator, and the UTM and MGA transverse Mercator grids. Every transform
//! goes through geographic longitude/latitude.

use std::f64::consts::{FRAC_PI_2, FRAC_PI_4};

use geo::{CoordsIter, MapCoords};
use tracing::debug;

use crate::error::{FetchError, FetchResult};
use crate::models::{BoundaryGeometry, Crs};

/// Spherical radius used by Web Mercator
const WEB_MERCATOR_RADIUS: f64 = 6_378_137.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ellipsoid {
    pub a: f64,
    pub f: f64,
}

pub const WGS84_ELLIPSOID: Ellipsoid = Ellipsoid {
    a: 6_378_137.0,
    f: 1.0 / 298.257_223_563,
};

pub const GRS80_ELLIPSOID: Ellipsoid = Ellipsoid {
    a: 6_378_137.0,
    f: 1.0 / 298.257_222_101,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Projection {
    /// Longitude/latitude in degrees
    Geographic,
    WebMercator,
    TransverseMercator(TransverseMercator),
}

impl Projection {
    /// Look up a CRS in the built-in registry
    pub fn for_crs(crs: Crs) -> Option<Self> {
        let code = crs.epsg();
        match code {
            4326 | 4283 | 7844 | 4269 | 4258 | 4019 => Some(Projection::Geographic),
            3857 | 3785 | 900913 | 102100 | 102113 => Some(Projection::WebMercator),
            // WGS 84 / UTM north and south
            32601..=32660 => Some(Projection::TransverseMercator(TransverseMercator::utm(
                code - 32600,
                false,
                WGS84_ELLIPSOID,
            ))),
            32701..=32760 => Some(Projection::TransverseMercator(TransverseMercator::utm(
                code - 32700,
                true,
                WGS84_ELLIPSOID,
            ))),
            // GDA94 / MGA
            28348..=28358 => Some(Projection::TransverseMercator(TransverseMercator::utm(
                code - 28300,
                true,
                GRS80_ELLIPSOID,
            ))),
            // GDA2020 / MGA
            7846..=7859 => Some(Projection::TransverseMercator(TransverseMercator::utm(
                code - 7800,
                true,
                GRS80_ELLIPSOID,
            ))),
            _ => None,
        }
    }

    /// Projected (x, y) to (lon, lat) degrees
    pub fn to_geographic(&self, x: f64, y: f64) -> (f64, f64) {
        match self {
            Projection::Geographic => (x, y),
            Projection::WebMercator => {
                let lon = (x / WEB_MERCATOR_RADIUS).to_degrees();
                let lat = (2.0 * (y / WEB_MERCATOR_RADIUS).exp().atan() - FRAC_PI_2).to_degrees();
                (lon, lat)
            }
            Projection::TransverseMercator(tm) => tm.inverse(x, y),
        }
    }

    /// (lon, lat) degrees to projected (x, y)
    pub fn from_geographic(&self, lon: f64, lat: f64) -> (f64, f64) {
        match self {
            Projection::Geographic => (lon, lat),
            Projection::WebMercator => {
                let x = WEB_MERCATOR_RADIUS * lon.to_radians();
                let y = WEB_MERCATOR_RADIUS * (FRAC_PI_4 + lat.to_radians() / 2.0).tan().ln();
                (x, y)
            }
            Projection::TransverseMercator(tm) => tm.forward(lon, lat),
        }
    }
}

/// Transverse Mercator using the Krüger series to third order in n
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransverseMercator {
    pub central_meridian: f64,
    pub scale: f64,
    pub false_easting: f64,
    pub false_northing: f64,
    pub ellipsoid: Ellipsoid,
}

impl TransverseMercator {
    pub fn utm(zone: u32, south: bool, ellipsoid: Ellipsoid) -> Self {
        Self {
            central_meridian: zone as f64 * 6.0 - 183.0,
            scale: 0.9996,
            false_easting: 500_000.0,
            false_northing: if south { 10_000_000.0 } else { 0.0 },
            ellipsoid,
        }
    }

    fn n(&self) -> f64 {
        self.ellipsoid.f / (2.0 - self.ellipsoid.f)
    }

    /// Rectifying radius
    fn big_a(&self) -> f64 {
        let n = self.n();
        self.ellipsoid.a / (1.0 + n) * (1.0 + n * n / 4.0 + n.powi(4) / 64.0)
    }

    pub fn forward(&self, lon: f64, lat: f64) -> (f64, f64) {
        let n = self.n();
        let alpha = [
            n / 2.0 - 2.0 * n * n / 3.0 + 5.0 * n.powi(3) / 16.0,
            13.0 * n * n / 48.0 - 3.0 * n.powi(3) / 5.0,
            61.0 * n.powi(3) / 240.0,
        ];

        let phi = lat.to_radians();
        let lambda = (lon - self.central_meridian).to_radians();
        let c = 2.0 * n.sqrt() / (1.0 + n);

        let t = (phi.sin().atanh() - c * (c * phi.sin()).atanh()).sinh();
        let xi_p = t.atan2(lambda.cos());
        let eta_p = (lambda.sin() / (1.0 + t * t).sqrt()).atanh();

        let mut xi = xi_p;
        let mut eta = eta_p;
        for (j, a) in alpha.iter().enumerate() {
            let k = 2.0 * (j as f64 + 1.0);
            xi += a * (k * xi_p).sin() * (k * eta_p).cosh();
            eta += a * (k * xi_p).cos() * (k * eta_p).sinh();
        }

        let k0a = self.scale * self.big_a();
        (
            self.false_easting + k0a * eta,
            self.false_northing + k0a * xi,
        )
    }

    pub fn inverse(&self, easting: f64, northing: f64) -> (f64, f64) {
        let n = self.n();
        let beta = [
            n / 2.0 - 2.0 * n * n / 3.0 + 37.0 * n.powi(3) / 96.0,
            n * n / 48.0 + n.powi(3) / 15.0,
            17.0 * n.powi(3) / 480.0,
        ];
        let delta = [
            2.0 * n - 2.0 * n * n / 3.0 - 2.0 * n.powi(3),
            7.0 * n * n / 3.0 - 8.0 * n.powi(3) / 5.0,
            56.0 * n.powi(3) / 15.0,
        ];

        let k0a = self.scale * self.big_a();
        let xi = (northing - self.false_northing) / k0a;
        let eta = (easting - self.false_easting) / k0a;

        let mut xi_p = xi;
        let mut eta_p = eta;
        for (j, b) in beta.iter().enumerate() {
            let k = 2.0 * (j as f64 + 1.0);
            xi_p -= b * (k * xi).sin() * (k * eta).cosh();
            eta_p -= b * (k * xi).cos() * (k * eta).sinh();
        }

        let chi = (xi_p.sin() / eta_p.cosh()).asin();
        let mut phi = chi;
        for (j, d) in delta.iter().enumerate() {
            phi += d * (2.0 * (j as f64 + 1.0) * chi).sin();
        }
        let lambda = eta_p.sinh().atan2(xi_p.cos());

        (self.central_meridian + lambda.to_degrees(), phi.to_degrees())
    }
}

/// Return a copy of `boundary` expressed in `target`.
///
/// A boundary already in `target` is returned unchanged. Datum differences
/// between the supported geographic CRSs are ignored.
pub fn reproject(boundary: &BoundaryGeometry, target: Crs) -> FetchResult<BoundaryGeometry> {
    let source = boundary.crs.ok_or_else(|| {
        FetchError::Reprojection("boundary has no source CRS; declare one explicitly".to_string())
    })?;

    if source == target {
        return Ok(boundary.clone());
    }

    let from = Projection::for_crs(source)
        .ok_or_else(|| FetchError::Reprojection(format!("unsupported source CRS {}", source)))?;
    let to = Projection::for_crs(target)
        .ok_or_else(|| FetchError::Reprojection(format!("unsupported target CRS {}", target)))?;

    debug!("Reprojecting boundary from {} to {}", source, target);

    let geometry = if from == to {
        boundary.geometry.clone()
    } else {
        boundary.geometry.map_coords(|c| {
            let (lon, lat) = from.to_geographic(c.x, c.y);
            let (x, y) = to.from_geographic(lon, lat);
            geo::Coord { x, y }
        })
    };

    if !geometry.coords_iter().all(|c| c.x.is_finite() && c.y.is_finite()) {
        return Err(FetchError::Reprojection(format!(
            "boundary lies outside the valid area of {}",
            target
        )));
    }

    Ok(BoundaryGeometry::new(geometry, Some(target)))
}
