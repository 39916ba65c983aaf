//! Spherical geometry helpers for the two-level sky subdivision.
//!
//! All public angles are in degrees: longitude in [0, 360), latitude in
//! [-90, 90]. Internal trigonometry is in radians.

/// One milli-arcsecond, in degrees. Used as the slop when comparing
/// angular separations against the overlap radius.
pub const EPSILON_DEG: f64 = 0.001 / 3600.0;

/// Latitudes closer to a pole than this are treated as polar.
pub const POLE_DEG: f64 = 90.0 - EPSILON_DEG;

/// Clamp a latitude angle to [-90, 90].
pub fn clamp_lat(lat: f64) -> f64 {
    lat.clamp(-90.0, 90.0)
}

/// Reduce a longitude angle to [0, 360).
pub fn wrap_lon(lon: f64) -> f64 {
    let mut lon = lon % 360.0;
    if lon < 0.0 {
        lon += 360.0;
    }
    lon
}

/// Unit 3-vector for spherical coordinates (degrees).
pub fn cartesian(lon: f64, lat: f64) -> [f64; 3] {
    let lon = lon.to_radians();
    let lat = lat.to_radians();
    let cos_lat = lat.cos();
    [lon.cos() * cos_lat, lon.sin() * cos_lat, lat.sin()]
}

/// Angular separation between two unit vectors, in degrees.
///
/// Computed via atan2 of cross and dot products, which is accurate for
/// both small and near-antipodal separations.
pub fn ang_sep(v1: [f64; 3], v2: [f64; 3]) -> f64 {
    let cross = [
        v1[1] * v2[2] - v1[2] * v2[1],
        v1[2] * v2[0] - v1[0] * v2[2],
        v1[0] * v2[1] - v1[1] * v2[0],
    ];
    let sin = (cross[0] * cross[0] + cross[1] * cross[1] + cross[2] * cross[2]).sqrt();
    let cos = v1[0] * v2[0] + v1[1] * v2[1] + v1[2] * v2[2];
    sin.atan2(cos).to_degrees()
}

/// Maximum longitude half-width (degrees) of a circle with the given
/// angular radius centred at the given latitude. Returns 180 when the
/// circle encloses a pole.
pub fn max_alpha(radius: f64, center_lat: f64) -> f64 {
    assert!((0.0..=90.0).contains(&radius), "radius must be in [0, 90]");
    if radius == 0.0 {
        return 0.0;
    }
    let lat = clamp_lat(center_lat);
    if lat.abs() + radius > POLE_DEG {
        return 180.0;
    }
    let y = radius.to_radians().sin();
    let c1 = (lat - radius).to_radians().cos();
    let c2 = (lat + radius).to_radians().cos();
    let x = (c1 * c2).abs().sqrt();
    (y / x).atan().abs().to_degrees()
}

/// The number of fixed-width longitude segments with angular width at
/// least `width` degrees that fit in the latitude band
/// [`lat_min`, `lat_max`].
pub fn segments(lat_min: f64, lat_max: f64, width: f64) -> i32 {
    let lat = lat_min.abs().max(lat_max.abs());
    if lat > POLE_DEG || width >= 180.0 {
        return 1;
    }
    let cos_width = width.to_radians().cos();
    let sin_lat = lat.to_radians().sin();
    let cos_lat = lat.to_radians().cos();
    let x = (cos_width - sin_lat * sin_lat) / (cos_lat * cos_lat);
    if x < -1.0 {
        return 1;
    }
    let lon_width = x.clamp(-1.0, 1.0).acos();
    ((2.0 * std::f64::consts::PI) / lon_width).floor().max(1.0) as i32
}

/// Shortest longitude distance from `lon` to the interval
/// [`lon_min`, `lon_max`], all in [0, 360). Zero when inside.
pub fn lon_dist_to_range(lon: f64, lon_min: f64, lon_max: f64) -> f64 {
    if lon_min <= lon && lon <= lon_max {
        return 0.0;
    }
    let d1 = (lon - lon_max).rem_euclid(360.0).min((lon_max - lon).rem_euclid(360.0));
    let d2 = (lon - lon_min).rem_euclid(360.0).min((lon_min - lon).rem_euclid(360.0));
    d1.min(d2)
}
