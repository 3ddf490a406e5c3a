// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Great-circle geometry on the spherical Earth.
//!
//! These are the distance/azimuth helpers consumed by the beam and the
//! event locator. All angles are in degrees, distances in degrees of arc
//! unless noted otherwise.

/// Great-circle distance and both azimuths between two points.
///
/// Returns `(delta, az, baz)` where `delta` is the arc distance \[deg\],
/// `az` the azimuth from the first point to the second (clockwise from
/// north) and `baz` the azimuth back from the second point to the first.
pub fn dist_azimuth(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> (f64, f64, f64) {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let dlon = (lon2 - lon1).to_radians();

    let (sin_phi1, cos_phi1) = phi1.sin_cos();
    let (sin_phi2, cos_phi2) = phi2.sin_cos();
    let (sin_dlon, cos_dlon) = dlon.sin_cos();

    let cos_delta = sin_phi1 * sin_phi2 + cos_phi1 * cos_phi2 * cos_dlon;
    let delta = cos_delta.clamp(-1.0, 1.0).acos().to_degrees();

    let az = azimuth(sin_phi1, cos_phi1, sin_phi2, cos_phi2, sin_dlon, cos_dlon);
    let baz = azimuth(sin_phi2, cos_phi2, sin_phi1, cos_phi1, -sin_dlon, cos_dlon);

    (delta, az, baz)
}

fn azimuth(
    sin_phi1: f64,
    cos_phi1: f64,
    sin_phi2: f64,
    cos_phi2: f64,
    sin_dlon: f64,
    cos_dlon: f64,
) -> f64 {
    let y = sin_dlon * cos_phi2;
    let x = cos_phi1 * sin_phi2 - sin_phi1 * cos_phi2 * cos_dlon;
    if y == 0.0 && x == 0.0 {
        return 0.0;
    }
    let az = y.atan2(x).to_degrees();
    if az < 0.0 {
        az + 360.0
    } else {
        az
    }
}

/// Destination point reached by travelling `delta` degrees of arc from
/// `(lat, lon)` along azimuth `az` (clockwise from north). Returns
/// `(lat, lon)` in degrees with longitude normalized to (-180, 180].
pub fn lat_lon(lat: f64, lon: f64, delta: f64, az: f64) -> (f64, f64) {
    let phi = lat.to_radians();
    let d = delta.to_radians();
    let theta = az.to_radians();

    let (sin_phi, cos_phi) = phi.sin_cos();
    let (sin_d, cos_d) = d.sin_cos();

    let sin_lat2 = sin_phi * cos_d + cos_phi * sin_d * theta.cos();
    let lat2 = sin_lat2.clamp(-1.0, 1.0).asin();
    let dlon = (theta.sin() * sin_d * cos_phi).atan2(cos_d - sin_phi * sin_lat2);

    let mut lon2 = lon + dlon.to_degrees();
    if lon2 > 180.0 {
        lon2 -= 360.0;
    } else if lon2 <= -180.0 {
        lon2 += 360.0;
    }
    (lat2.to_degrees(), lon2)
}
