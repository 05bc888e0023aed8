//! Great-circle distance and the movement publish trigger

use crate::gnss::GpsFix;

/// Mean Earth radius in meters
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine distance in meters between two points given in decimal degrees
pub fn haversine(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

pub fn distance(from: &GpsFix, to: &GpsFix) -> f64 {
    haversine(from.latitude, from.longitude, to.latitude, to.longitude)
}

/// True iff a baseline exists and the fix moved at least `threshold_m` away from it.
pub fn should_publish_for_movement(last_fix: Option<&GpsFix>, fix: &GpsFix, threshold_m: f64) -> bool {
    match last_fix {
        Some(last) => distance(last, fix) >= threshold_m,
        None => false,
    }
}
