//! Great-circle distance and grid-cell keys for geographic fields.

const EARTH_RADIUS_KM: f64 = 6371.0;
/// Antipodal cap: no two points are farther apart than half the
/// circumference, so this normalises the kernel into `[0, 1]`.
const MAX_DISTANCE_KM: f64 = 20_000.0;

/// Haversine distance between two (lat, lon) points, in kilometres.
pub fn haversine_km(a: (f64, f64), b: (f64, f64)) -> f64 {
    let (lat1, lon1) = (a.0.to_radians(), a.1.to_radians());
    let (lat2, lon2) = (b.0.to_radians(), b.1.to_radians());

    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

/// Normalised great-circle distance in `[0, 1]`.
pub fn distance(a: (f64, f64), b: (f64, f64)) -> f64 {
    (haversine_km(a, b) / MAX_DISTANCE_KM).clamp(0.0, 1.0)
}

/// Grid-cell block key: latitude and longitude floored to `cell_degrees`.
/// Nearby points share a cell and become blocking candidates.
pub fn grid_cell(lat: f64, lon: f64, cell_degrees: f64) -> String {
    let row = (lat / cell_degrees).floor() as i64;
    let col = (lon / cell_degrees).floor() as i64;
    format!("{row},{col}")
}
