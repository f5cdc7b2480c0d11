//! Haversine distance and relative geo-banding (component A).
//!
//! Pure and deterministic: no I/O, no shared state. Banding is relative to
//! the closest node in the candidate set, not to absolute distance, so a
//! single-region fleet still produces "Good" nodes for requests in that
//! region.

const EARTH_RADIUS_KM: f64 = 6371.0;
const GOOD_BAND_KM: f64 = 1500.0;
const OKAY_BAND_KM: f64 = 7500.0;

/// `0` (Bad), `1` (Okay) or `2` (Good).
pub type GeoScore = u8;

/// Great-circle distance between two coordinates in kilometers.
#[must_use]
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (lat1, lon1, lat2, lon2) = (
        lat1.to_radians(),
        lon1.to_radians(),
        lat2.to_radians(),
        lon2.to_radians(),
    );
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();
    EARTH_RADIUS_KM * c
}

/// Score a single distance against a base (the smallest distance in the set).
#[must_use]
pub fn band(distance_km: f64, base_km: f64) -> GeoScore {
    if distance_km <= base_km + GOOD_BAND_KM {
        2
    } else if distance_km <= base_km + OKAY_BAND_KM {
        1
    } else {
        0
    }
}

/// Score every `(lat, lon)` in `coords` relative to `(req_lat, req_lon)`.
///
/// Returns `(distance_km, geo_score)` in the same order as `coords`. If
/// `coords` is empty the result is empty. When the request has no usable
/// coordinates, callers should skip this step entirely rather than call it
/// with `(0, 0)` — see `selector::parse_coords`.
#[must_use]
pub fn score_all(coords: &[(f64, f64)], req_lat: f64, req_lon: f64) -> Vec<(f64, GeoScore)> {
    let distances: Vec<f64> = coords
        .iter()
        .map(|(lat, lon)| haversine_km(req_lat, req_lon, *lat, *lon))
        .collect();

    let Some(base) = distances.iter().copied().fold(None, |acc, d| match acc {
        None => Some(d),
        Some(m) if d < m => Some(d),
        Some(m) => Some(m),
    }) else {
        return Vec::new();
    };

    distances
        .into_iter()
        .map(|d| (d, band(d, base)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn haversine_zero_distance() {
        assert!(haversine_km(51.5, -0.1, 51.5, -0.1) < 1e-6);
    }

    #[test]
    fn haversine_known_pair() {
        // London to Paris, roughly 344 km.
        let d = haversine_km(51.5074, -0.1278, 48.8566, 2.3522);
        assert!((300.0..400.0).contains(&d), "distance was {d}");
    }

    #[test]
    fn band_monotonic() {
        // geoScore(dist1) >= geoScore(dist2) whenever dist1 <= dist2.
        let base = 0.0;
        let mut prev = 3u8;
        for dist in [0.0, 500.0, 1500.0, 1500.1, 5000.0, 9000.0, 9000.1, 50000.0] {
            let score = band(dist, base);
            assert!(score <= prev, "band({dist}) = {score} > prev {prev}");
            prev = score;
        }
    }

    #[test]
    fn relative_banding_single_region_fleet() {
        // A Tokyo-only fleet still produces a Good node for a Tokyo request.
        let coords = [(35.0, 139.0), (35.1, 139.1), (35.2, 139.2)];
        let scored = score_all(&coords, 35.0, 139.0);
        assert!(scored.iter().any(|(_, s)| *s == 2));
    }

    #[test]
    fn score_all_empty_input() {
        assert!(score_all(&[], 0.0, 0.0).is_empty());
    }
}
