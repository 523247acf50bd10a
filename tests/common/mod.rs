use geocluster::{Entry, GeoclusterBuilder, GeoclusterOptions};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// The whole-world viewport in geographic coordinates.
pub const WORLD: [f64; 4] = [-180.0, -90.0, 180.0, 90.0];

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn default_options() -> GeoclusterOptions {
    GeoclusterBuilder::new()
        .radius(40.0)
        .extent(512.0)
        .min_points(2)
        .max_zoom(16)
        .build()
}

/// A deterministic scatter of points, denser around a few hot spots so that
/// clusters actually form at several zooms.
pub fn seeded_world_points(count: usize, seed: u64) -> Vec<(f64, f64)> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let hot_spots = [(13.4, 52.5), (-73.9, 40.7), (139.7, 35.7), (151.2, -33.9)];

    (0..count)
        .map(|i| {
            if i % 4 == 0 {
                (rng.gen_range(-179.0..179.0), rng.gen_range(-80.0..80.0))
            } else {
                let (lon, lat) = hot_spots[i % hot_spots.len()];
                (
                    lon + rng.gen_range(-0.5..0.5),
                    lat + rng.gen_range(-0.5..0.5),
                )
            }
        })
        .collect()
}

pub fn count_points<P, A, D>(entries: &[Entry<'_, P, A, D>]) -> u32 {
    entries.iter().map(|entry| entry.num_points()).sum()
}

/// Project a longitude the way the engines do, for centroid checks.
pub fn unit_x(lon: f64) -> f64 {
    lon / 360.0 + 0.5
}

/// Project a latitude the way the engines do, for centroid checks.
pub fn unit_y(lat: f64) -> f64 {
    let sin = lat.to_radians().sin();
    let y = 0.5 - (0.25 * ((1.0 + sin) / (1.0 - sin)).ln()) / std::f64::consts::PI;

    y.clamp(0.0, 1.0)
}
