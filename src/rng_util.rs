//! Small RNG helpers shared across the crate.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Build a generator from an optional seed, falling back to OS entropy.
pub(crate) fn rng_from_seed(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}

/// Sample a float uniformly from `[low, high)`.
pub(crate) fn f64_range(rng: &mut StdRng, low: f64, high: f64) -> f64 {
    low + rng.random_range(0.0..1.0) * (high - low)
}

/// Draw a standard normal variate via the Box-Muller transform.
pub(crate) fn standard_normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.random_range(f64::EPSILON..=1.0);
    let u2: f64 = rng.random_range(0.0..core::f64::consts::TAU);
    (-2.0 * u1.ln()).sqrt() * u2.cos()
}
