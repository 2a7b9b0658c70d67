//! Scalar sampling primitives built on uniform draws.
//!
//! Distribution draws are hand-rolled (Box-Muller, Marsaglia-Tsang) so the
//! whole sampler depends on a single uniform source.

use rand::Rng;
use rand::rngs::StdRng;

/// One standard-normal draw via Box-Muller.
pub fn sample_standard_normal(rng: &mut StdRng) -> f64 {
    let u1 = (1.0_f64 - rng.random::<f64>()).max(f64::MIN_POSITIVE);
    let u2 = rng.random::<f64>();
    (-2.0_f64 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

/// Gamma(shape, scale) draw via Marsaglia-Tsang, with the boosting trick
/// for shape < 1.
pub fn sample_gamma(rng: &mut StdRng, shape: f64, scale: f64) -> f64 {
    if !(shape > 0.0 && scale > 0.0) {
        return f64::NAN;
    }
    if shape < 1.0 {
        let u = (1.0_f64 - rng.random::<f64>()).max(f64::MIN_POSITIVE);
        return sample_gamma(rng, shape + 1.0, scale) * u.powf(1.0 / shape);
    }

    let shape_minus_third = shape - (1.0 / 3.0);
    let coeff = (1.0 / (9.0 * shape_minus_third)).sqrt();
    loop {
        let standard_normal = sample_standard_normal(rng);
        let one_plus_coeff_noise = coeff.mul_add(standard_normal, 1.0);
        if one_plus_coeff_noise <= 0.0 {
            continue;
        }
        let v = one_plus_coeff_noise.powi(3);
        let u = (1.0_f64 - rng.random::<f64>()).max(f64::MIN_POSITIVE);
        let sq = standard_normal * standard_normal;
        if u.ln() < 0.5_f64.mul_add(sq, shape_minus_third * (1.0 - v + v.ln())) {
            return shape_minus_third * v * scale;
        }
    }
}

/// Inverse-gamma(shape, scale) draw.
pub fn sample_inverse_gamma(rng: &mut StdRng, shape: f64, scale: f64) -> f64 {
    let gamma = sample_gamma(rng, shape, 1.0 / scale);
    if gamma > 0.0 { 1.0 / gamma } else { f64::NAN }
}

/// Dirichlet draw from per-component concentrations.
pub fn sample_dirichlet(rng: &mut StdRng, concentrations: &[f64]) -> Vec<f64> {
    let mut draws: Vec<f64> = concentrations
        .iter()
        .map(|alpha| sample_gamma(rng, alpha.max(f64::MIN_POSITIVE), 1.0).max(0.0))
        .collect();
    let total: f64 = draws.iter().sum();
    if total > 0.0 {
        for draw in &mut draws {
            *draw /= total;
        }
    } else if let Some(first) = draws.first_mut() {
        *first = 1.0;
    }
    draws
}

/// Categorical draw from unnormalized log-weights.
pub fn sample_categorical_log(rng: &mut StdRng, log_weights: &[f64]) -> usize {
    debug_assert!(!log_weights.is_empty());
    let max = log_weights.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return 0;
    }
    let weights: Vec<f64> = log_weights.iter().map(|lw| (lw - max).exp()).collect();
    let total: f64 = weights.iter().sum();
    let mut threshold = rng.random::<f64>() * total;
    for (index, weight) in weights.iter().enumerate() {
        threshold -= weight;
        if threshold <= 0.0 {
            return index;
        }
    }
    weights.len() - 1
}

/// Poisson draw via Knuth's product-of-uniforms method.
pub fn sample_poisson(rng: &mut StdRng, lambda: f64) -> usize {
    if !(lambda > 0.0) {
        return 0;
    }
    let threshold = (-lambda).exp();
    let mut count = 0_usize;
    let mut product = rng.random::<f64>();
    while product > threshold {
        count += 1;
        product *= rng.random::<f64>();
    }
    count
}

/// Metropolis accept test in log space.
pub fn should_accept(log_acceptance: f64, rng: &mut StdRng) -> bool {
    log_acceptance >= 0.0 || rng.random::<f64>().ln() < log_acceptance
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn gamma_draws_are_positive() {
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..100 {
            assert!(sample_gamma(&mut rng, 0.5, 2.0) > 0.0);
            assert!(sample_gamma(&mut rng, 3.0, 0.5) > 0.0);
        }
    }

    #[test]
    fn dirichlet_draw_sums_to_one() {
        let mut rng = StdRng::seed_from_u64(5);
        let weights = sample_dirichlet(&mut rng, &[1.0, 2.0, 0.5]);
        let total: f64 = weights.iter().sum();
        assert!((total - 1.0).abs() < 1.0e-12);
    }

    #[test]
    fn categorical_respects_dominant_weight() {
        let mut rng = StdRng::seed_from_u64(3);
        let log_weights = [0.0, 50.0, 0.0];
        for _ in 0..20 {
            assert_eq!(sample_categorical_log(&mut rng, &log_weights), 1);
        }
    }

    #[test]
    fn poisson_mean_is_near_lambda() {
        let mut rng = StdRng::seed_from_u64(21);
        let draws: usize = (0..500).map(|_| sample_poisson(&mut rng, 100.0)).sum();
        let mean = draws / 500;
        assert!((90..=110).contains(&mean));
    }

    #[test]
    fn accept_test_always_accepts_improvements() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(should_accept(0.5, &mut rng));
    }

    #[test]
    fn normal_draws_have_sane_spread() {
        let mut rng = StdRng::seed_from_u64(9);
        let draws: Vec<f64> = (0..2_000).map(|_| sample_standard_normal(&mut rng)).collect();
        let mean = draws.iter().sum::<f64>() / 2_000.0;
        assert!(mean.abs() < 0.1);
    }
}
