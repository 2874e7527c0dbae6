//! Descriptive statistics and two-sample hypothesis tests
//!
//! Small samples (either side below [`LARGE_SAMPLE`]) use a pooled two-sided
//! Student t-test; larger ones a z-test with each variant's own standard
//! error. The reported interval is always a 95% normal interval on the
//! difference of means, independent of which test ran.

use super::{TestKind, VariantStats};

/// Sample size from which the normal approximation is used
pub const LARGE_SAMPLE: usize = 30;

/// Two-sided 95% critical value of the standard normal
pub const Z_95: f64 = 1.96;

/// Outcome of comparing two samples
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TestOutcome {
    pub kind: TestKind,
    pub p_value: f64,
    /// Interval on mean(a) - mean(b)
    pub confidence_interval: (f64, f64),
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Variance with `ddof` degrees of freedom removed (0 = population, 1 = sample)
pub fn variance(values: &[f64], ddof: usize) -> f64 {
    if values.len() <= ddof {
        return 0.0;
    }
    let m = mean(values);
    let ss: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    ss / (values.len() - ddof) as f64
}

/// Mean, population standard deviation and count of one variant
pub fn summarize(variant: &str, values: &[f64]) -> VariantStats {
    VariantStats {
        variant: variant.to_string(),
        mean: mean(values),
        std_dev: variance(values, 0).sqrt(),
        count: values.len(),
    }
}

/// Compare two non-empty samples
pub fn compare(a: &[f64], b: &[f64]) -> TestOutcome {
    let (n_a, n_b) = (a.len() as f64, b.len() as f64);
    let diff = mean(a) - mean(b);
    let small = a.len() < LARGE_SAMPLE || b.len() < LARGE_SAMPLE;

    let p_value = if small {
        pooled_t_test(a, b)
    } else {
        let se = (variance(a, 0) / n_a + variance(b, 0) / n_b).sqrt();
        p_from_statistic(diff, se, |z| 2.0 * (1.0 - normal_cdf(z.abs())))
    };

    let se_diff = (variance(a, 0) / n_a + variance(b, 0) / n_b).sqrt();
    let margin = Z_95 * se_diff;

    TestOutcome {
        kind: if small { TestKind::TTest } else { TestKind::ZTest },
        p_value: p_value.clamp(0.0, 1.0),
        confidence_interval: (diff - margin, diff + margin),
    }
}

fn pooled_t_test(a: &[f64], b: &[f64]) -> f64 {
    let (n_a, n_b) = (a.len(), b.len());
    if n_a + n_b < 3 {
        // Zero degrees of freedom
        return 1.0;
    }
    let df = (n_a + n_b - 2) as f64;
    let pooled = ((n_a.saturating_sub(1)) as f64 * variance(a, 1)
        + (n_b.saturating_sub(1)) as f64 * variance(b, 1))
        / df;
    let se = (pooled * (1.0 / n_a as f64 + 1.0 / n_b as f64)).sqrt();
    p_from_statistic(mean(a) - mean(b), se, |t| student_t_two_sided(t, df))
}

/// Zero spread means the test statistic is either 0 or unbounded
fn p_from_statistic(diff: f64, se: f64, p_of: impl Fn(f64) -> f64) -> f64 {
    if se <= f64::EPSILON || !se.is_finite() {
        return if diff.abs() <= f64::EPSILON { 1.0 } else { 0.0 };
    }
    p_of(diff / se)
}

/// Standard normal CDF (Abramowitz-Stegun 26.2.17, |error| < 7.5e-8)
pub fn normal_cdf(z: f64) -> f64 {
    let x = z.abs();
    let t = 1.0 / (1.0 + 0.231_641_9 * x);
    let d = 0.398_942_280_401_432_7 * (-0.5 * x * x).exp();
    let tail = d
        * t
        * (0.319_381_530
            + t * (-0.356_563_782 + t * (1.781_477_937 + t * (-1.821_255_978 + t * 1.330_274_429))));
    if z >= 0.0 {
        1.0 - tail
    } else {
        tail
    }
}

/// Two-sided tail probability P(|T| >= |t|) for Student's t with `df` degrees
pub fn student_t_two_sided(t: f64, df: f64) -> f64 {
    if !t.is_finite() {
        return 0.0;
    }
    regularized_incomplete_beta(df / (df + t * t), df / 2.0, 0.5)
}

/// I_x(a, b) via the continued fraction expansion (modified Lentz)
pub fn regularized_incomplete_beta(x: f64, a: f64, b: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    if x >= 1.0 {
        return 1.0;
    }

    let ln_front = ln_gamma(a + b) - ln_gamma(a) - ln_gamma(b) + a * x.ln() + b * (1.0 - x).ln();
    let front = ln_front.exp();

    if x < (a + 1.0) / (a + b + 2.0) {
        front * beta_continued_fraction(x, a, b) / a
    } else {
        1.0 - front * beta_continued_fraction(1.0 - x, b, a) / b
    }
}

fn beta_continued_fraction(x: f64, a: f64, b: f64) -> f64 {
    const MAX_ITER: usize = 300;
    const EPS: f64 = 1e-14;
    const TINY: f64 = 1e-300;

    let floor = |v: f64| if v.abs() < TINY { TINY } else { v };

    let qab = a + b;
    let qap = a + 1.0;
    let qam = a - 1.0;

    let mut c = 1.0;
    let mut d = 1.0 / floor(1.0 - qab * x / qap);
    let mut h = d;

    for m in 1..=MAX_ITER {
        let m = m as f64;
        let m2 = 2.0 * m;

        // Even step
        let aa = m * (b - m) * x / ((qam + m2) * (a + m2));
        d = 1.0 / floor(1.0 + aa * d);
        c = floor(1.0 + aa / c);
        h *= d * c;

        // Odd step
        let aa = -(a + m) * (qab + m) * x / ((a + m2) * (qap + m2));
        d = 1.0 / floor(1.0 + aa * d);
        c = floor(1.0 + aa / c);
        let delta = d * c;
        h *= delta;

        if (delta - 1.0).abs() < EPS {
            break;
        }
    }

    h
}

/// ln Γ(x) for x > 0 (Lanczos, g = 7)
pub fn ln_gamma(x: f64) -> f64 {
    const G: f64 = 7.0;
    const COEF: [f64; 9] = [
        0.999_999_999_999_809_9,
        676.520_368_121_885_1,
        -1_259.139_216_722_402_8,
        771.323_428_777_653_1,
        -176.615_029_162_140_6,
        12.507_343_278_686_905,
        -0.138_571_095_265_720_12,
        9.984_369_578_019_572e-6,
        1.505_632_735_149_311_6e-7,
    ];

    if x < 0.5 {
        let pi = std::f64::consts::PI;
        return (pi / (pi * x).sin()).ln() - ln_gamma(1.0 - x);
    }

    let x = x - 1.0;
    let t = x + G + 0.5;
    let mut acc = COEF[0];
    for (i, c) in COEF.iter().enumerate().skip(1) {
        acc += c / (x + i as f64);
    }

    0.5 * (2.0 * std::f64::consts::PI).ln() + (x + 0.5) * t.ln() - t + acc.ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rand_distr::{Distribution, Normal};

    fn draw(rng: &mut StdRng, mean: f64, n: usize) -> Vec<f64> {
        let normal = Normal::new(mean, 1.0).unwrap();
        (0..n).map(|_| normal.sample(rng)).collect()
    }

    #[test]
    fn test_summarize_uses_population_std() {
        let stats = summarize("control", &[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert_eq!(stats.count, 8);
        assert!((stats.mean - 5.0).abs() < 1e-12);
        assert!((stats.std_dev - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_normal_cdf_reference_points() {
        assert!((normal_cdf(0.0) - 0.5).abs() < 1e-7);
        assert!((normal_cdf(1.96) - 0.975).abs() < 1e-4);
        assert!((normal_cdf(-1.96) - 0.025).abs() < 1e-4);
    }

    #[test]
    fn test_ln_gamma_matches_factorials() {
        assert!((ln_gamma(5.0) - 24f64.ln()).abs() < 1e-10);
        assert!((ln_gamma(0.5) - std::f64::consts::PI.sqrt().ln()).abs() < 1e-10);
    }

    #[test]
    fn test_student_t_tail_reference_values() {
        // t = 2.228 is the 97.5% quantile for 10 degrees of freedom
        assert!((student_t_two_sided(2.228, 10.0) - 0.05).abs() < 1e-3);
        assert!((student_t_two_sided(0.0, 10.0) - 1.0).abs() < 1e-12);
        // Large df approaches the normal tail
        let normal_tail = 2.0 * (1.0 - normal_cdf(1.96));
        assert!((student_t_two_sided(1.96, 5_000.0) - normal_tail).abs() < 1e-3);
    }

    #[test]
    fn test_small_samples_use_t_test() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0];
        let b = [2.0, 3.0, 4.0, 5.0, 6.0];
        let outcome = compare(&a, &b);
        assert_eq!(outcome.kind, TestKind::TTest);
        // Pooled t = -1.0 with 8 degrees of freedom
        assert!((outcome.p_value - 0.3466).abs() < 1e-3);
        let (lo, hi) = outcome.confidence_interval;
        assert!(lo < -1.0 && hi > -1.0);
    }

    #[test]
    fn test_large_samples_use_z_test() {
        let mut rng = StdRng::seed_from_u64(7);
        let a = draw(&mut rng, 5.0, 40);
        let b = draw(&mut rng, 7.0, 40);
        let outcome = compare(&a, &b);
        assert_eq!(outcome.kind, TestKind::ZTest);
        assert!(outcome.p_value < 0.05);
        assert!(outcome.confidence_interval.1 < 0.0);
    }

    #[test]
    fn test_zero_spread_edge_cases() {
        let same = compare(&[1.0, 1.0, 1.0], &[1.0, 1.0]);
        assert_eq!(same.p_value, 1.0);

        let apart = compare(&[1.0, 1.0, 1.0], &[0.0, 0.0]);
        assert_eq!(apart.p_value, 0.0);

        let singletons = compare(&[1.0], &[0.0]);
        assert_eq!(singletons.p_value, 1.0);
    }

    #[test]
    fn test_null_false_positive_rate() {
        // n=40 takes the z-test on population deviations, which runs slightly
        // above the nominal 5% (about 5.7%), so the bound allows for that
        let mut rng = StdRng::seed_from_u64(42);
        let trials = 2000;
        let false_positives = (0..trials)
            .filter(|_| {
                let a = draw(&mut rng, 5.0, 40);
                let b = draw(&mut rng, 5.0, 40);
                compare(&a, &b).p_value < 0.05
            })
            .count();
        assert!(
            (false_positives as f64) / (trials as f64) <= 0.07,
            "false positive rate too high: {}/{}",
            false_positives,
            trials
        );
    }
}
