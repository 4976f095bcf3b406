use std::f64::consts::PI;

use super::types::{
    GrowthInput, MarketParams, PercentileLadder, ScenarioInput, SimulationResult,
    UncertaintyConfig, ValuationResult,
};

/// Seed used by callers that do not supply one. Fixed so repeated runs over
/// identical inputs reproduce the same distribution.
pub const DEFAULT_SEED: u64 = 42;

/// Single deterministic DCF evaluation. Total over its input domain: hazardous
/// values are clamped, never rejected, so the Monte Carlo loop can call this
/// unattended for every sample.
pub fn evaluate(scenario: &ScenarioInput, market: &MarketParams) -> ValuationResult {
    let growth: Vec<f64> = scenario.growth_rates.iter().map(|g| g.midpoint()).collect();
    evaluate_resolved(
        scenario,
        market,
        scenario.beta,
        &growth,
        scenario.terminal_growth.midpoint(),
    )
}

fn evaluate_resolved(
    scenario: &ScenarioInput,
    market: &MarketParams,
    beta: f64,
    growth: &[f64],
    terminal_growth: f64,
) -> ValuationResult {
    let cost_of_equity = market.risk_free_rate + beta.max(0.1) * market.market_risk_premium;
    let equity_weight = 1.0 / (1.0 + scenario.debt_to_equity.max(0.0));
    let wacc = (equity_weight * cost_of_equity
        + (1.0 - equity_weight)
            * scenario.cost_of_debt.max(0.0)
            * (1.0 - scenario.tax_rate.clamp(0.0, 1.0)))
    .max(0.01);

    let mut fcf_projections = Vec::with_capacity(growth.len());
    let mut fcf = scenario.base_fcf;
    for g in growth {
        fcf *= 1.0 + g;
        fcf_projections.push(fcf);
    }
    let last_fcf = fcf_projections.last().copied().unwrap_or(scenario.base_fcf);

    // Terminal growth can never reach WACC; when the two nearly converge the
    // Gordon denominator explodes, so fall back to a fixed exit multiple.
    let term_g = terminal_growth.min(wacc - 0.001);
    let terminal_value = if wacc > term_g + 0.001 {
        last_fcf * (1.0 + term_g) / (wacc - term_g)
    } else {
        last_fcf * 15.0
    };

    let mut present_value = 0.0;
    for (year, f) in fcf_projections.iter().enumerate() {
        present_value += f / (1.0 + wacc).powi(year as i32 + 1);
    }
    let discount_years = fcf_projections.len().max(1) as i32;
    present_value += terminal_value / (1.0 + wacc).powi(discount_years);

    ValuationResult {
        enterprise_value: present_value.max(0.0),
        wacc,
        terminal_value,
        fcf_projections,
    }
}

/// Monte Carlo driver: draws `n` perturbed scenarios around `base`, evaluates
/// each deterministically, and aggregates the per-share outcomes. `n` is
/// clamped to [100, 100000]. Deterministic for a fixed `seed`.
pub fn simulate(
    base: &ScenarioInput,
    market: &MarketParams,
    uncertainty: &UncertaintyConfig,
    n: u32,
    seed: u64,
) -> SimulationResult {
    let n = n.clamp(100, 100_000) as usize;
    let horizon = base.growth_rates.len();
    let mut rng = Rng::new(splitmix64(seed));

    let mut betas = Vec::with_capacity(n);
    for _ in 0..n {
        betas.push((base.beta + uncertainty.beta_std * rng.standard_normal()).clamp(0.3, 2.5));
    }

    // One flat n x horizon buffer, one row per sample. Range inputs draw
    // uniformly between their (clamped) bounds; scalar inputs get a normal
    // perturbation clamped into the same window.
    let growth_ranged = base.growth_rates.first().is_some_and(|g| g.is_range());
    let mut growths = Vec::with_capacity(n * horizon);
    for _ in 0..n {
        for g in &base.growth_rates {
            if growth_ranged {
                let (lo, hi) = match *g {
                    GrowthInput::Range(lo, hi) => (lo.max(-0.3), hi.min(0.5)),
                    GrowthInput::Scalar(v) => (v.max(-0.3), v.min(0.5)),
                };
                growths.push(rng.uniform(lo, hi));
            } else {
                growths.push(
                    (g.midpoint() + uncertainty.fcf_growth_std * rng.standard_normal())
                        .clamp(-0.3, 0.5),
                );
            }
        }
    }

    let mut terminals = Vec::with_capacity(n);
    match base.terminal_growth {
        GrowthInput::Range(lo, hi) => {
            let (lo, hi) = (lo.max(0.0), hi.min(0.04));
            for _ in 0..n {
                terminals.push(rng.uniform(lo, hi));
            }
        }
        GrowthInput::Scalar(v) => {
            for _ in 0..n {
                terminals.push(
                    (v + uncertainty.terminal_growth_std * rng.standard_normal()).clamp(0.0, 0.04),
                );
            }
        }
    }

    // Samples whose enterprise value clamps to zero are dropped, not replaced;
    // the effective sample count shrinks accordingly.
    let mut enterprise_values = Vec::with_capacity(n);
    for i in 0..n {
        let row = &growths[i * horizon..(i + 1) * horizon];
        let result = evaluate_resolved(base, market, betas[i], row, terminals[i]);
        if result.enterprise_value > 0.0 {
            enterprise_values.push(result.enterprise_value);
        }
    }

    if enterprise_values.is_empty() {
        let fallback = evaluate(base, market).enterprise_value;
        enterprise_values = vec![fallback; 100];
    }

    let shares = base.shares_outstanding.max(1.0);
    let per_share: Vec<f64> = enterprise_values
        .iter()
        .map(|ev| (ev - base.net_debt).max(0.0) / shares)
        .collect();

    let per_share_values = trim_outliers(per_share);
    summarize(per_share_values)
}

// 3x IQR fence. If the fence would reject every value, keep the original set;
// the result must never be empty.
fn trim_outliers(values: Vec<f64>) -> Vec<f64> {
    let mut sorted = values.clone();
    let q1 = percentile(&mut sorted, 25.0);
    let q3 = percentile(&mut sorted, 75.0);
    let iqr = q3 - q1;
    let lo = q1 - 3.0 * iqr;
    let hi = q3 + 3.0 * iqr;

    let trimmed: Vec<f64> = values.iter().copied().filter(|v| *v >= lo && *v <= hi).collect();
    if trimmed.is_empty() { values } else { trimmed }
}

fn summarize(per_share_values: Vec<f64>) -> SimulationResult {
    let count = per_share_values.len();
    let mean = per_share_values.iter().sum::<f64>() / count as f64;

    let mut ordered = per_share_values.clone();
    let percentiles = PercentileLadder {
        p5: percentile(&mut ordered, 5.0),
        p10: percentile(&mut ordered, 10.0),
        p25: percentile(&mut ordered, 25.0),
        p50: percentile(&mut ordered, 50.0),
        p75: percentile(&mut ordered, 75.0),
        p90: percentile(&mut ordered, 90.0),
        p95: percentile(&mut ordered, 95.0),
    };

    let m2 = central_moment(&per_share_values, mean, 2);
    let (skew, kurtosis) = if count <= 3 || m2 <= 1e-24 {
        (0.0, 0.0)
    } else {
        let m3 = central_moment(&per_share_values, mean, 3);
        let m4 = central_moment(&per_share_values, mean, 4);
        (m3 / m2.powf(1.5), m4 / (m2 * m2) - 3.0)
    };

    SimulationResult {
        mean,
        median: percentiles.p50,
        std: m2.sqrt(),
        skew,
        kurtosis,
        percentiles,
        n_simulations: count,
        per_share_values,
    }
}

fn central_moment(values: &[f64], mean: f64, order: i32) -> f64 {
    values.iter().map(|v| (v - mean).powi(order)).sum::<f64>() / values.len() as f64
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

struct Rng {
    state: u64,
    cached_normal: Option<f64>,
}

impl Rng {
    fn new(seed: u64) -> Self {
        let state = if seed == 0 {
            0xA5A5_A5A5_A5A5_A5A5
        } else {
            seed
        };
        Self {
            state,
            cached_normal: None,
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    fn next_f64(&mut self) -> f64 {
        const DENOM: f64 = (1_u64 << 53) as f64;
        let v = self.next_u64() >> 11;
        ((v as f64) + 0.5) / DENOM
    }

    fn uniform(&mut self, lo: f64, hi: f64) -> f64 {
        lo + (hi - lo) * self.next_f64()
    }

    fn standard_normal(&mut self) -> f64 {
        if let Some(z) = self.cached_normal.take() {
            return z;
        }

        let u1 = self.next_f64().max(1e-12);
        let u2 = self.next_f64();
        let r = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * PI * u2;

        let z0 = r * theta.cos();
        let z1 = r * theta.sin();
        self.cached_normal = Some(z1);
        z0
    }
}

fn percentile(values: &mut [f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }

    values.sort_by(|a, b| a.total_cmp(b));

    let n = values.len();
    if n == 1 {
        return values[0];
    }

    let rank = (p / 100.0) * (n as f64 - 1.0);
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;

    if lower == upper {
        values[lower]
    } else {
        let w = rank - lower as f64;
        values[lower] * (1.0 - w) + values[upper] * w
    }
}
