use serde::Serialize;

/// A per-year growth assumption: either a point estimate or a (min, max)
/// range that is resolved at each consumption site.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum GrowthInput {
    Scalar(f64),
    Range(f64, f64),
}

impl GrowthInput {
    pub fn midpoint(self) -> f64 {
        match self {
            GrowthInput::Scalar(g) => g,
            GrowthInput::Range(lo, hi) => (lo + hi) * 0.5,
        }
    }

    pub fn is_range(self) -> bool {
        matches!(self, GrowthInput::Range(..))
    }
}

#[derive(Debug, Clone)]
pub struct ScenarioInput {
    pub base_fcf: f64,
    pub growth_rates: Vec<GrowthInput>,
    pub terminal_growth: GrowthInput,
    pub beta: f64,
    pub debt_to_equity: f64,
    pub cost_of_debt: f64,
    pub tax_rate: f64,
    pub net_debt: f64,
    pub shares_outstanding: f64,
}

#[derive(Copy, Clone, Debug)]
pub struct MarketParams {
    pub risk_free_rate: f64,
    pub market_risk_premium: f64,
}

impl MarketParams {
    pub fn new(risk_free_rate: f64, market_risk_premium: f64) -> Self {
        Self {
            risk_free_rate: risk_free_rate.max(0.0),
            market_risk_premium: market_risk_premium.max(0.0),
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct UncertaintyConfig {
    pub fcf_growth_std: f64,
    pub terminal_growth_std: f64,
    pub beta_std: f64,
}

impl Default for UncertaintyConfig {
    fn default() -> Self {
        Self {
            fcf_growth_std: 0.03,
            terminal_growth_std: 0.005,
            beta_std: 0.1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValuationResult {
    pub enterprise_value: f64,
    pub wacc: f64,
    pub terminal_value: f64,
    pub fcf_projections: Vec<f64>,
}

#[derive(Copy, Clone, Debug, Serialize)]
pub struct PercentileLadder {
    pub p5: f64,
    pub p10: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationResult {
    pub per_share_values: Vec<f64>,
    pub mean: f64,
    pub median: f64,
    pub std: f64,
    pub skew: f64,
    pub kurtosis: f64,
    pub percentiles: PercentileLadder,
    pub n_simulations: usize,
}
