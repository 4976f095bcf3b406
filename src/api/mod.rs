use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{Json, Query},
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

use crate::core::{
    self, GrowthInput, MarketParams, PercentileLadder, ScenarioInput, SimulationResult,
    UncertaintyConfig, ValuationResult,
};

const INDEX_HTML: &str = "<!doctype html><html><body>\
<h1>fairval</h1>\
<p>Monte Carlo DCF estimator of intrinsic per-share value.</p>\
<ul>\
<li><code>GET/POST /api/valuation</code> &mdash; run a valuation (camelCase JSON body)</li>\
<li><code>GET /api/beta?ticker=SYM</code> &mdash; look up beta from the configured source</li>\
</ul>\
</body></html>";

/// Externally fetched market data for a ticker. `market_premium` is a decimal
/// rate, e.g. 0.065.
#[derive(Copy, Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BetaQuote {
    pub beta: f64,
    pub market_premium: f64,
}

/// Collaborator that resolves a levered beta and market premium for a ticker.
/// The crate ships no market-data client; embedders plug one in via
/// [`run_http_server_with`]. Lookup failure is a recoverable condition and
/// never affects a valuation with a manually supplied beta.
pub trait BetaSource {
    fn lookup(&self, ticker: &str) -> Result<BetaQuote, String>;
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "fairval",
    about = "Monte Carlo DCF estimator of intrinsic per-share value"
)]
pub struct Cli {
    #[arg(long, default_value = "Example Corp")]
    company: String,
    #[arg(long, default_value = "")]
    ticker: String,
    #[arg(long, default_value = "USD")]
    currency: String,
    #[arg(long, default_value_t = 100.0)]
    current_price: f64,
    #[arg(long, default_value_t = 100.0, help = "Shares outstanding in millions")]
    shares_outstanding: f64,
    #[arg(
        long,
        default_value_t = 100.0,
        help = "Most recent annual free cash flow in millions; may be negative"
    )]
    base_fcf: f64,
    #[arg(
        long,
        default_value = "8,7,6,5,5",
        help = "Comma-separated per-year growth in percent; min:max gives a range, e.g. 8,5:15,3:10"
    )]
    growth_rates: String,
    #[arg(
        long,
        default_value = "2.5",
        help = "Terminal growth in percent, scalar or min:max"
    )]
    terminal_growth: String,
    #[arg(long, default_value_t = 1.0)]
    beta: f64,
    #[arg(long, default_value_t = 0.0, help = "Debt-to-equity ratio")]
    debt_to_equity: f64,
    #[arg(long, default_value_t = 4.0, help = "Pre-tax cost of debt in percent")]
    cost_of_debt: f64,
    #[arg(long, default_value_t = 25.0, help = "Effective tax rate in percent")]
    tax_rate: f64,
    #[arg(
        long,
        default_value_t = 0.0,
        help = "Net debt in millions (total debt minus cash)"
    )]
    net_debt: f64,
    #[arg(long, default_value_t = 4.5, help = "Risk-free rate in percent")]
    risk_free_rate: f64,
    #[arg(long, default_value_t = 6.5, help = "Market risk premium in percent")]
    market_risk_premium: f64,
    #[arg(
        long,
        default_value_t = 3.0,
        help = "Std of per-year growth perturbation in percent"
    )]
    fcf_growth_std: f64,
    #[arg(
        long,
        default_value_t = 0.5,
        help = "Std of terminal growth perturbation in percent"
    )]
    terminal_growth_std: f64,
    #[arg(long, default_value_t = 0.1, help = "Std of the beta perturbation")]
    beta_std: f64,
    #[arg(
        long,
        help = "Historical FCF series in millions, oldest first, comma-separated; derives the growth std"
    )]
    fcf_history: Option<String>,
    #[arg(long, default_value_t = 10_000)]
    simulations: u32,
    #[arg(long, default_value_t = core::DEFAULT_SEED)]
    seed: u64,
}

#[derive(Debug, Clone)]
struct ValuationRequest {
    company: String,
    ticker: String,
    currency: String,
    current_price: f64,
    scenario: ScenarioInput,
    market: MarketParams,
    uncertainty: UncertaintyConfig,
    simulations: u32,
    seed: u64,
}

/// A per-year growth assumption on the wire: a bare number (percent) or a
/// two-element [min, max] array.
#[derive(Copy, Clone, Debug, Deserialize)]
#[serde(untagged)]
enum GrowthSpec {
    Scalar(f64),
    Range([f64; 2]),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ValuePayload {
    company: Option<String>,
    ticker: Option<String>,
    currency: Option<String>,
    current_price: Option<f64>,
    shares_outstanding: Option<f64>,
    base_fcf: Option<f64>,
    growth_rates: Option<Vec<GrowthSpec>>,
    terminal_growth: Option<GrowthSpec>,
    beta: Option<f64>,
    debt_to_equity: Option<f64>,
    cost_of_debt: Option<f64>,
    tax_rate: Option<f64>,
    net_debt: Option<f64>,
    risk_free_rate: Option<f64>,
    market_risk_premium: Option<f64>,
    fcf_growth_std: Option<f64>,
    terminal_growth_std: Option<f64>,
    beta_std: Option<f64>,
    fcf_history: Option<Vec<f64>>,
    simulations: Option<u32>,
    seed: Option<u64>,
    fetch_beta: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Summary {
    company: String,
    ticker: String,
    currency: String,
    current_price: f64,
    mean_fair_value: f64,
    median_fair_value: f64,
    upside_probability: f64,
    insight: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Scenarios {
    bear: f64,
    base: f64,
    bull: f64,
    expected: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Statistics {
    std: f64,
    skew: f64,
    kurtosis: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ValuationResponse {
    summary: Summary,
    scenarios: Scenarios,
    base_valuation: ValuationResult,
    percentiles: PercentileLadder,
    statistics: Statistics,
    n_simulations: usize,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Deserialize)]
struct BetaParams {
    ticker: Option<String>,
}

fn parse_growth_token(token: &str) -> Result<GrowthInput, String> {
    let token = token.trim();
    if let Some((lo, hi)) = token.split_once(':') {
        let lo: f64 = lo
            .trim()
            .parse()
            .map_err(|_| format!("invalid growth range '{token}'"))?;
        let hi: f64 = hi
            .trim()
            .parse()
            .map_err(|_| format!("invalid growth range '{token}'"))?;
        if !lo.is_finite() || !hi.is_finite() {
            return Err(format!("invalid growth range '{token}'"));
        }
        // Reversed bounds are normalized rather than rejected.
        Ok(GrowthInput::Range(lo.min(hi), lo.max(hi)))
    } else {
        let value: f64 = token
            .parse()
            .map_err(|_| format!("invalid growth value '{token}'"))?;
        if !value.is_finite() {
            return Err(format!("invalid growth value '{token}'"));
        }
        Ok(GrowthInput::Scalar(value))
    }
}

fn percent_to_decimal(growth: GrowthInput) -> GrowthInput {
    match growth {
        GrowthInput::Scalar(v) => GrowthInput::Scalar(v / 100.0),
        GrowthInput::Range(lo, hi) => GrowthInput::Range(lo / 100.0, hi / 100.0),
    }
}

// Mean and population std of period-over-period growth, each growth clipped to
// [-0.5, 1.0]. Mirrors how the historical form derives its defaults.
fn growth_stats(history: &[f64]) -> (f64, f64) {
    if history.len() < 2 {
        return (0.05, 0.03);
    }

    let mut rates = Vec::with_capacity(history.len() - 1);
    for pair in history.windows(2) {
        let rate = (pair[1] - pair[0]) / pair[0];
        if rate.is_finite() {
            rates.push(rate.clamp(-0.5, 1.0));
        }
    }
    if rates.is_empty() {
        return (0.05, 0.03);
    }

    let mean = rates.iter().sum::<f64>() / rates.len() as f64;
    if rates.len() < 2 {
        return (mean, 0.03);
    }
    let variance = rates.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / rates.len() as f64;
    (mean, variance.sqrt())
}

fn build_request(cli: Cli) -> Result<ValuationRequest, String> {
    if !cli.current_price.is_finite() || cli.current_price <= 0.0 {
        return Err("--current-price must be > 0".to_string());
    }

    if !cli.shares_outstanding.is_finite() || cli.shares_outstanding <= 0.0 {
        return Err("--shares-outstanding must be > 0".to_string());
    }

    if !cli.base_fcf.is_finite() {
        return Err("--base-fcf must be a finite number".to_string());
    }

    let mut growth_rates = Vec::new();
    for token in cli.growth_rates.split(',') {
        if token.trim().is_empty() {
            continue;
        }
        let growth =
            parse_growth_token(token).map_err(|msg| format!("--growth-rates: {msg}"))?;
        growth_rates.push(percent_to_decimal(growth));
    }
    if growth_rates.is_empty() {
        return Err("--growth-rates must name at least one projection year".to_string());
    }

    let terminal_growth = percent_to_decimal(
        parse_growth_token(&cli.terminal_growth)
            .map_err(|msg| format!("--terminal-growth: {msg}"))?,
    );

    let fcf_growth_std = match &cli.fcf_history {
        Some(raw) => {
            let mut history = Vec::new();
            for token in raw.split(',') {
                if token.trim().is_empty() {
                    continue;
                }
                let value: f64 = token
                    .trim()
                    .parse()
                    .map_err(|_| format!("--fcf-history: invalid value '{}'", token.trim()))?;
                history.push(value);
            }
            let (_, std) = growth_stats(&history);
            std.max(0.03)
        }
        None => cli.fcf_growth_std / 100.0,
    };

    Ok(ValuationRequest {
        company: cli.company,
        ticker: cli.ticker,
        currency: cli.currency,
        current_price: cli.current_price,
        scenario: ScenarioInput {
            base_fcf: cli.base_fcf,
            growth_rates,
            terminal_growth,
            beta: cli.beta,
            debt_to_equity: cli.debt_to_equity,
            cost_of_debt: cli.cost_of_debt / 100.0,
            tax_rate: cli.tax_rate / 100.0,
            net_debt: cli.net_debt,
            shares_outstanding: cli.shares_outstanding,
        },
        market: MarketParams::new(cli.risk_free_rate / 100.0, cli.market_risk_premium / 100.0),
        uncertainty: UncertaintyConfig {
            fcf_growth_std,
            terminal_growth_std: cli.terminal_growth_std / 100.0,
            beta_std: cli.beta_std,
        },
        simulations: cli.simulations,
        seed: cli.seed,
    })
}

fn default_cli_for_api() -> Cli {
    Cli {
        company: "Example Corp".to_string(),
        ticker: String::new(),
        currency: "USD".to_string(),
        current_price: 100.0,
        shares_outstanding: 100.0,
        base_fcf: 100.0,
        growth_rates: "8,7,6,5,5".to_string(),
        terminal_growth: "2.5".to_string(),
        beta: 1.0,
        debt_to_equity: 0.0,
        cost_of_debt: 4.0,
        tax_rate: 25.0,
        net_debt: 0.0,
        risk_free_rate: 4.5,
        market_risk_premium: 6.5,
        fcf_growth_std: 3.0,
        terminal_growth_std: 0.5,
        beta_std: 0.1,
        fcf_history: None,
        simulations: 10_000,
        seed: core::DEFAULT_SEED,
    }
}

fn growth_spec_token(spec: &GrowthSpec) -> String {
    match spec {
        GrowthSpec::Scalar(v) => format!("{v}"),
        GrowthSpec::Range([lo, hi]) => format!("{lo}:{hi}"),
    }
}

fn request_from_payload(payload: ValuePayload) -> Result<ValuationRequest, String> {
    let mut cli = default_cli_for_api();

    if let Some(v) = payload.company {
        cli.company = v;
    }
    if let Some(v) = payload.ticker {
        cli.ticker = v;
    }
    if let Some(v) = payload.currency {
        cli.currency = v;
    }
    if let Some(v) = payload.current_price {
        cli.current_price = v;
    }
    if let Some(v) = payload.shares_outstanding {
        cli.shares_outstanding = v;
    }
    if let Some(v) = payload.base_fcf {
        cli.base_fcf = v;
    }
    if let Some(specs) = &payload.growth_rates {
        cli.growth_rates = specs
            .iter()
            .map(growth_spec_token)
            .collect::<Vec<_>>()
            .join(",");
    }
    if let Some(spec) = &payload.terminal_growth {
        cli.terminal_growth = growth_spec_token(spec);
    }
    if let Some(v) = payload.beta {
        cli.beta = v;
    }
    if let Some(v) = payload.debt_to_equity {
        cli.debt_to_equity = v;
    }
    if let Some(v) = payload.cost_of_debt {
        cli.cost_of_debt = v;
    }
    if let Some(v) = payload.tax_rate {
        cli.tax_rate = v;
    }
    if let Some(v) = payload.net_debt {
        cli.net_debt = v;
    }
    if let Some(v) = payload.risk_free_rate {
        cli.risk_free_rate = v;
    }
    if let Some(v) = payload.market_risk_premium {
        cli.market_risk_premium = v;
    }
    if let Some(v) = payload.fcf_growth_std {
        cli.fcf_growth_std = v;
    }
    if let Some(v) = payload.terminal_growth_std {
        cli.terminal_growth_std = v;
    }
    if let Some(v) = payload.beta_std {
        cli.beta_std = v;
    }
    if let Some(history) = &payload.fcf_history {
        cli.fcf_history = Some(
            history
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(","),
        );
    }
    if let Some(v) = payload.simulations {
        cli.simulations = v;
    }
    if let Some(v) = payload.seed {
        cli.seed = v;
    }

    build_request(cli)
}

fn upside_probability(per_share_values: &[f64], current_price: f64) -> f64 {
    if per_share_values.is_empty() {
        return 0.0;
    }
    let above = per_share_values
        .iter()
        .filter(|v| **v > current_price)
        .count();
    above as f64 / per_share_values.len() as f64
}

fn insight_label(upside_probability: f64) -> &'static str {
    if upside_probability > 0.7 {
        "Strong buy"
    } else if upside_probability > 0.5 {
        "Moderate buy"
    } else if upside_probability > 0.3 {
        "Fairly valued"
    } else {
        "Potentially overvalued"
    }
}

fn apply_beta_quote(request: &mut ValuationRequest, quote: &BetaQuote) {
    request.scenario.beta = quote.beta;
    request.market = MarketParams::new(request.market.risk_free_rate, quote.market_premium);
}

fn run_valuation(request: &ValuationRequest) -> ValuationResponse {
    let base = core::evaluate(&request.scenario, &request.market);
    let result = core::simulate(
        &request.scenario,
        &request.market,
        &request.uncertainty,
        request.simulations,
        request.seed,
    );
    info!(
        company = %request.company,
        requested = request.simulations,
        retained = result.n_simulations,
        "valuation complete"
    );
    build_response(request, base, result)
}

fn build_response(
    request: &ValuationRequest,
    base: ValuationResult,
    result: SimulationResult,
) -> ValuationResponse {
    let upside = upside_probability(&result.per_share_values, request.current_price);
    ValuationResponse {
        summary: Summary {
            company: request.company.clone(),
            ticker: request.ticker.clone(),
            currency: request.currency.clone(),
            current_price: request.current_price,
            mean_fair_value: result.mean,
            median_fair_value: result.median,
            upside_probability: upside,
            insight: insight_label(upside),
        },
        scenarios: Scenarios {
            bear: result.percentiles.p10,
            base: result.percentiles.p50,
            bull: result.percentiles.p90,
            expected: result.mean,
        },
        base_valuation: base,
        percentiles: result.percentiles,
        statistics: Statistics {
            std: result.std,
            skew: result.skew,
            kurtosis: result.kurtosis,
        },
        n_simulations: result.n_simulations,
    }
}

/// One-shot CLI valuation: builds a request from parsed arguments and returns
/// the response as pretty-printed JSON.
pub fn run_cli(cli: Cli) -> Result<String, String> {
    let request = build_request(cli)?;
    let response = run_valuation(&request);
    serde_json::to_string_pretty(&response).map_err(|e| format!("serialization failed: {e}"))
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    run_http_server_with(port, None).await
}

pub async fn run_http_server_with(
    port: u16,
    beta_source: Option<Arc<dyn BetaSource + Send + Sync>>,
) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = router(beta_source);

    let listener = TcpListener::bind(addr).await?;
    info!("fairval HTTP API listening on http://{addr}");

    axum::serve(listener, app).await
}

pub fn router(beta_source: Option<Arc<dyn BetaSource + Send + Sync>>) -> Router {
    let valuation_get = {
        let source = beta_source.clone();
        move |Query(payload): Query<ValuePayload>| {
            let source = source.clone();
            async move { valuation_handler_impl(source, payload) }
        }
    };
    let valuation_post = {
        let source = beta_source.clone();
        move |Json(payload): Json<ValuePayload>| {
            let source = source.clone();
            async move { valuation_handler_impl(source, payload) }
        }
    };
    let beta = move |Query(params): Query<BetaParams>| {
        let source = beta_source.clone();
        async move { beta_handler_impl(source, params) }
    };

    Router::new()
        .route("/", get(index_handler))
        .route("/api/valuation", get(valuation_get).post(valuation_post))
        .route("/api/beta", get(beta))
        .fallback(not_found_handler)
}

async fn index_handler() -> impl IntoResponse {
    with_cache_control(Html(INDEX_HTML))
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

fn valuation_handler_impl(
    beta_source: Option<Arc<dyn BetaSource + Send + Sync>>,
    payload: ValuePayload,
) -> Response {
    let fetch_beta = payload.fetch_beta.unwrap_or(false);
    let mut request = match request_from_payload(payload) {
        Ok(request) => request,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, &msg),
    };

    if fetch_beta {
        if request.ticker.is_empty() {
            return error_response(
                StatusCode::BAD_REQUEST,
                "ticker is required when fetchBeta is set",
            );
        }
        let Some(source) = beta_source.as_deref() else {
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "no beta source configured; supply beta in the request instead",
            );
        };
        match source.lookup(&request.ticker) {
            Ok(quote) => apply_beta_quote(&mut request, &quote),
            Err(msg) => {
                return error_response(
                    StatusCode::BAD_GATEWAY,
                    &format!("beta lookup failed: {msg}"),
                );
            }
        }
    }

    json_response(StatusCode::OK, run_valuation(&request))
}

fn beta_handler_impl(
    beta_source: Option<Arc<dyn BetaSource + Send + Sync>>,
    params: BetaParams,
) -> Response {
    let ticker = params.ticker.unwrap_or_default();
    if ticker.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "ticker query parameter is required");
    }
    let Some(source) = beta_source.as_deref() else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "no beta source configured; supply beta in the valuation request instead",
        );
    };
    match source.lookup(&ticker) {
        Ok(quote) => json_response(StatusCode::OK, quote),
        Err(msg) => error_response(StatusCode::BAD_GATEWAY, &format!("beta lookup failed: {msg}")),
    }
}

fn with_cache_control<R: IntoResponse>(response: R) -> Response {
    let mut response = response.into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        "no-store".parse().expect("valid header"),
    );
    response
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        "no-store".parse().expect("valid header"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

#[cfg(test)]
fn request_from_json(json: &str) -> Result<ValuationRequest, String> {
    let payload = serde_json::from_str::<ValuePayload>(json)
        .map_err(|e| format!("Invalid API JSON payload: {e}"))?;
    request_from_payload(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn sample_cli() -> Cli {
        default_cli_for_api()
    }

    #[test]
    fn parse_growth_token_accepts_scalars_and_ranges() {
        assert_eq!(parse_growth_token("8").unwrap(), GrowthInput::Scalar(8.0));
        assert_eq!(
            parse_growth_token(" 5 : 15 ").unwrap(),
            GrowthInput::Range(5.0, 15.0)
        );
        assert_eq!(
            parse_growth_token("-2.5").unwrap(),
            GrowthInput::Scalar(-2.5)
        );
    }

    #[test]
    fn parse_growth_token_normalizes_reversed_ranges() {
        assert_eq!(
            parse_growth_token("15:5").unwrap(),
            GrowthInput::Range(5.0, 15.0)
        );
    }

    #[test]
    fn parse_growth_token_rejects_garbage() {
        let err = parse_growth_token("fast").expect_err("must reject");
        assert!(err.contains("fast"));
        parse_growth_token("1:two").expect_err("must reject");
        parse_growth_token("inf").expect_err("must reject non-finite");
    }

    #[test]
    fn build_request_converts_percent_inputs_to_decimals() {
        let mut cli = sample_cli();
        cli.growth_rates = "8,5:15".to_string();
        cli.terminal_growth = "2:3".to_string();

        let request = build_request(cli).expect("valid request");
        assert_eq!(request.scenario.growth_rates.len(), 2);
        assert_eq!(request.scenario.growth_rates[0], GrowthInput::Scalar(0.08));
        assert_eq!(
            request.scenario.growth_rates[1],
            GrowthInput::Range(0.05, 0.15)
        );
        assert_eq!(
            request.scenario.terminal_growth,
            GrowthInput::Range(0.02, 0.03)
        );
        assert_approx(request.scenario.cost_of_debt, 0.04);
        assert_approx(request.scenario.tax_rate, 0.25);
        assert_approx(request.market.risk_free_rate, 0.045);
        assert_approx(request.market.market_risk_premium, 0.065);
        assert_approx(request.uncertainty.fcf_growth_std, 0.03);
        assert_approx(request.uncertainty.terminal_growth_std, 0.005);
        assert_approx(request.uncertainty.beta_std, 0.1);
    }

    #[test]
    fn build_request_rejects_non_positive_price_and_shares() {
        let mut cli = sample_cli();
        cli.current_price = 0.0;
        let err = build_request(cli).expect_err("must reject price");
        assert!(err.contains("--current-price"));

        let mut cli = sample_cli();
        cli.shares_outstanding = -3.0;
        let err = build_request(cli).expect_err("must reject shares");
        assert!(err.contains("--shares-outstanding"));
    }

    #[test]
    fn build_request_rejects_empty_growth_list() {
        let mut cli = sample_cli();
        cli.growth_rates = " , ,".to_string();
        let err = build_request(cli).expect_err("must reject");
        assert!(err.contains("--growth-rates"));
    }

    #[test]
    fn build_request_derives_growth_std_from_history() {
        let mut cli = sample_cli();
        // Flat history: derived std is 0, floored at 0.03.
        cli.fcf_history = Some("100,100,100".to_string());
        let request = build_request(cli).expect("valid request");
        assert_approx(request.uncertainty.fcf_growth_std, 0.03);

        let mut cli = sample_cli();
        cli.fcf_history = Some("100,110,99,140".to_string());
        let request = build_request(cli).expect("valid request");
        assert!(request.uncertainty.fcf_growth_std > 0.03);
    }

    #[test]
    fn build_request_rejects_malformed_history() {
        let mut cli = sample_cli();
        cli.fcf_history = Some("100,abc".to_string());
        let err = build_request(cli).expect_err("must reject");
        assert!(err.contains("--fcf-history"));
    }

    #[test]
    fn growth_stats_falls_back_below_two_points() {
        assert_eq!(growth_stats(&[]), (0.05, 0.03));
        assert_eq!(growth_stats(&[42.0]), (0.05, 0.03));
    }

    #[test]
    fn growth_stats_clips_extreme_growth() {
        // 100 -> 300 is +200%, clipped to +100%.
        let (mean, _) = growth_stats(&[100.0, 300.0]);
        assert_approx(mean, 1.0);

        // 100 -> 10 is -90%, clipped to -50%.
        let (mean, _) = growth_stats(&[100.0, 10.0]);
        assert_approx(mean, -0.5);
    }

    #[test]
    fn growth_stats_skips_zero_denominators() {
        let (mean, _) = growth_stats(&[0.0, 50.0, 100.0]);
        assert_approx(mean, 1.0);
    }

    #[test]
    fn request_from_json_parses_scalar_and_range_growth() {
        let request = request_from_json(
            r#"{
                "company": "Acme",
                "ticker": "ACME",
                "currentPrice": 50.0,
                "sharesOutstanding": 200.0,
                "baseFcf": 500.0,
                "growthRates": [[5, 15], [3, 10]],
                "terminalGrowth": 2.5,
                "beta": 1.3,
                "netDebt": 250.0,
                "simulations": 1000,
                "seed": 7
            }"#,
        )
        .expect("valid payload");

        assert_eq!(request.company, "Acme");
        assert_eq!(request.ticker, "ACME");
        assert_approx(request.current_price, 50.0);
        assert_eq!(
            request.scenario.growth_rates,
            vec![GrowthInput::Range(0.05, 0.15), GrowthInput::Range(0.03, 0.10)]
        );
        assert_eq!(request.scenario.terminal_growth, GrowthInput::Scalar(0.025));
        assert_approx(request.scenario.beta, 1.3);
        assert_approx(request.scenario.net_debt, 250.0);
        assert_eq!(request.simulations, 1000);
        assert_eq!(request.seed, 7);
    }

    #[test]
    fn request_from_json_rejects_bad_growth_shape() {
        let err = request_from_json(r#"{"growthRates": [[1, 2, 3]]}"#)
            .expect_err("three-element range must be rejected");
        assert!(err.contains("Invalid API JSON payload"));
    }

    #[test]
    fn request_from_payload_keeps_defaults_for_missing_fields() {
        let request = request_from_payload(ValuePayload::default()).expect("defaults are valid");
        assert_eq!(request.company, "Example Corp");
        assert_eq!(request.scenario.growth_rates.len(), 5);
        assert_eq!(request.simulations, 10_000);
        assert_eq!(request.seed, core::DEFAULT_SEED);
    }

    #[test]
    fn upside_probability_counts_strictly_greater_values() {
        assert_approx(upside_probability(&[1.0, 2.0, 3.0, 4.0], 2.0), 0.5);
        assert_approx(upside_probability(&[1.0, 2.0], 5.0), 0.0);
        assert_approx(upside_probability(&[10.0, 20.0], 5.0), 1.0);
        assert_approx(upside_probability(&[], 5.0), 0.0);
    }

    #[test]
    fn insight_label_follows_probability_thresholds() {
        assert_eq!(insight_label(0.8), "Strong buy");
        assert_eq!(insight_label(0.6), "Moderate buy");
        assert_eq!(insight_label(0.4), "Fairly valued");
        assert_eq!(insight_label(0.1), "Potentially overvalued");
    }

    #[test]
    fn valuation_response_serializes_export_fields() {
        let mut cli = sample_cli();
        cli.simulations = 500;
        let request = build_request(cli).expect("valid request");
        let response = run_valuation(&request);

        let json = serde_json::to_value(&response).expect("serializable");
        assert!(json["summary"]["meanFairValue"].is_f64());
        assert!(json["summary"]["upsideProbability"].is_f64());
        assert!(json["summary"]["insight"].is_string());
        assert!(json["scenarios"]["bear"].is_f64());
        assert!(json["baseValuation"]["enterpriseValue"].is_f64());
        assert!(json["baseValuation"]["wacc"].is_f64());
        assert!(json["percentiles"]["p50"].is_f64());
        assert!(json["statistics"]["skew"].is_f64());
        assert!(json["nSimulations"].is_u64());
    }

    #[test]
    fn run_valuation_is_reproducible_for_a_fixed_seed() {
        let request = build_request(sample_cli()).expect("valid request");
        let a = run_valuation(&request);
        let b = run_valuation(&request);
        assert_approx(a.summary.mean_fair_value, b.summary.mean_fair_value);
        assert_approx(a.percentiles.p95, b.percentiles.p95);
        assert_eq!(a.n_simulations, b.n_simulations);
    }

    struct StubBetaSource {
        quote: Result<BetaQuote, String>,
    }

    impl BetaSource for StubBetaSource {
        fn lookup(&self, _ticker: &str) -> Result<BetaQuote, String> {
            self.quote.clone()
        }
    }

    #[test]
    fn beta_quote_overrides_beta_and_market_premium() {
        let mut request = build_request(sample_cli()).expect("valid request");
        let quote = BetaQuote {
            beta: 1.42,
            market_premium: 0.07,
        };
        apply_beta_quote(&mut request, &quote);
        assert_approx(request.scenario.beta, 1.42);
        assert_approx(request.market.market_risk_premium, 0.07);
        assert_approx(request.market.risk_free_rate, 0.045);
    }

    #[test]
    fn beta_source_failure_surfaces_a_message() {
        let source = StubBetaSource {
            quote: Err("upstream timeout".to_string()),
        };
        let err = source.lookup("ACME").expect_err("stub fails");
        assert!(err.contains("upstream timeout"));
    }

    #[test]
    fn run_cli_produces_json_output() {
        let mut cli = sample_cli();
        cli.simulations = 200;
        let json = run_cli(cli).expect("valuation must run");
        let value: serde_json::Value = serde_json::from_str(&json).expect("valid JSON");
        assert_eq!(value["summary"]["company"], "Example Corp");
        assert!(value["nSimulations"].as_u64().unwrap() >= 1);
    }
}
