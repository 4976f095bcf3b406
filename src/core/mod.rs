mod engine;
mod types;

pub use engine::{DEFAULT_SEED, evaluate, simulate};
pub use types::{
    GrowthInput, MarketParams, PercentileLadder, ScenarioInput, SimulationResult,
    UncertaintyConfig, ValuationResult,
};
