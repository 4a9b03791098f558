//! Data contract with the external pricing engine.
//!
//! The backtest never prices anything itself. It hands a [`Timetable`] and a
//! [`MarketDataset`] to a [`PricingOracle`] and receives a fair value plus,
//! when requested, a cashflow trace keyed by event index.
//!
//! Oracles must be deterministic for fixed inputs (including the seed) and
//! safe to call from several threads at once when trials run in parallel.

use crate::error::{BacktestError, OracleError, Result};
use crate::timetable::Timetable;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Flat market assumptions used for every historical pricing date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketAssumptions {
    /// Base (discounting) currency.
    #[serde(default = "default_base_currency")]
    pub base_currency: String,
    /// Flat continuously compounded risk-free rate.
    #[serde(default = "default_rate")]
    pub rate: f64,
    /// Flat continuous dividend yield.
    #[serde(default = "default_dividend_yield")]
    pub dividend_yield: f64,
    /// Flat volatility.
    #[serde(default = "default_vol")]
    pub vol: f64,
    /// Curve pillar times in years.
    #[serde(default = "default_curve_times")]
    pub curve_times: Vec<f64>,
    /// Simulation paths for backtest pricing.
    #[serde(default = "default_paths")]
    pub paths: usize,
    /// Simulation time steps.
    #[serde(default = "default_timesteps")]
    pub timesteps: usize,
    /// Random seed.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Simulation paths when projecting per-path cashflows.
    #[serde(default = "default_projection_paths")]
    pub projection_paths: usize,
}

fn default_base_currency() -> String { "USD".to_string() }
fn default_rate() -> f64 { 0.03 }
fn default_dividend_yield() -> f64 { 0.02 }
fn default_vol() -> f64 { 0.3 }
fn default_curve_times() -> Vec<f64> { vec![0.0, 2.0] }
fn default_paths() -> usize { 10_000 }
fn default_timesteps() -> usize { 100 }
fn default_seed() -> u64 { 1 }
fn default_projection_paths() -> usize { 100 }

impl Default for MarketAssumptions {
    fn default() -> Self {
        Self {
            base_currency: default_base_currency(),
            rate: default_rate(),
            dividend_yield: default_dividend_yield(),
            vol: default_vol(),
            curve_times: default_curve_times(),
            paths: default_paths(),
            timesteps: default_timesteps(),
            seed: default_seed(),
            projection_paths: default_projection_paths(),
        }
    }
}

impl MarketAssumptions {
    pub fn validate(&self) -> Result<()> {
        if self.base_currency.trim().is_empty() {
            return Err(BacktestError::ConfigError(
                "Base currency must not be empty".to_string(),
            ));
        }
        if self.curve_times.is_empty() || self.curve_times.windows(2).any(|w| w[1] <= w[0]) {
            return Err(BacktestError::ConfigError(
                "Curve times must be non-empty and strictly increasing".to_string(),
            ));
        }
        if !(self.vol > 0.0) {
            return Err(BacktestError::ConfigError(format!(
                "Volatility must be positive, got {}",
                self.vol
            )));
        }
        if self.paths == 0 || self.timesteps == 0 || self.projection_paths == 0 {
            return Err(BacktestError::ConfigError(
                "Path and time step counts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Simulation controls passed to the oracle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationControls {
    pub paths: usize,
    pub timesteps: usize,
    pub seed: u64,
    /// Request a path-averaged cashflow trace.
    pub record_cashflows: bool,
    /// Request per-path cashflows.
    pub record_path_cashflows: bool,
}

/// Curve data for one asset, as `(time in years, value)` pillars.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CurveData {
    /// Continuously compounded zero rates (discount curve).
    ZeroRates(Vec<(f64, f64)>),
    /// Forward prices of an equity.
    Forwards(Vec<(f64, f64)>),
}

/// Flat volatility for one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolSpec {
    pub asset: String,
    pub vol: f64,
}

/// Market data bundle for one pricing date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketDataset {
    pub pricing_ts: DateTime<Utc>,
    pub base_currency: String,
    pub simulation: SimulationControls,
    pub assets: BTreeMap<String, CurveData>,
    pub vol: VolSpec,
}

impl MarketDataset {
    /// Dataset for pricing `ticker` at `spot` on `pricing_ts`: flat zero rates
    /// for the base currency and forwards `spot·exp((r − q)·t)` on the
    /// configured pillars.
    pub fn from_assumptions(
        pricing_ts: DateTime<Utc>,
        ticker: &str,
        spot: f64,
        market: &MarketAssumptions,
    ) -> Self {
        let rates: Vec<(f64, f64)> = market.curve_times.iter().map(|&t| (t, market.rate)).collect();
        let forwards: Vec<(f64, f64)> = market
            .curve_times
            .iter()
            .map(|&t| (t, spot * ((market.rate - market.dividend_yield) * t).exp()))
            .collect();

        let mut assets = BTreeMap::new();
        assets.insert(market.base_currency.clone(), CurveData::ZeroRates(rates));
        assets.insert(ticker.to_string(), CurveData::Forwards(forwards));

        Self {
            pricing_ts,
            base_currency: market.base_currency.clone(),
            simulation: SimulationControls {
                paths: market.paths,
                timesteps: market.timesteps,
                seed: market.seed,
                record_cashflows: false,
                record_path_cashflows: false,
            },
            assets,
            vol: VolSpec {
                asset: ticker.to_string(),
                vol: market.vol,
            },
        }
    }

    /// Request the path-averaged cashflow trace.
    pub fn with_cashflow_recording(mut self) -> Self {
        self.simulation.record_cashflows = true;
        self
    }

    /// Request per-path cashflows over `paths` paths.
    pub fn with_path_cashflows(mut self, paths: usize) -> Self {
        self.simulation.paths = paths;
        self.simulation.record_path_cashflows = true;
        self
    }

    pub fn with_vol(mut self, vol: f64) -> Self {
        self.vol.vol = vol;
        self
    }
}

/// One realized cashflow, averaged across paths.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    /// Index into the priced timetable's events.
    pub event_index: usize,
    pub amount: f64,
}

impl TraceEntry {
    pub fn new(event_index: usize, amount: f64) -> Self {
        Self {
            event_index,
            amount,
        }
    }
}

/// Cashflows of one event on every simulated path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathCashflow {
    pub event_index: usize,
    pub amounts: Vec<f64>,
}

/// Oracle response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PricingResult {
    pub value: f64,
    /// Present when `record_cashflows` was requested.
    pub cashflows: Option<Vec<TraceEntry>>,
    /// Present when `record_path_cashflows` was requested.
    pub path_cashflows: Option<Vec<PathCashflow>>,
}

impl PricingResult {
    pub fn value_only(value: f64) -> Self {
        Self {
            value,
            ..Default::default()
        }
    }

    pub fn with_cashflows(value: f64, cashflows: Vec<TraceEntry>) -> Self {
        Self {
            value,
            cashflows: Some(cashflows),
            path_cashflows: None,
        }
    }
}

/// External valuation capability.
pub trait PricingOracle: Send + Sync {
    fn price(
        &self,
        timetable: &Timetable,
        dataset: &MarketDataset,
    ) -> std::result::Result<PricingResult, OracleError>;
}

impl<F> PricingOracle for F
where
    F: Fn(&Timetable, &MarketDataset) -> std::result::Result<PricingResult, OracleError>
        + Send
        + Sync,
{
    fn price(
        &self,
        timetable: &Timetable,
        dataset: &MarketDataset,
    ) -> std::result::Result<PricingResult, OracleError> {
        self(timetable, dataset)
    }
}
