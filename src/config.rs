//! Configuration file support for backtests.
//!
//! Allows loading backtest configurations from TOML files for reproducibility.

use crate::contracts::{ContractParams, ContractSpec};
use crate::data::PriceCsvConfig;
use crate::engine::BacktestConfig;
use crate::error::{BacktestError, Result};
use crate::oracle::MarketAssumptions;
use crate::solver::SolverConfig;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

/// Complete backtest configuration loaded from a file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BacktestFileConfig {
    /// General backtest settings.
    #[serde(default)]
    pub backtest: BacktestSettings,
    /// Market assumptions handed to the pricing oracle.
    #[serde(default)]
    pub market: MarketAssumptions,
    /// Return solver settings.
    #[serde(default)]
    pub solver: SolverConfig,
    /// Price data settings.
    #[serde(default)]
    pub data: DataSettings,
    /// Contract under test.
    #[serde(default)]
    pub contract: ContractParams,
}

/// General backtest settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestSettings {
    /// First month of the window (YYYY-MM-DD).
    #[serde(default = "default_start_date")]
    pub start_date: String,
    /// Last month-end of the window (YYYY-MM-DD).
    #[serde(default = "default_end_date")]
    pub end_date: String,
    #[serde(default = "default_tenor_months")]
    pub tenor_months: usize,
    /// Report annualized rather than holding returns.
    #[serde(default = "default_true")]
    pub annualized: bool,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub show_progress: bool,
    #[serde(default)]
    pub oracle_deadline_ms: Option<u64>,
}

fn default_start_date() -> String { "2020-03-31".to_string() }
fn default_end_date() -> String { "2024-04-30".to_string() }
fn default_tenor_months() -> usize { 12 }
fn default_true() -> bool { true }

impl Default for BacktestSettings {
    fn default() -> Self {
        Self {
            start_date: default_start_date(),
            end_date: default_end_date(),
            tenor_months: default_tenor_months(),
            annualized: true,
            parallel: false,
            show_progress: false,
            oracle_deadline_ms: None,
        }
    }
}

/// Price data settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSettings {
    /// Path to the wide price CSV.
    #[serde(default = "default_data_path")]
    pub path: String,
    #[serde(default)]
    pub date_format: Option<String>,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
}

fn default_data_path() -> String { "data/spots.csv".to_string() }
fn default_delimiter() -> String { ",".to_string() }

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            path: default_data_path(),
            date_format: None,
            delimiter: default_delimiter(),
        }
    }
}

fn parse_date(field: &str, value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|e| {
        BacktestError::ConfigError(format!("Invalid {} '{}': {}", field, value, e))
    })
}

impl BacktestFileConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let content = fs::read_to_string(path)?;
        let config: BacktestFileConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| BacktestError::ConfigError(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Convert to a validated [`BacktestConfig`] for the driver.
    pub fn to_backtest_config(&self) -> Result<BacktestConfig> {
        let config = BacktestConfig {
            window_start: parse_date("start_date", &self.backtest.start_date)?,
            window_end: parse_date("end_date", &self.backtest.end_date)?,
            tenor_months: self.backtest.tenor_months,
            parallel: self.backtest.parallel,
            show_progress: self.backtest.show_progress,
            oracle_deadline_ms: self.backtest.oracle_deadline_ms,
            market: self.market.clone(),
            solver: self.solver,
        };
        config.validate()?;
        Ok(config)
    }

    /// CSV options for loading `data.path`.
    pub fn price_csv_config(&self) -> Result<PriceCsvConfig> {
        let delimiter = match self.data.delimiter.as_bytes() {
            [b] => *b,
            _ => {
                return Err(BacktestError::ConfigError(format!(
                    "Delimiter must be a single byte, got '{}'",
                    self.data.delimiter
                )))
            }
        };
        Ok(PriceCsvConfig {
            date_format: self.data.date_format.clone(),
            delimiter,
            ..Default::default()
        })
    }

    /// Resolve the `[contract]` table.
    pub fn contract_spec(&self) -> Result<ContractSpec> {
        self.contract.resolve()
    }

    /// Generate an example configuration file content.
    pub fn example() -> String {
        r#"# Structured product backtest configuration

[backtest]
start_date = "2020-03-31"
end_date = "2024-04-30"
tenor_months = 12
annualized = true
parallel = false
show_progress = true
# oracle_deadline_ms = 5000

[market]
base_currency = "USD"
rate = 0.03
dividend_yield = 0.02
vol = 0.3
curve_times = [0.0, 2.0]
paths = 10000
timesteps = 100
seed = 1
projection_paths = 100

[solver]
lower = -1.0
upper = 5.0
x_tolerance = 1e-10
residual_tolerance = 1e-6
max_iterations = 500

[data]
path = "data/spots.csv"
# date_format = "%Y-%m-%d"
delimiter = ","

[contract]
ticker = "SPX"
contract_type = "Reverse Convertible"
# strike = 80.0
# barrier = 100.0
# coupon_rate = 0.15
# option_type = "Call"
# rebate = 1.0
# cap_floor = [-5.0, 5.0]
"#
        .to_string()
    }
}
