//! structbt - walk-forward backtesting of structured equity derivatives.
//!
//! # Overview
//!
//! For every admissible historical trade date, structbt builds the event
//! schedule of a contract, asks an external pricing oracle for its fair value
//! and cashflow trace, and turns the realized cashflows into a holding or
//! annualized return:
//!
//! - **Contracts**: Discount Certificate, Reverse Convertible, Knockout
//!   Option, Vanilla Option and Cliquet, resolved from flat parameters
//! - **Pluggable pricing**: any [`PricingOracle`] (including plain closures)
//! - **Return solver**: holding return or continuously compounded IRR via a
//!   bounded Brent minimizer
//! - **Parallel trials**: optional rayon dispatch with ordered results
//! - **Failure isolation**: an oracle or solver failure only nulls its trial
//! - **Configuration files**: TOML-based configuration for reproducible runs
//!
//! # Quick Start
//!
//! ```no_run
//! use structbt::{
//!     BacktestConfig, BacktestDriver, ContractParams, MarketDataset, OracleError,
//!     PriceCsvConfig, PriceHistory, PricingResult, Timetable, TraceEntry,
//! };
//!
//! let history = PriceHistory::from_csv("data/spots.csv", &PriceCsvConfig::default()).unwrap();
//!
//! // Stand-in oracle: pays 100 at maturity, priced at 95
//! let oracle = |tt: &Timetable, _: &MarketDataset| -> Result<PricingResult, OracleError> {
//!     Ok(PricingResult::with_cashflows(95.0, vec![TraceEntry::new(tt.len() - 1, 100.0)]))
//! };
//!
//! let driver = BacktestDriver::new(&history, &oracle, BacktestConfig::default());
//! let params = ContractParams::new("SPX", "Reverse Convertible");
//! let result = driver.run(&params, true).unwrap();
//!
//! for point in &result.series {
//!     println!("{}: {:?}", point.date.date_naive(), point.value);
//! }
//! ```
//!
//! # Modules
//!
//! - [`data`]: Price history loading and month-end trade dates
//! - [`timetable`]: Event schedules
//! - [`contracts`]: Contract parameters and timetable construction
//! - [`oracle`]: Pricing oracle interface and market datasets
//! - [`cashflow`]: Cashflow trace extraction
//! - [`solver`]: Holding and annualized return
//! - [`engine`]: Backtest driver and results
//! - [`projection`]: Single-trial cashflow projection and vol ladder
//! - [`analytics`]: Return summaries and reports
//! - [`config`]: TOML configuration file support
//! - [`metadata`]: Run identifiers and fingerprints

pub mod analytics;
pub mod cashflow;
pub mod config;
pub mod contracts;
pub mod data;
pub mod engine;
pub mod error;
pub mod metadata;
pub mod oracle;
pub mod projection;
pub mod solver;
pub mod timetable;

// Re-exports for convenience
pub use analytics::{return_histogram, HistogramBin, ReturnSummary};
pub use cashflow::{extract, year_fraction, ExtractedCashflows};
pub use config::BacktestFileConfig;
pub use contracts::{
    ContractParams, ContractSpec, ContractType, OptionDirection, TimetableBuilder,
};
pub use data::{PriceCsvConfig, PriceHistory};
pub use engine::{
    BacktestConfig, BacktestDriver, BacktestResult, CashflowDetail, CashflowView, ReturnPoint,
    TrialFailure, TrialRecord,
};
pub use error::{BacktestError, ErrorCategory, OracleError, Result};
pub use oracle::{
    MarketAssumptions, MarketDataset, PathCashflow, PricingOracle, PricingResult, TraceEntry,
};
pub use projection::{describe_contract, project_cashflows, vol_ladder, CashflowProjection};
pub use solver::{compute_return, SolverConfig};
pub use timetable::{Event, EventOp, Timetable};
