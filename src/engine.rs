//! Walk-forward backtest driver.

use crate::cashflow::{self, ExtractedCashflows};
use crate::contracts::{ContractParams, ContractSpec, ContractType, TimetableBuilder};
use crate::data::PriceHistory;
use crate::error::{BacktestError, ErrorCategory, OracleError, Result};
use crate::metadata::{compute_config_hash, generate_run_id};
use crate::oracle::{MarketAssumptions, MarketDataset, PricingOracle, PricingResult};
use crate::solver::{compute_return, SolverConfig};
use crate::timetable::Timetable;
use chrono::{DateTime, NaiveDate, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Configuration for a backtest run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestConfig {
    /// First calendar month of the trade-date window.
    #[serde(default = "default_window_start")]
    pub window_start: NaiveDate,
    /// Last month-end of the trade-date window.
    #[serde(default = "default_window_end")]
    pub window_end: NaiveDate,
    /// Forward tenor in months; the final `tenor_months` trade dates are
    /// reserved so every trial matures inside the window.
    #[serde(default = "default_tenor_months")]
    pub tenor_months: usize,
    /// Run trials on the rayon thread pool.
    #[serde(default)]
    pub parallel: bool,
    /// Show progress bar during the run.
    #[serde(default)]
    pub show_progress: bool,
    /// Per-call pricing deadline in milliseconds. Slower calls fail the trial.
    #[serde(default)]
    pub oracle_deadline_ms: Option<u64>,
    #[serde(default)]
    pub market: MarketAssumptions,
    #[serde(default)]
    pub solver: SolverConfig,
}

fn default_window_start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 3, 31).unwrap_or_default()
}
fn default_window_end() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 4, 30).unwrap_or_default()
}
fn default_tenor_months() -> usize {
    12
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            window_start: default_window_start(),
            window_end: default_window_end(),
            tenor_months: default_tenor_months(),
            parallel: false,
            show_progress: false,
            oracle_deadline_ms: None,
            market: MarketAssumptions::default(),
            solver: SolverConfig::default(),
        }
    }
}

impl BacktestConfig {
    pub fn with_window(mut self, start: NaiveDate, end: NaiveDate) -> Self {
        self.window_start = start;
        self.window_end = end;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_oracle_deadline(mut self, deadline: Duration) -> Self {
        self.oracle_deadline_ms = Some(deadline.as_millis() as u64);
        self
    }

    pub fn oracle_deadline(&self) -> Option<Duration> {
        self.oracle_deadline_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_end < self.window_start {
            return Err(BacktestError::ConfigError(format!(
                "Window end {} is before start {}",
                self.window_end, self.window_start
            )));
        }
        if self.tenor_months == 0 {
            return Err(BacktestError::ConfigError(
                "Tenor must be at least one month".to_string(),
            ));
        }
        self.market.validate()?;
        self.solver.validate()
    }

    fn timetable_builder(&self) -> TimetableBuilder {
        TimetableBuilder::new(self.tenor_months).with_currency(self.market.base_currency.clone())
    }
}

/// One point of the return series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnPoint {
    /// Trial index; joins into [`BacktestResult::trials`].
    pub trial: usize,
    pub date: DateTime<Utc>,
    /// `None` when the trial failed.
    pub value: Option<f64>,
}

/// Realized cashflows of one trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CashflowDetail {
    pub timestamps: Vec<DateTime<Utc>>,
    pub amounts: Vec<f64>,
    pub trade_price: f64,
}

impl CashflowDetail {
    fn from_extracted(cfs: ExtractedCashflows, trade_price: f64) -> Self {
        Self {
            timestamps: cfs.timestamps,
            amounts: cfs.amounts,
            trade_price,
        }
    }
}

/// Why a trial produced no return.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialFailure {
    pub category: ErrorCategory,
    pub message: String,
}

impl TrialFailure {
    fn from_error(err: &BacktestError) -> Self {
        Self {
            category: err.category(),
            message: err.to_string(),
        }
    }

    fn non_convergence() -> Self {
        Self {
            category: ErrorCategory::Solver,
            message: "annualized return did not converge inside the rate bracket".to_string(),
        }
    }
}

/// Archive entry of one trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub trial: usize,
    pub trade_date: DateTime<Utc>,
    /// Last event of the contract timetable.
    pub maturity: DateTime<Utc>,
    pub spot: f64,
    pub return_value: Option<f64>,
    /// Present whenever the oracle priced the trade.
    pub cashflows: Option<CashflowDetail>,
    pub failure: Option<TrialFailure>,
}

impl TrialRecord {
    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }
}

/// Plot-ready cashflows of one trial: the trade price paid at the trade date
/// followed by every settled cashflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CashflowView {
    pub trade_date: DateTime<Utc>,
    pub maturity: DateTime<Utc>,
    pub points: Vec<(DateTime<Utc>, f64)>,
}

/// Results from a backtest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub run_id: Uuid,
    pub ticker: String,
    pub contract_type: ContractType,
    pub annualized: bool,
    /// Ordered `(date, return)` series.
    pub series: Vec<ReturnPoint>,
    /// Per-trial archive, indexed by trial number.
    pub trials: Vec<TrialRecord>,
    /// SHA-256 of the run configuration and contract parameters.
    pub config_hash: String,
    /// SHA-256 of the price file, when loaded from disk.
    pub data_checksum: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BacktestResult {
    pub fn len(&self) -> usize {
        self.trials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trials.is_empty()
    }

    pub fn trial(&self, index: usize) -> Option<&TrialRecord> {
        self.trials.get(index)
    }

    /// Archive entry behind a series point.
    pub fn record_for(&self, point: &ReturnPoint) -> Option<&TrialRecord> {
        self.trial(point.trial)
    }

    pub fn failed_trials(&self) -> impl Iterator<Item = &TrialRecord> {
        self.trials.iter().filter(|t| t.is_failed())
    }

    /// Successful return values in trial order.
    pub fn returns(&self) -> Vec<f64> {
        self.series.iter().filter_map(|p| p.value).collect()
    }

    pub fn cashflow_view(&self, index: usize) -> Option<CashflowView> {
        let record = self.trial(index)?;
        let detail = record.cashflows.as_ref()?;

        let mut points = Vec::with_capacity(detail.amounts.len() + 1);
        points.push((record.trade_date, -detail.trade_price));
        points.extend(detail.timestamps.iter().copied().zip(detail.amounts.iter().copied()));

        Some(CashflowView {
            trade_date: record.trade_date,
            maturity: record.maturity,
            points,
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Inputs of one trial: spot, timetable and market dataset.
#[derive(Debug, Clone)]
pub struct TrialSetup {
    pub trial: usize,
    pub trade_date: DateTime<Utc>,
    pub spot: f64,
    pub timetable: Timetable,
    pub dataset: MarketDataset,
}

impl TrialSetup {
    pub fn prepare(
        history: &PriceHistory,
        spec: &ContractSpec,
        ticker: &str,
        trade_dates: &[DateTime<Utc>],
        trial: usize,
        config: &BacktestConfig,
    ) -> Result<Self> {
        let trade_date = *trade_dates.get(trial).ok_or(BacktestError::InsufficientDates {
            required: trial + 1,
            available: trade_dates.len(),
        })?;
        let spot = history.value_on_or_before(ticker, trade_date)?;
        let timetable = config
            .timetable_builder()
            .build_resolved(spec, ticker, trade_dates, trial, spot)?;
        let dataset = MarketDataset::from_assumptions(trade_date, ticker, spot, &config.market);

        Ok(Self {
            trial,
            trade_date,
            spot,
            timetable,
            dataset,
        })
    }

    /// Final event time, or the trade date for an empty timetable.
    pub fn maturity(&self) -> DateTime<Utc> {
        self.timetable.last_time().unwrap_or(self.trade_date)
    }
}

/// Month-end trade dates of `ticker` inside the configured window.
pub fn trade_dates(
    history: &PriceHistory,
    ticker: &str,
    config: &BacktestConfig,
) -> Result<Vec<DateTime<Utc>>> {
    history.month_end_trade_dates(ticker, config.window_start, config.window_end)
}

/// Call `oracle`, enforcing the optional deadline after the fact.
pub(crate) fn price_with_deadline<O: PricingOracle + ?Sized>(
    oracle: &O,
    timetable: &Timetable,
    dataset: &MarketDataset,
    deadline: Option<Duration>,
) -> Result<PricingResult> {
    let started = Instant::now();
    let result = oracle.price(timetable, dataset)?;
    let elapsed = started.elapsed();
    if let Some(deadline) = deadline {
        if elapsed > deadline {
            return Err(OracleError::Timeout { elapsed, deadline }.into());
        }
    }
    if !result.value.is_finite() {
        return Err(OracleError::MalformedTrace(format!("non-finite price {}", result.value)).into());
    }
    Ok(result)
}

/// Drives a walk-forward backtest of one contract over a price history.
pub struct BacktestDriver<'a, O: PricingOracle + ?Sized> {
    history: &'a PriceHistory,
    oracle: &'a O,
    config: BacktestConfig,
}

impl<'a, O: PricingOracle + ?Sized> BacktestDriver<'a, O> {
    pub fn new(history: &'a PriceHistory, oracle: &'a O, config: BacktestConfig) -> Self {
        Self {
            history,
            oracle,
            config,
        }
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    /// Run every trial of the window.
    pub fn run(&self, params: &ContractParams, annualized: bool) -> Result<BacktestResult> {
        let never = AtomicBool::new(false);
        self.run_cancellable(params, annualized, &never)
    }

    /// Like [`run`](Self::run), checking `cancel` before each trial. Once the
    /// flag is set the run returns [`BacktestError::Cancelled`] and no partial
    /// result.
    pub fn run_cancellable(
        &self,
        params: &ContractParams,
        annualized: bool,
        cancel: &AtomicBool,
    ) -> Result<BacktestResult> {
        self.config.validate()?;
        let spec = params.resolve()?;
        let started_at = Utc::now();

        let dates = trade_dates(self.history, &params.ticker, &self.config)?;
        let num_trials = dates.len().checked_sub(self.config.tenor_months).ok_or(
            BacktestError::InsufficientDates {
                required: self.config.tenor_months,
                available: dates.len(),
            },
        )?;

        info!(
            "Running backtest: {} on {} ({} trials, annualized: {})",
            spec.contract_type(),
            params.ticker,
            num_trials,
            annualized
        );

        let progress = if self.config.show_progress {
            let pb = ProgressBar::new(num_trials as u64);
            if let Ok(style) = ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            {
                pb.set_style(style.progress_chars("#>-"));
            }
            Some(pb)
        } else {
            None
        };

        let run_one = |trial: usize| -> Result<TrialRecord> {
            if cancel.load(Ordering::Relaxed) {
                return Err(BacktestError::Cancelled);
            }
            let record = self.run_trial(&spec, &params.ticker, &dates, trial, annualized)?;
            if let Some(ref pb) = progress {
                pb.inc(1);
            }
            Ok(record)
        };

        let trials: Vec<TrialRecord> = if self.config.parallel {
            (0..num_trials).into_par_iter().map(run_one).collect::<Result<_>>()?
        } else {
            (0..num_trials).map(run_one).collect::<Result<_>>()?
        };

        if let Some(pb) = progress {
            pb.finish_with_message("Backtest complete");
        }

        let series = trials
            .iter()
            .map(|t| ReturnPoint {
                trial: t.trial,
                date: t.trade_date,
                value: t.return_value,
            })
            .collect();
        let failed = trials.iter().filter(|t| t.is_failed()).count();

        info!(
            "Backtest complete: {} trials, {} failed",
            trials.len(),
            failed
        );

        Ok(BacktestResult {
            run_id: generate_run_id(),
            ticker: params.ticker.clone(),
            contract_type: spec.contract_type(),
            annualized,
            series,
            trials,
            config_hash: compute_config_hash(&(&self.config, params)),
            data_checksum: self.history.checksum().map(str::to_string),
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Run a single trial. Data and configuration errors propagate; oracle
    /// and solver failures are recorded on the returned record.
    pub fn run_trial(
        &self,
        spec: &ContractSpec,
        ticker: &str,
        trade_dates: &[DateTime<Utc>],
        trial: usize,
        annualized: bool,
    ) -> Result<TrialRecord> {
        let setup = TrialSetup::prepare(self.history, spec, ticker, trade_dates, trial, &self.config)?;
        let mut record = TrialRecord {
            trial,
            trade_date: setup.trade_date,
            maturity: setup.maturity(),
            spot: setup.spot,
            return_value: None,
            cashflows: None,
            failure: None,
        };

        let priced = self.price_trial(&setup);
        let (price, cfs) = match priced {
            Ok(ok) => ok,
            Err(e) if e.category() == ErrorCategory::Oracle => {
                warn!("Trial {} ({}) pricing failed: {}", trial, setup.trade_date.date_naive(), e);
                record.failure = Some(TrialFailure::from_error(&e));
                return Ok(record);
            }
            Err(e) => return Err(e),
        };

        let outcome = compute_return(
            &cfs.amounts,
            &cfs.year_fractions,
            price,
            annualized,
            &self.config.solver,
        );
        record.cashflows = Some(CashflowDetail::from_extracted(cfs, price));

        match outcome {
            Ok(Some(value)) => {
                debug!("Trial {} ({}): return {:.6}", trial, setup.trade_date.date_naive(), value);
                record.return_value = Some(value);
            }
            Ok(None) => {
                warn!("Trial {} ({}): return did not converge", trial, setup.trade_date.date_naive());
                record.failure = Some(TrialFailure::non_convergence());
            }
            Err(e) if e.category() == ErrorCategory::Solver => {
                warn!("Trial {} ({}) return failed: {}", trial, setup.trade_date.date_naive(), e);
                record.failure = Some(TrialFailure::from_error(&e));
            }
            Err(e) => return Err(e),
        }
        Ok(record)
    }

    fn price_trial(&self, setup: &TrialSetup) -> Result<(f64, ExtractedCashflows)> {
        let dataset = setup.dataset.clone().with_cashflow_recording();
        let result = price_with_deadline(
            self.oracle,
            &setup.timetable,
            &dataset,
            self.config.oracle_deadline(),
        )?;
        let trace = result.cashflows.ok_or_else(|| {
            BacktestError::Oracle(OracleError::MalformedTrace(
                "cashflow trace requested but not returned".to_string(),
            ))
        })?;
        let cfs = cashflow::extract(setup.trade_date, &setup.timetable, &trace)?;
        Ok((result.value, cfs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::TraceEntry;
    use chrono::{Datelike, TimeZone};

    /// Two observations per month (15th and 28th), 2020-01 .. 2021-12.
    fn history() -> PriceHistory {
        let mut obs = Vec::new();
        for i in 0..24 {
            let (y, m) = (2020 + i / 12, (i % 12 + 1) as u32);
            for d in [15, 28] {
                let ts = Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap();
                obs.push((ts, 100.0 + i as f64));
            }
        }
        let mut h = PriceHistory::new();
        h.add("SPX", obs);
        h
    }

    fn config() -> BacktestConfig {
        BacktestConfig::default().with_window(
            NaiveDate::from_ymd_opt(2020, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2021, 12, 31).unwrap(),
        )
    }

    /// Pays 100 at the final event, priced at 95.
    fn zero_coupon(
        tt: &Timetable,
        _: &MarketDataset,
    ) -> std::result::Result<PricingResult, OracleError> {
        Ok(PricingResult::with_cashflows(
            95.0,
            vec![TraceEntry::new(tt.len() - 1, 100.0)],
        ))
    }

    #[test]
    fn test_trial_count() {
        let h = history();
        let driver = BacktestDriver::new(&h, &zero_coupon, config());
        let params = ContractParams::new("SPX", "Reverse Convertible");
        let result = driver.run(&params, false).unwrap();

        assert_eq!(result.len(), 24 - 12);
        assert_eq!(result.series.len(), result.trials.len());
        for (i, point) in result.series.iter().enumerate() {
            assert_eq!(point.trial, i);
            assert_eq!(result.record_for(point).unwrap().trade_date, point.date);
            assert!((point.value.unwrap() - (100.0 / 95.0 - 1.0)).abs() < 1e-12);
        }
        assert_eq!(result.contract_type, ContractType::ReverseConvertible);
        assert_eq!(result.config_hash.len(), 64);
    }

    #[test]
    fn test_result_to_json() {
        let h = history();
        let driver = BacktestDriver::new(&h, &zero_coupon, config());
        let result = driver
            .run(&ContractParams::new("SPX", "Cliquet"), false)
            .unwrap();

        let json = result.to_json().unwrap();
        let parsed: BacktestResult = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.run_id, result.run_id);
        assert_eq!(parsed.ticker, "SPX");
        assert_eq!(parsed.contract_type, ContractType::Cliquet);
        assert_eq!(parsed.len(), result.len());
        assert_eq!(parsed.config_hash, result.config_hash);
    }

    #[test]
    fn test_trial_dates_and_maturity() {
        let h = history();
        let driver = BacktestDriver::new(&h, &zero_coupon, config());
        let result = driver
            .run(&ContractParams::new("SPX", "Cliquet"), true)
            .unwrap();

        let first = result.trial(0).unwrap();
        assert_eq!(first.trade_date.day(), 28);
        assert_eq!(first.trade_date.month(), 1);
        assert_eq!(first.maturity, Utc.with_ymd_and_hms(2021, 1, 28, 0, 0, 0).unwrap());
        assert_eq!(first.spot, 100.0);
    }

    #[test]
    fn test_oracle_failure_is_isolated() {
        let h = history();
        let flaky = |tt: &Timetable, ds: &MarketDataset| -> std::result::Result<PricingResult, OracleError> {
            if ds.pricing_ts.month() == 3 && ds.pricing_ts.year() == 2020 {
                return Err(OracleError::Failed("engine crashed".to_string()));
            }
            zero_coupon(tt, ds)
        };
        let driver = BacktestDriver::new(&h, &flaky, config());
        let result = driver
            .run(&ContractParams::new("SPX", "Discount Certificate"), false)
            .unwrap();

        assert_eq!(result.len(), 12);
        assert!(result.series[2].value.is_none());
        let failure = result.trials[2].failure.as_ref().unwrap();
        assert_eq!(failure.category, ErrorCategory::Oracle);
        assert!(result.trials[2].cashflows.is_none());
        assert!(result.series[1].value.is_some());
        assert!(result.series[3].value.is_some());
        assert_eq!(result.failed_trials().count(), 1);
    }

    #[test]
    fn test_missing_trace_fails_trial() {
        let h = history();
        let no_trace = |_: &Timetable, _: &MarketDataset| -> std::result::Result<PricingResult, OracleError> {
            Ok(PricingResult::value_only(10.0))
        };
        let driver = BacktestDriver::new(&h, &no_trace, config());
        let result = driver
            .run(&ContractParams::new("SPX", "Cliquet"), false)
            .unwrap();
        assert!(result.trials.iter().all(|t| t.is_failed()));
        assert!(result.returns().is_empty());
    }

    #[test]
    fn test_zero_price_is_solver_failure() {
        let h = history();
        let free = |tt: &Timetable, _: &MarketDataset| -> std::result::Result<PricingResult, OracleError> {
            Ok(PricingResult::with_cashflows(0.0, vec![TraceEntry::new(tt.len() - 1, 1.0)]))
        };
        let driver = BacktestDriver::new(&h, &free, config());
        let result = driver
            .run(&ContractParams::new("SPX", "Cliquet"), false)
            .unwrap();

        let first = &result.trials[0];
        assert_eq!(first.failure.as_ref().unwrap().category, ErrorCategory::Solver);
        // Oracle priced the trade so its cashflows are still archived
        assert!(first.cashflows.is_some());
    }

    #[test]
    fn test_unknown_contract_type_aborts() {
        let h = history();
        let driver = BacktestDriver::new(&h, &zero_coupon, config());
        let err = driver
            .run(&ContractParams::new("SPX", "Snowball"), true)
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }

    #[test]
    fn test_cancellation_discards_run() {
        let h = history();
        let driver = BacktestDriver::new(&h, &zero_coupon, config());
        let cancel = AtomicBool::new(true);
        let err = driver
            .run_cancellable(&ContractParams::new("SPX", "Cliquet"), true, &cancel)
            .unwrap_err();
        assert!(matches!(err, BacktestError::Cancelled));
    }

    #[test]
    fn test_deadline_exceeded() {
        let h = history();
        let slow = |tt: &Timetable, ds: &MarketDataset| -> std::result::Result<PricingResult, OracleError> {
            std::thread::sleep(Duration::from_millis(5));
            zero_coupon(tt, ds)
        };
        let cfg = config().with_oracle_deadline(Duration::from_millis(1));
        let driver = BacktestDriver::new(&h, &slow, cfg);
        let result = driver
            .run(&ContractParams::new("SPX", "Cliquet"), false)
            .unwrap();
        let failure = result.trials[0].failure.as_ref().unwrap();
        assert_eq!(failure.category, ErrorCategory::Oracle);
        assert!(failure.message.contains("deadline"));
    }

    #[test]
    fn test_cashflow_view() {
        let h = history();
        let driver = BacktestDriver::new(&h, &zero_coupon, config());
        let result = driver
            .run(&ContractParams::new("SPX", "Reverse Convertible"), false)
            .unwrap();

        let view = result.cashflow_view(0).unwrap();
        assert_eq!(view.points.len(), 2);
        assert_eq!(view.points[0], (view.trade_date, -95.0));
        assert_eq!(view.points[1], (view.maturity, 100.0));
        assert!(result.cashflow_view(99).is_none());
    }

    #[test]
    fn test_insufficient_dates() {
        let h = history();
        let cfg = BacktestConfig {
            tenor_months: 30,
            ..config()
        };
        let driver = BacktestDriver::new(&h, &zero_coupon, cfg);
        let err = driver
            .run(&ContractParams::new("SPX", "Cliquet"), true)
            .unwrap_err();
        assert!(matches!(err, BacktestError::InsufficientDates { .. }));
    }

    #[test]
    fn test_config_serde_defaults() {
        let cfg: BacktestConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, BacktestConfig::default());
        assert_eq!(cfg.window_start, NaiveDate::from_ymd_opt(2020, 3, 31).unwrap());
        assert_eq!(cfg.tenor_months, 12);
        assert!(cfg.oracle_deadline().is_none());
    }
}
