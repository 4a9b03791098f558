//! Single-trial inspection: forward cashflow projection, volatility ladder
//! and a readable contract description.

use crate::contracts::{ContractParams, ContractSpec};
use crate::data::PriceHistory;
use crate::engine::{price_with_deadline, trade_dates, BacktestConfig, TrialSetup};
use crate::error::{BacktestError, OracleError, Result};
use crate::oracle::PricingOracle;
use crate::timetable::{self, TRACK_FORWARD};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Volatilities repriced by [`vol_ladder`] when none are given.
pub const DEFAULT_LADDER_VOLS: [f64; 5] = [0.02, 0.05, 0.1, 0.2, 0.3];

/// Per-path net cashflows of a contract and of a forward on its underlying
/// settling at the contract's last event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CashflowProjection {
    pub spot: f64,
    /// Undiscounted contract cashflows, one sum per path.
    pub contract: Vec<f64>,
    /// Forward leg cashflows, one per path.
    pub forward: Vec<f64>,
}

impl CashflowProjection {
    pub fn paths(&self) -> usize {
        self.contract.len()
    }

    /// `(forward, contract)` pairs, e.g. for a payoff scatter plot.
    pub fn pairs(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.forward.iter().copied().zip(self.contract.iter().copied())
    }
}

fn setup(
    history: &PriceHistory,
    params: &ContractParams,
    trial: usize,
    config: &BacktestConfig,
) -> Result<(ContractSpec, TrialSetup)> {
    let spec = params.resolve()?;
    let dates = trade_dates(history, &params.ticker, config)?;
    let setup = TrialSetup::prepare(history, &spec, &params.ticker, &dates, trial, config)?;
    Ok((spec, setup))
}

/// Simulate the contract of `trial` together with a forward leg and return
/// per-path net cashflows of both.
pub fn project_cashflows<O: PricingOracle + ?Sized>(
    history: &PriceHistory,
    oracle: &O,
    params: &ContractParams,
    trial: usize,
    vol: f64,
    config: &BacktestConfig,
) -> Result<CashflowProjection> {
    let (_, setup) = setup(history, params, trial, config)?;
    let mut timetable = setup.timetable;
    if let Some(end) = timetable.last_time() {
        timetable.extend(timetable::forward_leg(end, &params.ticker))?;
    }

    let paths = config.market.projection_paths;
    let dataset = setup.dataset.with_path_cashflows(paths).with_vol(vol);
    info!(
        "Projecting {} cashflows for trial {} over {} paths",
        params.ticker, trial, paths
    );

    let result = price_with_deadline(oracle, &timetable, &dataset, config.oracle_deadline())?;
    let path_cashflows = result.path_cashflows.ok_or_else(|| {
        BacktestError::Oracle(OracleError::MalformedTrace(
            "per-path cashflows requested but not returned".to_string(),
        ))
    })?;

    let mut contract = vec![0.0; paths];
    let mut forward = vec![0.0; paths];
    for entry in &path_cashflows {
        let event = timetable.event(entry.event_index).ok_or_else(|| {
            BacktestError::Oracle(OracleError::MalformedTrace(format!(
                "event index {} out of range",
                entry.event_index
            )))
        })?;
        if entry.amounts.len() != paths {
            return Err(OracleError::MalformedTrace(format!(
                "expected {} paths for event {}, got {}",
                paths,
                entry.event_index,
                entry.amounts.len()
            ))
            .into());
        }
        let target = if event.track == TRACK_FORWARD {
            &mut forward
        } else {
            &mut contract
        };
        for (sum, amount) in target.iter_mut().zip(&entry.amounts) {
            *sum += amount;
        }
    }

    Ok(CashflowProjection {
        spot: setup.spot,
        contract,
        forward,
    })
}

/// Reprice the contract of `trial` at each volatility in `vols`.
pub fn vol_ladder<O: PricingOracle + ?Sized>(
    history: &PriceHistory,
    oracle: &O,
    params: &ContractParams,
    trial: usize,
    vols: &[f64],
    config: &BacktestConfig,
) -> Result<Vec<(f64, f64)>> {
    let (_, setup) = setup(history, params, trial, config)?;
    vols.iter()
        .map(|&vol| {
            let dataset = setup.dataset.clone().with_vol(vol);
            let result =
                price_with_deadline(oracle, &setup.timetable, &dataset, config.oracle_deadline())?;
            debug!("vol {:.2}: price {:.4}", vol, result.value);
            Ok((vol, result.value))
        })
        .collect()
}

/// Markdown description of the contract traded at `trial`: name, definition,
/// the timetable in a code block and its named terms.
pub fn describe_contract(
    history: &PriceHistory,
    params: &ContractParams,
    trial: usize,
    config: &BacktestConfig,
) -> Result<String> {
    let (spec, setup) = setup(history, params, trial, config)?;
    let terms = setup
        .timetable
        .terms()
        .iter()
        .map(|(name, value)| format!("{} = {:.4}", name, value))
        .collect::<Vec<_>>()
        .join(", ");
    Ok(format!(
        "{}\n\n{}\n```\n{}\n```\n\nTerms: {}",
        spec.contract_type(),
        spec.definition(),
        setup.timetable.to_table(),
        terms
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::OptionDirection;
    use crate::oracle::{MarketDataset, PathCashflow, PricingResult};
    use crate::timetable::Timetable;
    use chrono::{NaiveDate, TimeZone, Utc};

    fn history() -> PriceHistory {
        let obs = (0..24)
            .map(|i| {
                let (y, m) = (2020 + i / 12, (i % 12 + 1) as u32);
                (Utc.with_ymd_and_hms(y, m, 27, 0, 0, 0).unwrap(), 50.0 + i as f64)
            })
            .collect();
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

    /// Pays `i` on every path for event `i`.
    fn per_path(
        tt: &Timetable,
        ds: &MarketDataset,
    ) -> std::result::Result<PricingResult, OracleError> {
        let path_cashflows = (0..tt.len())
            .map(|i| PathCashflow {
                event_index: i,
                amounts: vec![i as f64; ds.simulation.paths],
            })
            .collect();
        Ok(PricingResult {
            value: ds.vol.vol,
            cashflows: None,
            path_cashflows: Some(path_cashflows),
        })
    }

    #[test]
    fn test_project_cashflows() {
        let h = history();
        let params = ContractParams::new("SPX", "Vanilla Option").with_option_type(OptionDirection::Call);
        let proj = project_cashflows(&h, &per_path, &params, 0, 0.3, &config()).unwrap();

        assert_eq!(proj.paths(), 100);
        assert_eq!(proj.spot, 50.0);
        // Vanilla events 0..=2 on the contract, forward leg is event 3
        assert!(proj.contract.iter().all(|&v| v == 3.0));
        assert!(proj.forward.iter().all(|&v| v == 3.0));
        assert_eq!(proj.pairs().count(), 100);
    }

    #[test]
    fn test_project_requires_path_cashflows() {
        let h = history();
        let value_only = |_: &Timetable, _: &MarketDataset| -> std::result::Result<PricingResult, OracleError> {
            Ok(PricingResult::value_only(1.0))
        };
        let params = ContractParams::new("SPX", "Cliquet");
        let err = project_cashflows(&h, &value_only, &params, 0, 0.3, &config()).unwrap_err();
        assert!(matches!(err, BacktestError::Oracle(OracleError::MalformedTrace(_))));
    }

    #[test]
    fn test_vol_ladder() {
        let h = history();
        let params = ContractParams::new("SPX", "Reverse Convertible");
        let ladder = vol_ladder(&h, &per_path, &params, 2, &DEFAULT_LADDER_VOLS, &config()).unwrap();
        assert_eq!(ladder.len(), 5);
        for (vol, price) in ladder {
            assert_eq!(vol, price);
        }
    }

    #[test]
    fn test_describe_contract() {
        let h = history();
        let params = ContractParams::new("SPX", "Reverse Convertible");
        let text = describe_contract(&h, &params, 0, &config()).unwrap();
        assert!(text.starts_with("Reverse Convertible\n\n"));
        assert!(text.contains("**Reverse Convertible**"));
        assert!(text.contains("```"));
        assert!(text.contains("01/27/2021"));
        assert!(text.contains("INITIAL_SPOT = 50.0000"));
        assert!(text.contains("STRIKE = 40.0000"));
    }

    #[test]
    fn test_trial_out_of_range() {
        let h = history();
        let params = ContractParams::new("SPX", "Cliquet");
        let err = describe_contract(&h, &params, 20, &config()).unwrap_err();
        assert!(matches!(err, BacktestError::InsufficientDates { .. }));
    }
}
