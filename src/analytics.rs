//! Summary statistics and reports over a backtest's return series.

use crate::contracts::ContractType;
use crate::engine::BacktestResult;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::io::Write;
use tabled::{builder::Builder, settings::Style};

/// Descriptive statistics of the successful trial returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnSummary {
    pub ticker: String,
    pub contract_type: ContractType,
    pub annualized: bool,
    /// Total number of trials, failed ones included.
    pub trials: usize,
    pub failures: usize,
    pub mean: f64,
    pub median: f64,
    /// Sample standard deviation.
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    /// Fraction of successful trials with a positive return.
    pub positive_share: f64,
}

impl ReturnSummary {
    pub fn from_result(result: &BacktestResult) -> Self {
        let mut values = result.returns();
        let n = values.len();

        let (mean, median, std_dev, min, max, positive_share) = if n == 0 {
            (0.0, 0.0, 0.0, 0.0, 0.0, 0.0)
        } else {
            values.sort_by(|a, b| a.total_cmp(b));
            let mean = values.iter().sum::<f64>() / n as f64;
            let median = if n % 2 == 0 {
                (values[n / 2 - 1] + values[n / 2]) / 2.0
            } else {
                values[n / 2]
            };
            let std_dev = if n > 1 {
                let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
                var.sqrt()
            } else {
                0.0
            };
            let positive = values.iter().filter(|&&v| v > 0.0).count();
            (mean, median, std_dev, values[0], values[n - 1], positive as f64 / n as f64)
        };

        Self {
            ticker: result.ticker.clone(),
            contract_type: result.contract_type,
            annualized: result.annualized,
            trials: result.len(),
            failures: result.len() - n,
            mean,
            median,
            std_dev,
            min,
            max,
            positive_share,
        }
    }

    pub fn to_table(&self) -> String {
        let label = if self.annualized { "annualized" } else { "holding" };
        let mut builder = Builder::new();
        builder.push_record(["Metric", "Value"]);
        builder.push_record(["Contract".to_string(), format!("{} on {}", self.contract_type, self.ticker)]);
        builder.push_record(["Return".to_string(), label.to_string()]);
        builder.push_record(["Trials".to_string(), self.trials.to_string()]);
        builder.push_record(["Failed".to_string(), self.failures.to_string()]);
        builder.push_record(["Mean %".to_string(), format!("{:.2}", self.mean * 100.0)]);
        builder.push_record(["Median %".to_string(), format!("{:.2}", self.median * 100.0)]);
        builder.push_record(["Std dev %".to_string(), format!("{:.2}", self.std_dev * 100.0)]);
        builder.push_record(["Min %".to_string(), format!("{:.2}", self.min * 100.0)]);
        builder.push_record(["Max %".to_string(), format!("{:.2}", self.max * 100.0)]);
        builder.push_record(["Positive".to_string(), format!("{:.1}%", self.positive_share * 100.0)]);
        builder.build().with(Style::rounded()).to_string()
    }
}

/// One histogram bucket, `[lower, upper)` except the last which is closed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistogramBin {
    pub lower: f64,
    pub upper: f64,
    pub count: usize,
}

/// Equal-width histogram of `values` over their observed range. Non-finite
/// values are ignored.
pub fn return_histogram(values: &[f64], bins: usize) -> Vec<HistogramBin> {
    let finite: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if bins == 0 || finite.is_empty() {
        return Vec::new();
    }
    let min = finite.iter().copied().fold(f64::INFINITY, f64::min);
    let max = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    if max == min {
        return vec![HistogramBin {
            lower: min,
            upper: max,
            count: finite.len(),
        }];
    }

    let width = (max - min) / bins as f64;
    let mut out: Vec<HistogramBin> = (0..bins)
        .map(|i| HistogramBin {
            lower: min + width * i as f64,
            upper: if i + 1 == bins { max } else { min + width * (i + 1) as f64 },
            count: 0,
        })
        .collect();
    for v in finite {
        let idx = (((v - min) / width) as usize).min(bins - 1);
        out[idx].count += 1;
    }
    out
}

/// Per-trial table: trade date, spot, trade price, return.
pub fn trial_table(result: &BacktestResult, limit: usize) -> String {
    let mut builder = Builder::new();
    builder.push_record(["#", "Trade date", "Maturity", "Spot", "Price", "Return %"]);

    let shown = if limit > 0 { limit } else { result.len() };
    for record in result.trials.iter().take(shown) {
        builder.push_record([
            record.trial.to_string(),
            record.trade_date.format("%Y-%m-%d").to_string(),
            record.maturity.format("%Y-%m-%d").to_string(),
            format!("{:.2}", record.spot),
            record
                .cashflows
                .as_ref()
                .map(|c| format!("{:.4}", c.trade_price))
                .unwrap_or_else(|| "-".to_string()),
            record
                .return_value
                .map(|r| format!("{:.2}", r * 100.0))
                .unwrap_or_else(|| "failed".to_string()),
        ]);
    }
    builder.build().with(Style::rounded()).to_string()
}

/// Write the return series as CSV (`trial,date,return`); failed trials have
/// an empty return cell.
pub fn write_series_csv<W: Write>(result: &BacktestResult, writer: W) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record(["trial", "date", "return"])?;
    for point in &result.series {
        wtr.write_record([
            point.trial.to_string(),
            point.date.format("%Y-%m-%d").to_string(),
            point.value.map(|v| v.to_string()).unwrap_or_default(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}
