//! Error types for the backtest engine.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the backtest engine.
#[derive(Error, Debug)]
pub enum BacktestError {
    #[error("No price for '{asset}' on or before {at}")]
    NoData { asset: String, at: DateTime<Utc> },

    #[error("No trading date for '{asset}' on or before month-end {month_end}")]
    NoValidDate { asset: String, month_end: NaiveDate },

    #[error("Unknown asset: {0}")]
    UnknownAsset(String),

    #[error("Data error: {0}")]
    DataError(String),

    #[error("Not enough trade dates: need index {required}, have {available}")]
    InsufficientDates { required: usize, available: usize },

    #[error("Unknown contract type: {0}")]
    UnknownContractType(String),

    #[error("Missing parameter '{parameter}' for {contract}")]
    MissingParameter {
        contract: &'static str,
        parameter: &'static str,
    },

    #[error("Event at {event} precedes last event at {last}")]
    OrderingViolation {
        event: DateTime<Utc>,
        last: DateTime<Utc>,
    },

    #[error("Division by zero: trade price is zero")]
    DivisionByZero,

    #[error("Pricing oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Backtest cancelled")]
    Cancelled,

    #[error("CSV parsing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Date parsing error: {0}")]
    DateParseError(#[from] chrono::ParseError),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),
}

/// Failures reported by a pricing oracle.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OracleError {
    #[error("pricing failed: {0}")]
    Failed(String),

    #[error("pricing took {elapsed:?}, deadline was {deadline:?}")]
    Timeout { elapsed: Duration, deadline: Duration },

    #[error("malformed cashflow trace: {0}")]
    MalformedTrace(String),
}

/// Coarse error taxonomy used to tell callers what aborted a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// Missing or malformed historical data.
    Data,
    /// Unknown contract type or unusable parameters.
    Configuration,
    /// The pricing oracle failed or returned an unusable response.
    Oracle,
    /// The return solver could not produce a value.
    Solver,
    /// The run was cancelled by the caller.
    Cancelled,
    /// File system or serialization failure.
    Io,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Data => write!(f, "data"),
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Oracle => write!(f, "oracle"),
            ErrorCategory::Solver => write!(f, "solver"),
            ErrorCategory::Cancelled => write!(f, "cancelled"),
            ErrorCategory::Io => write!(f, "io"),
        }
    }
}

impl BacktestError {
    /// The taxonomy bucket this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            BacktestError::NoData { .. }
            | BacktestError::NoValidDate { .. }
            | BacktestError::UnknownAsset(_)
            | BacktestError::DataError(_)
            | BacktestError::InsufficientDates { .. }
            | BacktestError::CsvError(_)
            | BacktestError::DateParseError(_) => ErrorCategory::Data,
            BacktestError::UnknownContractType(_)
            | BacktestError::MissingParameter { .. }
            | BacktestError::OrderingViolation { .. }
            | BacktestError::ConfigError(_)
            | BacktestError::InvalidInput(_)
            | BacktestError::TomlError(_) => ErrorCategory::Configuration,
            BacktestError::Oracle(_) => ErrorCategory::Oracle,
            BacktestError::DivisionByZero => ErrorCategory::Solver,
            BacktestError::Cancelled => ErrorCategory::Cancelled,
            BacktestError::IoError(_) | BacktestError::JsonError(_) => ErrorCategory::Io,
        }
    }
}

/// Result type alias for backtest operations.
pub type Result<T> = std::result::Result<T, BacktestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        let err = BacktestError::UnknownContractType("Swap".to_string());
        assert_eq!(err.category(), ErrorCategory::Configuration);

        let err = BacktestError::NoValidDate {
            asset: "SPX".to_string(),
            month_end: NaiveDate::from_ymd_opt(2020, 1, 31).unwrap(),
        };
        assert_eq!(err.category(), ErrorCategory::Data);

        let err: BacktestError = OracleError::Failed("engine down".to_string()).into();
        assert_eq!(err.category(), ErrorCategory::Oracle);
        assert_eq!(BacktestError::DivisionByZero.category(), ErrorCategory::Solver);
    }

    #[test]
    fn test_error_messages() {
        let err = BacktestError::MissingParameter {
            contract: "Vanilla Option",
            parameter: "option_type",
        };
        assert_eq!(
            err.to_string(),
            "Missing parameter 'option_type' for Vanilla Option"
        );
        assert_eq!(ErrorCategory::Oracle.to_string(), "oracle");
    }
}
