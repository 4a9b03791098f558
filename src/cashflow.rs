//! Conversion of raw oracle cashflow traces into dated cashflow vectors.
//!
//! Year fractions use an exact 365-day year measured on millisecond
//! differences; calendar-month arithmetic is never used.

use crate::error::{BacktestError, OracleError, Result};
use crate::oracle::TraceEntry;
use crate::timetable::Timetable;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Milliseconds in a 365-day year.
pub const MILLIS_PER_YEAR: f64 = 365.0 * 24.0 * 3600.0 * 1000.0;

/// Year fraction between two instants (negative when `to` precedes `from`).
pub fn year_fraction(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / MILLIS_PER_YEAR
}

/// Net cashflows per settlement date, aligned by position and ascending by
/// timestamp.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedCashflows {
    pub year_fractions: Vec<f64>,
    pub amounts: Vec<f64>,
    pub timestamps: Vec<DateTime<Utc>>,
}

impl ExtractedCashflows {
    pub fn len(&self) -> usize {
        self.amounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.amounts.is_empty()
    }

    /// Undiscounted sum of all cashflows.
    pub fn total(&self) -> f64 {
        self.amounts.iter().sum()
    }

    /// Timestamps as Unix milliseconds.
    pub fn timestamps_ms(&self) -> Vec<i64> {
        self.timestamps.iter().map(|t| t.timestamp_millis()).collect()
    }
}

/// Group a cashflow trace by the settlement time of the event each entry
/// refers to, summing entries that share a timestamp.
///
/// Monte Carlo traces may report several entries per logical settlement date
/// (one per event, or one per path batch); the output has exactly one net
/// amount per distinct timestamp.
pub fn extract(
    pricing_ts: DateTime<Utc>,
    timetable: &Timetable,
    trace: &[TraceEntry],
) -> Result<ExtractedCashflows> {
    let mut net: BTreeMap<DateTime<Utc>, f64> = BTreeMap::new();

    for entry in trace {
        let event = timetable.event(entry.event_index).ok_or_else(|| {
            BacktestError::Oracle(OracleError::MalformedTrace(format!(
                "event index {} out of range for timetable of {} events",
                entry.event_index,
                timetable.len()
            )))
        })?;
        if !entry.amount.is_finite() {
            return Err(BacktestError::Oracle(OracleError::MalformedTrace(format!(
                "non-finite amount for event index {}",
                entry.event_index
            ))));
        }
        *net.entry(event.time).or_insert(0.0) += entry.amount;
    }

    let mut out = ExtractedCashflows {
        year_fractions: Vec::with_capacity(net.len()),
        amounts: Vec::with_capacity(net.len()),
        timestamps: Vec::with_capacity(net.len()),
    };
    for (ts, amount) in net {
        out.year_fractions.push(year_fraction(pricing_ts, ts));
        out.amounts.push(amount);
        out.timestamps.push(ts);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timetable::{Event, TRACK_CALL, TRACK_CONTRACT};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 3, 31, 0, 0, 0).unwrap()
    }

    fn sample_timetable() -> Timetable {
        Timetable::new(vec![
            Event::condition(t0() + Duration::days(91), 100.0, "SPX", TRACK_CALL),
            Event::add(t0() + Duration::days(91), 104.0, "USD", TRACK_CALL),
            Event::add(t0() + Duration::days(365), 100.0, "USD", TRACK_CONTRACT),
            Event::add(t0() + Duration::days(365), 5.0, "USD", TRACK_CONTRACT),
        ])
        .unwrap()
    }

    #[test]
    fn test_year_fraction_exact_365() {
        assert!((year_fraction(t0(), t0() + Duration::days(365)) - 1.0).abs() < 1e-12);
        assert!((year_fraction(t0(), t0() + Duration::days(73)) - 0.2).abs() < 1e-12);
        assert!(year_fraction(t0() + Duration::days(1), t0()) < 0.0);
    }

    #[test]
    fn test_extract_nets_same_timestamp() {
        let trace = vec![
            TraceEntry::new(2, 40.0),
            TraceEntry::new(1, 20.8),
            TraceEntry::new(3, 1.0),
            TraceEntry::new(2, 10.0),
        ];
        let cfs = extract(t0(), &sample_timetable(), &trace).unwrap();

        assert_eq!(cfs.len(), 2);
        assert_eq!(cfs.amounts, vec![20.8, 51.0]);
        assert_eq!(cfs.timestamps[0], t0() + Duration::days(91));
        assert!((cfs.year_fractions[1] - 1.0).abs() < 1e-12);
        assert!((cfs.total() - 71.8).abs() < 1e-12);
    }

    #[test]
    fn test_extract_empty_trace() {
        let cfs = extract(t0(), &sample_timetable(), &[]).unwrap();
        assert!(cfs.is_empty());
        assert_eq!(cfs.total(), 0.0);
    }

    #[test]
    fn test_extract_rejects_unknown_event() {
        let err = extract(t0(), &sample_timetable(), &[TraceEntry::new(9, 1.0)]).unwrap_err();
        assert!(matches!(
            err,
            BacktestError::Oracle(OracleError::MalformedTrace(_))
        ));
    }

    #[test]
    fn test_timestamps_ms() {
        let cfs = extract(t0(), &sample_timetable(), &[TraceEntry::new(2, 1.0)]).unwrap();
        assert_eq!(
            cfs.timestamps_ms(),
            vec![(t0() + Duration::days(365)).timestamp_millis()]
        );
    }
}
