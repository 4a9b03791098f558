//! Historical price data: loading and date-indexed lookup.
//!
//! A [`PriceHistory`] holds one sorted series per asset. Lookups use "last
//! value on or before" semantics and run in `O(log n)` via binary search, since
//! a backtest queries the history once or more per trial.

use crate::error::{BacktestError, Result};
use crate::metadata::compute_hash;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use csv::ReaderBuilder;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// CSV loading options for wide price files (a date column followed by one
/// column per asset).
#[derive(Debug, Clone)]
pub struct PriceCsvConfig {
    /// Date format string for parsing (e.g., "%Y-%m-%d").
    pub date_format: Option<String>,
    /// CSV delimiter character.
    pub delimiter: u8,
    /// Skip unparseable cells instead of failing.
    pub skip_invalid: bool,
}

impl Default for PriceCsvConfig {
    fn default() -> Self {
        Self {
            date_format: None,
            delimiter: b',',
            skip_invalid: true,
        }
    }
}

/// Midnight UTC of a calendar date.
pub fn day_start(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

/// Parse a date string with multiple format attempts.
fn parse_datetime(s: &str, format: Option<&str>) -> Result<DateTime<Utc>> {
    if let Some(fmt) = format {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(Utc.from_utc_datetime(&dt));
        }
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Ok(day_start(d));
        }
    }

    let datetime_formats = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%dT%H:%M:%SZ",
        "%Y-%m-%dT%H:%M:%S%.fZ",
    ];
    for fmt in &datetime_formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(Utc.from_utc_datetime(&dt));
        }
    }

    let date_formats = ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d-%b-%Y"];
    for fmt in &date_formats {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Ok(day_start(d));
        }
    }

    Err(BacktestError::DataError(format!(
        "Could not parse date: '{}'",
        s
    )))
}

/// First day of `(year, month)` and first day of the following month.
fn month_bounds(year: i32, month: u32) -> Option<(NaiveDate, NaiveDate)> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    Some((first, next))
}

/// Sorted observations for a single asset.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssetSeries {
    timestamps: Vec<DateTime<Utc>>,
    values: Vec<f64>,
}

impl AssetSeries {
    /// Build a series from unordered observations. Duplicate timestamps keep
    /// the last value supplied.
    pub fn new(mut observations: Vec<(DateTime<Utc>, f64)>) -> Self {
        observations.sort_by_key(|(t, _)| *t);

        let mut timestamps: Vec<DateTime<Utc>> = Vec::with_capacity(observations.len());
        let mut values: Vec<f64> = Vec::with_capacity(observations.len());
        for (t, v) in observations {
            if timestamps.last() == Some(&t) {
                if let Some(last) = values.last_mut() {
                    *last = v;
                }
            } else {
                timestamps.push(t);
                values.push(v);
            }
        }

        Self { timestamps, values }
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Observed trading timestamps, ascending.
    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Index of the latest observation at or before `at`.
    pub fn index_on_or_before(&self, at: DateTime<Utc>) -> Option<usize> {
        self.timestamps.partition_point(|t| *t <= at).checked_sub(1)
    }

    /// Latest observation at or before `at`.
    pub fn observation_on_or_before(&self, at: DateTime<Utc>) -> Option<(DateTime<Utc>, f64)> {
        self.index_on_or_before(at)
            .map(|i| (self.timestamps[i], self.values[i]))
    }

    /// Observations with `start <= t <= end`.
    pub fn range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<(DateTime<Utc>, f64)> {
        let lo = self.timestamps.partition_point(|t| *t < start);
        let hi = self.timestamps.partition_point(|t| *t <= end);
        if lo >= hi {
            return Vec::new();
        }
        self.timestamps[lo..hi]
            .iter()
            .copied()
            .zip(self.values[lo..hi].iter().copied())
            .collect()
    }

    /// First and last observed timestamps.
    pub fn date_range(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        Some((*self.timestamps.first()?, *self.timestamps.last()?))
    }
}

/// Read-only store of historical spot prices, keyed by asset identifier.
///
/// Safe to share across threads during a backtest; nothing mutates it after
/// loading.
#[derive(Debug, Clone, Default)]
pub struct PriceHistory {
    series: HashMap<String, AssetSeries>,
    checksum: Option<String>,
}

impl PriceHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) the series for an asset.
    pub fn add(&mut self, asset: impl Into<String>, observations: Vec<(DateTime<Utc>, f64)>) {
        let asset = asset.into();
        let series = AssetSeries::new(observations);
        if let Some((first, last)) = series.date_range() {
            debug!(
                "Added {} observations for {} ({} to {})",
                series.len(),
                asset,
                first.date_naive(),
                last.date_naive()
            );
        }
        self.series.insert(asset, series);
    }

    /// Load a wide CSV file: the first column holds dates, every other column
    /// is an asset. Blank cells are skipped for that asset only.
    pub fn from_csv(path: impl AsRef<Path>, config: &PriceCsvConfig) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading price history from: {}", path.display());

        let bytes = std::fs::read(path)?;
        let mut history = Self::from_reader(bytes.as_slice(), config)?;
        history.checksum = Some(compute_hash(&bytes));
        Ok(history)
    }

    /// Load wide CSV content from any reader.
    pub fn from_reader<R: std::io::Read>(reader: R, config: &PriceCsvConfig) -> Result<Self> {
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .delimiter(config.delimiter)
            .flexible(true)
            .from_reader(reader);

        let headers = reader.headers()?.clone();
        if headers.len() < 2 {
            return Err(BacktestError::DataError(
                "Price file needs a date column and at least one asset column".to_string(),
            ));
        }
        let assets: Vec<String> = headers.iter().skip(1).map(|h| h.trim().to_string()).collect();
        let mut columns: Vec<Vec<(DateTime<Utc>, f64)>> = vec![Vec::new(); assets.len()];

        let mut skipped = 0usize;
        for (row_num, record) in reader.records().enumerate() {
            let record = match record {
                Ok(r) => r,
                Err(e) if config.skip_invalid => {
                    debug!("Skipping row {}: {}", row_num + 1, e);
                    skipped += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let raw_date = record.get(0).unwrap_or_default().trim();
            let timestamp = match parse_datetime(raw_date, config.date_format.as_deref()) {
                Ok(ts) => ts,
                Err(e) if config.skip_invalid => {
                    debug!("Skipping row {} due to date parse error: {}", row_num + 1, e);
                    skipped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            for (col, column) in columns.iter_mut().enumerate() {
                let cell = record.get(col + 1).unwrap_or_default().trim();
                if cell.is_empty() {
                    continue;
                }
                match cell.parse::<f64>() {
                    Ok(v) if v.is_finite() => column.push((timestamp, v)),
                    _ if config.skip_invalid => skipped += 1,
                    _ => {
                        return Err(BacktestError::DataError(format!(
                            "Invalid price '{}' for {} at row {}",
                            cell,
                            assets[col],
                            row_num + 1
                        )))
                    }
                }
            }
        }

        if skipped > 0 {
            warn!("Skipped {} invalid rows or cells", skipped);
        }

        let mut history = Self::new();
        for (asset, column) in assets.into_iter().zip(columns) {
            if column.is_empty() {
                warn!("No observations for {}, column ignored", asset);
                continue;
            }
            history.add(asset, column);
        }

        if history.series.is_empty() {
            return Err(BacktestError::DataError(
                "Price file contains no observations".to_string(),
            ));
        }

        info!("Loaded price history for {} assets", history.series.len());
        Ok(history)
    }

    /// Series for an asset.
    pub fn get(&self, asset: &str) -> Result<&AssetSeries> {
        self.series
            .get(asset)
            .ok_or_else(|| BacktestError::UnknownAsset(asset.to_string()))
    }

    /// Asset identifiers, sorted.
    pub fn assets(&self) -> Vec<&str> {
        let mut assets: Vec<&str> = self.series.keys().map(String::as_str).collect();
        assets.sort_unstable();
        assets
    }

    /// SHA-256 of the source file, when loaded from disk.
    pub fn checksum(&self) -> Option<&str> {
        self.checksum.as_deref()
    }

    /// Latest observation (timestamp, price) at or before `at`.
    pub fn observation_on_or_before(
        &self,
        asset: &str,
        at: DateTime<Utc>,
    ) -> Result<(DateTime<Utc>, f64)> {
        self.get(asset)?
            .observation_on_or_before(at)
            .ok_or_else(|| BacktestError::NoData {
                asset: asset.to_string(),
                at,
            })
    }

    /// Latest price at or before `at`.
    pub fn value_on_or_before(&self, asset: &str, at: DateTime<Utc>) -> Result<f64> {
        self.observation_on_or_before(asset, at).map(|(_, v)| v)
    }

    /// Observations of `asset` inside `[start, end]`.
    pub fn range(
        &self,
        asset: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, f64)>> {
        Ok(self.get(asset)?.range(start, end))
    }

    /// Trading-adjusted month-end dates for every calendar month whose last
    /// day falls inside `[start, end]`.
    ///
    /// Each month resolves to the latest observed trading date on or before
    /// its last calendar day. A month without any observation inside it fails
    /// the whole call with [`BacktestError::NoValidDate`]; the series is never
    /// silently shortened.
    pub fn month_end_trade_dates(
        &self,
        asset: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DateTime<Utc>>> {
        if end < start {
            return Err(BacktestError::InvalidInput(format!(
                "Window end {} is before start {}",
                end, start
            )));
        }
        let series = self.get(asset)?;

        let mut dates = Vec::new();
        let (mut year, mut month) = (start.year(), start.month());
        loop {
            let (first, next) = month_bounds(year, month).ok_or_else(|| {
                BacktestError::InvalidInput(format!("Invalid month {}-{}", year, month))
            })?;
            let month_end = next.pred_opt().unwrap_or(first);
            if month_end > end {
                break;
            }

            let cutoff = series.timestamps.partition_point(|t| *t < day_start(next));
            let resolved = cutoff
                .checked_sub(1)
                .map(|i| series.timestamps[i])
                .filter(|t| *t >= day_start(first))
                .ok_or_else(|| BacktestError::NoValidDate {
                    asset: asset.to_string(),
                    month_end,
                })?;
            dates.push(resolved);

            (year, month) = (next.year(), next.month());
        }

        debug!(
            "Resolved {} month-end trade dates for {} between {} and {}",
            dates.len(),
            asset,
            start,
            end
        );
        Ok(dates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    /// Weekday-only daily series starting 2020-01-01.
    fn business_days(days: i64) -> Vec<(DateTime<Utc>, f64)> {
        (0..days)
            .map(|i| day_start(date(2020, 1, 1)) + Duration::days(i))
            .filter(|t| t.weekday().number_from_monday() <= 5)
            .enumerate()
            .map(|(i, t)| (t, 100.0 + i as f64))
            .collect()
    }

    #[test]
    fn test_value_on_or_before() {
        let mut history = PriceHistory::new();
        history.add(
            "SPX",
            vec![
                (day_start(date(2020, 1, 2)), 10.0),
                (day_start(date(2020, 1, 6)), 11.0),
                (day_start(date(2020, 1, 7)), 12.0),
            ],
        );

        // Exact hit
        assert_eq!(history.value_on_or_before("SPX", day_start(date(2020, 1, 6))).unwrap(), 11.0);
        // Weekend falls back to Thursday
        assert_eq!(history.value_on_or_before("SPX", day_start(date(2020, 1, 5))).unwrap(), 10.0);
        // After the last observation
        assert_eq!(history.value_on_or_before("SPX", day_start(date(2021, 1, 1))).unwrap(), 12.0);
    }

    #[test]
    fn test_no_data_before_first_observation() {
        let mut history = PriceHistory::new();
        history.add("SPX", vec![(day_start(date(2020, 1, 2)), 10.0)]);

        let err = history
            .value_on_or_before("SPX", day_start(date(2020, 1, 1)))
            .unwrap_err();
        assert!(matches!(err, BacktestError::NoData { .. }));

        let err = history
            .value_on_or_before("NDX", day_start(date(2020, 1, 2)))
            .unwrap_err();
        assert!(matches!(err, BacktestError::UnknownAsset(_)));
    }

    #[test]
    fn test_duplicate_timestamps_keep_last() {
        let t = day_start(date(2020, 1, 2));
        let series = AssetSeries::new(vec![(t, 1.0), (t, 2.0)]);
        assert_eq!(series.len(), 1);
        assert_eq!(series.values(), &[2.0]);
    }

    #[test]
    fn test_month_end_trade_dates() {
        let mut history = PriceHistory::new();
        history.add("SPX", business_days(400));

        let dates = history
            .month_end_trade_dates("SPX", date(2020, 1, 1), date(2020, 12, 31))
            .unwrap();
        assert_eq!(dates.len(), 12);

        // 2020-02-29 is a Saturday, so February resolves to Friday the 28th
        assert_eq!(dates[1], day_start(date(2020, 2, 28)));
        // 2020-05-31 is a Sunday
        assert_eq!(dates[4], day_start(date(2020, 5, 29)));
        assert!(dates.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_month_end_partial_last_month_excluded() {
        let mut history = PriceHistory::new();
        history.add("SPX", business_days(400));

        let dates = history
            .month_end_trade_dates("SPX", date(2020, 3, 31), date(2020, 6, 15))
            .unwrap();
        // March, April, May; June's month-end is after the window
        assert_eq!(dates.len(), 3);
    }

    #[test]
    fn test_month_end_fails_on_missing_month() {
        let mut obs = business_days(200);
        // Drop every observation in March 2020
        obs.retain(|(t, _)| t.month() != 3);
        let mut history = PriceHistory::new();
        history.add("SPX", obs);

        let err = history
            .month_end_trade_dates("SPX", date(2020, 1, 1), date(2020, 5, 31))
            .unwrap_err();
        match err {
            BacktestError::NoValidDate { month_end, .. } => {
                assert_eq!(month_end, date(2020, 3, 31))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_month_end_fails_before_history() {
        let mut history = PriceHistory::new();
        history.add("SPX", business_days(100));

        let result = history.month_end_trade_dates("SPX", date(2019, 11, 1), date(2020, 2, 29));
        assert!(matches!(result, Err(BacktestError::NoValidDate { .. })));
    }

    #[test]
    fn test_range() {
        let mut history = PriceHistory::new();
        history.add("SPX", business_days(30));

        let window = history
            .range("SPX", day_start(date(2020, 1, 6)), day_start(date(2020, 1, 10)))
            .unwrap();
        assert_eq!(window.len(), 5);
        assert_eq!(window[0].0, day_start(date(2020, 1, 6)));

        let empty = history
            .range("SPX", day_start(date(2020, 1, 11)), day_start(date(2020, 1, 12)))
            .unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_load_wide_csv_with_blanks() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "date,SPX,EUR").unwrap();
        writeln!(file, "2020-01-02,3257.85,").unwrap();
        writeln!(file, "2020-01-03,3234.85,1.1160").unwrap();
        writeln!(file, "2020-01-06,3246.28,1.1194").unwrap();
        file.flush().unwrap();

        let history = PriceHistory::from_csv(file.path(), &PriceCsvConfig::default()).unwrap();
        assert_eq!(history.assets(), vec!["EUR", "SPX"]);
        assert_eq!(history.get("SPX").unwrap().len(), 3);
        assert_eq!(history.get("EUR").unwrap().len(), 2);
        assert_eq!(
            history.get("EUR").unwrap().date_range(),
            Some((day_start(date(2020, 1, 3)), day_start(date(2020, 1, 6))))
        );
        assert_eq!(AssetSeries::default().date_range(), None);
        assert_eq!(history.checksum().map(str::len), Some(64));

        // EUR has no value on the 2nd
        assert!(history
            .value_on_or_before("EUR", day_start(date(2020, 1, 2)))
            .is_err());
    }

    #[test]
    fn test_load_csv_strict_rejects_bad_cell() {
        let data = "date,SPX\n2020-01-02,abc\n";
        let config = PriceCsvConfig {
            skip_invalid: false,
            ..Default::default()
        };
        assert!(PriceHistory::from_reader(data.as_bytes(), &config).is_err());
    }
}
