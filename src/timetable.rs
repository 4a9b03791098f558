//! Cashflow event schedules ("timetables").
//!
//! A [`Timetable`] is an ordered list of [`Event`]s plus a small set of named
//! numeric terms (strike, barrier, caps) that a pricing oracle needs to
//! interpret conditional blocks. Events are chronologically non-decreasing;
//! the constructor and [`Timetable::extend`] enforce this.
//!
//! # Settlement
//!
//! A pricing oracle walks the events in order along each simulated path:
//!
//! - A `+` outside any block settles unconditionally. Asset units are worth
//!   the asset's spot at the event time.
//! - A `>` opens a block made of the `+` events directly following it on the
//!   same track and timestamp. Its `quantity` is a level whose meaning depends
//!   on the track:
//!   - [`TRACK_CALL`], [`TRACK_KNOCK_OUT`]: the block settles when the
//!     underlying closes at or above the level.
//!   - [`TRACK_KNOCK_IN`]: the block settles when the underlying closes below
//!     the level.
//!   - [`TRACK_CONTRACT`]: holder's exercise; the block settles when its net
//!     value exceeds the level.
//!   - [`TRACK_ACCUMULATOR`]: the block always settles, each `+` paying
//!     `quantity * max(A, level)`. `A` is the sum of the underlying's returns
//!     between consecutive [`TRACK_FIXING`] events (the first one measured
//!     from the `INITIAL_SPOT` term), each clipped to
//!     `[LOCAL_FLOOR, LOCAL_CAP]`; the level is the `GLOBAL_FLOOR` term.
//! - Once a block on a terminating track ([`TERMINATING_TRACKS`]) settles,
//!   every later event of the timetable is cancelled.

use crate::error::{BacktestError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tabled::{builder::Builder, settings::Style};

/// Main contract track.
pub const TRACK_CONTRACT: &str = "";
/// Forward purchase of the underlying, appended for relative-value analysis.
pub const TRACK_FORWARD: &str = "F";
/// Autocall (early redemption) blocks, triggered at or above the barrier.
pub const TRACK_CALL: &str = "CALL";
/// Knock-in blocks, triggered below the strike.
pub const TRACK_KNOCK_IN: &str = "KI";
/// Knock-out blocks, triggered at or above the barrier.
pub const TRACK_KNOCK_OUT: &str = "KO";
/// Periodic coupon payments.
pub const TRACK_COUPON: &str = "CPN";
/// Cliquet fixing observations.
pub const TRACK_FIXING: &str = "FIX";
/// Cliquet accumulated payoff.
pub const TRACK_ACCUMULATOR: &str = "ACC";

/// Tracks whose settled blocks end the contract.
pub const TERMINATING_TRACKS: [&str; 2] = [TRACK_CALL, TRACK_KNOCK_OUT];

/// Whether a settled block on `track` cancels all later events.
pub fn is_terminating(track: &str) -> bool {
    TERMINATING_TRACKS.contains(&track)
}

/// Event operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventOp {
    /// Opens a conditional block: the `+` events that follow on the same
    /// track and timestamp settle only when the block's condition holds.
    /// `quantity` is the trigger level, expressed in `unit`. See the module
    /// docs for the condition of each track.
    #[serde(rename = ">")]
    ConditionalStart,
    /// Adds `quantity` of `unit` to the holder.
    #[serde(rename = "+")]
    Add,
}

impl EventOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            EventOp::ConditionalStart => ">",
            EventOp::Add => "+",
        }
    }
}

impl fmt::Display for EventOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// A single dated entry in a timetable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub time: DateTime<Utc>,
    pub op: EventOp,
    pub quantity: f64,
    /// Currency code or asset identifier.
    pub unit: String,
    /// Stream tag separating overlapping cashflow streams.
    pub track: String,
}

impl Event {
    /// A cashflow of `quantity` units.
    pub fn add(
        time: DateTime<Utc>,
        quantity: f64,
        unit: impl Into<String>,
        track: impl Into<String>,
    ) -> Self {
        Self {
            time,
            op: EventOp::Add,
            quantity,
            unit: unit.into(),
            track: track.into(),
        }
    }

    /// Start of a conditional block with the given trigger level.
    pub fn condition(
        time: DateTime<Utc>,
        trigger: f64,
        unit: impl Into<String>,
        track: impl Into<String>,
    ) -> Self {
        Self {
            time,
            op: EventOp::ConditionalStart,
            quantity: trigger,
            unit: unit.into(),
            track: track.into(),
        }
    }
}

/// Ordered event schedule for one contract and trade date.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timetable {
    events: Vec<Event>,
    #[serde(default)]
    terms: BTreeMap<String, f64>,
}

impl Timetable {
    /// Create a timetable, checking that events are chronologically
    /// non-decreasing.
    pub fn new(events: Vec<Event>) -> Result<Self> {
        if let Some(pair) = events.windows(2).find(|w| w[1].time < w[0].time) {
            return Err(BacktestError::OrderingViolation {
                event: pair[1].time,
                last: pair[0].time,
            });
        }
        Ok(Self {
            events,
            terms: BTreeMap::new(),
        })
    }

    /// Attach a named numeric term.
    pub fn with_term(mut self, name: impl Into<String>, value: f64) -> Self {
        self.terms.insert(name.into(), value);
        self
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn event(&self, index: usize) -> Option<&Event> {
        self.events.get(index)
    }

    /// Named numeric terms (strike, barrier, ...).
    pub fn terms(&self) -> &BTreeMap<String, f64> {
        &self.terms
    }

    pub fn term(&self, name: &str) -> Option<f64> {
        self.terms.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn first_time(&self) -> Option<DateTime<Utc>> {
        self.events.first().map(|e| e.time)
    }

    /// Time of the final event (the contract's last settlement).
    pub fn last_time(&self) -> Option<DateTime<Utc>> {
        self.events.last().map(|e| e.time)
    }

    /// Append `addition` in place. Fails without modifying `self` if any of
    /// its events precedes the last event already present.
    pub fn extend(&mut self, addition: Timetable) -> Result<()> {
        if let (Some(last), Some(first)) = (self.last_time(), addition.first_time()) {
            if first < last {
                return Err(BacktestError::OrderingViolation { event: first, last });
            }
        }
        self.events.extend(addition.events);
        for (name, value) in addition.terms {
            self.terms.entry(name).or_insert(value);
        }
        Ok(())
    }

    /// Render as a plain text table (time, op, quantity, unit, track).
    pub fn to_table(&self) -> String {
        let mut builder = Builder::new();
        builder.push_record(["", "time", "op", "quantity", "unit", "track"]);
        for (i, event) in self.events.iter().enumerate() {
            builder.push_record([
                i.to_string(),
                event.time.format("%m/%d/%Y").to_string(),
                event.op.to_string(),
                format!("{:.2}", event.quantity),
                event.unit.clone(),
                event.track.clone(),
            ]);
        }
        builder.build().with(Style::blank()).to_string()
    }
}

/// Concatenate two timetables; see [`Timetable::extend`].
pub fn extend(base: &Timetable, addition: &Timetable) -> Result<Timetable> {
    let mut combined = base.clone();
    combined.extend(addition.clone())?;
    Ok(combined)
}

/// A single event buying one unit of `asset` at `end`, on the forward track.
pub fn forward_leg(end: DateTime<Utc>, asset: &str) -> Timetable {
    Timetable {
        events: vec![Event::add(end, 1.0, asset, TRACK_FORWARD)],
        terms: BTreeMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(day: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap() + Duration::days(day)
    }

    #[test]
    fn test_new_rejects_unordered_events() {
        let events = vec![
            Event::add(t(10), 1.0, "USD", TRACK_CONTRACT),
            Event::add(t(5), 1.0, "USD", TRACK_CONTRACT),
        ];
        assert!(matches!(
            Timetable::new(events),
            Err(BacktestError::OrderingViolation { .. })
        ));
    }

    #[test]
    fn test_extend_with_forward_leg_at_last_event() {
        let base = Timetable::new(vec![
            Event::condition(t(0), 0.0, "USD", TRACK_CONTRACT),
            Event::add(t(30), 100.0, "USD", TRACK_CONTRACT),
        ])
        .unwrap();

        let combined = extend(&base, &forward_leg(t(30), "SPX")).unwrap();
        assert_eq!(combined.len(), 3);
        assert_eq!(combined.events()[2].track, TRACK_FORWARD);
        assert_eq!(combined.events()[2].unit, "SPX");
        assert!(combined.events().windows(2).all(|w| w[0].time <= w[1].time));
    }

    #[test]
    fn test_extend_rejects_earlier_event() {
        let mut base =
            Timetable::new(vec![Event::add(t(30), 100.0, "USD", TRACK_CONTRACT)]).unwrap();
        let before = base.clone();

        let result = base.extend(forward_leg(t(29), "SPX"));
        assert!(matches!(result, Err(BacktestError::OrderingViolation { .. })));
        assert_eq!(base, before);
    }

    #[test]
    fn test_extend_keeps_existing_terms() {
        let mut base = Timetable::default().with_term("STRIKE", 80.0);
        let addition = Timetable::default()
            .with_term("STRIKE", 1.0)
            .with_term("BARRIER", 120.0);
        base.extend(addition).unwrap();
        assert_eq!(base.term("STRIKE"), Some(80.0));
        assert_eq!(base.term("BARRIER"), Some(120.0));
    }

    #[test]
    fn test_to_table() {
        let tt = Timetable::new(vec![
            Event::condition(t(0), 0.0, "USD", TRACK_CONTRACT),
            Event::add(t(0), 3230.78, "USD", TRACK_CONTRACT),
            Event::add(t(0), -1.0, "SPX", TRACK_CONTRACT),
        ])
        .unwrap();

        let table = tt.to_table();
        assert!(table.contains("01/01/2021"));
        assert!(table.contains("3230.78"));
        assert!(table.contains("-1.00"));
        assert!(table.contains("quantity"));
    }

    #[test]
    fn test_terminating_tracks() {
        assert!(is_terminating(TRACK_CALL));
        assert!(is_terminating(TRACK_KNOCK_OUT));
        assert!(!is_terminating(TRACK_KNOCK_IN));
        assert!(!is_terminating(TRACK_CONTRACT));
        assert!(!is_terminating(TRACK_COUPON));
    }

    #[test]
    fn test_terms_listing() {
        let tt = Timetable::default()
            .with_term("STRIKE", 80.0)
            .with_term("BARRIER", 120.0);
        let names: Vec<&str> = tt.terms().keys().map(String::as_str).collect();
        assert_eq!(names, vec!["BARRIER", "STRIKE"]);
    }

    #[test]
    fn test_event_op_serde_symbols() {
        let json = serde_json::to_string(&EventOp::ConditionalStart).unwrap();
        assert_eq!(json, "\">\"");
        let op: EventOp = serde_json::from_str("\"+\"").unwrap();
        assert_eq!(op, EventOp::Add);
    }
}
