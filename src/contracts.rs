//! Contract definitions and timetable construction.
//!
//! Callers describe a contract with flat [`ContractParams`] (a type tag plus
//! optional overrides). [`ContractParams::resolve`] turns them into a
//! [`ContractSpec`], a closed sum type carrying only the fields each variant
//! uses, with documented defaults filled in. [`TimetableBuilder`] then derives
//! the event schedule for a given trade date.
//!
//! Observation dates are taken from the month-end trade-date sequence: every
//! `period` months after the trade date, up to `tenor` months forward, the
//! last one always falling on the tenor.
//! Autocallable-style contracts and vanilla options observe quarterly,
//! knock-out options and cliquets monthly.

use crate::cashflow::year_fraction;
use crate::error::{BacktestError, Result};
use crate::timetable::{
    self, Event, Timetable, TRACK_ACCUMULATOR, TRACK_CALL, TRACK_CONTRACT, TRACK_COUPON,
    TRACK_FIXING, TRACK_KNOCK_IN, TRACK_KNOCK_OUT,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Redemption notional of the note-style contracts, in base currency.
pub const NOTIONAL: f64 = 100.0;

pub const TERM_INITIAL_SPOT: &str = "INITIAL_SPOT";
pub const TERM_STRIKE: &str = "STRIKE";
pub const TERM_BARRIER: &str = "BARRIER";
pub const TERM_COUPON_RATE: &str = "CPN_RATE";
pub const TERM_REBATE: &str = "REBATE";
pub const TERM_LOCAL_CAP: &str = "LOCAL_CAP";
pub const TERM_LOCAL_FLOOR: &str = "LOCAL_FLOOR";
pub const TERM_GLOBAL_FLOOR: &str = "GLOBAL_FLOOR";

/// Supported contract families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContractType {
    DiscountCertificate,
    ReverseConvertible,
    KnockoutOption,
    VanillaOption,
    Cliquet,
}

impl ContractType {
    pub const ALL: [ContractType; 5] = [
        ContractType::DiscountCertificate,
        ContractType::ReverseConvertible,
        ContractType::KnockoutOption,
        ContractType::VanillaOption,
        ContractType::Cliquet,
    ];

    /// Display name, also accepted as the type tag.
    pub fn name(&self) -> &'static str {
        match self {
            ContractType::DiscountCertificate => "Discount Certificate",
            ContractType::ReverseConvertible => "Reverse Convertible",
            ContractType::KnockoutOption => "Knockout Option",
            ContractType::VanillaOption => "Vanilla Option",
            ContractType::Cliquet => "Cliquet",
        }
    }

    /// Months between observation dates.
    pub fn period_months(&self) -> usize {
        match self {
            ContractType::DiscountCertificate
            | ContractType::ReverseConvertible
            | ContractType::VanillaOption => 3,
            ContractType::KnockoutOption | ContractType::Cliquet => 1,
        }
    }
}

impl fmt::Display for ContractType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ContractType {
    type Err = BacktestError;

    fn from_str(s: &str) -> Result<Self> {
        let key: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match key.as_str() {
            "discountcertificate" => Ok(ContractType::DiscountCertificate),
            "reverseconvertible" => Ok(ContractType::ReverseConvertible),
            "knockoutoption" => Ok(ContractType::KnockoutOption),
            "vanillaoption" => Ok(ContractType::VanillaOption),
            "cliquet" => Ok(ContractType::Cliquet),
            _ => Err(BacktestError::UnknownContractType(s.to_string())),
        }
    }
}

/// Call or put.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionDirection {
    Call,
    Put,
}

impl OptionDirection {
    pub fn is_call(&self) -> bool {
        matches!(self, OptionDirection::Call)
    }
}

impl fmt::Display for OptionDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionDirection::Call => write!(f, "Call"),
            OptionDirection::Put => write!(f, "Put"),
        }
    }
}

impl FromStr for OptionDirection {
    type Err = BacktestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "call" => Ok(OptionDirection::Call),
            "put" => Ok(OptionDirection::Put),
            _ => Err(BacktestError::InvalidInput(format!(
                "Unknown option direction: {}",
                s
            ))),
        }
    }
}

/// Flat contract parameters. Only the fields relevant to `contract_type` are
/// read; the rest are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContractParams {
    /// Underlying asset identifier.
    pub ticker: String,
    /// Contract type tag, e.g. "Reverse Convertible".
    #[serde(alias = "ctr-type")]
    pub contract_type: String,
    /// Strike as percent of spot.
    #[serde(default)]
    pub strike: Option<f64>,
    /// Option direction (vanilla and knock-out options).
    #[serde(default)]
    pub option_type: Option<OptionDirection>,
    /// Barrier as percent of spot.
    #[serde(default)]
    pub barrier: Option<f64>,
    /// Annual coupon rate (autocallable-style contracts).
    #[serde(default)]
    pub coupon_rate: Option<f64>,
    /// Knock-out rebate as percent of spot.
    #[serde(default)]
    pub rebate: Option<f64>,
    /// Cliquet local `[floor, cap]` in percent.
    #[serde(default)]
    pub cap_floor: Option<[f64; 2]>,
}

impl ContractParams {
    pub fn new(ticker: impl Into<String>, contract_type: impl Into<String>) -> Self {
        Self {
            ticker: ticker.into(),
            contract_type: contract_type.into(),
            ..Default::default()
        }
    }

    pub fn with_strike(mut self, strike_pct: f64) -> Self {
        self.strike = Some(strike_pct);
        self
    }

    pub fn with_option_type(mut self, direction: OptionDirection) -> Self {
        self.option_type = Some(direction);
        self
    }

    pub fn with_barrier(mut self, barrier_pct: f64) -> Self {
        self.barrier = Some(barrier_pct);
        self
    }

    pub fn with_coupon_rate(mut self, rate: f64) -> Self {
        self.coupon_rate = Some(rate);
        self
    }

    pub fn with_rebate(mut self, rebate_pct: f64) -> Self {
        self.rebate = Some(rebate_pct);
        self
    }

    pub fn with_cap_floor(mut self, floor_pct: f64, cap_pct: f64) -> Self {
        self.cap_floor = Some([floor_pct, cap_pct]);
        self
    }

    /// Resolve the type tag and fill in variant defaults.
    pub fn resolve(&self) -> Result<ContractSpec> {
        if self.ticker.trim().is_empty() {
            return Err(BacktestError::ConfigError("Ticker must not be empty".to_string()));
        }
        let contract_type: ContractType = self.contract_type.parse()?;

        let spec = match contract_type {
            ContractType::DiscountCertificate => ContractSpec::DiscountCertificate(AutocallTerms {
                strike_pct: self.strike.unwrap_or(80.0),
                barrier_pct: self.barrier.unwrap_or(100.0),
                coupon_rate: self.coupon_rate.unwrap_or(0.17),
            }),
            ContractType::ReverseConvertible => ContractSpec::ReverseConvertible(AutocallTerms {
                strike_pct: self.strike.unwrap_or(80.0),
                barrier_pct: self.barrier.unwrap_or(100.0),
                coupon_rate: self.coupon_rate.unwrap_or(0.15),
            }),
            ContractType::KnockoutOption => ContractSpec::KnockoutOption(KnockoutTerms {
                strike_pct: self.strike.unwrap_or(100.0),
                direction: self.option_type.ok_or(BacktestError::MissingParameter {
                    contract: ContractType::KnockoutOption.name(),
                    parameter: "option_type",
                })?,
                barrier_pct: self.barrier.unwrap_or(120.0),
                rebate_pct: self.rebate.unwrap_or(1.0),
            }),
            ContractType::VanillaOption => ContractSpec::VanillaOption(VanillaTerms {
                strike_pct: self.strike.unwrap_or(100.0),
                direction: self.option_type.ok_or(BacktestError::MissingParameter {
                    contract: ContractType::VanillaOption.name(),
                    parameter: "option_type",
                })?,
            }),
            ContractType::Cliquet => {
                let [floor_pct, cap_pct] = self.cap_floor.unwrap_or([-5.0, 5.0]);
                if floor_pct > cap_pct {
                    return Err(BacktestError::ConfigError(format!(
                        "Cliquet floor {}% is above cap {}%",
                        floor_pct, cap_pct
                    )));
                }
                ContractSpec::Cliquet(CliquetTerms {
                    local_cap: cap_pct / 100.0,
                    local_floor: floor_pct / 100.0,
                    global_floor: 0.0,
                })
            }
        };
        Ok(spec)
    }
}

/// Terms shared by the autocallable-style notes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AutocallTerms {
    /// Knock-in strike, percent of initial spot.
    pub strike_pct: f64,
    /// Autocall barrier, percent of initial spot.
    pub barrier_pct: f64,
    /// Annual coupon rate.
    pub coupon_rate: f64,
}

/// Up-and-out barrier option terms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KnockoutTerms {
    pub strike_pct: f64,
    pub direction: OptionDirection,
    pub barrier_pct: f64,
    pub rebate_pct: f64,
}

/// European option terms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VanillaTerms {
    pub strike_pct: f64,
    pub direction: OptionDirection,
}

/// Cliquet (accumulator) terms, as fractions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CliquetTerms {
    pub local_cap: f64,
    pub local_floor: f64,
    pub global_floor: f64,
}

/// A fully resolved contract.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ContractSpec {
    DiscountCertificate(AutocallTerms),
    ReverseConvertible(AutocallTerms),
    KnockoutOption(KnockoutTerms),
    VanillaOption(VanillaTerms),
    Cliquet(CliquetTerms),
}

impl ContractSpec {
    pub fn contract_type(&self) -> ContractType {
        match self {
            ContractSpec::DiscountCertificate(_) => ContractType::DiscountCertificate,
            ContractSpec::ReverseConvertible(_) => ContractType::ReverseConvertible,
            ContractSpec::KnockoutOption(_) => ContractType::KnockoutOption,
            ContractSpec::VanillaOption(_) => ContractType::VanillaOption,
            ContractSpec::Cliquet(_) => ContractType::Cliquet,
        }
    }

    /// One-paragraph plain-language definition.
    pub fn definition(&self) -> &'static str {
        match self {
            ContractSpec::DiscountCertificate(_) => {
                "A **Discount Certificate** redeems early at par plus the accrued coupon on the \
first observation date where the underlying closes at or above the autocall barrier. \
If never called, it repays par at maturity, or delivers shares when the underlying ends \
below the strike."
            }
            ContractSpec::ReverseConvertible(_) => {
                "A **Reverse Convertible** pays a fixed coupon every period and redeems early at \
par when the underlying closes at or above the autocall barrier on an observation date. \
At maturity the holder receives par, or shares worth less than par when the underlying \
ends below the strike."
            }
            ContractSpec::KnockoutOption(_) => {
                "An **Up-and-Out Option** is a European option that is cancelled, paying only a \
small rebate, as soon as the underlying closes at or above the barrier on any monthly \
observation date."
            }
            ContractSpec::VanillaOption(_) => {
                "A **European Call Option** gives the holder the right to buy the underlying for \
the strike price on the maturity date. A **Put Option** gives the right to sell it at the \
strike."
            }
            ContractSpec::Cliquet(_) => {
                "A **Cliquet** accumulates the monthly returns of the underlying, each clipped to \
a local floor and cap, and pays the accumulated return (floored globally) at maturity."
            }
        }
    }
}

/// Builds contract timetables from the month-end trade-date sequence.
#[derive(Debug, Clone)]
pub struct TimetableBuilder {
    /// Forward tenor in months (trade-date steps).
    pub tenor_months: usize,
    /// Settlement currency.
    pub currency: String,
}

impl Default for TimetableBuilder {
    fn default() -> Self {
        Self {
            tenor_months: 12,
            currency: "USD".to_string(),
        }
    }
}

impl TimetableBuilder {
    pub fn new(tenor_months: usize) -> Self {
        Self {
            tenor_months,
            ..Default::default()
        }
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    /// Observation dates `trade_dates[trial + period], trade_dates[trial + 2·period], ...`
    /// within the tenor, always ending at `trade_dates[trial + tenor]`. A
    /// tenor that is not a multiple of `period` leaves a short final period.
    pub fn observation_dates(
        &self,
        trade_dates: &[DateTime<Utc>],
        trial: usize,
        period: usize,
    ) -> Result<Vec<DateTime<Utc>>> {
        if period == 0 || self.tenor_months == 0 {
            return Err(BacktestError::ConfigError(format!(
                "Observation period {} incompatible with tenor {}",
                period, self.tenor_months
            )));
        }
        let last = trial + self.tenor_months;
        if last >= trade_dates.len() {
            return Err(BacktestError::InsufficientDates {
                required: last,
                available: trade_dates.len(),
            });
        }

        let mut offsets: Vec<usize> = (period..=self.tenor_months).step_by(period).collect();
        if offsets.last() != Some(&self.tenor_months) {
            offsets.push(self.tenor_months);
        }
        Ok(offsets.into_iter().map(|offset| trade_dates[trial + offset]).collect())
    }

    /// Resolve `params` and build the timetable for trade date `trial`.
    pub fn build(
        &self,
        params: &ContractParams,
        trade_dates: &[DateTime<Utc>],
        trial: usize,
        spot: f64,
    ) -> Result<Timetable> {
        let spec = params.resolve()?;
        self.build_resolved(&spec, &params.ticker, trade_dates, trial, spot)
    }

    /// Build the timetable of an already resolved contract.
    pub fn build_resolved(
        &self,
        spec: &ContractSpec,
        ticker: &str,
        trade_dates: &[DateTime<Utc>],
        trial: usize,
        spot: f64,
    ) -> Result<Timetable> {
        if !(spot.is_finite() && spot > 0.0) {
            return Err(BacktestError::InvalidInput(format!(
                "Spot must be positive, got {}",
                spot
            )));
        }
        let dates = self.observation_dates(trade_dates, trial, spec.contract_type().period_months())?;
        let trade_date = trade_dates[trial];

        let timetable = match spec {
            ContractSpec::DiscountCertificate(terms) => {
                self.discount_certificate(terms, ticker, trade_date, &dates, spot)?
            }
            ContractSpec::ReverseConvertible(terms) => {
                self.reverse_convertible(terms, ticker, trade_date, &dates, spot)?
            }
            ContractSpec::KnockoutOption(terms) => self.knockout_option(terms, ticker, &dates, spot)?,
            ContractSpec::VanillaOption(terms) => self.vanilla_option(terms, ticker, &dates, spot)?,
            ContractSpec::Cliquet(terms) => self.cliquet(terms, ticker, &dates)?,
        };
        Ok(timetable.with_term(TERM_INITIAL_SPOT, spot))
    }

    /// Forward purchase of one unit of the underlying at `end`.
    pub fn build_forward_leg(&self, end: DateTime<Utc>, params: &ContractParams) -> Timetable {
        timetable::forward_leg(end, &params.ticker)
    }

    /// Par redemption at maturity. Below the strike the knock-in block takes
    /// par back and delivers `NOTIONAL / strike` shares instead.
    fn maturity_redemption(&self, events: &mut Vec<Event>, ticker: &str, maturity: DateTime<Utc>, strike: f64) {
        events.push(Event::add(maturity, NOTIONAL, &self.currency, TRACK_CONTRACT));
        events.push(Event::condition(maturity, strike, ticker, TRACK_KNOCK_IN));
        events.push(Event::add(maturity, -NOTIONAL, &self.currency, TRACK_KNOCK_IN));
        events.push(Event::add(maturity, NOTIONAL / strike, ticker, TRACK_KNOCK_IN));
    }

    fn discount_certificate(
        &self,
        terms: &AutocallTerms,
        ticker: &str,
        accrual_start: DateTime<Utc>,
        barrier_dates: &[DateTime<Utc>],
        spot: f64,
    ) -> Result<Timetable> {
        let strike = terms.strike_pct * spot / 100.0;
        let barrier = terms.barrier_pct * spot / 100.0;

        let mut events = Vec::with_capacity(barrier_dates.len() * 2 + 4);
        for &date in barrier_dates {
            let redemption = NOTIONAL * (1.0 + terms.coupon_rate * year_fraction(accrual_start, date));
            events.push(Event::condition(date, barrier, ticker, TRACK_CALL));
            events.push(Event::add(date, redemption, &self.currency, TRACK_CALL));
        }
        let maturity = last_date(barrier_dates)?;
        self.maturity_redemption(&mut events, ticker, maturity, strike);

        Ok(Timetable::new(events)?
            .with_term(TERM_STRIKE, strike)
            .with_term(TERM_BARRIER, barrier)
            .with_term(TERM_COUPON_RATE, terms.coupon_rate))
    }

    fn reverse_convertible(
        &self,
        terms: &AutocallTerms,
        ticker: &str,
        accrual_start: DateTime<Utc>,
        barrier_dates: &[DateTime<Utc>],
        spot: f64,
    ) -> Result<Timetable> {
        let strike = terms.strike_pct * spot / 100.0;
        let barrier = terms.barrier_pct * spot / 100.0;
        let maturity = last_date(barrier_dates)?;

        let mut events = Vec::with_capacity(barrier_dates.len() * 3 + 4);
        let mut period_start = accrual_start;
        for &date in barrier_dates {
            let coupon = NOTIONAL * terms.coupon_rate * year_fraction(period_start, date);
            events.push(Event::add(date, coupon, &self.currency, TRACK_COUPON));
            if date < maturity {
                events.push(Event::condition(date, barrier, ticker, TRACK_CALL));
                events.push(Event::add(date, NOTIONAL, &self.currency, TRACK_CALL));
            }
            period_start = date;
        }
        self.maturity_redemption(&mut events, ticker, maturity, strike);

        Ok(Timetable::new(events)?
            .with_term(TERM_STRIKE, strike)
            .with_term(TERM_BARRIER, barrier)
            .with_term(TERM_COUPON_RATE, terms.coupon_rate))
    }

    /// Holder's exercise block at maturity.
    fn exercise(&self, events: &mut Vec<Event>, ticker: &str, maturity: DateTime<Utc>, strike: f64, direction: OptionDirection) {
        let sign = if direction.is_call() { 1.0 } else { -1.0 };
        events.push(Event::condition(maturity, 0.0, &self.currency, TRACK_CONTRACT));
        events.push(Event::add(maturity, -sign * strike, &self.currency, TRACK_CONTRACT));
        events.push(Event::add(maturity, sign, ticker, TRACK_CONTRACT));
    }

    fn knockout_option(
        &self,
        terms: &KnockoutTerms,
        ticker: &str,
        barrier_dates: &[DateTime<Utc>],
        spot: f64,
    ) -> Result<Timetable> {
        let strike = terms.strike_pct * spot / 100.0;
        let barrier = terms.barrier_pct * spot / 100.0;
        let rebate = terms.rebate_pct * spot / 100.0;

        let mut events = Vec::with_capacity(barrier_dates.len() * 2 + 3);
        for &date in barrier_dates {
            events.push(Event::condition(date, barrier, ticker, TRACK_KNOCK_OUT));
            events.push(Event::add(date, rebate, &self.currency, TRACK_KNOCK_OUT));
        }
        self.exercise(&mut events, ticker, last_date(barrier_dates)?, strike, terms.direction);

        Ok(Timetable::new(events)?
            .with_term(TERM_STRIKE, strike)
            .with_term(TERM_BARRIER, barrier)
            .with_term(TERM_REBATE, rebate))
    }

    fn vanilla_option(
        &self,
        terms: &VanillaTerms,
        ticker: &str,
        dates: &[DateTime<Utc>],
        spot: f64,
    ) -> Result<Timetable> {
        let strike = terms.strike_pct * spot / 100.0;
        let mut events = Vec::with_capacity(3);
        self.exercise(&mut events, ticker, last_date(dates)?, strike, terms.direction);
        Ok(Timetable::new(events)?.with_term(TERM_STRIKE, strike))
    }

    fn cliquet(&self, terms: &CliquetTerms, ticker: &str, fix_dates: &[DateTime<Utc>]) -> Result<Timetable> {
        let maturity = last_date(fix_dates)?;

        let mut events: Vec<Event> = fix_dates
            .iter()
            .map(|&date| Event::add(date, 0.0, ticker, TRACK_FIXING))
            .collect();
        // Pays NOTIONAL * max(accumulated clipped return, global floor)
        events.push(Event::condition(maturity, terms.global_floor, &self.currency, TRACK_ACCUMULATOR));
        events.push(Event::add(maturity, NOTIONAL, &self.currency, TRACK_ACCUMULATOR));

        Ok(Timetable::new(events)?
            .with_term(TERM_LOCAL_CAP, terms.local_cap)
            .with_term(TERM_LOCAL_FLOOR, terms.local_floor)
            .with_term(TERM_GLOBAL_FLOOR, terms.global_floor))
    }
}

fn last_date(dates: &[DateTime<Utc>]) -> Result<DateTime<Utc>> {
    dates
        .last()
        .copied()
        .ok_or_else(|| BacktestError::ConfigError("Contract has no observation dates".to_string()))
}
