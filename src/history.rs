//! Canonical rows indexed by period, and point-in-time views over them.
//!
//! Drivers and forecasts only ever see a [`PointInTimeView`]. Every way of
//! building one applies its [`Cutoff`] before any row is admitted, so a view
//! cannot hold a value that was not public at its cutoff.

use crate::config::CoreConfig;
use crate::normalizer::FactNormalizer;
use crate::residuals::{PeriodRows, ResidualDeriver};
use crate::schema::{CanonicalFact, LineItem, ParsedFact};
use chrono::NaiveDate;
use log::debug;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalHistory {
    ticker: String,
    periods: BTreeMap<NaiveDate, PeriodRows>,
}

impl CanonicalHistory {
    pub fn from_facts(ticker: &str, facts: impl IntoIterator<Item = CanonicalFact>) -> Self {
        let mut periods: BTreeMap<NaiveDate, PeriodRows> = BTreeMap::new();
        for fact in facts {
            periods
                .entry(fact.period_end)
                .or_default()
                .insert(fact.line_item, fact);
        }
        Self {
            ticker: ticker.to_string(),
            periods,
        }
    }

    pub fn ticker(&self) -> &str {
        &self.ticker
    }

    pub fn is_empty(&self) -> bool {
        self.periods.is_empty()
    }

    pub fn len(&self) -> usize {
        self.periods.values().map(|rows| rows.len()).sum()
    }

    pub fn period_ends(&self) -> impl DoubleEndedIterator<Item = NaiveDate> + '_ {
        self.periods.keys().copied()
    }

    pub fn periods(&self) -> impl DoubleEndedIterator<Item = (NaiveDate, &PeriodRows)> + '_ {
        self.periods.iter().map(|(end, rows)| (*end, rows))
    }

    pub fn period(&self, period_end: NaiveDate) -> Option<&PeriodRows> {
        self.periods.get(&period_end)
    }

    pub fn fact(&self, period_end: NaiveDate, line_item: LineItem) -> Option<&CanonicalFact> {
        self.periods.get(&period_end)?.get(&line_item)
    }

    pub fn value(&self, period_end: NaiveDate, line_item: LineItem) -> Option<Decimal> {
        self.fact(period_end, line_item).map(|f| f.value)
    }

    pub fn latest_period_end(&self) -> Option<NaiveDate> {
        self.periods.keys().next_back().copied()
    }

    /// Ascending by period end.
    pub fn series(&self, line_item: LineItem) -> Vec<&CanonicalFact> {
        self.periods
            .values()
            .filter_map(|rows| rows.get(&line_item))
            .collect()
    }

    pub fn latest(&self, line_item: LineItem) -> Option<&CanonicalFact> {
        self.periods
            .values()
            .rev()
            .find_map(|rows| rows.get(&line_item))
    }

    /// Most recent row at or before `period_end`.
    pub fn latest_at_or_before(
        &self,
        line_item: LineItem,
        period_end: NaiveDate,
    ) -> Option<&CanonicalFact> {
        self.periods
            .range(..=period_end)
            .rev()
            .find_map(|(_, rows)| rows.get(&line_item))
    }

    /// Ordered by `(period_end, statement, line_item)`.
    pub fn facts(&self) -> impl Iterator<Item = &CanonicalFact> + '_ {
        let mut all: Vec<&CanonicalFact> = self.periods.values().flat_map(|r| r.values()).collect();
        all.sort_by_key(|f| (f.period_end, f.statement, f.line_item));
        all.into_iter()
    }
}

/// Exclusive upper bound on what a point-in-time view may contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cutoff {
    bound: NaiveDate,
}

impl Cutoff {
    /// Only data public strictly before `date`.
    pub fn available_before(date: NaiveDate) -> Self {
        Self { bound: date }
    }

    /// Data public on or before `date`.
    pub fn as_of(date: NaiveDate) -> Self {
        Self {
            bound: date.succ_opt().unwrap_or(NaiveDate::MAX),
        }
    }

    pub fn unbounded() -> Self {
        Self {
            bound: NaiveDate::MAX,
        }
    }

    pub fn bound(&self) -> NaiveDate {
        self.bound
    }

    pub fn admits(&self, fact: &CanonicalFact) -> bool {
        fact.available_at < self.bound && fact.period_end < self.bound
    }

    pub fn admits_parsed(&self, fact: &ParsedFact) -> bool {
        fact.filed_at < self.bound && fact.period_end < self.bound
    }
}

/// Canonical history as it stood at a cutoff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointInTimeView {
    cutoff: Cutoff,
    history: CanonicalHistory,
}

impl PointInTimeView {
    /// Restricts already-materialized history to rows admitted by `cutoff`.
    ///
    /// A slot whose surviving value was restated after the cutoff is absent
    /// rather than showing the superseded value; use [`Self::from_parsed`]
    /// when the parsed facts are at hand.
    pub fn new(history: &CanonicalHistory, cutoff: Cutoff) -> Self {
        let admitted = history.facts().filter(|f| cutoff.admits(f)).cloned();
        Self {
            cutoff,
            history: CanonicalHistory::from_facts(history.ticker(), admitted),
        }
    }

    /// Re-canonicalizes only the parsed facts filed before the cutoff.
    pub fn from_parsed(
        ticker: &str,
        parsed: &[ParsedFact],
        cutoff: Cutoff,
        config: &CoreConfig,
    ) -> Self {
        let visible: Vec<ParsedFact> = parsed
            .iter()
            .filter(|f| cutoff.admits_parsed(f))
            .cloned()
            .collect();
        debug!(
            "{}: {} of {} parsed facts visible before {}",
            ticker,
            visible.len(),
            parsed.len(),
            cutoff.bound()
        );

        let normalized = FactNormalizer::new(config).normalize(ticker, &visible);
        let facts = ResidualDeriver::derive(normalized.facts);
        Self {
            cutoff,
            history: CanonicalHistory::from_facts(&normalized.ticker, facts),
        }
    }

    pub fn cutoff(&self) -> Cutoff {
        self.cutoff
    }

    pub fn history(&self) -> &CanonicalHistory {
        &self.history
    }

    pub fn ticker(&self) -> &str {
        self.history.ticker()
    }

    /// Checks the view's invariant; used in debug assertions downstream.
    pub fn is_sealed(&self) -> bool {
        self.history.facts().all(|f| self.cutoff.admits(f))
    }
}
