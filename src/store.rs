//! In-memory canonical store and the query surface over it.
//!
//! Materialization of a ticker is all-or-nothing: the replacement snapshot is
//! built off to the side and swapped in under a write lock only once it has
//! fully succeeded. Requests for the same ticker run one at a time; requests
//! for different tickers run in parallel.

use crate::backtest::{BacktestHarness, BacktestReport, PredictionType};
use crate::config::{CoreConfig, MAX_FORECAST_HORIZON};
use crate::coverage::Coverage;
use crate::drivers::{DriverExtractor, DriverSet};
use crate::error::{CanonicalError, Result};
use crate::forecast::{ForecastEngine, ForecastPeriod, Scenario};
use crate::history::{CanonicalHistory, Cutoff, PointInTimeView};
use crate::normalizer::{normalize_ticker, DroppedFact};
use crate::schema::{CanonicalFact, LineItem, ParsedFact, Statement};
use crate::ties::TieReport;
use crate::{materialize_ticker, Materialization};
use chrono::NaiveDate;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Narrows [`CanonicalStore::list_canonical_facts`]. Empty means everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodFilter {
    /// Inclusive lower bound on `period_end`.
    pub from: Option<NaiveDate>,
    /// Inclusive upper bound on `period_end`.
    pub to: Option<NaiveDate>,
    pub statement: Option<Statement>,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
}

impl PeriodFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn period(period_end: NaiveDate) -> Self {
        Self {
            from: Some(period_end),
            to: Some(period_end),
            ..Self::default()
        }
    }

    pub fn between(from: NaiveDate, to: NaiveDate) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
            ..Self::default()
        }
    }

    pub fn with_statement(mut self, statement: Statement) -> Self {
        self.statement = Some(statement);
        self
    }

    pub fn with_line_item(mut self, line_item: LineItem) -> Self {
        self.line_items.push(line_item);
        self
    }

    pub fn matches(&self, fact: &CanonicalFact) -> bool {
        self.from.map_or(true, |from| fact.period_end >= from)
            && self.to.map_or(true, |to| fact.period_end <= to)
            && self.statement.map_or(true, |s| fact.statement == s)
            && (self.line_items.is_empty() || self.line_items.contains(&fact.line_item))
    }
}

/// Data quality of a ticker's committed rows, period by period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityReport {
    pub ticker: String,
    pub dropped_count: usize,
    /// Ascending by period.
    pub coverage: Vec<Coverage>,
    /// Ascending by period.
    pub ties: Vec<TieReport>,
}

/// Everything committed for one ticker by its last successful materialization.
#[derive(Debug)]
struct Snapshot {
    materialization: Materialization,
    history: CanonicalHistory,
    /// Input the materialization was built from; point-in-time queries
    /// re-canonicalize from it.
    parsed: Vec<ParsedFact>,
}

pub struct CanonicalStore {
    config: CoreConfig,
    committed: RwLock<BTreeMap<String, Arc<Snapshot>>>,
    flights: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CanonicalStore {
    pub fn new(config: CoreConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            committed: RwLock::new(BTreeMap::new()),
            flights: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Replaces every canonical row for `ticker` with a fresh materialization
    /// of `parsed`. On error the previously committed state is untouched.
    pub fn materialize(&self, ticker: &str, parsed: Vec<ParsedFact>) -> Result<Materialization> {
        let key = normalize_ticker(ticker);
        self.single_flight(&key, || self.commit(&key, parsed))
    }

    fn commit(&self, key: &str, parsed: Vec<ParsedFact>) -> Result<Materialization> {
        let materialization = match materialize_ticker(key, &parsed, &self.config) {
            Ok(m) => m,
            Err(e) => {
                warn!("Materialization of {} failed, keeping prior state: {}", key, e);
                return Err(e);
            }
        };
        let snapshot = Snapshot {
            history: materialization.history(),
            materialization: materialization.clone(),
            parsed,
        };

        let replaced = self
            .committed
            .write()
            .insert(key.to_string(), Arc::new(snapshot))
            .is_some();
        debug!(
            "Committed {} ({})",
            key,
            if replaced { "replaced" } else { "new" }
        );
        Ok(materialization)
    }

    /// Runs `work` while holding the ticker's flight lock. The lock entry is
    /// dropped from the map once no other request holds or waits on it.
    fn single_flight<T>(&self, key: &str, work: impl FnOnce() -> T) -> T {
        let flight = self.flights.lock().entry(key.to_string()).or_default().clone();
        let result = {
            let _single = flight.lock();
            work()
        };

        let mut flights = self.flights.lock();
        if Arc::strong_count(&flight) == 2 {
            flights.remove(key);
        }
        drop(flight);
        result
    }

    /// Materializes several tickers in parallel. One ticker's failure does
    /// not affect the others.
    pub fn materialize_many(
        &self,
        batches: Vec<(String, Vec<ParsedFact>)>,
    ) -> BTreeMap<String, Result<Materialization>> {
        info!("Materializing {} tickers", batches.len());
        batches
            .into_par_iter()
            .map(|(ticker, parsed)| {
                let result = self.materialize(&ticker, parsed);
                (normalize_ticker(&ticker), result)
            })
            .collect::<Vec<_>>()
            .into_iter()
            .collect()
    }

    pub fn tickers(&self) -> Vec<String> {
        self.committed.read().keys().cloned().collect()
    }

    pub fn contains(&self, ticker: &str) -> bool {
        self.committed.read().contains_key(&normalize_ticker(ticker))
    }

    /// Removes a ticker's committed state. Returns whether it existed.
    pub fn evict(&self, ticker: &str) -> bool {
        let key = normalize_ticker(ticker);
        self.single_flight(&key, || self.committed.write().remove(&key).is_some())
    }

    fn snapshot(&self, ticker: &str) -> Result<Arc<Snapshot>> {
        let key = normalize_ticker(ticker);
        self.committed
            .read()
            .get(&key)
            .cloned()
            .ok_or(CanonicalError::UnknownTicker(key))
    }

    pub fn materialization(&self, ticker: &str) -> Result<Materialization> {
        Ok(self.snapshot(ticker)?.materialization.clone())
    }

    /// Ordered by `(period_end, statement, line_item)`.
    pub fn list_canonical_facts(
        &self,
        ticker: &str,
        filter: &PeriodFilter,
    ) -> Result<Vec<CanonicalFact>> {
        let snapshot = self.snapshot(ticker)?;
        Ok(snapshot
            .materialization
            .facts
            .iter()
            .filter(|f| filter.matches(f))
            .cloned()
            .collect())
    }

    pub fn dropped_facts(&self, ticker: &str) -> Result<Vec<DroppedFact>> {
        Ok(self.snapshot(ticker)?.materialization.dropped.clone())
    }

    /// `None` when the ticker has no canonical rows for `period_end`.
    pub fn tie_report(&self, ticker: &str, period_end: NaiveDate) -> Result<Option<TieReport>> {
        let snapshot = self.snapshot(ticker)?;
        Ok(snapshot
            .materialization
            .tie_reports
            .iter()
            .find(|r| r.period_end == period_end)
            .cloned())
    }

    pub fn tie_reports(&self, ticker: &str) -> Result<Vec<TieReport>> {
        Ok(self.snapshot(ticker)?.materialization.tie_reports.clone())
    }

    pub fn quality(&self, ticker: &str) -> Result<QualityReport> {
        let snapshot = self.snapshot(ticker)?;
        let m = &snapshot.materialization;
        Ok(QualityReport {
            ticker: m.ticker.clone(),
            dropped_count: m.dropped_count,
            coverage: m.coverage.clone(),
            ties: m.tie_reports.clone(),
        })
    }

    /// Drivers from only what had been filed on or before `as_of`.
    pub fn drivers_as_of(&self, ticker: &str, as_of: NaiveDate) -> Result<DriverSet> {
        let snapshot = self.snapshot(ticker)?;
        let view = PointInTimeView::from_parsed(
            &snapshot.materialization.ticker,
            &snapshot.parsed,
            Cutoff::as_of(as_of),
            &self.config,
        );
        Ok(DriverExtractor::from_config(&self.config).extract(&view))
    }

    /// Projects from the latest committed period.
    pub fn forecast(
        &self,
        ticker: &str,
        scenario: Scenario,
        horizon: u32,
    ) -> Result<Vec<ForecastPeriod>> {
        if horizon == 0 || horizon > MAX_FORECAST_HORIZON {
            return Err(CanonicalError::InvalidConfig(format!(
                "forecast horizon must be between 1 and {} periods",
                MAX_FORECAST_HORIZON
            )));
        }
        let snapshot = self.snapshot(ticker)?;
        let view = PointInTimeView::new(&snapshot.history, Cutoff::unbounded());
        let drivers = DriverExtractor::from_config(&self.config).extract(&view);
        ForecastEngine::new(&self.config).project_scenario(&view, &drivers, scenario, horizon)
    }

    pub fn backtest(&self, ticker: &str, prediction_type: PredictionType) -> Result<BacktestReport> {
        let snapshot = self.snapshot(ticker)?;
        Ok(BacktestHarness::new(&self.config).run(
            &snapshot.materialization.ticker,
            &snapshot.parsed,
            &snapshot.history,
            prediction_type,
        ))
    }
}
