//! # Canonical Financials
//!
//! Turns heterogeneous facts parsed from regulatory filings into one
//! canonical, comparable set of financial statement rows per company, and
//! builds point-in-time drivers, scenario forecasts and leakage-free
//! backtests on top of them.
//!
//! ## Pipeline
//!
//! - **Tag mapping**: source taxonomy tags resolve to a closed set of
//!   canonical line items, with a priority rank per synonym
//! - **Normalization**: scale, sign and unit are applied, disallowed facts are
//!   dropped with a reason, and exactly one fact wins each slot
//! - **Residuals**: missing subtotals are derived from their components and
//!   never overwrite a tagged value
//! - **Ties**: every period is checked for `assets = liabilities + equity` and
//!   for cash-flow reconciliation
//! - **Drivers, forecasts, backtests**: computed only from a
//!   [`PointInTimeView`], which cannot contain data filed after its cutoff
//!
//! ## Example
//!
//! ```rust,ignore
//! use canonical_financials::*;
//!
//! let config = CoreConfig::nightly();
//! let parsed: Vec<ParsedFact> = load_parsed_facts("ACME")?;
//!
//! let materialized = materialize_ticker("ACME", &parsed, &config)?;
//! for report in &materialized.tie_reports {
//!     println!("{} {:?} bs_tie={:?}", report.period_end, report.status, report.bs_tie);
//! }
//!
//! let store = CanonicalStore::new(config)?;
//! store.materialize("ACME", parsed)?;
//! let base = store.forecast("ACME", Scenario::Base, 4)?;
//! let report = store.backtest("ACME", PredictionType::Revenue)?;
//! ```

pub mod backtest;
pub mod config;
pub mod coverage;
pub mod drivers;
pub mod error;
pub mod forecast;
pub mod history;
pub mod normalizer;
pub mod residuals;
pub mod schema;
pub mod store;
pub mod tag_map;
pub mod ties;
pub mod utils;

pub use backtest::{
    BacktestHarness, BacktestMetrics, BacktestReport, BacktestSample, PredictionType,
    SkippedTarget,
};
pub use config::{CoreConfig, SegmentPolicy, MAX_FORECAST_HORIZON};
pub use coverage::{coverage_by_period, Coverage, StatementCoverage};
pub use drivers::{Driver, DriverClass, DriverExtractor, DriverKind, DriverSet, DriverSource};
pub use error::{CanonicalError, FactRejection, Result};
pub use forecast::{
    scenario_assumptions, summarize_bands, BaseState, ForecastBand, ForecastEngine,
    ForecastPeriod, Scenario,
};
pub use history::{CanonicalHistory, Cutoff, PointInTimeView};
pub use normalizer::{normalize_ticker, DroppedFact, FactNormalizer, NormalizedFacts};
pub use residuals::{formula_for, Formula, PeriodRows, ResidualDeriver};
pub use schema::*;
pub use store::{CanonicalStore, PeriodFilter, QualityReport};
pub use tag_map::{TagMapper, TagMapping, TAG_MAP_VERSION};
pub use ties::{ResidualBreak, TieReport, TieStatus, TieValidator};
pub use utils::PeriodLength;

use log::{debug, info};
use serde::{Deserialize, Serialize};

/// The full canonical state of one ticker, replaced as a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Materialization {
    pub ticker: String,
    pub tag_map_version: String,
    /// Ordered by `(period_end, statement, line_item)`.
    pub facts: Vec<CanonicalFact>,
    pub dropped: Vec<DroppedFact>,
    pub dropped_count: usize,
    pub derived_count: usize,
    pub tie_reports: Vec<TieReport>,
    /// One entry per period, aligned with `tie_reports`.
    #[serde(default)]
    pub coverage: Vec<Coverage>,
}

impl Materialization {
    pub fn history(&self) -> CanonicalHistory {
        CanonicalHistory::from_facts(&self.ticker, self.facts.iter().cloned())
    }

    pub fn failing_periods(&self) -> impl Iterator<Item = &TieReport> + '_ {
        self.tie_reports
            .iter()
            .filter(|r| r.status == TieStatus::Fail)
    }
}

pub struct CanonicalProcessor;

impl CanonicalProcessor {
    /// Normalizes, derives residuals and validates ties for one ticker.
    ///
    /// Fails only when no fact survives normalization, or when a period fails
    /// the balance sheet tie under `hard_fail_ties`.
    pub fn materialize(
        ticker: &str,
        parsed: &[ParsedFact],
        config: &CoreConfig,
    ) -> Result<Materialization> {
        config.validate()?;

        info!(
            "Materializing {} from {} parsed facts (tag map {})",
            ticker,
            parsed.len(),
            TAG_MAP_VERSION
        );

        let normalized = FactNormalizer::new(config).normalize(ticker, parsed);
        if normalized.facts.is_empty() {
            let dropped = normalized.dropped_count();
            return Err(CanonicalError::NoCanonicalFacts {
                ticker: normalized.ticker,
                dropped,
            });
        }

        let facts = ResidualDeriver::derive(normalized.facts);
        let derived_count = facts.iter().filter(|f| f.is_derived()).count();
        let history = CanonicalHistory::from_facts(&normalized.ticker, facts.iter().cloned());

        let validator = TieValidator::new(config);
        let tie_reports = validator.validate_history(&history);
        validator.enforce(&tie_reports)?;
        let coverage = coverage_by_period(&history);

        debug!(
            "{}: {} periods validated, {} residual rows derived",
            normalized.ticker,
            tie_reports.len(),
            derived_count
        );
        info!(
            "Materialized {}: {} canonical facts, {} dropped",
            normalized.ticker,
            facts.len(),
            normalized.dropped.len()
        );

        Ok(Materialization {
            ticker: normalized.ticker,
            tag_map_version: TAG_MAP_VERSION.to_string(),
            dropped_count: normalized.dropped.len(),
            dropped: normalized.dropped,
            facts,
            derived_count,
            tie_reports,
            coverage,
        })
    }
}

pub fn materialize_ticker(
    ticker: &str,
    parsed: &[ParsedFact],
    config: &CoreConfig,
) -> Result<Materialization> {
    CanonicalProcessor::materialize(ticker, parsed, config)
}
