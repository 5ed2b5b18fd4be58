//! Time-travel backtests.
//!
//! For every target period the harness re-canonicalizes only the parsed facts
//! filed before the target's first filing, extracts drivers and projects one
//! period ahead exactly as a live call at that date would. Actuals come from
//! the full materialized history.

use crate::config::CoreConfig;
use crate::drivers::{period_length, DriverExtractor};
use crate::error::{CanonicalError, Result};
use crate::forecast::{BaseState, ForecastEngine, Scenario};
use crate::history::{CanonicalHistory, Cutoff, PointInTimeView};
use crate::schema::{CanonicalFact, LineItem, ParsedFact};
use crate::utils::{mean, safe_div};
use chrono::NaiveDate;
use log::{debug, info};
use rayon::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

const METRIC_PRECISION: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    Revenue,
    NetIncome,
    OperatingIncome,
    EpsDiluted,
    Cfo,
}

impl PredictionType {
    pub const ALL: [PredictionType; 5] = [
        PredictionType::Revenue,
        PredictionType::NetIncome,
        PredictionType::OperatingIncome,
        PredictionType::EpsDiluted,
        PredictionType::Cfo,
    ];

    pub fn line_item(&self) -> LineItem {
        match self {
            Self::Revenue => LineItem::Revenue,
            Self::NetIncome => LineItem::NetIncome,
            Self::OperatingIncome => LineItem::OperatingIncome,
            Self::EpsDiluted => LineItem::EpsDiluted,
            Self::Cfo => LineItem::Cfo,
        }
    }
}

impl fmt::Display for PredictionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.line_item().as_str())
    }
}

impl FromStr for PredictionType {
    type Err = CanonicalError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|p| p.line_item().as_str() == wanted)
            .ok_or_else(|| CanonicalError::InvalidConfig(format!("unknown prediction type '{}'", s)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacktestSample {
    pub ticker: String,
    pub prediction_type: PredictionType,
    pub as_of_period_end: NaiveDate,
    pub target_period_end: NaiveDate,
    /// Exclusive availability bound of the data the prediction used.
    pub cutoff: NaiveDate,
    pub predicted: Decimal,
    pub actual: Decimal,
    pub abs_error: Decimal,
    /// `None` when the actual is zero.
    pub pct_error: Option<Decimal>,
    pub directional_correct: bool,
    pub within_interval: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedTarget {
    pub target_period_end: NaiveDate,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacktestMetrics {
    pub sample_count: usize,
    pub mae: Option<Decimal>,
    pub mape: Option<Decimal>,
    /// Samples that contributed to MAPE; zero actuals are excluded.
    pub mape_sample_count: usize,
    pub directional_accuracy: Option<Decimal>,
    pub interval_coverage: Option<Decimal>,
}

impl BacktestMetrics {
    pub fn from_samples(samples: &[BacktestSample]) -> Self {
        let abs_errors: Vec<Decimal> = samples.iter().map(|s| s.abs_error).collect();
        let pct_errors: Vec<Decimal> = samples.iter().filter_map(|s| s.pct_error).collect();
        let fraction = |hits: usize| {
            safe_div(Decimal::from(hits), Decimal::from(samples.len()))
                .map(|v| v.round_dp(METRIC_PRECISION))
        };

        Self {
            sample_count: samples.len(),
            mae: mean(&abs_errors).map(|v| v.round_dp(METRIC_PRECISION)),
            mape: mean(&pct_errors).map(|v| v.round_dp(METRIC_PRECISION)),
            mape_sample_count: pct_errors.len(),
            directional_accuracy: fraction(samples.iter().filter(|s| s.directional_correct).count()),
            interval_coverage: fraction(samples.iter().filter(|s| s.within_interval).count()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacktestReport {
    pub ticker: String,
    pub prediction_type: PredictionType,
    /// Ordered by target period.
    pub samples: Vec<BacktestSample>,
    pub skipped: Vec<SkippedTarget>,
    pub metrics: BacktestMetrics,
}

struct Target<'h> {
    prior: &'h CanonicalFact,
    actual: &'h CanonicalFact,
    availability: NaiveDate,
}

pub struct BacktestHarness<'a> {
    config: &'a CoreConfig,
}

impl<'a> BacktestHarness<'a> {
    pub fn new(config: &'a CoreConfig) -> Self {
        Self { config }
    }

    /// `history` must be the materialization of `parsed`.
    pub fn run(
        &self,
        ticker: &str,
        parsed: &[ParsedFact],
        history: &CanonicalHistory,
        prediction_type: PredictionType,
    ) -> BacktestReport {
        let first_filed = first_filing_dates(parsed);
        let series = history.series(prediction_type.line_item());
        let targets: Vec<Target<'_>> = series
            .windows(2)
            .map(|pair| Target {
                prior: pair[0],
                actual: pair[1],
                availability: first_filed
                    .get(&pair[1].period_end)
                    .copied()
                    .unwrap_or(pair[1].available_at),
            })
            .collect();

        let outcomes: Vec<std::result::Result<BacktestSample, SkippedTarget>> = targets
            .par_iter()
            .map(|target| self.score(ticker, parsed, prediction_type, target))
            .collect();

        let mut samples = Vec::new();
        let mut skipped = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(sample) => samples.push(sample),
                Err(skip) => {
                    debug!(
                        "{}: skipping {} target {}: {}",
                        ticker, prediction_type, skip.target_period_end, skip.reason
                    );
                    skipped.push(skip);
                }
            }
        }
        samples.sort_by_key(|s| s.target_period_end);
        skipped.sort_by_key(|s| s.target_period_end);

        let metrics = BacktestMetrics::from_samples(&samples);
        info!(
            "{}: {} backtest scored {} targets ({} skipped)",
            ticker,
            prediction_type,
            samples.len(),
            skipped.len()
        );

        BacktestReport {
            ticker: history.ticker().to_string(),
            prediction_type,
            samples,
            skipped,
            metrics,
        }
    }

    fn score(
        &self,
        ticker: &str,
        parsed: &[ParsedFact],
        prediction_type: PredictionType,
        target: &Target<'_>,
    ) -> std::result::Result<BacktestSample, SkippedTarget> {
        let skip = |reason: String| SkippedTarget {
            target_period_end: target.actual.period_end,
            reason,
        };
        let item = prediction_type.line_item();

        let cutoff = Cutoff::available_before(target.availability);
        let view = PointInTimeView::from_parsed(ticker, parsed, cutoff, self.config);
        debug_assert!(view.history().facts().all(|f| f.available_at < target.availability));

        let base = BaseState::from_view(&view).map_err(|e| skip(e.to_string()))?;
        if base.period_end != target.prior.period_end {
            return Err(skip(format!(
                "latest visible revenue period {} is not the predecessor {}",
                base.period_end, target.prior.period_end
            )));
        }
        let prior_value = view
            .history()
            .value(target.prior.period_end, item)
            .ok_or_else(|| skip("prior actual not visible at cutoff".to_string()))?;

        let drivers = DriverExtractor::from_config(self.config).extract(&view);
        if period_length(target.actual) != drivers.cadence {
            return Err(skip(format!(
                "target covers {:?}, forecast cadence is {:?}",
                period_length(target.actual),
                drivers.cadence
            )));
        }

        let engine = ForecastEngine::new(self.config);
        let mut by_scenario: BTreeMap<Scenario, Decimal> = BTreeMap::new();
        for scenario in &self.config.scenarios {
            let projected = engine
                .project_from(&base, &drivers, *scenario, 1)
                .map_err(|e| skip(e.to_string()))?;
            if let Some(value) = projected.first().and_then(|p| p.value(item)) {
                by_scenario.insert(*scenario, value);
            }
        }

        let predicted = *by_scenario
            .get(&Scenario::Base)
            .ok_or_else(|| skip(format!("no {} projection", item)))?;
        let low = by_scenario.values().copied().min().unwrap_or(predicted);
        let high = by_scenario.values().copied().max().unwrap_or(predicted);

        let actual = target.actual.value;
        let abs_error = (predicted - actual).abs();
        let pct_error = safe_div(abs_error, actual.abs()).map(|v| v.round_dp(METRIC_PRECISION));

        Ok(BacktestSample {
            ticker: view.ticker().to_string(),
            prediction_type,
            as_of_period_end: target.prior.period_end,
            target_period_end: target.actual.period_end,
            cutoff: cutoff.bound(),
            predicted,
            actual,
            abs_error,
            pct_error,
            directional_correct: (predicted - prior_value).cmp(&Decimal::ZERO)
                == (actual - prior_value).cmp(&Decimal::ZERO),
            within_interval: low <= actual && actual <= high,
        })
    }
}

/// Earliest filing date that reported anything for each period end.
fn first_filing_dates(parsed: &[ParsedFact]) -> BTreeMap<NaiveDate, NaiveDate> {
    let mut first: BTreeMap<NaiveDate, NaiveDate> = BTreeMap::new();
    for fact in parsed {
        first
            .entry(fact.period_end)
            .and_modify(|filed| *filed = (*filed).min(fact.filed_at))
            .or_insert(fact.filed_at);
    }
    first
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::test_support::{date, parsed};
    use crate::normalizer::FactNormalizer;
    use crate::residuals::ResidualDeriver;
    use chrono::{Datelike, Days, Months};
    use rust_decimal_macros::dec;

    fn quarter(end: NaiveDate) -> Option<NaiveDate> {
        end.checked_sub_months(Months::new(2)).and_then(|d| d.with_day(1))
    }

    fn filings(revenues: &[Decimal]) -> Vec<ParsedFact> {
        let mut end = date(2023, 3, 31);
        let mut facts = Vec::new();
        for (i, revenue) in revenues.iter().enumerate() {
            let filed = end + Days::new(30);
            facts.push(parsed(i as u64 + 1, "us-gaap:Revenues", quarter(end), end, *revenue, filed));
            end = crate::utils::add_months_month_end(end, 3).unwrap();
        }
        facts
    }

    fn backtest(parsed: &[ParsedFact]) -> BacktestReport {
        let config = CoreConfig::default();
        let normalized = FactNormalizer::new(&config).normalize("acme", parsed);
        let history = CanonicalHistory::from_facts(
            &normalized.ticker,
            ResidualDeriver::derive(normalized.facts),
        );
        BacktestHarness::new(&config).run("acme", parsed, &history, PredictionType::Revenue)
    }

    #[test]
    fn test_scores_every_target_after_the_first_period() {
        let report = backtest(&filings(&[dec!(100), dec!(110), dec!(121), dec!(133.1), dec!(146.41)]));
        assert_eq!(report.samples.len(), 4);
        assert!(report.skipped.is_empty());

        let first = &report.samples[0];
        assert_eq!(first.as_of_period_end, date(2023, 3, 31));
        assert_eq!(first.target_period_end, date(2023, 6, 30));
        // Only one period visible: default growth.
        assert_eq!(first.predicted, dec!(102));
        assert_eq!(first.abs_error, dec!(8));
        assert!(first.directional_correct);
        assert!(!first.within_interval);

        for sample in &report.samples[1..] {
            assert!(sample.abs_error < dec!(0.01), "{:?}", sample);
            assert!(sample.within_interval);
        }
        assert_eq!(report.metrics.sample_count, 4);
        assert_eq!(report.metrics.directional_accuracy, Some(dec!(1)));
        assert_eq!(report.metrics.interval_coverage, Some(dec!(0.75)));
    }

    #[test]
    fn test_cutoff_precedes_target_availability() {
        let parsed = filings(&[dec!(100), dec!(110), dec!(121), dec!(133.1)]);
        let report = backtest(&parsed);
        for sample in &report.samples {
            let target_filed = parsed
                .iter()
                .filter(|f| f.period_end == sample.target_period_end)
                .map(|f| f.filed_at)
                .min()
                .unwrap();
            assert!(sample.cutoff <= target_filed);
            assert!(sample.as_of_period_end < sample.cutoff);
        }
    }

    #[test]
    fn test_future_filings_do_not_change_past_samples() {
        let parsed = filings(&[dec!(100), dec!(110), dec!(121), dec!(133.1)]);
        let before = backtest(&parsed);

        let mut extended = parsed.clone();
        let mut later = filings(&[dec!(100), dec!(110), dec!(121), dec!(133.1), dec!(50), dec!(500)]);
        extended.extend(later.drain(4..));
        let after = backtest(&extended);

        assert_eq!(after.samples.len(), before.samples.len() + 2);
        assert_eq!(&after.samples[..before.samples.len()], &before.samples[..]);
    }

    #[test]
    fn test_gap_in_history_is_skipped() {
        let mut parsed = filings(&[dec!(100), dec!(110), dec!(121), dec!(133.1)]);
        // Q2 was only ever reported late, after Q3's filing.
        parsed[1].filed_at = date(2024, 1, 15);
        let report = backtest(&parsed);
        assert!(report
            .skipped
            .iter()
            .any(|s| s.target_period_end == date(2023, 9, 30)));
    }

    #[test]
    fn test_zero_actual_excluded_from_mape() {
        let sample = |actual: Decimal, pct: Option<Decimal>| BacktestSample {
            ticker: "ACME".to_string(),
            prediction_type: PredictionType::NetIncome,
            as_of_period_end: date(2024, 3, 31),
            target_period_end: date(2024, 6, 30),
            cutoff: date(2024, 7, 30),
            predicted: dec!(10),
            actual,
            abs_error: (dec!(10) - actual).abs(),
            pct_error: pct,
            directional_correct: true,
            within_interval: false,
        };
        let metrics = BacktestMetrics::from_samples(&[
            sample(dec!(0), None),
            sample(dec!(20), Some(dec!(0.5))),
        ]);
        assert_eq!(metrics.sample_count, 2);
        assert_eq!(metrics.mape, Some(dec!(0.5)));
        assert_eq!(metrics.mape_sample_count, 1);
        assert_eq!(metrics.mae, Some(dec!(10)));
        assert_eq!(metrics.interval_coverage, Some(dec!(0)));
    }

    #[test]
    fn test_empty_report_has_no_metrics() {
        let report = backtest(&filings(&[dec!(100)]));
        assert!(report.samples.is_empty());
        assert_eq!(report.metrics.mae, None);
        assert_eq!(report.metrics.directional_accuracy, None);
    }

    #[test]
    fn test_prediction_type_parsing() {
        assert_eq!("net_income".parse::<PredictionType>().unwrap(), PredictionType::NetIncome);
        assert!("ebit".parse::<PredictionType>().is_err());
    }
}
