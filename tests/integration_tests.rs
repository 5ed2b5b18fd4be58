use anyhow::Context;
use canonical_financials::*;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;

const FIXTURE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/acme_parsed_facts.csv");

#[derive(Debug, Deserialize)]
struct FixtureRow {
    source_fact_id: u64,
    source_tag: String,
    statement_hint: Option<String>,
    context_ref: String,
    unit_ref: Option<String>,
    period_start: Option<NaiveDate>,
    period_end: NaiveDate,
    period_type: Option<PeriodType>,
    value: String,
    scale: Option<String>,
    decimals: Option<String>,
    sign_context: SignContext,
    segment_axes: String,
    source_path: String,
    filed_at: NaiveDate,
    accession: Option<String>,
}

impl FixtureRow {
    fn into_parsed(self) -> anyhow::Result<ParsedFact> {
        let value: Decimal = self
            .value
            .parse()
            .with_context(|| format!("fact {} has value '{}'", self.source_fact_id, self.value))?;
        Ok(ParsedFact {
            source_tag: self.source_tag,
            statement_hint: self.statement_hint,
            context_ref: self.context_ref,
            unit_ref: self.unit_ref,
            period_start: self.period_start,
            period_end: self.period_end,
            period_type: self.period_type,
            value,
            scale: self.scale,
            decimals: self.decimals,
            sign_context: self.sign_context,
            segment_axes: self
                .segment_axes
                .split(';')
                .filter(|axis| !axis.is_empty())
                .map(str::to_string)
                .collect(),
            source_path: self.source_path,
            source_fact_id: self.source_fact_id,
            filed_at: self.filed_at,
            accession: self.accession,
        })
    }
}

fn load_fixture() -> anyhow::Result<Vec<ParsedFact>> {
    let mut reader = csv::Reader::from_path(FIXTURE).context("opening parsed fact fixture")?;
    let mut facts = Vec::new();
    for row in reader.deserialize::<FixtureRow>() {
        facts.push(row?.into_parsed()?);
    }
    Ok(facts)
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

#[test]
fn test_fixture_materializes_cleanly() -> anyhow::Result<()> {
    let parsed = load_fixture()?;
    assert_eq!(parsed.len(), 90);

    let result = materialize_ticker("acme", &parsed, &CoreConfig::nightly())?;
    let history = result.history();

    assert_eq!(result.ticker, "ACME");
    assert_eq!(history.period_ends().count(), 7);
    assert_eq!(history.value(date(2024, 6, 30), LineItem::Revenue), Some(dec!(1210)));
    assert_eq!(history.value(date(2024, 6, 30), LineItem::Cff), Some(dec!(-40)));
    assert_eq!(history.value(date(2023, 3, 31), LineItem::Capex), Some(dec!(-30)));
    assert_eq!(history.value(date(2023, 3, 31), LineItem::EpsDiluted), Some(dec!(1.00)));
    assert_eq!(history.value(date(2023, 6, 30), LineItem::Revenue), Some(dec!(1050)));

    let gross_profit = history
        .fact(date(2023, 3, 31), LineItem::GrossProfit)
        .context("gross profit should be derived")?;
    assert_eq!(gross_profit.value, dec!(400));
    assert!(gross_profit.is_derived());
    assert_eq!(history.value(date(2023, 3, 31), LineItem::Fcf), Some(dec!(90)));

    for report in &result.tie_reports {
        assert_eq!(report.status, TieStatus::Ok, "{:?}", report);
    }
    let q1 = result
        .tie_reports
        .iter()
        .find(|r| r.period_end == date(2023, 3, 31))
        .context("missing Q1 tie report")?;
    assert_eq!(q1.bs_tie, Some(dec!(0)));
    assert_eq!(q1.cf_tie, Some(dec!(0)));
    Ok(())
}

#[test]
fn test_drop_reasons_are_counted() -> anyhow::Result<()> {
    let result = materialize_ticker("ACME", &load_fixture()?, &CoreConfig::default())?;
    assert_eq!(result.dropped_count, 5);

    let reason_of = |id: u64| {
        result
            .dropped
            .iter()
            .find(|d| d.source_fact_id == id)
            .map(|d| d.reason.clone())
    };
    assert!(matches!(reason_of(3), Some(FactRejection::DisallowedSegment { .. })));
    assert!(matches!(reason_of(4), Some(FactRejection::Unmapped { .. })));
    assert!(matches!(
        reason_of(19),
        Some(FactRejection::LostTieBreak { winner: 18, .. })
    ));
    Ok(())
}

#[test]
fn test_materialization_is_deterministic_and_idempotent() -> anyhow::Result<()> {
    let parsed = load_fixture()?;
    let config = CoreConfig::default();

    let first = materialize_ticker("ACME", &parsed, &config)?;
    let again = materialize_ticker("ACME", &parsed, &config)?;
    assert_eq!(first, again);

    let mut reversed = parsed.clone();
    reversed.reverse();
    assert_eq!(materialize_ticker("acme", &reversed, &config)?, first);

    let store = CanonicalStore::new(config)?;
    store.materialize("ACME", parsed.clone())?;
    store.materialize("ACME", parsed)?;
    let stored = store.list_canonical_facts("ACME", &PeriodFilter::all())?;
    assert_eq!(stored, first.facts);
    Ok(())
}

#[test]
fn test_every_slot_holds_one_allowed_row() -> anyhow::Result<()> {
    let result = materialize_ticker("ACME", &load_fixture()?, &CoreConfig::default())?;
    let mut seen = std::collections::BTreeSet::new();
    for fact in &result.facts {
        assert!(is_allowed(fact.statement, fact.line_item));
        assert_eq!(fact.unit, fact.line_item.unit());
        assert_eq!(fact.period_type, fact.line_item.period_type());
        assert!(seen.insert((fact.period_end, fact.statement, fact.line_item)));
    }
    Ok(())
}

#[test]
fn test_comparatives_and_restatements_carry_availability() -> anyhow::Result<()> {
    let parsed = load_fixture()?;
    let history = materialize_ticker("ACME", &parsed, &CoreConfig::default())?.history();

    let q1_revenue = history
        .fact(date(2023, 3, 31), LineItem::Revenue)
        .context("missing Q1 revenue")?;
    assert_eq!(q1_revenue.source_fact_ids(), vec![75]);
    assert_eq!(q1_revenue.available_at, date(2023, 5, 5));

    let restated = history
        .fact(date(2023, 9, 30), LineItem::NetIncome)
        .context("missing Q3 net income")?;
    assert_eq!(restated.value, dec!(112));
    assert_eq!(restated.available_at, date(2024, 5, 3));

    let config = CoreConfig::default();
    let before = PointInTimeView::from_parsed(
        "ACME",
        &parsed,
        Cutoff::available_before(date(2024, 5, 3)),
        &config,
    );
    assert_eq!(
        before.history().value(date(2023, 9, 30), LineItem::NetIncome),
        Some(dec!(110))
    );
    assert!(before.is_sealed());

    // Filtering the materialized history hides the restated row instead of
    // showing a value nobody had yet.
    let filtered = PointInTimeView::new(&history, Cutoff::available_before(date(2024, 5, 3)));
    assert_eq!(filtered.history().value(date(2023, 9, 30), LineItem::NetIncome), None);
    assert!(filtered.is_sealed());
    Ok(())
}

#[test]
fn test_strict_mode_rejects_unbalanced_period() -> anyhow::Result<()> {
    let mut parsed = load_fixture()?;
    let assets = parsed
        .iter_mut()
        .find(|f| f.source_tag == "us-gaap:Assets" && f.period_end == date(2023, 6, 30))
        .context("missing Q2 assets")?;
    assets.value = dec!(2110);

    let lenient = materialize_ticker("ACME", &parsed, &CoreConfig::nightly())?;
    let failing: Vec<_> = lenient.failing_periods().collect();
    assert_eq!(failing.len(), 1);
    assert_eq!(failing[0].period_end, date(2023, 6, 30));
    assert_eq!(failing[0].bs_tie, Some(dec!(10)));

    match materialize_ticker("ACME", &parsed, &CoreConfig::weekly()) {
        Err(CanonicalError::TieViolation { period_end, bs_tie, .. }) => {
            assert_eq!(period_end, date(2023, 6, 30));
            assert_eq!(bs_tie, dec!(10));
        }
        other => panic!("expected a tie violation, got {:?}", other.map(|m| m.ticker)),
    }
    Ok(())
}

#[test]
fn test_drivers_from_fixture() -> anyhow::Result<()> {
    let store = CanonicalStore::new(CoreConfig::default())?;
    store.materialize("ACME", load_fixture()?)?;

    let drivers = store.drivers_as_of("ACME", date(2024, 8, 2))?;
    assert_eq!(drivers.as_of_period_end, Some(date(2024, 6, 30)));
    assert_eq!(drivers.cadence, PeriodLength::Quarter);

    let growth = drivers.value(DriverKind::RevenueGrowth);
    assert!(growth > dec!(0.03) && growth < dec!(0.035), "growth {}", growth);

    let tax = drivers.get(DriverKind::TaxRate).context("tax rate driver")?;
    assert!(tax.is_default);
    assert!(tax.fallback_reason.is_some());
    assert!(drivers.defaulted().contains(&DriverKind::TaxRate));

    // A day earlier the latest quarter was not yet public.
    let earlier = store.drivers_as_of("ACME", date(2024, 8, 1))?;
    assert_eq!(earlier.as_of_period_end, Some(date(2024, 3, 31)));
    Ok(())
}

#[test]
fn test_forecast_scenarios_are_ordered() -> anyhow::Result<()> {
    let store = CanonicalStore::new(CoreConfig::default())?;
    store.materialize("ACME", load_fixture()?)?;

    let base = store.forecast("ACME", Scenario::Base, 4)?;
    let bull = store.forecast("ACME", Scenario::Bull, 4)?;
    let bear = store.forecast("ACME", Scenario::Bear, 4)?;

    assert_eq!(base.len(), 4);
    assert_eq!(base[0].period_end, date(2024, 9, 30));
    assert_eq!(base[3].period_end, date(2025, 6, 30));

    for ((b, up), down) in base.iter().zip(&bull).zip(&bear) {
        let revenue = |p: &ForecastPeriod| p.value(LineItem::Revenue).unwrap_or_default();
        assert!(revenue(up) >= revenue(b));
        assert!(revenue(b) >= revenue(down));
    }
    assert!(base[0].value(LineItem::Revenue).unwrap_or_default() > dec!(1210));

    let all: Vec<ForecastPeriod> = base.into_iter().chain(bull).chain(bear).collect();
    let bands = summarize_bands(&all);
    assert!(bands.iter().all(|b| b.low <= b.high));
    Ok(())
}

#[test]
fn test_backtest_scores_every_quarter_without_leakage() -> anyhow::Result<()> {
    let parsed = load_fixture()?;
    let store = CanonicalStore::new(CoreConfig::default())?;
    store.materialize("ACME", parsed.clone())?;

    let report = store.backtest("ACME", PredictionType::Revenue)?;
    assert_eq!(report.samples.len(), 5);
    assert!(report.skipped.is_empty());
    assert_eq!(report.metrics.sample_count, 5);
    assert!(report.metrics.mape.is_some());

    for sample in &report.samples {
        let first_filed = parsed
            .iter()
            .filter(|f| f.period_end == sample.target_period_end)
            .map(|f| f.filed_at)
            .min()
            .context("target without filings")?;
        assert!(sample.cutoff <= first_filed);
        assert!(sample.as_of_period_end < sample.target_period_end);
    }

    // Dropping everything filed from 2024 onwards must not change any
    // prediction made before then.
    let truncated: Vec<ParsedFact> = parsed
        .iter()
        .filter(|f| f.filed_at < date(2024, 1, 1))
        .cloned()
        .collect();
    let history = materialize_ticker("ACME", &truncated, &CoreConfig::default())?.history();
    let earlier = BacktestHarness::new(&CoreConfig::default()).run(
        "ACME",
        &truncated,
        &history,
        PredictionType::Revenue,
    );
    assert_eq!(earlier.samples.len(), 2);
    assert_eq!(&report.samples[..2], &earlier.samples[..]);
    Ok(())
}

#[test]
fn test_backtest_other_prediction_types() -> anyhow::Result<()> {
    let store = CanonicalStore::new(CoreConfig::default())?;
    store.materialize("ACME", load_fixture()?)?;

    for prediction_type in PredictionType::ALL {
        let report = store.backtest("ACME", prediction_type)?;
        assert_eq!(report.prediction_type, prediction_type);
        assert_eq!(
            report.samples.len() + report.skipped.len(),
            5,
            "{}",
            prediction_type
        );
    }
    Ok(())
}

#[test]
fn test_schema_generation() -> anyhow::Result<()> {
    let schema_json = ParsedFact::schema_as_json()?;
    assert!(schema_json.contains("source_tag"));
    assert!(schema_json.contains("filed_at"));
    assert!(schema_json.contains("segment_axes"));

    let parsed = load_fixture()?;
    let round_trip: Vec<ParsedFact> = serde_json::from_str(&serde_json::to_string(&parsed)?)?;
    assert_eq!(round_trip, parsed);
    Ok(())
}
