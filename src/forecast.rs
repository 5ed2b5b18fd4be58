//! Sequential scenario projections from the latest actual period.
//!
//! Each projected period is a pure function of the previous period's emitted
//! line items and the scenario's clamped assumptions. The fold never reads
//! history beyond the base period it started from.

use crate::config::{CoreConfig, MAX_FORECAST_HORIZON};
use crate::drivers::{period_length, DriverClass, DriverKind, DriverSet};
use crate::error::{CanonicalError, Result};
use crate::history::PointInTimeView;
use crate::schema::LineItem;
use crate::utils::{add_months_month_end, clamp, PeriodLength};
use chrono::NaiveDate;
use log::debug;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    Base,
    Bull,
    Bear,
}

impl Scenario {
    pub const ALL: [Scenario; 3] = [Scenario::Base, Scenario::Bull, Scenario::Bear];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Bull => "bull",
            Self::Bear => "bear",
        }
    }

    /// +1 for bull, -1 for bear.
    fn direction(&self) -> Decimal {
        match self {
            Self::Base => Decimal::ZERO,
            Self::Bull => Decimal::ONE,
            Self::Bear => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scenario {
    type Err = CanonicalError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "base" => Ok(Self::Base),
            "bull" => Ok(Self::Bull),
            "bear" => Ok(Self::Bear),
            other => Err(CanonicalError::UnknownScenario(other.to_string())),
        }
    }
}

const MARGIN_SHIFT: Decimal = dec!(0.02);
const GROWTH_SPREAD_FLOOR: Decimal = dec!(0.01);

/// Scenario-adjusted, bounded driver values.
pub fn scenario_assumptions(drivers: &DriverSet, scenario: Scenario) -> BTreeMap<DriverKind, Decimal> {
    let direction = scenario.direction();
    DriverKind::ALL
        .iter()
        .map(|kind| {
            let base = drivers.value(*kind);
            let shifted = match kind.class() {
                DriverClass::Growth => {
                    let spread = (base.abs() * dec!(0.5)).max(GROWTH_SPREAD_FLOOR);
                    base + direction * spread
                }
                DriverClass::Margin => base + direction * MARGIN_SHIFT,
                DriverClass::CostRatio => base - direction * MARGIN_SHIFT,
                DriverClass::Neutral => base,
            };
            (*kind, bound(*kind, shifted))
        })
        .collect()
}

fn bound(kind: DriverKind, value: Decimal) -> Decimal {
    match kind.class() {
        DriverClass::Growth => clamp(value, dec!(-0.5), dec!(1.0)),
        DriverClass::Margin => clamp(value, Decimal::NEGATIVE_ONE, Decimal::ONE),
        DriverClass::CostRatio => clamp(value, Decimal::ZERO, Decimal::ONE),
        DriverClass::Neutral => match kind {
            DriverKind::TaxRate => clamp(value, Decimal::ZERO, dec!(0.5)),
            DriverKind::Shares => value.max(Decimal::ZERO),
            _ => clamp(value, Decimal::ZERO, Decimal::ONE),
        },
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForecastPeriod {
    pub period_end: NaiveDate,
    pub scenario: Scenario,
    /// 1 for the first projected period.
    pub period_index: u32,
    pub values: BTreeMap<LineItem, Decimal>,
    pub assumptions: BTreeMap<String, Decimal>,
}

impl ForecastPeriod {
    pub fn value(&self, line_item: LineItem) -> Option<Decimal> {
        self.values.get(&line_item).copied()
    }
}

/// Low and high across scenarios for one projected period and line item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForecastBand {
    pub period_index: u32,
    pub period_end: NaiveDate,
    pub line_item: LineItem,
    pub low: Decimal,
    pub base: Option<Decimal>,
    pub high: Decimal,
}

pub fn summarize_bands(periods: &[ForecastPeriod]) -> Vec<ForecastBand> {
    let mut bands: BTreeMap<(u32, LineItem), ForecastBand> = BTreeMap::new();
    for period in periods {
        for (item, value) in &period.values {
            let band = bands
                .entry((period.period_index, *item))
                .or_insert_with(|| ForecastBand {
                    period_index: period.period_index,
                    period_end: period.period_end,
                    line_item: *item,
                    low: *value,
                    base: None,
                    high: *value,
                });
            band.low = band.low.min(*value);
            band.high = band.high.max(*value);
            if period.scenario == Scenario::Base {
                band.base = Some(*value);
            }
        }
    }
    bands.into_values().collect()
}

/// Last actual values the projection starts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseState {
    pub period_end: NaiveDate,
    pub cadence: PeriodLength,
    pub revenue: Decimal,
    pub cash: Decimal,
    pub ppe: Decimal,
    pub debt: Decimal,
    /// Working capital at the base period, when its inputs were reported.
    pub nwc: Option<Decimal>,
}

impl BaseState {
    pub fn from_view(view: &PointInTimeView) -> Result<Self> {
        let history = view.history();
        let latest = history
            .latest_period_end()
            .ok_or_else(|| CanonicalError::EmptyHistory(view.ticker().to_string()))?;
        let revenue = history
            .latest(LineItem::Revenue)
            .ok_or(CanonicalError::MissingForecastBase {
                period_end: latest,
                line_item: LineItem::Revenue,
            })?;
        let period_end = revenue.period_end;

        let balance = |item: LineItem| {
            history
                .latest_at_or_before(item, period_end)
                .map(|f| f.value)
        };

        let nwc = history.period(period_end).and_then(|rows| {
            let receivables = rows.get(&LineItem::AccountsReceivable)?.value;
            let inventory = rows.get(&LineItem::Inventory).map(|f| f.value).unwrap_or_default();
            let payables = rows.get(&LineItem::AccountsPayable).map(|f| f.value).unwrap_or_default();
            Some(receivables + inventory - payables)
        });

        Ok(Self {
            period_end,
            cadence: period_length(revenue),
            revenue: revenue.value,
            cash: balance(LineItem::Cash).unwrap_or_default(),
            ppe: balance(LineItem::Ppe).unwrap_or_default(),
            debt: balance(LineItem::DebtCurrent).unwrap_or_default()
                + balance(LineItem::DebtLongTerm).unwrap_or_default(),
            nwc,
        })
    }
}

/// Rolling state carried from one projected period into the next.
#[derive(Debug, Clone)]
struct Carry {
    period_end: NaiveDate,
    revenue: Decimal,
    cash: Decimal,
    ppe: Decimal,
    nwc: Decimal,
}

pub struct ForecastEngine<'a> {
    config: &'a CoreConfig,
}

impl<'a> ForecastEngine<'a> {
    pub fn new(config: &'a CoreConfig) -> Self {
        Self { config }
    }

    /// Every configured scenario over the configured horizon, scenario-major.
    pub fn project(&self, view: &PointInTimeView, drivers: &DriverSet) -> Result<Vec<ForecastPeriod>> {
        let base = BaseState::from_view(view)?;
        let mut out = Vec::new();
        for scenario in &self.config.scenarios {
            out.extend(self.project_from(&base, drivers, *scenario, self.config.forecast_horizon)?);
        }
        Ok(out)
    }

    pub fn project_scenario(
        &self,
        view: &PointInTimeView,
        drivers: &DriverSet,
        scenario: Scenario,
        horizon: u32,
    ) -> Result<Vec<ForecastPeriod>> {
        let base = BaseState::from_view(view)?;
        self.project_from(&base, drivers, scenario, horizon)
    }

    pub fn project_from(
        &self,
        base: &BaseState,
        drivers: &DriverSet,
        scenario: Scenario,
        horizon: u32,
    ) -> Result<Vec<ForecastPeriod>> {
        let assumptions = scenario_assumptions(drivers, scenario);
        let a = |kind: DriverKind| assumptions.get(&kind).copied().unwrap_or_default();
        let step_months = base.cadence.months().unwrap_or(3);

        let mut carry = Carry {
            period_end: base.period_end,
            revenue: base.revenue,
            cash: base.cash,
            ppe: base.ppe,
            nwc: base
                .nwc
                .unwrap_or(base.revenue * a(DriverKind::NwcPct)),
        };

        let named: BTreeMap<String, Decimal> = assumptions
            .iter()
            .map(|(kind, value)| (kind.as_str().to_string(), *value))
            .collect();

        let mut periods = Vec::with_capacity(horizon.min(MAX_FORECAST_HORIZON) as usize);
        for index in 1..=horizon {
            let period_end = add_months_month_end(carry.period_end, step_months).ok_or_else(|| {
                CanonicalError::DateError(format!(
                    "cannot step {} forward by {} months",
                    carry.period_end, step_months
                ))
            })?;

            let overflow = || CanonicalError::ForecastOverflow { period_index: index };
            let mul = |x: Decimal, y: Decimal| x.checked_mul(y).ok_or_else(overflow);
            let div = |x: Decimal, y: Decimal| x.checked_div(y).ok_or_else(overflow);
            let add = |x: Decimal, y: Decimal| x.checked_add(y).ok_or_else(overflow);
            let sub = |x: Decimal, y: Decimal| x.checked_sub(y).ok_or_else(overflow);

            let mut values = BTreeMap::new();
            let mut put = |item: LineItem, value: Decimal| -> Decimal {
                let rounded = item.unit().round(value);
                values.insert(item, rounded);
                rounded
            };

            let revenue = put(
                LineItem::Revenue,
                mul(carry.revenue, Decimal::ONE + a(DriverKind::RevenueGrowth))?,
            );
            let gross_profit = put(LineItem::GrossProfit, mul(revenue, a(DriverKind::GrossMargin))?);
            put(LineItem::Cogs, sub(revenue, gross_profit)?);
            let operating_income = put(
                LineItem::OperatingIncome,
                mul(revenue, a(DriverKind::OperatingMargin))?,
            );
            put(LineItem::OperatingExpenses, sub(gross_profit, operating_income)?);
            let da = put(LineItem::DepreciationAmortization, mul(revenue, a(DriverKind::DaPct))?);
            put(LineItem::Ebitda, add(operating_income, da)?);
            put(LineItem::InterestExpense, mul(base.debt, a(DriverKind::InterestRate))?);

            let net_income = put(LineItem::NetIncome, mul(revenue, a(DriverKind::NetMargin))?);
            let tax_rate = a(DriverKind::TaxRate);
            let pre_tax = put(LineItem::PreTaxIncome, div(net_income, Decimal::ONE - tax_rate)?);
            put(LineItem::IncomeTaxExpense, sub(pre_tax, net_income)?);

            let shares = a(DriverKind::Shares);
            if shares > Decimal::ZERO {
                put(LineItem::EpsDiluted, div(net_income, shares)?);
            }

            let capex = put(LineItem::Capex, -mul(revenue, a(DriverKind::CapexPct))?);
            let nwc = mul(revenue, a(DriverKind::NwcPct))?;
            let cfo = put(LineItem::Cfo, sub(add(net_income, da)?, sub(nwc, carry.nwc)?)?);
            let fcf = put(LineItem::Fcf, add(cfo, capex)?);
            let cash = put(LineItem::Cash, add(carry.cash, fcf)?);
            let ppe = put(LineItem::Ppe, sub(add(carry.ppe, capex.abs())?, da)?);

            periods.push(ForecastPeriod {
                period_end,
                scenario,
                period_index: index,
                values,
                assumptions: named.clone(),
            });

            carry = Carry {
                period_end,
                revenue,
                cash,
                ppe,
                nwc,
            };
        }

        debug!(
            "projected {} {} periods from {}",
            periods.len(),
            scenario,
            base.period_end
        );
        Ok(periods)
    }
}
