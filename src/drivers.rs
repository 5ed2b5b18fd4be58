//! Forecast drivers extracted from a trailing window of comparable periods.
//!
//! Extraction never fails: a driver without enough history falls back to its
//! documented default and is flagged `is_default` with the reason recorded.
//! Every computed driver lists the `(line_item, period_end)` rows it read.

use crate::config::CoreConfig;
use crate::history::{CanonicalHistory, PointInTimeView};
use crate::residuals::PeriodRows;
use crate::schema::{CanonicalFact, LineItem};
use crate::utils::{compound_growth, mean, months_between, safe_div, PeriodLength};
use chrono::NaiveDate;
use log::debug;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const DRIVER_PRECISION: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    RevenueGrowth,
    GrossMargin,
    OperatingMargin,
    NetMargin,
    CogsPct,
    RdPct,
    SgaPct,
    TaxRate,
    CapexPct,
    DaPct,
    NwcPct,
    FcfMargin,
    InterestRate,
    Shares,
}

/// How a scenario perturbs a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverClass {
    Growth,
    /// Higher is better for the business.
    Margin,
    /// Lower is better for the business.
    CostRatio,
    /// Not perturbed by scenarios.
    Neutral,
}

impl DriverKind {
    pub const ALL: [DriverKind; 14] = [
        DriverKind::RevenueGrowth,
        DriverKind::GrossMargin,
        DriverKind::OperatingMargin,
        DriverKind::NetMargin,
        DriverKind::CogsPct,
        DriverKind::RdPct,
        DriverKind::SgaPct,
        DriverKind::TaxRate,
        DriverKind::CapexPct,
        DriverKind::DaPct,
        DriverKind::NwcPct,
        DriverKind::FcfMargin,
        DriverKind::InterestRate,
        DriverKind::Shares,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RevenueGrowth => "revenue_growth",
            Self::GrossMargin => "gross_margin",
            Self::OperatingMargin => "operating_margin",
            Self::NetMargin => "net_margin",
            Self::CogsPct => "cogs_pct",
            Self::RdPct => "rd_pct",
            Self::SgaPct => "sga_pct",
            Self::TaxRate => "tax_rate",
            Self::CapexPct => "capex_pct",
            Self::DaPct => "da_pct",
            Self::NwcPct => "nwc_pct",
            Self::FcfMargin => "fcf_margin",
            Self::InterestRate => "interest_rate",
            Self::Shares => "shares",
        }
    }

    pub fn class(&self) -> DriverClass {
        match self {
            Self::RevenueGrowth => DriverClass::Growth,
            Self::GrossMargin | Self::OperatingMargin | Self::NetMargin | Self::FcfMargin => {
                DriverClass::Margin
            }
            Self::CogsPct | Self::RdPct | Self::SgaPct | Self::CapexPct | Self::NwcPct => {
                DriverClass::CostRatio
            }
            Self::TaxRate | Self::DaPct | Self::InterestRate | Self::Shares => DriverClass::Neutral,
        }
    }

    /// Per-period default. The interest rate default is 5% a year, scaled to
    /// the cadence.
    pub fn default_value(&self, cadence: PeriodLength) -> Decimal {
        match self {
            Self::RevenueGrowth => dec!(0.02),
            Self::GrossMargin => dec!(0.40),
            Self::OperatingMargin => dec!(0.15),
            Self::NetMargin => dec!(0.10),
            Self::CogsPct => dec!(0.60),
            Self::RdPct => dec!(0.05),
            Self::SgaPct => dec!(0.10),
            Self::TaxRate => dec!(0.21),
            Self::CapexPct => dec!(0.05),
            Self::DaPct => dec!(0.04),
            Self::NwcPct => dec!(0.10),
            Self::FcfMargin => dec!(0.10),
            Self::InterestRate => {
                let months = cadence.months().unwrap_or(3);
                (dec!(0.05) * Decimal::from(months) / dec!(12)).round_dp(DRIVER_PRECISION)
            }
            Self::Shares => Decimal::ZERO,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::RevenueGrowth => "Compound per-period revenue growth across the window",
            Self::GrossMargin => "Average gross_profit / revenue",
            Self::OperatingMargin => "Average operating_income / revenue",
            Self::NetMargin => "Average net_income / revenue",
            Self::CogsPct => "Average cogs / revenue",
            Self::RdPct => "Average r_and_d / revenue",
            Self::SgaPct => "Average sga / revenue",
            Self::TaxRate => "Average income_tax_expense / pre_tax_income (positive pre-tax only)",
            Self::CapexPct => "Average |capex| / revenue",
            Self::DaPct => "Average depreciation_amortization / revenue",
            Self::NwcPct => "Average (accounts_receivable + inventory - accounts_payable) / revenue",
            Self::FcfMargin => "Average fcf / revenue",
            Self::InterestRate => "Average interest_expense / (debt_current + debt_long_term)",
            Self::Shares => "Most recent diluted, outstanding or basic share count",
        }
    }
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverSource {
    pub line_item: LineItem,
    pub period_end: NaiveDate,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Driver {
    pub name: String,
    pub value: Decimal,
    /// Period ends of the comparable window the driver was computed over.
    pub window: Vec<NaiveDate>,
    pub is_default: bool,
    pub description: String,
    pub sources: Vec<DriverSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverSet {
    pub ticker: String,
    /// Latest period end visible to the extraction.
    pub as_of_period_end: Option<NaiveDate>,
    /// Exclusive availability bound of the view the drivers came from.
    pub cutoff: NaiveDate,
    /// Reporting length of the latest revenue period.
    pub cadence: PeriodLength,
    pub drivers: BTreeMap<DriverKind, Driver>,
}

impl DriverSet {
    pub fn get(&self, kind: DriverKind) -> Option<&Driver> {
        self.drivers.get(&kind)
    }

    pub fn value(&self, kind: DriverKind) -> Decimal {
        self.drivers
            .get(&kind)
            .map(|d| d.value)
            .unwrap_or_else(|| kind.default_value(self.cadence))
    }

    pub fn defaulted(&self) -> Vec<DriverKind> {
        self.drivers
            .iter()
            .filter(|(_, d)| d.is_default)
            .map(|(kind, _)| *kind)
            .collect()
    }
}

/// One period's contribution to a ratio driver.
struct Observation {
    numerator: Decimal,
    denominator: Decimal,
    sources: Vec<DriverSource>,
}

pub fn period_length(fact: &CanonicalFact) -> PeriodLength {
    match fact.period_start {
        Some(start) => PeriodLength::classify(start, fact.period_end),
        None => PeriodLength::Other,
    }
}

pub struct DriverExtractor {
    window: usize,
}

impl DriverExtractor {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
        }
    }

    pub fn from_config(config: &CoreConfig) -> Self {
        Self::new(config.driver_window)
    }

    pub fn extract(&self, view: &PointInTimeView) -> DriverSet {
        debug_assert!(
            view.is_sealed(),
            "point-in-time view contains rows past its cutoff"
        );
        let history = view.history();

        let revenue = history.series(LineItem::Revenue);
        let cadence = revenue
            .last()
            .map(|f| period_length(f))
            .unwrap_or(PeriodLength::Quarter);
        let comparable: Vec<&CanonicalFact> = revenue
            .into_iter()
            .filter(|f| period_length(f) == cadence)
            .collect();
        let skip = comparable.len().saturating_sub(self.window);
        let window: Vec<&CanonicalFact> = comparable[skip..].to_vec();
        let window_dates: Vec<NaiveDate> = window.iter().map(|f| f.period_end).collect();

        let mut drivers = BTreeMap::new();
        for kind in DriverKind::ALL {
            let driver = match kind {
                DriverKind::RevenueGrowth => revenue_growth(&window, cadence),
                DriverKind::Shares => latest_shares(history),
                _ => self.ratio(kind, history, &window),
            };
            let driver = driver.unwrap_or_else(|reason| Driver {
                name: kind.as_str().to_string(),
                value: kind.default_value(cadence),
                window: Vec::new(),
                is_default: true,
                description: kind.description().to_string(),
                sources: Vec::new(),
                fallback_reason: Some(reason),
            });
            drivers.insert(
                kind,
                Driver {
                    window: window_dates.clone(),
                    ..driver
                },
            );
        }

        let set = DriverSet {
            ticker: view.ticker().to_string(),
            as_of_period_end: history.latest_period_end(),
            cutoff: view.cutoff().bound(),
            cadence,
            drivers,
        };
        debug!(
            "{}: extracted drivers over {} periods, {} defaulted",
            set.ticker,
            window_dates.len(),
            set.defaulted().len()
        );
        set
    }

    fn ratio(
        &self,
        kind: DriverKind,
        history: &CanonicalHistory,
        window: &[&CanonicalFact],
    ) -> Result<Driver, String> {
        let mut ratios = Vec::new();
        let mut sources = Vec::new();

        for revenue in window {
            let Some(rows) = history.period(revenue.period_end) else {
                continue;
            };
            let Some(obs) = observe(kind, rows, revenue) else {
                continue;
            };
            if let Some(ratio) = safe_div(obs.numerator, obs.denominator) {
                ratios.push(ratio);
                sources.extend(obs.sources);
            }
        }

        let value = mean(&ratios).ok_or_else(|| "no_eligible_periods".to_string())?;
        Ok(Driver {
            name: kind.as_str().to_string(),
            value: value.round_dp(DRIVER_PRECISION),
            window: Vec::new(),
            is_default: false,
            description: kind.description().to_string(),
            sources,
            fallback_reason: None,
        })
    }
}

fn source(fact: &CanonicalFact, note: &str) -> DriverSource {
    DriverSource {
        line_item: fact.line_item,
        period_end: fact.period_end,
        note: note.to_string(),
    }
}

/// A flow row covering the same span as the period's revenue.
fn matching_flow<'r>(
    rows: &'r PeriodRows,
    line_item: LineItem,
    revenue: &CanonicalFact,
) -> Option<&'r CanonicalFact> {
    rows.get(&line_item)
        .filter(|f| f.period_start == revenue.period_start)
}

fn over_revenue(fact: &CanonicalFact, value: Decimal, revenue: &CanonicalFact) -> Option<Observation> {
    if revenue.value <= Decimal::ZERO {
        return None;
    }
    Some(Observation {
        numerator: value,
        denominator: revenue.value,
        sources: vec![source(fact, "numerator"), source(revenue, "denominator")],
    })
}

fn observe(kind: DriverKind, rows: &PeriodRows, revenue: &CanonicalFact) -> Option<Observation> {
    let flow_over_revenue = |item: LineItem| {
        let fact = matching_flow(rows, item, revenue)?;
        over_revenue(fact, fact.value, revenue)
    };

    match kind {
        DriverKind::GrossMargin => flow_over_revenue(LineItem::GrossProfit),
        DriverKind::OperatingMargin => flow_over_revenue(LineItem::OperatingIncome),
        DriverKind::NetMargin => flow_over_revenue(LineItem::NetIncome),
        DriverKind::CogsPct => flow_over_revenue(LineItem::Cogs),
        DriverKind::RdPct => flow_over_revenue(LineItem::RAndD),
        DriverKind::SgaPct => flow_over_revenue(LineItem::Sga),
        DriverKind::DaPct => flow_over_revenue(LineItem::DepreciationAmortization),
        DriverKind::FcfMargin => flow_over_revenue(LineItem::Fcf),
        DriverKind::CapexPct => {
            let capex = matching_flow(rows, LineItem::Capex, revenue)?;
            over_revenue(capex, capex.value.abs(), revenue)
        }
        DriverKind::TaxRate => {
            let tax = matching_flow(rows, LineItem::IncomeTaxExpense, revenue)?;
            let pre_tax = matching_flow(rows, LineItem::PreTaxIncome, revenue)?;
            if pre_tax.value <= Decimal::ZERO {
                return None;
            }
            Some(Observation {
                numerator: tax.value,
                denominator: pre_tax.value,
                sources: vec![source(tax, "numerator"), source(pre_tax, "denominator")],
            })
        }
        DriverKind::NwcPct => {
            let receivables = rows.get(&LineItem::AccountsReceivable)?;
            let mut numerator = receivables.value;
            let mut sources = vec![source(receivables, "numerator")];
            if let Some(inventory) = rows.get(&LineItem::Inventory) {
                numerator += inventory.value;
                sources.push(source(inventory, "numerator"));
            }
            if let Some(payables) = rows.get(&LineItem::AccountsPayable) {
                numerator -= payables.value;
                sources.push(source(payables, "numerator, subtracted"));
            }
            let mut obs = over_revenue(receivables, numerator, revenue)?;
            sources.push(source(revenue, "denominator"));
            obs.sources = sources;
            Some(obs)
        }
        DriverKind::InterestRate => {
            let interest = matching_flow(rows, LineItem::InterestExpense, revenue)?;
            let debt: Vec<&CanonicalFact> = [LineItem::DebtCurrent, LineItem::DebtLongTerm]
                .iter()
                .filter_map(|item| rows.get(item))
                .collect();
            let total: Decimal = debt.iter().map(|f| f.value).sum();
            if total <= Decimal::ZERO {
                return None;
            }
            let mut sources = vec![source(interest, "numerator")];
            sources.extend(debt.iter().map(|f| source(f, "denominator")));
            Some(Observation {
                numerator: interest.value,
                denominator: total,
                sources,
            })
        }
        DriverKind::RevenueGrowth | DriverKind::Shares => None,
    }
}

fn revenue_growth(window: &[&CanonicalFact], cadence: PeriodLength) -> Result<Driver, String> {
    let (first, last) = match window {
        [first, .., last] => (*first, *last),
        _ => return Err("fallback_growth: fewer than two comparable periods".to_string()),
    };

    let steps = match cadence.months() {
        Some(months) if months > 0 => {
            let elapsed = months_between(first.period_end, last.period_end).max(0) as u32;
            (elapsed / months).max(1)
        }
        _ => (window.len() - 1) as u32,
    };

    let growth = compound_growth(first.value, last.value, steps)
        .ok_or_else(|| "fallback_growth: non-positive revenue at a window endpoint".to_string())?;

    let mut sources: Vec<DriverSource> = window.iter().map(|f| source(f, "window")).collect();
    if let Some(head) = sources.first_mut() {
        head.note = "start".to_string();
    }
    if let Some(tail) = sources.last_mut() {
        tail.note = "end".to_string();
    }

    Ok(Driver {
        name: DriverKind::RevenueGrowth.as_str().to_string(),
        value: growth.round_dp(DRIVER_PRECISION),
        window: Vec::new(),
        is_default: false,
        description: DriverKind::RevenueGrowth.description().to_string(),
        sources,
        fallback_reason: None,
    })
}

fn latest_shares(history: &CanonicalHistory) -> Result<Driver, String> {
    const PREFERENCE: [LineItem; 3] = [
        LineItem::SharesDiluted,
        LineItem::SharesOutstanding,
        LineItem::SharesBasic,
    ];

    let fact = history
        .periods()
        .rev()
        .find_map(|(_, rows)| {
            PREFERENCE
                .iter()
                .filter_map(|item| rows.get(item))
                .find(|f| f.value > Decimal::ZERO)
        })
        .ok_or_else(|| "no_share_count".to_string())?;

    Ok(Driver {
        name: DriverKind::Shares.as_str().to_string(),
        value: fact.value,
        window: Vec::new(),
        is_default: false,
        description: DriverKind::Shares.description().to_string(),
        sources: vec![source(fact, "most recent")],
        fallback_reason: None,
    })
}
