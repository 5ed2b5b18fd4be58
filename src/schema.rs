use chrono::NaiveDate;
use rust_decimal::{Decimal, RoundingStrategy};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Statement {
    #[schemars(description = "Period activity: revenue, expenses, earnings (duration facts)")]
    IncomeStatement,

    #[schemars(description = "Point-in-time balances: assets, liabilities, equity (instant facts)")]
    BalanceSheet,

    #[schemars(description = "Period cash movements: operating, investing, financing (duration facts)")]
    CashFlow,
}

impl Statement {
    pub const ALL: [Statement; 3] = [
        Statement::IncomeStatement,
        Statement::BalanceSheet,
        Statement::CashFlow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IncomeStatement => "income_statement",
            Self::BalanceSheet => "balance_sheet",
            Self::CashFlow => "cash_flow",
        }
    }

    /// The only period type a row on this statement may carry.
    pub fn required_period_type(&self) -> PeriodType {
        match self {
            Self::BalanceSheet => PeriodType::Instant,
            Self::IncomeStatement | Self::CashFlow => PeriodType::Duration,
        }
    }

    /// Lenient parse of the upstream parser's statement hint.
    pub fn parse_hint(hint: &str) -> Option<Self> {
        let normalized: String = hint
            .trim()
            .to_ascii_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();

        match normalized.as_str() {
            "incomestatement" | "income" | "is" | "pl" | "profitandloss" | "operations" => {
                Some(Self::IncomeStatement)
            }
            "balancesheet" | "balance" | "bs" | "financialposition" => Some(Self::BalanceSheet),
            "cashflow" | "cashflows" | "cf" | "cashflowstatement" => Some(Self::CashFlow),
            _ => None,
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum PeriodType {
    #[schemars(description = "A balance on a single date")]
    Instant,
    #[schemars(description = "Activity between a start and an end date")]
    Duration,
}

impl fmt::Display for PeriodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instant => f.write_str("instant"),
            Self::Duration => f.write_str("duration"),
        }
    }
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, JsonSchema,
)]
pub enum Unit {
    #[serde(rename = "USD")]
    Usd,
    #[serde(rename = "USDPerShare")]
    UsdPerShare,
    #[serde(rename = "SHARES")]
    Shares,
}

impl Unit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Usd => "USD",
            Self::UsdPerShare => "USDPerShare",
            Self::Shares => "SHARES",
        }
    }

    /// Maps an XBRL `unitRef` to a canonical unit, case-insensitively.
    ///
    /// Absent unit metadata defaults to USD. Returns `None` for units outside
    /// the canonical set (foreign currencies, `pure`, ...).
    pub fn parse_ref(unit_ref: Option<&str>) -> Option<Self> {
        let Some(raw) = unit_ref else {
            return Some(Self::Usd);
        };
        if raw.trim().is_empty() {
            return Some(Self::Usd);
        }

        let upper = raw.trim().to_uppercase();
        let compact: String = upper
            .replace("ISO4217:", "")
            .replace("ISO4217_", "")
            .replace("XBRLI:", "")
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();

        match compact.as_str() {
            "USD" => Some(Self::Usd),
            "USDPERSHARE" | "USDPERSHARES" | "USDSHARES" | "USDSHARE" => Some(Self::UsdPerShare),
            "SHARES" | "SHARE" => Some(Self::Shares),
            _ => None,
        }
    }

    pub fn decimal_places(&self) -> u32 {
        match self {
            Self::Usd => 2,
            Self::UsdPerShare => 4,
            Self::Shares => 0,
        }
    }

    /// Rounding applied to every projected value expressed in this unit.
    pub fn round(&self, value: Decimal) -> Decimal {
        value.round_dp_with_strategy(self.decimal_places(), RoundingStrategy::MidpointAwayFromZero)
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of canonical rows. Every line item belongs to exactly one
/// statement, which fixes its period type and unit.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum LineItem {
    // Income statement
    Revenue,
    Cogs,
    GrossProfit,
    RAndD,
    Sga,
    OperatingExpenses,
    TotalExpenses,
    OperatingIncome,
    InterestExpense,
    PreTaxIncome,
    IncomeTaxExpense,
    NetIncome,
    Ebitda,
    EpsBasic,
    EpsDiluted,
    SharesBasic,
    SharesDiluted,
    SharesOutstanding,

    // Balance sheet
    Assets,
    AssetsCurrent,
    OtherAssetsCurrent,
    Cash,
    ShortTermInvestments,
    AccountsReceivable,
    Inventory,
    Ppe,
    Liabilities,
    LiabilitiesCurrent,
    AccountsPayable,
    DebtCurrent,
    DebtLongTerm,
    Equity,
    LiabilitiesEquity,

    // Cash flow
    Cfo,
    Cfi,
    Cff,
    Capex,
    DepreciationAmortization,
    FxOnCash,
    ChangeInCash,
    Fcf,
}

impl LineItem {
    pub const ALL: [LineItem; 41] = [
        LineItem::Revenue,
        LineItem::Cogs,
        LineItem::GrossProfit,
        LineItem::RAndD,
        LineItem::Sga,
        LineItem::OperatingExpenses,
        LineItem::TotalExpenses,
        LineItem::OperatingIncome,
        LineItem::InterestExpense,
        LineItem::PreTaxIncome,
        LineItem::IncomeTaxExpense,
        LineItem::NetIncome,
        LineItem::Ebitda,
        LineItem::EpsBasic,
        LineItem::EpsDiluted,
        LineItem::SharesBasic,
        LineItem::SharesDiluted,
        LineItem::SharesOutstanding,
        LineItem::Assets,
        LineItem::AssetsCurrent,
        LineItem::OtherAssetsCurrent,
        LineItem::Cash,
        LineItem::ShortTermInvestments,
        LineItem::AccountsReceivable,
        LineItem::Inventory,
        LineItem::Ppe,
        LineItem::Liabilities,
        LineItem::LiabilitiesCurrent,
        LineItem::AccountsPayable,
        LineItem::DebtCurrent,
        LineItem::DebtLongTerm,
        LineItem::Equity,
        LineItem::LiabilitiesEquity,
        LineItem::Cfo,
        LineItem::Cfi,
        LineItem::Cff,
        LineItem::Capex,
        LineItem::DepreciationAmortization,
        LineItem::FxOnCash,
        LineItem::ChangeInCash,
        LineItem::Fcf,
    ];

    pub const fn statement(&self) -> Statement {
        use LineItem::*;
        match self {
            Revenue | Cogs | GrossProfit | RAndD | Sga | OperatingExpenses | TotalExpenses
            | OperatingIncome | InterestExpense | PreTaxIncome | IncomeTaxExpense | NetIncome
            | Ebitda | EpsBasic | EpsDiluted | SharesBasic | SharesDiluted | SharesOutstanding => {
                Statement::IncomeStatement
            }
            Assets | AssetsCurrent | OtherAssetsCurrent | Cash | ShortTermInvestments
            | AccountsReceivable | Inventory | Ppe | Liabilities | LiabilitiesCurrent
            | AccountsPayable | DebtCurrent | DebtLongTerm | Equity | LiabilitiesEquity => {
                Statement::BalanceSheet
            }
            Cfo | Cfi | Cff | Capex | DepreciationAmortization | FxOnCash | ChangeInCash | Fcf => {
                Statement::CashFlow
            }
        }
    }

    pub fn unit(&self) -> Unit {
        match self {
            Self::EpsBasic | Self::EpsDiluted => Unit::UsdPerShare,
            Self::SharesBasic | Self::SharesDiluted | Self::SharesOutstanding => Unit::Shares,
            _ => Unit::Usd,
        }
    }

    pub fn period_type(&self) -> PeriodType {
        self.statement().required_period_type()
    }

    pub fn as_str(&self) -> &'static str {
        use LineItem::*;
        match self {
            Revenue => "revenue",
            Cogs => "cogs",
            GrossProfit => "gross_profit",
            RAndD => "r_and_d",
            Sga => "sga",
            OperatingExpenses => "operating_expenses",
            TotalExpenses => "total_expenses",
            OperatingIncome => "operating_income",
            InterestExpense => "interest_expense",
            PreTaxIncome => "pre_tax_income",
            IncomeTaxExpense => "income_tax_expense",
            NetIncome => "net_income",
            Ebitda => "ebitda",
            EpsBasic => "eps_basic",
            EpsDiluted => "eps_diluted",
            SharesBasic => "shares_basic",
            SharesDiluted => "shares_diluted",
            SharesOutstanding => "shares_outstanding",
            Assets => "assets",
            AssetsCurrent => "assets_current",
            OtherAssetsCurrent => "other_assets_current",
            Cash => "cash",
            ShortTermInvestments => "short_term_investments",
            AccountsReceivable => "accounts_receivable",
            Inventory => "inventory",
            Ppe => "ppe",
            Liabilities => "liabilities",
            LiabilitiesCurrent => "liabilities_current",
            AccountsPayable => "accounts_payable",
            DebtCurrent => "debt_current",
            DebtLongTerm => "debt_long_term",
            Equity => "equity",
            LiabilitiesEquity => "liabilities_equity",
            Cfo => "cfo",
            Cfi => "cfi",
            Cff => "cff",
            Capex => "capex",
            DepreciationAmortization => "depreciation_amortization",
            FxOnCash => "fx_on_cash",
            ChangeInCash => "change_in_cash",
            Fcf => "fcf",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|item| item.as_str() == name)
    }
}

impl fmt::Display for LineItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a `(statement, line_item)` pair is in the canonical schema.
pub fn is_allowed(statement: Statement, line_item: LineItem) -> bool {
    line_item.statement() == statement
}

/// Rows of the allowed `(statement, line_item, period_type, unit)` table.
pub fn allowed_rows() -> impl Iterator<Item = (Statement, LineItem, PeriodType, Unit)> {
    LineItem::ALL
        .iter()
        .map(|item| (item.statement(), *item, item.period_type(), item.unit()))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SignContext {
    #[default]
    #[schemars(description = "Value is presented with its natural sign")]
    Normal,
    #[schemars(description = "iXBRL sign=\"-\": the displayed value must be negated before use")]
    Negated,
}

/// A raw fact as emitted by the upstream filing parser. Never mutated here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
pub struct ParsedFact {
    #[schemars(description = "Source taxonomy tag, e.g. 'us-gaap:Revenues'")]
    pub source_tag: String,

    #[serde(default)]
    #[schemars(description = "Statement the parser believes the fact belongs to, if any")]
    pub statement_hint: Option<String>,

    #[schemars(description = "XBRL contextRef identifier")]
    pub context_ref: String,

    #[serde(default)]
    #[schemars(description = "XBRL unitRef, e.g. 'iso4217:USD'. Absent means USD.")]
    pub unit_ref: Option<String>,

    #[serde(default)]
    pub period_start: Option<NaiveDate>,

    pub period_end: NaiveDate,

    #[serde(default)]
    #[schemars(description = "Period type stated by the fact's own context, if it states one")]
    pub period_type: Option<PeriodType>,

    #[schemars(description = "Displayed numeric value before scaling")]
    pub value: Decimal,

    #[serde(default)]
    #[schemars(description = "Power-of-ten scale as written in the filing ('3', '6', ...)")]
    pub scale: Option<String>,

    #[serde(default)]
    #[schemars(description = "XBRL decimals attribute ('-6', '2', 'INF')")]
    pub decimals: Option<String>,

    #[serde(default)]
    pub sign_context: SignContext,

    #[serde(default)]
    #[schemars(description = "Dimension axes present on the context's segment")]
    pub segment_axes: Vec<String>,

    pub source_path: String,

    #[schemars(description = "Upstream identifier; higher means more recently parsed")]
    pub source_fact_id: u64,

    #[schemars(description = "Date the containing filing became publicly available")]
    pub filed_at: NaiveDate,

    #[serde(default)]
    pub accession: Option<String>,
}

impl ParsedFact {
    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(ParsedFact)
    }

    pub fn schema_as_json() -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&Self::generate_json_schema())
    }

    pub fn is_consolidated(&self) -> bool {
        self.segment_axes.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Provenance {
    /// Filled directly from exactly one parsed fact.
    Source {
        source_path: String,
        tag: String,
        context_ref: String,
        unit_ref: Option<String>,
        source_fact_id: u64,
        accession: Option<String>,
    },
    /// Computed by a residual formula from other canonical rows.
    Derived {
        formula: String,
        input_fact_ids: Vec<u64>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct CanonicalFact {
    pub ticker: String,
    pub statement: Statement,
    pub line_item: LineItem,
    pub period_type: PeriodType,
    pub period_start: Option<NaiveDate>,
    pub period_end: NaiveDate,
    pub value: Decimal,
    pub unit: Unit,
    #[schemars(description = "Earliest filing date at which this value was public")]
    pub available_at: NaiveDate,
    pub provenance: Provenance,
}

impl CanonicalFact {
    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(CanonicalFact)
    }

    pub fn is_derived(&self) -> bool {
        matches!(self.provenance, Provenance::Derived { .. })
    }

    /// Parsed-fact ids this row traces back to.
    pub fn source_fact_ids(&self) -> Vec<u64> {
        match &self.provenance {
            Provenance::Source { source_fact_id, .. } => vec![*source_fact_id],
            Provenance::Derived { input_fact_ids, .. } => input_fact_ids.clone(),
        }
    }
}
