//! Static source-tag to canonical line item table.
//!
//! Extend only by adding rows here together with a fixture in the tests below.
//! Lower `priority` wins when several tags fill the same canonical slot.

use crate::schema::{LineItem, Statement};
use serde::Serialize;
use std::collections::BTreeMap;

pub const TAG_MAP_VERSION: &str = "2024.3";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TagMapping {
    pub tag: &'static str,
    pub statement: Statement,
    pub line_item: LineItem,
    /// 1 is best.
    pub priority: u8,
    /// The tag is reported with the opposite sign of the canonical convention.
    pub negate: bool,
}

const fn map(tag: &'static str, line_item: LineItem, priority: u8) -> TagMapping {
    TagMapping {
        tag,
        statement: line_item.statement(),
        line_item,
        priority,
        negate: false,
    }
}

const fn map_negated(tag: &'static str, line_item: LineItem, priority: u8) -> TagMapping {
    TagMapping {
        tag,
        statement: line_item.statement(),
        line_item,
        priority,
        negate: true,
    }
}

pub static TAG_TABLE: &[TagMapping] = &[
    // Income statement
    map("us-gaap:RevenueFromContractWithCustomerExcludingAssessedTax", LineItem::Revenue, 1),
    map("us-gaap:Revenues", LineItem::Revenue, 2),
    map("us-gaap:SalesRevenueNet", LineItem::Revenue, 3),
    map("us-gaap:TotalRevenues", LineItem::Revenue, 4),
    map("us-gaap:RevenueFromContractWithCustomerIncludingAssessedTax", LineItem::Revenue, 5),
    map("us-gaap:CostOfRevenue", LineItem::Cogs, 1),
    map("us-gaap:CostOfGoodsAndServicesSold", LineItem::Cogs, 2),
    map("us-gaap:CostOfSales", LineItem::Cogs, 3),
    map("us-gaap:CostOfGoodsSold", LineItem::Cogs, 4),
    map("us-gaap:GrossProfit", LineItem::GrossProfit, 1),
    map("us-gaap:ResearchAndDevelopmentExpense", LineItem::RAndD, 1),
    map(
        "us-gaap:ResearchAndDevelopmentExpenseExcludingAcquiredInProcessCost",
        LineItem::RAndD,
        2,
    ),
    map("us-gaap:SellingGeneralAndAdministrativeExpense", LineItem::Sga, 1),
    map("us-gaap:GeneralAndAdministrativeExpense", LineItem::Sga, 2),
    map("us-gaap:OperatingExpenses", LineItem::OperatingExpenses, 1),
    map("us-gaap:CostsAndExpenses", LineItem::TotalExpenses, 1),
    map("us-gaap:OperatingIncomeLoss", LineItem::OperatingIncome, 1),
    map("us-gaap:InterestExpense", LineItem::InterestExpense, 1),
    map("us-gaap:InterestExpenseNonoperating", LineItem::InterestExpense, 2),
    map("us-gaap:InterestExpenseDebt", LineItem::InterestExpense, 3),
    map(
        "us-gaap:IncomeLossFromContinuingOperationsBeforeIncomeTaxesExtraordinaryItemsNoncontrollingInterest",
        LineItem::PreTaxIncome,
        1,
    ),
    map(
        "us-gaap:IncomeLossFromContinuingOperationsBeforeIncomeTaxesMinorityInterestAndIncomeLossFromEquityMethodInvestments",
        LineItem::PreTaxIncome,
        2,
    ),
    map("us-gaap:IncomeTaxExpenseBenefit", LineItem::IncomeTaxExpense, 1),
    map("us-gaap:NetIncomeLoss", LineItem::NetIncome, 1),
    map("us-gaap:ProfitLoss", LineItem::NetIncome, 2),
    map("us-gaap:NetIncomeLossAvailableToCommonStockholdersBasic", LineItem::NetIncome, 3),
    map("us-gaap:EarningsPerShareBasic", LineItem::EpsBasic, 1),
    map("us-gaap:EarningsPerShareBasicAndDiluted", LineItem::EpsBasic, 2),
    map("us-gaap:EarningsPerShareDiluted", LineItem::EpsDiluted, 1),
    map("us-gaap:EarningsPerShareBasicAndDiluted", LineItem::EpsDiluted, 2),
    map("us-gaap:WeightedAverageNumberOfSharesOutstandingBasic", LineItem::SharesBasic, 1),
    map("us-gaap:WeightedAverageNumberOfDilutedSharesOutstanding", LineItem::SharesDiluted, 1),
    map("us-gaap:CommonStockSharesOutstanding", LineItem::SharesOutstanding, 1),
    map("dei:EntityCommonStockSharesOutstanding", LineItem::SharesOutstanding, 2),
    // Balance sheet
    map("us-gaap:Assets", LineItem::Assets, 1),
    map("us-gaap:AssetsCurrent", LineItem::AssetsCurrent, 1),
    map("us-gaap:CashAndCashEquivalentsAtCarryingValue", LineItem::Cash, 1),
    map("us-gaap:Cash", LineItem::Cash, 2),
    map(
        "us-gaap:CashCashEquivalentsRestrictedCashAndRestrictedCashEquivalents",
        LineItem::Cash,
        3,
    ),
    map("us-gaap:ShortTermInvestments", LineItem::ShortTermInvestments, 1),
    map("us-gaap:MarketableSecuritiesCurrent", LineItem::ShortTermInvestments, 2),
    map(
        "us-gaap:AvailableForSaleSecuritiesDebtSecuritiesCurrent",
        LineItem::ShortTermInvestments,
        3,
    ),
    map("us-gaap:AccountsReceivableNetCurrent", LineItem::AccountsReceivable, 1),
    map("us-gaap:AccountsReceivableNet", LineItem::AccountsReceivable, 2),
    map("us-gaap:ReceivablesNetCurrent", LineItem::AccountsReceivable, 3),
    map("us-gaap:InventoryNet", LineItem::Inventory, 1),
    map("us-gaap:PropertyPlantAndEquipmentNet", LineItem::Ppe, 1),
    map("us-gaap:Liabilities", LineItem::Liabilities, 1),
    map("us-gaap:LiabilitiesCurrent", LineItem::LiabilitiesCurrent, 1),
    map("us-gaap:AccountsPayableCurrent", LineItem::AccountsPayable, 1),
    map("us-gaap:AccountsPayableAndAccruedLiabilitiesCurrent", LineItem::AccountsPayable, 2),
    map("us-gaap:LongTermDebtCurrent", LineItem::DebtCurrent, 1),
    map("us-gaap:DebtCurrent", LineItem::DebtCurrent, 2),
    map("us-gaap:ShortTermBorrowings", LineItem::DebtCurrent, 3),
    map("us-gaap:LongTermDebtNoncurrent", LineItem::DebtLongTerm, 1),
    map("us-gaap:LongTermDebt", LineItem::DebtLongTerm, 2),
    map("us-gaap:StockholdersEquity", LineItem::Equity, 1),
    map(
        "us-gaap:StockholdersEquityIncludingPortionAttributableToNoncontrollingInterest",
        LineItem::Equity,
        2,
    ),
    map("us-gaap:LiabilitiesAndStockholdersEquity", LineItem::LiabilitiesEquity, 1),
    // Cash flow
    map("us-gaap:NetCashProvidedByUsedInOperatingActivities", LineItem::Cfo, 1),
    map(
        "us-gaap:NetCashProvidedByUsedInOperatingActivitiesContinuingOperations",
        LineItem::Cfo,
        2,
    ),
    map("us-gaap:NetCashProvidedByUsedInInvestingActivities", LineItem::Cfi, 1),
    map(
        "us-gaap:NetCashProvidedByUsedInInvestingActivitiesContinuingOperations",
        LineItem::Cfi,
        2,
    ),
    map("us-gaap:NetCashProvidedByUsedInFinancingActivities", LineItem::Cff, 1),
    map(
        "us-gaap:NetCashProvidedByUsedInFinancingActivitiesContinuingOperations",
        LineItem::Cff,
        2,
    ),
    map_negated("us-gaap:PaymentsToAcquirePropertyPlantAndEquipment", LineItem::Capex, 1),
    map_negated("us-gaap:PaymentsToAcquireProductiveAssets", LineItem::Capex, 2),
    map("us-gaap:DepreciationDepletionAndAmortization", LineItem::DepreciationAmortization, 1),
    map("us-gaap:DepreciationAndAmortization", LineItem::DepreciationAmortization, 2),
    map("us-gaap:DepreciationAmortizationAndAccretionNet", LineItem::DepreciationAmortization, 3),
    map("us-gaap:Depreciation", LineItem::DepreciationAmortization, 4),
    map(
        "us-gaap:EffectOfExchangeRateOnCashCashEquivalentsRestrictedCashAndRestrictedCashEquivalents",
        LineItem::FxOnCash,
        1,
    ),
    map("us-gaap:EffectOfExchangeRateOnCashAndCashEquivalents", LineItem::FxOnCash, 2),
    map(
        "us-gaap:CashCashEquivalentsRestrictedCashAndRestrictedCashEquivalentsPeriodIncreaseDecreaseIncludingExchangeRateEffect",
        LineItem::ChangeInCash,
        1,
    ),
    map("us-gaap:CashAndCashEquivalentsPeriodIncreaseDecrease", LineItem::ChangeInCash, 2),
];

/// Normalizes `us-gaap_Revenues`, `US-GAAP:Revenues` and bare `Revenues` to
/// one lookup key. Bare tags are assumed to be us-gaap.
fn tag_key(tag: &str) -> String {
    let trimmed = tag.trim();
    let lowered = trimmed.to_ascii_lowercase();
    if lowered.contains(':') {
        return lowered;
    }
    match lowered.split_once('_') {
        Some((prefix, rest)) if prefix == "us-gaap" || prefix == "dei" => {
            format!("{}:{}", prefix, rest)
        }
        _ => format!("us-gaap:{}", lowered),
    }
}

pub struct TagMapper {
    by_tag: BTreeMap<String, Vec<TagMapping>>,
}

impl TagMapper {
    pub fn new() -> Self {
        let mut by_tag: BTreeMap<String, Vec<TagMapping>> = BTreeMap::new();
        for mapping in TAG_TABLE {
            by_tag
                .entry(tag_key(mapping.tag))
                .or_default()
                .push(*mapping);
        }
        for candidates in by_tag.values_mut() {
            candidates.sort_by_key(|m| (m.priority, m.line_item));
        }
        Self { by_tag }
    }

    pub fn version(&self) -> &'static str {
        TAG_MAP_VERSION
    }

    /// Candidate mappings for a tag, best priority first.
    ///
    /// A recognised statement hint restricts the candidates to that statement;
    /// a hint that excludes every candidate leaves the tag unmapped. An
    /// unrecognised hint is ignored.
    pub fn lookup(&self, source_tag: &str, statement_hint: Option<&str>) -> Vec<TagMapping> {
        let Some(candidates) = self.by_tag.get(&tag_key(source_tag)) else {
            return Vec::new();
        };

        match statement_hint.and_then(Statement::parse_hint) {
            Some(statement) => candidates
                .iter()
                .filter(|m| m.statement == statement)
                .copied()
                .collect(),
            None => candidates.clone(),
        }
    }

    /// Every tag that can fill `line_item`, best first.
    pub fn tags_for(&self, line_item: LineItem) -> Vec<TagMapping> {
        let mut mappings: Vec<TagMapping> = TAG_TABLE
            .iter()
            .filter(|m| m.line_item == line_item)
            .copied()
            .collect();
        mappings.sort_by_key(|m| m.priority);
        mappings
    }
}

impl Default for TagMapper {
    fn default() -> Self {
        Self::new()
    }
}
