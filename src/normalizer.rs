use crate::config::{CoreConfig, SegmentPolicy};
use crate::error::FactRejection;
use crate::schema::{
    CanonicalFact, LineItem, ParsedFact, PeriodType, Provenance, SignContext, Statement, Unit,
};
use crate::tag_map::{TagMapper, TagMapping};
use crate::utils::{pow10, round_to_decimals, MAX_DECIMAL_EXPONENT};
use chrono::NaiveDate;
use log::{debug, info};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BTreeSet};

/// A parsed fact that did not become a canonical row, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedFact {
    pub source_fact_id: u64,
    pub source_tag: String,
    pub reason: FactRejection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedFacts {
    pub ticker: String,
    /// Ordered by `(period_end, statement, line_item)`.
    pub facts: Vec<CanonicalFact>,
    /// Ordered by `source_fact_id`.
    pub dropped: Vec<DroppedFact>,
}

impl NormalizedFacts {
    pub fn dropped_count(&self) -> usize {
        self.dropped.len()
    }
}

/// One eligible way of filling a canonical slot with a parsed fact.
#[derive(Debug, Clone)]
struct Candidate<'f> {
    fact: &'f ParsedFact,
    mapping: TagMapping,
    value: Decimal,
    unit: Unit,
    period_start: Option<NaiveDate>,
    period_type: PeriodType,
}

impl Candidate<'_> {
    fn is_consolidated(&self) -> bool {
        self.fact.is_consolidated()
    }

    /// Unknown length sorts after every known one.
    fn duration_days(&self) -> i64 {
        match (self.period_type, self.period_start) {
            (PeriodType::Instant, _) => 0,
            (PeriodType::Duration, Some(start)) => (self.fact.period_end - start).num_days(),
            (PeriodType::Duration, None) => i64::MAX,
        }
    }
}

type SlotKey = (NaiveDate, Statement, LineItem);

pub struct FactNormalizer<'a> {
    config: &'a CoreConfig,
    mapper: TagMapper,
}

impl<'a> FactNormalizer<'a> {
    pub fn new(config: &'a CoreConfig) -> Self {
        Self {
            config,
            mapper: TagMapper::new(),
        }
    }

    pub fn normalize(&self, ticker: &str, facts: &[ParsedFact]) -> NormalizedFacts {
        let ticker = normalize_ticker(ticker);
        let mut rejected: BTreeMap<u64, DroppedFact> = BTreeMap::new();
        let mut slots: BTreeMap<SlotKey, Vec<Candidate<'_>>> = BTreeMap::new();

        for fact in facts {
            match self.candidates(fact) {
                Ok(candidates) => {
                    for candidate in candidates {
                        let key = (
                            fact.period_end,
                            candidate.mapping.statement,
                            candidate.mapping.line_item,
                        );
                        slots.entry(key).or_default().push(candidate);
                    }
                }
                Err(reason) => {
                    debug!(
                        "{}: dropping fact {} ({}): {}",
                        ticker, fact.source_fact_id, fact.source_tag, reason
                    );
                    rejected.entry(fact.source_fact_id).or_insert(DroppedFact {
                        source_fact_id: fact.source_fact_id,
                        source_tag: fact.source_tag.clone(),
                        reason,
                    });
                }
            }
        }

        let mut canonical = Vec::with_capacity(slots.len());
        let mut winners: BTreeSet<u64> = BTreeSet::new();
        let mut losers: BTreeMap<u64, DroppedFact> = BTreeMap::new();

        for ((period_end, _, line_item), mut candidates) in slots {
            candidates.sort_by(|a, b| self.compare_candidates(a, b));
            let winner = &candidates[0];
            winners.insert(winner.fact.source_fact_id);

            // A comparative repeated in a later filing keeps its first filing date.
            let available_at = candidates
                .iter()
                .filter(|c| c.value == winner.value)
                .map(|c| c.fact.filed_at)
                .min()
                .unwrap_or(winner.fact.filed_at);

            for loser in &candidates[1..] {
                losers
                    .entry(loser.fact.source_fact_id)
                    .or_insert_with(|| DroppedFact {
                        source_fact_id: loser.fact.source_fact_id,
                        source_tag: loser.fact.source_tag.clone(),
                        reason: FactRejection::LostTieBreak {
                            line_item,
                            period_end,
                            winner: winner.fact.source_fact_id,
                        },
                    });
            }

            canonical.push(to_canonical(&ticker, winner, available_at));
        }

        // A fact that filled at least one slot is not dropped.
        losers.retain(|id, _| !winners.contains(id));
        for (id, dropped) in losers {
            debug!("{}: fact {} lost its slot: {}", ticker, id, dropped.reason);
            rejected.entry(id).or_insert(dropped);
        }

        info!(
            "{}: normalized {} parsed facts into {} canonical rows ({} dropped)",
            ticker,
            facts.len(),
            canonical.len(),
            rejected.len()
        );

        NormalizedFacts {
            ticker,
            facts: canonical,
            dropped: rejected.into_values().collect(),
        }
    }

    /// Total order within one slot: priority rank, segment policy, shorter
    /// duration, then most recent `source_fact_id`.
    fn compare_candidates(&self, a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
        let segmented = |c: &Candidate<'_>| !c.is_consolidated();
        let primary = match self.config.segment_policy {
            SegmentPolicy::PriorityFirst => (a.mapping.priority, segmented(a))
                .cmp(&(b.mapping.priority, segmented(b))),
            SegmentPolicy::ConsolidatedFirst => (segmented(a), a.mapping.priority)
                .cmp(&(segmented(b), b.mapping.priority)),
        };

        primary
            .then_with(|| a.duration_days().cmp(&b.duration_days()))
            .then_with(|| Reverse(a.fact.source_fact_id).cmp(&Reverse(b.fact.source_fact_id)))
    }

    fn candidates<'f>(&self, fact: &'f ParsedFact) -> Result<Vec<Candidate<'f>>, FactRejection> {
        if let Some(axis) = fact
            .segment_axes
            .iter()
            .find(|axis| !self.config.is_axis_allowed(axis))
        {
            return Err(FactRejection::DisallowedSegment { axis: axis.clone() });
        }

        let mappings = self
            .mapper
            .lookup(&fact.source_tag, fact.statement_hint.as_deref());
        if mappings.is_empty() {
            return Err(FactRejection::Unmapped {
                tag: fact.source_tag.clone(),
            });
        }

        let unit = Unit::parse_ref(fact.unit_ref.as_deref()).ok_or_else(|| {
            FactRejection::UnparseableUnit(fact.unit_ref.clone().unwrap_or_default())
        })?;
        let value = scaled_value(fact)?;

        let mut candidates = Vec::with_capacity(mappings.len());
        let mut first_rejection = None;

        for mapping in mappings {
            match place(fact, mapping, unit, value) {
                Ok(candidate) => candidates.push(candidate),
                Err(reason) => {
                    first_rejection.get_or_insert(reason);
                }
            }
        }

        match first_rejection {
            Some(reason) if candidates.is_empty() => Err(reason),
            _ => Ok(candidates),
        }
    }
}

pub fn normalize_ticker(ticker: &str) -> String {
    ticker.trim().to_uppercase()
}

/// Display value scaled by `10^scale`, rounded to `decimals`, in normal sign.
fn scaled_value(fact: &ParsedFact) -> Result<Decimal, FactRejection> {
    let scale = match fact.scale.as_deref().map(str::trim) {
        None | Some("") => 0,
        Some(raw) => raw
            .parse::<i32>()
            .ok()
            .filter(|scale| (-MAX_DECIMAL_EXPONENT..=MAX_DECIMAL_EXPONENT).contains(scale))
            .ok_or_else(|| FactRejection::UnparseableScale(raw.to_string()))?,
    };
    let factor = pow10(scale).ok_or(FactRejection::ValueOverflow(scale))?;
    let mut value = fact
        .value
        .checked_mul(factor)
        .ok_or(FactRejection::ValueOverflow(scale))?;

    match fact.decimals.as_deref().map(str::trim) {
        None | Some("") => {}
        Some(raw) if raw.eq_ignore_ascii_case("INF") => {}
        Some(raw) => {
            let decimals = raw
                .parse::<i32>()
                .ok()
                .filter(|decimals| (-MAX_DECIMAL_EXPONENT..=MAX_DECIMAL_EXPONENT).contains(decimals))
                .ok_or_else(|| FactRejection::UnparseableDecimals(raw.to_string()))?;
            value = round_to_decimals(value, decimals)
                .ok_or_else(|| FactRejection::UnparseableDecimals(raw.to_string()))?;
        }
    }

    if fact.sign_context == SignContext::Negated {
        value = -value;
    }
    Ok(value)
}

/// Checks one mapping's unit and period constraints for a fact.
fn place<'f>(
    fact: &'f ParsedFact,
    mapping: TagMapping,
    unit: Unit,
    value: Decimal,
) -> Result<Candidate<'f>, FactRejection> {
    let line_item = mapping.line_item;
    if unit != line_item.unit() {
        return Err(FactRejection::UnitMismatch {
            line_item,
            expected: line_item.unit(),
            found: unit,
        });
    }

    let required = mapping.statement.required_period_type();
    let stated = fact
        .period_type
        .or_else(|| fact.period_start.map(|_| PeriodType::Duration));
    if let Some(found) = stated {
        if found != required {
            return Err(FactRejection::DisallowedPeriodType {
                statement: mapping.statement,
                expected: required,
                found,
            });
        }
    }

    let period_start = match required {
        PeriodType::Instant => None,
        PeriodType::Duration => fact.period_start,
    };
    if let Some(start) = period_start {
        if start > fact.period_end {
            return Err(FactRejection::InvertedPeriod {
                period_start: start,
                period_end: fact.period_end,
            });
        }
    }

    Ok(Candidate {
        fact,
        mapping,
        value: if mapping.negate { -value } else { value },
        unit,
        period_start,
        period_type: required,
    })
}

fn to_canonical(ticker: &str, candidate: &Candidate<'_>, available_at: NaiveDate) -> CanonicalFact {
    let fact = candidate.fact;
    CanonicalFact {
        ticker: ticker.to_string(),
        statement: candidate.mapping.statement,
        line_item: candidate.mapping.line_item,
        period_type: candidate.period_type,
        period_start: candidate.period_start,
        period_end: fact.period_end,
        value: candidate.value,
        unit: candidate.unit,
        available_at,
        provenance: Provenance::Source {
            source_path: fact.source_path.clone(),
            tag: fact.source_tag.clone(),
            context_ref: fact.context_ref.clone(),
            unit_ref: fact.unit_ref.clone(),
            source_fact_id: fact.source_fact_id,
            accession: fact.accession.clone(),
        },
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{date, parsed};
    use super::*;
    use rust_decimal_macros::dec;

    fn q1() -> (Option<NaiveDate>, NaiveDate) {
        (Some(date(2024, 1, 1)), date(2024, 3, 31))
    }

    fn normalize(facts: &[ParsedFact]) -> NormalizedFacts {
        let config = CoreConfig::default();
        FactNormalizer::new(&config).normalize("acme", facts)
    }

    #[test]
    fn test_basic_mapping_and_provenance() {
        let (start, end) = q1();
        let result = normalize(&[parsed(
            7,
            "us-gaap:Revenues",
            start,
            end,
            dec!(1000),
            date(2024, 5, 1),
        )]);

        assert_eq!(result.ticker, "ACME");
        assert_eq!(result.facts.len(), 1);
        let fact = &result.facts[0];
        assert_eq!(fact.line_item, LineItem::Revenue);
        assert_eq!(fact.statement, Statement::IncomeStatement);
        assert_eq!(fact.period_type, PeriodType::Duration);
        assert_eq!(fact.unit, Unit::Usd);
        assert_eq!(fact.available_at, date(2024, 5, 1));
        assert_eq!(fact.source_fact_ids(), vec![7]);
        assert_eq!(result.dropped_count(), 0);
    }

    #[test]
    fn test_scale_decimals_and_sign() {
        let (start, end) = q1();
        let mut fact = parsed(1, "us-gaap:Revenues", start, end, dec!(9000.4), date(2024, 5, 1));
        fact.scale = Some("6".to_string());
        fact.decimals = Some("-6".to_string());
        let mut negated = parsed(2, "us-gaap:NetIncomeLoss", start, end, dec!(12), date(2024, 5, 1));
        negated.sign_context = SignContext::Negated;
        negated.decimals = Some("INF".to_string());

        let result = normalize(&[fact, negated]);
        let revenue = result.facts.iter().find(|f| f.line_item == LineItem::Revenue).unwrap();
        assert_eq!(revenue.value, dec!(9_000_000_000));
        let net = result.facts.iter().find(|f| f.line_item == LineItem::NetIncome).unwrap();
        assert_eq!(net.value, dec!(-12));
    }

    #[test]
    fn test_out_of_range_scale_and_decimals_dropped() {
        let (start, end) = q1();
        let filed = date(2024, 5, 1);
        let mut tiny = parsed(1, "us-gaap:Revenues", start, end, dec!(5), filed);
        tiny.scale = Some("-50000000".to_string());
        let mut huge_rounding = parsed(2, "us-gaap:NetIncomeLoss", start, end, dec!(5), filed);
        huge_rounding.decimals = Some("-2147483648".to_string());
        let mut too_precise = parsed(3, "us-gaap:OperatingIncomeLoss", start, end, dec!(5), filed);
        too_precise.decimals = Some("29".to_string());

        let result = normalize(&[tiny, huge_rounding, too_precise]);
        assert!(result.facts.is_empty());

        let reason = |id: u64| {
            &result
                .dropped
                .iter()
                .find(|d| d.source_fact_id == id)
                .unwrap()
                .reason
        };
        assert_eq!(reason(1), &FactRejection::UnparseableScale("-50000000".to_string()));
        assert_eq!(reason(2), &FactRejection::UnparseableDecimals("-2147483648".to_string()));
        assert_eq!(reason(3), &FactRejection::UnparseableDecimals("29".to_string()));
    }

    #[test]
    fn test_capex_stored_as_outflow() {
        let (start, end) = q1();
        let result = normalize(&[parsed(
            1,
            "us-gaap:PaymentsToAcquirePropertyPlantAndEquipment",
            start,
            end,
            dec!(250),
            date(2024, 5, 1),
        )]);
        assert_eq!(result.facts[0].line_item, LineItem::Capex);
        assert_eq!(result.facts[0].value, dec!(-250));
    }

    #[test]
    fn test_drop_reasons() {
        let (start, end) = q1();
        let filed = date(2024, 5, 1);

        let unmapped = parsed(1, "custom:Widgets", start, end, dec!(1), filed);
        let mut segmented = parsed(2, "us-gaap:Revenues", start, end, dec!(1), filed);
        segmented.segment_axes = vec!["srt:ProductOrServiceAxis".to_string()];
        let wrong_type = parsed(3, "us-gaap:Assets", start, end, dec!(1), filed);
        let mut bad_unit = parsed(4, "us-gaap:Revenues", start, end, dec!(1), filed);
        bad_unit.unit_ref = Some("iso4217:EUR".to_string());
        let mut bad_scale = parsed(5, "us-gaap:Revenues", start, end, dec!(1), filed);
        bad_scale.scale = Some("millions".to_string());
        let mut mismatched = parsed(6, "us-gaap:EarningsPerShareDiluted", start, end, dec!(1), filed);
        mismatched.unit_ref = Some("iso4217:USD".to_string());

        let result = normalize(&[unmapped, segmented, wrong_type, bad_unit, bad_scale, mismatched]);
        assert!(result.facts.is_empty());
        assert_eq!(result.dropped_count(), 6);

        let reasons: Vec<&FactRejection> = result.dropped.iter().map(|d| &d.reason).collect();
        assert!(matches!(reasons[0], FactRejection::Unmapped { .. }));
        assert!(matches!(reasons[1], FactRejection::DisallowedSegment { .. }));
        assert!(matches!(reasons[2], FactRejection::DisallowedPeriodType { .. }));
        assert!(matches!(reasons[3], FactRejection::UnparseableUnit(_)));
        assert!(matches!(reasons[4], FactRejection::UnparseableScale(_)));
        assert!(matches!(reasons[5], FactRejection::UnitMismatch { .. }));
    }

    #[test]
    fn test_period_type_inferred_from_statement() {
        let end = date(2024, 3, 31);
        let result = normalize(&[parsed(1, "us-gaap:Assets", None, end, dec!(500), date(2024, 5, 1))]);
        assert_eq!(result.facts[0].period_type, PeriodType::Instant);
        assert_eq!(result.facts[0].period_start, None);
    }

    #[test]
    fn test_inverted_period_rejected() {
        let fact = parsed(
            1,
            "us-gaap:Revenues",
            Some(date(2024, 6, 30)),
            date(2024, 3, 31),
            dec!(1),
            date(2024, 5, 1),
        );
        let result = normalize(&[fact]);
        assert!(matches!(
            result.dropped[0].reason,
            FactRejection::InvertedPeriod { .. }
        ));
    }

    #[test]
    fn test_priority_beats_arrival_order() {
        let (start, end) = q1();
        let filed = date(2024, 5, 1);
        let low = parsed(10, "us-gaap:SalesRevenueNet", start, end, dec!(900), filed);
        let high = parsed(
            3,
            "us-gaap:RevenueFromContractWithCustomerExcludingAssessedTax",
            start,
            end,
            dec!(1000),
            filed,
        );

        let forward = normalize(&[low.clone(), high.clone()]);
        let reverse = normalize(&[high, low]);
        assert_eq!(forward, reverse);
        assert_eq!(forward.facts[0].value, dec!(1000));
        assert_eq!(
            forward.dropped[0].reason,
            FactRejection::LostTieBreak {
                line_item: LineItem::Revenue,
                period_end: end,
                winner: 3
            }
        );
    }

    #[test]
    fn test_equal_rank_prefers_quarter_then_latest_id() {
        let end = date(2024, 6, 30);
        let filed = date(2024, 8, 1);
        let ytd = parsed(9, "us-gaap:Revenues", Some(date(2024, 1, 1)), end, dec!(2000), filed);
        let quarter = parsed(4, "us-gaap:Revenues", Some(date(2024, 4, 1)), end, dec!(1100), filed);
        let result = normalize(&[ytd, quarter]);
        assert_eq!(result.facts[0].value, dec!(1100));

        let older = parsed(4, "us-gaap:Revenues", Some(date(2024, 4, 1)), end, dec!(1100), filed);
        let newer = parsed(5, "us-gaap:Revenues", Some(date(2024, 4, 1)), end, dec!(1150), filed);
        let result = normalize(&[newer, older]);
        assert_eq!(result.facts[0].value, dec!(1150));
    }

    fn segment_policy_case(policy: SegmentPolicy) -> Decimal {
        let (start, end) = q1();
        let filed = date(2024, 5, 1);
        let mut segmented = parsed(
            1,
            "us-gaap:RevenueFromContractWithCustomerExcludingAssessedTax",
            start,
            end,
            dec!(400),
            filed,
        );
        segmented.segment_axes = vec!["us-gaap:StatementClassOfStockAxis".to_string()];
        let consolidated = parsed(2, "us-gaap:Revenues", start, end, dec!(1000), filed);

        let config = CoreConfig {
            segment_policy: policy,
            ..CoreConfig::default()
        };
        let result = FactNormalizer::new(&config).normalize("acme", &[segmented, consolidated]);
        assert_eq!(result.facts.len(), 1);
        assert_eq!(result.dropped_count(), 1);
        result.facts[0].value
    }

    #[test]
    fn test_segment_policy_priority_first() {
        assert_eq!(segment_policy_case(SegmentPolicy::PriorityFirst), dec!(400));
    }

    #[test]
    fn test_segment_policy_consolidated_first() {
        assert_eq!(segment_policy_case(SegmentPolicy::ConsolidatedFirst), dec!(1000));
    }

    #[test]
    fn test_equal_rank_prefers_consolidated() {
        let (start, end) = q1();
        let filed = date(2024, 5, 1);
        let mut segmented = parsed(9, "us-gaap:Revenues", start, end, dec!(400), filed);
        segmented.segment_axes = vec!["us-gaap:StatementClassOfStockAxis".to_string()];
        let consolidated = parsed(2, "us-gaap:Revenues", start, end, dec!(1000), filed);

        let result = normalize(&[segmented, consolidated]);
        assert_eq!(result.facts[0].value, dec!(1000));
    }

    #[test]
    fn test_comparative_keeps_first_filing_date() {
        let (start, end) = q1();
        let original = parsed(1, "us-gaap:Revenues", start, end, dec!(1000), date(2024, 5, 1));
        let comparative = parsed(2, "us-gaap:Revenues", start, end, dec!(1000), date(2025, 5, 1));
        let result = normalize(&[original.clone(), comparative]);
        assert_eq!(result.facts[0].available_at, date(2024, 5, 1));

        let restated = parsed(3, "us-gaap:Revenues", start, end, dec!(990), date(2025, 5, 1));
        let result = normalize(&[original, restated]);
        assert_eq!(result.facts[0].value, dec!(990));
        assert_eq!(result.facts[0].available_at, date(2025, 5, 1));
    }

    #[test]
    fn test_shared_tag_fills_both_eps_slots() {
        let (start, end) = q1();
        let mut eps = parsed(
            1,
            "us-gaap:EarningsPerShareBasicAndDiluted",
            start,
            end,
            dec!(1.25),
            date(2024, 5, 1),
        );
        eps.unit_ref = Some("iso4217:USD/xbrli:shares".to_string());
        let result = normalize(&[eps]);
        let items: Vec<LineItem> = result.facts.iter().map(|f| f.line_item).collect();
        assert_eq!(items, vec![LineItem::EpsBasic, LineItem::EpsDiluted]);
        assert!(result.facts.iter().all(|f| f.unit == Unit::UsdPerShare));
    }

    #[test]
    fn test_output_order_is_by_period_then_statement() {
        let filed = date(2024, 8, 1);
        let facts = vec![
            parsed(1, "us-gaap:Assets", None, date(2024, 6, 30), dec!(10), filed),
            parsed(2, "us-gaap:Revenues", Some(date(2024, 4, 1)), date(2024, 6, 30), dec!(5), filed),
            parsed(3, "us-gaap:Revenues", Some(date(2024, 1, 1)), date(2024, 3, 31), dec!(4), filed),
        ];
        let result = normalize(&facts);
        let order: Vec<(NaiveDate, LineItem)> = result
            .facts
            .iter()
            .map(|f| (f.period_end, f.line_item))
            .collect();
        assert_eq!(
            order,
            vec![
                (date(2024, 3, 31), LineItem::Revenue),
                (date(2024, 6, 30), LineItem::Revenue),
                (date(2024, 6, 30), LineItem::Assets),
            ]
        );
    }
}
