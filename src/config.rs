use crate::error::{CanonicalError, Result};
use crate::forecast::Scenario;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Longest projection a single call may request.
pub const MAX_FORECAST_HORIZON: u32 = 40;

/// How a segmented candidate competes with a consolidated one for the same slot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SegmentPolicy {
    /// Tag priority decides first; consolidated context only breaks equal ranks.
    #[default]
    PriorityFirst,
    /// Any consolidated candidate beats every segmented one, then priority.
    ConsolidatedFirst,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(default)]
pub struct CoreConfig {
    #[schemars(description = "Absolute tolerance for balance sheet and cash flow ties")]
    pub tie_tolerance: Decimal,

    #[schemars(description = "Absolute tolerance for subtotal identities between tagged rows")]
    pub residual_tolerance: Decimal,

    #[schemars(description = "Abort materialization when any period fails the balance sheet tie")]
    pub hard_fail_ties: bool,

    #[schemars(description = "Trailing number of comparable periods feeding each driver")]
    pub driver_window: usize,

    pub forecast_horizon: u32,

    pub scenarios: Vec<Scenario>,

    pub segment_policy: SegmentPolicy,

    #[schemars(description = "Segment axes that keep a fact as a segmented candidate instead of dropping it")]
    pub allowed_segment_axes: Vec<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            tie_tolerance: dec!(0.01),
            residual_tolerance: dec!(1.0),
            hard_fail_ties: false,
            driver_window: 4,
            forecast_horizon: 4,
            scenarios: Scenario::ALL.to_vec(),
            segment_policy: SegmentPolicy::default(),
            allowed_segment_axes: vec!["us-gaap:StatementClassOfStockAxis".to_string()],
        }
    }
}

impl CoreConfig {
    /// Lenient mode: tie failures are reported on the period, never fatal.
    pub fn nightly() -> Self {
        Self::default()
    }

    /// Strict mode: a failing balance sheet aborts the ticker's materialization.
    pub fn weekly() -> Self {
        Self {
            hard_fail_ties: true,
            ..Self::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: CoreConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    /// Defaults overridden by `TIE_TOLERANCE`, `RESIDUAL_TOLERANCE`,
    /// `HARD_FAIL_TIES`, `DRIVER_WINDOW` and `FORECAST_HORIZON`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("TIE_TOLERANCE") {
            self.tie_tolerance = parse_setting("TIE_TOLERANCE", &raw)?;
        }
        if let Some(raw) = lookup("RESIDUAL_TOLERANCE") {
            self.residual_tolerance = parse_setting("RESIDUAL_TOLERANCE", &raw)?;
        }
        if let Some(raw) = lookup("HARD_FAIL_TIES") {
            self.hard_fail_ties = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                other => {
                    return Err(CanonicalError::InvalidConfig(format!(
                        "HARD_FAIL_TIES must be a boolean, got '{}'",
                        other
                    )))
                }
            };
        }
        if let Some(raw) = lookup("DRIVER_WINDOW") {
            self.driver_window = parse_setting("DRIVER_WINDOW", &raw)?;
        }
        if let Some(raw) = lookup("FORECAST_HORIZON") {
            self.forecast_horizon = parse_setting("FORECAST_HORIZON", &raw)?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.tie_tolerance < Decimal::ZERO {
            return Err(CanonicalError::InvalidConfig(
                "tie_tolerance cannot be negative".to_string(),
            ));
        }
        if self.residual_tolerance < Decimal::ZERO {
            return Err(CanonicalError::InvalidConfig(
                "residual_tolerance cannot be negative".to_string(),
            ));
        }
        if self.driver_window == 0 {
            return Err(CanonicalError::InvalidConfig(
                "driver_window must be at least 1".to_string(),
            ));
        }
        if self.forecast_horizon == 0 || self.forecast_horizon > MAX_FORECAST_HORIZON {
            return Err(CanonicalError::InvalidConfig(format!(
                "forecast_horizon must be between 1 and {}",
                MAX_FORECAST_HORIZON
            )));
        }
        if !self.scenarios.contains(&Scenario::Base) {
            return Err(CanonicalError::InvalidConfig(
                "scenario set must include base".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_axis_allowed(&self, axis: &str) -> bool {
        let local = |name: &str| {
            name.rsplit(|c: char| c == ':' || c == '_')
                .next()
                .unwrap_or(name)
                .to_ascii_lowercase()
        };
        self.allowed_segment_axes
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(axis) || local(allowed) == local(axis))
    }
}

fn parse_setting<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim().parse::<T>().map_err(|_| {
        CanonicalError::InvalidConfig(format!("{} has an invalid value '{}'", key, raw))
    })
}
