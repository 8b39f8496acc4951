//! Strategy templates.
//!
//! A template describes legs relative to the market rather than absolute
//! contracts: strikes as point offsets from the at-the-money strike, and
//! expiries as an index into the upcoming expiries.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::data::OptionType;

use super::resolver::StrategyError;

/// Side of a leg at entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Buy,
    Sell,
}

impl Action {
    /// +1 for long legs, -1 for short legs.
    pub fn direction(&self) -> Decimal {
        match self {
            Self::Buy => Decimal::ONE,
            Self::Sell => Decimal::NEGATIVE_ONE,
        }
    }

    /// Cash-flow sign when opening: credit for sells, debit for buys.
    pub fn open_sign(&self) -> Decimal {
        -self.direction()
    }

    /// Cash-flow sign when closing.
    pub fn close_sign(&self) -> Decimal {
        self.direction()
    }
}

/// Strategy family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    LongStraddle,
    ShortStraddle,
    LongStrangle,
    ShortStrangle,
    BullCallSpread,
    BearPutSpread,
    BullPutSpread,
    BearCallSpread,
    IronCondor,
    IronButterfly,
    CallRatioSpread,
    PutRatioSpread,
    LongCallButterfly,
    LongPutButterfly,
    JadeLizard,
    BrokenWingButterfly,
    LongCalendarSpread,
    LongDiagonalSpread,
    Custom,
}

impl StrategyKind {
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::LongStraddle => "Long Straddle",
            Self::ShortStraddle => "Short Straddle",
            Self::LongStrangle => "Long Strangle",
            Self::ShortStrangle => "Short Strangle",
            Self::BullCallSpread => "Bull Call Spread",
            Self::BearPutSpread => "Bear Put Spread",
            Self::BullPutSpread => "Bull Put Spread",
            Self::BearCallSpread => "Bear Call Spread",
            Self::IronCondor => "Iron Condor",
            Self::IronButterfly => "Iron Butterfly",
            Self::CallRatioSpread => "Call Ratio Spread",
            Self::PutRatioSpread => "Put Ratio Spread",
            Self::LongCallButterfly => "Long Call Butterfly",
            Self::LongPutButterfly => "Long Put Butterfly",
            Self::JadeLizard => "Jade Lizard",
            Self::BrokenWingButterfly => "Broken Wing Butterfly",
            Self::LongCalendarSpread => "Long Calendar Spread",
            Self::LongDiagonalSpread => "Long Diagonal Spread",
            Self::Custom => "Custom",
        }
    }
}

/// One leg relative to ATM and the expiry sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegTemplate {
    pub action: Action,
    pub option_type: OptionType,
    /// Points from the ATM strike (signed).
    #[serde(default)]
    pub strike_offset: i64,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    #[serde(default)]
    pub leg_order: u32,
    /// Index into upcoming expiries (0 = nearest).
    #[serde(default)]
    pub expiry_offset: u32,
}

fn default_quantity() -> u32 {
    1
}

impl LegTemplate {
    pub fn new(action: Action, option_type: OptionType, strike_offset: i64) -> Self {
        Self {
            action,
            option_type,
            strike_offset,
            quantity: 1,
            leg_order: 0,
            expiry_offset: 0,
        }
    }

    pub fn buy(option_type: OptionType, strike_offset: i64) -> Self {
        Self::new(Action::Buy, option_type, strike_offset)
    }

    pub fn sell(option_type: OptionType, strike_offset: i64) -> Self {
        Self::new(Action::Sell, option_type, strike_offset)
    }

    pub fn quantity(mut self, quantity: u32) -> Self {
        self.quantity = quantity;
        self
    }

    pub fn expiry_offset(mut self, offset: u32) -> Self {
        self.expiry_offset = offset;
        self
    }

    pub fn leg_order(mut self, order: u32) -> Self {
        self.leg_order = order;
        self
    }
}

/// A stored strategy.
///
/// Templates are immutable once stored; the store hands out clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyTemplate {
    /// Assigned by the store (0 until stored).
    #[serde(default)]
    pub id: u64,
    pub name: String,
    pub kind: StrategyKind,
    pub legs: Vec<LegTemplate>,
}

impl StrategyTemplate {
    /// Template from legs; leg order follows position when every leg has order 0.
    pub fn new(name: impl Into<String>, kind: StrategyKind, mut legs: Vec<LegTemplate>) -> Self {
        if legs.iter().all(|l| l.leg_order == 0) {
            for (i, leg) in legs.iter_mut().enumerate() {
                leg.leg_order = i as u32 + 1;
            }
        }
        Self {
            id: 0,
            name: name.into(),
            kind,
            legs,
        }
    }

    /// Standard structure for `kind`, with wings `width` points apart.
    ///
    /// Returns `None` for [`StrategyKind::Custom`].
    pub fn preset(kind: StrategyKind, width: i64) -> Option<Self> {
        use OptionType::{Call, Put};
        let w = width;

        let legs = match kind {
            StrategyKind::LongStraddle => vec![LegTemplate::buy(Call, 0), LegTemplate::buy(Put, 0)],
            StrategyKind::ShortStraddle => {
                vec![LegTemplate::sell(Call, 0), LegTemplate::sell(Put, 0)]
            }
            StrategyKind::LongStrangle => {
                vec![LegTemplate::buy(Call, w), LegTemplate::buy(Put, -w)]
            }
            StrategyKind::ShortStrangle => {
                vec![LegTemplate::sell(Call, w), LegTemplate::sell(Put, -w)]
            }
            StrategyKind::BullCallSpread => {
                vec![LegTemplate::buy(Call, 0), LegTemplate::sell(Call, w)]
            }
            StrategyKind::BearPutSpread => {
                vec![LegTemplate::buy(Put, 0), LegTemplate::sell(Put, -w)]
            }
            StrategyKind::BullPutSpread => {
                vec![LegTemplate::sell(Put, 0), LegTemplate::buy(Put, -w)]
            }
            StrategyKind::BearCallSpread => {
                vec![LegTemplate::sell(Call, 0), LegTemplate::buy(Call, w)]
            }
            StrategyKind::IronCondor => vec![
                LegTemplate::buy(Put, -2 * w),
                LegTemplate::sell(Put, -w),
                LegTemplate::sell(Call, w),
                LegTemplate::buy(Call, 2 * w),
            ],
            StrategyKind::IronButterfly => vec![
                LegTemplate::buy(Put, -w),
                LegTemplate::sell(Put, 0),
                LegTemplate::sell(Call, 0),
                LegTemplate::buy(Call, w),
            ],
            StrategyKind::CallRatioSpread => vec![
                LegTemplate::buy(Call, 0),
                LegTemplate::sell(Call, w).quantity(2),
            ],
            StrategyKind::PutRatioSpread => vec![
                LegTemplate::buy(Put, 0),
                LegTemplate::sell(Put, -w).quantity(2),
            ],
            StrategyKind::LongCallButterfly => vec![
                LegTemplate::buy(Call, -w),
                LegTemplate::sell(Call, 0).quantity(2),
                LegTemplate::buy(Call, w),
            ],
            StrategyKind::LongPutButterfly => vec![
                LegTemplate::buy(Put, w),
                LegTemplate::sell(Put, 0).quantity(2),
                LegTemplate::buy(Put, -w),
            ],
            StrategyKind::JadeLizard => vec![
                LegTemplate::sell(Put, -w),
                LegTemplate::sell(Call, w),
                LegTemplate::buy(Call, 2 * w),
            ],
            StrategyKind::BrokenWingButterfly => vec![
                LegTemplate::buy(Call, -w),
                LegTemplate::sell(Call, 0).quantity(2),
                LegTemplate::buy(Call, 2 * w),
            ],
            StrategyKind::LongCalendarSpread => vec![
                LegTemplate::sell(Call, 0),
                LegTemplate::buy(Call, 0).expiry_offset(1),
            ],
            StrategyKind::LongDiagonalSpread => vec![
                LegTemplate::sell(Call, w),
                LegTemplate::buy(Call, 0).expiry_offset(1),
            ],
            StrategyKind::Custom => return None,
        };

        Some(Self::new(kind.display_name(), kind, legs))
    }

    /// Reject templates that cannot be instantiated.
    pub fn validate(&self) -> Result<(), StrategyError> {
        if self.legs.is_empty() {
            return Err(StrategyError::InvalidInput(format!(
                "strategy '{}' has no legs",
                self.name
            )));
        }
        if let Some(leg) = self.legs.iter().find(|l| l.quantity == 0) {
            return Err(StrategyError::InvalidInput(format!(
                "leg {} of '{}' has zero quantity",
                leg.leg_order, self.name
            )));
        }
        Ok(())
    }

    /// Legs sorted by leg order (stable for equal orders).
    pub fn ordered_legs(&self) -> Vec<&LegTemplate> {
        let mut legs: Vec<&LegTemplate> = self.legs.iter().collect();
        legs.sort_by_key(|l| l.leg_order);
        legs
    }
}

/// Strategy as written in a run file.
///
/// Either a preset `kind` with `width`, or explicit `legs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyDefinition {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_kind")]
    pub kind: StrategyKind,
    #[serde(default)]
    pub width: Option<i64>,
    #[serde(default)]
    pub legs: Vec<LegTemplate>,
}

fn default_kind() -> StrategyKind {
    StrategyKind::Custom
}

impl StrategyDefinition {
    pub fn into_template(self) -> Result<StrategyTemplate, StrategyError> {
        let template = if !self.legs.is_empty() {
            let name = self
                .name
                .clone()
                .unwrap_or_else(|| self.kind.display_name().to_string());
            StrategyTemplate::new(name, self.kind, self.legs)
        } else {
            let width = self.width.unwrap_or(0);
            let mut preset = StrategyTemplate::preset(self.kind, width).ok_or_else(|| {
                StrategyError::InvalidInput("custom strategy needs explicit legs".to_string())
            })?;
            if let Some(name) = self.name {
                preset.name = name;
            }
            preset
        };

        template.validate()?;
        Ok(template)
    }
}
