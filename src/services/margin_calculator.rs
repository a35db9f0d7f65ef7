use crate::domain::{LiquidationOutcome, MarginHealth, Position, Side};
use crate::error::{EngineError, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

pub const MIN_LEVERAGE: u16 = 1;
pub const MAX_LEVERAGE: u16 = 20;

const MIN_MAINTENANCE_MARGIN: Decimal = dec!(0.05);
const MAX_MAINTENANCE_MARGIN: Decimal = dec!(0.075);

// Absolute margin-ratio thresholds used when no maintenance margin is
// configured on the position.
const FALLBACK_HEALTHY_RATIO: Decimal = dec!(0.03);
const FALLBACK_WARNING_RATIO: Decimal = dec!(0.01);

const WARNING_THRESHOLD_FACTOR: Decimal = dec!(1.5);

/// Pure margin math. No state, no side effects.
pub struct MarginCalculator;

impl MarginCalculator {
    /// Price at which adverse movement erodes collateral down to the
    /// maintenance threshold.
    ///
    /// `price_move = 1/leverage - maintenance_margin`; long liquidates at
    /// `entry * (1 - price_move)`, short at `entry * (1 + price_move)`.
    pub fn liquidation_price(
        entry_price: Decimal,
        side: Side,
        leverage: u16,
        maintenance_margin: Option<Decimal>,
    ) -> Result<Decimal> {
        Self::validate_entry_price(entry_price)?;
        Self::validate_leverage(leverage)?;

        let initial_margin = Decimal::ONE / Decimal::from(leverage);
        let price_move = initial_margin - maintenance_margin.unwrap_or(Decimal::ZERO);

        let factor = match side {
            Side::Long => Decimal::ONE - price_move,
            Side::Short => Decimal::ONE + price_move,
        };

        entry_price
            .checked_mul(factor)
            .ok_or_else(|| Self::overflow("liquidation price"))
    }

    /// Notional size of a position (collateral scaled by leverage).
    pub fn position_size(collateral: Decimal, leverage: u16) -> Result<Decimal> {
        collateral
            .checked_mul(Decimal::from(leverage))
            .ok_or_else(|| Self::overflow("position size"))
    }

    /// Unrealized PnL as the fractional price move from entry scaled by
    /// the notional position size.
    pub fn unrealized_pnl(
        entry_price: Decimal,
        current_price: Decimal,
        side: Side,
        collateral: Decimal,
        leverage: u16,
    ) -> Result<Decimal> {
        Self::validate_entry_price(entry_price)?;
        Self::validate_leverage(leverage)?;

        let position_size = Self::position_size(collateral, leverage)?;
        let diff = match side {
            Side::Long => current_price.checked_sub(entry_price),
            Side::Short => entry_price.checked_sub(current_price),
        };

        diff.and_then(|d| d.checked_div(entry_price))
            .and_then(|m| m.checked_mul(position_size))
            .ok_or_else(|| Self::overflow("unrealized pnl"))
    }

    /// Remaining equity (collateral + unrealized PnL) as a fraction of
    /// notional.
    pub fn margin_ratio(
        entry_price: Decimal,
        current_price: Decimal,
        side: Side,
        collateral: Decimal,
        leverage: u16,
    ) -> Result<Decimal> {
        if collateral <= Decimal::ZERO {
            return Err(EngineError::InvalidParameter(
                "collateral must be positive".into(),
            ));
        }

        let pnl = Self::unrealized_pnl(entry_price, current_price, side, collateral, leverage)?;
        let position_size = Self::position_size(collateral, leverage)?;

        collateral
            .checked_add(pnl)
            .and_then(|equity| equity.checked_div(position_size))
            .ok_or_else(|| Self::overflow("margin ratio"))
    }

    /// Boundary inclusive: a mark price exactly at the liquidation price
    /// is liquidation-eligible.
    pub fn should_liquidate(position: &Position, current_price: Decimal) -> bool {
        match position.side {
            Side::Long => current_price <= position.liquidation_price,
            Side::Short => current_price >= position.liquidation_price,
        }
    }

    /// Close-out outcome at the given mark price. Losses beyond the
    /// reserved collateral are absorbed, not carried as debt.
    pub fn liquidation_outcome(
        position: &Position,
        market_price: Decimal,
    ) -> Result<LiquidationOutcome> {
        let pnl = Self::unrealized_pnl(
            position.entry_price,
            market_price,
            position.side,
            position.collateral,
            position.leverage,
        )?;

        let remaining_collateral = position
            .collateral
            .checked_add(pnl)
            .ok_or_else(|| Self::overflow("remaining collateral"))?
            .max(Decimal::ZERO);

        Ok(LiquidationOutcome {
            position_id: position.id.clone(),
            remaining_collateral,
            pnl,
            market_price,
            liquidation_price: position.liquidation_price,
            timestamp: Utc::now(),
        })
    }

    /// `None` means "use the default health thresholds" and passes through.
    pub fn validate_maintenance_margin(margin: Option<Decimal>) -> Result<Option<Decimal>> {
        match margin {
            None => Ok(None),
            Some(m) => {
                if m < MIN_MAINTENANCE_MARGIN || m > MAX_MAINTENANCE_MARGIN {
                    return Err(EngineError::InvalidParameter(format!(
                        "maintenance margin must be between {} and {}, got {}",
                        MIN_MAINTENANCE_MARGIN, MAX_MAINTENANCE_MARGIN, m
                    )));
                }
                Ok(Some(m))
            }
        }
    }

    /// Health classification of a margin ratio.
    ///
    /// With a configured maintenance margin the warning band runs from
    /// the margin itself (exclusive) up to 1.5x the margin (exclusive);
    /// a ratio exactly at the maintenance margin is already danger.
    pub fn margin_health(margin_ratio: Decimal, maintenance_margin: Option<Decimal>) -> MarginHealth {
        match maintenance_margin {
            None => {
                if margin_ratio > FALLBACK_HEALTHY_RATIO {
                    MarginHealth::Healthy
                } else if margin_ratio > FALLBACK_WARNING_RATIO {
                    MarginHealth::Warning
                } else {
                    MarginHealth::Danger
                }
            }
            Some(mm) => {
                let warning_threshold = mm * WARNING_THRESHOLD_FACTOR;
                if margin_ratio >= warning_threshold {
                    MarginHealth::Healthy
                } else if margin_ratio > mm {
                    MarginHealth::Warning
                } else {
                    MarginHealth::Danger
                }
            }
        }
    }

    pub fn validate_leverage(leverage: u16) -> Result<()> {
        if !(MIN_LEVERAGE..=MAX_LEVERAGE).contains(&leverage) {
            return Err(EngineError::InvalidParameter(format!(
                "leverage must be between {} and {}, got {}",
                MIN_LEVERAGE, MAX_LEVERAGE, leverage
            )));
        }
        Ok(())
    }

    fn overflow(context: &str) -> EngineError {
        EngineError::InvalidParameter(format!("numeric overflow computing {}", context))
    }

    pub fn validate_entry_price(entry_price: Decimal) -> Result<()> {
        if entry_price <= Decimal::ZERO {
            return Err(EngineError::InvalidParameter(format!(
                "entry price must be positive, got {}",
                entry_price
            )));
        }
        Ok(())
    }
}
