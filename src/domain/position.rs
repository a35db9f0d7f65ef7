use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A leveraged position against a reference price feed.
///
/// `entry_price`, `side`, `collateral`, `leverage` and the derived
/// `liquidation_price` are fixed at creation; only `current_price` and
/// `status` change afterwards. Terminal records are retained for history,
/// never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub market_id: String,
    pub market_name: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub collateral: Decimal,
    pub leverage: u16,
    pub liquidation_price: Decimal,
    pub maintenance_margin: Option<Decimal>,
    pub user_address: String,
    pub status: PositionStatus,
    pub created_at: DateTime<Utc>,
}

impl Position {
    pub fn is_active(&self) -> bool {
        matches!(self.status, PositionStatus::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            PositionStatus::Closed | PositionStatus::Liquidated
        )
    }

    pub fn new_id() -> String {
        format!("pos_{}", uuid::Uuid::new_v4())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Long,
    Short,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Active,
    Closed,
    Liquidated,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MarginHealth {
    Healthy,
    Warning,
    Danger,
}

/// Close-out record for a forced liquidation. Any shortfall beyond the
/// reserved collateral is absorbed, so `remaining_collateral` is never
/// negative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationOutcome {
    pub position_id: String,
    pub remaining_collateral: Decimal,
    pub pnl: Decimal,
    pub market_price: Decimal,
    pub liquidation_price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Position enriched with live risk figures for user-facing listings.
/// `margin_ratio` and `pnl_percentage` are reported in percent.
#[derive(Debug, Clone, Serialize)]
pub struct PositionSummary {
    #[serde(flatten)]
    pub position: Position,
    pub margin_ratio: Decimal,
    pub health: MarginHealth,
    pub pnl: Decimal,
    pub pnl_percentage: Decimal,
    pub position_size: Decimal,
}
