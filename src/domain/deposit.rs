use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Tracks how much of a user's verified deposits is reserved as position
/// collateral. `used_amount` only moves through the ledger's reserve and
/// release operations and never goes below zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepositUsage {
    pub user_address: String,
    pub used_amount: Decimal,
    pub last_updated: DateTime<Utc>,
}

impl DepositUsage {
    pub fn new(user_address: impl Into<String>) -> Self {
        Self {
            user_address: user_address.into(),
            used_amount: Decimal::ZERO,
            last_updated: Utc::now(),
        }
    }
}
