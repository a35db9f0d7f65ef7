mod deposit;
mod position;

pub use deposit::DepositUsage;
pub use position::{
    LiquidationOutcome, MarginHealth, Position, PositionStatus, PositionSummary, Side,
};
