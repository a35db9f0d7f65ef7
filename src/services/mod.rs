pub mod balance_ledger;
pub mod margin_calculator;
pub mod position_manager;
pub mod position_store;

pub use balance_ledger::BalanceLedger;
pub use margin_calculator::MarginCalculator;
pub use position_manager::{
    ClosedPosition, CreatePositionRequest, PositionManager, PriceUpdateReport, SweepReport,
};
pub use position_store::{PositionStore, PositionUpdate, StoreStats};
