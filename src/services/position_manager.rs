use crate::domain::{LiquidationOutcome, Position, PositionStatus, PositionSummary, Side};
use crate::error::{EngineError, Result};
use crate::infrastructure::RemoteStore;
use crate::services::{
    BalanceLedger, MarginCalculator, PositionStore, PositionUpdate, StoreStats,
};
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct CreatePositionRequest {
    pub market_id: String,
    pub market_name: String,
    pub side: Side,
    pub entry_price: Decimal,
    pub collateral: Decimal,
    pub leverage: u16,
    pub maintenance_margin: Option<Decimal>,
    pub user_address: String,
    /// Verified deposit total in quote currency, computed by the caller
    /// from chain history at call time.
    pub total_deposits: Decimal,
}

#[derive(Debug, Clone)]
pub struct ClosedPosition {
    pub position: Position,
    pub pnl: Decimal,
    pub final_balance: Decimal,
}

/// Batch sweep result: successful liquidations plus per-position error
/// messages for the ones that failed. A failure never aborts the sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub liquidations: Vec<LiquidationOutcome>,
    pub errors: Vec<String>,
}

/// Result of a market-wide mark price update: how many positions took the
/// new price, plus a message per position whose write failed.
#[derive(Debug, Default)]
pub struct PriceUpdateReport {
    pub updated: usize,
    pub errors: Vec<String>,
}

/// Engine facade tying the margin calculator, position store and balance
/// ledger together into the externally exposed operations.
pub struct PositionManager<R: RemoteStore> {
    store: Arc<PositionStore<R>>,
    ledger: Arc<BalanceLedger>,
}

impl<R: RemoteStore> PositionManager<R> {
    pub fn new(store: Arc<PositionStore<R>>, ledger: Arc<BalanceLedger>) -> Self {
        Self { store, ledger }
    }

    /// Opens a leveraged position, reserving its collateral from the
    /// user's available balance. Validation fails fast before any state
    /// is touched.
    pub async fn create_position(&self, req: CreatePositionRequest) -> Result<Position> {
        MarginCalculator::validate_entry_price(req.entry_price)?;
        MarginCalculator::validate_leverage(req.leverage)?;
        if req.collateral <= Decimal::ZERO {
            return Err(EngineError::InvalidParameter(format!(
                "collateral must be positive, got {}",
                req.collateral
            )));
        }
        let maintenance_margin =
            MarginCalculator::validate_maintenance_margin(req.maintenance_margin)?;

        let available = self
            .ledger
            .available_balance(&req.user_address, req.total_deposits)
            .await;
        if available < req.collateral {
            return Err(EngineError::InsufficientBalance {
                required: req.collateral,
                available,
            });
        }

        let liquidation_price = MarginCalculator::liquidation_price(
            req.entry_price,
            req.side,
            req.leverage,
            maintenance_margin,
        )?;

        self.ledger.reserve(&req.user_address, req.collateral).await?;

        let position = Position {
            id: Position::new_id(),
            market_id: req.market_id,
            market_name: req.market_name,
            side: req.side,
            entry_price: req.entry_price,
            current_price: req.entry_price,
            collateral: req.collateral,
            leverage: req.leverage,
            liquidation_price,
            maintenance_margin,
            user_address: req.user_address.clone(),
            status: PositionStatus::Active,
            created_at: Utc::now(),
        };

        if let Err(e) = self.store.create(position.clone()).await {
            // Keep used_amount consistent with the sum of active collateral.
            if let Err(release_err) = self
                .ledger
                .release(&req.user_address, req.collateral)
                .await
            {
                error!(
                    "failed to release reservation after store error for {}: {}",
                    req.user_address, release_err
                );
            }
            return Err(e);
        }

        info!(
            "opened {:?} position {} on {} at {} with {}x leverage, liquidation at {}",
            position.side,
            position.id,
            position.market_name,
            position.entry_price,
            position.leverage,
            position.liquidation_price
        );

        Ok(position)
    }

    /// Voluntary close at the current mark price. Releases the final
    /// balance (floored at zero) back to the ledger.
    pub async fn close_position(&self, id: &str, user_address: &str) -> Result<ClosedPosition> {
        let position = self.store.get(id).await?;

        if position.user_address != user_address {
            return Err(EngineError::Unauthorized(format!(
                "position {} is not owned by {}",
                id, user_address
            )));
        }
        if !position.is_active() {
            return Err(EngineError::InvalidState(format!(
                "position {} is {:?}, only active positions can be closed",
                id, position.status
            )));
        }

        let pnl = MarginCalculator::unrealized_pnl(
            position.entry_price,
            position.current_price,
            position.side,
            position.collateral,
            position.leverage,
        )?;
        let final_balance = position
            .collateral
            .checked_add(pnl)
            .ok_or_else(|| {
                EngineError::InvalidParameter("numeric overflow computing final balance".into())
            })?
            .max(Decimal::ZERO);

        // Only the caller that performs the transition settles funds; a
        // concurrent close that loses the race must not release again.
        let position = self
            .store
            .transition_status(id, PositionStatus::Closed)
            .await?
            .ok_or_else(|| {
                EngineError::InvalidState(format!("position {} is already closed", id))
            })?;
        self.ledger.release(user_address, final_balance).await?;

        info!(
            "closed position {} at {}: pnl {}, {} returned to balance",
            id, position.current_price, pnl, final_balance
        );

        Ok(ClosedPosition {
            position,
            pnl,
            final_balance,
        })
    }

    /// Forced liquidation of a single position, re-validated against the
    /// supplied mark price (or the position's current price). Liquidation
    /// forfeits the reserved collateral; nothing returns to the ledger.
    pub async fn liquidate_position(
        &self,
        id: &str,
        market_price: Option<Decimal>,
    ) -> Result<LiquidationOutcome> {
        let position = self.store.get(id).await?;

        if !position.is_active() {
            return Err(EngineError::InvalidState(format!(
                "position {} is {:?}, only active positions can be liquidated",
                id, position.status
            )));
        }

        let price = market_price.unwrap_or(position.current_price);
        if price <= Decimal::ZERO {
            return Err(EngineError::InvalidParameter(format!(
                "market price must be positive, got {}",
                price
            )));
        }

        if !MarginCalculator::should_liquidate(&position, price) {
            return Err(EngineError::PreconditionFailed(format!(
                "position {} does not meet liquidation criteria at price {} (liquidation price {})",
                id, price, position.liquidation_price
            )));
        }

        let outcome = MarginCalculator::liquidation_outcome(&position, price)?;
        self.store
            .transition_status(id, PositionStatus::Liquidated)
            .await?
            .ok_or_else(|| {
                EngineError::InvalidState(format!("position {} is already liquidated", id))
            })?;

        info!(
            "liquidated position {} at {}: pnl {}, remaining collateral {}",
            id, price, outcome.pnl, outcome.remaining_collateral
        );

        Ok(outcome)
    }

    /// Batch sweep over every active position. Each position is handled
    /// independently; failures are reported per position and the sweep
    /// carries on.
    pub async fn sweep_liquidations(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for position in self.store.get_all_active().await {
            if !MarginCalculator::should_liquidate(&position, position.current_price) {
                continue;
            }

            let outcome = match MarginCalculator::liquidation_outcome(
                &position,
                position.current_price,
            ) {
                Ok(outcome) => outcome,
                Err(e) => {
                    report
                        .errors
                        .push(format!("failed to liquidate {}: {}", position.id, e));
                    continue;
                }
            };

            match self
                .store
                .transition_status(&position.id, PositionStatus::Liquidated)
                .await
            {
                Ok(Some(_)) => {
                    info!(
                        "liquidated position {} at {}",
                        position.id, position.current_price
                    );
                    report.liquidations.push(outcome);
                }
                // already liquidated by a concurrent caller
                Ok(None) => {}
                Err(e) => {
                    warn!("sweep failed to liquidate {}: {}", position.id, e);
                    report
                        .errors
                        .push(format!("failed to liquidate {}: {}", position.id, e));
                }
            }
        }

        report
    }

    /// Applies an external mark price to every active position on the
    /// market. Failed writes do not stop the pass; each one is reported
    /// alongside the updated count.
    pub async fn update_mark_price(
        &self,
        market_id: &str,
        new_price: Decimal,
    ) -> Result<PriceUpdateReport> {
        if new_price <= Decimal::ZERO {
            return Err(EngineError::InvalidParameter(format!(
                "price must be positive, got {}",
                new_price
            )));
        }

        let mut report = PriceUpdateReport::default();
        for position in self.store.get_all_active().await {
            if position.market_id != market_id {
                continue;
            }
            match self
                .store
                .update(&position.id, PositionUpdate::price(new_price))
                .await
            {
                Ok(_) => report.updated += 1,
                Err(e) => {
                    warn!("failed to update price for {}: {}", position.id, e);
                    report
                        .errors
                        .push(format!("failed to update price for {}: {}", position.id, e));
                }
            }
        }

        info!(
            "updated {} positions on {} to price {}",
            report.updated, market_id, new_price
        );
        Ok(report)
    }

    /// Active positions for a user (local merged with remote), enriched
    /// with margin ratio, health and PnL figures.
    pub async fn list_user_positions(&self, user_address: &str) -> Result<Vec<PositionSummary>> {
        let positions = self.store.get_user_positions(user_address).await;

        let mut summaries = Vec::with_capacity(positions.len());
        for position in positions {
            let ratio = MarginCalculator::margin_ratio(
                position.entry_price,
                position.current_price,
                position.side,
                position.collateral,
                position.leverage,
            )?;
            let health = MarginCalculator::margin_health(ratio, position.maintenance_margin);
            let pnl = MarginCalculator::unrealized_pnl(
                position.entry_price,
                position.current_price,
                position.side,
                position.collateral,
                position.leverage,
            )?;
            let pnl_percentage = pnl / position.collateral * dec!(100);
            let position_size =
                MarginCalculator::position_size(position.collateral, position.leverage)?;

            summaries.push(PositionSummary {
                margin_ratio: ratio * dec!(100),
                health,
                pnl,
                pnl_percentage,
                position_size,
                position,
            });
        }

        Ok(summaries)
    }

    /// Admin/monitoring view of every active position.
    pub async fn get_all_active(&self) -> Vec<Position> {
        self.store.get_all_active().await
    }

    pub async fn stats(&self) -> StoreStats {
        self.store.stats().await
    }
}
