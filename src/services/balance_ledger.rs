use crate::domain::DepositUsage;
use crate::error::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Serialize, Deserialize)]
struct LedgerSnapshot {
    usage: BTreeMap<String, DepositUsage>,
}

/// Per-user collateral reservation ledger.
///
/// Tracks only the used slice of each user's verified deposits; the
/// deposit total itself is computed externally and passed in at call
/// time. `reserve` therefore never rejects on its own; the sufficiency
/// check belongs to the caller, which holds the deposit total. Every
/// mutation persists synchronously before returning.
pub struct BalanceLedger {
    state: RwLock<HashMap<String, DepositUsage>>,
    path: PathBuf,
}

impl BalanceLedger {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let usage = match Self::load_snapshot(&path) {
            Ok(Some(usage)) => {
                info!("loaded deposit usage for {} users from {}", usage.len(), path.display());
                usage
            }
            Ok(None) => HashMap::new(),
            Err(e) => {
                warn!("failed to load ledger snapshot from {}: {}", path.display(), e);
                HashMap::new()
            }
        };

        Self {
            state: RwLock::new(usage),
            path,
        }
    }

    fn load_snapshot(path: &Path) -> Result<Option<HashMap<String, DepositUsage>>> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(path)?;
        let snapshot: LedgerSnapshot = serde_json::from_slice(&bytes)?;
        Ok(Some(snapshot.usage.into_iter().collect()))
    }

    fn persist(&self, state: &HashMap<String, DepositUsage>) -> Result<()> {
        let snapshot = LedgerSnapshot {
            usage: state.clone().into_iter().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }

    pub async fn used_amount(&self, user_address: &str) -> Decimal {
        let state = self.state.read().await;
        state
            .get(user_address)
            .map(|u| u.used_amount)
            .unwrap_or(Decimal::ZERO)
    }

    /// `max(0, total_deposits - used)`.
    pub async fn available_balance(&self, user_address: &str, total_deposits: Decimal) -> Decimal {
        let used = self.used_amount(user_address).await;
        (total_deposits - used).max(Decimal::ZERO)
    }

    /// Increases the user's used amount. Always succeeds; the caller is
    /// responsible for checking availability first.
    pub async fn reserve(&self, user_address: &str, amount: Decimal) -> Result<()> {
        self.adjust(user_address, |used| used + amount).await
    }

    /// Decreases the user's used amount, floored at zero so a double
    /// release can never produce negative debt.
    pub async fn release(&self, user_address: &str, amount: Decimal) -> Result<()> {
        self.adjust(user_address, |used| (used - amount).max(Decimal::ZERO))
            .await
    }

    async fn adjust(
        &self,
        user_address: &str,
        apply: impl FnOnce(Decimal) -> Decimal,
    ) -> Result<()> {
        let mut state = self.state.write().await;

        let previous = state.get(user_address).cloned();
        let mut usage = previous
            .clone()
            .unwrap_or_else(|| DepositUsage::new(user_address));
        usage.used_amount = apply(usage.used_amount);
        usage.last_updated = Utc::now();

        state.insert(user_address.to_string(), usage);

        if let Err(e) = self.persist(&state) {
            match previous {
                Some(usage) => state.insert(user_address.to_string(), usage),
                None => state.remove(user_address),
            };
            return Err(e);
        }

        Ok(())
    }
}
