use crate::domain::{Position, PositionStatus};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Narrow interface to the slower, eventually-available remote mirror of
/// the position store. The local store is always the source of truth;
/// implementations may fail or time out and the caller records the miss
/// for a later resync.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Upsert the full position record.
    async fn put(&self, position: &Position) -> Result<()>;

    /// Fetch the remote's active positions for one user.
    async fn get_by_user(&self, user_address: &str) -> Result<Vec<Position>>;

    /// Record a lifecycle transition for a position owned by `user_address`.
    async fn mark_status(
        &self,
        position_id: &str,
        user_address: &str,
        status: PositionStatus,
    ) -> Result<()>;
}

/// Simulated remote backing keyed by position id. Stands in for a real
/// on-chain store; always available, settles immediately.
#[derive(Default)]
pub struct InMemoryRemoteStore {
    records: RwLock<HashMap<String, Position>>,
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record directly, bypassing the local store. Used to model
    /// positions that exist remotely but not locally yet.
    pub async fn seed(&self, position: Position) {
        self.records
            .write()
            .await
            .insert(position.id.clone(), position);
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn put(&self, position: &Position) -> Result<()> {
        self.records
            .write()
            .await
            .insert(position.id.clone(), position.clone());
        debug!("remote put for position {}", position.id);
        Ok(())
    }

    async fn get_by_user(&self, user_address: &str) -> Result<Vec<Position>> {
        let records = self.records.read().await;
        Ok(records
            .values()
            .filter(|p| p.user_address == user_address && p.is_active())
            .cloned()
            .collect())
    }

    async fn mark_status(
        &self,
        position_id: &str,
        user_address: &str,
        status: PositionStatus,
    ) -> Result<()> {
        let mut records = self.records.write().await;
        if let Some(position) = records.get_mut(position_id) {
            if position.user_address == user_address {
                position.status = status;
            }
        }
        debug!("remote mark_status {:?} for position {}", status, position_id);
        Ok(())
    }
}
