use crate::domain::{Position, PositionStatus};
use crate::error::{EngineError, Result};
use crate::infrastructure::RemoteStore;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const SNAPSHOT_VERSION: &str = "1.0.0";

/// Field-level merge applied by [`PositionStore::update`]. Absent fields
/// keep their current value.
#[derive(Debug, Clone, Default)]
pub struct PositionUpdate {
    pub current_price: Option<Decimal>,
    pub status: Option<PositionStatus>,
}

impl PositionUpdate {
    pub fn price(current_price: Decimal) -> Self {
        Self {
            current_price: Some(current_price),
            ..Self::default()
        }
    }

    fn status(status: PositionStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub total_positions: usize,
    pub active_positions: usize,
    pub total_users: usize,
    pub pending_resync: usize,
}

struct StoreState {
    /// Primary record map: id -> position.
    positions: HashMap<String, Position>,
    /// Reverse index: user -> ids of every position ever created for them.
    user_positions: HashMap<String, BTreeSet<String>>,
    /// Ids whose last mirror attempt failed; retried best-effort.
    pending_resync: BTreeSet<String>,
}

/// On-disk layout. The two maps round-trip exactly across restarts.
#[derive(Serialize, Deserialize)]
struct StoreSnapshot {
    positions: BTreeMap<String, Position>,
    user_positions: BTreeMap<String, Vec<String>>,
    metadata: SnapshotMetadata,
}

#[derive(Serialize, Deserialize)]
struct SnapshotMetadata {
    last_updated: DateTime<Utc>,
    version: String,
}

/// Authoritative position store with a durable local snapshot and a
/// best-effort remote mirror.
///
/// Every mutation persists the local snapshot before returning success;
/// a failed snapshot write rolls the in-memory change back so no caller
/// ever observes a state that did not reach disk. Writers serialize the
/// read-modify-persist sequence on one lock, so two mutations of an id
/// never interleave, while reads only wait for that short critical
/// section. Mirror calls run after the lock is released, bounded by a
/// timeout; they never fail the operation and misses are recorded in the
/// pending-resync set.
pub struct PositionStore<R: RemoteStore> {
    state: RwLock<StoreState>,
    path: PathBuf,
    remote: R,
    remote_timeout: Duration,
}

impl<R: RemoteStore> PositionStore<R> {
    /// Opens the store, restoring the snapshot at `path` if one exists.
    /// An unreadable or corrupt snapshot logs a warning and starts empty.
    pub fn open(path: impl Into<PathBuf>, remote: R, remote_timeout: Duration) -> Self {
        let path = path.into();
        let state = match Self::load_snapshot(&path) {
            Ok(Some(state)) => {
                info!("loaded {} positions from {}", state.positions.len(), path.display());
                state
            }
            Ok(None) => {
                info!("no position snapshot at {}, starting fresh", path.display());
                StoreState::empty()
            }
            Err(e) => {
                warn!("failed to load position snapshot from {}: {}", path.display(), e);
                StoreState::empty()
            }
        };

        Self {
            state: RwLock::new(state),
            path,
            remote,
            remote_timeout,
        }
    }

    fn load_snapshot(path: &Path) -> Result<Option<StoreState>> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(path)?;
        let snapshot: StoreSnapshot = serde_json::from_slice(&bytes)?;

        let positions: HashMap<String, Position> = snapshot.positions.into_iter().collect();
        let user_positions = snapshot
            .user_positions
            .into_iter()
            .map(|(user, ids)| (user, ids.into_iter().collect()))
            .collect();

        Ok(Some(StoreState {
            positions,
            user_positions,
            pending_resync: BTreeSet::new(),
        }))
    }

    fn persist(&self, state: &StoreState) -> Result<()> {
        let snapshot = StoreSnapshot {
            positions: state.positions.clone().into_iter().collect(),
            user_positions: state
                .user_positions
                .iter()
                .map(|(user, ids)| (user.clone(), ids.iter().cloned().collect()))
                .collect(),
            metadata: SnapshotMetadata {
                last_updated: Utc::now(),
                version: SNAPSHOT_VERSION.to_string(),
            },
        };

        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }

    // Mirror helpers run without the state lock; they re-acquire it only
    // to record the result, so a slow remote never stalls other callers.
    async fn mirror_put(&self, position: &Position) {
        let outcome = timeout(self.remote_timeout, self.remote.put(position)).await;
        let mut state = self.state.write().await;
        match outcome {
            Ok(Ok(())) => {
                state.pending_resync.remove(&position.id);
            }
            Ok(Err(e)) => {
                warn!("remote mirror failed for {}, marked for resync: {}", position.id, e);
                state.pending_resync.insert(position.id.clone());
            }
            Err(_) => {
                warn!("remote mirror timed out for {}, marked for resync", position.id);
                state.pending_resync.insert(position.id.clone());
            }
        }
    }

    async fn mirror_status(&self, position: &Position) {
        let call = self
            .remote
            .mark_status(&position.id, &position.user_address, position.status);
        let outcome = timeout(self.remote_timeout, call).await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(
                    "remote status update failed for {}, marked for resync: {}",
                    position.id, e
                );
                self.state.write().await.pending_resync.insert(position.id.clone());
            }
            Err(_) => {
                warn!(
                    "remote status update timed out for {}, marked for resync",
                    position.id
                );
                self.state.write().await.pending_resync.insert(position.id.clone());
            }
        }
    }

    /// Inserts a new position. A successful return guarantees the record
    /// reached the local snapshot; the remote mirror is best-effort.
    pub async fn create(&self, position: Position) -> Result<()> {
        let id = position.id.clone();
        let user = position.user_address.clone();

        {
            let mut state = self.state.write().await;

            if state.positions.contains_key(&id) {
                return Err(EngineError::Conflict(id));
            }

            state.positions.insert(id.clone(), position.clone());
            state
                .user_positions
                .entry(user.clone())
                .or_default()
                .insert(id.clone());

            if let Err(e) = self.persist(&state) {
                state.positions.remove(&id);
                if let Some(ids) = state.user_positions.get_mut(&user) {
                    ids.remove(&id);
                    if ids.is_empty() {
                        state.user_positions.remove(&user);
                    }
                }
                return Err(e);
            }
        }

        self.mirror_put(&position).await;

        info!("created position {} for {}", id, user);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Position> {
        let state = self.state.read().await;
        state
            .positions
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    /// Active positions for a user, local-first with remote merge.
    ///
    /// Remote-only positions are adopted into the local store. A remote
    /// fetch failure degrades gracefully to the local view.
    pub async fn get_user_positions(&self, user_address: &str) -> Vec<Position> {
        let mut result: Vec<Position> = {
            let state = self.state.read().await;
            state
                .user_positions
                .get(user_address)
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| state.positions.get(id))
                        .filter(|p| p.is_active())
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };

        match timeout(self.remote_timeout, self.remote.get_by_user(user_address)).await {
            Ok(Ok(remote_positions)) => {
                let mut state = self.state.write().await;
                let mut adopted: Vec<Position> = Vec::new();
                for position in remote_positions {
                    if state.positions.contains_key(&position.id) || !position.is_active() {
                        continue;
                    }
                    debug!("adopting remote position {} for {}", position.id, user_address);
                    state
                        .positions
                        .insert(position.id.clone(), position.clone());
                    state
                        .user_positions
                        .entry(position.user_address.clone())
                        .or_default()
                        .insert(position.id.clone());
                    adopted.push(position);
                }
                if !adopted.is_empty() {
                    if let Err(e) = self.persist(&state) {
                        // adoption is durable or not at all
                        for position in &adopted {
                            state.positions.remove(&position.id);
                            if let Some(ids) =
                                state.user_positions.get_mut(&position.user_address)
                            {
                                ids.remove(&position.id);
                                if ids.is_empty() {
                                    state.user_positions.remove(&position.user_address);
                                }
                            }
                        }
                        warn!("failed to persist adopted remote positions, dropped: {}", e);
                    } else {
                        result.extend(adopted);
                    }
                }
            }
            Ok(Err(e)) => {
                warn!("remote fetch failed for {}, serving local only: {}", user_address, e);
            }
            Err(_) => {
                warn!("remote fetch timed out for {}, serving local only", user_address);
            }
        }

        result
    }

    /// All active positions across users, for the liquidation sweep.
    pub async fn get_all_active(&self) -> Vec<Position> {
        let state = self.state.read().await;
        let mut active: Vec<Position> = state
            .positions
            .values()
            .filter(|p| p.is_active())
            .cloned()
            .collect();
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        active
    }

    /// Field-level merge. The persisted local state is authoritative for
    /// the next read regardless of the mirror result.
    pub async fn update(&self, id: &str, update: PositionUpdate) -> Result<Position> {
        let updated = {
            let mut state = self.state.write().await;
            self.apply_update(&mut state, id, update)?
        };
        self.mirror_put(&updated).await;
        Ok(updated)
    }

    /// Moves an active position into a terminal state, with the matching
    /// remote lifecycle call. Returns `None` when the position is already
    /// in the target state, so exactly one racing caller observes the
    /// transition and any settlement tied to it runs once.
    pub async fn transition_status(
        &self,
        id: &str,
        target: PositionStatus,
    ) -> Result<Option<Position>> {
        if target == PositionStatus::Active {
            return Err(EngineError::InvalidParameter(
                "transition target must be closed or liquidated".into(),
            ));
        }

        let updated = {
            let mut state = self.state.write().await;

            let current = state
                .positions
                .get(id)
                .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
            if current.status == target {
                return Ok(None);
            }

            self.apply_update(&mut state, id, PositionUpdate::status(target))?
        };
        self.mirror_status(&updated).await;

        info!("position {} transitioned to {:?}", id, target);
        Ok(Some(updated))
    }

    fn apply_update(
        &self,
        state: &mut StoreState,
        id: &str,
        update: PositionUpdate,
    ) -> Result<Position> {
        let previous = state
            .positions
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;

        if previous.is_terminal() {
            return Err(EngineError::InvalidState(format!(
                "position {} is {:?} and can no longer be modified",
                id, previous.status
            )));
        }

        let mut updated = previous.clone();
        if let Some(price) = update.current_price {
            updated.current_price = price;
        }
        if let Some(status) = update.status {
            updated.status = status;
        }

        state.positions.insert(id.to_string(), updated.clone());
        if let Err(e) = self.persist(state) {
            state.positions.insert(id.to_string(), previous);
            return Err(e);
        }

        Ok(updated)
    }

    /// Administrative hard delete. Normal flows terminate positions via
    /// [`Self::transition_status`] and keep the record.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;

        let removed = state
            .positions
            .remove(id)
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;

        let user = removed.user_address.clone();
        if let Some(ids) = state.user_positions.get_mut(&user) {
            ids.remove(id);
            if ids.is_empty() {
                state.user_positions.remove(&user);
            }
        }
        state.pending_resync.remove(id);

        if let Err(e) = self.persist(&state) {
            state.positions.insert(id.to_string(), removed);
            state
                .user_positions
                .entry(user)
                .or_default()
                .insert(id.to_string());
            return Err(e);
        }

        info!("deleted position {}", id);
        Ok(())
    }

    /// Re-attempts the mirror for every pending id. Best-effort, no
    /// delivery guarantee; ids deleted locally are dropped from the set.
    /// The lock is taken per id, never across a remote call.
    pub async fn resync_pending(&self) -> usize {
        let pending: Vec<String> = {
            let state = self.state.read().await;
            state.pending_resync.iter().cloned().collect()
        };
        let mut resynced = 0;

        for id in pending {
            let position = {
                let state = self.state.read().await;
                state.positions.get(&id).cloned()
            };
            let Some(position) = position else {
                self.state.write().await.pending_resync.remove(&id);
                continue;
            };
            match timeout(self.remote_timeout, self.remote.put(&position)).await {
                Ok(Ok(())) => {
                    self.state.write().await.pending_resync.remove(&id);
                    resynced += 1;
                    debug!("resynced position {} to remote", id);
                }
                Ok(Err(e)) => {
                    debug!("resync still failing for {}: {}", id, e);
                }
                Err(_) => {
                    debug!("resync timed out for {}", id);
                }
            }
        }

        resynced
    }

    pub async fn stats(&self) -> StoreStats {
        let state = self.state.read().await;
        StoreStats {
            total_positions: state.positions.len(),
            active_positions: state.positions.values().filter(|p| p.is_active()).count(),
            total_users: state.user_positions.len(),
            pending_resync: state.pending_resync.len(),
        }
    }
}

impl StoreState {
    fn empty() -> Self {
        Self {
            positions: HashMap::new(),
            user_positions: HashMap::new(),
            pending_resync: BTreeSet::new(),
        }
    }
}
