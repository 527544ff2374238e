use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::domains::export::session::ExportSession;
use crate::domains::export::storage::ExportStorage;
use crate::domains::export::types::{ExportId, SessionState};
use crate::errors::{ExportError, ExportResult};

/// A registered session plus metadata readable without taking its lock
pub(crate) struct SessionCell {
    id: ExportId,
    session: Arc<Mutex<ExportSession>>,
    state: AtomicU8,
    created_at: DateTime<Utc>,
    expires_at_ms: AtomicI64,
    last_activity_ms: AtomicI64,
    evicted: AtomicBool,
}

impl SessionCell {
    fn new(session: ExportSession) -> Self {
        Self {
            id: session.id,
            state: AtomicU8::new(session.state().as_u8()),
            created_at: session.created_at,
            expires_at_ms: AtomicI64::new(session.expires_at.timestamp_millis()),
            last_activity_ms: AtomicI64::new(session.last_activity.timestamp_millis()),
            evicted: AtomicBool::new(false),
            session: Arc::new(Mutex::new(session)),
        }
    }

    fn record(&self, session: &ExportSession) {
        self.state.store(session.state().as_u8(), Ordering::Release);
        self.expires_at_ms
            .store(session.expires_at.timestamp_millis(), Ordering::Release);
        self.last_activity_ms
            .store(session.last_activity.timestamp_millis(), Ordering::Release);
    }

    pub(crate) fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at_ms.load(Ordering::Acquire) <= now.timestamp_millis()
    }

    fn last_activity(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.last_activity_ms.load(Ordering::Acquire))
            .single()
            .unwrap_or(self.created_at)
    }
}

/// Exclusive access to one session. Dropping it publishes the session's
/// state and timestamps to the store's lock-free metadata.
pub struct SessionGuard {
    guard: OwnedMutexGuard<ExportSession>,
    cell: Arc<SessionCell>,
}

impl SessionGuard {
    pub(crate) fn is_evicted(&self) -> bool {
        self.cell.is_evicted()
    }
}

impl std::fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGuard")
            .field("id", &self.guard.id)
            .field("state", &self.guard.state())
            .finish()
    }
}

impl Deref for SessionGuard {
    type Target = ExportSession;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for SessionGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.cell.record(&self.guard);
    }
}

/// Counts per state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub active: usize,
    pub capacity: usize,
    pub created: usize,
    pub accumulating: usize,
    pub finalizing: usize,
    pub ready: usize,
    pub failed: usize,
}

/// Registry of live export sessions with capacity and TTL enforcement.
///
/// Callers only ever hold export ids; the store owns the sessions and their
/// directories.
pub struct ExportStore {
    sessions: RwLock<HashMap<ExportId, Arc<SessionCell>>>,
    storage: ExportStorage,
    max_concurrent: usize,
    reclaim_completed: bool,
}

impl ExportStore {
    pub fn new(storage: ExportStorage, max_concurrent: usize, reclaim_completed: bool) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            storage,
            max_concurrent,
            reclaim_completed,
        }
    }

    pub fn storage(&self) -> &ExportStorage {
        &self.storage
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Register a session. At capacity, the oldest expired session is
    /// evicted to make room, then (when enabled) the oldest ready or failed
    /// one; otherwise `CapacityExceeded`.
    pub async fn create(&self, session: ExportSession, now: DateTime<Utc>) -> ExportResult<SessionGuard> {
        let id = session.id;
        let mut reclaimed = None;

        let cell = {
            let mut index = self.sessions.write().await;

            if index.len() >= self.max_concurrent {
                let victim = oldest(&index, |c| c.is_expired(now)).or_else(|| {
                    if self.reclaim_completed {
                        oldest(&index, |c| matches!(c.state(), SessionState::Ready | SessionState::Failed))
                    } else {
                        None
                    }
                });
                if let Some(victim) = victim.and_then(|v| index.remove(&v)) {
                    victim.evicted.store(true, Ordering::Release);
                    reclaimed = Some(victim);
                }
            }

            if index.len() >= self.max_concurrent {
                log::warn!("Export capacity of {} reached, refusing export {}", self.max_concurrent, id);
                return Err(ExportError::CapacityExceeded {
                    limit: self.max_concurrent,
                });
            }

            let cell = Arc::new(SessionCell::new(session));
            index.insert(id, cell.clone());
            cell
        };

        if let Some(victim) = reclaimed {
            log::info!("Reclaimed export {} to admit export {}", victim.id, id);
            self.release(victim).await;
        }

        let guard = cell.session.clone().lock_owned().await;
        Ok(SessionGuard { guard, cell })
    }

    async fn cell(&self, id: ExportId) -> ExportResult<Arc<SessionCell>> {
        let index = self.sessions.read().await;
        match index.get(&id) {
            Some(cell) if !cell.is_evicted() => Ok(cell.clone()),
            _ => Err(ExportError::NotFound),
        }
    }

    /// Serialized access to one session. Expired sessions are evicted on the
    /// spot and reported as `NotFound`, same as ids that never existed.
    pub async fn lock(&self, id: ExportId) -> ExportResult<SessionGuard> {
        self.lock_at(id, Utc::now()).await
    }

    pub async fn lock_at(&self, id: ExportId, now: DateTime<Utc>) -> ExportResult<SessionGuard> {
        let cell = self.cell(id).await?;
        if cell.is_expired(now) {
            self.evict(id).await;
            return Err(ExportError::NotFound);
        }

        let guard = cell.session.clone().lock_owned().await;
        if cell.is_evicted() {
            return Err(ExportError::NotFound);
        }
        Ok(SessionGuard { guard, cell })
    }

    /// Run a synchronous mutator under the session's lock.
    pub async fn update<F, R>(&self, id: ExportId, f: F) -> ExportResult<R>
    where
        F: FnOnce(&mut ExportSession) -> R,
    {
        let mut guard = self.lock(id).await?;
        Ok(f(guard.deref_mut()))
    }

    pub async fn get_state(&self, id: ExportId) -> ExportResult<SessionState> {
        Ok(self.cell(id).await?.state())
    }

    /// Explicit removal.
    pub async fn delete(&self, id: ExportId) -> ExportResult<()> {
        if self.evict(id).await {
            Ok(())
        } else {
            Err(ExportError::NotFound)
        }
    }

    /// Remove a session from the index, then release what it owns.
    pub async fn evict(&self, id: ExportId) -> bool {
        let cell = {
            let mut index = self.sessions.write().await;
            index.remove(&id)
        };
        match cell {
            Some(cell) => {
                cell.evicted.store(true, Ordering::Release);
                self.release(cell).await;
                true
            }
            None => false,
        }
    }

    async fn release(&self, cell: Arc<SessionCell>) {
        {
            let mut session = cell.session.lock().await;
            if let Err(e) = session.transition(SessionState::Expired) {
                log::debug!("Export {} evicted from state {}: {}", cell.id, session.state(), e);
            }
            session.release().await;
            cell.record(&session);
        }

        if let Err(e) = self.storage.remove_session_dir(cell.id).await {
            log::error!("Failed to release storage of export {}: {}", cell.id, e);
        } else {
            log::info!("Evicted export {}", cell.id);
        }
    }

    pub async fn list_expired(&self, now: DateTime<Utc>) -> Vec<ExportId> {
        let index = self.sessions.read().await;
        index
            .values()
            .filter(|c| c.is_expired(now))
            .map(|c| c.id)
            .collect()
    }

    /// Sessions still taking chunks that have been idle longer than `window`.
    pub async fn list_inactive(&self, now: DateTime<Utc>, window: chrono::Duration) -> Vec<ExportId> {
        let index = self.sessions.read().await;
        index
            .values()
            .filter(|c| c.state().accepts_chunks())
            .filter(|c| {
                c.last_activity()
                    .checked_add_signed(window)
                    .map_or(false, |deadline| deadline <= now)
            })
            .map(|c| c.id)
            .collect()
    }

    /// Evict every expired session. Returns how many were removed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut evicted = 0;
        for id in self.list_expired(now).await {
            if self.evict(id).await {
                evicted += 1;
            }
        }
        evicted
    }

    pub async fn stats(&self) -> StoreStats {
        let index = self.sessions.read().await;
        let mut stats = StoreStats {
            active: index.len(),
            capacity: self.max_concurrent,
            ..StoreStats::default()
        };
        for cell in index.values() {
            match cell.state() {
                SessionState::Created => stats.created += 1,
                SessionState::Accumulating => stats.accumulating += 1,
                SessionState::Finalizing => stats.finalizing += 1,
                SessionState::Ready => stats.ready += 1,
                SessionState::Failed => stats.failed += 1,
                SessionState::Expired => {}
            }
        }
        stats
    }
}

fn oldest<P>(index: &HashMap<ExportId, Arc<SessionCell>>, predicate: P) -> Option<ExportId>
where
    P: Fn(&SessionCell) -> bool,
{
    index
        .values()
        .filter(|c| predicate(c))
        .min_by_key(|c| c.created_at)
        .map(|c| c.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExportConfig;
    use crate::domains::export::accumulator::ChunkAccumulator;
    use crate::domains::export::types::{ExportFormat, ExportStrategy, ExportType};
    use tempfile::TempDir;
    use uuid::Uuid;

    fn session(storage: &ExportStorage, created_at: DateTime<Utc>, ttl: chrono::Duration) -> ExportSession {
        let id = Uuid::new_v4();
        let acc = ChunkAccumulator::new(
            id,
            ExportFormat::Csv,
            1,
            0,
            ExportStrategy::SingleFile,
            true,
            storage.clone(),
            Arc::new(ExportConfig::default()),
        );
        ExportSession::new(
            id,
            ExportType::Participants,
            ExportFormat::Csv,
            1,
            0,
            "participants".to_string(),
            created_at,
            created_at + ttl,
            acc,
        )
    }

    fn store(dir: &TempDir, max: usize, reclaim: bool) -> ExportStore {
        ExportStore::new(ExportStorage::new(dir.path()).unwrap(), max, reclaim)
    }

    #[tokio::test]
    async fn test_capacity_exceeded() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 2, false);
        let now = Utc::now();
        let ttl = chrono::Duration::hours(1);

        drop(store.create(session(store.storage(), now, ttl), now).await.unwrap());
        drop(store.create(session(store.storage(), now, ttl), now).await.unwrap());
        let err = store.create(session(store.storage(), now, ttl), now).await.unwrap_err();
        assert!(matches!(err, ExportError::CapacityExceeded { limit: 2 }));
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_expired_session_is_reclaimed_on_create() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 2, false);
        let start = Utc::now();

        let stale = session(store.storage(), start, chrono::Duration::seconds(1));
        let stale_id = stale.id;
        drop(store.create(stale, start).await.unwrap());
        let next = start + chrono::Duration::seconds(1);
        let stale_two = session(store.storage(), next, chrono::Duration::seconds(2));
        drop(store.create(stale_two, next).await.unwrap());
        store.storage().create_session_dir(stale_id).await.unwrap();

        let later = start + chrono::Duration::seconds(10);
        drop(store.create(session(store.storage(), later, chrono::Duration::hours(1)), later).await.unwrap());

        // Exactly one slot freed: the oldest expired session.
        assert_eq!(store.len().await, 2);
        assert!(!store.storage().exists(stale_id).await);
        assert!(matches!(store.lock_at(stale_id, later).await, Err(ExportError::NotFound)));
    }

    #[tokio::test]
    async fn test_reclaim_completed_on_pressure() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 1, true);
        let now = Utc::now();
        let ttl = chrono::Duration::hours(1);

        let mut guard = store.create(session(store.storage(), now, ttl), now).await.unwrap();
        guard.fail(&ExportError::Write("boom".into()));
        let failed_id = guard.id;
        drop(guard);

        drop(store.create(session(store.storage(), now, ttl), now).await.unwrap());
        assert!(matches!(store.get_state(failed_id).await, Err(ExportError::NotFound)));
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_and_their_storage() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 4, false);
        let now = Utc::now();

        let short = session(store.storage(), now, chrono::Duration::minutes(1));
        let short_id = short.id;
        drop(store.create(short, now).await.unwrap());
        store.storage().create_session_dir(short_id).await.unwrap();
        drop(store.create(session(store.storage(), now, chrono::Duration::hours(1)), now).await.unwrap());

        let later = now + chrono::Duration::minutes(5);
        assert_eq!(store.list_expired(later).await, vec![short_id]);
        assert_eq!(store.sweep(later).await, 1);
        assert_eq!(store.len().await, 1);
        assert!(!store.storage().exists(short_id).await);
    }

    #[tokio::test]
    async fn test_guard_publishes_metadata() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 4, false);
        let now = Utc::now();
        let guard = store.create(session(store.storage(), now, chrono::Duration::hours(1)), now).await.unwrap();
        let id = guard.id;
        drop(guard);

        store
            .update(id, |s| s.transition(SessionState::Accumulating))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(store.get_state(id).await.unwrap(), SessionState::Accumulating);
        assert_eq!(store.stats().await.accumulating, 1);

        let idle = now + chrono::Duration::minutes(20);
        assert_eq!(store.list_inactive(idle, chrono::Duration::minutes(10)).await, vec![id]);
        assert!(store
            .list_inactive(now + chrono::Duration::minutes(5), chrono::Duration::minutes(10))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_delete_unknown_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, 1, false);
        assert!(matches!(store.delete(Uuid::new_v4()).await, Err(ExportError::NotFound)));
    }
}
