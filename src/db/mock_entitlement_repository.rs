use crate::db::{
    billing_event_log::BillingEventLog,
    entitlement_repository::{EntitlementRepository, EntitlementTransaction},
    entitlement_store::EntitlementStore,
    usage_ledger::UsageLedger,
};
use crate::models::{
    entitlement::{EntitlementSnapshot, SnapshotUpdate},
    usage::UsageCounters,
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use time::OffsetDateTime;
use tokio::sync::{Mutex as RowMutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Clone, Default)]
struct MockState {
    users: HashSet<Uuid>,
    snapshots: HashMap<Uuid, EntitlementSnapshot>,
    counters: HashMap<Uuid, UsageCounters>,
    events: HashMap<String, OffsetDateTime>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum RowKey {
    Usage(Uuid),
    Snapshot(Uuid),
    Event(String),
}

/// In-memory store with Postgres-like semantics: row locks are held until the
/// transaction ends, writes stay private until commit, read-only transactions
/// see the state as of `begin_read_only`.
#[derive(Clone, Default)]
pub struct MockEntitlementRepository {
    state: Arc<Mutex<MockState>>,
    row_locks: Arc<DashMap<RowKey, Arc<RowMutex<()>>>>,
    transient_failures: Arc<AtomicUsize>,
    unavailable: Arc<AtomicBool>,
    pub begins: Arc<AtomicUsize>,
    pub commits: Arc<AtomicUsize>,
}

impl MockEntitlementRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_user(&self) -> Uuid {
        let user_id = Uuid::new_v4();
        self.state.lock().unwrap().users.insert(user_id);
        user_id
    }

    pub fn set_snapshot(&self, snapshot: EntitlementSnapshot) {
        let mut state = self.state.lock().unwrap();
        state.users.insert(snapshot.user_id);
        state.snapshots.insert(snapshot.user_id, snapshot);
    }

    pub fn set_counters(&self, user_id: Uuid, counters: UsageCounters) {
        self.state
            .lock()
            .unwrap()
            .counters
            .insert(user_id, counters);
    }

    pub fn mark_event_processed(&self, event_id: &str, processed_at: OffsetDateTime) {
        self.state
            .lock()
            .unwrap()
            .events
            .insert(event_id.to_string(), processed_at);
    }

    pub fn snapshot(&self, user_id: Uuid) -> Option<EntitlementSnapshot> {
        self.state.lock().unwrap().snapshots.get(&user_id).cloned()
    }

    pub fn counters(&self, user_id: Uuid) -> UsageCounters {
        self.state
            .lock()
            .unwrap()
            .counters
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn recorded_events(&self) -> Vec<String> {
        self.state.lock().unwrap().events.keys().cloned().collect()
    }

    pub fn event_processed_at(&self, event_id: &str) -> Option<OffsetDateTime> {
        self.state.lock().unwrap().events.get(event_id).copied()
    }

    /// The next `count` calls to `begin*` fail with a pool timeout.
    pub fn fail_next_begins(&self, count: usize) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn open(&self, read_only: bool) -> Result<Box<dyn EntitlementTransaction>, sqlx::Error> {
        self.begins.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(sqlx::Error::Protocol("mock database unavailable".into()));
        }
        if self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(sqlx::Error::PoolTimedOut);
        }

        let read_view = read_only.then(|| self.state.lock().unwrap().clone());
        Ok(Box::new(MockEntitlementTransaction {
            state: Arc::clone(&self.state),
            row_locks: Arc::clone(&self.row_locks),
            commits: Arc::clone(&self.commits),
            read_view,
            held: HashMap::new(),
            pending: MockState::default(),
        }))
    }
}

#[async_trait]
impl EntitlementRepository for MockEntitlementRepository {
    async fn begin(&self) -> Result<Box<dyn EntitlementTransaction>, sqlx::Error> {
        self.open(false)
    }

    async fn begin_read_only(&self) -> Result<Box<dyn EntitlementTransaction>, sqlx::Error> {
        self.open(true)
    }

    async fn prune_processed_events(
        &self,
        older_than: OffsetDateTime,
    ) -> Result<u64, sqlx::Error> {
        let mut state = self.state.lock().unwrap();
        let before = state.events.len();
        state.events.retain(|_, processed_at| *processed_at >= older_than);
        Ok((before - state.events.len()) as u64)
    }
}

pub struct MockEntitlementTransaction {
    state: Arc<Mutex<MockState>>,
    row_locks: Arc<DashMap<RowKey, Arc<RowMutex<()>>>>,
    commits: Arc<AtomicUsize>,
    read_view: Option<MockState>,
    held: HashMap<RowKey, OwnedMutexGuard<()>>,
    pending: MockState,
}

impl MockEntitlementTransaction {
    async fn lock_row(&mut self, key: RowKey) {
        if self.held.contains_key(&key) {
            return;
        }
        let lock = Arc::clone(&*self.row_locks.entry(key.clone()).or_default());
        let guard = lock.lock_owned().await;
        self.held.insert(key, guard);
    }

    fn ensure_writable(&self) -> Result<(), sqlx::Error> {
        if self.read_view.is_some() {
            return Err(sqlx::Error::Protocol(
                "cannot write in a read-only transaction".into(),
            ));
        }
        Ok(())
    }

    fn committed<R>(&self, read: impl FnOnce(&MockState) -> R) -> R {
        match &self.read_view {
            Some(view) => read(view),
            None => read(&self.state.lock().unwrap()),
        }
    }

    fn current_counters(&self, user_id: Uuid) -> UsageCounters {
        if let Some(counters) = self.pending.counters.get(&user_id) {
            return counters.clone();
        }
        self.committed(|state| state.counters.get(&user_id).cloned().unwrap_or_default())
    }

    fn current_snapshot(&self, user_id: Uuid) -> Option<EntitlementSnapshot> {
        if let Some(snapshot) = self.pending.snapshots.get(&user_id) {
            return Some(snapshot.clone());
        }
        self.committed(|state| state.snapshots.get(&user_id).cloned())
    }

    async fn update_counters<F>(
        &mut self,
        user_id: Uuid,
        update: F,
    ) -> Result<UsageCounters, sqlx::Error>
    where
        F: FnOnce(&mut UsageCounters) + Send,
    {
        self.ensure_writable()?;
        self.lock_row(RowKey::Usage(user_id)).await;
        let mut counters = self.current_counters(user_id);
        update(&mut counters);
        self.pending.counters.insert(user_id, counters.clone());
        Ok(counters)
    }

    fn is_recorded(&self, event_id: &str) -> bool {
        self.pending.events.contains_key(event_id)
            || self.committed(|state| state.events.contains_key(event_id))
    }

    fn find_user_by<P>(&self, matches: P) -> Option<Uuid>
    where
        P: Fn(&EntitlementSnapshot) -> bool,
    {
        if let Some(snapshot) = self.pending.snapshots.values().find(|s| matches(s)) {
            return Some(snapshot.user_id);
        }
        self.committed(|state| {
            state
                .snapshots
                .values()
                .filter(|s| !self.pending.snapshots.contains_key(&s.user_id))
                .find(|s| matches(s))
                .map(|s| s.user_id)
        })
    }
}

#[async_trait]
impl EntitlementTransaction for MockEntitlementTransaction {
    async fn commit(self: Box<Self>) -> Result<(), sqlx::Error> {
        let MockEntitlementTransaction {
            state,
            commits,
            read_view,
            held,
            pending,
            ..
        } = *self;

        if read_view.is_none() {
            let mut state = state.lock().unwrap();
            state.snapshots.extend(pending.snapshots);
            state.counters.extend(pending.counters);
            state.events.extend(pending.events);
        }
        commits.fetch_add(1, Ordering::SeqCst);
        // Row locks go only after the writes are visible.
        drop(held);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), sqlx::Error> {
        Ok(())
    }
}

#[async_trait]
impl UsageLedger for MockEntitlementTransaction {
    async fn get_counters(&mut self, user_id: Uuid) -> Result<UsageCounters, sqlx::Error> {
        Ok(self.current_counters(user_id))
    }

    async fn lock_counters(&mut self, user_id: Uuid) -> Result<UsageCounters, sqlx::Error> {
        self.update_counters(user_id, |_| {}).await
    }

    async fn increment_note_count(&mut self, user_id: Uuid) -> Result<i64, sqlx::Error> {
        let counters = self
            .update_counters(user_id, |c| c.note_count += 1)
            .await?;
        Ok(counters.note_count)
    }

    async fn set_meeting_start(
        &mut self,
        user_id: Uuid,
        started_at: OffsetDateTime,
    ) -> Result<(), sqlx::Error> {
        self.update_counters(user_id, move |c| c.last_meeting_start = Some(started_at))
            .await?;
        Ok(())
    }

    async fn clear_meeting_start(&mut self, user_id: Uuid) -> Result<(), sqlx::Error> {
        self.update_counters(user_id, |c| c.last_meeting_start = None)
            .await?;
        Ok(())
    }

    async fn add_meeting_seconds(&mut self, user_id: Uuid, delta: i64) -> Result<i64, sqlx::Error> {
        let counters = self
            .update_counters(user_id, move |c| c.meeting_seconds_used += delta.max(0))
            .await?;
        Ok(counters.meeting_seconds_used)
    }
}

#[async_trait]
impl EntitlementStore for MockEntitlementTransaction {
    async fn user_exists(&mut self, user_id: Uuid) -> Result<bool, sqlx::Error> {
        Ok(self.committed(|state| state.users.contains(&user_id)))
    }

    async fn get_snapshot(
        &mut self,
        user_id: Uuid,
    ) -> Result<Option<EntitlementSnapshot>, sqlx::Error> {
        Ok(self.current_snapshot(user_id))
    }

    async fn upsert_snapshot(
        &mut self,
        user_id: Uuid,
        update: &SnapshotUpdate,
    ) -> Result<EntitlementSnapshot, sqlx::Error> {
        self.ensure_writable()?;
        self.lock_row(RowKey::Snapshot(user_id)).await;
        let mut snapshot = self
            .current_snapshot(user_id)
            .unwrap_or_else(|| EntitlementSnapshot::inactive(user_id));
        snapshot.apply(update);
        self.pending.snapshots.insert(user_id, snapshot.clone());
        Ok(snapshot)
    }

    async fn clear_subscription(
        &mut self,
        user_id: Uuid,
    ) -> Result<Option<EntitlementSnapshot>, sqlx::Error> {
        self.ensure_writable()?;
        self.lock_row(RowKey::Snapshot(user_id)).await;
        let Some(mut snapshot) = self.current_snapshot(user_id) else {
            return Ok(None);
        };
        snapshot.is_active = false;
        snapshot.plan_id = None;
        snapshot.current_period_end = None;
        snapshot.external_subscription_id = None;
        self.pending.snapshots.insert(user_id, snapshot.clone());
        Ok(Some(snapshot))
    }

    async fn find_user_by_external_customer_id(
        &mut self,
        customer_id: &str,
    ) -> Result<Option<Uuid>, sqlx::Error> {
        Ok(self.find_user_by(|s| s.external_customer_id.as_deref() == Some(customer_id)))
    }

    async fn find_user_by_external_subscription_id(
        &mut self,
        subscription_id: &str,
    ) -> Result<Option<Uuid>, sqlx::Error> {
        Ok(self.find_user_by(|s| s.external_subscription_id.as_deref() == Some(subscription_id)))
    }
}

#[async_trait]
impl BillingEventLog for MockEntitlementTransaction {
    async fn record_event(
        &mut self,
        event_id: &str,
        _event_type: &str,
        processed_at: OffsetDateTime,
    ) -> Result<bool, sqlx::Error> {
        self.ensure_writable()?;
        self.lock_row(RowKey::Event(event_id.to_string())).await;
        if self.is_recorded(event_id) {
            return Ok(false);
        }
        self.pending
            .events
            .insert(event_id.to_string(), processed_at);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn writes_are_invisible_until_commit_and_dropped_on_rollback() {
        let repo = MockEntitlementRepository::new();
        let user_id = repo.register_user();

        let mut tx = repo.begin().await.unwrap();
        assert_eq!(tx.increment_note_count(user_id).await.unwrap(), 1);
        assert_eq!(repo.counters(user_id).note_count, 0);
        tx.rollback().await.unwrap();
        assert_eq!(repo.counters(user_id).note_count, 0);

        let mut tx = repo.begin().await.unwrap();
        tx.increment_note_count(user_id).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(repo.counters(user_id).note_count, 1);
    }

    #[tokio::test]
    async fn counter_lock_blocks_second_writer_until_release() {
        let repo = MockEntitlementRepository::new();
        let user_id = repo.register_user();

        let mut first = repo.begin().await.unwrap();
        first.lock_counters(user_id).await.unwrap();

        let contender = {
            let repo = repo.clone();
            tokio::spawn(async move {
                let mut tx = repo.begin().await.unwrap();
                let seen = tx.lock_counters(user_id).await.unwrap();
                tx.commit().await.unwrap();
                seen.note_count
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        first.increment_note_count(user_id).await.unwrap();
        first.commit().await.unwrap();

        assert_eq!(contender.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn read_only_transaction_sees_begin_time_state_and_rejects_writes() {
        let repo = MockEntitlementRepository::new();
        let user_id = repo.register_user();

        let mut reader = repo.begin_read_only().await.unwrap();

        let mut writer = repo.begin().await.unwrap();
        writer.increment_note_count(user_id).await.unwrap();
        writer.commit().await.unwrap();

        assert_eq!(reader.get_counters(user_id).await.unwrap().note_count, 0);
        assert!(reader.increment_note_count(user_id).await.is_err());
        reader.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn record_event_is_test_and_set() {
        let repo = MockEntitlementRepository::new();
        let at = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();

        let mut tx = repo.begin().await.unwrap();
        assert!(tx.record_event("evt_1", "invoicePaid", at).await.unwrap());
        assert!(!tx.record_event("evt_1", "invoicePaid", at).await.unwrap());
        tx.commit().await.unwrap();

        let mut tx = repo.begin().await.unwrap();
        assert!(!tx.record_event("evt_1", "invoicePaid", at).await.unwrap());
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn record_event_stores_the_given_processing_time() {
        let repo = MockEntitlementRepository::new();
        let at = OffsetDateTime::from_unix_timestamp(1_600_000_000).unwrap();

        let mut tx = repo.begin().await.unwrap();
        tx.record_event("evt_1", "invoicePaid", at).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(repo.event_processed_at("evt_1"), Some(at));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let repo = MockEntitlementRepository::new();
        repo.fail_next_begins(1);
        assert!(matches!(
            repo.begin().await.err(),
            Some(sqlx::Error::PoolTimedOut)
        ));
        assert!(repo.begin().await.is_ok());
        assert_eq!(repo.begins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn prune_drops_only_old_events() {
        let repo = MockEntitlementRepository::new();
        let cutoff = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        repo.mark_event_processed("evt_old", cutoff - time::Duration::days(1));
        repo.mark_event_processed("evt_new", cutoff + time::Duration::days(1));

        assert_eq!(repo.prune_processed_events(cutoff).await.unwrap(), 1);
        assert_eq!(repo.recorded_events(), vec!["evt_new".to_string()]);
    }
}
