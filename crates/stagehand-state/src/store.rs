//! StateStore — redb-backed persistence for the lifecycle records.
//!
//! Provides typed CRUD over releases, stages, tests, and deployments plus
//! the handful of read-modify-write operations that must not interleave:
//! test sequence allocation, finishing a test exactly once, claiming a
//! backend port, and switching the main deployment. Lifecycle events are
//! appended to their own sequence-keyed log. The store supports
//! both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use stagehand_core::PortRange;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StateError::Codec(e.to_string()))
}

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StateError::Codec(e.to_string()))
}

fn read_one<T, R>(table: &R, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(StateError::storage("read"))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

fn read_all<T, R>(table: &R) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(StateError::storage("read"))? {
        let (_, value) = entry.map_err(StateError::storage("read"))?;
        results.push(decode(value.value())?);
    }
    Ok(results)
}

/// Thread-safe lifecycle store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(|e| StateError::Open(e.to_string()))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(|e| StateError::Open(e.to_string()))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(StateError::storage("begin write"))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [RELEASES, STAGES, TESTS, DEPLOYMENTS] {
            txn.open_table(table).map_err(StateError::storage("open table"))?;
        }
        txn.open_table(EVENTS).map_err(StateError::storage("open table"))?;
        txn.commit().map_err(StateError::storage("commit"))?;
        Ok(())
    }

    // ── Generic record access ──────────────────────────────────────

    fn put<T: Serialize>(&self, def: JsonTable, key: &str, record: &T) -> StateResult<()> {
        let value = encode(record)?;
        let txn = self.db.begin_write().map_err(StateError::storage("begin write"))?;
        {
            let mut table = txn.open_table(def).map_err(StateError::storage("open table"))?;
            table.insert(key, value.as_slice()).map_err(StateError::storage("write"))?;
        }
        txn.commit().map_err(StateError::storage("commit"))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(StateError::storage("begin read"))?;
        let table = txn.open_table(def).map_err(StateError::storage("open table"))?;
        read_one(&table, key)
    }

    fn list<T: DeserializeOwned>(&self, def: JsonTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(StateError::storage("begin read"))?;
        let table = txn.open_table(def).map_err(StateError::storage("open table"))?;
        read_all(&table)
    }

    fn delete(&self, def: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(StateError::storage("begin write"))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(StateError::storage("open table"))?;
            existed = table.remove(key).map_err(StateError::storage("write"))?.is_some();
        }
        txn.commit().map_err(StateError::storage("commit"))?;
        Ok(existed)
    }

    /// Read-modify-write one record inside a single write transaction.
    /// `apply` returns whether the record should be written back.
    fn modify<T, F>(&self, def: JsonTable, key: &str, apply: F) -> StateResult<Option<(T, bool)>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> bool,
    {
        let txn = self.db.begin_write().map_err(StateError::storage("begin write"))?;
        let outcome;
        {
            let mut table = txn.open_table(def).map_err(StateError::storage("open table"))?;
            let current: Option<T> = read_one(&table, key)?;
            outcome = match current {
                Some(mut record) => {
                    let changed = apply(&mut record);
                    if changed {
                        let value = encode(&record)?;
                        table.insert(key, value.as_slice()).map_err(StateError::storage("write"))?;
                    }
                    Some((record, changed))
                }
                None => None,
            };
        }
        txn.commit().map_err(StateError::storage("commit"))?;
        Ok(outcome)
    }

    // ── Releases ───────────────────────────────────────────────────

    pub fn put_release(&self, release: &Release) -> StateResult<()> {
        self.put(RELEASES, &release.id, release)?;
        debug!(release_id = %release.id, "release stored");
        Ok(())
    }

    pub fn get_release(&self, id: &str) -> StateResult<Option<Release>> {
        self.get(RELEASES, id)
    }

    /// All releases, newest first.
    pub fn list_releases(&self) -> StateResult<Vec<Release>> {
        let mut releases: Vec<Release> = self.list(RELEASES)?;
        releases.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(releases)
    }

    // ── Stages ─────────────────────────────────────────────────────

    pub fn put_stage(&self, stage: &Stage) -> StateResult<()> {
        self.put(STAGES, &stage.id, stage)?;
        debug!(stage_id = %stage.id, status = %stage.status, "stage stored");
        Ok(())
    }

    pub fn get_stage(&self, id: &str) -> StateResult<Option<Stage>> {
        self.get(STAGES, id)
    }

    /// All stages, newest first.
    pub fn list_stages(&self) -> StateResult<Vec<Stage>> {
        let mut stages: Vec<Stage> = self.list(STAGES)?;
        stages.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(stages)
    }

    /// Apply `f` to a stage atomically. Returns `None` if the stage is absent.
    pub fn update_stage<F>(&self, id: &str, f: F) -> StateResult<Option<Stage>>
    where
        F: FnOnce(&mut Stage),
    {
        let updated = self.modify(STAGES, id, |stage: &mut Stage| {
            f(stage);
            true
        })?;
        Ok(updated.map(|(stage, _)| stage))
    }

    pub fn delete_stage(&self, id: &str) -> StateResult<bool> {
        let existed = self.delete(STAGES, id)?;
        debug!(stage_id = %id, existed, "stage deleted");
        Ok(existed)
    }

    /// Increment the stage's test counter and return the new value.
    ///
    /// Concurrent callers always observe distinct, consecutive values.
    pub fn next_test_sequence(&self, stage_id: &str, now: u64) -> StateResult<u32> {
        let updated = self.modify(STAGES, stage_id, |stage: &mut Stage| {
            stage.test_sequence += 1;
            stage.updated_at = now;
            true
        })?;
        match updated {
            Some((stage, _)) => Ok(stage.test_sequence),
            None => Err(StateError::not_found("stage", stage_id)),
        }
    }

    // ── Tests ──────────────────────────────────────────────────────

    pub fn put_test(&self, test: &Test) -> StateResult<()> {
        self.put(TESTS, &test.id, test)?;
        debug!(test_id = %test.id, status = %test.status, "test stored");
        Ok(())
    }

    pub fn get_test(&self, id: &str) -> StateResult<Option<Test>> {
        self.get(TESTS, id)
    }

    /// Tests belonging to a stage, highest sequence first.
    pub fn list_tests_for_stage(&self, stage_id: &str) -> StateResult<Vec<Test>> {
        let mut tests: Vec<Test> = self
            .list::<Test>(TESTS)?
            .into_iter()
            .filter(|t| t.stage_id == stage_id)
            .collect();
        tests.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        Ok(tests)
    }

    /// Move a running test to a terminal status.
    ///
    /// Returns the updated record, or `None` if the test no longer exists or
    /// has already finished; the first finisher wins.
    pub fn finish_test(
        &self,
        id: &str,
        status: TestStatus,
        error: Option<String>,
        finished_at: u64,
    ) -> StateResult<Option<Test>> {
        let outcome = self.modify(TESTS, id, |test: &mut Test| {
            if test.status.is_terminal() {
                return false;
            }
            test.status = status;
            test.error = error;
            test.finished_at = Some(finished_at);
            true
        })?;
        Ok(match outcome {
            Some((test, true)) => Some(test),
            _ => None,
        })
    }

    /// Delete every test of a stage, returning the removed records.
    pub fn delete_tests_for_stage(&self, stage_id: &str) -> StateResult<Vec<Test>> {
        let txn = self.db.begin_write().map_err(StateError::storage("begin write"))?;
        let removed: Vec<Test>;
        {
            let mut table = txn.open_table(TESTS).map_err(StateError::storage("open table"))?;
            removed = read_all::<Test, _>(&table)?
                .into_iter()
                .filter(|t| t.stage_id == stage_id)
                .collect();
            for test in &removed {
                table.remove(test.id.as_str()).map_err(StateError::storage("write"))?;
            }
        }
        txn.commit().map_err(StateError::storage("commit"))?;
        debug!(%stage_id, count = removed.len(), "tests deleted");
        Ok(removed)
    }

    // ── Deployments ────────────────────────────────────────────────

    pub fn put_deployment(&self, dep: &Deployment) -> StateResult<()> {
        self.put(DEPLOYMENTS, &dep.id, dep)?;
        debug!(deployment_id = %dep.id, status = %dep.status, "deployment stored");
        Ok(())
    }

    pub fn get_deployment(&self, id: &str) -> StateResult<Option<Deployment>> {
        self.get(DEPLOYMENTS, id)
    }

    /// All deployments, newest first.
    pub fn list_deployments(&self) -> StateResult<Vec<Deployment>> {
        let mut deps: Vec<Deployment> = self.list(DEPLOYMENTS)?;
        deps.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(deps)
    }

    /// Apply `f` to a deployment atomically. Returns `None` if absent.
    pub fn update_deployment<F>(&self, id: &str, f: F) -> StateResult<Option<Deployment>>
    where
        F: FnOnce(&mut Deployment),
    {
        let updated = self.modify(DEPLOYMENTS, id, |dep: &mut Deployment| {
            f(dep);
            true
        })?;
        Ok(updated.map(|(dep, _)| dep))
    }

    pub fn delete_deployment(&self, id: &str) -> StateResult<bool> {
        let existed = self.delete(DEPLOYMENTS, id)?;
        debug!(deployment_id = %id, existed, "deployment deleted");
        Ok(existed)
    }

    /// Assign the lowest free port in `range` to a deployment.
    ///
    /// The scan of used ports and the write happen in one transaction, so
    /// two deployments can never be committed with the same port. A
    /// deployment that already holds a port keeps it. Returns `None` when
    /// the range is exhausted.
    pub fn claim_port(&self, deployment_id: &str, range: PortRange) -> StateResult<Option<u16>> {
        let txn = self.db.begin_write().map_err(StateError::storage("begin write"))?;
        let claimed;
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(StateError::storage("open table"))?;
            let all: Vec<Deployment> = read_all(&table)?;
            let mut target = all
                .iter()
                .find(|d| d.id == deployment_id)
                .cloned()
                .ok_or_else(|| StateError::not_found("deployment", deployment_id))?;

            if let Some(port) = target.port {
                claimed = Some(port);
            } else {
                let used: std::collections::HashSet<u16> =
                    all.iter().filter_map(|d| d.port).collect();
                claimed = (range.start..=range.end).find(|p| !used.contains(p));
                if let Some(port) = claimed {
                    target.port = Some(port);
                    let value = encode(&target)?;
                    table
                        .insert(deployment_id, value.as_slice())
                        .map_err(StateError::storage("write"))?;
                }
            }
        }
        txn.commit().map_err(StateError::storage("commit"))?;
        debug!(%deployment_id, port = ?claimed, "port claimed");
        Ok(claimed)
    }

    /// Make `deployment_id` the main deployment, clearing `promoted_at` on
    /// every other record in the same transaction.
    ///
    /// Returns every record whose `promoted_at` changed, the new main last.
    pub fn set_main_deployment(&self, deployment_id: &str, at: u64) -> StateResult<Vec<Deployment>> {
        let txn = self.db.begin_write().map_err(StateError::storage("begin write"))?;
        let mut changed = Vec::new();
        {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(StateError::storage("open table"))?;
            let all: Vec<Deployment> = read_all(&table)?;
            if !all.iter().any(|d| d.id == deployment_id) {
                return Err(StateError::not_found("deployment", deployment_id));
            }
            let mut new_main = None;
            for mut dep in all {
                if dep.id == deployment_id {
                    dep.promoted_at = Some(at);
                    new_main = Some(dep);
                } else if dep.promoted_at.is_some() {
                    dep.promoted_at = None;
                    changed.push(dep);
                }
            }
            changed.extend(new_main);
            for dep in &changed {
                let value = encode(dep)?;
                table
                    .insert(dep.id.as_str(), value.as_slice())
                    .map_err(StateError::storage("write"))?;
            }
        }
        txn.commit().map_err(StateError::storage("commit"))?;
        debug!(%deployment_id, "main deployment set");
        Ok(changed)
    }

    // ── Events ─────────────────────────────────────────────────────

    /// Append `events` in order, assigning each the next sequence number.
    /// Returns the last sequence written (or the current one if `events` is
    /// empty).
    pub fn append_events(&self, events: &[LifecycleEvent]) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(StateError::storage("begin write"))?;
        let mut seq;
        {
            let mut table = txn.open_table(EVENTS).map_err(StateError::storage("open table"))?;
            seq = match table.last().map_err(StateError::storage("read"))? {
                Some((key, _)) => key.value(),
                None => 0,
            };
            for event in events {
                seq += 1;
                let mut stored = event.clone();
                stored.seq = seq;
                let value = encode(&stored)?;
                table.insert(seq, value.as_slice()).map_err(StateError::storage("write"))?;
            }
        }
        txn.commit().map_err(StateError::storage("commit"))?;
        debug!(count = events.len(), last_seq = seq, "events appended");
        Ok(seq)
    }

    /// Up to `limit` most recent events, newest first.
    pub fn list_events(&self, limit: usize) -> StateResult<Vec<LifecycleEvent>> {
        let txn = self.db.begin_read().map_err(StateError::storage("begin read"))?;
        let table = txn.open_table(EVENTS).map_err(StateError::storage("open table"))?;
        let mut events = Vec::new();
        for entry in table.iter().map_err(StateError::storage("read"))?.rev().take(limit) {
            let (_, value) = entry.map_err(StateError::storage("read"))?;
            events.push(decode(value.value())?);
        }
        Ok(events)
    }

    /// Every event about `target_id`, oldest first.
    pub fn events_for(&self, target_id: &str) -> StateResult<Vec<LifecycleEvent>> {
        let txn = self.db.begin_read().map_err(StateError::storage("begin read"))?;
        let table = txn.open_table(EVENTS).map_err(StateError::storage("open table"))?;
        let mut events = Vec::new();
        for entry in table.iter().map_err(StateError::storage("read"))? {
            let (_, value) = entry.map_err(StateError::storage("read"))?;
            let event: LifecycleEvent = decode(value.value())?;
            if event.target_id == target_id {
                events.push(event);
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(id: &str, created_at: u64) -> Stage {
        Stage {
            id: id.to_string(),
            release_id: "v1.0.0".to_string(),
            env_tag: "staging".to_string(),
            status: StageStatus::Pre,
            test_sequence: 0,
            last_test: None,
            created_at,
            updated_at: created_at,
        }
    }

    fn test_run(stage_id: &str, sequence: u32) -> Test {
        Test {
            id: Test::key(stage_id, sequence),
            stage_id: stage_id.to_string(),
            sequence,
            status: TestStatus::Running,
            ws_token: "tok".to_string(),
            log_path: format!("/tmp/{stage_id}-{sequence}.log"),
            started_at: 100,
            finished_at: None,
            error: None,
        }
    }

    fn deployment(id: &str, port: Option<u16>) -> Deployment {
        Deployment {
            id: id.to_string(),
            stage_id: id.to_string(),
            version: "v1.0.0".to_string(),
            env_tag: "prod".to_string(),
            port,
            status: DeploymentStatus::Staged,
            log_path: format!("/tmp/{id}.log"),
            created_at: 100,
            promoted_at: None,
        }
    }

    // ── Releases & stages ──────────────────────────────────────────

    #[test]
    fn releases_list_newest_first() {
        let store = StateStore::open_in_memory().unwrap();
        for (id, at) in [("v1", 10), ("v3", 30), ("v2", 20)] {
            store
                .put_release(&Release { id: id.into(), sha: "abc".into(), created_at: at })
                .unwrap();
        }
        let ids: Vec<_> = store.list_releases().unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["v3", "v2", "v1"]);
        assert!(store.get_release("v9").unwrap().is_none());
    }

    #[test]
    fn stage_update_in_place() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_stage(&stage("s1", 1)).unwrap();

        let updated = store
            .update_stage("s1", |s| s.status = StageStatus::Active)
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, StageStatus::Active);
        assert_eq!(store.get_stage("s1").unwrap().unwrap().status, StageStatus::Active);
        assert!(store.update_stage("missing", |_| {}).unwrap().is_none());
    }

    #[test]
    fn test_sequence_is_monotonic() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_stage(&stage("s1", 1)).unwrap();
        assert_eq!(store.next_test_sequence("s1", 5).unwrap(), 1);
        assert_eq!(store.next_test_sequence("s1", 6).unwrap(), 2);
        assert_eq!(store.get_stage("s1").unwrap().unwrap().updated_at, 6);
        assert!(matches!(
            store.next_test_sequence("nope", 7),
            Err(StateError::NotFound { .. })
        ));
    }

    #[test]
    fn test_sequence_gap_free_under_concurrency() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_stage(&stage("s1", 1)).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.next_test_sequence("s1", 2).unwrap())
            })
            .collect();
        let mut seen: Vec<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        seen.sort_unstable();
        assert_eq!(seen, (1..=8).collect::<Vec<_>>());
    }

    // ── Tests ──────────────────────────────────────────────────────

    #[test]
    fn finish_test_only_once() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_test(&test_run("s1", 1)).unwrap();

        let done = store
            .finish_test("s1-test-1", TestStatus::Passed, None, 200)
            .unwrap()
            .unwrap();
        assert_eq!(done.status, TestStatus::Passed);
        assert_eq!(done.finished_at, Some(200));

        let again = store
            .finish_test("s1-test-1", TestStatus::Failed, Some("late".into()), 300)
            .unwrap();
        assert!(again.is_none());
        assert_eq!(store.get_test("s1-test-1").unwrap().unwrap().status, TestStatus::Passed);
    }

    #[test]
    fn finish_missing_test_is_noop() {
        let store = StateStore::open_in_memory().unwrap();
        let outcome = store.finish_test("gone", TestStatus::Passed, None, 1).unwrap();
        assert!(outcome.is_none());
    }

    #[test]
    fn tests_scoped_to_stage() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_test(&test_run("s1", 1)).unwrap();
        store.put_test(&test_run("s1", 2)).unwrap();
        store.put_test(&test_run("s1-x", 1)).unwrap();

        let seqs: Vec<_> = store
            .list_tests_for_stage("s1")
            .unwrap()
            .into_iter()
            .map(|t| t.sequence)
            .collect();
        assert_eq!(seqs, vec![2, 1]);

        let removed = store.delete_tests_for_stage("s1").unwrap();
        assert_eq!(removed.len(), 2);
        assert!(store.list_tests_for_stage("s1").unwrap().is_empty());
        assert_eq!(store.list_tests_for_stage("s1-x").unwrap().len(), 1);
    }

    // ── Deployments ────────────────────────────────────────────────

    #[test]
    fn claim_port_picks_lowest_free() {
        let store = StateStore::open_in_memory().unwrap();
        let range = PortRange { start: 20000, end: 20003 };
        store.put_deployment(&deployment("a", Some(20000))).unwrap();
        store.put_deployment(&deployment("b", Some(20002))).unwrap();
        store.put_deployment(&deployment("c", None)).unwrap();

        assert_eq!(store.claim_port("c", range).unwrap(), Some(20001));
        assert_eq!(store.get_deployment("c").unwrap().unwrap().port, Some(20001));
        // Already assigned: unchanged.
        assert_eq!(store.claim_port("c", range).unwrap(), Some(20001));
    }

    #[test]
    fn claim_port_exhausted() {
        let store = StateStore::open_in_memory().unwrap();
        let range = PortRange { start: 20000, end: 20000 };
        store.put_deployment(&deployment("a", Some(20000))).unwrap();
        store.put_deployment(&deployment("b", None)).unwrap();
        assert_eq!(store.claim_port("b", range).unwrap(), None);
        assert!(matches!(
            store.claim_port("zzz", range),
            Err(StateError::NotFound { .. })
        ));
    }

    #[test]
    fn concurrent_claims_never_collide() {
        let store = StateStore::open_in_memory().unwrap();
        let range = PortRange { start: 20000, end: 20100 };
        for i in 0..10 {
            store.put_deployment(&deployment(&format!("d{i}"), None)).unwrap();
        }
        let handles: Vec<_> = (0..10)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || store.claim_port(&format!("d{i}"), range).unwrap())
            })
            .collect();
        let mut ports: Vec<u16> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 10);
    }

    #[test]
    fn set_main_clears_previous_holder() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_deployment(&deployment("a", Some(1))).unwrap();
        store.put_deployment(&deployment("b", Some(2))).unwrap();

        store.set_main_deployment("a", 10).unwrap();
        let changed = store.set_main_deployment("b", 20).unwrap();

        assert_eq!(changed.len(), 2);
        assert_eq!(changed.last().unwrap().id, "b");
        let mains: Vec<_> = store
            .list_deployments()
            .unwrap()
            .into_iter()
            .filter(|d| d.is_main())
            .collect();
        assert_eq!(mains.len(), 1);
        assert_eq!(mains[0].id, "b");
        assert!(store.set_main_deployment("none", 30).is_err());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("state.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_stage(&stage("v1-prod", 1)).unwrap();
            store.put_deployment(&deployment("v1-prod", Some(20000))).unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        assert!(store.get_stage("v1-prod").unwrap().is_some());
        assert_eq!(
            store.get_deployment("v1-prod").unwrap().unwrap().port,
            Some(20000)
        );
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.list_releases().unwrap().is_empty());
        assert!(store.list_stages().unwrap().is_empty());
        assert!(store.list_deployments().unwrap().is_empty());
        assert!(!store.delete_stage("nope").unwrap());
        assert!(!store.delete_deployment("nope").unwrap());
        assert!(store.delete_tests_for_stage("nope").unwrap().is_empty());
    }

    // ── Events ─────────────────────────────────────────────────────

    #[test]
    fn events_get_increasing_sequences() {
        let store = StateStore::open_in_memory().unwrap();
        assert_eq!(store.append_events(&[]).unwrap(), 0);

        let first = [
            LifecycleEvent::new("stage.prepared", "stage", "v1-prod", 10),
            LifecycleEvent::new("deployment.created", "deployment", "v1-prod", 11),
        ];
        assert_eq!(store.append_events(&first).unwrap(), 2);
        let second = [LifecycleEvent::new("stage.prepared", "stage", "v2-prod", 12)];
        assert_eq!(store.append_events(&second).unwrap(), 3);

        let recent = store.list_events(2).unwrap();
        let seqs: Vec<u64> = recent.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 2]);

        let actions: Vec<String> = store
            .events_for("v1-prod")
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(actions, vec!["stage.prepared", "deployment.created"]);
    }
}
