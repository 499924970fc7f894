use std::sync::{Arc, Mutex};

use futures_core::future::BoxFuture;
use futures_util::FutureExt;
use tokio::time::{advance, Duration};
use tokio_util::sync::CancellationToken;

use super::{SessionKind, SessionPool};
use crate::{
    error::{Error, ErrorKind, Result},
    options::{SessionPoolOptions, WaitBehavior},
    runtime,
    service::{CreatedSession, SessionService, TransactionId},
};

pub(crate) const DATABASE: &str = "projects/test/instances/test/databases/test";

/// A scripted in-memory service that records every RPC and can be told to
/// fail creations or statements.
#[derive(Clone, Debug, Default)]
pub(crate) struct MockService {
    state: Arc<Mutex<MockState>>,
}

#[derive(Debug, Default)]
struct MockState {
    create_calls: u32,
    sessions_created: u32,
    sessions_deleted: u32,
    transactions_begun: u32,
    statements: Vec<(String, String)>,
    deleted_names: Vec<String>,
    create_error: Option<Error>,
    create_errors_remaining: Option<(Error, u32)>,
    execute_error: Option<Error>,
}

impl MockService {
    pub(crate) fn arc(&self) -> Arc<dyn SessionService> {
        Arc::new(self.clone())
    }

    pub(crate) fn created(&self) -> u32 {
        self.state.lock().unwrap().sessions_created
    }

    pub(crate) fn create_calls(&self) -> u32 {
        self.state.lock().unwrap().create_calls
    }

    pub(crate) fn deleted(&self) -> u32 {
        self.state.lock().unwrap().sessions_deleted
    }

    pub(crate) fn alive(&self) -> u32 {
        let state = self.state.lock().unwrap();
        state.sessions_created - state.sessions_deleted
    }

    pub(crate) fn transactions_begun(&self) -> u32 {
        self.state.lock().unwrap().transactions_begun
    }

    pub(crate) fn statements(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().statements.clone()
    }

    pub(crate) fn deleted_names(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted_names.clone()
    }

    /// Fail every creation with `error` until cleared with `None`.
    pub(crate) fn fail_creates(&self, error: Option<Error>) {
        self.state.lock().unwrap().create_error = error;
    }

    /// Fail the next `count` creations with `error`, then succeed again.
    pub(crate) fn fail_next_creates(&self, error: Error, count: u32) {
        self.state.lock().unwrap().create_errors_remaining = Some((error, count));
    }

    /// Fail every statement with `error` until cleared with `None`.
    pub(crate) fn fail_executes(&self, error: Option<Error>) {
        self.state.lock().unwrap().execute_error = error;
    }
}

impl SessionService for MockService {
    fn create_session(&self, _database: &str) -> BoxFuture<'static, Result<CreatedSession>> {
        let state = Arc::clone(&self.state);
        async move {
            let mut state = state.lock().unwrap();
            state.create_calls += 1;
            if let Some((error, remaining)) = &mut state.create_errors_remaining {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(error.clone());
                }
            }
            if let Some(error) = &state.create_error {
                return Err(error.clone());
            }
            state.sessions_created += 1;
            Ok(CreatedSession::new(format!(
                "session-{}",
                state.sessions_created
            )))
        }
        .boxed()
    }

    fn begin_transaction(&self, session: &str) -> BoxFuture<'static, Result<TransactionId>> {
        let state = Arc::clone(&self.state);
        let session = session.to_string();
        async move {
            let mut state = state.lock().unwrap();
            state.transactions_begun += 1;
            Ok(TransactionId::from(format!(
                "txn-{}-{}",
                session, state.transactions_begun
            )))
        }
        .boxed()
    }

    fn execute_sql(&self, session: &str, sql: &str) -> BoxFuture<'static, Result<()>> {
        let state = Arc::clone(&self.state);
        let session = session.to_string();
        let sql = sql.to_string();
        async move {
            let mut state = state.lock().unwrap();
            if let Some(error) = &state.execute_error {
                return Err(error.clone());
            }
            state.statements.push((session, sql));
            Ok(())
        }
        .boxed()
    }

    fn delete_session(&self, session: &str) -> BoxFuture<'static, Result<()>> {
        let state = Arc::clone(&self.state);
        let session = session.to_string();
        async move {
            let mut state = state.lock().unwrap();
            state.sessions_deleted += 1;
            state.deleted_names.push(session);
            Ok(())
        }
        .boxed()
    }
}

fn options() -> SessionPoolOptions {
    SessionPoolOptions::builder()
        .maintenance_loop_delay(Duration::ZERO)
        .build()
}

fn new_pool(service: &MockService, options: SessionPoolOptions) -> SessionPool {
    SessionPool::new(DATABASE, service.arc(), options).unwrap()
}

/// Bring the pool up to its warm floor.
async fn fill(pool: &SessionPool) {
    pool.maintain().await;
    pool.wait_until_ready().await.unwrap();
}

async fn acquire_all(pool: &SessionPool, count: usize) -> Vec<super::PooledSession> {
    let mut sessions = Vec::with_capacity(count);
    for _ in 0..count {
        sessions.push(pool.acquire(SessionKind::ReadOnly).await.unwrap());
    }
    sessions
}

/// Let the worker and any spawned RPC tasks run to completion.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

fn mins(minutes: u64) -> Duration {
    Duration::from_secs(minutes * 60)
}

#[tokio::test(start_paused = true)]
async fn fill_respects_write_fraction() {
    let service = MockService::default();
    let pool = new_pool(&service, options());

    fill(&pool).await;

    let stats = pool.statistics();
    assert_eq!(stats.read_pool, 8);
    assert_eq!(stats.read_write_pool, 2);
    assert_eq!(stats.active_sessions, 0);
    assert_eq!(service.created(), 10);
    assert_eq!(service.transactions_begun(), 2);
}

#[tokio::test(start_paused = true)]
async fn piggyback_release_skips_probe() {
    let service = MockService::default();
    let pool = new_pool(&service, options());
    fill(&pool).await;
    let mut sessions = acquire_all(&pool, 100).await;
    assert_eq!(service.created(), 100);

    advance(mins(10)).await;

    let mut session = sessions.remove(0);
    service
        .execute_sql(session.name(), "SELECT val FROM t")
        .await
        .unwrap();
    session.mark_used();
    let name = session.name().to_string();
    drop(session);
    settle().await;

    let again = pool.acquire(SessionKind::ReadOnly).await.unwrap();
    assert_eq!(again.name(), name);
    // only the caller's statement went out; the pool issued no probe of its
    // own and deleted nothing
    assert_eq!(service.statements().len(), 1);
    assert_eq!(service.deleted(), 0);
}

#[tokio::test(start_paused = true)]
async fn release_after_idle_probes_before_reuse() {
    let service = MockService::default();
    let pool = new_pool(&service, options());
    fill(&pool).await;
    let mut sessions = acquire_all(&pool, 100).await;

    advance(mins(20)).await;

    let session = sessions.remove(0);
    let name = session.name().to_string();
    drop(session);
    settle().await;

    assert_eq!(
        service.statements(),
        vec![(name.clone(), "SELECT 1".to_string())]
    );

    let again = pool.acquire(SessionKind::ReadOnly).await.unwrap();
    assert_eq!(again.name(), name);
    assert_eq!(service.statements().len(), 1);
    assert_eq!(service.deleted(), 0);
}

#[tokio::test(start_paused = true)]
async fn release_after_eviction_deletes() {
    let service = MockService::default();
    let pool = new_pool(&service, options());
    fill(&pool).await;
    let mut sessions = acquire_all(&pool, 100).await;

    advance(mins(150)).await;

    let session = sessions.remove(0);
    let name = session.name().to_string();
    drop(session);
    settle().await;

    assert_eq!(service.deleted(), 1);
    assert_eq!(service.deleted_names(), vec![name.clone()]);

    let again = pool.acquire(SessionKind::ReadOnly).await.unwrap();
    assert_ne!(again.name(), name);
    assert_eq!(service.created(), 101);
    assert!(service.statements().is_empty());
}

#[tokio::test(start_paused = true)]
async fn immediate_release_issues_no_rpcs() {
    let service = MockService::default();
    let pool = new_pool(&service, options());
    fill(&pool).await;
    let mut sessions = acquire_all(&pool, 10).await;

    let session = sessions.pop().unwrap();
    let name = session.name().to_string();
    drop(session);
    settle().await;

    let again = pool.acquire(SessionKind::ReadOnly).await.unwrap();
    assert_eq!(again.name(), name);
    assert!(service.statements().is_empty());
    assert_eq!(service.deleted(), 0);
    assert_eq!(service.created(), 10);
}

#[tokio::test(start_paused = true)]
async fn at_capacity_fail_mode_errors_immediately() {
    let service = MockService::default();
    let options = SessionPoolOptions::builder()
        .maintenance_loop_delay(Duration::ZERO)
        .wait_behavior(WaitBehavior::Fail)
        .build();
    let pool = new_pool(&service, options);
    fill(&pool).await;
    let _sessions = acquire_all(&pool, 100).await;

    let error = pool.acquire(SessionKind::ReadOnly).await.unwrap_err();
    assert!(error.is_resource_exhausted());
}

#[tokio::test(start_paused = true)]
async fn cancelling_one_waiter_leaves_the_other_intact() {
    let service = MockService::default();
    let pool = new_pool(&service, options());
    fill(&pool).await;
    let mut sessions = acquire_all(&pool, 100).await;

    let token = CancellationToken::new();
    let first = runtime::spawn({
        let pool = pool.clone();
        let token = token.clone();
        async move { pool.acquire_with(SessionKind::ReadOnly, &token).await }
    });
    settle().await;
    let second = runtime::spawn({
        let pool = pool.clone();
        async move { pool.acquire(SessionKind::ReadOnly).await }
    });
    settle().await;

    token.cancel();
    let error = first.await.unwrap_err();
    assert!(error.is_canceled());

    // the released session routes past the canceled waiter to the live one
    drop(sessions.pop());
    let delivered = second.await.unwrap();
    assert_eq!(pool.statistics().active_sessions, 100);
    drop(delivered);
}

#[tokio::test(start_paused = true)]
async fn waiters_are_served_in_fifo_order() {
    let service = MockService::default();
    let options = SessionPoolOptions::builder()
        .min_sessions(0)
        .max_sessions(2)
        .maintenance_loop_delay(Duration::ZERO)
        .build();
    let pool = new_pool(&service, options);
    let mut held = acquire_all(&pool, 2).await;

    let first = runtime::spawn({
        let pool = pool.clone();
        async move { pool.acquire(SessionKind::ReadOnly).await }
    });
    settle().await;
    let second = runtime::spawn({
        let pool = pool.clone();
        async move { pool.acquire(SessionKind::ReadOnly).await }
    });
    settle().await;

    drop(held.pop());
    settle().await;
    assert!(first.is_finished());
    assert!(!second.is_finished());

    drop(held.pop());
    settle().await;
    assert!(second.is_finished());
    drop(first.await.unwrap());
    drop(second.await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn readiness_wait_surfaces_creation_error() {
    let service = MockService::default();
    service.fail_creates(Some(Error::internal("backend exploded")));
    let pool = new_pool(&service, options());

    let waiter = runtime::spawn({
        let pool = pool.clone();
        async move { pool.wait_until_ready().await }
    });
    settle().await;

    pool.maintain().await;
    let error = waiter.await.unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::Internal { .. }));
}

#[tokio::test(start_paused = true)]
async fn health_recovers_after_successful_creation() {
    let service = MockService::default();
    service.fail_creates(Some(Error::internal("backend exploded")));
    let pool = new_pool(&service, options());

    pool.maintain().await;
    settle().await;
    let error = pool.wait_until_ready().await.unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::Internal { .. }));

    service.fail_creates(None);
    pool.maintain().await;
    // give the new creation tasks a chance to land and flip health back
    settle().await;
    pool.wait_until_ready().await.unwrap();
    assert_eq!(
        pool.statistics().read_pool + pool.statistics().read_write_pool,
        10
    );
}

#[tokio::test(start_paused = true)]
async fn transient_creation_failures_are_retried_with_backoff() {
    let service = MockService::default();
    service.fail_next_creates(Error::unavailable("try again"), 2);
    let options = SessionPoolOptions::builder()
        .min_sessions(1)
        .maintenance_loop_delay(Duration::ZERO)
        .build();
    let pool = new_pool(&service, options);

    pool.maintain().await;
    pool.wait_until_ready().await.unwrap();

    assert_eq!(service.create_calls(), 3);
    assert_eq!(service.created(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_waits_for_checked_out_sessions() {
    let service = MockService::default();
    let pool = new_pool(&service, options());
    fill(&pool).await;
    let session = pool.acquire(SessionKind::ReadOnly).await.unwrap();

    let shutdown = runtime::spawn({
        let pool = pool.clone();
        async move { pool.shutdown().await }
    });
    settle().await;

    let stats = pool.statistics();
    assert!(stats.shutdown);
    assert_eq!(stats.active_sessions, 1);
    assert_eq!(stats.read_pool, 0);
    assert_eq!(stats.read_write_pool, 0);
    assert!(!shutdown.is_finished());

    drop(session);
    shutdown.await;
    settle().await;

    assert_eq!(pool.statistics().active_sessions, 0);
    assert_eq!(service.deleted(), 10);
    assert_eq!(service.alive(), 0);
}

#[tokio::test(start_paused = true)]
async fn acquire_after_shutdown_is_invalid() {
    let service = MockService::default();
    let pool = new_pool(&service, options());
    fill(&pool).await;

    pool.shutdown().await;

    let error = pool.acquire(SessionKind::ReadOnly).await.unwrap_err();
    assert!(error.is_invalid_state());
}

#[tokio::test(start_paused = true)]
async fn shutdown_fails_parked_waiters() {
    let service = MockService::default();
    let options = SessionPoolOptions::builder()
        .min_sessions(0)
        .max_sessions(1)
        .maintenance_loop_delay(Duration::ZERO)
        .build();
    let pool = new_pool(&service, options);
    let held = pool.acquire(SessionKind::ReadOnly).await.unwrap();

    let waiter = runtime::spawn({
        let pool = pool.clone();
        async move { pool.acquire(SessionKind::ReadOnly).await }
    });
    settle().await;

    let shutdown = runtime::spawn({
        let pool = pool.clone();
        async move { pool.shutdown().await }
    });
    settle().await;

    let error = waiter.await.unwrap_err();
    assert!(error.is_canceled());

    drop(held);
    shutdown.await;
}

#[tokio::test(start_paused = true)]
async fn read_write_acquisition_never_downgrades() {
    let service = MockService::default();
    let options = SessionPoolOptions::builder()
        .min_sessions(2)
        .write_fraction(0.0)
        .maintenance_loop_delay(Duration::ZERO)
        .build();
    let pool = new_pool(&service, options);
    fill(&pool).await;
    assert_eq!(service.created(), 2);

    let session = pool.acquire(SessionKind::ReadWrite).await.unwrap();
    assert_eq!(session.kind(), SessionKind::ReadWrite);
    assert!(session.transaction_id().is_some());
    // the idle read-only sessions were not usable; a fresh one was created
    assert_eq!(service.created(), 3);
}

#[tokio::test(start_paused = true)]
async fn read_only_acquisition_accepts_read_write() {
    let service = MockService::default();
    let options = SessionPoolOptions::builder()
        .min_sessions(2)
        .write_fraction(1.0)
        .maintenance_loop_delay(Duration::ZERO)
        .build();
    let pool = new_pool(&service, options);
    fill(&pool).await;
    assert_eq!(service.created(), 2);

    let session = pool.acquire(SessionKind::ReadOnly).await.unwrap();
    assert_eq!(session.kind(), SessionKind::ReadWrite);
    assert!(session.transaction_id().is_some());
    assert_eq!(service.created(), 2);
}

#[tokio::test(start_paused = true)]
async fn acquire_times_out_with_resource_exhausted() {
    let service = MockService::default();
    let options = SessionPoolOptions::builder()
        .min_sessions(0)
        .max_sessions(1)
        .acquire_timeout(Duration::from_secs(5))
        .maintenance_loop_delay(Duration::ZERO)
        .build();
    let pool = new_pool(&service, options);
    let held = pool.acquire(SessionKind::ReadOnly).await.unwrap();

    let error = pool.acquire(SessionKind::ReadOnly).await.unwrap_err();
    assert!(error.is_resource_exhausted());
    drop(held);
}

#[tokio::test(start_paused = true)]
async fn discard_deletes_the_session() {
    let service = MockService::default();
    let options = SessionPoolOptions::builder()
        .min_sessions(1)
        .maintenance_loop_delay(Duration::ZERO)
        .build();
    let pool = new_pool(&service, options);
    fill(&pool).await;

    let session = pool.acquire(SessionKind::ReadOnly).await.unwrap();
    let name = session.name().to_string();
    session.discard();
    settle().await;

    assert_eq!(service.deleted_names(), vec![name]);
    assert_eq!(pool.statistics().active_sessions, 0);
}

#[tokio::test(start_paused = true)]
async fn maintenance_probes_stale_idle_sessions() {
    let service = MockService::default();
    let options = SessionPoolOptions::builder()
        .min_sessions(2)
        .write_fraction(0.0)
        .maintenance_loop_delay(Duration::ZERO)
        .build();
    let pool = new_pool(&service, options);
    fill(&pool).await;

    advance(mins(20)).await;
    pool.maintain().await;
    settle().await;

    let statements = service.statements();
    assert_eq!(statements.len(), 2);
    assert!(statements.iter().all(|(_, sql)| sql == "SELECT 1"));
    assert_eq!(service.created(), 2);
    assert_eq!(pool.statistics().read_pool, 2);
}

#[tokio::test(start_paused = true)]
async fn maintenance_evicts_and_replaces_on_next_tick() {
    let service = MockService::default();
    let options = SessionPoolOptions::builder()
        .min_sessions(2)
        .write_fraction(0.0)
        .maintenance_loop_delay(Duration::ZERO)
        .build();
    let pool = new_pool(&service, options);
    fill(&pool).await;

    advance(mins(150)).await;
    pool.maintain().await;
    settle().await;

    // this tick's fill ran before the eviction pass, so the aged-out
    // sessions are gone and their replacements wait for the next tick
    assert_eq!(service.deleted(), 2);
    assert_eq!(service.created(), 2);
    assert_eq!(pool.statistics().read_pool, 0);

    pool.maintain().await;
    pool.wait_until_ready().await.unwrap();
    assert_eq!(service.created(), 4);
    assert_eq!(pool.statistics().read_pool, 2);
}

#[tokio::test(start_paused = true)]
async fn failed_probe_discards_without_immediate_replacement() {
    let service = MockService::default();
    let options = SessionPoolOptions::builder()
        .min_sessions(1)
        .maintenance_loop_delay(Duration::ZERO)
        .build();
    let pool = new_pool(&service, options);
    fill(&pool).await;

    advance(mins(20)).await;
    service.fail_executes(Some(Error::internal("probe rejected")));
    pool.maintain().await;
    settle().await;

    // the session failed its probe and was dropped; the replacement waits
    // for the next tick
    assert_eq!(service.deleted(), 1);
    assert_eq!(service.created(), 1);
    assert_eq!(pool.statistics().read_pool, 0);

    service.fail_executes(None);
    pool.maintain().await;
    pool.wait_until_ready().await.unwrap();
    assert_eq!(service.created(), 2);
}

#[tokio::test(start_paused = true)]
async fn capacity_cap_holds_under_churn() {
    let service = MockService::default();
    let options = SessionPoolOptions::builder()
        .min_sessions(5)
        .max_sessions(8)
        .maintenance_loop_delay(Duration::ZERO)
        .build();
    let pool = new_pool(&service, options);
    fill(&pool).await;

    let mut workers = Vec::new();
    for _ in 0..20 {
        workers.push(runtime::spawn({
            let pool = pool.clone();
            async move {
                let session = pool.acquire(SessionKind::ReadOnly).await.unwrap();
                tokio::time::sleep(Duration::from_millis(5)).await;
                drop(session);
            }
        }));
    }
    for worker in workers {
        worker.await;
    }
    settle().await;

    assert!(service.alive() <= 8);
    assert_eq!(pool.statistics().active_sessions, 0);
}
