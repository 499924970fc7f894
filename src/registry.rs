//! The process-wide mapping from databases to their session pools.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
    time::Duration,
};

use derive_where::derive_where;
use futures_util::future::join_all;

use crate::{
    error::Result,
    options::SessionPoolOptions,
    pool::SessionPool,
    runtime::{self, AsyncJoinHandle},
    service::SessionService,
};

/// Hands out one [`SessionPool`] per database, creating pools lazily on
/// first use, and runs their maintenance on a single shared timer.
///
/// The ticker holds only a weak reference to the pool map, so dropping the
/// registry stops it.
#[derive_where(Debug)]
pub struct PoolRegistry {
    #[derive_where(skip)]
    service: Arc<dyn SessionService>,
    options: SessionPoolOptions,
    pools: Arc<Mutex<HashMap<String, SessionPool>>>,
    ticker: Option<AsyncJoinHandle<()>>,
}

impl PoolRegistry {
    /// Create a registry whose pools share `options`. If
    /// `maintenance_loop_delay` is nonzero, a background task calls
    /// [`SessionPool::maintain`] on every pool at that cadence; a zero delay
    /// disables the timer, leaving maintenance to explicit calls. Must be
    /// called from within a tokio runtime.
    pub fn new(service: Arc<dyn SessionService>, options: SessionPoolOptions) -> Result<Self> {
        options.validate()?;
        let pools: Arc<Mutex<HashMap<String, SessionPool>>> = Default::default();
        let ticker = if options.maintenance_loop_delay > Duration::ZERO {
            Some(runtime::spawn(run_maintenance(
                Arc::downgrade(&pools),
                options.maintenance_loop_delay,
            )))
        } else {
            None
        };
        Ok(Self {
            service,
            options,
            pools,
            ticker,
        })
    }

    /// The pool for `database`, created on first use.
    pub fn get(&self, database: impl Into<String>) -> SessionPool {
        let database = database.into();
        let mut pools = self.pools.lock().unwrap();
        pools
            .entry(database.clone())
            .or_insert_with(|| {
                SessionPool::with_validated_options(
                    database,
                    Arc::clone(&self.service),
                    self.options.clone(),
                )
            })
            .clone()
    }

    /// Shut down every pool in the registry concurrently and stop the
    /// maintenance timer. See [`SessionPool::shutdown`].
    pub async fn shutdown(&self) {
        if let Some(ticker) = &self.ticker {
            ticker.abort();
        }
        let pools: Vec<SessionPool> = self.pools.lock().unwrap().values().cloned().collect();
        join_all(pools.iter().map(|pool| pool.shutdown())).await;
    }
}

async fn run_maintenance(pools: Weak<Mutex<HashMap<String, SessionPool>>>, delay: Duration) {
    let start = tokio::time::Instant::now() + delay;
    let mut interval = tokio::time::interval_at(start, delay);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        interval.tick().await;
        let snapshot: Vec<SessionPool> = match pools.upgrade() {
            Some(pools) => pools.lock().unwrap().values().cloned().collect(),
            None => break,
        };
        for pool in snapshot {
            pool.maintain().await;
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::PoolRegistry;
    use crate::{
        options::SessionPoolOptions,
        pool::{test::MockService, SessionKind},
    };

    fn manual_options() -> SessionPoolOptions {
        SessionPoolOptions::builder()
            .min_sessions(3)
            .maintenance_loop_delay(Duration::ZERO)
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn pools_are_created_lazily_and_shared() {
        let service = MockService::default();
        let registry = PoolRegistry::new(service.arc(), manual_options()).unwrap();

        let first = registry.get("databases/a");
        let again = registry.get("databases/a");
        first.maintain().await;
        first.wait_until_ready().await.unwrap();

        let session = first.acquire(SessionKind::ReadOnly).await.unwrap();
        assert_eq!(again.statistics().active_sessions, 1);

        let other = registry.get("databases/b");
        assert_eq!(other.statistics().active_sessions, 0);
        drop(session);
    }

    #[tokio::test(start_paused = true)]
    async fn background_ticker_fills_pools() {
        let service = MockService::default();
        let options = SessionPoolOptions::builder()
            .min_sessions(3)
            .maintenance_loop_delay(Duration::from_secs(1))
            .build();
        let registry = PoolRegistry::new(service.arc(), options).unwrap();

        let pool = registry.get("databases/a");
        pool.wait_until_ready().await.unwrap();
        assert_eq!(service.created(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_delay_disables_the_ticker() {
        let service = MockService::default();
        let registry = PoolRegistry::new(service.arc(), manual_options()).unwrap();

        let pool = registry.get("databases/a");
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(service.created(), 0);

        pool.maintain().await;
        pool.wait_until_ready().await.unwrap();
        assert_eq!(service.created(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_covers_every_pool() {
        let service = MockService::default();
        let registry = PoolRegistry::new(service.arc(), manual_options()).unwrap();

        let a = registry.get("databases/a");
        let b = registry.get("databases/b");
        a.maintain().await;
        b.maintain().await;
        a.wait_until_ready().await.unwrap();
        b.wait_until_ready().await.unwrap();

        registry.shutdown().await;
        // let the spawned deletion tasks run
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(a.statistics().shutdown);
        assert!(b.statistics().shutdown);
        assert!(a
            .acquire(SessionKind::ReadOnly)
            .await
            .unwrap_err()
            .is_invalid_state());
        assert_eq!(service.alive(), 0);
    }
}
