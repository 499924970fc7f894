use std::{collections::VecDeque, sync::Arc, time::Duration};

use rand::{rngs::SmallRng, SeedableRng};
use tokio::time::{Instant, MissedTickBehavior};

use super::{
    manager::{
        CheckedInSession, Completion, ManagementRequestReceiver, PoolManagementRequest,
        PoolManager,
    },
    session::{PooledSession, SessionKind, SessionRecord},
    session_requester,
    session_requester::{SessionRequest, SessionRequestReceiver, SessionRequester},
    status,
    status::{PoolStatus, StatusPublisher, StatusSubscriber},
};
use crate::{
    error::{Error, Result},
    options::{Jitter, SessionPoolOptions, WaitBehavior},
    runtime,
    service::{SessionService, TransactionId},
};

/// How often the worker wakes up on its own. Outside of shutdown the tick is
/// a no-op; during shutdown it bounds the time between quiescence checks.
const TICK_FREQUENCY: Duration = Duration::from_secs(1);

/// How many times a creation task attempts the service before giving up.
const MAX_CREATE_ATTEMPTS: u32 = 3;

/// Backoff before the second creation attempt; doubles per attempt.
const CREATE_BACKOFF_INITIAL: Duration = Duration::from_millis(100);

/// The probe that both validates a session and resets its server-side idle
/// timer.
const KEEPALIVE_QUERY: &str = "SELECT 1";

/// A worker task that owns the shared state of one database's session pool.
///
/// All bookkeeping lives in this task; facades and spawned RPC tasks talk to
/// it over channels, so no mutation ever races another. Every RPC
/// (create/begin/probe/delete) runs in its own spawned task and reports back
/// over the management channel, which means arbitrary other transitions,
/// including shutdown, can interleave between an RPC starting and its result
/// being recorded.
pub(super) struct SessionPoolWorker {
    /// The database this pool's sessions belong to.
    database: String,

    service: Arc<dyn SessionService>,

    options: SessionPoolOptions,

    /// The number of sessions currently checked out of the pool.
    active_count: u32,

    /// The number of read-only creation tasks in flight.
    pending_reads: u32,

    /// The number of read/write creation tasks in flight.
    pending_writes: u32,

    /// The number of keepalive probes in flight. These sessions still count
    /// against the capacity cap; they exist server-side and will re-enter an
    /// idle queue on success.
    refreshing_count: u32,

    /// Idle sessions awaiting reuse, oldest first.
    idle_read: VecDeque<SessionRecord>,
    idle_write: VecDeque<SessionRecord>,

    /// Ordered queue of acquirers waiting for sessions.
    wait_queue: VecDeque<SessionRequest>,

    health: Health,

    /// Terminal once set. Observed by every subsequent path.
    shutdown: bool,

    /// Shutdown calls awaiting quiescence.
    shutdown_completions: Vec<Completion>,

    /// Receiver for incoming session checkout requests. Yields `None` once
    /// every facade handle has been dropped.
    request_receiver: SessionRequestReceiver,

    /// Receiver for check-ins and the results of spawned RPC tasks.
    management_receiver: ManagementRequestReceiver,

    /// Cloned onto checked-out sessions and into spawned tasks.
    manager: PoolManager,

    status_publisher: StatusPublisher,

    /// Randomness behind the jitter policies.
    rng: SmallRng,
}

/// Whether the pool believes it can create more sessions. Flipped to
/// `Failing` when a creation task gives up, and back to `Serving` by any
/// successful creation.
enum Health {
    Serving,
    Failing(Error),
}

impl SessionPoolWorker {
    /// Starts a worker and returns the handles used to communicate with it.
    /// Once all requesters are dropped, the worker deletes its idle sessions
    /// and exits.
    pub(super) fn start(
        database: String,
        service: Arc<dyn SessionService>,
        options: SessionPoolOptions,
    ) -> (PoolManager, SessionRequester, StatusSubscriber) {
        let (requester, request_receiver) = session_requester::channel();
        let (manager, management_receiver) = PoolManager::channel();
        let (status_publisher, status_subscriber) = status::channel();

        let rng = match options.jitter_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_os_rng(),
        };

        let worker = SessionPoolWorker {
            database,
            service,
            options,
            active_count: 0,
            pending_reads: 0,
            pending_writes: 0,
            refreshing_count: 0,
            idle_read: VecDeque::new(),
            idle_write: VecDeque::new(),
            wait_queue: VecDeque::new(),
            health: Health::Serving,
            shutdown: false,
            shutdown_completions: Vec::new(),
            request_receiver,
            management_receiver,
            manager: manager.clone(),
            status_publisher,
            rng,
        };

        runtime::spawn(worker.execute());

        (manager, requester, status_subscriber)
    }

    async fn execute(mut self) {
        let mut tick = tokio::time::interval(TICK_FREQUENCY);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let task = tokio::select! {
                // Poll in order so that check-ins, RPC results, and shutdown
                // always take priority over new checkout requests.
                biased;

                Some(request) = self.management_receiver.recv() => {
                    WorkerTask::Management(request)
                },
                request = self.request_receiver.recv() => match request {
                    Some(request) => WorkerTask::Acquire(request),
                    // the checkout channel closed: every facade handle has
                    // been dropped and there is nobody left to serve.
                    None => break,
                },
                _ = tick.tick() => WorkerTask::Tick,
            };

            match task {
                WorkerTask::Management(request) => self.handle_management(request),
                WorkerTask::Acquire(request) => self.handle_acquire(request),
                WorkerTask::Tick => {}
            }

            self.service_wait_queue();
            self.try_complete_shutdown();
            self.publish_status();
        }

        // All facade handles are gone; there is nobody left to serve.
        self.fail_waiters("session pool was closed");
        self.delete_idle_sessions();
    }

    fn handle_management(&mut self, request: PoolManagementRequest) {
        match request {
            PoolManagementRequest::CheckIn(session) => self.check_in(*session),
            PoolManagementRequest::CreationSucceeded {
                kind,
                name,
                transaction_id,
            } => self.creation_succeeded(kind, name, transaction_id),
            PoolManagementRequest::CreationFailed { kind, error } => {
                self.creation_failed(kind, error)
            }
            PoolManagementRequest::RefreshSucceeded(record) => self.refresh_succeeded(*record),
            PoolManagementRequest::RefreshFailed { record, error } => {
                self.refresh_failed(*record, error)
            }
            PoolManagementRequest::Maintain(completion) => {
                self.perform_maintenance();
                completion.resolve();
            }
            PoolManagementRequest::Shutdown(completion) => self.begin_shutdown(completion),
        }
    }

    fn handle_acquire(&mut self, request: SessionRequest) {
        if self.shutdown {
            let _ = request.fulfill(Err(Error::invalid_state(
                "cannot acquire a session from a pool that has shut down",
            )));
            return;
        }

        // Serving an idle session here cannot starve a parked waiter: a
        // waiter only parks when nothing compatible with it is idle, so
        // anything poppable now is of a kind no parked waiter can use.
        if let Some(record) = self.pop_idle(request.kind()) {
            self.deliver(request, record);
            return;
        }

        if matches!(self.options.wait_behavior, WaitBehavior::Fail)
            && self.total_sessions() >= self.options.max_sessions
        {
            let _ = request.fulfill(Err(Error::resource_exhausted(format!(
                "session pool for {} is at its maximum of {} sessions",
                self.database, self.options.max_sessions
            ))));
            return;
        }

        self.wait_queue.push_back(request);
    }

    /// Returns a session to the pool, or schedules a refresh or a deletion,
    /// depending on its state. Runs exactly once per checkout.
    fn check_in(&mut self, session: CheckedInSession) {
        let CheckedInSession {
            mut record,
            last_activity,
            discard,
        } = session;

        debug_assert!(self.active_count > 0, "check-in without a checkout");
        self.active_count -= 1;

        let now = Instant::now();

        // The caller already exercised the session; its server-side idle
        // timer restarted then, so no probe of our own is needed.
        if let Some(at) = last_activity {
            record.refresh_at = (at
                + self.jittered(self.options.refresh_delay, self.options.refresh_jitter))
            .min(record.evict_at);
        }

        if self.shutdown || discard || record.expired(now) {
            self.spawn_delete(record);
            return;
        }

        if record.needs_refresh(now) {
            self.spawn_refresh(record);
            return;
        }

        self.push_idle(record);
    }

    /// Wakes as many parked acquirers as the pool can serve: idle sessions go
    /// to the oldest compatible waiters, and creation tasks are spawned for
    /// the rest while capacity allows.
    fn service_wait_queue(&mut self) {
        self.deliver_idle_sessions();
        self.spawn_creates_for_waiters();
    }

    fn deliver_idle_sessions(&mut self) {
        let mut index = 0;
        while index < self.wait_queue.len() {
            if self.wait_queue[index].is_abandoned() {
                self.wait_queue.remove(index);
                continue;
            }
            let kind = self.wait_queue[index].kind();
            match self.pop_idle(kind) {
                Some(record) => {
                    let request = self
                        .wait_queue
                        .remove(index)
                        .expect("waiter index in bounds");
                    self.deliver(request, record);
                }
                None => index += 1,
            }
        }
    }

    fn spawn_creates_for_waiters(&mut self) {
        if self.shutdown {
            return;
        }

        // Waiters already covered by an in-flight creation don't get another
        // one. A pending read/write session can cover a read-only waiter,
        // never the reverse.
        let mut covered_reads = self.pending_reads;
        let mut covered_writes = self.pending_writes;
        let mut projected_total = self.total_sessions();
        let mut projected_pending = self.pending_creates();
        let mut to_spawn = Vec::new();

        for request in &self.wait_queue {
            if request.is_abandoned() {
                continue;
            }
            match request.kind() {
                SessionKind::ReadWrite if covered_writes > 0 => covered_writes -= 1,
                SessionKind::ReadOnly if covered_reads > 0 => covered_reads -= 1,
                SessionKind::ReadOnly if covered_writes > 0 => covered_writes -= 1,
                kind => {
                    if projected_total >= self.options.max_sessions
                        || projected_pending >= self.options.max_concurrent_creates
                    {
                        break;
                    }
                    to_spawn.push(kind);
                    projected_total += 1;
                    projected_pending += 1;
                }
            }
        }

        for kind in to_spawn {
            self.spawn_create(kind);
        }
    }

    /// Hand a session to a waiter. Delivery and wake-up are one atomic step;
    /// if the waiter hung up in the meantime, the session is taken back for
    /// the next waiter.
    fn deliver(&mut self, request: SessionRequest, record: SessionRecord) {
        self.active_count += 1;
        let session = PooledSession::new(record, self.manager.clone());
        if let Err(result) = request.fulfill(Ok(session)) {
            if let Ok(session) = result {
                self.active_count -= 1;
                self.push_idle(session.into_record());
            }
        }
    }

    fn pop_idle(&mut self, kind: SessionKind) -> Option<SessionRecord> {
        match kind {
            // A read-only acquisition prefers a plain session but will take a
            // read/write one, leaving its pre-begun transaction unused.
            SessionKind::ReadOnly => self
                .idle_read
                .pop_front()
                .or_else(|| self.idle_write.pop_front()),
            SessionKind::ReadWrite => self.idle_write.pop_front(),
        }
    }

    fn push_idle(&mut self, record: SessionRecord) {
        match record.kind {
            SessionKind::ReadOnly => self.idle_read.push_back(record),
            SessionKind::ReadWrite => self.idle_write.push_back(record),
        }
    }

    fn pending_creates(&self) -> u32 {
        self.pending_reads + self.pending_writes
    }

    /// Everything the service is holding open for this pool: checked-out,
    /// being created, being probed, and idle. Bounded by `max_sessions`.
    fn total_sessions(&self) -> u32 {
        self.active_count
            + self.pending_creates()
            + self.refreshing_count
            + self.idle_read.len() as u32
            + self.idle_write.len() as u32
    }

    fn can_spawn_create(&self) -> bool {
        !self.shutdown
            && self.total_sessions() < self.options.max_sessions
            && self.pending_creates() < self.options.max_concurrent_creates
    }

    fn spawn_create(&mut self, kind: SessionKind) {
        match kind {
            SessionKind::ReadOnly => self.pending_reads += 1,
            SessionKind::ReadWrite => self.pending_writes += 1,
        }

        let service = Arc::clone(&self.service);
        let database = self.database.clone();
        let manager = self.manager.clone();
        runtime::spawn(run_create(service, database, kind, manager));
    }

    fn creation_succeeded(
        &mut self,
        kind: SessionKind,
        name: String,
        transaction_id: Option<TransactionId>,
    ) {
        self.decrement_pending(kind);

        let now = Instant::now();
        let refresh_at =
            now + self.jittered(self.options.refresh_delay, self.options.refresh_jitter);
        let evict_at = (now
            + self.jittered(self.options.eviction_delay, self.options.eviction_jitter))
        .max(refresh_at);
        let record = SessionRecord {
            name,
            kind,
            transaction_id,
            refresh_at,
            evict_at,
        };

        if self.shutdown {
            self.spawn_delete(record);
            return;
        }

        self.health = Health::Serving;
        self.push_idle(record);
    }

    fn creation_failed(&mut self, kind: SessionKind, error: Error) {
        self.decrement_pending(kind);

        if self.shutdown {
            return;
        }

        tracing::warn!(
            "failed to create a session for {}: {}",
            self.database,
            error
        );
        self.health = Health::Failing(error.clone());

        // Surface the failure to the oldest live waiter; the rest keep
        // waiting so a concurrent creation that succeeds can still serve
        // them.
        loop {
            match self.wait_queue.pop_front() {
                Some(request) if request.is_abandoned() => continue,
                Some(request) => {
                    let _ = request.fulfill(Err(error));
                    break;
                }
                None => break,
            }
        }
    }

    fn decrement_pending(&mut self, kind: SessionKind) {
        match kind {
            SessionKind::ReadOnly => self.pending_reads -= 1,
            SessionKind::ReadWrite => self.pending_writes -= 1,
        }
    }

    fn spawn_refresh(&mut self, record: SessionRecord) {
        self.refreshing_count += 1;
        let service = Arc::clone(&self.service);
        let manager = self.manager.clone();
        runtime::spawn(async move {
            match service.execute_sql(&record.name, KEEPALIVE_QUERY).await {
                Ok(()) => manager.refresh_succeeded(record),
                Err(error) => manager.refresh_failed(record, error),
            }
        });
    }

    fn refresh_succeeded(&mut self, mut record: SessionRecord) {
        self.refreshing_count -= 1;

        let now = Instant::now();
        record.refresh_at = (now
            + self.jittered(self.options.refresh_delay, self.options.refresh_jitter))
        .min(record.evict_at);

        if self.shutdown || record.expired(now) {
            self.spawn_delete(record);
            return;
        }

        self.push_idle(record);
    }

    fn refresh_failed(&mut self, record: SessionRecord, error: Error) {
        self.refreshing_count -= 1;
        tracing::debug!(
            "keepalive probe failed for session {}: {}",
            record.name,
            error
        );
        self.spawn_delete(record);
    }

    /// One maintenance tick: top up the warm floor, probe stale idle
    /// sessions, then evict aged-out ones. Fill runs first, so sessions
    /// removed by this tick's probe failures or eviction pass are replaced
    /// by the next tick.
    fn perform_maintenance(&mut self) {
        if self.shutdown {
            return;
        }
        let now = Instant::now();
        self.fill_pool();
        self.refresh_stale(now);
        self.evict_expired(now);
    }

    fn evict_expired(&mut self, now: Instant) {
        let mut expired = Vec::new();
        for queue in [&mut self.idle_read, &mut self.idle_write] {
            let mut index = 0;
            while index < queue.len() {
                if queue[index].expired(now) {
                    if let Some(record) = queue.remove(index) {
                        expired.push(record);
                    }
                } else {
                    index += 1;
                }
            }
        }
        for record in expired {
            tracing::debug!("evicting session {} past its age limit", record.name);
            self.spawn_delete(record);
        }
    }

    fn refresh_stale(&mut self, now: Instant) {
        while self.refreshing_count < self.options.max_concurrent_creates {
            let record = match Self::pop_stale(&mut self.idle_read, now) {
                Some(record) => Some(record),
                None => Self::pop_stale(&mut self.idle_write, now),
            };
            match record {
                Some(record) => self.spawn_refresh(record),
                None => break,
            }
        }
    }

    fn pop_stale(queue: &mut VecDeque<SessionRecord>, now: Instant) -> Option<SessionRecord> {
        // Jitter means deadlines aren't strictly ordered by queue position,
        // so scan rather than trusting the front. Sessions already past
        // their age limit are left for the eviction pass.
        let index = queue
            .iter()
            .position(|record| record.needs_refresh(now) && !record.expired(now))?;
        queue.remove(index)
    }

    fn fill_pool(&mut self) {
        let write_target = self.options.write_session_target();
        loop {
            if !self.can_spawn_create() {
                break;
            }
            let warm = self.idle_read.len() as u32
                + self.idle_write.len() as u32
                + self.pending_creates()
                + self.refreshing_count;
            if warm >= self.options.min_sessions {
                break;
            }
            let writes = self.idle_write.len() as u32 + self.pending_writes;
            let kind = if writes < write_target {
                SessionKind::ReadWrite
            } else {
                SessionKind::ReadOnly
            };
            self.spawn_create(kind);
        }
    }

    fn spawn_delete(&self, record: SessionRecord) {
        let service = Arc::clone(&self.service);
        runtime::spawn(async move {
            if let Err(error) = service.delete_session(&record.name).await {
                // Best-effort: the session is already gone from the pool's
                // accounting and will age out server-side.
                tracing::warn!("failed to delete session {}: {}", record.name, error);
            }
        });
    }

    fn begin_shutdown(&mut self, completion: Completion) {
        self.shutdown_completions.push(completion);
        if self.shutdown {
            return;
        }
        self.shutdown = true;
        tracing::debug!("shutting down session pool for {}", self.database);
        self.fail_waiters("session pool is shutting down");
        self.delete_idle_sessions();
    }

    fn try_complete_shutdown(&mut self) {
        if self.shutdown
            && self.active_count == 0
            && self.pending_creates() == 0
            && self.refreshing_count == 0
        {
            for completion in self.shutdown_completions.drain(..) {
                completion.resolve();
            }
        }
    }

    fn fail_waiters(&mut self, message: &str) {
        for request in self.wait_queue.drain(..) {
            let _ = request.fulfill(Err(Error::canceled(message)));
        }
    }

    fn delete_idle_sessions(&mut self) {
        let idle: Vec<SessionRecord> = self
            .idle_read
            .drain(..)
            .chain(self.idle_write.drain(..))
            .collect();
        for record in idle {
            self.spawn_delete(record);
        }
    }

    fn jittered(&mut self, base: Duration, jitter: Jitter) -> Duration {
        jitter.apply(base, &mut self.rng)
    }

    fn publish_status(&self) {
        self.status_publisher.publish(PoolStatus {
            active: self.active_count,
            in_flight_creates: self.pending_creates(),
            read_idle: self.idle_read.len() as u32,
            write_idle: self.idle_write.len() as u32,
            last_error: match &self.health {
                Health::Serving => None,
                Health::Failing(error) => Some(error.clone()),
            },
            shutdown: self.shutdown,
        });
    }
}

/// Task to process by the worker.
enum WorkerTask {
    Management(PoolManagementRequest),
    Acquire(SessionRequest),
    Tick,
}

/// Body of a spawned creation task: create the session (and begin a
/// transaction for read/write targets), retrying transient failures with
/// backoff, then report the outcome to the worker.
async fn run_create(
    service: Arc<dyn SessionService>,
    database: String,
    kind: SessionKind,
    manager: PoolManager,
) {
    let mut attempt = 1;
    let mut backoff = CREATE_BACKOFF_INITIAL;
    let result = loop {
        match try_create(service.as_ref(), &database, kind).await {
            Ok(created) => break Ok(created),
            Err(error) if error.is_retryable() && attempt < MAX_CREATE_ATTEMPTS => {
                tracing::debug!(
                    "retrying session creation for {} after attempt {}: {}",
                    database,
                    attempt,
                    error
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
                backoff *= 2;
            }
            Err(error) => break Err(error),
        }
    };

    match result {
        Ok((name, transaction_id)) => manager.creation_succeeded(kind, name, transaction_id),
        Err(error) => manager.creation_failed(kind, error),
    }
}

async fn try_create(
    service: &dyn SessionService,
    database: &str,
    kind: SessionKind,
) -> Result<(String, Option<TransactionId>)> {
    let created = service.create_session(database).await?;
    let transaction_id = match kind {
        SessionKind::ReadOnly => None,
        SessionKind::ReadWrite => match service.begin_transaction(&created.name).await {
            Ok(id) => Some(id),
            Err(error) => {
                // The session exists server-side; don't leak it.
                let name = created.name.clone();
                let delete = service.delete_session(&created.name);
                runtime::spawn(async move {
                    if let Err(delete_error) = delete.await {
                        tracing::warn!("failed to delete session {}: {}", name, delete_error);
                    }
                });
                return Err(error);
            }
        },
    };
    Ok((created.name, transaction_id))
}
