//! the task based connection pool.
//!
//! the same policies as the thread pool, with workers as tokio tasks, an
//! async scheduler and an async rendezvous for waiting clients.

use core::time::Duration;

use std::{
    collections::VecDeque,
    ops::Deref,
    sync::{Arc, Mutex, Weak},
    time::Instant,
};

use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::{
    connection::ConnectOptions,
    connection_async::AsyncConnection,
    errors::{Error, OperationalError, PoolClosed, PoolTimeout, ProgrammingError, TooManyRequests},
    pq::TransactionStatus,
    queries::Params,
};

use super::{jitter, sched::AsyncScheduler, Attempt, PoolConfig, PoolStats};

const WORKER_TIMEOUT: Duration = Duration::from_secs(60);

type TaskReceiver = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<MaintenanceTask>>>;

pub type AsyncConfigureHook =
    Arc<dyn Fn(&AsyncConnection) -> Result<(), Error> + Send + Sync>;
pub type AsyncResetHook = Arc<dyn Fn(&AsyncConnection) -> Result<(), Error> + Send + Sync>;
pub type AsyncReconnectFailedHook = Arc<dyn Fn(&AsyncPool) + Send + Sync>;

/// builder for [`AsyncPool`].
pub struct AsyncPoolBuilder {
    config: PoolConfig,
    connect_opts: ConnectOptions,
    configure: Option<AsyncConfigureHook>,
    reset: Option<AsyncResetHook>,
    reconnect_failed: Option<AsyncReconnectFailedHook>,
}

impl AsyncPoolBuilder {
    pub fn min_size(mut self, min_size: usize) -> Self {
        self.config.min_size = min_size;
        if self.config.max_size < min_size {
            self.config.max_size = min_size;
        }
        self
    }

    pub fn max_size(mut self, max_size: usize) -> Self {
        self.config.max_size = max_size;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn max_waiting(mut self, max_waiting: usize) -> Self {
        self.config.max_waiting = max_waiting;
        self
    }

    pub fn max_lifetime(mut self, max_lifetime: Duration) -> Self {
        self.config.max_lifetime = max_lifetime;
        self
    }

    pub fn max_idle(mut self, max_idle: Duration) -> Self {
        self.config.max_idle = max_idle;
        self
    }

    pub fn reconnect_timeout(mut self, reconnect_timeout: Duration) -> Self {
        self.config.reconnect_timeout = reconnect_timeout;
        self
    }

    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.config.num_workers = num_workers;
        self
    }

    pub fn connect_options(mut self, opts: ConnectOptions) -> Self {
        self.connect_opts = opts;
        self
    }

    pub fn configure(mut self, hook: AsyncConfigureHook) -> Self {
        self.configure = Some(hook);
        self
    }

    pub fn reset(mut self, hook: AsyncResetHook) -> Self {
        self.reset = Some(hook);
        self
    }

    pub fn reconnect_failed(mut self, hook: AsyncReconnectFailedHook) -> Self {
        self.reconnect_failed = Some(hook);
        self
    }

    /// build and open the pool. must run inside a tokio runtime.
    pub fn build(self) -> Result<AsyncPool, Error> {
        self.config.check()?;
        let (tasks_tx, tasks_rx) = mpsc::unbounded_channel();
        let pool = AsyncPool {
            inner: Arc::new(AsyncPoolInner {
                config: self.config,
                connect_opts: self.connect_opts,
                configure: self.configure,
                reset: self.reset,
                reconnect_failed: self.reconnect_failed,
                state: Mutex::new(AsyncPoolState::new()),
                tasks_tx,
                sched: Arc::new(AsyncScheduler::new()),
                stats: PoolStats::default(),
                full_event: Notify::new(),
            }),
        };
        // the receiver lives outside the shared state so idle workers do not
        // keep a dropped pool alive
        pool.open(Arc::new(tokio::sync::Mutex::new(tasks_rx)))?;
        Ok(pool)
    }
}

struct PooledConn {
    conn: AsyncConnection,
    expire_at: Instant,
}

enum WaitState {
    Waiting,
    Ready(PooledConn),
    Failed(Error),
    Abandoned,
}

struct WaitingClient {
    state: Mutex<WaitState>,
    event: Notify,
}

impl WaitingClient {
    fn new() -> Self {
        Self {
            state: Mutex::new(WaitState::Waiting),
            event: Notify::new(),
        }
    }

    async fn wait(&self, timeout: Duration) -> Result<PooledConn, Error> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                match std::mem::replace(&mut *state, WaitState::Abandoned) {
                    WaitState::Ready(conn) => return Ok(conn),
                    WaitState::Failed(err) => return Err(err),
                    WaitState::Waiting => *state = WaitState::Waiting,
                    WaitState::Abandoned => unreachable!("a waiting client waits once"),
                }
            }
            let now = Instant::now();
            if now >= deadline {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if matches!(*state, WaitState::Waiting) {
                    *state = WaitState::Abandoned;
                    return Err(PoolTimeout { elapsed: timeout }.into());
                }
                // a connection arrived between the deadline and the lock
                continue;
            }
            let _ = tokio::time::timeout(deadline - now, self.event.notified()).await;
        }
    }

    fn set(&self, conn: PooledConn) -> Result<(), PooledConn> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match &*state {
            WaitState::Waiting => {
                *state = WaitState::Ready(conn);
                self.event.notify_one();
                Ok(())
            }
            _ => Err(conn),
        }
    }

    fn fail(&self, err: Error) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match &*state {
            WaitState::Waiting => {
                *state = WaitState::Failed(err);
                self.event.notify_one();
                true
            }
            _ => false,
        }
    }
}

enum MaintenanceTask {
    AddConnection { attempt: Option<Attempt>, growing: bool },
    ReturnConnection { conn: PooledConn },
    ShrinkPool,
    StopWorker,
}

struct AsyncPoolState {
    idle: VecDeque<PooledConn>,
    waiting: VecDeque<Arc<WaitingClient>>,
    nconns: usize,
    nconns_min: usize,
    growing: bool,
    opened: bool,
    closed: bool,
    fill_target: Option<usize>,
    min_size: usize,
    max_size: usize,
    workers: Vec<tokio::task::JoinHandle<()>>,
    sched_runner: Option<tokio::task::JoinHandle<()>>,
}

impl AsyncPoolState {
    fn new() -> Self {
        Self {
            idle: VecDeque::new(),
            waiting: VecDeque::new(),
            nconns: 0,
            nconns_min: 0,
            growing: false,
            opened: false,
            closed: true,
            fill_target: None,
            min_size: 0,
            max_size: 0,
            workers: Vec::new(),
            sched_runner: None,
        }
    }
}

struct AsyncPoolInner {
    config: PoolConfig,
    connect_opts: ConnectOptions,
    configure: Option<AsyncConfigureHook>,
    reset: Option<AsyncResetHook>,
    reconnect_failed: Option<AsyncReconnectFailedHook>,
    state: Mutex<AsyncPoolState>,
    tasks_tx: mpsc::UnboundedSender<MaintenanceTask>,
    sched: Arc<AsyncScheduler>,
    stats: PoolStats,
    full_event: Notify,
}

/// a pool of cooperative connections served to tasks.
#[derive(Clone)]
pub struct AsyncPool {
    inner: Arc<AsyncPoolInner>,
}

impl AsyncPool {
    pub fn builder(conninfo: &str) -> AsyncPoolBuilder {
        AsyncPoolBuilder {
            config: PoolConfig::new(conninfo.to_string()),
            connect_opts: ConnectOptions::default(),
            configure: None,
            reset: None,
            reconnect_failed: None,
        }
    }

    fn open(&self, tasks_rx: TaskReceiver) -> Result<(), Error> {
        let mut state = self.lock();
        if !state.closed {
            return Ok(());
        }
        if state.opened {
            return Err(OperationalError::new(
                "the pool has already been opened and closed and cannot be reused",
            )
            .into());
        }
        state.closed = false;
        state.opened = true;
        state.min_size = self.inner.config.min_size;
        state.max_size = self.inner.config.max_size;
        state.nconns = self.inner.config.min_size;
        state.nconns_min = self.inner.config.min_size;
        state.fill_target = Some(self.inner.config.min_size);

        let sched = self.inner.sched.clone();
        state.sched_runner = Some(tokio::spawn(async move { sched.run().await }));
        for _ in 0..self.inner.config.num_workers {
            let inner = Arc::downgrade(&self.inner);
            state.workers.push(tokio::spawn(worker(inner, tasks_rx.clone())));
        }

        for _ in 0..self.inner.config.min_size {
            self.run_task(MaintenanceTask::AddConnection {
                attempt: None,
                growing: false,
            });
        }
        self.schedule_task(MaintenanceTask::ShrinkPool, self.inner.config.max_idle);
        Ok(())
    }

    /// wait for the initial fill to reach `min_size`.
    pub async fn wait(&self, timeout: Duration) -> Result<(), Error> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.lock();
                if state.closed {
                    return Err(PoolClosed.into());
                }
                match state.fill_target {
                    None => return Ok(()),
                    Some(target) if state.idle.len() >= target => {
                        state.fill_target = None;
                        return Ok(());
                    }
                    Some(_) => {}
                }
            }
            let now = Instant::now();
            if now >= deadline {
                self.close(Duration::from_secs(5)).await;
                return Err(PoolTimeout { elapsed: timeout }.into());
            }
            let _ = tokio::time::timeout(deadline - now, self.inner.full_event.notified()).await;
        }
    }

    pub async fn close(&self, timeout: Duration) {
        let (waiting, idle, workers, sched_runner) = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            debug!("pool closed");
            (
                std::mem::take(&mut state.waiting),
                std::mem::take(&mut state.idle),
                std::mem::take(&mut state.workers),
                state.sched_runner.take(),
            )
        };

        self.inner.sched.enter(Duration::ZERO, None);
        for _ in 0..self.inner.config.num_workers {
            self.run_task(MaintenanceTask::StopWorker);
        }

        for client in waiting {
            client.fail(PoolClosed.into());
        }
        for idle in idle {
            idle.conn.close().await;
        }

        let join_all = async {
            for handle in workers {
                let _ = handle.await;
            }
            if let Some(handle) = sched_runner {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(timeout, join_all).await.is_err() {
            warn!("couldn't stop pool tasks in time");
        }
    }

    pub fn closed(&self) -> bool {
        self.lock().closed
    }

    /// take a connection, waiting up to `timeout` (the pool default when
    /// `None`).
    pub async fn getconn(&self, timeout: Option<Duration>) -> Result<AsyncPoolConnection, Error> {
        self.inner.stats.add(&self.inner.stats.requests_num, 1);
        let timeout = timeout.unwrap_or(self.inner.config.timeout);

        let waiter = {
            let mut state = self.lock();
            if state.closed {
                self.inner.stats.add(&self.inner.stats.requests_errors, 1);
                return Err(PoolClosed.into());
            }
            if let Some(conn) = state.idle.pop_front() {
                if state.idle.len() < state.nconns_min {
                    state.nconns_min = state.idle.len();
                }
                return Ok(self.handout(conn));
            }
            if self.inner.config.max_waiting > 0 && state.waiting.len() >= self.inner.config.max_waiting {
                self.inner.stats.add(&self.inner.stats.requests_errors, 1);
                return Err(TooManyRequests {
                    waiting: state.waiting.len(),
                }
                .into());
            }
            let waiter = Arc::new(WaitingClient::new());
            state.waiting.push_back(waiter.clone());
            self.inner.stats.add(&self.inner.stats.requests_queued, 1);
            self.maybe_grow(&mut state);
            waiter
        };

        let t0 = Instant::now();
        let res = waiter.wait(timeout).await;
        self.inner
            .stats
            .add(&self.inner.stats.requests_wait_ms, t0.elapsed().as_millis() as u64);
        match res {
            Ok(conn) => Ok(self.handout(conn)),
            Err(err) => {
                self.inner.stats.add(&self.inner.stats.requests_errors, 1);
                Err(err)
            }
        }
    }

    pub async fn connection(&self) -> Result<AsyncPoolConnection, Error> {
        self.getconn(None).await
    }

    fn handout(&self, conn: PooledConn) -> AsyncPoolConnection {
        debug!("connection given by the pool");
        AsyncPoolConnection {
            pool: self.clone(),
            conn: Some(conn),
            taken_at: Instant::now(),
        }
    }

    pub fn resize(&self, min_size: usize, max_size: Option<usize>) -> Result<(), Error> {
        let max_size = max_size.unwrap_or(min_size);
        if max_size < min_size {
            return Err(ProgrammingError::new("max_size must be greater or equal than min_size").into());
        }

        let ngrow = {
            let mut state = self.lock();
            let ngrow = min_size.saturating_sub(state.min_size);
            info!(min_size, max_size, "resizing pool");
            state.min_size = min_size;
            state.max_size = max_size;
            state.nconns += ngrow;
            ngrow
        };
        for _ in 0..ngrow {
            self.run_task(MaintenanceTask::AddConnection {
                attempt: None,
                growing: false,
            });
        }
        Ok(())
    }

    /// verify every idle connection, replacing the broken ones.
    pub async fn check(&self) -> Result<(), Error> {
        let idle = {
            let mut state = self.lock();
            std::mem::take(&mut state.idle)
        };

        for conn in idle {
            let healthy = conn.conn.execute("SELECT 1", Params::None).await.is_ok()
                && match conn.conn.transaction_status().await {
                    TransactionStatus::InTrans => conn.conn.rollback().await.is_ok(),
                    TransactionStatus::Idle => true,
                    _ => false,
                };
            if healthy {
                self.add_to_pool(conn);
            } else {
                warn!("discarding broken connection");
                self.inner.stats.add(&self.inner.stats.connections_lost, 1);
                conn.conn.close().await;
                self.run_task(MaintenanceTask::AddConnection {
                    attempt: None,
                    growing: false,
                });
            }
        }
        Ok(())
    }

    pub fn get_stats(&self) -> std::collections::HashMap<&'static str, u64> {
        self.inner.stats.snapshot(&self.gauges())
    }

    pub fn pop_stats(&self) -> std::collections::HashMap<&'static str, u64> {
        self.inner.stats.pop(&self.gauges())
    }

    fn gauges(&self) -> Vec<(&'static str, u64)> {
        let state = self.lock();
        vec![
            ("pool_min", state.min_size as u64),
            ("pool_max", state.max_size as u64),
            ("pool_size", state.nconns as u64),
            ("pool_available", state.idle.len() as u64),
            ("requests_waiting", state.waiting.len() as u64),
        ]
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AsyncPoolState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn run_task(&self, task: MaintenanceTask) {
        let _ = self.inner.tasks_tx.send(task);
    }

    fn schedule_task(&self, task: MaintenanceTask, delay: Duration) {
        let inner = Arc::downgrade(&self.inner);
        let mut task = Some(task);
        self.inner.sched.enter(
            delay,
            Some(Box::new(move || {
                if let (Some(task), Some(inner)) = (task.take(), inner.upgrade()) {
                    let pool = AsyncPool { inner };
                    if !pool.lock().closed {
                        pool.run_task(task);
                    }
                }
            })),
        );
    }

    fn maybe_grow(&self, state: &mut AsyncPoolState) {
        if state.nconns >= state.max_size || state.growing {
            return;
        }
        state.nconns += 1;
        state.growing = true;
        info!(nconns = state.nconns, "growing pool");
        self.run_task(MaintenanceTask::AddConnection {
            attempt: None,
            growing: true,
        });
    }

    async fn run_maintenance(&self, task: MaintenanceTask) {
        match task {
            MaintenanceTask::AddConnection { attempt, growing } => {
                self.add_connection(attempt, growing).await
            }
            MaintenanceTask::ReturnConnection { conn } => self.return_connection(conn).await,
            MaintenanceTask::ShrinkPool => {
                self.schedule_task(MaintenanceTask::ShrinkPool, self.inner.config.max_idle);
                self.shrink_pool().await;
            }
            MaintenanceTask::StopWorker => {}
        }
    }

    async fn connect(&self) -> Result<PooledConn, Error> {
        self.inner.stats.add(&self.inner.stats.connections_num, 1);
        let t0 = Instant::now();
        let conn = match AsyncConnection::connect_opts(
            &self.inner.config.conninfo,
            self.inner.connect_opts.clone(),
        )
        .await
        {
            Ok(conn) => conn,
            Err(err) => {
                self.inner.stats.add(&self.inner.stats.connections_errors, 1);
                return Err(err);
            }
        };
        self.inner
            .stats
            .add(&self.inner.stats.connections_ms, t0.elapsed().as_millis() as u64);

        if let Some(configure) = &self.inner.configure {
            configure(&conn)?;
            if conn.transaction_status().await != TransactionStatus::Idle {
                conn.close().await;
                return Err(ProgrammingError::new(
                    "connection left in transaction by the configure callback: discarded",
                )
                .into());
            }
        }

        let expire_at = Instant::now() + jitter(self.inner.config.max_lifetime, -0.05, 0.0);
        Ok(PooledConn { conn, expire_at })
    }

    async fn add_connection(&self, attempt: Option<Attempt>, growing: bool) {
        let now = Instant::now();
        let mut attempt = attempt.unwrap_or_else(|| Attempt::new(self.inner.config.reconnect_timeout));

        match self.connect().await {
            Ok(conn) => {
                info!("adding new connection to the pool");
                self.add_to_pool(conn);
                if growing {
                    let grow_more = {
                        let mut state = self.lock();
                        if state.nconns < state.min_size
                            || (state.nconns < state.max_size && !state.waiting.is_empty())
                        {
                            state.nconns += 1;
                            info!(nconns = state.nconns, "growing pool");
                            true
                        } else {
                            state.growing = false;
                            false
                        }
                    };
                    if grow_more {
                        self.run_task(MaintenanceTask::AddConnection {
                            attempt: None,
                            growing: true,
                        });
                    }
                }
            }
            Err(err) => {
                warn!("error connecting in pool: {err}");
                if attempt.time_to_give_up(now) {
                    warn!(
                        "reconnection attempt failed after {:?}",
                        self.inner.config.reconnect_timeout
                    );
                    {
                        let mut state = self.lock();
                        state.nconns -= 1;
                        if growing && state.growing {
                            state.growing = false;
                        }
                    }
                    if let Some(hook) = &self.inner.reconnect_failed {
                        hook(self);
                    }
                } else {
                    attempt.update_delay(now);
                    let delay = attempt.delay;
                    let inner = Arc::downgrade(&self.inner);
                    let mut payload = Some((attempt, growing));
                    self.inner.sched.enter(
                        delay,
                        Some(Box::new(move || {
                            if let (Some((attempt, growing)), Some(inner)) = (payload.take(), inner.upgrade())
                            {
                                let pool = AsyncPool { inner };
                                if !pool.lock().closed {
                                    pool.run_task(MaintenanceTask::AddConnection {
                                        attempt: Some(attempt),
                                        growing,
                                    });
                                }
                            }
                        })),
                    );
                }
            }
        }
    }

    async fn return_connection(&self, conn: PooledConn) {
        if self.lock().closed {
            conn.conn.close().await;
            return;
        }

        let conn = match self.reset_connection(conn).await {
            Some(conn) => conn,
            None => {
                self.inner.stats.add(&self.inner.stats.returns_bad, 1);
                warn!("discarding closed returned connection");
                self.run_task(MaintenanceTask::AddConnection {
                    attempt: None,
                    growing: false,
                });
                return;
            }
        };

        if conn.expire_at <= Instant::now() {
            info!("discarding expired connection");
            conn.conn.close().await;
            self.run_task(MaintenanceTask::AddConnection {
                attempt: None,
                growing: false,
            });
            return;
        }

        self.add_to_pool(conn);
    }

    async fn reset_connection(&self, conn: PooledConn) -> Option<PooledConn> {
        match conn.conn.transaction_status().await {
            TransactionStatus::Idle => {}
            TransactionStatus::InTrans | TransactionStatus::InError => {
                warn!("rolling back returned connection");
                if let Err(err) = conn.conn.rollback().await {
                    warn!("rollback failed: {err}; discarding connection");
                    conn.conn.close().await;
                    return None;
                }
            }
            TransactionStatus::Active => {
                warn!("closing connection returned while a query was running");
                conn.conn.close().await;
                return None;
            }
            TransactionStatus::Unknown => return None,
        }

        if let Some(reset) = &self.inner.reset {
            let mut outcome = reset(&conn.conn);
            if outcome.is_ok() && conn.conn.transaction_status().await != TransactionStatus::Idle {
                outcome = Err(ProgrammingError::new(
                    "connection left in transaction by the reset callback: discarded",
                )
                .into());
            }
            if let Err(err) = outcome {
                warn!("error resetting connection: {err}");
                conn.conn.close().await;
                return None;
            }
        }
        Some(conn)
    }

    fn add_to_pool(&self, conn: PooledConn) {
        let mut conn = Some(conn);
        let mut state = self.lock();

        while let Some(waiter) = state.waiting.pop_front() {
            match waiter.set(conn.take().expect("present until accepted")) {
                Ok(()) => return,
                Err(back) => conn = Some(back),
            }
        }

        let conn = conn.expect("no waiter accepted it");
        state.idle.push_back(conn);

        if let Some(target) = state.fill_target {
            if state.idle.len() >= target {
                state.fill_target = None;
                self.inner.full_event.notify_waiters();
            }
        }
    }

    async fn shrink_pool(&self) {
        let to_close = {
            let mut state = self.lock();
            let nconns_min = state.nconns_min;
            state.nconns_min = state.idle.len();

            if state.nconns > state.min_size && nconns_min > 0 {
                let conn = state.idle.pop_front();
                if conn.is_some() {
                    state.nconns -= 1;
                    state.nconns_min = state.nconns_min.saturating_sub(1);
                    info!(nconns = state.nconns, "shrinking pool");
                }
                conn
            } else {
                None
            }
        };
        if let Some(conn) = to_close {
            conn.conn.close().await;
        }
    }
}

async fn worker(inner: Weak<AsyncPoolInner>, tasks_rx: TaskReceiver) {
    // spread worker wakeups so they do not time out in lockstep
    let timeout = jitter(WORKER_TIMEOUT, -0.1, 0.1);
    loop {
        // workers share one receiver; holding the async lock while awaiting
        // a task is what makes them take turns
        let task = {
            let mut rx = tasks_rx.lock().await;
            match tokio::time::timeout(timeout, rx.recv()).await {
                Ok(task) => task,
                Err(_) => {
                    if inner.strong_count() == 0 {
                        return;
                    }
                    continue;
                }
            }
        };
        let task = match task {
            Some(task) => task,
            None => return,
        };
        match task {
            MaintenanceTask::StopWorker => {
                debug!("terminating worker task");
                return;
            }
            task => {
                let pool = match inner.upgrade() {
                    Some(inner) => AsyncPool { inner },
                    None => return,
                };
                if pool.lock().closed {
                    // still close connections coming back to a closed pool
                    if let MaintenanceTask::ReturnConnection { conn } = task {
                        conn.conn.close().await;
                    } else {
                        debug!("maintenance task discarded: pool closed");
                    }
                    continue;
                }
                pool.run_maintenance(task).await;
            }
        }
    }
}

impl Drop for AsyncPoolInner {
    fn drop(&mut self) {
        self.sched.enter(Duration::ZERO, None);
    }
}

/// a connection checked out of an [`AsyncPool`]. dereferences to
/// [`AsyncConnection`]; dropping it schedules the return.
pub struct AsyncPoolConnection {
    pool: AsyncPool,
    conn: Option<PooledConn>,
    taken_at: Instant,
}

impl Deref for AsyncPoolConnection {
    type Target = AsyncConnection;

    fn deref(&self) -> &AsyncConnection {
        &self.conn.as_ref().expect("present until dropped").conn
    }
}

impl Drop for AsyncPoolConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let pool = &self.pool;
            pool.inner
                .stats
                .add(&pool.inner.stats.usage_ms, self.taken_at.elapsed().as_millis() as u64);
            // drop cannot await; the reset and handoff run on a worker
            pool.run_task(MaintenanceTask::ReturnConnection { conn });
        }
    }
}
