//! the thread based connection pool.

use core::time::Duration;

use std::{
    collections::VecDeque,
    ops::{Deref, DerefMut},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Condvar, Mutex, Weak},
    thread,
    time::Instant,
};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::{
    connection::{ConnectOptions, Connection},
    errors::{Error, OperationalError, PoolClosed, PoolTimeout, ProgrammingError, TooManyRequests},
    pq::TransactionStatus,
};

use super::{jitter, sched::Scheduler, Attempt, PoolConfig, PoolStats};

const WORKER_TIMEOUT: Duration = Duration::from_secs(60);

pub type ConfigureHook = Arc<dyn Fn(&Connection) -> Result<(), Error> + Send + Sync>;
pub type ResetHook = Arc<dyn Fn(&Connection) -> Result<(), Error> + Send + Sync>;
pub type ReconnectFailedHook = Arc<dyn Fn(&Pool) + Send + Sync>;

/// builder for [`Pool`].
pub struct PoolBuilder {
    config: PoolConfig,
    connect_opts: ConnectOptions,
    configure: Option<ConfigureHook>,
    reset: Option<ResetHook>,
    reconnect_failed: Option<ReconnectFailedHook>,
    open: bool,
}

impl PoolBuilder {
    /// target resident size of the pool.
    pub fn min_size(mut self, min_size: usize) -> Self {
        self.config.min_size = min_size;
        if self.config.max_size < min_size {
            self.config.max_size = min_size;
        }
        self
    }

    /// burst ceiling; defaults to `min_size`.
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.config.max_size = max_size;
        self
    }

    /// default client wait before [`PoolTimeout`].
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// cap on concurrent waiting clients; exceeding it raises
    /// [`TooManyRequests`].
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

    /// options applied to every connection the pool dials.
    pub fn connect_options(mut self, opts: ConnectOptions) -> Self {
        self.connect_opts = opts;
        self
    }

    /// per connection setup callback, run once after dialing. it must leave
    /// the connection idle.
    pub fn configure(mut self, hook: ConfigureHook) -> Self {
        self.configure = Some(hook);
        self
    }

    /// per return cleanup callback. it must leave the connection idle.
    pub fn reset(mut self, hook: ResetHook) -> Self {
        self.reset = Some(hook);
        self
    }

    /// called when reconnection kept failing for `reconnect_timeout`.
    pub fn reconnect_failed(mut self, hook: ReconnectFailedHook) -> Self {
        self.reconnect_failed = Some(hook);
        self
    }

    /// do not open the pool on build; call [`Pool::open`] later.
    pub fn closed(mut self) -> Self {
        self.open = false;
        self
    }

    pub fn build(self) -> Result<Pool, Error> {
        self.config.check()?;
        let (tasks_tx, tasks_rx) = unbounded();
        let pool = Pool {
            inner: Arc::new(PoolInner {
                config: self.config,
                connect_opts: self.connect_opts,
                configure: self.configure,
                reset: self.reset,
                reconnect_failed: self.reconnect_failed,
                state: Mutex::new(PoolState::new()),
                tasks_tx,
                tasks_rx,
                sched: Arc::new(Scheduler::new()),
                stats: PoolStats::default(),
                full_event: Condvar::new(),
            }),
        };
        if self.open {
            pool.open(false, Duration::from_secs(30))?;
        }
        Ok(pool)
    }
}

/// an idle connection and when it came back.
struct IdleConn {
    conn: PooledConn,
    _returned_at: Instant,
}

pub(crate) struct PooledConn {
    pub(crate) conn: Connection,
    pub(crate) expire_at: Instant,
}

enum WaitState {
    Waiting,
    Ready(PooledConn),
    Failed(Error),
    Abandoned,
}

/// a position in the queue for a client waiting for a connection.
///
/// behaves like an event, with one extra handshake: the flagger learns
/// whether the waiter accepted the connection or had already timed out, so a
/// connection is never handed to a client that stopped listening.
struct WaitingClient {
    state: Mutex<WaitState>,
    cond: Condvar,
}

impl WaitingClient {
    fn new() -> Self {
        Self {
            state: Mutex::new(WaitState::Waiting),
            cond: Condvar::new(),
        }
    }

    fn wait(&self, timeout: Duration) -> Result<PooledConn, Error> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let deadline = Instant::now() + timeout;
        loop {
            match std::mem::replace(&mut *state, WaitState::Abandoned) {
                WaitState::Ready(conn) => return Ok(conn),
                WaitState::Failed(err) => return Err(err),
                WaitState::Waiting => *state = WaitState::Waiting,
                WaitState::Abandoned => unreachable!("a waiting client waits once"),
            }
            let now = Instant::now();
            if now >= deadline {
                *state = WaitState::Abandoned;
                return Err(PoolTimeout { elapsed: timeout }.into());
            }
            let (guard, _) = self
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }
    }

    /// offer a connection. gives it back when the client timed out already.
    fn set(&self, conn: PooledConn) -> Result<(), PooledConn> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match &*state {
            WaitState::Waiting => {
                *state = WaitState::Ready(conn);
                self.cond.notify_all();
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
                self.cond.notify_all();
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

struct PoolState {
    idle: VecDeque<IdleConn>,
    waiting: VecDeque<Arc<WaitingClient>>,
    /// connections created, being created, or checked out.
    nconns: usize,
    /// rolling minimum of the idle deque over a max_idle window.
    nconns_min: usize,
    growing: bool,
    opened: bool,
    closed: bool,
    /// set while open(wait=true) needs to learn about initial fill.
    fill_target: Option<usize>,
    min_size: usize,
    max_size: usize,
    workers: Vec<thread::JoinHandle<()>>,
    sched_runner: Option<thread::JoinHandle<()>>,
}

impl PoolState {
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

struct PoolInner {
    config: PoolConfig,
    connect_opts: ConnectOptions,
    configure: Option<ConfigureHook>,
    reset: Option<ResetHook>,
    reconnect_failed: Option<ReconnectFailedHook>,
    state: Mutex<PoolState>,
    tasks_tx: Sender<MaintenanceTask>,
    tasks_rx: Receiver<MaintenanceTask>,
    sched: Arc<Scheduler>,
    stats: PoolStats,
    full_event: Condvar,
}

/// a pool of blocking connections served to threads.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// start building a pool over a conninfo string or url.
    pub fn builder(conninfo: &str) -> PoolBuilder {
        PoolBuilder {
            config: PoolConfig::new(conninfo.to_string()),
            connect_opts: ConnectOptions::default(),
            configure: None,
            reset: None,
            reconnect_failed: None,
            open: true,
        }
    }

    /// open the pool: spawn the workers and start filling to `min_size`.
    /// opening an open pool is a no-op; a closed pool cannot reopen.
    pub fn open(&self, wait: bool, timeout: Duration) -> Result<(), Error> {
        {
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

            // scheduler thread plus the task workers. both sides hold weak
            // references so a dropped pool can actually wind down.
            let sched = self.inner.sched.clone();
            state.sched_runner = Some(
                thread::Builder::new()
                    .name("pool-scheduler".to_string())
                    .spawn(move || sched.run())
                    .map_err(Error::from)?,
            );
            for i in 0..self.inner.config.num_workers {
                let inner = Arc::downgrade(&self.inner);
                let rx = self.inner.tasks_rx.clone();
                state.workers.push(
                    thread::Builder::new()
                        .name(format!("pool-worker-{i}"))
                        .spawn(move || worker(inner, rx))
                        .map_err(Error::from)?,
                );
            }

            for _ in 0..self.inner.config.min_size {
                self.run_task(MaintenanceTask::AddConnection {
                    attempt: None,
                    growing: false,
                });
            }
            self.schedule_task(MaintenanceTask::ShrinkPool, self.inner.config.max_idle);
        }

        if wait {
            self.wait(timeout)?;
        }
        Ok(())
    }

    /// wait for the initial fill to reach `min_size`; close the pool and fail
    /// with [`PoolTimeout`] otherwise.
    pub fn wait(&self, timeout: Duration) -> Result<(), Error> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        if state.closed {
            return Err(PoolClosed.into());
        }
        loop {
            match state.fill_target {
                None => return Ok(()),
                Some(target) if state.idle.len() >= target => {
                    state.fill_target = None;
                    return Ok(());
                }
                Some(_) => {}
            }
            let now = Instant::now();
            if now >= deadline {
                drop(state);
                self.close(Duration::from_secs(5));
                return Err(PoolTimeout { elapsed: timeout }.into());
            }
            let (guard, _) = self
                .inner
                .full_event
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }
    }

    /// close the pool. waiting clients fail with [`PoolClosed`]; checked out
    /// connections are closed when they come back.
    pub fn close(&self, timeout: Duration) {
        let (waiting, idle, workers, sched_runner, nworkers) = {
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
                state.workers.len().max(self.inner.config.num_workers),
            )
        };

        // stop the scheduler and the workers
        self.inner.sched.enter(Duration::ZERO, None);
        for _ in 0..nworkers {
            self.run_task(MaintenanceTask::StopWorker);
        }

        for client in waiting {
            client.fail(PoolClosed.into());
        }
        for idle in idle {
            idle.conn.conn.close();
        }

        let deadline = Instant::now() + timeout;
        let mut handles: Vec<thread::JoinHandle<()>> = workers;
        if let Some(handle) = sched_runner {
            handles.push(handle);
        }
        while !handles.is_empty() && Instant::now() < deadline {
            handles.retain(|h| !h.is_finished());
            if handles.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        for h in &handles {
            warn!("couldn't stop pool thread {:?} in time", h.thread().name());
        }
    }

    pub fn closed(&self) -> bool {
        self.lock().closed
    }

    /// take a connection out of the pool, waiting up to `timeout` (the
    /// pool's default when `None`).
    pub fn getconn(&self, timeout: Option<Duration>) -> Result<PoolConnection, Error> {
        self.inner.stats.add(&self.inner.stats.requests_num, 1);
        let timeout = timeout.unwrap_or(self.inner.config.timeout);

        // critical section: either a connection is ready or the client queues
        let waiter = {
            let mut state = self.lock();
            if state.closed {
                self.inner.stats.add(&self.inner.stats.requests_errors, 1);
                return Err(PoolClosed.into());
            }
            if let Some(idle) = state.idle.pop_front() {
                if state.idle.len() < state.nconns_min {
                    state.nconns_min = state.idle.len();
                }
                return Ok(self.handout(idle.conn));
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

        // wait outside the critical section so only this client is blocked
        let t0 = Instant::now();
        let res = waiter.wait(timeout);
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

    /// take a connection with the default timeout. return it by dropping the
    /// guard.
    pub fn connection(&self) -> Result<PoolConnection, Error> {
        self.getconn(None)
    }

    fn handout(&self, conn: PooledConn) -> PoolConnection {
        debug!("connection given by the pool");
        PoolConnection {
            pool: self.clone(),
            conn: Some(conn),
            taken_at: Instant::now(),
        }
    }

    /// give a connection back. called by the guard; exposed for symmetry.
    pub(crate) fn putconn(&self, conn: PooledConn) {
        if self.lock().closed {
            conn.conn.close();
            return;
        }
        debug!("returning connection to the pool");
        if self.inner.reset.is_some() {
            // run the reset hook on a worker so the client is not delayed
            self.run_task(MaintenanceTask::ReturnConnection { conn });
        } else {
            self.return_connection(conn);
        }
    }

    /// grow or shrink the resident size at runtime.
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

    /// verify the idle connections, discarding the broken ones and topping
    /// the pool back up.
    pub fn check(&self) -> Result<(), Error> {
        let idle = {
            let mut state = self.lock();
            std::mem::take(&mut state.idle)
        };

        for IdleConn { conn, .. } in idle {
            let healthy = conn.conn.execute("SELECT 1", crate::queries::Params::None).is_ok()
                && match conn.conn.transaction_status() {
                    TransactionStatus::InTrans => conn.conn.rollback().is_ok(),
                    TransactionStatus::Idle => true,
                    _ => false,
                };
            if healthy {
                self.add_to_pool(conn);
            } else {
                warn!("discarding broken connection");
                self.inner.stats.add(&self.inner.stats.connections_lost, 1);
                conn.conn.close();
                self.run_task(MaintenanceTask::AddConnection {
                    attempt: None,
                    growing: false,
                });
            }
        }
        Ok(())
    }

    /// current stats: counters plus immediate gauges.
    pub fn get_stats(&self) -> std::collections::HashMap<&'static str, u64> {
        self.inner.stats.snapshot(&self.gauges())
    }

    /// current stats; counters reset to zero afterwards.
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

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
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
                // tick trampoline: hand the task to a worker so the scheduler
                // is never blocked by pool work
                if let (Some(task), Some(inner)) = (task.take(), inner.upgrade()) {
                    let pool = Pool { inner };
                    if !pool.lock().closed {
                        pool.run_task(task);
                    }
                }
            })),
        );
    }

    /// allow only one growth task at a time, or returning connections might
    /// be starved by a spike of clients.
    fn maybe_grow(&self, state: &mut PoolState) {
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

    fn run_maintenance(&self, task: MaintenanceTask) {
        match task {
            MaintenanceTask::AddConnection { attempt, growing } => self.add_connection(attempt, growing),
            MaintenanceTask::ReturnConnection { conn } => self.return_connection(conn),
            MaintenanceTask::ShrinkPool => {
                // reschedule first so an error cannot break the periodic run
                self.schedule_task(MaintenanceTask::ShrinkPool, self.inner.config.max_idle);
                self.shrink_pool();
            }
            MaintenanceTask::StopWorker => {}
        }
    }

    /// dial a connection configured for the pool.
    fn connect(&self, timeout: Option<Duration>) -> Result<PooledConn, Error> {
        self.inner.stats.add(&self.inner.stats.connections_num, 1);
        let mut opts = self.inner.connect_opts.clone();
        if let Some(timeout) = timeout {
            opts.overrides
                .push(("connect_timeout".to_string(), timeout.as_secs().max(1).to_string()));
        }
        let t0 = Instant::now();
        let conn = match Connection::connect_opts(&self.inner.config.conninfo, opts) {
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
            if conn.transaction_status() != TransactionStatus::Idle {
                conn.close();
                return Err(ProgrammingError::new(
                    "connection left in transaction by the configure callback: discarded",
                )
                .into());
            }
        }

        // spread expiry so a full pool does not reconnect all at once
        let expire_at = Instant::now() + jitter(self.inner.config.max_lifetime, -0.05, 0.0);
        Ok(PooledConn { conn, expire_at })
    }

    /// try to connect and add the connection to the pool; on failure retry
    /// with backoff until `reconnect_timeout`, then give the slot up.
    fn add_connection(&self, attempt: Option<Attempt>, growing: bool) {
        let now = Instant::now();
        let mut attempt = attempt.unwrap_or_else(|| Attempt::new(self.inner.config.reconnect_timeout));

        match self.connect(None) {
            Ok(conn) => {
                info!("adding new connection to the pool");
                self.add_to_pool(conn);
                if growing {
                    let grow_more = {
                        let mut state = self.lock();
                        // keep growing while under min_size, or while clients
                        // wait and the ceiling allows it
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
                            if let (Some((attempt, growing)), Some(inner)) = (payload.take(), inner.upgrade()) {
                                let pool = Pool { inner };
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

    /// return a connection after use: reset it, drop it if broken or past
    /// its lifetime, hand it to a waiter or park it.
    fn return_connection(&self, conn: PooledConn) {
        let conn = match self.reset_connection(conn) {
            Some(conn) => conn,
            None => {
                // connection no more in working state: replace it
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
            conn.conn.close();
            self.run_task(MaintenanceTask::AddConnection {
                attempt: None,
                growing: false,
            });
            return;
        }

        self.add_to_pool(conn);
    }

    /// bring a returned connection back to idle state, or close it.
    /// `None` means the caller must arrange a replacement.
    fn reset_connection(&self, conn: PooledConn) -> Option<PooledConn> {
        match conn.conn.transaction_status() {
            TransactionStatus::Idle => {}
            TransactionStatus::InTrans | TransactionStatus::InError => {
                warn!("rolling back returned connection");
                if let Err(err) = conn.conn.rollback() {
                    warn!("rollback failed: {err}; discarding connection");
                    conn.conn.close();
                    return None;
                }
            }
            TransactionStatus::Active => {
                // returned mid-operation; there is no safe recovery
                warn!("closing connection returned while a query was running");
                conn.conn.close();
                return None;
            }
            TransactionStatus::Unknown => return None,
        }

        if let Some(reset) = &self.inner.reset {
            let outcome = reset(&conn.conn).and_then(|()| {
                if conn.conn.transaction_status() != TransactionStatus::Idle {
                    Err(ProgrammingError::new(
                        "connection left in transaction by the reset callback: discarded",
                    )
                    .into())
                } else {
                    Ok(())
                }
            });
            if let Err(err) = outcome {
                warn!("error resetting connection: {err}");
                conn.conn.close();
                return None;
            }
        }
        Some(conn)
    }

    /// hand the connection to the first still-listening waiter, else park it
    /// in the idle deque.
    fn add_to_pool(&self, conn: PooledConn) {
        let mut conn = Some(conn);
        let mut state = self.lock();

        while let Some(waiter) = state.waiting.pop_front() {
            match waiter.set(conn.take().expect("present until accepted")) {
                Ok(()) => return,
                // the client timed out; try the next one
                Err(back) => conn = Some(back),
            }
        }

        let conn = conn.expect("no waiter accepted it");
        state.idle.push_back(IdleConn {
            conn,
            _returned_at: Instant::now(),
        });

        if let Some(target) = state.fill_target {
            if state.idle.len() >= target {
                state.fill_target = None;
                self.inner.full_event.notify_all();
            }
        }
    }

    /// if connections sat consistently idle over the last window, drop one.
    fn shrink_pool(&self) {
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
        if let Some(idle) = to_close {
            idle.conn.conn.close();
        }
    }
}

/// runner executing pending maintenance tasks on its own thread. blocks on
/// the queue, runs what it receives, stops on `StopWorker` or when the pool
/// is gone.
fn worker(inner: Weak<PoolInner>, rx: Receiver<MaintenanceTask>) {
    // spread worker wakeups so they do not time out in lockstep
    let timeout = jitter(WORKER_TIMEOUT, -0.1, 0.1);
    loop {
        let task = match rx.recv_timeout(timeout) {
            Ok(task) => task,
            Err(RecvTimeoutError::Timeout) => {
                if inner.strong_count() == 0 {
                    return;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => return,
        };
        match task {
            MaintenanceTask::StopWorker => {
                debug!("terminating worker thread");
                return;
            }
            task => {
                let pool = match inner.upgrade() {
                    Some(inner) => Pool { inner },
                    None => return,
                };
                if pool.lock().closed {
                    // still close connections coming back to a closed pool
                    if let MaintenanceTask::ReturnConnection { conn } = task {
                        conn.conn.close();
                    } else {
                        debug!("maintenance task discarded: pool closed");
                    }
                    continue;
                }
                if catch_unwind(AssertUnwindSafe(|| pool.run_maintenance(task))).is_err() {
                    warn!("maintenance task panicked");
                }
            }
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        // the worker threads exit on channel disconnect; the scheduler needs
        // an explicit stop
        self.sched.enter(Duration::ZERO, None);
    }
}

/// a connection checked out of a [`Pool`]. dereferences to [`Connection`];
/// dropping it returns the connection to the pool.
pub struct PoolConnection {
    pool: Pool,
    conn: Option<PooledConn>,
    taken_at: Instant,
}

impl Deref for PoolConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn.as_ref().expect("present until dropped").conn
    }
}

impl DerefMut for PoolConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.conn.as_mut().expect("present until dropped").conn
    }
}

impl Drop for PoolConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let pool = &self.pool;
            pool.inner
                .stats
                .add(&pool.inner.stats.usage_ms, self.taken_at.elapsed().as_millis() as u64);
            pool.putconn(conn);
        }
    }
}
