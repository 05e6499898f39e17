//! the blocking connection.

use core::time::Duration;

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    process,
    sync::{Arc, Mutex, MutexGuard, RwLock},
};

use chrono::FixedOffset;
use tracing::{error, warn};

use crate::{
    adapt::{AdaptContext, AdaptersMap},
    conninfo::ConnInfo,
    cursor::{Cursor, ServerCursor},
    errors::{Diagnostic, Error, ProgrammingError},
    machine::{Connect, Execute, Notifies},
    pq::{ConnStatus, ExecStatus, Notify, PgCancel, PgConn, TransactionStatus},
    prepare::PrepareManager,
    queries::Params,
    transaction::Transaction,
    transform::Transformer,
    waiting,
};

pub type NoticeHandler = Arc<dyn Fn(&Diagnostic) + Send + Sync>;
pub type NotifyHandler = Arc<dyn Fn(&Notify) + Send + Sync>;

/// token returned by the handler registration apis, used to remove a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

pub(crate) struct Handlers<T> {
    next_id: u64,
    entries: Vec<(HandlerId, T)>,
}

impl<T: Clone> Handlers<T> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }

    pub(crate) fn add(&mut self, handler: T) -> HandlerId {
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, handler));
        id
    }

    pub(crate) fn remove(&mut self, id: HandlerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(hid, _)| *hid != id);
        self.entries.len() != before
    }

    pub(crate) fn snapshot(&self) -> Vec<T> {
        self.entries.iter().map(|(_, h)| h.clone()).collect()
    }
}

pub(crate) struct ConnState {
    pub(crate) pgconn: Option<PgConn>,
    pub(crate) prepare: PrepareManager,
    /// names of the active savepoint stack. empty iff no transaction scope is
    /// active; the outermost scope pushes the empty sentinel name.
    pub(crate) savepoints: Vec<String>,
    pub(crate) scope_counter: u64,
    pub(crate) autocommit: bool,
    pub(crate) closed: bool,
}

impl ConnState {
    pub(crate) fn pgconn(&mut self) -> Result<&mut PgConn, Error> {
        if self.closed {
            return Err(Error::closed());
        }
        self.pgconn.as_mut().ok_or_else(Error::closed)
    }
}

/// a blocking connection to the database.
///
/// thread safe: every operation takes an internal lock for its whole
/// duration, so a connection is used by one thread at a time and statement
/// results arrive in send order.
pub struct Connection {
    pub(crate) state: Mutex<ConnState>,
    pub(crate) adapters: RwLock<AdaptersMap>,
    notice_handlers: Arc<Mutex<Handlers<NoticeHandler>>>,
    notify_handlers: Mutex<Handlers<NotifyHandler>>,
    /// pid of the process that created the connection; a forked child must
    /// not send terminate on the shared socket.
    pid: u32,
    /// liveness interval handed to the blocking waiter.
    pub(crate) wait_interval: Option<Duration>,
}

/// options for [`Connection::connect_opts`].
#[derive(Default, Clone)]
pub struct ConnectOptions {
    pub autocommit: bool,
    /// keyword overrides merged into the conninfo string.
    pub overrides: Vec<(String, String)>,
}

impl Connection {
    /// open a connection. the string may be a `key=value` conninfo or a
    /// `postgres://` url.
    pub fn connect(conninfo: &str) -> Result<Self, Error> {
        Self::connect_opts(conninfo, ConnectOptions::default())
    }

    pub fn connect_opts(conninfo: &str, opts: ConnectOptions) -> Result<Self, Error> {
        let info = ConnInfo::make(
            conninfo,
            opts.overrides
                .iter()
                .map(|(k, v)| (k.as_str(), Some(v.clone()))),
        )?;
        let timeout = info.connect_timeout();

        let mut machine = Connect::new(PgConn::connect_start(info)?);
        let pgconn = waiting::wait_conn(&mut machine, timeout)?;

        Ok(Self::from_pgconn(pgconn, opts.autocommit))
    }

    pub(crate) fn from_pgconn(mut pgconn: PgConn, autocommit: bool) -> Self {
        let notice_handlers = Arc::new(Mutex::new(Handlers::new()));

        let handlers = notice_handlers.clone();
        pgconn.set_notice_callback(Box::new(move |diag: Diagnostic| {
            let snapshot = match handlers.lock() {
                Ok(handlers) => handlers.snapshot(),
                Err(_) => return,
            };
            dispatch_notice(&snapshot, &diag);
        }));

        Self {
            state: Mutex::new(ConnState {
                pgconn: Some(pgconn),
                prepare: PrepareManager::new(),
                savepoints: Vec::new(),
                scope_counter: 0,
                autocommit,
                closed: false,
            }),
            adapters: RwLock::new(AdaptersMap::layer(
                &crate::adapt::global_adapters().read().unwrap_or_else(|e| e.into_inner()),
            )),
            notice_handlers,
            notify_handlers: Mutex::new(Handlers::new()),
            pid: process::id(),
            wait_interval: None,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// a client side cursor.
    pub fn cursor(&self) -> Cursor<'_> {
        Cursor::new(self)
    }

    /// a server side cursor declared under the given name.
    pub fn server_cursor(&self, name: &str) -> ServerCursor<'_> {
        ServerCursor::new(self, name)
    }

    /// shortcut: create a cursor, execute, return it for fetching.
    pub fn execute<'c>(&'c self, query: &str, params: Params<'_>) -> Result<Cursor<'c>, Error> {
        let mut cur = self.cursor();
        cur.execute(query, params)?;
        Ok(cur)
    }

    /// commit the current transaction. forbidden inside a transaction scope.
    pub fn commit(&self) -> Result<(), Error> {
        let mut state = self.lock();
        self.end_transaction(&mut state, "COMMIT")
    }

    /// roll back the current transaction. forbidden inside a transaction
    /// scope.
    pub fn rollback(&self) -> Result<(), Error> {
        let mut state = self.lock();
        self.end_transaction(&mut state, "ROLLBACK")
    }

    fn end_transaction(&self, state: &mut ConnState, command: &str) -> Result<(), Error> {
        if !state.savepoints.is_empty() {
            return Err(ProgrammingError::new(format!(
                "explicit {} forbidden inside a transaction block started by transaction()",
                command.to_ascii_lowercase()
            ))
            .into());
        }
        if state.pgconn()?.transaction_status() != TransactionStatus::Idle {
            self.exec_command(state, command)?;
        }
        Ok(())
    }

    /// enter a transaction scope, optionally naming its savepoint.
    pub fn transaction(&self) -> Result<Transaction<'_>, Error> {
        Transaction::enter(self, None, false)
    }

    pub fn transaction_opts(
        &self,
        savepoint_name: Option<&str>,
        force_rollback: bool,
    ) -> Result<Transaction<'_>, Error> {
        Transaction::enter(self, savepoint_name, force_rollback)
    }

    /// block until at least one asynchronous notification arrives and return
    /// the batch. loop over this for a lazy notification sequence.
    pub fn notifies(&self) -> Result<Vec<Notify>, Error> {
        let mut state = self.lock();
        let interval = self.wait_interval;
        let pgconn = state.pgconn()?;
        let mut machine = Notifies::default();
        let batch = waiting::wait(&mut machine, pgconn, interval)?;
        Ok(batch)
    }

    /// request cancellation of the query currently running on this
    /// connection. safe to call from any thread.
    pub fn cancel(&self) -> Result<(), Error> {
        self.cancel_token()?.cancel()
    }

    /// the reusable out of band cancel token.
    pub fn cancel_token(&self) -> Result<PgCancel, Error> {
        let mut state = self.lock();
        Ok(state.pgconn()?.get_cancel())
    }

    pub fn client_encoding(&self) -> Option<String> {
        let mut state = self.lock();
        let pgconn = state.pgconn().ok()?;
        pgconn.parameter_status("client_encoding").map(str::to_string)
    }

    pub fn set_client_encoding(&self, encoding: &str) -> Result<(), Error> {
        let mut state = self.lock();
        let command = format!(
            "select set_config('client_encoding', {}, false)",
            crate::sql::quote_literal(encoding)
        );
        self.exec_command(&mut state, &command)
    }

    pub fn autocommit(&self) -> bool {
        self.lock().autocommit
    }

    /// flip autocommit. forbidden inside a transaction scope or while a
    /// transaction is open on the server.
    pub fn set_autocommit(&self, autocommit: bool) -> Result<(), Error> {
        let mut state = self.lock();
        if !state.savepoints.is_empty() {
            return Err(
                ProgrammingError::new("autocommit cannot change inside a transaction block").into(),
            );
        }
        if state.pgconn()?.transaction_status() != TransactionStatus::Idle {
            return Err(ProgrammingError::new(
                "autocommit cannot change while a transaction is in progress; commit or rollback first",
            )
            .into());
        }
        state.autocommit = autocommit;
        Ok(())
    }

    pub fn add_notice_handler(&self, handler: NoticeHandler) -> HandlerId {
        self.notice_handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .add(handler)
    }

    pub fn remove_notice_handler(&self, id: HandlerId) -> bool {
        self.notice_handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }

    pub fn add_notify_handler(&self, handler: NotifyHandler) -> HandlerId {
        self.notify_handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .add(handler)
    }

    pub fn remove_notify_handler(&self, id: HandlerId) -> bool {
        self.notify_handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }

    pub fn prepare_threshold(&self) -> Option<u32> {
        self.lock().prepare.prepare_threshold
    }

    pub fn set_prepare_threshold(&self, threshold: Option<u32>) {
        self.lock().prepare.prepare_threshold = threshold;
    }

    pub fn prepared_max(&self) -> usize {
        self.lock().prepare.prepared_max()
    }

    pub fn set_prepared_max(&self, max: usize) {
        self.lock().prepare.set_prepared_max(max);
    }

    /// server reported transaction status.
    pub fn transaction_status(&self) -> TransactionStatus {
        let mut state = self.lock();
        match state.pgconn() {
            Ok(pgconn) => pgconn.transaction_status(),
            Err(_) => TransactionStatus::Unknown,
        }
    }

    pub fn backend_pid(&self) -> Option<i32> {
        let mut state = self.lock();
        state.pgconn().ok().map(|c| c.backend_pid())
    }

    pub fn server_version(&self) -> Option<String> {
        let mut state = self.lock();
        state
            .pgconn()
            .ok()
            .and_then(|c| c.server_version().map(str::to_string))
    }

    pub fn closed(&self) -> bool {
        let state = self.lock();
        state.closed
            || state
                .pgconn
                .as_ref()
                .map(|c| c.status() != ConnStatus::Ok)
                .unwrap_or(true)
    }

    /// close the connection. idempotent.
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        if let Some(pgconn) = state.pgconn.as_mut() {
            pgconn.finish();
        }
    }

    /// register a dumper or loader on this connection only: the map was
    /// layered from the global registry and promotes to a private copy here.
    pub fn adapters(&self) -> &RwLock<AdaptersMap> {
        &self.adapters
    }

    /// the adaptation context transformers for this connection are built
    /// against.
    pub(crate) fn adapt_context(&self, state: &mut ConnState) -> AdaptContext {
        let adapters = Arc::new(AdaptersMap::layer(
            &self.adapters.read().unwrap_or_else(|e| e.into_inner()),
        ));
        let (encoding, timezone) = match state.pgconn.as_ref() {
            Some(pgconn) => (
                pgconn
                    .parameter_status("client_encoding")
                    .map(|s| Arc::from(s.to_string().into_boxed_str())),
                pgconn
                    .parameter_status("TimeZone")
                    .and_then(parse_fixed_offset),
            ),
            None => (None, None),
        };
        AdaptContext {
            adapters,
            encoding,
            timezone,
        }
    }

    /// run an internal command (BEGIN, COMMIT, SAVEPOINT, DEALLOCATE, ...)
    /// outside the placeholder machinery.
    pub(crate) fn exec_command(&self, state: &mut ConnState, command: &str) -> Result<(), Error> {
        let interval = self.wait_interval;
        let pgconn = state.pgconn()?;
        pgconn.send_query(command)?;
        let mut machine = Execute::default();
        let results = waiting::wait(&mut machine, pgconn, interval)?;
        self.drain_notifies(state);
        // a command may be several statements; execution stops at the first
        // failure, so the last result carries the batch outcome
        let result = results
            .into_iter()
            .last()
            .ok_or_else(|| crate::errors::InternalError::new("no result after an internal command"))?;
        match result.status() {
            ExecStatus::CommandOk | ExecStatus::TuplesOk | ExecStatus::EmptyQuery => Ok(()),
            ExecStatus::FatalError => Err(result.into_error()),
            status => Err(crate::errors::InternalError::new(format!(
                "unexpected result status {status:?} from an internal command"
            ))
            .into()),
        }
    }

    /// open the implicit transaction when autocommit is off.
    pub(crate) fn start_query(&self, state: &mut ConnState) -> Result<(), Error> {
        if state.autocommit {
            return Ok(());
        }
        if state.pgconn()?.transaction_status() == TransactionStatus::Idle {
            self.exec_command(state, "BEGIN")?;
        }
        Ok(())
    }

    /// hand queued notifications to the registered handlers. handler panics
    /// are logged and do not break the remaining handlers.
    pub(crate) fn drain_notifies(&self, state: &mut ConnState) {
        let pgconn = match state.pgconn.as_mut() {
            Some(pgconn) => pgconn,
            None => return,
        };
        let mut batch = Vec::new();
        while let Some(n) = pgconn.notifies() {
            batch.push(n);
        }
        if batch.is_empty() {
            return;
        }
        let handlers = self
            .notify_handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .snapshot();
        for notify in &batch {
            for handler in &handlers {
                if catch_unwind(AssertUnwindSafe(|| handler(notify))).is_err() {
                    error!("notify handler panicked on {:?}", notify.channel);
                }
            }
        }
    }

    pub(crate) fn make_transformer(&self, state: &mut ConnState) -> Transformer {
        Transformer::new(self.adapt_context(state))
    }
}

fn dispatch_notice(handlers: &[NoticeHandler], diag: &Diagnostic) {
    for handler in handlers {
        if catch_unwind(AssertUnwindSafe(|| handler(diag))).is_err() {
            error!("notice handler panicked on {:?}", diag.message_primary());
        }
    }
}

// session TimeZone values like "<+05>-05" or "UTC" reduce to a fixed offset;
// named zones do not and loaders fall back to utc.
fn parse_fixed_offset(tz: &str) -> Option<FixedOffset> {
    if tz == "UTC" || tz == "GMT" {
        return FixedOffset::east_opt(0);
    }
    None
}

impl Drop for Connection {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());

        // a forked child shares the socket with its parent; sending terminate
        // from the child would kill the parent's session.
        if process::id() != self.pid {
            if let Some(pgconn) = state.pgconn.take() {
                std::mem::forget(pgconn);
            }
            return;
        }

        if !state.closed {
            if let Some(pgconn) = state.pgconn.as_ref() {
                if pgconn.status() == ConnStatus::Ok {
                    warn!("connection was deleted while still open; use close() or a pool");
                }
            }
        }
    }
}

/// shortcut module level connect, mirroring the crate examples.
pub fn connect(conninfo: &str) -> Result<Connection, Error> {
    Connection::connect(conninfo)
}
