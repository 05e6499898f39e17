//! the cooperative connection, driven by the tokio runtime.
//!
//! identical in behaviour to [`Connection`] but awaiting the async waiter and
//! holding an async mutex, so a connection is used by one task at a time.
//!
//! [`Connection`]: crate::connection::Connection

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    process,
    sync::{Arc, Mutex as StdMutex, RwLock},
};

use tokio::sync::{Mutex, MutexGuard};
use tracing::error;

use crate::{
    adapt::AdaptersMap,
    connection::{ConnState, ConnectOptions, HandlerId, Handlers, NoticeHandler, NotifyHandler},
    conninfo::ConnInfo,
    cursor_async::AsyncCursor,
    errors::{Diagnostic, Error, ProgrammingError},
    machine::{Connect, Execute, Notifies},
    pq::{ConnStatus, ExecStatus, Notify, PgCancel, PgConn, TransactionStatus},
    prepare::PrepareManager,
    queries::Params,
    transaction_async::AsyncTransaction,
    transform::Transformer,
    waiting,
};

/// a connection accessed from async tasks.
pub struct AsyncConnection {
    pub(crate) state: Mutex<ConnState>,
    pub(crate) adapters: RwLock<AdaptersMap>,
    notice_handlers: Arc<StdMutex<Handlers<NoticeHandler>>>,
    notify_handlers: StdMutex<Handlers<NotifyHandler>>,
    pid: u32,
}

impl AsyncConnection {
    pub async fn connect(conninfo: &str) -> Result<Self, Error> {
        Self::connect_opts(conninfo, ConnectOptions::default()).await
    }

    pub async fn connect_opts(conninfo: &str, opts: ConnectOptions) -> Result<Self, Error> {
        let info = ConnInfo::make(
            conninfo,
            opts.overrides
                .iter()
                .map(|(k, v)| (k.as_str(), Some(v.clone()))),
        )?;
        let timeout = info.connect_timeout();

        let mut machine = Connect::new(PgConn::connect_start(info)?);
        let pgconn = waiting::wait_conn_async(&mut machine, timeout).await?;

        Ok(Self::from_pgconn(pgconn, opts.autocommit))
    }

    pub(crate) fn from_pgconn(mut pgconn: PgConn, autocommit: bool) -> Self {
        let notice_handlers: Arc<StdMutex<Handlers<NoticeHandler>>> =
            Arc::new(StdMutex::new(Handlers::new()));

        let handlers = notice_handlers.clone();
        pgconn.set_notice_callback(Box::new(move |diag: Diagnostic| {
            let snapshot = match handlers.lock() {
                Ok(handlers) => handlers.snapshot(),
                Err(_) => return,
            };
            for handler in &snapshot {
                if catch_unwind(AssertUnwindSafe(|| handler(&diag))).is_err() {
                    error!("notice handler panicked on {:?}", diag.message_primary());
                }
            }
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
            notify_handlers: StdMutex::new(Handlers::new()),
            pid: process::id(),
        }
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().await
    }

    pub fn cursor(&self) -> AsyncCursor<'_> {
        AsyncCursor::new(self)
    }

    /// a server side cursor declared under the given name.
    pub fn server_cursor(&self, name: &str) -> crate::cursor_async::AsyncServerCursor<'_> {
        crate::cursor_async::AsyncServerCursor::new(self, name)
    }

    /// shortcut: create a cursor, execute, return it for fetching.
    pub async fn execute<'c>(&'c self, query: &str, params: Params<'_>) -> Result<AsyncCursor<'c>, Error> {
        let mut cur = self.cursor();
        cur.execute(query, params).await?;
        Ok(cur)
    }

    pub async fn commit(&self) -> Result<(), Error> {
        let mut state = self.lock().await;
        self.end_transaction(&mut state, "COMMIT").await
    }

    pub async fn rollback(&self) -> Result<(), Error> {
        let mut state = self.lock().await;
        self.end_transaction(&mut state, "ROLLBACK").await
    }

    async fn end_transaction(&self, state: &mut ConnState, command: &str) -> Result<(), Error> {
        if !state.savepoints.is_empty() {
            return Err(ProgrammingError::new(format!(
                "explicit {} forbidden inside a transaction block started by transaction()",
                command.to_ascii_lowercase()
            ))
            .into());
        }
        if state.pgconn()?.transaction_status() != TransactionStatus::Idle {
            self.exec_command(state, command).await?;
        }
        Ok(())
    }

    pub async fn transaction(&self) -> Result<AsyncTransaction<'_>, Error> {
        AsyncTransaction::enter(self, None, false).await
    }

    pub async fn transaction_opts(
        &self,
        savepoint_name: Option<&str>,
        force_rollback: bool,
    ) -> Result<AsyncTransaction<'_>, Error> {
        AsyncTransaction::enter(self, savepoint_name, force_rollback).await
    }

    /// park until at least one asynchronous notification arrives.
    pub async fn notifies(&self) -> Result<Vec<Notify>, Error> {
        let mut state = self.lock().await;
        let pgconn = state.pgconn()?;
        let mut machine = Notifies::default();
        waiting::wait_async(&mut machine, pgconn).await
    }

    /// request cancellation of the in flight query. the token does blocking
    /// io; hand it to a blocking-capable task.
    pub async fn cancel(&self) -> Result<(), Error> {
        let token = self.cancel_token().await?;
        tokio::task::spawn_blocking(move || token.cancel())
            .await
            .map_err(|e| crate::errors::InternalError::new(e.to_string()))?
    }

    pub async fn cancel_token(&self) -> Result<PgCancel, Error> {
        let mut state = self.lock().await;
        Ok(state.pgconn()?.get_cancel())
    }

    pub async fn client_encoding(&self) -> Option<String> {
        let mut state = self.lock().await;
        let pgconn = state.pgconn().ok()?;
        pgconn.parameter_status("client_encoding").map(str::to_string)
    }

    pub async fn set_client_encoding(&self, encoding: &str) -> Result<(), Error> {
        let mut state = self.lock().await;
        let command = format!(
            "select set_config('client_encoding', {}, false)",
            crate::sql::quote_literal(encoding)
        );
        self.exec_command(&mut state, &command).await
    }

    pub async fn autocommit(&self) -> bool {
        self.lock().await.autocommit
    }

    pub async fn set_autocommit(&self, autocommit: bool) -> Result<(), Error> {
        let mut state = self.lock().await;
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

    pub async fn prepare_threshold(&self) -> Option<u32> {
        self.lock().await.prepare.prepare_threshold
    }

    pub async fn set_prepare_threshold(&self, threshold: Option<u32>) {
        self.lock().await.prepare.prepare_threshold = threshold;
    }

    pub async fn prepared_max(&self) -> usize {
        self.lock().await.prepare.prepared_max()
    }

    pub async fn set_prepared_max(&self, max: usize) {
        self.lock().await.prepare.set_prepared_max(max);
    }

    pub async fn transaction_status(&self) -> TransactionStatus {
        let mut state = self.lock().await;
        match state.pgconn() {
            Ok(pgconn) => pgconn.transaction_status(),
            Err(_) => TransactionStatus::Unknown,
        }
    }

    pub async fn backend_pid(&self) -> Option<i32> {
        let mut state = self.lock().await;
        state.pgconn().ok().map(|c| c.backend_pid())
    }

    /// lossy view of the connection state, usable without awaiting the lock.
    pub fn closed(&self) -> bool {
        match self.state.try_lock() {
            Ok(state) => {
                state.closed
                    || state
                        .pgconn
                        .as_ref()
                        .map(|c| c.status() != ConnStatus::Ok)
                        .unwrap_or(true)
            }
            Err(_) => false,
        }
    }

    pub async fn close(&self) {
        let mut state = self.lock().await;
        state.closed = true;
        if let Some(pgconn) = state.pgconn.as_mut() {
            pgconn.finish();
        }
    }

    pub fn adapters(&self) -> &RwLock<AdaptersMap> {
        &self.adapters
    }

    pub(crate) fn adapt_context(&self, state: &mut ConnState) -> crate::adapt::AdaptContext {
        let adapters = Arc::new(AdaptersMap::layer(
            &self.adapters.read().unwrap_or_else(|e| e.into_inner()),
        ));
        let encoding = state.pgconn.as_ref().and_then(|pgconn| {
            pgconn
                .parameter_status("client_encoding")
                .map(|s| Arc::from(s.to_string().into_boxed_str()))
        });
        crate::adapt::AdaptContext {
            adapters,
            encoding,
            timezone: None,
        }
    }

    pub(crate) fn make_transformer(&self, state: &mut ConnState) -> Transformer {
        Transformer::new(self.adapt_context(state))
    }

    pub(crate) async fn exec_command(&self, state: &mut ConnState, command: &str) -> Result<(), Error> {
        let pgconn = state.pgconn()?;
        pgconn.send_query(command)?;
        let mut machine = Execute::default();
        let results = waiting::wait_async(&mut machine, pgconn).await?;
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

    pub(crate) async fn start_query(&self, state: &mut ConnState) -> Result<(), Error> {
        if state.autocommit {
            return Ok(());
        }
        if state.pgconn()?.transaction_status() == TransactionStatus::Idle {
            self.exec_command(state, "BEGIN").await?;
        }
        Ok(())
    }

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
}

impl Drop for AsyncConnection {
    fn drop(&mut self) {
        let state = self.state.get_mut();

        if process::id() != self.pid {
            if let Some(pgconn) = state.pgconn.take() {
                std::mem::forget(pgconn);
            }
            return;
        }

        if !state.closed {
            if let Some(pgconn) = state.pgconn.as_ref() {
                if pgconn.status() == ConnStatus::Ok {
                    tracing::warn!("connection was deleted while still open; use close() or a pool");
                }
            }
        }
    }
}

fn _assert_send<T: Send>() {}

#[allow(dead_code)]
fn _assert_connection_send() {
    _assert_send::<AsyncConnection>();
}
