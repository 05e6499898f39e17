//! client side and server side cursors.

use bytes::Bytes;

use crate::{
    connection::{ConnState, Connection},
    copy::Copy,
    errors::{Error, InterfaceError, InternalError, NotSupportedError, ProgrammingError},
    machine::{Execute, Fetch, Send as SendMachine},
    pq::{ExecStatus, Format, PgResult},
    prepare::{PrepareState, QueryFingerprint},
    queries::{Params, ParsedQuery, PostgresQuery},
    rows::{Row, RowFactory},
    sql::Ident,
    transform::Transformer,
    waiting,
};

/// how the cursor moves in [`Cursor::scroll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollMode {
    Relative,
    Absolute,
}

/// a client side cursor: executes queries and fetches their rows.
pub struct Cursor<'c> {
    conn: &'c Connection,
    tx: Option<Transformer>,
    results: Vec<PgResult>,
    iresult: usize,
    pos: usize,
    rowcount: i64,
    format: Format,
    arraysize: usize,
    closed: bool,
    last_query: Option<String>,
    pgq: Option<PostgresQuery>,
    row_factory: Option<RowFactory>,
}

impl<'c> Cursor<'c> {
    pub(crate) fn new(conn: &'c Connection) -> Self {
        Self {
            conn,
            tx: None,
            results: Vec::new(),
            iresult: 0,
            pos: 0,
            rowcount: -1,
            format: Format::Text,
            arraysize: 1,
            closed: false,
            last_query: None,
            pgq: None,
            row_factory: None,
        }
    }

    /// request binary results for subsequent executions.
    pub fn set_format(&mut self, format: Format) {
        self.format = format;
    }

    pub fn set_row_factory(&mut self, factory: RowFactory) {
        self.row_factory = Some(factory);
    }

    /// default [`Cursor::fetchmany`] batch size.
    pub fn arraysize(&self) -> usize {
        self.arraysize
    }

    pub fn set_arraysize(&mut self, arraysize: usize) {
        self.arraysize = arraysize.max(1);
    }

    pub fn connection(&self) -> &Connection {
        self.conn
    }

    pub fn closed(&self) -> bool {
        self.closed
    }

    /// rows affected or returned by the last execution; -1 before any.
    pub fn rowcount(&self) -> i64 {
        self.rowcount
    }

    /// the last query template handed to execute.
    pub fn last_query(&self) -> Option<&str> {
        self.last_query.as_deref()
    }

    /// the last query sent, after placeholder translation.
    pub fn query(&self) -> Option<&[u8]> {
        self.pgq.as_ref().map(|q| &q.query[..])
    }

    /// the dumped parameters of the last query.
    pub fn params(&self) -> Option<&[Option<Bytes>]> {
        self.pgq.as_ref().map(|q| &q.params[..])
    }

    fn reset(&mut self) {
        self.results.clear();
        self.iresult = 0;
        self.pos = 0;
        self.rowcount = -1;
        self.pgq = None;
    }

    fn check_open(&self) -> Result<(), Error> {
        if self.closed {
            return Err(InterfaceError::new("the cursor is closed").into());
        }
        Ok(())
    }

    /// execute a query, with `%s` style placeholders when params are given.
    pub fn execute(&mut self, query: &str, params: Params<'_>) -> Result<(), Error> {
        self.execute_prepare(query, params, None)
    }

    /// like [`Cursor::execute`] but forcing the prepared statement decision.
    pub fn execute_prepare(
        &mut self,
        query: &str,
        params: Params<'_>,
        prepare: Option<bool>,
    ) -> Result<(), Error> {
        self.check_open()?;
        self.reset();

        let mut state = self.conn.lock();
        self.conn.start_query(&mut state)?;

        let mut tx = self.conn.make_transformer(&mut state);
        if let Some(factory) = &self.row_factory {
            tx.set_row_factory(factory.clone());
        }

        let parsed = ParsedQuery::parse(query.as_bytes())?;
        let pgq = PostgresQuery::from_parsed(&parsed, params, &mut tx)?;

        let results = self.run_query(&mut state, &pgq, prepare)?;
        self.finish_execution(&mut state, tx, results)?;

        self.last_query = Some(query.to_string());
        self.pgq = Some(pgq);
        Ok(())
    }

    /// execute the same statement for every parameter row. the statement is
    /// parsed once and forced onto the prepared path after the first row.
    pub fn executemany(&mut self, query: &str, param_rows: &[Params<'_>]) -> Result<(), Error> {
        self.check_open()?;
        self.reset();

        let mut state = self.conn.lock();
        self.conn.start_query(&mut state)?;

        let mut tx = self.conn.make_transformer(&mut state);
        let parsed = ParsedQuery::parse(query.as_bytes())?;

        let mut total: i64 = 0;
        let mut first = true;
        let mut pgq: Option<PostgresQuery> = None;

        for params in param_rows {
            let q = match pgq.as_mut() {
                None => {
                    let q = PostgresQuery::from_parsed(&parsed, params.reborrow(), &mut tx)?;
                    pgq = Some(q);
                    pgq.as_mut().expect("just set")
                }
                Some(q) => {
                    q.redump(&parsed, params, &mut tx)?;
                    q
                }
            };

            // amortise parsing across the batch
            let prepare = if first { None } else { Some(true) };
            first = false;

            let results = self.run_query(&mut state, q, prepare)?;
            for res in &results {
                match res.status() {
                    ExecStatus::FatalError => {}
                    _ => {
                        if let Some(n) = res.rows_affected() {
                            total += n as i64;
                        }
                    }
                }
            }
            classify_results(&results)?;
            self.conn.drain_notifies(&mut state);
        }

        // rowcount after executemany is the sum of the per-row command tuples
        self.rowcount = total;
        self.pgq = pgq;
        self.last_query = Some(query.to_string());
        self.tx = Some(tx);
        Ok(())
    }

    /// send a query and drive it, consulting the prepared statement manager.
    fn run_query(
        &self,
        state: &mut ConnState,
        pgq: &PostgresQuery,
        prepare: Option<bool>,
    ) -> Result<Vec<PgResult>, Error> {
        let interval = self.conn.wait_interval;
        let key: QueryFingerprint = (pgq.query.clone(), pgq.types.clone());
        let prep = state.prepare.get(&key, prepare);

        // a statement without parameters and without a server side name can
        // use the simple protocol, which also allows multi-statement scripts
        let simple = matches!(prep, PrepareState::No)
            && pgq.params.is_empty()
            && self.format == Format::Text;

        let query_str = core::str::from_utf8(&pgq.query)
            .map_err(|_| InterfaceError::new("query is not valid utf8"))?;

        if let PrepareState::ToPrepare(name) = &prep {
            let pgconn = state.pgconn()?;
            pgconn.send_prepare(name, query_str, &pgq.types)?;
            let mut machine = Execute::default();
            let results = waiting::wait(&mut machine, pgconn, interval)?;
            if let Some(res) = results.into_iter().find(|r| r.status() == ExecStatus::FatalError) {
                state.prepare.maintain(&key, prep, false);
                return Err(res.into_error());
            }
        }

        let pgconn = state.pgconn()?;
        match &prep {
            PrepareState::No if simple => pgconn.send_query(query_str)?,
            PrepareState::No => {
                pgconn.send_query_params(query_str, &pgq.params, &pgq.types, &pgq.formats, self.format)?
            }
            PrepareState::ToPrepare(name) | PrepareState::Yes(name) => {
                pgconn.send_query_prepared(name, &pgq.params, &pgq.formats, self.format)?
            }
        }

        let mut machine = Execute::default();
        let results = waiting::wait(&mut machine, pgconn, interval)?;

        let succeeded = !results.iter().any(|r| r.status() == ExecStatus::FatalError);
        if let Some(deallocate) = state.prepare.maintain(&key, prep, succeeded) {
            self.conn.exec_command(state, &deallocate)?;
        }
        Ok(results)
    }

    /// store successful results and point the transformer at the first one.
    fn finish_execution(
        &mut self,
        state: &mut ConnState,
        mut tx: Transformer,
        results: Vec<PgResult>,
    ) -> Result<(), Error> {
        self.conn.drain_notifies(state);
        let results = classify_results_owned(results)?;

        self.rowcount = rowcount_of(&results[0]);
        tx.set_result(Some(&results[0]))?;
        self.results = results;
        self.iresult = 0;
        self.pos = 0;
        self.tx = Some(tx);
        Ok(())
    }

    fn current(&self) -> Result<(&Transformer, &PgResult), Error> {
        let res = self
            .results
            .get(self.iresult)
            .ok_or_else(|| InterfaceError::new("no result available"))?;
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| InterfaceError::new("no result available"))?;
        Ok((tx, res))
    }

    /// fetch the next row, or `None` when the result is exhausted.
    pub fn fetchone(&mut self) -> Result<Option<Row>, Error> {
        self.check_open()?;
        let pos = self.pos;
        let (tx, res) = self.current()?;
        let row = tx.load_row(res, pos)?;
        if row.is_some() {
            self.pos += 1;
        }
        Ok(row)
    }

    /// fetch up to `size` rows (the cursor's arraysize when `None`).
    pub fn fetchmany(&mut self, size: Option<usize>) -> Result<Vec<Row>, Error> {
        self.check_open()?;
        let size = size.unwrap_or(self.arraysize);
        let pos = self.pos;
        let (tx, res) = self.current()?;
        let hi = (pos + size).min(res.ntuples());
        let rows = tx.load_rows(res, pos, hi)?;
        self.pos = hi;
        Ok(rows)
    }

    /// fetch every remaining row.
    pub fn fetchall(&mut self) -> Result<Vec<Row>, Error> {
        self.check_open()?;
        let pos = self.pos;
        let (tx, res) = self.current()?;
        let hi = res.ntuples();
        let rows = tx.load_rows(res, pos, hi)?;
        self.pos = hi;
        Ok(rows)
    }

    /// move to the next result of a multi-statement execution.
    pub fn nextset(&mut self) -> Result<bool, Error> {
        self.check_open()?;
        if self.iresult + 1 >= self.results.len() {
            return Ok(false);
        }
        self.iresult += 1;
        self.pos = 0;
        let res = &self.results[self.iresult];
        self.rowcount = rowcount_of(res);
        if let Some(tx) = self.tx.as_mut() {
            tx.set_result(Some(res))?;
        }
        Ok(true)
    }

    /// move the row position. out of range targets fail without moving.
    pub fn scroll(&mut self, value: i64, mode: ScrollMode) -> Result<(), Error> {
        self.check_open()?;
        let ntuples = {
            let (_, res) = self.current()?;
            res.ntuples() as i64
        };
        let target = match mode {
            ScrollMode::Relative => self.pos as i64 + value,
            ScrollMode::Absolute => value,
        };
        if target < 0 || target > ntuples {
            return Err(InterfaceError::new(format!("scroll index {target} out of range")).into());
        }
        self.pos = target as usize;
        Ok(())
    }

    /// execute a query in single row mode and iterate its rows as they
    /// arrive, without buffering the whole result set.
    pub fn stream<'a>(&'a mut self, query: &str, params: Params<'_>) -> Result<RowStream<'c, 'a>, Error> {
        self.check_open()?;
        self.reset();

        {
            let mut state = self.conn.lock();
            self.conn.start_query(&mut state)?;

            let mut tx = self.conn.make_transformer(&mut state);
            if let Some(factory) = &self.row_factory {
                tx.set_row_factory(factory.clone());
            }
            let pgq = PostgresQuery::convert(query, params, &mut tx)?;
            let query_str = core::str::from_utf8(&pgq.query)
                .map_err(|_| InterfaceError::new("query is not valid utf8"))?;

            let interval = self.conn.wait_interval;
            let pgconn = state.pgconn()?;
            pgconn.send_query_params(query_str, &pgq.params, &pgq.types, &pgq.formats, self.format)?;
            pgconn.set_single_row_mode();
            let mut machine = SendMachine;
            waiting::wait(&mut machine, pgconn, interval)?;

            self.tx = Some(tx);
            self.pgq = Some(pgq);
        }
        self.last_query = Some(query.to_string());

        Ok(RowStream {
            cursor: self,
            done: false,
            first: true,
        })
    }

    /// start a COPY operation and return its scoped data channel.
    pub fn copy<'a>(&'a mut self, statement: &str) -> Result<Copy<'c, 'a>, Error> {
        self.check_open()?;
        self.reset();
        // the copy rows go through a transformer of their own
        {
            let mut state = self.conn.lock();
            let mut tx = self.conn.make_transformer(&mut state);
            if let Some(factory) = &self.row_factory {
                tx.set_row_factory(factory.clone());
            }
            self.tx = Some(tx);
        }
        Copy::start(self, statement)
    }

    pub(crate) fn conn_ref(&self) -> &'c Connection {
        self.conn
    }

    pub(crate) fn transformer_mut(&mut self) -> Option<&mut Transformer> {
        self.tx.as_mut()
    }

    /// close the cursor. idempotent; the connection stays usable.
    pub fn close(&mut self) {
        self.closed = true;
        self.reset();
    }
}

impl Iterator for Cursor<'_> {
    type Item = Result<Row, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.fetchone().transpose()
    }
}

/// rows produced by [`Cursor::stream`], loaded one at a time.
pub struct RowStream<'c, 'a> {
    cursor: &'a mut Cursor<'c>,
    done: bool,
    first: bool,
}

impl RowStream<'_, '_> {
    fn next_row(&mut self) -> Result<Option<Row>, Error> {
        if self.done {
            return Ok(None);
        }
        let conn = self.cursor.conn;
        loop {
            let mut state = conn.lock();
            let interval = conn.wait_interval;
            let pgconn = state.pgconn()?;
            let mut machine = Fetch;
            let res = waiting::wait(&mut machine, pgconn, interval)?;
            conn.drain_notifies(&mut state);
            drop(state);

            let res = match res {
                None => {
                    self.done = true;
                    return Ok(None);
                }
                Some(res) => res,
            };
            match res.status() {
                ExecStatus::SingleTuple => {
                    let tx = self
                        .cursor
                        .tx
                        .as_mut()
                        .ok_or_else(|| InternalError::new("stream lost its transformer"))?;
                    if self.first {
                        tx.set_result(Some(&res))?;
                        self.first = false;
                    }
                    let row = tx.load_row(&res, 0)?;
                    self.cursor.rowcount = self.cursor.rowcount.max(0) + 1;
                    return Ok(row);
                }
                // end of stream: the server closes with an empty TuplesOk or
                // a CommandOk for statements producing no rows
                ExecStatus::TuplesOk | ExecStatus::CommandOk | ExecStatus::EmptyQuery => {
                    continue;
                }
                ExecStatus::FatalError => {
                    self.done = true;
                    return Err(res.into_error());
                }
                status => {
                    self.done = true;
                    return Err(
                        InternalError::new(format!("unexpected result status {status:?} in stream")).into(),
                    );
                }
            }
        }
    }
}

impl Iterator for RowStream<'_, '_> {
    type Item = Result<Row, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_row().transpose()
    }
}

impl Drop for RowStream<'_, '_> {
    fn drop(&mut self) {
        // drain the remaining stream so the connection is reusable
        while !self.done {
            if self.next_row().is_err() {
                break;
            }
        }
    }
}

pub(crate) fn rowcount_of(res: &PgResult) -> i64 {
    match res.status() {
        ExecStatus::TuplesOk | ExecStatus::SingleTuple => res.ntuples() as i64,
        ExecStatus::CommandOk => res.rows_affected().map(|n| n as i64).unwrap_or(-1),
        _ => -1,
    }
}

/// check a result batch: server errors are raised, COPY through execute is a
/// misuse, anything else unexpected is an internal error.
pub(crate) fn classify_results(results: &[PgResult]) -> Result<(), Error> {
    if results.is_empty() {
        return Err(InternalError::new("got no result after a successful send").into());
    }
    for res in results {
        match res.status() {
            ExecStatus::TuplesOk
            | ExecStatus::CommandOk
            | ExecStatus::EmptyQuery
            | ExecStatus::SingleTuple => {}
            ExecStatus::CopyIn | ExecStatus::CopyOut | ExecStatus::CopyBoth => {
                return Err(ProgrammingError::new(
                    "COPY cannot be used with execute(); use the copy() method instead",
                )
                .into());
            }
            ExecStatus::FatalError => {
                return Err(res
                    .diagnostic()
                    .cloned()
                    .map(crate::errors::DbError::new)
                    .map(Error::from)
                    .unwrap_or_else(Error::unexpected));
            }
            status => {
                return Err(InternalError::new(format!("unexpected result status {status:?}")).into());
            }
        }
    }
    Ok(())
}

// classify_results borrows; executions that own their results go through this
// consuming variant to preserve the error's diagnostic without cloning.
pub(crate) fn classify_results_owned(results: Vec<PgResult>) -> Result<Vec<PgResult>, Error> {
    classify_results(&results)?;
    Ok(results)
}

/// a server side cursor: DECLAREs a portal and fetches from it in batches.
pub struct ServerCursor<'c> {
    conn: &'c Connection,
    name: String,
    inner: Cursor<'c>,
    described: bool,
    scrollable: Option<bool>,
    with_hold: bool,
}

impl<'c> ServerCursor<'c> {
    pub(crate) fn new(conn: &'c Connection, name: &str) -> Self {
        Self {
            conn,
            name: name.to_string(),
            inner: Cursor::new(conn),
            described: false,
            scrollable: None,
            with_hold: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// declare the cursor as SCROLL / NO SCROLL.
    pub fn set_scrollable(&mut self, scrollable: bool) {
        self.scrollable = Some(scrollable);
    }

    /// declare the cursor WITH HOLD, surviving transaction commit.
    pub fn set_with_hold(&mut self, with_hold: bool) {
        self.with_hold = with_hold;
    }

    pub fn rowcount(&self) -> i64 {
        self.inner.rowcount()
    }

    /// DECLARE the cursor for the given query and describe its columns.
    pub fn execute(&mut self, query: &str, params: Params<'_>) -> Result<(), Error> {
        let mut declare = format!("DECLARE {} ", Ident(&self.name));
        match self.scrollable {
            Some(true) => declare.push_str("SCROLL "),
            Some(false) => declare.push_str("NO SCROLL "),
            None => {}
        }
        declare.push_str("CURSOR ");
        if self.with_hold {
            declare.push_str("WITH HOLD ");
        }
        declare.push_str("FOR ");
        declare.push_str(query);

        self.inner.execute(&declare, params)?;

        // describe the portal so column metadata is available before any fetch
        let mut state = self.conn.lock();
        let interval = self.conn.wait_interval;
        let pgconn = state.pgconn()?;
        pgconn.send_describe_portal(&self.name)?;
        let mut machine = Execute::default();
        let results = waiting::wait(&mut machine, pgconn, interval)?;
        self.conn.drain_notifies(&mut state);
        let res = results
            .into_iter()
            .next()
            .ok_or_else(|| InternalError::new("no result from portal describe"))?;
        if res.status() == ExecStatus::FatalError {
            return Err(res.into_error());
        }
        if let Some(tx) = self.inner.transformer_mut() {
            tx.set_result(Some(&res))?;
        }
        self.described = true;
        self.inner.rowcount = -1;
        Ok(())
    }

    /// `executemany` makes no sense against a named portal.
    pub fn executemany(&mut self, _query: &str, _param_rows: &[Params<'_>]) -> Result<(), Error> {
        Err(NotSupportedError::new("executemany cannot be used with a server side cursor").into())
    }

    fn check_declared(&self) -> Result<(), Error> {
        if !self.described {
            return Err(InterfaceError::new("no result available; execute() the cursor first").into());
        }
        Ok(())
    }

    fn fetch_batch(&mut self, count: Option<usize>) -> Result<Vec<Row>, Error> {
        self.check_declared()?;
        let what = match count {
            Some(n) => format!("FORWARD {n}"),
            None => "FORWARD ALL".to_string(),
        };
        let query = format!("FETCH {what} FROM {}", Ident(&self.name));

        let mut state = self.conn.lock();
        let interval = self.conn.wait_interval;
        let pgconn = state.pgconn()?;
        pgconn.send_query(&query)?;
        let mut machine = Execute::default();
        let results = waiting::wait(&mut machine, pgconn, interval)?;
        self.conn.drain_notifies(&mut state);
        drop(state);

        let results = classify_results_owned(results)?;
        let res = &results[0];
        let tx = self
            .inner
            .transformer_mut()
            .ok_or_else(|| InternalError::new("server cursor lost its transformer"))?;
        // FETCH results carry the true formats; refresh the loader vector
        tx.set_result(Some(res))?;
        tx.load_rows(res, 0, res.ntuples())
    }

    pub fn fetchone(&mut self) -> Result<Option<Row>, Error> {
        let mut rows = self.fetch_batch(Some(1))?;
        Ok(rows.pop())
    }

    pub fn fetchmany(&mut self, size: Option<usize>) -> Result<Vec<Row>, Error> {
        let size = size.unwrap_or_else(|| self.inner.arraysize());
        self.fetch_batch(Some(size))
    }

    pub fn fetchall(&mut self) -> Result<Vec<Row>, Error> {
        self.fetch_batch(None)
    }

    /// reposition the portal with MOVE. the server does not report
    /// out-of-bounds targets reliably; a one row probe would, but the lax
    /// behaviour matches what DECLARE offers.
    pub fn scroll(&mut self, value: i64, mode: ScrollMode) -> Result<(), Error> {
        self.check_declared()?;
        let query = match mode {
            ScrollMode::Relative => format!("MOVE {value} FROM {}", Ident(&self.name)),
            ScrollMode::Absolute => format!("MOVE ABSOLUTE {value} FROM {}", Ident(&self.name)),
        };
        let mut state = self.conn.lock();
        self.conn.exec_command(&mut state, &query)
    }

    /// CLOSE the portal if the server still has it.
    pub fn close(&mut self) -> Result<(), Error> {
        if self.inner.closed() {
            return Ok(());
        }
        if self.described {
            let mut state = self.conn.lock();
            let status = state.pgconn()?.transaction_status();
            // in a failed transaction the portal is gone with the transaction
            if status == crate::pq::TransactionStatus::Idle
                || status == crate::pq::TransactionStatus::InTrans
            {
                drop(state);
                let exists = {
                    let mut cur = self.conn.cursor();
                    let name = self.name.clone();
                    let params: [&dyn crate::value::SqlValue; 1] = [&name];
                    cur.execute("select 1 from pg_cursors where name = %s", Params::Positional(&params))?;
                    cur.fetchone()?.is_some()
                };
                if exists {
                    let mut state = self.conn.lock();
                    let query = format!("CLOSE {}", Ident(&self.name));
                    self.conn.exec_command(&mut state, &query)?;
                }
            }
        }
        self.inner.close();
        Ok(())
    }
}

impl Drop for ServerCursor<'_> {
    fn drop(&mut self) {
        if !self.inner.closed() {
            let _ = self.close();
        }
    }
}
