//! cursors for the cooperative connection.

use bytes::Bytes;

use crate::{
    connection::ConnState,
    connection_async::AsyncConnection,
    copy_async::AsyncCopy,
    cursor::ScrollMode,
    errors::{Error, InterfaceError, InternalError, NotSupportedError},
    machine::{Execute, Fetch, Send as SendMachine},
    pq::{ExecStatus, Format, PgResult},
    prepare::{PrepareState, QueryFingerprint},
    queries::{Params, ParsedQuery, PostgresQuery},
    rows::{Row, RowFactory},
    transform::Transformer,
    waiting,
};

/// the async counterpart of [`Cursor`].
///
/// [`Cursor`]: crate::cursor::Cursor
pub struct AsyncCursor<'c> {
    conn: &'c AsyncConnection,
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

impl<'c> AsyncCursor<'c> {
    pub(crate) fn new(conn: &'c AsyncConnection) -> Self {
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

    pub fn set_format(&mut self, format: Format) {
        self.format = format;
    }

    pub fn set_row_factory(&mut self, factory: RowFactory) {
        self.row_factory = Some(factory);
    }

    pub fn arraysize(&self) -> usize {
        self.arraysize
    }

    pub fn set_arraysize(&mut self, arraysize: usize) {
        self.arraysize = arraysize.max(1);
    }

    pub fn connection(&self) -> &AsyncConnection {
        self.conn
    }

    pub fn closed(&self) -> bool {
        self.closed
    }

    pub fn rowcount(&self) -> i64 {
        self.rowcount
    }

    pub fn last_query(&self) -> Option<&str> {
        self.last_query.as_deref()
    }

    pub fn query(&self) -> Option<&[u8]> {
        self.pgq.as_ref().map(|q| &q.query[..])
    }

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

    pub async fn execute(&mut self, query: &str, params: Params<'_>) -> Result<(), Error> {
        self.execute_prepare(query, params, None).await
    }

    pub async fn execute_prepare(
        &mut self,
        query: &str,
        params: Params<'_>,
        prepare: Option<bool>,
    ) -> Result<(), Error> {
        self.check_open()?;
        self.reset();

        let mut state = self.conn.lock().await;
        self.conn.start_query(&mut state).await?;

        let mut tx = self.conn.make_transformer(&mut state);
        if let Some(factory) = &self.row_factory {
            tx.set_row_factory(factory.clone());
        }

        let pgq = PostgresQuery::convert(query, params, &mut tx)?;
        let results = self.run_query(&mut state, &pgq, prepare).await?;

        self.conn.drain_notifies(&mut state);
        let results = crate::cursor::classify_results_owned(results)?;

        self.rowcount = crate::cursor::rowcount_of(&results[0]);
        tx.set_result(Some(&results[0]))?;
        self.results = results;
        self.iresult = 0;
        self.pos = 0;
        self.tx = Some(tx);
        self.last_query = Some(query.to_string());
        self.pgq = Some(pgq);
        Ok(())
    }

    pub async fn executemany(&mut self, query: &str, param_rows: &[Params<'_>]) -> Result<(), Error> {
        self.check_open()?;
        self.reset();

        let mut state = self.conn.lock().await;
        self.conn.start_query(&mut state).await?;

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

            let prepare = if first { None } else { Some(true) };
            first = false;

            let results = self.run_query(&mut state, q, prepare).await?;
            for res in &results {
                if res.status() != ExecStatus::FatalError {
                    if let Some(n) = res.rows_affected() {
                        total += n as i64;
                    }
                }
            }
            crate::cursor::classify_results(&results)?;
            self.conn.drain_notifies(&mut state);
        }

        self.rowcount = total;
        self.pgq = pgq;
        self.last_query = Some(query.to_string());
        self.tx = Some(tx);
        Ok(())
    }

    async fn run_query(
        &self,
        state: &mut ConnState,
        pgq: &PostgresQuery,
        prepare: Option<bool>,
    ) -> Result<Vec<PgResult>, Error> {
        let key: QueryFingerprint = (pgq.query.clone(), pgq.types.clone());
        let prep = state.prepare.get(&key, prepare);

        let simple = matches!(prep, PrepareState::No)
            && pgq.params.is_empty()
            && self.format == Format::Text;

        let query_str = core::str::from_utf8(&pgq.query)
            .map_err(|_| InterfaceError::new("query is not valid utf8"))?;

        if let PrepareState::ToPrepare(name) = &prep {
            let pgconn = state.pgconn()?;
            pgconn.send_prepare(name, query_str, &pgq.types)?;
            let mut machine = Execute::default();
            let results = waiting::wait_async(&mut machine, pgconn).await?;
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
        let results = waiting::wait_async(&mut machine, pgconn).await?;

        let succeeded = !results.iter().any(|r| r.status() == ExecStatus::FatalError);
        if let Some(deallocate) = state.prepare.maintain(&key, prep, succeeded) {
            self.conn.exec_command(state, &deallocate).await?;
        }
        Ok(results)
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

    pub fn fetchall(&mut self) -> Result<Vec<Row>, Error> {
        self.check_open()?;
        let pos = self.pos;
        let (tx, res) = self.current()?;
        let hi = res.ntuples();
        let rows = tx.load_rows(res, pos, hi)?;
        self.pos = hi;
        Ok(rows)
    }

    pub fn nextset(&mut self) -> Result<bool, Error> {
        self.check_open()?;
        if self.iresult + 1 >= self.results.len() {
            return Ok(false);
        }
        self.iresult += 1;
        self.pos = 0;
        let res = &self.results[self.iresult];
        self.rowcount = crate::cursor::rowcount_of(res);
        if let Some(tx) = self.tx.as_mut() {
            tx.set_result(Some(res))?;
        }
        Ok(true)
    }

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

    /// execute in single row mode and stream the rows with
    /// [`AsyncRowStream::try_next`].
    pub async fn stream<'a>(
        &'a mut self,
        query: &str,
        params: Params<'_>,
    ) -> Result<AsyncRowStream<'c, 'a>, Error> {
        self.check_open()?;
        self.reset();

        {
            let mut state = self.conn.lock().await;
            self.conn.start_query(&mut state).await?;

            let mut tx = self.conn.make_transformer(&mut state);
            if let Some(factory) = &self.row_factory {
                tx.set_row_factory(factory.clone());
            }
            let pgq = PostgresQuery::convert(query, params, &mut tx)?;
            let query_str = core::str::from_utf8(&pgq.query)
                .map_err(|_| InterfaceError::new("query is not valid utf8"))?;

            let pgconn = state.pgconn()?;
            pgconn.send_query_params(query_str, &pgq.params, &pgq.types, &pgq.formats, self.format)?;
            pgconn.set_single_row_mode();
            let mut machine = SendMachine;
            waiting::wait_async(&mut machine, pgconn).await?;

            self.tx = Some(tx);
            self.pgq = Some(pgq);
        }
        self.last_query = Some(query.to_string());

        Ok(AsyncRowStream {
            cursor: self,
            done: false,
            first: true,
        })
    }

    /// start a COPY operation and return its scoped data channel.
    pub async fn copy<'a>(&'a mut self, statement: &str) -> Result<AsyncCopy<'c, 'a>, Error> {
        self.check_open()?;
        self.reset();
        // the copy rows go through a transformer of their own
        {
            let mut state = self.conn.lock().await;
            let mut tx = self.conn.make_transformer(&mut state);
            if let Some(factory) = &self.row_factory {
                tx.set_row_factory(factory.clone());
            }
            self.tx = Some(tx);
        }
        AsyncCopy::start(self, statement).await
    }

    pub(crate) fn conn_ref(&self) -> &'c AsyncConnection {
        self.conn
    }

    pub(crate) fn transformer_mut(&mut self) -> Option<&mut Transformer> {
        self.tx.as_mut()
    }

    pub fn close(&mut self) {
        self.closed = true;
        self.reset();
    }
}

/// rows produced by [`AsyncCursor::stream`], one await per row.
pub struct AsyncRowStream<'c, 'a> {
    cursor: &'a mut AsyncCursor<'c>,
    done: bool,
    first: bool,
}

impl AsyncRowStream<'_, '_> {
    /// the next row, or `None` at the end of the stream.
    pub async fn try_next(&mut self) -> Result<Option<Row>, Error> {
        if self.done {
            return Ok(None);
        }
        let conn = self.cursor.conn;
        loop {
            let mut state = conn.lock().await;
            let pgconn = state.pgconn()?;
            let mut machine = Fetch;
            let res = waiting::wait_async(&mut machine, pgconn).await?;
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
                ExecStatus::TuplesOk | ExecStatus::CommandOk | ExecStatus::EmptyQuery => continue,
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


/// the async counterpart of [`ServerCursor`]: DECLAREs a portal and fetches
/// from it in batches.
///
/// [`ServerCursor`]: crate::cursor::ServerCursor
pub struct AsyncServerCursor<'c> {
    conn: &'c AsyncConnection,
    name: String,
    inner: AsyncCursor<'c>,
    described: bool,
    scrollable: Option<bool>,
    with_hold: bool,
}

impl<'c> AsyncServerCursor<'c> {
    pub(crate) fn new(conn: &'c AsyncConnection, name: &str) -> Self {
        Self {
            conn,
            name: name.to_string(),
            inner: AsyncCursor::new(conn),
            described: false,
            scrollable: None,
            with_hold: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_scrollable(&mut self, scrollable: bool) {
        self.scrollable = Some(scrollable);
    }

    pub fn set_with_hold(&mut self, with_hold: bool) {
        self.with_hold = with_hold;
    }

    /// DECLARE the cursor for the given query and describe its columns.
    pub async fn execute(&mut self, query: &str, params: Params<'_>) -> Result<(), Error> {
        let mut declare = format!("DECLARE {} ", crate::sql::Ident(&self.name));
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

        self.inner.execute(&declare, params).await?;

        let mut state = self.conn.lock().await;
        let pgconn = state.pgconn()?;
        pgconn.send_describe_portal(&self.name)?;
        let mut machine = Execute::default();
        let results = waiting::wait_async(&mut machine, pgconn).await?;
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
        Ok(())
    }

    pub async fn executemany(&mut self, _query: &str, _param_rows: &[Params<'_>]) -> Result<(), Error> {
        Err(NotSupportedError::new("executemany cannot be used with a server side cursor").into())
    }

    fn check_declared(&self) -> Result<(), Error> {
        if !self.described {
            return Err(InterfaceError::new("no result available; execute() the cursor first").into());
        }
        Ok(())
    }

    async fn fetch_batch(&mut self, count: Option<usize>) -> Result<Vec<Row>, Error> {
        self.check_declared()?;
        let what = match count {
            Some(n) => format!("FORWARD {n}"),
            None => "FORWARD ALL".to_string(),
        };
        let query = format!("FETCH {what} FROM {}", crate::sql::Ident(&self.name));

        let mut state = self.conn.lock().await;
        let pgconn = state.pgconn()?;
        pgconn.send_query(&query)?;
        let mut machine = Execute::default();
        let results = waiting::wait_async(&mut machine, pgconn).await?;
        self.conn.drain_notifies(&mut state);
        drop(state);

        let results = crate::cursor::classify_results_owned(results)?;
        let res = &results[0];
        let tx = self
            .inner
            .transformer_mut()
            .ok_or_else(|| InternalError::new("server cursor lost its transformer"))?;
        tx.set_result(Some(res))?;
        tx.load_rows(res, 0, res.ntuples())
    }

    pub async fn fetchone(&mut self) -> Result<Option<Row>, Error> {
        let mut rows = self.fetch_batch(Some(1)).await?;
        Ok(rows.pop())
    }

    pub async fn fetchmany(&mut self, size: Option<usize>) -> Result<Vec<Row>, Error> {
        let size = size.unwrap_or_else(|| self.inner.arraysize());
        self.fetch_batch(Some(size)).await
    }

    pub async fn fetchall(&mut self) -> Result<Vec<Row>, Error> {
        self.fetch_batch(None).await
    }

    /// reposition the portal with MOVE. the server is trusted on bounds.
    pub async fn scroll(&mut self, value: i64, mode: ScrollMode) -> Result<(), Error> {
        self.check_declared()?;
        let query = match mode {
            ScrollMode::Relative => format!("MOVE {value} FROM {}", crate::sql::Ident(&self.name)),
            ScrollMode::Absolute => format!("MOVE ABSOLUTE {value} FROM {}", crate::sql::Ident(&self.name)),
        };
        let mut state = self.conn.lock().await;
        self.conn.exec_command(&mut state, &query).await
    }

    /// CLOSE the portal if the server still has it.
    pub async fn close(&mut self) -> Result<(), Error> {
        if self.inner.closed() {
            return Ok(());
        }
        if self.described {
            let status = {
                let mut state = self.conn.lock().await;
                state.pgconn()?.transaction_status()
            };
            if status == crate::pq::TransactionStatus::Idle
                || status == crate::pq::TransactionStatus::InTrans
            {
                let exists = {
                    let mut cur = self.conn.cursor();
                    let name = self.name.clone();
                    let params: [&dyn crate::value::SqlValue; 1] = [&name];
                    cur.execute("select 1 from pg_cursors where name = %s", Params::Positional(&params))
                        .await?;
                    cur.fetchone()?.is_some()
                };
                if exists {
                    let mut state = self.conn.lock().await;
                    let query = format!("CLOSE {}", crate::sql::Ident(&self.name));
                    self.conn.exec_command(&mut state, &query).await?;
                }
            }
        }
        self.inner.close();
        Ok(())
    }
}
