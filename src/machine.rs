//! resumable operations over the wire handle.
//!
//! certain operations (connecting, querying) are an interleave of buffer work
//! and waiting for the socket. each operation here is a small state machine:
//! `step` either returns the final value or reports the readiness it needs,
//! and is resumed with what actually became ready. the functions in
//! [`waiting`] are the ones that park more or less cooperatively and keep the
//! machines moving.
//!
//! all machines assume exclusive use of the wire handle while they run.
//!
//! [`waiting`]: crate::waiting

use std::os::fd::RawFd;

use bytes::Bytes;

use crate::{
    errors::{Error, InternalError, OperationalError},
    pq::{ConnStatus, CopyData, ExecStatus, FlushStatus, PgConn, PgResult, PollingStatus, PutStatus},
    waiting::{Ready, Wait},
};

/// one step of a resumable operation.
pub enum Step<T> {
    /// the operation would block; wait for the given readiness and resume.
    Pending(Wait),
    /// the operation completed.
    Ready(T),
}

/// a suspendable routine over an established connection.
pub trait Machine {
    type Output;

    /// advance as far as possible without blocking. `ready` is `None` on the
    /// first step and carries the observed readiness on every resume.
    fn step(&mut self, conn: &mut PgConn, ready: Option<Ready>) -> Result<Step<Self::Output>, Error>;
}

/// one step of the connect machine, which owns its handle and whose fd may
/// change while the handshake proceeds.
pub enum ConnStep {
    Pending(RawFd, Wait),
    Ready(PgConn),
}

/// the connection handshake as a resumable operation.
pub struct Connect {
    conn: Option<PgConn>,
}

impl Connect {
    pub fn new(conn: PgConn) -> Self {
        Self { conn: Some(conn) }
    }

    pub fn step(&mut self, _ready: Option<Ready>) -> Result<ConnStep, Error> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| InternalError::new("connect machine resumed after completion"))?;

        if conn.status() == ConnStatus::Bad {
            return Err(connect_failed(conn, "connection is bad"));
        }

        match conn.connect_poll() {
            PollingStatus::Ok => {
                let conn = self.conn.take().expect("checked above");
                conn.set_nonblocking(true)?;
                Ok(ConnStep::Ready(conn))
            }
            PollingStatus::Reading => Ok(ConnStep::Pending(conn.socket(), Wait::R)),
            PollingStatus::Writing => Ok(ConnStep::Pending(conn.socket(), Wait::W)),
            PollingStatus::Failed => Err(connect_failed(conn, "connection failed")),
        }
    }
}

#[cold]
fn connect_failed(conn: &PgConn, prefix: &str) -> Error {
    let detail = conn.error_message().unwrap_or("unknown error");
    OperationalError::new(format!("{prefix}: {detail}")).into()
}

/// flush an already enqueued request, draining incoming chatter on the way.
#[derive(Default)]
pub struct Send;

impl Machine for Send {
    type Output = ();

    fn step(&mut self, conn: &mut PgConn, ready: Option<Ready>) -> Result<Step<()>, Error> {
        if let Some(ready) = ready {
            if ready.readable() {
                // may read notifies; they are queued on the handle and
                // delivered after the operation completes.
                conn.consume_input()?;
            }
        }
        match conn.flush()? {
            FlushStatus::Done => Ok(Step::Ready(())),
            FlushStatus::WouldBlock => Ok(Step::Pending(Wait::RW)),
        }
    }
}

/// retrieve a single result. the request must have been flushed already.
#[derive(Default)]
pub struct Fetch;

impl Machine for Fetch {
    type Output = Option<PgResult>;

    fn step(&mut self, conn: &mut PgConn, _ready: Option<Ready>) -> Result<Step<Self::Output>, Error> {
        conn.consume_input()?;
        if conn.is_busy() {
            return Ok(Step::Pending(Wait::R));
        }
        Ok(Step::Ready(conn.get_result()))
    }
}

/// retrieve every result of the current batch.
#[derive(Default)]
pub struct FetchMany {
    results: Vec<PgResult>,
}

impl Machine for FetchMany {
    type Output = Vec<PgResult>;

    fn step(&mut self, conn: &mut PgConn, _ready: Option<Ready>) -> Result<Step<Self::Output>, Error> {
        loop {
            conn.consume_input()?;
            if conn.is_busy() {
                return Ok(Step::Pending(Wait::R));
            }
            match conn.get_result() {
                None => return Ok(Step::Ready(std::mem::take(&mut self.results))),
                Some(res) => {
                    // after entering copy mode the server fabricates a phony
                    // result for every request; break the endless loop here.
                    let copy = matches!(
                        res.status(),
                        ExecStatus::CopyIn | ExecStatus::CopyOut | ExecStatus::CopyBoth
                    );
                    self.results.push(res);
                    if copy {
                        return Ok(Step::Ready(std::mem::take(&mut self.results)));
                    }
                }
            }
        }
    }
}

/// send a request and collect its results: the standard request/response shape.
pub struct Execute {
    sending: bool,
    fetch: FetchMany,
}

impl Default for Execute {
    fn default() -> Self {
        Self {
            sending: true,
            fetch: FetchMany::default(),
        }
    }
}

impl Machine for Execute {
    type Output = Vec<PgResult>;

    fn step(&mut self, conn: &mut PgConn, ready: Option<Ready>) -> Result<Step<Self::Output>, Error> {
        if self.sending {
            match Send.step(conn, ready)? {
                Step::Pending(want) => return Ok(Step::Pending(want)),
                Step::Ready(()) => self.sending = false,
            }
            return self.fetch.step(conn, None);
        }
        self.fetch.step(conn, ready)
    }
}

/// wait for and drain queued notifications.
#[derive(Default)]
pub struct Notifies {
    parked: bool,
}

impl Machine for Notifies {
    type Output = Vec<crate::pq::Notify>;

    fn step(&mut self, conn: &mut PgConn, _ready: Option<Ready>) -> Result<Step<Self::Output>, Error> {
        if !self.parked {
            self.parked = true;
            return Ok(Step::Pending(Wait::R));
        }
        conn.consume_input()?;
        let mut out = Vec::new();
        while let Some(n) = conn.notifies() {
            out.push(n);
        }
        Ok(Step::Ready(out))
    }
}

/// pull one chunk out of a copy-out stream. `None` marks the end of the
/// stream, after the terminating result has been verified.
#[derive(Default)]
pub struct CopyFrom {
    finishing: Option<FetchMany>,
}

impl Machine for CopyFrom {
    type Output = Option<Bytes>;

    fn step(&mut self, conn: &mut PgConn, ready: Option<Ready>) -> Result<Step<Self::Output>, Error> {
        if let Some(fetch) = self.finishing.as_mut() {
            return match fetch.step(conn, ready)? {
                Step::Pending(want) => Ok(Step::Pending(want)),
                Step::Ready(results) => {
                    check_copy_result(results)?;
                    Ok(Step::Ready(None))
                }
            };
        }

        if ready.is_some() {
            conn.consume_input()?;
        }
        match conn.get_copy_data() {
            CopyData::Data(data) => Ok(Step::Ready(Some(data))),
            CopyData::WouldBlock => Ok(Step::Pending(Wait::R)),
            CopyData::Done => {
                self.finishing = Some(FetchMany::default());
                self.step(conn, None)
            }
        }
    }
}

/// push one chunk into a copy-in stream.
pub struct CopyTo {
    data: Bytes,
}

impl CopyTo {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }
}

impl Machine for CopyTo {
    type Output = ();

    fn step(&mut self, conn: &mut PgConn, _ready: Option<Ready>) -> Result<Step<()>, Error> {
        match conn.put_copy_data(&self.data)? {
            PutStatus::Accepted => Ok(Step::Ready(())),
            PutStatus::WouldBlock => Ok(Step::Pending(Wait::W)),
        }
    }
}

enum CopyEndState {
    Putting,
    Flushing,
    Fetching(FetchMany),
}

/// terminate a copy-in stream, flush, and verify the final result.
pub struct CopyEnd {
    error: Option<String>,
    state: CopyEndState,
}

impl CopyEnd {
    pub fn new(error: Option<String>) -> Self {
        Self {
            error,
            state: CopyEndState::Putting,
        }
    }
}

impl Machine for CopyEnd {
    type Output = PgResult;

    fn step(&mut self, conn: &mut PgConn, ready: Option<Ready>) -> Result<Step<Self::Output>, Error> {
        loop {
            match &mut self.state {
                CopyEndState::Putting => match conn.put_copy_end(self.error.as_deref())? {
                    PutStatus::Accepted => self.state = CopyEndState::Flushing,
                    PutStatus::WouldBlock => return Ok(Step::Pending(Wait::W)),
                },
                CopyEndState::Flushing => match conn.flush()? {
                    FlushStatus::Done => self.state = CopyEndState::Fetching(FetchMany::default()),
                    FlushStatus::WouldBlock => return Ok(Step::Pending(Wait::W)),
                },
                CopyEndState::Fetching(fetch) => {
                    return match fetch.step(conn, ready)? {
                        Step::Pending(want) => Ok(Step::Pending(want)),
                        Step::Ready(results) => check_copy_result(results).map(Step::Ready),
                    }
                }
            }
        }
    }
}

fn check_copy_result(mut results: Vec<PgResult>) -> Result<PgResult, Error> {
    let res = results
        .pop()
        .ok_or_else(|| InternalError::new("no result at the end of COPY"))?;
    match res.status() {
        ExecStatus::CommandOk => Ok(res),
        ExecStatus::FatalError => Err(res.into_error()),
        status => Err(InternalError::new(format!("unexpected result status {status:?} after COPY")).into()),
    }
}
