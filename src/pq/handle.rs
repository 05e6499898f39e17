use core::fmt;

use std::{
    collections::{HashMap, VecDeque},
    io::{self, Read, Write},
    os::fd::{AsRawFd, RawFd},
};

use bytes::{Buf, Bytes, BytesMut};
use fallible_iterator::FallibleIterator;
use postgres_protocol::message::{backend, frontend};
use postgres_types::Oid;

use crate::{
    conninfo::ConnInfo,
    errors::{unexpected_eof_err, Diagnostic, Error, OperationalError},
};

use super::{
    result::PgResult, startup::Startup, CopyData, ConnStatus, ExecStatus, Format, Notify, PgCancel,
    TransactionStatus,
};

const READ_CHUNK: usize = 8192;

// above this amount of unflushed bytes put_copy_data reports would-block so
// the copy machine backs off to the socket.
const WRITE_HIGH_WATER: usize = 1 << 20;

pub(super) type NoticeCallback = Box<dyn FnMut(Diagnostic) + Send>;

/// what kind of request is in flight. the handle refuses a new send until the
/// previous batch has been fully drained with [`PgConn::get_result`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Pending {
    Idle,
    SimpleQuery,
    ExtendedQuery,
    Prepare,
    DescribePortal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum CopyState {
    None,
    In,
    Out,
    Both,
}

/// outcome of [`PgConn::flush`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStatus {
    /// the send buffer is drained.
    Done,
    /// the socket is full; wait for writability and flush again.
    WouldBlock,
}

/// outcome of [`PgConn::put_copy_data`] and [`PgConn::put_copy_end`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutStatus {
    Accepted,
    /// too much data queued; wait for writability and retry.
    WouldBlock,
}

pub(super) enum Socket {
    Tcp(std::net::TcpStream),
    Unix(std::os::unix::net::UnixStream),
}

impl Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            Self::Unix(s) => s.read(buf),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            Self::Unix(s) => s.write(buf),
        }
    }

    pub(super) fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.set_nonblocking(nonblocking),
            Self::Unix(s) => s.set_nonblocking(nonblocking),
        }
    }

    pub(super) fn take_error(&self) -> io::Result<Option<io::Error>> {
        match self {
            Self::Tcp(s) => s.take_error(),
            Self::Unix(s) => s.take_error(),
        }
    }

    pub(super) fn connected(&self) -> io::Result<bool> {
        let res = match self {
            Self::Tcp(s) => s.peer_addr().map(|_| ()),
            Self::Unix(s) => s.peer_addr().map(|_| ()),
        };
        match res {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) if e.raw_os_error() == Some(EINPROGRESS) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

// EINPROGRESS without reaching for libc; the value is fixed per platform.
#[cfg(any(target_os = "macos", target_os = "freebsd"))]
pub(super) const EINPROGRESS: i32 = 36;
#[cfg(not(any(target_os = "macos", target_os = "freebsd")))]
pub(super) const EINPROGRESS: i32 = 115;

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Self::Tcp(s) => s.as_raw_fd(),
            Self::Unix(s) => s.as_raw_fd(),
        }
    }
}

/// the wire handle: a non blocking protocol connection.
///
/// every operation either completes against the local buffers or reports that
/// it would block; the resumable operations in [`machine`] translate those
/// reports into readiness requests for the waiters.
///
/// [`machine`]: crate::machine
pub struct PgConn {
    pub(super) socket: Socket,
    pub(super) read_buf: BytesMut,
    pub(super) write_buf: BytesMut,
    pub(super) status: ConnStatus,
    pub(super) startup: Option<Startup>,
    pub(super) conninfo: ConnInfo,

    pub(super) transaction: TransactionStatus,
    pub(super) parameters: HashMap<String, String>,
    pub(super) backend_pid: i32,
    pub(super) secret_key: i32,

    pub(super) notice_callback: Option<NoticeCallback>,
    pub(super) notify_queue: VecDeque<Notify>,

    pub(super) pending: Pending,
    partial: Option<PgResult>,
    results: VecDeque<PgResult>,
    batch_done: bool,
    single_row_mode: bool,
    result_format: Format,

    copy: CopyState,
    copy_data: VecDeque<Bytes>,
    copy_done: bool,

    pub(super) error_message: Option<String>,
}

impl fmt::Debug for PgConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgConn")
            .field("status", &self.status)
            .field("transaction", &self.transaction)
            .field("backend_pid", &self.backend_pid)
            .finish()
    }
}

impl PgConn {
    pub(super) fn new(socket: Socket, conninfo: ConnInfo) -> Self {
        Self {
            socket,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::new(),
            status: ConnStatus::Started,
            startup: Some(Startup::Connecting),
            conninfo,
            transaction: TransactionStatus::Unknown,
            parameters: HashMap::new(),
            backend_pid: 0,
            secret_key: 0,
            notice_callback: None,
            notify_queue: VecDeque::new(),
            pending: Pending::Idle,
            partial: None,
            results: VecDeque::new(),
            batch_done: false,
            single_row_mode: false,
            result_format: Format::Text,
            copy: CopyState::None,
            copy_data: VecDeque::new(),
            copy_done: false,
            error_message: None,
        }
    }

    /// the raw file descriptor the waiters register interest on.
    pub fn socket(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub fn status(&self) -> ConnStatus {
        self.status
    }

    /// server reported transaction status, `Active` while a request is in
    /// flight, `Unknown` on a broken connection.
    pub fn transaction_status(&self) -> TransactionStatus {
        if self.status == ConnStatus::Bad {
            return TransactionStatus::Unknown;
        }
        if self.pending != Pending::Idle && !self.batch_done && self.results.is_empty() {
            return TransactionStatus::Active;
        }
        self.transaction
    }

    /// value of a session parameter such as `client_encoding` or `TimeZone`.
    pub fn parameter_status(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// server version as reported by the `server_version` parameter.
    pub fn server_version(&self) -> Option<&str> {
        self.parameter_status("server_version")
    }

    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    /// last connection level error, e.g. a failed handshake.
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn set_notice_callback(&mut self, callback: NoticeCallback) {
        self.notice_callback = Some(callback);
    }

    /// switch the socket between blocking and non blocking mode. the handle is
    /// created non blocking; this exists for callers that hand the socket over.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<(), Error> {
        self.socket.set_nonblocking(nonblocking).map_err(Error::from)
    }

    /// token to cancel the query currently running on this connection, usable
    /// from any thread or task.
    pub fn get_cancel(&self) -> PgCancel {
        PgCancel::new(&self.conninfo, self.backend_pid, self.secret_key)
    }

    /// send the terminate message and mark the connection bad. best effort:
    /// a full socket does not keep the handle alive.
    pub fn finish(&mut self) {
        if self.status == ConnStatus::Ok {
            let mut buf = BytesMut::new();
            frontend::terminate(&mut buf);
            let _ = self.socket.write(&buf);
        }
        self.status = ConnStatus::Bad;
    }

    fn check_send(&self) -> Result<(), Error> {
        if self.status != ConnStatus::Ok {
            return Err(OperationalError::new("cannot send on a closed or broken connection").into());
        }
        if self.pending != Pending::Idle {
            return Err(OperationalError::new("another command is already in progress").into());
        }
        Ok(())
    }

    fn start_request(&mut self, pending: Pending) {
        self.pending = pending;
        self.batch_done = false;
        self.single_row_mode = false;
        self.partial = None;
        self.copy = CopyState::None;
        self.copy_data.clear();
        self.copy_done = false;
    }

    /// enqueue a simple protocol query. possibly multiple statements separated
    /// by semicolons, one result each.
    pub fn send_query(&mut self, query: &str) -> Result<(), Error> {
        self.check_send()?;
        frontend::query(query, &mut self.write_buf).map_err(Error::from)?;
        self.result_format = Format::Text;
        self.start_request(Pending::SimpleQuery);
        Ok(())
    }

    /// enqueue an extended protocol query with already dumped parameters.
    pub fn send_query_params(
        &mut self,
        query: &str,
        params: &[Option<Bytes>],
        oids: &[Oid],
        formats: &[Format],
        result_format: Format,
    ) -> Result<(), Error> {
        self.check_send()?;
        frontend::parse("", query, oids.iter().copied(), &mut self.write_buf).map_err(Error::from)?;
        encode_bind("", params, formats, result_format, &mut self.write_buf)?;
        frontend::describe(b'P', "", &mut self.write_buf).map_err(Error::from)?;
        frontend::execute("", 0, &mut self.write_buf).map_err(Error::from)?;
        frontend::sync(&mut self.write_buf);
        self.result_format = result_format;
        self.start_request(Pending::ExtendedQuery);
        Ok(())
    }

    /// enqueue creation of a named prepared statement. the resulting
    /// `CommandOk` result carries the described parameter oids and columns.
    pub fn send_prepare(&mut self, name: &str, query: &str, oids: &[Oid]) -> Result<(), Error> {
        self.check_send()?;
        frontend::parse(name, query, oids.iter().copied(), &mut self.write_buf).map_err(Error::from)?;
        frontend::describe(b'S', name, &mut self.write_buf).map_err(Error::from)?;
        frontend::sync(&mut self.write_buf);
        self.result_format = Format::Text;
        self.start_request(Pending::Prepare);
        Ok(())
    }

    /// enqueue execution of a named prepared statement.
    pub fn send_query_prepared(
        &mut self,
        name: &str,
        params: &[Option<Bytes>],
        formats: &[Format],
        result_format: Format,
    ) -> Result<(), Error> {
        self.check_send()?;
        encode_bind(name, params, formats, result_format, &mut self.write_buf)?;
        frontend::describe(b'P', "", &mut self.write_buf).map_err(Error::from)?;
        frontend::execute("", 0, &mut self.write_buf).map_err(Error::from)?;
        frontend::sync(&mut self.write_buf);
        self.result_format = result_format;
        self.start_request(Pending::ExtendedQuery);
        Ok(())
    }

    /// enqueue a describe of an open portal. the resulting `CommandOk` result
    /// carries the portal's column metadata.
    pub fn send_describe_portal(&mut self, name: &str) -> Result<(), Error> {
        self.check_send()?;
        frontend::describe(b'P', name, &mut self.write_buf).map_err(Error::from)?;
        frontend::sync(&mut self.write_buf);
        self.result_format = Format::Text;
        self.start_request(Pending::DescribePortal);
        Ok(())
    }

    /// request that the pending result set is delivered one row at a time.
    pub fn set_single_row_mode(&mut self) {
        self.single_row_mode = true;
    }

    /// attempt to drain the send buffer.
    pub fn flush(&mut self) -> Result<FlushStatus, Error> {
        while !self.write_buf.is_empty() {
            match self.socket.write(&self.write_buf) {
                Ok(0) => return Err(Error::from(unexpected_eof_err())),
                Ok(n) => {
                    self.write_buf.advance(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(FlushStatus::WouldBlock),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.status = ConnStatus::Bad;
                    return Err(Error::from(e));
                }
            }
        }
        Ok(FlushStatus::Done)
    }

    /// read whatever is available on the socket and process complete messages.
    pub fn consume_input(&mut self) -> Result<(), Error> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.socket.read(&mut chunk) {
                Ok(0) => {
                    self.status = ConnStatus::Bad;
                    return Err(Error::from(unexpected_eof_err()));
                }
                Ok(n) => {
                    self.read_buf.extend_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.status = ConnStatus::Bad;
                    return Err(Error::from(e));
                }
            }
        }
        self.process_messages()
    }

    /// true while the next result is not yet fully buffered.
    pub fn is_busy(&self) -> bool {
        self.results.is_empty() && !self.batch_done && self.pending != Pending::Idle
    }

    /// pop the next buffered result, or `None` when the current batch is
    /// exhausted. a `None` completes the batch and frees the handle for the
    /// next send.
    pub fn get_result(&mut self) -> Option<PgResult> {
        if let Some(res) = self.results.pop_front() {
            return Some(res);
        }
        if self.batch_done {
            self.batch_done = false;
            self.pending = Pending::Idle;
        }
        None
    }

    /// pop a pending asynchronous notification.
    pub fn notifies(&mut self) -> Option<Notify> {
        self.notify_queue.pop_front()
    }

    /// pop one copy-out data chunk.
    pub fn get_copy_data(&mut self) -> CopyData {
        if let Some(data) = self.copy_data.pop_front() {
            return CopyData::Data(data);
        }
        if self.copy_done {
            self.copy_done = false;
            return CopyData::Done;
        }
        CopyData::WouldBlock
    }

    /// feed one chunk into an open copy-in stream.
    pub fn put_copy_data(&mut self, data: &[u8]) -> Result<PutStatus, Error> {
        if self.copy != CopyState::In && self.copy != CopyState::Both {
            return Err(OperationalError::new("no COPY in progress").into());
        }
        if self.write_buf.len() >= WRITE_HIGH_WATER {
            self.flush()?;
            if self.write_buf.len() >= WRITE_HIGH_WATER {
                return Ok(PutStatus::WouldBlock);
            }
        }
        frontend::CopyData::new(data)
            .map_err(Error::from)?
            .write(&mut self.write_buf);
        Ok(PutStatus::Accepted)
    }

    /// terminate an open copy-in stream, with an error message to abort it.
    pub fn put_copy_end(&mut self, error: Option<&str>) -> Result<PutStatus, Error> {
        if self.copy != CopyState::In && self.copy != CopyState::Both {
            return Err(OperationalError::new("no COPY in progress").into());
        }
        match error {
            Some(msg) => frontend::copy_fail(msg, &mut self.write_buf).map_err(Error::from)?,
            None => frontend::copy_done(&mut self.write_buf),
        }
        self.copy = CopyState::None;
        Ok(PutStatus::Accepted)
    }

    fn process_messages(&mut self) -> Result<(), Error> {
        while let Some(message) = backend::Message::parse(&mut self.read_buf).map_err(Error::from)? {
            self.dispatch(message)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, message: backend::Message) -> Result<(), Error> {
        use backend::Message;
        match message {
            Message::NoticeResponse(body) => {
                let diag = Diagnostic::parse(&mut body.fields()).map_err(Error::from)?;
                if let Some(cb) = self.notice_callback.as_mut() {
                    cb(diag);
                }
            }
            Message::NotificationResponse(body) => {
                self.notify_queue.push_back(Notify {
                    channel: body.channel().map_err(Error::from)?.to_string(),
                    payload: body.message().map_err(Error::from)?.to_string(),
                    pid: body.process_id(),
                });
            }
            Message::ParameterStatus(body) => {
                let name = body.name().map_err(Error::from)?.to_string();
                let value = body.value().map_err(Error::from)?.to_string();
                self.parameters.insert(name, value);
            }
            Message::ParseComplete | Message::BindComplete | Message::CloseComplete => {}
            Message::ParameterDescription(body) => {
                let oids = body
                    .parameters()
                    .collect::<Vec<_>>()
                    .map_err(Error::from)?;
                let res = self
                    .partial
                    .get_or_insert_with(|| PgResult::new(ExecStatus::CommandOk));
                res.set_param_oids(oids);
            }
            Message::RowDescription(body) => {
                let fields = PgResult::parse_fields(&body, self.result_format)?;
                match self.pending {
                    // reply to a describe: the metadata is the whole result.
                    Pending::Prepare | Pending::DescribePortal => {
                        let mut res = self.partial.take().unwrap_or_else(|| PgResult::new(ExecStatus::CommandOk));
                        *res.fields_mut() = fields;
                        self.results.push_back(res);
                    }
                    _ => {
                        self.partial = Some(PgResult::with_fields(ExecStatus::TuplesOk, fields));
                    }
                }
            }
            Message::NoData => {
                if matches!(self.pending, Pending::Prepare | Pending::DescribePortal) {
                    let res = self.partial.take().unwrap_or_else(|| PgResult::new(ExecStatus::CommandOk));
                    self.results.push_back(res);
                }
            }
            Message::DataRow(body) => {
                if self.single_row_mode {
                    let fields = self
                        .partial
                        .as_ref()
                        .map(|r| r.fields().to_vec())
                        .unwrap_or_default();
                    let mut res = PgResult::with_fields(ExecStatus::SingleTuple, fields);
                    res.push_row(body)?;
                    self.results.push_back(res);
                } else {
                    match self.partial.as_mut() {
                        Some(res) => res.push_row(body)?,
                        // a row with no preceding description is a protocol violation
                        None => {
                            self.results.push_back(PgResult::new(ExecStatus::BadResponse));
                        }
                    }
                }
            }
            Message::CommandComplete(body) => {
                let tag = body.tag().map_err(Error::from)?.to_string();
                let mut res = match self.partial.take() {
                    Some(res) => res,
                    None => PgResult::new(ExecStatus::CommandOk),
                };
                // in single row mode the trailing result reports completion
                // with no rows attached.
                if self.single_row_mode && res.status() == ExecStatus::TuplesOk {
                    let mut done = PgResult::with_fields(ExecStatus::TuplesOk, res.fields().to_vec());
                    done.set_command_tag(&tag);
                    self.results.push_back(done);
                    return Ok(());
                }
                res.set_command_tag(&tag);
                self.results.push_back(res);
            }
            Message::EmptyQueryResponse => {
                self.partial = None;
                self.results.push_back(PgResult::new(ExecStatus::EmptyQuery));
            }
            Message::ErrorResponse(body) => {
                let diag = Diagnostic::parse(&mut body.fields()).map_err(Error::from)?;
                self.partial = None;
                self.copy = CopyState::None;
                let mut res = PgResult::new(ExecStatus::FatalError);
                res.set_diagnostic(diag);
                self.results.push_back(res);
            }
            Message::PortalSuspended => {
                if let Some(res) = self.partial.take() {
                    self.results.push_back(res);
                }
            }
            Message::CopyInResponse(body) => {
                self.partial = None;
                self.copy = CopyState::In;
                let mut res = PgResult::new(ExecStatus::CopyIn);
                res.set_copy_format(Format::from_i16(body.format() as i16));
                self.results.push_back(res);
            }
            Message::CopyOutResponse(body) => {
                self.partial = None;
                self.copy = CopyState::Out;
                self.copy_done = false;
                let mut res = PgResult::new(ExecStatus::CopyOut);
                res.set_copy_format(Format::from_i16(body.format() as i16));
                self.results.push_back(res);
            }
            Message::CopyData(body) => {
                self.copy_data.push_back(body.into_bytes());
            }
            Message::CopyDone => {
                self.copy = CopyState::None;
                self.copy_done = true;
            }
            Message::ReadyForQuery(body) => {
                self.transaction = match body.status() {
                    b'I' => TransactionStatus::Idle,
                    b'T' => TransactionStatus::InTrans,
                    b'E' => TransactionStatus::InError,
                    _ => TransactionStatus::Unknown,
                };
                self.batch_done = true;
            }
            Message::BackendKeyData(body) => {
                self.backend_pid = body.process_id();
                self.secret_key = body.secret_key();
            }
            _ => return Err(Error::unexpected()),
        }
        Ok(())
    }
}

impl Drop for PgConn {
    fn drop(&mut self) {
        self.finish();
    }
}

fn encode_bind(
    statement: &str,
    params: &[Option<Bytes>],
    formats: &[Format],
    result_format: Format,
    buf: &mut BytesMut,
) -> Result<(), Error> {
    frontend::bind(
        "",
        statement,
        formats.iter().map(|f| f.to_i16()),
        params.iter(),
        |param, buf| match param {
            Some(bytes) => {
                buf.extend_from_slice(bytes);
                Ok(postgres_protocol::IsNull::No)
            }
            None => Ok(postgres_protocol::IsNull::Yes),
        },
        Some(result_format.to_i16()),
        buf,
    )
    .map_err(|e| match e {
        frontend::BindError::Conversion(e) => OperationalError::new(e.to_string()).into(),
        frontend::BindError::Serialization(e) => Error::from(e),
    })
}
