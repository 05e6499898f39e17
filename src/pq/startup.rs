//! the connection handshake, driven one readiness step at a time.

use std::{
    io::{self, Read},
    net::{TcpStream, ToSocketAddrs},
    os::unix::net::UnixStream,
    path::PathBuf,
};

use postgres_protocol::{
    authentication,
    authentication::sasl::{self, ScramSha256},
    message::{backend, frontend},
};
use socket2::{Domain, Protocol, SockAddr, Type};

use crate::{
    conninfo::ConnInfo,
    errors::{Diagnostic, Error, OperationalError},
};

use super::{
    handle::{FlushStatus, Socket, EINPROGRESS},
    ConnStatus, PgConn, PollingStatus, TransactionStatus,
};

/// handshake progress. the machine only moves inside [`PgConn::connect_poll`];
/// between calls the caller waits for the readiness the last step asked for.
pub(super) enum Startup {
    /// non blocking connect in flight.
    Connecting,
    /// flushing the startup packet.
    SendingStartup,
    /// reading authentication requests. carries SCRAM state once started.
    Authenticating(Option<Box<ScramSha256>>),
    /// flushing an authentication reply.
    SendingAuth(Option<Box<ScramSha256>>),
    /// authentication done; collecting parameters until ReadyForQuery.
    ReadingParams,
}

impl PgConn {
    /// allocate the handle and begin a non blocking connection.
    ///
    /// name resolution happens here; everything after is readiness driven
    /// through [`PgConn::connect_poll`].
    pub fn connect_start(conninfo: ConnInfo) -> Result<PgConn, Error> {
        let host = conninfo.host().to_string();
        let port = conninfo.port();

        let socket = if host.starts_with('/') {
            let path: PathBuf = format!("{host}/.s.PGSQL.{port}").into();
            let sock = socket2::Socket::new(Domain::UNIX, Type::STREAM, None)?;
            sock.set_nonblocking(true)?;
            start_connect(&sock, &SockAddr::unix(&path)?)?;
            Socket::Unix(UnixStream::from(sock))
        } else {
            let addr = (host.as_str(), port)
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| OperationalError::new(format!("could not resolve host {host:?}")))?;
            let domain = Domain::for_address(addr);
            let sock = socket2::Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
            sock.set_nonblocking(true)?;
            start_connect(&sock, &addr.into())?;
            Socket::Tcp(TcpStream::from(sock))
        };

        Ok(PgConn::new(socket, conninfo))
    }

    /// advance the handshake. `Reading`/`Writing` ask the caller to wait for
    /// the socket and poll again; `Failed` leaves the cause in
    /// [`PgConn::error_message`].
    pub fn connect_poll(&mut self) -> PollingStatus {
        match self.poll_step() {
            Ok(status) => status,
            Err(e) => {
                self.status = ConnStatus::Bad;
                self.error_message = Some(e.to_string());
                PollingStatus::Failed
            }
        }
    }

    fn poll_step(&mut self) -> Result<PollingStatus, Error> {
        loop {
            match self.startup.take() {
                None => {
                    return Ok(match self.status {
                        ConnStatus::Ok => PollingStatus::Ok,
                        _ => PollingStatus::Failed,
                    })
                }
                Some(Startup::Connecting) => {
                    if let Some(e) = self.socket.take_error()? {
                        return Err(Error::from(e));
                    }
                    if !self.socket.connected()? {
                        self.startup = Some(Startup::Connecting);
                        return Ok(PollingStatus::Writing);
                    }
                    if let Socket::Tcp(s) = &self.socket {
                        s.set_nodelay(true)?;
                    }
                    self.encode_startup()?;
                    self.startup = Some(Startup::SendingStartup);
                }
                Some(Startup::SendingStartup) => match self.flush()? {
                    FlushStatus::Done => {
                        self.startup = Some(Startup::Authenticating(None));
                        return Ok(PollingStatus::Reading);
                    }
                    FlushStatus::WouldBlock => {
                        self.startup = Some(Startup::SendingStartup);
                        return Ok(PollingStatus::Writing);
                    }
                },
                Some(Startup::SendingAuth(scram)) => match self.flush()? {
                    FlushStatus::Done => {
                        self.startup = Some(Startup::Authenticating(scram));
                        return Ok(PollingStatus::Reading);
                    }
                    FlushStatus::WouldBlock => {
                        self.startup = Some(Startup::SendingAuth(scram));
                        return Ok(PollingStatus::Writing);
                    }
                },
                Some(Startup::Authenticating(scram)) => {
                    match backend::Message::parse(&mut self.read_buf).map_err(Error::from)? {
                        Some(message) => {
                            self.startup = Some(self.on_auth_message(message, scram)?);
                        }
                        None => {
                            if !self.fill_read_buf()? {
                                self.startup = Some(Startup::Authenticating(scram));
                                return Ok(PollingStatus::Reading);
                            }
                            self.startup = Some(Startup::Authenticating(scram));
                        }
                    }
                }
                Some(Startup::ReadingParams) => {
                    match backend::Message::parse(&mut self.read_buf).map_err(Error::from)? {
                        None => {
                            if !self.fill_read_buf()? {
                                self.startup = Some(Startup::ReadingParams);
                                return Ok(PollingStatus::Reading);
                            }
                            self.startup = Some(Startup::ReadingParams);
                        }
                        Some(backend::Message::ParameterStatus(body)) => {
                            let name = body.name().map_err(Error::from)?.to_string();
                            let value = body.value().map_err(Error::from)?.to_string();
                            self.parameters.insert(name, value);
                            self.startup = Some(Startup::ReadingParams);
                        }
                        Some(backend::Message::BackendKeyData(body)) => {
                            self.backend_pid = body.process_id();
                            self.secret_key = body.secret_key();
                            self.startup = Some(Startup::ReadingParams);
                        }
                        Some(backend::Message::NoticeResponse(body)) => {
                            let diag = Diagnostic::parse(&mut body.fields()).map_err(Error::from)?;
                            if let Some(cb) = self.notice_callback.as_mut() {
                                cb(diag);
                            }
                            self.startup = Some(Startup::ReadingParams);
                        }
                        Some(backend::Message::ErrorResponse(body)) => {
                            return Err(crate::errors::DbError::parse(&mut body.fields())
                                .map_err(Error::from)?
                                .into());
                        }
                        Some(backend::Message::ReadyForQuery(_)) => {
                            self.status = ConnStatus::Ok;
                            self.transaction = TransactionStatus::Idle;
                            return Ok(PollingStatus::Ok);
                        }
                        Some(_) => return Err(Error::unexpected()),
                    }
                }
            }
        }
    }

    fn encode_startup(&mut self) -> Result<(), Error> {
        let user = self.conninfo.user();
        let dbname = self.conninfo.dbname();
        let mut params = vec![("user", user), ("database", dbname)];
        if let Some(options) = self.conninfo.get("options") {
            params.push(("options", options.to_string()));
        }
        if let Some(app) = self.conninfo.get("application_name") {
            params.push(("application_name", app.to_string()));
        }
        frontend::startup_message(
            params.iter().map(|(k, v)| (*k, v.as_str())),
            &mut self.write_buf,
        )
        .map_err(Error::from)
    }

    fn on_auth_message(
        &mut self,
        message: backend::Message,
        scram: Option<Box<ScramSha256>>,
    ) -> Result<Startup, Error> {
        match message {
            backend::Message::AuthenticationOk => Ok(Startup::ReadingParams),
            backend::Message::AuthenticationCleartextPassword => {
                let password = self.password_required()?;
                frontend::password_message(password.as_bytes(), &mut self.write_buf).map_err(Error::from)?;
                Ok(Startup::SendingAuth(None))
            }
            backend::Message::AuthenticationMd5Password(body) => {
                let password = self.password_required()?;
                let user = self.conninfo.user();
                let output = authentication::md5_hash(user.as_bytes(), password.as_bytes(), body.salt());
                frontend::password_message(output.as_bytes(), &mut self.write_buf).map_err(Error::from)?;
                Ok(Startup::SendingAuth(None))
            }
            backend::Message::AuthenticationSasl(body) => {
                let mut has_scram = false;
                let mut mechanisms = body.mechanisms();
                while let Some(mechanism) = fallible_iterator::FallibleIterator::next(&mut mechanisms)
                    .map_err(Error::from)?
                {
                    if mechanism == sasl::SCRAM_SHA_256 {
                        has_scram = true;
                    }
                }
                if !has_scram {
                    return Err(OperationalError::new("unsupported SASL authentication mechanism").into());
                }
                let password = self.password_required()?;
                let scram = ScramSha256::new(password.as_bytes(), sasl::ChannelBinding::unsupported());
                frontend::sasl_initial_response(sasl::SCRAM_SHA_256, scram.message(), &mut self.write_buf)
                    .map_err(Error::from)?;
                Ok(Startup::SendingAuth(Some(Box::new(scram))))
            }
            backend::Message::AuthenticationSaslContinue(body) => {
                let mut scram =
                    scram.ok_or_else(|| OperationalError::new("unexpected SASL continuation"))?;
                scram.update(body.data()).map_err(Error::from)?;
                frontend::sasl_response(scram.message(), &mut self.write_buf).map_err(Error::from)?;
                Ok(Startup::SendingAuth(Some(scram)))
            }
            backend::Message::AuthenticationSaslFinal(body) => {
                let mut scram =
                    scram.ok_or_else(|| OperationalError::new("unexpected SASL finalization"))?;
                scram.finish(body.data()).map_err(Error::from)?;
                Ok(Startup::ReadingParams)
            }
            backend::Message::ErrorResponse(body) => {
                Err(crate::errors::DbError::parse(&mut body.fields()).map_err(Error::from)?.into())
            }
            _ => Err(Error::unexpected()),
        }
    }

    fn password_required(&self) -> Result<String, Error> {
        self.conninfo
            .password()
            .ok_or_else(|| OperationalError::new("server requested a password but none was supplied").into())
    }

    /// try a single non blocking read. returns false when the socket has no
    /// data yet.
    fn fill_read_buf(&mut self) -> Result<bool, Error> {
        let mut chunk = [0u8; 8192];
        match self.socket_read(&mut chunk) {
            Ok(0) => Err(OperationalError::new("server closed the connection during handshake").into()),
            Ok(n) => {
                self.read_buf.extend_from_slice(&chunk[..n]);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(Error::from(e)),
        }
    }

    fn socket_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.socket {
            Socket::Tcp(s) => s.read(buf),
            Socket::Unix(s) => s.read(buf),
        }
    }
}

fn start_connect(sock: &socket2::Socket, addr: &SockAddr) -> Result<(), Error> {
    match sock.connect(addr) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
        Err(e) if e.raw_os_error() == Some(EINPROGRESS) => Ok(()),
        Err(e) => Err(Error::from(e)),
    }
}
