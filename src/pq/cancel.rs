use std::{
    io::Write,
    net::{TcpStream, ToSocketAddrs},
    os::unix::net::UnixStream,
    time::Duration,
};

use bytes::BytesMut;
use postgres_protocol::message::frontend;

use crate::{
    conninfo::ConnInfo,
    errors::{Error, OperationalError},
};

/// token to cancel a query running on another connection.
///
/// cancellation travels out of band: a fresh socket is opened to the server
/// and a CancelRequest naming the backend is sent. the token is cheap to
/// clone and safe to use from any thread or task; the canceled operation
/// surfaces the cancellation as a `57014` server error.
#[derive(Debug, Clone)]
pub struct PgCancel {
    host: String,
    port: u16,
    backend_pid: i32,
    secret_key: i32,
}

impl PgCancel {
    pub(super) fn new(conninfo: &ConnInfo, backend_pid: i32, secret_key: i32) -> Self {
        Self {
            host: conninfo.host(),
            port: conninfo.port(),
            backend_pid,
            secret_key,
        }
    }

    /// send the cancel request. a no-op error free return does not guarantee
    /// the query is canceled; the server may have finished it already.
    pub fn cancel(&self) -> Result<(), Error> {
        let mut buf = BytesMut::new();
        frontend::cancel_request(self.backend_pid, self.secret_key, &mut buf);

        if self.host.starts_with('/') {
            let path = format!("{}/.s.PGSQL.{}", self.host, self.port);
            let mut socket = UnixStream::connect(path)?;
            socket.write_all(&buf)?;
        } else {
            let addr = (self.host.as_str(), self.port)
                .to_socket_addrs()?
                .next()
                .ok_or_else(|| OperationalError::new(format!("could not resolve host {:?}", self.host)))?;
            let mut socket = TcpStream::connect_timeout(&addr, Duration::from_secs(10))?;
            socket.write_all(&buf)?;
        }
        Ok(())
    }
}
