//! waiting in different contexts (blocking, async).
//!
//! these functions consume the state machines from [`machine`] and return
//! their final value. the machines report readiness interest whenever an
//! operation would block; the waiters park until the socket is ready and
//! resume the machine with what actually happened.
//!
//! both waiters drive the exact same machines. the async waiter parks the
//! task on the runtime reactor; the blocking waiter parks the calling thread
//! on a private current thread runtime, the same trick the reference client
//! uses for its blocking execution paths.
//!
//! [`machine`]: crate::machine

use core::time::Duration;

use std::{
    cell::OnceCell,
    os::fd::RawFd,
    time::Instant,
};

use tokio::io::{unix::AsyncFd, Interest};

use crate::{
    errors::{Error, OperationalError},
    machine::{ConnStep, Connect, Machine, Step},
    pq::PgConn,
};

/// readiness interest on a file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// wait for readability.
    R,
    /// wait for writability.
    W,
    /// wait for either.
    RW,
}

/// what actually became ready. selectors may report both directions at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    readable: bool,
    writable: bool,
}

impl Ready {
    pub const R: Self = Self {
        readable: true,
        writable: false,
    };
    pub const W: Self = Self {
        readable: false,
        writable: true,
    };

    pub fn readable(self) -> bool {
        self.readable
    }

    pub fn writable(self) -> bool {
        self.writable
    }
}

impl Wait {
    fn interest(self) -> Interest {
        match self {
            Self::R => Interest::READABLE,
            Self::W => Interest::WRITABLE,
            Self::RW => Interest::READABLE.add(Interest::WRITABLE),
        }
    }
}

thread_local! {
    // one reactor per thread that uses the blocking waiter. connections are
    // owned by at most one thread at a time so there is no contention here.
    static RUNTIME: OnceCell<tokio::runtime::Runtime> = const { OnceCell::new() };
}

fn with_runtime<F, O>(f: F) -> Result<O, Error>
where
    F: FnOnce(&tokio::runtime::Runtime) -> Result<O, Error>,
{
    RUNTIME.with(|cell| {
        if cell.get().is_none() {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_io()
                .enable_time()
                .build()?;
            let _ = cell.set(rt);
        }
        f(cell.get().expect("runtime was just initialized"))
    })
}

async fn ready_on(afd: &AsyncFd<RawFd>, want: Wait) -> Result<Ready, Error> {
    let mut guard = afd.ready(want.interest()).await?;
    let ready = guard.ready();
    guard.clear_ready();
    Ok(Ready {
        readable: ready.is_readable(),
        writable: ready.is_writable(),
    })
}

/// drive a machine to completion, blocking the calling thread.
///
/// `interval` bounds each individual park so external liveness checks can run
/// between polls; its expiry is not an error, the waiter simply parks again.
pub fn wait<M>(machine: &mut M, conn: &mut PgConn, interval: Option<Duration>) -> Result<M::Output, Error>
where
    M: Machine,
{
    let mut ready = None;
    loop {
        match machine.step(conn, ready.take())? {
            Step::Ready(value) => return Ok(value),
            Step::Pending(want) => {
                let fd = conn.socket();
                ready = Some(block_on_ready(fd, want, interval, None)?);
            }
        }
    }
}

/// drive a machine to completion from async context.
pub async fn wait_async<M>(machine: &mut M, conn: &mut PgConn) -> Result<M::Output, Error>
where
    M: Machine,
{
    let afd = AsyncFd::with_interest(conn.socket(), Interest::READABLE.add(Interest::WRITABLE))?;
    let mut ready = None;
    loop {
        match machine.step(conn, ready.take())? {
            Step::Ready(value) => return Ok(value),
            Step::Pending(want) => ready = Some(ready_on(&afd, want).await?),
        }
    }
}

/// drive the connect machine to completion, blocking the calling thread.
///
/// connect machines report their own fd because it may change while trying
/// hosts. unlike [`wait`], `timeout` here is a hard handshake deadline.
pub fn wait_conn(machine: &mut Connect, timeout: Option<Duration>) -> Result<PgConn, Error> {
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut ready = None;
    loop {
        match machine.step(ready.take())? {
            ConnStep::Ready(conn) => return Ok(conn),
            ConnStep::Pending(fd, want) => {
                ready = Some(block_on_ready(fd, want, None, deadline)?);
            }
        }
    }
}

/// drive the connect machine to completion from async context.
pub async fn wait_conn_async(machine: &mut Connect, timeout: Option<Duration>) -> Result<PgConn, Error> {
    let fut = async {
        let mut ready = None;
        loop {
            match machine.step(ready.take())? {
                ConnStep::Ready(conn) => return Ok(conn),
                ConnStep::Pending(fd, want) => {
                    let afd = AsyncFd::with_interest(fd, Interest::READABLE.add(Interest::WRITABLE))?;
                    ready = Some(ready_on(&afd, want).await?);
                }
            }
        }
    };
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| connect_timeout_err(timeout))?,
        None => fut.await,
    }
}

fn block_on_ready(
    fd: RawFd,
    want: Wait,
    interval: Option<Duration>,
    deadline: Option<Instant>,
) -> Result<Ready, Error> {
    with_runtime(|rt| {
        rt.block_on(async {
            let afd = AsyncFd::with_interest(fd, Interest::READABLE.add(Interest::WRITABLE))?;
            loop {
                if let Some(deadline) = deadline {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(connect_timeout_err(Duration::ZERO));
                    }
                    match tokio::time::timeout(deadline - now, ready_on(&afd, want)).await {
                        Ok(ready) => return ready,
                        Err(_) => return Err(connect_timeout_err(deadline - now)),
                    }
                }
                match interval {
                    Some(interval) => match tokio::time::timeout(interval, ready_on(&afd, want)).await {
                        Ok(ready) => return ready,
                        // expiry is a liveness tick, not an error
                        Err(_) => continue,
                    },
                    None => return ready_on(&afd, want).await,
                }
            }
        })
    })
}

#[cold]
fn connect_timeout_err(_elapsed: Duration) -> Error {
    OperationalError::new("connection attempt timed out").into()
}
