//! thin value adding shim over the wire protocol.
//!
//! [`PgConn`] owns a non blocking socket and exposes the primitives the
//! resumable operations in [`machine`] are built from: enqueue a request,
//! flush, consume input, pop buffered results. nothing in this module blocks;
//! readiness is the caller's problem.
//!
//! [`machine`]: crate::machine

mod cancel;
mod handle;
mod result;
mod startup;

pub use self::{
    cancel::PgCancel,
    handle::{FlushStatus, PgConn, PutStatus},
    result::{FieldDescription, PgResult},
};

use bytes::Bytes;

/// connection status of a [`PgConn`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    /// handshake completed, connection usable.
    Ok,
    /// handshake still in progress.
    Started,
    /// connection failed or was closed.
    Bad,
}

/// outcome of one [`PgConn::connect_poll`] step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollingStatus {
    /// handshake complete.
    Ok,
    /// wait for the socket to become readable, then poll again.
    Reading,
    /// wait for the socket to become writable, then poll again.
    Writing,
    /// handshake failed. consult [`PgConn::error_message`].
    Failed,
}

/// status of a [`PgResult`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    EmptyQuery,
    CommandOk,
    TuplesOk,
    CopyIn,
    CopyOut,
    CopyBoth,
    FatalError,
    SingleTuple,
    BadResponse,
    NonfatalError,
}

/// server reported transaction status, refreshed on every ReadyForQuery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// not in a transaction.
    Idle,
    /// a command is in flight.
    Active,
    /// in a transaction block.
    InTrans,
    /// in a failed transaction block.
    InError,
    /// the connection is broken.
    Unknown,
}

/// wire format of a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Text,
    Binary,
}

impl Format {
    pub(crate) fn to_i16(self) -> i16 {
        match self {
            Self::Text => 0,
            Self::Binary => 1,
        }
    }

    pub(crate) fn from_i16(fmt: i16) -> Self {
        match fmt {
            1 => Self::Binary,
            _ => Self::Text,
        }
    }
}

/// an asynchronous notification received through `LISTEN`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notify {
    /// the channel the notification was sent on.
    pub channel: String,
    /// the payload. empty when not given.
    pub payload: String,
    /// process id of the notifying backend.
    pub pid: i32,
}

/// outcome of a [`PgConn::get_copy_data`] call.
#[derive(Debug)]
pub enum CopyData {
    /// one data chunk.
    Data(Bytes),
    /// no data buffered yet; wait for readability.
    WouldBlock,
    /// the copy stream ended; collect the final result.
    Done,
}
