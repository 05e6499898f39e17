#![doc = include_str!("../README.md")]
#![forbid(unsafe_code)]

mod column;
mod cursor;
mod cursor_async;
mod machine;
mod prepare;
mod rows;
mod transaction;
mod transaction_async;
mod transform;
mod value;

pub mod adapt;
pub mod conninfo;
pub mod connection;
pub mod connection_async;
pub mod copy;
pub mod copy_async;
pub mod errors;
pub mod oids;
pub mod pool;
pub mod pq;
pub mod queries;
pub mod sql;
pub mod typeinfo;
pub mod types;
pub mod waiting;

pub use self::{
    column::Column,
    connection::{connect, ConnectOptions, Connection},
    connection_async::AsyncConnection,
    copy::Copy,
    copy_async::AsyncCopy,
    cursor::{Cursor, RowStream, ScrollMode, ServerCursor},
    cursor_async::{AsyncCursor, AsyncRowStream, AsyncServerCursor},
    errors::{DbError, Diagnostic, Error, ErrorKind, Rollback},
    pq::{Format, Notify, TransactionStatus},
    queries::Params,
    rows::{Row, RowFactory},
    transaction::Transaction,
    transaction_async::AsyncTransaction,
    transform::Transformer,
    types::{PgArray, PgRange},
    value::SqlValue,
};

/// traits and hooks for extending the adaptation layer from an external
/// crate.
pub mod dev {
    pub use crate::adapt::{
        AdaptContext, AdaptersMap, Dumper, DumperEntry, DumperKey, Loader, LoaderEntry, ParamFormat,
    };
    pub use crate::machine::{ConnStep, Connect, Machine, Step};
    pub use crate::value::{downcast, ListValue, RangeView};
    pub use crate::waiting::{Ready, Wait};
}

fn _assert_send<T: Send>() {}

#[allow(dead_code)]
fn _assert_public_types_send() {
    _assert_send::<Connection>();
    _assert_send::<AsyncConnection>();
    _assert_send::<pool::Pool>();
    _assert_send::<pool::AsyncPool>();
    _assert_send::<Error>();
}
