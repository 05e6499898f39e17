//! library error types and the taxonomy used to classify server errors.

use core::{
    fmt,
    ops::{Deref, DerefMut},
};

use std::{error, io, sync::Arc};

use fallible_iterator::FallibleIterator;
use postgres_protocol::message::backend::ErrorFields;

/// public facing error type. providing basic format and display based error handling.
///
/// for typed based error handling runtime type cast is needed with the help of other
/// public error types offered by this module, or through [`Error::kind`].
///
/// # Example
/// ```rust
/// use vireo_postgres::errors::{DbError, Error};
///
/// fn constraint_name(e: &Error) -> Option<String> {
///     // downcast error to DbError to access server side diagnostic.
///     e.downcast_ref::<DbError>()
///         .and_then(|e| e.diagnostic().constraint_name().map(String::from))
/// }
/// ```
pub struct Error(Box<dyn error::Error + Send + Sync>);

/// Coarse classification of an [`Error`].
///
/// Server errors are classified from the first two characters of their
/// SQLSTATE; client side errors carry their kind directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// non fatal advisory. reserved, never raised by this crate.
    Warning,
    /// client side API misuse that is not a programming error: no result available,
    /// column out of range, unknown oid when a loader is demanded.
    Interface,
    /// invalid data handled by the server (SQLSTATE class 22).
    Data,
    /// constraint violation (SQLSTATE class 23).
    Integrity,
    /// environmental failure: connection lost, pool closed or saturated,
    /// SQLSTATE classes 08, 53, 54, 55, 57, 58.
    Operational,
    /// broken client side invariant or server internal error
    /// (SQLSTATE classes XX, 24, 25).
    Internal,
    /// misuse of the API or invalid SQL
    /// (SQLSTATE classes 42, 26, 34, 3D, 3F, 44, P0).
    Programming,
    /// feature not supported by the server (SQLSTATE class 0A) or by this crate.
    NotSupported,
    /// any other server originated error.
    Database,
}

impl Error {
    /// classify the error into the coarse taxonomy.
    pub fn kind(&self) -> ErrorKind {
        if let Some(e) = self.0.downcast_ref::<DbError>() {
            return e.kind();
        }
        if self.0.is::<InterfaceError>() {
            ErrorKind::Interface
        } else if self.0.is::<ProgrammingError>() {
            ErrorKind::Programming
        } else if self.0.is::<NotSupportedError>() {
            ErrorKind::NotSupported
        } else if self.0.is::<InternalError>() {
            ErrorKind::Internal
        } else if self.0.is::<PoolClosed>() || self.0.is::<PoolTimeout>() || self.0.is::<TooManyRequests>() {
            ErrorKind::Operational
        } else {
            ErrorKind::Operational
        }
    }

    /// true when the error is the out of band cancellation of an in flight query.
    pub fn is_query_canceled(&self) -> bool {
        self.0
            .downcast_ref::<DbError>()
            .map(|e| e.sqlstate() == SqlState::QUERY_CANCELED)
            .unwrap_or(false)
    }

    pub(crate) fn closed() -> Self {
        OperationalError::new("the connection is closed").into()
    }

    #[cold]
    #[inline(never)]
    pub(crate) fn unexpected() -> Self {
        InternalError::new("unexpected message from server").into()
    }
}

impl Deref for Error {
    type Target = dyn error::Error + Send + Sync;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl DerefMut for Error {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.0
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.0.source()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self(Box::new(e))
    }
}

macro_rules! message_error {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $name(Box<str>);

        impl $name {
            pub(crate) fn new(msg: impl Into<Box<str>>) -> Self {
                Self(msg.into())
            }

            pub fn message(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl error::Error for $name {}

        impl From<$name> for Error {
            fn from(e: $name) -> Self {
                Self(Box::new(e))
            }
        }
    };
}

message_error! {
    /// client side misuse that is not a programming error: no result available,
    /// column index out of range, adapting a value the registry has no entry for.
    InterfaceError
}

message_error! {
    /// misuse of the API: placeholder/parameter mismatch, commit inside a
    /// transaction scope, `COPY` through `execute`.
    ProgrammingError
}

message_error! {
    /// environmental failure: connection refused or lost, send on a closed handle.
    OperationalError
}

message_error! {
    /// a client side invariant was broken, e.g. no result arrived after a
    /// successful send.
    InternalError
}

message_error! {
    /// the requested operation is not supported, e.g. `executemany` on a
    /// server side cursor.
    NotSupportedError
}

/// error raised by [`Pool::getconn`] when the pool is closed or not yet open.
///
/// [`Pool::getconn`]: crate::pool::Pool::getconn
#[derive(Debug)]
pub struct PoolClosed;

impl fmt::Display for PoolClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("the pool is closed")
    }
}

impl error::Error for PoolClosed {}

impl From<PoolClosed> for Error {
    fn from(e: PoolClosed) -> Self {
        Self(Box::new(e))
    }
}

/// error raised when no connection became available within the requested timeout.
#[derive(Debug)]
pub struct PoolTimeout {
    pub(crate) elapsed: std::time::Duration,
}

impl fmt::Display for PoolTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "couldn't get a connection after {:?}", self.elapsed)
    }
}

impl error::Error for PoolTimeout {}

impl From<PoolTimeout> for Error {
    fn from(e: PoolTimeout) -> Self {
        Self(Box::new(e))
    }
}

/// error raised when the pool's waiting queue is already at `max_waiting`.
#[derive(Debug)]
pub struct TooManyRequests {
    pub(crate) waiting: usize,
}

impl fmt::Display for TooManyRequests {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "the pool already has {} requests waiting", self.waiting)
    }
}

impl error::Error for TooManyRequests {}

impl From<TooManyRequests> for Error {
    fn from(e: TooManyRequests) -> Self {
        Self(Box::new(e))
    }
}

/// A SQLSTATE error code.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SqlState([u8; 5]);

impl SqlState {
    pub const QUERY_CANCELED: SqlState = SqlState(*b"57014");
    pub const UNDEFINED_TABLE: SqlState = SqlState(*b"42P01");
    pub const UNIQUE_VIOLATION: SqlState = SqlState(*b"23505");
    pub const ADMIN_SHUTDOWN: SqlState = SqlState(*b"57P01");
    pub const CRASH_SHUTDOWN: SqlState = SqlState(*b"57P02");
    pub const CANNOT_CONNECT_NOW: SqlState = SqlState(*b"57P03");
    pub const IDLE_SESSION_TIMEOUT: SqlState = SqlState(*b"57P05");

    pub(crate) fn from_code(code: &str) -> Self {
        let mut buf = *b"XX000";
        let bytes = code.as_bytes();
        if bytes.len() == 5 {
            buf.copy_from_slice(bytes);
        }
        Self(buf)
    }

    /// the five character error code.
    pub fn code(&self) -> &str {
        // constructed from valid str only
        core::str::from_utf8(&self.0).unwrap_or("XX000")
    }

    /// the two character class the code belongs to.
    pub fn class(&self) -> &str {
        &self.code()[..2]
    }

    pub(crate) fn kind(&self) -> ErrorKind {
        match &self.0[..2] {
            b"22" => ErrorKind::Data,
            b"23" => ErrorKind::Integrity,
            b"08" | b"53" | b"54" | b"55" | b"57" | b"58" | b"F0" => ErrorKind::Operational,
            b"XX" | b"24" | b"25" => ErrorKind::Internal,
            b"42" | b"26" | b"34" | b"3D" | b"3F" | b"44" | b"P0" => ErrorKind::Programming,
            b"0A" => ErrorKind::NotSupported,
            _ => ErrorKind::Database,
        }
    }
}

impl fmt::Debug for SqlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SqlState").field(&self.code()).finish()
    }
}

impl fmt::Display for SqlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// structured accessors over the raw diagnostic fields of a server error or notice.
///
/// field values are decoded with the connection's client encoding; the crate
/// talks to the server in utf8 so lossy utf8 decoding is applied.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Diagnostic {
    severity: Option<String>,
    severity_nonlocalized: Option<String>,
    sqlstate: Option<String>,
    message_primary: Option<String>,
    message_detail: Option<String>,
    message_hint: Option<String>,
    statement_position: Option<String>,
    internal_position: Option<String>,
    internal_query: Option<String>,
    context: Option<String>,
    schema_name: Option<String>,
    table_name: Option<String>,
    column_name: Option<String>,
    datatype_name: Option<String>,
    constraint_name: Option<String>,
    source_file: Option<String>,
    source_line: Option<String>,
    source_function: Option<String>,
}

macro_rules! diag_field {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        pub fn $name(&self) -> Option<&str> {
            self.$name.as_deref()
        }
    };
}

impl Diagnostic {
    pub(crate) fn parse(fields: &mut ErrorFields<'_>) -> io::Result<Self> {
        let mut diag = Diagnostic::default();
        while let Some(field) = fields.next()? {
            let value = String::from_utf8_lossy(field.value_bytes()).into_owned();
            match field.type_() {
                b'S' => diag.severity = Some(value),
                b'V' => diag.severity_nonlocalized = Some(value),
                b'C' => diag.sqlstate = Some(value),
                b'M' => diag.message_primary = Some(value),
                b'D' => diag.message_detail = Some(value),
                b'H' => diag.message_hint = Some(value),
                b'P' => diag.statement_position = Some(value),
                b'p' => diag.internal_position = Some(value),
                b'q' => diag.internal_query = Some(value),
                b'W' => diag.context = Some(value),
                b's' => diag.schema_name = Some(value),
                b't' => diag.table_name = Some(value),
                b'c' => diag.column_name = Some(value),
                b'd' => diag.datatype_name = Some(value),
                b'n' => diag.constraint_name = Some(value),
                b'F' => diag.source_file = Some(value),
                b'L' => diag.source_line = Some(value),
                b'R' => diag.source_function = Some(value),
                _ => {}
            }
        }
        Ok(diag)
    }

    diag_field! {
        /// ERROR, FATAL or PANIC for errors; WARNING, NOTICE, DEBUG, INFO or LOG
        /// for notices. possibly localized.
        severity
    }
    diag_field! {
        /// non localized severity. (PostgreSQL 9.6+)
        severity_nonlocalized
    }
    diag_field! {
        /// the SQLSTATE code of the error.
        sqlstate
    }
    diag_field! {
        /// the primary human readable message, typically one line.
        message_primary
    }
    diag_field! {
        /// secondary message carrying more detail, possibly multi line.
        message_detail
    }
    diag_field! {
        /// a suggestion on how to address the problem, possibly multi line.
        message_hint
    }
    diag_field! {
        /// error cursor position as an index into the original statement.
        statement_position
    }
    diag_field! {
        /// error cursor position into an internally generated query.
        internal_position
    }
    diag_field! {
        /// the text of the internally generated query, when `internal_position` is set.
        internal_query
    }
    diag_field! {
        /// call stack context of the error, one entry per line, most recent first.
        context
    }
    diag_field! {
        /// schema of the object associated with the error. (PostgreSQL 9.3+)
        schema_name
    }
    diag_field! {
        /// table associated with the error. (PostgreSQL 9.3+)
        table_name
    }
    diag_field! {
        /// column associated with the error. (PostgreSQL 9.3+)
        column_name
    }
    diag_field! {
        /// data type associated with the error. (PostgreSQL 9.3+)
        datatype_name
    }
    diag_field! {
        /// constraint associated with the error. (PostgreSQL 9.3+)
        constraint_name
    }
    diag_field! {
        /// source file where the error was reported.
        source_file
    }
    diag_field! {
        /// source line where the error was reported.
        source_line
    }
    diag_field! {
        /// source routine reporting the error.
        source_function
    }
}

/// A Postgres server error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbError {
    sqlstate: SqlState,
    message: String,
    diagnostic: Arc<Diagnostic>,
}

impl DbError {
    pub(crate) fn new(diagnostic: Diagnostic) -> Self {
        let sqlstate = diagnostic
            .sqlstate()
            .map(SqlState::from_code)
            .unwrap_or_else(|| SqlState::from_code("XX000"));
        let message = diagnostic
            .message_primary()
            .unwrap_or("unknown error")
            .to_string();
        Self {
            sqlstate,
            message,
            diagnostic: Arc::new(diagnostic),
        }
    }

    #[cold]
    #[inline(never)]
    pub(crate) fn parse(fields: &mut ErrorFields<'_>) -> io::Result<Self> {
        Diagnostic::parse(fields).map(Self::new)
    }

    /// the SQLSTATE code of the error.
    pub fn sqlstate(&self) -> SqlState {
        self.sqlstate.clone()
    }

    /// the primary human readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// the full diagnostic view over the error fields.
    pub fn diagnostic(&self) -> &Diagnostic {
        &self.diagnostic
    }

    /// the taxonomy kind derived from the SQLSTATE class.
    pub fn kind(&self) -> ErrorKind {
        self.sqlstate.kind()
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}",
            self.diagnostic.severity().unwrap_or("ERROR"),
            self.message
        )?;
        if let Some(detail) = self.diagnostic.message_detail() {
            write!(f, "\nDETAIL: {detail}")?;
        }
        if let Some(hint) = self.diagnostic.message_hint() {
            write!(f, "\nHINT: {hint}")?;
        }
        Ok(())
    }
}

impl error::Error for DbError {}

impl From<DbError> for Error {
    fn from(e: DbError) -> Self {
        Self(Box::new(e))
    }
}

/// Sentinel error used to exit a [`Transaction`] scope immediately, rolling back
/// any change made within it without propagating an error to the caller.
///
/// Carries the id of the scope to unwind to; `None` unwinds the innermost scope.
///
/// [`Transaction`]: crate::transaction::Transaction
#[derive(Debug)]
pub struct Rollback {
    pub(crate) scope: Option<u64>,
}

impl Rollback {
    /// roll back the innermost enclosing transaction scope.
    pub fn innermost() -> Self {
        Self { scope: None }
    }

    /// roll back up to and including the given scope.
    pub fn to(scope: &crate::transaction::Transaction<'_>) -> Self {
        Self {
            scope: Some(scope.id()),
        }
    }
}

impl fmt::Display for Rollback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("rollback requested from within a transaction scope")
    }
}

impl error::Error for Rollback {}

impl From<Rollback> for Error {
    fn from(e: Rollback) -> Self {
        Self(Box::new(e))
    }
}

#[cold]
#[inline(never)]
pub(crate) fn unexpected_eof_err() -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "zero byte read. remote close connection unexpectedly",
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sqlstate_classification() {
        assert_eq!(SqlState::from_code("22012").kind(), ErrorKind::Data);
        assert_eq!(SqlState::from_code("23505").kind(), ErrorKind::Integrity);
        assert_eq!(SqlState::from_code("08006").kind(), ErrorKind::Operational);
        assert_eq!(SqlState::from_code("57014").kind(), ErrorKind::Operational);
        assert_eq!(SqlState::from_code("42601").kind(), ErrorKind::Programming);
        assert_eq!(SqlState::from_code("P0001").kind(), ErrorKind::Programming);
        assert_eq!(SqlState::from_code("0A000").kind(), ErrorKind::NotSupported);
        assert_eq!(SqlState::from_code("XX000").kind(), ErrorKind::Internal);
        assert_eq!(SqlState::from_code("2D000").kind(), ErrorKind::Database);
    }

    #[test]
    fn sqlstate_garbage_code() {
        assert_eq!(SqlState::from_code("bogus").code(), "XX000");
    }

    #[test]
    fn error_kind_from_client_errors() {
        let e = Error::from(ProgrammingError::new("nope"));
        assert_eq!(e.kind(), ErrorKind::Programming);
        let e = Error::from(PoolClosed);
        assert_eq!(e.kind(), ErrorKind::Operational);
    }
}
