//! transaction scopes with nestable savepoints.
//!
//! a [`Transaction`] behaves like a context: created by
//! [`Connection::transaction`], finished by [`Transaction::commit`],
//! [`Transaction::rollback`] or [`Transaction::handle_error`]. dropping an
//! unfinished scope rolls it back. the [`Rollback`] sentinel unwinds to a
//! chosen scope and is swallowed by it.
//!
//! [`Rollback`]: crate::errors::Rollback

use tracing::debug;

use crate::{
    connection::{ConnState, Connection},
    errors::{Error, ProgrammingError},
    pq::TransactionStatus,
    sql::Ident,
};

/// a scope over a database transaction, or over a savepoint when nested.
pub struct Transaction<'c> {
    conn: &'c Connection,
    id: u64,
    savepoint_name: Option<String>,
    outer: bool,
    force_rollback: bool,
    finished: bool,
}

impl<'c> Transaction<'c> {
    pub(crate) fn enter(
        conn: &'c Connection,
        savepoint_name: Option<&str>,
        force_rollback: bool,
    ) -> Result<Self, Error> {
        if savepoint_name == Some("") {
            return Err(ProgrammingError::new("savepoint_name must be a non-empty string").into());
        }

        let mut state = conn.lock();
        state.scope_counter += 1;
        let id = state.scope_counter;

        let idle = state.pgconn()?.transaction_status() == TransactionStatus::Idle;
        let (outer, savepoint_name) = if idle {
            if !state.savepoints.is_empty() {
                return Err(crate::errors::InternalError::new(
                    "savepoint stack is not empty outside a transaction",
                )
                .into());
            }
            conn.exec_command(&mut state, "BEGIN")?;
            // the sentinel name marks the outermost scope on the stack
            state.savepoints.push(String::new());
            (true, savepoint_name.map(str::to_string))
        } else {
            let name = savepoint_name
                .map(str::to_string)
                .unwrap_or_else(|| format!("_pg3_{}", state.savepoints.len() + 1));
            (false, Some(name))
        };

        if let Some(name) = &savepoint_name {
            let command = format!("SAVEPOINT {}", Ident(name));
            conn.exec_command(&mut state, &command)?;
            state.savepoints.push(name.clone());
        }

        Ok(Self {
            conn,
            id,
            savepoint_name,
            outer,
            force_rollback,
            finished: false,
        })
    }

    /// opaque identity of this scope, for [`Rollback::to`].
    ///
    /// [`Rollback::to`]: crate::errors::Rollback::to
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn savepoint_name(&self) -> Option<&str> {
        self.savepoint_name.as_deref()
    }

    /// leave the scope, committing its changes (or rolling back when the
    /// scope was created with `force_rollback`).
    pub fn commit(mut self) -> Result<(), Error> {
        self.finished = true;
        if self.force_rollback {
            let mut state = self.conn.lock();
            return self.exit_rollback(&mut state);
        }
        let mut state = self.conn.lock();
        self.exit_commit(&mut state)
    }

    /// leave the scope, discarding its changes.
    pub fn rollback(mut self) -> Result<(), Error> {
        self.finished = true;
        let mut state = self.conn.lock();
        self.exit_rollback(&mut state)
    }

    /// leave the scope because of an error. the changes are rolled back; a
    /// [`Rollback`] sentinel aimed at this scope (or at no specific scope) is
    /// swallowed, any other error propagates.
    ///
    /// [`Rollback`]: crate::errors::Rollback
    pub fn handle_error(mut self, err: Error) -> Result<(), Error> {
        self.finished = true;
        {
            let mut state = self.conn.lock();
            self.exit_rollback(&mut state)?;
        }
        match err.downcast_ref::<crate::errors::Rollback>() {
            Some(rollback) if rollback.scope.is_none() || rollback.scope == Some(self.id) => {
                debug!("explicit rollback from a transaction scope");
                Ok(())
            }
            _ => Err(err),
        }
    }

    fn pop_savepoint(&self, state: &mut ConnState, expected: &str) -> Result<(), Error> {
        match state.savepoints.pop() {
            Some(actual) if actual == expected => Ok(()),
            _ => Err(out_of_order()),
        }
    }

    fn exit_commit(&self, state: &mut ConnState) -> Result<(), Error> {
        if let Some(name) = &self.savepoint_name {
            self.pop_savepoint(state, name)?;
            let command = format!("RELEASE SAVEPOINT {}", Ident(name));
            self.conn.exec_command(state, &command)?;
        }
        if self.outer {
            self.pop_savepoint(state, "")?;
            if !state.savepoints.is_empty() {
                return Err(out_of_order());
            }
            self.conn.exec_command(state, "COMMIT")?;
        }
        Ok(())
    }

    fn exit_rollback(&self, state: &mut ConnState) -> Result<(), Error> {
        if let Some(name) = &self.savepoint_name {
            self.pop_savepoint(state, name)?;
            // releasing after the rollback keeps the server side savepoint
            // stack aligned with ours
            let command = format!(
                "ROLLBACK TO SAVEPOINT {n}; RELEASE SAVEPOINT {n}",
                n = Ident(name)
            );
            self.conn.exec_command(state, &command)?;
        }
        if self.outer {
            self.pop_savepoint(state, "")?;
            if !state.savepoints.is_empty() {
                return Err(out_of_order());
            }
            self.conn.exec_command(state, "ROLLBACK")?;
        }
        Ok(())
    }
}

#[cold]
fn out_of_order() -> Error {
    ProgrammingError::new(
        "out-of-order transaction scope exits; scopes must finish innermost first",
    )
    .into()
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut state = self.conn.lock();
        let _ = self.exit_rollback(&mut state);
    }
}
