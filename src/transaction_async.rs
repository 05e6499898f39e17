//! transaction scopes for the cooperative connection.

use tracing::{debug, warn};

use crate::{
    connection::ConnState,
    connection_async::AsyncConnection,
    errors::{Error, ProgrammingError},
    pq::TransactionStatus,
    sql::Ident,
};

/// the async counterpart of [`Transaction`]. unlike the blocking scope it
/// cannot roll back from `Drop`; an unfinished scope is logged and left for
/// the next rollback or pool reset to clean up.
///
/// [`Transaction`]: crate::transaction::Transaction
pub struct AsyncTransaction<'c> {
    conn: &'c AsyncConnection,
    id: u64,
    savepoint_name: Option<String>,
    outer: bool,
    force_rollback: bool,
    finished: bool,
}

impl<'c> AsyncTransaction<'c> {
    pub(crate) async fn enter(
        conn: &'c AsyncConnection,
        savepoint_name: Option<&str>,
        force_rollback: bool,
    ) -> Result<AsyncTransaction<'c>, Error> {
        if savepoint_name == Some("") {
            return Err(ProgrammingError::new("savepoint_name must be a non-empty string").into());
        }

        let mut state = conn.lock().await;
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
            conn.exec_command(&mut state, "BEGIN").await?;
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
            conn.exec_command(&mut state, &command).await?;
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

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn savepoint_name(&self) -> Option<&str> {
        self.savepoint_name.as_deref()
    }

    pub async fn commit(mut self) -> Result<(), Error> {
        self.finished = true;
        let mut state = self.conn.lock().await;
        if self.force_rollback {
            self.exit_rollback(&mut state).await
        } else {
            self.exit_commit(&mut state).await
        }
    }

    pub async fn rollback(mut self) -> Result<(), Error> {
        self.finished = true;
        let mut state = self.conn.lock().await;
        self.exit_rollback(&mut state).await
    }

    /// leave the scope because of an error, swallowing a [`Rollback`]
    /// sentinel aimed at this scope.
    ///
    /// [`Rollback`]: crate::errors::Rollback
    pub async fn handle_error(mut self, err: Error) -> Result<(), Error> {
        self.finished = true;
        {
            let mut state = self.conn.lock().await;
            self.exit_rollback(&mut state).await?;
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

    async fn exit_commit(&self, state: &mut ConnState) -> Result<(), Error> {
        if let Some(name) = &self.savepoint_name {
            self.pop_savepoint(state, name)?;
            let command = format!("RELEASE SAVEPOINT {}", Ident(name));
            self.conn.exec_command(state, &command).await?;
        }
        if self.outer {
            self.pop_savepoint(state, "")?;
            if !state.savepoints.is_empty() {
                return Err(out_of_order());
            }
            self.conn.exec_command(state, "COMMIT").await?;
        }
        Ok(())
    }

    async fn exit_rollback(&self, state: &mut ConnState) -> Result<(), Error> {
        if let Some(name) = &self.savepoint_name {
            self.pop_savepoint(state, name)?;
            let command = format!(
                "ROLLBACK TO SAVEPOINT {n}; RELEASE SAVEPOINT {n}",
                n = Ident(name)
            );
            self.conn.exec_command(state, &command).await?;
        }
        if self.outer {
            self.pop_savepoint(state, "")?;
            if !state.savepoints.is_empty() {
                return Err(out_of_order());
            }
            self.conn.exec_command(state, "ROLLBACK").await?;
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

impl Drop for AsyncTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                "async transaction scope dropped without commit() or rollback(); \
                 the transaction stays open until rolled back"
            );
        }
    }
}
