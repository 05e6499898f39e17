mod common;

use common::*;

use vireo_postgres::{
    oids, ConnectOptions, Connection, ErrorKind, Params, ScrollMode, SqlValue, TransactionStatus,
};

// autocommit keeps the scripted exchanges one to one with the statements;
// the implicit BEGIN of transactional mode is covered by the scope tests
fn connect(server: &FakeServer) -> Connection {
    Connection::connect_opts(
        &server.conninfo,
        ConnectOptions {
            autocommit: true,
            overrides: Vec::new(),
        },
    )
    .unwrap()
}

#[test]
fn connect_and_select() {
    let server = FakeServer::spawn(vec![simple_rows(
        &[("a", oids::INT4_OID), ("b", oids::TEXT_OID), ("c", oids::TEXT_OID)],
        &[&[Some("1"), Some("foo"), None]],
        "SELECT 1",
    )]);

    let conn = connect(&server);
    assert_eq!(conn.backend_pid(), Some(4242));
    assert_eq!(conn.server_version().as_deref(), Some("16.0"));
    assert_eq!(conn.client_encoding().as_deref(), Some("UTF8"));

    let mut cur = conn.execute("select a, b, c from t", Params::None).unwrap();
    assert_eq!(cur.rowcount(), 1);

    let row = cur.fetchone().unwrap().expect("one row");
    assert_eq!(row.get_as::<i32>(0), Some(&1));
    assert_eq!(row.get_as::<String>(1).map(String::as_str), Some("foo"));
    assert!(row.get(2).is_none());
    assert_eq!(row.columns()[1].name(), "b");

    assert!(cur.fetchone().unwrap().is_none());
    conn.close();
}

#[test]
fn select_with_parameters_uses_the_extended_protocol() {
    let server = FakeServer::spawn(vec![extended_rows(
        &[("x", oids::INT8_OID)],
        &[&[Some("41")]],
        "SELECT 1",
    )]);

    let conn = connect(&server);
    let one = 41i64;
    let params: [&dyn SqlValue; 1] = [&one];
    let mut cur = conn.execute("select %s", Params::Positional(&params)).unwrap();

    assert_eq!(cur.query(), Some(&b"select $1"[..]));
    assert_eq!(cur.params().map(<[_]>::len), Some(1));

    let row = cur.fetchone().unwrap().expect("one row");
    assert_eq!(row.get_as::<i64>(0), Some(&41));
}

#[test]
fn fetch_variants_and_scroll() {
    let server = FakeServer::spawn(vec![simple_rows(
        &[("n", oids::INT4_OID)],
        &[&[Some("1")], &[Some("2")], &[Some("3")], &[Some("4")], &[Some("5")]],
        "SELECT 5",
    )]);

    let conn = connect(&server);
    let mut cur = conn.execute("select n from t", Params::None).unwrap();

    // fetchmany(0) returns nothing and stays put
    assert!(cur.fetchmany(Some(0)).unwrap().is_empty());

    let two = cur.fetchmany(Some(2)).unwrap();
    assert_eq!(two.len(), 2);
    assert_eq!(two[1].get_as::<i32>(0), Some(&2));

    cur.scroll(0, ScrollMode::Absolute).unwrap();
    let all = cur.fetchall().unwrap();
    assert_eq!(all.len(), 5);

    // out of range scroll fails without moving
    let err = cur.scroll(10, ScrollMode::Absolute).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Interface);
    cur.scroll(-5, ScrollMode::Relative).unwrap();
    assert_eq!(cur.fetchone().unwrap().unwrap().get_as::<i32>(0), Some(&1));
}

#[test]
fn multi_statement_scripts_produce_result_sets() {
    let mut response = row_description(&[("a", oids::INT4_OID)]);
    response.extend_from_slice(&data_row(&[Some("1")]));
    response.extend_from_slice(&command_complete("SELECT 1"));
    response.extend_from_slice(&row_description(&[("b", oids::INT4_OID)]));
    response.extend_from_slice(&data_row(&[Some("2")]));
    response.extend_from_slice(&command_complete("SELECT 1"));
    response.extend_from_slice(&ready_for_query(b'I'));
    let server = FakeServer::spawn(vec![response]);

    let conn = connect(&server);
    let mut cur = conn.execute("select 1; select 2", Params::None).unwrap();

    assert_eq!(cur.fetchone().unwrap().unwrap().get_as::<i32>(0), Some(&1));
    assert!(cur.nextset().unwrap());
    assert_eq!(cur.fetchone().unwrap().unwrap().get_as::<i32>(0), Some(&2));
    assert!(!cur.nextset().unwrap());
}

#[test]
fn server_errors_carry_their_diagnostic() {
    let mut response = error_response("42P01", "relation \"missing\" does not exist");
    response.extend_from_slice(&ready_for_query(b'I'));
    let server = FakeServer::spawn(vec![response]);

    let conn = connect(&server);
    let err = conn.execute("select * from missing", Params::None).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Programming);
    let db = err.downcast_ref::<vireo_postgres::DbError>().expect("a server error");
    assert_eq!(db.sqlstate().code(), "42P01");
    assert!(db.diagnostic().message_primary().unwrap().contains("missing"));
}

#[test]
fn transaction_scope_commits_and_reports_idle() {
    let server = FakeServer::spawn(vec![
        simple_command("BEGIN", b'T'),
        simple_command("COMMIT", b'I'),
    ]);

    let conn = connect(&server);
    let tx = conn.transaction().unwrap();
    assert_eq!(conn.transaction_status(), TransactionStatus::InTrans);
    // commit inside a scope is forbidden
    let err = conn.commit().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Programming);
    tx.commit().unwrap();
    assert_eq!(conn.transaction_status(), TransactionStatus::Idle);
}

#[test]
fn nested_transaction_scopes_use_savepoints() {
    let server = FakeServer::spawn(vec![
        simple_command("BEGIN", b'T'),
        simple_command("SAVEPOINT", b'T'),
        // rollback to + release travel as one batch
        {
            let mut r = command_complete("ROLLBACK");
            r.extend_from_slice(&command_complete("RELEASE"));
            r.extend_from_slice(&ready_for_query(b'T'));
            r
        },
        simple_command("COMMIT", b'I'),
    ]);

    let conn = connect(&server);
    let outer = conn.transaction().unwrap();

    let inner = conn.transaction().unwrap();
    assert_eq!(inner.savepoint_name(), Some("_pg3_2"));
    let sentinel = vireo_postgres::Error::from(vireo_postgres::Rollback::to(&inner));
    // the sentinel is swallowed by the scope it names
    inner.handle_error(sentinel).unwrap();

    outer.commit().unwrap();
    assert_eq!(conn.transaction_status(), TransactionStatus::Idle);
}

#[test]
fn autocommit_flip_guards() {
    let server = FakeServer::spawn(vec![simple_command("BEGIN", b'T')]);
    let conn = connect(&server);

    conn.set_autocommit(false).unwrap();
    conn.set_autocommit(true).unwrap();

    let _tx = conn.transaction().unwrap();
    let err = conn.set_autocommit(true).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Programming);
    // leave the scope un-exited; dropping it rolls back best effort
}

#[test]
fn notices_reach_registered_handlers() {
    use std::sync::{Arc, Mutex};

    // a notice travels in front of the command completion
    let mut response = Vec::new();
    let mut notice = Vec::new();
    for (field, value) in [(b'S', "NOTICE"), (b'C', "00000"), (b'M', "heads up")] {
        notice.push(field);
        notice.extend_from_slice(value.as_bytes());
        notice.push(0);
    }
    notice.push(0);
    response.push(b'N');
    response.extend_from_slice(&((notice.len() as u32 + 4).to_be_bytes()));
    response.extend_from_slice(&notice);
    response.extend_from_slice(&simple_rows(&[("a", oids::INT4_OID)], &[&[Some("1")]], "SELECT 1"));
    let server = FakeServer::spawn(vec![response]);

    let conn = connect(&server);
    let seen: Arc<Mutex<Vec<String>>> = Arc::default();
    let sink = seen.clone();
    conn.add_notice_handler(Arc::new(move |diag| {
        sink.lock()
            .unwrap()
            .push(diag.message_primary().unwrap_or_default().to_string());
    }));

    conn.execute("select 1", Params::None).unwrap();
    assert_eq!(seen.lock().unwrap().as_slice(), ["heads up"]);
}

#[tokio::test]
async fn async_connection_mirrors_the_blocking_one() {
    let server = FakeServer::spawn(vec![extended_rows(
        &[("x", oids::INT4_OID)],
        &[&[Some("7")]],
        "SELECT 1",
    )]);

    let conn = vireo_postgres::AsyncConnection::connect_opts(
        &server.conninfo,
        ConnectOptions {
            autocommit: true,
            overrides: Vec::new(),
        },
    )
    .await
    .unwrap();
    let seven = 7i64;
    let params: [&dyn SqlValue; 1] = [&seven];
    let mut cur = conn.execute("select %s", Params::Positional(&params)).await.unwrap();
    let row = cur.fetchone().unwrap().expect("one row");
    assert_eq!(row.get_as::<i32>(0), Some(&7));
    conn.close().await;
}
