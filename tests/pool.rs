mod common;

use std::{sync::Arc, thread, time::Duration};

use common::*;

use vireo_postgres::{
    errors::{PoolClosed, PoolTimeout, TooManyRequests},
    oids,
    pool::{AsyncPool, Pool},
    ConnectOptions, Params,
};

fn quiet_script() -> Vec<Vec<u8>> {
    vec![simple_rows(&[("one", oids::INT4_OID)], &[&[Some("1")]], "SELECT 1")]
}

fn autocommit() -> ConnectOptions {
    ConnectOptions {
        autocommit: true,
        overrides: Vec::new(),
    }
}

#[test]
fn pool_serves_and_recycles_connections() {
    let server = FakeServer::spawn(quiet_script());
    let pool = Pool::builder(&server.conninfo)
        .min_size(2)
        .connect_options(autocommit())
        .build()
        .unwrap();
    pool.wait(Duration::from_secs(5)).unwrap();

    {
        let conn = pool.connection().unwrap();
        let mut cur = conn.execute("select 1", Params::None).unwrap();
        assert_eq!(cur.fetchone().unwrap().unwrap().get_as::<i32>(0), Some(&1));
    }

    let stats = pool.get_stats();
    assert_eq!(stats["pool_min"], 2);
    assert_eq!(stats["pool_size"], 2);
    assert_eq!(stats["requests_num"], 1);
    assert!(stats["connections_num"] >= 2);

    pool.close(Duration::from_secs(5));
    assert!(pool.closed());
    // closing twice is a no-op, reopening is not possible
    pool.close(Duration::from_secs(1));
    assert!(pool.open(false, Duration::from_secs(1)).is_err());
}

#[test]
fn saturated_pool_times_out_waiting_clients() {
    let server = FakeServer::spawn(quiet_script());
    let pool = Pool::builder(&server.conninfo)
        .min_size(2)
        .max_size(2)
        .timeout(Duration::from_millis(100))
        .connect_options(autocommit())
        .build()
        .unwrap();
    pool.wait(Duration::from_secs(5)).unwrap();

    let pool = Arc::new(pool);
    let mut handles = Vec::new();
    for _ in 0..4 {
        let pool = pool.clone();
        handles.push(thread::spawn(move || match pool.getconn(None) {
            Ok(conn) => {
                thread::sleep(Duration::from_millis(300));
                drop(conn);
                true
            }
            Err(err) => {
                assert!(err.downcast_ref::<PoolTimeout>().is_some());
                false
            }
        }));
    }

    let outcomes: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 2);
    assert_eq!(outcomes.iter().filter(|ok| !**ok).count(), 2);
    assert_eq!(pool.get_stats()["requests_errors"], 2);
}

#[test]
fn max_waiting_rejects_excess_clients() {
    let server = FakeServer::spawn(quiet_script());
    let pool = Pool::builder(&server.conninfo)
        .min_size(1)
        .max_size(1)
        .max_waiting(1)
        .timeout(Duration::from_millis(200))
        .connect_options(autocommit())
        .build()
        .unwrap();
    pool.wait(Duration::from_secs(5)).unwrap();

    let held = pool.connection().unwrap();

    // one client may queue; the second is turned away immediately
    let pool2 = pool.clone();
    let waiter = thread::spawn(move || pool2.getconn(None));
    thread::sleep(Duration::from_millis(50));

    let err = pool.getconn(None).unwrap_err();
    assert!(err.downcast_ref::<TooManyRequests>().is_some());

    drop(held);
    assert!(waiter.join().unwrap().is_ok());
}

#[test]
fn closed_pool_fails_fast_and_fails_waiters() {
    let server = FakeServer::spawn(quiet_script());
    let pool = Pool::builder(&server.conninfo)
        .min_size(1)
        .connect_options(autocommit())
        .build()
        .unwrap();
    pool.wait(Duration::from_secs(5)).unwrap();

    let held = pool.connection().unwrap();
    let pool2 = pool.clone();
    let waiter = thread::spawn(move || pool2.getconn(Some(Duration::from_secs(5))));
    thread::sleep(Duration::from_millis(50));

    pool.close(Duration::from_secs(5));

    let err = waiter.join().unwrap().unwrap_err();
    assert!(err.downcast_ref::<PoolClosed>().is_some());
    assert!(pool.getconn(None).is_err());

    // the held connection goes back to a closed pool and is closed there
    drop(held);
}

#[test]
fn resize_grows_toward_the_new_floor() {
    let server = FakeServer::spawn(quiet_script());
    let pool = Pool::builder(&server.conninfo)
        .min_size(1)
        .connect_options(autocommit())
        .build()
        .unwrap();
    pool.wait(Duration::from_secs(5)).unwrap();

    pool.resize(3, Some(6)).unwrap();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let stats = pool.get_stats();
        if stats["pool_available"] >= 3 {
            assert_eq!(stats["pool_min"], 3);
            assert_eq!(stats["pool_max"], 6);
            break;
        }
        assert!(std::time::Instant::now() < deadline, "pool never grew");
        thread::sleep(Duration::from_millis(20));
    }

    // same-size resize is a no-op
    pool.resize(3, Some(6)).unwrap();
    assert_eq!(pool.get_stats()["pool_min"], 3);
    assert!(pool.resize(4, Some(2)).is_err());
}

#[test]
fn broken_connection_is_replaced_on_return() {
    let server = FakeServer::spawn(quiet_script());
    let pool = Pool::builder(&server.conninfo)
        .min_size(1)
        .connect_options(autocommit())
        .build()
        .unwrap();
    pool.wait(Duration::from_secs(5)).unwrap();

    {
        let conn = pool.connection().unwrap();
        // break the connection while checked out
        conn.close();
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let stats = pool.get_stats();
        if stats["returns_bad"] == 1 && stats["pool_available"] >= 1 {
            // nconns is unchanged: a replacement was enqueued for the slot
            assert_eq!(stats["pool_size"], 1);
            break;
        }
        assert!(std::time::Instant::now() < deadline, "replacement never arrived");
        thread::sleep(Duration::from_millis(20));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn async_pool_round_trip() {
    let server = FakeServer::spawn(quiet_script());
    let pool = AsyncPool::builder(&server.conninfo)
        .min_size(2)
        .connect_options(autocommit())
        .build()
        .unwrap();
    pool.wait(Duration::from_secs(5)).await.unwrap();

    {
        let conn = pool.connection().await.unwrap();
        let mut cur = conn.execute("select 1", Params::None).await.unwrap();
        assert_eq!(cur.fetchone().unwrap().unwrap().get_as::<i32>(0), Some(&1));
    }

    let stats = pool.get_stats();
    assert_eq!(stats["pool_min"], 2);
    assert_eq!(stats["requests_num"], 1);

    pool.close(Duration::from_secs(5)).await;
    assert!(pool.closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn async_pool_timeout_under_saturation() {
    let server = FakeServer::spawn(quiet_script());
    let pool = AsyncPool::builder(&server.conninfo)
        .min_size(2)
        .max_size(2)
        .timeout(Duration::from_millis(100))
        .connect_options(autocommit())
        .build()
        .unwrap();
    pool.wait(Duration::from_secs(5)).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            match pool.getconn(None).await {
                Ok(conn) => {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    drop(conn);
                    true
                }
                Err(err) => {
                    assert!(err.downcast_ref::<PoolTimeout>().is_some());
                    false
                }
            }
        }));
    }

    let mut ok = 0;
    let mut timed_out = 0;
    for handle in handles {
        if handle.await.unwrap() {
            ok += 1;
        } else {
            timed_out += 1;
        }
    }
    assert_eq!(ok, 2);
    assert_eq!(timed_out, 2);
    assert_eq!(pool.get_stats()["requests_errors"], 2);
}
