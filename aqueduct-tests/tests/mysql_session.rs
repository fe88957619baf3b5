//! Integration tests for the MySQL pool, monadic session and shape
//! adaptors against a real MySQL testcontainer.
//!
//! A single container is shared across all tests using the `ctor` pattern:
//! the container lives in a dedicated thread with its own runtime, tests
//! run sequentially with `serial_test`, and `shutdown_hooks` signals the
//! thread to stop on process exit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use ctor::ctor;
use serial_test::serial;
use testcontainers::{runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::mysql::Mysql;

use aqueduct::{codes, zip4, MonadicSession, MySqlPool, MysqlConfig};

static DB_PORT: OnceLock<u16> = OnceLock::new();
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn cleanup_on_exit() {
    SHUTDOWN.store(true, Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(500));
}

#[ctor]
fn setup_container() {
    shutdown_hooks::add_shutdown_hook(cleanup_on_exit);
    let (ready_tx, ready_rx) = std::sync::mpsc::channel();

    thread::spawn(move || {
        let rt = tokio::runtime::Runtime::new().expect("container runtime");
        rt.block_on(async {
            let container: ContainerAsync<Mysql> =
                Mysql::default().start().await.expect("start mysql container");
            let port = container.get_host_port_ipv4(3306).await.expect("mapped port");

            // create the schema once, through the stack under test
            let pool = Arc::new(
                MySqlPool::from_config(&test_config(port)).expect("schema pool"),
            );
            let session = MonadicSession::new(Arc::clone(&pool));
            let state = session
                .run_query(
                    "CREATE TABLE IF NOT EXISTS app_users (\
                       id BIGINT AUTO_INCREMENT PRIMARY KEY,\
                       name VARCHAR(100) NOT NULL,\
                       email VARCHAR(100) NULL,\
                       state VARCHAR(20) NOT NULL DEFAULT 'active'\
                     )",
                )
                .run()
                .await
                .expect("schema query");
            assert!(!state.has_error(), "schema failed: {}", state.diagnostics());
            drop(state);
            drop(session);
            pool.stop().await;

            ready_tx.send(port).expect("signal ready");
            while !SHUTDOWN.load(Ordering::Relaxed) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            // container drops here, stopping it
        });
    });

    let port = ready_rx.recv().expect("container ready");
    DB_PORT.set(port).expect("port set once");
}

fn test_config(port: u16) -> MysqlConfig {
    aqueduct_tests::mysql_config("127.0.0.1", port, "root", "", "test")
}

fn db_port() -> u16 {
    *DB_PORT.get().expect("container not initialized")
}

async fn new_session() -> (Arc<MySqlPool>, MonadicSession) {
    aqueduct_tests::init_tracing();
    let pool = Arc::new(MySqlPool::from_config(&test_config(db_port())).expect("pool"));
    let session = MonadicSession::new(Arc::clone(&pool));
    let state = session
        .run_query("DELETE FROM app_users")
        .run()
        .await
        .expect("reset table");
    assert!(!state.has_error(), "reset failed: {}", state.diagnostics());
    (pool, session)
}

#[tokio::test]
#[serial]
async fn insert_count_delete_round_trip() {
    let (pool, session) = new_session().await;

    let state = session
        .run_query(
            "INSERT INTO app_users (name, email) VALUES ('ada', 'ada@example.com');\
             SELECT LAST_INSERT_ID();\
             SELECT COUNT(*) FROM app_users WHERE name = 'ada';\
             DELETE FROM app_users WHERE name = 'ada';",
        )
        .run()
        .await
        .expect("round trip");
    assert!(!state.has_error(), "{}", state.diagnostics());
    assert_eq!(state.results.len(), 4);

    let inserted = state.expect_affected_rows("insert affected", 0);
    let id = state.expect_one_value::<i64>("new id", 1, 0);
    let count = state.expect_count("row count", 2);
    let deleted = state.expect_affected_one_row("delete affected", 3);
    let (inserted, id, count, ()) = zip4(inserted, id, count, deleted).expect("all shapes");
    assert_eq!(inserted, 1);
    assert!(id > 0);
    assert_eq!(count, 1);

    drop(state);
    drop(session);
    pool.stop().await;
}

#[tokio::test]
#[serial]
async fn expect_one_row_over_live_count() {
    let (pool, session) = new_session().await;

    let count_after_insert = session
        .run_query("INSERT INTO app_users (name) VALUES ('solo')")
        .then({
            let session = session.run_query("SELECT COUNT(*) FROM app_users");
            move |state| {
                assert!(!state.has_error());
                session.clone()
            }
        })
        .map(|state| {
            let row = state.expect_one_row("count row", 0, 0).expect("one row");
            row.at(0).expect("cell").as_i64().expect("count")
        })
        .run()
        .await
        .expect("chain");
    assert_eq!(count_after_insert, 1);

    drop(session);
    pool.stop().await;
}

#[tokio::test]
#[serial]
async fn maybe_one_row_live_semantics() {
    let (pool, session) = new_session().await;

    // no rows
    let state = session
        .run_query("SELECT * FROM app_users WHERE name = 'ghost'")
        .run()
        .await
        .expect("empty select");
    assert!(state.maybe_one_row(0, 0).expect("maybe").is_none());

    // one row
    let state = session
        .run_query(
            "INSERT INTO app_users (name, email) VALUES ('one', NULL);\
             SELECT id, email FROM app_users WHERE name = 'one';",
        )
        .run()
        .await
        .expect("insert+select");
    let row = state.maybe_one_row(1, 0).expect("maybe").expect("present");
    assert!(row.at(0).expect("id").as_i64().expect("id") > 0);

    // null in the requested column maps to None
    assert!(state.maybe_one_row(1, 1).expect("null email").is_none());

    // multiple rows still error
    let state = session
        .run_query(
            "INSERT INTO app_users (name) VALUES ('two');\
             SELECT id FROM app_users;",
        )
        .run()
        .await
        .expect("second insert");
    let err = state.maybe_one_row(1, 0).unwrap_err();
    assert_eq!(err.code, codes::sql_exec::MULTIPLE_RESULTS);

    drop(state);
    drop(session);
    pool.stop().await;
}

#[tokio::test]
#[serial]
async fn cols_gt_is_strict_against_live_row() {
    let (pool, session) = new_session().await;

    let state = session
        .run_query("SELECT 1 AS a, 2 AS b, 3 AS c, 4 AS d, 5 AS e")
        .run()
        .await
        .expect("five columns");
    assert!(state.expect_one_row_cols_gt("gt 3", 3).is_ok());
    let err = state.expect_one_row_cols_gt("gt 5", 5).unwrap_err();
    assert_eq!(err.code, codes::sql_exec::NO_ROWS);

    drop(state);
    drop(session);
    pool.stop().await;
}

#[tokio::test]
#[serial]
async fn list_of_rows_with_count_set() {
    let (pool, session) = new_session().await;

    let state = session
        .run_query("SELECT * FROM app_users; SELECT COUNT(*) FROM app_users;")
        .run()
        .await
        .expect("list+count");
    let (rows, total) = state.expect_list_of_rows("empty list", 0, 1).expect("shapes");
    assert_eq!(rows.row_count(), 0);
    assert_eq!(total, 0);

    let err = state.expect_list_of_rows("bad index", 0, 2).unwrap_err();
    assert_eq!(err.code, codes::sql_exec::INDEX_OUT_OF_BOUNDS);

    drop(state);
    drop(session);
    pool.stop().await;
}

#[tokio::test]
#[serial]
async fn driver_error_is_recorded_and_maps_to_sql_failed() {
    let (pool, session) = new_session().await;

    let state = session
        .run_query("SELECT x* FROM app_users")
        .run()
        .await
        .expect("IO itself succeeds; the state carries the error");
    assert!(state.has_error());
    assert!(!state.diagnostics().is_empty());
    let err = state.expect_one_row("bad sql", 0, 0).unwrap_err();
    assert_eq!(err.code, codes::sql_exec::SQL_FAILED);

    drop(state);
    drop(session);
    pool.stop().await;
}

#[tokio::test]
#[serial]
async fn scalar_type_mismatches_yield_bad_value_access() {
    let (pool, session) = new_session().await;

    let state = session
        .run_query("SELECT 'abc' AS txt; SELECT -1 AS neg; SELECT 42 AS answer;")
        .run()
        .await
        .expect("scalar select");

    let err = state.expect_one_value::<i64>("text as i64", 0, 0).unwrap_err();
    assert_eq!(err.code, codes::parse::BAD_VALUE_ACCESS);

    let err = state.expect_one_value::<u64>("negative as u64", 1, 0).unwrap_err();
    assert_eq!(err.code, codes::parse::BAD_VALUE_ACCESS);

    // integer cell read as bool: non-zero is true
    assert!(state.expect_one_value::<bool>("bool from int", 2, 0).expect("bool"));
    assert_eq!(state.expect_count("answer", 2).expect("count"), 42);

    // integer cell is not coerced to a float
    let err = state.expect_one_value::<f64>("int as f64", 2, 0).unwrap_err();
    assert_eq!(err.code, codes::parse::BAD_VALUE_ACCESS);

    drop(state);
    drop(session);
    pool.stop().await;
}

#[tokio::test]
#[serial]
async fn generator_runs_under_the_acquired_connection() {
    let (pool, session) = new_session().await;

    let state = session
        .run_query_with(|conn| {
            // connection-scoped information is available while generating
            let id = conn.id();
            Ok(format!("SELECT CONNECTION_ID() = {id} AS same"))
        })
        .run()
        .await
        .expect("generated query");
    assert!(state.expect_one_value::<bool>("same connection", 0, 0).expect("bool"));

    // generator errors propagate and release the connection
    let err = session
        .run_query_with(|_conn| {
            Err(aqueduct::Error::new(
                codes::sql_exec::SQL_FAILED,
                "nothing to run",
            ))
        })
        .run()
        .await
        .unwrap_err();
    assert_eq!(err.code, codes::sql_exec::SQL_FAILED);
    assert_eq!(pool.active_count(), 0);

    drop(session);
    pool.stop().await;
}

#[tokio::test]
#[serial]
async fn acquire_times_out_when_pool_is_exhausted() {
    aqueduct_tests::init_tracing();
    let mut config = test_config(db_port());
    config.initial_size = 0;
    config.max_size = 1;
    let pool = Arc::new(MySqlPool::from_config(&config).expect("tiny pool"));
    let session = MonadicSession::new(Arc::clone(&pool));

    // hold the only connection by keeping the state alive
    let held = session.run_query("SELECT 1").run().await.expect("holder");
    assert_eq!(pool.active_count(), 1);

    let err = session
        .run_query_timeout("SELECT 2", Duration::from_millis(300))
        .run()
        .await
        .unwrap_err();
    assert_eq!(err.code, codes::network::CONNECTION_TIMEOUT);
    assert_eq!(err.what, "Operation timed out");

    drop(held);
    let state = session.run_query("SELECT 3").run().await.expect("after release");
    assert!(!state.has_error());

    drop(state);
    drop(session);
    pool.stop().await;
}

#[tokio::test]
#[serial]
async fn stopped_pool_refuses_acquire_and_sessions_do_not_leak() {
    let (pool, session) = new_session().await;

    pool.stop().await;
    pool.stop().await; // idempotent
    let err = session.run_query("SELECT 1").run().await.unwrap_err();
    assert_eq!(err.code, codes::network::CONNECTION_REFUSED);
    assert!(err.what.contains("shutting down"));
    assert_eq!(pool.active_count(), 0);

    drop(session);
    assert_eq!(MonadicSession::instance_count(), 0);
}

#[tokio::test]
#[serial]
async fn concurrent_queries_hold_distinct_connections() {
    let (pool, session) = new_session().await;
    let session = Arc::new(session);

    let a = session.run_query("SELECT SLEEP(0.2), 1");
    let b = session.run_query("SELECT SLEEP(0.2), 2");
    let (ra, rb) = tokio::join!(a.run(), b.run());
    let sa = ra.expect("first query");
    let sb = rb.expect("second query");
    assert!(!sa.has_error() && !sb.has_error());

    drop(sa);
    drop(sb);
    assert_eq!(pool.active_count(), 0);
    drop(session);
    pool.stop().await;
}
