//! Integration tests for pqexec with a PostgreSQL testcontainer
//!
//! Run with `--features libpq`. A single container is shared across all
//! tests using the `ctor` pattern; tests run sequentially with
//! `serial_test` and recreate the tables they touch.
//!
//! Container cleanup:
//! - The `watchdog` feature handles cleanup on CTRL+C or SIGTERM signals
//! - For normal process exit, `shutdown_hooks` signals the container thread to stop

#![cfg(feature = "libpq")]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

use ctor::ctor;
use futures::future::join_all;
use pqexec::{Connection, Error, ExecStatus, LibPq, Pool, Queryable, Row, Transactional};
use serial_test::serial;
use testcontainers::{runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::postgres::Postgres;

// Connection string for the container (container lives in the thread)
static CONNINFO: OnceLock<String> = OnceLock::new();
// Flag to signal the container thread to exit
static SHUTDOWN: AtomicBool = AtomicBool::new(false);
static CONTAINER_THREAD: OnceLock<JoinHandle<()>> = OnceLock::new();

extern "C" fn cleanup_on_exit() {
    SHUTDOWN.store(true, Ordering::SeqCst);
    std::thread::sleep(std::time::Duration::from_millis(500));
}

#[ctor]
fn setup_container() {
    use std::time::Duration;

    shutdown_hooks::add_shutdown_hook(cleanup_on_exit);

    let (ready_tx, ready_rx) = std::sync::mpsc::channel();

    let handle = thread::spawn(move || {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let container: ContainerAsync<Postgres> = Postgres::default().start().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();
            let conninfo = format!(
                "host=127.0.0.1 port={port} user=postgres password=postgres dbname=postgres"
            );
            ready_tx.send(conninfo).unwrap();

            while !SHUTDOWN.load(Ordering::Relaxed) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        });
    });
    let _ = CONTAINER_THREAD.set(handle);

    let conninfo = ready_rx.recv().unwrap();
    CONNINFO.set(conninfo).unwrap();
}

fn conninfo() -> &'static str {
    CONNINFO.get().expect("Container not initialized")
}

fn pool(size: usize) -> Pool {
    Pool::new(Arc::new(LibPq), conninfo(), size).unwrap()
}

async fn reset_users(pool: &Pool) {
    pool.command("DROP TABLE IF EXISTS users", &[]).await.unwrap();
    pool.command(
        "CREATE TABLE users (id serial PRIMARY KEY, name text NOT NULL, email text)",
        &[],
    )
    .await
    .unwrap();
}

#[tokio::test]
#[serial]
async fn test_primitives_against_server() {
    let pool = pool(2);
    reset_users(&pool).await;

    let inserted = pool
        .command_returning(
            "INSERT INTO users (name, email) VALUES ($1, $2), ($3, NULL) RETURNING id",
            &["alice", "a@example.com", "bob"],
        )
        .await
        .unwrap();
    assert_eq!(inserted, vec![Row::from(vec!["1".to_string()]), Row::from(vec!["2".to_string()])]);

    let bob = pool
        .one("SELECT name, email FROM users WHERE id = $1", &["2"])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bob, ["bob", ""]);

    let all = pool.all("SELECT id FROM users ORDER BY id", &[]).await.unwrap();
    assert_eq!(all.len(), 2);

    assert!(pool
        .one("SELECT id FROM users WHERE name = $1", &["nobody"])
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
#[serial]
async fn test_error_contract_against_server() {
    let pool = pool(1);
    reset_users(&pool).await;

    let err = pool.all("DELETE FROM users", &[]).await.unwrap_err();
    assert!(matches!(
        err,
        Error::UnexpectedStatus {
            got: ExecStatus::CommandOk,
            ..
        }
    ));

    let err = pool.command("SELECT * FROM no_such_table", &[]).await.unwrap_err();
    match err {
        Error::ResultError(msg) => assert!(msg.contains("no_such_table"), "{msg}"),
        other => panic!("unexpected error: {other:?}"),
    }

    let err = pool
        .command("INSERT INTO users (name) VALUES (NULL)", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ResultError(_)));

    // Failures leave the pool usable.
    assert!(pool.one("SELECT 1", &[]).await.unwrap().is_some());
}

#[tokio::test]
#[serial]
async fn test_transactions_against_server() {
    let pool = pool(2);
    reset_users(&pool).await;

    let tx = pool.begin().await.unwrap();
    tx.command("INSERT INTO users (name) VALUES ($1)", &["tx-user"])
        .await
        .unwrap();
    let outside = pool.one("SELECT COUNT(*) FROM users", &[]).await.unwrap().unwrap();
    assert_eq!(outside, ["0"]);
    tx.rollback().await.unwrap();

    pool.in_transaction(|tx| {
        Box::pin(async move {
            tx.command("INSERT INTO users (name) VALUES ($1)", &["a"]).await?;
            tx.command("INSERT INTO users (name) VALUES ($1)", &["b"]).await?;
            Ok(())
        })
    })
    .await
    .unwrap();

    let count = pool.one("SELECT COUNT(*) FROM users", &[]).await.unwrap().unwrap();
    assert_eq!(count, ["2"]);
}

#[tokio::test]
#[serial]
async fn test_pool_overlaps_slow_queries() {
    let pool = pool(2);

    let start = std::time::Instant::now();
    let results = join_all((0..4).map(|_| pool.one("SELECT pg_sleep(0.2)", &[]))).await;
    for result in results {
        assert!(result.is_ok());
    }
    // Four 200ms queries over two connections take two rounds, not four.
    assert!(start.elapsed() < std::time::Duration::from_millis(750));
    assert_eq!(pool.live(), 2);
}

#[tokio::test]
#[serial]
async fn test_bad_conninfo_fails() {
    let err = pqexec::connect(LibPq, "host=127.0.0.1 port=1 connect_timeout=1")
        .await
        .unwrap_err();
    assert!(err.is_connection_failure());

    let conn = Connection::connect(Arc::new(LibPq), conninfo()).await.unwrap();
    assert_eq!(conn.one("SELECT $1::text", &["ok"]).await.unwrap().unwrap(), ["ok"]);
    conn.finish().await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_large_parameter_is_flushed() {
    let pool = pool(1);

    // Several megabytes do not fit in the socket buffer in one write.
    let big = "x".repeat(8 * 1024 * 1024);
    let row = pool
        .one("SELECT length($1)", &[big.as_str()])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row, [big.len().to_string().as_str()]);
}
