//! The driver conformance suite, run through the client/server pair against
//! both driver executables, plus session lifecycle coverage.

use std::collections::BTreeMap;
use std::path::Path;

use storage_driver::{conformance, Driver, ErrorKind};
use storage_ipc::{ClientOptions, DriverClient};

/// Options resolving driver executables from this build's binary directory.
/// Naming both executables makes cargo build them for these tests.
fn build_options() -> ClientOptions {
    let _ = env!("CARGO_BIN_EXE_filesystem");
    let binary_dir = Path::new(env!("CARGO_BIN_EXE_inmemory"))
        .parent()
        .expect("binary directory")
        .to_owned();
    ClientOptions::new().binary_dir(binary_dir)
}

async fn started_client(name: &str, parameters: &BTreeMap<String, String>) -> DriverClient {
    let client =
        DriverClient::with_options(name, parameters, build_options()).expect("resolve driver");
    client.start().await.expect("start driver child");
    client
}

#[tokio::test]
async fn inmemory_conformance() {
    let client = started_client("inmemory", &BTreeMap::new()).await;
    conformance::check_driver(&client).await;
    conformance::check_list(&client).await;
    client.stop().await.expect("stop");
}

#[tokio::test]
async fn filesystem_conformance() {
    let root = tempfile::TempDir::new().expect("temporary root");
    let mut parameters = BTreeMap::new();
    parameters.insert(
        "RootDirectory".to_owned(),
        root.path().to_str().expect("utf-8 root").to_owned(),
    );

    let client = started_client("filesystem", &parameters).await;
    conformance::check_driver(&client).await;

    // List stays memory-only; over RPC the filesystem driver reports it as
    // unsupported rather than failing the channel.
    let err = client.list("anything").await.expect_err("list");
    assert_eq!(err.kind(), ErrorKind::Unsupported);

    client.stop().await.expect("stop");
}

#[tokio::test]
async fn start_stop_only() {
    let client = started_client("inmemory", &BTreeMap::new()).await;
    client.stop().await.expect("stop");
}

#[tokio::test]
async fn operations_require_a_started_session() {
    let client = DriverClient::with_options("inmemory", &BTreeMap::new(), build_options())
        .expect("resolve driver");

    let err = client.get_content("anything").await.expect_err("not started");
    assert_eq!(err.kind(), ErrorKind::Lifecycle);

    let err = client.stop().await.expect_err("stop before start");
    assert_eq!(err.kind(), ErrorKind::Lifecycle);
}

#[tokio::test]
async fn double_start_and_double_stop_are_lifecycle_errors() {
    let client = started_client("inmemory", &BTreeMap::new()).await;

    let err = client.start().await.expect_err("double start");
    assert_eq!(err.kind(), ErrorKind::Lifecycle);

    client.stop().await.expect("stop");

    let err = client.stop().await.expect_err("double stop");
    assert_eq!(err.kind(), ErrorKind::Lifecycle);

    let err = client.get_content("anything").await.expect_err("stopped");
    assert_eq!(err.kind(), ErrorKind::Lifecycle);
}

#[tokio::test]
async fn missing_executable_fails_construction() {
    let err = DriverClient::with_options("no-such-driver", &BTreeMap::new(), build_options())
        .expect_err("unresolvable driver");
    assert_eq!(err.kind(), ErrorKind::Io);
}

#[tokio::test]
async fn concurrent_calls_share_the_session() {
    let client = std::sync::Arc::new(started_client("inmemory", &BTreeMap::new()).await);

    let mut tasks = Vec::new();
    for index in 0..8 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let path = format!("concurrent/{index}");
            let contents = vec![index as u8; 16 * 1024];
            client.put_content(&path, &contents).await.expect("put");
            let received = client.get_content(&path).await.expect("get");
            assert_eq!(received, contents);
        }));
    }
    for task in tasks {
        task.await.expect("task");
    }

    client.stop().await.expect("stop");
}
