//! The shared driver conformance suite, run in-process against both
//! concrete drivers. The IPC crate runs the same functions through the
//! client/server pair.

use camino::Utf8Path;
use storage::{FilesystemDriver, MemoryDriver};
use storage_driver::conformance;

#[tokio::test]
async fn memory_driver() {
    let driver = MemoryDriver::new();
    conformance::check_driver(&driver).await;
    conformance::check_list(&driver).await;
}

#[tokio::test]
async fn filesystem_driver() {
    let dir = tempfile::TempDir::new().expect("create temporary root");
    let root = Utf8Path::from_path(dir.path()).expect("utf-8 path").to_owned();
    let driver = FilesystemDriver::new(root);
    conformance::check_driver(&driver).await;
}
