//! Black-box conformance checks for [`Driver`] implementations.
//!
//! Each check takes any driver by reference, so the same functions run
//! against an in-process driver and against the IPC client without an
//! inheritance hierarchy. Callers pass a fresh driver (or a fresh root) per
//! run; paths are randomized to keep checks independent.
//!
//! These functions panic on contract violations and are meant to be called
//! from `#[tokio::test]` bodies.

use std::io::Cursor;

use rand::Rng;
use tokio::io::AsyncReadExt;

use crate::driver::{ByteStream, Driver};
use crate::error::ErrorKind;

/// Random lowercase path segment of the given length.
pub fn random_path(length: usize) -> String {
    const PATH_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| PATH_CHARS[rng.gen_range(0..PATH_CHARS.len())] as char)
        .collect()
}

/// Random payload of the given length.
pub fn random_contents(length: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..length).map(|_| rng.gen()).collect()
}

fn stream_of(contents: Vec<u8>) -> ByteStream {
    Box::new(Cursor::new(contents))
}

async fn read_all(mut stream: ByteStream) -> Vec<u8> {
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.expect("drain stream");
    buf
}

async fn put_get_compare<D: Driver + ?Sized>(driver: &D, contents: &[u8]) {
    let path = random_path(32);
    driver.put_content(&path, contents).await.expect("put");
    let received = driver.get_content(&path).await.expect("get");
    assert_eq!(received, contents);
}

/// Whole-content round-trips: single byte, multibyte UTF-8, and 32 random
/// bytes.
pub async fn check_write_read<D: Driver + ?Sized>(driver: &D) {
    put_get_compare(driver, b"a").await;
    put_get_compare(driver, "ß".as_bytes()).await;
    put_get_compare(driver, &random_contents(32)).await;
}

/// A 1 MiB payload round-trips byte-for-byte through both the whole-content
/// and the streaming operations.
pub async fn check_large_payload<D: Driver + ?Sized>(driver: &D) {
    let contents = random_contents(1024 * 1024);

    put_get_compare(driver, &contents).await;

    let path = random_path(32);
    driver
        .write_stream(&path, 0, stream_of(contents.clone()))
        .await
        .expect("write stream");
    let reader = driver.read_stream(&path, 0).await.expect("read stream");
    assert_eq!(read_all(reader).await, contents);
}

/// Streamed write then streamed read yields the same bytes.
pub async fn check_stream_round_trip<D: Driver + ?Sized>(driver: &D) {
    let path = random_path(32);
    let contents = random_contents(32);

    driver
        .write_stream(&path, 0, stream_of(contents.clone()))
        .await
        .expect("write stream");

    let reader = driver.read_stream(&path, 0).await.expect("read stream");
    assert_eq!(read_all(reader).await, contents);

    // Whole-content read observes the streamed bytes too.
    assert_eq!(driver.get_content(&path).await.expect("get"), contents);
}

/// Reads at offsets 0, 32, 64 and 96 of a 96-byte blob return the expected
/// suffixes, the last being empty; one past the end is an invalid offset.
pub async fn check_read_stream_offsets<D: Driver + ?Sized>(driver: &D) {
    let path = random_path(32);
    let chunk1 = random_contents(32);
    let chunk2 = random_contents(32);
    let chunk3 = random_contents(32);
    let full: Vec<u8> = [chunk1.as_slice(), &chunk2, &chunk3].concat();

    driver.put_content(&path, &full).await.expect("put");

    let reader = driver.read_stream(&path, 0).await.expect("offset 0");
    assert_eq!(read_all(reader).await, full);

    let reader = driver.read_stream(&path, 32).await.expect("offset 32");
    assert_eq!(read_all(reader).await, full[32..]);

    let reader = driver.read_stream(&path, 64).await.expect("offset 64");
    assert_eq!(read_all(reader).await, chunk3);

    let reader = driver.read_stream(&path, 96).await.expect("offset 96");
    assert_eq!(read_all(reader).await, Vec::<u8>::new());

    let err = match driver.read_stream(&path, 97).await {
        Ok(_) => panic!("reading past the end must fail"),
        Err(err) => err,
    };
    assert_eq!(err.kind(), ErrorKind::InvalidOffset);
}

/// Three 32-byte chunks appended at successive resume positions produce the
/// concatenation, with the position advancing 32 → 64 → 96.
pub async fn check_resumable_append<D: Driver + ?Sized>(driver: &D) {
    let path = random_path(32);
    let chunk1 = random_contents(32);
    let chunk2 = random_contents(32);
    let chunk3 = random_contents(32);

    assert_eq!(
        driver.resume_write_position(&path).await.expect("fresh"),
        0,
        "missing path must report position 0"
    );

    driver
        .write_stream(&path, 0, stream_of(chunk1.clone()))
        .await
        .expect("chunk 1");
    let offset = driver.resume_write_position(&path).await.expect("pos");
    assert_eq!(offset, 32);

    driver
        .write_stream(&path, offset, stream_of(chunk2.clone()))
        .await
        .expect("chunk 2");
    let offset = driver.resume_write_position(&path).await.expect("pos");
    assert_eq!(offset, 64);

    driver
        .write_stream(&path, offset, stream_of(chunk3.clone()))
        .await
        .expect("chunk 3");
    assert_eq!(driver.resume_write_position(&path).await.expect("pos"), 96);

    let full: Vec<u8> = [chunk1.as_slice(), &chunk2, &chunk3].concat();
    assert_eq!(driver.get_content(&path).await.expect("get"), full);
}

/// Writing past the resume position is an invalid offset, including offset 1
/// on a path that does not exist.
pub async fn check_offset_guard<D: Driver + ?Sized>(driver: &D) {
    let path = random_path(32);
    let err = driver
        .write_stream(&path, 1, stream_of(random_contents(8)))
        .await
        .expect_err("write past resume position");
    assert_eq!(err.kind(), ErrorKind::InvalidOffset);
}

/// Reads of nonexistent paths fail with path-not-found.
pub async fn check_missing_read<D: Driver + ?Sized>(driver: &D) {
    let path = random_path(32);

    let err = driver.get_content(&path).await.expect_err("get missing");
    assert_eq!(err.kind(), ErrorKind::PathNotFound);

    let err = match driver.read_stream(&path, 0).await {
        Ok(_) => panic!("reading a missing path must fail"),
        Err(err) => err,
    };
    assert_eq!(err.kind(), ErrorKind::PathNotFound);
}

/// Rename moves the blob, removes the source, overwrites the destination,
/// and fails with path-not-found for a missing source.
pub async fn check_rename<D: Driver + ?Sized>(driver: &D) {
    let contents = random_contents(32);
    let source = random_path(32);
    let dest = random_path(32);

    driver.put_content(&source, &contents).await.expect("put");
    driver.put_content(&dest, b"stale").await.expect("put dest");
    driver.rename(&source, &dest).await.expect("rename");

    assert_eq!(driver.get_content(&dest).await.expect("dest"), contents);
    let err = driver.get_content(&source).await.expect_err("source gone");
    assert_eq!(err.kind(), ErrorKind::PathNotFound);

    let err = driver
        .rename(&random_path(32), &random_path(32))
        .await
        .expect_err("rename missing");
    assert_eq!(err.kind(), ErrorKind::PathNotFound);
}

/// Delete removes a single key, sweeps a directory-like prefix, and fails
/// with path-not-found when nothing matches.
pub async fn check_delete<D: Driver + ?Sized>(driver: &D) {
    let path = random_path(32);
    driver
        .put_content(&path, &random_contents(32))
        .await
        .expect("put");
    driver.delete(&path).await.expect("delete");
    let err = driver.get_content(&path).await.expect_err("deleted");
    assert_eq!(err.kind(), ErrorKind::PathNotFound);

    let err = driver.delete(&random_path(32)).await.expect_err("missing");
    assert_eq!(err.kind(), ErrorKind::PathNotFound);

    let dirname = random_path(32);
    let file1 = format!("{dirname}/{}", random_path(32));
    let file2 = format!("{dirname}/{}", random_path(32));
    driver
        .put_content(&file1, &random_contents(32))
        .await
        .expect("put 1");
    driver
        .put_content(&file2, &random_contents(32))
        .await
        .expect("put 2");

    driver.delete(&dirname).await.expect("delete prefix");
    assert!(driver.get_content(&file1).await.is_err());
    assert!(driver.get_content(&file2).await.is_err());
}

/// Listing a prefix returns its distinct immediate children: one level deep,
/// duplicate-free, and complete for 50 entries.
pub async fn check_list<D: Driver + ?Sized>(driver: &D) {
    let root = random_path(8);
    let parent = format!("{root}/{}", random_path(8));

    let mut children = Vec::new();
    while children.len() < 50 {
        let child = format!("{parent}/{}", random_path(12));
        if children.contains(&child) {
            continue;
        }
        driver
            .put_content(&child, &random_contents(32))
            .await
            .expect("put child");
        children.push(child);
    }
    children.sort();

    let keys = driver.list(&root).await.expect("list root");
    assert_eq!(keys, vec![parent.clone()]);

    let mut keys = driver.list(&parent).await.expect("list parent");
    keys.sort();
    assert_eq!(keys, children);
}

/// The literal end-to-end scenario: hello/world, a streamed value, a rename
/// and a delete.
pub async fn seed_scenarios<D: Driver + ?Sized>(driver: &D) {
    driver.put_content("hello", b"world").await.expect("put");
    assert_eq!(driver.get_content("hello").await.expect("get"), b"world");

    driver
        .write_stream("stream", 0, stream_of(b"this is a stream".to_vec()))
        .await
        .expect("write stream");
    let reader = driver.read_stream("stream", 0).await.expect("read stream");
    assert_eq!(read_all(reader).await, b"this is a stream");

    driver.rename("hello", "goodbye").await.expect("rename");
    assert_eq!(driver.get_content("goodbye").await.expect("get"), b"world");
    assert!(driver.get_content("hello").await.is_err());

    driver.delete("goodbye").await.expect("delete");
    let err = driver.get_content("goodbye").await.expect_err("deleted");
    assert_eq!(err.kind(), ErrorKind::PathNotFound);
}

/// Run every check that applies to all drivers (everything except
/// [`check_list`], which only the memory driver supports).
pub async fn check_driver<D: Driver + ?Sized>(driver: &D) {
    check_write_read(driver).await;
    check_stream_round_trip(driver).await;
    check_read_stream_offsets(driver).await;
    check_resumable_append(driver).await;
    check_offset_guard(driver).await;
    check_missing_read(driver).await;
    check_rename(driver).await;
    check_delete(driver).await;
    check_large_payload(driver).await;
    seed_scenarios(driver).await;
}
