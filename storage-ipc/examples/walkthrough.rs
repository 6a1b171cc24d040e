//! End-to-end tour of a child driver session.
//!
//! Run with: cargo run -p storage-ipc --example walkthrough
//! (cargo builds the driver executables alongside.)

use std::collections::BTreeMap;
use std::io::Cursor;

use storage_driver::Driver;
use storage_ipc::{ClientOptions, DriverClient};
use tokio::io::AsyncReadExt;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt::init();

    // Examples live one directory below the driver binaries.
    let current = std::env::current_exe()?;
    let binary_dir = current
        .parent()
        .and_then(|examples| examples.parent())
        .ok_or_else(|| eyre::eyre!("cannot locate the build directory"))?;

    let client = DriverClient::with_options(
        "inmemory",
        &BTreeMap::new(),
        ClientOptions::new().binary_dir(binary_dir),
    )?;
    client.start().await?;

    println!("Putting hello -> world");
    client.put_content("hello", b"world").await?;
    println!("Getting 'hello'");
    let contents = client.get_content("hello").await?;
    println!("{}", String::from_utf8_lossy(&contents));

    println!("Putting a stream");
    client
        .write_stream("stream", 0, Box::new(Cursor::new(b"this is a stream".to_vec())))
        .await?;
    println!("Getting 'stream'");
    let mut reader = client.read_stream("stream", 0).await?;
    let mut contents = Vec::new();
    reader.read_to_end(&mut contents).await?;
    println!("{}", String::from_utf8_lossy(&contents));

    println!("Moving 'hello' -> 'goodbye'");
    client.rename("hello", "goodbye").await?;
    println!("Getting 'goodbye'");
    let contents = client.get_content("goodbye").await?;
    println!("{}", String::from_utf8_lossy(&contents));

    println!("Deleting 'goodbye'");
    client.delete("goodbye").await?;
    println!("Getting 'goodbye' again (should fail)");
    match client.get_content("goodbye").await {
        Ok(_) => eyre::bail!("expected the deleted path to be gone"),
        Err(err) => println!("Received error: {err}"),
    }

    client.stop().await?;
    Ok(())
}
