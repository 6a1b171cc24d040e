//! In-memory storage driver executable.
//!
//! Spawned by the parent-side client with a socket pair end at file
//! descriptor 3; `argv[1]` is the JSON parameter map (unused by this
//! driver).

use storage::StorageConfig;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let parameters = storage_ipc::parameters_from_args()?;
    let config = StorageConfig::from_parameters("inmemory", &parameters)?;
    storage_ipc::serve(config.build().into_driver()).await?;
    Ok(())
}
