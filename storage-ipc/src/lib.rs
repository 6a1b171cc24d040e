//! # Out-of-process storage drivers
//!
//! A storage driver can run as a separate child executable instead of being
//! linked into the registry. The parent spawns the driver binary with one
//! end of a socket pair at file descriptor 3 and speaks a typed,
//! multiplexed protocol over it; blob bytes travel as live streams, not
//! buffered copies. [`DriverClient`] exposes the whole arrangement as an
//! ordinary [`storage_driver::Driver`], so callers cannot tell where the
//! implementation lives.
//!
//! ## Example
//!
//! ```no_run
//! use std::collections::BTreeMap;
//! use storage_driver::Driver;
//! use storage_ipc::DriverClient;
//!
//! # async fn example() -> Result<(), storage_driver::DriverError> {
//! let client = DriverClient::new("inmemory", &BTreeMap::new())?;
//! client.start().await?;
//! client.put_content("hello", b"world").await?;
//! assert_eq!(client.get_content("hello").await?, b"world");
//! client.stop().await?;
//! # Ok(())
//! # }
//! ```

mod client;
pub mod proto;
mod server;
pub mod transport;

pub use client::ClientOptions;
pub use client::DriverClient;
pub use server::inherited_socket;
pub use server::parameters_from_args;
pub use server::serve;
pub use server::serve_on;
pub use server::CHILD_SOCKET_FD;
