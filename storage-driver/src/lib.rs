//! Contract for registry storage drivers.
//!
//! This crate defines the operation set and error taxonomy every storage
//! driver implements, whether it runs in-process or behind the IPC boundary,
//! along with the registry path conventions and a conformance suite shared
//! by all implementations.

pub mod conformance;
mod driver;
mod error;
pub mod paths;

pub use driver::normalize;
pub use driver::ByteStream;
pub use driver::Driver;
pub use error::DriverError;
pub use error::ErrorKind;
