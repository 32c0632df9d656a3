pub mod error;
pub mod proto;
pub mod transport;

#[cfg(feature = "server")]
pub mod server;

pub use error::{Error, Result};
