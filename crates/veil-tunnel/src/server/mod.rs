mod establish;
pub use establish::*;

pub mod http;
pub mod limiter;
pub mod listen;
pub mod nonce;
pub mod udp;
