mod addr;
pub use addr::*;

mod handshake;
pub use handshake::*;

mod trojan;
pub use trojan::*;

mod udp_frame;
pub use udp_frame::*;

pub mod flow;
