//! Non-blocking transport layer: address canonicalization, the Socket
//! endpoint with its ordered send queue, and the readiness reactor that
//! drives reads and flushes.

mod address;
mod engine;
mod poller;
mod socket;

pub use address::SocketAddress;
pub use engine::{SocketEngine, SocketOwner, Token};
pub use poller::{Event, Interest, Poller};
pub use socket::{
    ShutdownKind, Socket, SocketType, DEFAULT_RECV_BUFFER_SIZE, DEFAULT_SEND_BUFFER_SIZE,
};

pub(crate) use socket::uptime_ms;
