//! Flash protocol layer: the per-NetStream command state machine and the
//! writers that frame AMF messages toward clients over TCP or RTMFP.

mod stream;
mod writer;

pub use stream::FlashStream;
pub use writer::{
    encode_tcp_message, FlashWriter, MemoryFlashWriter, RtmfpFlashWriter, TcpFlashWriter,
    RAW_STREAM_BEGIN, RAW_STREAM_EOF,
};

#[cfg(test)]
pub(crate) use writer::status_code;
