//! RTMFP reliability layer: per-flow writers staging messages over UDP with
//! acknowledgement-driven retransmission.
//!
//! The session side owns the datagram socket and hands an [`RtmfpOutput`] to
//! each writer; [`UdpOutput`] is the direct implementation that executes send
//! actions against the session socket as they are submitted (the reactor
//! already serializes per-socket work, so submission order is ship order).

mod sender;
mod writer;

pub use sender::{
    encode_ack, encode_data_frame, FlowFrame, FlowMessage, FlowQueue, RtmfpSender, CHUNK_ACK,
    CHUNK_DATA, CHUNK_FAIL, FLAG_ABANDON, FLAG_END, FLAG_WITH_AFTERPART, FLAG_WITH_BEFOREPART,
    MAX_FRAGMENT_SIZE,
};
pub use writer::{RtmfpOutput, RtmfpWriter};

use crate::net::{Socket, SocketAddress};
use log::warn;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Default retransmission timeout seed before any RTT estimate exists.
pub const RTO_INIT_MS: u32 = 1000;

/// Session output bound to one datagram socket (and optional peer address
/// when the socket is not connected).
pub struct UdpOutput {
    socket: Arc<Socket>,
    address: Option<SocketAddress>,
    next_writer_id: AtomicU64,
    rto: AtomicU32,
}

impl UdpOutput {
    pub fn new(socket: Arc<Socket>, address: Option<SocketAddress>) -> UdpOutput {
        UdpOutput {
            socket,
            address,
            next_writer_id: AtomicU64::new(1),
            rto: AtomicU32::new(RTO_INIT_MS),
        }
    }

    /// Feed a fresh round-trip sample into the RTO estimate.
    pub fn set_rto(&self, rto_ms: u32) {
        self.rto.store(rto_ms.max(1), Ordering::Relaxed);
    }

    pub fn socket(&self) -> &Arc<Socket> {
        &self.socket
    }
}

impl RtmfpOutput for UdpOutput {
    fn rto(&self) -> u32 {
        self.rto.load(Ordering::Relaxed)
    }

    fn new_writer_id(&self) -> u64 {
        self.next_writer_id.fetch_add(1, Ordering::Relaxed)
    }

    fn reset_writer(&self, old_id: u64) -> u64 {
        // the old id is simply never allocated again
        let _ = old_id;
        self.new_writer_id()
    }

    fn send(&self, sender: RtmfpSender) {
        if let Err(error) = sender.run(&self.socket, self.address) {
            warn!("rtmfp send failed: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::SocketType;
    use bytes::Bytes;

    fn init_logs() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn test_writer_ships_frames_over_udp() {
        init_logs();
        let receiver = Socket::new(SocketType::Datagram);
        receiver.bind(SocketAddress::loopback(0)).expect("bind");
        let addr = receiver.address().expect("address");

        let socket = Arc::new(Socket::new(SocketType::Datagram));
        let output = Arc::new(UdpOutput::new(socket, Some(addr)));
        let mut writer = RtmfpWriter::new(1, Bytes::new(), output.clone());

        writer.new_message(true).write_string("live");
        writer.flushing();

        let mut buf = [0u8; 128];
        let read = receiver.receive(&mut buf, 0, None).expect("frame");
        assert_eq!(buf[0], CHUNK_DATA);
        assert_eq!(&buf[10..18], &1u64.to_be_bytes(), "first stage is 1");
        // payload is the AMF string written above
        assert_eq!(&buf[read - 4..read], b"live");
    }

    #[test]
    fn test_distinct_writers_get_distinct_ids() {
        init_logs();
        let socket = Arc::new(Socket::new(SocketType::Datagram));
        let output = Arc::new(UdpOutput::new(socket, None));
        let a = RtmfpWriter::new(1, Bytes::new(), output.clone());
        let b = RtmfpWriter::new(2, Bytes::new(), output.clone());
        assert_ne!(a.id(), b.id());
    }
}
