// src/rtmfp/sender.rs - Flow queue and the discrete send actions
//
// A flow's outbound state is a stage-numbered frame queue shared between its
// writer and the send actions handed to the reactor. Three actions exist:
//   Messenger - append a batch of new messages (fragmenting as needed) and
//               ship the resulting frames
//   Repeater  - re-ship the first n unacknowledged stages (n clamped to 255
//               by the writer); abandoned unreliable stages ship as markers
//   Acquiter  - trim everything up to a newly acknowledged stage
//
// Single ownership rule: the queue belongs to the writer; actions hold a
// shared handle and the explicit `sending` flag tells the repeat path that a
// Messenger is still in flight.

use crate::error::Result;
use crate::net::{Socket, SocketAddress};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// UDP payload budget per data frame; larger messages are fragmented over
/// consecutive stages.
pub const MAX_FRAGMENT_SIZE: usize = 1200;

// chunk kinds on the wire
pub const CHUNK_DATA: u8 = 0x10;
pub const CHUNK_ACK: u8 = 0x51;
pub const CHUNK_FAIL: u8 = 0x5e;

// data frame flags
pub const FLAG_END: u8 = 0x01; // terminal message-end frame
pub const FLAG_ABANDON: u8 = 0x02; // unreliable stage given up on repeat
pub const FLAG_WITH_AFTERPART: u8 = 0x10; // more fragments follow
pub const FLAG_WITH_BEFOREPART: u8 = 0x20; // continues a previous fragment

/// One staged frame of a flow.
#[derive(Debug, Clone)]
pub struct FlowFrame {
    pub stage: u64,
    pub reliable: bool,
    pub flags: u8,
    pub payload: Bytes,
}

/// One application message before staging.
#[derive(Debug)]
pub struct FlowMessage {
    pub reliable: bool,
    pub end: bool,
    pub payload: Bytes,
}

/// Stage-ordered outbound queue of one flow.
#[derive(Debug)]
pub struct FlowQueue {
    /// Local writer id; replaced wholesale on fail().
    pub id: u64,
    /// Remote flow id this writer answers.
    pub flow_id: u64,
    /// Opaque flow signature repeated on the opening stage.
    pub signature: Bytes,
    frames: VecDeque<FlowFrame>,
    next_stage: u64,
    /// A Messenger is in flight; repeats must wait.
    pub sending: bool,
}

impl FlowQueue {
    pub fn new(id: u64, flow_id: u64, signature: Bytes) -> FlowQueue {
        FlowQueue {
            id,
            flow_id,
            signature,
            frames: VecDeque::new(),
            next_stage: 0,
            sending: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Highest stage number assigned so far (0 before any message).
    pub fn last_stage(&self) -> u64 {
        self.next_stage
    }

    pub fn frames(&self) -> impl Iterator<Item = &FlowFrame> {
        self.frames.iter()
    }

    /// Stage a message, fragmenting across consecutive stages; returns the
    /// last stage used.
    pub fn push_message(&mut self, message: &FlowMessage) -> u64 {
        let mut rest = message.payload.clone();
        let mut first = true;
        loop {
            let take = rest.len().min(MAX_FRAGMENT_SIZE);
            let fragment = rest.split_to(take);
            let mut flags = 0u8;
            if !first {
                flags |= FLAG_WITH_BEFOREPART;
            }
            if !rest.is_empty() {
                flags |= FLAG_WITH_AFTERPART;
            }
            if message.end {
                flags |= FLAG_END;
            }
            self.next_stage += 1;
            self.frames.push_back(FlowFrame {
                stage: self.next_stage,
                reliable: message.reliable,
                flags,
                payload: fragment,
            });
            first = false;
            if rest.is_empty() {
                return self.next_stage;
            }
        }
    }

    /// Drop every stage at or below `stage_ack`; they are acknowledged.
    pub fn trim(&mut self, stage_ack: u64) {
        while let Some(front) = self.frames.front() {
            if front.stage > stage_ack {
                break;
            }
            self.frames.pop_front();
        }
    }
}

/// Encode one data frame as a wire chunk.
pub fn encode_data_frame(writer_id: u64, frame: &FlowFrame) -> Bytes {
    let mut chunk = BytesMut::with_capacity(frame.payload.len() + 18);
    chunk.put_u8(CHUNK_DATA);
    chunk.put_u8(frame.flags);
    chunk.put_u64(writer_id);
    chunk.put_u64(frame.stage);
    chunk.put_slice(&frame.payload);
    chunk.freeze()
}

/// Encode an acknowledgement chunk: (stageAck, lostCount) for a flow.
pub fn encode_ack(flow_id: u64, stage_ack: u64, lost_count: u32) -> Bytes {
    let mut chunk = BytesMut::with_capacity(21);
    chunk.put_u8(CHUNK_ACK);
    chunk.put_u64(flow_id);
    chunk.put_u64(stage_ack);
    chunk.put_u32(lost_count);
    chunk.freeze()
}

/// A send action submitted to the reactor.
pub enum RtmfpSender {
    Messenger {
        queue: Arc<Mutex<FlowQueue>>,
        messages: Vec<FlowMessage>,
    },
    Repeater {
        queue: Arc<Mutex<FlowQueue>>,
        /// 0 repeats every queued stage.
        count: u8,
    },
    Acquiter {
        queue: Arc<Mutex<FlowQueue>>,
        stage_ack: u64,
    },
}

impl RtmfpSender {
    /// Execute against the session socket. Errors from Socket::write are
    /// already absorbed into its queue unless the socket is gone.
    pub fn run(self, socket: &Socket, address: Option<SocketAddress>) -> Result<()> {
        match self {
            RtmfpSender::Messenger { queue, messages } => {
                let mut queue = queue.lock().unwrap();
                let first_new = queue.last_stage() + 1;
                for message in &messages {
                    queue.push_message(message);
                }
                let id = queue.id;
                let mut result = Ok(());
                for frame in queue.frames().filter(|f| f.stage >= first_new) {
                    if let Err(error) = socket.write(encode_data_frame(id, frame), address, 0) {
                        result = Err(error);
                        break;
                    }
                }
                // the flag must clear even on a failed send, or repeats stall
                queue.sending = false;
                result
            }
            RtmfpSender::Repeater { queue, count } => {
                let queue = queue.lock().unwrap();
                let id = queue.id;
                let limit = if count == 0 { usize::MAX } else { count as usize };
                for frame in queue.frames().take(limit) {
                    if frame.reliable {
                        socket.write(encode_data_frame(id, frame), address, 0)?;
                    } else {
                        // give the stage up instead of resending stale media
                        let abandoned = FlowFrame {
                            stage: frame.stage,
                            reliable: false,
                            flags: frame.flags | FLAG_ABANDON,
                            payload: Bytes::new(),
                        };
                        socket.write(encode_data_frame(id, &abandoned), address, 0)?;
                    }
                }
                Ok(())
            }
            RtmfpSender::Acquiter { queue, stage_ack } => {
                queue.lock().unwrap().trim(stage_ack);
                Ok(())
            }
        }
    }

    pub fn queue(&self) -> &Arc<Mutex<FlowQueue>> {
        match self {
            RtmfpSender::Messenger { queue, .. } => queue,
            RtmfpSender::Repeater { queue, .. } => queue,
            RtmfpSender::Acquiter { queue, .. } => queue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(reliable: bool, payload: &[u8]) -> FlowMessage {
        FlowMessage {
            reliable,
            end: false,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn test_stages_are_consecutive() {
        let mut queue = FlowQueue::new(2, 5, Bytes::new());
        assert_eq!(queue.push_message(&message(true, b"a")), 1);
        assert_eq!(queue.push_message(&message(true, b"b")), 2);
        assert_eq!(queue.push_message(&message(false, b"c")), 3);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_fragmentation_marks_parts() {
        let mut queue = FlowQueue::new(1, 1, Bytes::new());
        let big = vec![0x42u8; MAX_FRAGMENT_SIZE * 2 + 100];
        let last = queue.push_message(&message(true, &big));
        assert_eq!(last, 3);

        let frames: Vec<&FlowFrame> = queue.frames().collect();
        assert_eq!(frames[0].flags & FLAG_WITH_AFTERPART, FLAG_WITH_AFTERPART);
        assert_eq!(frames[0].flags & FLAG_WITH_BEFOREPART, 0);
        assert_eq!(
            frames[1].flags & (FLAG_WITH_BEFOREPART | FLAG_WITH_AFTERPART),
            FLAG_WITH_BEFOREPART | FLAG_WITH_AFTERPART
        );
        assert_eq!(frames[2].flags & FLAG_WITH_AFTERPART, 0);
        assert_eq!(frames[2].payload.len(), 100);
        let total: usize = frames.iter().map(|f| f.payload.len()).sum();
        assert_eq!(total, big.len());
    }

    #[test]
    fn test_trim_discards_acknowledged_stages() {
        let mut queue = FlowQueue::new(1, 1, Bytes::new());
        for index in 0..5 {
            queue.push_message(&message(true, &[index]));
        }
        queue.trim(3);
        let first = queue.frames().next().expect("frames remain");
        assert_eq!(first.stage, 4);
        queue.trim(5);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_data_frame_encoding() {
        let frame = FlowFrame {
            stage: 7,
            reliable: true,
            flags: FLAG_END,
            payload: Bytes::from_static(b"xy"),
        };
        let chunk = encode_data_frame(3, &frame);
        assert_eq!(chunk[0], CHUNK_DATA);
        assert_eq!(chunk[1], FLAG_END);
        assert_eq!(&chunk[2..10], &3u64.to_be_bytes());
        assert_eq!(&chunk[10..18], &7u64.to_be_bytes());
        assert_eq!(&chunk[18..], b"xy");
    }

    #[test]
    fn test_ack_encoding() {
        let chunk = encode_ack(9, 41, 2);
        assert_eq!(chunk[0], CHUNK_ACK);
        assert_eq!(&chunk[1..9], &9u64.to_be_bytes());
        assert_eq!(&chunk[9..17], &41u64.to_be_bytes());
        assert_eq!(&chunk[17..21], &2u32.to_be_bytes());
    }

    #[test]
    fn test_repeater_abandons_unreliable_stages() {
        use crate::net::{SocketAddress, SocketType};

        let _ = env_logger::builder().is_test(true).try_init();
        let receiver = Socket::new(SocketType::Datagram);
        receiver.bind(SocketAddress::loopback(0)).expect("bind");
        let addr = receiver.address().expect("address");
        let sender_socket = Socket::new(SocketType::Datagram);

        let queue = Arc::new(Mutex::new(FlowQueue::new(1, 1, Bytes::new())));
        {
            let mut guard = queue.lock().unwrap();
            guard.push_message(&message(true, b"keep"));
            guard.push_message(&message(false, b"drop"));
        }

        RtmfpSender::Repeater {
            queue: queue.clone(),
            count: 0,
        }
        .run(&sender_socket, Some(addr))
        .expect("repeat");

        let mut buf = [0u8; 64];
        let read = receiver.receive(&mut buf, 0, None).expect("first frame");
        assert_eq!(&buf[read - 4..read], b"keep");
        let read = receiver.receive(&mut buf, 0, None).expect("second frame");
        assert_eq!(buf[1] & FLAG_ABANDON, FLAG_ABANDON);
        assert_eq!(read, 18, "abandoned stage carries no payload");
    }
}
