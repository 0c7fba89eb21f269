// src/flash/writer.rs - Message writer abstraction of the Flash layer
//
// A FlashWriter ships AMF-framed messages toward one client, over either
// transport: the TCP form frames messages in order on a STREAM socket, the
// RTMFP form stages them on a reliable flow. Status notifications use the
// NetStream.* string codes verbatim; they are compatibility-critical.

use crate::amf::{AmfWriter, MessageType};
use crate::net::Socket;
use crate::rtmfp::RtmfpWriter;
use bytes::{BufMut, Bytes, BytesMut};
use log::debug;
use std::sync::Arc;

// user control events carried in RAW messages
pub const RAW_STREAM_BEGIN: u16 = 0x0000;
pub const RAW_STREAM_EOF: u16 = 0x0001;

pub trait FlashWriter {
    fn callback_handle(&self) -> f64;

    /// Transaction number echoed into onStatus responses; 0 clears it.
    fn set_callback_handle(&mut self, handle: f64);

    /// Bytes this writer has queued toward its transport (backpressure probe).
    fn queueing(&self) -> usize;

    /// Ship one framed message body.
    fn write_message(&mut self, ty: MessageType, time: u32, reliable: bool, payload: Bytes);

    fn flush(&mut self);

    fn close(&mut self, code: i32, reason: &str);

    fn closed(&self) -> bool;

    // ---- provided framing helpers -------------------------------------------

    fn write_status_with_level(&mut self, code: &str, description: &str, error: bool) {
        let mut amf = AmfWriter::new();
        amf.write_string("onStatus");
        amf.write_number(self.callback_handle());
        amf.write_null();
        amf.begin_object();
        amf.write_property("level");
        amf.write_string(if error { "error" } else { "status" });
        amf.write_property("code");
        amf.write_string(code);
        amf.write_property("description");
        amf.write_string(description);
        amf.end_object();
        self.write_message(MessageType::Invocation, 0, true, amf.finish());
    }

    fn write_amf_status(&mut self, code: &str, description: &str) {
        self.write_status_with_level(code, description, false);
    }

    fn write_amf_status_error(&mut self, code: &str, description: &str) {
        self.write_status_with_level(code, description, true);
    }

    /// Data message: handler name followed by caller-written values.
    fn write_amf_data(&mut self, handler: &str, build: &mut dyn FnMut(&mut AmfWriter)) {
        let mut amf = AmfWriter::new();
        amf.write_string(handler);
        build(&mut amf);
        self.write_message(MessageType::Data, 0, true, amf.finish());
    }

    fn write_media(&mut self, ty: MessageType, time: u32, payload: Bytes, reliable: bool) {
        debug_assert!(ty.is_media());
        self.write_message(ty, time, reliable, payload);
    }

    /// RAW user-control event (stream begin / stream EOF).
    fn write_raw_event(&mut self, event: u16, stream_id: u32) {
        let mut amf = AmfWriter::new();
        amf.write_u16(event).write_u32(stream_id);
        self.write_message(MessageType::Raw, 0, true, amf.finish());
    }
}

/// TCP-side writer: the AMF message repertoire in order over one STREAM
/// socket. Framing is [stream id u16][type u8][time u32][length u32][body].
pub struct TcpFlashWriter {
    socket: Arc<Socket>,
    stream_id: u16,
    callback_handle: f64,
    closed: bool,
}

impl TcpFlashWriter {
    pub fn new(socket: Arc<Socket>, stream_id: u16) -> TcpFlashWriter {
        TcpFlashWriter {
            socket,
            stream_id,
            callback_handle: 0.0,
            closed: false,
        }
    }

    pub fn socket(&self) -> &Arc<Socket> {
        &self.socket
    }

    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }
}

/// Frame one message for the TCP transport.
pub fn encode_tcp_message(stream_id: u16, ty: MessageType, time: u32, payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(payload.len() + 11);
    frame.put_u16(stream_id);
    frame.put_u8(ty as u8);
    frame.put_u32(time);
    frame.put_u32(payload.len() as u32);
    frame.put_slice(payload);
    frame.freeze()
}

impl FlashWriter for TcpFlashWriter {
    fn callback_handle(&self) -> f64 {
        self.callback_handle
    }

    fn set_callback_handle(&mut self, handle: f64) {
        self.callback_handle = handle;
    }

    fn queueing(&self) -> usize {
        self.socket.queueing()
    }

    fn write_message(&mut self, ty: MessageType, time: u32, _reliable: bool, payload: Bytes) {
        if self.closed {
            return;
        }
        // TCP is reliable whatever the flag says
        let frame = encode_tcp_message(self.stream_id, ty, time, &payload);
        if let Err(error) = self.socket.write(frame, None, 0) {
            debug!("stream {} write failed: {error}", self.stream_id);
            self.closed = true;
        }
    }

    fn flush(&mut self) {
        if let Err(error) = self.socket.flush() {
            if !error.is_transient() {
                debug!("stream {} flush failed: {error}", self.stream_id);
                self.closed = true;
            }
        }
    }

    fn close(&mut self, code: i32, reason: &str) {
        if self.closed {
            return;
        }
        if !reason.is_empty() {
            debug!("stream {} closed ({code}): {reason}", self.stream_id);
        }
        self.flush();
        self.closed = true;
    }

    fn closed(&self) -> bool {
        self.closed
    }
}

/// RTMFP-side writer: frames messages onto a reliable flow. Composition in
/// place of the inheritance the transport family suggests.
pub struct RtmfpFlashWriter {
    inner: RtmfpWriter,
    callback_handle: f64,
}

impl RtmfpFlashWriter {
    pub fn new(inner: RtmfpWriter) -> RtmfpFlashWriter {
        RtmfpFlashWriter {
            inner,
            callback_handle: 0.0,
        }
    }

    pub fn writer(&self) -> &RtmfpWriter {
        &self.inner
    }

    pub fn writer_mut(&mut self) -> &mut RtmfpWriter {
        &mut self.inner
    }
}

impl FlashWriter for RtmfpFlashWriter {
    fn callback_handle(&self) -> f64 {
        self.callback_handle
    }

    fn set_callback_handle(&mut self, handle: f64) {
        self.callback_handle = handle;
    }

    fn queueing(&self) -> usize {
        self.inner.queue().lock().unwrap().frames().map(|f| f.payload.len()).sum()
    }

    fn write_message(&mut self, ty: MessageType, time: u32, reliable: bool, payload: Bytes) {
        self.inner.write_message(ty, time, &payload, reliable);
    }

    fn flush(&mut self) {
        self.inner.flushing();
    }

    fn close(&mut self, code: i32, reason: &str) {
        self.inner.close(code, reason);
    }

    fn closed(&self) -> bool {
        self.inner.closed()
    }
}

/// Test/recording sink collecting every framed message; used across the
/// crate's unit tests to observe protocol output.
#[derive(Default)]
pub struct MemoryFlashWriter {
    pub messages: Vec<(MessageType, u32, Bytes)>,
    pub callback_handle: f64,
    pub closed: bool,
    pub flushed: usize,
    pub queueing: usize,
}

impl MemoryFlashWriter {
    pub fn new() -> MemoryFlashWriter {
        MemoryFlashWriter::default()
    }
}

impl FlashWriter for MemoryFlashWriter {
    fn callback_handle(&self) -> f64 {
        self.callback_handle
    }

    fn set_callback_handle(&mut self, handle: f64) {
        self.callback_handle = handle;
    }

    fn queueing(&self) -> usize {
        self.queueing
    }

    fn write_message(&mut self, ty: MessageType, time: u32, _reliable: bool, payload: Bytes) {
        if !self.closed {
            self.messages.push((ty, time, payload));
        }
    }

    fn flush(&mut self) {
        self.flushed += 1;
    }

    fn close(&mut self, _code: i32, _reason: &str) {
        self.closed = true;
    }

    fn closed(&self) -> bool {
        self.closed
    }
}

/// Decode the status code string out of an onStatus invocation payload; test
/// helper shared by the protocol tests.
#[cfg(test)]
pub fn status_code(payload: &[u8]) -> Option<(String, bool)> {
    use crate::amf::{AmfReader, ValueType};
    let mut reader = AmfReader::new(payload);
    if reader.read_string().ok()? != "onStatus" {
        return None;
    }
    reader.read_number().ok()?;
    reader.read_null();
    if reader.next_type() != ValueType::Object {
        return None;
    }
    // walk the object properties directly
    use byteorder::{BigEndian, ByteOrder};
    let remaining = &payload[reader.position() + 1..];
    let mut pos = 0usize;
    let mut code = None;
    let mut error = false;
    loop {
        let len = BigEndian::read_u16(remaining.get(pos..pos + 2)?) as usize;
        pos += 2;
        if len == 0 {
            break;
        }
        let key = std::str::from_utf8(remaining.get(pos..pos + len)?).ok()?;
        pos += len;
        let mut value = AmfReader::new(remaining.get(pos..)?);
        match key {
            "code" => code = value.read_string().ok(),
            "level" => error = value.read_string().ok()? == "error",
            _ => value.next().ok()?,
        }
        pos += value.position();
    }
    code.map(|c| (c, error))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_framing_and_codes() {
        let mut writer = MemoryFlashWriter::new();
        writer.set_callback_handle(3.0);
        writer.write_amf_status("NetStream.Play.Start", "Started playing live");
        writer.write_amf_status_error("NetStream.Play.Failed", "Unknown error to play live");

        assert_eq!(writer.messages.len(), 2);
        let (ty, time, payload) = &writer.messages[0];
        assert_eq!(*ty, MessageType::Invocation);
        assert_eq!(*time, 0);
        assert_eq!(
            status_code(payload),
            Some(("NetStream.Play.Start".to_string(), false))
        );
        let (_, _, payload) = &writer.messages[1];
        assert_eq!(
            status_code(payload),
            Some(("NetStream.Play.Failed".to_string(), true))
        );
    }

    #[test]
    fn test_tcp_frame_layout() {
        let frame = encode_tcp_message(5, MessageType::Audio, 1000, b"pcm");
        assert_eq!(&frame[0..2], &5u16.to_be_bytes());
        assert_eq!(frame[2], MessageType::Audio as u8);
        assert_eq!(&frame[3..7], &1000u32.to_be_bytes());
        assert_eq!(&frame[7..11], &3u32.to_be_bytes());
        assert_eq!(&frame[11..], b"pcm");
    }

    #[test]
    fn test_raw_event_payload() {
        let mut writer = MemoryFlashWriter::new();
        writer.write_raw_event(RAW_STREAM_BEGIN, 1);
        let (ty, _, payload) = &writer.messages[0];
        assert_eq!(*ty, MessageType::Raw);
        assert_eq!(payload.as_ref(), b"\x00\x00\x00\x00\x00\x01");
    }

    #[test]
    fn test_closed_memory_writer_drops_messages() {
        let mut writer = MemoryFlashWriter::new();
        writer.close(0, "done");
        writer.write_amf_status("NetStream.Play.Stop", "Stopped");
        assert!(writer.messages.is_empty());
    }
}
