// src/amf/writer.rs - AMF0 writer over a growable buffer
//
// Also exposes the raw big-endian integer writes the transports use to frame
// a message body (type byte, timestamp) ahead of the AMF values.

use super::Amf0Marker;
use bytes::{BufMut, Bytes, BytesMut};

pub struct AmfWriter {
    buffer: BytesMut,
}

impl Default for AmfWriter {
    fn default() -> Self {
        AmfWriter::new()
    }
}

impl AmfWriter {
    pub fn new() -> AmfWriter {
        AmfWriter {
            buffer: BytesMut::with_capacity(64),
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.buffer
    }

    pub fn finish(self) -> Bytes {
        self.buffer.freeze()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    // raw framing writes (message type, timestamps, tag prefixes)

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.buffer.put_u8(value);
        self
    }

    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.buffer.put_u16(value);
        self
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.buffer.put_u32(value);
        self
    }

    pub fn write_raw(&mut self, data: &[u8]) -> &mut Self {
        self.buffer.put_slice(data);
        self
    }

    // AMF0 values

    pub fn write_number(&mut self, value: f64) -> &mut Self {
        self.buffer.put_u8(Amf0Marker::Number as u8);
        self.buffer.put_f64(value);
        self
    }

    pub fn write_boolean(&mut self, value: bool) -> &mut Self {
        self.buffer.put_u8(Amf0Marker::Boolean as u8);
        self.buffer.put_u8(value as u8);
        self
    }

    pub fn write_null(&mut self) -> &mut Self {
        self.buffer.put_u8(Amf0Marker::Null as u8);
        self
    }

    pub fn write_string(&mut self, value: &str) -> &mut Self {
        if value.len() > u16::MAX as usize {
            self.buffer.put_u8(Amf0Marker::LongString as u8);
            self.buffer.put_u32(value.len() as u32);
        } else {
            self.buffer.put_u8(Amf0Marker::String as u8);
            self.buffer.put_u16(value.len() as u16);
        }
        self.buffer.put_slice(value.as_bytes());
        self
    }

    /// Byte payload via the AMF3 escape (AvmPlus + ByteArray + U29 length).
    pub fn write_bytes(&mut self, data: &[u8]) -> &mut Self {
        self.buffer.put_u8(Amf0Marker::AvmPlus as u8);
        self.buffer.put_u8(0x0c);
        self.write_u29((data.len() as u32) << 1 | 1);
        self.buffer.put_slice(data);
        self
    }

    fn write_u29(&mut self, value: u32) {
        debug_assert!(value < 1 << 29);
        if value < 0x80 {
            self.buffer.put_u8(value as u8);
        } else if value < 0x4000 {
            self.buffer.put_u8((value >> 7 | 0x80) as u8);
            self.buffer.put_u8((value & 0x7F) as u8);
        } else if value < 0x20_0000 {
            self.buffer.put_u8((value >> 14 | 0x80) as u8);
            self.buffer.put_u8((value >> 7 & 0x7F | 0x80) as u8);
            self.buffer.put_u8((value & 0x7F) as u8);
        } else {
            self.buffer.put_u8((value >> 22 | 0x80) as u8);
            self.buffer.put_u8((value >> 15 & 0x7F | 0x80) as u8);
            self.buffer.put_u8((value >> 8 & 0x7F | 0x80) as u8);
            self.buffer.put_u8((value & 0xFF) as u8);
        }
    }

    pub fn begin_object(&mut self) -> &mut Self {
        self.buffer.put_u8(Amf0Marker::Object as u8);
        self
    }

    /// Property key inside an object; follow with exactly one value write.
    pub fn write_property(&mut self, key: &str) -> &mut Self {
        self.buffer.put_u16(key.len() as u16);
        self.buffer.put_slice(key.as_bytes());
        self
    }

    pub fn end_object(&mut self) -> &mut Self {
        self.buffer.put_u16(0);
        self.buffer.put_u8(Amf0Marker::ObjectEnd as u8);
        self
    }
}
