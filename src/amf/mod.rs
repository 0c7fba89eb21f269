//! AMF serialization primitives shared by the Flash-family protocol layers.
//!
//! The reader is a streaming cursor (the command dispatcher consumes values
//! one at a time); the writer appends to a growable buffer that becomes a
//! message payload.

mod reader;
mod writer;

pub use reader::{AmfReadError, AmfReader, ValueType};
pub use writer::AmfWriter;

/// AMF0 type markers (amf0 spec section 2.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Amf0Marker {
    Number = 0x00,
    Boolean = 0x01,
    String = 0x02,
    Object = 0x03,
    Null = 0x05,
    Undefined = 0x06,
    Reference = 0x07,
    EcmaArray = 0x08,
    ObjectEnd = 0x09,
    StrictArray = 0x0A,
    Date = 0x0B,
    LongString = 0x0C,
    AvmPlus = 0x11,
}

impl Amf0Marker {
    pub fn from_u8(value: u8) -> Option<Amf0Marker> {
        Some(match value {
            0x00 => Amf0Marker::Number,
            0x01 => Amf0Marker::Boolean,
            0x02 => Amf0Marker::String,
            0x03 => Amf0Marker::Object,
            0x05 => Amf0Marker::Null,
            0x06 => Amf0Marker::Undefined,
            0x07 => Amf0Marker::Reference,
            0x08 => Amf0Marker::EcmaArray,
            0x09 => Amf0Marker::ObjectEnd,
            0x0A => Amf0Marker::StrictArray,
            0x0B => Amf0Marker::Date,
            0x0C => Amf0Marker::LongString,
            0x11 => Amf0Marker::AvmPlus,
            _ => return None,
        })
    }
}

/// AMF message repertoire shared by the TCP and RTMFP transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Empty = 0x00,
    Chunksize = 0x01,
    Ack = 0x03,
    Raw = 0x04,
    WinAckSize = 0x05,
    Bandwidth = 0x06,
    Audio = 0x08,
    Video = 0x09,
    DataAmf3 = 0x0F,
    InvocationAmf3 = 0x11,
    Data = 0x12,
    Invocation = 0x14,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<MessageType> {
        Some(match value {
            0x00 => MessageType::Empty,
            0x01 => MessageType::Chunksize,
            0x03 => MessageType::Ack,
            0x04 => MessageType::Raw,
            0x05 => MessageType::WinAckSize,
            0x06 => MessageType::Bandwidth,
            0x08 => MessageType::Audio,
            0x09 => MessageType::Video,
            0x0F => MessageType::DataAmf3,
            0x11 => MessageType::InvocationAmf3,
            0x14 => MessageType::Invocation,
            0x12 => MessageType::Data,
            _ => return None,
        })
    }

    pub fn is_media(self) -> bool {
        matches!(self, MessageType::Audio | MessageType::Video)
    }
}
