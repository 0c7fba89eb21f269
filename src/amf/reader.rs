// src/amf/reader.rs - Streaming AMF0 reader
//
// Values are pulled one at a time; next_type() peeks without consuming so a
// dispatcher can branch on what follows. Byte payloads use the AMF3 escape
// (AvmPlus marker + ByteArray) as produced by NetStream.send with a
// ByteArray argument.

use super::Amf0Marker;
use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AmfReadError {
    #[error("truncated AMF data (need {0} more bytes)")]
    Truncated(usize),
    #[error("unknown AMF0 marker 0x{0:02x}")]
    UnknownMarker(u8),
    #[error("wrong AMF type: expected {expected}, got {got:?}")]
    WrongType {
        expected: &'static str,
        got: ValueType,
    },
    #[error("invalid utf-8 in AMF string")]
    Utf8,
}

/// What the next read would produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Number,
    Boolean,
    String,
    Object,
    Null,
    EcmaArray,
    StrictArray,
    Date,
    Bytes,
    End,
    Other(u8),
}

pub struct AmfReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> AmfReader<'a> {
    pub fn new(data: &'a [u8]) -> AmfReader<'a> {
        AmfReader { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn available(&self) -> usize {
        self.data.len() - self.pos
    }

    fn peek_u8(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], AmfReadError> {
        if self.available() < len {
            return Err(AmfReadError::Truncated(len - self.available()));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8, AmfReadError> {
        Ok(self.take(1)?[0])
    }

    /// Peek the type of the next value without consuming it.
    pub fn next_type(&self) -> ValueType {
        let Some(marker) = self.peek_u8() else {
            return ValueType::End;
        };
        match Amf0Marker::from_u8(marker) {
            Some(Amf0Marker::Number) => ValueType::Number,
            Some(Amf0Marker::Boolean) => ValueType::Boolean,
            Some(Amf0Marker::String) | Some(Amf0Marker::LongString) => ValueType::String,
            Some(Amf0Marker::Object) => ValueType::Object,
            Some(Amf0Marker::Null) | Some(Amf0Marker::Undefined) => ValueType::Null,
            Some(Amf0Marker::EcmaArray) => ValueType::EcmaArray,
            Some(Amf0Marker::StrictArray) => ValueType::StrictArray,
            Some(Amf0Marker::Date) => ValueType::Date,
            // AvmPlus escape carries a ByteArray in this repertoire
            Some(Amf0Marker::AvmPlus) => ValueType::Bytes,
            _ => ValueType::Other(marker),
        }
    }

    pub fn read_string(&mut self) -> Result<String, AmfReadError> {
        let marker = self.take_u8()?;
        let len = match Amf0Marker::from_u8(marker) {
            Some(Amf0Marker::String) => BigEndian::read_u16(self.take(2)?) as usize,
            Some(Amf0Marker::LongString) => BigEndian::read_u32(self.take(4)?) as usize,
            _ => {
                self.pos -= 1;
                return Err(AmfReadError::WrongType {
                    expected: "string",
                    got: self.next_type(),
                });
            }
        };
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| AmfReadError::Utf8)
    }

    pub fn read_number(&mut self) -> Result<f64, AmfReadError> {
        let marker = self.take_u8()?;
        if Amf0Marker::from_u8(marker) != Some(Amf0Marker::Number) {
            self.pos -= 1;
            return Err(AmfReadError::WrongType {
                expected: "number",
                got: self.next_type(),
            });
        }
        Ok(BigEndian::read_f64(self.take(8)?))
    }

    pub fn read_boolean(&mut self) -> Result<bool, AmfReadError> {
        let marker = self.take_u8()?;
        if Amf0Marker::from_u8(marker) != Some(Amf0Marker::Boolean) {
            self.pos -= 1;
            return Err(AmfReadError::WrongType {
                expected: "boolean",
                got: self.next_type(),
            });
        }
        Ok(self.take_u8()? != 0)
    }

    /// Consume a null/undefined if present; true when one was consumed.
    pub fn read_null(&mut self) -> bool {
        match self.next_type() {
            ValueType::Null => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    /// Read a byte payload: AvmPlus marker, AMF3 ByteArray (0x0c), U29 length.
    pub fn read_bytes(&mut self) -> Result<&'a [u8], AmfReadError> {
        if self.next_type() != ValueType::Bytes {
            return Err(AmfReadError::WrongType {
                expected: "bytes",
                got: self.next_type(),
            });
        }
        self.pos += 1; // AvmPlus
        let amf3_marker = self.take_u8()?;
        if amf3_marker != 0x0c {
            return Err(AmfReadError::UnknownMarker(amf3_marker));
        }
        let reference = self.read_u29()?;
        let len = (reference >> 1) as usize;
        self.take(len)
    }

    fn read_u29(&mut self) -> Result<u32, AmfReadError> {
        let mut value = 0u32;
        for index in 0..4 {
            let byte = self.take_u8()?;
            if index == 3 {
                return Ok(value << 8 | u32::from(byte));
            }
            value = value << 7 | u32::from(byte & 0x7F);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        unreachable!()
    }

    /// Skip exactly one value (any supported type).
    pub fn next(&mut self) -> Result<(), AmfReadError> {
        match self.next_type() {
            ValueType::End => Ok(()),
            ValueType::Number => self.read_number().map(drop),
            ValueType::Boolean => self.read_boolean().map(drop),
            ValueType::String => self.read_string().map(drop),
            ValueType::Null => {
                self.read_null();
                Ok(())
            }
            ValueType::Bytes => self.read_bytes().map(drop),
            ValueType::Date => {
                self.pos += 1;
                self.take(10).map(drop) // f64 millis + i16 timezone
            }
            ValueType::Object => {
                self.pos += 1;
                self.skip_properties()
            }
            ValueType::EcmaArray => {
                self.pos += 1;
                self.take(4)?; // associative count, then same layout as Object
                self.skip_properties()
            }
            ValueType::StrictArray => {
                self.pos += 1;
                let count = BigEndian::read_u32(self.take(4)?);
                for _ in 0..count {
                    self.next()?;
                }
                Ok(())
            }
            ValueType::Other(marker) => Err(AmfReadError::UnknownMarker(marker)),
        }
    }

    fn skip_properties(&mut self) -> Result<(), AmfReadError> {
        loop {
            let len = BigEndian::read_u16(self.take(2)?) as usize;
            if len == 0 {
                let end = self.take_u8()?;
                if Amf0Marker::from_u8(end) == Some(Amf0Marker::ObjectEnd) {
                    return Ok(());
                }
                return Err(AmfReadError::UnknownMarker(end));
            }
            self.take(len)?;
            self.next()?;
        }
    }
}
