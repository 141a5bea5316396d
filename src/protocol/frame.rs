//! Fixed-size frame header that precedes every chunk of message data.
//!
//! ```text
//! offset  size  field
//! 0       1     type     (i8: 0 = header, 1 = payload, 2 = command)
//! 1       1     version  (u8)
//! 2       4     id       (u32, big-endian)
//! 6       4     length   (u32, big-endian, bytes of data that follow)
//! 10      16    msg_id   (raw UUID bytes)
//! ```

use std::fmt;
use std::io::{Read, Write};

use uuid::Uuid;

use super::ProtocolError;

/// Size of an encoded [`FrameHeader`] in bytes.
pub const FRAME_HEADER_LENGTH: usize = 26;

/// Version written into every outbound frame.
pub const FRAME_VERSION: u8 = 1;

/// Id written into every outbound frame.
pub const FRAME_ID: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum FrameType {
    /// Carries a routing message; always followed by a payload frame.
    Header = 0,
    /// Carries the inner envelope of a payload message.
    Payload = 1,
    /// Carries a `HI` or `ROUTE` command.
    Command = 2,
}

impl TryFrom<i8> for FrameType {
    type Error = ProtocolError;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Header),
            1 => Ok(Self::Payload),
            2 => Ok(Self::Command),
            other => Err(ProtocolError::InvalidFrameType(other)),
        }
    }
}

/// Message id carried in a frame header, displayed in UUID form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageId(pub [u8; 16]);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&Uuid::from_bytes(self.0).hyphenated(), f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    pub version: u8,
    pub id: u32,
    pub length: u32,
    pub msg_id: MessageId,
}

impl FrameHeader {
    /// Header for an outbound frame of `length` data bytes.
    pub fn outbound(frame_type: FrameType, length: u32) -> Self {
        Self {
            frame_type,
            version: FRAME_VERSION,
            id: FRAME_ID,
            length,
            msg_id: MessageId::default(),
        }
    }

    pub fn encode(&self) -> [u8; FRAME_HEADER_LENGTH] {
        let mut buf = [0u8; FRAME_HEADER_LENGTH];
        buf[0] = (self.frame_type as i8).to_be_bytes()[0];
        buf[1] = self.version;
        buf[2..6].copy_from_slice(&self.id.to_be_bytes());
        buf[6..10].copy_from_slice(&self.length.to_be_bytes());
        buf[10..26].copy_from_slice(&self.msg_id.0);
        buf
    }

    pub fn decode(buf: &[u8; FRAME_HEADER_LENGTH]) -> Result<Self, ProtocolError> {
        let frame_type = FrameType::try_from(i8::from_be_bytes([buf[0]]))?;
        let mut msg_id = [0u8; 16];
        msg_id.copy_from_slice(&buf[10..26]);
        Ok(Self {
            frame_type,
            version: buf[1],
            id: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
            length: u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]),
            msg_id: MessageId(msg_id),
        })
    }
}

/// Read one frame header. A short read is fatal for the stream.
pub fn read_frame<R: Read>(r: &mut R) -> Result<FrameHeader, ProtocolError> {
    let mut buf = [0u8; FRAME_HEADER_LENGTH];
    r.read_exact(&mut buf)
        .map_err(|_| ProtocolError::FrameTooShort)?;
    FrameHeader::decode(&buf)
}

/// Read the `length` data bytes that follow a header.
pub fn read_frame_data<R: Read>(
    r: &mut R,
    length: u32,
    max_length: usize,
) -> Result<Vec<u8>, ProtocolError> {
    let length = length as usize;
    if length > max_length {
        return Err(ProtocolError::FrameTooLarge(length));
    }
    let mut buf = vec![0u8; length];
    r.read_exact(&mut buf)
        .map_err(|_| ProtocolError::FrameDataTooShort)?;
    Ok(buf)
}

/// Write a header followed by `data`.
pub fn write_frame<W: Write>(
    w: &mut W,
    frame_type: FrameType,
    data: &[u8],
) -> Result<(), ProtocolError> {
    let length = u32::try_from(data.len()).map_err(|_| ProtocolError::FrameTooLarge(data.len()))?;
    let header = FrameHeader::outbound(frame_type, length);
    w.write_all(&header.encode())?;
    w.write_all(data)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout_is_big_endian() {
        let header = FrameHeader {
            frame_type: FrameType::Command,
            version: 1,
            id: 0x0102_0304,
            length: 0x0000_0100,
            msg_id: MessageId([0xAB; 16]),
        };
        let buf = header.encode();
        assert_eq!(buf.len(), 26);
        assert_eq!(buf[0], 2);
        assert_eq!(buf[1], 1);
        assert_eq!(&buf[2..6], &[1, 2, 3, 4]);
        assert_eq!(&buf[6..10], &[0, 0, 1, 0]);
        assert!(buf[10..].iter().all(|b| *b == 0xAB));
        assert_eq!(FrameHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn test_invalid_frame_type() {
        let mut buf = FrameHeader::outbound(FrameType::Payload, 0).encode();
        buf[0] = 7;
        assert!(matches!(
            FrameHeader::decode(&buf),
            Err(ProtocolError::InvalidFrameType(7))
        ));
        buf[0] = 0xFF;
        assert!(matches!(
            FrameHeader::decode(&buf),
            Err(ProtocolError::InvalidFrameType(-1))
        ));
    }

    #[test]
    fn test_short_header() {
        let mut data: &[u8] = &[0, 1, 0, 0];
        assert!(matches!(
            read_frame(&mut data),
            Err(ProtocolError::FrameTooShort)
        ));
    }

    #[test]
    fn test_short_data() {
        let mut data: &[u8] = b"abc";
        assert!(matches!(
            read_frame_data(&mut data, 10, 1024),
            Err(ProtocolError::FrameDataTooShort)
        ));
    }

    #[test]
    fn test_oversized_data_rejected_before_allocation() {
        let mut data: &[u8] = b"";
        assert!(matches!(
            read_frame_data(&mut data, u32::MAX, 1024),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_outbound_header_fields() {
        let mut out = Vec::new();
        write_frame(&mut out, FrameType::Header, b"{}").unwrap();
        assert_eq!(out.len(), FRAME_HEADER_LENGTH + 2);
        let mut cursor = out.as_slice();
        let header = read_frame(&mut cursor).unwrap();
        assert_eq!(header.frame_type, FrameType::Header);
        assert_eq!(header.version, FRAME_VERSION);
        assert_eq!(header.id, FRAME_ID);
        assert_eq!(header.length, 2);
        assert_eq!(header.msg_id, MessageId::default());
    }

    #[test]
    fn test_message_id_display() {
        let id = MessageId([
            0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66,
            0x77, 0x88,
        ]);
        assert_eq!(id.to_string(), "12345678-9abc-def0-1122-334455667788");
    }
}
