// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::*;

pub const HEADER_LEN: usize = 24;

pub const MAGIC_REQUEST: u8 = 0x80;
pub const MAGIC_RESPONSE: u8 = 0x81;

/// The fixed frame header. The `vbucket_or_status` slot is the vbucket id on
/// requests and the status code on responses; everything else is symmetric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: u8,
    pub opcode: u8,
    pub key_len: u16,
    pub extras_len: u8,
    pub data_type: u8,
    pub vbucket_or_status: u16,
    pub total_body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl Header {
    pub fn request(opcode: Opcode, vbucket: u16) -> Self {
        Self {
            magic: MAGIC_REQUEST,
            opcode: opcode as u8,
            key_len: 0,
            extras_len: 0,
            data_type: 0,
            vbucket_or_status: vbucket,
            total_body_len: 0,
            opaque: 0,
            cas: 0,
        }
    }

    /// Decode a header from the front of `buffer`. Incomplete input yields
    /// `WouldBlock`; a magic byte that matches neither direction is a framing
    /// error.
    pub fn parse(buffer: &[u8]) -> Result<Self, std::io::Error> {
        if buffer.len() < HEADER_LEN {
            return Err(incomplete());
        }

        let magic = buffer[0];
        if magic != MAGIC_REQUEST && magic != MAGIC_RESPONSE {
            return Err(malformed("bad magic"));
        }

        let header = Self {
            magic,
            opcode: buffer[1],
            key_len: u16::from_be_bytes([buffer[2], buffer[3]]),
            extras_len: buffer[4],
            data_type: buffer[5],
            vbucket_or_status: u16::from_be_bytes([buffer[6], buffer[7]]),
            total_body_len: u32::from_be_bytes([buffer[8], buffer[9], buffer[10], buffer[11]]),
            opaque: u32::from_be_bytes([buffer[12], buffer[13], buffer[14], buffer[15]]),
            cas: u64::from_be_bytes([
                buffer[16], buffer[17], buffer[18], buffer[19], buffer[20], buffer[21],
                buffer[22], buffer[23],
            ]),
        };

        if (header.key_len as u32 + header.extras_len as u32) > header.total_body_len {
            return Err(malformed("body shorter than key and extras"));
        }

        Ok(header)
    }

    pub fn compose(&self, dst: &mut dyn BufMut) -> usize {
        dst.put_slice(&[self.magic, self.opcode]);
        dst.put_slice(&self.key_len.to_be_bytes());
        dst.put_slice(&[self.extras_len, self.data_type]);
        dst.put_slice(&self.vbucket_or_status.to_be_bytes());
        dst.put_slice(&self.total_body_len.to_be_bytes());
        dst.put_slice(&self.opaque.to_be_bytes());
        dst.put_slice(&self.cas.to_be_bytes());
        HEADER_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let header = Header {
            magic: MAGIC_REQUEST,
            opcode: Opcode::Set as u8,
            key_len: 5,
            extras_len: 8,
            data_type: 0,
            vbucket_or_status: 913,
            total_body_len: 19,
            opaque: 0xdead_beef,
            cas: 42,
        };

        let mut buf = Vec::new();
        assert_eq!(header.compose(&mut buf), HEADER_LEN);
        assert_eq!(buf.len(), HEADER_LEN);

        let parsed = Header::parse(&buf).expect("failed to parse");
        assert_eq!(parsed, header);
    }

    #[test]
    fn incomplete_header() {
        let err = Header::parse(&[0x80; 23]).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }

    #[test]
    fn bad_magic() {
        let err = Header::parse(&[0x42; 24]).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[test]
    fn body_shorter_than_parts() {
        let mut buf = Vec::new();
        let mut header = Header::request(Opcode::Get, 0);
        header.key_len = 10;
        header.total_body_len = 4;
        header.compose(&mut buf);

        let err = Header::parse(&buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
