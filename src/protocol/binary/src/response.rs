// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::*;

/// A decoded response frame. The body is held as one contiguous allocation;
/// extras, key, and value are ranges into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    opcode: u8,
    status: Status,
    opaque: u32,
    cas: u64,
    extras_len: usize,
    key_len: usize,
    body: Box<[u8]>,
}

impl Response {
    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn opaque(&self) -> u32 {
        self.opaque
    }

    pub fn cas(&self) -> u64 {
        self.cas
    }

    pub fn extras(&self) -> &[u8] {
        &self.body[..self.extras_len]
    }

    pub fn key(&self) -> &[u8] {
        &self.body[self.extras_len..self.extras_len + self.key_len]
    }

    pub fn value(&self) -> &[u8] {
        &self.body[self.extras_len + self.key_len..]
    }

    pub fn into_value(self) -> Vec<u8> {
        let start = self.extras_len + self.key_len;
        let mut body = self.body.into_vec();
        body.drain(..start);
        body
    }

    /// The item flags a GET-shaped response carries in its extras.
    pub fn flags(&self) -> Option<u32> {
        let extras = self.extras();
        if extras.len() >= 4 {
            Some(u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]]))
        } else {
            None
        }
    }

    /// The counter value an INCREMENT/DECREMENT response carries.
    pub fn counter_value(&self) -> Option<u64> {
        let value = self.value();
        if value.len() == 8 {
            Some(u64::from_be_bytes([
                value[0], value[1], value[2], value[3], value[4], value[5], value[6], value[7],
            ]))
        } else {
            None
        }
    }
}

/// Decodes response frames. Stateless: resumption after a partial read is
/// just calling `parse` again with a longer buffer.
#[derive(Clone, Copy, Default)]
pub struct ResponseParser {
    _inner: (),
}

impl ResponseParser {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Parse<Response> for ResponseParser {
    fn parse(&self, buffer: &[u8]) -> Result<ParseOk<Response>, std::io::Error> {
        let header = Header::parse(buffer)?;

        if header.magic != MAGIC_RESPONSE {
            return Err(malformed("request magic on inbound frame"));
        }

        let framed_len = HEADER_LEN + header.total_body_len as usize;
        if buffer.len() < framed_len {
            return Err(incomplete());
        }

        let body = buffer[HEADER_LEN..framed_len].to_vec().into_boxed_slice();

        let response = Response {
            opcode: header.opcode,
            status: Status::from(header.vbucket_or_status),
            opaque: header.opaque,
            cas: header.cas,
            extras_len: header.extras_len as usize,
            key_len: header.key_len as usize,
            body,
        };

        Ok(ParseOk::new(response, framed_len))
    }
}
