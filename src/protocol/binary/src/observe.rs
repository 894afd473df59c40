// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::*;

/// Per-key state reported by a node in an OBSERVE response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveStatus {
    /// Present in memory, not yet persisted.
    Found,
    Persisted,
    NotFound,
    /// Deleted but the deletion is not yet persisted.
    LogicallyDeleted,
    Unknown(u8),
}

impl From<u8> for ObserveStatus {
    fn from(code: u8) -> Self {
        match code {
            0x00 => Self::Found,
            0x01 => Self::Persisted,
            0x80 => Self::NotFound,
            0x81 => Self::LogicallyDeleted,
            other => Self::Unknown(other),
        }
    }
}

/// One (vbucket, key, status, cas) record from an OBSERVE response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObserveEntry {
    pub vbucket: u16,
    pub key: Vec<u8>,
    pub status: ObserveStatus,
    pub cas: u64,
}

impl ObserveEntry {
    /// Parse the concatenated entries out of an OBSERVE response value.
    pub fn parse_all(mut body: &[u8]) -> Result<Vec<ObserveEntry>, std::io::Error> {
        let mut entries = Vec::new();

        while !body.is_empty() {
            if body.len() < 4 {
                return Err(malformed("truncated observe entry"));
            }
            let vbucket = u16::from_be_bytes([body[0], body[1]]);
            let key_len = u16::from_be_bytes([body[2], body[3]]) as usize;
            if body.len() < 4 + key_len + 9 {
                return Err(malformed("truncated observe entry"));
            }
            let key = body[4..4 + key_len].to_vec();
            let status = ObserveStatus::from(body[4 + key_len]);
            let cas_start = 4 + key_len + 1;
            let cas = u64::from_be_bytes([
                body[cas_start],
                body[cas_start + 1],
                body[cas_start + 2],
                body[cas_start + 3],
                body[cas_start + 4],
                body[cas_start + 5],
                body[cas_start + 6],
                body[cas_start + 7],
            ]);

            entries.push(ObserveEntry {
                vbucket,
                key,
                status,
                cas,
            });

            body = &body[cas_start + 8..];
        }

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_entries() {
        let mut body = Vec::new();
        for (vb, key, status, cas) in
            [(9u16, &b"x"[..], 0x01u8, 7u64), (11, &b"yz"[..], 0x80, 0)]
        {
            body.extend_from_slice(&vb.to_be_bytes());
            body.extend_from_slice(&(key.len() as u16).to_be_bytes());
            body.extend_from_slice(key);
            body.push(status);
            body.extend_from_slice(&cas.to_be_bytes());
        }

        let entries = ObserveEntry::parse_all(&body).expect("failed to parse");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].status, ObserveStatus::Persisted);
        assert_eq!(entries[0].cas, 7);
        assert_eq!(entries[1].key, b"yz");
        assert_eq!(entries[1].status, ObserveStatus::NotFound);
    }

    #[test]
    fn truncated_entry_is_an_error() {
        let body = [0x00, 0x09, 0x00, 0x05, b'a'];
        assert!(ObserveEntry::parse_all(&body).is_err());
    }
}
