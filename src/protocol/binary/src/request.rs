// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::*;

/// A single binary-protocol request. Construction fixes the opcode, extras,
/// key, and value; the routed vbucket and the correlation opaque are stamped
/// by the dispatcher just before the frame is composed, and may be re-stamped
/// when a request is re-routed after a topology change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    opcode: Opcode,
    vbucket: u16,
    opaque: u32,
    cas: u64,
    extras: Vec<u8>,
    key: Vec<u8>,
    value: Vec<u8>,
}

impl Request {
    fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            vbucket: 0,
            opaque: 0,
            cas: 0,
            extras: Vec::new(),
            key: Vec::new(),
            value: Vec::new(),
        }
    }

    pub fn get(key: &[u8]) -> Self {
        let mut request = Self::new(Opcode::Get);
        request.key = key.to_vec();
        request
    }

    pub fn get_replica(key: &[u8]) -> Self {
        let mut request = Self::new(Opcode::GetReplica);
        request.key = key.to_vec();
        request
    }

    /// SET / ADD / REPLACE share one frame layout: 4 bytes of flags and a
    /// 4 byte expiry in the extras.
    pub fn store(opcode: Opcode, key: &[u8], value: &[u8], flags: u32, expiry: u32, cas: u64) -> Self {
        debug_assert!(matches!(
            opcode,
            Opcode::Set | Opcode::Add | Opcode::Replace
        ));
        let mut request = Self::new(opcode);
        request.extras.extend_from_slice(&flags.to_be_bytes());
        request.extras.extend_from_slice(&expiry.to_be_bytes());
        request.key = key.to_vec();
        request.value = value.to_vec();
        request.cas = cas;
        request
    }

    /// APPEND / PREPEND carry no extras.
    pub fn concat(opcode: Opcode, key: &[u8], value: &[u8], cas: u64) -> Self {
        debug_assert!(matches!(opcode, Opcode::Append | Opcode::Prepend));
        let mut request = Self::new(opcode);
        request.key = key.to_vec();
        request.value = value.to_vec();
        request.cas = cas;
        request
    }

    pub fn delete(key: &[u8], cas: u64) -> Self {
        let mut request = Self::new(Opcode::Delete);
        request.key = key.to_vec();
        request.cas = cas;
        request
    }

    /// INCREMENT / DECREMENT: delta, initial value, and expiry in the extras;
    /// the response value is the 64-bit counter after the operation.
    pub fn arithmetic(opcode: Opcode, key: &[u8], delta: u64, initial: u64, expiry: u32) -> Self {
        debug_assert!(matches!(opcode, Opcode::Increment | Opcode::Decrement));
        let mut request = Self::new(opcode);
        request.extras.extend_from_slice(&delta.to_be_bytes());
        request.extras.extend_from_slice(&initial.to_be_bytes());
        request.extras.extend_from_slice(&expiry.to_be_bytes());
        request.key = key.to_vec();
        request
    }

    pub fn touch(key: &[u8], expiry: u32) -> Self {
        let mut request = Self::new(Opcode::Touch);
        request.extras.extend_from_slice(&expiry.to_be_bytes());
        request.key = key.to_vec();
        request
    }

    /// OBSERVE carries its keys in the value as (vbucket, key length, key)
    /// triples; the header vbucket is unused.
    pub fn observe<'a>(keys: impl IntoIterator<Item = (u16, &'a [u8])>) -> Self {
        let mut request = Self::new(Opcode::Observe);
        for (vbucket, key) in keys {
            request.value.extend_from_slice(&vbucket.to_be_bytes());
            request.value.extend_from_slice(&(key.len() as u16).to_be_bytes());
            request.value.extend_from_slice(key);
        }
        request
    }

    pub fn get_cluster_config() -> Self {
        Self::new(Opcode::GetClusterConfig)
    }

    pub fn sasl_list_mechs() -> Self {
        Self::new(Opcode::SaslListMechs)
    }

    /// The mechanism name travels as the key, the initial response as the
    /// value. PLAIN packs `\0user\0password`.
    pub fn sasl_auth(mechanism: &[u8], data: &[u8]) -> Self {
        let mut request = Self::new(Opcode::SaslAuth);
        request.key = mechanism.to_vec();
        request.value = data.to_vec();
        request
    }

    pub fn sasl_plain(username: &str, password: &str) -> Self {
        let mut data = Vec::with_capacity(2 + username.len() + password.len());
        data.push(0);
        data.extend_from_slice(username.as_bytes());
        data.push(0);
        data.extend_from_slice(password.as_bytes());
        Self::sasl_auth(b"PLAIN", &data)
    }

    pub fn noop() -> Self {
        Self::new(Opcode::Noop)
    }

    pub fn version() -> Self {
        Self::new(Opcode::Version)
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn vbucket(&self) -> u16 {
        self.vbucket
    }

    pub fn set_vbucket(&mut self, vbucket: u16) {
        self.vbucket = vbucket;
    }

    pub fn opaque(&self) -> u32 {
        self.opaque
    }

    pub fn set_opaque(&mut self, opaque: u32) {
        self.opaque = opaque;
    }

    pub fn cas(&self) -> u64 {
        self.cas
    }

    fn total_body_len(&self) -> u32 {
        (self.extras.len() + self.key.len() + self.value.len()) as u32
    }
}

impl Compose for Request {
    fn compose(&self, dst: &mut dyn BufMut) -> usize {
        let header = Header {
            magic: MAGIC_REQUEST,
            opcode: self.opcode as u8,
            key_len: self.key.len() as u16,
            extras_len: self.extras.len() as u8,
            data_type: 0,
            vbucket_or_status: self.vbucket,
            total_body_len: self.total_body_len(),
            opaque: self.opaque,
            cas: self.cas,
        };

        let size = header.compose(dst);
        dst.put_slice(&self.extras);
        dst.put_slice(&self.key);
        dst.put_slice(&self.value);
        size + self.total_body_len() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_get() {
        let mut request = Request::get(b"Hello");
        request.set_vbucket(913);
        request.set_opaque(7);

        let mut buf = Vec::new();
        let size = request.compose(&mut buf);

        assert_eq!(size, HEADER_LEN + 5);
        assert_eq!(buf.len(), size);
        assert_eq!(buf[0], MAGIC_REQUEST);
        assert_eq!(buf[1], Opcode::Get as u8);
        // key length
        assert_eq!(&buf[2..4], &[0x00, 0x05]);
        // vbucket
        assert_eq!(&buf[6..8], &913u16.to_be_bytes());
        // opaque
        assert_eq!(&buf[12..16], &7u32.to_be_bytes());
        // body is just the key
        assert_eq!(&buf[HEADER_LEN..], b"Hello");
    }

    #[test]
    fn compose_store() {
        let request = Request::store(Opcode::Set, b"k", b"World!", 0xabcd, 30, 0);

        let mut buf = Vec::new();
        request.compose(&mut buf);

        // extras: 4 bytes flags then 4 bytes expiry
        assert_eq!(buf[4], 8);
        assert_eq!(&buf[HEADER_LEN..HEADER_LEN + 4], &0xabcdu32.to_be_bytes());
        assert_eq!(&buf[HEADER_LEN + 4..HEADER_LEN + 8], &30u32.to_be_bytes());
        assert_eq!(&buf[HEADER_LEN + 8..HEADER_LEN + 9], b"k");
        assert_eq!(&buf[HEADER_LEN + 9..], b"World!");
    }

    #[test]
    fn compose_observe() {
        let request = Request::observe([(9u16, &b"x"[..]), (11u16, &b"yz"[..])]);

        let mut buf = Vec::new();
        request.compose(&mut buf);

        let body = &buf[HEADER_LEN..];
        assert_eq!(&body[0..2], &9u16.to_be_bytes());
        assert_eq!(&body[2..4], &1u16.to_be_bytes());
        assert_eq!(&body[4..5], b"x");
        assert_eq!(&body[5..7], &11u16.to_be_bytes());
        assert_eq!(&body[7..9], &2u16.to_be_bytes());
        assert_eq!(&body[9..11], b"yz");
    }

    #[test]
    fn sasl_plain_packs_credentials() {
        let request = Request::sasl_plain("user", "pass");
        assert_eq!(request.key(), b"PLAIN");

        let mut buf = Vec::new();
        request.compose(&mut buf);
        assert_eq!(&buf[HEADER_LEN + 5..], b"\0user\0pass");
    }
}
