// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

/// Binary protocol opcodes used by the client core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Noop = 0x0a,
    Version = 0x0b,
    Append = 0x0e,
    Prepend = 0x0f,
    Touch = 0x1c,
    SaslListMechs = 0x20,
    SaslAuth = 0x21,
    GetReplica = 0x83,
    Observe = 0x92,
    GetClusterConfig = 0xb5,
}

impl TryFrom<u8> for Opcode {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0x00 => Ok(Self::Get),
            0x01 => Ok(Self::Set),
            0x02 => Ok(Self::Add),
            0x03 => Ok(Self::Replace),
            0x04 => Ok(Self::Delete),
            0x05 => Ok(Self::Increment),
            0x06 => Ok(Self::Decrement),
            0x0a => Ok(Self::Noop),
            0x0b => Ok(Self::Version),
            0x0e => Ok(Self::Append),
            0x0f => Ok(Self::Prepend),
            0x1c => Ok(Self::Touch),
            0x20 => Ok(Self::SaslListMechs),
            0x21 => Ok(Self::SaslAuth),
            0x83 => Ok(Self::GetReplica),
            0x92 => Ok(Self::Observe),
            0xb5 => Ok(Self::GetClusterConfig),
            other => Err(other),
        }
    }
}
