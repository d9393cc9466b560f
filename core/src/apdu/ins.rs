//! Instruction bytes of the interindustry commands built by [`super::Command`].

pub const SELECT_FILE: u8 = 0xA4;
pub const READ_BINARY: u8 = 0xB0;
pub const VERIFY: u8 = 0x20;
pub const GET_RESPONSE: u8 = 0xC0;
pub const PERFORM_SECURITY_OPERATION: u8 = 0x2A;
