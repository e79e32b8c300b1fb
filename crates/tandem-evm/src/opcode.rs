//! Opcodes of the supported EVM subset.
//!
//! The table is data: [`info`] maps a byte to its mnemonic, immediate width
//! and stack effect. The assembler uses it for listings, the interpreter for
//! decoding and stack-depth checks. Bytes absent from the table are invalid.

#![allow(missing_docs)]

pub const STOP: u8 = 0x00;
pub const ADD: u8 = 0x01;
pub const MUL: u8 = 0x02;
pub const SUB: u8 = 0x03;
pub const DIV: u8 = 0x04;
pub const MOD: u8 = 0x06;
pub const LT: u8 = 0x10;
pub const GT: u8 = 0x11;
pub const EQ: u8 = 0x14;
pub const ISZERO: u8 = 0x15;
pub const AND: u8 = 0x16;
pub const OR: u8 = 0x17;
pub const NOT: u8 = 0x19;
pub const SHL: u8 = 0x1b;
pub const SHR: u8 = 0x1c;
pub const KECCAK256: u8 = 0x20;
pub const CALLER: u8 = 0x33;
pub const CALLVALUE: u8 = 0x34;
pub const CALLDATALOAD: u8 = 0x35;
pub const CALLDATASIZE: u8 = 0x36;
pub const CALLDATACOPY: u8 = 0x37;
pub const CODECOPY: u8 = 0x39;
pub const NUMBER: u8 = 0x43;
pub const POP: u8 = 0x50;
pub const MLOAD: u8 = 0x51;
pub const MSTORE: u8 = 0x52;
pub const MSTORE8: u8 = 0x53;
pub const SLOAD: u8 = 0x54;
pub const SSTORE: u8 = 0x55;
pub const JUMP: u8 = 0x56;
pub const JUMPI: u8 = 0x57;
pub const GAS: u8 = 0x5a;
pub const JUMPDEST: u8 = 0x5b;
pub const PUSH1: u8 = 0x60;
pub const PUSH2: u8 = 0x61;
pub const PUSH32: u8 = 0x7f;
pub const DUP1: u8 = 0x80;
pub const DUP2: u8 = 0x81;
pub const DUP3: u8 = 0x82;
pub const SWAP1: u8 = 0x90;
pub const LOG1: u8 = 0xa1;
pub const CALL: u8 = 0xf1;
pub const RETURN: u8 = 0xf3;
pub const REVERT: u8 = 0xfd;

/// Static description of one opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpInfo {
    /// Mnemonic.
    pub name: &'static str,
    /// Immediate bytes following the opcode.
    pub imm: usize,
    /// Stack items consumed.
    pub pops: usize,
    /// Stack items produced.
    pub pushes: usize,
}

const fn op(name: &'static str, pops: usize, pushes: usize) -> Option<OpInfo> {
    Some(OpInfo {
        name,
        imm: 0,
        pops,
        pushes,
    })
}

const PUSH_NAMES: [&str; 32] = [
    "PUSH1", "PUSH2", "PUSH3", "PUSH4", "PUSH5", "PUSH6", "PUSH7", "PUSH8", "PUSH9", "PUSH10",
    "PUSH11", "PUSH12", "PUSH13", "PUSH14", "PUSH15", "PUSH16", "PUSH17", "PUSH18", "PUSH19",
    "PUSH20", "PUSH21", "PUSH22", "PUSH23", "PUSH24", "PUSH25", "PUSH26", "PUSH27", "PUSH28",
    "PUSH29", "PUSH30", "PUSH31", "PUSH32",
];
const DUP_NAMES: [&str; 16] = [
    "DUP1", "DUP2", "DUP3", "DUP4", "DUP5", "DUP6", "DUP7", "DUP8", "DUP9", "DUP10", "DUP11",
    "DUP12", "DUP13", "DUP14", "DUP15", "DUP16",
];
const SWAP_NAMES: [&str; 16] = [
    "SWAP1", "SWAP2", "SWAP3", "SWAP4", "SWAP5", "SWAP6", "SWAP7", "SWAP8", "SWAP9", "SWAP10",
    "SWAP11", "SWAP12", "SWAP13", "SWAP14", "SWAP15", "SWAP16",
];

/// Metadata for `byte`, or `None` if it is outside the subset.
#[must_use]
pub const fn info(byte: u8) -> Option<OpInfo> {
    match byte {
        STOP => op("STOP", 0, 0),
        ADD => op("ADD", 2, 1),
        MUL => op("MUL", 2, 1),
        SUB => op("SUB", 2, 1),
        DIV => op("DIV", 2, 1),
        MOD => op("MOD", 2, 1),
        LT => op("LT", 2, 1),
        GT => op("GT", 2, 1),
        EQ => op("EQ", 2, 1),
        ISZERO => op("ISZERO", 1, 1),
        AND => op("AND", 2, 1),
        OR => op("OR", 2, 1),
        NOT => op("NOT", 1, 1),
        SHL => op("SHL", 2, 1),
        SHR => op("SHR", 2, 1),
        KECCAK256 => op("KECCAK256", 2, 1),
        CALLER => op("CALLER", 0, 1),
        CALLVALUE => op("CALLVALUE", 0, 1),
        CALLDATALOAD => op("CALLDATALOAD", 1, 1),
        CALLDATASIZE => op("CALLDATASIZE", 0, 1),
        CALLDATACOPY => op("CALLDATACOPY", 3, 0),
        CODECOPY => op("CODECOPY", 3, 0),
        NUMBER => op("NUMBER", 0, 1),
        POP => op("POP", 1, 0),
        MLOAD => op("MLOAD", 1, 1),
        MSTORE => op("MSTORE", 2, 0),
        MSTORE8 => op("MSTORE8", 2, 0),
        SLOAD => op("SLOAD", 1, 1),
        SSTORE => op("SSTORE", 2, 0),
        JUMP => op("JUMP", 1, 0),
        JUMPI => op("JUMPI", 2, 0),
        GAS => op("GAS", 0, 1),
        JUMPDEST => op("JUMPDEST", 0, 0),
        0x60..=0x7f => {
            let n = (byte - 0x5f) as usize;
            Some(OpInfo {
                name: PUSH_NAMES[n - 1],
                imm: n,
                pops: 0,
                pushes: 1,
            })
        }
        0x80..=0x8f => {
            let n = (byte - 0x7f) as usize;
            Some(OpInfo {
                name: DUP_NAMES[n - 1],
                imm: 0,
                pops: n,
                pushes: n + 1,
            })
        }
        0x90..=0x9f => {
            let n = (byte - 0x8f) as usize;
            Some(OpInfo {
                name: SWAP_NAMES[n - 1],
                imm: 0,
                pops: n + 1,
                pushes: n + 1,
            })
        }
        LOG1 => op("LOG1", 3, 0),
        CALL => op("CALL", 7, 1),
        RETURN => op("RETURN", 2, 0),
        REVERT => op("REVERT", 2, 0),
        _ => None,
    }
}

/// `PUSHn` for an immediate of `n` bytes (`1..=32`).
#[must_use]
pub const fn push(n: usize) -> Option<u8> {
    if n >= 1 && n <= 32 {
        Some(PUSH1 + (n as u8) - 1)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_covers_push_dup_swap() {
        assert_eq!(info(PUSH32).map(|i| (i.name, i.imm)), Some(("PUSH32", 32)));
        assert_eq!(info(DUP3).map(|i| (i.pops, i.pushes)), Some((3, 4)));
        assert_eq!(info(SWAP1).map(|i| i.name), Some("SWAP1"));
        assert_eq!(push(2), Some(PUSH2));
        assert_eq!(push(33), None);
        assert!(info(0xfe).is_none());
    }
}
