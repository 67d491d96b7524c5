use thiserror::Error;

use crate::opcode::Opcode;

/// A validation failure: the offending pc, the opcode, and the reason.
///
/// Compilation itself cannot fail for user reasons: structural
/// well-formedness is guaranteed by construction, and internal
/// inconsistencies are compiler bugs that panic. Errors arise only when
/// re-checking a funcode, typically one reloaded from storage or checked
/// under a narrower [`Dialect`](crate::Dialect).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("invalid opcode 0x{op:02x} at pc {pc}")]
    IllegalOpcode { pc: u32, op: u8 },

    #[error("truncated operand for {op} at pc {pc}")]
    TruncatedOperand { pc: u32, op: Opcode },

    #[error("{op} operand {arg} out of range for {pool} (limit {limit}) at pc {pc}")]
    OutOfRange {
        pc: u32,
        op: Opcode,
        arg: u32,
        pool: &'static str,
        limit: u32,
    },

    #[error("{op} at pc {pc} requires the {feature} dialect feature")]
    DisabledFeature {
        pc: u32,
        op: Opcode,
        feature: &'static str,
    },

    #[error("{op} at pc {pc} names unknown {kind} {name:?}")]
    UnknownName {
        pc: u32,
        op: Opcode,
        kind: &'static str,
        name: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
