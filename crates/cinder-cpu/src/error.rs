use thiserror::Error;

use crate::SegmentedAddress;

/// CPU-visible fault raised while executing an instruction.
///
/// Faults with a vector are converted by the executor into an emulated
/// interrupt before the instruction pointer advances; the others abort the
/// run loop.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    /// DIV/IDIV by zero or a quotient that does not fit the operand width.
    #[error("divide error")]
    DivideError,
    /// 32-bit address-size effective address left the 16-bit segment space.
    #[error("general protection fault")]
    GeneralProtectionFault,
    /// I/O to a port with no handler while `fail_on_unhandled_port` is set.
    #[error("unhandled I/O port {port:#06x}")]
    UnhandledIoPort { port: u16 },
}

impl Exception {
    /// Real-mode interrupt vector this fault routes through, if any.
    pub fn vector(self) -> Option<u8> {
        match self {
            Exception::DivideError => Some(0),
            Exception::GeneralProtectionFault => Some(0x0D),
            Exception::UnhandledIoPort { .. } => None,
        }
    }
}

/// Decoder failure. These signal either an encoding the core does not
/// model or a malformed instruction stream; both are fatal to emulation.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unsupported opcode {opcode:#04x} at {address}")]
    UnsupportedOpcode {
        opcode: u16,
        address: SegmentedAddress,
    },
    #[error("invalid group encoding: opcode {opcode:#04x} /{reg} at {address}")]
    InvalidGroupEncoding {
        opcode: u16,
        reg: u8,
        address: SegmentedAddress,
    },
}
