//! Wire protocol definitions: opcodes, shared constants, framing and the
//! exchange codec.
//!
//! Every message on the wire is `[opcode][...fields...][checksum?]`. Replies
//! open with either the echoed request opcode (reads), [`ACK`], [`NACK`] or
//! [`INTERRUPT`]. Multi-byte numeric fields are little-endian.

pub mod checksum;
pub mod exchange;
pub mod frame;

/// Positive acknowledgement reply opcode.
pub const ACK: u8 = 0x00;
/// Negative acknowledgement reply opcode; the reply is this single byte.
pub const NACK: u8 = 0x11;
/// Out-of-band interrupt notification opcode; payload is `[core][parity]`.
pub const INTERRUPT: u8 = 0x99;

/// Detect probe request byte.
pub const DETECT_PROBE: u8 = 0xEE;
/// Detect reply opcode; followed by a board-class byte and XOR parity.
pub const DETECT_REPLY: u8 = 0xFF;
/// Board-class byte: the SoC context answered the probe.
pub const CLASS_SOC: u8 = 0xEF;
/// Board-class byte: the MCU context answered the probe.
pub const CLASS_MCU: u8 = 0x22;
/// Board-class byte: the MCU is mid-reconfiguration; probe again later.
pub const CLASS_MCU_BUSY: u8 = 0x33;

/// MCU context: read the bootloader status flag.
pub const OP_STATUS_READ: u8 = 0x21;
/// MCU context: write the bootloader status flag.
pub const OP_STATUS_WRITE: u8 = 0x22;
/// MCU context: read the board serial number.
pub const OP_SERIAL_READ: u8 = 0x23;
/// MCU context: write the board serial number.
pub const OP_SERIAL_WRITE: u8 = 0x24;
/// MCU context: write one 4096-byte binary sector.
pub const OP_SECTOR_WRITE: u8 = 0x25;

/// Select-target request opcode; the target field picks the new context.
pub const OP_SELECT_TARGET: u8 = 0x33;
/// Select-target field: hand the link to the SoC.
pub const TARGET_SOC: u8 = 0x44;
/// Select-target field: hand the link back to the MCU.
pub const TARGET_MCU: u8 = 0x55;

/// SoC context: write one register.
pub const OP_REGISTER_WRITE: u8 = 0x81;
/// SoC context: read one register.
pub const OP_REGISTER_READ: u8 = 0x82;
/// SoC context: write one register N times.
pub const OP_REGISTER_WRITE_N: u8 = 0x83;
/// SoC context: read one register N times.
pub const OP_REGISTER_READ_N: u8 = 0x84;
/// SoC context: write N registers with auto address increment.
pub const OP_REGISTER_WRITE_AAI: u8 = 0x85;
/// SoC context: read N registers with auto address increment.
pub const OP_REGISTER_READ_AAI: u8 = 0x86;
/// SoC context: enable global interrupt notifications.
pub const OP_INTERRUPT_ENABLE: u8 = 0x87;

/// Binary upload sector size in bytes.
pub const SECTOR_SIZE: usize = 4096;

/// Fixed link baud rate (8 data bits, no parity, one stop bit, RTS/CTS).
pub const BAUD_RATE: u32 = 230_400;
