//! Exchange codec: one typed description per request/reply pair.
//!
//! The original per-opcode class hierarchy is flattened into a tagged
//! [`ExchangeKind`] enum with one dispatch function per capability, so the
//! wire-format logic stays exhaustively matchable. An [`Exchange`] couples a
//! kind with the shared per-occurrence state: the set-once id, the cached
//! request frame, the stored reply frame, an optional result callback and the
//! receive timeout.

use crate::error::{CommError, CommResult};
use crate::protocol::checksum::{adler32, xor_parity};
use crate::protocol::frame::Frame;
use crate::protocol::{
    ACK, DETECT_PROBE, DETECT_REPLY, OP_INTERRUPT_ENABLE, OP_REGISTER_READ, OP_REGISTER_READ_AAI,
    OP_REGISTER_READ_N, OP_REGISTER_WRITE, OP_REGISTER_WRITE_AAI, OP_REGISTER_WRITE_N,
    OP_SECTOR_WRITE, OP_SELECT_TARGET, OP_SERIAL_READ, OP_SERIAL_WRITE, OP_STATUS_READ,
    OP_STATUS_WRITE, SECTOR_SIZE,
};
use log::warn;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

/// Shared single-byte result destination.
///
/// The engine is single-threaded by design; `Rc<Cell<_>>` is the caller-owned
/// slot a read exchange writes its decoded result into.
pub type ByteCell = Rc<Cell<u8>>;

/// Shared 32-bit result destination (serial number reads).
pub type WordCell = Rc<Cell<u32>>;

/// Shared multi-byte result destination for bulk reads.
pub type BufferCell = Rc<RefCell<Vec<u8>>>;

/// Completion callback, invoked with the decoded reply payload (empty for
/// ACK-only replies).
pub type ResultCallback = Box<dyn FnMut(&[u8])>;

/// Default receive timeout for one exchange.
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_millis(200);

/// Receive timeout for the sector upload, which the MCU must commit to flash.
pub const SECTOR_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Variant-specific data of one logical operation.
#[derive(Debug)]
pub enum ExchangeKind {
    /// Probe the link with the detect byte; the reply classifies the board.
    DetectProbe {
        /// Receives the board-class byte from the detect reply.
        class: ByteCell,
    },
    /// Hand the link to the other context (MCU or SoC).
    SelectTarget {
        /// [`crate::protocol::TARGET_SOC`] or [`crate::protocol::TARGET_MCU`].
        target: u8,
    },
    /// Read the MCU bootloader status flag.
    StatusRead {
        /// Receives the status byte.
        dest: ByteCell,
    },
    /// Write the MCU bootloader status flag.
    StatusWrite {
        /// New status value.
        status: u8,
    },
    /// Read the board serial number.
    SerialRead {
        /// Receives the 32-bit serial number.
        dest: WordCell,
    },
    /// Write the board serial number.
    SerialWrite {
        /// New serial number.
        serial: u32,
    },
    /// Upload one 4096-byte binary sector, Adler-32 protected.
    SectorWrite {
        /// Sector index within the upload.
        index: u16,
        /// Exactly [`SECTOR_SIZE`] bytes.
        payload: Vec<u8>,
    },
    /// Write one SoC register.
    RegisterWrite {
        /// Register address.
        addr: u8,
        /// Value to write.
        value: u8,
    },
    /// Read one SoC register.
    RegisterRead {
        /// Register address.
        addr: u8,
        /// Receives the register value.
        dest: ByteCell,
    },
    /// Write one register N times (FIFO-style targets).
    MultiRegisterWrite {
        /// Register address.
        addr: u8,
        /// Values, written in order.
        values: Vec<u8>,
    },
    /// Read one register N times.
    MultiRegisterRead {
        /// Register address.
        addr: u8,
        /// Number of reads.
        count: u16,
        /// Receives the read bytes in wire order.
        dest: BufferCell,
    },
    /// Write N registers with auto address increment.
    AutoIncWrite {
        /// First register address.
        addr: u8,
        /// Values, one per consecutive address.
        values: Vec<u8>,
    },
    /// Read N registers with auto address increment.
    AutoIncRead {
        /// First register address.
        addr: u8,
        /// Number of registers.
        count: u16,
        /// Receives the read bytes in address order.
        dest: BufferCell,
    },
    /// Enable global interrupt notifications on the SoC.
    InterruptEnable,
}

/// One logical request/reply operation on the wire.
///
/// Created per operation and consumed by exactly one task occurrence; the
/// cached request frame may be resent across retries of that occurrence.
pub struct Exchange {
    kind: ExchangeKind,
    id: u8,
    id_assigned: bool,
    timeout: Duration,
    callback: Option<ResultCallback>,
    request: Option<Frame>,
    reply: Option<Frame>,
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("id_assigned", &self.id_assigned)
            .field("timeout", &self.timeout)
            .field("callback", &self.callback.as_ref().map(|_| "..."))
            .field("request", &self.request)
            .field("reply", &self.reply)
            .finish()
    }
}

impl Exchange {
    fn from_kind(kind: ExchangeKind) -> Self {
        let timeout = match kind {
            ExchangeKind::SectorWrite { .. } => SECTOR_WRITE_TIMEOUT,
            _ => DEFAULT_EXCHANGE_TIMEOUT,
        };
        Self {
            kind,
            id: 0,
            id_assigned: false,
            timeout,
            callback: None,
            request: None,
            reply: None,
        }
    }

    /// Detect-probe exchange; `class` receives the board-class byte.
    pub fn detect_probe(class: ByteCell) -> Self {
        Self::from_kind(ExchangeKind::DetectProbe { class })
    }

    /// Select-target exchange; `target` is one of the target field bytes.
    pub fn select_target(target: u8) -> Self {
        Self::from_kind(ExchangeKind::SelectTarget { target })
    }

    /// Bootloader status read.
    pub fn status_read(dest: ByteCell) -> Self {
        Self::from_kind(ExchangeKind::StatusRead { dest })
    }

    /// Bootloader status write.
    pub fn status_write(status: u8) -> Self {
        Self::from_kind(ExchangeKind::StatusWrite { status })
    }

    /// Serial-number read.
    pub fn serial_read(dest: WordCell) -> Self {
        Self::from_kind(ExchangeKind::SerialRead { dest })
    }

    /// Serial-number write.
    pub fn serial_write(serial: u32) -> Self {
        Self::from_kind(ExchangeKind::SerialWrite { serial })
    }

    /// Sector upload. `payload` must be exactly [`SECTOR_SIZE`] bytes; the
    /// caller pads the final partial sector.
    pub fn sector_write(index: u16, payload: Vec<u8>) -> Self {
        debug_assert_eq!(payload.len(), SECTOR_SIZE);
        Self::from_kind(ExchangeKind::SectorWrite { index, payload })
    }

    /// Single register write.
    pub fn register_write(addr: u8, value: u8) -> Self {
        Self::from_kind(ExchangeKind::RegisterWrite { addr, value })
    }

    /// Single register read.
    pub fn register_read(addr: u8, dest: ByteCell) -> Self {
        Self::from_kind(ExchangeKind::RegisterRead { addr, dest })
    }

    /// N-times register write. The wire count field is 16 bits, so at most
    /// `u16::MAX` values fit in one exchange.
    pub fn multi_register_write(addr: u8, values: Vec<u8>) -> CommResult<Self> {
        Self::check_bulk_len(values.len())?;
        Ok(Self::from_kind(ExchangeKind::MultiRegisterWrite {
            addr,
            values,
        }))
    }

    /// N-times register read.
    pub fn multi_register_read(addr: u8, count: u16, dest: BufferCell) -> Self {
        Self::from_kind(ExchangeKind::MultiRegisterRead { addr, count, dest })
    }

    /// Auto-address-increment write. The wire count field is 16 bits, so at
    /// most `u16::MAX` values fit in one exchange.
    pub fn auto_inc_write(addr: u8, values: Vec<u8>) -> CommResult<Self> {
        Self::check_bulk_len(values.len())?;
        Ok(Self::from_kind(ExchangeKind::AutoIncWrite { addr, values }))
    }

    fn check_bulk_len(len: usize) -> CommResult<()> {
        let max = usize::from(u16::MAX);
        if len > max {
            return Err(CommError::PayloadTooLarge { len, max });
        }
        Ok(())
    }

    /// Auto-address-increment read.
    pub fn auto_inc_read(addr: u8, count: u16, dest: BufferCell) -> Self {
        Self::from_kind(ExchangeKind::AutoIncRead { addr, count, dest })
    }

    /// Global interrupt enable.
    pub fn interrupt_enable() -> Self {
        Self::from_kind(ExchangeKind::InterruptEnable)
    }

    /// Overrides the receive timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Attaches a completion callback, invoked with the decoded reply payload
    /// when results are written back.
    pub fn with_callback(mut self, callback: ResultCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Short operation name for log output.
    pub fn name(&self) -> &'static str {
        match &self.kind {
            ExchangeKind::DetectProbe { .. } => "detect probe",
            ExchangeKind::SelectTarget { .. } => "select target",
            ExchangeKind::StatusRead { .. } => "status read",
            ExchangeKind::StatusWrite { .. } => "status write",
            ExchangeKind::SerialRead { .. } => "serial read",
            ExchangeKind::SerialWrite { .. } => "serial write",
            ExchangeKind::SectorWrite { .. } => "sector write",
            ExchangeKind::RegisterWrite { .. } => "register write",
            ExchangeKind::RegisterRead { .. } => "register read",
            ExchangeKind::MultiRegisterWrite { .. } => "register write xN",
            ExchangeKind::MultiRegisterRead { .. } => "register read xN",
            ExchangeKind::AutoIncWrite { .. } => "auto-inc write",
            ExchangeKind::AutoIncRead { .. } => "auto-inc read",
            ExchangeKind::InterruptEnable => "interrupt enable",
        }
    }

    /// Assigns the message id (the second request byte on register
    /// operations, carrying the core index). At most one assignment per
    /// instance; must happen before the request is built.
    pub fn set_id(&mut self, id: u8) -> CommResult<()> {
        if self.id_assigned {
            return Err(CommError::IdReassigned { old: self.id, new: id });
        }
        debug_assert!(self.request.is_none(), "id assigned after request build");
        self.id = id;
        self.id_assigned = true;
        Ok(())
    }

    /// The assigned message id (0 when never assigned).
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Receive timeout for one reply attempt.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether a completion callback is attached.
    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    /// Constant request length for this operation.
    pub fn request_len(&self) -> usize {
        match &self.kind {
            ExchangeKind::DetectProbe { .. }
            | ExchangeKind::StatusRead { .. }
            | ExchangeKind::SerialRead { .. }
            | ExchangeKind::InterruptEnable => 1,
            ExchangeKind::SelectTarget { .. } | ExchangeKind::StatusWrite { .. } => 3,
            ExchangeKind::SerialWrite { .. } => 6,
            ExchangeKind::SectorWrite { payload, .. } => 1 + 2 + payload.len() + 4,
            ExchangeKind::RegisterWrite { .. } => 5,
            ExchangeKind::RegisterRead { .. } => 4,
            ExchangeKind::MultiRegisterWrite { values, .. }
            | ExchangeKind::AutoIncWrite { values, .. } => 6 + values.len(),
            ExchangeKind::MultiRegisterRead { .. } | ExchangeKind::AutoIncRead { .. } => 6,
        }
    }

    /// Expected reply length on success, opcode included.
    pub fn success_len(&self) -> usize {
        match &self.kind {
            ExchangeKind::DetectProbe { .. } | ExchangeKind::StatusRead { .. } => 3,
            ExchangeKind::SerialRead { .. } => 6,
            ExchangeKind::RegisterRead { .. } => 3,
            ExchangeKind::MultiRegisterRead { count, .. }
            | ExchangeKind::AutoIncRead { count, .. } => 2 + usize::from(*count),
            _ => 1,
        }
    }

    /// Expected reply length on board-reported error, opcode included.
    pub fn error_len(&self) -> usize {
        // Every operation NACKs with the bare opcode.
        1
    }

    /// Reply opcode that signals success.
    pub fn success_opcode(&self) -> u8 {
        match &self.kind {
            ExchangeKind::DetectProbe { .. } => DETECT_REPLY,
            ExchangeKind::StatusRead { .. } => OP_STATUS_READ,
            ExchangeKind::SerialRead { .. } => OP_SERIAL_READ,
            ExchangeKind::RegisterRead { .. } => OP_REGISTER_READ,
            ExchangeKind::MultiRegisterRead { .. } => OP_REGISTER_READ_N,
            ExchangeKind::AutoIncRead { .. } => OP_REGISTER_READ_AAI,
            _ => ACK,
        }
    }

    /// Builds the request frame. Idempotent: once built, repeated calls
    /// return the same cached frame.
    pub fn build_request(&mut self) -> &Frame {
        if self.request.is_none() {
            let bytes = self.encode_request();
            debug_assert_eq!(bytes.len(), self.request_len());
            self.request = Some(Frame::new(bytes));
        }
        // Populated just above.
        match &self.request {
            Some(frame) => frame,
            None => unreachable!(),
        }
    }

    fn encode_request(&self) -> Vec<u8> {
        let mut bytes = match &self.kind {
            ExchangeKind::DetectProbe { .. } => vec![DETECT_PROBE],
            ExchangeKind::SelectTarget { target } => vec![OP_SELECT_TARGET, *target],
            ExchangeKind::StatusRead { .. } => vec![OP_STATUS_READ],
            ExchangeKind::StatusWrite { status } => vec![OP_STATUS_WRITE, *status],
            ExchangeKind::SerialRead { .. } => vec![OP_SERIAL_READ],
            ExchangeKind::SerialWrite { serial } => {
                let mut bytes = vec![OP_SERIAL_WRITE];
                bytes.extend_from_slice(&serial.to_le_bytes());
                bytes
            }
            ExchangeKind::SectorWrite { index, payload } => {
                let mut bytes = Vec::with_capacity(self.request_len());
                bytes.push(OP_SECTOR_WRITE);
                bytes.extend_from_slice(&index.to_le_bytes());
                bytes.extend_from_slice(payload);
                let sum = adler32(&bytes[1..]);
                bytes.extend_from_slice(&sum.to_le_bytes());
                return bytes;
            }
            ExchangeKind::RegisterWrite { addr, value } => {
                vec![OP_REGISTER_WRITE, self.id, *addr, *value]
            }
            ExchangeKind::RegisterRead { addr, .. } => vec![OP_REGISTER_READ, self.id, *addr],
            ExchangeKind::MultiRegisterWrite { addr, values } => {
                let mut bytes = vec![OP_REGISTER_WRITE_N, self.id, *addr];
                bytes.extend_from_slice(&(values.len() as u16).to_le_bytes());
                bytes.extend_from_slice(values);
                bytes
            }
            ExchangeKind::MultiRegisterRead { addr, count, .. } => {
                let mut bytes = vec![OP_REGISTER_READ_N, self.id, *addr];
                bytes.extend_from_slice(&count.to_le_bytes());
                bytes
            }
            ExchangeKind::AutoIncWrite { addr, values } => {
                let mut bytes = vec![OP_REGISTER_WRITE_AAI, self.id, *addr];
                bytes.extend_from_slice(&(values.len() as u16).to_le_bytes());
                bytes.extend_from_slice(values);
                bytes
            }
            ExchangeKind::AutoIncRead { addr, count, .. } => {
                let mut bytes = vec![OP_REGISTER_READ_AAI, self.id, *addr];
                bytes.extend_from_slice(&count.to_le_bytes());
                bytes
            }
            ExchangeKind::InterruptEnable => vec![OP_INTERRUPT_ENABLE],
        };
        // Single-byte requests carry no checksum; everything else appends the
        // XOR parity of the bytes after the opcode.
        if bytes.len() > 1 {
            bytes.push(xor_parity(&bytes[1..]));
        }
        bytes
    }

    /// Checks the success-reply checksum. Pure; ACK-only replies have no
    /// checksum and always validate.
    pub fn validate_success(&self, reply: &[u8]) -> bool {
        if self.success_len() <= 1 {
            return true;
        }
        if reply.len() != self.success_len() {
            return false;
        }
        let Some((&embedded, payload)) = reply[1..].split_last() else {
            return false;
        };
        embedded == xor_parity(payload)
    }

    /// Checks the error-reply checksum. The bare NACK carries none, so this
    /// always validates.
    pub fn validate_error(&self, _reply: &[u8]) -> bool {
        true
    }

    /// Stores the fully-read success reply for later decoding.
    pub fn set_reply(&mut self, reply: Frame) {
        self.reply = Some(reply);
    }

    /// The stored success reply, if one has been received.
    pub fn reply(&self) -> Option<&Frame> {
        self.reply.as_ref()
    }

    /// Decoded payload of the stored reply: the bytes between opcode and
    /// checksum, empty for ACK-only replies.
    fn reply_payload(&self) -> &[u8] {
        match &self.reply {
            Some(frame) if frame.len() > 2 => &frame.as_bytes()[1..frame.len() - 1],
            _ => &[],
        }
    }

    /// Copies decoded reply fields into the caller-supplied destinations and
    /// invokes the completion callback. No-op for write-only operations
    /// without a callback; logs a warning if no reply is stored.
    pub fn write_results(&mut self) {
        if self.reply.is_none() {
            warn!("'{}': write_results without a stored reply", self.name());
            return;
        }
        let payload: Vec<u8> = self.reply_payload().to_vec();
        match &self.kind {
            ExchangeKind::DetectProbe { class } => {
                if let Some(&byte) = payload.first() {
                    class.set(byte);
                }
            }
            ExchangeKind::StatusRead { dest } | ExchangeKind::RegisterRead { dest, .. } => {
                if let Some(&byte) = payload.first() {
                    dest.set(byte);
                }
            }
            ExchangeKind::SerialRead { dest } => {
                if payload.len() == 4 {
                    let mut raw = [0u8; 4];
                    raw.copy_from_slice(&payload);
                    dest.set(u32::from_le_bytes(raw));
                }
            }
            ExchangeKind::MultiRegisterRead { dest, .. }
            | ExchangeKind::AutoIncRead { dest, .. } => {
                let mut buffer = dest.borrow_mut();
                buffer.clear();
                buffer.extend_from_slice(&payload);
            }
            _ => {}
        }
        if let Some(callback) = self.callback.as_mut() {
            callback(&payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::NACK;

    #[test]
    fn register_write_layout() {
        let mut ex = Exchange::register_write(0x07, 0xAB);
        ex.set_id(3).unwrap();
        let frame = ex.build_request();
        assert_eq!(
            frame.as_bytes(),
            &[OP_REGISTER_WRITE, 0x03, 0x07, 0xAB, 0x03 ^ 0x07 ^ 0xAB]
        );
        assert_eq!(frame.id(), Some(0x03));
    }

    #[test]
    fn build_request_is_idempotent() {
        let mut ex = Exchange::register_read(0x01, Rc::new(Cell::new(0)));
        let first = ex.build_request().to_vec();
        let second = ex.build_request().to_vec();
        assert_eq!(first, second);
    }

    #[test]
    fn id_reassignment_is_rejected() {
        let mut ex = Exchange::register_read(0x01, Rc::new(Cell::new(0)));
        ex.set_id(2).unwrap();
        let err = ex.set_id(4).unwrap_err();
        assert!(matches!(
            err,
            CommError::IdReassigned { old: 2, new: 4 }
        ));
    }

    #[test]
    fn embedded_request_checksum_agrees_with_validator() {
        // The read-register request and its success reply share the
        // opcode/payload/parity shape, so the success validator must accept
        // the request's own bytes.
        let mut ex = Exchange::register_read(0x31, Rc::new(Cell::new(0)));
        ex.set_id(1).unwrap();
        let bytes = ex.build_request().to_vec();
        let (&embedded, payload) = bytes[1..].split_last().unwrap();
        assert_eq!(embedded, xor_parity(payload));
    }

    #[test]
    fn bulk_write_payload_round_trips() {
        for n in [1usize, 2, 17, 255, 4096] {
            let values: Vec<u8> = (0..n).map(|i| (i % 251) as u8).collect();
            let mut ex = Exchange::auto_inc_write(0x10, values.clone()).unwrap();
            assert_eq!(ex.request_len(), 6 + n);
            let frame = ex.build_request();
            let bytes = frame.as_bytes();
            assert_eq!(&bytes[3..5], &(n as u16).to_le_bytes());
            assert_eq!(&bytes[5..5 + n], values.as_slice());
        }
    }

    #[test]
    fn bulk_writes_past_the_count_field_are_rejected() {
        // The count field is u16; a 70,000-value payload must not wrap it.
        let err = Exchange::multi_register_write(0x01, vec![0u8; 70_000]).unwrap_err();
        assert!(matches!(
            err,
            CommError::PayloadTooLarge { len: 70_000, max: 65_535 }
        ));
        let err = Exchange::auto_inc_write(0x01, vec![0u8; 65_536]).unwrap_err();
        assert!(matches!(err, CommError::PayloadTooLarge { .. }));
        // The largest representable count still encodes.
        let mut ex = Exchange::multi_register_write(0x01, vec![0u8; 65_535]).unwrap();
        let bytes = ex.build_request().to_vec();
        assert_eq!(&bytes[3..5], &u16::MAX.to_le_bytes());
    }

    #[test]
    fn bulk_read_lengths_scale_with_count() {
        let dest = Rc::new(RefCell::new(Vec::new()));
        let ex = Exchange::multi_register_read(0x02, 40, dest);
        assert_eq!(ex.request_len(), 6);
        assert_eq!(ex.success_len(), 42);
    }

    #[test]
    fn sector_write_carries_adler_trailer() {
        let payload = vec![0x5A; SECTOR_SIZE];
        let mut ex = Exchange::sector_write(7, payload.clone());
        let bytes = ex.build_request().to_vec();
        assert_eq!(bytes.len(), 1 + 2 + SECTOR_SIZE + 4);
        assert_eq!(bytes[0], OP_SECTOR_WRITE);
        assert_eq!(&bytes[1..3], &7u16.to_le_bytes());
        let sum = adler32(&bytes[1..3 + SECTOR_SIZE]);
        assert_eq!(&bytes[3 + SECTOR_SIZE..], &sum.to_le_bytes());
    }

    #[test]
    fn success_validation_checks_reply_parity() {
        let dest = Rc::new(Cell::new(0));
        let ex = Exchange::register_read(0x01, dest);
        assert!(ex.validate_success(&[OP_REGISTER_READ, 0x42, 0x42]));
        assert!(!ex.validate_success(&[OP_REGISTER_READ, 0x42, 0x00]));
        // Bare NACK always passes error validation.
        assert!(ex.validate_error(&[NACK]));
    }

    #[test]
    fn ack_only_replies_validate_unconditionally() {
        let ex = Exchange::register_write(0x01, 0xFF);
        assert!(ex.validate_success(&[ACK]));
    }

    #[test]
    fn write_results_fills_byte_destination() {
        let dest = Rc::new(Cell::new(0));
        let mut ex = Exchange::register_read(0x01, Rc::clone(&dest));
        ex.set_reply(Frame::new(vec![OP_REGISTER_READ, 0x42, 0x42]));
        ex.write_results();
        assert_eq!(dest.get(), 0x42);
    }

    #[test]
    fn write_results_fills_serial_destination() {
        let dest = Rc::new(Cell::new(0u32));
        let mut ex = Exchange::serial_read(Rc::clone(&dest));
        let mut reply = vec![OP_SERIAL_READ];
        reply.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        reply.push(xor_parity(&reply[1..]));
        ex.set_reply(Frame::new(reply));
        ex.write_results();
        assert_eq!(dest.get(), 0xDEAD_BEEF);
    }

    #[test]
    fn write_results_fills_buffer_and_invokes_callback() {
        let dest = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_in_cb = Rc::clone(&seen);
        let mut ex = Exchange::multi_register_read(0x02, 3, Rc::clone(&dest)).with_callback(
            Box::new(move |payload| {
                seen_in_cb.borrow_mut().extend_from_slice(payload);
            }),
        );
        let mut reply = vec![OP_REGISTER_READ_N, 1, 2, 3];
        reply.push(xor_parity(&reply[1..]));
        ex.set_reply(Frame::new(reply));
        ex.write_results();
        assert_eq!(*dest.borrow(), vec![1, 2, 3]);
        assert_eq!(*seen.borrow(), vec![1, 2, 3]);
    }
}
