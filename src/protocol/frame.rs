//! Fixed-length wire message buffer.

/// One transmitted or received wire message.
///
/// A frame is immutable after construction. It is created either by an
/// exchange building its request or by a task that has fully read a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Box<[u8]>,
}

impl Frame {
    /// Wraps a fully-assembled message. Frames are never empty; every wire
    /// message carries at least its opcode.
    pub fn new(bytes: Vec<u8>) -> Self {
        debug_assert!(!bytes.is_empty(), "wire messages carry at least an opcode");
        Self {
            bytes: bytes.into_boxed_slice(),
        }
    }

    /// Operation code: the first byte of the message.
    pub fn opcode(&self) -> u8 {
        self.bytes.first().copied().unwrap_or(0)
    }

    /// Message id: the second byte, present only on messages longer than two
    /// bytes (shorter messages have no id field).
    pub fn id(&self) -> Option<u8> {
        if self.bytes.len() > 2 {
            self.bytes.get(1).copied()
        } else {
            None
        }
    }

    /// Total message length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the frame is empty. Always false for well-formed frames.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The raw message bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// A raw copy of the message bytes.
    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.to_vec()
    }
}
