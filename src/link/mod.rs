//! Transport seam between the task machinery and the physical serial device.
//!
//! Tasks and the executor talk to a [`Link`] trait object so the protocol
//! logic can be exercised against the in-memory [`mock::MockLink`] double in
//! tests, with [`serial::SerialConnection`] as the production implementation.

pub mod mock;
pub mod serial;

use crate::error::CommResult;
use std::time::Duration;

/// Raw byte transport for one half-duplex wire.
pub trait Link {
    /// Writes exactly `bytes`. A short write is a send failure; there is no
    /// partial-write recovery.
    fn send(&mut self, bytes: &[u8]) -> CommResult<()>;

    /// Reads exactly `buf.len()` bytes, applying `timeout` per read chunk.
    /// On a stall the partially-filled buffer is discarded and a timeout
    /// error is returned.
    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> CommResult<()>;

    /// Bytes queued for transmission, or `None` when not connected.
    fn send_queue_len(&self) -> Option<usize>;

    /// Bytes waiting in the receive queue, or `None` when not connected.
    fn receive_queue_len(&self) -> Option<usize>;

    /// Drops buffered bytes on both sides and drains any residue from the
    /// receive queue.
    fn flush(&mut self) -> CommResult<()>;
}
