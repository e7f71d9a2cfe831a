//! Scriptable in-memory transport for tests.
//!
//! `MockLink` stands in for the serial device: tests script reply chunks
//! that become readable when the engine sends a request, and inspect the log
//! of everything the engine wrote. Shipped in the library (not behind
//! `cfg(test)`) so downstream peripheral crates can test against the engine
//! without hardware.

use crate::error::{CommError, CommResult};
use crate::link::Link;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// In-memory [`Link`] double with scripted replies and a send log.
#[derive(Default)]
pub struct MockLink {
    sent: Vec<Vec<u8>>,
    sent_at: Vec<Instant>,
    script: VecDeque<Vec<u8>>,
    stream: VecDeque<u8>,
    fail_sends: usize,
}

impl MockLink {
    /// A mock with nothing scripted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts a reply chunk: the bytes become readable when the next
    /// unanswered send happens, mirroring the board's request/reply rhythm.
    pub fn enqueue_reply(&mut self, bytes: &[u8]) {
        self.script.push_back(bytes.to_vec());
    }

    /// Makes bytes readable immediately, bypassing the send-triggered
    /// script. Used to plant residual bytes.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.stream.extend(bytes.iter().copied());
    }

    /// Fails the next `count` sends with a short-write error.
    pub fn fail_next_sends(&mut self, count: usize) {
        self.fail_sends = count;
    }

    /// Every frame sent so far, in order.
    pub fn sent(&self) -> &[Vec<u8>] {
        &self.sent
    }

    /// Timestamps of each successful send, matching [`sent`](Self::sent).
    pub fn sent_at(&self) -> &[Instant] {
        &self.sent_at
    }

    /// Bytes scripted but not yet readable.
    pub fn pending_script(&self) -> usize {
        self.script.len()
    }
}

impl Link for MockLink {
    fn send(&mut self, bytes: &[u8]) -> CommResult<()> {
        if self.fail_sends > 0 {
            self.fail_sends -= 1;
            return Err(CommError::ShortWrite {
                written: 0,
                expected: bytes.len(),
            });
        }
        self.sent.push(bytes.to_vec());
        self.sent_at.push(Instant::now());
        if let Some(reply) = self.script.pop_front() {
            self.stream.extend(reply);
        }
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8], _timeout: Duration) -> CommResult<()> {
        if self.stream.len() < buf.len() {
            // Partial fills are discarded, as on the real transport.
            let got = self.stream.len();
            self.stream.clear();
            return Err(CommError::ReceiveTimeout {
                got,
                expected: buf.len(),
            });
        }
        for slot in buf.iter_mut() {
            // Length checked above.
            *slot = self.stream.pop_front().unwrap_or_default();
        }
        Ok(())
    }

    fn send_queue_len(&self) -> Option<usize> {
        Some(0)
    }

    fn receive_queue_len(&self) -> Option<usize> {
        Some(self.stream.len())
    }

    fn flush(&mut self) -> CommResult<()> {
        self.stream.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_reply_becomes_readable_after_send() {
        let mut link = MockLink::new();
        link.enqueue_reply(&[0x00]);
        assert_eq!(link.receive_queue_len(), Some(0));

        link.send(&[0xEE]).unwrap();
        assert_eq!(link.receive_queue_len(), Some(1));

        let mut buf = [0u8; 1];
        link.receive(&mut buf, Duration::from_millis(1)).unwrap();
        assert_eq!(buf[0], 0x00);
    }

    #[test]
    fn underrun_discards_partial_bytes() {
        let mut link = MockLink::new();
        link.push_bytes(&[0x01]);
        let mut buf = [0u8; 2];
        let err = link.receive(&mut buf, Duration::from_millis(1)).unwrap_err();
        assert!(matches!(
            err,
            CommError::ReceiveTimeout { got: 1, expected: 2 }
        ));
        assert_eq!(link.receive_queue_len(), Some(0));
    }

    #[test]
    fn injected_send_failures_are_consumed() {
        let mut link = MockLink::new();
        link.fail_next_sends(1);
        assert!(link.send(&[0x00]).is_err());
        assert!(link.send(&[0x00]).is_ok());
        assert_eq!(link.sent().len(), 1);
    }
}
