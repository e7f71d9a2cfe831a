//! Per-request execution state machine.
//!
//! A [`Task`] couples one exchange to one occurrence on the wire and drives
//! its send/receive states, including transparent interrupt interception
//! during receive. [`SyncTask`] runs send-then-receive to completion;
//! [`AsyncTask`] exposes the two steps independently so the executor can keep
//! many in flight.

use crate::error::{CommError, CommResult};
use crate::link::Link;
use crate::protocol::checksum::xor_parity;
use crate::protocol::exchange::Exchange;
use crate::protocol::frame::Frame;
use crate::protocol::{INTERRUPT, NACK};
use log::{debug, trace, warn};
use std::cell::Cell;
use std::rc::Rc;

/// Shared slot the receive path records the last triggering core into.
pub type InterruptSlot = Rc<Cell<Option<u8>>>;

/// Outcome of the send step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
    /// `send()` has not run since construction or the last reset.
    NotExecuted,
    /// The request went out in full.
    Success,
    /// The transport rejected or truncated the request.
    Failure,
}

/// Outcome of the receive step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveState {
    /// `receive()` has not run since construction or the last reset.
    NotExecuted,
    /// Success reply received and validated.
    Success,
    /// The board reported a NACK.
    Failure,
    /// Reply checksum did not match.
    ChecksumError,
    /// Reply opened with an opcode this exchange cannot explain.
    UnexpectedOpcodeError,
    /// No reply byte arrived within the timeout.
    ConnectionError,
}

/// One exchange occurrence in flight on the wire.
pub struct Task {
    exchange: Exchange,
    number: u64,
    attempts: u32,
    send_state: SendState,
    receive_state: ReceiveState,
    interrupt_slot: Option<InterruptSlot>,
}

impl Task {
    /// Couples `exchange` to occurrence `number`. The slot, when given,
    /// receives intercepted interrupt notifications.
    pub fn new(exchange: Exchange, number: u64, interrupt_slot: Option<InterruptSlot>) -> Self {
        Self {
            exchange,
            number,
            attempts: 0,
            send_state: SendState::NotExecuted,
            receive_state: ReceiveState::NotExecuted,
            interrupt_slot,
        }
    }

    /// Monotonic task number, unique within its executor counter.
    pub fn number(&self) -> u64 {
        self.number
    }

    /// How many times `send()` has run for this occurrence.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Current send state.
    pub fn send_state(&self) -> SendState {
        self.send_state
    }

    /// Current receive state.
    pub fn receive_state(&self) -> ReceiveState {
        self.receive_state
    }

    /// The owned exchange.
    pub fn exchange(&self) -> &Exchange {
        &self.exchange
    }

    /// The owned exchange, mutably.
    pub fn exchange_mut(&mut self) -> &mut Exchange {
        &mut self.exchange
    }

    /// Consumes the task, yielding its exchange.
    pub fn into_exchange(self) -> Exchange {
        self.exchange
    }

    /// Rearms both states for a resend of the same occurrence. The attempt
    /// counter keeps counting.
    pub fn reset(&mut self) {
        self.send_state = SendState::NotExecuted;
        self.receive_state = ReceiveState::NotExecuted;
    }

    /// Builds (or reuses) the request frame and writes it out.
    pub fn send(&mut self, link: &mut dyn Link) -> SendState {
        self.attempts += 1;
        let name = self.exchange.name();
        let frame = self.exchange.build_request();
        trace!(
            "Task {} ('{}') attempt {}: sending {} bytes",
            self.number,
            name,
            self.attempts,
            frame.len()
        );
        self.send_state = match link.send(frame.as_bytes()) {
            Ok(()) => SendState::Success,
            Err(err) => {
                warn!("Task {} ('{}') send failed: {}", self.number, name, err);
                SendState::Failure
            }
        };
        self.send_state
    }

    /// Reads and classifies exactly one reply, absorbing at most one
    /// interleaved interrupt notification.
    ///
    /// A second consecutive interrupt, or an interrupt with a corrupt parity
    /// byte, means the wire state cannot be trusted and is returned as a
    /// typed fatal error rather than a retryable state.
    pub fn receive(&mut self, link: &mut dyn Link) -> CommResult<ReceiveState> {
        let timeout = self.exchange.timeout();
        let mut intercepted = false;
        loop {
            let mut opcode = [0u8; 1];
            if link.receive(&mut opcode, timeout).is_err() {
                self.receive_state = ReceiveState::ConnectionError;
                return Ok(self.receive_state);
            }
            let opcode = opcode[0];

            if opcode == self.exchange.success_opcode() {
                self.receive_state = self.read_reply(link, opcode, self.exchange.success_len())?;
                return Ok(self.receive_state);
            }
            if opcode == NACK {
                self.receive_state = self.read_error(link, opcode)?;
                return Ok(self.receive_state);
            }
            if opcode == INTERRUPT {
                // The board inserts at most one notification before a regular
                // reply; a second one means the wire is desynchronized.
                if intercepted {
                    return Err(CommError::InterruptStorm);
                }
                self.intercept_interrupt(link)?;
                intercepted = true;
                continue;
            }

            warn!(
                "Task {} ('{}'): unexpected reply opcode {:#04x}",
                self.number,
                self.exchange.name(),
                opcode
            );
            self.receive_state = ReceiveState::UnexpectedOpcodeError;
            return Ok(self.receive_state);
        }
    }

    fn read_reply(
        &mut self,
        link: &mut dyn Link,
        opcode: u8,
        total_len: usize,
    ) -> CommResult<ReceiveState> {
        let mut reply = vec![0u8; total_len];
        reply[0] = opcode;
        if total_len > 1
            && link
                .receive(&mut reply[1..], self.exchange.timeout())
                .is_err()
        {
            return Ok(ReceiveState::ConnectionError);
        }
        if self.exchange.validate_success(&reply) {
            self.exchange.set_reply(Frame::new(reply));
            Ok(ReceiveState::Success)
        } else {
            warn!(
                "Task {} ('{}'): success reply failed checksum",
                self.number,
                self.exchange.name()
            );
            Ok(ReceiveState::ChecksumError)
        }
    }

    fn read_error(&mut self, link: &mut dyn Link, opcode: u8) -> CommResult<ReceiveState> {
        let total_len = self.exchange.error_len();
        let mut reply = vec![0u8; total_len];
        reply[0] = opcode;
        if total_len > 1
            && link
                .receive(&mut reply[1..], self.exchange.timeout())
                .is_err()
        {
            return Ok(ReceiveState::ConnectionError);
        }
        if self.exchange.validate_error(&reply) {
            debug!(
                "Task {} ('{}'): board reported NACK",
                self.number,
                self.exchange.name()
            );
            Ok(ReceiveState::Failure)
        } else {
            Ok(ReceiveState::ChecksumError)
        }
    }

    fn intercept_interrupt(&mut self, link: &mut dyn Link) -> CommResult<()> {
        let mut payload = [0u8; 2];
        if link.receive(&mut payload, self.exchange.timeout()).is_err() {
            // Half an interrupt on the wire; nothing downstream can resync.
            return Err(CommError::Desynchronized(1));
        }
        let [core, parity] = payload;
        if parity != xor_parity(&[core]) {
            return Err(CommError::InterruptParity { core, parity });
        }
        debug!(
            "Task {} intercepted interrupt from core {}",
            self.number, core
        );
        if let Some(slot) = &self.interrupt_slot {
            slot.set(Some(core));
        }
        Ok(())
    }
}

/// Task executed to completion before returning.
pub struct SyncTask {
    inner: Task,
}

impl SyncTask {
    /// Wraps `task` for synchronous execution.
    pub fn new(task: Task) -> Self {
        Self { inner: task }
    }

    /// Runs `send()` and, only if the send went out, `receive()`.
    pub fn execute(&mut self, link: &mut dyn Link) -> CommResult<()> {
        if self.inner.send(link) == SendState::Success {
            self.inner.receive(link)?;
        }
        Ok(())
    }

    /// The wrapped task.
    pub fn task(&self) -> &Task {
        &self.inner
    }

    /// The wrapped task, mutably.
    pub fn task_mut(&mut self) -> &mut Task {
        &mut self.inner
    }

    /// Consumes the wrapper, yielding the task.
    pub fn into_task(self) -> Task {
        self.inner
    }
}

/// Task whose send and receive steps are invoked independently, so the
/// executor can pipeline many on one wire.
pub struct AsyncTask {
    inner: Task,
}

impl AsyncTask {
    /// Wraps `task` for pipelined execution.
    pub fn new(task: Task) -> Self {
        Self { inner: task }
    }

    /// Runs the send step.
    pub fn execute_send(&mut self, link: &mut dyn Link) -> SendState {
        self.inner.send(link)
    }

    /// Runs the receive step.
    pub fn execute_receive(&mut self, link: &mut dyn Link) -> CommResult<ReceiveState> {
        self.inner.receive(link)
    }

    /// The wrapped task.
    pub fn task(&self) -> &Task {
        &self.inner
    }

    /// The wrapped task, mutably.
    pub fn task_mut(&mut self) -> &mut Task {
        &mut self.inner
    }

    /// Consumes the wrapper, yielding the task.
    pub fn into_task(self) -> Task {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::mock::MockLink;
    use crate::protocol::{ACK, OP_REGISTER_READ};
    use std::cell::Cell;
    use std::rc::Rc;

    fn read_task(slot: Option<InterruptSlot>) -> Task {
        let dest = Rc::new(Cell::new(0));
        Task::new(Exchange::register_read(0x04, dest), 1, slot)
    }

    #[test]
    fn clean_success_on_first_attempt() {
        let mut link = MockLink::new();
        link.enqueue_reply(&[OP_REGISTER_READ, 0x55, 0x55]);

        let mut task = SyncTask::new(read_task(None));
        task.execute(&mut link).unwrap();

        assert_eq!(task.task().send_state(), SendState::Success);
        assert_eq!(task.task().receive_state(), ReceiveState::Success);
        assert_eq!(task.task().attempts(), 1);
        assert_eq!(link.sent().len(), 1);
    }

    #[test]
    fn nack_reply_is_a_failure_state() {
        let mut link = MockLink::new();
        link.enqueue_reply(&[NACK]);

        let mut task = SyncTask::new(read_task(None));
        task.execute(&mut link).unwrap();
        assert_eq!(task.task().receive_state(), ReceiveState::Failure);
    }

    #[test]
    fn corrupt_checksum_is_a_checksum_error() {
        let mut link = MockLink::new();
        link.enqueue_reply(&[OP_REGISTER_READ, 0x55, 0x00]);

        let mut task = SyncTask::new(read_task(None));
        task.execute(&mut link).unwrap();
        assert_eq!(task.task().receive_state(), ReceiveState::ChecksumError);
    }

    #[test]
    fn unknown_opcode_is_unexpected() {
        let mut link = MockLink::new();
        link.enqueue_reply(&[0x77]);

        let mut task = SyncTask::new(read_task(None));
        task.execute(&mut link).unwrap();
        assert_eq!(
            task.task().receive_state(),
            ReceiveState::UnexpectedOpcodeError
        );
    }

    #[test]
    fn silent_wire_is_a_connection_error() {
        let mut link = MockLink::new();
        let mut task = SyncTask::new(read_task(None));
        task.execute(&mut link).unwrap();
        assert_eq!(task.task().receive_state(), ReceiveState::ConnectionError);
    }

    #[test]
    fn interrupt_is_absorbed_before_the_reply() {
        let mut link = MockLink::new();
        // Interrupt from core 3, then the regular success reply.
        link.enqueue_reply(&[INTERRUPT, 3, 3, OP_REGISTER_READ, 0x55, 0x55]);

        let slot: InterruptSlot = Rc::new(Cell::new(None));
        let mut task = SyncTask::new(read_task(Some(Rc::clone(&slot))));
        task.execute(&mut link).unwrap();

        assert_eq!(task.task().receive_state(), ReceiveState::Success);
        assert_eq!(slot.get(), Some(3));
    }

    #[test]
    fn interrupt_before_ack_decode_is_transparent() {
        let mut link = MockLink::new();
        link.enqueue_reply(&[INTERRUPT, 3, 3, ACK]);

        let slot: InterruptSlot = Rc::new(Cell::new(None));
        let exchange = Exchange::register_write(0x04, 0x01);
        let mut task = SyncTask::new(Task::new(exchange, 1, Some(Rc::clone(&slot))));
        task.execute(&mut link).unwrap();

        assert_eq!(task.task().receive_state(), ReceiveState::Success);
        assert_eq!(slot.get(), Some(3));
    }

    #[test]
    fn back_to_back_interrupts_are_fatal() {
        let mut link = MockLink::new();
        link.enqueue_reply(&[INTERRUPT, 3, 3, INTERRUPT, 4, 4]);

        let mut task = SyncTask::new(read_task(Some(Rc::new(Cell::new(None)))));
        let err = task.execute(&mut link).unwrap_err();
        assert!(matches!(err, CommError::InterruptStorm));
    }

    #[test]
    fn corrupt_interrupt_parity_is_fatal() {
        let mut link = MockLink::new();
        link.enqueue_reply(&[INTERRUPT, 3, 0x0F]);

        let mut task = SyncTask::new(read_task(Some(Rc::new(Cell::new(None)))));
        let err = task.execute(&mut link).unwrap_err();
        assert!(matches!(
            err,
            CommError::InterruptParity { core: 3, parity: 0x0F }
        ));
    }

    #[test]
    fn reset_rearms_states_but_keeps_attempts() {
        let mut link = MockLink::new();
        link.enqueue_reply(&[NACK]);
        link.enqueue_reply(&[OP_REGISTER_READ, 0x55, 0x55]);

        let mut task = SyncTask::new(read_task(None));
        task.execute(&mut link).unwrap();
        assert_eq!(task.task().receive_state(), ReceiveState::Failure);

        task.task_mut().reset();
        assert_eq!(task.task().send_state(), SendState::NotExecuted);
        task.execute(&mut link).unwrap();
        assert_eq!(task.task().receive_state(), ReceiveState::Success);
        assert_eq!(task.task().attempts(), 2);
    }
}
