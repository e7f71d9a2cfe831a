//! Task executor: retry policy, ordering and the asynchronous pipeline.
//!
//! The executor owns the per-process task counters, the retry budget, the
//! dependency map that delays a request until the task it depends on has
//! completed, and the running/finished queues that keep replies collected in
//! the exact order requests were sent. The board replies strictly in request
//! order (interrupt notifications aside), which is what makes the FIFO
//! collection correct.

use crate::error::{CommError, CommResult};
use crate::link::Link;
use crate::protocol::checksum::xor_parity;
use crate::protocol::exchange::Exchange;
use crate::protocol::INTERRUPT;
use crate::task::{AsyncTask, InterruptSlot, ReceiveState, SendState, SyncTask, Task};
use log::{debug, warn};
use std::cell::Cell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::time::Duration;

/// Per-core interrupt callbacks, keyed by core index.
pub type InterruptHandlers = HashMap<u8, Box<dyn FnMut()>>;

/// Timeout for reading residual bytes during resynchronization.
const RESYNC_READ_TIMEOUT: Duration = Duration::from_millis(20);

/// Owns retry, ordering and interrupt bookkeeping across many tasks.
pub struct TaskExecutor {
    max_retries: u32,
    sync_counter: u64,
    async_counter: u64,
    /// Tasks blocked behind the task number they depend on.
    pending: HashMap<u64, VecDeque<AsyncTask>>,
    /// Sent but not yet collected, in wire order.
    running: VecDeque<AsyncTask>,
    /// Collected but not yet written back to caller memory.
    finished: VecDeque<AsyncTask>,
    /// Task numbers usable as dependency keys.
    outstanding: HashSet<u64>,
    interrupt_slot: InterruptSlot,
}

impl TaskExecutor {
    /// An executor with the given resend budget per logical operation.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            sync_counter: 0,
            async_counter: 0,
            pending: HashMap::new(),
            running: VecDeque::new(),
            finished: VecDeque::new(),
            outstanding: HashSet::new(),
            interrupt_slot: Rc::new(Cell::new(None)),
        }
    }

    /// The shared slot interrupts are recorded into.
    pub fn interrupt_slot(&self) -> InterruptSlot {
        Rc::clone(&self.interrupt_slot)
    }

    /// Number of tasks sent but not yet collected.
    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    /// Number of tasks collected but not yet written back.
    pub fn finished_len(&self) -> usize {
        self.finished.len()
    }

    /// Number of tasks queued behind a dependency.
    pub fn pending_len(&self) -> usize {
        self.pending.values().map(VecDeque::len).sum()
    }

    /// Whether `number` may still be used as a dependency key.
    pub fn is_outstanding(&self, number: u64) -> bool {
        self.outstanding.contains(&number)
    }

    /// Executes one exchange to completion, retrying recoverable failures up
    /// to the configured budget.
    ///
    /// Outstanding asynchronous replies are drained first so the receive
    /// buffer holds nothing but this task's reply.
    pub fn do_sync_task(
        &mut self,
        name: &str,
        exchange: Exchange,
        link: &mut dyn Link,
        handlers: Option<&mut InterruptHandlers>,
    ) -> CommResult<()> {
        // An abandoned async operation reported by the drain belongs to its
        // own caller; only a distrusted wire blocks this task.
        match self.fetch_async_replies(link, handlers) {
            Ok(())
            | Err(CommError::RetriesExhausted { .. })
            | Err(CommError::SendFailed(_)) => {}
            Err(fatal) => return Err(fatal),
        }

        self.sync_counter += 1;
        let mut task = SyncTask::new(Task::new(
            exchange,
            self.sync_counter,
            Some(self.interrupt_slot()),
        ));

        loop {
            task.execute(link)?;
            let send_state = task.task().send_state();
            let receive_state = task.task().receive_state();
            match receive_state {
                ReceiveState::Success => {
                    task.task_mut().exchange_mut().write_results();
                    return Ok(());
                }
                // A failed send or a recoverable receive failure retries the
                // whole send+receive cycle.
                ReceiveState::Failure | ReceiveState::ChecksumError => {}
                ReceiveState::NotExecuted if send_state == SendState::Failure => {}
                // Unexpected opcode or a dead wire: the link state cannot be
                // trusted, so no further retries.
                other => {
                    return Err(CommError::Aborted {
                        name: name.to_string(),
                        reason: format!("{:?}", other),
                    });
                }
            }
            if task.task().attempts() > self.max_retries {
                return Err(CommError::RetriesExhausted {
                    name: name.to_string(),
                    attempts: task.task().attempts(),
                });
            }
            warn!(
                "'{}' attempt {} failed ({:?}); resending",
                name,
                task.task().attempts(),
                receive_state
            );
            task.task_mut().reset();
        }
    }

    /// Starts one pipelined exchange and returns its task number.
    ///
    /// With a nonzero `dependency` naming a still-outstanding task, the new
    /// task is queued behind it instead of being sent, preserving
    /// read-after-write order on a resource whose previous access has not
    /// completed. A send failure is reported without retry; the caller
    /// re-issues if desired.
    pub fn start_async_task(
        &mut self,
        name: &str,
        exchange: Exchange,
        dependency: u64,
        link: &mut dyn Link,
    ) -> CommResult<u64> {
        self.async_counter += 1;
        let number = self.async_counter;
        let mut task = AsyncTask::new(Task::new(exchange, number, Some(self.interrupt_slot())));

        if dependency > 0 && self.outstanding.contains(&dependency) {
            debug!(
                "'{}' (task {}) queued behind outstanding task {}",
                name, number, dependency
            );
            // Queued tasks are outstanding themselves: later starts may
            // chain on them before they ever reach the wire.
            self.outstanding.insert(number);
            self.pending.entry(dependency).or_default().push_back(task);
            return Ok(number);
        }

        match task.execute_send(link) {
            SendState::Success => {
                self.outstanding.insert(number);
                self.running.push_back(task);
                Ok(number)
            }
            _ => Err(CommError::SendFailed(name.to_string())),
        }
    }

    /// Collects replies for all running tasks in FIFO (wire) order.
    ///
    /// Recoverable failures are resent within the retry budget; exhausted or
    /// unrecoverable tasks are abandoned (the first such failure is returned
    /// after the drain) without blocking collection of the others. Residual
    /// bytes left in the receive queue afterwards are either a buried
    /// interrupt notification or a fatal desynchronization.
    pub fn fetch_async_replies(
        &mut self,
        link: &mut dyn Link,
        handlers: Option<&mut InterruptHandlers>,
    ) -> CommResult<()> {
        let mut overall: CommResult<()> = Ok(());

        while let Some(mut task) = self.running.pop_front() {
            let state = match task.execute_receive(link) {
                Ok(state) => state,
                Err(fatal) => {
                    // The wire state is lost; this task will never complete,
                    // so nothing may keep chaining on its number.
                    let number = task.task().number();
                    self.outstanding.remove(&number);
                    self.discard_dependents(number);
                    return Err(fatal);
                }
            };
            let number = task.task().number();
            let name = task.task().exchange().name();
            match state {
                ReceiveState::Success => {
                    self.outstanding.remove(&number);
                    self.release_dependents(number, link, &mut overall);
                    if task.task().exchange().has_callback() {
                        task.task_mut().exchange_mut().write_results();
                    } else {
                        self.finished.push_back(task);
                    }
                }
                ReceiveState::Failure | ReceiveState::ChecksumError
                    if task.task().attempts() <= self.max_retries =>
                {
                    warn!(
                        "Task {} ('{}') attempt {} failed ({:?}); resending",
                        number,
                        name,
                        task.task().attempts(),
                        state
                    );
                    task.task_mut().reset();
                    match task.execute_send(link) {
                        SendState::Success => self.running.push_back(task),
                        _ => self.abandon(task, &mut overall, link),
                    }
                }
                _ => {
                    warn!(
                        "Task {} ('{}') abandoned after {} attempts ({:?})",
                        number,
                        name,
                        task.task().attempts(),
                        state
                    );
                    self.abandon(task, &mut overall, link);
                }
            }
        }

        self.resynchronize(link)?;
        self.dispatch_interrupt(handlers);
        overall
    }

    /// Writes every buffered finished task's results back into caller
    /// memory. Callback-bearing tasks already did this during collection.
    pub fn write_replies(&mut self) {
        while let Some(mut task) = self.finished.pop_front() {
            task.task_mut().exchange_mut().write_results();
        }
    }

    fn abandon(&mut self, task: AsyncTask, overall: &mut CommResult<()>, link: &mut dyn Link) {
        let number = task.task().number();
        let name = task.task().exchange().name();
        if overall.is_ok() {
            *overall = Err(CommError::RetriesExhausted {
                name: name.to_string(),
                attempts: task.task().attempts(),
            });
        }
        self.outstanding.remove(&number);
        // The task is no longer in flight, so its dependents are safe to
        // send now.
        self.release_dependents(number, link, overall);
    }

    fn release_dependents(
        &mut self,
        completed: u64,
        link: &mut dyn Link,
        overall: &mut CommResult<()>,
    ) {
        let mut work = vec![completed];
        while let Some(number) = work.pop() {
            let Some(mut queue) = self.pending.remove(&number) else {
                continue;
            };
            while let Some(mut task) = queue.pop_front() {
                let released = task.task().number();
                debug!("Task {} released by completion of task {}", released, number);
                match task.execute_send(link) {
                    SendState::Success => self.running.push_back(task),
                    _ => {
                        warn!("Released task {} failed to send", released);
                        if overall.is_ok() {
                            *overall = Err(CommError::SendFailed(
                                task.task().exchange().name().to_string(),
                            ));
                        }
                        self.outstanding.remove(&released);
                        work.push(released);
                    }
                }
            }
        }
    }

    /// Drops every task queued behind `failed`, transitively, without
    /// sending. Used on the fatal path, where the wire cannot carry them.
    fn discard_dependents(&mut self, failed: u64) {
        let mut work = vec![failed];
        while let Some(number) = work.pop() {
            let Some(queue) = self.pending.remove(&number) else {
                continue;
            };
            for task in queue {
                let dropped = task.task().number();
                warn!(
                    "Task {} ('{}') discarded: dependency {} failed fatally",
                    dropped,
                    task.task().exchange().name(),
                    number
                );
                self.outstanding.remove(&dropped);
                work.push(dropped);
            }
        }
    }

    /// Explains bytes left in the receive queue after a drain. Exactly one
    /// buried interrupt notification is absorbed; anything else, including a
    /// residue shorter than a notification, means the wire state is lost.
    fn resynchronize(&mut self, link: &mut dyn Link) -> CommResult<()> {
        let Some(residual) = link.receive_queue_len() else {
            return Ok(());
        };
        if residual == 0 {
            return Ok(());
        }
        if residual < 3 {
            return Err(CommError::Desynchronized(residual));
        }
        let mut buf = vec![0u8; residual];
        link.receive(&mut buf, RESYNC_READ_TIMEOUT)?;
        if residual == 3 && buf[0] == INTERRUPT && buf[2] == xor_parity(&buf[1..2]) {
            debug!("Resynchronized: buried interrupt from core {}", buf[1]);
            self.interrupt_slot.set(Some(buf[1]));
            return Ok(());
        }
        Err(CommError::Desynchronized(residual))
    }

    /// Read-and-clear dispatch of a recorded interrupt through the supplied
    /// handler map. Without a map the slot keeps its value for a later call.
    fn dispatch_interrupt(&mut self, handlers: Option<&mut InterruptHandlers>) {
        let Some(handlers) = handlers else {
            return;
        };
        let Some(core) = self.interrupt_slot.take() else {
            return;
        };
        match handlers.get_mut(&core) {
            Some(callback) => {
                debug!("Dispatching interrupt callback for core {}", core);
                callback();
            }
            None => debug!("Interrupt from core {} has no registered handler", core),
        }
    }
}
