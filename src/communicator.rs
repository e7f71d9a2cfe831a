//! Public facade: target session management, device discovery and the typed
//! register/bulk operations.
//!
//! A `Communicator` owns the link and the executor, tracks which half of the
//! board (MCU or SoC) currently answers the wire, and translates typed
//! operations into exchanges. Only one context is addressable at a time; a
//! select-target exchange moves between them.

use crate::config::Settings;
use crate::error::{CommError, CommResult};
use crate::executor::{InterruptHandlers, TaskExecutor};
use crate::link::serial::SerialConnection;
use crate::link::Link;
use crate::protocol::exchange::{BufferCell, ByteCell, Exchange, ResultCallback};
use crate::protocol::{
    CLASS_MCU, CLASS_MCU_BUSY, CLASS_SOC, SECTOR_SIZE, TARGET_MCU, TARGET_SOC,
};
use log::{debug, info};
use regex::Regex;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

/// Upper bound on detect re-probes while the MCU reports reconfiguration.
const MAX_RECONFIGURE_PROBES: u32 = 10;

/// The addressable half of the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// No context bound yet; discovery has not run.
    Undefined,
    /// The microcontroller (bootloader) context.
    Mcu,
    /// The FPGA system-on-chip context.
    Soc,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Undefined => write!(f, "undefined"),
            Target::Mcu => write!(f, "MCU"),
            Target::Soc => write!(f, "SoC"),
        }
    }
}

/// The engine's public entry point: one link, one executor, one session.
pub struct Communicator<L: Link> {
    link: L,
    executor: TaskExecutor,
    settings: Settings,
    target: Target,
    handlers: InterruptHandlers,
}

impl<L: Link> Communicator<L> {
    /// Builds a communicator over an already-constructed link.
    pub fn new(link: L, settings: Settings) -> Self {
        let executor = TaskExecutor::new(settings.max_retries);
        Self {
            link,
            executor,
            settings,
            target: Target::Undefined,
            handlers: InterruptHandlers::new(),
        }
    }

    /// Currently-addressed target.
    pub fn target(&self) -> Target {
        self.target
    }

    /// The underlying link, mutably. Intended for tests and diagnostics;
    /// writing to the wire directly risks desynchronization.
    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// The task executor (read-only introspection).
    pub fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    /// Registers the interrupt callback for one core, replacing any
    /// previous handler for that core.
    pub fn on_interrupt(&mut self, core: u8, handler: Box<dyn FnMut()>) {
        self.handlers.insert(core, handler);
    }

    fn timeout(&self) -> Duration {
        self.settings.receive_timeout()
    }

    fn run_sync(&mut self, name: &str, exchange: Exchange) -> CommResult<()> {
        self.executor
            .do_sync_task(name, exchange, &mut self.link, Some(&mut self.handlers))
    }

    /// Probes the wire with the detect byte and classifies the reply,
    /// waiting out MCU reconfiguration with bounded re-probes. Updates the
    /// cached target on success.
    pub fn probe(&mut self) -> CommResult<Target> {
        let class = Rc::new(Cell::new(0u8));
        for attempt in 1..=MAX_RECONFIGURE_PROBES {
            let exchange =
                Exchange::detect_probe(Rc::clone(&class)).with_timeout(self.timeout());
            self.run_sync("detect probe", exchange)?;
            match class.get() {
                CLASS_SOC => {
                    self.target = Target::Soc;
                    return Ok(Target::Soc);
                }
                CLASS_MCU => {
                    self.target = Target::Mcu;
                    return Ok(Target::Mcu);
                }
                CLASS_MCU_BUSY => {
                    debug!(
                        "MCU reconfiguring (probe {}/{}); waiting {:?}",
                        attempt,
                        MAX_RECONFIGURE_PROBES,
                        self.settings.reconfigure_delay()
                    );
                    std::thread::sleep(self.settings.reconfigure_delay());
                }
                other => return Err(CommError::UnknownBoardClass(other)),
            }
        }
        Err(CommError::Aborted {
            name: "detect probe".to_string(),
            reason: "MCU still reconfiguring after bounded re-probes".to_string(),
        })
    }

    /// Moves the session to `target`. Same-target calls are no-ops; only
    /// MCU↔SoC transitions exist on the wire, so any other request (notably
    /// from an undefined target) fails.
    pub fn switch_to(&mut self, target: Target) -> CommResult<()> {
        if self.target == target {
            return Ok(());
        }
        let field = match (self.target, target) {
            (Target::Mcu, Target::Soc) => TARGET_SOC,
            (Target::Soc, Target::Mcu) => TARGET_MCU,
            (from, to) => {
                return Err(CommError::TargetSwitch {
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
        };
        let exchange = Exchange::select_target(field).with_timeout(self.timeout());
        self.run_sync("select target", exchange)?;
        self.target = target;
        debug!("Switched target to {}", target);
        // The board needs a moment to hand the wire over; anything buffered
        // before the switch is stale.
        std::thread::sleep(self.settings.settle_delay());
        self.link.flush()?;
        Ok(())
    }

    // =========================================================================
    // SoC register operations
    // =========================================================================

    /// Reads one register of `core` synchronously.
    pub fn read_register(&mut self, core: u8, addr: u8) -> CommResult<u8> {
        self.switch_to(Target::Soc)?;
        let dest = Rc::new(Cell::new(0));
        let mut exchange =
            Exchange::register_read(addr, Rc::clone(&dest)).with_timeout(self.timeout());
        exchange.set_id(core)?;
        self.run_sync("register read", exchange)?;
        Ok(dest.get())
    }

    /// Writes one register of `core` synchronously.
    pub fn write_register(&mut self, core: u8, addr: u8, value: u8) -> CommResult<()> {
        self.switch_to(Target::Soc)?;
        let mut exchange =
            Exchange::register_write(addr, value).with_timeout(self.timeout());
        exchange.set_id(core)?;
        self.run_sync("register write", exchange)
    }

    /// Reads one register `count` times synchronously (FIFO-style targets).
    pub fn read_multi_register(&mut self, core: u8, addr: u8, count: u16) -> CommResult<Vec<u8>> {
        self.switch_to(Target::Soc)?;
        let dest = Rc::new(RefCell::new(Vec::new()));
        let mut exchange = Exchange::multi_register_read(addr, count, Rc::clone(&dest))
            .with_timeout(self.timeout());
        exchange.set_id(core)?;
        self.run_sync("register read xN", exchange)?;
        Ok(dest.take())
    }

    /// Writes one register once per value synchronously.
    pub fn write_multi_register(&mut self, core: u8, addr: u8, values: &[u8]) -> CommResult<()> {
        self.switch_to(Target::Soc)?;
        let mut exchange =
            Exchange::multi_register_write(addr, values.to_vec())?.with_timeout(self.timeout());
        exchange.set_id(core)?;
        self.run_sync("register write xN", exchange)
    }

    /// Reads `count` consecutive registers starting at `addr` synchronously.
    pub fn read_auto_inc(&mut self, core: u8, addr: u8, count: u16) -> CommResult<Vec<u8>> {
        self.switch_to(Target::Soc)?;
        let dest = Rc::new(RefCell::new(Vec::new()));
        let mut exchange =
            Exchange::auto_inc_read(addr, count, Rc::clone(&dest)).with_timeout(self.timeout());
        exchange.set_id(core)?;
        self.run_sync("auto-inc read", exchange)?;
        Ok(dest.take())
    }

    /// Writes consecutive registers starting at `addr` synchronously.
    pub fn write_auto_inc(&mut self, core: u8, addr: u8, values: &[u8]) -> CommResult<()> {
        self.switch_to(Target::Soc)?;
        let mut exchange =
            Exchange::auto_inc_write(addr, values.to_vec())?.with_timeout(self.timeout());
        exchange.set_id(core)?;
        self.run_sync("auto-inc write", exchange)
    }

    /// Sets or clears one bit of a register through a read-modify-write.
    ///
    /// The engine is single-threaded; nothing else writes the register
    /// between the read and the write. That assumption is part of the
    /// design, not something a lock should paper over.
    pub fn change_bit_sync(&mut self, core: u8, addr: u8, bit: u8, set: bool) -> CommResult<()> {
        let current = self.read_register(core, addr)?;
        let next = if set {
            current | (1 << bit)
        } else {
            current & !(1 << bit)
        };
        self.write_register(core, addr, next)
    }

    /// Enables global interrupt notifications on the SoC.
    pub fn enable_global_interrupts(&mut self) -> CommResult<()> {
        self.switch_to(Target::Soc)?;
        let exchange = Exchange::interrupt_enable().with_timeout(self.timeout());
        self.run_sync("interrupt enable", exchange)
    }

    // =========================================================================
    // SoC register operations, pipelined
    // =========================================================================

    /// Starts a pipelined register write; returns the task number usable as
    /// a dependency token. A nonzero `dependency` delays the send until that
    /// task has completed.
    pub fn write_register_async(
        &mut self,
        core: u8,
        addr: u8,
        value: u8,
        dependency: u64,
    ) -> CommResult<u64> {
        self.switch_to(Target::Soc)?;
        let mut exchange =
            Exchange::register_write(addr, value).with_timeout(self.timeout());
        exchange.set_id(core)?;
        self.executor
            .start_async_task("register write", exchange, dependency, &mut self.link)
    }

    /// Starts a pipelined register read into `dest`, optionally invoking
    /// `callback` with the payload when the reply is collected.
    pub fn read_register_async(
        &mut self,
        core: u8,
        addr: u8,
        dest: ByteCell,
        callback: Option<ResultCallback>,
        dependency: u64,
    ) -> CommResult<u64> {
        self.switch_to(Target::Soc)?;
        let mut exchange = Exchange::register_read(addr, dest).with_timeout(self.timeout());
        if let Some(callback) = callback {
            exchange = exchange.with_callback(callback);
        }
        exchange.set_id(core)?;
        self.executor
            .start_async_task("register read", exchange, dependency, &mut self.link)
    }

    /// Starts a pipelined N-times register write.
    pub fn write_multi_register_async(
        &mut self,
        core: u8,
        addr: u8,
        values: Vec<u8>,
        dependency: u64,
    ) -> CommResult<u64> {
        self.switch_to(Target::Soc)?;
        let mut exchange =
            Exchange::multi_register_write(addr, values)?.with_timeout(self.timeout());
        exchange.set_id(core)?;
        self.executor
            .start_async_task("register write xN", exchange, dependency, &mut self.link)
    }

    /// Starts a pipelined N-times register read into `dest`.
    pub fn read_multi_register_async(
        &mut self,
        core: u8,
        addr: u8,
        count: u16,
        dest: BufferCell,
        dependency: u64,
    ) -> CommResult<u64> {
        self.switch_to(Target::Soc)?;
        let mut exchange =
            Exchange::multi_register_read(addr, count, dest).with_timeout(self.timeout());
        exchange.set_id(core)?;
        self.executor
            .start_async_task("register read xN", exchange, dependency, &mut self.link)
    }

    /// Starts a pipelined auto-increment write.
    pub fn write_auto_inc_async(
        &mut self,
        core: u8,
        addr: u8,
        values: Vec<u8>,
        dependency: u64,
    ) -> CommResult<u64> {
        self.switch_to(Target::Soc)?;
        let mut exchange =
            Exchange::auto_inc_write(addr, values)?.with_timeout(self.timeout());
        exchange.set_id(core)?;
        self.executor
            .start_async_task("auto-inc write", exchange, dependency, &mut self.link)
    }

    /// Starts a pipelined auto-increment read into `dest`.
    pub fn read_auto_inc_async(
        &mut self,
        core: u8,
        addr: u8,
        count: u16,
        dest: BufferCell,
        dependency: u64,
    ) -> CommResult<u64> {
        self.switch_to(Target::Soc)?;
        let mut exchange =
            Exchange::auto_inc_read(addr, count, dest).with_timeout(self.timeout());
        exchange.set_id(core)?;
        self.executor
            .start_async_task("auto-inc read", exchange, dependency, &mut self.link)
    }

    /// Collects all pending pipelined replies in wire order, dispatching
    /// interrupt callbacks recorded along the way.
    pub fn fetch_async_replies(&mut self) -> CommResult<()> {
        self.executor
            .fetch_async_replies(&mut self.link, Some(&mut self.handlers))
    }

    /// Writes buffered pipelined results back into caller memory.
    pub fn write_replies(&mut self) {
        self.executor.write_replies();
    }

    // =========================================================================
    // MCU bootloader operations
    // =========================================================================

    /// Reads the board serial number.
    pub fn read_serial(&mut self) -> CommResult<u32> {
        self.switch_to(Target::Mcu)?;
        let dest = Rc::new(Cell::new(0u32));
        let exchange = Exchange::serial_read(Rc::clone(&dest)).with_timeout(self.timeout());
        self.run_sync("serial read", exchange)?;
        Ok(dest.get())
    }

    /// Writes the board serial number.
    pub fn write_serial(&mut self, serial: u32) -> CommResult<()> {
        self.switch_to(Target::Mcu)?;
        let exchange = Exchange::serial_write(serial).with_timeout(self.timeout());
        self.run_sync("serial write", exchange)
    }

    /// Reads the bootloader status flag.
    pub fn read_status(&mut self) -> CommResult<u8> {
        self.switch_to(Target::Mcu)?;
        let dest = Rc::new(Cell::new(0));
        let exchange = Exchange::status_read(Rc::clone(&dest)).with_timeout(self.timeout());
        self.run_sync("status read", exchange)?;
        Ok(dest.get())
    }

    /// Writes the bootloader status flag.
    pub fn write_status(&mut self, status: u8) -> CommResult<()> {
        self.switch_to(Target::Mcu)?;
        let exchange = Exchange::status_write(status).with_timeout(self.timeout());
        self.run_sync("status write", exchange)
    }

    /// Uploads an arbitrary-length binary in fixed 4096-byte sectors,
    /// zero-padding the final partial sector. The whole upload aborts on the
    /// first sector failure.
    ///
    /// The sector index is a 16-bit wire field, bounding the upload at
    /// `(u16::MAX + 1) * 4096` bytes.
    pub fn write_binary(&mut self, data: &[u8]) -> CommResult<()> {
        self.switch_to(Target::Mcu)?;
        let sectors = data.len().div_ceil(SECTOR_SIZE);
        let max_sectors = usize::from(u16::MAX) + 1;
        if sectors > max_sectors {
            return Err(CommError::PayloadTooLarge {
                len: data.len(),
                max: max_sectors * SECTOR_SIZE,
            });
        }
        info!("Uploading {} bytes in {} sectors", data.len(), sectors);
        for (index, chunk) in data.chunks(SECTOR_SIZE).enumerate() {
            let mut payload = chunk.to_vec();
            payload.resize(SECTOR_SIZE, 0);
            let exchange = Exchange::sector_write(index as u16, payload);
            self.run_sync("sector write", exchange)?;
        }
        Ok(())
    }
}

impl Communicator<SerialConnection> {
    /// Scans the configured device directory for a board.
    ///
    /// Every filename matching the configured pattern is opened and probed;
    /// with a nonzero `serial` filter the board's serial number must match
    /// too. Binds the first match and returns whether one was found.
    pub fn init(&mut self, serial: u32) -> CommResult<bool> {
        let pattern = Regex::new(&self.settings.device_pattern)?;
        let mut candidates: Vec<std::path::PathBuf> =
            std::fs::read_dir(&self.settings.device_dir)?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| {
                    path.file_name()
                        .and_then(|name| name.to_str())
                        .is_some_and(|name| pattern.is_match(name))
                })
                .collect();
        candidates.sort();

        for path in candidates {
            let Some(path_str) = path.to_str() else {
                continue;
            };
            if self.link.is_open() {
                self.link.close()?;
            }
            self.target = Target::Undefined;
            if let Err(err) = self.link.open(path_str) {
                debug!("Skipping '{}': {}", path_str, err);
                continue;
            }
            match self.probe() {
                Ok(target) => debug!("'{}' answered as {}", path_str, target),
                Err(err) => {
                    debug!("'{}' did not identify as a board: {}", path_str, err);
                    self.link.close()?;
                    continue;
                }
            }
            if serial != 0 {
                match self.read_serial() {
                    Ok(found) if found == serial => {}
                    Ok(found) => {
                        debug!(
                            "'{}' has serial {:#010x}, want {:#010x}",
                            path_str, found, serial
                        );
                        self.link.close()?;
                        continue;
                    }
                    Err(err) => {
                        debug!("Serial read on '{}' failed: {}", path_str, err);
                        self.link.close()?;
                        continue;
                    }
                }
            }
            info!("Bound board on '{}' ({})", path_str, self.target);
            return Ok(true);
        }
        Ok(false)
    }
}
