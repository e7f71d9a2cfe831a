//! # boardlink
//!
//! Host-side communication engine for a peripheral board carrying a
//! microcontroller (MCU) and an FPGA system-on-chip (SoC) behind a single
//! half-duplex serial link.
//!
//! The crate covers the full communication stack:
//!
//! - **`protocol`**: the binary framing layer: opcodes, XOR-parity and
//!   Adler-32 checksums, the [`protocol::frame::Frame`] buffer and the
//!   [`protocol::exchange::Exchange`] codec describing one request/reply
//!   pair per operation.
//! - **`link`**: the raw transport seam. [`link::serial::SerialConnection`]
//!   drives the OS serial device; [`link::mock::MockLink`] is a scriptable
//!   in-memory double for tests.
//! - **`task`**: the per-request execution state machine, including the
//!   transparent interception of interrupt notifications the board may
//!   interleave before any regular reply.
//! - **`executor`**: retry policy and the single-threaded asynchronous
//!   pipeline, where requests go out without blocking for their replies,
//!   replies are collected later in wire order, and dependency tokens
//!   preserve read-after-write ordering on shared registers.
//! - **`communicator`**: the public facade covering device discovery,
//!   MCU/SoC target switching and the typed register, bulk, bootloader and
//!   binary upload operations.
//! - **`config`** / **`error`**: the engine's settings surface and its
//!   consolidated error type.
//!
//! "Asynchronous" here means pipelined on one thread, not concurrent: the
//! engine has no internal multithreading, and replies always arrive in the
//! exact order requests were sent.

pub mod communicator;
pub mod config;
pub mod error;
pub mod executor;
pub mod link;
pub mod protocol;
pub mod task;

pub use communicator::{Communicator, Target};
pub use config::Settings;
pub use error::{CommError, CommResult};
pub use executor::{InterruptHandlers, TaskExecutor};
pub use link::mock::MockLink;
pub use link::serial::SerialConnection;
pub use link::Link;
pub use protocol::exchange::{BufferCell, ByteCell, Exchange, ResultCallback, WordCell};
pub use protocol::frame::Frame;
pub use task::{AsyncTask, ReceiveState, SendState, SyncTask, Task};
