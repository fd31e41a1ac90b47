//! A cross-platform, single-threaded, completion-driven I/O foundation for
//! timers and TCP (`spec.md` §1).
//!
//! The three hard-core subsystems live at:
//!
//! - [`event_loop`] — the cooperative scheduler that owns the OS multiplexer
//!   and dispatches completions and expired timers to callbacks.
//! - [`net::tcp`] — the TCP connection/listener state machines and their
//!   pluggable [`transport`].
//! - [`alloc`] — the page/bump/slab allocator stack backing the loop's event
//!   records, a listener's accepted-connection pool, and I/O buffers.
//!
//! Grounded throughout on the teacher crate named in `TEACHER.txt`; see
//! `DESIGN.md` for the file-by-file ledger.

pub mod addr;
pub mod alloc;
pub mod buf;
pub mod error;
pub mod event_loop;
pub(crate) mod macros;
pub mod net;
pub mod observer;
pub(crate) mod record;
pub(crate) mod sys;
pub mod time;
pub mod timer;
pub mod transport;

pub use addr::{Address, Family};
pub use error::{Error, Result};
pub use event_loop::{Loop, LoopBuilder, LoopState};
pub use net::tcp::{ConnState, Connection, InputBuffer, ListenState, Listener, OutputBuffer};
pub use observer::{Acceptance, ConnectionObserver, ListenerObserver};
pub use transport::{
    ConnectionTransport, ListenerTransport, LoggingListenerTransport, LoggingTransport, OsTransport, ShutdownFlags,
};
