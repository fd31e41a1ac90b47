//! The transport abstraction (`spec.md` §3 "Transport", §4.6 "Transport
//! layering", §9 "Replacing virtual-function tables").
//!
//! The source specifies a transport entirely as a vtable of operation
//! function pointers plus an opaque context. The direct Rust equivalent is
//! a trait whose methods are the vtable entries, implemented by a type that
//! owns whatever the C context pointer held. [`os::OsTransport`] is the
//! default, syscall-backed implementation; [`logging::LoggingTransport`]
//! demonstrates stacking one transport over another the way a TLS layer
//! would.

pub(crate) mod logging;
pub(crate) mod os;

pub use logging::{LoggingListenerTransport, LoggingTransport};
pub use os::OsTransport;

use crate::addr::Address;
use crate::error::Result;
use crate::event_loop::Loop;
use crate::net::tcp::{Connection, Listener, OutputBuffer};

/// Which half (or both) of a connection to shut down
/// (`spec.md` §4.4 "shutdown(flags)").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShutdownFlags {
    pub read: bool,
    pub write: bool,
}

impl ShutdownFlags {
    pub const READ: ShutdownFlags = ShutdownFlags { read: true, write: false };
    pub const WRITE: ShutdownFlags = ShutdownFlags { read: false, write: true };
    pub const BOTH: ShutdownFlags = ShutdownFlags { read: true, write: true };

    pub fn is_empty(self) -> bool {
        !self.read && !self.write
    }
}

impl std::ops::BitOr for ShutdownFlags {
    type Output = ShutdownFlags;
    fn bitor(self, rhs: ShutdownFlags) -> ShutdownFlags {
        ShutdownFlags { read: self.read || rhs.read, write: self.write || rhs.write }
    }
}

/// The connection side of the transport contract (`spec.md` §4.4).
///
/// Every method takes the owning [`Connection`] as a handle rather than
/// storing a back-pointer to it in the transport's own state, since the
/// connection is itself an `Rc<RefCell<_>>` handle shareable with the loop
/// and the transport needs a `&mut Loop` to submit backend operations
/// anyway.
pub trait ConnectionTransport {
    fn open(&mut self, conn: &Connection, local: Address) -> Result<()>;
    fn connect(&mut self, loop_: &mut Loop, conn: &Connection, remote: Address) -> Result<()>;
    fn read_start(&mut self, loop_: &mut Loop, conn: &Connection) -> Result<()>;
    fn read_stop(&mut self, loop_: &mut Loop, conn: &Connection);
    fn write(&mut self, loop_: &mut Loop, conn: &Connection, out: OutputBuffer) -> Result<()>;
    fn shutdown(&mut self, conn: &Connection, flags: ShutdownFlags) -> Result<()>;
    fn close(&mut self, loop_: &mut Loop, conn: &Connection);

    fn set_keepalive(&mut self, conn: &Connection, enable: bool) -> Result<()>;
    fn set_nodelay(&mut self, conn: &Connection, enable: bool) -> Result<()>;
    fn set_reuseaddr(&mut self, conn: &Connection, enable: bool) -> Result<()>;

    fn local_addr(&self, conn: &Connection) -> Result<Address>;
    fn remote_addr(&self, conn: &Connection) -> Result<Address>;
}

/// The listener side of the transport contract (`spec.md` §4.5).
pub trait ListenerTransport {
    fn open(&mut self, listener: &Listener, local: Address) -> Result<()>;
    fn listen(&mut self, loop_: &mut Loop, listener: &Listener, backlog: i32) -> Result<()>;
    fn close(&mut self, loop_: &mut Loop, listener: &Listener);

    fn set_reuseaddr(&mut self, listener: &Listener, enable: bool) -> Result<()>;

    fn local_addr(&self, listener: &Listener) -> Result<Address>;

    /// Arm (or re-arm) one accept submission against the loop. Called once
    /// after `listen` succeeds and again after each delivered acceptance,
    /// for as long as the listener stays in the `listening` state.
    fn accept_start(&mut self, loop_: &mut Loop, listener: &Listener) -> Result<()>;

    /// Produce a fresh inner connection transport for one accepted
    /// connection (`spec.md` §4.5, "The listener's `listener_prepare`
    /// transport hook runs once per acceptance to allow stacking
    /// transports ... to attach per-connection context").
    fn listener_prepare(&self) -> Box<dyn ConnectionTransport>;
}
