//! A transport that logs every lifecycle transition and forwards everything
//! else to an inner transport (`spec.md` §4.6 "Transport layering": "a
//! transport may itself use another transport as its underlying byte
//! stream, the way TLS wraps a plain TCP transport").
//!
//! This crate's logging stand-in for that example: it doesn't encrypt
//! anything, but it demonstrates the same shape — hold an inner
//! `Box<dyn ConnectionTransport>`/`Box<dyn ListenerTransport>`, intercept
//! nothing functionally, and forward every call after a `trace!` line.

use crate::addr::Address;
use crate::error::Result;
use crate::event_loop::Loop;
use crate::net::tcp::{Connection, Listener, OutputBuffer};
use crate::transport::{ConnectionTransport, ListenerTransport, ShutdownFlags};

/// Wraps a [`ConnectionTransport`] and traces each call at `trace` level.
pub struct LoggingTransport {
    inner: Box<dyn ConnectionTransport>,
}

impl LoggingTransport {
    pub fn new(inner: Box<dyn ConnectionTransport>) -> LoggingTransport {
        LoggingTransport { inner }
    }
}

impl ConnectionTransport for LoggingTransport {
    fn open(&mut self, conn: &Connection, local: Address) -> Result<()> {
        log::trace!("connection open({local})");
        self.inner.open(conn, local)
    }

    fn connect(&mut self, loop_: &mut Loop, conn: &Connection, remote: Address) -> Result<()> {
        log::trace!("connection connect({remote})");
        self.inner.connect(loop_, conn, remote)
    }

    fn read_start(&mut self, loop_: &mut Loop, conn: &Connection) -> Result<()> {
        log::trace!("connection read_start");
        self.inner.read_start(loop_, conn)
    }

    fn read_stop(&mut self, loop_: &mut Loop, conn: &Connection) {
        log::trace!("connection read_stop");
        self.inner.read_stop(loop_, conn);
    }

    fn write(&mut self, loop_: &mut Loop, conn: &Connection, out: OutputBuffer) -> Result<()> {
        log::trace!("connection write({} bytes)", out.len());
        self.inner.write(loop_, conn, out)
    }

    fn shutdown(&mut self, conn: &Connection, flags: ShutdownFlags) -> Result<()> {
        log::trace!("connection shutdown({flags:?})");
        self.inner.shutdown(conn, flags)
    }

    fn close(&mut self, loop_: &mut Loop, conn: &Connection) {
        log::trace!("connection close");
        self.inner.close(loop_, conn);
    }

    fn set_keepalive(&mut self, conn: &Connection, enable: bool) -> Result<()> {
        self.inner.set_keepalive(conn, enable)
    }

    fn set_nodelay(&mut self, conn: &Connection, enable: bool) -> Result<()> {
        self.inner.set_nodelay(conn, enable)
    }

    fn set_reuseaddr(&mut self, conn: &Connection, enable: bool) -> Result<()> {
        self.inner.set_reuseaddr(conn, enable)
    }

    fn local_addr(&self, conn: &Connection) -> Result<Address> {
        self.inner.local_addr(conn)
    }

    fn remote_addr(&self, conn: &Connection) -> Result<Address> {
        self.inner.remote_addr(conn)
    }
}

/// Wraps a [`ListenerTransport`], tracing `listen`/`accept_start`/`close`
/// and handing every accepted connection a [`LoggingTransport`]-wrapped
/// inner transport in turn.
pub struct LoggingListenerTransport {
    inner: Box<dyn ListenerTransport>,
}

impl LoggingListenerTransport {
    pub fn new(inner: Box<dyn ListenerTransport>) -> LoggingListenerTransport {
        LoggingListenerTransport { inner }
    }
}

impl ListenerTransport for LoggingListenerTransport {
    fn open(&mut self, listener: &Listener, local: Address) -> Result<()> {
        log::trace!("listener open({local})");
        self.inner.open(listener, local)
    }

    fn listen(&mut self, loop_: &mut Loop, listener: &Listener, backlog: i32) -> Result<()> {
        log::trace!("listener listen(backlog={backlog})");
        self.inner.listen(loop_, listener, backlog)
    }

    fn close(&mut self, loop_: &mut Loop, listener: &Listener) {
        log::trace!("listener close");
        self.inner.close(loop_, listener);
    }

    fn set_reuseaddr(&mut self, listener: &Listener, enable: bool) -> Result<()> {
        self.inner.set_reuseaddr(listener, enable)
    }

    fn local_addr(&self, listener: &Listener) -> Result<Address> {
        self.inner.local_addr(listener)
    }

    fn accept_start(&mut self, loop_: &mut Loop, listener: &Listener) -> Result<()> {
        log::trace!("listener accept_start");
        self.inner.accept_start(loop_, listener)
    }

    fn listener_prepare(&self) -> Box<dyn ConnectionTransport> {
        Box::new(LoggingTransport::new(self.inner.listener_prepare()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::OsTransport;

    #[test]
    fn listener_prepare_wraps_the_inner_transport() {
        let wrapper = LoggingListenerTransport::new(Box::new(OsTransport::new()));
        let _prepared: Box<dyn ConnectionTransport> = wrapper.listener_prepare();
    }
}
