//! The default, OS-backed transport (`spec.md` §4.6: "the default transport
//! talks directly to the platform backend").
//!
//! Grounded on `net/tcp/stream.rs`/`net/tcp/listener.rs` for the
//! open/bind/listen/connect/accept call sequence, and on `sys/unix_common.rs`
//! /`sys/windows/net.rs` (this crate's own generalized socket helpers, one
//! step down from the teacher's `socket2`-backed equivalents) for the actual
//! syscalls. The async operations (connect/read/write/accept) are submitted
//! to the loop's backend; the record's callback routes the completion back
//! into the owning [`Connection`]/[`Listener`]'s state machine.

use crate::addr::{Address, Family};
use crate::error::{Error, Result};
use crate::event_loop::Loop;
use crate::net::tcp::{Connection, Listener, OutputBuffer};
use crate::record::{Completion, RecordOutcome, Subject};
use crate::sys::RawHandle;
use crate::transport::{ConnectionTransport, ListenerTransport, ShutdownFlags};

#[cfg(unix)]
use crate::sys::unix_common as os;
#[cfg(windows)]
use crate::sys::windows::net as os;

#[cfg(windows)]
use crate::sys::windows::net::ShutdownHow;

fn sys_shutdown(handle: RawHandle, flags: ShutdownFlags) -> Result<()> {
    #[cfg(unix)]
    {
        let how = if flags.read && flags.write {
            libc::SHUT_RDWR
        } else if flags.read {
            libc::SHUT_RD
        } else {
            libc::SHUT_WR
        };
        Ok(os::shutdown(handle, how)?)
    }
    #[cfg(windows)]
    {
        let how = if flags.read && flags.write {
            ShutdownHow::Both
        } else if flags.read {
            ShutdownHow::Read
        } else {
            ShutdownHow::Write
        };
        Ok(os::shutdown(handle, how)?)
    }
}

/// The default transport: every operation is a real socket syscall or a
/// submission to the platform backend (`spec.md` §4.6).
#[derive(Debug, Default)]
pub struct OsTransport {
    _private: (),
}

impl OsTransport {
    pub fn new() -> OsTransport {
        OsTransport { _private: () }
    }
}

impl ConnectionTransport for OsTransport {
    fn open(&mut self, conn: &Connection, local: Address) -> Result<()> {
        let family = local.family().unwrap_or(Family::V4);
        let handle = os::new_stream_socket(family)?;
        if local.family().is_some() {
            if let Err(err) = os::bind(handle, &local.to_std()?) {
                os::close(handle);
                return Err(err.into());
            }
        }
        conn.set_raw_handle(handle);
        conn.set_family(family);
        Ok(())
    }

    fn connect(&mut self, loop_: &mut Loop, conn: &Connection, remote: Address) -> Result<()> {
        let handle = conn.raw_handle().ok_or(Error::BadState)?;
        let addr = remote.to_std()?;
        let conn = conn.clone();
        loop_.submit_connect(
            handle,
            addr,
            Subject::Connection,
            Box::new(move |loop_, completion| {
                let result = match completion {
                    Completion::Connected => Ok(()),
                    Completion::Cancelled => Err(Error::Cancelled),
                    Completion::Error(err) => Err(err),
                    _ => Err(Error::Internal),
                };
                conn.complete_connect(loop_, result);
                RecordOutcome::Complete
            }),
        )
    }

    fn read_start(&mut self, loop_: &mut Loop, conn: &Connection) -> Result<()> {
        let handle = conn.raw_handle().ok_or(Error::BadState)?;
        let (ptr, len) = conn.input_writable_ptr_len()?;
        if len == 0 {
            return Err(Error::Overflow);
        }
        let conn_for_cb = conn.clone();
        loop_.submit_read(
            handle,
            ptr,
            len,
            Subject::Connection,
            Box::new(move |loop_, completion| {
                let result = match completion {
                    Completion::Read { n } => Ok(n),
                    Completion::Cancelled => Err(Error::Cancelled),
                    Completion::Error(err) => Err(err),
                    _ => Err(Error::Internal),
                };
                conn_for_cb.handle_read_result(loop_, result);
                RecordOutcome::Complete
            }),
        )
    }

    fn read_stop(&mut self, _loop_: &mut Loop, _conn: &Connection) {
        // No backend action: the connection has already left the `reading`
        // state by the time this returns, and `handle_read_result` discards
        // any completion for an op submitted before this call.
    }

    fn write(&mut self, loop_: &mut Loop, conn: &Connection, out: OutputBuffer) -> Result<()> {
        let handle = conn.raw_handle().ok_or(Error::BadState)?;
        let (ptr, len) = out.as_ptr_len();
        let conn_for_cb = conn.clone();
        let mut out_slot = Some(out);
        loop_.submit_write(
            handle,
            ptr,
            len,
            Subject::Connection,
            Box::new(move |loop_, completion| {
                let out = out_slot.take().expect("write record's callback fires exactly once");
                let result = match completion {
                    Completion::Written { n } => Ok(n),
                    Completion::Cancelled => Err(Error::Cancelled),
                    Completion::Error(err) => Err(err),
                    _ => Err(Error::Internal),
                };
                conn_for_cb.handle_write_result(loop_, out, result);
                RecordOutcome::Complete
            }),
        )
    }

    fn shutdown(&mut self, conn: &Connection, flags: ShutdownFlags) -> Result<()> {
        let handle = conn.raw_handle().ok_or(Error::BadState)?;
        sys_shutdown(handle, flags)
    }

    fn close(&mut self, loop_: &mut Loop, conn: &Connection) {
        if let Some(handle) = conn.raw_handle() {
            loop_.cancel_handle(handle);
            os::close(handle);
        }
    }

    fn set_keepalive(&mut self, conn: &Connection, enable: bool) -> Result<()> {
        let handle = conn.raw_handle().ok_or(Error::BadState)?;
        Ok(os::set_keepalive(handle, enable)?)
    }

    fn set_nodelay(&mut self, conn: &Connection, enable: bool) -> Result<()> {
        let handle = conn.raw_handle().ok_or(Error::BadState)?;
        Ok(os::set_nodelay(handle, enable)?)
    }

    fn set_reuseaddr(&mut self, conn: &Connection, enable: bool) -> Result<()> {
        let handle = conn.raw_handle().ok_or(Error::BadState)?;
        Ok(os::set_reuseaddr(handle, enable)?)
    }

    fn local_addr(&self, conn: &Connection) -> Result<Address> {
        let handle = conn.raw_handle().ok_or(Error::BadState)?;
        Ok(Address::from_std(os::local_addr(handle)?))
    }

    fn remote_addr(&self, conn: &Connection) -> Result<Address> {
        let handle = conn.raw_handle().ok_or(Error::BadState)?;
        Ok(Address::from_std(os::remote_addr(handle)?))
    }
}

impl ListenerTransport for OsTransport {
    fn open(&mut self, listener: &Listener, local: Address) -> Result<()> {
        let family = local.family().unwrap_or(Family::V4);
        let handle = os::new_stream_socket(family)?;
        if let Err(err) = os::bind(handle, &local.to_std()?) {
            os::close(handle);
            return Err(err.into());
        }
        listener.set_raw_handle(handle);
        listener.set_family(family);
        Ok(())
    }

    fn listen(&mut self, _loop_: &mut Loop, listener: &Listener, backlog: i32) -> Result<()> {
        let handle = listener.raw_handle().ok_or(Error::BadState)?;
        Ok(os::listen(handle, backlog)?)
    }

    fn close(&mut self, loop_: &mut Loop, listener: &Listener) {
        if let Some(handle) = listener.raw_handle() {
            loop_.cancel_handle(handle);
            os::close(handle);
        }
    }

    fn set_reuseaddr(&mut self, listener: &Listener, enable: bool) -> Result<()> {
        let handle = listener.raw_handle().ok_or(Error::BadState)?;
        Ok(os::set_reuseaddr(handle, enable)?)
    }

    fn local_addr(&self, listener: &Listener) -> Result<Address> {
        let handle = listener.raw_handle().ok_or(Error::BadState)?;
        Ok(Address::from_std(os::local_addr(handle)?))
    }

    fn accept_start(&mut self, loop_: &mut Loop, listener: &Listener) -> Result<()> {
        let handle = listener.raw_handle().ok_or(Error::BadState)?;
        let listener_for_cb = listener.clone();
        loop_.submit_accept(
            handle,
            Subject::Listener,
            Box::new(move |loop_, completion| {
                listener_for_cb.handle_accept_completion(loop_, completion);
                RecordOutcome::Complete
            }),
        )
    }

    fn listener_prepare(&self) -> Box<dyn ConnectionTransport> {
        Box::new(OsTransport::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations_before_open_are_synchronous_bad_state() {
        let mut transport = OsTransport::new();
        let observer: std::rc::Rc<std::cell::RefCell<dyn crate::observer::ConnectionObserver>> = {
            struct Noop;
            impl crate::observer::ConnectionObserver for Noop {}
            std::rc::Rc::new(std::cell::RefCell::new(Noop))
        };
        let conn = Connection::new(Box::new(OsTransport::new()), observer);
        assert_eq!(transport.set_nodelay(&conn, true), Err(Error::BadState));
        assert_eq!(transport.local_addr(&conn), Err(Error::BadState));
    }
}
