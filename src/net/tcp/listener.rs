//! The TCP listener/accept state machine (`spec.md` §3 "Listener", §4.5).
//!
//! Grounded on `net/tcp/listener.rs` for the operation names
//! (open/listen/close) and on `sys/unix/selector.rs`'s accept-readiness loop
//! for the re-arm-after-every-delivery shape, adapted here to completions
//! instead of readiness. The accepted-connection pool is `spec.md` §4.5's
//! "slab of pre-allocated connection slots, sized from one page" realized as
//! a [`SlabAllocator<Connection>`]: the slab holds the (pointer-sized)
//! [`Connection`] handle rather than connection state inline, since a
//! connection here is an `Rc`-backed handle rather than a raw struct a slab
//! slot can own directly.

use std::cell::{Cell, RefCell};
use std::ptr::NonNull;
use std::rc::Rc;

use crate::addr::{Address, Family};
use crate::alloc::SlabAllocator;
use crate::error::{Error, Result};
use crate::event_loop::Loop;
use crate::net::tcp::connection::ConnectionOrigin;
use crate::net::tcp::Connection;
use crate::observer::{Acceptance, ListenerObserver};
use crate::record::Completion;
use crate::sys::RawHandle;
use crate::transport::ListenerTransport;

const DEFAULT_BACKLOG: i32 = 16;

fn clamp_backlog(requested: i32) -> i32 {
    if requested == 0 {
        DEFAULT_BACKLOG
    } else {
        requested
    }
}

/// `spec.md` §3 Listener: "a state in {terminated, initialised, open,
/// listening, closing, closed}".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenState {
    Terminated,
    Initialised,
    Open,
    Listening,
    Closing,
    Closed,
}

pub(crate) struct ListenerInner {
    transport: RefCell<Box<dyn ListenerTransport>>,
    state: Cell<ListenState>,
    family: Cell<Option<Family>>,
    handle: Cell<Option<RawHandle>>,
    observer: RefCell<Option<Rc<RefCell<dyn ListenerObserver>>>>,
    conn_slab: RefCell<SlabAllocator<Connection>>,
    close_notified: Cell<bool>,
}

impl ListenerInner {
    /// Release an accepted connection's slot back to its listener's slab,
    /// called from [`Connection::term`][super::connection::Connection::term].
    pub(crate) fn free_connection_slot(this: &Rc<ListenerInner>, slot: NonNull<Connection>) {
        unsafe {
            std::ptr::drop_in_place(slot.as_ptr());
        }
        this.conn_slab.borrow_mut().free(slot);
    }
}

/// A TCP listener (`spec.md` §3 "Listener").
#[derive(Clone)]
pub struct Listener(Rc<ListenerInner>);

impl Listener {
    /// `init(loop, transport, observer)` (`spec.md` §4.5).
    pub fn new(transport: Box<dyn ListenerTransport>, observer: Rc<RefCell<dyn ListenerObserver>>) -> Listener {
        Listener(Rc::new(ListenerInner {
            transport: RefCell::new(transport),
            state: Cell::new(ListenState::Initialised),
            family: Cell::new(None),
            handle: Cell::new(None),
            observer: RefCell::new(Some(observer)),
            conn_slab: RefCell::new(SlabAllocator::new()),
            close_notified: Cell::new(false),
        }))
    }

    pub fn state(&self) -> ListenState {
        self.0.state.get()
    }

    pub fn family(&self) -> Option<Family> {
        self.0.family.get()
    }

    pub(crate) fn raw_handle(&self) -> Option<RawHandle> {
        self.0.handle.get()
    }

    pub(crate) fn set_raw_handle(&self, handle: RawHandle) {
        self.0.handle.set(Some(handle));
    }

    pub(crate) fn set_family(&self, family: Family) {
        self.0.family.set(Some(family));
    }

    fn observer(&self) -> Option<Rc<RefCell<dyn ListenerObserver>>> {
        self.0.observer.borrow().clone()
    }

    pub fn local_addr(&self) -> Result<Address> {
        self.0.transport.borrow().local_addr(self)
    }

    pub fn set_reuseaddr(&self, enable: bool) -> Result<()> {
        self.0.transport.borrow_mut().set_reuseaddr(self, enable)
    }

    /// `open(local-address)`: initialised → open.
    pub fn open(&self, local: Address) -> Result<()> {
        if self.state() != ListenState::Initialised {
            return Err(Error::BadState);
        }
        let result = self.0.transport.borrow_mut().open(self, local);
        if result.is_ok() {
            self.0.state.set(ListenState::Open);
        }
        if let Some(observer) = self.observer() {
            observer.borrow_mut().on_open(self, result.as_ref().err().copied());
        }
        result
    }

    /// `listen(backlog)`: open → listening, then arms the first accept.
    /// `backlog` of zero defaults to 16; negative values are rejected
    /// synchronously (`spec.md` §4.5).
    pub fn listen(&self, loop_: &mut Loop, backlog: i32) -> Result<()> {
        if self.state() != ListenState::Open {
            return Err(Error::BadState);
        }
        if backlog < 0 {
            return Err(Error::InvalidArg);
        }
        let backlog = clamp_backlog(backlog);
        let result = self.0.transport.borrow_mut().listen(loop_, self, backlog);
        if result.is_ok() {
            self.0.state.set(ListenState::Listening);
        }
        if let Some(observer) = self.observer() {
            observer.borrow_mut().on_listen(loop_, self, result.as_ref().err().copied());
        }
        result?;
        self.0.transport.borrow_mut().accept_start(loop_, self)
    }

    /// `close`: any live state → closing → closed, cancelling pending
    /// accepts but leaving already-accepted connections alone
    /// (`spec.md` §4.5, §5).
    pub fn close(&self, loop_: &mut Loop) {
        if matches!(self.state(), ListenState::Terminated | ListenState::Closed) {
            return;
        }
        self.0.state.set(ListenState::Closing);
        self.0.transport.borrow_mut().close(loop_, self);
        self.0.state.set(ListenState::Closed);
        if !self.0.close_notified.replace(true) {
            if let Some(observer) = self.observer() {
                observer.borrow_mut().on_close(loop_, self, None);
            }
        }
    }

    /// `term`: closed → terminated, releasing the accepted-connection slab.
    pub fn term(&self) -> Result<()> {
        if self.state() != ListenState::Closed {
            return Err(Error::BadState);
        }
        self.0.state.set(ListenState::Terminated);
        self.0.conn_slab.borrow_mut().term(|ptr, _slab| {
            // Drop the slab's own handle to this accepted connection; a
            // connection whose application code already dropped its clone
            // (and called `term`) is already gone from here, so this only
            // matters for connections still live when the listener itself
            // terminates.
            let conn = unsafe { std::ptr::read(ptr.as_ptr()) };
            drop(conn);
        });
        Ok(())
    }

    /// Called by [`crate::transport::os::OsTransport`]'s accept completion
    /// callback. Allocates a slab slot and delivers the acceptance to the
    /// observer, re-arming the next accept regardless of outcome as long as
    /// the listener is still listening.
    pub(crate) fn handle_accept_completion(&self, loop_: &mut Loop, completion: Completion) {
        if self.state() != ListenState::Listening {
            return;
        }
        match completion {
            Completion::Accepted { handle, remote } => self.deliver_accepted(loop_, handle, remote),
            Completion::Cancelled => self.deliver_failed(loop_, Error::Cancelled, Address::Unspecified),
            Completion::Error(err) => self.deliver_failed(loop_, err, Address::Unspecified),
            _ => {}
        }
        if self.state() == ListenState::Listening {
            if let Err(err) = self.0.transport.borrow_mut().accept_start(loop_, self) {
                log::warn!("listener failed to re-arm accept: {err}");
            }
        }
    }

    fn deliver_accepted(&self, loop_: &mut Loop, handle: RawHandle, remote: Address) {
        let family = remote.family().unwrap_or(Family::V4);
        let conn_transport = self.0.transport.borrow().listener_prepare();
        let connection = Connection::new_accepted(conn_transport, handle, family);

        let slot = match self.0.conn_slab.borrow_mut().alloc() {
            Some(slot) => slot,
            None => {
                self.notify_accept(loop_, None, remote, Some(Error::NoBuffers));
                return;
            }
        };
        unsafe {
            slot.as_ptr().write(connection.clone());
        }
        connection.set_origin(ConnectionOrigin { listener: Rc::downgrade(&self.0), slot });
        self.notify_accept(loop_, Some(&connection), remote, None);
    }

    fn deliver_failed(&self, loop_: &mut Loop, err: Error, remote: Address) {
        self.notify_accept(loop_, None, remote, Some(err));
    }

    /// Delivers one acceptance, redelivering it once with `bad-state` if the
    /// observer returns without resolving it (`spec.md` §4.5), then closes a
    /// rejected (or still-unresolved) connection.
    fn notify_accept(&self, loop_: &mut Loop, connection: Option<&Connection>, remote: Address, err: Option<Error>) {
        let Some(observer) = self.observer() else {
            if let Some(conn) = connection {
                conn.close(loop_);
            }
            return;
        };

        let mut acceptance = Acceptance::new(connection, remote);
        observer.borrow_mut().on_accept(loop_, self, &mut acceptance, err);

        if !acceptance.is_resolved() {
            log::warn!("on_accept left an acceptance unresolved, redelivering once with bad-state");
            acceptance = Acceptance::new(connection, remote);
            observer.borrow_mut().on_accept(loop_, self, &mut acceptance, Some(Error::BadState));
            if !acceptance.is_resolved() {
                log::warn!("on_accept dropped an unresolved acceptance after redelivery, rejecting it");
                acceptance.reject();
            }
        }

        if acceptance.is_rejected() {
            if let Some(conn) = connection {
                conn.close(loop_);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::tcp::buf::OutputBuffer;
    use crate::observer::ConnectionObserver;
    use crate::transport::ConnectionTransport;

    struct NullConnTransport;
    impl ConnectionTransport for NullConnTransport {
        fn open(&mut self, _conn: &Connection, _local: Address) -> Result<()> {
            Ok(())
        }
        fn connect(&mut self, _loop_: &mut Loop, _conn: &Connection, _remote: Address) -> Result<()> {
            Ok(())
        }
        fn read_start(&mut self, _loop_: &mut Loop, _conn: &Connection) -> Result<()> {
            Ok(())
        }
        fn read_stop(&mut self, _loop_: &mut Loop, _conn: &Connection) {}
        fn write(&mut self, _loop_: &mut Loop, _conn: &Connection, _out: OutputBuffer) -> Result<()> {
            Ok(())
        }
        fn shutdown(&mut self, _conn: &Connection, _flags: crate::transport::ShutdownFlags) -> Result<()> {
            Ok(())
        }
        fn close(&mut self, _loop_: &mut Loop, _conn: &Connection) {}
        fn set_keepalive(&mut self, _conn: &Connection, _enable: bool) -> Result<()> {
            Ok(())
        }
        fn set_nodelay(&mut self, _conn: &Connection, _enable: bool) -> Result<()> {
            Ok(())
        }
        fn set_reuseaddr(&mut self, _conn: &Connection, _enable: bool) -> Result<()> {
            Ok(())
        }
        fn local_addr(&self, _conn: &Connection) -> Result<Address> {
            Ok(Address::Unspecified)
        }
        fn remote_addr(&self, _conn: &Connection) -> Result<Address> {
            Ok(Address::Unspecified)
        }
    }

    struct NullListenerTransport;
    impl ListenerTransport for NullListenerTransport {
        fn open(&mut self, _listener: &Listener, _local: Address) -> Result<()> {
            Ok(())
        }
        fn listen(&mut self, _loop_: &mut Loop, _listener: &Listener, _backlog: i32) -> Result<()> {
            Ok(())
        }
        fn close(&mut self, _loop_: &mut Loop, _listener: &Listener) {}
        fn set_reuseaddr(&mut self, _listener: &Listener, _enable: bool) -> Result<()> {
            Ok(())
        }
        fn local_addr(&self, _listener: &Listener) -> Result<Address> {
            Ok(Address::Unspecified)
        }
        fn accept_start(&mut self, _loop_: &mut Loop, _listener: &Listener) -> Result<()> {
            Ok(())
        }
        fn listener_prepare(&self) -> Box<dyn ConnectionTransport> {
            Box::new(NullConnTransport)
        }
    }

    struct RejectingObserver;
    impl ListenerObserver for RejectingObserver {
        fn on_accept(&mut self, _loop_: &mut Loop, _listener: &Listener, acceptance: &mut Acceptance<'_>, _err: Option<Error>) {
            acceptance.reject();
        }
    }

    struct UnresolvedObserver {
        calls: Cell<u32>,
    }
    impl ListenerObserver for UnresolvedObserver {
        fn on_accept(&mut self, _loop_: &mut Loop, _listener: &Listener, _acceptance: &mut Acceptance<'_>, _err: Option<Error>) {
            self.calls.set(self.calls.get() + 1);
        }
    }

    fn listening_listener(observer: Rc<RefCell<dyn ListenerObserver>>) -> (Listener, Loop) {
        let listener = Listener::new(Box::new(NullListenerTransport), observer);
        let mut loop_ = Loop::new().unwrap();
        listener.open(Address::v4_wildcard(0)).unwrap();
        listener.listen(&mut loop_, 0).unwrap();
        (listener, loop_)
    }

    #[test]
    fn backlog_zero_defaults_to_sixteen() {
        assert_eq!(clamp_backlog(0), DEFAULT_BACKLOG);
        assert_eq!(clamp_backlog(4), 4);
    }

    #[test]
    fn negative_backlog_is_synchronous_invalid_arg() {
        let listener = Listener::new(
            Box::new(NullListenerTransport),
            Rc::new(RefCell::new(RejectingObserver)),
        );
        let mut loop_ = Loop::new().unwrap();
        listener.open(Address::v4_wildcard(0)).unwrap();
        assert_eq!(listener.listen(&mut loop_, -1), Err(Error::InvalidArg));
    }

    #[test]
    fn rejected_acceptance_closes_the_connection_without_an_observer() {
        let observer: Rc<RefCell<dyn ListenerObserver>> = Rc::new(RefCell::new(RejectingObserver));
        let (listener, mut loop_) = listening_listener(observer);
        listener.handle_accept_completion(&mut loop_, Completion::Accepted { handle: 7, remote: Address::v4_wildcard(1) });
        // Accepting + immediately rejecting must not panic and must leave the
        // slab empty once the connection is closed and termed.
    }

    #[test]
    fn unresolved_acceptance_is_redelivered_exactly_once() {
        let observer = Rc::new(RefCell::new(UnresolvedObserver { calls: Cell::new(0) }));
        let (listener, mut loop_) =
            listening_listener(observer.clone() as Rc<RefCell<dyn ListenerObserver>>);
        listener.handle_accept_completion(&mut loop_, Completion::Accepted { handle: 7, remote: Address::v4_wildcard(1) });
        assert_eq!(observer.borrow().calls.get(), 2);
    }
}
