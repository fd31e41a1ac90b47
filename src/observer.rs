//! Observers: the (callback-set, context) pair attached to a connection or
//! listener to receive events (`spec.md` §6, "Observers").
//!
//! The source passes every callback a `void* ctx` first argument
//! (`spec.md` §9, "Callback context passing"). There is no untyped pointer
//! in Rust; an implementor's own fields are its context, so these are plain
//! traits with default no-op bodies rather than a struct of function
//! pointers plus a context slot.

use crate::error::Error;
use crate::event_loop::Loop;
use crate::net::tcp::{Connection, InputBuffer, Listener, OutputBuffer};

/// Receives events for one [`Connection`].
///
/// `wants_read`/`wants_write` replace the source's inference of
/// shutdown direction from a null callback pointer (`spec.md` §4.4,
/// "connect ... Shutdown directions are inferred from which observer
/// callbacks are non-null"): a locally initiated connection whose observer
/// answers `false` from one of these has that direction shut down
/// automatically right after `connect` succeeds.
pub trait ConnectionObserver {
    fn on_open(&mut self, _conn: &Connection, _err: Option<Error>) {}

    /// `loop_` lets the reaction chain further operations (e.g. `write` a
    /// request right after connecting) from inside the callback, the way
    /// `spec.md` §2 describes ("Callbacks may issue further operations").
    fn on_connect(&mut self, _loop_: &mut Loop, _conn: &Connection, _err: Option<Error>) {}
    fn on_read(&mut self, _loop_: &mut Loop, _conn: &Connection, _input: &mut InputBuffer, _err: Option<Error>) {}
    fn on_write(&mut self, _loop_: &mut Loop, _conn: &Connection, _out: OutputBuffer, _err: Option<Error>) {}
    fn on_close(&mut self, _loop_: &mut Loop, _conn: &Connection, _err: Option<Error>) {}

    /// Whether this observer expects `on_read` to ever fire. Only consulted
    /// once, right after a locally initiated `connect` completes.
    fn wants_read(&self) -> bool {
        true
    }

    /// Whether this observer expects `on_write` to ever fire. Only
    /// consulted once, right after a locally initiated `connect` completes.
    fn wants_write(&self) -> bool {
        true
    }
}

/// One accepted connection, delivered to [`ListenerObserver::on_accept`]
/// (`spec.md` §4.5: "a pointer to the new connection ... a pointer to an
/// observer slot the callback must populate, and a pointer to the remote
/// address valid only for the call's duration").
///
/// If `on_accept` returns without calling either [`Acceptance::accept`] or
/// [`Acceptance::reject`], the listener treats the acceptance as not yet
/// handled and redelivers it with [`Error::BadState`].
///
/// `connection` is `None` when `err` is `Some`: an accept that failed at the
/// OS or backend level (or was cancelled by the loop terminating) never
/// produced a connection to hand over, but still needs to reach the
/// listener's observer rather than being swallowed silently.
pub struct Acceptance<'a> {
    pub(crate) connection: Option<&'a Connection>,
    pub(crate) remote: crate::addr::Address,
    pub(crate) resolved: bool,
    pub(crate) rejected: bool,
}

impl<'a> Acceptance<'a> {
    pub(crate) fn new(connection: Option<&'a Connection>, remote: crate::addr::Address) -> Acceptance<'a> {
        Acceptance { connection, remote, resolved: false, rejected: false }
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.resolved
    }

    pub(crate) fn is_rejected(&self) -> bool {
        self.rejected
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connection
    }

    pub fn remote_addr(&self) -> crate::addr::Address {
        self.remote
    }

    /// Install the observer that will receive this connection's future
    /// events, accepting it. A no-op if there is no connection to accept.
    pub fn accept(&mut self, observer: std::rc::Rc<std::cell::RefCell<dyn ConnectionObserver>>) {
        if let Some(conn) = self.connection {
            conn.install_observer(observer);
        }
        self.resolved = true;
    }

    /// Decline the connection; the listener closes it without ever
    /// delivering `on_open`/`on_connect` to any observer.
    pub fn reject(&mut self) {
        self.rejected = true;
        self.resolved = true;
    }
}

/// Receives events for one [`Listener`].
pub trait ListenerObserver {
    fn on_open(&mut self, _listener: &Listener, _err: Option<Error>) {}
    fn on_listen(&mut self, _loop_: &mut Loop, _listener: &Listener, _err: Option<Error>) {}
    fn on_accept(&mut self, loop_: &mut Loop, listener: &Listener, acceptance: &mut Acceptance<'_>, err: Option<Error>);
    fn on_close(&mut self, _loop_: &mut Loop, _listener: &Listener, _err: Option<Error>) {}
}
