//! End-to-end scenarios driven over a real loop and real sockets.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use harbor_io::{
    Acceptance, Address, Connection, ConnectionObserver, Error, InputBuffer, Listener, ListenerObserver, Loop,
    LoopState, OsTransport, OutputBuffer,
};

const PAYLOAD: &[u8] = b"Hello, Arrowhead!\0";

fn run_until_quiescent(loop_: &mut Loop, done: impl Fn() -> bool) {
    let mut iterations = 0;
    while !done() && iterations < 200 {
        let deadline = loop_.now().checked_add(Duration::from_millis(50)).unwrap();
        loop_.run_until(Some(deadline)).unwrap();
        iterations += 1;
    }
    assert!(done(), "loop never reached quiescence within the test's iteration budget");
}

struct ServerConn {
    received: Rc<RefCell<Vec<u8>>>,
    closed: Rc<RefCell<bool>>,
}

impl ConnectionObserver for ServerConn {
    fn on_read(&mut self, loop_: &mut Loop, conn: &Connection, input: &mut InputBuffer, err: Option<Error>) {
        if err.is_none() {
            self.received.borrow_mut().extend_from_slice(input.readable());
            let n = input.readable_len();
            input.consume(n);
            conn.close(loop_);
        }
    }

    fn on_close(&mut self, _loop_: &mut Loop, _conn: &Connection, _err: Option<Error>) {
        *self.closed.borrow_mut() = true;
    }
}

struct ServerListener {
    accepted: Rc<RefCell<bool>>,
    received: Rc<RefCell<Vec<u8>>>,
    server_conn_closed: Rc<RefCell<bool>>,
}

impl ListenerObserver for ServerListener {
    fn on_accept(&mut self, loop_: &mut Loop, _listener: &Listener, acceptance: &mut Acceptance<'_>, err: Option<Error>) {
        if err.is_some() {
            acceptance.reject();
            return;
        }
        *self.accepted.borrow_mut() = true;
        let observer = Rc::new(RefCell::new(ServerConn {
            received: self.received.clone(),
            closed: self.server_conn_closed.clone(),
        }));
        acceptance.accept(observer);
        if let Some(conn) = acceptance.connection() {
            conn.read_start(loop_).expect("read_start on a freshly accepted connection");
        }
    }
}

struct ClientConn {
    sent: Rc<RefCell<bool>>,
    closed: Rc<RefCell<bool>>,
}

impl ConnectionObserver for ClientConn {
    fn wants_read(&self) -> bool {
        false
    }

    fn on_connect(&mut self, loop_: &mut Loop, conn: &Connection, err: Option<Error>) {
        if err.is_none() {
            conn.write(loop_, OutputBuffer::from_vec(PAYLOAD.to_vec())).expect("write after connect");
        }
    }

    fn on_write(&mut self, loop_: &mut Loop, conn: &Connection, _out: OutputBuffer, err: Option<Error>) {
        if err.is_none() {
            *self.sent.borrow_mut() = true;
        }
        conn.close(loop_);
    }

    fn on_close(&mut self, _loop_: &mut Loop, _conn: &Connection, _err: Option<Error>) {
        *self.closed.borrow_mut() = true;
    }
}

/// `spec.md` §8 scenario 1 ("Accept and echo"): a listener accepts one
/// connection, receives the payload in a single `on_read`, and both ends
/// close exactly once, with the accepted side never seeing `on_open`/
/// `on_connect` (`spec.md` §4.5: accepted connections skip straight to
/// `connected`).
#[test]
fn accept_and_echo() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut loop_ = Loop::new().expect("loop construction");

    let accepted = Rc::new(RefCell::new(false));
    let received = Rc::new(RefCell::new(Vec::new()));
    let server_closed = Rc::new(RefCell::new(false));

    let listener_observer = Rc::new(RefCell::new(ServerListener {
        accepted: accepted.clone(),
        received: received.clone(),
        server_conn_closed: server_closed.clone(),
    }));
    let listener = Listener::new(Box::new(OsTransport::new()), listener_observer);
    listener.open(Address::v4_wildcard(0)).expect("listener open");
    listener.listen(&mut loop_, 0).expect("listen");
    let local_addr = listener.local_addr().expect("listener local_addr");

    let client_sent = Rc::new(RefCell::new(false));
    let client_closed = Rc::new(RefCell::new(false));
    let client_observer = Rc::new(RefCell::new(ClientConn {
        sent: client_sent.clone(),
        closed: client_closed.clone(),
    }));
    let client = Connection::new(Box::new(OsTransport::new()), client_observer);
    client.open(Address::v4_wildcard(0)).expect("client open");
    client.connect(&mut loop_, local_addr).expect("connect");

    run_until_quiescent(&mut loop_, || *server_closed.borrow() && *client_closed.borrow());

    assert!(*accepted.borrow(), "listener never delivered an acceptance");
    assert_eq!(&*received.borrow(), PAYLOAD, "server never received the exact payload");
    assert!(*client_sent.borrow(), "client's write never completed");
    assert!(*server_closed.borrow(), "accepted connection's on_close never fired");
    assert!(*client_closed.borrow(), "client connection's on_close never fired");

    listener.close(&mut loop_);
}

struct CancelListener {
    cancelled: Rc<RefCell<bool>>,
    closed: Rc<RefCell<bool>>,
}

impl ListenerObserver for CancelListener {
    fn on_accept(&mut self, loop_: &mut Loop, listener: &Listener, acceptance: &mut Acceptance<'_>, err: Option<Error>) {
        acceptance.reject();
        if err == Some(Error::Cancelled) {
            *self.cancelled.borrow_mut() = true;
            listener.close(loop_);
        }
    }

    fn on_close(&mut self, _loop_: &mut Loop, _listener: &Listener, _err: Option<Error>) {
        *self.closed.borrow_mut() = true;
    }
}

struct CancelClient {
    connected: Rc<RefCell<bool>>,
    write_cancelled: Rc<RefCell<bool>>,
    closed: Rc<RefCell<bool>>,
}

impl ConnectionObserver for CancelClient {
    fn wants_read(&self) -> bool {
        false
    }

    fn on_connect(&mut self, _loop_: &mut Loop, _conn: &Connection, err: Option<Error>) {
        if err.is_none() {
            *self.connected.borrow_mut() = true;
        }
    }

    fn on_write(&mut self, loop_: &mut Loop, conn: &Connection, _out: OutputBuffer, err: Option<Error>) {
        if err == Some(Error::Cancelled) {
            *self.write_cancelled.borrow_mut() = true;
            conn.close(loop_);
        }
    }

    fn on_close(&mut self, _loop_: &mut Loop, _conn: &Connection, _err: Option<Error>) {
        *self.closed.borrow_mut() = true;
    }
}

/// `spec.md` §8 scenario 5 ("Loop cancellation"): terminating a loop with
/// two pending accepts and one pending write delivers `cancelled` to all
/// three callbacks before `on_close` fires on the listener and the
/// connection. `listener_a` supplies one pending accept by re-arming after
/// serving (and rejecting) the client's real connection; `listener_b`
/// supplies the second, untouched; the client connection supplies the
/// pending write.
#[test]
fn terminate_cancels_two_pending_accepts_and_a_pending_write() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut loop_ = Loop::new().expect("loop construction");

    let accept_a_cancelled = Rc::new(RefCell::new(false));
    let accept_a_closed = Rc::new(RefCell::new(false));
    let listener_a = Listener::new(
        Box::new(OsTransport::new()),
        Rc::new(RefCell::new(CancelListener {
            cancelled: accept_a_cancelled.clone(),
            closed: accept_a_closed.clone(),
        })),
    );
    listener_a.open(Address::v4_wildcard(0)).expect("listener_a open");
    listener_a.listen(&mut loop_, 0).expect("listener_a listen");
    let listener_a_addr = listener_a.local_addr().expect("listener_a local_addr");

    let accept_b_cancelled = Rc::new(RefCell::new(false));
    let accept_b_closed = Rc::new(RefCell::new(false));
    let listener_b = Listener::new(
        Box::new(OsTransport::new()),
        Rc::new(RefCell::new(CancelListener {
            cancelled: accept_b_cancelled.clone(),
            closed: accept_b_closed.clone(),
        })),
    );
    listener_b.open(Address::v4_wildcard(0)).expect("listener_b open");
    listener_b.listen(&mut loop_, 0).expect("listener_b listen");

    let connected = Rc::new(RefCell::new(false));
    let write_cancelled = Rc::new(RefCell::new(false));
    let client_closed = Rc::new(RefCell::new(false));
    let client = Connection::new(
        Box::new(OsTransport::new()),
        Rc::new(RefCell::new(CancelClient {
            connected: connected.clone(),
            write_cancelled: write_cancelled.clone(),
            closed: client_closed.clone(),
        })),
    );
    client.open(Address::v4_wildcard(0)).expect("client open");
    client.connect(&mut loop_, listener_a_addr).expect("client connect");

    // Run the loop just long enough for the client's connect (and
    // `listener_a`'s matching, rejected accept) to complete, leaving
    // `listener_a` with a freshly re-armed pending accept.
    run_until_quiescent(&mut loop_, || *connected.borrow());

    // Submit a write and terminate immediately after, before another
    // `run_until` call lets the backend ever report it complete.
    client.write(&mut loop_, OutputBuffer::from_vec(vec![1, 2, 3])).expect("write before terminate");

    loop_.terminate();

    assert!(*accept_a_cancelled.borrow(), "listener_a's re-armed accept was never cancelled");
    assert!(*accept_a_closed.borrow(), "listener_a's on_close never fired after its observer closed it");
    assert!(*accept_b_cancelled.borrow(), "listener_b's pending accept was never cancelled");
    assert!(*accept_b_closed.borrow(), "listener_b's on_close never fired after its observer closed it");
    assert!(*write_cancelled.borrow(), "client's pending write was never cancelled");
    assert!(*client_closed.borrow(), "client connection's on_close never fired after its observer closed it");
    assert_eq!(loop_.state(), LoopState::Terminated);
}
