//! Linux backend: real `io_uring` submission/completion rings.
//!
//! Grounded on the `io-uring` crate usage pattern in
//! `pelikan-io-grow-a-cache`'s runtime event loop (`IoUring::new`,
//! `ring.submission().push`, `opcode::{Accept,Read,Write,Connect}::new(...)
//! .build().user_data(...)`, draining `ring.completion()` for `user_data()`/
//! `result()`). Unlike kqueue this is a genuine completion model: a
//! submitted operation runs to completion in the kernel without the backend
//! re-entering userspace, so there is no synthesis step here, only
//! translating a `cqe`'s `result` into a [`Completion`].

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use std::time::Duration;

use io_uring::{opcode, squeue, types, IoUring};

use crate::addr::Address;
use crate::error::Error;
use crate::record::{Completion, EventRecord, RecordBackend};
use crate::sys::{unix_common, Backend, RawCompletion, RawHandle};
use crate::time::Timestamp;

const QUEUE_DEPTH: u32 = 256;

/// Per-operation scratch kept alive for as long as its SQE is outstanding.
/// Accept/connect need a stable address to write/read the peer's
/// `sockaddr` into; boxing it keeps that address stable even if the
/// `EventRecord` itself is later moved within the loop's slab.
pub(crate) enum OpState {
    Accept {
        addr: Box<libc::sockaddr_storage>,
        #[allow(dead_code)] // kept alive for the kernel to write through, read back via NonNull below
        addr_len: Box<libc::socklen_t>,
    },
    Connect {
        #[allow(dead_code)]
        addr: Box<libc::sockaddr_storage>,
    },
    Read,
    Write,
}

pub(crate) struct UringBackend {
    ring: IoUring,
    by_fd: HashMap<RawFd, Vec<u64>>,
}

fn io_error_from_result(result: i32) -> io::Error {
    io::Error::from_raw_os_error(-result)
}

impl UringBackend {
    fn push(&mut self, fd: RawFd, entry: squeue::Entry, record: NonNull<EventRecord>) -> Result<(), Error> {
        let token = record.as_ptr() as u64;
        let entry = entry.user_data(token);
        unsafe {
            self.ring
                .submission()
                .push(&entry)
                .map_err(|_| Error::NoBuffers)?;
        }
        self.ring.submit().map_err(Error::from)?;
        self.by_fd.entry(fd).or_default().push(token);
        Ok(())
    }

    /// # Safety
    /// `record` must point at a live `EventRecord` whose `backend` is
    /// `RecordBackend::Uring`.
    unsafe fn interpret(record: NonNull<EventRecord>, result: i32) -> Completion {
        let state = match &record.as_ref().backend {
            RecordBackend::Uring(state) => state,
            #[allow(unreachable_patterns)]
            _ => return Completion::Error(Error::Internal),
        };
        if result == -(libc::ECANCELED) {
            return Completion::Cancelled;
        }
        match state {
            OpState::Accept { addr, .. } => {
                if result < 0 {
                    Completion::Error(Error::from(io_error_from_result(result)))
                } else {
                    let remote = unix_common::raw_to_socket_addr(addr)
                        .map(|sa| Address::from_std(sa))
                        .unwrap_or(Address::Unspecified);
                    Completion::Accepted { handle: result as RawHandle, remote }
                }
            }
            OpState::Connect { .. } => {
                if result < 0 {
                    Completion::Error(Error::from(io_error_from_result(result)))
                } else {
                    Completion::Connected
                }
            }
            OpState::Read => {
                if result < 0 {
                    Completion::Error(Error::from(io_error_from_result(result)))
                } else if result == 0 {
                    Completion::Error(Error::Eof)
                } else {
                    Completion::Read { n: result as usize }
                }
            }
            OpState::Write => {
                if result < 0 {
                    Completion::Error(Error::from(io_error_from_result(result)))
                } else {
                    Completion::Written { n: result as usize }
                }
            }
        }
    }
}

impl Backend for UringBackend {
    fn new() -> Result<Self, Error> {
        let ring = IoUring::new(QUEUE_DEPTH).map_err(Error::from)?;
        Ok(UringBackend { ring, by_fd: HashMap::new() })
    }

    fn poll(&mut self, timeout: Option<Duration>, out: &mut Vec<RawCompletion>) -> Result<(), Error> {
        match timeout {
            // No deadline: nothing times this wait out but another
            // completion, so block for exactly one.
            None => match self.ring.submit_and_wait(1) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
                Err(err) => return Err(Error::from(err)),
            },
            // A deadline came from the timer heap, not from any in-flight
            // operation, so there is no guarantee an SQE is outstanding to
            // wake `submit_and_wait` before it. Submitting is non-blocking
            // (`want = 0`); poll the completion queue in short steps bounded
            // by `budget` instead, so an idle loop with only a pending timer
            // re-checks that timer promptly rather than hanging here forever.
            Some(budget) => {
                const STEP: Duration = Duration::from_millis(1);
                let start = Timestamp::now();
                loop {
                    match self.ring.submit() {
                        Ok(_) => {}
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                        Err(err) => return Err(Error::from(err)),
                    }
                    if self.ring.completion().len() > 0 {
                        break;
                    }
                    let elapsed = Timestamp::now().saturating_duration_since(start);
                    if elapsed >= budget {
                        return Ok(());
                    }
                    std::thread::sleep(STEP.min(budget - elapsed));
                }
            }
        }
        let cq = self.ring.completion();
        for cqe in cq {
            let record = match NonNull::new(cqe.user_data() as *mut EventRecord) {
                Some(r) => r,
                None => continue,
            };
            let completion = unsafe { Self::interpret(record, cqe.result()) };
            out.push(RawCompletion { record, completion });
        }
        Ok(())
    }

    unsafe fn submit_accept(&mut self, listener: RawHandle, mut record: NonNull<EventRecord>) -> Result<(), Error> {
        let mut addr = Box::new(std::mem::zeroed::<libc::sockaddr_storage>());
        let mut addr_len = Box::new(std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t);
        let entry = opcode::Accept::new(
            types::Fd(listener),
            addr.as_mut() as *mut _ as *mut libc::sockaddr,
            addr_len.as_mut() as *mut _,
        )
        .build();
        record.as_mut().backend = RecordBackend::Uring(OpState::Accept { addr, addr_len });
        self.push(listener, entry, record)
    }

    unsafe fn submit_connect(
        &mut self,
        handle: RawHandle,
        addr: SocketAddr,
        mut record: NonNull<EventRecord>,
    ) -> Result<(), Error> {
        let (storage, len) = unix_common::socket_addr_to_raw(&addr);
        let boxed = Box::new(storage);
        let entry = opcode::Connect::new(
            types::Fd(handle),
            boxed.as_ref() as *const _ as *const libc::sockaddr,
            len,
        )
        .build();
        record.as_mut().backend = RecordBackend::Uring(OpState::Connect { addr: boxed });
        self.push(handle, entry, record)
    }

    unsafe fn submit_read(
        &mut self,
        handle: RawHandle,
        buf: *mut u8,
        len: usize,
        mut record: NonNull<EventRecord>,
    ) -> Result<(), Error> {
        let entry = opcode::Read::new(types::Fd(handle), buf, len as u32).build();
        record.as_mut().backend = RecordBackend::Uring(OpState::Read);
        self.push(handle, entry, record)
    }

    unsafe fn submit_write(
        &mut self,
        handle: RawHandle,
        buf: *const u8,
        len: usize,
        mut record: NonNull<EventRecord>,
    ) -> Result<(), Error> {
        let entry = opcode::Write::new(types::Fd(handle), buf, len as u32).build();
        record.as_mut().backend = RecordBackend::Uring(OpState::Write);
        self.push(handle, entry, record)
    }

    fn cancel_handle(&mut self, handle: RawHandle) -> Vec<NonNull<EventRecord>> {
        if let Some(tokens) = self.by_fd.remove(&handle) {
            for token in tokens {
                let entry = opcode::AsyncCancel::new(token).build().user_data(0);
                unsafe {
                    let _ = self.ring.submission().push(&entry);
                }
            }
            let _ = self.ring.submit();
        }
        // The cancellation itself completes through the normal CQE path
        // (with `result == -ECANCELED`), so nothing needs immediate
        // synchronous dispatch here.
        Vec::new()
    }
}
