//! Readiness-based backend for the BSD family (macOS, FreeBSD, ...).
//!
//! Grounded directly on `sys/unix/selector/kqueue.rs`'s real `kevent(2)`
//! plumbing (`kqueue()`, the `EV_ADD | EV_ONESHOT` registration idiom, the
//! `errno`-to-`io::Error` conversion via the crate's `syscall!` macro).
//! kqueue itself is readiness-based, not completion-based, so this backend
//! synthesizes completions the way `spec.md` §6 anticipates: on a readiness
//! event it performs the pending syscall itself (accept/read/write/connect)
//! and reports the syscall's outcome as the completion. Each socket has at
//! most one outstanding read and one outstanding write registration, per
//! `spec.md` §5's single-writer/serialised-read assumption for this backend,
//! so the oneshot-then-rearm pattern below never has to multiplex several
//! pending operations onto one filter.

use std::collections::HashMap;
use std::io;
use std::mem::MaybeUninit;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use std::time::Duration;

use crate::error::Error;
use crate::macros::syscall;
use crate::record::{Completion, EventRecord, RecordBackend};
use crate::sys::{unix_common, Backend, RawCompletion, RawHandle};

const MAX_EVENTS: usize = 32;

/// What a registered kevent should do once it fires, stored in the owning
/// `EventRecord`'s `backend` field (`spec.md` §3's "platform-specific
/// storage area for the completion").
pub(crate) enum OpState {
    Accept,
    Connect { addr: SocketAddr },
    Read { buf: *mut u8, len: usize },
    Write { buf: *const u8, len: usize },
}

pub(crate) struct KqueueBackend {
    kq: RawFd,
    /// Every record currently registered on a given fd, so `cancel_handle`
    /// can find and cancel them all when `close` tears the socket down.
    by_fd: HashMap<RawFd, Vec<NonNull<EventRecord>>>,
    /// Completions resolved synchronously at submission time (e.g. a
    /// `connect` to localhost that succeeds without ever going through
    /// `EINPROGRESS`), queued here since there is no kevent for `poll` to
    /// pick them up from.
    pending: Vec<RawCompletion>,
}

fn make_kevent(fd: RawFd, filter: libc::c_short, flags: u16, record: NonNull<EventRecord>) -> libc::kevent {
    libc::kevent {
        ident: fd as libc::uintptr_t,
        filter,
        flags,
        fflags: 0,
        data: 0,
        udata: record.as_ptr() as *mut libc::c_void,
    }
}

impl KqueueBackend {
    fn register(&mut self, fd: RawFd, filter: libc::c_short, record: NonNull<EventRecord>) -> Result<(), Error> {
        let kev = make_kevent(fd, filter, libc::EV_ADD | libc::EV_ONESHOT, record);
        let ret = unsafe {
            libc::kevent(self.kq, &kev, 1, std::ptr::null_mut(), 0, std::ptr::null())
        };
        if ret == -1 {
            return Err(Error::from(io::Error::last_os_error()));
        }
        self.by_fd.entry(fd).or_default().push(record);
        Ok(())
    }

    fn untrack(&mut self, fd: RawFd, record: NonNull<EventRecord>) {
        if let Some(list) = self.by_fd.get_mut(&fd) {
            list.retain(|r| *r != record);
            if list.is_empty() {
                self.by_fd.remove(&fd);
            }
        }
    }

    /// Perform the syscall an expired kevent was standing in for, and turn
    /// its outcome into a [`Completion`].
    ///
    /// # Safety
    /// `record` must point at a live `EventRecord` whose `backend` is
    /// `RecordBackend::Kqueue`.
    unsafe fn synthesize(&mut self, fd: RawFd, mut record: NonNull<EventRecord>) -> Completion {
        let state = match &mut record.as_mut().backend {
            RecordBackend::Kqueue(state) => state,
            #[allow(unreachable_patterns)]
            _ => return Completion::Error(Error::Internal),
        };
        match state {
            OpState::Accept => match unix_common::accept(fd) {
                Ok(Some((client, peer))) => Completion::Accepted { handle: client, remote: peer },
                Ok(None) => Completion::Error(Error::WouldBlock),
                Err(err) => Completion::Error(Error::from(err)),
            },
            OpState::Connect { .. } => {
                // Writable readiness after a non-blocking connect: check
                // SO_ERROR to learn whether it actually succeeded.
                match socket_error(fd) {
                    Ok(0) => Completion::Connected,
                    Ok(code) => Completion::Error(Error::from(io::Error::from_raw_os_error(code))),
                    Err(err) => Completion::Error(Error::from(err)),
                }
            }
            OpState::Read { buf, len } => {
                let ret = libc::read(fd, *buf as *mut libc::c_void, *len);
                if ret < 0 {
                    Completion::Error(Error::from(io::Error::last_os_error()))
                } else if ret == 0 {
                    Completion::Error(Error::Eof)
                } else {
                    Completion::Read { n: ret as usize }
                }
            }
            OpState::Write { buf, len } => {
                let ret = libc::write(fd, *buf as *const libc::c_void, *len);
                if ret < 0 {
                    Completion::Error(Error::from(io::Error::last_os_error()))
                } else {
                    Completion::Written { n: ret as usize }
                }
            }
        }
    }
}

fn socket_error(fd: RawFd) -> io::Result<i32> {
    let mut code: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    syscall!(getsockopt(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut code as *mut _ as *mut libc::c_void,
        &mut len
    ))?;
    Ok(code)
}

impl Backend for KqueueBackend {
    fn new() -> Result<Self, Error> {
        let kq = syscall!(kqueue()).map_err(Error::from)?;
        syscall!(fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC)).map_err(Error::from)?;
        Ok(KqueueBackend { kq, by_fd: HashMap::new(), pending: Vec::new() })
    }

    fn poll(&mut self, timeout: Option<Duration>, out: &mut Vec<RawCompletion>) -> Result<(), Error> {
        if !self.pending.is_empty() {
            out.append(&mut self.pending);
            return Ok(());
        }

        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: libc::c_long::from(d.subsec_nanos() as i32),
        });
        let ts_ptr = ts.as_ref().map(|t| t as *const _).unwrap_or(std::ptr::null());

        let mut raw: [MaybeUninit<libc::kevent>; MAX_EVENTS] = unsafe { MaybeUninit::uninit().assume_init() };
        let n = unsafe {
            libc::kevent(
                self.kq,
                std::ptr::null(),
                0,
                raw.as_mut_ptr() as *mut libc::kevent,
                MAX_EVENTS as libc::c_int,
                ts_ptr,
            )
        };
        if n == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(Error::from(err));
        }

        for slot in raw.iter().take(n as usize) {
            let kev = unsafe { slot.assume_init() };
            let fd = kev.ident as RawFd;
            let record = match NonNull::new(kev.udata as *mut EventRecord) {
                Some(r) => r,
                None => continue,
            };
            self.untrack(fd, record);
            let completion = unsafe { self.synthesize(fd, record) };
            out.push(RawCompletion { record, completion });
        }
        Ok(())
    }

    unsafe fn submit_accept(&mut self, listener: RawHandle, mut record: NonNull<EventRecord>) -> Result<(), Error> {
        record.as_mut().backend = RecordBackend::Kqueue(OpState::Accept);
        self.register(listener, libc::EVFILT_READ, record)
    }

    unsafe fn submit_connect(
        &mut self,
        handle: RawHandle,
        addr: SocketAddr,
        mut record: NonNull<EventRecord>,
    ) -> Result<(), Error> {
        record.as_mut().backend = RecordBackend::Kqueue(OpState::Connect { addr });
        // Issue the non-blocking connect(2) now; kqueue has no equivalent of
        // io_uring's `Connect` opcode to do this for us. `Ok(true)` (rare:
        // e.g. connecting to localhost) resolves before any kevent would
        // ever fire, so queue the completion directly instead of registering.
        match unix_common::connect(handle, &addr) {
            Ok(true) => {
                self.pending.push(RawCompletion { record, completion: Completion::Connected });
                Ok(())
            }
            Ok(false) => self.register(handle, libc::EVFILT_WRITE, record),
            Err(err) => Err(Error::from(err)),
        }
    }

    unsafe fn submit_read(
        &mut self,
        handle: RawHandle,
        buf: *mut u8,
        len: usize,
        mut record: NonNull<EventRecord>,
    ) -> Result<(), Error> {
        record.as_mut().backend = RecordBackend::Kqueue(OpState::Read { buf, len });
        self.register(handle, libc::EVFILT_READ, record)
    }

    unsafe fn submit_write(
        &mut self,
        handle: RawHandle,
        buf: *const u8,
        len: usize,
        mut record: NonNull<EventRecord>,
    ) -> Result<(), Error> {
        record.as_mut().backend = RecordBackend::Kqueue(OpState::Write { buf, len });
        self.register(handle, libc::EVFILT_WRITE, record)
    }

    fn cancel_handle(&mut self, handle: RawHandle) -> Vec<NonNull<EventRecord>> {
        let Some(records) = self.by_fd.remove(&handle) else {
            return Vec::new();
        };
        for &record in &records {
            let kev_read = make_kevent(handle, libc::EVFILT_READ, libc::EV_DELETE, record);
            let kev_write = make_kevent(handle, libc::EVFILT_WRITE, libc::EV_DELETE, record);
            unsafe {
                libc::kevent(self.kq, &kev_read, 1, std::ptr::null_mut(), 0, std::ptr::null());
                libc::kevent(self.kq, &kev_write, 1, std::ptr::null_mut(), 0, std::ptr::null());
            }
        }
        records
    }
}

impl Drop for KqueueBackend {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.kq);
        }
    }
}
