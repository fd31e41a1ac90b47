//! Platform backends (`spec.md` §6): exactly one compiles for any given
//! target, selected the same way the teacher's own `crate::sys::Selector`
//! picks one OS module per target (`sys/mod.rs` in the teacher re-exports a
//! single concrete selector type; we do the same for a single concrete
//! `Backend`).
//!
//! | target | backend | OS facility |
//! |---|---|---|
//! | Linux | [`linux::uring`] | `io_uring` submission/completion rings |
//! | other unix | [`unix::kqueue`] | `kevent(2)`, readiness synthesised into completions |
//! | Windows | [`windows::iocp`] | I/O completion ports |

use std::time::Duration;

use crate::error::Error;
use crate::record::{Completion, EventRecord};

#[cfg(unix)]
pub(crate) mod unix_common;

#[cfg(target_os = "linux")]
pub(crate) mod linux;
#[cfg(target_os = "linux")]
pub(crate) use linux::uring::UringBackend as PlatformBackend;

#[cfg(all(unix, not(target_os = "linux")))]
pub(crate) mod unix;
#[cfg(all(unix, not(target_os = "linux")))]
pub(crate) use unix::kqueue::KqueueBackend as PlatformBackend;

#[cfg(windows)]
pub(crate) mod windows;
#[cfg(windows)]
pub(crate) use windows::iocp::IocpBackend as PlatformBackend;

/// The OS-visible handle behind every connection and listener
/// (`spec.md` §6: "The connection's OS-visible handle is a socket in all
/// three cases").
#[cfg(unix)]
pub type RawHandle = std::os::unix::io::RawFd;
#[cfg(windows)]
pub type RawHandle = std::os::windows::io::RawSocket;

/// One record's outcome, recovered from a backend-delivered completion and
/// paired with the `EventRecord` it belongs to. The loop's iteration step 3
/// ("retrieve up to a fixed batch of ready completions", `spec.md` §4.3)
/// fills a `Vec` of these each pass.
pub(crate) struct RawCompletion {
    pub(crate) record: std::ptr::NonNull<EventRecord>,
    pub(crate) completion: Completion,
}

/// The contract every backend implements: construct, poll, and submit the
/// handful of operations the TCP connection/listener state machines issue.
/// Generalizes the teacher's `Selector` (readiness-only) into a
/// completion-oriented contract per `spec.md` §6.
pub(crate) trait Backend: Sized {
    fn new() -> Result<Self, Error>;

    /// Wait up to `timeout` (`None` = forever) for backend completions,
    /// appending each to `out`. Corresponds to `spec.md` §4.3 step 3.
    fn poll(&mut self, timeout: Option<Duration>, out: &mut Vec<RawCompletion>) -> Result<(), Error>;

    /// Submit an accept on `listener`. `record`'s callback receives
    /// [`Completion::Accepted`] or an error.
    ///
    /// # Safety
    /// `record` must remain valid (i.e. stay allocated in the loop's slab)
    /// until the backend reports its completion or the loop cancels it.
    unsafe fn submit_accept(
        &mut self,
        listener: RawHandle,
        record: std::ptr::NonNull<EventRecord>,
    ) -> Result<(), Error>;

    /// Submit a non-blocking connect. `record`'s callback receives
    /// [`Completion::Connected`] or an error.
    ///
    /// # Safety
    /// Same obligation as [`submit_accept`][Backend::submit_accept].
    unsafe fn submit_connect(
        &mut self,
        handle: RawHandle,
        addr: std::net::SocketAddr,
        record: std::ptr::NonNull<EventRecord>,
    ) -> Result<(), Error>;

    /// Submit a read into `[buf, buf + len)`. `record`'s callback receives
    /// [`Completion::Read`] or an error.
    ///
    /// # Safety
    /// `buf` must be valid for `len` writable bytes for as long as the
    /// operation is outstanding; same record-lifetime obligation as
    /// [`submit_accept`][Backend::submit_accept].
    unsafe fn submit_read(
        &mut self,
        handle: RawHandle,
        buf: *mut u8,
        len: usize,
        record: std::ptr::NonNull<EventRecord>,
    ) -> Result<(), Error>;

    /// Submit a write of `[buf, buf + len)`. `record`'s callback receives
    /// [`Completion::Written`] or an error.
    ///
    /// # Safety
    /// `buf` must be valid for `len` readable bytes for as long as the
    /// operation is outstanding; same record-lifetime obligation as
    /// [`submit_accept`][Backend::submit_accept].
    unsafe fn submit_write(
        &mut self,
        handle: RawHandle,
        buf: *const u8,
        len: usize,
        record: std::ptr::NonNull<EventRecord>,
    ) -> Result<(), Error>;

    /// Best-effort cancellation of every outstanding operation on `handle`,
    /// used by `close` (`spec.md` §5, "Calling close ... cancels all pending
    /// operations on it"). Backends whose cancellation itself completes
    /// asynchronously through the normal completion path (io_uring's
    /// `AsyncCancel`, IOCP's `CancelIoEx`) return an empty vec here and
    /// deliver `Completion::Cancelled` later through `poll`. kqueue's
    /// `EV_DELETE` is synchronous and never visits the completion port, so
    /// it returns the records that need an immediate, caller-driven
    /// cancellation callback.
    fn cancel_handle(&mut self, handle: RawHandle) -> Vec<std::ptr::NonNull<EventRecord>>;
}
