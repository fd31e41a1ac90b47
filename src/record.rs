//! The event record: the per-operation link between a backend completion and
//! the callback that handles it (`spec.md` §3, "Event record").
//!
//! Grounded on `sys/windows/overlapped.rs`'s `Overlapped` struct, which pairs
//! a `callback: fn(&OVERLAPPED_ENTRY, ...)` with the OS completion storage
//! right next to it. Generalized per `SPEC_FULL.md` §3: the platform-specific
//! storage area is a backend-gated enum rather than a raw union, and the
//! callback is a boxed closure rather than a bare `fn` pointer so it can
//! capture the connection/listener it belongs to (there is no untyped `ctx`
//! pointer in Rust; the closure's captures are the `ctx`, per the Design Note
//! in `spec.md` §9 on callback context passing).

use crate::addr::Address;
use crate::error::Error;
use crate::event_loop::Loop;
use crate::sys::RawHandle;

/// What kind of object this record's callback acts on, kept only for
/// diagnostics and trace logging (`spec.md` §3 names this field explicitly;
/// the callback closure itself already carries everything needed to act on
/// completion, so this is observational rather than load-bearing).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subject {
    Connection,
    Listener,
    Timer,
}

/// The result of one backend operation, handed to a record's callback.
#[derive(Debug)]
pub enum Completion {
    Accepted { handle: RawHandle, remote: Address },
    Connected,
    Read { n: usize },
    Written { n: usize },
    /// The loop is tearing down; this outstanding operation will never
    /// complete on its own (`spec.md` §4.3 "Cancellation semantics").
    Cancelled,
    Error(Error),
}

/// What the loop should do with a record after its callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// The operation is finished; return the record to the slab.
    Complete,
    /// The callback resubmitted work on this same record (e.g. a listener
    /// re-arming its accept), so the loop must keep it allocated.
    Resubmitted,
}

pub(crate) type RecordCallback = Box<dyn FnMut(&mut Loop, Completion) -> RecordOutcome>;

/// Per-backend completion storage, `spec.md` §3's "platform-specific storage
/// area for the completion (e.g. an overlapped structure, a kernel-event
/// slot, or a submission/completion pair)", modelled per the Design Note in
/// `SPEC_FULL.md` §3 as a `cfg`-gated enum instead of a raw union.
pub(crate) enum RecordBackend {
    #[cfg(target_os = "linux")]
    Uring(crate::sys::linux::uring::OpState),
    #[cfg(all(unix, not(target_os = "linux")))]
    Kqueue(crate::sys::unix::kqueue::OpState),
    #[cfg(windows)]
    Iocp(crate::sys::windows::iocp::OpState),
}

/// Links a backend completion to its callback and subject
/// (`spec.md` §3, "Event record").
///
/// Allocated from the loop's slab when an operation is submitted; returned
/// to the slab once its callback reports [`RecordOutcome::Complete`].
pub(crate) struct EventRecord {
    pub(crate) callback: RecordCallback,
    pub subject: Subject,
    #[allow(dead_code)] // read by backend-specific submission/poll code only
    pub(crate) backend: RecordBackend,
}

impl EventRecord {
    pub(crate) fn new(subject: Subject, backend: RecordBackend, callback: RecordCallback) -> EventRecord {
        EventRecord { callback, subject, backend }
    }
}

impl RecordBackend {
    /// A throwaway value written when a slot is first allocated, overwritten
    /// immediately by the backend's own `submit_*` call before the record is
    /// ever polled. Exists only so `EventRecord::new` has something to put in
    /// `backend` before the submission that determines the real op state.
    pub(crate) fn placeholder() -> RecordBackend {
        #[cfg(target_os = "linux")]
        {
            RecordBackend::Uring(crate::sys::linux::uring::OpState::Read)
        }
        #[cfg(all(unix, not(target_os = "linux")))]
        {
            RecordBackend::Kqueue(crate::sys::unix::kqueue::OpState::Read { buf: std::ptr::null_mut(), len: 0 })
        }
        #[cfg(windows)]
        {
            RecordBackend::Iocp(crate::sys::windows::iocp::OpState::Read {
                overlapped: Box::new(unsafe { std::mem::zeroed() }),
            })
        }
    }
}
