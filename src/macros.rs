//! Small helper macros shared by the unix backend modules.

/// Call a raw libc function, turning a `-1` return into `io::Error::last_os_error()`.
///
/// Mirrors the `syscall!` macro the teacher's unix selectors use to avoid
/// repeating the same `if ret == -1 { Err(...) }` boilerplate at every call
/// site (see `sys/unix/selector/epoll.rs`, `sys/unix/selector/kqueue.rs`).
#[cfg(unix)]
macro_rules! syscall {
    ($fn:ident ( $($arg:expr),* $(,)* ) ) => {{
        #[allow(unused_unsafe)]
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

#[cfg(unix)]
pub(crate) use syscall;
