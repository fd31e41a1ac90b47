//! Raw socket creation and option helpers shared by every unix backend
//! (kqueue and io_uring both sit on the same BSD-socket primitives).
//!
//! Grounded on `sys/unix/net.rs`'s `sockaddr` conversion helpers, generalized
//! to the full socket()/bind()/listen()/connect()/accept() surface since the
//! teacher leaves socket creation to `socket2` in its modern era.

use std::io;
use std::mem::{size_of, size_of_val, MaybeUninit};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use crate::addr::Family;
use crate::macros::syscall;

pub(crate) fn socket_addr_to_raw(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => {
            let raw = &mut storage as *mut _ as *mut libc::sockaddr_in;
            unsafe { std::ptr::write(raw, std::mem::transmute_copy(a)) };
            size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            let raw = &mut storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe { std::ptr::write(raw, std::mem::transmute_copy(a)) };
            size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

/// # Safety
/// `storage` must have been populated by the kernel (via `accept`,
/// `getsockname`, or `getpeername`) with a valid `sockaddr_in`/`sockaddr_in6`.
pub(crate) unsafe fn raw_to_socket_addr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let raw = storage as *const _ as *const libc::sockaddr_in;
            Ok(SocketAddr::V4(std::mem::transmute_copy(&*raw)))
        }
        libc::AF_INET6 => {
            let raw = storage as *const _ as *const libc::sockaddr_in6;
            Ok(SocketAddr::V6(std::mem::transmute_copy(&*raw)))
        }
        _ => Err(io::ErrorKind::InvalidInput.into()),
    }
}

fn family_to_af(family: Family) -> libc::c_int {
    match family {
        Family::V4 => libc::AF_INET,
        Family::V6 => libc::AF_INET6,
    }
}

/// Create a non-blocking, close-on-exec TCP socket for `family`.
pub(crate) fn new_stream_socket(family: Family) -> io::Result<RawFd> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let ty = libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let ty = libc::SOCK_STREAM;

    let fd = syscall!(socket(family_to_af(family), ty, 0))? as RawFd;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        set_nonblocking(fd)?;
        set_cloexec(fd)?;
    }
    Ok(fd)
}

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFL))?;
    syscall!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK))?;
    Ok(())
}

pub(crate) fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = syscall!(fcntl(fd, libc::F_GETFD))?;
    syscall!(fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC))?;
    Ok(())
}

pub(crate) fn set_reuseaddr(fd: RawFd, enable: bool) -> io::Result<()> {
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, enable)
}

pub(crate) fn set_keepalive(fd: RawFd, enable: bool) -> io::Result<()> {
    setsockopt(fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, enable)
}

pub(crate) fn set_nodelay(fd: RawFd, enable: bool) -> io::Result<()> {
    setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, enable)
}

fn setsockopt(fd: RawFd, level: libc::c_int, name: libc::c_int, enable: bool) -> io::Result<()> {
    let val: libc::c_int = enable as libc::c_int;
    syscall!(setsockopt(
        fd,
        level,
        name,
        &val as *const _ as *const libc::c_void,
        size_of_val(&val) as libc::socklen_t
    ))?;
    Ok(())
}

pub(crate) fn bind(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = socket_addr_to_raw(addr);
    syscall!(bind(fd, &storage as *const _ as *const libc::sockaddr, len))?;
    Ok(())
}

pub(crate) fn listen(fd: RawFd, backlog: i32) -> io::Result<()> {
    syscall!(listen(fd, backlog))?;
    Ok(())
}

/// Issue a non-blocking `connect`. `Ok(true)` means it completed
/// synchronously (rare, e.g. connecting to localhost); `Ok(false)` means it
/// is in progress and the backend should wait for writability/a completion.
pub(crate) fn connect(fd: RawFd, addr: &SocketAddr) -> io::Result<bool> {
    let (storage, len) = socket_addr_to_raw(addr);
    let ret = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if ret == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EINPROGRESS) {
        Ok(false)
    } else {
        Err(err)
    }
}

/// Accept one pending connection, returning the new non-blocking fd and its
/// peer address, or `Ok(None)` if nothing is pending (`EAGAIN`/`EWOULDBLOCK`).
pub(crate) fn accept(fd: RawFd) -> io::Result<Option<(RawFd, SocketAddr)>> {
    let mut storage = MaybeUninit::<libc::sockaddr_storage>::zeroed();
    let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret = unsafe {
        libc::accept(fd, storage.as_mut_ptr() as *mut libc::sockaddr, &mut len)
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::EAGAIN) => Ok(None),
            _ => Err(err),
        };
    }
    let client = ret as RawFd;
    set_nonblocking(client)?;
    set_cloexec(client)?;
    let storage = unsafe { storage.assume_init() };
    let peer = unsafe { raw_to_socket_addr(&storage)? };
    Ok(Some((client, peer)))
}

pub(crate) fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage = MaybeUninit::<libc::sockaddr_storage>::zeroed();
    let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getsockname(fd, storage.as_mut_ptr() as *mut libc::sockaddr, &mut len))?;
    unsafe { raw_to_socket_addr(&storage.assume_init()) }
}

pub(crate) fn remote_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage = MaybeUninit::<libc::sockaddr_storage>::zeroed();
    let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    syscall!(getpeername(fd, storage.as_mut_ptr() as *mut libc::sockaddr, &mut len))?;
    unsafe { raw_to_socket_addr(&storage.assume_init()) }
}

pub(crate) fn shutdown(fd: RawFd, how: libc::c_int) -> io::Result<()> {
    let ret = unsafe { libc::shutdown(fd, how) };
    if ret == -1 {
        let err = io::Error::last_os_error();
        // The peer may have already closed its half; that's not ours to
        // report as a failure of *our* shutdown request.
        if err.raw_os_error() != Some(libc::ENOTCONN) {
            return Err(err);
        }
    }
    Ok(())
}

pub(crate) fn close(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}
