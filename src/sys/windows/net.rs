//! Raw winsock helpers shared by the IOCP backend and the OS transport,
//! mirroring `sys/unix_common.rs` for the Windows target.
//!
//! Grounded on `sys/windows/net.rs`'s `sockaddr` conversion helpers;
//! generalized to the socket()/bind()/listen()/connect()-level surface the
//! teacher otherwise gets from `net2`/`socket2`.

use std::io;
use std::mem::size_of;
use std::net::SocketAddr;
use std::os::windows::io::RawSocket;
use std::sync::Once;

use winapi::shared::minwindef::DWORD;
use winapi::shared::ws2def::{AF_INET, AF_INET6, SOCKADDR, SOCKADDR_IN};
use winapi::shared::ws2ipdef::SOCKADDR_IN6;
use winapi::um::winsock2::{
    bind as wsa_bind, closesocket, connect as wsa_connect, getpeername, getsockname, ioctlsocket,
    listen as wsa_listen, setsockopt, shutdown as wsa_shutdown, socket, FIONBIO, INVALID_SOCKET,
    IPPROTO_TCP, SD_BOTH, SD_RECEIVE, SD_SEND, SOCKET, SOCKET_ERROR, SOCK_STREAM, SOL_SOCKET,
    SO_KEEPALIVE, SO_REUSEADDR, TCP_NODELAY, WSAEINPROGRESS, WSAEWOULDBLOCK, WSADATA, WSAStartup,
};

use crate::addr::Family;

static WSA_INIT: Once = Once::new();

fn ensure_wsa_started() {
    WSA_INIT.call_once(|| unsafe {
        let mut data: WSADATA = std::mem::zeroed();
        WSAStartup(0x0202, &mut data);
    });
}

fn family_to_af(family: Family) -> i32 {
    match family {
        Family::V4 => AF_INET as i32,
        Family::V6 => AF_INET6 as i32,
    }
}

pub(crate) fn new_stream_socket(family: Family) -> io::Result<RawSocket> {
    ensure_wsa_started();
    let sock = unsafe { socket(family_to_af(family), SOCK_STREAM, 0) };
    if sock == INVALID_SOCKET {
        return Err(io::Error::last_os_error());
    }
    let mut nonblocking: DWORD = 1;
    if unsafe { ioctlsocket(sock, FIONBIO, &mut nonblocking) } == SOCKET_ERROR {
        return Err(io::Error::last_os_error());
    }
    Ok(sock as RawSocket)
}

unsafe fn sockaddr_of(addr: &SocketAddr) -> (Vec<u8>, i32) {
    match addr {
        SocketAddr::V4(a) => {
            let mut raw: SOCKADDR_IN = std::mem::zeroed();
            raw.sin_family = AF_INET as u16;
            raw.sin_port = a.port().to_be();
            *raw.sin_addr.S_un.S_addr_mut() = u32::from_ne_bytes(a.ip().octets());
            let bytes = std::slice::from_raw_parts(&raw as *const _ as *const u8, size_of::<SOCKADDR_IN>()).to_vec();
            (bytes, size_of::<SOCKADDR_IN>() as i32)
        }
        SocketAddr::V6(a) => {
            let mut raw: SOCKADDR_IN6 = std::mem::zeroed();
            raw.sin6_family = AF_INET6 as u16;
            raw.sin6_port = a.port().to_be();
            *raw.sin6_addr.u.Byte_mut() = a.ip().octets();
            raw.sin6_scope_id = a.scope_id();
            let bytes = std::slice::from_raw_parts(&raw as *const _ as *const u8, size_of::<SOCKADDR_IN6>()).to_vec();
            (bytes, size_of::<SOCKADDR_IN6>() as i32)
        }
    }
}

pub(crate) fn bind(handle: RawSocket, addr: &SocketAddr) -> io::Result<()> {
    let (bytes, len) = unsafe { sockaddr_of(addr) };
    let ret = unsafe { wsa_bind(handle as SOCKET, bytes.as_ptr() as *const SOCKADDR, len) };
    if ret == SOCKET_ERROR {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn listen(handle: RawSocket, backlog: i32) -> io::Result<()> {
    if unsafe { wsa_listen(handle as SOCKET, backlog) } == SOCKET_ERROR {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn connect(handle: RawSocket, addr: &SocketAddr) -> io::Result<bool> {
    let (bytes, len) = unsafe { sockaddr_of(addr) };
    let ret = unsafe { wsa_connect(handle as SOCKET, bytes.as_ptr() as *const SOCKADDR, len) };
    if ret != SOCKET_ERROR {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == WSAEWOULDBLOCK as i32 || code == WSAEINPROGRESS as i32 => Ok(false),
        _ => Err(err),
    }
}

pub(crate) fn set_reuseaddr(handle: RawSocket, enable: bool) -> io::Result<()> {
    raw_setsockopt(handle, SOL_SOCKET, SO_REUSEADDR, enable)
}

pub(crate) fn set_keepalive(handle: RawSocket, enable: bool) -> io::Result<()> {
    raw_setsockopt(handle, SOL_SOCKET, SO_KEEPALIVE, enable)
}

pub(crate) fn set_nodelay(handle: RawSocket, enable: bool) -> io::Result<()> {
    raw_setsockopt(handle, IPPROTO_TCP as i32, TCP_NODELAY, enable)
}

fn raw_setsockopt(handle: RawSocket, level: i32, name: i32, enable: bool) -> io::Result<()> {
    let val: i32 = enable as i32;
    let ret = unsafe {
        setsockopt(
            handle as SOCKET,
            level,
            name,
            &val as *const _ as *const i8,
            size_of::<i32>() as i32,
        )
    };
    if ret == SOCKET_ERROR {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn shutdown(handle: RawSocket, how: ShutdownHow) -> io::Result<()> {
    let flag = match how {
        ShutdownHow::Read => SD_RECEIVE,
        ShutdownHow::Write => SD_SEND,
        ShutdownHow::Both => SD_BOTH,
    };
    if unsafe { wsa_shutdown(handle as SOCKET, flag) } == SOCKET_ERROR {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) enum ShutdownHow {
    Read,
    Write,
    Both,
}

pub(crate) fn close(handle: RawSocket) {
    unsafe {
        closesocket(handle as SOCKET);
    }
}

pub(crate) fn local_addr(handle: RawSocket) -> io::Result<SocketAddr> {
    addr_via(handle, true)
}

pub(crate) fn remote_addr(handle: RawSocket) -> io::Result<SocketAddr> {
    addr_via(handle, false)
}

fn addr_via(handle: RawSocket, local: bool) -> io::Result<SocketAddr> {
    let mut storage = [0u8; size_of::<SOCKADDR_IN6>()];
    let mut len: i32 = storage.len() as i32;
    let ret = unsafe {
        if local {
            getsockname(handle as SOCKET, storage.as_mut_ptr() as *mut SOCKADDR, &mut len)
        } else {
            getpeername(handle as SOCKET, storage.as_mut_ptr() as *mut SOCKADDR, &mut len)
        }
    };
    if ret == SOCKET_ERROR {
        return Err(io::Error::last_os_error());
    }
    let family = unsafe { (*(storage.as_ptr() as *const SOCKADDR)).sa_family };
    if family as i32 == AF_INET {
        let raw = unsafe { &*(storage.as_ptr() as *const SOCKADDR_IN) };
        let ip = std::net::Ipv4Addr::from(unsafe { *raw.sin_addr.S_un.S_addr() }.to_ne_bytes());
        Ok(SocketAddr::new(ip.into(), u16::from_be(raw.sin_port)))
    } else {
        let raw = unsafe { &*(storage.as_ptr() as *const SOCKADDR_IN6) };
        let ip = std::net::Ipv6Addr::from(unsafe { *raw.sin6_addr.u.Byte() });
        Ok(SocketAddr::new(ip.into(), u16::from_be(raw.sin6_port)))
    }
}
