//! Pre-bound listener pickup (systemd socket activation)
//!
//! Yields the packet sockets and stream listeners handed to the process by
//! the service manager. The caller decides what to serve on them.

use crate::error::{Error, Result};

/// Sockets inherited from the service manager: UDP packet sockets and TCP
/// stream listeners.
#[derive(Debug, Default)]
pub struct InheritedSockets {
    pub udp: Vec<std::net::UdpSocket>,
    pub tcp: Vec<std::net::TcpListener>,
}

#[cfg(unix)]
pub fn inherited_sockets() -> Result<InheritedSockets> {
    use std::os::unix::io::{FromRawFd, RawFd};

    const SD_LISTEN_FDS_START: RawFd = 3;

    let mut sockets = InheritedSockets::default();

    // LISTEN_PID must name this process, or the fds are not ours to take.
    let for_us = std::env::var("LISTEN_PID")
        .ok()
        .and_then(|pid| pid.parse::<u32>().ok())
        .map(|pid| pid == std::process::id())
        .unwrap_or(false);
    if !for_us {
        return Ok(sockets);
    }

    let nfds: RawFd = std::env::var("LISTEN_FDS")
        .ok()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0);

    for fd in SD_LISTEN_FDS_START..SD_LISTEN_FDS_START + nfds {
        // The fds arrive typeless; SO_TYPE tells UDP and TCP apart.
        match socket_type(fd)? {
            libc::SOCK_DGRAM => sockets
                .udp
                .push(unsafe { std::net::UdpSocket::from_raw_fd(fd) }),
            libc::SOCK_STREAM => sockets
                .tcp
                .push(unsafe { std::net::TcpListener::from_raw_fd(fd) }),
            other => {
                tracing::warn!(fd, kind = other, "ignoring inherited socket of unknown type");
            }
        }
    }

    Ok(sockets)
}

#[cfg(unix)]
fn socket_type(fd: std::os::unix::io::RawFd) -> Result<libc::c_int> {
    let mut kind: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;

    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_TYPE,
            &mut kind as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(kind)
}

#[cfg(not(unix))]
pub fn inherited_sockets() -> Result<InheritedSockets> {
    Err(Error::Config(
        "socket activation is only supported on unix".into(),
    ))
}
