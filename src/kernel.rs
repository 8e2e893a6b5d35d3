//! The kernel-TCP side of an endpoint: the real sockets whose handshake and
//! liveness keep NAT and conntrack state on path, neutralized so they never
//! transmit past the local host.

use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tokio::sync::watch;
use tracing::{trace, warn};

use crate::error::{Error, Result};

/// Connects a throwaway UDP socket to `remote` so the kernel's routing
/// decision reveals the egress interface and local address a real connection
/// would use.
pub(crate) async fn probe_route(remote: SocketAddr) -> Result<SocketAddr> {
    let bind_addr: SocketAddr = match remote {
        SocketAddr::V4(_) => "0.0.0.0:0".parse().expect("literal address"),
        SocketAddr::V6(_) => "[::]:0".parse().expect("literal address"),
    };
    let probe = UdpSocket::bind(bind_addr).await.map_err(Error::KernelSocket)?;
    probe.connect(remote).await.map_err(Error::KernelSocket)?;
    probe.local_addr().map_err(Error::KernelSocket)
}

/// Opens the real kernel TCP connection from the probed local address. The
/// kernel performs the full handshake, which is exactly what we want on the
/// wire.
pub(crate) async fn connect_from(local: SocketAddr, remote: SocketAddr) -> Result<TcpStream> {
    let socket = match local {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(Error::KernelSocket)?;
    socket.bind(local).map_err(Error::KernelSocket)?;
    socket.connect(remote).await.map_err(Error::KernelSocket)
}

/// Sets the socket's outgoing TTL / hop limit to zero so kernel-originated
/// segments (ACKs, window updates, the eventual FIN) die before the first hop
/// and never race our crafted segments. Some kernels refuse a zero TTL
/// outright; a refusal is logged and the endpoint carries on, matching the
/// reference behavior.
pub(crate) fn neutralize(stream: &TcpStream) {
    let result = match stream.local_addr() {
        Ok(SocketAddr::V4(_)) => stream.set_ttl(0),
        Ok(SocketAddr::V6(_)) => set_unicast_hops(stream, 0),
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        warn!("could not neutralize kernel transmission: {}", e);
    }
}

#[cfg(unix)]
fn set_unicast_hops(stream: &TcpStream, hops: libc::c_int) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::IPPROTO_IPV6,
            libc::IPV6_UNICAST_HOPS,
            &hops as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn set_unicast_hops(_stream: &TcpStream, _hops: i32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "hop-limit neutralization is only implemented for unix targets",
    ))
}

/// Discards everything the kernel receive path delivers (so the window keeps
/// sliding and the connection never stalls) and parks the socket until the
/// shutdown signal fires.
pub(crate) fn spawn_drain(stream: TcpStream, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let (mut read_half, _write_half) = stream.into_split();
        let mut sink = tokio::io::sink();
        tokio::select! {
            _ = shutdown.wait_for(|stopped| *stopped) => {}
            result = tokio::io::copy(&mut read_half, &mut sink) => {
                if let Err(e) = result {
                    trace!("kernel drain ended: {}", e);
                }
            }
        }
    });
}

/// Accepts kernel-side handshakes on behalf of a listener and neutralizes and
/// drains every accepted connection.
pub(crate) fn spawn_accept_loop(listener: TcpListener, shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut stop = shutdown.clone();
        loop {
            tokio::select! {
                _ = stop.wait_for(|stopped| *stopped) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        trace!(%peer, "kernel accepted shadow connection");
                        neutralize(&stream);
                        spawn_drain(stream, shutdown.clone());
                    }
                    Err(e) => {
                        warn!("kernel accept failed: {}", e);
                        break;
                    }
                }
            }
        }
    });
}
