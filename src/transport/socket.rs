//! Socket construction with the configured options.

use crate::config::ListenerConfiguration;
use crate::error::Error;
use socket2::{Domain, Protocol as SockProtocol, SockRef, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

const DEFAULT_BACKLOG: i32 = 128;

/// Options applied to every accepted or connected stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StreamOptions {
    tcp_no_delay: bool,
    keep_alive: bool,
    send_buffer_size: usize,
    receive_buffer_size: usize,
}

impl StreamOptions {
    pub(crate) fn from_configuration(config: &ListenerConfiguration) -> Self {
        Self {
            tcp_no_delay: config.tcp_no_delay,
            keep_alive: config.keep_alive,
            send_buffer_size: config.send_buffer_size,
            receive_buffer_size: config.receive_buffer_size,
        }
    }

    pub(crate) fn apply(&self, stream: &mio::net::TcpStream) -> io::Result<()> {
        let socket = SockRef::from(stream);
        socket.set_nodelay(self.tcp_no_delay)?;
        socket.set_keepalive(self.keep_alive)?;
        if self.send_buffer_size > 0 {
            socket.set_send_buffer_size(self.send_buffer_size)?;
        }
        if self.receive_buffer_size > 0 {
            socket.set_recv_buffer_size(self.receive_buffer_size)?;
        }
        Ok(())
    }
}

/// Binds a non-blocking listening socket at `addr`.
pub(crate) fn bind_stream_listener(
    config: &ListenerConfiguration,
    addr: SocketAddr,
) -> Result<std::net::TcpListener, Error> {
    let bind_failed = |source| Error::BindFailed {
        address: config.address(),
        source,
    };
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(SockProtocol::TCP))
        .map_err(bind_failed)?;
    socket
        .set_reuse_address(config.reuse_address)
        .map_err(bind_failed)?;
    if config.receive_buffer_size > 0 {
        socket
            .set_recv_buffer_size(config.receive_buffer_size)
            .map_err(bind_failed)?;
    }
    socket.bind(&addr.into()).map_err(bind_failed)?;
    let backlog = match config.backlog {
        0 => DEFAULT_BACKLOG,
        n => i32::try_from(n).unwrap_or(i32::MAX),
    };
    socket.listen(backlog).map_err(bind_failed)?;
    socket.set_nonblocking(true).map_err(bind_failed)?;
    Ok(socket.into())
}

/// Binds a non-blocking UDP socket at `local`, connected to `peer` if given.
pub(crate) fn bind_datagram_socket(
    config: &ListenerConfiguration,
    local: SocketAddr,
    peer: Option<SocketAddr>,
) -> Result<std::net::UdpSocket, Error> {
    let bind_failed = |source| Error::BindFailed {
        address: config.address(),
        source,
    };
    let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(SockProtocol::UDP))
        .map_err(bind_failed)?;
    socket
        .set_reuse_address(config.reuse_address)
        .map_err(bind_failed)?;
    socket.set_broadcast(config.broadcast).map_err(bind_failed)?;
    if config.send_buffer_size > 0 {
        socket
            .set_send_buffer_size(config.send_buffer_size)
            .map_err(bind_failed)?;
    }
    if config.receive_buffer_size > 0 {
        socket
            .set_recv_buffer_size(config.receive_buffer_size)
            .map_err(bind_failed)?;
    }
    socket.bind(&local.into()).map_err(bind_failed)?;
    if let Some(peer) = peer {
        socket.connect(&peer.into()).map_err(bind_failed)?;
    }
    socket.set_nonblocking(true).map_err(bind_failed)?;
    Ok(socket.into())
}

/// Wildcard address of the same family as `target`, any port.
pub(crate) fn unspecified_for(target: SocketAddr) -> SocketAddr {
    let ip = match target.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    SocketAddr::new(ip, 0)
}
