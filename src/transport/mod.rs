//! Event-loop based transport.
//!
//! Sockets live on [`EventLoopGroup`] threads and are reached through
//! [`Channel`] handles. Operations complete through [`ChannelFuture`]s.

mod channel;
pub(crate) mod event_loop;
mod future;
pub(crate) mod socket;

pub use channel::{Channel, ChannelId, ChannelKind};
pub(crate) use event_loop::ChildInit;
pub use event_loop::EventLoopGroup;
pub use future::{ChannelFuture, ChannelGroupFuture};

use crate::config::ListenerConfiguration;
use crate::error::Error;
use event_loop::Command;
use socket::StreamOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// Binds a TCP listener on a `boss` loop. Accepted connections are
/// registered on `workers`.
pub(crate) fn bind(
    boss: &EventLoopGroup,
    workers: &EventLoopGroup,
    config: &ListenerConfiguration,
    addr: SocketAddr,
    child: ChildInit,
) -> Result<ChannelFuture, Error> {
    let listener = socket::bind_stream_listener(config, addr)?;
    let promise = ChannelFuture::new();
    let command = Command::Bind {
        listener,
        workers: workers.chooser(),
        options: StreamOptions::from_configuration(config),
        child,
        promise: promise.clone(),
    };
    if let Err(command) = boss.next().submit(command) {
        command.fail(Arc::new(Error::EventLoopTerminated));
    }
    Ok(promise)
}

/// Binds a UDP socket at `local` on one of `workers`, connected to `peer`
/// when given.
pub(crate) fn bind_datagram(
    workers: &EventLoopGroup,
    config: &ListenerConfiguration,
    local: SocketAddr,
    peer: Option<SocketAddr>,
    child: ChildInit,
) -> Result<ChannelFuture, Error> {
    let socket = socket::bind_datagram_socket(config, local, peer)?;
    let promise = ChannelFuture::new();
    let command = Command::BindDatagram {
        socket,
        child,
        promise: promise.clone(),
    };
    if let Err(command) = workers.next().submit(command) {
        command.fail(Arc::new(Error::EventLoopTerminated));
    }
    Ok(promise)
}

/// Starts a non-blocking TCP connect to `addr`.
///
/// The future carries the raw cause on failure (I/O error or
/// [`Error::ConnectTimeout`]) and succeeds with the new channel once it is
/// active, which for TLS means after the handshake.
pub(crate) fn connect(
    boss: &EventLoopGroup,
    workers: &EventLoopGroup,
    config: &ListenerConfiguration,
    addr: SocketAddr,
    child: ChildInit,
) -> ChannelFuture {
    debug!(%addr, "Connecting");
    let stream = match mio::net::TcpStream::connect(addr) {
        Ok(stream) => stream,
        Err(err) => return ChannelFuture::failed(Arc::new(err.into())),
    };
    let promise = ChannelFuture::new();
    let command = Command::Connect {
        stream,
        remote: addr,
        timeout: config.connect_timeout(),
        workers: workers.chooser(),
        options: StreamOptions::from_configuration(config),
        child,
        promise: promise.clone(),
    };
    if let Err(command) = boss.next().submit(command) {
        command.fail(Arc::new(Error::EventLoopTerminated));
    }
    promise
}
