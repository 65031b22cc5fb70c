//! mio event loops.
//!
//! Each loop runs on its own thread and owns the sockets registered with it.
//! Other threads talk to a loop by sending a [`Command`] and waking it. A
//! boss loop accepts connections and completes outbound connects, then hands
//! the stream to a worker loop chosen round-robin; worker loops do the
//! reads and writes and invoke the pipeline handler.

use super::channel::{Channel, ChannelId, ChannelKind};
use super::socket::StreamOptions;
use super::ChannelFuture;
use crate::error::{Error, SharedError};
use crate::executor::ThreadFactory;
use crate::pipeline::{Pipeline, PipelineFactory};
use crate::registry::ChannelGroup;
use crate::tls::TlsSession;

use mio::event::Event;
use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::collections::{HashMap, VecDeque};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, trace, warn};

const WAKE_TOKEN: Token = Token(0);
const POLL_CAPACITY: usize = 256;
const READ_CHUNK: usize = 64 * 1024;

// ============================================================================
// Commands and Handles
// ============================================================================

/// What a new child channel is initialised with.
#[derive(Clone)]
pub(crate) struct ChildInit {
    pub(crate) factory: Arc<dyn PipelineFactory>,
    /// Every group the channel joins while open.
    pub(crate) groups: Vec<ChannelGroup>,
}

pub(crate) enum Command {
    Bind {
        listener: std::net::TcpListener,
        workers: LoopChooser,
        options: StreamOptions,
        child: ChildInit,
        promise: ChannelFuture,
    },
    BindDatagram {
        socket: std::net::UdpSocket,
        child: ChildInit,
        promise: ChannelFuture,
    },
    Connect {
        stream: TcpStream,
        remote: SocketAddr,
        timeout: Option<Duration>,
        workers: LoopChooser,
        options: StreamOptions,
        child: ChildInit,
        promise: ChannelFuture,
    },
    Register {
        stream: TcpStream,
        remote: SocketAddr,
        child: ChildInit,
        promise: Option<ChannelFuture>,
    },
    Write {
        id: ChannelId,
        data: Vec<u8>,
        target: Option<SocketAddr>,
        promise: ChannelFuture,
    },
    Close {
        id: ChannelId,
    },
    SetReadTimeout {
        id: ChannelId,
        timeout: Option<Duration>,
    },
    Shutdown,
}

impl Command {
    /// Fails whatever promise the command carries.
    pub(crate) fn fail(self, cause: SharedError) {
        match self {
            Command::Bind { promise, .. }
            | Command::BindDatagram { promise, .. }
            | Command::Connect { promise, .. }
            | Command::Write { promise, .. } => {
                promise.set_failure(cause);
            }
            Command::Register { promise, .. } => {
                if let Some(promise) = promise {
                    promise.set_failure(cause);
                }
            }
            Command::Close { .. } | Command::SetReadTimeout { .. } | Command::Shutdown => {}
        }
    }
}

/// Thread-safe handle to one event loop.
#[derive(Clone)]
pub(crate) struct EventLoopHandle {
    name: Arc<str>,
    sender: Sender<Command>,
    waker: Arc<Waker>,
}

impl EventLoopHandle {
    /// Queues `command` and wakes the loop. Hands the command back if the
    /// loop has terminated.
    pub(crate) fn submit(&self, command: Command) -> Result<(), Command> {
        self.sender.send(command).map_err(|err| err.0)?;
        if let Err(err) = self.waker.wake() {
            error!(event_loop = %self.name, ?err, "Failed to wake event loop");
        }
        Ok(())
    }
}

/// Round-robin selection over a fixed set of loops.
#[derive(Clone)]
pub(crate) struct LoopChooser {
    loops: Arc<[EventLoopHandle]>,
    next: Arc<AtomicUsize>,
}

impl LoopChooser {
    pub(crate) fn next(&self) -> EventLoopHandle {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        self.loops[index].clone()
    }
}

// ============================================================================
// EventLoopGroup
// ============================================================================

/// A fixed number of event loop threads.
///
/// Shut down explicitly with [`shutdown_gracefully`](Self::shutdown_gracefully)
/// or by dropping the last reference.
pub struct EventLoopGroup {
    name: String,
    chooser: LoopChooser,
    threads: Mutex<Vec<JoinHandle<()>>>,
    shutdown: AtomicBool,
}

impl EventLoopGroup {
    pub fn new(name: &str, count: usize, threads: &ThreadFactory) -> Result<Self, Error> {
        let count = count.max(1);
        let mut handles = Vec::with_capacity(count);
        let mut join_handles = Vec::with_capacity(count);
        for index in 0..count {
            let poll = Poll::new()?;
            let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
            let (sender, receiver) = channel();
            let handle = EventLoopHandle {
                name: Arc::from(format!("{name}-{index}")),
                sender,
                waker,
            };
            let event_loop = EventLoop::new(poll, receiver, handle.clone());
            join_handles.push(threads.spawn(name, move || event_loop.run())?);
            handles.push(handle);
        }
        debug!(name, count, "Started event loop group");
        Ok(Self {
            name: name.to_string(),
            chooser: LoopChooser {
                loops: Arc::from(handles),
                next: Arc::new(AtomicUsize::new(0)),
            },
            threads: Mutex::new(join_handles),
            shutdown: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.chooser.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chooser.loops.is_empty()
    }

    pub(crate) fn next(&self) -> EventLoopHandle {
        self.chooser.next()
    }

    pub(crate) fn chooser(&self) -> LoopChooser {
        self.chooser.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Closes every channel owned by the group's loops and joins the threads.
    pub fn shutdown_gracefully(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        for handle in self.chooser.loops.iter() {
            // A loop that already exited has nothing left to close.
            let _ = handle.submit(Command::Shutdown);
        }
        let current = std::thread::current().id();
        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        for thread in threads {
            if thread.thread().id() == current {
                continue;
            }
            if thread.join().is_err() {
                error!(name = %self.name, "Event loop thread panicked");
            }
        }
        info!(name = %self.name, "Event loop group shut down");
    }
}

impl Drop for EventLoopGroup {
    fn drop(&mut self) {
        self.shutdown_gracefully();
    }
}

// ============================================================================
// Registered Sockets
// ============================================================================

struct ListenerEntry {
    channel: Channel,
    listener: TcpListener,
    workers: LoopChooser,
    options: StreamOptions,
    child: ChildInit,
}

struct PendingConnect {
    stream: TcpStream,
    remote: SocketAddr,
    deadline: Option<(Instant, Duration)>,
    workers: LoopChooser,
    child: ChildInit,
    promise: ChannelFuture,
}

enum ReadEnd {
    Open,
    Eof,
    Failed(Error),
}

struct StreamConnection {
    channel: Channel,
    stream: TcpStream,
    tls: Option<TlsSession>,
    active: bool,
    interest: Interest,
    send_buf: Vec<u8>,
    queued: u64,
    flushed: u64,
    pending_writes: VecDeque<(u64, ChannelFuture)>,
    pipeline: Pipeline,
    read_timeout: Option<Duration>,
    last_read: Instant,
    connect_promise: Option<ChannelFuture>,
}

impl StreamConnection {
    fn read(&mut self) -> (Vec<u8>, ReadEnd) {
        if self.tls.is_some() {
            self.read_tls_stream()
        } else {
            self.read_plain_stream()
        }
    }

    fn read_plain_stream(&mut self) -> (Vec<u8>, ReadEnd) {
        let mut data = Vec::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return (data, ReadEnd::Eof),
                Ok(n) => {
                    trace!(len = n, "Read data from socket");
                    data.extend_from_slice(&chunk[..n]);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return (data, ReadEnd::Open),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return (data, ReadEnd::Failed(err.into())),
            }
        }
    }

    fn read_tls_stream(&mut self) -> (Vec<u8>, ReadEnd) {
        let mut data = Vec::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        let Some(tls) = self.tls.as_mut() else {
            return (data, ReadEnd::Open);
        };
        loop {
            let socket_eof = match tls.read_tls(&mut self.stream) {
                Ok(0) => true,
                Ok(n) => {
                    trace!(len = n, "Read encrypted data from socket");
                    false
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return (data, ReadEnd::Open),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return (data, ReadEnd::Failed(err.into())),
            };

            if let Err(err) = tls.process_new_packets() {
                // Deliver the alert before the socket goes away.
                let _ = tls.write_tls(&mut self.stream);
                return (data, ReadEnd::Failed(Error::Tls(err.to_string())));
            }

            loop {
                match tls.reader().read(&mut chunk) {
                    // Peer sent close_notify.
                    Ok(0) => return (data, ReadEnd::Eof),
                    Ok(n) => data.extend_from_slice(&chunk[..n]),
                    Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                        return (data, ReadEnd::Eof)
                    }
                    Err(err) => return (data, ReadEnd::Failed(err.into())),
                }
            }

            if socket_eof {
                return (data, ReadEnd::Eof);
            }
        }
    }

    fn queue(&mut self, data: Vec<u8>, promise: ChannelFuture) {
        self.queued += data.len() as u64;
        if self.send_buf.is_empty() {
            self.send_buf = data;
        } else {
            self.send_buf.extend(data);
        }
        self.pending_writes.push_back((self.queued, promise));
    }

    /// Writes as much of the send buffer as the socket takes and completes
    /// the write futures that are fully flushed, in submission order.
    fn flush(&mut self) -> Result<(), Error> {
        let mut pos = 0;
        let result = match self.tls.as_mut() {
            None => loop {
                if pos == self.send_buf.len() {
                    break Ok(());
                }
                match self.stream.write(&self.send_buf[pos..]) {
                    Ok(0) => break Err(Error::Io(ErrorKind::WriteZero.into())),
                    Ok(n) => {
                        trace!(len = n, remaining = self.send_buf.len() - pos - n, "Wrote to socket");
                        pos += n;
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => break Ok(()),
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err) => break Err(err.into()),
                }
            },
            Some(tls) => 'tls: {
                if !tls.is_handshaking() {
                    while pos < self.send_buf.len() {
                        match tls.writer().write(&self.send_buf[pos..]) {
                            Ok(0) => break,
                            Ok(n) => pos += n,
                            Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                            Err(err) => break 'tls Err(err.into()),
                        }
                    }
                }
                while tls.wants_write() {
                    match tls.write_tls(&mut self.stream) {
                        Ok(0) => break,
                        Ok(n) => trace!(len = n, "Wrote encrypted data to socket"),
                        Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                        Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                        Err(err) => break 'tls Err(err.into()),
                    }
                }
                Ok(())
            }
        };

        self.send_buf.drain(..pos);
        self.flushed += pos as u64;
        while let Some((end, _)) = self.pending_writes.front() {
            if *end > self.flushed {
                break;
            }
            if let Some((_, promise)) = self.pending_writes.pop_front() {
                promise.set_success(None);
            }
        }
        result
    }

    fn handshake_done(&self) -> bool {
        self.tls.as_ref().map_or(true, |tls| !tls.is_handshaking())
    }

    fn update_interest(&mut self, registry: &Registry) -> std::io::Result<()> {
        let wants_write = !self.send_buf.is_empty()
            || self.tls.as_ref().map_or(false, TlsSession::wants_write);
        let interest = if wants_write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        if interest != self.interest {
            registry.reregister(&mut self.stream, self.channel.id().token(), interest)?;
            self.interest = interest;
        }
        Ok(())
    }

    fn read_deadline(&self) -> Option<Instant> {
        self.read_timeout.map(|timeout| self.last_read + timeout)
    }
}

struct Outbound {
    data: Vec<u8>,
    target: Option<SocketAddr>,
    promise: ChannelFuture,
}

struct DatagramEndpoint {
    channel: Channel,
    socket: UdpSocket,
    interest: Interest,
    outbound: VecDeque<Outbound>,
    pipeline: Pipeline,
    read_timeout: Option<Duration>,
    last_read: Instant,
}

impl DatagramEndpoint {
    fn read_deadline(&self) -> Option<Instant> {
        self.read_timeout.map(|timeout| self.last_read + timeout)
    }

    fn flush(&mut self) {
        while let Some(outbound) = self.outbound.front() {
            let result = match outbound.target {
                Some(target) => self.socket.send_to(&outbound.data, target),
                None => self.socket.send(&outbound.data),
            };
            match result {
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                result => {
                    if let Some(outbound) = self.outbound.pop_front() {
                        match result {
                            Ok(n) => {
                                trace!(len = n, target = ?outbound.target, "Sent datagram");
                                outbound.promise.set_success(None);
                            }
                            Err(err) => {
                                outbound.promise.set_failure(Arc::new(err.into()));
                            }
                        }
                    }
                }
            }
        }
    }

    fn update_interest(&mut self, registry: &Registry) -> std::io::Result<()> {
        let interest = if self.outbound.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };
        if interest != self.interest {
            registry.reregister(&mut self.socket, self.channel.id().token(), interest)?;
            self.interest = interest;
        }
        Ok(())
    }
}

// ============================================================================
// EventLoop
// ============================================================================

struct EventLoop {
    poll: Poll,
    receiver: Receiver<Command>,
    handle: EventLoopHandle,
    listeners: HashMap<Token, ListenerEntry>,
    connecting: HashMap<Token, PendingConnect>,
    connections: HashMap<Token, StreamConnection>,
    datagrams: HashMap<Token, DatagramEndpoint>,
}

impl EventLoop {
    fn new(poll: Poll, receiver: Receiver<Command>, handle: EventLoopHandle) -> Self {
        Self {
            poll,
            receiver,
            handle,
            listeners: HashMap::new(),
            connecting: HashMap::new(),
            connections: HashMap::new(),
            datagrams: HashMap::new(),
        }
    }

    #[instrument(skip(self), fields(event_loop = %self.handle.name))]
    fn run(mut self) {
        let mut events = Events::with_capacity(POLL_CAPACITY);
        loop {
            if !self.process_commands() {
                break;
            }

            let timeout = self.next_timeout();
            if let Err(err) = self.poll.poll(&mut events, timeout) {
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!(?err, "Poll failed, terminating event loop");
                break;
            }

            for event in events.iter() {
                let token = event.token();
                if token == WAKE_TOKEN {
                    continue;
                }
                self.dispatch(token, event);
            }

            self.expire_deadlines();
        }
        self.close_all();
    }

    fn dispatch(&mut self, token: Token, event: &Event) {
        if self.listeners.contains_key(&token) {
            self.accept_connections(token);
        } else if self.connecting.contains_key(&token) {
            self.finish_connect(token);
        } else if self.connections.contains_key(&token) {
            self.service_connection(token, event);
        } else if self.datagrams.contains_key(&token) {
            self.service_datagram(token, event);
        } else {
            trace!(?token, "Event for closed channel");
        }
    }

    // Returns false once the loop should terminate.
    fn process_commands(&mut self) -> bool {
        loop {
            let command = match self.receiver.try_recv() {
                Ok(command) => command,
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            };
            match command {
                Command::Bind {
                    listener,
                    workers,
                    options,
                    child,
                    promise,
                } => self.bind(listener, workers, options, child, promise),
                Command::BindDatagram {
                    socket,
                    child,
                    promise,
                } => self.bind_datagram(socket, child, promise),
                Command::Connect {
                    stream,
                    remote,
                    timeout,
                    workers,
                    options,
                    child,
                    promise,
                } => self.connect(stream, remote, timeout, workers, options, child, promise),
                Command::Register {
                    stream,
                    remote,
                    child,
                    promise,
                } => self.register_stream(stream, remote, child, promise),
                Command::Write {
                    id,
                    data,
                    target,
                    promise,
                } => self.write(id, data, target, promise),
                Command::Close { id } => self.close_channel(id.token()),
                Command::SetReadTimeout { id, timeout } => self.set_read_timeout(id, timeout),
                Command::Shutdown => return false,
            }
        }
    }

    fn next_timeout(&self) -> Option<Duration> {
        let read_deadlines = self
            .connections
            .values()
            .filter_map(StreamConnection::read_deadline)
            .chain(self.datagrams.values().filter_map(DatagramEndpoint::read_deadline));
        let connect_deadlines = self
            .connecting
            .values()
            .filter_map(|pending| pending.deadline.map(|(deadline, _)| deadline));
        read_deadlines
            .chain(connect_deadlines)
            .min()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

// ============================================================================
// Binding and Connecting
// ============================================================================

impl EventLoop {
    #[instrument(skip_all)]
    fn bind(
        &mut self,
        listener: std::net::TcpListener,
        workers: LoopChooser,
        options: StreamOptions,
        child: ChildInit,
        promise: ChannelFuture,
    ) {
        let mut listener = TcpListener::from_std(listener);
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                promise.set_failure(Arc::new(err.into()));
                return;
            }
        };
        let id = ChannelId::next();
        if let Err(err) = self
            .poll
            .registry()
            .register(&mut listener, id.token(), Interest::READABLE)
        {
            promise.set_failure(Arc::new(err.into()));
            return;
        }
        let channel = Channel::new(id, ChannelKind::Listener, local_addr, None, self.handle.clone());
        channel.mark_active();
        info!(%id, %local_addr, "Listening for connections");
        self.listeners.insert(
            id.token(),
            ListenerEntry {
                channel: channel.clone(),
                listener,
                workers,
                options,
                child,
            },
        );
        promise.set_success(Some(channel));
    }

    #[instrument(skip_all)]
    fn bind_datagram(&mut self, socket: std::net::UdpSocket, child: ChildInit, promise: ChannelFuture) {
        let mut socket = UdpSocket::from_std(socket);
        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                promise.set_failure(Arc::new(err.into()));
                return;
            }
        };
        let remote_addr = socket.peer_addr().ok();
        let id = ChannelId::next();
        let channel = Channel::new(
            id,
            ChannelKind::Datagram,
            local_addr,
            remote_addr,
            self.handle.clone(),
        );
        let mut pipeline = match child.factory.init_channel(&channel) {
            Ok(pipeline) => pipeline,
            Err(err) => {
                channel.mark_closed();
                channel.close_future().set_success(None);
                promise.set_failure(Arc::new(err));
                return;
            }
        };
        if pipeline.tls.take().is_some() {
            warn!(%id, "TLS is not supported on datagram channels, ignoring");
        }
        if let Err(err) = self
            .poll
            .registry()
            .register(&mut socket, id.token(), Interest::READABLE)
        {
            channel.mark_closed();
            channel.close_future().set_success(None);
            promise.set_failure(Arc::new(err.into()));
            return;
        }

        for group in &child.groups {
            group.add(&channel);
        }
        let handler = Arc::clone(pipeline.handler());
        self.datagrams.insert(
            id.token(),
            DatagramEndpoint {
                channel: channel.clone(),
                socket,
                interest: Interest::READABLE,
                outbound: VecDeque::new(),
                pipeline,
                read_timeout: None,
                last_read: Instant::now(),
            },
        );
        info!(%id, %local_addr, remote_addr = ?remote_addr, "Bound datagram socket");
        channel.mark_active();
        handler.channel_active(&channel);
        promise.set_success(Some(channel));
    }

    #[allow(clippy::too_many_arguments)]
    #[instrument(skip_all, fields(%remote))]
    fn connect(
        &mut self,
        mut stream: TcpStream,
        remote: SocketAddr,
        timeout: Option<Duration>,
        workers: LoopChooser,
        options: StreamOptions,
        child: ChildInit,
        promise: ChannelFuture,
    ) {
        if let Err(err) = options.apply(&stream) {
            warn!(?err, "Failed to apply socket options");
        }
        let token = ChannelId::next().token();
        if let Err(err) = self
            .poll
            .registry()
            .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)
        {
            promise.set_failure(Arc::new(err.into()));
            return;
        }
        debug!("Initiating connection");
        self.connecting.insert(
            token,
            PendingConnect {
                stream,
                remote,
                deadline: timeout.map(|timeout| (Instant::now() + timeout, timeout)),
                workers,
                child,
                promise,
            },
        );
    }

    fn finish_connect(&mut self, token: Token) {
        let Some(pending) = self.connecting.get_mut(&token) else {
            return;
        };
        let failure = match pending.stream.take_error() {
            Ok(Some(err)) | Err(err) => Some(err),
            Ok(None) => match pending.stream.peer_addr() {
                Ok(_) => None,
                // Not connected yet; wait for the next event.
                Err(err) if err.kind() == ErrorKind::NotConnected => return,
                Err(err) => Some(err),
            },
        };

        let Some(mut pending) = self.connecting.remove(&token) else {
            return;
        };
        if let Err(err) = self.poll.registry().deregister(&mut pending.stream) {
            warn!(?err, "Failed to deregister connecting stream");
        }
        let remote = pending.remote;
        match failure {
            Some(err) => {
                info!(%remote, ?err, "Connection failed");
                pending.promise.set_failure(Arc::new(err.into()));
            }
            None => {
                debug!(%remote, "Connection established");
                let command = Command::Register {
                    stream: pending.stream,
                    remote,
                    child: pending.child,
                    promise: Some(pending.promise),
                };
                if let Err(command) = pending.workers.next().submit(command) {
                    command.fail(Arc::new(Error::EventLoopTerminated));
                }
            }
        }
    }

    #[instrument(skip(self))]
    fn accept_connections(&mut self, token: Token) {
        let Some(entry) = self.listeners.get_mut(&token) else {
            return;
        };
        let local_addr = entry.channel.local_addr();
        loop {
            match entry.listener.accept() {
                Ok((stream, peer_addr)) => {
                    if let Err(err) = entry.options.apply(&stream) {
                        warn!(?err, %peer_addr, "Failed to apply socket options");
                    }
                    debug!(%local_addr, %peer_addr, "Accepted connection");
                    let command = Command::Register {
                        stream,
                        remote: peer_addr,
                        child: entry.child.clone(),
                        promise: None,
                    };
                    if entry.workers.next().submit(command).is_err() {
                        warn!(%peer_addr, "Worker loop terminated, dropping accepted connection");
                    }
                }
                Err(err) => match err.kind() {
                    // Further accepting would block, so we are done
                    ErrorKind::WouldBlock => break,
                    ErrorKind::Interrupted => continue,
                    ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset => {
                        warn!(?err, %local_addr, "Transient accept error");
                        continue;
                    }
                    _ => {
                        error!(?err, %local_addr, "Error accepting connection");
                        break;
                    }
                },
            }
        }
    }

    #[instrument(skip(self, stream, child, promise))]
    fn register_stream(
        &mut self,
        mut stream: TcpStream,
        remote: SocketAddr,
        child: ChildInit,
        promise: Option<ChannelFuture>,
    ) {
        let fail = |promise: Option<ChannelFuture>, err: Error| {
            if let Some(promise) = promise {
                promise.set_failure(Arc::new(err));
            }
        };
        let local_addr = match stream.local_addr() {
            Ok(addr) => addr,
            Err(err) => return fail(promise, err.into()),
        };
        let id = ChannelId::next();
        let channel = Channel::new(
            id,
            ChannelKind::Stream,
            local_addr,
            Some(remote),
            self.handle.clone(),
        );
        let mut pipeline = match child.factory.init_channel(&channel) {
            Ok(pipeline) => pipeline,
            Err(err) => {
                warn!(%id, %err, "Failed to initialise pipeline, dropping connection");
                channel.mark_closed();
                channel.close_future().set_success(None);
                return fail(promise, err);
            }
        };
        if let Err(err) = self
            .poll
            .registry()
            .register(&mut stream, id.token(), Interest::READABLE)
        {
            channel.mark_closed();
            channel.close_future().set_success(None);
            return fail(promise, err.into());
        }

        for group in &child.groups {
            group.add(&channel);
        }
        let tls = pipeline.tls.take();
        let secure = tls.is_some();
        info!(%id, %local_addr, peer_addr = %remote, secure, "Registered connection");
        self.connections.insert(
            id.token(),
            StreamConnection {
                channel,
                stream,
                tls,
                active: false,
                interest: Interest::READABLE,
                send_buf: Vec::new(),
                queued: 0,
                flushed: 0,
                pending_writes: VecDeque::new(),
                pipeline,
                read_timeout: None,
                last_read: Instant::now(),
                connect_promise: promise,
            },
        );

        if secure {
            // Clients start the handshake; servers wait for the hello.
            self.flush_connection(id.token());
        } else {
            self.activate(id.token());
        }
    }

    fn activate(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        conn.active = true;
        let channel = conn.channel.clone();
        let handler = Arc::clone(conn.pipeline.handler());
        let promise = conn.connect_promise.take();

        channel.mark_active();
        handler.channel_active(&channel);
        if let Some(promise) = promise {
            promise.set_success(Some(channel));
        }
    }
}

// ============================================================================
// Stream I/O
// ============================================================================

impl EventLoop {
    fn service_connection(&mut self, token: Token, event: &Event) {
        let registry = self.poll.registry();
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        let was_active = conn.active;

        let mut messages = Vec::new();
        let mut decode_error = None;
        let mut end = ReadEnd::Open;
        if event.is_readable() || event.is_read_closed() || event.is_error() {
            let (data, read_end) = conn.read();
            end = read_end;
            if !data.is_empty() {
                conn.last_read = Instant::now();
                debug!(id = %conn.channel.id(), len = data.len(), "Received data");
                let decoded = conn.pipeline.decode(data);
                messages = decoded.messages;
                decode_error = decoded.error;
            }
        }

        if matches!(end, ReadEnd::Open) {
            if let Err(err) = conn.flush() {
                end = ReadEnd::Failed(err);
            }
        }
        if matches!(end, ReadEnd::Open) {
            if let Err(err) = conn.update_interest(registry) {
                end = ReadEnd::Failed(err.into());
            }
        }

        let becomes_active = !was_active && conn.handshake_done() && !matches!(end, ReadEnd::Failed(_));
        let channel = conn.channel.clone();
        let handler = Arc::clone(conn.pipeline.handler());
        let remote = channel.remote_addr().unwrap_or_else(|| channel.local_addr());

        if becomes_active {
            info!(id = %channel.id(), peer_addr = %remote, "TLS handshake completed");
            self.activate(token);
            // Plaintext queued during the handshake can go now.
            self.flush_connection(token);
        }
        for message in messages {
            handler.message_received(&channel, remote, message);
        }
        if let Some(err) = decode_error {
            handler.exception_caught(&channel, Arc::new(err));
        }
        match end {
            ReadEnd::Open => {}
            ReadEnd::Eof => {
                info!(id = %channel.id(), peer_addr = %remote, "Connection closed by peer");
                self.close_connection(token, None);
            }
            ReadEnd::Failed(err) => {
                match &err {
                    Error::Io(io) if io.kind() == ErrorKind::ConnectionReset => {
                        warn!(id = %channel.id(), peer_addr = %remote, "Connection reset")
                    }
                    Error::Io(io) if io.kind() == ErrorKind::BrokenPipe => {
                        warn!(id = %channel.id(), peer_addr = %remote, "Broken pipe")
                    }
                    err => error!(id = %channel.id(), peer_addr = %remote, %err, "Connection error"),
                }
                self.close_connection(token, Some(err));
            }
        }
    }

    fn flush_connection(&mut self, token: Token) {
        let registry = self.poll.registry();
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        let result = conn
            .flush()
            .and_then(|()| conn.update_interest(registry).map_err(Error::from));
        if let Err(err) = result {
            warn!(id = %conn.channel.id(), %err, "Write failed");
            self.close_connection(token, Some(err));
        }
    }

    fn write(&mut self, id: ChannelId, data: Vec<u8>, target: Option<SocketAddr>, promise: ChannelFuture) {
        let token = id.token();
        if let Some(conn) = self.connections.get_mut(&token) {
            match conn.pipeline.encode(data) {
                Ok(encoded) => {
                    debug!(%id, len = encoded.len(), "Sending data");
                    conn.queue(encoded, promise);
                    self.flush_connection(token);
                }
                Err(err) => {
                    promise.set_failure(Arc::new(err));
                }
            }
        } else if let Some(endpoint) = self.datagrams.get_mut(&token) {
            match endpoint.pipeline.encode(data) {
                Ok(encoded) => {
                    debug!(%id, len = encoded.len(), target = ?target, "Sending datagram");
                    endpoint.outbound.push_back(Outbound {
                        data: encoded,
                        target,
                        promise,
                    });
                    endpoint.flush();
                    if let Err(err) = endpoint.update_interest(self.poll.registry()) {
                        error!(%id, ?err, "Failed to reregister datagram socket");
                    }
                }
                Err(err) => {
                    promise.set_failure(Arc::new(err));
                }
            }
        } else {
            trace!(%id, "Write to closed or non-writable channel");
            promise.set_failure(Arc::new(Error::ChannelClosed));
        }
    }

    fn set_read_timeout(&mut self, id: ChannelId, timeout: Option<Duration>) {
        let token = id.token();
        if let Some(conn) = self.connections.get_mut(&token) {
            conn.read_timeout = timeout;
            conn.last_read = Instant::now();
        } else if let Some(endpoint) = self.datagrams.get_mut(&token) {
            endpoint.read_timeout = timeout;
            endpoint.last_read = Instant::now();
        }
    }

    fn expire_deadlines(&mut self) {
        let now = Instant::now();

        let mut timed_out = Vec::new();
        for conn in self.connections.values_mut() {
            if conn.read_deadline().is_some_and(|deadline| deadline <= now) {
                if let Some(timeout) = conn.read_timeout.take() {
                    timed_out.push((conn.channel.clone(), Arc::clone(conn.pipeline.handler()), timeout));
                }
            }
        }
        for endpoint in self.datagrams.values_mut() {
            if endpoint.read_deadline().is_some_and(|deadline| deadline <= now) {
                if let Some(timeout) = endpoint.read_timeout.take() {
                    timed_out.push((
                        endpoint.channel.clone(),
                        Arc::clone(endpoint.pipeline.handler()),
                        timeout,
                    ));
                }
            }
        }
        for (channel, handler, timeout) in timed_out {
            let millis = timeout.as_millis() as u64;
            debug!(id = %channel.id(), millis, "Read timeout");
            handler.exception_caught(&channel, Arc::new(Error::ReadTimeout { millis }));
        }

        let expired: Vec<Token> = self
            .connecting
            .iter()
            .filter(|(_, pending)| pending.deadline.is_some_and(|(deadline, _)| deadline <= now))
            .map(|(token, _)| *token)
            .collect();
        for token in expired {
            if let Some(mut pending) = self.connecting.remove(&token) {
                if let Err(err) = self.poll.registry().deregister(&mut pending.stream) {
                    warn!(?err, "Failed to deregister connecting stream");
                }
                let millis = pending
                    .deadline
                    .map_or(0, |(_, timeout)| timeout.as_millis() as u64);
                info!(remote = %pending.remote, millis, "Connection attempt timed out");
                pending.promise.set_failure(Arc::new(Error::ConnectTimeout {
                    address: pending.remote,
                    millis,
                }));
            }
        }
    }
}

// ============================================================================
// Datagram I/O
// ============================================================================

impl EventLoop {
    fn service_datagram(&mut self, token: Token, event: &Event) {
        let registry = self.poll.registry();
        let Some(endpoint) = self.datagrams.get_mut(&token) else {
            return;
        };

        let mut received = Vec::new();
        let mut failures = Vec::new();
        if event.is_readable() || event.is_error() {
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match endpoint.socket.recv_from(&mut buf) {
                    Ok((n, sender)) => {
                        endpoint.last_read = Instant::now();
                        trace!(len = n, %sender, "Received datagram");
                        let decoded = endpoint.pipeline.decode(buf[..n].to_vec());
                        received.extend(decoded.messages.into_iter().map(|message| (sender, message)));
                        failures.extend(decoded.error);
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    // e.g. ICMP port unreachable on a connected socket
                    Err(err) => {
                        failures.push(err.into());
                        break;
                    }
                }
            }
        }
        if event.is_writable() {
            endpoint.flush();
        }
        if let Err(err) = endpoint.update_interest(registry) {
            error!(id = %endpoint.channel.id(), ?err, "Failed to reregister datagram socket");
        }

        let channel = endpoint.channel.clone();
        let handler = Arc::clone(endpoint.pipeline.handler());
        for (sender, message) in received {
            handler.message_received(&channel, sender, message);
        }
        for err in failures {
            handler.exception_caught(&channel, Arc::new(err));
        }
    }
}

// ============================================================================
// Closing
// ============================================================================

impl EventLoop {
    fn close_channel(&mut self, token: Token) {
        if self.connections.contains_key(&token) {
            self.close_connection(token, None);
        } else if self.datagrams.contains_key(&token) {
            self.close_datagram(token);
        } else if self.listeners.contains_key(&token) {
            self.close_listener(token);
        }
    }

    #[instrument(skip(self, cause))]
    fn close_connection(&mut self, token: Token, cause: Option<Error>) {
        let Some(mut conn) = self.connections.remove(&token) else {
            return;
        };
        if let Err(err) = self.poll.registry().deregister(&mut conn.stream) {
            warn!(?err, "Failed to deregister connection");
        }
        if let Some(tls) = conn.tls.as_mut() {
            tls.send_close_notify();
            let _ = tls.write_tls(&mut conn.stream);
        }
        let _ = conn.stream.shutdown(Shutdown::Both);

        let channel = conn.channel.clone();
        channel.mark_closed();
        let closed: SharedError = Arc::new(Error::ChannelClosed);
        for (_, promise) in conn.pending_writes.drain(..) {
            promise.set_failure(Arc::clone(&closed));
        }
        info!(
            id = %channel.id(),
            local_addr = %channel.local_addr(),
            peer_addr = ?channel.remote_addr(),
            "Closed connection"
        );

        let handler = Arc::clone(conn.pipeline.handler());
        let cause = cause.map(Arc::new);
        if let Some(promise) = conn.connect_promise.take() {
            // Never became active: the TLS handshake failed or was cut short.
            promise.set_failure(cause.clone().unwrap_or(closed));
        }
        if conn.active {
            if let Some(cause) = cause {
                handler.exception_caught(&channel, cause);
            }
            handler.channel_inactive(&channel);
        }
        channel.close_future().set_success(None);
    }

    fn close_datagram(&mut self, token: Token) {
        let Some(mut endpoint) = self.datagrams.remove(&token) else {
            return;
        };
        if let Err(err) = self.poll.registry().deregister(&mut endpoint.socket) {
            warn!(?err, "Failed to deregister datagram socket");
        }
        let channel = endpoint.channel.clone();
        channel.mark_closed();
        let closed: SharedError = Arc::new(Error::ChannelClosed);
        for outbound in endpoint.outbound.drain(..) {
            outbound.promise.set_failure(Arc::clone(&closed));
        }
        info!(id = %channel.id(), local_addr = %channel.local_addr(), "Closed datagram socket");
        endpoint.pipeline.handler().channel_inactive(&channel);
        channel.close_future().set_success(None);
    }

    fn close_listener(&mut self, token: Token) {
        let Some(mut entry) = self.listeners.remove(&token) else {
            return;
        };
        if let Err(err) = self.poll.registry().deregister(&mut entry.listener) {
            warn!(?err, "Failed to deregister listener");
        }
        entry.channel.mark_closed();
        info!(id = %entry.channel.id(), local_addr = %entry.channel.local_addr(), "Closed listener");
        entry.channel.close_future().set_success(None);
    }

    fn close_all(&mut self) {
        let tokens: Vec<Token> = self.listeners.keys().copied().collect();
        for token in tokens {
            self.close_listener(token);
        }
        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.close_connection(token, None);
        }
        let tokens: Vec<Token> = self.datagrams.keys().copied().collect();
        for token in tokens {
            self.close_datagram(token);
        }
        let terminated: SharedError = Arc::new(Error::EventLoopTerminated);
        for (_, pending) in self.connecting.drain() {
            pending.promise.set_failure(Arc::clone(&terminated));
        }
        for command in self.receiver.try_iter() {
            command.fail(Arc::clone(&terminated));
        }
        debug!("Event loop terminated");
    }
}
