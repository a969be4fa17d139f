use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::{anyhow, bail};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::select;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn, Instrument};

use crate::config::TransportConfig;
use crate::correlator::{RequestCorrelator, ResponseFuture};
use crate::error::TransportError;
use crate::factory::ConnectionFactory;
use crate::handshake::{ClusterOption, Handshaker};
use crate::listener::{ConnectionListeners, MessageListener, Responder, StreamMessageListener, StreamStateListener};
use crate::packet::Packet;
use crate::state::{ConnectionState, ConnectionStateCell};
use crate::stream::{PeerRole, StreamContext, StreamMultiplexer};
use crate::timer::Timer;
use crate::writer::{write_loop, PacketWriter, WriteCommand, WriteFuture};

/// One agent-side connection to a collector, and the public API for sending over it.
///
/// A handler is used for a single physical connection: once that is closed, the handler stays
///  in a terminal state and every operation fails fast. Reconnecting creates a new handler (see
///  [ConnectionFactory::reconnect]).
///
/// Outbound operations enqueue packets for the connection's writer task and never block. The
///  reader task decodes inbound packets and dispatches them in arrival order: responses to the
///  request correlator, stream packets to the stream multiplexer, handshake responses to the
///  handshaker, and everything else to the [MessageListener].
#[derive(Clone)]
pub struct ConnectionHandler {
    inner: Arc<HandlerInner>,
}

struct HandlerInner {
    socket_id: i32,
    name: Arc<str>,
    config: Arc<TransportConfig>,
    runtime: Handle,

    state: Arc<ConnectionStateCell>,
    timer: Timer,
    writer: PacketWriter,
    writer_rx: Mutex<Option<mpsc::UnboundedReceiver<WriteCommand>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,

    correlator: RequestCorrelator,
    multiplexer: StreamMultiplexer,
    handshaker: Handshaker,
    message_listener: Arc<dyn MessageListener>,
    factory: Arc<dyn ConnectionFactory>,

    remote_addr: Mutex<Option<SocketAddr>>,
    next_ping_id: AtomicI32,
    resources_released: AtomicBool,
    reconnecting: AtomicBool,
}

impl Debug for ConnectionHandler {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnectionHandler{{name:{}, state:{:?}}}", self.inner.name, self.inner.state.current())
    }
}

/// Why the reader loop ended
enum ReadEnd {
    EndOfStream,
    Failed(anyhow::Error),
}

impl ConnectionHandler {
    /// Must be called from within a tokio runtime
    pub fn new(socket_id: i32, config: Arc<TransportConfig>, factory: Arc<dyn ConnectionFactory>, listeners: ConnectionListeners) -> ConnectionHandler {
        let name: Arc<str> = format!("ConnectionHandler-{}", socket_id).into();
        let timer = Timer::new(&name);
        let (writer, writer_rx) = PacketWriter::channel();

        ConnectionHandler {
            inner: Arc::new(HandlerInner {
                socket_id,
                config: config.clone(),
                runtime: Handle::current(),
                state: Arc::new(ConnectionStateCell::new(name.to_string())),
                timer: timer.clone(),
                writer: writer.clone(),
                writer_rx: Mutex::new(Some(writer_rx)),
                writer_task: Mutex::new(None),
                reader_task: Mutex::new(None),
                correlator: RequestCorrelator::new(name.clone(), timer.clone()),
                multiplexer: StreamMultiplexer::new(name.clone(), PeerRole::Client, writer.clone(), listeners.server_stream_listener),
                handshaker: Handshaker::new(name.clone(), &config, writer, timer),
                message_listener: listeners.message_listener,
                factory,
                remote_addr: Mutex::new(None),
                next_ping_id: AtomicI32::new(0),
                resources_released: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                name,
            }),
        }
    }

    pub fn socket_id(&self) -> i32 {
        self.inner.socket_id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.inner.remote_addr.lock().unwrap()
    }

    /// Establishes the TCP connection and attaches it.
    pub async fn connect(&self, addr: SocketAddr) -> anyhow::Result<()> {
        let change = self.inner.state.transition(ConnectionState::BeingConnect);
        if !change.changed {
            bail!("{}: can not connect in state {:?}", self.inner.name, change.before);
        }
        *self.inner.remote_addr.lock().unwrap() = Some(addr);

        info!(name=%self.inner.name, %addr, "connecting");
        let socket = match timeout(self.inner.config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => {
                self.inner.connect_failed().await;
                return Err(anyhow!("{}: connecting to {} failed: {}", self.inner.name, addr, e));
            }
            Err(_) => {
                self.inner.connect_failed().await;
                return Err(anyhow!("{}: connecting to {} timed out after {:?}", self.inner.name, addr, self.inner.config.connect_timeout));
            }
        };
        if let Err(e) = socket.set_nodelay(true) {
            warn!(name=%self.inner.name, "could not set TCP_NODELAY: {}", e);
        }

        self.attach(socket).await
    }

    /// Takes over an established physical connection: starts the reader and writer tasks, the
    ///  keep-alive and the handshake. Fails if the handler was connected before.
    pub async fn attach<S>(&self, stream: S) -> anyhow::Result<()>
    where S: AsyncRead + AsyncWrite + Send + 'static
    {
        let inner = &self.inner;

        let change = inner.state.transition(ConnectionState::Connected);
        if !change.changed {
            bail!("{}: can not attach a connection in state {:?}", inner.name, change.before);
        }

        let writer_rx = inner.writer_rx.lock().unwrap().take()
            .ok_or_else(|| anyhow!("{}: connection was attached before", inner.name))?;

        let (read_half, write_half) = tokio::io::split(stream);
        let (broken_tx, broken_rx) = oneshot::channel();

        let writer_span = tracing::info_span!("writer", name=%inner.name);
        let write_task = write_loop(inner.name.clone(), writer_rx, write_half, inner.state.clone());
        let writer_task = inner.runtime.spawn(async move {
            if let Some(e) = write_task.await {
                let _ = broken_tx.send(e);
            }
        }.instrument(writer_span));
        *inner.writer_task.lock().unwrap() = Some(writer_task);

        let reader_span = tracing::info_span!("reader", name=%inner.name);
        let reader_task = inner.runtime.spawn(inner.clone().read_loop(read_half, broken_rx).instrument(reader_span));
        *inner.reader_task.lock().unwrap() = Some(reader_task);

        let change = inner.state.transition(ConnectionState::RunWithoutHandshake);
        if !change.changed {
            // closed concurrently, e.g. by the peer
            bail!("{}: connection was lost while attaching, state is {:?}", inner.name, change.before);
        }

        let weak_inner = Arc::downgrade(inner);
        inner.timer.schedule_with_fixed_delay(inner.config.ping_delay, move || {
            keep_alive(weak_inner.clone());
            async {}
        })?;

        inner.handshaker.start(&Handshaker::handshake_data(&inner.config, inner.socket_id))?;
        Ok(())
    }

    pub fn current_state(&self) -> ConnectionState {
        self.inner.state.current()
    }

    /// `true` while the connection accepts traffic
    pub fn is_connected(&self) -> bool {
        self.current_state().is_run()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Waits for the handshake to move the connection to a simplex or duplex run state. Fails if
    ///  the connection is closed in the meantime, or after the timeout: the handshake may still
    ///  complete later in that case.
    pub async fn await_handshake(&self, max_wait: Duration) -> Result<ConnectionState, TransportError> {
        let mut states = self.subscribe_state();
        let wait = async {
            loop {
                let current = *states.borrow_and_update();
                match current {
                    ConnectionState::RunSimplex | ConnectionState::RunDuplex => return Ok(current),
                    s if s.is_terminal() || s.is_closing() => return Err(self.inner.not_running_error(s)),
                    _ => {}
                }
                if states.changed().await.is_err() {
                    return Err(TransportError::ConnectionClosed);
                }
            }
        };

        timeout(max_wait, wait).await
            .map_err(|_| TransportError::Timeout(max_wait))?
    }

    /// the collector's cluster option, if the handshake negotiated duplex operation
    pub fn remote_cluster_option(&self) -> ClusterOption {
        self.inner.handshaker.remote_cluster_option()
    }

    /// Fire-and-forget. Failures are logged.
    pub fn send(&self, payload: Bytes) {
        let name = self.inner.name.clone();
        let f = self.send_async(payload);
        self.inner.runtime.spawn(async move {
            if let Err(e) = f.await {
                warn!(%name, "sending message failed: {}", e);
            }
        });
    }

    /// resolves when the message was written
    pub fn send_async(&self, payload: Bytes) -> WriteFuture {
        if let Err(e) = self.inner.check_run_state() {
            return WriteFuture::failed(e);
        }
        self.inner.writer.write(Packet::Send { payload })
    }

    /// Waits for the message to be written, at most for the configured write timeout.
    pub async fn send_sync(&self, payload: Bytes) -> Result<(), TransportError> {
        let write_timeout = self.inner.config.write_timeout;
        timeout(write_timeout, self.send_async(payload)).await
            .map_err(|_| TransportError::Timeout(write_timeout))?
    }

    /// Writes a ping packet and waits for the write like [ConnectionHandler::send_sync].
    pub async fn ping_sync(&self) -> Result<(), TransportError> {
        self.inner.check_run_state()?;
        let write_timeout = self.inner.config.write_timeout;
        timeout(write_timeout, self.inner.writer.write(self.inner.ping_packet())).await
            .map_err(|_| TransportError::Timeout(write_timeout))?
    }

    /// sends a request with the configured default timeout
    pub fn request(&self, payload: Bytes) -> ResponseFuture {
        self.request_with_timeout(payload, self.inner.config.request_timeout)
    }

    /// Sends a request and returns a future for its response. The future is resolved exactly
    ///  once: with the response, or with a timeout, write failure or connection close, whichever
    ///  happens first.
    pub fn request_with_timeout(&self, payload: Bytes, request_timeout: Duration) -> ResponseFuture {
        if let Err(e) = self.inner.check_run_state() {
            return ResponseFuture::failed(e);
        }

        let (request_id, response) = match self.inner.correlator.register(request_timeout) {
            Ok(r) => r,
            Err(e) => return ResponseFuture::failed(e),
        };

        let written = self.inner.writer.write(Packet::Request { request_id, payload });
        let inner = self.inner.clone();
        self.inner.runtime.spawn(async move {
            if let Err(e) = written.await {
                debug!(name=%inner.name, request_id, "request could not be written: {}", e);
                inner.correlator.fail(request_id, e);
            }
        });
        response
    }

    /// Writes the response to a request received from the peer. This is an alternative to
    ///  [Responder::respond] for code that only kept the request id.
    pub fn respond(&self, request_id: i32, payload: Bytes) -> WriteFuture {
        if let Err(e) = self.inner.check_run_state() {
            return WriteFuture::failed(e);
        }
        self.inner.writer.write(Packet::Response { request_id, payload })
    }

    /// Opens a logical stream. Returns when the stream-create packet was written; the stream is
    ///  open once the peer accepts it.
    pub async fn open_stream(
        &self,
        payload: Bytes,
        listener: Arc<dyn StreamMessageListener>,
        state_listener: Option<Arc<dyn StreamStateListener>>,
    ) -> Result<StreamContext, TransportError> {
        self.inner.check_run_state()?;
        self.inner.multiplexer.open_stream(payload, listener, state_listener).await
    }

    pub fn find_stream(&self, stream_id: i32) -> Option<StreamContext> {
        self.inner.multiplexer.find_stream(stream_id)
    }

    /// Client-initiated close: streams are closed and the collector is notified before the
    ///  connection is shut down. Pending requests fail with [TransportError::ConnectionClosed].
    ///  Idempotent, and the connection is not re-established.
    ///
    /// May be called from a listener callback. It does not wait for the peer to close its side
    ///  then, since the reader task is busy running the callback.
    pub async fn close(&self) {
        let inner = &self.inner;

        let change = inner.state.transition(ConnectionState::BeingCloseByClient);
        if !change.changed {
            if change.before.is_before_connected() && inner.state.transition(ConnectionState::Closed).changed {
                inner.release_resources().await;
            }
            else {
                debug!(name=%inner.name, state=?change.before, "close requested in state that does not require closing");
            }
            return;
        }

        info!(name=%inner.name, "closing connection");
        inner.multiplexer.close_all().await;

        let close_notification = inner.writer.write(Packet::ClientClose { payload: Bytes::new() });
        match timeout(inner.config.close_packet_timeout, close_notification).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(name=%inner.name, "could not notify peer of close: {}", e),
            Err(_) => debug!(name=%inner.name, "timeout notifying peer of close"),
        }
        inner.shutdown_writer().await;

        // the peer closes its side in response, which ends the reader
        let reader_task = inner.reader_task.lock().unwrap().take();
        if let Some(mut reader_task) = reader_task {
            if tokio::task::try_id() == Some(reader_task.id()) {
                // called from a listener callback: the reader finishes once the callback returns
                debug!(name=%inner.name, "close requested from the reader task, not waiting for the peer");
            }
            else if timeout(inner.config.close_packet_timeout, &mut reader_task).await.is_err() {
                debug!(name=%inner.name, "peer did not close the connection, aborting reader");
                reader_task.abort();
            }
        }

        inner.on_connection_closed().await;
    }
}

fn keep_alive(inner: Weak<HandlerInner>) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    if !inner.state.current().is_run() {
        return;
    }

    trace!(name=%inner.name, "sending keep-alive ping");
    let written = inner.writer.write(inner.ping_packet());
    let name = inner.name.clone();
    inner.runtime.spawn(async move {
        if let Err(e) = written.await {
            warn!(%name, "keep-alive ping failed: {}", e);
        }
    });
}

impl HandlerInner {
    fn check_run_state(&self) -> Result<(), TransportError> {
        let current = self.state.current();
        if current.is_run() {
            Ok(())
        }
        else {
            Err(self.not_running_error(current))
        }
    }

    fn not_running_error(&self, current: ConnectionState) -> TransportError {
        if self.reconnecting.load(Ordering::Acquire) {
            TransportError::Reconnecting
        }
        else {
            TransportError::InvalidState(current)
        }
    }

    fn ping_packet(&self) -> Packet {
        Packet::Ping {
            ping_id: self.next_ping_id.fetch_add(1, Ordering::Relaxed),
            state_version: 0,
            state_code: self.state.current().code(),
        }
    }

    async fn read_loop<R>(self: Arc<Self>, mut input: R, mut writer_broken: oneshot::Receiver<TransportError>)
    where R: AsyncRead + Unpin
    {
        let mut buf = BytesMut::with_capacity(self.config.read_buffer_size);
        let mut writer_alive = true;

        let end = loop {
            if let Err(e) = self.dispatch_buffered(&mut buf).await {
                break ReadEnd::Failed(e);
            }

            if buf.capacity() - buf.len() < 1024 {
                buf.reserve(self.config.read_buffer_size);
            }

            select! {
                read = input.read_buf(&mut buf) => match read {
                    Ok(0) => break ReadEnd::EndOfStream,
                    Ok(n) => trace!(name=%self.name, n, "received bytes"),
                    Err(e) => break ReadEnd::Failed(e.into()),
                },
                broken = &mut writer_broken, if writer_alive => match broken {
                    Ok(e) => break ReadEnd::Failed(anyhow!("writer failed: {}", e)),
                    // orderly shutdown of the write half, keep reading until the peer closes
                    Err(_) => writer_alive = false,
                },
            }
        };

        match end {
            ReadEnd::EndOfStream => debug!(name=%self.name, "connection closed by peer"),
            ReadEnd::Failed(e) => warn!(name=%self.name, "connection failed: {}", e),
        }
        self.on_connection_closed().await;
    }

    async fn dispatch_buffered(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        while let Some(packet) = Packet::try_decode(buf, self.config.max_packet_len)? {
            self.dispatch(packet).await;
        }
        Ok(())
    }

    async fn dispatch(&self, packet: Packet) {
        trace!(name=%self.name, ?packet, "received packet");

        match packet {
            Packet::Send { payload } => {
                self.message_listener.handle_send(payload).await;
            }
            Packet::Request { request_id, payload } => {
                let responder = Responder::new(request_id, self.writer.clone());
                self.message_listener.handle_request(payload, responder).await;
            }
            Packet::Response { request_id, payload } => {
                self.correlator.complete(request_id, payload);
            }
            Packet::StreamCreate { .. } |
            Packet::StreamCreateSuccess { .. } |
            Packet::StreamCreateFail { .. } |
            Packet::StreamClose { .. } |
            Packet::StreamPing { .. } |
            Packet::StreamPong { .. } |
            Packet::StreamResponse { .. } => {
                self.multiplexer.handle_packet(packet).await;
            }
            Packet::ServerClose { .. } => {
                info!(name=%self.name, "collector announced closing the connection");
                self.state.transition(ConnectionState::BeingCloseByServer);
            }
            Packet::HandshakeResponse { payload, .. } => {
                if let Some(target) = self.handshaker.handshake_complete(&payload) {
                    let change = self.state.transition(target);
                    if !change.changed {
                        error!(name=%self.name, state=?change.before, ?target, "handshake completed, but the connection can not switch to the negotiated run state");
                    }
                }
            }
            Packet::Ping { ping_id, .. } => {
                trace!(name=%self.name, ping_id, "received ping");
                self.writer.write_and_forget(Packet::Pong);
            }
            Packet::Pong => {
                trace!(name=%self.name, "received pong");
            }
            Packet::ClientClose { .. } | Packet::Handshake { .. } => {
                warn!(name=%self.name, ?packet, "received packet that only a client sends - ignoring");
            }
        }
    }

    async fn connect_failed(&self) {
        self.state.transition(ConnectionState::ConnectFailed);
        self.release_resources().await;
    }

    /// Moves the connection to the appropriate terminal state after the physical connection is
    ///  gone, releases everything, and triggers reconnecting if the peer closed the connection.
    async fn on_connection_closed(&self) {
        let current = self.state.current();
        let mut reconnect = false;

        match current {
            ConnectionState::BeingCloseByClient => {
                self.state.transition(ConnectionState::Closed);
            }
            ConnectionState::BeingCloseByServer => {
                reconnect = self.state.transition(ConnectionState::ClosedByPeer).changed;
            }
            s if s.is_run() || s == ConnectionState::Connected => {
                if self.factory.is_released() {
                    self.state.transition(ConnectionState::UnexpectedClosed);
                }
                else {
                    reconnect = self.state.transition(ConnectionState::UnexpectedClosedByPeer).changed;
                }
            }
            s if s.is_before_connected() => {
                self.state.transition(ConnectionState::ConnectFailed);
            }
            s if s.is_terminal() => {}
            s => {
                warn!(name=%self.name, state=?s, "connection closed in unexpected state");
                self.state.transition(ConnectionState::ErrorUnknown);
            }
        }

        if reconnect {
            self.reconnecting.store(true, Ordering::Release);
        }
        self.release_resources().await;

        if reconnect {
            let remote_addr = *self.remote_addr.lock().unwrap();
            self.factory.reconnect(self.socket_id, remote_addr);
        }
    }

    /// runs once, whichever way the connection ended
    async fn release_resources(&self) {
        if self.resources_released.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(name=%self.name, "releasing connection resources");

        // without a writer task, nobody would answer the shutdown below
        drop(self.writer_rx.lock().unwrap().take());

        self.multiplexer.close_all().await;
        self.handshaker.abort();
        self.correlator.close();
        self.shutdown_writer().await;
        self.timer.stop();
    }

    /// Lets the writer flush what was submitted before. A peer that does not read can block it
    ///  indefinitely, so after `close_packet_timeout` the writer task is aborted.
    async fn shutdown_writer(&self) {
        if timeout(self.config.close_packet_timeout, self.writer.shutdown()).await.is_err() {
            debug!(name=%self.name, "writer did not drain in time, aborting it");
            if let Some(writer_task) = self.writer_task.lock().unwrap().take() {
                writer_task.abort();
            }
        }
    }
}
