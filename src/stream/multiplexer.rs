use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace, warn};

use crate::error::TransportError;
use crate::listener::{ServerStreamListener, StreamMessageListener, StreamStateListener};
use crate::packet::stream_code::StreamCode;
use crate::packet::Packet;
use crate::stream::context::{StreamContext, StreamState};
use crate::stream::id_generator::{PeerRole, StreamIdGenerator};
use crate::writer::PacketWriter;

#[derive(Default)]
pub(super) struct StreamTable {
    closed: bool,
    streams: FxHashMap<i32, StreamContext>,
}

impl StreamTable {
    pub(super) fn remove(&mut self, stream_id: i32) -> Option<StreamContext> {
        self.streams.remove(&stream_id)
    }
}

/// Registry of a connection's logical streams, and the routing of inbound stream packets to them.
pub struct StreamMultiplexer {
    name: Arc<str>,
    id_generator: StreamIdGenerator,
    writer: PacketWriter,
    table: Arc<Mutex<StreamTable>>,
    server_listener: Arc<dyn ServerStreamListener>,
}

impl StreamMultiplexer {
    pub fn new(name: Arc<str>, role: PeerRole, writer: PacketWriter, server_listener: Arc<dyn ServerStreamListener>) -> StreamMultiplexer {
        StreamMultiplexer {
            name,
            id_generator: StreamIdGenerator::new(role),
            writer,
            table: Default::default(),
            server_listener,
        }
    }

    /// Registers a new stream with a locally issued id and sends the stream-create packet. The
    ///  stream is `Connecting` until the peer accepts it. Returns when the create packet was
    ///  written.
    pub async fn open_stream(
        &self,
        payload: Bytes,
        listener: Arc<dyn StreamMessageListener>,
        state_listener: Option<Arc<dyn StreamStateListener>>,
    ) -> Result<StreamContext, TransportError> {
        let stream = {
            let mut table = self.table.lock().unwrap();
            if table.closed {
                return Err(TransportError::ConnectionClosed);
            }

            let stream_id = loop {
                let candidate = self.id_generator.next_id();
                if !table.streams.contains_key(&candidate) {
                    break candidate;
                }
            };

            let stream = StreamContext::new(
                self.name.clone(),
                stream_id,
                true,
                StreamState::Connecting,
                self.writer.clone(),
                Arc::downgrade(&self.table),
                Some(listener),
                state_listener,
            );
            table.streams.insert(stream_id, stream.clone());
            stream
        };

        debug!(name=%self.name, stream_id=stream.stream_id(), "opening stream");
        let create = Packet::StreamCreate {
            stream_id: stream.stream_id(),
            payload,
        };
        if let Err(e) = self.writer.write(create).await {
            self.table.lock().unwrap().remove(stream.stream_id());
            stream.change_state(StreamState::Closed);
            return Err(e);
        }
        Ok(stream)
    }

    pub fn find_stream(&self, stream_id: i32) -> Option<StreamContext> {
        self.table.lock().unwrap().streams.get(&stream_id).cloned()
    }

    pub fn num_streams(&self) -> usize {
        self.table.lock().unwrap().streams.len()
    }

    fn remove_stream(&self, stream_id: i32) -> Option<StreamContext> {
        self.table.lock().unwrap().remove(stream_id)
    }

    /// Routes an inbound stream packet. Packets for unknown streams are dropped.
    pub async fn handle_packet(&self, packet: Packet) {
        match packet {
            Packet::StreamCreate { stream_id, payload } => self.on_create(stream_id, payload).await,
            Packet::StreamCreateSuccess { stream_id } => {
                if let Some(stream) = self.known_stream(stream_id, "create-success") {
                    if !stream.change_state(StreamState::Open) {
                        warn!(name=%self.name, stream_id, state=?stream.state(), "stream create acknowledged in unexpected state - ignoring");
                    }
                }
            }
            Packet::StreamCreateFail { stream_id, code } => {
                if self.known_stream(stream_id, "create-fail").is_some() {
                    info!(name=%self.name, stream_id, ?code, "peer rejected stream");
                    self.on_closed_by_peer(stream_id, code).await;
                }
            }
            Packet::StreamResponse { stream_id, payload } => {
                if let Some(stream) = self.known_stream(stream_id, "response") {
                    self.on_data(stream, payload).await;
                }
            }
            Packet::StreamPing { stream_id, request_id } => {
                if self.known_stream(stream_id, "ping").is_some() {
                    self.writer.write_and_forget(Packet::StreamPong { stream_id, request_id });
                }
            }
            Packet::StreamPong { stream_id, request_id } => {
                if self.known_stream(stream_id, "pong").is_some() {
                    trace!(name=%self.name, stream_id, request_id, "received stream pong");
                }
            }
            Packet::StreamClose { stream_id, code } => {
                if self.known_stream(stream_id, "close").is_some() {
                    debug!(name=%self.name, stream_id, ?code, "stream closed by peer");
                    self.on_closed_by_peer(stream_id, code).await;
                }
            }
            other => {
                warn!(name=%self.name, packet=?other, "not a stream packet - ignoring");
            }
        }
    }

    fn known_stream(&self, stream_id: i32, packet_kind: &str) -> Option<StreamContext> {
        let result = self.find_stream(stream_id);
        if result.is_none() {
            warn!(name=%self.name, stream_id, packet_kind, "stream packet for unknown stream - dropping");
        }
        result
    }

    async fn on_create(&self, stream_id: i32, payload: Bytes) {
        if !self.id_generator.role().peer().owns(stream_id) {
            warn!(name=%self.name, stream_id, "peer tried to open a stream with an id it does not own");
            self.reject(stream_id, StreamCode::IdIllegal);
            return;
        }

        {
            let table = self.table.lock().unwrap();
            if table.closed {
                drop(table);
                self.reject(stream_id, StreamCode::StateClosed);
                return;
            }
            if table.streams.contains_key(&stream_id) {
                drop(table);
                warn!(name=%self.name, stream_id, "peer tried to open a stream with an id that is in use");
                self.reject(stream_id, StreamCode::IdDuplicated);
                return;
            }
        }

        let stream = StreamContext::new(
            self.name.clone(),
            stream_id,
            false,
            StreamState::Connecting,
            self.writer.clone(),
            Arc::downgrade(&self.table),
            None,
            None,
        );

        let code = self.server_listener.handle_stream_create(stream.clone(), payload).await;
        if code != StreamCode::Ok {
            debug!(name=%self.name, stream_id, ?code, "stream opened by peer was not accepted");
            stream.change_state(StreamState::Closed);
            self.reject(stream_id, code);
            return;
        }

        {
            let mut table = self.table.lock().unwrap();
            if table.closed {
                drop(table);
                stream.change_state(StreamState::Closed);
                self.reject(stream_id, StreamCode::StateClosed);
                return;
            }
            table.streams.insert(stream_id, stream.clone());
        }
        stream.change_state(StreamState::Open);
        self.writer.write_and_forget(Packet::StreamCreateSuccess { stream_id });
    }

    fn reject(&self, stream_id: i32, code: StreamCode) {
        self.writer.write_and_forget(Packet::StreamCreateFail { stream_id, code });
    }

    async fn on_data(&self, stream: StreamContext, payload: Bytes) {
        if stream.state() != StreamState::Open {
            warn!(name=%self.name, stream_id=stream.stream_id(), state=?stream.state(), "stream data in unexpected state - dropping");
            return;
        }

        match stream.message_listener().cloned() {
            Some(listener) => listener.handle_stream_data(stream, payload).await,
            None => warn!(name=%self.name, stream_id=stream.stream_id(), "data on a stream opened by the peer - dropping"),
        }
    }

    async fn on_closed_by_peer(&self, stream_id: i32, code: StreamCode) {
        // a concurrent local close may have removed the stream in the meantime
        if let Some(stream) = self.remove_stream(stream_id) {
            if stream.change_state(StreamState::Closed) {
                self.notify_closed(stream, code).await;
            }
        }
    }

    async fn notify_closed(&self, stream: StreamContext, code: StreamCode) {
        match stream.message_listener().cloned() {
            Some(listener) => listener.handle_stream_close(stream, code).await,
            None => self.server_listener.handle_stream_close(stream, code).await,
        }
    }

    /// Closes all streams because the connection is going down, and rejects streams opened
    ///  after that. The peer is notified while the connection can still be written to.
    pub async fn close_all(&self) {
        let streams = {
            let mut table = self.table.lock().unwrap();
            table.closed = true;
            std::mem::take(&mut table.streams)
        };

        if !streams.is_empty() {
            debug!(name=%self.name, num_streams=streams.len(), "closing all streams");
        }
        for (stream_id, stream) in streams {
            if !self.writer.write_and_forget(Packet::StreamClose { stream_id, code: StreamCode::StateClosed }) {
                trace!(name=%self.name, stream_id, "connection not writable, closing stream locally");
            }
            if stream.change_state(StreamState::Closed) {
                self.notify_closed(stream, StreamCode::StateClosed).await;
            }
        }
    }
}
