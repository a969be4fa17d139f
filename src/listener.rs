//! Callbacks through which inbound traffic reaches the application.
//!
//! Callbacks are invoked sequentially from a connection's reader task, in the order the packets
//!  arrived. A callback that takes long delays all subsequent inbound packets of its connection,
//!  so anything expensive should be handed off to a separate task.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use tracing::{debug, info};

use crate::packet::stream_code::StreamCode;
use crate::packet::Packet;
use crate::stream::{StreamContext, StreamState};
use crate::writer::{PacketWriter, WriteFuture};

/// Writes the response to a single inbound request.
pub struct Responder {
    request_id: i32,
    writer: PacketWriter,
}

impl Responder {
    pub fn new(request_id: i32, writer: PacketWriter) -> Responder {
        Responder {
            request_id,
            writer,
        }
    }

    pub fn request_id(&self) -> i32 {
        self.request_id
    }

    pub fn respond(self, payload: Bytes) -> WriteFuture {
        self.writer.write(Packet::Response {
            request_id: self.request_id,
            payload,
        })
    }
}

/// Inbound messages that are not part of a stream
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MessageListener: Send + Sync + 'static {
    async fn handle_send(&self, payload: Bytes);
    async fn handle_request(&self, payload: Bytes, responder: Responder);
}

/// Data for a stream opened by this side
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StreamMessageListener: Send + Sync + 'static {
    async fn handle_stream_data(&self, stream: StreamContext, payload: Bytes);
    /// the stream was closed by the peer, its creation was rejected, or the connection went down
    async fn handle_stream_close(&self, stream: StreamContext, code: StreamCode);
}

#[cfg_attr(test, automock)]
pub trait StreamStateListener: Send + Sync + 'static {
    fn on_state_changed(&self, stream_id: i32, before: StreamState, current: StreamState);
}

/// Decides about streams opened by the peer.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServerStreamListener: Send + Sync + 'static {
    /// [StreamCode::Ok] accepts the stream, every other code rejects it and is sent to the peer
    async fn handle_stream_create(&self, stream: StreamContext, payload: Bytes) -> StreamCode;
    async fn handle_stream_close(&self, stream: StreamContext, code: StreamCode);
}


/// Logs inbound messages and drops them. Requests remain unanswered and time out on the peer's
///  side.
pub struct LoggingMessageListener;

#[async_trait]
impl MessageListener for LoggingMessageListener {
    async fn handle_send(&self, payload: Bytes) {
        info!(len=payload.len(), "received message without a listener - dropping");
    }

    async fn handle_request(&self, payload: Bytes, responder: Responder) {
        info!(len=payload.len(), request_id=responder.request_id(), "received request without a listener - dropping");
    }
}

/// Rejects every stream the peer tries to open.
pub struct RejectingServerStreamListener;

#[async_trait]
impl ServerStreamListener for RejectingServerStreamListener {
    async fn handle_stream_create(&self, stream: StreamContext, _payload: Bytes) -> StreamCode {
        info!(stream_id=stream.stream_id(), "rejecting stream opened by peer");
        StreamCode::ConnectionUnsupport
    }

    async fn handle_stream_close(&self, stream: StreamContext, code: StreamCode) {
        debug!(stream_id=stream.stream_id(), ?code, "stream closed");
    }
}

/// The application callbacks of a connection
#[derive(Clone)]
pub struct ConnectionListeners {
    pub message_listener: Arc<dyn MessageListener>,
    pub server_stream_listener: Arc<dyn ServerStreamListener>,
}

impl Default for ConnectionListeners {
    fn default() -> Self {
        ConnectionListeners {
            message_listener: Arc::new(LoggingMessageListener),
            server_stream_listener: Arc::new(RejectingServerStreamListener),
        }
    }
}
