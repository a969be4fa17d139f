use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tracing::{debug, trace};

use crate::error::TransportError;
use crate::listener::{StreamMessageListener, StreamStateListener};
use crate::packet::stream_code::StreamCode;
use crate::packet::Packet;
use crate::stream::multiplexer::StreamTable;
use crate::writer::{PacketWriter, WriteFuture, WriteResult};

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum StreamState {
    /// opened locally, waiting for the peer to accept
    Connecting,
    Open,
    /// closed locally, the close notification is being written
    Closing,
    Closed,
}

impl StreamState {
    fn can_transition_to(self, target: StreamState) -> bool {
        use StreamState::*;

        match (self, target) {
            (Connecting, Open) => true,
            (Connecting | Open, Closing) => true,
            (Connecting | Open | Closing, Closed) => true,
            _ => false,
        }
    }
}

/// Handle to a single logical stream. Clones refer to the same stream.
#[derive(Clone)]
pub struct StreamContext {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    name: Arc<str>,
    stream_id: i32,
    opened_locally: bool,
    state: Mutex<StreamState>,
    writer: PacketWriter,
    table: Weak<Mutex<StreamTable>>,
    message_listener: Option<Arc<dyn StreamMessageListener>>,
    state_listener: Option<Arc<dyn StreamStateListener>>,
    next_ping_id: AtomicI32,
}

impl Debug for StreamContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "StreamContext{{id:{}, local:{}, state:{:?}}}", self.inner.stream_id, self.inner.opened_locally, self.state())
    }
}

impl StreamContext {
    pub(super) fn new(
        name: Arc<str>,
        stream_id: i32,
        opened_locally: bool,
        initial_state: StreamState,
        writer: PacketWriter,
        table: Weak<Mutex<StreamTable>>,
        message_listener: Option<Arc<dyn StreamMessageListener>>,
        state_listener: Option<Arc<dyn StreamStateListener>>,
    ) -> StreamContext {
        StreamContext {
            inner: Arc::new(StreamInner {
                name,
                stream_id,
                opened_locally,
                state: Mutex::new(initial_state),
                writer,
                table,
                message_listener,
                state_listener,
                next_ping_id: AtomicI32::new(0),
            }),
        }
    }

    pub fn stream_id(&self) -> i32 {
        self.inner.stream_id
    }

    pub fn state(&self) -> StreamState {
        *self.inner.state.lock().unwrap()
    }

    /// `true` for streams opened by this side, `false` for streams opened by the peer
    pub fn is_opened_locally(&self) -> bool {
        self.inner.opened_locally
    }

    pub(super) fn message_listener(&self) -> Option<&Arc<dyn StreamMessageListener>> {
        self.inner.message_listener.as_ref()
    }

    /// Returns `false` if the stream is already in the target state or the transition is not
    ///  possible from its current state. The state listener is notified of actual changes.
    pub(super) fn change_state(&self, target: StreamState) -> bool {
        let before = {
            let mut state = self.inner.state.lock().unwrap();
            let before = *state;
            if !before.can_transition_to(target) {
                trace!(name=%self.inner.name, stream_id=self.inner.stream_id, ?before, ?target, "stream state transition not possible");
                return false;
            }
            *state = target;
            before
        };

        debug!(name=%self.inner.name, stream_id=self.inner.stream_id, ?before, current=?target, "stream state changed");
        if let Some(listener) = &self.inner.state_listener {
            listener.on_state_changed(self.inner.stream_id, before, target);
        }
        true
    }

    fn require_open(&self) -> Result<(), TransportError> {
        if self.state() == StreamState::Open {
            Ok(())
        }
        else {
            Err(TransportError::StreamNotOpen(self.inner.stream_id))
        }
    }

    pub fn send_data(&self, payload: Bytes) -> WriteFuture {
        if let Err(e) = self.require_open() {
            return WriteFuture::failed(e);
        }
        self.inner.writer.write(Packet::StreamResponse {
            stream_id: self.inner.stream_id,
            payload,
        })
    }

    /// Sends a stream level ping. The peer answers with a pong carrying the same request id,
    ///  which is only logged.
    pub fn send_ping(&self) -> WriteFuture {
        if let Err(e) = self.require_open() {
            return WriteFuture::failed(e);
        }
        let request_id = self.inner.next_ping_id.fetch_add(1, Ordering::Relaxed);
        self.inner.writer.write(Packet::StreamPing {
            stream_id: self.inner.stream_id,
            request_id,
        })
    }

    /// Closes the stream and notifies the peer. Closing a stream that is closed or closing
    ///  already is a no-op.
    pub async fn close(&self) -> WriteResult {
        if !self.change_state(StreamState::Closing) {
            return Ok(());
        }
        if let Some(table) = self.inner.table.upgrade() {
            table.lock().unwrap().remove(self.inner.stream_id);
        }

        let result = self.inner.writer.write(Packet::StreamClose {
            stream_id: self.inner.stream_id,
            code: StreamCode::Ok,
        }).await;

        self.change_state(StreamState::Closed);
        result
    }
}
