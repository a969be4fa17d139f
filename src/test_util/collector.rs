use std::collections::BTreeMap;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{duplex, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::time::timeout;
use tracing::trace;

use crate::handshake::{ClusterOption, KEY_CLUSTER, KEY_CODE, KEY_SUB_CODE};
use crate::packet::control_value::ControlValue;
use crate::packet::handshake_code::HandshakeResponseCode;
use crate::packet::Packet;

const MAX_PACKET_LEN: usize = 16*1024*1024;

/// How long [ScriptedCollector::expect_packet] waits
pub const EXPECT_TIMEOUT: Duration = Duration::from_secs(5);

/// The collector's side of a connection, driven step by step by a test.
///
/// Test code decides what the collector sends and when, and inspects every packet the agent
///  sends. Dropping the collector closes the connection abruptly.
pub struct ScriptedCollector<S> {
    stream: S,
    buf: BytesMut,
}

impl ScriptedCollector<DuplexStream> {
    /// An in-memory connection: the first element is the agent's end, to be passed to
    ///  [crate::handler::ConnectionHandler::attach].
    pub fn pair(max_buf_size: usize) -> (DuplexStream, ScriptedCollector<DuplexStream>) {
        let (agent_side, collector_side) = duplex(max_buf_size);
        (agent_side, ScriptedCollector::new(collector_side))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> ScriptedCollector<S> {
    pub fn new(stream: S) -> ScriptedCollector<S> {
        ScriptedCollector {
            stream,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// The next packet sent by the agent, or `None` if the agent closed its end of the
    ///  connection.
    ///
    /// Panics if the agent sent data that is not a valid packet.
    pub async fn recv(&mut self) -> Option<Packet> {
        loop {
            match Packet::try_decode(&mut self.buf, MAX_PACKET_LEN) {
                Ok(Some(packet)) => {
                    trace!(?packet, "collector received packet");
                    return Some(packet);
                }
                Ok(None) => {}
                Err(e) => panic!("agent sent an invalid packet: {}", e),
            }

            match self.stream.read_buf(&mut self.buf).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    /// Like [ScriptedCollector::recv], but panics if no packet arrives within [EXPECT_TIMEOUT]
    pub async fn expect_packet(&mut self) -> Packet {
        match timeout(EXPECT_TIMEOUT, self.recv()).await {
            Ok(Some(packet)) => packet,
            Ok(None) => panic!("connection was closed while waiting for a packet"),
            Err(_) => panic!("no packet received within {:?}", EXPECT_TIMEOUT),
        }
    }

    pub async fn send(&mut self, packet: Packet) {
        let mut buf = BytesMut::new();
        packet.ser(&mut buf);
        self.send_raw(&buf).await;
    }

    /// writes bytes that are not necessarily a valid packet
    pub async fn send_raw(&mut self, data: &[u8]) {
        self.stream.write_all(data).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    /// Waits for the agent's handshake and answers it. Returns the agent's handshake data.
    pub async fn accept_handshake(&mut self, code: HandshakeResponseCode, cluster_option: Option<ClusterOption>) -> BTreeMap<String, ControlValue> {
        let (request_id, payload) = match self.expect_packet().await {
            Packet::Handshake { request_id, payload } => (request_id, payload),
            other => panic!("expected handshake, was {:?}", other),
        };

        self.send(Packet::HandshakeResponse {
            request_id,
            payload: handshake_response(code, cluster_option),
        }).await;

        ControlValue::decode_map(&payload).unwrap()
    }
}

/// The payload of a handshake response
pub fn handshake_response(code: HandshakeResponseCode, cluster_option: Option<ClusterOption>) -> Bytes {
    let (code, sub_code) = code.to_pair();

    let mut response = BTreeMap::new();
    response.insert(KEY_CODE.to_string(), ControlValue::Int(code));
    response.insert(KEY_SUB_CODE.to_string(), ControlValue::Int(sub_code));
    if let Some(cluster_option) = cluster_option {
        response.insert(KEY_CLUSTER.to_string(), cluster_option.to_control_value());
    }
    ControlValue::encode_map(&response)
}
