//! Negotiation of the connection's operating mode right after the physical connect.
//!
//! The agent sends a handshake carrying its properties, its socket id and (optionally) its cluster
//!  option, and re-sends it periodically until the collector responds or the configured maximum
//!  number of attempts is reached. The response determines whether the connection runs simplex
//!  (agent to collector only) or duplex.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail};
use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::packet::control_value::ControlValue;
use crate::packet::handshake_code::HandshakeResponseCode;
use crate::packet::Packet;
use crate::state::ConnectionState;
use crate::timer::{TimeoutHandle, Timer};
use crate::writer::PacketWriter;

pub const KEY_SOCKET_ID: &str = "socketId";
pub const KEY_CLUSTER: &str = "cluster";
pub const KEY_CODE: &str = "code";
pub const KEY_SUB_CODE: &str = "subCode";

const KEY_CLUSTER_ID: &str = "id";
const KEY_CLUSTER_ROLES: &str = "roles";

/// Cluster membership as announced in a handshake. A side without cluster support has a
///  disabled option, which is not transmitted.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ClusterOption {
    pub enabled: bool,
    pub id: String,
    pub roles: Vec<String>,
}

impl ClusterOption {
    pub fn new(id: impl Into<String>, roles: Vec<String>) -> ClusterOption {
        ClusterOption {
            enabled: true,
            id: id.into(),
            roles,
        }
    }

    pub fn disabled() -> ClusterOption {
        ClusterOption {
            enabled: false,
            id: String::new(),
            roles: Vec::new(),
        }
    }

    pub fn to_control_value(&self) -> ControlValue {
        ControlValue::Map(BTreeMap::from([
            (KEY_CLUSTER_ID.to_string(), ControlValue::from(self.id.as_str())),
            (KEY_CLUSTER_ROLES.to_string(), ControlValue::List(self.roles.iter()
                .map(|r| ControlValue::from(r.as_str()))
                .collect())),
        ]))
    }

    pub fn from_control_value(value: &ControlValue) -> anyhow::Result<ClusterOption> {
        let map = value.as_map()
            .ok_or_else(|| anyhow!("cluster option is not a map: {:?}", value))?;

        let id = map.get(KEY_CLUSTER_ID)
            .and_then(ControlValue::as_str)
            .ok_or_else(|| anyhow!("cluster option without id: {:?}", value))?;

        let roles = match map.get(KEY_CLUSTER_ROLES) {
            None | Some(ControlValue::Null) => Vec::new(),
            Some(ControlValue::List(roles)) => roles.iter()
                .map(|r| r.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| anyhow!("cluster role is not a string: {:?}", r)))
                .collect::<anyhow::Result<Vec<_>>>()?,
            Some(other) => bail!("cluster roles are not a list: {:?}", other),
        };

        Ok(ClusterOption::new(id, roles))
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NegotiatedMode {
    Unknown,
    Simplex,
    Duplex,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Phase {
    Init,
    Started,
    Finished,
}

struct HandshakeState {
    phase: Phase,
    attempt_count: u32,
    last_attempt_time: Option<Instant>,
    mode: NegotiatedMode,
    response_code: Option<HandshakeResponseCode>,
    remote_cluster_option: ClusterOption,
    retry: Option<TimeoutHandle>,
}

/// Drives the agent's side of the handshake. It decides on the run state to move to, but does
///  not touch the connection state itself.
pub struct Handshaker {
    name: Arc<str>,
    writer: PacketWriter,
    timer: Timer,
    retry_interval: Duration,
    max_handshake_count: u32,
    state: Arc<Mutex<HandshakeState>>,
}

impl Handshaker {
    pub fn new(name: Arc<str>, config: &TransportConfig, writer: PacketWriter, timer: Timer) -> Handshaker {
        Handshaker {
            name,
            writer,
            timer,
            retry_interval: config.handshake_retry_interval,
            max_handshake_count: config.max_handshake_count,
            state: Arc::new(Mutex::new(HandshakeState {
                phase: Phase::Init,
                attempt_count: 0,
                last_attempt_time: None,
                mode: NegotiatedMode::Unknown,
                response_code: None,
                remote_cluster_option: ClusterOption::disabled(),
                retry: None,
            })),
        }
    }

    /// the control map sent as handshake payload
    pub fn handshake_data(config: &TransportConfig, socket_id: i32) -> BTreeMap<String, ControlValue> {
        let mut data = config.properties.clone();
        data.insert(KEY_SOCKET_ID.to_string(), ControlValue::Int(socket_id));
        if config.cluster_option.enabled {
            data.insert(KEY_CLUSTER.to_string(), config.cluster_option.to_control_value());
        }
        data
    }

    /// Sends the first handshake and schedules retries. Can be called only once.
    pub fn start(&self, data: &BTreeMap<String, ControlValue>) -> anyhow::Result<()> {
        let payload = ControlValue::encode_map(data);

        {
            let mut state = self.state.lock().unwrap();
            if state.phase != Phase::Init {
                bail!("handshake was already started");
            }
            state.phase = Phase::Started;
        }

        info!(name=%self.name, "starting handshake");
        send_attempt(&self.name, &self.writer, &self.state, &payload, self.max_handshake_count);

        let name = self.name.clone();
        let writer = self.writer.clone();
        let state = self.state.clone();
        let max_handshake_count = self.max_handshake_count;
        let retry = self.timer.schedule_with_fixed_delay(self.retry_interval, move || {
            send_attempt(&name, &writer, &state, &payload, max_handshake_count);
            async {}
        })?;

        let mut state = self.state.lock().unwrap();
        if state.phase == Phase::Started && state.attempt_count < self.max_handshake_count {
            state.retry = Some(retry);
        }
        else {
            // finished or exhausted while the retry was being scheduled
            retry.cancel();
        }
        Ok(())
    }

    /// Processes a handshake response, returning the run state the connection should move to.
    ///  `None` means the response did not complete the handshake and the connection state stays
    ///  as it is.
    pub fn handshake_complete(&self, payload: &[u8]) -> Option<ConnectionState> {
        let mut state = self.state.lock().unwrap();
        match state.phase {
            Phase::Init => {
                warn!(name=%self.name, "received handshake response before the handshake was started - ignoring");
                return None;
            }
            Phase::Finished => {
                warn!(name=%self.name, "received handshake response after the handshake was completed - ignoring");
                return None;
            }
            Phase::Started => {}
        }

        let response = match ControlValue::decode_map(payload) {
            Ok(response) => response,
            Err(e) => {
                warn!(name=%self.name, "invalid handshake response - ignoring: {}", e);
                return None;
            }
        };

        let code = response_code(&response);
        let (mode, target) = match code {
            HandshakeResponseCode::Success |
            HandshakeResponseCode::AlreadyKnown |
            HandshakeResponseCode::SimplexCommunication |
            HandshakeResponseCode::AlreadySimplexCommunication => (NegotiatedMode::Simplex, ConnectionState::RunSimplex),
            HandshakeResponseCode::DuplexCommunication |
            HandshakeResponseCode::AlreadyDuplexCommunication => (NegotiatedMode::Duplex, ConnectionState::RunDuplex),
            _ => {
                warn!(name=%self.name, ?code, "handshake was not accepted - connection state remains unchanged");
                return None;
            }
        };

        if mode == NegotiatedMode::Duplex {
            state.remote_cluster_option = match response.get(KEY_CLUSTER) {
                None | Some(ControlValue::Null) => ClusterOption::disabled(),
                Some(raw) => ClusterOption::from_control_value(raw).unwrap_or_else(|e| {
                    warn!(name=%self.name, "invalid remote cluster option - treating cluster as disabled: {}", e);
                    ClusterOption::disabled()
                }),
            };
        }

        state.phase = Phase::Finished;
        state.mode = mode;
        state.response_code = Some(code);
        if let Some(retry) = state.retry.take() {
            retry.cancel();
        }
        drop(state);

        info!(name=%self.name, ?code, "handshake completed");
        Some(target)
    }

    /// stops retrying, e.g. because the connection is closed
    pub fn abort(&self) {
        let mut state = self.state.lock().unwrap();
        if state.phase != Phase::Finished {
            debug!(name=%self.name, "aborting handshake");
        }
        state.phase = Phase::Finished;
        if let Some(retry) = state.retry.take() {
            retry.cancel();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().unwrap().phase == Phase::Finished
    }

    pub fn attempt_count(&self) -> u32 {
        self.state.lock().unwrap().attempt_count
    }

    pub fn last_attempt_time(&self) -> Option<Instant> {
        self.state.lock().unwrap().last_attempt_time
    }

    pub fn negotiated_mode(&self) -> NegotiatedMode {
        self.state.lock().unwrap().mode
    }

    pub fn response_code(&self) -> Option<HandshakeResponseCode> {
        self.state.lock().unwrap().response_code
    }

    pub fn remote_cluster_option(&self) -> ClusterOption {
        self.state.lock().unwrap().remote_cluster_option.clone()
    }
}

fn response_code(response: &BTreeMap<String, ControlValue>) -> HandshakeResponseCode {
    let code = response.get(KEY_CODE).and_then(ControlValue::as_i32);
    let sub_code = response.get(KEY_SUB_CODE).and_then(ControlValue::as_i32);
    match (code, sub_code) {
        (Some(code), Some(sub_code)) => HandshakeResponseCode::from_pair(code, sub_code),
        _ => HandshakeResponseCode::UnknownCode,
    }
}

fn send_attempt(name: &str, writer: &PacketWriter, state: &Mutex<HandshakeState>, payload: &Bytes, max_handshake_count: u32) {
    let mut state = state.lock().unwrap();
    if state.phase != Phase::Started {
        return;
    }
    if state.attempt_count >= max_handshake_count {
        if let Some(retry) = state.retry.take() {
            warn!(name, attempt_count=state.attempt_count, "no handshake response after maximum number of attempts - giving up");
            retry.cancel();
        }
        return;
    }

    state.attempt_count += 1;
    state.last_attempt_time = Some(Instant::now());
    debug!(name, attempt=state.attempt_count, "sending handshake");

    let packet = Packet::Handshake {
        request_id: state.attempt_count as i32,
        payload: payload.clone(),
    };
    if !writer.write_and_forget(packet) {
        debug!(name, "connection writer is gone, not sending handshake");
    }
}
