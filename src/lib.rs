//! Bidirectional transport between an instrumented process (the "agent") and a remote collector
//!  over a single persistent connection.
//!
//! The crate owns the connection lifecycle, a handshake negotiating simplex / duplex operation
//!  and cluster options, keep-alive, request / response correlation with timeouts, logical
//!  streams multiplexed over the one physical connection, and teardown with reconnection.
//!  Payloads are opaque bytes - encoding domain objects is up to the caller.
//!
//! ## Building blocks
//!
//! * [packet] - the wire model, one [packet::Packet] enum with a decode-by-tag dispatch
//! * [timer] - delayed callbacks (handshake retry, request timeouts, keep-alive) with
//!    cancellation handles, stopped exactly once at connection teardown
//! * [state] - the connection state machine, the single source of truth for 'is this connection
//!    usable'
//! * [handshake] - negotiation of the operating mode after physical connect
//! * [correlator] - request ids, pending requests and their single resolution
//! * [stream] - logical streams with odd (client) / even (server) ids
//! * [retry_queue] - bounded, load-shedding holding area for redelivery by higher layers
//! * [handler] - the orchestrator that wires everything to a physical connection
//! * [factory] - creating connections and reconnecting them
//!
//! ## Concurrency
//!
//! Every connection has one reader task and one writer task. Writes reach the wire in the order
//!  they were submitted, inbound packets are dispatched sequentially in arrival order. No public
//!  operation blocks an I/O task.

pub mod config;
pub mod correlator;
pub mod error;
pub mod factory;
pub mod handler;
pub mod handshake;
pub mod listener;
pub mod packet;
pub mod retry_queue;
pub mod state;
pub mod stream;
pub mod test_util;
pub mod timer;
pub mod util;
pub mod writer;
