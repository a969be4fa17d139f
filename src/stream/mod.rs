//! Logical streams, multiplexed over a connection.
//!
//! Either side can open a stream. The opening side sends a stream-create packet and the other
//!  side accepts or rejects it; once open, the accepting side pushes data to the opener. Either
//!  side can close a stream at any time, and closing the connection closes all of its streams.

mod context;
mod id_generator;
mod multiplexer;

pub use context::{StreamContext, StreamState};
pub use id_generator::{PeerRole, StreamIdGenerator};
pub use multiplexer::StreamMultiplexer;
