//! Utilities for testing code that talks to a collector. They are used for testing the transport
//!  itself, and they are exported for testing applications built on top of it.
//!
//! Making them part of the crate's regular (non-#[cfg(test)]) code is what allows applications
//!  to use them without re-implementing a collector's side of the protocol.

pub mod collector;

use tokio::sync::mpsc;

use crate::packet::Packet;
use crate::writer::{PacketWriter, WriteCommand};

/// A [PacketWriter] that does not write to a socket: every packet is reported as written
///  successfully and forwarded to the returned receiver. Must be called from within a tokio
///  runtime.
pub fn capturing_writer() -> (PacketWriter, mpsc::UnboundedReceiver<Packet>) {
    let (writer, mut commands) = PacketWriter::channel();
    let (packets_tx, packets_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(cmd) = commands.recv().await {
            match cmd {
                WriteCommand::Write { packet, done } => {
                    let _ = packets_tx.send(packet);
                    if let Some(done) = done {
                        let _ = done.send(Ok(()));
                    }
                }
                WriteCommand::Shutdown { done } => {
                    let _ = done.send(());
                    break;
                }
            }
        }
    });

    (writer, packets_rx)
}
