use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn};

use crate::error::TransportError;
use crate::packet::{Packet, PacketType};
use crate::state::ConnectionStateCell;

pub type WriteResult = Result<(), TransportError>;

pub enum WriteCommand {
    Write {
        packet: Packet,
        done: Option<oneshot::Sender<WriteResult>>,
    },
    /// flushes everything submitted before, then shuts down the write half
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Submits packets to a connection's writer task. Packets reach the wire in submission order.
#[derive(Clone)]
pub struct PacketWriter {
    tx: mpsc::UnboundedSender<WriteCommand>,
}

impl PacketWriter {
    pub fn channel() -> (PacketWriter, mpsc::UnboundedReceiver<WriteCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (PacketWriter { tx }, rx)
    }

    /// Enqueues a packet; the returned future resolves when the packet was written or failed.
    ///  Dropping the future does not cancel the write.
    pub fn write(&self, packet: Packet) -> WriteFuture {
        let (done, rx) = oneshot::channel();
        if let Err(mpsc::error::SendError(cmd)) = self.tx.send(WriteCommand::Write { packet, done: Some(done) }) {
            if let WriteCommand::Write { done: Some(done), .. } = cmd {
                let _ = done.send(Err(TransportError::ConnectionClosed));
            }
        }
        WriteFuture { rx }
    }

    /// Enqueues a packet without tracking its completion. Returns `false` if the writer is gone.
    pub fn write_and_forget(&self, packet: Packet) -> bool {
        self.tx.send(WriteCommand::Write { packet, done: None }).is_ok()
    }

    /// Returns after all previously submitted packets were handled and the write half was shut
    ///  down, or immediately if the writer already terminated.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.tx.send(WriteCommand::Shutdown { done }).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Resolves when a packet was written to the socket. A writer that terminates before handling
///  the packet resolves it with [TransportError::ConnectionClosed].
pub struct WriteFuture {
    rx: oneshot::Receiver<WriteResult>,
}

impl WriteFuture {
    /// a future that is failed from the start, for packets that are not submitted at all
    pub fn failed(error: TransportError) -> WriteFuture {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        WriteFuture { rx }
    }
}

impl Future for WriteFuture {
    type Output = WriteResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(TransportError::ConnectionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Packets carrying application data are only written in a run state. The state is re-checked
///  when the packet is actually written: it may have changed while the packet was queued.
fn requires_run_state(packet: &Packet) -> bool {
    use PacketType::*;
    matches!(packet.packet_type(), Send | Request | Response | StreamCreate | StreamResponse)
}

/// The writer task's loop. It terminates on shutdown, on the first failed write, or when all
///  [PacketWriter]s were dropped.
///
/// Returns the error that broke the connection, if any. Commands still queued at that point are
///  failed with that error.
pub async fn write_loop<W>(
    name: Arc<str>,
    mut rx: mpsc::UnboundedReceiver<WriteCommand>,
    mut out: W,
    state: Arc<ConnectionStateCell>,
) -> Option<TransportError>
where W: AsyncWrite + Unpin
{
    let mut buf = BytesMut::with_capacity(4096);
    let mut broken = None;

    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriteCommand::Write { packet, done } => {
                if requires_run_state(&packet) {
                    let current = state.current();
                    if !current.is_run() {
                        debug!(%name, ?packet, ?current, "not writing application packet in current state");
                        reply(done, Err(TransportError::InvalidState(current)));
                        continue;
                    }
                }

                buf.clear();
                packet.ser(&mut buf);
                trace!(%name, ?packet, "writing packet");

                let result = write_and_flush(&mut out, &buf).await
                    .map_err(TransportError::write_failed);

                if let Err(e) = &result {
                    error!(%name, ?packet, "write failed, connection is broken: {}", e);
                    broken = Some(e.clone());
                    reply(done, result);
                    break;
                }
                reply(done, result);
            }
            WriteCommand::Shutdown { done } => {
                debug!(%name, "shutting down write half");
                if let Err(e) = out.shutdown().await {
                    warn!(%name, "error shutting down write half: {}", e);
                }
                let _ = done.send(());
                break;
            }
        }
    }

    rx.close();
    let remaining_error = broken.clone().unwrap_or(TransportError::ConnectionClosed);
    while let Ok(cmd) = rx.try_recv() {
        match cmd {
            WriteCommand::Write { done, .. } => reply(done, Err(remaining_error.clone())),
            WriteCommand::Shutdown { done } => { let _ = done.send(()); }
        }
    }

    broken
}

async fn write_and_flush<W: AsyncWrite + Unpin>(out: &mut W, buf: &[u8]) -> std::io::Result<()> {
    out.write_all(buf).await?;
    out.flush().await
}

fn reply(done: Option<oneshot::Sender<WriteResult>>, result: WriteResult) {
    if let Some(done) = done {
        // the caller may have lost interest
        let _ = done.send(result);
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;
    use bytes::Bytes;
    use tokio::io::{duplex, AsyncReadExt};
    use crate::state::ConnectionState;
    use super::*;

    fn running_state() -> Arc<ConnectionStateCell> {
        let state = Arc::new(ConnectionStateCell::new("test".to_string()));
        state.transition(ConnectionState::Connected);
        state.transition(ConnectionState::RunWithoutHandshake);
        state
    }

    fn send(payload: &'static [u8]) -> Packet {
        Packet::Send { payload: Bytes::from_static(payload) }
    }

    #[tokio::test]
    async fn test_writes_in_order() {
        let (writer, rx) = PacketWriter::channel();
        let (client, mut server) = duplex(1024);
        let task = tokio::spawn(write_loop("test".into(), rx, client, running_state()));

        let f1 = writer.write(send(b"a"));
        writer.write_and_forget(Packet::Pong);
        let f2 = writer.write(send(b"b"));
        f1.await.unwrap();
        f2.await.unwrap();
        writer.shutdown().await;
        assert!(task.await.unwrap().is_none());

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();

        let mut expected = BytesMut::new();
        send(b"a").ser(&mut expected);
        Packet::Pong.ser(&mut expected);
        send(b"b").ser(&mut expected);
        assert_eq!(received, expected.to_vec());
    }

    #[tokio::test]
    async fn test_application_packet_requires_run_state() {
        let (writer, rx) = PacketWriter::channel();
        let (client, _server) = duplex(1024);
        let state = Arc::new(ConnectionStateCell::new("test".to_string()));
        state.transition(ConnectionState::Connected);
        tokio::spawn(write_loop("test".into(), rx, client, state));

        match writer.write(send(b"a")).await {
            Err(TransportError::InvalidState(ConnectionState::Connected)) => {}
            other => panic!("{:?}", other),
        }
        writer.write(Packet::Ping { ping_id: 1, state_version: 0, state_code: 3 }).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_peer_does_not_break_writer() {
        let (writer, rx) = PacketWriter::channel();
        // nobody reads from the other end for now, so the first write blocks
        let (client, mut server) = duplex(8);
        let task = tokio::spawn(write_loop("test".into(), rx, client, running_state()));

        let mut f1 = writer.write(send(b"0123456789"));
        let f2 = writer.write(send(b"x"));
        assert!(tokio::time::timeout(Duration::from_secs(60), &mut f1).await.is_err());
        assert!(!task.is_finished());

        let mut expected = BytesMut::new();
        send(b"0123456789").ser(&mut expected);
        send(b"x").ser(&mut expected);
        let mut received = vec![0u8; expected.len()];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected.to_vec());

        f1.await.unwrap();
        f2.await.unwrap();
        writer.shutdown().await;
        assert!(task.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_to_closed_peer() {
        let (writer, rx) = PacketWriter::channel();
        let (client, server) = duplex(1024);
        drop(server);
        let task = tokio::spawn(write_loop("test".into(), rx, client, running_state()));

        assert!(matches!(writer.write(send(b"a")).await, Err(TransportError::WriteFailed(_))));
        assert!(matches!(task.await.unwrap(), Some(TransportError::WriteFailed(_))));
    }
}
