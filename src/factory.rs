use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use anyhow::bail;
#[cfg(test)] use mockall::automock;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn, Instrument};

use crate::config::{ReconnectConfig, TransportConfig};
use crate::handler::ConnectionHandler;
use crate::listener::ConnectionListeners;
use crate::util::exponential_backoff::ExponentialBackoff;

/// What a connection needs from whoever created it
#[cfg_attr(test, automock)]
pub trait ConnectionFactory: Send + Sync + 'static {
    /// `true` once the factory was shut down: connections that go down are not re-established
    fn is_released(&self) -> bool;

    /// Called once by a connection that was closed by the peer or broke, unless the factory is
    ///  released. Returns immediately, reconnecting happens in the background.
    fn reconnect(&self, handler_id: i32, remote_addr: Option<SocketAddr>);
}

/// Creates connections to a collector over TCP and keeps them alive: a connection that goes
///  down is replaced by a new one, retrying with exponential backoff. The current connection is
///  published through [TcpConnectionFactory::subscribe_connection].
#[derive(Clone)]
pub struct TcpConnectionFactory {
    inner: Arc<FactoryInner>,
}

struct FactoryInner {
    config: Arc<TransportConfig>,
    reconnect_config: ReconnectConfig,
    listeners: ConnectionListeners,
    runtime: Handle,
    next_socket_id: AtomicI32,
    released: AtomicBool,
    current: watch::Sender<Option<ConnectionHandler>>,
}

impl TcpConnectionFactory {
    /// Must be called from within a tokio runtime
    pub fn new(config: TransportConfig, reconnect_config: ReconnectConfig, listeners: ConnectionListeners) -> anyhow::Result<TcpConnectionFactory> {
        config.validate()?;
        reconnect_config.validate()?;

        Ok(TcpConnectionFactory {
            inner: Arc::new(FactoryInner {
                config: Arc::new(config),
                reconnect_config,
                listeners,
                runtime: Handle::current(),
                next_socket_id: AtomicI32::new(1),
                released: AtomicBool::new(false),
                current: watch::channel(None).0,
            }),
        })
    }

    fn next_socket_id(&self) -> i32 {
        self.inner.next_socket_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Connects a new handler and makes it the current connection.
    pub async fn connect(&self, addr: SocketAddr) -> anyhow::Result<ConnectionHandler> {
        if self.is_released() {
            bail!("connection factory was released");
        }

        let handler = ConnectionHandler::new(
            self.next_socket_id(),
            self.inner.config.clone(),
            Arc::new(self.clone()),
            self.inner.listeners.clone(),
        );
        handler.connect(addr).await?;

        if self.is_released() {
            // released while connecting
            handler.close().await;
            bail!("connection factory was released");
        }

        self.inner.current.send_replace(Some(handler.clone()));
        Ok(handler)
    }

    /// the most recently established connection
    pub fn current_connection(&self) -> Option<ConnectionHandler> {
        self.inner.current.borrow().clone()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<Option<ConnectionHandler>> {
        self.inner.current.subscribe()
    }

    /// Stops reconnecting and closes the current connection. Idempotent.
    pub async fn release(&self) {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("releasing connection factory");

        let current = self.inner.current.send_replace(None);
        if let Some(handler) = current {
            handler.close().await;
        }
    }

    async fn reconnect_loop(self, handler_id: i32, addr: SocketAddr) {
        let mut backoff = ExponentialBackoff::new(&self.inner.reconnect_config);
        loop {
            let delay = backoff.next_delay();
            debug!(?delay, "waiting before reconnect attempt");
            sleep(delay).await;

            if self.is_released() {
                debug!("factory was released, giving up reconnecting");
                return;
            }

            match self.connect(addr).await {
                Ok(handler) => {
                    info!(new_socket_id=handler.socket_id(), "reconnected");
                    return;
                }
                Err(e) => {
                    warn!("reconnect attempt failed: {}", e);
                }
            }
        }
    }
}

impl ConnectionFactory for TcpConnectionFactory {
    fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    fn reconnect(&self, handler_id: i32, remote_addr: Option<SocketAddr>) {
        if self.is_released() {
            return;
        }
        let Some(addr) = remote_addr else {
            warn!(handler_id, "connection without remote address can not be reconnected");
            return;
        };

        info!(handler_id, %addr, "scheduling reconnect");
        let span = tracing::info_span!("reconnect", handler_id, %addr);
        self.inner.runtime.spawn(self.clone().reconnect_loop(handler_id, addr).instrument(span));
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use crate::packet::handshake_code::HandshakeResponseCode;
    use crate::state::ConnectionState;
    use crate::test_util::collector::ScriptedCollector;
    use super::*;

    fn factory() -> TcpConnectionFactory {
        let reconnect_config = ReconnectConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            factor_eighths: 16,
        };
        let mut config = TransportConfig::default();
        config.close_packet_timeout = Duration::from_millis(200);
        TcpConnectionFactory::new(config, reconnect_config, ConnectionListeners::default()).unwrap()
    }

    #[tokio::test]
    async fn test_invalid_config() {
        let mut config = TransportConfig::default();
        config.max_handshake_count = 0;
        assert!(TcpConnectionFactory::new(config, ReconnectConfig::default(), ConnectionListeners::default()).is_err());
    }

    #[tokio::test]
    async fn test_connect_failure() {
        // bind and drop to get a port that refuses connections
        let addr = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap();

        let factory = factory();
        assert!(factory.connect(addr).await.is_err());
        assert!(factory.current_connection().is_none());
    }

    #[tokio::test]
    async fn test_connect_and_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let factory = factory();
        let mut connections = factory.subscribe_connection();

        let first = factory.connect(addr).await.unwrap();
        let (socket, _) = listener.accept().await.unwrap();
        let mut collector = ScriptedCollector::new(socket);
        let handshake = collector.accept_handshake(HandshakeResponseCode::Success, None).await;
        assert_eq!(first.await_handshake(Duration::from_secs(5)).await.unwrap(), ConnectionState::RunSimplex);
        assert_eq!(handshake.get(crate::handshake::KEY_SOCKET_ID).and_then(|v| v.as_i32()), Some(first.socket_id()));
        connections.borrow_and_update();

        // the collector goes away abruptly, the factory reconnects
        drop(collector);
        let (socket, _) = timeout(Duration::from_secs(5), listener.accept()).await.unwrap().unwrap();
        let mut collector = ScriptedCollector::new(socket);
        collector.accept_handshake(HandshakeResponseCode::DuplexCommunication, None).await;

        timeout(Duration::from_secs(5), connections.changed()).await.unwrap().unwrap();
        let second = connections.borrow_and_update().clone().unwrap();
        assert_ne!(second.socket_id(), first.socket_id());
        assert_eq!(first.current_state(), ConnectionState::UnexpectedClosedByPeer);
        assert_eq!(second.await_handshake(Duration::from_secs(5)).await.unwrap(), ConnectionState::RunDuplex);

        factory.release().await;
        assert!(factory.is_released());
        assert_eq!(second.current_state(), ConnectionState::Closed);
        assert!(factory.connect(addr).await.is_err());
    }
}
