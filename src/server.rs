//! The listening endpoint: an acceptor task plus one reader task per peer.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::close::CloseCode;
use crate::connection::{Connection, Timeouts};
use crate::transport::Transport;
use crate::{Error, Handler};

/// A listening WebSocket endpoint.
///
/// Connections are shared between the server's set and their reader tasks;
/// whichever lets go last frees the connection.
pub struct Server {
    inner: Arc<ServerInner>,
    acceptor: JoinHandle<()>,
}

struct ServerInner {
    handler: Arc<dyn Handler>,
    connections: Mutex<HashMap<u64, Arc<Connection>>>,
    next_id: AtomicU64,
    local_addr: SocketAddr,
    timeouts: Timeouts,
}

#[derive(Clone)]
enum StreamAcceptor {
    Plain,
    #[cfg(feature = "tls")]
    Tls(tokio_rustls::TlsAcceptor),
}

impl StreamAcceptor {
    async fn wrap(&self, stream: TcpStream) -> std::io::Result<Transport> {
        match self {
            StreamAcceptor::Plain => Ok(Transport::Plain(stream)),
            #[cfg(feature = "tls")]
            StreamAcceptor::Tls(acceptor) => {
                let tls = acceptor.accept(stream).await?;
                Ok(Transport::Tls(Box::new(tls.into())))
            }
        }
    }
}

impl Server {
    /// Binds `address:port` and starts accepting connections. Port 0 picks
    /// an ephemeral port; see [`local_addr`](Server::local_addr).
    pub async fn open(address: &str, port: u16, handler: impl Handler) -> Result<Server, Error> {
        Server::open_with_timeouts(address, port, handler, Timeouts::default()).await
    }

    /// Like [`open`](Server::open) with custom protocol timers.
    pub async fn open_with_timeouts(
        address: &str,
        port: u16,
        handler: impl Handler,
        timeouts: Timeouts,
    ) -> Result<Server, Error> {
        let listener = TcpListener::bind((address, port)).await?;
        Server::start(listener, Arc::new(handler), StreamAcceptor::Plain, timeouts)
    }

    /// Like [`open`](Server::open), wrapping every accepted stream in TLS.
    #[cfg(feature = "tls")]
    pub async fn open_tls(
        address: &str,
        port: u16,
        handler: impl Handler,
        acceptor: tokio_rustls::TlsAcceptor,
    ) -> Result<Server, Error> {
        let listener = TcpListener::bind((address, port)).await?;
        Server::start(
            listener,
            Arc::new(handler),
            StreamAcceptor::Tls(acceptor),
            Timeouts::default(),
        )
    }

    fn start(
        listener: TcpListener,
        handler: Arc<dyn Handler>,
        stream_acceptor: StreamAcceptor,
        timeouts: Timeouts,
    ) -> Result<Server, Error> {
        let local_addr = listener.local_addr()?;
        let inner = Arc::new(ServerInner {
            handler,
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            local_addr,
            timeouts,
        });
        let acceptor = tokio::spawn(accept_loop(listener, inner.clone(), stream_acceptor));
        Ok(Server { inner, acceptor })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// A snapshot of the live connections. The set lock is released before
    /// the snapshot is handed out, so user code never runs under it.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner.connections.lock().unwrap().values().cloned().collect()
    }

    /// Stops accepting and starts a `GOING_AWAY` close on every connection.
    pub async fn close(self) {
        self.acceptor.abort();
        let connections: Vec<Arc<Connection>> = {
            let mut set = self.inner.connections.lock().unwrap();
            set.drain().map(|(_, connection)| connection).collect()
        };
        for connection in connections {
            let _ = connection.close(CloseCode::GOING_AWAY).await;
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

async fn accept_loop(
    listener: TcpListener,
    inner: Arc<ServerInner>,
    stream_acceptor: StreamAcceptor,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                error!("accept failed: {}", err);
                continue;
            }
        };
        debug!("tcp connection from {}", peer);

        let inner = inner.clone();
        let stream_acceptor = stream_acceptor.clone();
        tokio::spawn(async move {
            let transport = match stream_acceptor.wrap(stream).await {
                Ok(transport) => transport,
                Err(err) => {
                    debug!("could not secure stream from {}: {}", peer, err);
                    return;
                }
            };
            let (connection, reader) =
                Connection::accept(transport, inner.handler.clone(), inner.timeouts);
            let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
            inner.connections.lock().unwrap().insert(id, connection);
            reader.run().await;
            inner.connections.lock().unwrap().remove(&id);
        });
    }
}
