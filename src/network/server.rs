//! Inbound HTTP server

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnectionBuilder;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::proxy::HttpProxy;
use crate::Result;

use super::connection_pool::{ConnectionGuard, ConnectionPool};
use super::SHUTDOWN_TIMEOUT_MS;

/// Accept loop serving one [`HttpProxy`] over HTTP/1 and HTTP/2
pub struct Server {
    listener: TcpListener,
    proxy: Arc<HttpProxy>,
    connection_pool: ConnectionPool,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    /// Bind the listening socket
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be bound or the limit is 0
    pub async fn bind(
        addr: SocketAddr,
        proxy: Arc<HttpProxy>,
        max_connections: usize,
    ) -> Result<Self> {
        let connection_pool = ConnectionPool::new(max_connections)?;
        let listener = TcpListener::bind(addr).await?;
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            listener,
            proxy,
            connection_pool,
            shutdown_tx,
        })
    }

    /// Address actually bound, useful with port 0
    ///
    /// # Errors
    ///
    /// Returns error if the socket address cannot be read
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Sender that stops [`Server::run`] when signalled
    #[must_use]
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Serve until Ctrl-C or a shutdown signal, then drain
    ///
    /// # Errors
    ///
    /// Returns error only if shutdown itself fails
    pub async fn run(self) -> Result<()> {
        let addr = self.local_addr()?;
        info!("Listening on {} in {} mode", addr, self.proxy.mode());

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let connections = TaskTracker::new();
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let Some(guard) = self.connection_pool.try_acquire() else {
                                warn!("Connection limit reached, rejecting {}", peer_addr);
                                drop(stream);
                                continue;
                            };
                            connections.spawn(serve_connection(
                                stream,
                                peer_addr,
                                Arc::clone(&self.proxy),
                                self.shutdown_tx.subscribe(),
                                guard,
                            ));
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = &mut ctrl_c => {
                    info!("Received SIGINT, shutting down");
                    break;
                }
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        // Ask open connections to finish their in-flight exchange
        self.shutdown_tx.send(()).ok();
        drop(self.listener);

        let shutdown_timeout = Duration::from_millis(SHUTDOWN_TIMEOUT_MS);
        connections.close();
        if tokio::time::timeout(shutdown_timeout, connections.wait())
            .await
            .is_err()
        {
            warn!("Connections still open after {:?}", shutdown_timeout);
        }

        if !self.proxy.drain(shutdown_timeout).await {
            warn!("Recordings still being finalized after {:?}", shutdown_timeout);
        }

        info!("Shutdown complete");
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    proxy: Arc<HttpProxy>,
    mut shutdown_rx: broadcast::Receiver<()>,
    _guard: ConnectionGuard,
) {
    debug!("Accepted connection from {}", peer_addr);

    let service = service_fn(move |request: Request<Incoming>| {
        let proxy = Arc::clone(&proxy);
        async move { Ok::<_, Infallible>(proxy.handle(request).await) }
    });
    let builder = ConnectionBuilder::new(TokioExecutor::new());
    let connection = builder.serve_connection(TokioIo::new(stream), service);
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = shutdown_rx.recv() => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };

    if let Err(e) = result {
        debug!("Connection from {} ended with error: {}", peer_addr, e);
    }
}
