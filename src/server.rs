//! TCP server that routes each accepted connection to a protocol.
//!
//! Every connection runs in its own task, which is the only place events
//! for that connection are produced. The task owns the read half of the
//! socket and feeds the router; a companion writer task drains the
//! connection's [`StreamTransport`] into the write half.

use bytes::BytesMut;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, AcquireError, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::protocols::sniff::parser_factory;
use crate::protocols::{Protocol, ProtocolChains};
use crate::routing::{
    ConnectionEvent, ConnectionId, RoutedConnection, Router, RouterError, Transport,
};
use crate::stats::RoutingStats;
use crate::transport::{write_loop, StreamTransport};

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// Router specialised for the protocols this server speaks.
pub type ProtocolRouter = Router<Protocol, StreamTransport>;

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("router contract violated: {0}")]
    Router(#[from] RouterError),
    #[error("connection limiter closed")]
    Limiter(#[from] AcquireError),
}

/// Per-connection settings taken from the config.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    /// How long a connection may take to become routable.
    pub routing_timeout: Option<Duration>,
    /// Queued response bytes above which reading pauses.
    pub write_backlog: usize,
}

/// Server instance
pub struct Server {
    config: Config,
    router: Arc<ProtocolRouter>,
    stats: Arc<RoutingStats>,
    connection_limit: Arc<Semaphore>,
    shutdown: broadcast::Sender<()>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        let stats = Arc::new(RoutingStats::new());
        let router: ProtocolRouter = Router::new(
            parser_factory(config.routing_mode),
            Arc::new(ProtocolChains::new(config.max_echo_size)),
        )
        .with_observer(stats.clone())
        .with_buffer_limit(config.max_routing_buffer);
        let (shutdown, _) = broadcast::channel(1);

        Server {
            connection_limit: Arc::new(Semaphore::new(config.max_connections)),
            config,
            router: Arc::new(router),
            stats,
            shutdown,
        }
    }

    pub fn router(&self) -> &Arc<ProtocolRouter> {
        &self.router
    }

    pub fn stats(&self) -> &Arc<RoutingStats> {
        &self.stats
    }

    /// Bind the configured listen address.
    pub fn bind(&self) -> io::Result<TcpListener> {
        bind_listener(self.config.listen, self.config.backlog)
    }

    /// Bind, then serve until Ctrl-C.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind()?;
        info!(address = %listener.local_addr()?, "Server listening");

        self.serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("Shutdown requested");
        })
        .await
    }

    /// Accept connections on `listener` until `shutdown` resolves.
    ///
    /// On shutdown every live connection is closed and awaited. A router
    /// contract violation in any connection stops the server the same way
    /// and is returned.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let settings = ConnectionSettings {
            routing_timeout: self.config.routing_timeout(),
            write_backlog: self.config.write_backlog,
        };
        let mut connections = JoinSet::new();
        let mut next_id: u64 = 0;
        let mut fatal = None;
        tokio::pin!(shutdown);

        loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                permit = self.connection_limit.clone().acquire_owned() => permit?,
                _ = &mut shutdown => break,
            };

            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let conn_id = ConnectionId::new(next_id);
                        next_id += 1;

                        // The connection never reaches the router if its
                        // socket is already unusable.
                        if let Err(e) = check_socket(&stream) {
                            debug!(conn_id = %conn_id, peer = %peer, error = %e, "Socket setup failed");
                            if let Err(e) = reject_before_activation(&self.router, conn_id, e) {
                                fatal = Some(e);
                                break;
                            }
                            continue;
                        }
                        trace!(conn_id = %conn_id, peer = %peer, "New connection");

                        let router = Arc::clone(&self.router);
                        let shutdown = self.shutdown.subscribe();
                        connections.spawn(async move {
                            let result =
                                serve_connection(conn_id, stream, peer, router, settings, shutdown)
                                    .await;
                            drop(permit);
                            result
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Some(e) = connection_failure(joined) {
                        fatal = Some(e);
                        break;
                    }
                }
                _ = &mut shutdown => break,
            }
        }

        drop(listener);
        let _ = self.shutdown.send(());
        let pending = self.router.close_pending();
        info!(
            connections = connections.len(),
            routing = pending,
            "Closing connections"
        );
        while let Some(joined) = connections.join_next().await {
            if let Some(e) = connection_failure(joined) {
                fatal.get_or_insert(e);
            }
        }

        let stats = self.stats.snapshot();
        info!(
            ping = stats.ping,
            echo = stats.echo,
            failed = stats.failed,
            timed_out = stats.timed_out,
            "Server stopped"
        );

        match fatal {
            Some(e) => {
                error!(error = %e, "Router contract violated");
                Err(e.into())
            }
            None => Ok(()),
        }
    }
}

fn connection_failure(
    joined: Result<Result<(), RouterError>, tokio::task::JoinError>,
) -> Option<RouterError> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(e) => {
            warn!(error = %e, "Connection task failed");
            None
        }
    }
}

/// Prepare an accepted socket, failing if the peer is already gone.
fn check_socket(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    if let Some(e) = stream.take_error()? {
        return Err(e);
    }
    stream.peer_addr().map(drop)
}

/// Report a transport failure for a connection that was never activated.
fn reject_before_activation(
    router: &ProtocolRouter,
    conn_id: ConnectionId,
    error: io::Error,
) -> Result<(), RouterError> {
    let mut conn = RoutedConnection::new(conn_id);
    router.dispatch(&mut conn, ConnectionEvent::TransportError(error))
}

/// Drive one connection from activation to close.
///
/// Only router contract violations are returned; I/O and routing failures
/// end the connection and are logged.
pub async fn serve_connection<S>(
    conn_id: ConnectionId,
    stream: S,
    peer: SocketAddr,
    router: Arc<ProtocolRouter>,
    settings: ConnectionSettings,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), RouterError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let (transport, outbound) = StreamTransport::channel(peer);
    let writer = tokio::spawn(write_loop(writer, outbound));

    let mut conn = RoutedConnection::new(conn_id);
    router.dispatch(&mut conn, ConnectionEvent::TransportActive(transport.clone()))?;

    let routing_timeout = settings.routing_timeout.unwrap_or_default();
    let deadline = Instant::now() + routing_timeout;
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);

    loop {
        buffer.reserve(BUFFER_SIZE);
        let routing = conn.is_routing() && settings.routing_timeout.is_some();

        let event = tokio::select! {
            read = async {
                // Stop reading while the peer is not taking our responses.
                transport.writable(settings.write_backlog).await;
                reader.read_buf(&mut buffer).await
            } => match read {
                Ok(0) => {
                    trace!(conn_id = %conn_id, "Connection closed by client");
                    ConnectionEvent::ReadEof
                }
                Ok(_) => ConnectionEvent::Read(buffer.split()),
                Err(e) => ConnectionEvent::ReadError(e),
            },
            _ = tokio::time::sleep_until(deadline), if routing => {
                ConnectionEvent::RoutingTimeout(routing_timeout)
            }
            _ = transport.closed() => {
                trace!(conn_id = %conn_id, "Transport closed");
                ConnectionEvent::ReadEof
            }
            _ = shutdown.recv() => ConnectionEvent::ReadEof,
        };

        let last = matches!(
            event,
            ConnectionEvent::ReadEof | ConnectionEvent::ReadError(_)
        );
        router.dispatch(&mut conn, event)?;
        if last {
            break;
        }
    }

    transport.close();
    drop(transport);
    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(conn_id = %conn_id, error = %e, "Write failed"),
        Err(e) => warn!(conn_id = %conn_id, error = %e, "Writer task failed"),
    }
    trace!(conn_id = %conn_id, state = ?conn.state(), "Connection finished");

    Ok(())
}

/// Create a listening socket with address reuse and the given backlog.
fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    TcpListener::from_std(socket.into())
}
