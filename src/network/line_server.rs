//! TCP front end speaking SPP to clients.
//!
//! Every accepted connection gets a fresh [`ConnectionId`]. The server greets
//! with `#SPP2`, then reads one action path per line and answers with an SPP
//! frame: escaped data lines closed by `#OK`, or a single `#Error:` line.
//! When the client goes away, every device it used is released.

use crate::device::ConnectionId;
use crate::dispatcher::ActionDispatcher;
use crate::spp;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Control character used on client connections.
pub const MARKER: char = '#';

/// Greeting sent to every client.
pub const GREETING: &str = "#SPP2\n";

/// Accept loop handing connections to the dispatcher.
pub struct LineServer {
    listener: TcpListener,
    dispatcher: ActionDispatcher,
    next_conn: Arc<AtomicU64>,
    idle_timeout: Option<Duration>,
}

impl LineServer {
    /// Bind the listener.
    pub async fn bind(
        addr: SocketAddr,
        dispatcher: ActionDispatcher,
        idle_timeout: Option<Duration>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("Device server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            dispatcher,
            next_conn: Arc::new(AtomicU64::new(1)),
            idle_timeout,
        })
    }

    /// Actual bound address (useful with port 0).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until `shutdown` completes.
    pub async fn run_until<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let conn = self.next_conn.fetch_add(1, Ordering::SeqCst);
                            let dispatcher = self.dispatcher.clone();
                            let idle_timeout = self.idle_timeout;
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_client(
                                    socket,
                                    addr,
                                    conn,
                                    dispatcher,
                                    idle_timeout,
                                )
                                .await
                                {
                                    warn!("Client {} error: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => error!("Accept error: {}", e),
                    }
                }

                _ = &mut shutdown => {
                    info!("Device server stopping");
                    return Ok(());
                }
            }
        }
    }

    /// Serve forever.
    pub async fn run(self) -> io::Result<()> {
        self.run_until(std::future::pending()).await
    }

    async fn handle_client(
        socket: TcpStream,
        addr: SocketAddr,
        conn: ConnectionId,
        dispatcher: ActionDispatcher,
        idle_timeout: Option<Duration>,
    ) -> io::Result<()> {
        info!(conn, "Client connected: {}", addr);
        let result = Self::serve_requests(socket, conn, &dispatcher, idle_timeout).await;
        dispatcher.conn_close(conn).await;
        info!(conn, "Client {} disconnected", addr);
        result
    }

    async fn serve_requests(
        socket: TcpStream,
        conn: ConnectionId,
        dispatcher: &ActionDispatcher,
        idle_timeout: Option<Duration>,
    ) -> io::Result<()> {
        let (reader, mut writer) = socket.into_split();
        let mut lines = BufReader::new(reader).lines();
        writer.write_all(GREETING.as_bytes()).await?;

        loop {
            let next = match idle_timeout {
                Some(limit) => match timeout(limit, lines.next_line()).await {
                    Ok(line) => line?,
                    Err(_) => {
                        debug!(conn, "Idle timeout");
                        return Ok(());
                    }
                },
                None => lines.next_line().await?,
            };
            let Some(line) = next else {
                return Ok(());
            };
            let path = line.trim_end_matches('\r');
            let reply = match dispatcher.run(path, conn).await {
                Ok(answer) => spp::encode_answer(&answer, MARKER),
                Err(e) => {
                    debug!(conn, path, "Action failed: {}", e);
                    spp::encode_error(&e.to_string(), MARKER)
                }
            };
            writer.write_all(reply.as_bytes()).await?;
        }
    }
}
