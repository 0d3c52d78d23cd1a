//! TCP acceptor for line-protocol sessions.
//!
//! Accepts connections, applies admission control and spawns one task per
//! admitted session. Rejected connections get a single `SERVER FULL` line and
//! are closed before any handshake or registry bookkeeping happens.

use crate::admission::AdmissionController;
use crate::config::Config;
use crate::protocol::Response;
use crate::registry::ClientRegistry;
use crate::session::{run_session, SessionContext};
use std::future::Future;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Listen backlog
const BACKLOG: i32 = 1024;

/// Server instance
pub struct Server {
    config: Config,
    registry: Arc<ClientRegistry>,
    admission: AdmissionController,
    ctx: Arc<SessionContext>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(ClientRegistry::new());
        let admission = AdmissionController::new(config.max_sessions);
        let ctx = Arc::new(SessionContext::new(
            Arc::clone(&registry),
            config.repo_root.clone(),
            config.team.clone(),
        ));

        Server {
            config,
            registry,
            admission,
            ctx,
        }
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// Create the repository root and bind the configured address.
    pub fn bind(&self) -> io::Result<TcpListener> {
        std::fs::create_dir_all(&self.config.repo_root)?;

        let addr = self
            .config
            .listen_addr()
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "listen address did not resolve")
            })?;

        let listener = create_listener(addr)?;
        TcpListener::from_std(listener)
    }

    /// Accept connections forever.
    pub async fn run(&self, listener: TcpListener) -> io::Result<()> {
        self.run_until(listener, std::future::pending()).await
    }

    /// Accept connections until `shutdown` resolves.
    ///
    /// Sessions already running are left to finish on their own.
    pub async fn run_until<F>(&self, listener: TcpListener, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            address = %listener.local_addr()?,
            repo = %self.config.repo_root.display(),
            max_sessions = self.admission.capacity(),
            "Server listening"
        );

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!(active = self.admission.in_use(), "Shutting down, no longer accepting");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => self.admit(stream, addr),
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }
        }
    }

    fn admit(&self, stream: TcpStream, addr: SocketAddr) {
        let slot = match self.admission.try_acquire() {
            Some(slot) => slot,
            None => {
                warn!(peer = %addr, "Rejecting connection, server full");
                tokio::spawn(reject(stream));
                return;
            }
        };

        let name = self.registry.admit(addr);
        info!(session = %name, peer = %addr, "Connected");

        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(run_session(stream, name, slot, ctx));
    }
}

/// Tell the peer the server is full and close.
async fn reject(mut stream: TcpStream) {
    let line = format!("{}\n", Response::SERVER_FULL);
    if let Err(e) = stream.write_all(line.as_bytes()).await {
        debug!(error = %e, "Failed to send rejection");
    }
    let _ = stream.shutdown().await;
}

fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}
