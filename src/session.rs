//! Per-connection session handling.
//!
//! A session moves through `Admitted -> Handshaking -> Ready -> Closing ->
//! Closed`. Its registry record and admission slot are tied to a
//! `SessionGuard`, so every exit path (exit command, disconnect, I/O fault,
//! panic) closes the connection, stamps the finish time and frees the slot.

use crate::admission::AdmissionSlot;
use crate::channel::LineChannel;
use crate::protocol::{parse_handshake, Command, Response};
use crate::registry::{status_header, ClientRegistry};
use crate::transfer;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, trace, warn};

/// Server-wide state shared by every session.
pub struct SessionContext {
    pub registry: Arc<ClientRegistry>,
    pub repo_root: PathBuf,
    pub started_at: Instant,
    pub team: String,
    pub version: String,
}

impl SessionContext {
    pub fn new(registry: Arc<ClientRegistry>, repo_root: PathBuf, team: String) -> Self {
        Self {
            registry,
            repo_root,
            started_at: Instant::now(),
            team,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Current state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Registered, greeting not yet acknowledged
    Admitted,
    /// Waiting for the client to echo its name
    Handshaking,
    /// Dispatching commands
    Ready,
    /// Leaving the command loop
    Closing,
    Closed,
}

/// What the dispatch loop does after a command.
enum Flow {
    Continue,
    Exit,
}

/// Finishes the registry record and releases the slot when dropped.
struct SessionGuard {
    name: String,
    registry: Arc<ClientRegistry>,
    slot: Option<AdmissionSlot>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.mark_finished(&self.name);
        if let Some(slot) = self.slot.take() {
            slot.release();
        }
        info!(session = %self.name, "Finished");
    }
}

/// Run a session to completion on `stream`.
///
/// `name` must already be registered. The slot is held until this returns.
pub async fn run_session<S>(stream: S, name: String, slot: AdmissionSlot, ctx: Arc<SessionContext>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _guard = SessionGuard {
        name: name.clone(),
        registry: Arc::clone(&ctx.registry),
        slot: Some(slot),
    };

    let mut session = Session::new(stream, name, ctx);
    if let Err(e) = session.run().await {
        warn!(session = %session.name, error = %e, "Session fault");
        // Best effort: the peer may already be gone.
        let _ = session.channel.send_line(&Response::error(&e.to_string())).await;
    }
    session.close().await;
}

/// One client's connection and dispatch state.
pub struct Session<S> {
    name: String,
    channel: LineChannel<S>,
    ctx: Arc<SessionContext>,
    state: SessionState,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, name: String, ctx: Arc<SessionContext>) -> Self {
        Self {
            name,
            channel: LineChannel::new(stream),
            ctx,
            state: SessionState::Admitted,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        trace!(session = %self.name, from = ?self.state, to = ?next, "Session state");
        self.state = next;
    }

    /// Greeting, handshake, welcome, then the command loop.
    pub async fn run(&mut self) -> io::Result<()> {
        self.channel.send_line(&Response::greeting(&self.name)).await?;

        self.transition(SessionState::Handshaking);
        self.handshake().await?;

        self.transition(SessionState::Ready);
        self.channel
            .send_line(&Response::welcome(&self.name, &self.ctx.version))
            .await?;

        let result = self.command_loop().await;
        self.transition(SessionState::Closing);
        result
    }

    async fn handshake(&mut self) -> io::Result<()> {
        let line = self.channel.recv_line().await?;
        match parse_handshake(line.trim()) {
            None => {
                debug!(session = %self.name, line = %line, "Malformed handshake");
                let msg = format!("expected NAME {}", self.name);
                self.channel.send_line(&Response::warn(&msg)).await
            }
            Some(claimed) if claimed != self.name => {
                debug!(session = %self.name, claimed, "Handshake name mismatch");
                let msg = format!("name-mismatch, using {}", self.name);
                self.channel.send_line(&Response::warn(&msg)).await
            }
            Some(_) => Ok(()),
        }
    }

    async fn command_loop(&mut self) -> io::Result<()> {
        loop {
            let line = self.channel.recv_line().await?;
            let line = line.trim();
            if line.is_empty() {
                debug!(session = %self.name, "Peer disconnected");
                return Ok(());
            }

            let command = Command::parse(line);
            trace!(session = %self.name, ?command, "Processing command");

            if let Flow::Exit = self.dispatch(command).await? {
                return Ok(());
            }
        }
    }

    async fn dispatch(&mut self, command: Command) -> io::Result<Flow> {
        match command {
            Command::Exit => {
                self.channel.send_line(Response::BYE).await?;
                return Ok(Flow::Exit);
            }

            Command::Help => self.channel.send_line(Response::HELP).await?,

            Command::Status => {
                let records = self.ctx.registry.snapshot();
                self.channel.send_line(Response::STATUS_BEGIN).await?;
                self.channel.send_line(&status_header()).await?;
                for record in &records {
                    self.channel.send_line(&record.status_row()).await?;
                }
                self.channel.send_line(Response::STATUS_END).await?;
            }

            Command::List => {
                let names = match transfer::list_files(&self.ctx.repo_root).await {
                    Ok(names) => names,
                    Err(e) => vec![format!("<error: {}>", e)],
                };
                self.channel.send_line(Response::FILES_BEGIN).await?;
                for name in &names {
                    self.channel.send_line(name).await?;
                }
                self.channel.send_line(Response::FILES_END).await?;
            }

            Command::Get { name } => {
                transfer::send_file(&mut self.channel, &self.ctx.repo_root, &name).await?
            }

            Command::Ping => self.channel.send_line(Response::PONG).await?,

            Command::Who => {
                let names = self.ctx.registry.active_names();
                self.channel.send_line(&Response::who(&names)).await?;
            }

            Command::Uptime => {
                let secs = self.ctx.uptime_secs();
                self.channel.send_line(&Response::uptime(secs)).await?;
            }

            Command::About => {
                let line = Response::about(&self.ctx.team, &self.ctx.version);
                self.channel.send_line(&line).await?;
            }

            Command::Other(input) => {
                if transfer::resolve_file(&self.ctx.repo_root, &input)
                    .await
                    .is_some()
                {
                    transfer::send_file(&mut self.channel, &self.ctx.repo_root, &input).await?;
                } else {
                    self.channel.send_line(&Response::ack(&input)).await?;
                }
            }
        }

        Ok(Flow::Continue)
    }

    /// Shut down the write half and mark the session closed.
    pub async fn close(&mut self) {
        if let Err(e) = self.channel.shutdown().await {
            trace!(session = %self.name, error = %e, "Shutdown failed");
        }
        self.transition(SessionState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionController;
    use crate::transfer::{receive_file, FileHeader, Verdict};
    use sha2::{Digest, Sha256};
    use std::net::SocketAddr;
    use tempfile::TempDir;
    use tokio::io::{duplex, DuplexStream};
    use tokio::task::JoinHandle;

    struct Harness {
        repo: TempDir,
        registry: Arc<ClientRegistry>,
        gate: AdmissionController,
        ctx: Arc<SessionContext>,
    }

    impl Harness {
        fn new() -> Self {
            let repo = TempDir::new().unwrap();
            let registry = Arc::new(ClientRegistry::new());
            let ctx = Arc::new(SessionContext::new(
                Arc::clone(&registry),
                repo.path().to_path_buf(),
                "Test Team".to_string(),
            ));
            Self {
                repo,
                registry,
                gate: AdmissionController::new(2),
                ctx,
            }
        }

        fn start(&self) -> (String, LineChannel<DuplexStream>, JoinHandle<()>) {
            let slot = self.gate.try_acquire().unwrap();
            let name = self
                .registry
                .admit(SocketAddr::from(([127, 0, 0, 1], 40000)));
            let (server_io, client_io) = duplex(64 * 1024);
            let handle = tokio::spawn(run_session(
                server_io,
                name.clone(),
                slot,
                Arc::clone(&self.ctx),
            ));
            (name, LineChannel::new(client_io), handle)
        }
    }

    async fn handshake(channel: &mut LineChannel<DuplexStream>, name: &str) {
        assert_eq!(channel.recv_line().await.unwrap(), format!("NAME {}", name));
        channel.send_line(&format!("NAME {}", name)).await.unwrap();
        assert_eq!(
            channel.recv_line().await.unwrap(),
            format!("WELCOME {} | SERVER v{}", name, env!("CARGO_PKG_VERSION"))
        );
    }

    async fn request(channel: &mut LineChannel<DuplexStream>, cmd: &str) -> String {
        channel.send_line(cmd).await.unwrap();
        channel.recv_line().await.unwrap()
    }

    #[tokio::test]
    async fn test_simple_commands() {
        let h = Harness::new();
        let (name, mut client, handle) = h.start();
        handshake(&mut client, &name).await;

        assert_eq!(request(&mut client, "ping").await, "PONG");
        assert_eq!(request(&mut client, "PING").await, "PONG");
        assert_eq!(request(&mut client, "help").await, Response::HELP);
        assert_eq!(request(&mut client, "who").await, "WHO Client01");
        assert!(request(&mut client, "uptime").await.starts_with("UPTIME "));
        assert_eq!(
            request(&mut client, "about").await,
            format!("ABOUT Team: Test Team | Version: {}", env!("CARGO_PKG_VERSION"))
        );
        assert_eq!(request(&mut client, "hello there").await, "hello there ACK");
        assert_eq!(request(&mut client, "exit").await, "BYE");

        handle.await.unwrap();
        // Connection closed server-side
        assert_eq!(client.recv_line().await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let h = Harness::new();
        let name = h
            .registry
            .admit(SocketAddr::from(([127, 0, 0, 1], 40001)));
        let (server_io, client_io) = duplex(1024);

        let client = tokio::spawn(async move {
            let mut channel = LineChannel::new(client_io);
            let greeting = channel.recv_line().await.unwrap();
            channel.send_line(&greeting).await.unwrap();
            channel.recv_line().await.unwrap();
            channel.send_line("exit").await.unwrap();
            channel.recv_line().await.unwrap()
        });

        let mut session = Session::new(server_io, name, Arc::clone(&h.ctx));
        assert_eq!(session.state(), SessionState::Admitted);
        session.run().await.unwrap();
        assert_eq!(session.state(), SessionState::Closing);
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);

        assert_eq!(client.await.unwrap(), "BYE");
    }

    #[tokio::test]
    async fn test_cleanup_after_exit() {
        let h = Harness::new();
        let (name, mut client, handle) = h.start();
        assert_eq!(h.gate.available(), 1);

        handshake(&mut client, &name).await;
        assert!(h.registry.active_names().contains(&name));
        assert_eq!(request(&mut client, "EXIT").await, "BYE");
        handle.await.unwrap();

        assert_eq!(h.gate.available(), 2);
        assert!(h.registry.active_names().is_empty());
        assert!(h.registry.get(&name).unwrap().is_finished());
    }

    #[tokio::test]
    async fn test_cleanup_after_io_fault() {
        let h = Harness::new();
        let slot = h.gate.try_acquire().unwrap();
        let name = h
            .registry
            .admit(SocketAddr::from(([127, 0, 0, 1], 40002)));
        assert_eq!(h.gate.available(), 1);

        let welcome = format!(
            "WELCOME {} | SERVER v{}\n",
            name,
            env!("CARGO_PKG_VERSION")
        );
        let mock = tokio_test::io::Builder::new()
            .write(format!("NAME {}\n", name).as_bytes())
            .read(format!("NAME {}\n", name).as_bytes())
            .write(welcome.as_bytes())
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer"))
            .write(b"ERR reset by peer\n")
            .build();

        run_session(mock, name.clone(), slot, Arc::clone(&h.ctx)).await;

        assert_eq!(h.gate.available(), 2);
        assert!(h.registry.get(&name).unwrap().is_finished());
        assert!(!h.registry.active_names().contains(&name));
    }

    #[tokio::test]
    async fn test_cleanup_after_disconnect() {
        let h = Harness::new();
        let (name, mut client, handle) = h.start();
        handshake(&mut client, &name).await;
        drop(client);

        handle.await.unwrap();
        assert_eq!(h.gate.available(), 2);
        assert!(h.registry.get(&name).unwrap().is_finished());
        assert!(!h.registry.active_names().contains(&name));
    }

    #[tokio::test]
    async fn test_handshake_warnings() {
        let h = Harness::new();

        let (name, mut client, handle) = h.start();
        assert_eq!(client.recv_line().await.unwrap(), format!("NAME {}", name));
        client.send_line("NAME Impostor").await.unwrap();
        assert_eq!(
            client.recv_line().await.unwrap(),
            format!("WARN name-mismatch, using {}", name)
        );
        assert!(client.recv_line().await.unwrap().starts_with("WELCOME Client01"));
        assert_eq!(request(&mut client, "exit").await, "BYE");
        handle.await.unwrap();

        let (name, mut client, handle) = h.start();
        assert_eq!(client.recv_line().await.unwrap(), format!("NAME {}", name));
        client.send_line("hello").await.unwrap();
        assert_eq!(
            client.recv_line().await.unwrap(),
            format!("WARN expected NAME {}", name)
        );
        assert!(client.recv_line().await.unwrap().starts_with("WELCOME Client02"));
        assert_eq!(request(&mut client, "who").await, "WHO Client02");
        assert_eq!(request(&mut client, "exit").await, "BYE");
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_status_and_list() {
        let h = Harness::new();
        std::fs::write(h.repo.path().join("b.txt"), b"bee").unwrap();
        std::fs::write(h.repo.path().join("a.txt"), b"ay").unwrap();

        let (first, mut client1, handle1) = h.start();
        handshake(&mut client1, &first).await;
        assert_eq!(request(&mut client1, "exit").await, "BYE");
        handle1.await.unwrap();

        let (name, mut client, handle) = h.start();
        handshake(&mut client, &name).await;

        assert_eq!(request(&mut client, "status").await, "STATUS BEGIN");
        assert_eq!(client.recv_line().await.unwrap(), status_header());
        let row1 = client.recv_line().await.unwrap();
        let row2 = client.recv_line().await.unwrap();
        assert!(row1.starts_with("Client01"));
        assert!(!row1.contains(" - "));
        assert!(row2.starts_with("Client02"));
        assert!(row2.contains(" - "));
        assert_eq!(client.recv_line().await.unwrap(), "STATUS END");

        assert_eq!(request(&mut client, "list").await, "FILES BEGIN");
        assert_eq!(client.recv_line().await.unwrap(), "a.txt");
        assert_eq!(client.recv_line().await.unwrap(), "b.txt");
        assert_eq!(client.recv_line().await.unwrap(), "FILES END");

        assert_eq!(request(&mut client, "exit").await, "BYE");
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_file_requests() {
        let h = Harness::new();
        let downloads = TempDir::new().unwrap();
        let data = b"line one\nline two\n".repeat(500);
        std::fs::write(h.repo.path().join("notes.txt"), &data).unwrap();

        let (name, mut client, handle) = h.start();
        handshake(&mut client, &name).await;

        for cmd in ["get notes.txt", "notes.txt"] {
            let header = FileHeader::parse(&request(&mut client, cmd).await).unwrap();
            assert_eq!(header.size, data.len() as u64);
            assert_eq!(header.digest, hex::encode(Sha256::digest(&data)));
            let report = receive_file(&mut client, &header, downloads.path())
                .await
                .unwrap();
            assert_eq!(report.verdict, Verdict::Pass);
        }

        assert_eq!(
            request(&mut client, "get ghost.txt").await,
            "FILEERR not-found ghost.txt"
        );
        assert_eq!(request(&mut client, "get ../notes.txt").await, "FILEERR invalid-name");

        std::fs::write(h.repo.path().join("my file.txt"), b"abc").unwrap();
        let header = FileHeader::parse(&request(&mut client, "get my file.txt").await).unwrap();
        assert_eq!(header.name, "my file.txt");
        let report = receive_file(&mut client, &header, downloads.path())
            .await
            .unwrap();
        assert_eq!(report.verdict, Verdict::Pass);
        assert_eq!(request(&mut client, "FILE x").await, "FILE x ACK");
        // Unsafe bare names never resolve, even if the target exists elsewhere
        assert_eq!(request(&mut client, "../notes.txt").await, "../notes.txt ACK");
        assert_eq!(request(&mut client, "exit").await, "BYE");
        handle.await.unwrap();
    }
}
