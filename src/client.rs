//! Protocol client.
//!
//! Performs the greeting/handshake exchange and classifies each reply by its
//! first line, pulling the rest of multi-line replies and file payloads off
//! the wire.

use crate::channel::LineChannel;
use crate::protocol::{parse_handshake, Response};
use crate::transfer::{self, FileHeader, ReceiveReport, TransferError};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::debug;

/// One server reply.
#[derive(Debug)]
pub enum Reply {
    /// Any single-line reply (PONG, WHO, ACK, FILEERR, WARN, ERR, ...)
    Line(String),
    /// Status header row followed by one row per session
    Status(Vec<String>),
    /// File names from `list`
    Files(Vec<String>),
    /// A received file
    File(ReceiveReport),
    /// Server acknowledged `exit`
    Bye(String),
}

/// Result of connecting.
pub enum Connect<S> {
    Connected(Client<S>),
    ServerFull,
}

/// Client errors
#[derive(Debug)]
pub enum ClientError {
    /// Greeting was neither `NAME ...` nor `SERVER FULL`
    UnexpectedGreeting(String),
    /// Server closed the connection mid-reply
    Disconnected,
    Transfer(TransferError),
    Io(io::Error),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::UnexpectedGreeting(line) => write!(f, "Unexpected greeting: {}", line),
            ClientError::Disconnected => write!(f, "Server closed the connection"),
            ClientError::Transfer(e) => write!(f, "Transfer failed: {}", e),
            ClientError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        ClientError::Io(e)
    }
}

impl From<TransferError> for ClientError {
    fn from(e: TransferError) -> Self {
        ClientError::Transfer(e)
    }
}

/// A connected, handshaken session.
pub struct Client<S> {
    channel: LineChannel<S>,
    name: String,
    welcome: String,
    downloads: PathBuf,
}

impl Client<TcpStream> {
    /// Connect over TCP and complete the handshake.
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
        downloads: &Path,
    ) -> Result<Connect<TcpStream>, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        Self::handshake(stream, downloads).await
    }
}

impl<S> Client<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Run the greeting exchange on an already-open stream.
    pub async fn handshake(stream: S, downloads: &Path) -> Result<Connect<S>, ClientError> {
        let mut channel = LineChannel::new(stream);

        let greeting = channel.recv_line().await?;
        if greeting == Response::SERVER_FULL {
            return Ok(Connect::ServerFull);
        }
        let name = match parse_handshake(&greeting) {
            Some(name) => name.to_string(),
            None => return Err(ClientError::UnexpectedGreeting(greeting)),
        };

        channel.send_line(&Response::greeting(&name)).await?;
        let welcome = channel.recv_line().await?;
        debug!(session = %name, welcome = %welcome, "Handshake complete");

        Ok(Connect::Connected(Client {
            channel,
            name,
            welcome,
            downloads: downloads.to_path_buf(),
        }))
    }

    /// Name assigned by the server.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn welcome(&self) -> &str {
        &self.welcome
    }

    /// Send one command and read its complete reply.
    pub async fn request(&mut self, command: &str) -> Result<Reply, ClientError> {
        self.channel.send_line(command).await?;

        let first = self.channel.recv_line().await?;
        if command.trim().eq_ignore_ascii_case("exit") {
            return Ok(Reply::Bye(first));
        }

        if first == Response::STATUS_BEGIN {
            return self.read_block(Response::STATUS_END).await.map(Reply::Status);
        }
        if first == Response::FILES_BEGIN {
            return self.read_block(Response::FILES_END).await.map(Reply::Files);
        }
        // Echoed input such as `FILE x ACK` also starts with the header tag.
        if first.starts_with("FILE ") {
            match FileHeader::parse(&first) {
                Ok(header) => {
                    let report =
                        transfer::receive_file(&mut self.channel, &header, &self.downloads).await?;
                    return Ok(Reply::File(report));
                }
                Err(e) => debug!(error = %e, "Reply is not a transfer header"),
            }
        }
        if first.is_empty() {
            return Err(ClientError::Disconnected);
        }

        Ok(Reply::Line(first))
    }

    async fn read_block(&mut self, end: &str) -> Result<Vec<String>, ClientError> {
        let mut lines = Vec::new();
        loop {
            let line = self.channel.recv_line().await?;
            if line == end {
                return Ok(lines);
            }
            if line.is_empty() {
                return Err(ClientError::Disconnected);
            }
            lines.push(line);
        }
    }
}
