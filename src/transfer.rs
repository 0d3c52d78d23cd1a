//! File transfer framing.
//!
//! A transfer is a header line, exactly `size` raw bytes, and a trailer:
//!
//! ```text
//! FILE <name> <size> <sha256-hex>\n
//! <size bytes>
//! FILE DONE\n
//! ```
//!
//! The sender hashes the whole file before the header goes out, so a read
//! failure is reported as `FILEERR` before any payload is on the wire. The
//! receiver hashes incrementally and reports a local PASS/FAIL verdict.

use crate::channel::LineChannel;
use bytes::BytesMut;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Chunk size for hashing and streaming.
pub const CHUNK_SIZE: usize = 4096;

/// Trailer line that closes every transfer.
pub const TRAILER: &str = "FILE DONE";

const HEADER_TAG: &str = "FILE";
const DIGEST_HEX_LEN: usize = 64;

/// Parsed transfer header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub name: String,
    pub size: u64,
    pub digest: String,
}

impl FileHeader {
    /// Parse a `FILE <name> <size> <digest>` line.
    ///
    /// Size and digest are taken from the right, so the name may contain spaces.
    pub fn parse(line: &str) -> Result<Self, TransferError> {
        let bad = || TransferError::BadHeader(line.to_string());

        let rest = line
            .strip_prefix(HEADER_TAG)
            .and_then(|r| r.strip_prefix(' '))
            .ok_or_else(bad)?;

        let mut fields = rest.trim_end().rsplitn(3, ' ');
        let (digest, size, name) = match (fields.next(), fields.next(), fields.next()) {
            (Some(digest), Some(size), Some(name)) if !name.trim().is_empty() => {
                (digest, size, name.trim())
            }
            _ => return Err(bad()),
        };

        let size = size.parse::<u64>().map_err(|_| bad())?;

        if digest.len() != DIGEST_HEX_LEN || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(bad());
        }

        Ok(Self {
            name: name.to_string(),
            size,
            digest: digest.to_ascii_lowercase(),
        })
    }
}

impl fmt::Display for FileHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} {}", HEADER_TAG, self.name, self.size, self.digest)
    }
}

/// Transfer errors
#[derive(Debug)]
pub enum TransferError {
    /// Header line did not match `FILE <name> <size> <digest>`
    BadHeader(String),
    /// File name would escape the target directory
    UnsafeName(String),
    Io(io::Error),
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::BadHeader(line) => write!(f, "Bad FILE header: {}", line),
            TransferError::UnsafeName(name) => write!(f, "Unsafe file name: {}", name),
            TransferError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for TransferError {}

impl From<io::Error> for TransferError {
    fn from(e: io::Error) -> Self {
        TransferError::Io(e)
    }
}

/// Whether `name` is a single flat path segment.
pub fn is_safe_name(name: &str) -> bool {
    !name.is_empty() && !name.contains("..") && !name.contains('/') && !name.contains('\\')
}

/// Resolve `name` inside `root` if it is safe and names a regular file.
pub async fn resolve_file(root: &Path, name: &str) -> Option<PathBuf> {
    if !is_safe_name(name) {
        return None;
    }
    let path = root.join(name);
    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => Some(path),
        _ => None,
    }
}

/// Size and SHA-256 of a file in a single sequential pass.
pub async fn digest_file(path: &Path) -> io::Result<(u64, String)> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut size = 0u64;

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }

    Ok((size, hex::encode(hasher.finalize())))
}

/// Regular files directly under `root`, sorted by name.
pub async fn list_files(root: &Path) -> io::Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(root).await?;
    let mut names = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }

    names.sort();
    Ok(names)
}

/// Stream `name` from `root` to the peer.
///
/// File-side problems are reported to the peer as a single `FILEERR` line and
/// return `Ok`. Only failures writing to the channel are returned as errors.
pub async fn send_file<S>(channel: &mut LineChannel<S>, root: &Path, name: &str) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if !is_safe_name(name) {
        debug!(name, "Rejected unsafe file name");
        return channel.send_line("FILEERR invalid-name").await;
    }

    let path = match resolve_file(root, name).await {
        Some(path) => path,
        None => return channel.send_line(&format!("FILEERR not-found {}", name)).await,
    };

    let (size, digest) = match digest_file(&path).await {
        Ok(result) => result,
        Err(e) => return channel.send_line(&format!("FILEERR {}", e)).await,
    };

    let mut file = match File::open(&path).await {
        Ok(file) => file,
        Err(e) => return channel.send_line(&format!("FILEERR {}", e)).await,
    };

    let header = FileHeader {
        name: name.to_string(),
        size,
        digest,
    };
    channel.send_line(&header.to_string()).await?;

    // Never send more than the header promised, even if the file grew.
    let mut reader = (&mut file).take(size);
    let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
    let mut sent = 0u64;

    loop {
        buf.clear();
        let n = match reader.read_buf(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                warn!(name, error = %e, "Read failed mid-transfer");
                return channel.send_line(&format!("FILEERR {}", e)).await;
            }
        };
        if n == 0 {
            break;
        }
        channel.send_raw(&buf).await?;
        sent += n as u64;
    }

    if sent < size {
        warn!(name, sent, size, "File shrank during transfer");
        return channel
            .send_line(&format!("FILEERR short-read {} of {} bytes", sent, size))
            .await;
    }

    channel.send_line(TRAILER).await?;
    info!(
        name,
        size,
        sha256 = &header.digest[..12],
        "Sent file"
    );
    Ok(())
}

/// Integrity verdict for a received file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Pass => f.write_str("PASS"),
            Verdict::Fail => f.write_str("FAIL"),
        }
    }
}

/// Outcome of receiving one file.
#[derive(Debug, Clone)]
pub struct ReceiveReport {
    pub path: PathBuf,
    pub header: FileHeader,
    pub received: u64,
    pub computed_digest: String,
    pub verdict: Verdict,
}

impl ReceiveReport {
    /// Whether all advertised bytes arrived before the stream closed.
    pub fn is_complete(&self) -> bool {
        self.received == self.header.size
    }
}

/// Receive the payload announced by `header` into `dest_dir`.
///
/// A stream that closes early still leaves the partial file on disk; the
/// verdict is then `Fail`.
pub async fn receive_file<S>(
    channel: &mut LineChannel<S>,
    header: &FileHeader,
    dest_dir: &Path,
) -> Result<ReceiveReport, TransferError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if !is_safe_name(&header.name) {
        return Err(TransferError::UnsafeName(header.name.clone()));
    }

    let path = dest_dir.join(&header.name);
    let mut out = File::create(&path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut remaining = header.size;

    while remaining > 0 {
        let want = remaining.min(CHUNK_SIZE as u64) as usize;
        let n = channel.recv_raw(&mut buf[..want]).await?;
        if n == 0 {
            warn!(name = %header.name, remaining, "Stream closed mid-transfer");
            break;
        }
        out.write_all(&buf[..n]).await?;
        hasher.update(&buf[..n]);
        remaining -= n as u64;
    }
    out.flush().await?;

    let trailer = channel.recv_line().await?;
    if trailer != TRAILER {
        debug!(trailer = %trailer, "Unexpected transfer trailer");
    }

    let received = header.size - remaining;
    let computed_digest = hex::encode(hasher.finalize());
    let verdict = if remaining == 0 && computed_digest == header.digest {
        Verdict::Pass
    } else {
        Verdict::Fail
    };

    Ok(ReceiveReport {
        path,
        header: header.clone(),
        received,
        computed_digest,
        verdict,
    })
}
