//! FTP transport over a single tokio control connection.
//!
//! Data connections are passive (EPSV, falling back to PASV) and always
//! dialled to the control peer address, which keeps servers behind NAT
//! reachable. The control session is re-opened lazily after a connection
//! level failure so that a retried transfer gets a fresh session.
//!
//! Every read and write on either connection is bounded by the I/O timeout.
//! A stalled server surfaces as `TimedOut`, which also discards the session.

use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::fs::backend::{ByteReader, ByteWriter, Transport, TransportError};
use crate::fs::listing::{parse_epsv, parse_list_line, parse_mlsx_line, parse_pasv};
use crate::fs::types::{split_remote, FileEntry};

/// Connection settings for [`FtpTransport`].
#[derive(Debug, Clone)]
pub struct FtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub connect_timeout: Duration,
    /// Longest wait for a reply line or a chunk of data.
    pub io_timeout: Duration,
}

/// One server reply, possibly spanning several lines.
#[derive(Debug, Clone)]
struct Reply {
    code: u16,
    lines: Vec<String>,
}

impl Reply {
    fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    fn is_preliminary(&self) -> bool {
        (100..200).contains(&self.code)
    }

    /// Command not recognised or not implemented.
    fn is_unsupported(&self) -> bool {
        matches!(self.code, 500 | 502 | 504)
    }

    fn text(&self) -> String {
        self.lines.join("\n")
    }

    fn into_error(self, path: &str) -> TransportError {
        match self.code {
            450 | 550 if looks_missing(&self.text()) => TransportError::NotFound(path.to_string()),
            _ => TransportError::Rejected {
                code: self.code,
                message: self.text(),
            },
        }
    }
}

fn looks_missing(text: &str) -> bool {
    let text = text.to_ascii_lowercase();
    text.contains("no such") || text.contains("not found") || text.contains("does not exist")
        || text.contains("can't check for file existence") || text.contains("not a regular file")
}

/// Authenticated control connection.
struct FtpSession {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer: IpAddr,
    io_timeout: Duration,
    use_epsv: bool,
    use_mlsx: bool,
}

impl FtpSession {
    async fn open(settings: &FtpSettings) -> Result<Self, TransportError> {
        let address = (settings.host.as_str(), settings.port);
        let stream = bounded(settings.connect_timeout, "control connect", TcpStream::connect(address)).await?;
        let peer = stream.peer_addr()?.ip();
        let (read_half, write_half) = stream.into_split();

        let mut session = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            peer,
            io_timeout: settings.io_timeout,
            use_epsv: true,
            use_mlsx: true,
        };

        let greeting = session.read_reply().await?;
        if greeting.code != 220 {
            return Err(greeting.into_error(&settings.host));
        }

        session.login(&settings.username, &settings.password).await?;
        session.expect("TYPE I", "TYPE I").await?;
        debug!(host = %settings.host, port = settings.port, "FTP session established");
        Ok(session)
    }

    async fn login(&mut self, username: &str, password: &str) -> Result<(), TransportError> {
        let reply = self.command(&format!("USER {username}")).await?;
        let reply = match reply.code {
            230 => return Ok(()),
            331 | 332 => self.command(&format!("PASS {password}")).await?,
            _ => return Err(reply.into_error(username)),
        };
        match reply.code {
            230 | 202 => Ok(()),
            _ => Err(reply.into_error(username)),
        }
    }

    async fn read_reply(&mut self) -> Result<Reply, TransportError> {
        let first = self.read_line().await?;
        let code = parse_code(&first)?;
        let mut lines = vec![first[3..].trim_start_matches([' ', '-']).to_string()];

        if first.as_bytes().get(3) == Some(&b'-') {
            let terminator = format!("{code} ");
            loop {
                let line = self.read_line().await?;
                if line.starts_with(&terminator) || line == code.to_string() {
                    lines.push(line[3..].trim_start().to_string());
                    break;
                }
                lines.push(line);
            }
        }

        trace!(code, "< {}", lines.join(" | "));
        Ok(Reply { code, lines })
    }

    async fn read_line(&mut self) -> Result<String, TransportError> {
        let mut line = String::new();
        let read = bounded(self.io_timeout, "reply", self.reader.read_line(&mut line)).await?;
        if read == 0 {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "control connection closed by server",
            )));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    async fn command(&mut self, command: &str) -> Result<Reply, TransportError> {
        if command.starts_with("PASS ") {
            trace!("> PASS ****");
        } else {
            trace!("> {}", command);
        }
        let line = format!("{command}\r\n");
        let writer = &mut self.writer;
        bounded(self.io_timeout, "command", async move {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        })
        .await?;
        self.read_reply().await
    }

    /// Send `command` and require a 2xx reply.
    async fn expect(&mut self, command: &str, path: &str) -> Result<Reply, TransportError> {
        let reply = self.command(command).await?;
        if reply.is_success() {
            Ok(reply)
        } else {
            Err(reply.into_error(path))
        }
    }

    async fn open_data(&mut self) -> Result<TcpStream, TransportError> {
        if self.use_epsv {
            let reply = self.command("EPSV").await?;
            if reply.code == 229 {
                let port = parse_epsv(&reply.text())
                    .ok_or_else(|| TransportError::Protocol(format!("bad EPSV reply: {}", reply.text())))?;
                return self.connect_data(port).await;
            }
            if !reply.is_unsupported() {
                return Err(reply.into_error("EPSV"));
            }
            debug!("server does not support EPSV, falling back to PASV");
            self.use_epsv = false;
        }

        let reply = self.command("PASV").await?;
        if reply.code != 227 {
            return Err(reply.into_error("PASV"));
        }
        let (_, port) = parse_pasv(&reply.text())
            .ok_or_else(|| TransportError::Protocol(format!("bad PASV reply: {}", reply.text())))?;
        self.connect_data(port).await
    }

    async fn connect_data(&self, port: u16) -> Result<TcpStream, TransportError> {
        bounded(self.io_timeout, "data connect", TcpStream::connect((self.peer, port))).await
    }

    /// Start a transfer command on a fresh data connection.
    async fn start_transfer(&mut self, command: &str, path: &str) -> Result<TcpStream, TransportError> {
        let data = self.open_data().await?;
        let reply = self.command(command).await?;
        if !reply.is_preliminary() {
            return Err(reply.into_error(path));
        }
        Ok(data)
    }

    async fn finish_transfer(&mut self, path: &str) -> Result<(), TransportError> {
        let reply = self.read_reply().await?;
        if reply.is_success() {
            Ok(())
        } else {
            Err(reply.into_error(path))
        }
    }

    async fn store(&mut self, path: &str, reader: &mut ByteReader<'_>) -> Result<u64, TransportError> {
        let mut data = self.start_transfer(&format!("STOR {path}"), path).await?;
        let bytes = copy_bounded(reader, &mut data, self.io_timeout).await?;
        bounded(self.io_timeout, "data shutdown", data.shutdown()).await?;
        drop(data);
        self.finish_transfer(path).await?;
        Ok(bytes)
    }

    async fn retrieve(&mut self, path: &str, writer: &mut ByteWriter<'_>) -> Result<u64, TransportError> {
        let mut data = self.start_transfer(&format!("RETR {path}"), path).await?;
        let bytes = copy_bounded(&mut data, &mut *writer, self.io_timeout).await?;
        bounded(self.io_timeout, "flush", writer.flush()).await?;
        drop(data);
        self.finish_transfer(path).await?;
        Ok(bytes)
    }

    async fn read_listing(&mut self, command: &str, path: &str) -> Result<Vec<String>, TransportError> {
        let mut data = self.start_transfer(command, path).await?;
        let mut raw = Vec::new();
        copy_bounded(&mut data, &mut raw, self.io_timeout).await?;
        drop(data);
        self.finish_transfer(path).await?;

        Ok(String::from_utf8_lossy(&raw)
            .lines()
            .map(|line| line.trim_end_matches('\r').to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }

    async fn list_dir(&mut self, path: &str) -> Result<Vec<FileEntry>, TransportError> {
        if self.use_mlsx {
            match self.read_listing(&format!("MLSD {path}"), path).await {
                Ok(lines) => return Ok(lines.iter().filter_map(|l| parse_mlsx_line(l)).collect()),
                Err(TransportError::Rejected { code: 500 | 502 | 504, .. }) => {
                    debug!("server does not support MLSD, falling back to LIST");
                    self.use_mlsx = false;
                }
                Err(err) => return Err(err),
            }
        }

        let now = Utc::now();
        let lines = self.read_listing(&format!("LIST {path}"), path).await?;
        Ok(lines.iter().filter_map(|l| parse_list_line(l, now)).collect())
    }

    async fn stat(&mut self, path: &str) -> Result<FileEntry, TransportError> {
        if self.use_mlsx {
            let reply = self.command(&format!("MLST {path}")).await?;
            if reply.is_success() {
                return reply
                    .lines
                    .iter()
                    .find(|line| line.contains('=') && line.contains(';'))
                    .and_then(|line| parse_mlsx_line(line))
                    .ok_or_else(|| TransportError::Protocol(format!("bad MLST reply: {}", reply.text())));
            }
            if !reply.is_unsupported() {
                return Err(match reply.code {
                    550 => TransportError::NotFound(path.to_string()),
                    _ => reply.into_error(path),
                });
            }
            self.use_mlsx = false;
        }

        let (parent, name) = split_remote(path);
        let entries = match self.list_dir(parent).await {
            Ok(entries) => entries,
            Err(TransportError::Rejected { code: 450 | 550, .. }) => {
                return Err(TransportError::NotFound(path.to_string()))
            }
            Err(err) => return Err(err),
        };
        entries
            .into_iter()
            .find(|entry| entry.name == name)
            .ok_or_else(|| TransportError::NotFound(path.to_string()))
    }

    async fn delete(&mut self, path: &str) -> Result<(), TransportError> {
        let reply = self.command(&format!("DELE {path}")).await?;
        if reply.is_success() {
            return Ok(());
        }
        if reply.code != 550 {
            return Err(reply.into_error(path));
        }

        // DELE refuses directories on most servers
        let rmd = self.command(&format!("RMD {path}")).await?;
        if rmd.is_success() {
            Ok(())
        } else {
            Err(reply.into_error(path))
        }
    }

    async fn make_dir(&mut self, path: &str) -> Result<(), TransportError> {
        let reply = self.command(&format!("MKD {path}")).await?;
        if reply.is_success() {
            return Ok(());
        }
        if reply.text().to_ascii_lowercase().contains("exists") {
            return Err(TransportError::AlreadyExists(path.to_string()));
        }
        Err(TransportError::Rejected {
            code: reply.code,
            message: reply.text(),
        })
    }

    async fn quit(&mut self) {
        if let Err(err) = self.command("QUIT").await {
            debug!(error = %err, "QUIT failed");
        }
    }
}

/// Run an I/O future, turning expiry of `limit` into `TimedOut`.
async fn bounded<T>(
    limit: Duration,
    what: &str,
    operation: impl Future<Output = io::Result<T>>,
) -> Result<T, TransportError> {
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(TransportError::Io(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("{what} timed out after {limit:?}"),
        ))),
    }
}

/// Like `tokio::io::copy`, but every chunk must move within `idle`.
async fn copy_bounded<R, W>(reader: &mut R, writer: &mut W, idle: Duration) -> Result<u64, TransportError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buffer = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let read = bounded(idle, "data read", reader.read(&mut buffer)).await?;
        if read == 0 {
            return Ok(total);
        }
        bounded(idle, "data write", writer.write_all(&buffer[..read])).await?;
        total += read as u64;
    }
}

fn parse_code(line: &str) -> Result<u16, TransportError> {
    line.get(..3)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| TransportError::Protocol(format!("malformed reply line: {line:?}")))
}

/// Errors after which the control connection can no longer be trusted.
fn breaks_session(err: &TransportError) -> bool {
    matches!(err, TransportError::Io(_) | TransportError::Protocol(_))
        || matches!(err, TransportError::Rejected { code: 421, .. })
}

/// [`Transport`] backed by a remote FTP server.
pub struct FtpTransport {
    settings: FtpSettings,
    session: Mutex<Option<FtpSession>>,
}

impl FtpTransport {
    /// Connect and authenticate. Fails fast so configuration problems
    /// surface before any syncing starts.
    pub async fn connect(settings: FtpSettings) -> Result<Self, TransportError> {
        let session = FtpSession::open(&settings).await?;
        Ok(Self {
            settings,
            session: Mutex::new(Some(session)),
        })
    }

    async fn session(&self) -> Result<MutexGuard<'_, Option<FtpSession>>, TransportError> {
        let mut guard = self.session.lock().await;
        if guard.is_none() {
            warn!(host = %self.settings.host, "reconnecting to FTP server");
            *guard = Some(FtpSession::open(&self.settings).await?);
        }
        Ok(guard)
    }

    /// Close the control connection politely.
    pub async fn quit(&self) {
        let mut guard = self.session.lock().await;
        if let Some(mut session) = guard.take() {
            session.quit().await;
        }
    }
}

/// Put the session back unless `result` shows the connection is broken.
fn settle<T>(
    slot: &mut Option<FtpSession>,
    session: FtpSession,
    result: Result<T, TransportError>,
) -> Result<T, TransportError> {
    match &result {
        Err(err) if breaks_session(err) => debug!(error = %err, "discarding FTP session"),
        _ => *slot = Some(session),
    }
    result
}

// The session is out of its slot while a command runs, so a call that is
// dropped halfway leaves no half-read reply behind for the next caller.
macro_rules! with_session {
    ($self:ident, |$session:ident| $body:expr) => {{
        let mut guard = $self.session().await?;
        match guard.take() {
            Some(mut $session) => {
                let result = $body.await;
                settle(&mut *guard, $session, result)
            }
            None => Err(TransportError::Protocol("no FTP session".to_string())),
        }
    }};
}

#[async_trait]
impl Transport for FtpTransport {
    async fn list_dir(&self, path: &str) -> Result<Vec<FileEntry>, TransportError> {
        with_session!(self, |session| session.list_dir(path))
    }

    async fn stat(&self, path: &str) -> Result<FileEntry, TransportError> {
        with_session!(self, |session| session.stat(path))
    }

    async fn store(&self, path: &str, reader: &mut ByteReader<'_>) -> Result<u64, TransportError> {
        with_session!(self, |session| session.store(path, reader))
    }

    async fn retrieve(&self, path: &str, writer: &mut ByteWriter<'_>) -> Result<u64, TransportError> {
        with_session!(self, |session| session.retrieve(path, writer))
    }

    async fn delete(&self, path: &str) -> Result<(), TransportError> {
        with_session!(self, |session| session.delete(path))
    }

    async fn make_dir(&self, path: &str) -> Result<(), TransportError> {
        with_session!(self, |session| session.make_dir(path))
    }

    fn describe(&self) -> String {
        format!("ftp://{}@{}:{}", self.settings.username, self.settings.host, self.settings.port)
    }
}
