use ssh2::{ErrorCode, FileStat, Session, Sftp};
use std::fs;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Component, Path};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tracing::{debug, error, info, warn};

use crate::config_manager::{Credential, ServerTarget};
use crate::error::TransferError;
use crate::sync_engine::format_size;

/// libssh2 status for a missing remote path.
const SFTP_NO_SUCH_FILE: i32 = 2;

/// Remote mtimes are whole seconds, so anything closer than this counts as equal.
const MTIME_TOLERANCE_SECS: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStat {
    pub size: u64,
    pub mtime: u64,
    pub is_dir: bool,
}

/// The SFTP operations a backup needs. Remote paths always use `/`.
pub trait RemoteFs: Send {
    /// `Ok(None)` when the path does not exist.
    fn stat(&self, path: &str) -> Result<Option<RemoteStat>, TransferError>;

    fn mkdir(&self, path: &str) -> Result<(), TransferError>;

    /// Streams `local` to `remote`, returning the number of bytes written.
    fn upload(&self, local: &Path, remote: &str) -> Result<u64, TransferError>;

    fn set_times(&self, remote: &str, atime: u64, mtime: u64) -> Result<(), TransferError>;

    fn close(&mut self) {}
}

/// Opens authenticated sessions against a server.
pub trait Connector: Send + Sync {
    fn connect(&self, target: &ServerTarget) -> Result<Box<dyn RemoteFs>, TransferError>;
}

/// Real SSH/SFTP connector backed by libssh2.
#[derive(Debug, Clone)]
pub struct SftpConnector {
    timeout: Duration,
}

impl SftpConnector {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SftpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl Connector for SftpConnector {
    fn connect(&self, target: &ServerTarget) -> Result<Box<dyn RemoteFs>, TransferError> {
        debug!(host = %target.host, port = target.port, "connecting");

        let addr = target
            .address()
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| TransferError::Remote(format!("cannot resolve {}", target.address())))?;
        let tcp = TcpStream::connect_timeout(&addr, self.timeout)?;
        tcp.set_read_timeout(Some(self.timeout))?;
        tcp.set_write_timeout(Some(self.timeout))?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.set_timeout(u32::try_from(self.timeout.as_millis()).unwrap_or(u32::MAX));
        session.handshake()?;

        let auth_failed = |e: ssh2::Error| TransferError::Authentication {
            host: target.host.clone(),
            username: target.username.clone(),
            reason: e.to_string(),
        };

        match target.credential() {
            Credential::KeyFile(key_path) => {
                debug!(key = %key_path.display(), "authenticating with key file");
                if !key_path.exists() {
                    return Err(TransferError::KeyFileMissing(key_path));
                }
                session
                    .userauth_pubkey_file(&target.username, None, &key_path, None)
                    .map_err(auth_failed)?;
            }
            Credential::Password(password) => {
                debug!("authenticating with password");
                session
                    .userauth_password(&target.username, &password)
                    .map_err(auth_failed)?;
            }
        }

        if !session.authenticated() {
            return Err(TransferError::Authentication {
                host: target.host.clone(),
                username: target.username.clone(),
                reason: "server did not accept the credentials".to_string(),
            });
        }

        let sftp = session.sftp()?;
        Ok(Box::new(SftpSession {
            session,
            sftp,
            closed: false,
        }))
    }
}

struct SftpSession {
    session: Session,
    sftp: Sftp,
    closed: bool,
}

impl RemoteFs for SftpSession {
    fn stat(&self, path: &str) -> Result<Option<RemoteStat>, TransferError> {
        match self.sftp.stat(Path::new(path)) {
            Ok(stat) => Ok(Some(RemoteStat {
                size: stat.size.unwrap_or(0),
                mtime: stat.mtime.unwrap_or(0),
                is_dir: stat.is_dir(),
            })),
            Err(e) if matches!(e.code(), ErrorCode::SFTP(SFTP_NO_SUCH_FILE)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn mkdir(&self, path: &str) -> Result<(), TransferError> {
        self.sftp.mkdir(Path::new(path), 0o755)?;
        Ok(())
    }

    fn upload(&self, local: &Path, remote: &str) -> Result<u64, TransferError> {
        let mut local_file = fs::File::open(local)?;
        let mut remote_file = self.sftp.create(Path::new(remote))?;
        let written = io::copy(&mut local_file, &mut remote_file)?;
        Ok(written)
    }

    fn set_times(&self, remote: &str, atime: u64, mtime: u64) -> Result<(), TransferError> {
        self.sftp.setstat(
            Path::new(remote),
            FileStat {
                size: None,
                uid: None,
                gid: None,
                perm: None,
                atime: Some(atime),
                mtime: Some(mtime),
            },
        )?;
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let _ = self.session.disconnect(None, "backup finished", None);
        }
    }
}

impl Drop for SftpSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Result of one `upload_file` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded { bytes: u64 },
    /// The remote copy already matches the local file.
    Skipped,
    Failed(String),
}

impl UploadOutcome {
    pub fn succeeded(&self) -> bool {
        !matches!(self, UploadOutcome::Failed(_))
    }
}

/// One session against one server, connected lazily and closed on drop.
pub struct TransferClient {
    connector: Arc<dyn Connector>,
    target: ServerTarget,
    remote: Option<Box<dyn RemoteFs>>,
    unreachable: bool,
}

impl TransferClient {
    pub fn new(connector: Arc<dyn Connector>, target: ServerTarget) -> Self {
        Self {
            connector,
            target,
            remote: None,
            unreachable: false,
        }
    }

    /// Set once a lazy connect from `upload_file` has failed. Later uploads
    /// on this client then fail without dialing again.
    pub fn is_unreachable(&self) -> bool {
        self.unreachable
    }

    pub fn is_connected(&self) -> bool {
        self.remote.is_some()
    }

    /// Errors are logged and reported as `false`.
    pub fn connect(&mut self) -> bool {
        match self.connector.connect(&self.target) {
            Ok(remote) => {
                info!(host = %self.target.host, port = self.target.port, "connected");
                self.remote = Some(remote);
                self.unreachable = false;
                true
            }
            Err(e) => {
                error!(host = %self.target.host, port = self.target.port, error = %e, "connection failed");
                false
            }
        }
    }

    /// Opens a session and stats the login directory, then closes it again.
    pub fn test_connection(&mut self) -> Result<(), TransferError> {
        self.close();
        let remote = self.connector.connect(&self.target)?;
        let result = remote.stat(".").map(|_| ());
        self.remote = Some(remote);
        self.close();
        result
    }

    /// Whether `remote` differs from `local` in size or mtime.
    pub fn needs_update(&self, local: &Path, remote: &str) -> bool {
        match self.remote.as_deref() {
            Some(session) => needs_update(session, local, remote),
            None => true,
        }
    }

    pub fn upload_file(&mut self, local: &Path, remote: &str) -> UploadOutcome {
        debug!(source = %local.display(), destination = %remote, "preparing upload");

        if self.remote.is_none() {
            if self.unreachable {
                return UploadOutcome::Failed(format!("{} is unreachable", self.target.address()));
            }
            debug!("no live session, connecting");
            if !self.connect() {
                self.unreachable = true;
                return UploadOutcome::Failed(format!("cannot connect to {}", self.target.address()));
            }
        }
        let Some(session) = self.remote.as_deref() else {
            return UploadOutcome::Failed(TransferError::NotConnected.to_string());
        };

        if !local.is_file() {
            error!(source = %local.display(), "local file does not exist");
            return UploadOutcome::Failed(format!("local file not found: {}", local.display()));
        }

        if !needs_update(session, local, remote) {
            info!(source = %local.display(), "remote copy is up to date, skipping");
            return UploadOutcome::Skipped;
        }

        match transfer(session, local, remote) {
            Ok(bytes) => {
                info!(
                    source = %local.display(),
                    destination = %remote,
                    size = %format_size(bytes),
                    "uploaded"
                );
                UploadOutcome::Uploaded { bytes }
            }
            Err(e) => {
                error!(
                    host = %self.target.host,
                    source = %local.display(),
                    destination = %remote,
                    error = %e,
                    "upload failed"
                );
                UploadOutcome::Failed(e.to_string())
            }
        }
    }

    pub fn close(&mut self) {
        if let Some(mut remote) = self.remote.take() {
            remote.close();
            debug!(host = %self.target.host, "session closed");
        }
    }
}

impl Drop for TransferClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn needs_update(session: &dyn RemoteFs, local: &Path, remote: &str) -> bool {
    let metadata = match fs::metadata(local) {
        Ok(metadata) => metadata,
        Err(e) => {
            error!(source = %local.display(), error = %e, "cannot stat local file");
            return true;
        }
    };
    let local_size = metadata.len();
    let local_mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);

    match session.stat(remote) {
        Ok(Some(stat)) if !stat.is_dir => {
            let same = stat.size == local_size
                && (stat.mtime as f64 - local_mtime).abs() < MTIME_TOLERANCE_SECS;
            if same {
                debug!(source = %local.display(), size = %format_size(local_size), "unchanged");
            } else {
                debug!(
                    source = %local.display(),
                    local_size = %format_size(local_size),
                    remote_size = %format_size(stat.size),
                    "changed"
                );
            }
            !same
        }
        Ok(Some(_)) => {
            warn!(destination = %remote, "remote path is a directory");
            true
        }
        Ok(None) => {
            debug!(destination = %remote, "remote file missing");
            true
        }
        Err(e) => {
            warn!(destination = %remote, error = %e, "cannot stat remote file, uploading anyway");
            true
        }
    }
}

fn transfer(session: &dyn RemoteFs, local: &Path, remote: &str) -> Result<u64, TransferError> {
    if let Some(dir) = remote_parent(remote) {
        ensure_remote_dir(session, dir)?;
    }

    let bytes = session.upload(local, remote)?;

    let metadata = fs::metadata(local)?;
    let seconds = |t: io::Result<std::time::SystemTime>| {
        t.ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0)
    };
    session.set_times(remote, seconds(metadata.accessed()), seconds(metadata.modified()))?;

    Ok(bytes)
}

/// `mkdir -p`: stat each level, creating missing ones from the top down.
fn ensure_remote_dir(session: &dyn RemoteFs, dir: &str) -> Result<(), TransferError> {
    if dir.is_empty() || dir == "/" || dir == "." {
        return Ok(());
    }
    if session.stat(dir)?.is_some() {
        return Ok(());
    }
    if let Some(parent) = remote_parent(dir) {
        ensure_remote_dir(session, parent)?;
    }
    debug!(directory = %dir, "creating remote directory");
    session.mkdir(dir)
}

pub(crate) fn remote_parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some(("", _)) => Some("/"),
        Some((parent, _)) => Some(parent),
        None => None,
    }
}

/// Re-roots a relative local path under a remote directory. `None` when a
/// component is not valid UTF-8 and cannot be named remotely as-is.
pub(crate) fn remote_join(base: &str, relative: &Path) -> Option<String> {
    let mut joined = base.trim_end_matches('/').to_string();
    for component in relative.components() {
        if let Component::Normal(part) = component {
            joined.push('/');
            joined.push_str(part.to_str()?);
        }
    }
    if joined.is_empty() {
        joined.push('/');
    }
    Some(joined)
}
