//! Off-host transfer of backup files over SSH/SFTP.
//!
//! One connection per transfer: connect, authenticate with a password or a
//! private key, create the remote directory if needed, stream the file, and
//! disconnect. Retrying is the job queue's business, not this module's.

use russh::{
    Disconnect, client,
    keys::{
        PrivateKeyWithHashAlg,
        known_hosts::{known_host_keys_path, learn_known_hosts_path},
        load_secret_key, ssh_key,
    },
};
use russh_sftp::{
    client::{SftpSession, error::Error as SftpError},
    protocol::{OpenFlags, StatusCode},
};
use std::{
    fmt, io,
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::{debug, info, warn};

/// Connection timeout for the SSH handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Size of the chunks streamed from disk to the remote file.
const UPLOAD_CHUNK: usize = 256 * 1024;

pub const DEFAULT_SSH_PORT: u16 = 22;

/// Ships one local file to the remote backup directory.
pub trait Transport: Send + Sync + 'static {
    fn send(
        &self,
        local: &Path,
        remote_name: &str,
    ) -> impl Future<Output = Result<(), TransferError>> + Send;
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("error creating scp config read private key {}: {message}", path.display())]
    KeyLoad { path: PathBuf, message: String },
    #[error("ssh connect to {host}:{port} timed out after {}s", CONNECT_TIMEOUT.as_secs())]
    ConnectTimeout { host: String, port: u16 },
    #[error("ssh {op} {host}:{port}: {source}")]
    Ssh {
        op: &'static str,
        host: String,
        port: u16,
        source: russh::Error,
    },
    #[error("ssh authentication rejected for user `{user}` on {host}:{port}")]
    AuthRejected {
        user: String,
        host: String,
        port: u16,
    },
    #[error("sftp {op} `{path}`: {source}")]
    Sftp {
        op: &'static str,
        path: String,
        source: SftpError,
    },
    #[error("error during send {op} `{path}`: {source}")]
    Io {
        op: &'static str,
        path: String,
        source: io::Error,
    },
}

#[derive(Clone)]
pub enum Credentials {
    Password(String),
    PrivateKey(PathBuf),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Password(password) => {
                write!(f, "Password({})", "x".repeat(password.len()))
            }
            Credentials::PrivateKey(path) => f.debug_tuple("PrivateKey").field(path).finish(),
        }
    }
}

/// Remote end of the replication channel.
#[derive(Clone, Debug)]
pub struct TransferTarget {
    pub host: String,
    pub port: u16,
    pub directory: String,
    pub username: String,
    pub credentials: Credentials,
    /// Server keys are checked against this file; unknown hosts are learned.
    pub known_hosts: PathBuf,
    pub inactivity_timeout: Duration,
}

impl TransferTarget {
    /// Full remote path for `name` inside the target directory.
    pub fn remote_path(&self, name: &str) -> String {
        let dir = self.directory.trim_end_matches('/');
        if dir.is_empty() && self.directory.starts_with('/') {
            format!("/{name}")
        } else if dir.is_empty() {
            name.to_string()
        } else {
            format!("{dir}/{name}")
        }
    }
}

/// Split `host[:port]`. Bracketed IPv6 literals keep their brackets off.
pub fn split_host_port(raw: &str) -> (String, u16) {
    if let Some(rest) = raw.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_SSH_PORT);
            return (host.to_string(), port);
        }
    }
    match raw.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (raw.to_string(), DEFAULT_SSH_PORT),
        },
        _ => (raw.to_string(), DEFAULT_SSH_PORT),
    }
}

/// Explicit `known_hosts` path (with `~` expanded), else the user's default.
/// `None` only when no path was given and the home directory is unknown.
pub fn resolve_known_hosts_path(explicit: Option<&str>) -> Option<PathBuf> {
    if let Some(path) = explicit.filter(|p| !p.is_empty()) {
        return Some(expand_tilde_path(path));
    }

    let home = dirs::home_dir()?;

    #[cfg(target_os = "windows")]
    {
        Some(home.join("ssh").join("known_hosts"))
    }

    #[cfg(not(target_os = "windows"))]
    {
        Some(home.join(".ssh").join("known_hosts"))
    }
}

fn expand_tilde_path(raw: &str) -> PathBuf {
    if raw == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }

    if let Some(rest) = raw.strip_prefix("~/").or_else(|| raw.strip_prefix("~\\")) {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }

    PathBuf::from(raw)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HostKeyState {
    Matched,
    Learned,
}

fn ensure_known_hosts_file(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    if path.exists() {
        return Ok(());
    }

    let mut options = std::fs::OpenOptions::new();
    options.create_new(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    match options.open(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

/// Trust on first use: a host with no entry is learned, a known host must
/// present one of its recorded keys.
fn verify_or_learn_host_key(
    host: &str,
    port: u16,
    known_hosts_path: &Path,
    server_public_key: &ssh_key::PublicKey,
) -> Result<HostKeyState, russh::Error> {
    ensure_known_hosts_file(known_hosts_path).map_err(russh::Error::IO)?;

    let known = known_host_keys_path(host, port, known_hosts_path)?;
    if known
        .iter()
        .any(|(_, existing_key)| existing_key == server_public_key)
    {
        return Ok(HostKeyState::Matched);
    }

    if known.is_empty() {
        learn_known_hosts_path(host, port, server_public_key, known_hosts_path)?;
        return Ok(HostKeyState::Learned);
    }

    Err(russh::Error::KeyChanged { line: known[0].0 })
}

/// SSH client handler that checks the server key.
struct HostKeyCheck {
    host: String,
    port: u16,
    known_hosts: PathBuf,
}

impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let state =
            verify_or_learn_host_key(&self.host, self.port, &self.known_hosts, server_public_key)?;
        if state == HostKeyState::Learned {
            warn!(
                host = %self.host,
                port = self.port,
                known_hosts = %self.known_hosts.display(),
                "learned new SSH host key"
            );
        }
        Ok(true)
    }
}

/// [`Transport`] over `russh` + `russh-sftp`.
pub struct SftpTransport {
    target: TransferTarget,
}

impl SftpTransport {
    pub fn new(target: TransferTarget) -> Self {
        Self { target }
    }

    fn ssh_error(&self, op: &'static str, source: russh::Error) -> TransferError {
        TransferError::Ssh {
            op,
            host: self.target.host.clone(),
            port: self.target.port,
            source,
        }
    }

    async fn connect(&self) -> Result<client::Handle<HostKeyCheck>, TransferError> {
        let target = &self.target;
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(target.inactivity_timeout),
            ..Default::default()
        });
        let handler = HostKeyCheck {
            host: target.host.clone(),
            port: target.port,
            known_hosts: target.known_hosts.clone(),
        };

        let addr = (target.host.as_str(), target.port);
        let mut session =
            tokio::time::timeout(CONNECT_TIMEOUT, client::connect(config, addr, handler))
                .await
                .map_err(|_| TransferError::ConnectTimeout {
                    host: target.host.clone(),
                    port: target.port,
                })?
                .map_err(|e| self.ssh_error("connect", e))?;

        let auth = match &target.credentials {
            Credentials::Password(password) => {
                debug!(user = %target.username, "ssh using name/password");
                session
                    .authenticate_password(&target.username, password)
                    .await
                    .map_err(|e| self.ssh_error("authenticate", e))?
            }
            Credentials::PrivateKey(path) => {
                debug!(
                    user = %target.username,
                    key = %path.display(),
                    "ssh using name/private key"
                );
                let key = load_secret_key(path, None).map_err(|e| TransferError::KeyLoad {
                    path: path.clone(),
                    message: e.to_string(),
                })?;
                let hash_alg = session
                    .best_supported_rsa_hash()
                    .await
                    .map_err(|e| self.ssh_error("negotiate hash algorithm", e))?
                    .flatten();
                session
                    .authenticate_publickey(
                        &target.username,
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                    )
                    .await
                    .map_err(|e| self.ssh_error("authenticate", e))?
            }
        };

        if !auth.success() {
            return Err(TransferError::AuthRejected {
                user: target.username.clone(),
                host: target.host.clone(),
                port: target.port,
            });
        }
        Ok(session)
    }

    async fn open_sftp(
        &self,
        session: &client::Handle<HostKeyCheck>,
    ) -> Result<SftpSession, TransferError> {
        let channel = session
            .channel_open_session()
            .await
            .map_err(|e| self.ssh_error("open channel", e))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| self.ssh_error("request sftp subsystem", e))?;
        SftpSession::new(channel.into_stream())
            .await
            .map_err(|source| TransferError::Sftp {
                op: "session init",
                path: self.target.host.clone(),
                source,
            })
    }

    async fn upload(
        &self,
        sftp: &SftpSession,
        local: &Path,
        remote_path: &str,
    ) -> Result<u64, TransferError> {
        if let Some(parent) = remote_parent(remote_path) {
            mkdir_p(sftp, parent).await?;
        }

        let local_name = local.display().to_string();
        let local_err = |op, source| TransferError::Io {
            op,
            path: local_name.clone(),
            source,
        };
        let remote_err = |op, source| TransferError::Io {
            op,
            path: remote_path.to_string(),
            source,
        };

        let mut file = File::open(local).await.map_err(|e| local_err("open", e))?;
        let mut remote = sftp
            .open_with_flags(remote_path, upload_flags())
            .await
            .map_err(|source| TransferError::Sftp {
                op: "create",
                path: remote_path.to_string(),
                source,
            })?;

        let mut buf = vec![0u8; UPLOAD_CHUNK];
        let mut sent: u64 = 0;
        loop {
            let n = file.read(&mut buf).await.map_err(|e| local_err("read", e))?;
            if n == 0 {
                break;
            }
            remote
                .write_all(&buf[..n])
                .await
                .map_err(|e| remote_err("write", e))?;
            sent += n as u64;
        }
        remote.flush().await.map_err(|e| remote_err("flush", e))?;
        remote
            .shutdown()
            .await
            .map_err(|e| remote_err("close", e))?;
        Ok(sent)
    }
}

impl Transport for SftpTransport {
    async fn send(&self, local: &Path, remote_name: &str) -> Result<(), TransferError> {
        let remote_path = self.target.remote_path(remote_name);
        info!(
            "Scp {}:{} -> {}",
            self.target.host,
            local.display(),
            remote_path
        );

        let session = self.connect().await?;
        let result = async {
            let sftp = self.open_sftp(&session).await?;
            let sent = self.upload(&sftp, local, &remote_path).await;
            if let Err(err) = sftp.close().await {
                debug!("sftp close: {err}");
            }
            sent
        }
        .await;

        if let Err(err) = session
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            debug!("ssh disconnect: {err}");
        }

        let sent = result?;
        debug!(remote = %remote_path, bytes = sent, "transfer finished");
        Ok(())
    }
}

/// Open flags for the remote file: an earlier, longer copy is truncated.
fn upload_flags() -> OpenFlags {
    OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE
}

/// Directory holding `remote_path`, if it names one.
fn remote_parent(remote_path: &str) -> Option<&str> {
    let (parent, _) = remote_path.rsplit_once('/')?;
    if parent.is_empty() { None } else { Some(parent) }
}

/// Every prefix of `path` that `mkdir -p` has to create, shortest first.
fn remote_dirs(path: &str) -> Vec<String> {
    let absolute = path.starts_with('/');
    let mut current = String::new();
    let mut dirs = Vec::new();
    for component in path.split('/').filter(|c| !c.is_empty()) {
        if absolute || !current.is_empty() {
            current.push('/');
        }
        current.push_str(component);
        dirs.push(current.clone());
    }
    dirs
}

/// Most servers report `mkdir` on an existing directory as a plain failure.
fn may_already_exist(err: &SftpError) -> bool {
    matches!(err, SftpError::Status(status) if status.status_code == StatusCode::Failure)
}

/// Create `path` and its parents, tolerating directories that already exist.
async fn mkdir_p(sftp: &SftpSession, path: &str) -> Result<(), TransferError> {
    for dir in remote_dirs(path) {
        match sftp.create_dir(&dir).await {
            Ok(()) => {}
            Err(err) if may_already_exist(&err) => {
                sftp.metadata(&dir)
                    .await
                    .map_err(|source| TransferError::Sftp {
                        op: "mkdir",
                        path: dir.clone(),
                        source,
                    })?;
            }
            Err(source) => {
                return Err(TransferError::Sftp {
                    op: "mkdir",
                    path: dir,
                    source,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(directory: &str) -> TransferTarget {
        TransferTarget {
            host: "backup.example.com".into(),
            port: 22,
            directory: directory.into(),
            username: "kv".into(),
            credentials: Credentials::Password("hunter2".into()),
            known_hosts: PathBuf::from("/nonexistent/known_hosts"),
            inactivity_timeout: Duration::from_secs(300),
        }
    }

    #[test]
    fn remote_path_joins_directory_and_name() {
        assert_eq!(target("/srv/backups").remote_path("a.bak"), "/srv/backups/a.bak");
        assert_eq!(target("/srv/backups/").remote_path("a.bak"), "/srv/backups/a.bak");
        assert_eq!(target("backups").remote_path("a.bak"), "backups/a.bak");
        assert_eq!(target("/").remote_path("a.bak"), "/a.bak");
    }

    #[test]
    fn host_port_parsing() {
        assert_eq!(
            split_host_port("backup.example.com"),
            ("backup.example.com".into(), 22)
        );
        assert_eq!(
            split_host_port("backup.example.com:2222"),
            ("backup.example.com".into(), 2222)
        );
        assert_eq!(split_host_port("[::1]:2200"), ("::1".into(), 2200));
        assert_eq!(split_host_port("[::1]"), ("::1".into(), 22));
        assert_eq!(split_host_port("fe80::1"), ("fe80::1".into(), 22));
    }

    #[test]
    fn password_is_redacted_in_debug_output() {
        let rendered = format!("{:?}", target("/srv"));
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("Password(xxxxxxx)"));
    }

    #[test]
    fn unreadable_private_key_message() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("id_ed25519");
        let err = load_secret_key(&key, None).unwrap_err();
        let wrapped = TransferError::KeyLoad {
            path: key.clone(),
            message: err.to_string(),
        };
        assert!(
            wrapped
                .to_string()
                .starts_with("error creating scp config read private key")
        );
    }

    const KEY_A: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIJr+z8fU/duu7aBu+Ql33vayBwAs5UdtQm+Oy6sT2HTo";
    const KEY_B: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIDYouM+dEYhhMA+pSwuH96SnHhYCsVrdlAfwXTwQwQ9V";

    fn public_key(line: &str) -> ssh_key::PublicKey {
        ssh_key::PublicKey::from_openssh(line).unwrap()
    }

    #[test]
    fn host_key_is_learned_then_pinned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssh").join("known_hosts");
        let host = "backup.example.com";

        let first = verify_or_learn_host_key(host, 22, &path, &public_key(KEY_A)).unwrap();
        assert_eq!(first, HostKeyState::Learned);
        assert!(path.exists());

        let again = verify_or_learn_host_key(host, 22, &path, &public_key(KEY_A)).unwrap();
        assert_eq!(again, HostKeyState::Matched);

        let changed = verify_or_learn_host_key(host, 22, &path, &public_key(KEY_B));
        assert!(matches!(changed, Err(russh::Error::KeyChanged { .. })));
    }

    #[test]
    fn host_key_is_pinned_per_port() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let host = "backup.example.com";

        verify_or_learn_host_key(host, 22, &path, &public_key(KEY_A)).unwrap();
        let other_port = verify_or_learn_host_key(host, 2222, &path, &public_key(KEY_B)).unwrap();
        assert_eq!(other_port, HostKeyState::Learned);
    }

    #[cfg(unix)]
    #[test]
    fn new_known_hosts_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        ensure_known_hosts_file(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn explicit_known_hosts_path_wins() {
        assert_eq!(
            resolve_known_hosts_path(Some("/etc/kv/known_hosts")),
            Some(PathBuf::from("/etc/kv/known_hosts"))
        );
        if let Some(home) = dirs::home_dir() {
            assert_eq!(
                resolve_known_hosts_path(Some("~/hosts")),
                Some(home.join("hosts"))
            );
            let default = resolve_known_hosts_path(None).unwrap();
            assert!(default.starts_with(&home));
            assert!(default.ends_with("known_hosts"));
            assert_eq!(resolve_known_hosts_path(Some("")), Some(default));
        }
    }

    #[test]
    fn remote_dirs_lists_every_prefix() {
        assert_eq!(remote_dirs("/a/b/c"), vec!["/a", "/a/b", "/a/b/c"]);
        assert_eq!(remote_dirs("a/b"), vec!["a", "a/b"]);
        assert_eq!(remote_dirs("/srv//backups/"), vec!["/srv", "/srv/backups"]);
        assert!(remote_dirs("/").is_empty());
        assert!(remote_dirs("").is_empty());
    }

    #[test]
    fn remote_parent_skips_root_and_bare_names() {
        assert_eq!(remote_parent("/srv/backups/a.bak"), Some("/srv/backups"));
        assert_eq!(remote_parent("backups/a.bak"), Some("backups"));
        assert_eq!(remote_parent("/a.bak"), None);
        assert_eq!(remote_parent("a.bak"), None);
    }

    fn status(code: StatusCode) -> SftpError {
        SftpError::Status(russh_sftp::protocol::Status {
            id: 1,
            status_code: code,
            error_message: "mkdir".into(),
            language_tag: "en-US".into(),
        })
    }

    #[test]
    fn only_plain_failure_may_mean_existing_dir() {
        assert!(may_already_exist(&status(StatusCode::Failure)));
        assert!(!may_already_exist(&status(StatusCode::PermissionDenied)));
        assert!(!may_already_exist(&status(StatusCode::NoSuchFile)));
        assert!(!may_already_exist(&SftpError::UnexpectedBehavior("eof".into())));
    }

    #[test]
    fn upload_truncates_existing_remote_file() {
        let flags = upload_flags();
        assert!(flags.contains(OpenFlags::CREATE));
        assert!(flags.contains(OpenFlags::TRUNCATE));
        assert!(flags.contains(OpenFlags::WRITE));
        assert!(!flags.contains(OpenFlags::APPEND));
    }
}
