//! SSH/SFTP adapter (russh).
//!
//! Implements the `stb-core` remote ports: one public-key authenticated SSH
//! connection per run, with a single SFTP channel on top that is reused for
//! every manifest item.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use russh::{
    client,
    keys::{load_secret_key, ssh_key, PrivateKeyWithHashAlg},
    Disconnect,
};
use russh_sftp::{client::SftpSession, protocol::StatusCode};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use stb_core::{
    config::Config,
    domain::{KeyReference, RemoteTarget},
    errors::Error,
    ports::{RemoteConnector, RemoteSession},
    Result,
};

#[derive(Clone, Debug)]
pub struct SshOptions {
    pub connect_timeout: Duration,
    /// Pinned `SHA256:` host key fingerprint. `None` = trust on first use.
    pub host_fingerprint: Option<String>,
}

impl SshOptions {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            connect_timeout: cfg.ssh_connect_timeout,
            host_fingerprint: cfg.ssh_host_fingerprint.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct SftpConnector {
    opts: SshOptions,
}

impl SftpConnector {
    pub fn new(opts: SshOptions) -> Self {
        Self { opts }
    }

    async fn open(
        &self,
        target: &RemoteTarget,
        key: &KeyReference,
    ) -> Result<Box<dyn RemoteSession>> {
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(600)),
            ..Default::default()
        });
        let handler = HostKeyCheck {
            host: target.host.clone(),
            pinned: self.opts.host_fingerprint.clone(),
        };

        let mut handle = client::connect(config, (target.host.as_str(), target.port), handler)
            .await
            .map_err(|e| Error::Connection(format!("{target}: {e}")))?;

        authenticate(&mut handle, &target.user, key).await?;

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| Error::Connection(format!("open session channel: {e}")))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| Error::Connection(format!("request sftp subsystem: {e}")))?;
        let sftp = SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| Error::Connection(format!("start sftp session: {e}")))?;

        info!(target = %target, "sftp session ready");
        Ok(Box::new(SftpRemote { handle, sftp }))
    }
}

#[async_trait]
impl RemoteConnector for SftpConnector {
    async fn connect(
        &self,
        target: &RemoteTarget,
        key: &KeyReference,
    ) -> Result<Box<dyn RemoteSession>> {
        match tokio::time::timeout(self.opts.connect_timeout, self.open(target, key)).await {
            Ok(res) => res,
            Err(_) => Err(Error::Connection(format!(
                "{target}: timed out after {}s",
                self.opts.connect_timeout.as_secs_f32()
            ))),
        }
    }
}

/// russh client handler: host key verification only.
struct HostKeyCheck {
    host: String,
    pinned: Option<String>,
}

impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        let fingerprint = server_public_key
            .fingerprint(ssh_key::HashAlg::Sha256)
            .to_string();

        match self.pinned.as_deref() {
            None => {
                // Automation host: accept unknown keys, but leave a trace to audit.
                info!(host = %self.host, %fingerprint, "accepting host key (trust on first use)");
                Ok(true)
            }
            Some(expected) if fingerprints_match(expected, &fingerprint) => {
                debug!(host = %self.host, %fingerprint, "host key matches pinned fingerprint");
                Ok(true)
            }
            Some(expected) => {
                warn!(host = %self.host, %fingerprint, expected, "host key does not match pinned fingerprint");
                Ok(false)
            }
        }
    }
}

/// Compare `SHA256:` fingerprints, tolerating a missing prefix or base64 padding.
fn fingerprints_match(expected: &str, actual: &str) -> bool {
    fn norm(s: &str) -> &str {
        let s = s.trim();
        let s = s.strip_prefix("SHA256:").unwrap_or(s);
        s.trim_end_matches('=')
    }
    !norm(expected).is_empty() && norm(expected) == norm(actual)
}

async fn authenticate(
    handle: &mut client::Handle<HostKeyCheck>,
    user: &str,
    key: &KeyReference,
) -> Result<()> {
    let candidates = match key {
        KeyReference::File(path) => vec![path.clone()],
        KeyReference::Default => default_identities(),
    };
    if candidates.is_empty() {
        return Err(Error::Connection(
            "no ssh key configured and no default identity found in ~/.ssh".to_string(),
        ));
    }

    for path in candidates {
        let key_pair = match load_secret_key(&path, None) {
            Ok(k) => k,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unusable ssh key");
                continue;
            }
        };

        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .map_err(|e| Error::Connection(format!("negotiate key hash: {e}")))?
            .flatten();
        let res = handle
            .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg))
            .await
            .map_err(|e| Error::Connection(format!("public key auth: {e}")))?;

        if res.success() {
            debug!(user, path = %path.display(), "authenticated");
            return Ok(());
        }
        debug!(user, path = %path.display(), "key rejected by server");
    }

    Err(Error::Connection(format!(
        "public key authentication failed for user {user}"
    )))
}

fn default_identities() -> Vec<PathBuf> {
    let Some(home) = std::env::var_os("HOME").map(PathBuf::from) else {
        return Vec::new();
    };
    ["id_ed25519", "id_ecdsa", "id_rsa"]
        .iter()
        .map(|name| home.join(".ssh").join(name))
        .filter(|p| p.is_file())
        .collect()
}

struct SftpRemote {
    handle: client::Handle<HostKeyCheck>,
    sftp: SftpSession,
}

fn is_no_such_file(e: &russh_sftp::client::error::Error) -> bool {
    matches!(
        e,
        russh_sftp::client::error::Error::Status(status)
            if matches!(status.status_code, StatusCode::NoSuchFile)
    )
}

/// The file was seen by `exists` just before, so a vanished file is a
/// transfer failure here, not a skip.
fn open_error(remote_path: &str, e: &russh_sftp::client::error::Error) -> Error {
    if is_no_such_file(e) {
        Error::Transfer(format!("{remote_path} vanished before transfer"))
    } else {
        Error::Transfer(format!("open {remote_path}: {e}"))
    }
}

#[async_trait]
impl RemoteSession for SftpRemote {
    async fn exists(&self, remote_path: &str) -> Result<bool> {
        match self.sftp.metadata(remote_path).await {
            Ok(_) => Ok(true),
            Err(e) if is_no_such_file(&e) => Ok(false),
            Err(e) => Err(Error::Transfer(format!("stat {remote_path}: {e}"))),
        }
    }

    async fn list_files(
        &self,
        remote_dir: &str,
        suffixes: &[String],
        max_depth: usize,
    ) -> Result<Vec<String>> {
        let root = normalize_dir(remote_dir);
        let mut out = Vec::new();
        let mut pending = vec![(root.clone(), 1usize)];

        while let Some((dir, depth)) = pending.pop() {
            let entries = match self.sftp.read_dir(dir.clone()).await {
                Ok(v) => v,
                Err(e) if dir == root => {
                    return Err(Error::Transfer(format!("list {dir}: {e}")));
                }
                Err(e) => {
                    warn!(remote_dir = %dir, error = %e, "skipping unreadable sub-directory");
                    continue;
                }
            };

            for entry in entries {
                let name = entry.file_name();
                if name == "." || name == ".." {
                    continue;
                }
                let path = join_remote(&dir, &name);
                let file_type = entry.file_type();
                if file_type.is_dir() {
                    if depth < max_depth {
                        pending.push((path, depth + 1));
                    }
                } else if (file_type.is_file() || file_type.is_symlink())
                    && has_suffix(&name, suffixes)
                {
                    out.push(path);
                }
            }
        }

        out.sort();
        Ok(out)
    }

    async fn fetch(&self, remote_path: &str, local_dest: &Path) -> Result<u64> {
        let mut src = self
            .sftp
            .open(remote_path)
            .await
            .map_err(|e| open_error(remote_path, &e))?;

        let mut dst = tokio::fs::File::create(local_dest).await?;
        let bytes = tokio::io::copy(&mut src, &mut dst)
            .await
            .map_err(|e| Error::Transfer(format!("read {remote_path}: {e}")))?;
        dst.flush().await?;
        dst.sync_all().await?;
        Ok(bytes)
    }

    async fn close(self: Box<Self>) -> Result<()> {
        if let Err(e) = self.sftp.close().await {
            debug!(error = %e, "sftp close");
        }
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| Error::External(format!("ssh disconnect: {e}")))
    }
}

fn normalize_dir(dir: &str) -> String {
    let trimmed = dir.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn join_remote(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

fn has_suffix(name: &str, suffixes: &[String]) -> bool {
    let lower = name.to_lowercase();
    suffixes
        .iter()
        .any(|s| lower.ends_with(&s.to_lowercase()) && lower.len() > s.len())
}
