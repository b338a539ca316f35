use std::path::PathBuf;

/// Telegram chat id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ChatId(pub i64);

/// One file the run must retrieve and deliver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestEntry {
    pub description: String,
    pub remote_path: String,
}

impl ManifestEntry {
    pub fn new(description: impl Into<String>, remote_path: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            remote_path: remote_path.into(),
        }
    }
}

/// Directory + suffix rules for discovery-mode manifests.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanRules {
    pub base_dirs: Vec<String>,
    pub suffixes: Vec<String>,
    /// 1 = only files directly inside each base dir.
    pub max_depth: usize,
}

/// Where the run's manifest comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ManifestSource {
    Static(Vec<ManifestEntry>),
    Discover(ScanRules),
}

/// How the private key is supplied to the run.
#[derive(Clone, PartialEq, Eq)]
pub enum KeySource {
    /// Raw key content (typically from an env var); materialized to disk for the run.
    Inline(String),
    /// An existing key file owned by the operator; never deleted.
    File(PathBuf),
    /// Ambient identities from `~/.ssh`.
    Default,
}

impl std::fmt::Debug for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Inline(_) => f.write_str("Inline(<redacted>)"),
            KeySource::File(p) => f.debug_tuple("File").field(p).finish(),
            KeySource::Default => f.write_str("Default"),
        }
    }
}

/// What the SSH session authenticates with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyReference {
    File(PathBuf),
    Default,
}

/// SSH endpoint of the run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl std::fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Final path component of a POSIX remote path (`/srv/app/db.sql` -> `db.sql`).
pub fn remote_file_name(remote_path: &str) -> Option<&str> {
    remote_path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty() && *s != "." && *s != "..")
}
