use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    domain::{ChatId, KeySource, ManifestEntry, ManifestSource, RemoteTarget, ScanRules},
    errors::Error,
    packager::ArchiveFormat,
    Result,
};

const DEFAULT_SCAN_SUFFIXES: &str = ".sql,.db";
const DEFAULT_COMPRESS_SUFFIXES: &str = ".db";

/// Typed configuration for one relay run.
///
/// Built once at startup and handed to the pipeline; nothing else reads the
/// environment.
#[derive(Clone, Debug)]
pub struct Config {
    // Telegram
    pub telegram_bot_token: String,
    pub telegram_chat_id: ChatId,
    pub telegram_api_url: Option<String>,
    pub delivery_timeout: Duration,
    pub caption_prefix: String,

    // SSH
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub ssh_key: KeySource,
    pub ssh_host_fingerprint: Option<String>,
    pub ssh_connect_timeout: Duration,

    // Manifest
    pub manifest: ManifestSource,

    // Packaging
    pub compress_suffixes: Vec<String>,
    pub archive_format: ArchiveFormat,

    // Runtime
    pub work_dir: PathBuf,
    pub ephemeral_key_path: PathBuf,
    pub pacing_interval: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(env_str)
    }

    /// Build a config from an arbitrary key lookup (the process env in production).
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| get(key).and_then(non_empty);

        // Required
        let telegram_bot_token = get("TELEGRAM_TOKEN")
            .or_else(|| get("TELEGRAM_BOT_TOKEN"))
            .ok_or_else(|| required("TELEGRAM_TOKEN"))?;
        let chat_raw = get("TELEGRAM_CHAT_ID").ok_or_else(|| required("TELEGRAM_CHAT_ID"))?;
        let telegram_chat_id = chat_raw.trim().parse::<i64>().map(ChatId).map_err(|_| {
            Error::Config(format!("TELEGRAM_CHAT_ID must be numeric, got {chat_raw:?}"))
        })?;
        let ssh_host = get("SSH_HOST").ok_or_else(|| required("SSH_HOST"))?;
        let ssh_user = get("SSH_USER").ok_or_else(|| required("SSH_USER"))?;

        let ssh_port = match get("SSH_PORT") {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .map_err(|_| Error::Config(format!("SSH_PORT must be a port number, got {raw:?}")))?,
            None => 22,
        };

        // Key: inline content wins over a key file; neither means ambient identities.
        let ssh_key = if let Some(content) = get("SSH_KEY") {
            KeySource::Inline(content)
        } else if let Some(path) = get("SSH_KEY_PATH") {
            let path = PathBuf::from(path);
            if !path.is_file() {
                return Err(Error::Config(format!(
                    "SSH_KEY_PATH does not point to a file: {}",
                    path.display()
                )));
            }
            KeySource::File(path)
        } else {
            KeySource::Default
        };

        let tmp = env::temp_dir();
        let ephemeral_key_path = get("SSH_KEY_TMP_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| tmp.join("stb_ssh_key"));
        let work_dir = get("WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| tmp.join("stb-staging"));

        let ssh_host_fingerprint = get("SSH_HOST_FINGERPRINT").map(|s| s.trim().to_string());
        let ssh_connect_timeout =
            Duration::from_secs(parse_u64(&get, "SSH_CONNECT_TIMEOUT_SECS")?.unwrap_or(30));

        let manifest = if let Some(raw) = get("FILES") {
            ManifestSource::Static(parse_manifest_json(&raw)?)
        } else if let Some(dirs) = get("SCAN_DIRS") {
            let base_dirs = parse_csv(&dirs);
            if base_dirs.is_empty() {
                return Err(Error::Config("SCAN_DIRS is empty".to_string()));
            }
            for d in &base_dirs {
                ensure_absolute(d, "SCAN_DIRS")?;
            }
            let suffixes = parse_suffixes(
                &get("SCAN_SUFFIXES").unwrap_or_else(|| DEFAULT_SCAN_SUFFIXES.to_string()),
            );
            let max_depth = parse_u64(&get, "SCAN_MAX_DEPTH")?.unwrap_or(2).max(1) as usize;
            ManifestSource::Discover(ScanRules {
                base_dirs,
                suffixes,
                max_depth,
            })
        } else {
            return Err(Error::Config(
                "either FILES or SCAN_DIRS environment variable is required".to_string(),
            ));
        };

        let compress_suffixes = parse_suffixes(
            &get("COMPRESS_SUFFIXES").unwrap_or_else(|| DEFAULT_COMPRESS_SUFFIXES.to_string()),
        );
        let archive_format = match get("ARCHIVE_FORMAT") {
            Some(raw) => raw.parse::<ArchiveFormat>()?,
            None => ArchiveFormat::Zip,
        };
        if let Some(clash) = compress_suffixes
            .iter()
            .find(|s| s.as_str() == archive_format.suffix())
        {
            return Err(Error::Config(format!(
                "COMPRESS_SUFFIXES contains {clash:?}, the suffix of the archives it would produce"
            )));
        }

        let telegram_api_url = get("TELEGRAM_API_URL");
        let delivery_timeout =
            Duration::from_secs(parse_u64(&get, "DELIVERY_TIMEOUT_SECS")?.unwrap_or(300));
        let caption_prefix = get("CAPTION_PREFIX").unwrap_or_else(|| "Project: ".to_string());
        let pacing_interval =
            Duration::from_millis(parse_u64(&get, "DELIVERY_PACING_MS")?.unwrap_or(1000));

        Ok(Self {
            telegram_bot_token,
            telegram_chat_id,
            telegram_api_url,
            delivery_timeout,
            caption_prefix,
            ssh_host,
            ssh_port,
            ssh_user,
            ssh_key,
            ssh_host_fingerprint,
            ssh_connect_timeout,
            manifest,
            compress_suffixes,
            archive_format,
            work_dir,
            ephemeral_key_path,
            pacing_interval,
        })
    }

    pub fn remote_target(&self) -> RemoteTarget {
        RemoteTarget {
            host: self.ssh_host.clone(),
            port: self.ssh_port,
            user: self.ssh_user.clone(),
        }
    }

    pub fn caption_for(&self, description: &str) -> String {
        format!("{}{description}", self.caption_prefix)
    }
}

/// Parse the `FILES` JSON object (`{"description": "/abs/remote/path"}`), keeping key order.
pub fn parse_manifest_json(raw: &str) -> Result<Vec<ManifestEntry>> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| Error::Config(format!("FILES is not valid JSON: {e}")))?;
    let Some(obj) = value.as_object() else {
        return Err(Error::Config(
            "FILES must be a JSON object of description -> remote path".to_string(),
        ));
    };

    let mut out = Vec::with_capacity(obj.len());
    for (description, path) in obj {
        let Some(path) = path.as_str() else {
            return Err(Error::Config(format!(
                "FILES entry {description:?} must map to a string path"
            )));
        };
        ensure_absolute(path, "FILES")?;
        out.push(ManifestEntry::new(description.clone(), path));
    }

    if out.is_empty() {
        return Err(Error::Config("FILES is empty".to_string()));
    }
    Ok(out)
}

/// Normalize a comma-separated suffix list: lowercase, leading dot enforced.
pub fn parse_suffixes(raw: &str) -> Vec<String> {
    parse_csv(raw)
        .into_iter()
        .map(|s| {
            let s = s.to_lowercase();
            if s.starts_with('.') {
                s
            } else {
                format!(".{s}")
            }
        })
        .collect()
}

fn ensure_absolute(path: &str, var: &str) -> Result<()> {
    if path.starts_with('/') {
        return Ok(());
    }
    Err(Error::Config(format!(
        "{var} must contain absolute remote paths, got {path:?}"
    )))
}

fn required(key: &str) -> Error {
    Error::Config(format!("{key} environment variable is required"))
}

fn parse_u64(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>> {
    let Some(raw) = get(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(Some)
        .map_err(|_| Error::Config(format!("{key} must be a non-negative integer, got {raw:?}")))
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
