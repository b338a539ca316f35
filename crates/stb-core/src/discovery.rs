//! Dynamic manifests: scan remote base directories for backup files.

use std::collections::HashSet;

use tracing::{info, warn};

use crate::{
    domain::{remote_file_name, ManifestEntry, ScanRules},
    ports::RemoteSession,
};

/// Build a manifest from the files found under each base directory.
///
/// A base directory that cannot be listed is logged and skipped; the other
/// directories are still scanned. Paths found twice (overlapping base dirs)
/// are kept once, first occurrence wins.
pub async fn discover(session: &dyn RemoteSession, rules: &ScanRules) -> Vec<ManifestEntry> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for dir in &rules.base_dirs {
        let files = match session
            .list_files(dir, &rules.suffixes, rules.max_depth)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                warn!(remote_dir = %dir, error = %e, "failed to scan remote directory");
                continue;
            }
        };
        info!(remote_dir = %dir, count = files.len(), "scanned remote directory");

        for path in files {
            if !seen.insert(path.clone()) {
                continue;
            }
            out.push(ManifestEntry::new(describe(&path), path));
        }
    }

    out
}

/// Description for a discovered file: the name of its containing directory.
pub fn describe(remote_path: &str) -> String {
    let trimmed = remote_path.trim_end_matches('/');
    let parent = trimmed.rsplit_once('/').map(|(p, _)| p).unwrap_or("");
    if let Some(dir) = remote_file_name(parent) {
        return dir.to_string();
    }

    // File directly under `/` (or a bare name): fall back to the file stem.
    let name = remote_file_name(trimmed).unwrap_or(trimmed);
    match name.split_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => name.to_string(),
    }
}
