//! Answers to browse and search requests, built from the local shares.
//!
//! A share is a name mapped to a file or directory on disk. Browsing the
//! empty path lists the shares themselves; browsing `name/sub/dir` lists a
//! directory inside a shared directory. Searches match share names.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use relay_types::ShareEntry;

/// Entries under `path`, sorted by name.
///
/// Paths that leave a share (`..`, absolute components) list nothing.
pub(crate) async fn listing(shares: &HashMap<String, PathBuf>, path: &str) -> Vec<ShareEntry> {
    let path = path.trim_matches('/');
    let mut entries = Vec::new();

    if path.is_empty() {
        for (name, local) in shares {
            if let Some(entry) = entry(name, local).await {
                entries.push(entry);
            }
        }
    } else {
        let (share, rest) = path.split_once('/').unwrap_or((path, ""));
        let Some(root) = shares.get(share) else {
            return entries;
        };
        let rest = Path::new(rest);
        if rest.components().any(|c| !matches!(c, Component::Normal(_))) {
            tracing::debug!(path, "browse outside the share refused");
            return entries;
        }
        let dir = root.join(rest);
        let mut reader = match tokio::fs::read_dir(&dir).await {
            Ok(reader) => reader,
            Err(error) => {
                tracing::debug!(dir = %dir.display(), %error, "cannot list");
                return entries;
            }
        };
        while let Ok(Some(child)) = reader.next_entry().await {
            let name = child.file_name().to_string_lossy().into_owned();
            if let Some(entry) = entry(&name, &child.path()).await {
                entries.push(entry);
            }
        }
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries
}

/// Shares whose name contains every term, case-insensitively.
pub(crate) async fn matching(shares: &HashMap<String, PathBuf>, keywords: &str) -> Vec<ShareEntry> {
    let terms: Vec<String> = keywords.split_whitespace().map(str::to_lowercase).collect();
    if terms.is_empty() {
        return Vec::new();
    }

    let mut results = Vec::new();
    for (name, local) in shares {
        let lower = name.to_lowercase();
        if !terms.iter().all(|t| lower.contains(t.as_str())) {
            continue;
        }
        if let Some(entry) = entry(name, local).await {
            results.push(entry);
        }
    }
    results.sort_by(|a, b| a.name.cmp(&b.name));
    results
}

async fn entry(name: &str, local: &Path) -> Option<ShareEntry> {
    match tokio::fs::metadata(local).await {
        Ok(meta) => Some(ShareEntry {
            name: name.to_string(),
            size: if meta.is_dir() { 0 } else { meta.len() },
            dir: meta.is_dir(),
        }),
        Err(error) => {
            tracing::debug!(share = name, %error, "skipping unreadable share");
            None
        }
    }
}
