//! Repository scanner.
//!
//! Resolves a repository reference and reads its text files:
//!
//! - a local directory is walked in place;
//! - a `http(s)://`, `ssh://`, or `git@` URL is shallow-cloned with the `git`
//!   CLI into `scan.workspace_dir/<hash>` (fetched and reset when the clone
//!   already exists) and the clone is walked.
//!
//! Files are filtered by the include/exclude globs. Files larger than
//! `scan.max_file_bytes`, files that are not UTF-8, and entries the walk
//! cannot read are skipped with a warning. Paths are relative to the
//! repository root with `/` separators, sorted.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Command;
use walkdir::WalkDir;

use reporover_core::capability::{ScanOutput, Scanner};
use reporover_core::error::CapabilityError;
use reporover_core::models::FileBlob;

use crate::config::ScanConfig;

/// Where a repository reference points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepoRef {
    Local(PathBuf),
    Remote(String),
}

impl RepoRef {
    pub fn parse(reference: &str) -> Self {
        let r = reference.trim();
        let remote = ["http://", "https://", "ssh://", "git@"]
            .iter()
            .any(|p| r.starts_with(p));
        if remote {
            RepoRef::Remote(r.to_string())
        } else {
            RepoRef::Local(PathBuf::from(r))
        }
    }
}

pub struct RepoScanner {
    config: ScanConfig,
}

impl RepoScanner {
    pub fn new(config: ScanConfig) -> Self {
        Self { config }
    }

    /// Directory a reference is read from, cloning or updating as needed.
    pub fn checkout(&self, reference: &str) -> Result<PathBuf> {
        match RepoRef::parse(reference) {
            RepoRef::Local(path) => {
                if !path.is_dir() {
                    bail!("no such repository: {}", reference);
                }
                Ok(path)
            }
            RepoRef::Remote(url) => {
                let dest = self.config.workspace_dir.join(short_hash(&url));
                if dest.join(".git").exists() {
                    git_update(&dest)?;
                } else {
                    git_clone(&url, &dest)?;
                }
                Ok(dest)
            }
        }
    }

    pub fn scan_blocking(&self, reference: &str) -> Result<ScanOutput> {
        let root = self.checkout(reference)?;
        walk(&self.config, &root, reference)
    }
}

#[async_trait]
impl Scanner for RepoScanner {
    async fn scan(&self, repository: &str) -> Result<ScanOutput, CapabilityError> {
        let scanner = RepoScanner::new(self.config.clone());
        let reference = repository.to_string();
        tokio::task::spawn_blocking(move || scanner.scan_blocking(&reference))
            .await
            .map_err(|e| CapabilityError::Fatal(format!("scanner panicked: {}", e)))?
            .map_err(|e| CapabilityError::Fatal(format!("{:#}", e)))
    }
}

fn relative_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn walk(config: &ScanConfig, root: &Path, repository: &str) -> Result<ScanOutput> {
    let include_set = build_globset(&config.include_globs)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut files = Vec::new();
    let mut warnings = Vec::new();
    let mut skip = |rel_str: &str, reason: String| {
        tracing::warn!(path = %rel_str, %reason, "skipping file");
        warnings.push(format!("{}: {}", rel_str, reason));
    };

    for entry in WalkDir::new(root).follow_links(config.follow_symlinks) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let rel_str = e
                    .path()
                    .map(|p| relative_path(root, p))
                    .unwrap_or_default();
                let reason = match e.io_error() {
                    Some(io) => format!("unreadable, {}", io),
                    None => format!("unreadable, {}", e),
                };
                skip(&rel_str, reason);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let rel_str = relative_path(root, path);
        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
        if size > config.max_file_bytes {
            skip(
                &rel_str,
                format!("{} bytes exceeds max_file_bytes ({})", size, config.max_file_bytes),
            );
            continue;
        }

        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) => {
                skip(&rel_str, format!("unreadable, {}", e));
                continue;
            }
        };
        match String::from_utf8(bytes) {
            Ok(content) => files.push(FileBlob::new(repository, rel_str, content)),
            Err(_) => skip(&rel_str, "not valid UTF-8".to_string()),
        }
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    warnings.sort();
    Ok(ScanOutput { files, warnings })
}

fn git_clone(url: &str, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create workspace directory: {}", parent.display())
        })?;
    }

    tracing::info!(url, dest = %dest.display(), "cloning repository");
    let output = Command::new("git")
        .args(["clone", "--depth", "1"])
        .arg(url)
        .arg(dest)
        .output()
        .with_context(|| "Failed to execute 'git clone'. Is git installed?")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git clone failed: {}", stderr.trim());
    }
    Ok(())
}

fn git_update(repo_dir: &Path) -> Result<()> {
    tracing::info!(dir = %repo_dir.display(), "updating clone");
    let output = Command::new("git")
        .args(["fetch", "--depth", "1", "origin", "HEAD"])
        .current_dir(repo_dir)
        .output()
        .with_context(|| "Failed to execute 'git fetch'")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git fetch failed: {}", stderr.trim());
    }

    let output = Command::new("git")
        .args(["reset", "--hard", "FETCH_HEAD"])
        .current_dir(repo_dir)
        .output()
        .with_context(|| "Failed to execute 'git reset'")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git reset failed: {}", stderr.trim());
    }
    Ok(())
}

fn short_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())[..12].to_string()
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
