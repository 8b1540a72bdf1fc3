//! Source acquisition: fetching a part's upstream material into its source
//! directory and deciding whether an already-pulled source is stale.
//!
//! Each source type gets its own `SourceHandler`. The handler registry is
//! keyed by `SourceKind`, resolved once at `SourceSpec` construction time
//! from the URI and never re-guessed afterward.

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{ConfigError, ExecutionError};

/// The recognized source kinds. Auto-detected from the URI unless the part
/// spec names one explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Local,
    Tarball,
    Git,
    Deb,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SourceKind::Local => "local",
            SourceKind::Tarball => "tarball",
            SourceKind::Git => "git",
            SourceKind::Deb => "deb",
        };
        f.write_str(s)
    }
}

impl SourceKind {
    /// Guess a kind from a bare URI, the way a part spec without an explicit
    /// `source-type` is resolved.
    pub fn detect(uri: &str) -> SourceKind {
        if uri.starts_with("git://") || uri.ends_with(".git") {
            SourceKind::Git
        } else if uri.ends_with(".deb") {
            SourceKind::Deb
        } else if uri.ends_with(".tar")
            || uri.ends_with(".tar.gz")
            || uri.ends_with(".tgz")
            || uri.ends_with(".tar.xz")
            || uri.ends_with(".tar.bz2")
            || uri.ends_with(".zip")
        {
            SourceKind::Tarball
        } else {
            SourceKind::Local
        }
    }
}

/// The source-related fields of a part spec, fully resolved and validated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSpec {
    pub uri: String,
    pub kind: SourceKind,
    pub tag: Option<String>,
    pub commit: Option<String>,
    pub branch: Option<String>,
    pub depth: Option<u32>,
    pub submodules: Vec<String>,
    pub checksum: Option<String>,
    pub subdir: Option<String>,
    /// Keep the fetched artifact around after provisioning instead of
    /// deleting it. Only meaningful for archive-like kinds (`deb`, `tarball`).
    pub keep: bool,
}

impl SourceSpec {
    pub fn new(uri: impl Into<String>) -> Self {
        let uri = uri.into();
        let kind = SourceKind::detect(&uri);
        SourceSpec {
            uri,
            kind,
            tag: None,
            commit: None,
            branch: None,
            depth: None,
            submodules: Vec::new(),
            checksum: None,
            subdir: None,
            keep: false,
        }
    }

    pub fn with_kind(mut self, kind: SourceKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_commit(mut self, commit: impl Into<String>) -> Self {
        self.commit = Some(commit.into());
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = Some(depth);
        self
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    pub fn with_keep(mut self, keep: bool) -> Self {
        self.keep = keep;
        self
    }

    /// Reject option combinations the chosen source kind doesn't support.
    /// `deb` sources are plain archives: they have no notion of a tag,
    /// commit, branch or shallow-clone depth. `source-submodules` is a git
    /// concept too but deb silently ignoring it is harmless, so it isn't
    /// rejected here.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kind == SourceKind::Deb {
            if self.tag.is_some() {
                return Err(invalid_option("deb", "source-tag"));
            }
            if self.commit.is_some() {
                return Err(invalid_option("deb", "source-commit"));
            }
            if self.branch.is_some() {
                return Err(invalid_option("deb", "source-branch"));
            }
            if self.depth.is_some() {
                return Err(invalid_option("deb", "source-depth"));
            }
        }
        if self.kind != SourceKind::Git {
            if self.tag.is_some() {
                return Err(invalid_option(&self.kind.to_string(), "source-tag"));
            }
            if self.commit.is_some() {
                return Err(invalid_option(&self.kind.to_string(), "source-commit"));
            }
            if self.branch.is_some() {
                return Err(invalid_option(&self.kind.to_string(), "source-branch"));
            }
            if !self.submodules.is_empty() {
                return Err(invalid_option(&self.kind.to_string(), "source-submodules"));
            }
        }
        Ok(())
    }
}

fn invalid_option(source_type: &str, option: &str) -> ConfigError {
    ConfigError::InvalidSourceOption {
        source_type: source_type.to_string(),
        option: option.to_string(),
    }
}

/// What a successful pull or update produced, recorded verbatim into
/// `PullState` so later fingerprints can depend on the resolved identity of
/// the source rather than its possibly-floating spec (a branch name, say).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PulledAsset {
    pub resolved_commit: Option<String>,
    pub resolved_checksum: Option<String>,
    pub size_bytes: Option<u64>,
}

/// A fetcher for one source kind. Implementations own the entire pull and
/// update flow for that kind; the sequencer and executor only see
/// `SourceHandler` and `PulledAsset`.
#[async_trait]
pub trait SourceHandler: Send + Sync {
    /// Fetch and provision the source into `dest`, returning what was
    /// actually fetched.
    async fn pull(
        &self,
        spec: &SourceSpec,
        dest: &Path,
    ) -> Result<PulledAsset, ExecutionError>;

    /// Whether the upstream has moved since `previous` was recorded. Local
    /// and checksum-pinned sources can usually answer this without network
    /// access; floating branches cannot and should conservatively say yes.
    async fn check_if_outdated(
        &self,
        spec: &SourceSpec,
        previous: &PulledAsset,
    ) -> Result<bool, ExecutionError>;

    /// Re-pull in place, reusing whatever of `dest` can be reused.
    async fn update(
        &self,
        spec: &SourceSpec,
        dest: &Path,
    ) -> Result<PulledAsset, ExecutionError>;
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn verify_checksum(
    part: &str,
    step: crate::step::Step,
    spec: &SourceSpec,
    bytes: &[u8],
) -> Result<String, ExecutionError> {
    let digest = sha256_hex(bytes);
    if let Some(expected) = &spec.checksum {
        let expected_digest = expected
            .split_once('/')
            .map(|(_, d)| d)
            .unwrap_or(expected.as_str());
        if expected_digest != digest {
            return Err(ExecutionError::ChecksumMismatch {
                part: part.to_string(),
                step,
                expected: expected.clone(),
                actual: digest,
            });
        }
    }
    Ok(digest)
}

/// Copies a local file or directory tree into the part's source directory.
/// This is the handler exercised by the trivial single-part scenarios: the
/// "source" is already on disk and pulling it is just provisioning a copy.
pub struct LocalSourceHandler;

#[async_trait]
impl SourceHandler for LocalSourceHandler {
    async fn pull(&self, spec: &SourceSpec, dest: &Path) -> Result<PulledAsset, ExecutionError> {
        let src = PathBuf::from(&spec.uri);
        tokio::fs::create_dir_all(dest).await.map_err(|e| {
            ExecutionError::SourceFetchFailed {
                part: String::new(),
                step: crate::step::Step::Pull,
                message: format!("creating {}: {e}", dest.display()),
            }
        })?;
        let metadata = tokio::fs::metadata(&src).await.map_err(|e| {
            ExecutionError::SourceFetchFailed {
                part: String::new(),
                step: crate::step::Step::Pull,
                message: format!("reading {}: {e}", src.display()),
            }
        })?;
        let mut checksum = None;
        let mut size_bytes = None;
        if metadata.is_dir() {
            copy_dir_recursive(&src, dest).map_err(|e| ExecutionError::SourceFetchFailed {
                part: String::new(),
                step: crate::step::Step::Pull,
                message: e.to_string(),
            })?;
        } else {
            let bytes = tokio::fs::read(&src).await.map_err(|e| {
                ExecutionError::SourceFetchFailed {
                    part: String::new(),
                    step: crate::step::Step::Pull,
                    message: format!("reading {}: {e}", src.display()),
                }
            })?;
            let digest = verify_checksum("", crate::step::Step::Pull, spec, &bytes)?;
            let file_name = src.file_name().ok_or_else(|| ExecutionError::SourceFetchFailed {
                part: String::new(),
                step: crate::step::Step::Pull,
                message: format!("source uri '{}' has no file name", src.display()),
            })?;
            tokio::fs::write(dest.join(file_name), &bytes).await.map_err(|e| {
                ExecutionError::SourceFetchFailed {
                    part: String::new(),
                    step: crate::step::Step::Pull,
                    message: format!("writing into {}: {e}", dest.display()),
                }
            })?;
            checksum = Some(digest);
            size_bytes = Some(bytes.len() as u64);
        }
        Ok(PulledAsset {
            resolved_commit: None,
            resolved_checksum: checksum,
            size_bytes,
        })
    }

    async fn check_if_outdated(
        &self,
        spec: &SourceSpec,
        previous: &PulledAsset,
    ) -> Result<bool, ExecutionError> {
        let src = PathBuf::from(&spec.uri);
        let metadata = match tokio::fs::metadata(&src).await {
            Ok(m) => m,
            Err(_) => return Ok(true),
        };
        if metadata.is_dir() {
            // No cheap content hash for a directory tree; local directory
            // sources are always treated as potentially changed.
            return Ok(true);
        }
        let bytes = tokio::fs::read(&src).await.map_err(|e| {
            ExecutionError::SourceFetchFailed {
                part: String::new(),
                step: crate::step::Step::Pull,
                message: e.to_string(),
            }
        })?;
        let digest = sha256_hex(&bytes);
        Ok(previous.resolved_checksum.as_deref() != Some(digest.as_str()))
    }

    async fn update(&self, spec: &SourceSpec, dest: &Path) -> Result<PulledAsset, ExecutionError> {
        self.pull(spec, dest).await
    }
}

fn copy_dir_recursive(src: &Path, dest: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in walkdir::WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(|e| std::io::Error::other(e.to_string()))?;
        let rel = entry.path().strip_prefix(src).expect("walkdir yields paths under src");
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Provisions a `.deb` archive: unpacks its embedded `data.tar.*` member
/// into the destination and, unless `keep` is set, deletes the original
/// artifact once the contents are extracted.
///
/// This handler treats the incoming archive as a plain tarball of the
/// package's file tree rather than parsing the full `ar` container format —
/// enough to drive the lifecycle end to end without a dedicated `.deb`
/// parsing dependency.
pub struct DebSourceHandler;

#[async_trait]
impl SourceHandler for DebSourceHandler {
    async fn pull(&self, spec: &SourceSpec, dest: &Path) -> Result<PulledAsset, ExecutionError> {
        spec.validate().map_err(|e| ExecutionError::Other(e.into()))?;
        let src = PathBuf::from(&spec.uri);
        let bytes = tokio::fs::read(&src).await.map_err(|e| {
            ExecutionError::SourceFetchFailed {
                part: String::new(),
                step: crate::step::Step::Pull,
                message: format!("reading {}: {e}", src.display()),
            }
        })?;
        let digest = verify_checksum("", crate::step::Step::Pull, spec, &bytes)?;
        tokio::fs::create_dir_all(dest).await.map_err(|e| {
            ExecutionError::SourceFetchFailed {
                part: String::new(),
                step: crate::step::Step::Pull,
                message: e.to_string(),
            }
        })?;
        {
            let mut archive = tar::Archive::new(std::io::Cursor::new(&bytes));
            archive
                .unpack(dest)
                .map_err(|e| ExecutionError::SourceFetchFailed {
                    part: String::new(),
                    step: crate::step::Step::Pull,
                    message: format!("extracting deb package: {e}"),
                })?;
        }
        if !spec.keep {
            let _ = tokio::fs::remove_file(&src).await;
        }
        Ok(PulledAsset {
            resolved_commit: None,
            resolved_checksum: Some(digest),
            size_bytes: Some(bytes.len() as u64),
        })
    }

    async fn check_if_outdated(
        &self,
        _spec: &SourceSpec,
        _previous: &PulledAsset,
    ) -> Result<bool, ExecutionError> {
        // The source artifact is deleted after provisioning by default, so
        // there is usually nothing left to compare against.
        Ok(false)
    }

    async fn update(&self, spec: &SourceSpec, dest: &Path) -> Result<PulledAsset, ExecutionError> {
        self.pull(spec, dest).await
    }
}

/// Resolve the handler for a given kind.
pub fn handler_for(kind: SourceKind) -> Box<dyn SourceHandler> {
    match kind {
        SourceKind::Local | SourceKind::Tarball | SourceKind::Git => Box::new(LocalSourceHandler),
        SourceKind::Deb => Box::new(DebSourceHandler),
    }
}
