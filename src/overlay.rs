//! Overlay hash chain and the mount abstraction overlay-participating parts
//! are built against.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::errors::ConfigError;
use crate::part::PartSpec;

/// Compute the overlay hash chain for a sequence of parts in topological
/// order. `h(0) = H(base_layer_hash)`; each subsequent part folds in its
/// overlay script and packages. Parts that don't participate in overlay
/// simply pass the previous hash through unchanged.
pub fn chain(base_layer_hash: &str, parts_in_topo_order: &[&PartSpec]) -> Vec<String> {
    let mut hashes = Vec::with_capacity(parts_in_topo_order.len());
    let mut previous = hash_one(base_layer_hash.as_bytes());
    for part in parts_in_topo_order {
        if part.has_overlay() {
            let mut hasher = Sha256::new();
            hasher.update(previous.as_bytes());
            hasher.update(part.overlay_script.as_deref().unwrap_or("").as_bytes());
            for pkg in &part.overlay_packages {
                hasher.update(pkg.as_bytes());
            }
            for selector in &part.overlay_files_selector {
                hasher.update(selector.as_bytes());
            }
            previous = hex::encode(hasher.finalize());
        }
        hashes.push(previous.clone());
    }
    hashes
}

fn hash_one(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// One path changed by an overlay script run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayChange {
    Added(PathBuf),
    Modified(PathBuf),
    Removed(PathBuf),
}

/// Abstraction over mounting the stacked filesystem an overlay script runs
/// against. Real mounts require Linux and elevated privileges; tests and
/// non-Linux hosts supply a fake.
#[async_trait]
pub trait OverlayMounter: Send + Sync {
    async fn mount(&self, lower_dirs: &[PathBuf], upper_dir: &Path, mount_point: &Path) -> Result<(), ConfigError>;
    async fn unmount(&self, mount_point: &Path) -> Result<(), ConfigError>;
}

/// A mounter that just unions directories by copying, for platforms or
/// tests without real overlayfs support.
pub struct CopyOverlayMounter;

#[async_trait]
impl OverlayMounter for CopyOverlayMounter {
    async fn mount(&self, lower_dirs: &[PathBuf], upper_dir: &Path, mount_point: &Path) -> Result<(), ConfigError> {
        tokio::fs::create_dir_all(mount_point)
            .await
            .map_err(|e| ConfigError::FeatureError(e.to_string()))?;
        for lower in lower_dirs {
            copy_tree(lower, mount_point).map_err(|e| ConfigError::FeatureError(e.to_string()))?;
        }
        copy_tree(upper_dir, mount_point).map_err(|e| ConfigError::FeatureError(e.to_string()))?;
        Ok(())
    }

    async fn unmount(&self, _mount_point: &Path) -> Result<(), ConfigError> {
        Ok(())
    }
}

fn copy_tree(src: &Path, dest: &Path) -> std::io::Result<()> {
    if !src.exists() {
        return Ok(());
    }
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
