use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;

use crate::encoder::VariantDescriptor;

pub const MASTER_MANIFEST_NAME: &str = "index.m3u8";
pub const CHECKSUMS_NAME: &str = "checksums.json";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("no variants to assemble")]
    NoVariants,
    #[error("variant {label} playlist missing at {path}")]
    MissingVariant { label: String, path: PathBuf },
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type ManifestResult<T> = Result<T, ManifestError>;

/// Assembles the top-level adaptive-bitrate manifest for one job.
///
/// Variants are listed in ladder order. The manifest only ever appears at
/// its final path complete: it is written to a temporary name and renamed
/// into place, and assembly refuses to run while any referenced playlist
/// is missing on disk.
pub async fn build_master(
    out_dir: &Path,
    variants: &[VariantDescriptor],
) -> ManifestResult<PathBuf> {
    if variants.is_empty() {
        return Err(ManifestError::NoVariants);
    }
    for variant in variants {
        if fs::metadata(&variant.playlist).await.is_err() {
            return Err(ManifestError::MissingVariant {
                label: variant.label.clone(),
                path: variant.playlist.clone(),
            });
        }
    }

    let contents = master_playlist(variants);
    let final_path = out_dir.join(MASTER_MANIFEST_NAME);
    let staging_path = out_dir.join(format!("{MASTER_MANIFEST_NAME}.tmp"));
    fs::write(&staging_path, contents)
        .await
        .map_err(|source| ManifestError::Io {
            source,
            path: staging_path.clone(),
        })?;
    fs::rename(&staging_path, &final_path)
        .await
        .map_err(|source| ManifestError::Io {
            source,
            path: final_path.clone(),
        })?;
    Ok(final_path)
}

/// Renders the master playlist body. Playlist URIs are relative so the
/// whole output directory can be served or moved as one unit.
pub fn master_playlist(variants: &[VariantDescriptor]) -> String {
    let mut playlist = String::new();
    playlist.push_str("#EXTM3U\n");
    playlist.push_str("#EXT-X-VERSION:3\n");
    for variant in variants {
        playlist.push_str(&format!(
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}x{}\n",
            estimated_bandwidth(variant),
            variant.width,
            variant.height
        ));
        let uri = variant
            .playlist
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| variant.playlist.to_string_lossy().to_string());
        playlist.push_str(&uri);
        playlist.push('\n');
    }
    playlist
}

/// Bandwidth attribute in bits/sec. This is an estimate, not a measured
/// bitrate: the rung's target bitrate when it carries one, otherwise a
/// nominal bits-per-pixel tier heuristic.
pub fn estimated_bandwidth(variant: &VariantDescriptor) -> u64 {
    if variant.bitrate_kbps > 0 {
        return variant.bitrate_kbps as u64 * 1000;
    }
    const BITS_PER_PIXEL_PER_SECOND: f64 = 2.4;
    let pixels = variant.width as u64 * variant.height as u64;
    (pixels as f64 * BITS_PER_PIXEL_PER_SECOND) as u64
}

/// Writes a sha256 digest per playlist artifact beside the manifest, for
/// integrity checks during distribution. Runs after the manifest is
/// published; nothing references it.
pub async fn write_checksums(
    out_dir: &Path,
    variants: &[VariantDescriptor],
) -> ManifestResult<PathBuf> {
    let mut checksums = BTreeMap::new();
    let mut targets: Vec<PathBuf> = variants.iter().map(|v| v.playlist.clone()).collect();
    targets.push(out_dir.join(MASTER_MANIFEST_NAME));
    for path in targets {
        let bytes = fs::read(&path).await.map_err(|source| ManifestError::Io {
            source,
            path: path.clone(),
        })?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let relative = path
            .strip_prefix(out_dir)
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_else(|_| path.to_string_lossy().to_string());
        checksums.insert(relative, hex::encode(hasher.finalize()));
    }
    let path = out_dir.join(CHECKSUMS_NAME);
    let body = serde_json::to_vec_pretty(&checksums)?;
    fs::write(&path, body)
        .await
        .map_err(|source| ManifestError::Io {
            source,
            path: path.clone(),
        })?;
    Ok(path)
}
