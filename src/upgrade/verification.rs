//! Content checksums for package artifacts and upgrade files.
//!
//! Artifact checksums are SHA-256 digests rendered as `sha256:<lowercase hex>`.
//! Expected values in upgrade manifests may name their algorithm
//! (`sha256:<hex>`, `md5:<hex>`) or be bare hex in either case, in which case
//! 32 hex digits select MD5 and anything else SHA-256.

use anyhow::{Context, Result};
use md5::Md5;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::core::UpdaterError;

const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Computes and verifies file checksums.
pub struct ChecksumVerifier;

/// Digest algorithm of an expected checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm {
    Sha256,
    Md5,
}

impl ChecksumAlgorithm {
    /// Picks the algorithm from a `name:` prefix or the hex length.
    #[must_use]
    pub fn detect(checksum: &str) -> Self {
        let trimmed = checksum.trim();
        match trimmed.split_once(':') {
            Some((name, _)) if name.eq_ignore_ascii_case("md5") => Self::Md5,
            Some(_) => Self::Sha256,
            None if trimmed.len() == 32 => Self::Md5,
            None => Self::Sha256,
        }
    }

    const fn prefix(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Md5 => "md5",
        }
    }
}

impl ChecksumVerifier {
    /// Computes the SHA-256 checksum of a file, streaming its contents.
    ///
    /// # Returns
    ///
    /// The digest formatted as `sha256:<hex>`.
    pub async fn compute_sha256(file_path: &Path) -> Result<String> {
        Self::compute(file_path, ChecksumAlgorithm::Sha256).await
    }

    /// Computes a file checksum with `algorithm`, formatted as `<name>:<hex>`.
    pub async fn compute(file_path: &Path, algorithm: ChecksumAlgorithm) -> Result<String> {
        debug!("Computing {} checksum for: {}", algorithm.prefix(), file_path.display());

        let digest = match algorithm {
            ChecksumAlgorithm::Sha256 => hash_file::<Sha256>(file_path).await?,
            ChecksumAlgorithm::Md5 => hash_file::<Md5>(file_path).await?,
        };
        Ok(format!("{}:{digest}", algorithm.prefix()))
    }

    /// Verifies a file against an expected checksum.
    ///
    /// # Errors
    ///
    /// Returns [`UpdaterError::ChecksumMismatch`] when the digests differ.
    pub async fn verify_checksum(file_path: &Path, expected_checksum: &str) -> Result<()> {
        let actual = Self::compute(file_path, ChecksumAlgorithm::detect(expected_checksum)).await?;

        if normalize(&actual) != normalize(expected_checksum) {
            return Err(UpdaterError::ChecksumMismatch {
                path: file_path.display().to_string(),
                expected: expected_checksum.to_string(),
                actual,
            }
            .into());
        }

        debug!("Checksum verified for {}", file_path.display());
        Ok(())
    }
}

async fn hash_file<D: Digest>(file_path: &Path) -> Result<String> {
    let mut file = File::open(file_path)
        .await
        .with_context(|| format!("Failed to open file: {}", file_path.display()))?;

    let mut hasher = D::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let read = file
            .read(&mut buffer)
            .await
            .with_context(|| format!("Failed to read file: {}", file_path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

fn normalize(checksum: &str) -> String {
    let trimmed = checksum.trim();
    let hex = trimmed
        .split_once(':')
        .map_or(trimmed, |(_, digest)| digest);
    hex.to_ascii_lowercase()
}
