//! Package decompression and tar extraction.
//!
//! Packages are gzip-compressed tar streams. Decompression inflates the
//! package next to its destination, then [`ArchiveReader::untar`] walks the
//! raw tar stream one 512-byte header at a time.
//!
//! Every entry name is resolved under the output root before anything is
//! written. Entries that would land outside it are logged and skipped, and the
//! rest of the archive is still extracted. Destination files that cannot be
//! written are retried through [`LockRetry`], which may terminate processes
//! holding the file open.
//!
//! Headers follow the POSIX ustar layout. The `prefix` field, GNU long names
//! and the `path` record of pax extended headers are honored so archives
//! produced by common `tar` implementations extract with their full names.

use anyhow::{Context, Result};
use flate2::write::GzDecoder;
use std::io::{SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use super::lock_recovery::{LockRetry, LockRetryPolicy, ProcessTerminator, SystemProcessTerminator};
use super::progress::{ProgressSink, ThrottledProgress};
use crate::constants::TAR_BLOCK_SIZE;
use crate::core::UpdaterError;
use crate::utils::fs::{ensure_dir, resolve_contained};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Upper bound for GNU long-name and pax header payloads.
const MAX_METADATA_SIZE: u64 = 1024 * 1024;

/// Kind of a tar entry, from the header's type flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular file (`'0'` or NUL).
    File,
    /// Directory (`'5'`).
    Directory,
    /// GNU long name for the following entry (`'L'`).
    GnuLongName,
    /// Pax extended header for the following entry (`'x'`).
    PaxExtended,
    /// Pax global header (`'g'`).
    PaxGlobal,
    /// Links, devices and anything else.
    Other(u8),
}

impl From<u8> for EntryKind {
    fn from(flag: u8) -> Self {
        match flag {
            b'0' | b'\0' | b'7' => Self::File,
            b'5' => Self::Directory,
            b'L' => Self::GnuLongName,
            b'x' => Self::PaxExtended,
            b'g' => Self::PaxGlobal,
            other => Self::Other(other),
        }
    }
}

/// Fields extracted from one tar header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarHeader {
    pub name: String,
    pub size: u64,
    pub kind: EntryKind,
}

impl TarHeader {
    /// Payload plus padding up to the next block boundary.
    #[must_use]
    pub const fn padded_size(&self) -> u64 {
        self.size + padding_for(self.size)
    }
}

/// Counts collected while extracting an archive.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UntarSummary {
    /// Files written.
    pub files: usize,
    /// Directory markers created.
    pub directories: usize,
    /// Payload bytes written.
    pub bytes: u64,
    /// Entry names skipped because they resolved outside the output root.
    pub skipped: Vec<String>,
}

/// Bytes needed after a payload of `size` to reach the next block boundary.
#[must_use]
pub const fn padding_for(size: u64) -> u64 {
    let block = TAR_BLOCK_SIZE as u64;
    (block - size % block) % block
}

/// Parses a header block.
///
/// Returns `Ok(None)` for the end-of-archive marker: an all-zero block or a
/// block whose name field is empty.
pub fn parse_header(block: &[u8; TAR_BLOCK_SIZE]) -> Result<Option<TarHeader>> {
    if block.iter().all(|&b| b == 0) {
        return Ok(None);
    }

    let mut name = field_str(&block[0..100]);
    if name.is_empty() {
        return Ok(None);
    }

    verify_header_checksum(block)?;

    if &block[257..262] == b"ustar" {
        let prefix = field_str(&block[345..500]);
        if !prefix.is_empty() {
            name = format!("{prefix}/{name}");
        }
    }

    let size = parse_size(&block[124..136]).with_context(|| format!("Invalid header for entry '{name}'"))?;

    Ok(Some(TarHeader {
        name,
        size,
        kind: EntryKind::from(block[156]),
    }))
}

/// Reads a text field up to its first NUL, trimming surrounding spaces.
fn field_str(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).trim_matches(' ').to_string()
}

/// Reads a numeric field with NUL and space padding removed.
fn numeric_field(field: &[u8]) -> String {
    String::from_utf8_lossy(field)
        .trim_matches(|c: char| c == '\0' || c == ' ')
        .to_string()
}

/// Parses the size field: ASCII octal, or GNU base-256 for large entries.
fn parse_size(field: &[u8]) -> Result<u64> {
    if field[0] & 0x80 != 0 {
        let mut value: u64 = 0;
        for (i, &byte) in field.iter().enumerate() {
            let byte = if i == 0 { byte & 0x7f } else { byte };
            value = value
                .checked_mul(256)
                .and_then(|v| v.checked_add(u64::from(byte)))
                .ok_or_else(|| UpdaterError::ArchiveFormatError {
                    reason: "entry size overflows".to_string(),
                })?;
        }
        return Ok(value);
    }

    let text = numeric_field(field);
    u64::from_str_radix(&text, 8).map_err(|_| {
        UpdaterError::ArchiveFormatError {
            reason: format!("size field '{text}' is not an octal number"),
        }
        .into()
    })
}

/// Checks the header checksum when the archive stores one.
///
/// Some writers sum the header as signed bytes; either sum is accepted.
fn verify_header_checksum(block: &[u8; TAR_BLOCK_SIZE]) -> Result<()> {
    let stored = numeric_field(&block[148..156]);
    if stored.is_empty() {
        return Ok(());
    }

    let expected = i64::from_str_radix(&stored, 8).map_err(|_| UpdaterError::ArchiveFormatError {
        reason: format!("checksum field '{stored}' is not an octal number"),
    })?;

    let header_bytes = || {
        block
            .iter()
            .enumerate()
            .map(|(i, &b)| if (148..156).contains(&i) { b' ' } else { b })
    };
    let actual: i64 = header_bytes().map(i64::from).sum();
    let signed: i64 = header_bytes().map(|b| i64::from(b as i8)).sum();

    if actual != expected && signed != expected {
        return Err(UpdaterError::ArchiveFormatError {
            reason: format!("header checksum mismatch (stored {expected}, computed {actual})"),
        }
        .into());
    }
    Ok(())
}

/// Extracts the `path` record from a pax extended header payload.
fn pax_path(data: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(data);
    text.lines().find_map(|record| {
        let (_, pair) = record.split_once(' ')?;
        let value = pair.strip_prefix("path=")?;
        Some(value.to_string())
    })
}

/// Output name for a decompressed package: `app.tar.gz` becomes `app.tar`.
fn decompressed_name(input: &Path) -> String {
    let name = input
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "package".to_string());

    if name.len() > 3 && name.to_ascii_lowercase().ends_with(".gz") {
        name[..name.len() - 3].to_string()
    } else if name.to_ascii_lowercase().ends_with(".tgz") {
        format!("{}.tar", &name[..name.len() - 4])
    } else {
        format!("{name}.tar")
    }
}

enum EntryFailure {
    /// Reading the archive failed; not retryable.
    Read(anyhow::Error),
    /// Creating or writing the destination failed; retried.
    Write(std::io::Error),
}

/// Decompresses and extracts update packages.
#[derive(Clone)]
pub struct ArchiveReader {
    terminator: Arc<dyn ProcessTerminator>,
    retry_policy: LockRetryPolicy,
}

impl Default for ArchiveReader {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveReader {
    /// Creates a reader that terminates lock holders through the OS process table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            terminator: Arc::new(SystemProcessTerminator),
            retry_policy: LockRetryPolicy::default(),
        }
    }

    /// Replaces the process terminator used for locked destination files.
    #[must_use]
    pub fn with_terminator(mut self, terminator: Arc<dyn ProcessTerminator>) -> Self {
        self.terminator = terminator;
        self
    }

    /// Replaces the locked-file retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: LockRetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Locked-file retry policy applied to every destination write.
    #[must_use]
    pub const fn retry_policy(&self) -> &LockRetryPolicy {
        &self.retry_policy
    }

    /// Terminator invoked for destination files that stay locked.
    #[must_use]
    pub fn terminator(&self) -> &dyn ProcessTerminator {
        self.terminator.as_ref()
    }

    /// Inflates a gzip package into `output_dir` and returns the tar path.
    ///
    /// Progress is reported against the compressed size.
    pub async fn decompress(
        &self,
        input: &Path,
        output_dir: &Path,
        sink: &dyn ProgressSink,
    ) -> Result<PathBuf> {
        ensure_dir(output_dir).await?;
        let output_path = output_dir.join(decompressed_name(input));
        info!("Decompressing {} to {}", input.display(), output_path.display());

        let mut source = File::open(input)
            .await
            .with_context(|| format!("Failed to open package: {}", input.display()))?;
        let total = source.metadata().await.ok().map(|m| m.len());
        let mut output = File::create(&output_path)
            .await
            .with_context(|| format!("Failed to create {}", output_path.display()))?;

        let mut progress = ThrottledProgress::new(sink);
        progress.start(total);

        let mut decoder = GzDecoder::new(Vec::new());
        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        let mut consumed: u64 = 0;

        loop {
            let read = source.read(&mut buffer).await.context("Failed to read package")?;
            if read == 0 {
                break;
            }
            decoder.write_all(&buffer[..read]).map_err(|e| UpdaterError::ArchiveFormatError {
                reason: format!("invalid gzip data: {e}"),
            })?;

            let inflated = decoder.get_mut();
            if !inflated.is_empty() {
                output.write_all(inflated).await?;
                inflated.clear();
            }

            consumed += read as u64;
            progress.update(consumed, total);
        }

        let rest = decoder.finish().map_err(|e| UpdaterError::ArchiveFormatError {
            reason: format!("truncated gzip data: {e}"),
        })?;
        output.write_all(&rest).await?;
        output.flush().await?;

        progress.finish(consumed, total);
        debug!("Decompressed {} bytes from {}", consumed, input.display());
        Ok(output_path)
    }

    /// Extracts a tar file into `output_root`.
    pub async fn untar(
        &self,
        tar_path: &Path,
        output_root: &Path,
        sink: &dyn ProgressSink,
    ) -> Result<UntarSummary> {
        let file = File::open(tar_path)
            .await
            .with_context(|| format!("Failed to open archive: {}", tar_path.display()))?;
        let total = file.metadata().await.ok().map(|m| m.len());

        info!("Extracting {} into {}", tar_path.display(), output_root.display());
        self.untar_reader(BufReader::new(file), total, output_root, sink).await
    }

    /// Extracts a tar stream into `output_root`.
    ///
    /// `total` is the stream length when known; with `None` progress reports
    /// processed bytes only.
    pub async fn untar_reader<R>(
        &self,
        mut reader: R,
        total: Option<u64>,
        output_root: &Path,
        sink: &dyn ProgressSink,
    ) -> Result<UntarSummary>
    where
        R: AsyncRead + AsyncSeek + Unpin,
    {
        ensure_dir(output_root).await?;

        let mut progress = ThrottledProgress::new(sink);
        progress.start(total);

        let mut summary = UntarSummary::default();
        let mut processed: u64 = 0;
        let mut pending_name: Option<String> = None;
        let mut block = [0u8; TAR_BLOCK_SIZE];

        while read_block(&mut reader, &mut block).await? {
            processed += TAR_BLOCK_SIZE as u64;
            let Some(header) = parse_header(&block)? else {
                break;
            };
            let padded = header.padded_size();

            match header.kind {
                EntryKind::GnuLongName => {
                    let data = read_metadata(&mut reader, &header).await?;
                    pending_name = Some(field_str(&data));
                    processed += padded;
                    continue;
                }
                EntryKind::PaxExtended => {
                    let data = read_metadata(&mut reader, &header).await?;
                    if let Some(path) = pax_path(&data) {
                        pending_name = Some(path);
                    }
                    processed += padded;
                    continue;
                }
                EntryKind::PaxGlobal => {
                    skip_bytes(&mut reader, padded).await?;
                    processed += padded;
                    continue;
                }
                _ => {}
            }

            let name = pending_name.take().unwrap_or(header.name);

            let Some(destination) = resolve_contained(output_root, &name) else {
                warn!("Skipping archive entry outside {}: {}", output_root.display(), name);
                summary.skipped.push(name);
                skip_bytes(&mut reader, padded).await?;
                processed += padded;
                progress.update(processed, total);
                continue;
            };

            if header.size == 0 {
                if header.kind == EntryKind::Directory || name.ends_with('/') {
                    ensure_dir(&destination).await?;
                    summary.directories += 1;
                }
                continue;
            }

            if matches!(header.kind, EntryKind::Other(_)) {
                debug!("Skipping unsupported entry type for {name}");
                skip_bytes(&mut reader, padded).await?;
                processed += padded;
                continue;
            }

            if let Some(parent) = destination.parent() {
                ensure_dir(parent).await?;
            }

            let payload_start = reader.stream_position().await?;
            let mut retry = LockRetry::new(&destination, &self.retry_policy, self.terminator.as_ref());
            loop {
                let written = write_entry(
                    &mut reader,
                    header.size,
                    &destination,
                    &mut progress,
                    (processed, total),
                )
                .await;
                match written {
                    Ok(()) => break,
                    Err(EntryFailure::Read(e)) => return Err(e),
                    Err(EntryFailure::Write(e)) => {
                        retry.record_failure(e).await?;
                        reader.seek(SeekFrom::Start(payload_start)).await?;
                    }
                }
            }

            skip_bytes(&mut reader, padding_for(header.size)).await?;
            processed += padded;
            summary.files += 1;
            summary.bytes += header.size;
            debug!("Extracted {} ({} bytes)", destination.display(), header.size);
            progress.update(processed, total);
        }

        progress.finish(processed, total);
        info!(
            "Extracted {} file(s), {} director(ies), skipped {}",
            summary.files,
            summary.directories,
            summary.skipped.len()
        );
        Ok(summary)
    }

    /// Extracts a package into `output_root`.
    ///
    /// Gzip packages are inflated into a temporary directory first; anything
    /// else is treated as a raw tar stream.
    pub async fn extract(
        &self,
        archive: &Path,
        output_root: &Path,
        sink: &dyn ProgressSink,
    ) -> Result<UntarSummary> {
        let is_gzip = archive
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("gz") || ext.eq_ignore_ascii_case("tgz"));

        if !is_gzip {
            return self.untar(archive, output_root, sink).await;
        }

        let scratch = tempfile::tempdir().context("Failed to create temporary directory")?;
        let tar_path = self.decompress(archive, scratch.path(), sink).await?;
        self.untar(&tar_path, output_root, sink).await
    }
}

/// Reads one header block. Returns `false` on a clean end of stream.
async fn read_block<R>(reader: &mut R, block: &mut [u8; TAR_BLOCK_SIZE]) -> Result<bool>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < TAR_BLOCK_SIZE {
        let read = reader.read(&mut block[filled..]).await.context("Failed to read archive")?;
        if read == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(UpdaterError::ArchiveFormatError {
                reason: format!("truncated header block ({filled} of {TAR_BLOCK_SIZE} bytes)"),
            }
            .into());
        }
        filled += read;
    }
    Ok(true)
}

async fn read_metadata<R>(reader: &mut R, header: &TarHeader) -> Result<Vec<u8>>
where
    R: AsyncRead + AsyncSeek + Unpin,
{
    if header.size > MAX_METADATA_SIZE {
        return Err(UpdaterError::ArchiveFormatError {
            reason: format!("metadata entry of {} bytes is too large", header.size),
        }
        .into());
    }

    let mut data = vec![0u8; header.size as usize];
    reader.read_exact(&mut data).await.map_err(|_| UpdaterError::ArchiveFormatError {
        reason: "unexpected end of archive in metadata entry".to_string(),
    })?;
    skip_bytes(reader, padding_for(header.size)).await?;
    Ok(data)
}

async fn skip_bytes<R>(reader: &mut R, count: u64) -> Result<()>
where
    R: AsyncSeek + Unpin,
{
    if count > 0 {
        let offset = i64::try_from(count).context("Entry too large to skip")?;
        reader.seek(SeekFrom::Current(offset)).await.context("Failed to seek archive")?;
    }
    Ok(())
}

/// Streams exactly `size` payload bytes into `destination`.
async fn write_entry<R>(
    reader: &mut R,
    size: u64,
    destination: &Path,
    progress: &mut ThrottledProgress<'_>,
    (processed, total): (u64, Option<u64>),
) -> std::result::Result<(), EntryFailure>
where
    R: AsyncRead + Unpin,
{
    let mut file = File::create(destination).await.map_err(EntryFailure::Write)?;
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut remaining = size;

    while remaining > 0 {
        let want = remaining.min(buffer.len() as u64) as usize;
        let read = reader
            .read(&mut buffer[..want])
            .await
            .map_err(|e| EntryFailure::Read(anyhow::Error::new(e).context("Failed to read archive")))?;
        if read == 0 {
            return Err(EntryFailure::Read(
                UpdaterError::ArchiveFormatError {
                    reason: format!("unexpected end of archive in {}", destination.display()),
                }
                .into(),
            ));
        }

        file.write_all(&buffer[..read]).await.map_err(EntryFailure::Write)?;
        remaining -= read as u64;
        progress.update(processed + (size - remaining), total);
    }

    file.flush().await.map_err(EntryFailure::Write)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{CountingTerminator, RecordingProgress, TarBuilder, gzip};
    use crate::upgrade::progress::NoProgress;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn reader() -> ArchiveReader {
        ArchiveReader::new().with_terminator(Arc::new(CountingTerminator::default()))
    }

    #[test]
    fn test_padding() {
        assert_eq!(padding_for(0), 0);
        assert_eq!(padding_for(1), 511);
        assert_eq!(padding_for(512), 0);
        assert_eq!(padding_for(513), 511);
        assert_eq!(padding_for(1000), 24);
    }

    #[test]
    fn test_parse_header_fields() {
        let tar = TarBuilder::new().file("bin/tool", b"hello").build();
        let block: [u8; TAR_BLOCK_SIZE] = tar[..TAR_BLOCK_SIZE].try_into().unwrap();
        let header = parse_header(&block).unwrap().unwrap();
        assert_eq!(header.name, "bin/tool");
        assert_eq!(header.size, 5);
        assert_eq!(header.kind, EntryKind::File);
        assert_eq!(header.padded_size(), 512);
    }

    #[test]
    fn test_zero_block_terminates() {
        let block = [0u8; TAR_BLOCK_SIZE];
        assert!(parse_header(&block).unwrap().is_none());
    }

    #[test]
    fn test_non_octal_size_is_fatal() {
        let tar = TarBuilder::new().raw_entry("bad.txt", b"12x45", b'0', b"").build();
        let block: [u8; TAR_BLOCK_SIZE] = tar[..TAR_BLOCK_SIZE].try_into().unwrap();
        let err = parse_header(&block).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UpdaterError>(),
            Some(UpdaterError::ArchiveFormatError { .. })
        ));
    }

    fn with_checksum(mut block: [u8; TAR_BLOCK_SIZE], sum: i64) -> [u8; TAR_BLOCK_SIZE] {
        block[148..156].copy_from_slice(format!("{sum:06o}\0 ").as_bytes());
        block
    }

    #[test]
    fn test_signed_header_checksum_is_accepted() {
        let tar = TarBuilder::new().file("caf\u{e9}.txt", b"x").build();
        let mut block: [u8; TAR_BLOCK_SIZE] = tar[..TAR_BLOCK_SIZE].try_into().unwrap();
        block[148..156].fill(b' ');
        let signed: i64 = block.iter().map(|&b| i64::from(b as i8)).sum();

        let header = parse_header(&with_checksum(block, signed)).unwrap().unwrap();
        assert_eq!(header.name, "caf\u{e9}.txt");

        let err = parse_header(&with_checksum(block, signed + 1)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UpdaterError>(),
            Some(UpdaterError::ArchiveFormatError { .. })
        ));
    }

    #[test]
    fn test_base256_size() {
        let mut field = [0u8; 12];
        field[0] = 0x80;
        field[10] = 0x01;
        field[11] = 0x00;
        assert_eq!(parse_size(&field).unwrap(), 256);
    }

    #[test]
    fn test_pax_path_record() {
        let data = b"30 mtime=1700000000.123456789\n24 path=deep/nested/a.txt\n";
        assert_eq!(pax_path(data).as_deref(), Some("deep/nested/a.txt"));
        assert_eq!(pax_path(b"20 uid=1000\n"), None);
    }

    #[test]
    fn test_decompressed_name() {
        assert_eq!(decompressed_name(Path::new("/w/app-1.2.3.tar.gz")), "app-1.2.3.tar");
        assert_eq!(decompressed_name(Path::new("bundle.tgz")), "bundle.tar");
        assert_eq!(decompressed_name(Path::new("unknown.gz")), "unknown");
        assert_eq!(decompressed_name(Path::new("raw")), "raw.tar");
    }

    #[tokio::test]
    async fn test_untar_reproduces_files() -> Result<()> {
        let out = TempDir::new()?;
        let big: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let tar = TarBuilder::new()
            .directory("bin/")
            .file("bin/app", &big)
            .file("README.txt", b"read me")
            .file("config/settings.json", b"{\"a\":1}")
            .build();

        let total = tar.len() as u64;
        let summary = reader()
            .untar_reader(Cursor::new(tar), Some(total), out.path(), &NoProgress)
            .await?;

        assert_eq!(summary.files, 3);
        assert_eq!(summary.directories, 1);
        assert_eq!(summary.bytes, 5000 + 7 + 7);
        assert_eq!(tokio::fs::read(out.path().join("bin/app")).await?, big);
        assert_eq!(tokio::fs::read(out.path().join("README.txt")).await?, b"read me");
        assert_eq!(tokio::fs::read_to_string(out.path().join("config/settings.json")).await?, "{\"a\":1}");
        Ok(())
    }

    #[tokio::test]
    async fn test_untar_round_trip_tree() -> Result<()> {
        let out = TempDir::new()?;
        let entries: Vec<(String, Vec<u8>)> = (0..12)
            .map(|i| (format!("dir{}/file{i}.bin", i % 3), vec![i as u8; 300 * i + 1]))
            .collect();

        let mut builder = TarBuilder::new();
        for (name, data) in &entries {
            builder = builder.file(name, data);
        }
        let tar = builder.build();
        let total = tar.len() as u64;
        reader()
            .untar_reader(Cursor::new(tar), Some(total), out.path(), &NoProgress)
            .await?;

        let mut extracted: Vec<String> = walkdir::WalkDir::new(out.path())
            .into_iter()
            .filter_map(std::result::Result::ok)
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                e.path()
                    .strip_prefix(out.path())
                    .unwrap()
                    .to_string_lossy()
                    .replace('\\', "/")
            })
            .collect();
        extracted.sort();
        let mut expected: Vec<String> = entries.iter().map(|(n, _)| n.clone()).collect();
        expected.sort();
        assert_eq!(extracted, expected);

        for (name, data) in &entries {
            assert_eq!(&tokio::fs::read(out.path().join(name)).await?, data);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_traversal_entries_are_skipped() -> Result<()> {
        let parent = TempDir::new()?;
        let out = parent.path().join("root");
        let tar = TarBuilder::new()
            .file("../escape.txt", b"evil")
            .file("a/../../escape2.txt", b"evil")
            .file("..\\escape3.txt", b"evil")
            .file("/abs/inside.txt", b"stays inside")
            .file("good.txt", b"good")
            .build();

        let summary = reader()
            .untar_reader(Cursor::new(tar), None, &out, &NoProgress)
            .await?;

        assert_eq!(summary.skipped.len(), 3);
        assert!(!parent.path().join("escape.txt").exists());
        assert!(!parent.path().join("escape2.txt").exists());
        assert!(!parent.path().join("escape3.txt").exists());
        assert_eq!(tokio::fs::read_to_string(out.join("abs/inside.txt")).await?, "stays inside");
        assert_eq!(tokio::fs::read_to_string(out.join("good.txt")).await?, "good");
        Ok(())
    }

    #[tokio::test]
    async fn test_locked_destination_is_rewritten_after_kill() -> Result<()> {
        let out = TempDir::new()?;
        let payload: Vec<u8> = (0..3000u32).map(|i| (i % 241) as u8).collect();
        let tar = TarBuilder::new()
            .file("bin/app", &payload)
            .file("after.txt", b"after")
            .build();
        // A directory at the destination fails every write until it is removed.
        std::fs::create_dir_all(out.path().join("bin/app/held"))?;

        let terminator = Arc::new(CountingTerminator::clearing());
        let archive = ArchiveReader::new()
            .with_terminator(terminator.clone())
            .with_retry_policy(LockRetryPolicy {
                delay: std::time::Duration::ZERO,
                ..LockRetryPolicy::default()
            });

        let summary = archive
            .untar_reader(Cursor::new(tar), None, out.path(), &NoProgress)
            .await?;

        assert_eq!(summary.files, 2);
        assert_eq!(terminator.calls(), 1);
        assert_eq!(tokio::fs::read(out.path().join("bin/app")).await?, payload);
        assert_eq!(tokio::fs::read_to_string(out.path().join("after.txt")).await?, "after");
        Ok(())
    }

    #[tokio::test]
    async fn test_zero_size_entry_produces_no_file() -> Result<()> {
        let out = TempDir::new()?;
        let tar = TarBuilder::new().file("empty.txt", b"").directory("logs/").build();

        let summary = reader()
            .untar_reader(Cursor::new(tar), None, out.path(), &NoProgress)
            .await?;

        assert_eq!(summary.files, 0);
        assert!(!out.path().join("empty.txt").exists());
        assert!(out.path().join("logs").is_dir());
        Ok(())
    }

    #[tokio::test]
    async fn test_stream_without_end_marker() -> Result<()> {
        let out = TempDir::new()?;
        let tar = TarBuilder::new().file("a.txt", b"abc").without_end_marker().build();

        let summary = reader()
            .untar_reader(Cursor::new(tar), None, out.path(), &NoProgress)
            .await?;
        assert_eq!(summary.files, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_entries_after_end_marker_are_ignored() -> Result<()> {
        let out = TempDir::new()?;
        let mut tar = TarBuilder::new().file("first.txt", b"1").build();
        tar.extend(TarBuilder::new().file("second.txt", b"2").build());

        reader()
            .untar_reader(Cursor::new(tar), None, out.path(), &NoProgress)
            .await?;
        assert!(out.path().join("first.txt").exists());
        assert!(!out.path().join("second.txt").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupt_size_aborts_extraction() {
        let out = TempDir::new().unwrap();
        let tar = TarBuilder::new()
            .file("ok.txt", b"fine")
            .raw_entry("bad.txt", b"zz", b'0', b"")
            .build();

        let err = reader()
            .untar_reader(Cursor::new(tar), None, out.path(), &NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UpdaterError>(),
            Some(UpdaterError::ArchiveFormatError { .. })
        ));
    }

    #[tokio::test]
    async fn test_truncated_payload_is_fatal() {
        let out = TempDir::new().unwrap();
        let mut tar = TarBuilder::new().file("big.bin", &[7u8; 2000]).without_end_marker().build();
        tar.truncate(TAR_BLOCK_SIZE + 100);

        let err = reader()
            .untar_reader(Cursor::new(tar), None, out.path(), &NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UpdaterError>(),
            Some(UpdaterError::ArchiveFormatError { .. })
        ));
    }

    #[tokio::test]
    async fn test_gnu_long_name() -> Result<()> {
        let out = TempDir::new()?;
        let long_name = format!("{}/file.txt", "very-long-directory-name".repeat(6));
        let tar = TarBuilder::new().gnu_long_file(&long_name, b"long").build();

        reader()
            .untar_reader(Cursor::new(tar), None, out.path(), &NoProgress)
            .await?;
        assert_eq!(tokio::fs::read_to_string(out.path().join(&long_name)).await?, "long");
        Ok(())
    }

    #[tokio::test]
    async fn test_untar_progress_unknown_total() -> Result<()> {
        let out = TempDir::new()?;
        let tar = TarBuilder::new().file("a.bin", &[1u8; 3000]).build();
        let progress = RecordingProgress::default();

        reader()
            .untar_reader(Cursor::new(tar), None, out.path(), &progress)
            .await?;

        let events = progress.events();
        let first = events.first().unwrap();
        assert_eq!(first.bytes_done, 0);
        assert_eq!(first.bytes_total, None);
        let last = events.last().unwrap();
        assert_eq!(last.percent, Some(100.0));
        assert_eq!(Some(last.bytes_done), last.bytes_total);
        assert!(events.windows(2).all(|w| w[0].bytes_done <= w[1].bytes_done));
        Ok(())
    }

    #[tokio::test]
    async fn test_decompress_and_untar_package() -> Result<()> {
        let work = TempDir::new()?;
        let install = TempDir::new()?;
        let tar = TarBuilder::new().file("app/run.sh", b"#!/bin/sh\necho hi\n").build();
        let package = work.path().join("app-2.0.0.tar.gz");
        tokio::fs::write(&package, gzip(&tar)).await?;

        let progress = RecordingProgress::default();
        let archive = reader();
        let tar_path = archive.decompress(&package, install.path(), &progress).await?;
        assert_eq!(tar_path, install.path().join("app-2.0.0.tar"));
        assert_eq!(tokio::fs::read(&tar_path).await?, tar);
        assert_eq!(progress.events().last().unwrap().percent, Some(100.0));

        archive.untar(&tar_path, install.path(), &NoProgress).await?;
        assert!(install.path().join("app/run.sh").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_decompress_rejects_garbage() {
        let work = TempDir::new().unwrap();
        let package = work.path().join("broken.tar.gz");
        tokio::fs::write(&package, b"definitely not gzip data").await.unwrap();

        let err = reader()
            .decompress(&package, work.path(), &NoProgress)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<UpdaterError>(),
            Some(UpdaterError::ArchiveFormatError { .. })
        ));
    }

    #[tokio::test]
    async fn test_extract_gzip_package() -> Result<()> {
        let work = TempDir::new()?;
        let out = work.path().join("out");
        let package = work.path().join("data.gz");
        tokio::fs::write(&package, gzip(&TarBuilder::new().file("x.txt", b"x").build())).await?;

        let summary = reader().extract(&package, &out, &NoProgress).await?;
        assert_eq!(summary.files, 1);
        assert!(out.join("x.txt").exists());
        Ok(())
    }
}
