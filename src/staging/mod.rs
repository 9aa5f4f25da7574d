//! Local staging and decompression of backup artifacts
//!
//! Staging is idempotent. A decompressed artifact that already passes its
//! completeness check is returned as-is without touching the filesystem.
//! Compressed sources are deleted only after the decoded output has been
//! checked, never before.
//!
//! Layout under the staging root:
//!
//! ```text
//! {root}/{ip}_{port}/{file_name}          compressed full backup parts
//! {root}/{ip}_{port}/full/                decoded full backup
//! {root}/{ip}_{port}/shard_{i}/           binlogs of store i (shard_all if unsharded)
//! ```

pub mod codec;
pub mod manifest;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::catalog::{BackupFileDescriptor, ContainerFormat};
use crate::config::ToolPaths;
use crate::engine_kind::{CompletenessRule, EngineKind};
use crate::node::NodeAddr;
use crate::observability;
use crate::process::{CommandSpec, ProcessControl, ProcessError};
use crate::resolve::{shard_label, DecompressionState, FullBackupSet, IncrementalChain};

pub use manifest::{BackupManifest, ShardBackupMeta, MANIFEST_FILE};

/// Errors raised by the external transfer layer
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("artifact {file} is not available for transfer: {reason}")]
    Unavailable { file: String, reason: String },

    #[error("transfer of {file} failed: {source}")]
    Io {
        file: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while staging artifacts
#[derive(Error, Debug)]
pub enum StagingError {
    #[error("{file} is not staged at {path} after requesting a fetch")]
    NotStaged { file: String, path: PathBuf },

    #[error("{file} is {actual} bytes locally, catalog records {expected}")]
    SizeMismatch {
        file: String,
        expected: u64,
        actual: u64,
    },

    #[error("decompression of {file} failed: {reason}")]
    DecompressionFailed { file: String, reason: String },

    #[error("{path} is incomplete after decompression: {reason}")]
    IncompleteAfterDecompression { path: PathBuf, reason: String },

    #[error("backup metadata {path} is unusable: {reason}")]
    Manifest { path: PathBuf, reason: String },

    #[error("fetch of {file} failed: {source}")]
    Transfer {
        file: String,
        #[source]
        source: TransferError,
    },

    #[error("verification tool failed: {0}")]
    Verify(#[from] ProcessError),

    #[error("staging I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StagingError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        StagingError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Nothing local yet; the caller may retry once upstream catches up
    pub fn is_not_yet_available(&self) -> bool {
        matches!(self, StagingError::NotStaged { .. } | StagingError::Transfer { .. })
    }

    pub fn is_local_corruption(&self) -> bool {
        matches!(
            self,
            StagingError::SizeMismatch { .. }
                | StagingError::DecompressionFailed { .. }
                | StagingError::IncompleteAfterDecompression { .. }
                | StagingError::Manifest { .. }
        )
    }
}

/// Makes a catalog artifact present on local disk
#[async_trait]
pub trait ArtifactTransfer: Send + Sync {
    /// Place the compressed artifact at `dest`
    async fn fetch(&self, descriptor: &BackupFileDescriptor, dest: &Path)
        -> Result<(), TransferError>;
}

/// Transfer that copies artifacts already landed under a local backup root
#[derive(Debug, Clone)]
pub struct LocalDirTransfer {
    root: PathBuf,
}

impl LocalDirTransfer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ArtifactTransfer for LocalDirTransfer {
    async fn fetch(
        &self,
        descriptor: &BackupFileDescriptor,
        dest: &Path,
    ) -> Result<(), TransferError> {
        let src = self.root.join(&descriptor.file_name);
        if !tokio::fs::try_exists(&src).await.unwrap_or(false) {
            return Err(TransferError::Unavailable {
                file: descriptor.file_name.clone(),
                reason: format!("{} has not landed yet", src.display()),
            });
        }
        tokio::fs::copy(&src, dest)
            .await
            .map(|_| ())
            .map_err(|source| TransferError::Io {
                file: descriptor.file_name.clone(),
                source,
            })
    }
}

/// Outcome of staging one full backup or one chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingResult {
    /// Backup root, image file, or shard directory
    pub path: PathBuf,
    /// True when nothing had to be done
    pub reused: bool,
    pub decompressed_bytes: u64,
}

/// A binlog ready for replay
#[derive(Debug, Clone)]
pub struct StagedBinlog {
    pub descriptor: BackupFileDescriptor,
    pub path: PathBuf,
}

/// A shard's binlogs ready for replay, in chain order
#[derive(Debug, Clone)]
pub struct StagedChain {
    pub shard_index: i32,
    pub result: StagingResult,
    pub files: Vec<StagedBinlog>,
}

enum Completeness {
    Complete(PathBuf),
    Incomplete(String),
}

/// Mirrors resolved artifacts to local disk and decodes them
pub struct StagingManager {
    root: PathBuf,
    engine: EngineKind,
    transfer: Arc<dyn ArtifactTransfer>,
    process: Arc<dyn ProcessControl>,
    tools: ToolPaths,
    tool_timeout: Duration,
}

impl StagingManager {
    pub fn new(
        root: impl Into<PathBuf>,
        engine: EngineKind,
        transfer: Arc<dyn ArtifactTransfer>,
        process: Arc<dyn ProcessControl>,
        tools: ToolPaths,
        tool_timeout: Duration,
    ) -> Self {
        Self {
            root: root.into(),
            engine,
            transfer,
            process,
            tools,
            tool_timeout,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn source_dir(&self, source: &NodeAddr) -> PathBuf {
        self.root.join(source.slug())
    }

    pub fn full_dir(&self, source: &NodeAddr) -> PathBuf {
        self.source_dir(source).join("full")
    }

    pub fn shard_dir(&self, source: &NodeAddr, shard_index: i32) -> PathBuf {
        self.source_dir(source)
            .join(format!("shard_{}", shard_label(shard_index)))
    }

    /// Stage and decode a full backup, reusing a verified earlier result
    #[instrument(skip(self, set), fields(file = %set.head().file_name))]
    pub async fn ensure_full_staged(
        &self,
        set: &mut FullBackupSet,
    ) -> Result<StagingResult, StagingError> {
        let source = set.head().source();
        let full_dir = self.full_dir(&source);

        if tokio::fs::try_exists(&full_dir).await.unwrap_or(false) {
            match self.check_full_complete(&full_dir, set).await? {
                Completeness::Complete(path) => {
                    info!(path = %path.display(), "Full backup already staged and verified");
                    set.state = DecompressionState::Verified;
                    set.staging_dir = Some(path.clone());
                    return Ok(StagingResult {
                        path,
                        reused: true,
                        decompressed_bytes: 0,
                    });
                }
                Completeness::Incomplete(reason) => {
                    warn!(path = %full_dir.display(), reason = %reason, "Discarding partial earlier decode");
                    tokio::fs::remove_dir_all(&full_dir)
                        .await
                        .map_err(|e| StagingError::io(&full_dir, e))?;
                }
            }
        }

        let source_dir = self.source_dir(&source);
        tokio::fs::create_dir_all(&source_dir)
            .await
            .map_err(|e| StagingError::io(&source_dir, e))?;

        let mut locals = Vec::with_capacity(set.parts.len());
        for part in &set.parts {
            let local = source_dir.join(&part.file_name);
            self.ensure_local(part, &local).await?;
            locals.push(local);
        }

        let format = set.head().format;
        if format == ContainerFormat::Block {
            return Err(StagingError::DecompressionFailed {
                file: set.head().file_name.clone(),
                reason: "block streams are not a full backup container".to_string(),
            });
        }

        let file = set.head().file_name.clone();
        let output_name = set.head().inner_name.clone();
        let dest = full_dir.clone();
        let parts = locals.clone();
        let decompressed_bytes = tokio::task::spawn_blocking(move || {
            codec::decode_into(&parts, format, &dest, &output_name)
        })
        .await
        .map_err(|e| StagingError::DecompressionFailed {
            file: file.clone(),
            reason: e.to_string(),
        })?
        .map_err(|e| StagingError::DecompressionFailed {
            file: file.clone(),
            reason: e.to_string(),
        })?;
        set.state = DecompressionState::Decompressed;

        let path = match self.check_full_complete(&full_dir, set).await? {
            Completeness::Complete(path) => path,
            Completeness::Incomplete(reason) => {
                return Err(StagingError::IncompleteAfterDecompression {
                    path: full_dir,
                    reason,
                });
            }
        };

        for local in &locals {
            tokio::fs::remove_file(local)
                .await
                .map_err(|e| StagingError::io(local, e))?;
        }

        observability::record_decompressed(decompressed_bytes);
        info!(
            path = %path.display(),
            parts = locals.len(),
            bytes = decompressed_bytes,
            "Full backup staged and verified"
        );

        set.state = DecompressionState::Verified;
        set.staging_dir = Some(path.clone());
        Ok(StagingResult {
            path,
            reused: false,
            decompressed_bytes,
        })
    }

    /// Stage and decode every binlog of a chain, in chain order
    #[instrument(skip(self, chain), fields(shard = %shard_label(chain.shard_index)))]
    pub async fn ensure_chain_staged(
        &self,
        chain: &IncrementalChain,
    ) -> Result<StagedChain, StagingError> {
        let Some(head) = chain.members.first() else {
            return Err(StagingError::Manifest {
                path: self.root.clone(),
                reason: format!("chain for shard {} is empty", shard_label(chain.shard_index)),
            });
        };
        let dir = self.shard_dir(&head.source(), chain.shard_index);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StagingError::io(&dir, e))?;

        let mut files = Vec::with_capacity(chain.members.len());
        let mut reused = true;
        let mut decompressed_bytes = 0;
        for member in &chain.members {
            let (path, was_reused, bytes) = self.ensure_binlog_staged(member, &dir).await?;
            reused &= was_reused;
            decompressed_bytes += bytes;
            files.push(StagedBinlog {
                descriptor: member.clone(),
                path,
            });
        }

        observability::record_decompressed(decompressed_bytes);
        debug!(files = files.len(), reused, "Chain staged");
        Ok(StagedChain {
            shard_index: chain.shard_index,
            result: StagingResult {
                path: dir,
                reused,
                decompressed_bytes,
            },
            files,
        })
    }

    async fn ensure_binlog_staged(
        &self,
        member: &BackupFileDescriptor,
        dir: &Path,
    ) -> Result<(PathBuf, bool, u64), StagingError> {
        let decoded = dir.join(&member.inner_name);
        let local = dir.join(&member.file_name);

        if !member.format.needs_decoding() {
            if file_size(&decoded).await == Some(member.size_bytes) {
                return Ok((decoded, true, 0));
            }
            self.ensure_local(member, &local).await?;
            return Ok((local, false, 0));
        }

        // The compressed source goes only after a verified decode, so an output
        // sitting next to it is the remains of an interrupted run
        if file_size(&decoded).await.is_some() {
            if file_size(&local).await.is_none() {
                return Ok((decoded, true, 0));
            }
            warn!(file = %member.file_name, "Unfinished decode found, decoding again");
            tokio::fs::remove_file(&decoded)
                .await
                .map_err(|e| StagingError::io(&decoded, e))?;
        }

        self.ensure_local(member, &local).await?;
        match member.format {
            ContainerFormat::Block => self.decode_block(member, &local, &decoded).await?,
            format => {
                let parts = vec![local.clone()];
                let out_dir = dir.to_path_buf();
                let output_name = member.inner_name.clone();
                tokio::task::spawn_blocking(move || {
                    codec::decode_into(&parts, format, &out_dir, &output_name)
                })
                .await
                .map_err(|e| StagingError::DecompressionFailed {
                    file: member.file_name.clone(),
                    reason: e.to_string(),
                })?
                .map_err(|e| StagingError::DecompressionFailed {
                    file: member.file_name.clone(),
                    reason: e.to_string(),
                })?;
            }
        }

        let Some(bytes) = file_size(&decoded).await else {
            return Err(StagingError::DecompressionFailed {
                file: member.file_name.clone(),
                reason: format!("expected output {} was not produced", decoded.display()),
            });
        };
        tokio::fs::remove_file(&local)
            .await
            .map_err(|e| StagingError::io(&local, e))?;
        debug!(file = %member.file_name, bytes, "Binlog decoded");
        Ok((decoded, false, bytes))
    }

    async fn decode_block(
        &self,
        member: &BackupFileDescriptor,
        local: &Path,
        decoded: &Path,
    ) -> Result<(), StagingError> {
        let partial = decoded.with_extension("partial");
        let spec = CommandSpec::new(&self.tools.block_decompressor, self.tool_timeout).args([
            "-d".to_string(),
            "-i".to_string(),
            local.display().to_string(),
            "-o".to_string(),
            partial.display().to_string(),
        ]);
        self.process
            .run_checked(&spec)
            .await
            .map_err(|e| StagingError::DecompressionFailed {
                file: member.file_name.clone(),
                reason: e.to_string(),
            })?;
        tokio::fs::rename(&partial, decoded)
            .await
            .map_err(|e| StagingError::DecompressionFailed {
                file: member.file_name.clone(),
                reason: format!("block decompressor left no output: {e}"),
            })
    }

    /// Make the compressed artifact present with the catalog-recorded size
    ///
    /// A missing file is fetched once. A size mismatch deletes the local copy
    /// and fetches once more; a second mismatch is fatal.
    async fn ensure_local(
        &self,
        descriptor: &BackupFileDescriptor,
        local: &Path,
    ) -> Result<(), StagingError> {
        match file_size(local).await {
            Some(size) if size == descriptor.size_bytes => return Ok(()),
            Some(size) => {
                warn!(
                    file = %descriptor.file_name,
                    expected = descriptor.size_bytes,
                    actual = size,
                    "Local artifact size mismatch, re-fetching"
                );
                tokio::fs::remove_file(local)
                    .await
                    .map_err(|e| StagingError::io(local, e))?;
            }
            None => {
                info!(file = %descriptor.file_name, "Artifact not staged, requesting fetch");
            }
        }

        self.transfer
            .fetch(descriptor, local)
            .await
            .map_err(|source| StagingError::Transfer {
                file: descriptor.file_name.clone(),
                source,
            })?;

        match file_size(local).await {
            None => Err(StagingError::NotStaged {
                file: descriptor.file_name.clone(),
                path: local.to_path_buf(),
            }),
            Some(size) if size != descriptor.size_bytes => {
                let _ = tokio::fs::remove_file(local).await;
                Err(StagingError::SizeMismatch {
                    file: descriptor.file_name.clone(),
                    expected: descriptor.size_bytes,
                    actual: size,
                })
            }
            Some(_) => Ok(()),
        }
    }

    async fn check_full_complete(
        &self,
        dir: &Path,
        set: &FullBackupSet,
    ) -> Result<Completeness, StagingError> {
        let rule = self.engine.completeness_rule();
        let scan_dir = dir.to_path_buf();
        let inner_name = set.head().inner_name.clone();
        let layout = tokio::task::spawn_blocking(move || check_layout(rule, &scan_dir, &inner_name))
            .await
            .map_err(|e| {
                StagingError::io(dir, std::io::Error::new(std::io::ErrorKind::Other, e))
            })?;

        let root = match layout {
            Completeness::Complete(root) => root,
            incomplete => return Ok(incomplete),
        };
        if rule != CompletenessRule::ManifestWithVerifyTool {
            return Ok(Completeness::Complete(root));
        }

        let spec = CommandSpec::new(&self.tools.ssd_verify, self.tool_timeout)
            .args(["--backup-dir".to_string(), root.display().to_string()]);
        match self.process.run_checked(&spec).await {
            Ok(_) => Ok(Completeness::Complete(root)),
            Err(e @ (ProcessError::NonZeroExit { .. } | ProcessError::ErrorSentinel { .. })) => {
                Ok(Completeness::Incomplete(e.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a loaded full backup's local artifacts
    pub async fn discard_full(&self, set: &mut FullBackupSet) -> Result<(), StagingError> {
        let source = set.head().source();
        let full_dir = self.full_dir(&source);
        remove_dir_if_present(&full_dir).await?;
        for part in &set.parts {
            let local = self.source_dir(&source).join(&part.file_name);
            if file_size(&local).await.is_some() {
                tokio::fs::remove_file(&local)
                    .await
                    .map_err(|e| StagingError::io(&local, e))?;
            }
        }
        set.state = DecompressionState::NotStarted;
        set.staging_dir = None;
        debug!(path = %full_dir.display(), "Discarded full backup");
        Ok(())
    }

    /// Remove a replayed chain's local binlogs
    pub async fn discard_chain(&self, source: &NodeAddr, shard_index: i32) -> Result<(), StagingError> {
        remove_dir_if_present(&self.shard_dir(source, shard_index)).await
    }
}

fn check_layout(rule: CompletenessRule, dir: &Path, inner_name: &str) -> Completeness {
    match rule {
        CompletenessRule::ManifestWithShardMeta => {
            let Some(root) = manifest::locate_backup_root(dir) else {
                return Completeness::Incomplete(format!("no {MANIFEST_FILE} found"));
            };
            let manifest = match manifest::read_manifest(&root) {
                Ok(m) => m,
                Err(e) => return Completeness::Incomplete(e.to_string()),
            };
            if manifest.kvstore_count == 0 {
                return Completeness::Incomplete("manifest records zero stores".to_string());
            }
            for i in 0..manifest.kvstore_count {
                if let Err(e) = manifest::read_shard_meta(&root, i) {
                    return Completeness::Incomplete(e.to_string());
                }
            }
            Completeness::Complete(root)
        }
        CompletenessRule::ManifestWithVerifyTool => match manifest::locate_backup_root(dir) {
            Some(root) => Completeness::Complete(root),
            None => Completeness::Incomplete(format!("no {MANIFEST_FILE} found")),
        },
        CompletenessRule::SingleImage => check_image(dir, inner_name),
    }
}

fn check_image(dir: &Path, inner_name: &str) -> Completeness {
    let named = dir.join(inner_name);
    let image = if named.is_file() {
        Some(named)
    } else {
        std::fs::read_dir(dir).ok().and_then(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .find(|p| {
                    p.is_file()
                        && matches!(
                            p.extension().and_then(|e| e.to_str()),
                            Some("rdb") | Some("aof")
                        )
                })
        })
    };
    let Some(image) = image else {
        return Completeness::Incomplete("no RDB or AOF image found".to_string());
    };

    let mut magic = [0u8; 5];
    let read = std::fs::File::open(&image).and_then(|mut f| {
        use std::io::Read;
        f.read(&mut magic)
    });
    match read {
        Ok(0) => Completeness::Incomplete(format!("{} is empty", image.display())),
        Ok(n) if is_rdb(&image) && (n < magic.len() || &magic != b"REDIS") => {
            Completeness::Incomplete(format!("{} lacks the RDB magic", image.display()))
        }
        Ok(_) => Completeness::Complete(image),
        Err(e) => Completeness::Incomplete(format!("{}: {e}", image.display())),
    }
}

fn is_rdb(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("rdb")
}

async fn file_size(path: &Path) -> Option<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Some(meta.len()),
        _ => None,
    }
}

async fn remove_dir_if_present(path: &Path) -> Result<(), StagingError> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StagingError::io(path, e)),
    }
}
