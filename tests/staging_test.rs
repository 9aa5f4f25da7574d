// Integration tests for staging: idempotence, size checks, decoding

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

use common::*;
use pitr::catalog::{descriptors_from_listing, BackupFileDescriptor, BackupKind, RawCatalogRecord};
use pitr::config::ToolPaths;
use pitr::resolve::{resolve_chain, resolve_nearest_full, ChainWindow, DecompressionState};
use pitr::staging::{
    ArtifactTransfer, LocalDirTransfer, StagingError, StagingManager, TransferError, MANIFEST_FILE,
};
use pitr::EngineKind;

/// Delivers every artifact cut short by `missing` bytes
struct TruncatingTransfer {
    remote: std::path::PathBuf,
    missing: usize,
}

#[async_trait]
impl ArtifactTransfer for TruncatingTransfer {
    async fn fetch(
        &self,
        descriptor: &BackupFileDescriptor,
        dest: &Path,
    ) -> Result<(), TransferError> {
        let bytes = std::fs::read(self.remote.join(&descriptor.file_name)).unwrap();
        let keep = bytes.len().saturating_sub(self.missing);
        std::fs::write(dest, &bytes[..keep]).unwrap();
        Ok(())
    }
}

fn manager(
    root: &Path,
    engine: EngineKind,
    transfer: Arc<dyn ArtifactTransfer>,
    process: Arc<RecordingProcess>,
) -> StagingManager {
    StagingManager::new(
        root,
        engine,
        transfer,
        process,
        ToolPaths::under(Path::new("/opt/bin")),
        Duration::from_secs(5),
    )
}

fn layout() -> (TempDir, std::path::PathBuf, std::path::PathBuf) {
    let dirs = TempDir::new().unwrap();
    let remote = dirs.path().join("remote");
    let staging = dirs.path().join("staging");
    std::fs::create_dir_all(&remote).unwrap();
    (dirs, remote, staging)
}

fn full_descriptors(records: &[RawCatalogRecord], engine: EngineKind) -> Vec<BackupFileDescriptor> {
    descriptors_from_listing(records, engine, &source(), BackupKind::Full)
}

#[tokio::test]
async fn test_full_staging_is_idempotent() {
    let (_dirs, remote, staging) = layout();
    let record = write_multishard_full(&remote, at("2024-01-10 05:00:00"), "0-16383", &[11, 22]);
    let descriptors = full_descriptors(&[record.clone()], EngineKind::MultiShard);
    let mut set = resolve_nearest_full(&descriptors, at("2024-01-10 05:15:00")).unwrap();

    let process = Arc::new(RecordingProcess::new());
    let manager = manager(
        &staging,
        EngineKind::MultiShard,
        Arc::new(LocalDirTransfer::new(&remote)),
        process.clone(),
    );

    let first = manager.ensure_full_staged(&mut set).await.unwrap();
    assert!(!first.reused);
    assert!(first.decompressed_bytes > 0);
    assert!(first.path.join(MANIFEST_FILE).is_file());
    assert!(first.path.join("backup_meta.1").is_file());
    assert_eq!(set.state, DecompressionState::Verified);
    // Compressed source goes once the output checked out
    assert!(!staging.join("10.0.0.1_30000").join(&record.file_name).exists());

    let manifest_before = std::fs::read(first.path.join(MANIFEST_FILE)).unwrap();
    let second = manager.ensure_full_staged(&mut set).await.unwrap();
    assert!(second.reused);
    assert_eq!(second.decompressed_bytes, 0);
    assert_eq!(second.path, first.path);
    assert_eq!(std::fs::read(second.path.join(MANIFEST_FILE)).unwrap(), manifest_before);
    assert!(process.calls().is_empty());
}

#[tokio::test]
async fn test_split_parts_are_decoded_in_index_order() {
    let (_dirs, remote, staging) = layout();
    let whole = write_multishard_full(&remote, at("2024-01-10 05:00:00"), "0-8191", &[7]);
    let bytes = std::fs::read(remote.join(&whole.file_name)).unwrap();
    std::fs::remove_file(remote.join(&whole.file_name)).unwrap();

    let cut = bytes.len() / 2;
    let mut records = Vec::new();
    for (i, chunk) in [&bytes[..cut], &bytes[cut..]].iter().enumerate() {
        let name = format!("{}.split.{i}", whole.file_name);
        std::fs::write(remote.join(&name), chunk).unwrap();
        records.push(record_for(&remote, &name, at("2024-01-10 05:30:00")));
    }
    records.reverse();

    let descriptors = full_descriptors(&records, EngineKind::MultiShard);
    let mut set = resolve_nearest_full(&descriptors, at("2024-01-10 05:15:00")).unwrap();
    assert_eq!(set.parts.len(), 2);

    let manager = manager(
        &staging,
        EngineKind::MultiShard,
        Arc::new(LocalDirTransfer::new(&remote)),
        Arc::new(RecordingProcess::new()),
    );
    let staged = manager.ensure_full_staged(&mut set).await.unwrap();
    let manifest = pitr::staging::manifest::read_manifest(&staged.path).unwrap();
    assert_eq!(manifest.kvstore_count, 1);
    assert_eq!(manifest.slots, "0-8191");
}

#[tokio::test]
async fn test_size_mismatch_is_local_corruption() {
    let (_dirs, remote, staging) = layout();
    let record = write_multishard_full(&remote, at("2024-01-10 05:00:00"), "0-16383", &[1]);
    let descriptors = full_descriptors(&[record.clone()], EngineKind::MultiShard);
    let mut set = resolve_nearest_full(&descriptors, at("2024-01-10 05:15:00")).unwrap();

    let manager = manager(
        &staging,
        EngineKind::MultiShard,
        Arc::new(TruncatingTransfer {
            remote: remote.clone(),
            missing: 100,
        }),
        Arc::new(RecordingProcess::new()),
    );
    let err = manager.ensure_full_staged(&mut set).await.unwrap_err();
    match &err {
        StagingError::SizeMismatch {
            expected, actual, ..
        } => assert_eq!(*expected - *actual, 100),
        other => panic!("unexpected error {other:?}"),
    }
    assert!(err.is_local_corruption());
    assert!(!staging.join("10.0.0.1_30000").join(&record.file_name).exists());
}

#[tokio::test]
async fn test_missing_artifact_is_not_yet_available() {
    let (_dirs, remote, staging) = layout();
    let record = write_multishard_full(&remote, at("2024-01-10 05:00:00"), "0-16383", &[1]);
    std::fs::remove_file(remote.join(&record.file_name)).unwrap();
    let descriptors = full_descriptors(&[record], EngineKind::MultiShard);
    let mut set = resolve_nearest_full(&descriptors, at("2024-01-10 05:15:00")).unwrap();

    let manager = manager(
        &staging,
        EngineKind::MultiShard,
        Arc::new(LocalDirTransfer::new(&remote)),
        Arc::new(RecordingProcess::new()),
    );
    let err = assert_err!(manager.ensure_full_staged(&mut set).await);
    assert!(err.is_not_yet_available());
}

#[tokio::test]
async fn test_ssd_backup_is_checked_by_verify_tool() {
    let (_dirs, remote, staging) = layout();
    let record = write_ssd_full(&remote, at("2024-01-10 05:00:00"), "0-16383", 9001);
    let descriptors = full_descriptors(&[record], EngineKind::Ssd);
    let mut set = resolve_nearest_full(&descriptors, at("2024-01-10 05:15:00")).unwrap();

    let process = Arc::new(RecordingProcess::new());
    let manager = manager(
        &staging,
        EngineKind::Ssd,
        Arc::new(LocalDirTransfer::new(&remote)),
        process.clone(),
    );
    let staged = manager.ensure_full_staged(&mut set).await.unwrap();
    assert!(staged.path.ends_with("full/backup"));

    let verify = process.calls_to("tredisverify");
    assert_eq!(verify.len(), 1);
    assert_eq!(
        verify[0].args,
        vec!["--backup-dir".to_string(), staged.path.display().to_string()]
    );

    // A verify tool that flags the backup makes staging fail after decoding
    process.fail_with_output("tredisverify", "error: sst file truncated");
    std::fs::remove_dir_all(staging.join("10.0.0.1_30000/full")).unwrap();
    let err = manager.ensure_full_staged(&mut set).await.unwrap_err();
    assert!(matches!(err, StagingError::IncompleteAfterDecompression { .. }));
}

#[tokio::test]
async fn test_chain_staging_decodes_and_reuses() {
    let (_dirs, remote, staging) = layout();
    let mut records = Vec::new();
    for (seq, created) in binlog_schedule() {
        let name = format!("{}.zst", multishard_binlog_name(2, seq, created));
        let body = zstd::encode_all(format!("binlog {seq}\n").as_bytes(), 3).unwrap();
        std::fs::write(remote.join(&name), body).unwrap();
        records.push(record_for(&remote, &name, created + chrono::Duration::seconds(30)));
    }
    let descriptors =
        descriptors_from_listing(&records, EngineKind::MultiShard, &source(), BackupKind::Incremental);
    let window = ChainWindow::new(at("2024-01-10 05:00:00"), at("2024-01-10 05:15:01"));
    let chain = resolve_chain(&descriptors, 2, window).unwrap();

    let manager = manager(
        &staging,
        EngineKind::MultiShard,
        Arc::new(LocalDirTransfer::new(&remote)),
        Arc::new(RecordingProcess::new()),
    );
    let first = manager.ensure_chain_staged(&chain).await.unwrap();
    assert!(!first.result.reused);
    assert_eq!(first.files.len(), 11);
    assert_eq!(first.result.path, staging.join("10.0.0.1_30000/shard_2"));
    for (staged, seq) in first.files.iter().zip(100u64..) {
        assert_eq!(staged.descriptor.sequence_index, seq);
        assert_eq!(
            std::fs::read_to_string(&staged.path).unwrap(),
            format!("binlog {seq}\n")
        );
        assert!(!staged.path.with_extension("log.zst").exists());
    }

    let second = assert_ok!(manager.ensure_chain_staged(&chain).await);
    assert!(second.result.reused);
    assert_eq!(second.result.decompressed_bytes, 0);

    assert_ok!(manager.discard_chain(&source(), 2).await);
    assert!(!first.result.path.exists());
}

/// Archive a binlog into `{name}.tar`, the archive holding the plain `.log`
fn write_tar_binlog(remote: &Path, seq: u64, created: chrono::NaiveDateTime) -> RawCatalogRecord {
    let inner = multishard_binlog_name(2, seq, created);
    let name = format!("{inner}.tar");
    let body = format!("binlog {seq} full contents\n");
    let file = std::fs::File::create(remote.join(&name)).unwrap();
    let mut builder = tar::Builder::new(file);
    let mut header = tar::Header::new_gnu();
    header.set_size(body.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, &inner, body.as_bytes()).unwrap();
    builder.into_inner().unwrap();
    record_for(remote, &name, created + chrono::Duration::seconds(30))
}

#[tokio::test]
async fn test_interrupted_archive_decode_is_redone() {
    let (_dirs, remote, staging) = layout();
    let records: Vec<RawCatalogRecord> = binlog_schedule()
        .into_iter()
        .map(|(seq, created)| write_tar_binlog(&remote, seq, created))
        .collect();
    let descriptors =
        descriptors_from_listing(&records, EngineKind::MultiShard, &source(), BackupKind::Incremental);
    let window = ChainWindow::new(at("2024-01-10 05:00:00"), at("2024-01-10 05:15:01"));
    let chain = resolve_chain(&descriptors, 2, window).unwrap();

    // An earlier run fetched binlog 105 and died four bytes into unpacking it
    let shard_dir = staging.join("10.0.0.1_30000/shard_2");
    std::fs::create_dir_all(&shard_dir).unwrap();
    let cut = chain
        .members
        .iter()
        .find(|m| m.sequence_index == 105)
        .unwrap();
    std::fs::copy(remote.join(&cut.file_name), shard_dir.join(&cut.file_name)).unwrap();
    std::fs::write(shard_dir.join(&cut.inner_name), b"binl").unwrap();

    let manager = manager(
        &staging,
        EngineKind::MultiShard,
        Arc::new(LocalDirTransfer::new(&remote)),
        Arc::new(RecordingProcess::new()),
    );
    let staged = manager.ensure_chain_staged(&chain).await.unwrap();
    assert!(!staged.result.reused);
    assert_eq!(staged.files.len(), 11);
    for (file, seq) in staged.files.iter().zip(100u64..) {
        assert_eq!(
            std::fs::read_to_string(&file.path).unwrap(),
            format!("binlog {seq} full contents\n")
        );
        assert!(!shard_dir.join(&file.descriptor.file_name).exists());
    }

    // Once decoded with no archive left beside it, the output is reused as is
    let again = assert_ok!(manager.ensure_chain_staged(&chain).await);
    assert!(again.result.reused);
}

#[tokio::test]
async fn test_block_binlogs_go_through_decompressor() {
    let (_dirs, remote, staging) = layout();
    let records: Vec<RawCatalogRecord> = binlog_schedule()
        .into_iter()
        .map(|(seq, created)| write_binlog(&remote, &ssd_binlog_name(seq, created), created))
        .collect();
    let descriptors =
        descriptors_from_listing(&records, EngineKind::Ssd, &source(), BackupKind::Incremental);
    let window = ChainWindow::new(at("2024-01-10 05:00:00"), at("2024-01-10 05:15:01"));
    let chain = resolve_chain(&descriptors, -1, window).unwrap();

    let process = Arc::new(RecordingProcess::new());
    let manager = manager(
        &staging,
        EngineKind::Ssd,
        Arc::new(LocalDirTransfer::new(&remote)),
        process.clone(),
    );
    let staged = manager.ensure_chain_staged(&chain).await.unwrap();
    let dir = staging.join("10.0.0.1_30000/shard_all");
    assert_eq!(staged.result.path, dir);
    assert_eq!(staged.files.len(), 11);

    let unblock = process.calls_to("tendis-unblock");
    assert_eq!(unblock.len(), 11);
    for (call, file) in unblock.iter().zip(&staged.files) {
        let local = dir.join(&file.descriptor.file_name);
        assert_eq!(
            call.args,
            vec![
                "-d".to_string(),
                "-i".to_string(),
                local.display().to_string(),
                "-o".to_string(),
                file.path.with_extension("partial").display().to_string(),
            ]
        );
        assert_eq!(file.path, dir.join(&file.descriptor.inner_name));
        assert!(file.path.to_string_lossy().ends_with(".log"));
        assert_eq!(
            std::fs::read_to_string(&file.path).unwrap(),
            format!("binlog {}\n", file.descriptor.file_name)
        );
        assert!(!local.exists());
        assert!(!file.path.with_extension("partial").exists());
    }

    let again = assert_ok!(manager.ensure_chain_staged(&chain).await);
    assert!(again.result.reused);
    assert_eq!(process.calls_to("tendis-unblock").len(), 11);
}
