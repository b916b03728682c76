//! File copies between the local filesystem and an SFTP subsystem.
//!
//! The native file handle surfaces partial writes; the upload loop here is
//! where they are retried.

use anyhow::Context;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use tether_native::{Engine, FilePermissions, FileTransferChannel, OpenFlags};

/// Copy a remote file to `local`, calling `on_progress` with the running total.
///
/// Returns the number of bytes copied.
pub fn download<E: Engine>(
    sftp: &FileTransferChannel<E>,
    remote: &str,
    local: &Path,
    chunk_size: usize,
    on_progress: &mut dyn FnMut(u64),
) -> anyhow::Result<u64> {
    let mut source = sftp
        .open_file(remote, OpenFlags::READ, FilePermissions::default())
        .with_context(|| format!("Failed to open remote file {remote}"))?;
    let mut target =
        File::create(local).with_context(|| format!("Failed to create {}", local.display()))?;

    let mut buf = vec![0u8; chunk_size];
    let mut total = 0u64;
    loop {
        let n = source
            .read(&mut buf)
            .with_context(|| format!("Failed to read {remote}"))?;
        if n == 0 {
            break;
        }
        target
            .write_all(&buf[..n])
            .with_context(|| format!("Failed to write {}", local.display()))?;
        total += n as u64;
        on_progress(total);
    }
    target.flush()?;
    source.close();

    tracing::debug!(remote, local = %local.display(), bytes = total, "download complete");
    Ok(total)
}

/// Copy `local` to a remote file, creating or truncating it with `mode`.
///
/// Returns the number of bytes copied.
pub fn upload<E: Engine>(
    sftp: &FileTransferChannel<E>,
    local: &Path,
    remote: &str,
    mode: FilePermissions,
    chunk_size: usize,
    on_progress: &mut dyn FnMut(u64),
) -> anyhow::Result<u64> {
    let mut source =
        File::open(local).with_context(|| format!("Failed to open {}", local.display()))?;
    let mut target = sftp
        .open_file(
            remote,
            OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            mode,
        )
        .with_context(|| format!("Failed to create remote file {remote}"))?;

    let mut buf = vec![0u8; chunk_size];
    let mut total = 0u64;
    loop {
        let n = source
            .read(&mut buf)
            .with_context(|| format!("Failed to read {}", local.display()))?;
        if n == 0 {
            break;
        }

        let mut offset = 0;
        while offset < n {
            let accepted = target
                .write(&buf[offset..n], n - offset)
                .with_context(|| format!("Failed to write {remote}"))?;
            if accepted == 0 {
                anyhow::bail!("Server accepted no data for {remote}");
            }
            offset += accepted;
            total += accepted as u64;
            on_progress(total);
        }
    }
    target.close();

    tracing::debug!(local = %local.display(), remote, bytes = total, "upload complete");
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_native::{
        MemoryEngine, MemoryTransport, Operation, Session, SessionConfig, SftpStatus,
    };

    fn subsystem(engine: &MemoryEngine) -> (Session<MemoryEngine>, FileTransferChannel<MemoryEngine>) {
        let session =
            Session::handshake(engine.clone(), MemoryTransport, &SessionConfig::default()).unwrap();
        let sftp = session.open_channel().unwrap().open_file_transfer().unwrap();
        (session, sftp)
    }

    #[test]
    fn test_download() {
        let contents = (0..10_000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>();
        let engine = MemoryEngine::new().with_file("/srv/blob.bin", contents.clone());
        let (_session, sftp) = subsystem(&engine);
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("blob.bin");

        let mut reports = Vec::new();
        let copied = download(&sftp, "/srv/blob.bin", &local, 4096, &mut |n| reports.push(n)).unwrap();

        assert_eq!(copied, 10_000);
        assert_eq!(std::fs::read(&local).unwrap(), contents);
        assert_eq!(reports, [4096, 8192, 10_000]);
        assert_eq!(engine.open_handles(), 0);
    }

    #[test]
    fn test_download_missing_file() {
        let engine = MemoryEngine::new();
        let (_session, sftp) = subsystem(&engine);
        let dir = tempfile::tempdir().unwrap();

        let err = download(&sftp, "/nope", &dir.path().join("x"), 1024, &mut |_| {}).unwrap_err();
        assert!(format!("{err:#}").contains("/nope"));
        assert!(!dir.path().join("x").exists());
    }

    #[test]
    fn test_upload_retries_partial_writes() {
        let engine = MemoryEngine::new().with_directory("/incoming");
        engine.set_write_limit(Some(1000));
        let (_session, sftp) = subsystem(&engine);

        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("report.csv");
        let contents = "id,value\n".repeat(500);
        std::fs::write(&local, &contents).unwrap();

        let copied = upload(
            &sftp,
            &local,
            "/incoming/report.csv",
            FilePermissions::DEFAULT_FILE,
            4096,
            &mut |_| {},
        )
        .unwrap();

        assert_eq!(copied, contents.len() as u64);
        assert_eq!(engine.file_contents("/incoming/report.csv").unwrap(), contents.as_bytes());
        assert!(engine.stats().native_writes >= contents.len() / 1000);
    }

    #[test]
    fn test_upload_surfaces_sftp_status() {
        let engine = MemoryEngine::new();
        let (_session, sftp) = subsystem(&engine);
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("a");
        std::fs::write(&local, b"abc").unwrap();

        engine.fail_next_sftp(Operation::Write, SftpStatus::QuotaExceeded);
        let err = upload(&sftp, &local, "/a", FilePermissions::DEFAULT_FILE, 1024, &mut |_| {})
            .unwrap_err();
        let native = err.downcast_ref::<tether_native::Error>().unwrap();
        assert_eq!(native.path(), Some("/a"));
    }

    #[test]
    fn test_upload_missing_local_file() {
        let engine = MemoryEngine::new();
        let (_session, sftp) = subsystem(&engine);
        let err = upload(
            &sftp,
            Path::new("/definitely/not/here"),
            "/x",
            FilePermissions::DEFAULT_FILE,
            1024,
            &mut |_| {},
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("/definitely/not/here"));
        assert!(engine.file_contents("/x").is_none());
    }
}
