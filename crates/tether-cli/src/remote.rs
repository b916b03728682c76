//! Remote operations behind the `ls`, `exec`, `mkdir`, `rm` and `info` commands.

use anyhow::Context;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use serde::Serialize;
use std::io::Write;
use tether_native::{
    DirectoryEntry, Engine, Error, FilePermissions, FileTransferChannel, Session, SftpStatus,
};

/// Host identity as shown by `info`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostInfo {
    /// Address that was connected to
    pub address: String,
    /// Identification string sent by the server
    pub banner: Option<String>,
    /// `SHA256:<base64>` host key fingerprint
    pub fingerprint: Option<String>,
    /// Hex form of the same digest
    pub fingerprint_hex: Option<String>,
}

/// Listing row as printed by `ls --json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListingEntry {
    /// File name
    pub name: String,
    /// Size in bytes, if reported
    pub size: Option<u64>,
    /// Type and permission bits, if reported
    pub permissions: Option<u32>,
    /// Modification time (seconds since the epoch), if reported
    pub mtime: Option<u64>,
    /// Whether the entry is a directory
    pub is_directory: bool,
}

impl From<&DirectoryEntry> for ListingEntry {
    fn from(entry: &DirectoryEntry) -> Self {
        Self {
            name: entry.name.clone(),
            size: entry.attributes.size,
            permissions: entry.attributes.permissions,
            mtime: entry.attributes.mtime,
            is_directory: entry.attributes.is_directory(),
        }
    }
}

/// Format a SHA-256 host key digest the way OpenSSH prints it.
#[must_use]
pub fn fingerprint(digest: &[u8; 32]) -> String {
    format!("SHA256:{}", STANDARD_NO_PAD.encode(digest))
}

/// Collect the server identity of an established session.
pub fn host_info<E: Engine>(session: &Session<E>, address: &str) -> HostInfo {
    let digest = session.host_key_sha256();
    HostInfo {
        address: address.to_string(),
        banner: session.remote_banner(),
        fingerprint: digest.as_ref().map(fingerprint),
        fingerprint_hex: digest.map(hex::encode),
    }
}

/// List a directory, directories first, then by name.
pub fn list<E: Engine>(
    sftp: &FileTransferChannel<E>,
    path: &str,
) -> anyhow::Result<Vec<DirectoryEntry>> {
    let mut entries = sftp
        .list_files(path)
        .with_context(|| format!("Failed to list {path}"))?;
    entries.sort_by(|a, b| {
        b.attributes
            .is_directory()
            .cmp(&a.attributes.is_directory())
            .then_with(|| a.name.cmp(&b.name))
    });
    Ok(entries)
}

/// Run `command` on a fresh channel, streaming its output.
///
/// Stdout and stderr are read in turns until both end, then the remote close
/// is awaited so the exit status is known. Returns the remote exit status.
pub fn exec<E: Engine>(
    session: &Session<E>,
    command: &str,
    stdout: &mut dyn Write,
    stderr: &mut dyn Write,
    chunk_size: usize,
) -> anyhow::Result<i32> {
    let mut channel = session.open_channel().context("Failed to open channel")?;
    channel
        .exec(command)
        .with_context(|| format!("Failed to start `{command}`"))?;
    channel.send_eof()?;

    let mut buf = vec![0u8; chunk_size];
    let mut stdout_open = true;
    let mut stderr_open = true;
    while stdout_open || stderr_open {
        if stdout_open {
            let n = channel.read(&mut buf)?;
            if n == 0 {
                stdout_open = false;
            } else {
                stdout.write_all(&buf[..n])?;
            }
        }
        if stderr_open {
            let n = channel.read_stderr(&mut buf)?;
            if n == 0 {
                stderr_open = false;
            } else {
                stderr.write_all(&buf[..n])?;
            }
        }
    }
    stdout.flush()?;
    stderr.flush()?;

    channel
        .wait_closed()
        .with_context(|| format!("Failed waiting for `{command}` to finish"))?;
    let status = channel.exit_status();
    channel.close();
    tracing::debug!(command, status, "remote command finished");
    Ok(status)
}

/// Create a directory. With `parents`, create missing ancestors and accept
/// an existing directory.
pub fn make_directory<E: Engine>(
    sftp: &FileTransferChannel<E>,
    path: &str,
    mode: FilePermissions,
    parents: bool,
) -> anyhow::Result<()> {
    if !parents {
        return sftp
            .create_directory(path, mode)
            .with_context(|| format!("Failed to create {path}"));
    }

    let mut prefix = String::with_capacity(path.len());
    if path.starts_with('/') {
        prefix.push('/');
    }
    for component in path.split('/').filter(|c| !c.is_empty()) {
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        prefix.push_str(component);

        match sftp.create_directory(&prefix, mode) {
            Ok(()) => {}
            Err(Error::Sftp(err))
                if matches!(
                    err.status(),
                    SftpStatus::FileAlreadyExists | SftpStatus::Failure
                ) =>
            {
                let attributes = sftp
                    .stat(&prefix)
                    .with_context(|| format!("Failed to create {prefix}"))?;
                if !attributes.is_directory() {
                    anyhow::bail!("{prefix} exists and is not a directory");
                }
            }
            Err(err) => return Err(err).with_context(|| format!("Failed to create {prefix}")),
        }
    }
    Ok(())
}

/// Remove a file, or an empty directory.
pub fn remove<E: Engine>(sftp: &FileTransferChannel<E>, path: &str) -> anyhow::Result<()> {
    let attributes = sftp
        .stat(path)
        .with_context(|| format!("Failed to stat {path}"))?;
    let removed = if attributes.is_directory() {
        sftp.delete_directory(path)
    } else {
        sftp.delete_file(path)
    };
    removed.with_context(|| format!("Failed to remove {path}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use tether_native::{MemoryEngine, MemoryTransport, SessionConfig};

    fn connect(engine: &MemoryEngine) -> Session<MemoryEngine> {
        Session::handshake(engine.clone(), MemoryTransport, &SessionConfig::default()).unwrap()
    }

    #[test]
    fn test_fingerprint_format() {
        let digest = [0u8; 32];
        assert_eq!(fingerprint(&digest), format!("SHA256:{}", "A".repeat(43)));
    }

    #[test]
    fn test_host_info() {
        let engine = MemoryEngine::new();
        let session = connect(&engine);
        let info = host_info(&session, "example.org:22");
        assert_eq!(info.address, "example.org:22");
        let fp = info.fingerprint.unwrap();
        assert!(fp.starts_with("SHA256:"));
        assert_eq!(info.fingerprint_hex.unwrap().len(), 64);
    }

    #[test]
    fn test_list_orders_directories_first() {
        let engine = MemoryEngine::new()
            .with_file("/data/b.txt", "b")
            .with_file("/data/a.txt", "a")
            .with_directory("/data/zeta");
        let session = connect(&engine);
        let sftp = session.open_channel().unwrap().open_file_transfer().unwrap();

        let names = list(&sftp, "/data")
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect::<Vec<_>>();
        assert_eq!(names, ["zeta", "a.txt", "b.txt"]);
    }

    #[test]
    fn test_listing_entry_json() {
        let entry = DirectoryEntry {
            name: "notes".to_string(),
            attributes: tether_native::FileAttributes {
                size: Some(12),
                permissions: Some(0o100600),
                ..Default::default()
            },
        };
        let json = serde_json::to_value(ListingEntry::from(&entry)).unwrap();
        assert_eq!(json["name"], "notes");
        assert_eq!(json["size"], 12);
        assert_eq!(json["is_directory"], false);
        assert!(json["mtime"].is_null());
    }

    #[test]
    fn test_exec_streams_output() {
        let engine = MemoryEngine::new().with_command("uname -s", "Linux\n", "warning\n", 3);
        let session = connect(&engine);

        let mut out = Vec::new();
        let mut err = Vec::new();
        let status = exec(&session, "uname -s", &mut out, &mut err, 2).unwrap();

        assert_eq!(status, 3);
        assert_eq!(out, b"Linux\n");
        assert_eq!(err, b"warning\n");
    }

    /// Records which stream each chunk arrived on.
    struct Tagged<'a> {
        tag: &'static str,
        events: &'a RefCell<Vec<&'static str>>,
    }

    impl Write for Tagged<'_> {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.events.borrow_mut().push(self.tag);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_exec_reads_streams_in_turns() {
        let engine = MemoryEngine::new().with_command("build", "o".repeat(10), "e".repeat(10), 0);
        let session = connect(&engine);

        let events = RefCell::new(Vec::new());
        let mut out = Tagged { tag: "out", events: &events };
        let mut err = Tagged { tag: "err", events: &events };
        exec(&session, "build", &mut out, &mut err, 4).unwrap();

        assert_eq!(
            events.into_inner(),
            ["out", "err", "out", "err", "out", "err"]
        );
    }

    #[test]
    fn test_exec_status_survives_remote_close() {
        let engine = MemoryEngine::new().with_command("false", "", "", 1);
        let session = connect(&engine);
        let status = exec(&session, "false", &mut Vec::new(), &mut Vec::new(), 64).unwrap();
        assert_eq!(status, 1);
        assert_eq!(engine.stats().channel_closes, 1);
    }

    #[test]
    fn test_exec_unknown_command() {
        let engine = MemoryEngine::new();
        let session = connect(&engine);
        let mut out = Vec::new();
        let mut err = Vec::new();
        let status = exec(&session, "frobnicate", &mut out, &mut err, 1024).unwrap();
        assert_eq!(status, 127);
        assert!(out.is_empty());
        assert!(String::from_utf8(err).unwrap().contains("command not found"));
    }

    #[test]
    fn test_make_directory_with_parents() {
        let engine = MemoryEngine::new().with_directory("/srv");
        let session = connect(&engine);
        let sftp = session.open_channel().unwrap().open_file_transfer().unwrap();

        make_directory(&sftp, "/srv/a/b/c", FilePermissions::DEFAULT_DIRECTORY, true).unwrap();
        assert!(engine.has_directory("/srv/a"));
        assert!(engine.has_directory("/srv/a/b/c"));

        // Repeating is not an error with parents.
        make_directory(&sftp, "/srv/a/b/c", FilePermissions::DEFAULT_DIRECTORY, true).unwrap();
        assert!(
            make_directory(&sftp, "/srv/a", FilePermissions::DEFAULT_DIRECTORY, false).is_err()
        );
    }

    #[test]
    fn test_make_directory_through_file_fails() {
        let engine = MemoryEngine::new().with_file("/srv/plain", "x");
        let session = connect(&engine);
        let sftp = session.open_channel().unwrap().open_file_transfer().unwrap();
        assert!(
            make_directory(&sftp, "/srv/plain/sub", FilePermissions::DEFAULT_DIRECTORY, true)
                .is_err()
        );
    }

    #[test]
    fn test_remove_file_and_directory() {
        let engine = MemoryEngine::new()
            .with_file("/tmp/x/file", "1")
            .with_directory("/tmp/empty");
        let session = connect(&engine);
        let sftp = session.open_channel().unwrap().open_file_transfer().unwrap();

        remove(&sftp, "/tmp/x/file").unwrap();
        assert!(engine.file_contents("/tmp/x/file").is_none());
        remove(&sftp, "/tmp/empty").unwrap();
        assert!(!engine.has_directory("/tmp/empty"));

        let err = remove(&sftp, "/tmp/missing").unwrap_err();
        let native = err.downcast_ref::<Error>().unwrap();
        assert_eq!(native.path(), Some("/tmp/missing"));
    }
}
