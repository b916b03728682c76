//! SFTP subsystem handle.
//!
//! [`FileTransferChannel`] is the error-translation point for everything that
//! touches a remote path. A failed call returns a negative native code; when
//! that code is [`SFTP_PROTOCOL_ERROR`], the real cause is an SFTP status held
//! by the subsystem and the error carries the path. Any other code is a
//! connection problem and is translated by the session, without a path.

use std::ffi::CString;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::affinity::{HandleKind, ThreadAffinity, check_live};
use crate::channel::ChannelShared;
use crate::engine::{Engine, OpenKind};
use crate::error::{Error, Result, SFTP_PROTOCOL_ERROR, SftpError, c_string};
use crate::file::FileChannel;
use crate::libssh2::Libssh2Engine;
use crate::types::{DirectoryEntry, FileAttributes, FilePermissions, OpenFlags};

/// Longest directory entry name accepted from the server.
const MAX_NAME_LEN: usize = 1024;

/// Convert a remote path for the engine. Subsystem errors always name a
/// path, so an empty one is rejected here.
fn remote_path(path: &str) -> Result<CString> {
    if path.is_empty() {
        return Err(Error::InvalidArgument("path is empty".to_string()));
    }
    c_string(path, "path")
}

/// State shared between a subsystem and its open files.
pub(crate) struct SftpShared<E: Engine> {
    channel: Arc<ChannelShared<E>>,
    raw: E::Sftp,
    affinity: ThreadAffinity,
    closed: AtomicBool,
}

impl<E: Engine> SftpShared<E> {
    pub(crate) fn engine(&self) -> &E {
        self.channel.engine()
    }

    pub(crate) fn channel(&self) -> &ChannelShared<E> {
        &self.channel
    }

    pub(crate) fn is_live(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.channel.is_live()
    }

    #[track_caller]
    fn check(&self) {
        self.affinity.check();
        check_live(HandleKind::FileTransfer, self.is_live());
    }

    /// Two-tier translation of a failed native call about `path`.
    pub(crate) fn create_error(&self, code: i32, path: &str) -> Error {
        if code == SFTP_PROTOCOL_ERROR {
            let status = self.engine().sftp_last_error(&self.raw);
            let err = SftpError::new(status, path);
            tracing::debug!(path, status = %err.status(), "SFTP request failed");
            err.into()
        } else {
            self.channel.session().create_error(code)
        }
    }

    fn last_error(&self, path: &str) -> Error {
        let code = self.engine().session_last_errno(self.channel.session().raw());
        self.create_error(code, path)
    }

    fn close_handle(&self, handle: &mut E::File, path: &str) {
        let rc = self.engine().sftp_close_handle(handle);
        if rc < 0 {
            tracing::warn!(path, code = rc, "failed to close remote handle");
        }
    }
}

impl<E: Engine> Drop for SftpShared<E> {
    fn drop(&mut self) {
        let rc = self.channel.engine().sftp_shutdown(&mut self.raw);
        if rc < 0 {
            tracing::warn!(code = rc, "failed to shut down SFTP subsystem");
        }
        tracing::debug!("SFTP subsystem released");
    }
}

/// An SFTP subsystem negotiated over a [`crate::Channel`].
///
/// Bound to the thread that opened it.
pub struct FileTransferChannel<E: Engine = Libssh2Engine> {
    shared: Arc<SftpShared<E>>,
}

impl<E: Engine> FileTransferChannel<E> {
    pub(crate) fn new(channel: Arc<ChannelShared<E>>, raw: E::Sftp) -> Self {
        tracing::debug!("SFTP subsystem opened");
        Self {
            shared: Arc::new(SftpShared {
                channel,
                raw,
                affinity: ThreadAffinity::current(HandleKind::FileTransfer),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn check_status(&self, rc: i32, path: &str) -> Result<()> {
        if rc < 0 {
            return Err(self.shared.create_error(rc, path));
        }
        Ok(())
    }

    /// Open a remote file.
    ///
    /// The returned handle is bound to the calling thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Sftp`] with `path` if the server refuses the open
    /// (missing file, permissions, ...), or a transport error.
    pub fn open_file(
        &self,
        path: &str,
        flags: OpenFlags,
        mode: FilePermissions,
    ) -> Result<FileChannel<E>> {
        self.shared.check();
        let c_path = remote_path(path)?;

        let _span = tracing::trace_span!("sftp_open", path, flags = flags.bits()).entered();
        match self
            .shared
            .engine()
            .sftp_open(&self.shared.raw, &c_path, flags, mode, OpenKind::File)
        {
            Some(raw) => {
                tracing::debug!(path, "remote file opened");
                Ok(FileChannel::new(Arc::clone(&self.shared), raw, path.to_string()))
            }
            None => Err(self.shared.last_error(path)),
        }
    }

    /// List a remote directory, without the `.` and `..` entries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Sftp`] with `path` if the directory cannot be opened
    /// or read, or a transport error.
    pub fn list_files(&self, path: &str) -> Result<Vec<DirectoryEntry>> {
        self.shared.check();
        let c_path = remote_path(path)?;

        let _span = tracing::trace_span!("sftp_readdir", path).entered();
        let engine = self.shared.engine();
        let Some(mut handle) = engine.sftp_open(
            &self.shared.raw,
            &c_path,
            OpenFlags::READ,
            FilePermissions::DEFAULT_DIRECTORY,
            OpenKind::Directory,
        ) else {
            return Err(self.shared.last_error(path));
        };

        let entries = self.read_directory(&handle, path);
        self.shared.close_handle(&mut handle, path);
        entries
    }

    fn read_directory(&self, handle: &E::File, path: &str) -> Result<Vec<DirectoryEntry>> {
        let engine = self.shared.engine();
        let mut entries = Vec::new();
        let mut name = vec![0u8; MAX_NAME_LEN];
        loop {
            let mut attributes = FileAttributes::default();
            let rc = engine.sftp_readdir(handle, &mut name, &mut attributes);
            if rc < 0 {
                return Err(self
                    .shared
                    .create_error(i32::try_from(rc).unwrap_or(i32::MIN), path));
            }
            if rc == 0 {
                break;
            }
            let name = String::from_utf8_lossy(&name[..rc.unsigned_abs()]).into_owned();
            if name == "." || name == ".." {
                continue;
            }
            entries.push(DirectoryEntry { name, attributes });
        }
        tracing::debug!(path, count = entries.len(), "directory listed");
        Ok(entries)
    }

    /// Create a remote directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Sftp`] with `path` if the server refuses, or a
    /// transport error.
    pub fn create_directory(&self, path: &str, mode: FilePermissions) -> Result<()> {
        self.shared.check();
        let c_path = remote_path(path)?;
        let _span = tracing::trace_span!("sftp_mkdir", path, %mode).entered();
        let rc = self.shared.engine().sftp_mkdir(&self.shared.raw, &c_path, mode);
        self.check_status(rc, path)
    }

    /// Remove an empty remote directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Sftp`] with `path` if the server refuses, or a
    /// transport error.
    pub fn delete_directory(&self, path: &str) -> Result<()> {
        self.shared.check();
        let c_path = remote_path(path)?;
        let _span = tracing::trace_span!("sftp_rmdir", path).entered();
        let rc = self.shared.engine().sftp_rmdir(&self.shared.raw, &c_path);
        self.check_status(rc, path)
    }

    /// Remove a remote file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Sftp`] with `path` if the server refuses, or a
    /// transport error.
    pub fn delete_file(&self, path: &str) -> Result<()> {
        self.shared.check();
        let c_path = remote_path(path)?;
        let _span = tracing::trace_span!("sftp_unlink", path).entered();
        let rc = self.shared.engine().sftp_unlink(&self.shared.raw, &c_path);
        self.check_status(rc, path)
    }

    /// Attributes of a remote path, following symlinks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Sftp`] with `path` if the path does not exist, or a
    /// transport error.
    pub fn stat(&self, path: &str) -> Result<FileAttributes> {
        self.shared.check();
        let c_path = remote_path(path)?;
        let _span = tracing::trace_span!("sftp_stat", path).entered();
        let mut attributes = FileAttributes::default();
        let rc = self
            .shared
            .engine()
            .sftp_stat(&self.shared.raw, &c_path, &mut attributes);
        self.check_status(rc, path)?;
        Ok(attributes)
    }

    /// Mark the subsystem closed. Idempotent.
    ///
    /// Files still open panic on their next read or write. The subsystem is
    /// shut down once the last of them is dropped.
    pub fn close(&mut self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!("SFTP subsystem closed");
        }
    }

    /// Whether this subsystem or one of its ancestors has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        !self.shared.is_live()
    }

    /// Owning thread of this subsystem
    #[must_use]
    pub fn affinity(&self) -> &ThreadAffinity {
        &self.shared.affinity
    }
}

impl<E: Engine> fmt::Debug for FileTransferChannel<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileTransferChannel")
            .field("owner", &self.shared.affinity.owner())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
