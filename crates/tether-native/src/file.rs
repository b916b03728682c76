//! Open remote file handle.
//!
//! A [`FileChannel`] owns exactly one native SFTP file handle and is the only
//! place reads and writes cross into the engine. It never loops: a read may
//! return fewer bytes than the buffer holds and a write may accept fewer
//! bytes than offered. Callers that need all of it use the [`io::Read`] and
//! [`io::Write`] impls with `read_to_end`, `write_all` or [`io::copy`].
//!
//! # Thread affinity
//!
//! `read` and `stat` check the thread that opened the file. `write` checks the
//! thread that owns the parent [`crate::Channel`]. `close` checks nothing, so
//! the handle can always be released, including from `Drop`.

use std::fmt;
use std::io;
use std::sync::Arc;

use crate::affinity::{HandleKind, ThreadAffinity, used_after_close};
use crate::engine::Engine;
use crate::error::Result;
use crate::libssh2::Libssh2Engine;
use crate::sftp::SftpShared;
use crate::types::FileAttributes;

/// An open remote file.
///
/// Obtained from [`crate::FileTransferChannel::open_file`].
pub struct FileChannel<E: Engine = Libssh2Engine> {
    sftp: Arc<SftpShared<E>>,
    raw: Option<E::File>,
    path: String,
    affinity: ThreadAffinity,
}

impl<E: Engine> FileChannel<E> {
    pub(crate) fn new(sftp: Arc<SftpShared<E>>, raw: E::File, path: String) -> Self {
        Self {
            sftp,
            raw: Some(raw),
            path,
            affinity: ThreadAffinity::current(HandleKind::File),
        }
    }

    /// The native handle, if neither it nor an ancestor has been closed.
    #[track_caller]
    fn live_handle(&self) -> &E::File {
        match &self.raw {
            Some(raw) if self.sftp.is_live() => raw,
            _ => used_after_close(HandleKind::File),
        }
    }

    fn error(&self, rc: isize) -> crate::Error {
        self.sftp
            .create_error(i32::try_from(rc).unwrap_or(i32::MIN), &self.path)
    }

    /// Read up to `buf.len()` bytes at the current offset.
    ///
    /// Returns the number of bytes placed in `buf`; 0 means end of file.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Sftp`] carrying this file's path when the server
    /// reports a status, otherwise a transport error without a path.
    ///
    /// # Panics
    ///
    /// Panics when called from a thread other than the one that opened the
    /// file, or after the file or an ancestor was closed.
    #[track_caller]
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.affinity.check();
        let raw = self.live_handle();

        let _span = tracing::trace_span!("sftp_read", path = %self.path, capacity = buf.len()).entered();
        let rc = self.sftp.engine().sftp_read(raw, buf);
        if rc < 0 {
            return Err(self.error(rc));
        }
        let n = rc.unsigned_abs();
        debug_assert!(n <= buf.len());
        tracing::trace!(n, "read");
        Ok(n)
    }

    /// Write the first `length` bytes of `buf` at the current offset.
    ///
    /// Returns the number of bytes the server accepted, which may be less
    /// than `length`.
    ///
    /// # Errors
    ///
    /// Same as [`FileChannel::read`].
    ///
    /// # Panics
    ///
    /// Panics when called from a thread other than the one that owns the
    /// parent channel. Otherwise panics if `length > buf.len()`, or after the
    /// file or an ancestor was closed. Nothing reaches the engine in either
    /// case.
    #[track_caller]
    pub fn write(&mut self, buf: &[u8], length: usize) -> Result<usize> {
        self.sftp.channel().affinity().check();
        assert!(
            length <= buf.len(),
            "write length {length} exceeds buffer of {} bytes",
            buf.len()
        );
        let raw = self.live_handle();

        let _span = tracing::trace_span!("sftp_write", path = %self.path, length).entered();
        let rc = self.sftp.engine().sftp_write(raw, &buf[..length]);
        if rc < 0 {
            return Err(self.error(rc));
        }
        let n = rc.unsigned_abs();
        if n < length {
            tracing::trace!(n, length, "partial write");
        }
        Ok(n)
    }

    /// Attributes of the open file.
    ///
    /// # Errors
    ///
    /// Same as [`FileChannel::read`].
    ///
    /// # Panics
    ///
    /// Same as [`FileChannel::read`].
    #[track_caller]
    pub fn stat(&self) -> Result<FileAttributes> {
        self.affinity.check();
        let raw = self.live_handle();

        let _span = tracing::trace_span!("sftp_fstat", path = %self.path).entered();
        let mut attributes = FileAttributes::default();
        let rc = self.sftp.engine().sftp_fstat(raw, &mut attributes);
        if rc < 0 {
            return Err(self.error(rc as isize));
        }
        Ok(attributes)
    }

    /// Release the native file handle. Idempotent, callable from any thread.
    ///
    /// The parent subsystem and channel are left alone.
    pub fn close(&mut self) {
        let Some(mut raw) = self.raw.take() else {
            return;
        };
        let rc = self.sftp.engine().sftp_close_handle(&mut raw);
        if rc < 0 {
            tracing::warn!(path = %self.path, code = rc, "failed to close remote file");
        }
        tracing::debug!(path = %self.path, "remote file closed");
    }

    /// Whether [`FileChannel::close`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.raw.is_none()
    }

    /// Remote path the file was opened with
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Owning thread of this file
    #[must_use]
    pub fn affinity(&self) -> &ThreadAffinity {
        &self.affinity
    }
}

impl<E: Engine> Drop for FileChannel<E> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<E: Engine> io::Read for FileChannel<E> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        FileChannel::read(self, buf).map_err(Into::into)
    }
}

impl<E: Engine> io::Write for FileChannel<E> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        FileChannel::write(self, buf, buf.len()).map_err(Into::into)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<E: Engine> fmt::Debug for FileChannel<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileChannel")
            .field("path", &self.path)
            .field("owner", &self.affinity.owner())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
