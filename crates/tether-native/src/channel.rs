//! Channel handle.
//!
//! A [`Channel`] is one multiplexed stream over a [`crate::Session`]. It can
//! run a command, host an interactive shell, or carry the SFTP subsystem via
//! [`Channel::open_file_transfer`].

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::affinity::{HandleKind, ThreadAffinity, check_live};
use crate::engine::{Engine, StreamId};
use crate::error::{Error, Result};
use crate::libssh2::Libssh2Engine;
use crate::session::SessionShared;
use crate::sftp::FileTransferChannel;

/// State shared between a channel and its descendants.
pub(crate) struct ChannelShared<E: Engine> {
    session: Arc<SessionShared<E>>,
    raw: E::Channel,
    affinity: ThreadAffinity,
    closed: AtomicBool,
}

impl<E: Engine> ChannelShared<E> {
    pub(crate) fn engine(&self) -> &E {
        self.session.engine()
    }

    pub(crate) fn session(&self) -> &SessionShared<E> {
        &self.session
    }

    pub(crate) fn affinity(&self) -> &ThreadAffinity {
        &self.affinity
    }

    pub(crate) fn is_live(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.session.is_live()
    }

    #[track_caller]
    fn check(&self) {
        self.affinity.check();
        check_live(HandleKind::Channel, self.is_live());
    }

    fn close_native(&self) {
        if !self.session.is_live() {
            return;
        }
        let rc = self.engine().channel_close(&self.raw);
        if rc < 0 {
            tracing::warn!(code = rc, "channel close failed");
        }
    }
}

impl<E: Engine> Drop for ChannelShared<E> {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_native();
        }
        let rc = self.session.engine().channel_free(&mut self.raw);
        if rc < 0 {
            tracing::warn!(code = rc, "failed to release native channel");
        }
        tracing::debug!("native channel released");
    }
}

/// A session channel.
///
/// Bound to the thread that opened it. Implements [`io::Read`] and
/// [`io::Write`] over the data stream.
pub struct Channel<E: Engine = Libssh2Engine> {
    shared: Arc<ChannelShared<E>>,
}

impl<E: Engine> Channel<E> {
    pub(crate) fn new(session: Arc<SessionShared<E>>, raw: E::Channel) -> Self {
        tracing::debug!("channel opened");
        Self {
            shared: Arc::new(ChannelShared {
                session,
                raw,
                affinity: ThreadAffinity::current(HandleKind::Channel),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn error(&self, code: isize) -> Error {
        self.shared
            .session
            .create_error(i32::try_from(code).unwrap_or(i32::MIN))
    }

    fn startup(&self, request: &str, message: Option<&[u8]>) -> Result<()> {
        self.shared.check();
        let _span = tracing::trace_span!("channel_process_startup", request).entered();
        let rc = self
            .shared
            .engine()
            .channel_process_startup(&self.shared.raw, request, message);
        if rc < 0 {
            return Err(self.shared.session.create_error(rc));
        }
        Ok(())
    }

    /// Negotiate a new SFTP subsystem over this channel.
    ///
    /// Each call yields an independent subsystem instance, bound to the
    /// calling thread.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the server rejects the subsystem.
    pub fn open_file_transfer(&self) -> Result<FileTransferChannel<E>> {
        self.shared.check();
        let _span = tracing::trace_span!("sftp_init").entered();
        let session = &self.shared.session;
        match self.shared.engine().sftp_init(session.raw(), &self.shared.raw) {
            Some(raw) => Ok(FileTransferChannel::new(Arc::clone(&self.shared), raw)),
            None => Err(session.last_error()),
        }
    }

    /// Run `command` on the remote host.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the request is denied.
    pub fn exec(&self, command: &str) -> Result<()> {
        self.startup("exec", Some(command.as_bytes()))?;
        tracing::debug!(command, "exec started");
        Ok(())
    }

    /// Start the user's login shell.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the request is denied.
    pub fn shell(&self) -> Result<()> {
        self.startup("shell", None)
    }

    /// Request a pseudo terminal of `cols` x `rows` characters.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the request is denied.
    pub fn request_pty(&self, term: &str, cols: u32, rows: u32) -> Result<()> {
        self.shared.check();
        let rc = self
            .shared
            .engine()
            .channel_request_pty(&self.shared.raw, term, cols, rows);
        if rc < 0 {
            return Err(self.shared.session.create_error(rc));
        }
        Ok(())
    }

    /// Change the size of the pseudo terminal.
    ///
    /// # Errors
    ///
    /// Returns a transport error if no pty was requested or the request fails.
    pub fn resize_pty(&self, cols: u32, rows: u32) -> Result<()> {
        self.shared.check();
        let rc = self
            .shared
            .engine()
            .channel_request_pty_size(&self.shared.raw, cols, rows);
        if rc < 0 {
            return Err(self.shared.session.create_error(rc));
        }
        Ok(())
    }

    fn read_stream(&mut self, stream: StreamId, buf: &mut [u8]) -> Result<usize> {
        self.shared.check();
        let _span = tracing::trace_span!("channel_read", ?stream, capacity = buf.len()).entered();
        let rc = self.shared.engine().channel_read(&self.shared.raw, stream, buf);
        if rc < 0 {
            return Err(self.error(rc));
        }
        Ok(rc.unsigned_abs())
    }

    /// Read from the data stream. Returns 0 at end of stream.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the native read fails.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.read_stream(StreamId::Data, buf)
    }

    /// Read from the stderr stream. Returns 0 when it is drained.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the native read fails.
    pub fn read_stderr(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.read_stream(StreamId::Stderr, buf)
    }

    /// Write to the data stream. May accept fewer bytes than offered.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the native write fails.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.shared.check();
        let _span = tracing::trace_span!("channel_write", len = buf.len()).entered();
        let rc = self
            .shared
            .engine()
            .channel_write(&self.shared.raw, StreamId::Data, buf);
        if rc < 0 {
            return Err(self.error(rc));
        }
        Ok(rc.unsigned_abs())
    }

    /// Tell the remote side no more input follows.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the message cannot be sent.
    pub fn send_eof(&mut self) -> Result<()> {
        self.shared.check();
        let rc = self.shared.engine().channel_send_eof(&self.shared.raw);
        if rc < 0 {
            return Err(self.shared.session.create_error(rc));
        }
        Ok(())
    }

    /// Whether the remote side has signalled end of output.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        self.shared.check();
        self.shared.engine().channel_eof(&self.shared.raw)
    }

    /// Wait for the remote side to close the channel.
    ///
    /// The server reports the exit status just before its close, so call
    /// this once the output is drained and before [`Channel::exit_status`].
    ///
    /// # Errors
    ///
    /// Returns a transport error if the remote side has not sent EOF yet, or
    /// if the connection fails while waiting.
    pub fn wait_closed(&mut self) -> Result<()> {
        self.shared.check();
        let _span = tracing::trace_span!("channel_wait_closed").entered();
        let rc = self.shared.engine().channel_wait_closed(&self.shared.raw);
        if rc < 0 {
            return Err(self.shared.session.create_error(rc));
        }
        Ok(())
    }

    /// Exit status of the remote command. Reads 0 until
    /// [`Channel::wait_closed`] has returned.
    #[must_use]
    pub fn exit_status(&self) -> i32 {
        self.shared.check();
        self.shared.engine().channel_exit_status(&self.shared.raw)
    }

    /// Send a channel close and mark the channel closed. Idempotent.
    ///
    /// Subsystems and files opened over this channel panic on their next
    /// call. The native channel is released once the last of them is dropped.
    pub fn close(&mut self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.close_native();
        tracing::debug!("channel closed");
    }

    /// Whether this channel or its session has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        !self.shared.is_live()
    }

    /// Owning thread of this channel
    #[must_use]
    pub fn affinity(&self) -> &ThreadAffinity {
        &self.shared.affinity
    }
}

impl<E: Engine> io::Read for Channel<E> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Channel::read(self, buf).map_err(Into::into)
    }
}

impl<E: Engine> io::Write for Channel<E> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Channel::write(self, buf).map_err(Into::into)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<E: Engine> fmt::Debug for Channel<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("owner", &self.shared.affinity.owner())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use crate::config::SessionConfig;
    use crate::error::ErrorCode;
    use crate::memory::{MemoryEngine, MemoryTransport, Operation, Released};
    use crate::session::Session;
    use std::io::{Read, Write};
    use std::thread;

    fn session(engine: &MemoryEngine) -> Session<MemoryEngine> {
        Session::handshake(engine.clone(), MemoryTransport, &SessionConfig::default()).unwrap()
    }

    #[test]
    fn test_exec_collects_output() {
        let engine = MemoryEngine::new().with_command("uname -s", "Linux\n", "", 0);
        let session = session(&engine);
        let mut channel = session.open_channel().unwrap();

        channel.exec("uname -s").unwrap();
        let mut output = String::new();
        channel.read_to_string(&mut output).unwrap();

        assert_eq!(output, "Linux\n");
        assert!(channel.is_eof());
        channel.wait_closed().unwrap();
        assert_eq!(channel.exit_status(), 0);
    }

    #[test]
    fn test_exec_stderr_and_exit_status() {
        let engine = MemoryEngine::new().with_command("false", "", "failed\n", 1);
        let session = session(&engine);
        let mut channel = session.open_channel().unwrap();
        channel.exec("false").unwrap();

        let mut buf = [0u8; 32];
        let n = channel.read_stderr(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"failed\n");
        assert_eq!(channel.read_stderr(&mut buf).unwrap(), 0);
        assert_eq!(channel.read(&mut buf).unwrap(), 0);
        channel.wait_closed().unwrap();
        assert_eq!(channel.exit_status(), 1);
    }

    #[test]
    fn test_exit_status_arrives_with_remote_close() {
        let engine = MemoryEngine::new().with_command("make", "building\n", "", 2);
        let session = session(&engine);
        let mut channel = session.open_channel().unwrap();
        channel.exec("make").unwrap();

        // Before the output is drained the remote side has not sent EOF.
        let err = channel.wait_closed().unwrap_err();
        assert_eq!(err.code(), Some(i64::from(ErrorCode::Inval.raw())));

        let mut output = String::new();
        channel.read_to_string(&mut output).unwrap();
        assert_eq!(channel.exit_status(), 0);

        channel.wait_closed().unwrap();
        assert_eq!(channel.exit_status(), 2);
    }

    #[test]
    #[should_panic(expected = "thread affinity violation")]
    fn test_wait_closed_from_other_thread_panics() {
        let session = session(&MemoryEngine::new().with_command("true", "", "", 0));
        let mut channel = session.open_channel().unwrap();
        channel.exec("true").unwrap();
        if let Err(payload) = thread::spawn(move || channel.wait_closed()).join() {
            std::panic::resume_unwind(payload);
        }
    }

    #[test]
    fn test_shell_with_pty() {
        let engine = MemoryEngine::new();
        let session = session(&engine);
        let mut channel = session.open_channel().unwrap();

        channel.request_pty("xterm-256color", 80, 24).unwrap();
        channel.shell().unwrap();
        channel.resize_pty(120, 40).unwrap();
        assert_eq!(engine.pty_size(), Some((120, 40)));

        channel.write_all(b"echo hi\n").unwrap();
        channel.flush().unwrap();
        let mut buf = [0u8; 16];
        let n = Read::read(&mut channel, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"echo hi\n");
        assert_eq!(engine.channel_input(), b"echo hi\n");
    }

    #[test]
    fn test_resize_without_pty_fails() {
        let session = session(&MemoryEngine::new());
        let channel = session.open_channel().unwrap();
        let err = channel.resize_pty(10, 10).unwrap_err();
        assert_eq!(err.code(), Some(i64::from(ErrorCode::ChannelRequestDenied.raw())));
    }

    #[test]
    fn test_read_error_is_transport_error() {
        let engine = MemoryEngine::new().with_command("cat", "x", "", 0);
        let session = session(&engine);
        let mut channel = session.open_channel().unwrap();
        channel.exec("cat").unwrap();

        engine.fail_next(Operation::ChannelRead, ErrorCode::SocketTimeout.raw());
        let err = channel.read(&mut [0u8; 4]).unwrap_err();
        assert_eq!(err.code(), Some(-30));
        assert_eq!(err.path(), None);
    }

    #[test]
    fn test_open_file_transfer_failure() {
        let engine = MemoryEngine::new();
        let session = session(&engine);
        let channel = session.open_channel().unwrap();

        engine.fail_next(Operation::SftpInit, ErrorCode::ChannelFailure.raw());
        let err = channel.open_file_transfer().unwrap_err();
        assert_eq!(err.category(), crate::ErrorCategory::Transport);
        assert_eq!(err.code(), Some(-21));
    }

    #[test]
    fn test_close_is_idempotent_and_release_waits_for_children() {
        let engine = MemoryEngine::new();
        let session = session(&engine);
        let mut channel = session.open_channel().unwrap();
        let sftp = channel.open_file_transfer().unwrap();

        channel.close();
        channel.close();
        assert!(channel.is_closed());
        assert_eq!(engine.stats().channel_closes, 1);
        assert_eq!(engine.stats().channels_freed, 0);

        drop(channel);
        assert_eq!(engine.stats().channels_freed, 0);
        drop(sftp);
        assert_eq!(engine.stats().channels_freed, 1);
        assert_eq!(engine.released(), [Released::Sftp, Released::Channel]);
    }

    #[test]
    fn test_session_close_invalidates_channel() {
        let engine = MemoryEngine::new();
        let mut session = session(&engine);
        let channel = session.open_channel().unwrap();
        session.close();

        assert!(channel.is_closed());
        drop(channel);
        // No channel close message over a disconnected session.
        assert_eq!(engine.stats().channel_closes, 0);
        assert_eq!(engine.stats().channels_freed, 1);
    }

    #[test]
    #[should_panic(expected = "channel handle used after")]
    fn test_exec_after_close_panics() {
        let session = session(&MemoryEngine::new());
        let mut channel = session.open_channel().unwrap();
        channel.close();
        let _ = channel.exec("true");
    }

    #[test]
    fn test_channel_read_from_other_thread_panics() {
        let engine = MemoryEngine::new().with_command("cat", "abc", "", 0);
        let session = session(&engine);
        let mut channel = session.open_channel().unwrap();
        channel.exec("cat").unwrap();

        let result = thread::spawn(move || {
            let mut buf = [0u8; 8];
            channel.read(&mut buf)
        })
        .join();
        assert!(result.is_err());
    }
}
