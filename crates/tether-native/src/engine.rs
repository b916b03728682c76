//! The native engine seam.
//!
//! [`Engine`] lists the primitives the handle layer needs, in the shape
//! libssh2 exposes them: calls return signed native codes, constructors
//! return `None` on failure and leave the cause in the session's last error.
//! The handle types ([`crate::Session`], [`crate::Channel`], ...) own the
//! engine's raw objects and are the only callers of this trait.
//!
//! Raw objects are not thread-safe. Implementations may assume that the
//! handle layer never calls into the same object from two threads.

use std::ffi::CStr;

use crate::types::{FileAttributes, FilePermissions, OpenFlags};

/// Whether `sftp_open` opens a file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenKind {
    /// Regular file
    File,
    /// Directory, to be read with `sftp_readdir`
    Directory,
}

/// Channel sub-stream selector for reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamId {
    /// Primary data stream (stdin/stdout)
    Data,
    /// Extended data stream 1 (stderr)
    Stderr,
}

impl StreamId {
    /// Native stream number
    #[must_use]
    pub fn raw(self) -> i32 {
        match self {
            StreamId::Data => 0,
            StreamId::Stderr => 1,
        }
    }
}

/// Native primitives wrapped by the handle layer.
///
/// Return conventions follow libssh2: `0` or a non-negative count on success,
/// a negative native code on failure.
pub trait Engine: Send + Sync + 'static {
    /// Connected transport handed to the handshake (a socket for libssh2)
    type Transport: Send;
    /// Raw session object
    type Session: Send + Sync;
    /// Raw channel object
    type Channel: Send + Sync;
    /// Raw SFTP subsystem object
    type Sftp: Send + Sync;
    /// Raw SFTP file or directory handle
    type File: Send + Sync;

    /// Allocate a session. `None` if allocation failed.
    fn session_init(&self) -> Option<Self::Session>;
    /// Native blocking timeout for every call on this session; 0 disables it.
    fn session_set_timeout(&self, session: &Self::Session, timeout_ms: u32);
    /// Run the protocol handshake over `transport`.
    fn session_handshake(&self, session: &mut Self::Session, transport: Self::Transport) -> i32;
    /// Remote identification banner, once the handshake completed.
    fn session_banner(&self, session: &Self::Session) -> Option<String>;
    /// SHA-256 hash of the server host key.
    fn session_host_key_sha256(&self, session: &Self::Session) -> Option<[u8; 32]>;
    /// Password authentication.
    fn session_userauth_password(
        &self,
        session: &Self::Session,
        username: &CStr,
        password: &CStr,
    ) -> i32;
    /// Public key authentication from key files.
    fn session_userauth_publickey_file(
        &self,
        session: &Self::Session,
        username: &CStr,
        public_key: Option<&CStr>,
        private_key: &CStr,
        passphrase: Option<&CStr>,
    ) -> i32;
    /// Whether authentication completed.
    fn session_authenticated(&self, session: &Self::Session) -> bool;
    /// Configure keepalive messages; an interval of 0 disables them.
    fn session_keepalive_config(&self, session: &Self::Session, want_reply: bool, interval_secs: u32);
    /// Send a keepalive if one is due; writes the seconds until the next one.
    fn session_keepalive_send(&self, session: &Self::Session, seconds_to_next: &mut i32) -> i32;
    /// Code of the last failure on this session.
    fn session_last_errno(&self, session: &Self::Session) -> i32;
    /// Code and message of the last failure on this session.
    fn session_last_error(&self, session: &Self::Session) -> (i32, String);
    /// Send a disconnect message.
    fn session_disconnect(&self, session: &Self::Session, description: &CStr) -> i32;
    /// Release the session. Called exactly once.
    fn session_free(&self, session: &mut Self::Session) -> i32;

    /// Open a `session` type channel.
    fn channel_open_session(&self, session: &Self::Session) -> Option<Self::Channel>;
    /// Issue an `exec`, `shell` or `subsystem` request.
    fn channel_process_startup(
        &self,
        channel: &Self::Channel,
        request: &str,
        message: Option<&[u8]>,
    ) -> i32;
    /// Request a pseudo terminal.
    fn channel_request_pty(&self, channel: &Self::Channel, term: &str, cols: u32, rows: u32) -> i32;
    /// Change the pseudo terminal size.
    fn channel_request_pty_size(&self, channel: &Self::Channel, cols: u32, rows: u32) -> i32;
    /// Read into `buf`; 0 at end of stream.
    fn channel_read(&self, channel: &Self::Channel, stream: StreamId, buf: &mut [u8]) -> isize;
    /// Write from `buf`; may accept fewer bytes than offered.
    fn channel_write(&self, channel: &Self::Channel, stream: StreamId, buf: &[u8]) -> isize;
    /// Signal end of input to the remote side.
    fn channel_send_eof(&self, channel: &Self::Channel) -> i32;
    /// Whether the remote side signalled end of output.
    fn channel_eof(&self, channel: &Self::Channel) -> bool;
    /// Block until the remote side closes the channel. Only valid after the
    /// remote EOF.
    fn channel_wait_closed(&self, channel: &Self::Channel) -> i32;
    /// Exit status of the remote command; 0 until the remote close arrived.
    fn channel_exit_status(&self, channel: &Self::Channel) -> i32;
    /// Send a channel close message.
    fn channel_close(&self, channel: &Self::Channel) -> i32;
    /// Release the channel. Called exactly once.
    fn channel_free(&self, channel: &mut Self::Channel) -> i32;

    /// Negotiate the SFTP subsystem. `channel` is the logical parent; engines
    /// that manage their own subsystem channel may ignore it.
    fn sftp_init(&self, session: &Self::Session, channel: &Self::Channel) -> Option<Self::Sftp>;
    /// SFTP status behind the last `SFTP_PROTOCOL_ERROR`.
    fn sftp_last_error(&self, sftp: &Self::Sftp) -> u32;
    /// Release the subsystem. Called exactly once.
    fn sftp_shutdown(&self, sftp: &mut Self::Sftp) -> i32;
    /// Open a remote file or directory.
    fn sftp_open(
        &self,
        sftp: &Self::Sftp,
        path: &CStr,
        flags: OpenFlags,
        mode: FilePermissions,
        kind: OpenKind,
    ) -> Option<Self::File>;
    /// Read into `buf` at the handle's offset; 0 at end of file.
    fn sftp_read(&self, file: &Self::File, buf: &mut [u8]) -> isize;
    /// Write `buf` at the handle's offset; may accept fewer bytes.
    fn sftp_write(&self, file: &Self::File, buf: &[u8]) -> isize;
    /// Read the next directory entry name into `name`; 0 when exhausted.
    fn sftp_readdir(&self, dir: &Self::File, name: &mut [u8], attrs: &mut FileAttributes) -> isize;
    /// Attributes of an open handle.
    fn sftp_fstat(&self, file: &Self::File, attrs: &mut FileAttributes) -> i32;
    /// Attributes of a path, following symlinks.
    fn sftp_stat(&self, sftp: &Self::Sftp, path: &CStr, attrs: &mut FileAttributes) -> i32;
    /// Create a directory.
    fn sftp_mkdir(&self, sftp: &Self::Sftp, path: &CStr, mode: FilePermissions) -> i32;
    /// Remove an empty directory.
    fn sftp_rmdir(&self, sftp: &Self::Sftp, path: &CStr) -> i32;
    /// Remove a file.
    fn sftp_unlink(&self, sftp: &Self::Sftp, path: &CStr) -> i32;
    /// Release a file or directory handle. Called exactly once.
    fn sftp_close_handle(&self, file: &mut Self::File) -> i32;
}
