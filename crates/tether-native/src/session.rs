//! SSH session handle.
//!
//! A [`Session`] owns the native connection object. It is the root of the
//! handle tree: channels keep the session's shared state alive, so the native
//! session is released only after the last channel built on it.

use std::fmt;
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::affinity::{HandleKind, ThreadAffinity, check_live};
use crate::channel::Channel;
use crate::config::SessionConfig;
use crate::engine::Engine;
use crate::error::{Error, ErrorCode, NativeError, Result, c_string};
use crate::libssh2::Libssh2Engine;

/// State shared between a session and its descendants.
pub(crate) struct SessionShared<E: Engine> {
    engine: E,
    raw: E::Session,
    affinity: ThreadAffinity,
    closed: AtomicBool,
}

impl<E: Engine> SessionShared<E> {
    pub(crate) fn engine(&self) -> &E {
        &self.engine
    }

    pub(crate) fn raw(&self) -> &E::Session {
        &self.raw
    }

    pub(crate) fn is_live(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    #[track_caller]
    fn check(&self) {
        self.affinity.check();
        check_live(HandleKind::Session, self.is_live());
    }

    /// Translate a connection-level native code.
    ///
    /// The engine's last error message is attached when it describes `code`.
    pub(crate) fn create_error(&self, code: i32) -> Error {
        let (last_code, message) = self.engine.session_last_error(&self.raw);
        let message = if last_code == code {
            message
        } else {
            String::new()
        };
        let err = NativeError::new(code, message);
        tracing::debug!(code, kind = ?err.kind(), message = %err.message(), "native call failed");
        err.into()
    }

    /// Error for a constructor primitive that returned no object.
    pub(crate) fn last_error(&self) -> Error {
        let code = self.engine.session_last_errno(&self.raw);
        self.create_error(code)
    }

    fn disconnect(&self) {
        let rc = self.engine.session_disconnect(&self.raw, c"Normal shutdown");
        if rc < 0 {
            tracing::warn!(code = rc, "session disconnect failed");
        }
    }
}

impl<E: Engine> Drop for SessionShared<E> {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.disconnect();
        }
        let rc = self.engine.session_free(&mut self.raw);
        if rc < 0 {
            tracing::warn!(code = rc, "failed to release native session");
        }
        tracing::debug!("native session released");
    }
}

/// An SSH connection.
///
/// All calls must come from the thread that created the session.
pub struct Session<E: Engine = Libssh2Engine> {
    shared: Arc<SessionShared<E>>,
}

impl Session<Libssh2Engine> {
    /// Connect over TCP and run the handshake with libssh2.
    ///
    /// Every resolved address is tried in turn with the configured connect
    /// timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if no address could be reached, or the
    /// translated native error if the handshake fails.
    pub fn connect<A: ToSocketAddrs>(addr: A, config: &SessionConfig) -> Result<Self> {
        config.validate()?;
        let timeout = config.connect_timeout();

        let mut last_err = None;
        for addr in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    tracing::debug!(%addr, "TCP connection established");
                    return Self::handshake(Libssh2Engine::new(), stream, config);
                }
                Err(e) => {
                    tracing::debug!(%addr, error = %e, "TCP connect failed");
                    last_err = Some(e);
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing"))
            .into())
    }
}

impl<E: Engine> Session<E> {
    /// Run the SSH handshake over an already connected transport.
    ///
    /// The session is bound to the calling thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for an invalid config, or the
    /// translated native error if allocation or the handshake fails.
    pub fn handshake(engine: E, transport: E::Transport, config: &SessionConfig) -> Result<Self> {
        config.validate()?;
        let _span = tracing::debug_span!("session_handshake").entered();

        let Some(raw) = engine.session_init() else {
            return Err(NativeError::new(ErrorCode::Alloc.raw(), "unable to allocate native session").into());
        };
        let mut shared = SessionShared {
            engine,
            raw,
            affinity: ThreadAffinity::current(HandleKind::Session),
            closed: AtomicBool::new(false),
        };

        shared
            .engine
            .session_set_timeout(&shared.raw, config.session_timeout_ms);
        let rc = shared.engine.session_handshake(&mut shared.raw, transport);
        if rc < 0 {
            let err = shared.create_error(rc);
            // Nothing to disconnect; dropping `shared` frees the session.
            shared.closed.store(true, Ordering::Release);
            return Err(err);
        }

        shared.engine.session_keepalive_config(
            &shared.raw,
            config.keepalive_want_reply,
            config.keepalive_interval_secs,
        );

        let banner = shared.engine.session_banner(&shared.raw).unwrap_or_default();
        tracing::debug!(%banner, "session established");
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// Authenticate with a password.
    ///
    /// # Errors
    ///
    /// Returns a transport error (usually [`crate::TransportErrorKind::Authentication`])
    /// if the server rejects the credentials.
    pub fn authenticate_password(&self, username: &str, password: &str) -> Result<()> {
        self.shared.check();
        let c_user = c_string(username, "username")?;
        let c_password = c_string(password, "password")?;

        let _span = tracing::trace_span!("userauth_password", username).entered();
        let rc = self
            .shared
            .engine
            .session_userauth_password(&self.shared.raw, &c_user, &c_password);
        if rc < 0 {
            return Err(self.shared.create_error(rc));
        }
        tracing::debug!(username, "authenticated with password");
        Ok(())
    }

    /// Authenticate with a key pair read from files.
    ///
    /// `public_key` may be omitted when the engine can derive it from the
    /// private key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] for paths that are not UTF-8, or a
    /// transport error if the key is rejected or cannot be read.
    pub fn authenticate_public_key(
        &self,
        username: &str,
        private_key: &Path,
        public_key: Option<&Path>,
        passphrase: Option<&str>,
    ) -> Result<()> {
        self.shared.check();
        let c_user = c_string(username, "username")?;
        let c_private = c_string(path_str(private_key)?, "private key path")?;
        let c_public = public_key
            .map(|path| c_string(path_str(path)?, "public key path"))
            .transpose()?;
        let c_passphrase = passphrase
            .map(|phrase| c_string(phrase, "passphrase"))
            .transpose()?;

        let _span = tracing::trace_span!("userauth_publickey", username).entered();
        let rc = self.shared.engine.session_userauth_publickey_file(
            &self.shared.raw,
            &c_user,
            c_public.as_deref(),
            &c_private,
            c_passphrase.as_deref(),
        );
        if rc < 0 {
            return Err(self.shared.create_error(rc));
        }
        tracing::debug!(username, key = %private_key.display(), "authenticated with public key");
        Ok(())
    }

    /// Whether authentication has completed.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.shared.check();
        self.shared.engine.session_authenticated(&self.shared.raw)
    }

    /// Identification string the server sent during the handshake.
    #[must_use]
    pub fn remote_banner(&self) -> Option<String> {
        self.shared.check();
        self.shared.engine.session_banner(&self.shared.raw)
    }

    /// SHA-256 hash of the server's host key.
    #[must_use]
    pub fn host_key_sha256(&self) -> Option<[u8; 32]> {
        self.shared.check();
        self.shared.engine.session_host_key_sha256(&self.shared.raw)
    }

    /// Send a keepalive if one is due. Returns the delay until the next one.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the message cannot be sent.
    pub fn send_keepalive(&self) -> Result<Duration> {
        self.shared.check();
        let mut seconds_to_next = 0;
        let rc = self
            .shared
            .engine
            .session_keepalive_send(&self.shared.raw, &mut seconds_to_next);
        if rc < 0 {
            return Err(self.shared.create_error(rc));
        }
        Ok(Duration::from_secs(u64::try_from(seconds_to_next).unwrap_or(0)))
    }

    /// Open a `session` channel.
    ///
    /// The channel is bound to the calling thread.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the server refuses the channel.
    pub fn open_channel(&self) -> Result<Channel<E>> {
        self.shared.check();
        let _span = tracing::trace_span!("channel_open_session").entered();
        match self.shared.engine.channel_open_session(&self.shared.raw) {
            Some(raw) => Ok(Channel::new(Arc::clone(&self.shared), raw)),
            None => Err(self.shared.last_error()),
        }
    }

    /// Translate a native return code into a connection-level error.
    ///
    /// The result never carries a path, including for the SFTP sentinel,
    /// which only a [`crate::FileTransferChannel`] can resolve.
    #[must_use]
    pub fn create_error(&self, code: i32) -> Error {
        self.shared.check();
        self.shared.create_error(code)
    }

    /// Disconnect and mark the session closed. Idempotent.
    ///
    /// Descendants still alive panic on their next call. The native session
    /// is released once the last of them is dropped.
    pub fn close(&mut self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.disconnect();
        tracing::debug!("session closed");
    }

    /// Whether [`Session::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        !self.shared.is_live()
    }

    /// Owning thread of this session
    #[must_use]
    pub fn affinity(&self) -> &ThreadAffinity {
        &self.shared.affinity
    }
}

impl<E: Engine> fmt::Debug for Session<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("owner", &self.shared.affinity.owner())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| Error::InvalidArgument(format!("{} is not valid UTF-8", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryEngine, MemoryTransport, Operation, Released};
    use crate::{ErrorCategory, TransportErrorKind};
    use std::thread;

    fn open(engine: &MemoryEngine) -> Session<MemoryEngine> {
        Session::handshake(engine.clone(), MemoryTransport, &SessionConfig::default()).unwrap()
    }

    #[test]
    fn test_handshake_applies_config() {
        let engine = MemoryEngine::new();
        let config = SessionConfig {
            session_timeout_ms: 1234,
            keepalive_interval_secs: 15,
            ..Default::default()
        };
        let session = Session::handshake(engine.clone(), MemoryTransport, &config).unwrap();

        assert_eq!(engine.session_timeout_ms(), 1234);
        assert_eq!(session.send_keepalive().unwrap(), Duration::from_secs(15));
        assert!(session.remote_banner().unwrap().starts_with("SSH-2.0-"));
        assert!(session.host_key_sha256().is_some());
    }

    #[test]
    fn test_handshake_failure_frees_session() {
        let engine = MemoryEngine::new();
        engine.fail_next(Operation::Handshake, ErrorCode::KexFailure.raw());

        let err = Session::handshake(engine.clone(), MemoryTransport, &SessionConfig::default())
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Transport);
        assert_eq!(err.code(), Some(-5));
        assert_eq!(engine.stats().sessions_freed, 1);
        assert_eq!(engine.stats().disconnects, 0);
    }

    #[test]
    fn test_handshake_rejects_invalid_config() {
        let config = SessionConfig {
            read_chunk_size: 0,
            ..Default::default()
        };
        let err = Session::handshake(MemoryEngine::new(), MemoryTransport, &config).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_password_authentication() {
        let engine = MemoryEngine::new().with_password("alice", "hunter2");
        let session = open(&engine);
        assert!(!session.is_authenticated());

        let err = session.authenticate_password("alice", "wrong").unwrap_err();
        match &err {
            Error::Native(native) => {
                assert_eq!(native.kind(), TransportErrorKind::Authentication);
                assert!(native.message().contains("username/password"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.path(), None);

        session.authenticate_password("alice", "hunter2").unwrap();
        assert!(session.is_authenticated());
    }

    #[test]
    fn test_public_key_authentication() {
        let engine = MemoryEngine::new().with_key_file("bob", "/home/bob/.ssh/id_ed25519");
        let session = open(&engine);

        assert!(
            session
                .authenticate_public_key("bob", Path::new("/tmp/other_key"), None, None)
                .is_err()
        );
        session
            .authenticate_public_key(
                "bob",
                Path::new("/home/bob/.ssh/id_ed25519"),
                Some(Path::new("/home/bob/.ssh/id_ed25519.pub")),
                Some("secret"),
            )
            .unwrap();
        assert!(session.is_authenticated());
    }

    #[test]
    fn test_interior_nul_rejected_before_engine() {
        let session = open(&MemoryEngine::new());
        let err = session.authenticate_password("al\0ice", "pw").unwrap_err();
        assert_eq!(err.category(), ErrorCategory::InvalidArgument);
    }

    #[test]
    fn test_create_error_never_has_path() {
        let session = open(&MemoryEngine::new());

        let err = session.create_error(-9);
        assert_eq!(err.category(), ErrorCategory::Transport);
        assert_eq!(err.code(), Some(-9));
        assert_eq!(err.path(), None);

        let err = session.create_error(crate::SFTP_PROTOCOL_ERROR);
        assert_eq!(err.category(), ErrorCategory::Transport);
        assert_eq!(err.path(), None);
    }

    #[test]
    fn test_open_channel_failure_is_transport_error() {
        let engine = MemoryEngine::new();
        let session = open(&engine);
        engine.fail_next(Operation::OpenChannel, ErrorCode::ChannelFailure.raw());

        let err = session.open_channel().unwrap_err();
        assert_eq!(err.code(), Some(-21));
        assert_eq!(err.path(), None);
    }

    #[test]
    fn test_close_is_idempotent() {
        let engine = MemoryEngine::new();
        let mut session = open(&engine);

        session.close();
        session.close();
        assert!(session.is_closed());
        assert_eq!(engine.stats().disconnects, 1);
        assert_eq!(engine.stats().sessions_freed, 0);

        drop(session);
        assert_eq!(engine.stats().disconnects, 1);
        assert_eq!(engine.stats().sessions_freed, 1);
    }

    #[test]
    fn test_drop_without_close_disconnects() {
        let engine = MemoryEngine::new();
        drop(open(&engine));
        assert_eq!(engine.stats().disconnects, 1);
        assert_eq!(engine.released(), [Released::Session]);
    }

    #[test]
    #[should_panic(expected = "session handle used after")]
    fn test_use_after_close_panics() {
        let mut session = open(&MemoryEngine::new());
        session.close();
        let _ = session.open_channel();
    }

    #[test]
    fn test_cross_thread_use_panics() {
        let session = open(&MemoryEngine::new());
        assert!(!session.is_authenticated());

        let result = thread::spawn(move || session.is_authenticated()).join();
        assert!(result.is_err());
    }
}
