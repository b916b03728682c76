//! Translation of native return codes into typed errors.
//!
//! libssh2 reports failures as negative integers. Most of them describe the
//! state of the connection and carry no information about which file was
//! involved. One value, [`ErrorCode::SftpProtocol`], is a sentinel: the real
//! cause is an SFTP status code that has to be fetched from the subsystem
//! separately. Those two tiers map onto [`Error::Native`] and [`Error::Sftp`].

use std::ffi::CString;
use std::fmt;
use std::io;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Native return code signalling that the SFTP subsystem rejected a request.
///
/// The status behind it is retrieved with the engine's SFTP last-error query.
pub const SFTP_PROTOCOL_ERROR: i32 = -31;

macro_rules! native_codes {
    ($($name:ident = $value:literal => $desc:literal,)*) => {
        /// libssh2 `LIBSSH2_ERROR_*` return codes.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[non_exhaustive]
        pub enum ErrorCode {
            $(
                #[doc = $desc]
                $name,
            )*
            /// A code this crate does not know about
            Unknown(i32),
        }

        impl ErrorCode {
            /// Classify a raw native return code.
            #[must_use]
            pub fn from_raw(code: i32) -> Self {
                match code {
                    $($value => Self::$name,)*
                    other => Self::Unknown(other),
                }
            }

            /// The raw native value.
            #[must_use]
            pub fn raw(self) -> i32 {
                match self {
                    $(Self::$name => $value,)*
                    Self::Unknown(code) => code,
                }
            }

            /// Short human readable description.
            #[must_use]
            pub fn description(self) -> &'static str {
                match self {
                    $(Self::$name => $desc,)*
                    Self::Unknown(_) => "unknown native error",
                }
            }
        }
    };
}

native_codes! {
    SocketNone = -1 => "no socket",
    BannerRecv = -2 => "failed to receive banner",
    BannerSend = -3 => "failed to send banner",
    InvalidMac = -4 => "invalid MAC",
    KexFailure = -5 => "key exchange failure",
    Alloc = -6 => "allocation failure",
    SocketSend = -7 => "socket send failure",
    KeyExchangeFailure = -8 => "key exchange failure",
    Timeout = -9 => "operation timed out",
    HostkeyInit = -10 => "host key initialization failed",
    HostkeySign = -11 => "host key signature verification failed",
    Decrypt = -12 => "decryption failure",
    SocketDisconnect = -13 => "remote host disconnected",
    Proto = -14 => "protocol violation",
    PasswordExpired = -15 => "password expired",
    File = -16 => "key file could not be read",
    MethodNone = -17 => "no authentication method available",
    AuthenticationFailed = -18 => "authentication failed",
    PublickeyUnverified = -19 => "public key could not be verified",
    ChannelOutOfOrder = -20 => "channel message out of order",
    ChannelFailure = -21 => "channel failure",
    ChannelRequestDenied = -22 => "channel request denied",
    ChannelUnknown = -23 => "unknown channel",
    ChannelWindowExceeded = -24 => "channel window exceeded",
    ChannelPacketExceeded = -25 => "channel packet exceeded",
    ChannelClosed = -26 => "channel closed",
    ChannelEofSent = -27 => "channel EOF already sent",
    ScpProtocol = -28 => "SCP protocol error",
    Zlib = -29 => "zlib error",
    SocketTimeout = -30 => "socket timed out",
    SftpProtocol = -31 => "SFTP protocol error",
    RequestDenied = -32 => "request denied",
    MethodNotSupported = -33 => "method not supported",
    Inval = -34 => "invalid argument",
    InvalidPollType = -35 => "invalid poll type",
    PublickeyProtocol = -36 => "public key protocol error",
    Eagain = -37 => "operation would block",
    BufferTooSmall = -38 => "buffer too small",
    BadUse = -39 => "bad use of API",
    Compress = -40 => "compression error",
    OutOfBoundary = -41 => "out of boundary",
    AgentProtocol = -42 => "agent protocol error",
    SocketRecv = -43 => "socket receive failure",
    Encrypt = -44 => "encryption failure",
    BadSocket = -45 => "bad socket",
    KnownHosts = -46 => "known hosts error",
    ChannelWindowFull = -47 => "channel window full",
    KeyfileAuthFailed = -48 => "key file authentication failed",
    Randgen = -49 => "random generator failure",
    MissingUserauthBanner = -50 => "missing user authentication banner",
    AlgoUnsupported = -51 => "algorithm not supported",
}

impl ErrorCode {
    /// Coarse classification used by consumers to pick a user message.
    #[must_use]
    pub fn kind(self) -> TransportErrorKind {
        use ErrorCode::*;

        match self {
            Timeout | SocketTimeout => TransportErrorKind::Timeout,
            PasswordExpired | File | MethodNone | AuthenticationFailed | PublickeyUnverified
            | PublickeyProtocol | KeyfileAuthFailed | AgentProtocol => {
                TransportErrorKind::Authentication
            }
            SocketNone | SocketSend | SocketRecv | SocketDisconnect | BadSocket | BannerRecv
            | BannerSend => TransportErrorKind::Disconnected,
            InvalidMac | KexFailure | KeyExchangeFailure | HostkeyInit | HostkeySign | Decrypt
            | Encrypt | Proto | ScpProtocol | SftpProtocol | Zlib | Compress
            | MethodNotSupported | AlgoUnsupported | MissingUserauthBanner | KnownHosts
            | RequestDenied => TransportErrorKind::Protocol,
            ChannelOutOfOrder | ChannelFailure | ChannelRequestDenied | ChannelUnknown
            | ChannelWindowExceeded | ChannelPacketExceeded | ChannelClosed | ChannelEofSent
            | ChannelWindowFull => TransportErrorKind::Channel,
            Alloc | Inval | InvalidPollType | Eagain | BufferTooSmall | BadUse
            | OutOfBoundary | Randgen | Unknown(_) => TransportErrorKind::Other,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (native code {})", self.description(), self.raw())
    }
}

/// Connection-level failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// The native session timeout elapsed
    Timeout,
    /// Credentials were rejected or could not be used
    Authentication,
    /// The socket or the remote peer went away
    Disconnected,
    /// The remote peer violated or refused the protocol
    Protocol,
    /// A channel-level request failed
    Channel,
    /// Anything else, including local misuse reported by the engine
    Other,
}

macro_rules! sftp_statuses {
    ($($name:ident = $value:literal => $desc:literal,)*) => {
        /// SFTP `SSH_FX_*` status codes.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[non_exhaustive]
        pub enum SftpStatus {
            $(
                #[doc = $desc]
                $name,
            )*
            /// A status this crate does not know about
            Unknown(u32),
        }

        impl SftpStatus {
            /// Classify a raw SFTP status.
            #[must_use]
            pub fn from_raw(status: u32) -> Self {
                match status {
                    $($value => Self::$name,)*
                    other => Self::Unknown(other),
                }
            }

            /// The raw status value.
            #[must_use]
            pub fn raw(self) -> u32 {
                match self {
                    $(Self::$name => $value,)*
                    Self::Unknown(status) => status,
                }
            }

            /// Short human readable description.
            #[must_use]
            pub fn description(self) -> &'static str {
                match self {
                    $(Self::$name => $desc,)*
                    Self::Unknown(_) => "unknown SFTP status",
                }
            }
        }
    };
}

sftp_statuses! {
    Ok = 0 => "success",
    Eof = 1 => "end of file",
    NoSuchFile = 2 => "no such file",
    PermissionDenied = 3 => "permission denied",
    Failure = 4 => "failure",
    BadMessage = 5 => "bad message",
    NoConnection = 6 => "no connection",
    ConnectionLost = 7 => "connection lost",
    OpUnsupported = 8 => "operation not supported",
    InvalidHandle = 9 => "invalid handle",
    NoSuchPath = 10 => "no such path",
    FileAlreadyExists = 11 => "file already exists",
    WriteProtect = 12 => "write protected",
    NoMedia = 13 => "no media",
    NoSpaceOnFilesystem = 14 => "no space left on filesystem",
    QuotaExceeded = 15 => "quota exceeded",
    UnknownPrincipal = 16 => "unknown principal",
    LockConflict = 17 => "lock conflict",
    DirNotEmpty = 18 => "directory not empty",
    NotADirectory = 19 => "not a directory",
    InvalidFilename = 20 => "invalid filename",
    LinkLoop = 21 => "too many symbolic links",
}

impl fmt::Display for SftpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (SFTP status {})", self.description(), self.raw())
    }
}

/// Connection-level failure. Never carries a path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}: {code}")]
pub struct NativeError {
    code: ErrorCode,
    message: String,
}

impl NativeError {
    /// Build from a raw code and the engine's last error message.
    ///
    /// An empty message falls back to the code's description.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        let code = ErrorCode::from_raw(code);
        let mut message = message.into();
        if message.is_empty() {
            message = code.description().to_string();
        }
        Self { code, message }
    }

    /// Classified native code
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Coarse failure class
    #[must_use]
    pub fn kind(&self) -> TransportErrorKind {
        self.code.kind()
    }

    /// Message reported by the engine
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// SFTP subsystem failure for a specific remote path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{path}: {status}")]
pub struct SftpError {
    status: SftpStatus,
    path: String,
}

impl SftpError {
    /// Build from a raw SFTP status and the path the request was about.
    pub fn new(status: u32, path: impl Into<String>) -> Self {
        Self {
            status: SftpStatus::from_raw(status),
            path: path.into(),
        }
    }

    /// Classified SFTP status
    #[must_use]
    pub fn status(&self) -> SftpStatus {
        self.status
    }

    /// Remote path the failed request referred to
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Which tier of the taxonomy an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connection-level failure without path context
    Transport,
    /// SFTP status failure carrying the remote path
    Subsystem,
    /// Input rejected before reaching the engine
    InvalidArgument,
}

/// Errors surfaced by this crate.
///
/// Contract violations (cross-thread use, use after close, a write length
/// larger than the buffer) are not represented here; they panic.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection-level native failure
    #[error(transparent)]
    Native(#[from] NativeError),

    /// SFTP status failure
    #[error(transparent)]
    Sftp(#[from] SftpError),

    /// Socket setup failed before the engine was involved
    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    /// A string argument cannot be represented natively
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Taxonomy tier of this error
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Native(_) | Error::Io(_) => ErrorCategory::Transport,
            Error::Sftp(_) => ErrorCategory::Subsystem,
            Error::InvalidArgument(_) => ErrorCategory::InvalidArgument,
        }
    }

    /// Numeric code: the native code for transport errors, the SFTP status
    /// for subsystem errors, the OS error for socket errors.
    #[must_use]
    pub fn code(&self) -> Option<i64> {
        match self {
            Error::Native(e) => Some(i64::from(e.code().raw())),
            Error::Sftp(e) => Some(i64::from(e.status().raw())),
            Error::Io(e) => e.raw_os_error().map(i64::from),
            Error::InvalidArgument(_) => None,
        }
    }

    /// Remote path, present only for subsystem errors.
    #[must_use]
    pub fn path(&self) -> Option<&str> {
        match self {
            Error::Sftp(e) => Some(e.path()),
            _ => None,
        }
    }

    pub(crate) fn interior_nul(what: &str) -> Self {
        Error::InvalidArgument(format!("{what} contains an interior NUL byte"))
    }
}

/// Convert a string argument for the engine.
pub(crate) fn c_string(value: &str, what: &str) -> Result<CString> {
    CString::new(value).map_err(|_| Error::interior_nul(what))
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        let kind = match &err {
            Error::Io(e) => e.kind(),
            Error::Native(e) => match e.kind() {
                TransportErrorKind::Timeout => io::ErrorKind::TimedOut,
                TransportErrorKind::Disconnected => io::ErrorKind::ConnectionAborted,
                TransportErrorKind::Authentication => io::ErrorKind::PermissionDenied,
                _ => io::ErrorKind::Other,
            },
            Error::Sftp(e) => match e.status() {
                SftpStatus::NoSuchFile | SftpStatus::NoSuchPath => io::ErrorKind::NotFound,
                SftpStatus::PermissionDenied | SftpStatus::WriteProtect => {
                    io::ErrorKind::PermissionDenied
                }
                SftpStatus::FileAlreadyExists => io::ErrorKind::AlreadyExists,
                SftpStatus::Eof => io::ErrorKind::UnexpectedEof,
                SftpStatus::ConnectionLost | SftpStatus::NoConnection => {
                    io::ErrorKind::ConnectionAborted
                }
                _ => io::ErrorKind::Other,
            },
            Error::InvalidArgument(_) => io::ErrorKind::InvalidInput,
        };
        match err {
            Error::Io(e) => e,
            other => io::Error::new(kind, other),
        }
    }
}
