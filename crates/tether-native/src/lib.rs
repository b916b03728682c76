//! # Tether Native
//!
//! Owning, thread-affine handles over the libssh2 secure transport engine.
//!
//! This crate provides:
//! - Session, channel, SFTP subsystem and file handles with exactly-once
//!   native release
//! - Thread-affinity enforcement on every native call path
//! - Translation of native return codes into a two-tier error model
//!   (connection-level vs SFTP status with the remote path)
//! - An [`Engine`] seam, implemented over libssh2 and, with the `test-util`
//!   feature, in memory
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Session                                  │
//! │   (native connection, root of error translation)                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Channel                                  │
//! │   (multiplexed stream: exec, shell, or SFTP transport)          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                   FileTransferChannel                            │
//! │   (SFTP subsystem, resolves SFTP statuses to paths)             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                       FileChannel                                │
//! │   (one open remote file, blocking read/write)                   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each level keeps its parent alive. Closing a parent explicitly makes its
//! descendants unusable; the native objects are released child first when the
//! last handle goes away.
//!
//! Contract violations (a call from a thread other than the owner, use after
//! close, a write length larger than its buffer) panic. Everything the server
//! or the network can cause is returned as [`Error`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod affinity;
pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod file;
pub mod libssh2;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod session;
pub mod sftp;
pub mod types;

pub use affinity::{HandleKind, ThreadAffinity};
pub use channel::Channel;
pub use config::SessionConfig;
pub use engine::{Engine, OpenKind, StreamId};
pub use error::{
    Error, ErrorCategory, ErrorCode, NativeError, Result, SFTP_PROTOCOL_ERROR, SftpError,
    SftpStatus, TransportErrorKind,
};
pub use file::FileChannel;
pub use libssh2::Libssh2Engine;
#[cfg(any(test, feature = "test-util"))]
pub use memory::{MemoryEngine, MemoryStats, MemoryTransport, Operation, Released};
pub use session::Session;
pub use sftp::FileTransferChannel;
pub use types::{DirectoryEntry, FileAttributes, FilePermissions, OpenFlags};
