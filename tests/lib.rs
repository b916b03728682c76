//! Shared fixtures for the Tether integration tests.
//!
//! Every test runs against [`MemoryEngine`]; no live server is involved.

use std::any::Any;
use tether_native::{
    FilePermissions, FileChannel, FileTransferChannel, MemoryEngine, MemoryTransport, OpenFlags,
    Session, SessionConfig,
};

/// User accepted by [`engine`] for password authentication.
pub const USER: &str = "deploy";
/// Password accepted for [`USER`].
pub const PASSWORD: &str = "correct horse";
/// Private key file accepted for [`USER`].
pub const KEY_FILE: &str = "/home/deploy/.ssh/id_ed25519";

/// A small remote filesystem with one user.
pub fn engine() -> MemoryEngine {
    MemoryEngine::new()
        .with_password(USER, PASSWORD)
        .with_key_file(USER, KEY_FILE)
        .with_file("/etc/hostname", "db1")
        .with_directory("/var/tmp")
}

/// Handshake and password-authenticate against `engine`.
pub fn connect(engine: &MemoryEngine) -> Session<MemoryEngine> {
    let session = Session::handshake(engine.clone(), MemoryTransport, &SessionConfig::default())
        .expect("handshake");
    session
        .authenticate_password(USER, PASSWORD)
        .expect("authenticate");
    session
}

/// Open a channel and start the SFTP subsystem on it.
pub fn open_sftp(session: &Session<MemoryEngine>) -> FileTransferChannel<MemoryEngine> {
    session
        .open_channel()
        .expect("open channel")
        .open_file_transfer()
        .expect("start sftp")
}

/// Open `path` for reading.
pub fn open_read(sftp: &FileTransferChannel<MemoryEngine>, path: &str) -> FileChannel<MemoryEngine> {
    sftp.open_file(path, OpenFlags::READ, FilePermissions::default())
        .expect("open for read")
}

/// Create or truncate `path` for writing.
pub fn open_write(
    sftp: &FileTransferChannel<MemoryEngine>,
    path: &str,
) -> FileChannel<MemoryEngine> {
    sftp.open_file(
        path,
        OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
        FilePermissions::DEFAULT_FILE,
    )
    .expect("open for write")
}

/// Text of a caught panic payload.
pub fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else {
        String::from("<non-string panic>")
    }
}
