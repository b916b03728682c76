//! Thread-affinity and liveness guards for native handles.
//!
//! libssh2 objects corrupt their internal state when touched from more than
//! one thread. Every handle records the thread that created it and checks it
//! on entry to each native call path. A mismatch is a bug in the caller, so
//! the check panics instead of returning an error.

use std::fmt;
use std::thread::{self, ThreadId};

/// The kind of native object a guard protects. Used in panic messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    /// SSH session
    Session,
    /// Channel multiplexed over a session
    Channel,
    /// SFTP subsystem bound to a channel
    FileTransfer,
    /// Open remote file
    File,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HandleKind::Session => "session",
            HandleKind::Channel => "channel",
            HandleKind::FileTransfer => "file transfer channel",
            HandleKind::File => "file",
        })
    }
}

/// Records the owning thread of a handle.
#[derive(Debug, Clone)]
pub struct ThreadAffinity {
    kind: HandleKind,
    owner: ThreadId,
    owner_name: Option<String>,
}

impl ThreadAffinity {
    /// Bind a new guard to the calling thread.
    #[must_use]
    pub fn current(kind: HandleKind) -> Self {
        let current = thread::current();
        Self {
            kind,
            owner: current.id(),
            owner_name: current.name().map(str::to_owned),
        }
    }

    /// Kind of handle this guard protects
    #[must_use]
    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    /// Thread that owns the handle
    #[must_use]
    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    /// Whether the calling thread may use the handle.
    #[must_use]
    pub fn is_owned_by_current_thread(&self) -> bool {
        thread::current().id() == self.owner
    }

    /// Panic unless the calling thread owns the handle.
    ///
    /// # Panics
    ///
    /// Panics when called from any thread other than the one that created
    /// the guard.
    #[track_caller]
    pub fn check(&self) {
        let current = thread::current();
        if current.id() != self.owner {
            panic!(
                "thread affinity violation: {} handle owned by thread {} ({:?}) used from thread {} ({:?})",
                self.kind,
                self.owner_name.as_deref().unwrap_or("<unnamed>"),
                self.owner,
                current.name().unwrap_or("<unnamed>"),
                current.id(),
            );
        }
    }
}

/// Panic if a handle (or one of its ancestors) has already been closed.
///
/// # Panics
///
/// Panics when `live` is false.
#[track_caller]
pub(crate) fn check_live(kind: HandleKind, live: bool) {
    if !live {
        used_after_close(kind);
    }
}

#[track_caller]
pub(crate) fn used_after_close(kind: HandleKind) -> ! {
    panic!("{kind} handle used after it or one of its parents was closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_thread_passes() {
        let guard = ThreadAffinity::current(HandleKind::File);
        assert!(guard.is_owned_by_current_thread());
        guard.check();
        guard.check();
    }

    #[test]
    fn test_other_thread_is_not_owner() {
        let guard = ThreadAffinity::current(HandleKind::Channel);
        let owned = thread::spawn(move || guard.is_owned_by_current_thread())
            .join()
            .unwrap();
        assert!(!owned);
    }

    #[test]
    fn test_other_thread_check_panics() {
        let guard = ThreadAffinity::current(HandleKind::Session);
        guard.check();

        let result = thread::spawn(move || guard.check()).join();
        let payload = result.expect_err("cross-thread check must panic");
        let message = payload
            .downcast_ref::<String>()
            .cloned()
            .unwrap_or_default();
        assert!(message.contains("thread affinity violation"));
        assert!(message.contains("session"));
    }

    #[test]
    fn test_owner_name_recorded() {
        let guard = thread::Builder::new()
            .name("sftp-worker".into())
            .spawn(|| ThreadAffinity::current(HandleKind::File))
            .unwrap()
            .join()
            .unwrap();

        let result = thread::spawn(move || guard.check()).join();
        let message = result
            .unwrap_err()
            .downcast_ref::<String>()
            .cloned()
            .unwrap_or_default();
        assert!(message.contains("sftp-worker"));
    }

    #[test]
    #[should_panic(expected = "used after it or one of its parents was closed")]
    fn test_check_live_panics_when_closed() {
        check_live(HandleKind::File, false);
    }

    #[test]
    fn test_check_live_passes_when_open() {
        check_live(HandleKind::File, true);
    }

    #[test]
    fn test_handle_kind_display() {
        assert_eq!(HandleKind::FileTransfer.to_string(), "file transfer channel");
        assert_eq!(HandleKind::File.to_string(), "file");
    }
}
