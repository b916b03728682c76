//! Value types shared by the SFTP handles and the engines.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// SFTP open flags (`SSH_FXF_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OpenFlags(u32);

impl OpenFlags {
    /// Open for reading
    pub const READ: Self = Self(0x01);
    /// Open for writing
    pub const WRITE: Self = Self(0x02);
    /// Writes append to the end of the file
    pub const APPEND: Self = Self(0x04);
    /// Create the file if it does not exist
    pub const CREATE: Self = Self(0x08);
    /// Truncate an existing file to zero length
    pub const TRUNCATE: Self = Self(0x10);
    /// Fail if the file already exists (with `CREATE`)
    pub const EXCLUSIVE: Self = Self(0x20);

    /// Raw flag bits as sent on the wire
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every bit of `other` is set in `self`
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for OpenFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for OpenFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// POSIX permission bits used when creating remote files and directories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilePermissions(u32);

impl FilePermissions {
    /// `rw-r--r--`
    pub const DEFAULT_FILE: Self = Self(0o644);
    /// `rwxr-xr-x`
    pub const DEFAULT_DIRECTORY: Self = Self(0o755);

    /// Wrap raw mode bits
    #[must_use]
    pub const fn from_mode(mode: u32) -> Self {
        Self(mode)
    }

    /// Raw mode bits
    #[must_use]
    pub const fn mode(self) -> u32 {
        self.0
    }
}

impl Default for FilePermissions {
    fn default() -> Self {
        Self::DEFAULT_FILE
    }
}

impl fmt::Display for FilePermissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:o}", self.0)
    }
}

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFREG: u32 = 0o100000;
const S_IFLNK: u32 = 0o120000;

/// Attributes reported by the server. Every field is optional on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileAttributes {
    /// Size in bytes
    pub size: Option<u64>,
    /// Owner user id
    pub uid: Option<u32>,
    /// Owner group id
    pub gid: Option<u32>,
    /// Type and permission bits
    pub permissions: Option<u32>,
    /// Last access time (seconds since the epoch)
    pub atime: Option<u64>,
    /// Last modification time (seconds since the epoch)
    pub mtime: Option<u64>,
}

impl FileAttributes {
    fn file_type(&self) -> Option<u32> {
        self.permissions.map(|mode| mode & S_IFMT)
    }

    /// Whether the entry is a directory
    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.file_type() == Some(S_IFDIR)
    }

    /// Whether the entry is a regular file
    #[must_use]
    pub fn is_regular_file(&self) -> bool {
        self.file_type() == Some(S_IFREG)
    }

    /// Whether the entry is a symbolic link
    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.file_type() == Some(S_IFLNK)
    }
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// File name without the directory part
    pub name: String,
    /// Attributes returned alongside the name
    pub attributes: FileAttributes,
}
