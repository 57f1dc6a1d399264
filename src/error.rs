use std::ffi::OsString;
use thiserror::Error;

/// Generic result type for engine setup and teardown paths.
pub type Result<T> = core::result::Result<T, WalkError>;

/**
Classification of a recoverable per-entry failure.

These never abort the walk; they ride inside the visit record so the
consumer can decide what to do with the entry.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryErrorKind {
    /// `openat` on a directory was refused (typically `EACCES`).
    OpenDenied,
    /// `stat`/`statx` on the entry failed.
    StatDenied,
    /// A symlink whose target does not resolve, outside broken-ok mode.
    BrokenLink,
    /// The entry stopped being a directory between readdir and descent.
    NotADirectory,
    /// A path component exceeded the component length limit.
    NameTooLong,
    /// `getdents`/`readdir` failed mid-stream; earlier siblings were still delivered.
    ReaddirFailed,
}

/// A per-entry failure: the taxonomy kind plus the raw OS error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryError {
    pub kind: EntryErrorKind,
    pub errno: i32,
}

impl EntryError {
    #[must_use]
    pub const fn new(kind: EntryErrorKind, errno: i32) -> Self {
        Self { kind, errno }
    }

    /// The failure as a standard IO error, for consumers that want one.
    #[must_use]
    pub fn as_io_error(&self) -> std::io::Error {
        std::io::Error::from_raw_os_error(self.errno)
    }
}

impl std::fmt::Display for EntryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let what = match self.kind {
            EntryErrorKind::OpenDenied => "cannot open directory",
            EntryErrorKind::StatDenied => "cannot stat",
            EntryErrorKind::BrokenLink => "broken symbolic link",
            EntryErrorKind::NotADirectory => "not a directory",
            EntryErrorKind::NameTooLong => "name too long",
            EntryErrorKind::ReaddirFailed => "cannot read directory",
        };
        write!(f, "{what}: {}", self.as_io_error())
    }
}

/// Failures constructing the I/O queue. These are always fatal to the walk.
#[derive(Debug, Error)]
pub enum IoqError {
    #[error("queue depth {0} is not a power of two")]
    Depth(usize),
    #[error("worker pool size must be at least 1")]
    Threads,
    #[error("failed to spawn I/O worker: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Rejected walk configuration, reported before any I/O happens.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("at least one root path is required")]
    NoRoots,
    #[error("min_depth {min} exceeds max_depth {max}")]
    DepthWindow { min: u32, max: u32 },
    #[error("root path contains an interior NUL byte: {0:?}")]
    NulInPath(OsString),
    #[error(transparent)]
    Ioq(#[from] IoqError),
}

/// Fatal walk outcomes. Per-entry failures never surface here.
#[derive(Debug, Error)]
pub enum WalkError {
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Ioq(#[from] IoqError),
    /// The callback returned `WalkAction::Fail`; the reason is the caller's.
    #[error("walk aborted by consumer: {0}")]
    Callback(#[source] std::io::Error),
}

/// Fetch the thread-local errno immediately after a failed libc call.
#[must_use]
pub(crate) fn last_errno() -> i32 {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO)
}
