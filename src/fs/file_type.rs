use libc::{
    DT_BLK, DT_CHR, DT_DIR, DT_FIFO, DT_LNK, DT_REG, DT_SOCK, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO,
    S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK, mode_t,
};

/// Represents the type of a file in the filesystem
///
/// `Door` and `Port` only occur on Solaris-family systems and `Whiteout`
/// on BSD-family union mounts; they exist so consumers can match on the
/// full tag space without platform cfgs of their own. `Error` marks a
/// synthetic record for an entry that failed to materialise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FileType {
    BlockDevice,
    CharDevice,
    Directory,
    Door,
    Fifo,
    Symlink,
    Port,
    RegularFile,
    Socket,
    Whiteout,
    Unknown,
    Error,
}

impl FileType {
    /// Converts a raw dirent `d_type` hint to a `FileType`
    /// `DT_UNKNOWN` (and anything exotic) maps to `Unknown`; callers must stat.
    #[must_use]
    #[inline]
    pub const fn from_dtype(d_type: u8) -> Self {
        match d_type {
            DT_DIR => Self::Directory,
            DT_REG => Self::RegularFile,
            DT_BLK => Self::BlockDevice,
            DT_CHR => Self::CharDevice,
            DT_FIFO => Self::Fifo,
            DT_LNK => Self::Symlink,
            DT_SOCK => Self::Socket,
            #[cfg(any(target_os = "hermit", target_os = "espidf"))]
            libc::DT_WHT => Self::Whiteout,
            _ => Self::Unknown,
        }
    }

    /// Converts `st_mode` type bits to a `FileType`
    #[must_use]
    #[inline]
    pub const fn from_mode(mode: mode_t) -> Self {
        match mode & S_IFMT {
            S_IFREG => Self::RegularFile,
            S_IFDIR => Self::Directory,
            S_IFBLK => Self::BlockDevice,
            S_IFCHR => Self::CharDevice,
            S_IFIFO => Self::Fifo,
            S_IFLNK => Self::Symlink,
            S_IFSOCK => Self::Socket,
            #[cfg(any(target_os = "solaris", target_os = "illumos"))]
            libc::S_IFDOOR => Self::Door,
            #[cfg(any(target_os = "solaris", target_os = "illumos"))]
            libc::S_IFPORT => Self::Port,
            _ => Self::Unknown,
        }
    }

    /// Whether this tag can be descended into.
    #[must_use]
    #[inline]
    pub const fn is_dir(self) -> bool {
        matches!(self, Self::Directory)
    }
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::BlockDevice => "block device",
            Self::CharDevice => "character device",
            Self::Directory => "directory",
            Self::Door => "door",
            Self::Fifo => "FIFO",
            Self::Symlink => "symbolic link",
            Self::Port => "event port",
            Self::RegularFile => "regular file",
            Self::Socket => "socket",
            Self::Whiteout => "whiteout",
            Self::Unknown => "unknown",
            Self::Error => "error",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::FileType;

    #[test]
    fn dtype_ladder() {
        assert_eq!(FileType::from_dtype(libc::DT_DIR), FileType::Directory);
        assert_eq!(FileType::from_dtype(libc::DT_LNK), FileType::Symlink);
        assert_eq!(FileType::from_dtype(libc::DT_UNKNOWN), FileType::Unknown);
        assert_eq!(FileType::from_dtype(250), FileType::Unknown);
    }

    #[test]
    fn mode_ladder() {
        assert_eq!(
            FileType::from_mode(libc::S_IFDIR | 0o755),
            FileType::Directory
        );
        assert_eq!(
            FileType::from_mode(libc::S_IFREG | 0o644),
            FileType::RegularFile
        );
        assert_eq!(FileType::from_mode(libc::S_IFSOCK), FileType::Socket);
    }
}
