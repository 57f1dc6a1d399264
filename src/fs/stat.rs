use crate::fs::FileType;
use bitflags::bitflags;
use core::ffi::{CStr, c_int};
use std::io;

bitflags! {
    /// Which fields of a [`Stat`] snapshot are actually filled in.
    ///
    /// The engine never consumes an absent field silently; accessors return
    /// `None` for anything outside the mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatField: u32 {
        const DEV    = 1 << 0;
        const INO    = 1 << 1;
        const TYPE   = 1 << 2;
        const MODE   = 1 << 3;
        const NLINK  = 1 << 4;
        const UID    = 1 << 5;
        const GID    = 1 << 6;
        const SIZE   = 1 << 7;
        const BLOCKS = 1 << 8;
        const RDEV   = 1 << 9;
        const ATIME  = 1 << 10;
        const MTIME  = 1 << 11;
        const CTIME  = 1 << 12;
        const BTIME  = 1 << 13;
    }
}

impl StatField {
    /// Everything the classic `fstatat` path can deliver. Birth time needs `statx`.
    pub const BASIC: Self = Self::from_bits_truncate(Self::all().bits() & !Self::BTIME.bits());
}

bitflags! {
    /// Behaviour switches for [`stat_at`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StatFlags: u32 {
        /// Do not follow a trailing symlink.
        const NO_FOLLOW = 1 << 0;
        /// If a follow-stat fails with `ENOENT`/`ENOTDIR`, retry without
        /// following so broken links surface as link entries, not errors.
        const BROKEN_OK = 1 << 1;
    }
}

/// One point in time from a stat snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: u32,
}

/**
Normalised view of an entry's metadata.

Built by [`stat_at`]/[`stat_fd`] from `statx` where the kernel supports it
and from `fstatat` otherwise. Every accessor checks the field mask; a
snapshot from the classic path simply has no `BTIME` bit.
*/
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    mask: StatField,
    dev: u64,
    ino: u64,
    mode: u32,
    nlink: u64,
    uid: u32,
    gid: u32,
    size: u64,
    blocks: u64,
    rdev: u64,
    atime: Timespec,
    mtime: Timespec,
    ctime: Timespec,
    btime: Timespec,
}

macro_rules! masked_accessor {
    ($name:ident, $field:ident, $ty:ty) => {
        #[must_use]
        #[inline]
        pub const fn $name(&self) -> Option<$ty> {
            if self.mask.contains(StatField::$field) {
                Some(self.$name)
            } else {
                None
            }
        }
    };
}

impl Stat {
    masked_accessor!(dev, DEV, u64);
    masked_accessor!(ino, INO, u64);
    masked_accessor!(nlink, NLINK, u64);
    masked_accessor!(uid, UID, u32);
    masked_accessor!(gid, GID, u32);
    masked_accessor!(size, SIZE, u64);
    masked_accessor!(blocks, BLOCKS, u64);
    masked_accessor!(rdev, RDEV, u64);
    masked_accessor!(atime, ATIME, Timespec);
    masked_accessor!(mtime, MTIME, Timespec);
    masked_accessor!(ctime, CTIME, Timespec);
    masked_accessor!(btime, BTIME, Timespec);

    /// The fields this snapshot actually carries.
    #[must_use]
    #[inline]
    pub const fn mask(&self) -> StatField {
        self.mask
    }

    /// Full `st_mode` including type bits, if the mode was captured.
    #[must_use]
    #[inline]
    pub const fn mode(&self) -> Option<u32> {
        if self.mask.contains(StatField::MODE) {
            Some(self.mode)
        } else {
            None
        }
    }

    /// File type derived from the captured type bits.
    #[must_use]
    #[inline]
    pub fn file_type(&self) -> FileType {
        if self.mask.contains(StatField::TYPE) {
            FileType::from_mode(self.mode as libc::mode_t)
        } else {
            FileType::Unknown
        }
    }

    /// The `(dev, ino)` cycle-detection key, when both halves are present.
    #[must_use]
    #[inline]
    pub const fn identity(&self) -> Option<(u64, u64)> {
        if self.mask.contains(StatField::DEV.union(StatField::INO)) {
            Some((self.dev, self.ino))
        } else {
            None
        }
    }

    #[allow(clippy::cast_sign_loss)] // kernel-reported counts are non-negative
    fn from_libc_stat(st: &libc::stat) -> Self {
        Self {
            mask: StatField::BASIC,
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
            mode: st.st_mode as u32,
            nlink: st.st_nlink as u64,
            uid: st.st_uid,
            gid: st.st_gid,
            size: st.st_size as u64,
            blocks: st.st_blocks as u64,
            rdev: st.st_rdev as u64,
            atime: Timespec {
                sec: st.st_atime as i64,
                nsec: st.st_atime_nsec as u32,
            },
            mtime: Timespec {
                sec: st.st_mtime as i64,
                nsec: st.st_mtime_nsec as u32,
            },
            ctime: Timespec {
                sec: st.st_ctime as i64,
                nsec: st.st_ctime_nsec as u32,
            },
            btime: Timespec::default(),
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod imp {
    use super::{Stat, StatField, Timespec};
    use crate::error::last_errno;
    use core::ffi::{CStr, c_int, c_uint};
    use core::sync::atomic::{AtomicBool, Ordering};
    use std::io;

    /// One-way latch: set the first time the kernel (or a seccomp policy)
    /// rejects `statx` outright, after which every call takes `fstatat`.
    static STATX_UNSUPPORTED: AtomicBool = AtomicBool::new(false);

    const fn statx_mask(fields: StatField) -> c_uint {
        let mut mask = 0;
        if fields.contains(StatField::TYPE) {
            mask |= libc::STATX_TYPE;
        }
        if fields.contains(StatField::MODE) {
            mask |= libc::STATX_MODE;
        }
        if fields.contains(StatField::NLINK) {
            mask |= libc::STATX_NLINK;
        }
        if fields.contains(StatField::UID) {
            mask |= libc::STATX_UID;
        }
        if fields.contains(StatField::GID) {
            mask |= libc::STATX_GID;
        }
        if fields.contains(StatField::INO) {
            mask |= libc::STATX_INO;
        }
        if fields.contains(StatField::SIZE) {
            mask |= libc::STATX_SIZE;
        }
        if fields.contains(StatField::BLOCKS) {
            mask |= libc::STATX_BLOCKS;
        }
        if fields.contains(StatField::ATIME) {
            mask |= libc::STATX_ATIME;
        }
        if fields.contains(StatField::MTIME) {
            mask |= libc::STATX_MTIME;
        }
        if fields.contains(StatField::CTIME) {
            mask |= libc::STATX_CTIME;
        }
        if fields.contains(StatField::BTIME) {
            mask |= libc::STATX_BTIME;
        }
        mask
    }

    const fn timestamp(ts: &libc::statx_timestamp) -> Timespec {
        Timespec {
            sec: ts.tv_sec,
            nsec: ts.tv_nsec,
        }
    }

    #[allow(clippy::similar_names)]
    fn from_statx(stx: &libc::statx) -> Stat {
        let mut mask = StatField::DEV | StatField::RDEV;
        let stx_mask = stx.stx_mask;
        if stx_mask & libc::STATX_TYPE != 0 {
            mask |= StatField::TYPE;
        }
        if stx_mask & libc::STATX_MODE != 0 {
            mask |= StatField::MODE;
        }
        if stx_mask & libc::STATX_NLINK != 0 {
            mask |= StatField::NLINK;
        }
        if stx_mask & libc::STATX_UID != 0 {
            mask |= StatField::UID;
        }
        if stx_mask & libc::STATX_GID != 0 {
            mask |= StatField::GID;
        }
        if stx_mask & libc::STATX_INO != 0 {
            mask |= StatField::INO;
        }
        if stx_mask & libc::STATX_SIZE != 0 {
            mask |= StatField::SIZE;
        }
        if stx_mask & libc::STATX_BLOCKS != 0 {
            mask |= StatField::BLOCKS;
        }
        if stx_mask & libc::STATX_ATIME != 0 {
            mask |= StatField::ATIME;
        }
        if stx_mask & libc::STATX_MTIME != 0 {
            mask |= StatField::MTIME;
        }
        if stx_mask & libc::STATX_CTIME != 0 {
            mask |= StatField::CTIME;
        }
        if stx_mask & libc::STATX_BTIME != 0 {
            mask |= StatField::BTIME;
        }

        Stat {
            mask,
            dev: libc::makedev(stx.stx_dev_major, stx.stx_dev_minor) as u64,
            ino: stx.stx_ino,
            mode: u32::from(stx.stx_mode),
            nlink: u64::from(stx.stx_nlink),
            uid: stx.stx_uid,
            gid: stx.stx_gid,
            size: stx.stx_size,
            blocks: stx.stx_blocks,
            rdev: libc::makedev(stx.stx_rdev_major, stx.stx_rdev_minor) as u64,
            atime: timestamp(&stx.stx_atime),
            mtime: timestamp(&stx.stx_mtime),
            ctime: timestamp(&stx.stx_ctime),
            btime: timestamp(&stx.stx_btime),
        }
    }

    pub(super) fn do_stat(
        dirfd: c_int,
        path: &CStr,
        follow: bool,
        fields: StatField,
        empty_path: bool,
    ) -> io::Result<Stat> {
        let mut at_flags = if follow { 0 } else { libc::AT_SYMLINK_NOFOLLOW };
        if empty_path {
            at_flags |= libc::AT_EMPTY_PATH;
        }

        if !STATX_UNSUPPORTED.load(Ordering::Relaxed) {
            let mut stx = unsafe { core::mem::zeroed::<libc::statx>() };
            // SAFETY: path is NUL-terminated and stx is a valid out-pointer
            let rc = unsafe {
                libc::statx(
                    dirfd,
                    path.as_ptr(),
                    at_flags,
                    statx_mask(fields),
                    &raw mut stx,
                )
            };
            if rc == 0 {
                return Ok(from_statx(&stx));
            }
            match last_errno() {
                // kernel too old, or blanket-denied by seccomp: latch and fall back
                libc::ENOSYS | libc::EPERM | libc::EOPNOTSUPP => {
                    if !STATX_UNSUPPORTED.swap(true, Ordering::Relaxed) {
                        log::warn!("statx unavailable, falling back to fstatat");
                    }
                }
                errno => return Err(io::Error::from_raw_os_error(errno)),
            }
        }

        let mut st = unsafe { core::mem::zeroed::<libc::stat>() };
        // SAFETY: as above, classic variant
        let rc = unsafe { libc::fstatat(dirfd, path.as_ptr(), &raw mut st, at_flags) };
        if rc == 0 {
            Ok(Stat::from_libc_stat(&st))
        } else {
            Err(io::Error::from_raw_os_error(last_errno()))
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
mod imp {
    use super::{Stat, StatField};
    use crate::error::last_errno;
    use core::ffi::{CStr, c_int};
    use std::io;

    pub(super) fn do_stat(
        dirfd: c_int,
        path: &CStr,
        follow: bool,
        _fields: StatField,
        _empty_path: bool,
    ) -> io::Result<Stat> {
        let at_flags = if follow { 0 } else { libc::AT_SYMLINK_NOFOLLOW };
        let mut st = unsafe { core::mem::zeroed::<libc::stat>() };
        // SAFETY: path is NUL-terminated and st is a valid out-pointer
        let rc = unsafe { libc::fstatat(dirfd, path.as_ptr(), &raw mut st, at_flags) };
        if rc == 0 {
            Ok(Stat::from_libc_stat(&st))
        } else {
            Err(io::Error::from_raw_os_error(last_errno()))
        }
    }
}

/**
Uniform stat over a directory-relative path.

Prefers the extended call so callers can declare the fields they want
(device split, birth time); transparently falls back to the classic
variant when that is unavailable, synthesising the narrower field mask.
*/
pub fn stat_at(dirfd: c_int, path: &CStr, flags: StatFlags, fields: StatField) -> io::Result<Stat> {
    let follow = !flags.contains(StatFlags::NO_FOLLOW);
    let first = imp::do_stat(dirfd, path, follow, fields, false);
    match first {
        Err(ref e)
            if follow
                && flags.contains(StatFlags::BROKEN_OK)
                && matches!(
                    e.raw_os_error(),
                    Some(libc::ENOENT | libc::ENOTDIR | libc::ELOOP)
                ) =>
        {
            imp::do_stat(dirfd, path, false, fields, false)
        }
        other => other,
    }
}

/// Stat an already-open descriptor (used to fix the identity of opened
/// directories without re-resolving their path).
pub fn stat_fd(fd: c_int, fields: StatField) -> io::Result<Stat> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        imp::do_stat(fd, c"", true, fields, true)
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        let _ = fields;
        let mut st = unsafe { core::mem::zeroed::<libc::stat>() };
        // SAFETY: fd is owned by the caller and open
        let rc = unsafe { libc::fstat(fd, &raw mut st) };
        if rc == 0 {
            Ok(Stat::from_libc_stat(&st))
        } else {
            Err(io::Error::from_raw_os_error(crate::error::last_errno()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{StatField, StatFlags, stat_at, stat_fd};
    use crate::fs::FileType;
    use std::ffi::CString;
    use std::io::Write as _;
    use std::os::unix::ffi::OsStrExt as _;

    fn cstr(path: &std::path::Path) -> CString {
        CString::new(path.as_os_str().as_bytes()).unwrap()
    }

    #[test]
    fn stat_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"twelve bytes").unwrap();
        drop(f);

        let st = stat_at(
            libc::AT_FDCWD,
            &cstr(&path),
            StatFlags::empty(),
            StatField::BASIC,
        )
        .unwrap();
        assert_eq!(st.file_type(), FileType::RegularFile);
        assert_eq!(st.size(), Some(12));
        assert!(st.identity().is_some());
        assert!(st.nlink().unwrap() >= 1);
    }

    #[test]
    fn missing_btime_is_unset_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let st = stat_at(
            libc::AT_FDCWD,
            &cstr(dir.path()),
            StatFlags::empty(),
            StatField::all(),
        )
        .unwrap();
        // either the filesystem reports a birth time or the bit is simply unset
        assert_eq!(st.btime().is_some(), st.mask().contains(StatField::BTIME));
    }

    #[test]
    fn nofollow_sees_the_link_itself() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("dangling");
        std::os::unix::fs::symlink("nowhere", &link).unwrap();

        let strict = stat_at(
            libc::AT_FDCWD,
            &cstr(&link),
            StatFlags::empty(),
            StatField::BASIC,
        );
        assert!(strict.is_err());

        let lenient = stat_at(
            libc::AT_FDCWD,
            &cstr(&link),
            StatFlags::BROKEN_OK,
            StatField::BASIC,
        )
        .unwrap();
        assert_eq!(lenient.file_type(), FileType::Symlink);
    }

    #[test]
    fn fd_and_path_agree_on_identity() {
        let dir = tempfile::tempdir().unwrap();
        let by_path = stat_at(
            libc::AT_FDCWD,
            &cstr(dir.path()),
            StatFlags::empty(),
            StatField::BASIC,
        )
        .unwrap();

        let raw = unsafe {
            libc::open(
                cstr(dir.path()).as_ptr(),
                libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
            )
        };
        assert!(raw >= 0);
        let by_fd = stat_fd(raw, StatField::BASIC).unwrap();
        unsafe { libc::close(raw) };

        assert_eq!(by_path.identity(), by_fd.identity());
    }

    #[test]
    fn stat_flags_compose() {
        let flags = StatFlags::NO_FOLLOW | StatFlags::BROKEN_OK;
        assert!(flags.contains(StatFlags::NO_FOLLOW));
        assert!(!StatField::BASIC.contains(StatField::BTIME));
    }
}
