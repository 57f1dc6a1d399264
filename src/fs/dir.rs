use crate::error::last_errno;
use crate::fs::{FileDes, FileType};
use core::ffi::{CStr, c_int};
use std::ffi::CString;
use std::io;

/// One `(name, type-hint)` pair produced by a directory stream.
///
/// The hint comes straight from the kernel's dirent record; `Unknown`
/// means the filesystem declined to say and callers must stat.
#[derive(Debug, Clone)]
pub struct DirEntryName {
    pub name: CString,
    pub hint: FileType,
}

/// Open flags shared by every directory the engine touches.
const OPEN_FLAGS: c_int = libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC | libc::O_NONBLOCK;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use imp::DirStream;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod imp {
    use super::{DirEntryName, open_raw};
    use crate::error::last_errno;
    use crate::fs::{FileDes, FileType};
    use core::ffi::{CStr, c_int};
    use std::io;

    /// Sized to amortise `getdents64` round trips; matches what coreutils-
    /// style tools request per call.
    const DIR_BUF_SIZE: usize = 32 * 1024;

    #[repr(C, align(8))]
    struct DentBuf([u8; DIR_BUF_SIZE]);

    /**
    Ordered stream of directory entries backed by `getdents64`.

    Each [`read_batch`](DirStream::read_batch) performs one system call and
    decodes the whole kernel batch, which is what lets the I/O queue ship a
    chunk of children per completion instead of one name at a time.
    `.` and `..` never appear in the output.
    */
    pub struct DirStream {
        fd: FileDes,
        buf: Box<DentBuf>,
    }

    impl std::fmt::Debug for DirStream {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("DirStream").field("fd", &self.fd).finish()
        }
    }

    impl DirStream {
        /// Open a directory relative to `dirfd` and wrap it in a stream.
        pub fn open_at(dirfd: c_int, path: &CStr, follow: bool) -> io::Result<Self> {
            let fd = open_raw(dirfd, path, follow)?;
            Ok(Self {
                fd,
                buf: Box::new(DentBuf([0; DIR_BUF_SIZE])),
            })
        }

        /// The directory's descriptor, usable as the `at` base for child syscalls.
        #[must_use]
        #[inline]
        pub const fn as_raw_fd(&self) -> c_int {
            self.fd.as_raw()
        }

        /**
        Decode the next kernel batch into `out`.

        Returns `Ok(true)` at end of stream. A mid-stream failure reports
        the error after the previously decoded entries were already handed
        out, so partial results stay observable.
        */
        #[allow(clippy::cast_sign_loss)] // n is checked non-negative first
        pub fn read_batch(&mut self, out: &mut Vec<DirEntryName>) -> io::Result<bool> {
            // SAFETY: fd is an open directory and the buffer is writable for its full size
            let n = unsafe {
                libc::syscall(
                    libc::SYS_getdents64,
                    self.fd.as_raw(),
                    self.buf.0.as_mut_ptr(),
                    DIR_BUF_SIZE,
                )
            };
            if n < 0 {
                return Err(io::Error::from_raw_os_error(last_errno()));
            }
            if n == 0 {
                return Ok(true);
            }

            let end = n as usize;
            let base = self.buf.0.as_ptr();
            let mut offset = 0;
            while offset < end {
                // SAFETY: the kernel wrote a well-formed dirent64 at this offset
                let dent = unsafe { &*base.add(offset).cast::<libc::dirent64>() };
                offset += dent.d_reclen as usize;

                // SAFETY: d_name is NUL-terminated within the record
                let name = unsafe { CStr::from_ptr(dent.d_name.as_ptr()) };
                let bytes = name.to_bytes();
                if bytes == b"." || bytes == b".." {
                    continue;
                }
                out.push(DirEntryName {
                    name: name.to_owned(),
                    hint: FileType::from_dtype(dent.d_type),
                });
            }
            Ok(false)
        }

        /// Give up the stream but keep the descriptor open (for the fd cache).
        #[must_use]
        pub fn into_fd(self) -> FileDes {
            self.fd
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub use imp::DirStream;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
mod imp {
    use super::{DirEntryName, open_raw};
    use crate::error::last_errno;
    use crate::fs::{FileDes, FileType};
    use core::ffi::{CStr, c_int};
    use core::ptr::NonNull;
    use std::io;

    /// How many entries one batch delivers on the POSIX fallback path.
    const BATCH_MAX: usize = 512;

    /// POSIX-compliant directory stream using libc's `readdir`.
    pub struct DirStream {
        dir: NonNull<libc::DIR>,
        fd: c_int,
    }

    // The stream moves between the orchestrator and IOQ workers but is only
    // ever driven by one thread at a time.
    unsafe impl Send for DirStream {}

    impl std::fmt::Debug for DirStream {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("DirStream").field("fd", &self.fd).finish()
        }
    }

    impl DirStream {
        pub fn open_at(dirfd: c_int, path: &CStr, follow: bool) -> io::Result<Self> {
            let fd = open_raw(dirfd, path, follow)?;
            // SAFETY: fd is a freshly opened directory descriptor
            let dir = unsafe { libc::fdopendir(fd.as_raw()) };
            match NonNull::new(dir) {
                Some(dir) => Ok(Self {
                    dir,
                    fd: fd.into_raw(), // closedir owns it from here
                }),
                None => Err(io::Error::from_raw_os_error(last_errno())),
            }
        }

        #[must_use]
        #[inline]
        pub const fn as_raw_fd(&self) -> c_int {
            self.fd
        }

        fn clear_errno() {
            // SAFETY: libc errno locations are valid thread-local pointers
            #[cfg(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd"
            ))]
            unsafe {
                *libc::__error() = 0;
            }
            #[cfg(not(any(
                target_os = "macos",
                target_os = "ios",
                target_os = "freebsd"
            )))]
            unsafe {
                *libc::__errno_location() = 0;
            }
        }

        pub fn read_batch(&mut self, out: &mut Vec<DirEntryName>) -> io::Result<bool> {
            for _ in 0..BATCH_MAX {
                // errno is the only way to tell EOF from failure here
                Self::clear_errno();
                let dent = unsafe { libc::readdir(self.dir.as_ptr()) };
                if dent.is_null() {
                    let errno = last_errno();
                    return match errno {
                        0 => Ok(true),
                        _ => Err(io::Error::from_raw_os_error(errno)),
                    };
                }
                // SAFETY: readdir returned a valid record
                let dent = unsafe { &*dent };
                let name = unsafe { CStr::from_ptr(dent.d_name.as_ptr()) };
                let bytes = name.to_bytes();
                if bytes == b"." || bytes == b".." {
                    continue;
                }
                out.push(DirEntryName {
                    name: name.to_owned(),
                    hint: FileType::from_dtype(dent.d_type),
                });
            }
            Ok(false)
        }

        /// Duplicate the descriptor for the cache; the stream keeps its own.
        #[must_use]
        pub fn into_fd(self) -> FileDes {
            // SAFETY: fd is open; F_DUPFD_CLOEXEC yields an independent descriptor
            let dup = unsafe { libc::fcntl(self.fd, libc::F_DUPFD_CLOEXEC, 0) };
            debug_assert!(dup >= 0, "duplicating an open directory fd");
            let kept = FileDes::from_raw(dup);
            drop(self);
            kept
        }
    }

    impl Drop for DirStream {
        fn drop(&mut self) {
            // closedir also closes the underlying fd
            // SAFETY: dir is live and this is the only close site
            unsafe { libc::closedir(self.dir.as_ptr()) };
        }
    }
}

/// `openat` with the engine's directory discipline.
fn open_raw(dirfd: c_int, path: &CStr, follow: bool) -> io::Result<FileDes> {
    let mut flags = OPEN_FLAGS;
    if !follow {
        flags |= libc::O_NOFOLLOW;
    }
    // SAFETY: path is NUL-terminated
    let fd = unsafe { libc::openat(dirfd, path.as_ptr(), flags) };
    if fd < 0 {
        Err(io::Error::from_raw_os_error(last_errno()))
    } else {
        Ok(FileDes::from_raw(fd))
    }
}

#[cfg(test)]
mod tests {
    use super::{DirEntryName, DirStream};
    use crate::fs::FileType;
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt as _;

    fn cstr(path: &std::path::Path) -> CString {
        CString::new(path.as_os_str().as_bytes()).unwrap()
    }

    fn drain(stream: &mut DirStream) -> Vec<DirEntryName> {
        let mut all = Vec::new();
        while !stream.read_batch(&mut all).unwrap() {}
        all
    }

    #[test]
    fn reads_names_and_hints_without_dot_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("file1.txt"), "test1").unwrap();
        std::fs::write(dir.path().join("file2.txt"), "test2").unwrap();
        std::fs::create_dir(dir.path().join("subdir")).unwrap();

        let mut stream = DirStream::open_at(libc::AT_FDCWD, &cstr(dir.path()), true).unwrap();
        let entries = drain(&mut stream);

        let mut names: Vec<_> = entries
            .iter()
            .map(|e| e.name.to_bytes().to_vec())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                b"file1.txt".to_vec(),
                b"file2.txt".to_vec(),
                b"subdir".to_vec()
            ]
        );
        for entry in &entries {
            assert_ne!(entry.name.to_bytes(), b".");
            assert_ne!(entry.name.to_bytes(), b"..");
            if entry.name.to_bytes() == b"subdir" {
                assert!(matches!(
                    entry.hint,
                    FileType::Directory | FileType::Unknown
                ));
            }
        }
    }

    #[test]
    fn empty_directory_hits_eof_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let mut stream = DirStream::open_at(libc::AT_FDCWD, &cstr(dir.path()), true).unwrap();
        let entries = drain(&mut stream);
        assert!(entries.is_empty());
    }

    #[test]
    fn nofollow_refuses_symlinked_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("real")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("alias")).unwrap();

        let err = DirStream::open_at(libc::AT_FDCWD, &cstr(&dir.path().join("alias")), false)
            .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ELOOP));

        assert!(DirStream::open_at(libc::AT_FDCWD, &cstr(&dir.path().join("alias")), true).is_ok());
    }

    #[test]
    fn into_fd_keeps_descriptor_usable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("x"), "").unwrap();
        let mut stream = DirStream::open_at(libc::AT_FDCWD, &cstr(dir.path()), true).unwrap();
        let _ = drain(&mut stream);

        // reopen and immediately park the fd
        let stream = DirStream::open_at(libc::AT_FDCWD, &cstr(dir.path()), true).unwrap();
        let fd = stream.into_fd();
        assert!(fd.is_open());
        let child = crate::fs::stat_at(
            fd.as_raw(),
            c"x",
            crate::fs::StatFlags::NO_FOLLOW,
            crate::fs::StatField::BASIC,
        );
        assert!(child.is_ok());
    }
}
