use core::ffi::c_int;
use std::os::fd::{BorrowedFd, RawFd};

/**
A safe abstraction around an owned file descriptor for internal IO.

Closes on drop. The engine guarantees every descriptor it opens travels
inside exactly one `FileDes` (or a `DirStream` wrapping one), which is how
the exactly-once close discipline is enforced.
*/
#[derive(Debug)]
#[repr(transparent)]
pub struct FileDes(pub(crate) c_int);

impl FileDes {
    /// Wrap a descriptor the caller just opened.
    #[inline]
    pub(crate) const fn from_raw(fd: c_int) -> Self {
        Self(fd)
    }

    /// The raw descriptor, still owned by `self`.
    #[must_use]
    #[inline]
    pub const fn as_raw(&self) -> c_int {
        self.0
    }

    /// Borrow the descriptor for the duration of `self`.
    #[must_use]
    #[inline]
    pub fn as_borrowed(&self) -> BorrowedFd<'_> {
        // SAFETY: self owns the fd and stays alive for the borrow
        unsafe { BorrowedFd::borrow_raw(self.0 as RawFd) }
    }

    /// Release ownership without closing.
    #[inline]
    pub(crate) fn into_raw(self) -> c_int {
        let fd = self.0;
        core::mem::forget(self);
        fd
    }

    /// Checks if the file descriptor is currently open
    /// Returns `true` if the file descriptor is open, `false` otherwise
    #[must_use]
    #[inline]
    pub fn is_open(&self) -> bool {
        // fcntl with F_GETFD returns -1/EBADF once the fd is gone
        // SAFETY: always safe, no memory involved
        unsafe { libc::fcntl(self.0, libc::F_GETFD) != -1 }
    }
}

impl Drop for FileDes {
    #[inline]
    fn drop(&mut self) {
        debug_assert!(
            self.is_open(),
            "We expect the file descriptor to be open before closing"
        );
        // SAFETY: we own the fd and this is the only close site
        unsafe { libc::close(self.0) };
    }
}

#[cfg(test)]
mod tests {
    use super::FileDes;

    #[test]
    fn close_on_drop() {
        let raw = unsafe { libc::open(c"/".as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
        assert!(raw >= 0);
        let fd = FileDes::from_raw(raw);
        assert!(fd.is_open());
        drop(fd);
        let probe = unsafe { libc::fcntl(raw, libc::F_GETFD) };
        assert_eq!(probe, -1);
    }
}
