mod dir;
mod fd;
mod file_type;
mod stat;

pub use dir::{DirEntryName, DirStream};
pub use fd::FileDes;
pub use file_type::FileType;
pub use stat::{Stat, StatField, StatFlags, Timespec, stat_at, stat_fd};
