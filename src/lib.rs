/*!
A breadth-first, multi-threaded filesystem traversal engine.

`bfwalk` walks one or more directory roots strictly breadth-first while
pipelining the blocking syscalls (`openat`, `statx`, `getdents64`,
`close`) across a fixed worker pool. The consumer sees none of that
concurrency: every entry is delivered to a single callback, on the
calling thread, in a guaranteed order — all of a directory's children
before any of its grandchildren, and within one directory exactly the
order readdir produced (or a configured sort).

```no_run
use bfwalk::{WalkAction, WalkBuilder};

let outcome = WalkBuilder::new("/var/log")
    .max_depth(3)
    .walk(|visit| {
        println!("{} {}", visit.depth(), visit.path().display());
        WalkAction::Continue
    })?;
println!("{outcome:?}");
# Ok::<(), bfwalk::WalkError>(())
```

Symlink loops are detected against the ancestor chain and flagged rather
than reported as errors; unreadable directories surface as per-entry
error records while the walk continues; mount boundaries can be pinned
with emit-or-hide semantics. See [`WalkBuilder`] for the full option
surface.
*/

pub mod cache;
mod error;
pub mod fs;
pub mod ioq;
pub mod sig;
mod walk;

pub use error::{BuildError, EntryError, EntryErrorKind, IoqError, Result, WalkError};
pub use fs::{DirEntryName, DirStream, FileDes, FileType, Stat, StatField, StatFlags, Timespec};
pub use walk::{
    LinkMode, MountMode, SortOrder, Visit, WalkAction, WalkBuilder, WalkOptions, WalkOutcome,
    XdevPrune, walk,
};

// this allocator is more efficient than jemalloc through my testing
#[cfg(all(
    feature = "mimalloc",
    any(target_os = "linux", target_os = "macos", target_os = "android")
))]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;
