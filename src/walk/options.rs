use crate::error::{BuildError, IoqError, WalkError};
use crate::walk::record::{Visit, WalkAction, WalkOutcome};
use core::num::NonZeroUsize;
use std::os::unix::ffi::OsStrExt as _;
use std::path::{Path, PathBuf};

/// Which symlinks the walk resolves while descending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    /// Treat every symlink as a leaf.
    Never,
    /// Follow a root that is itself a symlink, exactly once; never below.
    RootsOnly,
    /// Follow symlinks everywhere, with ancestor-chain loop detection.
    Always,
}

/// Whether descent crosses filesystem boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    Cross,
    Stay,
}

/// With [`MountMode::Stay`], what happens to a child on a foreign device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XdevPrune {
    /// Emit the record once, then never descend beneath it.
    Emit,
    /// Suppress the record entirely.
    Hide,
}

/// Per-parent emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Whatever order readdir produced.
    None,
    /// Bytewise ascending on the file name.
    Ascending,
    /// Bytewise descending on the file name.
    Descending,
}

/// Validated walk configuration; build one with [`WalkBuilder`].
#[derive(Debug, Clone)]
pub struct WalkOptions {
    pub(crate) roots: Vec<PathBuf>,
    pub(crate) link_mode: LinkMode,
    pub(crate) mount_mode: MountMode,
    pub(crate) xdev_prune: XdevPrune,
    pub(crate) min_depth: u32,
    pub(crate) max_depth: u32,
    pub(crate) need_stat: bool,
    pub(crate) need_target_stat: bool,
    pub(crate) strict_links: bool,
    pub(crate) threads: NonZeroUsize,
    pub(crate) queue_depth: usize,
    pub(crate) sort: SortOrder,
}

impl WalkOptions {
    /// Run the walk, delivering every visit to `callback`.
    ///
    /// # Errors
    /// See [`walk`](crate::walk::walk).
    pub fn walk<F>(&self, callback: F) -> Result<WalkOutcome, WalkError>
    where
        F: FnMut(&Visit<'_>) -> WalkAction,
    {
        crate::walk::walk(self, callback)
    }
}

/**
A builder for configuring a breadth-first walk.

Defaults: never follow symlinks, cross mount points, no depth window,
stat only when something needs it, worker count from
`available_parallelism`, queue depth 64, readdir order.
*/
#[derive(Debug, Clone)]
pub struct WalkBuilder {
    roots: Vec<PathBuf>,
    link_mode: LinkMode,
    mount_mode: MountMode,
    xdev_prune: XdevPrune,
    min_depth: u32,
    max_depth: u32,
    need_stat: bool,
    need_target_stat: bool,
    strict_links: bool,
    threads: NonZeroUsize,
    queue_depth: usize,
    sort: SortOrder,
}

impl WalkBuilder {
    /// Start from a single seed root.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        const MIN_THREADS: usize = 1;
        let threads = std::thread::available_parallelism()
            .unwrap_or(NonZeroUsize::new(MIN_THREADS).expect("1 is non-zero"));
        Self {
            roots: vec![root.as_ref().to_path_buf()],
            link_mode: LinkMode::Never,
            mount_mode: MountMode::Cross,
            xdev_prune: XdevPrune::Emit,
            min_depth: 0,
            max_depth: u32::MAX,
            need_stat: false,
            need_target_stat: false,
            strict_links: false,
            threads,
            queue_depth: 64,
            sort: SortOrder::None,
        }
    }

    /// Append another seed root; roots are walked in the order given.
    #[must_use]
    pub fn add_root<P: AsRef<Path>>(mut self, root: P) -> Self {
        self.roots.push(root.as_ref().to_path_buf());
        self
    }

    /// Which symlinks to follow, defaults to [`LinkMode::Never`]
    #[must_use]
    pub const fn link_mode(mut self, mode: LinkMode) -> Self {
        self.link_mode = mode;
        self
    }

    /// Whether to descend across filesystem boundaries, defaults to crossing
    #[must_use]
    pub const fn mount_mode(mut self, mode: MountMode) -> Self {
        self.mount_mode = mode;
        self
    }

    /// With [`MountMode::Stay`], emit or hide foreign-device children
    #[must_use]
    pub const fn xdev_prune(mut self, policy: XdevPrune) -> Self {
        self.xdev_prune = policy;
        self
    }

    /// Suppress records shallower than `depth` (descent is unaffected)
    #[must_use]
    pub const fn min_depth(mut self, depth: u32) -> Self {
        self.min_depth = depth;
        self
    }

    /// Cap descent: directories at `depth` are emitted but not expanded
    #[must_use]
    pub const fn max_depth(mut self, depth: u32) -> Self {
        self.max_depth = depth;
        self
    }

    /// Always stat before emitting (needed when the consumer reads stat fields)
    #[must_use]
    pub const fn need_stat(mut self, yes: bool) -> Self {
        self.need_stat = yes;
        self
    }

    /// For symlinks, also stat the link target
    #[must_use]
    pub const fn need_target_stat(mut self, yes: bool) -> Self {
        self.need_target_stat = yes;
        self
    }

    /// Report an unresolvable link target as a per-entry error instead of
    /// quietly degrading the record to a plain link entry
    #[must_use]
    pub const fn strict_links(mut self, yes: bool) -> Self {
        self.strict_links = yes;
        self
    }

    /// Worker pool size
    #[must_use]
    pub const fn threads(mut self, threads: NonZeroUsize) -> Self {
        self.threads = threads;
        self
    }

    /// I/O queue depth; must be a power of two
    #[must_use]
    pub const fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth;
        self
    }

    /// Per-parent emission order
    #[must_use]
    pub const fn sort(mut self, order: SortOrder) -> Self {
        self.sort = order;
        self
    }

    /**
    Validate and freeze the configuration.

    # Errors
    Rejects an empty root list, an inverted depth window, a root with an
    interior NUL byte, and a queue depth that is not a power of two.
    */
    pub fn build(self) -> Result<WalkOptions, BuildError> {
        if self.roots.is_empty() {
            return Err(BuildError::NoRoots);
        }
        if self.min_depth > self.max_depth {
            return Err(BuildError::DepthWindow {
                min: self.min_depth,
                max: self.max_depth,
            });
        }
        if self.queue_depth == 0 || !self.queue_depth.is_power_of_two() {
            return Err(BuildError::Ioq(IoqError::Depth(self.queue_depth)));
        }
        for root in &self.roots {
            if root.as_os_str().as_bytes().contains(&0) {
                return Err(BuildError::NulInPath(root.as_os_str().to_owned()));
            }
        }

        Ok(WalkOptions {
            roots: self.roots,
            link_mode: self.link_mode,
            mount_mode: self.mount_mode,
            xdev_prune: self.xdev_prune,
            min_depth: self.min_depth,
            max_depth: self.max_depth,
            need_stat: self.need_stat,
            need_target_stat: self.need_target_stat,
            strict_links: self.strict_links,
            threads: self.threads,
            queue_depth: self.queue_depth,
            sort: self.sort,
        })
    }

    /// Build and run in one go.
    ///
    /// # Errors
    /// See [`build`](Self::build) and [`walk`](crate::walk::walk).
    pub fn walk<F>(self, callback: F) -> Result<WalkOutcome, WalkError>
    where
        F: FnMut(&Visit<'_>) -> WalkAction,
    {
        let options = self.build()?;
        options.walk(callback)
    }
}
