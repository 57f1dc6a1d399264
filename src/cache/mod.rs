use crate::fs::FileDes;
use core::ffi::c_int;
use smallvec::SmallVec;
use std::collections::HashMap;

/// Descriptors displaced by one insert; bursts are small.
pub type Evicted = SmallVec<[FileDes; 4]>;

const NIL: usize = usize::MAX;

struct Node {
    id: u64,
    fd: FileDes,
    pins: u32,
    prev: usize,
    next: usize,
}

/**
Bounded LRU cache of open directory descriptors, keyed by directory id.

Owned by the orchestrator thread alone, so there is no locking here at
all. Each live frontier directory either holds its own descriptor or
resolves its nearest cached ancestor through this cache so `openat` can
run with a short tail path.

Entries that are currently the base of an in-flight job are pinned and
exempt from eviction; when every resident entry is pinned the cache
records the pressure and lets the caller fall back to absolute-path
opens. Evicted descriptors are handed back to the caller, which closes
them through the I/O queue rather than blocking here.
*/
pub struct FdCache {
    map: HashMap<u64, usize>,
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
    /// Most-recently-used end of the recency list.
    head: usize,
    /// Least-recently-used end.
    tail: usize,
    cap: usize,
    pressure: u64,
}

impl FdCache {
    /// A cache holding at most `cap` descriptors.
    #[must_use]
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            map: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            cap: cap.max(1),
            pressure: 0,
        }
    }

    /// A cache capped at `RLIMIT_NOFILE - reserve`, where `reserve` covers
    /// stdio, the I/O queue, and consumer-exposed descriptors.
    #[must_use]
    pub fn with_reserve(reserve: usize) -> Self {
        Self::with_capacity(soft_cap(reserve))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// How often an insert found every resident entry pinned.
    #[must_use]
    pub const fn pressure(&self) -> u64 {
        self.pressure
    }

    /**
    Insert a descriptor for `id`, evicting least-recently-used unpinned
    entries to stay under the cap. Evicted descriptors are pushed into
    `evicted` for the caller to close.
    */
    pub fn insert(&mut self, id: u64, fd: FileDes, evicted: &mut Evicted) {
        debug_assert!(!self.map.contains_key(&id), "directory ids are unique");

        while self.map.len() >= self.cap {
            match self.evict_one() {
                Some(old) => evicted.push(old),
                None => {
                    // everything resident is pinned; over-commit and record it
                    self.pressure += 1;
                    break;
                }
            }
        }

        let idx = self.free.pop().unwrap_or_else(|| {
            self.slots.push(None);
            self.slots.len() - 1
        });
        self.slots[idx] = Some(Node {
            id,
            fd,
            pins: 0,
            prev: NIL,
            next: NIL,
        });
        self.map.insert(id, idx);
        self.push_front(idx);
    }

    /**
    Borrow the descriptor for `id`, marking it in-use so eviction skips
    it. Bumps recency. Callers pair every `pin` with an [`unpin`](Self::unpin).
    */
    pub fn pin(&mut self, id: u64) -> Option<c_int> {
        let idx = *self.map.get(&id)?;
        self.detach(idx);
        self.push_front(idx);
        let node = self.slots[idx].as_mut().expect("mapped slot is live");
        node.pins += 1;
        Some(node.fd.as_raw())
    }

    /// Release one pin on `id`.
    pub fn unpin(&mut self, id: u64) {
        if let Some(&idx) = self.map.get(&id) {
            let node = self.slots[idx].as_mut().expect("mapped slot is live");
            debug_assert!(node.pins > 0, "unpin without a matching pin");
            node.pins = node.pins.saturating_sub(1);
        }
    }

    /// Drop the least-recently-used unpinned entry, returning its
    /// descriptor for the caller to close. `None` when everything is pinned.
    pub fn evict_one(&mut self) -> Option<FileDes> {
        let mut idx = self.tail;
        while idx != NIL {
            let node = self.slots[idx].as_ref().expect("linked slot is live");
            if node.pins == 0 {
                let node = self.remove_at(idx);
                log::trace!("fd cache evict id={}", node.id);
                return Some(node.fd);
            }
            idx = node.prev;
        }
        None
    }

    fn remove_at(&mut self, idx: usize) -> Node {
        self.detach(idx);
        let node = self.slots[idx].take().expect("linked slot is live");
        self.map.remove(&node.id);
        self.free.push(idx);
        node
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.slots[idx].as_ref().expect("linked slot is live");
            (node.prev, node.next)
        };
        match prev {
            NIL => {
                if self.head == idx {
                    self.head = next;
                }
            }
            p => self.slots[p].as_mut().expect("linked slot is live").next = next,
        }
        match next {
            NIL => {
                if self.tail == idx {
                    self.tail = prev;
                }
            }
            n => self.slots[n].as_mut().expect("linked slot is live").prev = prev,
        }
        let node = self.slots[idx].as_mut().expect("linked slot is live");
        node.prev = NIL;
        node.next = NIL;
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let node = self.slots[idx].as_mut().expect("linked slot is live");
            node.prev = NIL;
            node.next = old_head;
        }
        if old_head != NIL {
            self.slots[old_head]
                .as_mut()
                .expect("linked slot is live")
                .prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }
}

/// `RLIMIT_NOFILE - reserve`, floored so the cache is never useless.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // rlim values above usize::MAX clamp anyway
pub fn soft_cap(reserve: usize) -> usize {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: limit is a valid out-pointer
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &raw mut limit) };
    let current = if rc == 0 {
        usize::try_from(limit.rlim_cur).unwrap_or(usize::MAX)
    } else {
        1024
    };
    current.saturating_sub(reserve).max(8)
}
