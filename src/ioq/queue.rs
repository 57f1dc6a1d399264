use crate::error::{IoqError, last_errno};
use crate::fs::{DirEntryName, DirStream, FileDes, Stat, StatField, StatFlags, stat_at};
use crate::ioq::ring::Ring;
use core::ffi::c_int;
use core::sync::atomic::{AtomicBool, AtomicIsize, AtomicUsize, Ordering};
use std::ffi::CString;
use std::sync::Arc;
use std::thread::JoinHandle;

/// A queued unit of blocking I/O. Dispatch is a plain tagged variant; the
/// queue itself never inspects more than the kind.
#[derive(Debug)]
pub enum JobKind {
    /// `openat(at, path)` with directory discipline, yielding a stream.
    Opendir {
        at: c_int,
        path: CString,
        follow: bool,
    },
    /// `statx`/`fstatat` through the facade.
    Stat {
        at: c_int,
        path: CString,
        flags: StatFlags,
        fields: StatField,
    },
    /// One `getdents` batch from an open stream.
    Readdir { stream: DirStream },
    /// Retire a descriptor off the orchestrator thread.
    Close { fd: FileDes },
    /// Shutdown sentinel; recirculated so every worker sees it.
    Stop,
}

#[derive(Debug)]
pub struct Job {
    /// Opaque submitter cookie, returned untouched with the completion.
    pub token: usize,
    pub kind: JobKind,
}

/// Successful job payloads.
#[derive(Debug)]
pub enum Output {
    Dir(DirStream),
    Stat(Stat),
    /// One readdir batch. A mid-stream failure rides in `error` with the
    /// stream intact — its descriptor may still be the base of pending
    /// relative syscalls, so only the submitter gets to close it.
    Batch {
        stream: DirStream,
        entries: Vec<DirEntryName>,
        end: bool,
        error: Option<i32>,
    },
    Closed,
    /// Queue-cancelled sentinel so a blocked reader wakes.
    Stop,
}

/**
The result of one job.

Execution failures are captured here as the raw errno; they are never
propagated to the submitter as submission errors, and workers themselves
never fail.
*/
#[derive(Debug)]
pub struct Completion {
    pub token: usize,
    pub result: Result<Output, i32>,
}

/// Synchronous submission refusals. Neither variant ever blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// No free submission slots; retry after popping a completion.
    Full,
    /// The queue is stopping; nothing further is accepted.
    Cancelled,
}

struct Shared {
    submissions: Ring<Job>,
    completions: Ring<Completion>,
    live_workers: AtomicUsize,
    cancelled: AtomicBool,
}

/**
Asynchronous I/O queue: a submission/completion ring pair serviced by a
fixed pool of worker threads.

The orchestrator submits `opendir`/`stat`/`readdir`/`close` jobs without
blocking, workers execute them in parallel, and completions come back in
arbitrary order through [`pop`](Ioq::pop). Capacity covers every job that
has been submitted but whose completion has not yet been popped, so a full
queue always drains by popping.
*/
pub struct Ioq {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    /// Free submission budget; goes negative only transiently during a
    /// refused submit.
    capacity: AtomicIsize,
    depth: usize,
    /// Set once the stop sentinel has come back around.
    drained: bool,
}

impl Ioq {
    /**
    Create a queue with `depth` in-flight slots and `threads` workers.

    # Errors
    `depth` must be a power of two and `threads` at least 1; worker spawn
    failures surface as [`IoqError::Spawn`].
    */
    pub fn new(depth: usize, threads: usize) -> Result<Self, IoqError> {
        if depth == 0 || !depth.is_power_of_two() {
            return Err(IoqError::Depth(depth));
        }
        if threads == 0 {
            return Err(IoqError::Threads);
        }

        // Double-width rings: `depth` live jobs plus recirculating stop
        // sentinels can never saturate the slots, so workers only park in
        // `slot_wait` under genuine overload, not as part of shutdown.
        let shared = Arc::new(Shared {
            submissions: Ring::new(depth * 2),
            completions: Ring::new(depth * 2),
            live_workers: AtomicUsize::new(threads),
            cancelled: AtomicBool::new(false),
        });

        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let shared_worker = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("bfwalk-io-{index}"))
                .spawn(move || worker_loop(&shared_worker))
                .map_err(|spawn_err| {
                    // unwind the part of the pool that did start
                    shared.cancelled.store(true, Ordering::Release);
                    shared.submissions.push(Job {
                        token: 0,
                        kind: JobKind::Stop,
                    });
                    IoqError::Spawn(spawn_err)
                })?;
            workers.push(handle);
        }

        log::debug!("ioq up: depth={depth} threads={threads}");
        Ok(Self {
            shared,
            workers,
            capacity: AtomicIsize::new(depth as isize),
            depth,
            drained: false,
        })
    }

    /**
    Submit a job. Fails synchronously with [`SubmitError::Full`] when the
    ring has no free slots and with [`SubmitError::Cancelled`] after
    [`cancel`](Self::cancel); never blocks. A refused job is handed back
    so the submitter can retry or release it.
    */
    pub fn submit(&self, token: usize, kind: JobKind) -> Result<(), (SubmitError, JobKind)> {
        if self.shared.cancelled.load(Ordering::Acquire) {
            return Err((SubmitError::Cancelled, kind));
        }
        if self.capacity.fetch_sub(1, Ordering::AcqRel) <= 0 {
            self.capacity.fetch_add(1, Ordering::AcqRel);
            return Err((SubmitError::Full, kind));
        }
        self.shared.submissions.push(Job { token, kind });
        Ok(())
    }

    /**
    Retrieve the next completion; `block` controls whether an empty queue
    sleeps or returns `None` immediately. After cancellation has drained,
    always returns `None` without blocking.

    Popping frees the completed job's submission slot.
    */
    pub fn pop(&mut self, block: bool) -> Option<Completion> {
        if self.drained {
            return None;
        }
        let completion = self.shared.completions.pop_single(block)?;
        if matches!(completion.result, Ok(Output::Stop)) {
            self.drained = true;
            return None;
        }
        self.capacity.fetch_add(1, Ordering::AcqRel);
        Some(completion)
    }

    /// Currently free submission slots. Advisory: another submit may win
    /// the race.
    #[must_use]
    pub fn capacity(&self) -> usize {
        let free = self.capacity.load(Ordering::Acquire);
        if free > 0 { free as usize } else { 0 }
    }

    /// Total slot count the queue was built with.
    #[must_use]
    pub const fn depth(&self) -> usize {
        self.depth
    }

    /**
    Mark the queue stopping. Workers finish their in-flight job and exit;
    the last one out pushes a sentinel completion so a blocked reader
    wakes. Idempotent.
    */
    pub fn cancel(&self) {
        if self.shared.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.submissions.push(Job {
            token: 0,
            kind: JobKind::Stop,
        });
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }
}

impl Drop for Ioq {
    fn drop(&mut self) {
        self.cancel();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        // rings drop after the workers are gone; unread completions are
        // released there, closing any streams they still carry
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let Job { token, kind } = shared.submissions.pop();
        if matches!(kind, JobKind::Stop) {
            // pass the sentinel on to the next sibling
            shared.submissions.push(Job {
                token,
                kind: JobKind::Stop,
            });
            break;
        }
        shared.completions.push(execute(token, kind));
    }

    if shared.live_workers.fetch_sub(1, Ordering::AcqRel) == 1 {
        log::debug!("ioq drained, waking reader");
        shared.completions.push(Completion {
            token: 0,
            result: Ok(Output::Stop),
        });
    }
}

/// Run one job to completion, capturing any OS error into the result.
fn execute(token: usize, kind: JobKind) -> Completion {
    let result = match kind {
        JobKind::Opendir { at, path, follow } => DirStream::open_at(at, &path, follow)
            .map(Output::Dir)
            .map_err(raw_errno),
        JobKind::Stat {
            at,
            path,
            flags,
            fields,
        } => stat_at(at, &path, flags, fields)
            .map(Output::Stat)
            .map_err(raw_errno),
        JobKind::Readdir { mut stream } => {
            let mut entries = Vec::new();
            match stream.read_batch(&mut entries) {
                Ok(end) => Ok(Output::Batch {
                    stream,
                    entries,
                    end,
                    error: None,
                }),
                Err(read_err) => Ok(Output::Batch {
                    stream,
                    entries,
                    end: true,
                    error: Some(raw_errno(read_err)),
                }),
            }
        }
        JobKind::Close { fd } => {
            drop(fd);
            Ok(Output::Closed)
        }
        JobKind::Stop => Ok(Output::Stop),
    };
    Completion { token, result }
}

fn raw_errno(err: std::io::Error) -> i32 {
    err.raw_os_error().unwrap_or_else(last_errno)
}
