/*!
Signal hook chains.

Many logical handlers can share one signal: the process-wide `sigaction`
for a given signum is installed at most once, and delivery walks a
copy-on-write list of hooks. List snapshots are published with a store and
read inside the handler with a load (both sequentially consistent, the
classic RCU shape); removal spins on an entered/exited generation pair
until no handler can still be inside the removed snapshot.

Hook bodies run in signal context and must be async-signal-safe: atomics,
`write`, and friends — no allocation, no locking.

The registry is intentionally process-wide and is never torn down.
*/

use core::ffi::c_int;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use parking_lot::Mutex;
use std::io;
use std::sync::{Arc, OnceLock};

/// A hook body. Runs in signal context; keep it async-signal-safe.
pub type HookFn = Arc<dyn Fn(c_int) + Send + Sync + 'static>;

/// Whether a hook survives its first delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookMode {
    /// Stays installed until explicitly removed.
    Continue,
    /// Atomically consumed by the first delivery that reaches it.
    Oneshot,
}

struct Hook {
    id: u64,
    func: HookFn,
    mode: HookMode,
    consumed: AtomicBool,
}

type HookList = Vec<Arc<Hook>>;

/// Handle for a registered hook; pass back to [`sigunhook`].
#[derive(Debug)]
pub struct SigHook {
    signum: c_int,
    id: u64,
}

struct SigEntry {
    /// Current snapshot; leaked boxes swapped whole, retired after quiescence.
    list: AtomicPtr<HookList>,
    entered: AtomicU64,
    exited: AtomicU64,
    installed: AtomicBool,
    /// When set, delivery falls through to the default action after hooks.
    fatal: AtomicBool,
}

impl SigEntry {
    fn new() -> Self {
        Self {
            list: AtomicPtr::new(core::ptr::null_mut()),
            entered: AtomicU64::new(0),
            exited: AtomicU64::new(0),
            installed: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
        }
    }
}

const NSIG_SLOTS: usize = 65;

static TABLE: OnceLock<Vec<SigEntry>> = OnceLock::new();
static REG_LOCK: Mutex<()> = Mutex::new(());
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn table() -> &'static [SigEntry] {
    TABLE.get_or_init(|| (0..NSIG_SLOTS).map(|_| SigEntry::new()).collect())
}

fn entry_for(signum: c_int) -> io::Result<&'static SigEntry> {
    usize::try_from(signum)
        .ok()
        .filter(|&n| n > 0 && n < NSIG_SLOTS)
        .map(|n| &table()[n])
        .ok_or_else(|| io::Error::from_raw_os_error(libc::EINVAL))
}

/// The signals [`atsigexit`] covers.
pub const FATAL_SIGNALS: &[c_int] = &[
    libc::SIGINT,
    libc::SIGQUIT,
    libc::SIGPIPE,
    libc::SIGTERM,
    libc::SIGHUP,
    libc::SIGSEGV,
    libc::SIGBUS,
    libc::SIGILL,
    libc::SIGUSR1,
    libc::SIGUSR2,
];

extern "C" fn dispatch(signum: c_int) {
    let Some(entries) = TABLE.get() else { return };
    let Some(entry) = entries.get(signum as usize) else {
        return;
    };

    // the hooks must not clobber errno for the interrupted code
    let saved_errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);

    entry.entered.fetch_add(1, Ordering::SeqCst);
    let snapshot = entry.list.load(Ordering::SeqCst);
    if !snapshot.is_null() {
        // SAFETY: snapshots are only freed after the entered/exited pair
        // proves no handler is still inside them
        let hooks = unsafe { &*snapshot };
        for hook in hooks {
            match hook.mode {
                HookMode::Continue => (hook.func)(signum),
                HookMode::Oneshot => {
                    if !hook.consumed.swap(true, Ordering::AcqRel) {
                        (hook.func)(signum);
                    }
                }
            }
        }
    }
    entry.exited.fetch_add(1, Ordering::SeqCst);

    if entry.fatal.load(Ordering::SeqCst) {
        // SAFETY: resetting to SIG_DFL and re-raising is the standard way
        // to let the default action terminate us from handler context
        unsafe {
            let mut action: libc::sigaction = core::mem::zeroed();
            action.sa_sigaction = libc::SIG_DFL;
            libc::sigaction(signum, &raw const action, core::ptr::null_mut());
            libc::raise(signum);
        }
    }

    set_errno(saved_errno);
}

fn set_errno(value: c_int) {
    // SAFETY: libc errno locations are valid thread-local pointers
    #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
    unsafe {
        *libc::__error() = value;
    }
    #[cfg(not(any(target_os = "macos", target_os = "ios", target_os = "freebsd")))]
    unsafe {
        *libc::__errno_location() = value;
    }
}

/// Publish `new_list` for `entry` and retire the previous snapshot once no
/// handler can still be walking it. Caller holds `REG_LOCK`.
fn publish(entry: &'static SigEntry, new_list: HookList) {
    let new_ptr = Box::into_raw(Box::new(new_list));
    let old_ptr = entry.list.swap(new_ptr, Ordering::SeqCst);
    if old_ptr.is_null() {
        return;
    }
    // generation wait: everything that entered before the swap has exited
    let target = entry.entered.load(Ordering::SeqCst);
    while entry.exited.load(Ordering::SeqCst) < target {
        std::hint::spin_loop();
    }
    // SAFETY: quiescent; nobody references the old snapshot any more
    drop(unsafe { Box::from_raw(old_ptr) });
}

fn install_action(signum: c_int) -> io::Result<()> {
    // SAFETY: dispatch is a plain extern "C" handler; sigaction arguments
    // are valid for the duration of the call
    unsafe {
        let mut action: libc::sigaction = core::mem::zeroed();
        action.sa_sigaction = dispatch as extern "C" fn(c_int) as usize;
        libc::sigemptyset(&raw mut action.sa_mask);
        action.sa_flags = libc::SA_RESTART;
        if libc::sigaction(signum, &raw const action, core::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/**
Register `func` to run when `signum` is delivered.

The first hook for a signal installs the shared `sigaction`; later hooks
just join the chain. Returns a handle for [`sigunhook`].

# Errors
`EINVAL` for an out-of-range signal; otherwise whatever `sigaction`
reports.
*/
pub fn sighook(signum: c_int, func: HookFn, mode: HookMode) -> io::Result<SigHook> {
    let entry = entry_for(signum)?;
    let _guard = REG_LOCK.lock();

    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let hook = Arc::new(Hook {
        id,
        func,
        mode,
        consumed: AtomicBool::new(false),
    });

    let current = entry.list.load(Ordering::SeqCst);
    let mut new_list: HookList = if current.is_null() {
        Vec::with_capacity(1)
    } else {
        // SAFETY: mutations happen under REG_LOCK, so the snapshot is stable here
        unsafe { (*current).clone() }
    };
    new_list.push(hook);
    publish(entry, new_list);

    if !entry.installed.swap(true, Ordering::SeqCst) {
        install_action(signum)?;
    }
    Ok(SigHook { signum, id })
}

/**
Remove a hook. Safe to call while the signal is being delivered on another
thread; returns only after any in-flight invocation of the removed hook
has completed.
*/
pub fn sigunhook(handle: SigHook) {
    let Ok(entry) = entry_for(handle.signum) else {
        return;
    };
    let _guard = REG_LOCK.lock();

    let current = entry.list.load(Ordering::SeqCst);
    if current.is_null() {
        return;
    }
    // SAFETY: stable under REG_LOCK
    let new_list: HookList = unsafe { (*current).iter() }
        .filter(|hook| hook.id != handle.id)
        .cloned()
        .collect();
    publish(entry, new_list);
}

/**
Register `func` on every fatal signal: it runs before the default action
re-raises. Hooks installed this way mark their signals as fatal for the
whole process lifetime.

# Errors
Fails if any underlying `sigaction` fails; earlier registrations stay.
*/
pub fn atsigexit(func: HookFn) -> io::Result<Vec<SigHook>> {
    let mut handles = Vec::with_capacity(FATAL_SIGNALS.len());
    for &signum in FATAL_SIGNALS {
        let handle = sighook(signum, Arc::clone(&func), HookMode::Continue)?;
        entry_for(signum)?.fatal.store(true, Ordering::SeqCst);
        handles.push(handle);
    }
    Ok(handles)
}

/**
A POSIX interval timer that delivers `signum` to the process on a fixed
period. Pair it with [`sighook`] so a walk callback can observe deadlines:
the engine itself has no timeout support, so a caller wanting one arms a
timer and returns `Stop` from the callback once the hook's flag is set.

Deleted (and therefore silenced) on drop.
*/
#[cfg(any(target_os = "linux", target_os = "android"))]
pub struct IntervalTimer {
    timer: libc::timer_t,
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl IntervalTimer {
    /// Arm a repeating timer firing every `period`.
    ///
    /// # Errors
    /// Whatever `timer_create`/`timer_settime` report.
    pub fn every(signum: c_int, period: std::time::Duration) -> io::Result<Self> {
        // SAFETY: sigevent and timer_t are plain out-structures here
        unsafe {
            let mut sev: libc::sigevent = core::mem::zeroed();
            sev.sigev_notify = libc::SIGEV_SIGNAL;
            sev.sigev_signo = signum;
            let mut timer: libc::timer_t = core::mem::zeroed();
            if libc::timer_create(libc::CLOCK_MONOTONIC, &raw mut sev, &raw mut timer) != 0 {
                return Err(io::Error::last_os_error());
            }

            #[allow(clippy::cast_possible_wrap)]
            let tick = libc::timespec {
                tv_sec: period.as_secs() as libc::time_t,
                tv_nsec: period.subsec_nanos() as libc::c_long,
            };
            let spec = libc::itimerspec {
                it_interval: tick,
                it_value: tick,
            };
            if libc::timer_settime(timer, 0, &raw const spec, core::ptr::null_mut()) != 0 {
                let arm_err = io::Error::last_os_error();
                libc::timer_delete(timer);
                return Err(arm_err);
            }
            Ok(Self { timer })
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl Drop for IntervalTimer {
    fn drop(&mut self) {
        // SAFETY: the timer id came from timer_create and is deleted once
        unsafe { libc::timer_delete(self.timer) };
    }
}
