//! System calls that take effect on every thread of the process.
//!
//! Linux keeps credentials (capabilities, secure bits, UIDs/GIDs, ...) per thread. A raw
//! `capset()` or `setuid()` therefore only changes the calling thread, and a multithreaded
//! program that wants to drop privileges has to repeat the call everywhere. The functions here do
//! exactly that:
//!
//! 1. The call is made on the calling thread.
//! 2. Every other thread listed in `/proc/self/task` is interrupted with `SIGSYS` (sent with
//!    `tgkill()`), and its handler repeats the same call.
//! 3. The task list is re-read until a pass turns up no thread that has not yet made the call.
//!    A thread spawned during the broadcast inherits the credentials of the thread that created
//!    it, so it is either already up to date or is picked up by the next pass.
//!
//! Every thread must see the same result as the calling thread. If any thread reports a different
//! `errno`, or the task list cannot be read once the call has been made, the credentials of the
//! process are no longer known and the process is aborted. If the task list cannot be read in the
//! first place, the call is not made at all and the error is returned.
//!
//! `SIGSYS` deliveries that do not come from a broadcast (seccomp traps, for example) are passed
//! on to the disposition that was in place when the handler was installed.
//!
//! There is no timeout: a thread that blocks `SIGSYS` forever blocks the broadcast forever.
//! Concurrent broadcasts are serialized by an internal lock.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicIsize, AtomicUsize, Ordering};

use once_cell::sync::OnceCell;

use crate::{Error, Result};

const PSX_SIGNAL: libc::c_int = libc::SIGSYS;

const ZERO: AtomicIsize = AtomicIsize::new(0);

/// The call currently being replayed. Only written while `BROADCAST` is held and no thread can be
/// inside `handler()` for an earlier call.
struct Pending {
    active: AtomicBool,
    nr: AtomicIsize,
    args: [AtomicIsize; 6],
    // `errno` observed by the initiating thread (0 on success)
    expect: AtomicI32,
    acks: AtomicUsize,
    diverged: AtomicBool,
}

static PENDING: Pending = Pending {
    active: AtomicBool::new(false),
    nr: AtomicIsize::new(0),
    args: [ZERO; 6],
    expect: AtomicI32::new(0),
    acks: AtomicUsize::new(0),
    diverged: AtomicBool::new(false),
};

static BROADCAST: parking_lot::Mutex<()> = parking_lot::const_mutex(());

static HANDLER: OnceCell<core::result::Result<(), Error>> = OnceCell::new();

// The `SIGSYS` disposition that was installed before ours
static PREVIOUS_HANDLER: AtomicUsize = AtomicUsize::new(libc::SIG_DFL);
static PREVIOUS_FLAGS: AtomicI32 = AtomicI32::new(0);

cfg_if::cfg_if! {
    if #[cfg(feature = "sc")] {
        #[inline]
        unsafe fn raw_syscall(
            nr: libc::c_long,
            args: &[libc::c_long; 6],
        ) -> core::result::Result<libc::c_long, i32> {
            let res = sc::syscall6(
                nr as usize,
                args[0] as usize,
                args[1] as usize,
                args[2] as usize,
                args[3] as usize,
                args[4] as usize,
                args[5] as usize,
            ) as isize;

            if (-4095..0).contains(&res) {
                Err(-res as i32)
            } else {
                Ok(res as libc::c_long)
            }
        }
    } else {
        #[inline]
        unsafe fn raw_syscall(
            nr: libc::c_long,
            args: &[libc::c_long; 6],
        ) -> core::result::Result<libc::c_long, i32> {
            let res = libc::syscall(nr, args[0], args[1], args[2], args[3], args[4], args[5]);

            if res < 0 {
                Err(*libc::__errno_location())
            } else {
                Ok(res)
            }
        }
    }
}

extern "C" fn handler(sig: libc::c_int, info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    // Only async-signal-safe operations from here on.
    if info.is_null()
        || unsafe { (*info).si_code } != crate::constants::SI_TKILL
        || !PENDING.active.load(Ordering::SeqCst)
    {
        chain(sig, info, ctx);
        return;
    }

    let saved_errno = unsafe { *libc::__errno_location() };

    let nr = PENDING.nr.load(Ordering::SeqCst) as libc::c_long;
    let mut args = [0; 6];
    for (arg, pending) in args.iter_mut().zip(PENDING.args.iter()) {
        *arg = pending.load(Ordering::SeqCst) as libc::c_long;
    }

    let eno = match unsafe { raw_syscall(nr, &args) } {
        Ok(_) => 0,
        Err(eno) => eno,
    };
    if eno != PENDING.expect.load(Ordering::SeqCst) {
        PENDING.diverged.store(true, Ordering::SeqCst);
    }
    PENDING.acks.fetch_add(1, Ordering::SeqCst);

    unsafe {
        *libc::__errno_location() = saved_errno;
    }
}

/// Hand a `SIGSYS` that was not sent by a broadcast (for example a seccomp trap) to whatever
/// disposition was in place before ours.
fn chain(sig: libc::c_int, info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    let prev = PREVIOUS_HANDLER.load(Ordering::SeqCst);

    if prev == libc::SIG_IGN {
        return;
    }

    if prev == libc::SIG_DFL {
        // The signal is blocked while we run, so it is delivered again with the default
        // disposition as soon as we return.
        unsafe {
            libc::signal(sig, libc::SIG_DFL);
            libc::raise(sig);
        }
        return;
    }

    unsafe {
        if PREVIOUS_FLAGS.load(Ordering::SeqCst) & libc::SA_SIGINFO != 0 {
            let f: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
                std::mem::transmute(prev);
            f(sig, info, ctx);
        } else {
            let f: extern "C" fn(libc::c_int) = std::mem::transmute(prev);
            f(sig);
        }
    }
}

#[inline]
fn handler_address() -> libc::sighandler_t {
    handler as *const () as libc::sighandler_t
}

fn install_handler() -> Result<()> {
    unsafe {
        let mut old: libc::sigaction = std::mem::zeroed();
        if libc::sigaction(PSX_SIGNAL, std::ptr::null(), &mut old) < 0 {
            return Err(Error::last());
        }
        if old.sa_sigaction != handler_address() {
            PREVIOUS_FLAGS.store(old.sa_flags, Ordering::SeqCst);
            PREVIOUS_HANDLER.store(old.sa_sigaction, Ordering::SeqCst);
        }

        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler_address();
        action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);

        if libc::sigaction(PSX_SIGNAL, &action, std::ptr::null_mut()) < 0 {
            return Err(Error::last());
        }
    }

    log::debug!("psx: installed handler for signal {}", PSX_SIGNAL);
    Ok(())
}

#[inline]
fn gettid() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

/// Send `sig` to thread `tid` of this process. Returns `false` if the thread no longer exists.
fn tgkill(tid: libc::pid_t, sig: libc::c_int) -> Result<bool> {
    let pid = unsafe { libc::getpid() };

    if unsafe { libc::syscall(libc::SYS_tgkill, pid, tid, sig) } < 0 {
        match Error::last() {
            Error::Os(libc::ESRCH) => Ok(false),
            e => Err(e),
        }
    } else {
        Ok(true)
    }
}

/// A thread of this process. TIDs can be recycled, so the start time tells two threads that
/// shared a TID apart.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
struct Thread {
    tid: libc::pid_t,
    start: u64,
}

/// Extract the start time (field 22) from the contents of `/proc/<pid>/task/<tid>/stat`.
fn parse_start_time(stat: &str) -> Option<u64> {
    // The command name may itself contain spaces and parentheses
    let rest = &stat[stat.rfind(')')? + 1..];

    // Field 3 (the state) is the first one after the command name
    rest.split_whitespace().nth(22 - 3)?.parse().ok()
}

/// Look up thread `tid`. Returns `None` if it has already exited.
fn thread(tid: libc::pid_t) -> Result<Option<Thread>> {
    let stat = match fs::read_to_string(format!("/proc/self/task/{}/stat", tid)) {
        Ok(stat) => stat,
        Err(e) if e.kind() == io::ErrorKind::NotFound || e.raw_os_error() == Some(libc::ESRCH) => {
            return Ok(None)
        }
        Err(e) => return Err(e.into()),
    };

    match parse_start_time(&stat) {
        Some(start) => Ok(Some(Thread { tid, start })),
        None => Err(Error::BadFormat),
    }
}

fn list_threads() -> Result<Vec<Thread>> {
    let mut threads = Vec::new();

    for entry in fs::read_dir("/proc/self/task")? {
        let entry = entry?;
        if let Some(tid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<libc::pid_t>().ok())
        {
            if let Some(thread) = thread(tid)? {
                threads.push(thread);
            }
        }
    }

    Ok(threads)
}

/// Replay the pending call on `tid` and wait until it has either run the handler or exited.
fn replay_on(tid: libc::pid_t) -> Result<()> {
    let before = PENDING.acks.load(Ordering::SeqCst);

    if !tgkill(tid, PSX_SIGNAL)? {
        return Ok(());
    }

    while PENDING.acks.load(Ordering::SeqCst) == before {
        if !tgkill(tid, 0)? {
            break;
        }
        std::thread::yield_now();
    }

    Ok(())
}

/// Give up on a process whose threads may no longer agree on their credentials.
fn fatal(nr: libc::c_long, why: fmt::Arguments) -> ! {
    log::error!("psx: syscall {} {}; credentials are unknown", nr, why);
    std::process::abort();
}

fn broadcast(nr: libc::c_long, args: [libc::c_long; 6]) -> Result<libc::c_long> {
    if let Err(e) = HANDLER.get_or_init(install_handler) {
        return Err(*e);
    }

    let _guard = BROADCAST.lock();

    // Nothing has changed yet, so failing to find the threads is still an ordinary error
    let first = list_threads()?;
    let tid = gettid();
    let me = *first
        .iter()
        .find(|thread| thread.tid == tid)
        .ok_or(Error::Os(libc::ESRCH))?;

    let res = unsafe { raw_syscall(nr, &args) };
    let expect = match res {
        Ok(_) => 0,
        Err(eno) => eno,
    };

    PENDING.nr.store(nr as isize, Ordering::SeqCst);
    for (pending, arg) in PENDING.args.iter().zip(args.iter()) {
        pending.store(*arg as isize, Ordering::SeqCst);
    }
    PENDING.expect.store(expect, Ordering::SeqCst);
    PENDING.diverged.store(false, Ordering::SeqCst);
    PENDING.active.store(true, Ordering::SeqCst);

    let walk = (|| -> Result<usize> {
        let mut done = HashSet::new();
        done.insert(me);

        let mut fresh = first;
        loop {
            fresh.retain(|thread| !done.contains(thread));
            if fresh.is_empty() {
                return Ok(done.len());
            }

            for thread in fresh.drain(..) {
                log::trace!("psx: replaying syscall {} on thread {}", nr, thread.tid);
                replay_on(thread.tid)?;
                done.insert(thread);
            }

            fresh = list_threads()?;
        }
    })();

    PENDING.active.store(false, Ordering::SeqCst);

    let threads = match walk {
        Ok(threads) => threads,
        Err(e) => fatal(nr, format_args!("could not be replayed on every thread ({})", e)),
    };

    if PENDING.diverged.load(Ordering::SeqCst) {
        fatal(nr, format_args!("gave inconsistent results across threads"));
    }

    log::debug!("psx: syscall {} applied on {} thread(s)", nr, threads);

    res.map_err(Error::from_code)
}

/// Perform a 3-argument system call on every thread of the process.
///
/// Returns the result observed by the calling thread.
///
/// # Safety
///
/// The caller must uphold the safety requirements of the system call itself; any pointer
/// arguments must stay valid until this function returns, since other threads dereference them
/// too.
pub unsafe fn syscall3(
    nr: libc::c_long,
    arg1: libc::c_long,
    arg2: libc::c_long,
    arg3: libc::c_long,
) -> Result<libc::c_long> {
    broadcast(nr, [arg1, arg2, arg3, 0, 0, 0])
}

/// Perform a 6-argument system call on every thread of the process.
///
/// See [`syscall3()`] for details.
///
/// # Safety
///
/// See [`syscall3()`].
#[allow(clippy::too_many_arguments)]
pub unsafe fn syscall6(
    nr: libc::c_long,
    arg1: libc::c_long,
    arg2: libc::c_long,
    arg3: libc::c_long,
    arg4: libc::c_long,
    arg5: libc::c_long,
    arg6: libc::c_long,
) -> Result<libc::c_long> {
    broadcast(nr, [arg1, arg2, arg3, arg4, arg5, arg6])
}

/// Hold off broadcasts, so that a `fork()`ed child does not inherit the lock mid-call.
#[cfg(test)]
pub(crate) fn hold_broadcasts() -> parking_lot::MutexGuard<'static, ()> {
    BROADCAST.lock()
}
