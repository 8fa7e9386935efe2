//! Linux capability state: sets of capability values, their portable binary and text forms,
//! security modes, and privilege changes that take effect on every thread of the process.
//!
//! The kernel tracks capabilities, secure bits, and UIDs/GIDs per *thread*. Every write in this
//! crate that changes the credentials of the process (for example [`Set::set_proc()`] or
//! [`Mode::set()`]) is routed through [`psx`], which replays the system call on every thread
//! before returning. Reads only inspect the calling thread.

mod constants;
mod err;
#[allow(non_camel_case_types)]
mod externs;

pub mod caps;
pub mod prctl;
pub mod psx;

pub use caps::*;
pub use err::{Error, Result};
pub use prctl::*;

#[inline]
unsafe fn raw_prctl(
    option: libc::c_int,
    arg2: libc::c_ulong,
    arg3: libc::c_ulong,
    arg4: libc::c_ulong,
    arg5: libc::c_ulong,
) -> Result<libc::c_int> {
    let res = libc::prctl(option, arg2, arg3, arg4, arg5);

    if res >= 0 {
        Ok(res)
    } else {
        Err(Error::last())
    }
}

#[inline]
unsafe fn raw_prctl_opt(
    option: libc::c_int,
    arg2: libc::c_ulong,
    arg3: libc::c_ulong,
    arg4: libc::c_ulong,
    arg5: libc::c_ulong,
) -> Option<libc::c_int> {
    let res = libc::prctl(option, arg2, arg3, arg4, arg5);

    if res >= 0 {
        Some(res)
    } else {
        None
    }
}

/// Like `raw_prctl()`, but applied to every thread in the process.
#[inline]
fn psx_prctl(
    option: libc::c_int,
    arg2: libc::c_ulong,
    arg3: libc::c_ulong,
    arg4: libc::c_ulong,
    arg5: libc::c_ulong,
) -> Result<libc::c_int> {
    // SAFETY: prctl() with integer arguments only touches the calling thread's task state.
    let res = unsafe {
        psx::syscall6(
            libc::SYS_prctl,
            option as libc::c_long,
            arg2 as libc::c_long,
            arg3 as libc::c_long,
            arg4 as libc::c_long,
            arg5 as libc::c_long,
            0,
        )
    }?;

    Ok(res as libc::c_int)
}

/// Serializes tests that flip process-wide flags (keep-caps and friends).
#[cfg(test)]
pub(crate) static PROCESS_FLAGS_TEST_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());
