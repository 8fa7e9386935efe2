//! The ambient capability vector.
//!
//! Ambient values survive `execve()` of unprivileged programs. A value can only be raised if it
//! is both Permitted and Inheritable, and lowering either of those lowers it too. Writes apply to
//! every thread of the process.

use super::Value;
use crate::Result;

/// Check whether `value` is raised in the calling thread's ambient vector.
///
/// Fails with `EINVAL` if the kernel does not support ambient capabilities (or `value`).
#[inline]
pub fn read(value: Value) -> Result<bool> {
    let res = unsafe {
        crate::raw_prctl(
            libc::PR_CAP_AMBIENT,
            libc::PR_CAP_AMBIENT_IS_SET as libc::c_ulong,
            value.raw() as libc::c_ulong,
            0,
            0,
        )
    }?;

    Ok(res != 0)
}

/// Raise (`enable == true`) or lower `value` in the ambient vector of every thread.
pub fn set(value: Value, enable: bool) -> Result<()> {
    let op = if enable {
        libc::PR_CAP_AMBIENT_RAISE
    } else {
        libc::PR_CAP_AMBIENT_LOWER
    };

    crate::psx_prctl(
        libc::PR_CAP_AMBIENT,
        op as libc::c_ulong,
        value.raw() as libc::c_ulong,
        0,
        0,
    )?;

    Ok(())
}

/// Lower every ambient value of every thread.
#[inline]
pub fn reset() -> Result<()> {
    crate::psx_prctl(
        libc::PR_CAP_AMBIENT,
        libc::PR_CAP_AMBIENT_CLEAR_ALL as libc::c_ulong,
        0,
        0,
        0,
    )?;

    Ok(())
}

/// Whether the running kernel supports ambient capabilities at all.
#[inline]
pub fn is_supported() -> bool {
    read(Value::CHOWN).is_ok()
}

/// List the values raised in the calling thread's ambient vector, or `None` if ambient
/// capabilities are not supported.
pub fn probe() -> Option<Vec<Value>> {
    let mut values = Vec::new();

    for value in Value::iter() {
        match read(value) {
            Ok(true) => values.push(value),
            Ok(false) => (),
            Err(_) if value.raw() == 0 => return None,
            // Unsupported value encountered; none of the remaining ones will be supported either
            Err(_) => break,
        }
    }

    Some(values)
}
