use super::Value;

/// Drop `value` from the bounding vector of every thread.
///
/// This requires `CAP_SETPCAP`, and cannot be undone.
#[inline]
pub fn drop(value: Value) -> crate::Result<()> {
    crate::psx_prctl(libc::PR_CAPBSET_DROP, value.raw() as libc::c_ulong, 0, 0, 0)?;

    Ok(())
}

/// Check if `value` is raised in the calling thread's bounding vector.
///
/// This returns `Some(true)` if the value is raised, `Some(false)` if it is lowered, and `None`
/// if it is not supported.
#[inline]
pub fn read(value: Value) -> Option<bool> {
    read_raw(value.raw() as _)
}

#[inline]
fn read_raw(raw: libc::c_ulong) -> Option<bool> {
    match unsafe { crate::raw_prctl_opt(libc::PR_CAPBSET_READ, raw, 0, 0, 0) } {
        Some(res) => Some(res != 0),
        None => {
            debug_assert_eq!(unsafe { *libc::__errno_location() }, libc::EINVAL);
            None
        }
    }
}

/// "Probes" the calling thread's bounding vector and returns every value that is still raised.
pub fn probe() -> Vec<Value> {
    let mut values = Vec::new();

    for value in Value::iter() {
        match read(value) {
            Some(true) => values.push(value),
            Some(false) => (),

            // Unsupported value encountered; none of the remaining ones will be supported either
            None => break,
        }
    }

    values
}
