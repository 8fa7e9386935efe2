/// Check whether the calling thread keeps its Permitted capabilities when it switches all of its
/// UIDs away from 0.
#[inline]
pub fn get_keepcaps() -> crate::Result<bool> {
    let res = unsafe { crate::raw_prctl(libc::PR_GET_KEEPCAPS, 0, 0, 0, 0) }?;

    Ok(res != 0)
}

/// Set the "keep capabilities" flag of every thread in the process.
#[inline]
pub fn set_keepcaps(keep: bool) -> crate::Result<()> {
    crate::psx_prctl(libc::PR_SET_KEEPCAPS, keep as libc::c_ulong, 0, 0, 0)?;

    Ok(())
}

bitflags::bitflags! {
    /// The "secure bits" that change how the kernel grants capabilities to UID 0.
    ///
    /// Each `*_LOCKED` bit prevents the bit before it from ever changing again.
    pub struct Secbits: libc::c_ulong {
        const NOROOT = 0x1;
        const NOROOT_LOCKED = 0x2;

        const NO_SETUID_FIXUP = 0x4;
        const NO_SETUID_FIXUP_LOCKED = 0x8;

        const KEEP_CAPS = 0x10;
        const KEEP_CAPS_LOCKED = 0x20;

        const NO_CAP_AMBIENT_RAISE = 0x40;
        const NO_CAP_AMBIENT_RAISE_LOCKED = 0x80;
    }
}

/// Get the secure bits of the calling thread.
pub fn get_securebits() -> crate::Result<Secbits> {
    let f = unsafe { crate::raw_prctl(libc::PR_GET_SECUREBITS, 0, 0, 0, 0) }?;

    Ok(Secbits::from_bits_truncate(f as libc::c_ulong))
}

/// Set the secure bits of every thread in the process.
///
/// This requires `CAP_SETPCAP`, even if nothing changes.
pub fn set_securebits(flags: Secbits) -> crate::Result<()> {
    log::debug!("setting secure bits to {:?}", flags);
    crate::psx_prctl(libc::PR_SET_SECUREBITS, flags.bits(), 0, 0, 0)?;

    Ok(())
}

#[cfg(test)]
pub(crate) fn setpcap_effective() -> crate::Result<bool> {
    use crate::caps::{Flag, Set, Value};

    Set::get_proc()?.get_flag(Flag::Effective, Value::SETPCAP)
}
