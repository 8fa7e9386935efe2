use once_cell::sync::OnceCell;

use super::NAMED;

static LIMITS: OnceCell<Limits> = OnceCell::new();

/// Process-wide facts about the running kernel's capability support.
///
/// These are discovered once (the first time any thread needs them) and never change afterwards.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Limits {
    max_values: u32,
    words: usize,
    version: u32,
}

impl Limits {
    /// Get the limits of the running kernel, probing them on first use.
    #[inline]
    pub fn get() -> &'static Limits {
        LIMITS.get_or_init(Self::probe)
    }

    /// The number of capability values supported by the running kernel.
    #[inline]
    pub fn max_values(&self) -> u32 {
        self.max_values
    }

    /// The number of 32-bit words in each capability vector.
    #[inline]
    pub fn words(&self) -> usize {
        self.words
    }

    /// The `capget()`/`capset()` ABI version preferred by the kernel.
    #[inline]
    pub fn kernel_version(&self) -> u32 {
        self.version
    }

    /// Values below this bound have canonical names.
    #[inline]
    pub(crate) fn named(&self) -> u32 {
        NAMED.min(self.max_values)
    }

    #[cfg(test)]
    pub(crate) fn with_bounds(max_values: u32, words: usize) -> Self {
        assert!(max_values as usize <= words * 32);
        Self {
            max_values,
            words,
            version: crate::constants::_LINUX_CAPABILITY_VERSION_3,
        }
    }

    /// Bits of word `w` that hold values below `bound`.
    pub(crate) fn word_mask(w: usize, bound: u32) -> u32 {
        let lo = (w * 32) as u32;
        if bound <= lo {
            0
        } else if bound - lo >= 32 {
            !0
        } else {
            (1 << (bound - lo)) - 1
        }
    }

    fn probe() -> Self {
        let version = probe_version();
        let words = match version {
            crate::constants::_LINUX_CAPABILITY_VERSION_1 => 1,
            _ => 2,
        };

        let max_values = probe_max_values(words);

        log::debug!(
            "capability limits: version={:#x} words={} max_values={}",
            version,
            words,
            max_values
        );

        Self {
            max_values,
            words,
            version,
        }
    }
}

/// Ask the kernel which `capget()` ABI version it prefers.
fn probe_version() -> u32 {
    let mut header = crate::externs::cap_user_header_t {
        version: 0,
        pid: 0,
    };

    // With an unknown version, the kernel fills in its preferred version and fails with EINVAL.
    unsafe {
        crate::externs::capget(&mut header, std::ptr::null_mut());
    }

    match header.version {
        crate::constants::_LINUX_CAPABILITY_VERSION_1
        | crate::constants::_LINUX_CAPABILITY_VERSION_2
        | crate::constants::_LINUX_CAPABILITY_VERSION_3 => header.version,
        _ => crate::constants::_LINUX_CAPABILITY_VERSION_3,
    }
}

#[inline]
fn bound_supported(raw: u32) -> bool {
    unsafe { crate::raw_prctl_opt(libc::PR_CAPBSET_READ, raw as libc::c_ulong, 0, 0, 0) }
        .is_some()
}

/// Find the number of supported values with a binary search over the bounding set.
fn probe_max_values(words: usize) -> u32 {
    let limit = (words * 32) as u32;

    if !bound_supported(0) {
        // No bounding set to probe; trust the name table.
        return NAMED.min(limit);
    }

    let mut min = 0;
    let mut max = limit - 1;

    while min != max {
        // This basically does `mid = ceil((min + max) / 2)`.
        // If we don't do ceiling division, the way binary search works, we'll get stuck at
        // `max = min + 1` forever.
        let sum = min + max;
        let mid = (sum >> 1) + (sum & 1);

        if bound_supported(mid) {
            min = mid;
        } else {
            max = mid - 1;
        }

        debug_assert!(max >= min);
    }

    min + 1
}

/// Get the number of capability values supported by the running kernel.
///
/// The most recently added capability is `Value::new(max_bits() - 1)`.
#[inline]
pub fn max_bits() -> u32 {
    Limits::get().max_values()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_stable() {
        let a = Limits::get();
        let b = Limits::get();
        assert!(std::ptr::eq(a, b));
        assert!(a.max_values() as usize <= a.words() * 32);
        assert!(a.named() <= a.max_values());
    }

    #[test]
    fn test_probe_matches_bounding() {
        let limits = Limits::get();
        for raw in 0..limits.max_values() {
            assert!(bound_supported(raw));
        }
        assert!(!bound_supported(limits.max_values()));
    }

    #[test]
    fn test_word_mask() {
        assert_eq!(Limits::word_mask(0, 0), 0);
        assert_eq!(Limits::word_mask(0, 5), 0x1f);
        assert_eq!(Limits::word_mask(0, 41), !0);
        assert_eq!(Limits::word_mask(1, 41), 0x1ff);
        assert_eq!(Limits::word_mask(1, 64), !0);
        assert_eq!(Limits::word_mask(1, 32), 0);
    }

    #[test]
    fn test_racing_init() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| Limits::get() as *const Limits as usize))
            .collect();

        let first = Limits::get() as *const Limits as usize;
        for h in handles {
            assert_eq!(h.join().unwrap(), first);
        }
    }
}
