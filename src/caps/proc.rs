use super::{Flag, Limits, Set};
use crate::externs::{cap_user_data_t, cap_user_header_t};
use crate::Result;

impl Set {
    /// Get the capability state of the calling thread.
    ///
    /// This is equivalent to `Set::get_pid(0)`.
    #[inline]
    pub fn get_proc() -> Result<Set> {
        Self::get_pid(0)
    }

    /// Get the capability state of the process (or thread) with the given PID (or TID).
    ///
    /// If `pid` is 0, this method gets the capability state of the calling thread.
    pub fn get_pid(pid: libc::pid_t) -> Result<Set> {
        let limits = Limits::get();

        let mut header = cap_user_header_t {
            version: limits.kernel_version(),
            pid: pid as libc::c_int,
        };
        let mut raw_dat = [cap_user_data_t::default(); 2];

        if unsafe { crate::externs::capget(&mut header, raw_dat.as_mut_ptr()) } < 0 {
            return Err(crate::Error::last());
        }

        let set = Set::with_limits(limits);
        {
            let mut inner = set.inner.write();
            for (word, dat) in inner.flat.iter_mut().zip(raw_dat.iter()) {
                word[Flag::Effective as usize] = dat.effective;
                word[Flag::Permitted as usize] = dat.permitted;
                word[Flag::Inheritable as usize] = dat.inheritable;
            }
        }

        Ok(set)
    }

    /// Make this set the capability state of every thread in the process.
    ///
    /// The kernel only allows the Permitted and Inheritable flags to shrink (unless `CAP_SETPCAP`
    /// is raised, which allows Inheritable to grow within the bounding set), and Effective must be
    /// a subset of Permitted. Violations are reported as `EPERM`.
    pub fn set_proc(&self) -> Result<()> {
        let mut header = cap_user_header_t {
            version: self.limits.kernel_version(),
            pid: 0,
        };

        let mut raw_dat = [cap_user_data_t::default(); 2];
        {
            let inner = self.inner.read();
            for (dat, word) in raw_dat.iter_mut().zip(inner.flat.iter()) {
                dat.effective = word[Flag::Effective as usize];
                dat.permitted = word[Flag::Permitted as usize];
                dat.inheritable = word[Flag::Inheritable as usize];
            }
        }

        log::debug!("setting process capabilities to {:?}", self.to_string());

        // SAFETY: both pointers stay valid until every thread has made the call.
        unsafe {
            crate::psx::syscall3(
                libc::SYS_capset,
                &mut header as *mut cap_user_header_t as libc::c_long,
                raw_dat.as_ptr() as libc::c_long,
                0,
            )
        }?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::Value;
    use super::*;

    #[test]
    fn test_getset_current() {
        let set = Set::get_proc().unwrap();
        assert_eq!(set, Set::get_pid(0).unwrap());
        assert_eq!(
            set,
            Set::get_pid(std::process::id() as libc::pid_t).unwrap()
        );
        set.set_proc().unwrap();
        assert_eq!(set, Set::get_proc().unwrap());
    }

    #[test]
    fn test_get_bad_pid() {
        assert_eq!(
            Set::get_pid(-1).unwrap_err().code(),
            Some(libc::EINVAL)
        );
        assert_eq!(
            Set::get_pid(libc::pid_t::MAX).unwrap_err().code(),
            Some(libc::ESRCH)
        );
    }

    #[test]
    fn test_effective_not_permitted() {
        let set = Set::get_proc().unwrap();
        let value = Value::iter()
            .find(|v| !set.get_flag(Flag::Permitted, *v).unwrap());

        // Only testable if something is not permitted (i.e. we are not fully privileged)
        if let Some(value) = value {
            let bad = set.clone();
            bad.set_flag(Flag::Effective, true, &[value]).unwrap();
            bad.set_flag(Flag::Permitted, true, &[value]).unwrap();
            assert_eq!(bad.set_proc().unwrap_err().code(), Some(libc::EPERM));
            assert_eq!(Set::get_proc().unwrap(), set);
        }
    }

    #[test]
    fn test_proc_matches_limits() {
        let set = Set::get_proc().unwrap();
        Set::validate_bits(set.limits, &set.inner.read().flat).unwrap();
    }
}
