use super::{Flag, Set, Value};
use crate::psx;

macro_rules! attr_group {
    (#![$attr:meta] $($stmts:item)*) => {
        $(
            #[$attr]
            $stmts
        )*
    }
}

attr_group! {
    #![cfg(all(
        target_pointer_width = "32",
        any(target_arch = "arm", target_arch = "sparc", target_arch = "x86")
    ))]

    const SYS_SETUID: libc::c_long = libc::SYS_setuid32;
    const SYS_SETGID: libc::c_long = libc::SYS_setgid32;
    const SYS_SETGROUPS: libc::c_long = libc::SYS_setgroups32;
}

attr_group! {
    #![cfg(not(all(
        target_pointer_width = "32",
        any(target_arch = "arm", target_arch = "sparc", target_arch = "x86")
    )))]

    const SYS_SETUID: libc::c_long = libc::SYS_setuid;
    const SYS_SETGID: libc::c_long = libc::SYS_setgid;
    const SYS_SETGROUPS: libc::c_long = libc::SYS_setgroups;
}

/// Keeps one value raised in the Effective flag of the process.
///
/// Dropping (or committing) the guard lowers the *entire* Effective flag of `set` and applies
/// `set` to the process, so any other changes made to `set` in the meantime take effect too.
pub(crate) struct RaisedEffective<'a> {
    set: &'a Set,
    armed: bool,
}

impl<'a> RaisedEffective<'a> {
    /// Raise `value` in the Effective flag of `set` and apply it to the process.
    pub(crate) fn raise(set: &'a Set, value: Value) -> crate::Result<Self> {
        let guard = Self { set, armed: true };

        set.set_flag(Flag::Effective, true, &[value])?;
        set.set_proc()?;

        Ok(guard)
    }

    /// Lower the Effective flag and apply the set, reporting any failure.
    pub(crate) fn commit(mut self) -> crate::Result<()> {
        self.armed = false;
        self.lower()
    }

    fn lower(&self) -> crate::Result<()> {
        self.set.clear_flag(Flag::Effective);
        self.set.set_proc()
    }
}

impl Drop for RaisedEffective<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.lower() {
                log::warn!("unable to lower effective capabilities: {}", e);
            }
        }
    }
}

/// Set every UID of every thread (real, effective, saved and filesystem) to `uid`, without losing
/// the Permitted capabilities of the process.
///
/// `CAP_SETUID` is raised for the duration of the call; the Effective flag is empty afterwards.
pub fn set_uid(uid: libc::uid_t) -> crate::Result<()> {
    let caps = Set::get_proc()?;
    let guard = RaisedEffective::raise(&caps, Value::SETUID)?;

    // This may fail if the flag is locked; setuid() still works, it just drops Permitted.
    let kept = crate::prctl::set_keepcaps(true);
    if let Err(e) = &kept {
        log::debug!("unable to raise keep-caps: {}", e);
    }

    log::debug!("setting uid to {}", uid);
    let res = unsafe { psx::syscall3(SYS_SETUID, uid as libc::c_long, 0, 0) };

    if kept.is_ok() {
        if let Err(e) = crate::prctl::set_keepcaps(false) {
            log::warn!("unable to lower keep-caps: {}", e);
        }
    }

    res?;
    guard.commit()
}

/// Set every GID of every thread to `gid`, and replace the supplementary groups with `groups`.
///
/// `CAP_SETGID` is raised for the duration of the call; the Effective flag is empty afterwards.
pub fn set_groups(gid: libc::gid_t, groups: &[libc::gid_t]) -> crate::Result<()> {
    let caps = Set::get_proc()?;
    let guard = RaisedEffective::raise(&caps, Value::SETGID)?;

    log::debug!("setting gid to {} and groups to {:?}", gid, groups);

    unsafe { psx::syscall3(SYS_SETGID, gid as libc::c_long, 0, 0) }?;
    unsafe {
        psx::syscall3(
            SYS_SETGROUPS,
            groups.len() as libc::c_long,
            groups.as_ptr() as libc::c_long,
            0,
        )
    }?;

    guard.commit()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn permitted(value: Value) -> bool {
        Set::get_proc()
            .unwrap()
            .get_flag(Flag::Permitted, value)
            .unwrap()
    }

    /// Only Effective may have changed; put it back.
    fn assert_unchanged(before: &Set) {
        let diff = Set::get_proc().unwrap().cf(before);
        assert!(!diff.differs(Flag::Permitted));
        assert!(!diff.differs(Flag::Inheritable));
        before.set_proc().unwrap();
    }

    #[test]
    fn test_set_uid_unprivileged() {
        let _guard = crate::PROCESS_FLAGS_TEST_LOCK.lock();

        // Never change the IDs of the test process
        if permitted(Value::SETUID) {
            return;
        }

        let before = Set::get_proc().unwrap();
        let keepcaps = crate::prctl::get_keepcaps().unwrap();

        assert_eq!(set_uid(0).unwrap_err().code(), Some(libc::EPERM));
        assert_unchanged(&before);
        assert_eq!(crate::prctl::get_keepcaps().unwrap(), keepcaps);
    }

    #[test]
    fn test_set_groups_unprivileged() {
        let _guard = crate::PROCESS_FLAGS_TEST_LOCK.lock();

        if permitted(Value::SETGID) {
            return;
        }

        let before = Set::get_proc().unwrap();
        assert_eq!(set_groups(0, &[]).unwrap_err().code(), Some(libc::EPERM));
        assert_unchanged(&before);
    }

    #[test]
    fn test_set_uid_keeps_permitted() {
        let status = crate::testutil::in_child(|| {
            if !permitted(Value::SETUID) {
                return crate::testutil::SKIPPED;
            }
            crate::prctl::set_keepcaps(false).unwrap();

            let before = Set::get_proc().unwrap();
            let other = crate::testutil::Observer::spawn(|| unsafe {
                (libc::getuid(), libc::geteuid(), Set::get_proc().unwrap())
            });

            set_uid(1234).unwrap();

            unsafe {
                assert_eq!(libc::getuid(), 1234);
                assert_eq!(libc::geteuid(), 1234);
            }
            assert!(!crate::prctl::get_keepcaps().unwrap());

            let after = Set::get_proc().unwrap();
            assert!(!after.cf(&before).differs(Flag::Permitted));
            assert!(after.get_flag(Flag::Permitted, Value::SETUID).unwrap());
            for value in Value::iter() {
                assert!(!after.get_flag(Flag::Effective, value).unwrap());
            }

            let (uid, euid, other_caps) = other.observe();
            assert_eq!((uid, euid), (1234, 1234));
            assert_eq!(other_caps, after);
            0
        });

        crate::testutil::assert_passed(status);
    }

    #[test]
    fn test_set_groups_all_threads() {
        let status = crate::testutil::in_child(|| {
            if !permitted(Value::SETGID) {
                return crate::testutil::SKIPPED;
            }

            fn groups() -> Vec<libc::gid_t> {
                let mut groups = vec![0; 16];
                let n = unsafe { libc::getgroups(groups.len() as _, groups.as_mut_ptr()) };
                assert!(n >= 0);
                groups.truncate(n as usize);
                groups.sort_unstable();
                groups
            }

            let other = crate::testutil::Observer::spawn(|| (unsafe { libc::getgid() }, groups()));

            set_groups(4321, &[4321, 4322]).unwrap();

            assert_eq!(unsafe { libc::getgid() }, 4321);
            assert_eq!(unsafe { libc::getegid() }, 4321);
            assert_eq!(groups(), [4321, 4322]);
            assert!(!Set::get_proc()
                .unwrap()
                .get_flag(Flag::Effective, Value::SETGID)
                .unwrap());

            assert_eq!(other.observe(), (4321, vec![4321, 4322]));
            0
        });

        crate::testutil::assert_passed(status);
    }

    #[test]
    fn test_raised_effective_setpcap() {
        let _guard = crate::PROCESS_FLAGS_TEST_LOCK.lock();

        let caps = Set::get_proc().unwrap();
        if !caps.get_flag(Flag::Permitted, Value::SETPCAP).unwrap() {
            assert_eq!(
                RaisedEffective::raise(&caps, Value::SETPCAP)
                    .err()
                    .and_then(|e| e.code()),
                Some(libc::EPERM)
            );
            return;
        }

        let before = caps.clone();
        let guard = RaisedEffective::raise(&caps, Value::SETPCAP).unwrap();
        assert!(crate::prctl::setpcap_effective().unwrap());
        guard.commit().unwrap();

        let after = Set::get_proc().unwrap();
        assert!(after.get_flag(Flag::Permitted, Value::SETPCAP).unwrap());
        for value in Value::iter() {
            assert!(!after.get_flag(Flag::Effective, value).unwrap());
        }
        assert_unchanged(&before);
    }
}
