use std::convert::TryInto;
use std::ffi::{CString, OsStr};
use std::os::unix::prelude::*;

use super::{min_ext_flag_size, Flag, Limits, Set};
use crate::constants::*;
use crate::{Error, Result};

#[inline]
fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(
        data[offset..offset + 4]
            .try_into()
            .unwrap_or_default(),
    )
}

fn c_path<P: AsRef<OsStr>>(path: P) -> Result<CString> {
    CString::new(path.as_ref().as_bytes()).map_err(|_| Error::from_code(libc::EINVAL))
}

fn extract_attr_or_error(data: &[u8], attr_res: isize) -> Result<Option<Set>> {
    if attr_res >= 0 {
        Ok(Some(Set::from_vfs(&data[..(attr_res as usize)])?))
    } else {
        match Error::last() {
            Error::Os(libc::ENODATA) => Ok(None),
            err => Err(err),
        }
    }
}

fn attr_result(res: libc::c_int) -> Result<()> {
    if res >= 0 {
        return Ok(());
    }

    match Error::last() {
        // Removing capabilities that were never there
        Error::Os(libc::ENODATA) => Ok(()),
        err => Err(err),
    }
}

impl Set {
    /// Get the capabilities attached to the file identified by `path`.
    ///
    /// If the file has no capabilities attached, this returns `Ok(None)`. The Effective flag of
    /// the result is either empty or the union of Permitted and Inheritable.
    pub fn get_file<P: AsRef<OsStr>>(path: P) -> Result<Option<Set>> {
        let mut data = [0; XATTR_CAPS_MAX_SIZE];
        let path = c_path(path)?;

        let ret = unsafe {
            libc::getxattr(
                path.as_ptr(),
                XATTR_NAME_CAPS.as_ptr() as *const libc::c_char,
                data.as_mut_ptr() as *mut libc::c_void,
                data.len(),
            )
        };

        extract_attr_or_error(&data, ret)
    }

    /// Get the capabilities attached to the open file identified by the file descriptor `fd`.
    ///
    /// See [`get_file()`](#method.get_file) for more information.
    pub fn get_fd(fd: RawFd) -> Result<Option<Set>> {
        let mut data = [0; XATTR_CAPS_MAX_SIZE];

        let ret = unsafe {
            libc::fgetxattr(
                fd,
                XATTR_NAME_CAPS.as_ptr() as *const libc::c_char,
                data.as_mut_ptr() as *mut libc::c_void,
                data.len(),
            )
        };

        extract_attr_or_error(&data, ret)
    }

    /// Attach `caps` to the file identified by `path`, or remove its capabilities if `caps` is
    /// `None`.
    ///
    /// This requires `CAP_SETFCAP`.
    pub fn set_file<P: AsRef<OsStr>>(path: P, caps: Option<&Set>) -> Result<()> {
        let path = c_path(path)?;

        let res = match caps {
            Some(caps) => {
                let data = caps.to_vfs()?;
                log::debug!("writing file capabilities {:?} to {:?}", caps.to_string(), path);
                unsafe {
                    libc::setxattr(
                        path.as_ptr(),
                        XATTR_NAME_CAPS.as_ptr() as *const libc::c_char,
                        data.as_ptr() as *const libc::c_void,
                        data.len(),
                        0,
                    )
                }
            }
            None => {
                log::debug!("removing file capabilities from {:?}", path);
                unsafe {
                    libc::removexattr(path.as_ptr(), XATTR_NAME_CAPS.as_ptr() as *const libc::c_char)
                }
            }
        };

        attr_result(res)
    }

    /// Attach `caps` to the open file identified by `fd`, or remove its capabilities if `caps` is
    /// `None`.
    ///
    /// See [`set_file()`](#method.set_file) for more information.
    pub fn set_fd(fd: RawFd, caps: Option<&Set>) -> Result<()> {
        let res = match caps {
            Some(caps) => {
                let data = caps.to_vfs()?;
                unsafe {
                    libc::fsetxattr(
                        fd,
                        XATTR_NAME_CAPS.as_ptr() as *const libc::c_char,
                        data.as_ptr() as *const libc::c_void,
                        data.len(),
                        0,
                    )
                }
            }
            None => unsafe {
                libc::fremovexattr(fd, XATTR_NAME_CAPS.as_ptr() as *const libc::c_char)
            },
        };

        attr_result(res)
    }

    /// From the raw data of the `security.capability` extended attribute of a file, construct a
    /// new `Set` representing the same capabilities.
    ///
    /// Values the running kernel does not support are dropped. Most users should call
    /// [`get_file()`] or [`get_fd()`]; those methods call this method internally.
    ///
    /// [`get_file()`]: #method.get_file
    /// [`get_fd()`]: #method.get_fd
    pub fn from_vfs(attrs: &[u8]) -> Result<Set> {
        let len = attrs.len();

        if len < 4 {
            return Err(Error::BadFormat);
        }

        let magic = read_u32(attrs, 0);
        let version = magic & VFS_CAP_REVISION_MASK;
        let effective = (magic & VFS_CAP_FLAGS_MASK & VFS_CAP_FLAGS_EFFECTIVE) != 0;

        let (words, rootid) = match (version, len) {
            (VFS_CAP_REVISION_1, XATTR_CAPS_SZ_1) => (1, None),
            (VFS_CAP_REVISION_2, XATTR_CAPS_SZ_2) => (2, None),
            (VFS_CAP_REVISION_3, XATTR_CAPS_SZ_3) => (2, Some(read_u32(attrs, 20))),
            _ => return Err(Error::BadFormat),
        };

        let set = Set::new();
        let max = set.limits.max_values();
        {
            let mut inner = set.inner.write();
            for (w, word) in inner.flat.iter_mut().enumerate().take(words) {
                let valid = Limits::word_mask(w, max);
                let permitted = read_u32(attrs, 4 + 8 * w) & valid;
                let inheritable = read_u32(attrs, 8 + 8 * w) & valid;

                word[Flag::Permitted as usize] = permitted;
                word[Flag::Inheritable as usize] = inheritable;
                if effective {
                    word[Flag::Effective as usize] = permitted | inheritable;
                }
            }
            inner.ns_root = rootid;
        }

        Ok(set)
    }

    /// Encode this set as the raw data of a `security.capability` extended attribute.
    ///
    /// Files only carry a single Effective bit, so the Effective flag must be either empty or
    /// exactly the union of Permitted and Inheritable; otherwise this fails with
    /// [`Error::BadValue`].
    ///
    /// Sets bound to a namespace owner are written as revision 3. Otherwise revision 2 is used,
    /// unless every value fits in one word and [`min_ext_flag_size()`] allows the short
    /// revision 1 form.
    #[inline]
    pub fn to_vfs(&self) -> Result<Vec<u8>> {
        self.to_vfs_with_floor(min_ext_flag_size())
    }

    fn to_vfs_with_floor(&self, floor: usize) -> Result<Vec<u8>> {
        let inner = self.inner.read();

        // Files only store whether Effective is raised at all
        let effective = inner.flat.iter().any(|word| word[Flag::Effective as usize] != 0);
        if effective
            && inner.flat.iter().any(|word| {
                word[Flag::Effective as usize]
                    != word[Flag::Permitted as usize] | word[Flag::Inheritable as usize]
            })
        {
            return Err(Error::BadValue);
        }

        let high = inner.flat.iter().skip(1).any(|word| word.iter().any(|b| *b != 0));

        let (revision, size, words) = if inner.ns_root.is_some() {
            (VFS_CAP_REVISION_3, XATTR_CAPS_SZ_3, 2)
        } else if high || (self.limits.words() > 1 && floor > 4) {
            (VFS_CAP_REVISION_2, XATTR_CAPS_SZ_2, 2)
        } else {
            (VFS_CAP_REVISION_1, XATTR_CAPS_SZ_1, 1)
        };

        let mut magic = revision;
        if effective {
            magic |= VFS_CAP_FLAGS_EFFECTIVE;
        }

        let mut data = Vec::with_capacity(size);
        data.extend_from_slice(&magic.to_le_bytes());
        for w in 0..words {
            let word = inner.flat.get(w).copied().unwrap_or_default();
            data.extend_from_slice(&word[Flag::Permitted as usize].to_le_bytes());
            data.extend_from_slice(&word[Flag::Inheritable as usize].to_le_bytes());
        }
        if let Some(rootid) = inner.ns_root {
            data.extend_from_slice(&rootid.to_le_bytes());
        }

        debug_assert_eq!(data.len(), size);
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::super::{Value, DEFAULT_MIN_EXT_FLAG_SIZE};
    use super::*;

    #[test]
    fn test_file_get() {
        let current_exe = std::env::current_exe().unwrap();

        Set::get_file(&current_exe).unwrap();

        let f = std::fs::File::open(&current_exe).unwrap();
        Set::get_fd(f.as_raw_fd()).unwrap();

        assert_eq!(
            Set::get_file("/nonexistent/file").unwrap_err(),
            Error::Os(libc::ENOENT)
        );
        assert_eq!(
            Set::get_file("bad\0path").unwrap_err(),
            Error::Os(libc::EINVAL)
        );
    }

    #[test]
    fn test_file_set() {
        let path = std::env::temp_dir().join(format!("capkit-file-{}", std::process::id()));
        let f = std::fs::File::create(&path).unwrap();

        let caps = Set::from_str("cap_net_raw=ep").unwrap();
        match Set::set_file(&path, Some(&caps)) {
            Ok(()) => {
                assert_eq!(Set::get_file(&path).unwrap(), Some(caps.clone()));
                assert_eq!(Set::get_fd(f.as_raw_fd()).unwrap(), Some(caps));

                Set::set_fd(f.as_raw_fd(), None).unwrap();
                assert_eq!(Set::get_file(&path).unwrap(), None);
                // Already gone
                Set::set_file(&path, None).unwrap();
            }
            Err(e) => assert!(
                matches!(e, Error::Os(libc::EPERM) | Error::Os(libc::ENOTSUP)),
                "{}",
                e
            ),
        }

        // Checked before touching the file
        let bad = Set::from_str("cap_net_raw=p cap_chown=ep").unwrap();
        assert_eq!(Set::set_file(&path, Some(&bad)), Err(Error::BadValue));

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_from_vfs() {
        assert_eq!(Set::from_vfs(b"").unwrap_err(), Error::BadFormat);
        assert_eq!(Set::from_vfs(b"\x00\x00\x00").unwrap_err(), Error::BadFormat);
        assert_eq!(
            Set::from_vfs(b"\x00\x00\x00\x00").unwrap_err(),
            Error::BadFormat
        );
        // Revision 2 header with a revision 1 length
        assert_eq!(
            Set::from_vfs(b"\x00\x00\x00\x02\x01\x00\x00\x00\x01\x00\x00\x00").unwrap_err(),
            Error::BadFormat
        );

        // Version 1
        let set = Set::from_vfs(b"\x00\x00\x00\x01\x01\x00\x00\x00\x01\x00\x00\x00").unwrap();
        assert_eq!(set.to_string(), "cap_chown=pi");
        assert_eq!(set.ns_owner(), None);

        // Version 2 (real example, from Wireshark's /usr/bin/dumpcap)
        let set = Set::from_vfs(
            b"\x01\x00\x00\x02\x020\x00\x00\x020\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00",
        )
        .unwrap();
        assert_eq!(
            set.to_string(),
            "cap_dac_override,cap_net_admin,cap_net_raw=epi"
        );
        assert_eq!(set.ns_owner(), None);

        // Version 3
        let set = Set::from_vfs(b"\x01\x00\x00\x03\x020\x00\x00\x020\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\xe8\x03\x00\x00").unwrap();
        assert_eq!(
            set.to_string(),
            "cap_dac_override,cap_net_admin,cap_net_raw=epi"
        );
        assert_eq!(set.ns_owner(), Some(1000));
    }

    #[test]
    fn test_from_vfs_unsupported_bits() {
        // Every bit raised; only the supported values survive
        let mut data = vec![0x00, 0x00, 0x00, 0x02];
        data.extend_from_slice(&[0xff; 16]);

        let set = Set::from_vfs(&data).unwrap();
        Set::validate_bits(set.limits, &set.inner.read().flat).unwrap();
        assert_eq!(set, Set::from_str("all=pi").unwrap());
    }

    #[test]
    fn test_to_vfs() {
        let set = Set::from_str("cap_chown=pi").unwrap();

        let short = set.to_vfs_with_floor(0).unwrap();
        assert_eq!(short, b"\x00\x00\x00\x01\x01\x00\x00\x00\x01\x00\x00\x00");

        let data = set.to_vfs_with_floor(DEFAULT_MIN_EXT_FLAG_SIZE).unwrap();
        assert_eq!(data.len(), XATTR_CAPS_SZ_2);
        assert_eq!(Set::from_vfs(&data).unwrap(), set);

        let set = Set::from_str("cap_dac_override,cap_net_admin,cap_net_raw=epi").unwrap();
        assert_eq!(
            set.to_vfs().unwrap(),
            b"\x01\x00\x00\x02\x020\x00\x00\x020\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00"
        );

        set.set_ns_owner(Some(1000));
        let data = set.to_vfs().unwrap();
        assert_eq!(
            data,
            &b"\x01\x00\x00\x03\x020\x00\x00\x020\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\xe8\x03\x00\x00"[..]
        );
        assert_eq!(Set::from_vfs(&data).unwrap().ns_owner(), Some(1000));
    }

    #[test]
    fn test_to_vfs_high_word() {
        let set = Set::new();
        set.set_flag(Flag::Permitted, true, &[Value::MAC_ADMIN]).unwrap();

        let data = set.to_vfs().unwrap();
        assert_eq!(data.len(), XATTR_CAPS_SZ_2);
        assert_eq!(read_u32(&data, 12), 1 << (Value::MAC_ADMIN.raw() - 32));
        assert_eq!(Set::from_vfs(&data).unwrap(), set);
    }

    #[test]
    fn test_to_vfs_effective() {
        // Effective must be all or nothing
        let set = Set::from_str("cap_chown=ep cap_kill=p").unwrap();
        assert_eq!(set.to_vfs(), Err(Error::BadValue));

        let set = Set::from_str("cap_chown=ep cap_kill=ie").unwrap();
        let data = set.to_vfs().unwrap();
        assert_eq!(read_u32(&data, 0) & VFS_CAP_FLAGS_EFFECTIVE, 1);
        assert_eq!(Set::from_vfs(&data).unwrap(), set);

        let set = Set::from_str("cap_chown=p").unwrap();
        let data = set.to_vfs().unwrap();
        assert_eq!(read_u32(&data, 0) & VFS_CAP_FLAGS_EFFECTIVE, 0);
    }
}
