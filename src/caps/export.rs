use std::sync::atomic::{AtomicUsize, Ordering};

use super::{Limits, Set};
use crate::constants::{CAP_EXT_HEADER_SIZE, CAP_EXT_MAGIC};
use crate::{Error, Result};

/// The default minimum number of bytes exported per flag.
///
/// Exports have always been at least this long, so older readers that expect a fixed-size
/// payload keep working.
pub const DEFAULT_MIN_EXT_FLAG_SIZE: usize = 8;

static MIN_EXT_FLAG_SIZE: AtomicUsize = AtomicUsize::new(DEFAULT_MIN_EXT_FLAG_SIZE);

/// Get the process-wide minimum number of bytes [`Set::export()`] writes per flag.
#[inline]
pub fn min_ext_flag_size() -> usize {
    MIN_EXT_FLAG_SIZE.load(Ordering::Relaxed)
}

/// Set the process-wide minimum number of bytes [`Set::export()`] writes per flag.
///
/// Setting this to 0 makes exports as short as possible. Values above 255 are clamped.
#[inline]
pub fn set_min_ext_flag_size(size: usize) {
    MIN_EXT_FLAG_SIZE.store(size.min(u8::MAX as usize), Ordering::Relaxed);
}

/// The number of bytes per flag needed to hold every raised bit of `flat`.
fn used_bytes(flat: &[[u32; 3]]) -> usize {
    let mut used = 0;

    for (w, word) in flat.iter().enumerate() {
        let val = word[0] | word[1] | word[2];
        if val != 0 {
            used = w * 4 + (4 - val.leading_zeros() as usize / 8);
        }
    }

    used
}

impl Set {
    /// Export this set in the portable external format, using the process-wide minimum flag size.
    ///
    /// The format is a 4-byte magic number, one byte giving the number of bytes per flag, then
    /// for each of those bytes (least significant first) one byte each of the Effective, Permitted
    /// and Inheritable flags.
    ///
    /// See [`set_min_ext_flag_size()`].
    #[inline]
    pub fn export(&self) -> Vec<u8> {
        self.export_with_floor(min_ext_flag_size())
    }

    /// Export this set in the portable external format, writing at least `floor` bytes per flag.
    ///
    /// An empty set is always exported with zero bytes per flag.
    pub fn export_with_floor(&self, floor: usize) -> Vec<u8> {
        let inner = self.inner.read();

        let mut len = used_bytes(&inner.flat);
        if len != 0 && len < floor {
            len = floor.min(u8::MAX as usize);
        }

        let mut data = Vec::with_capacity(CAP_EXT_HEADER_SIZE + 3 * len);
        data.extend_from_slice(&CAP_EXT_MAGIC);
        data.push(len as u8);

        for j in 0..len {
            let word = inner.flat.get(j / 4).copied().unwrap_or_default();
            for bits in word.iter() {
                data.push((bits >> (8 * (j % 4))) as u8);
            }
        }

        data
    }

    /// Import a set from the portable external format produced by [`export()`](#method.export).
    ///
    /// Fails with [`Error::BadFormat`] if the magic number is wrong or the length does not match
    /// the header, and with [`Error::BadValue`] if the payload raises values the running kernel
    /// does not support.
    #[inline]
    pub fn import(data: &[u8]) -> Result<Set> {
        Self::import_with_limits(data, Limits::get())
    }

    pub(crate) fn import_with_limits(data: &[u8], limits: &'static Limits) -> Result<Set> {
        if data.len() < CAP_EXT_HEADER_SIZE || data[..CAP_EXT_MAGIC.len()] != CAP_EXT_MAGIC {
            return Err(Error::BadFormat);
        }

        let len = data[CAP_EXT_MAGIC.len()] as usize;
        let body = &data[CAP_EXT_HEADER_SIZE..];
        if body.len() != 3 * len {
            return Err(Error::BadFormat);
        }

        let mut flat = vec![[0u32; 3]; limits.words()];
        for (j, bytes) in body.chunks_exact(3).enumerate() {
            match flat.get_mut(j / 4) {
                Some(word) => {
                    for (bits, byte) in word.iter_mut().zip(bytes) {
                        *bits |= (*byte as u32) << (8 * (j % 4));
                    }
                }
                None if bytes.iter().all(|b| *b == 0) => (),
                None => return Err(Error::BadValue),
            }
        }

        Set::validate_bits(limits, &flat)?;

        let set = Set::with_limits(limits);
        set.inner.write().flat = flat;
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::super::{Flag, Value};
    use super::*;

    fn hex(data: &[u8]) -> String {
        data.iter().map(|b| format!("{:02x}", b)).collect()
    }

    #[test]
    fn test_export_empty() {
        let set = Set::new();
        let data = set.export();
        assert_eq!(data.len(), 5);
        assert_eq!(hex(&data), "90c2015100");

        let back = Set::import(&data).unwrap();
        assert_eq!(back, set);
        assert_eq!(back.to_string(), set.to_string());
    }

    #[test]
    fn test_export_setuid() {
        let set = Set::from_str("cap_setuid=ep").unwrap();

        assert_eq!(
            hex(&set.export_with_floor(DEFAULT_MIN_EXT_FLAG_SIZE)),
            "90c2015108808000000000000000000000000000000000000000000000"
        );
        assert_eq!(hex(&set.export_with_floor(0)), "90c2015101808000");
    }

    #[test]
    fn test_import_setuid() {
        let set = Set::import(&[0x90, 0xc2, 0x01, 0x51, 0x01, 0x80, 0x80, 0x00]).unwrap();
        assert_eq!(set.to_string(), "cap_setuid=ep");
        assert!(set.get_flag(Flag::Effective, Value::SETUID).unwrap());
        assert!(set.get_flag(Flag::Permitted, Value::SETUID).unwrap());
        assert!(!set.get_flag(Flag::Inheritable, Value::SETUID).unwrap());
    }

    #[test]
    fn test_export_high_bits() {
        let set = Set::new();
        set.set_flag(Flag::Inheritable, true, &[Value::MAC_OVERRIDE])
            .unwrap();

        // Value 32 lives in the fifth byte
        let data = set.export_with_floor(0);
        assert_eq!(data[4], 5);
        assert_eq!(data.len(), 5 + 15);
        assert_eq!(&data[5 + 12..], &[0, 0, 1]);

        assert_eq!(Set::import(&data).unwrap(), set);
        assert_eq!(Set::import(&set.export()).unwrap(), set);
    }

    #[test]
    fn test_import_bad() {
        assert_eq!(Set::import(b"").unwrap_err(), Error::BadFormat);
        assert_eq!(
            Set::import(&[0x90, 0xc2, 0x01, 0x51]).unwrap_err(),
            Error::BadFormat
        );
        // Wrong magic
        assert_eq!(
            Set::import(&[0x90, 0xc2, 0x01, 0x52, 0x00]).unwrap_err(),
            Error::BadFormat
        );
        // Truncated
        assert_eq!(
            Set::import(&[0x90, 0xc2, 0x01, 0x51, 0x02, 0x80, 0x80, 0x00]).unwrap_err(),
            Error::BadFormat
        );
        // Trailing garbage
        assert_eq!(
            Set::import(&[0x90, 0xc2, 0x01, 0x51, 0x01, 0x80, 0x80, 0x00, 0x00]).unwrap_err(),
            Error::BadFormat
        );
    }

    #[test]
    fn test_import_out_of_range() {
        let limits: &'static Limits = Box::leak(Box::new(Limits::with_bounds(10, 1)));

        // Bit 12 is beyond maxValues
        assert_eq!(
            Set::import_with_limits(&[0x90, 0xc2, 0x01, 0x51, 0x02, 0, 0, 0, 0x10, 0, 0], limits)
                .unwrap_err(),
            Error::BadValue
        );

        // Zero padding past the last word is fine, anything else is not
        let mut data = vec![0x90, 0xc2, 0x01, 0x51, 0x08];
        data.extend_from_slice(&[0x01, 0x00, 0x00]);
        data.extend_from_slice(&[0; 21]);
        let set = Set::import_with_limits(&data, limits).unwrap();
        assert_eq!(set.inner.read().flat, vec![[1, 0, 0]]);

        *data.last_mut().unwrap() = 1;
        assert_eq!(
            Set::import_with_limits(&data, limits).unwrap_err(),
            Error::BadValue
        );
    }

    #[test]
    fn test_floor_setting() {
        assert_eq!(min_ext_flag_size(), DEFAULT_MIN_EXT_FLAG_SIZE);

        set_min_ext_flag_size(1000);
        assert_eq!(min_ext_flag_size(), 255);

        set_min_ext_flag_size(DEFAULT_MIN_EXT_FLAG_SIZE);
        assert_eq!(min_ext_flag_size(), DEFAULT_MIN_EXT_FLAG_SIZE);
    }

    #[test]
    fn test_used_bytes() {
        assert_eq!(used_bytes(&[[0; 3], [0; 3]]), 0);
        assert_eq!(used_bytes(&[[0x80, 0, 0], [0; 3]]), 1);
        assert_eq!(used_bytes(&[[0, 0x100, 0], [0; 3]]), 2);
        assert_eq!(used_bytes(&[[0, 0, 0x8000_0000], [0; 3]]), 4);
        assert_eq!(used_bytes(&[[0; 3], [0x1ff, 0, 0]]), 6);
    }
}
