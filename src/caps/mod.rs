use std::fmt;

mod convenience;
mod export;
mod file;
mod iab;
mod limits;
mod mode;
mod proc;
mod set;
mod text;

pub mod ambient;
pub mod bounding;
pub use convenience::{set_groups, set_uid};
pub use export::{min_ext_flag_size, set_min_ext_flag_size, DEFAULT_MIN_EXT_FLAG_SIZE};
pub use iab::{Iab, IabDiff, IabVector};
pub use limits::{max_bits, Limits};
pub use mode::{Mode, ProcState};
pub use set::{Diff, Set};

/// A capability value.
///
/// Values below [`max_bits()`] are valid on the running kernel. Values that this library has a
/// name for are available as associated constants (e.g. [`Value::CHOWN`]); newer values the
/// kernel supports but this library does not know about are still usable by number.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Value(u32);

macro_rules! values {
    ($($name:ident = $val:expr, $text:expr;)*) => {
        impl Value {
            $(pub const $name: Value = Value($val);)*
        }

        static NAMES: &[(&str, Value)] = &[$(($text, Value::$name),)*];
    };
}

values! {
    CHOWN = 0, "cap_chown";
    DAC_OVERRIDE = 1, "cap_dac_override";
    DAC_READ_SEARCH = 2, "cap_dac_read_search";
    FOWNER = 3, "cap_fowner";
    FSETID = 4, "cap_fsetid";
    KILL = 5, "cap_kill";
    SETGID = 6, "cap_setgid";
    SETUID = 7, "cap_setuid";
    SETPCAP = 8, "cap_setpcap";
    LINUX_IMMUTABLE = 9, "cap_linux_immutable";
    NET_BIND_SERVICE = 10, "cap_net_bind_service";
    NET_BROADCAST = 11, "cap_net_broadcast";
    NET_ADMIN = 12, "cap_net_admin";
    NET_RAW = 13, "cap_net_raw";
    IPC_LOCK = 14, "cap_ipc_lock";
    IPC_OWNER = 15, "cap_ipc_owner";
    SYS_MODULE = 16, "cap_sys_module";
    SYS_RAWIO = 17, "cap_sys_rawio";
    SYS_CHROOT = 18, "cap_sys_chroot";
    SYS_PTRACE = 19, "cap_sys_ptrace";
    SYS_PACCT = 20, "cap_sys_pacct";
    SYS_ADMIN = 21, "cap_sys_admin";
    SYS_BOOT = 22, "cap_sys_boot";
    SYS_NICE = 23, "cap_sys_nice";
    SYS_RESOURCE = 24, "cap_sys_resource";
    SYS_TIME = 25, "cap_sys_time";
    SYS_TTY_CONFIG = 26, "cap_sys_tty_config";
    MKNOD = 27, "cap_mknod";
    LEASE = 28, "cap_lease";
    AUDIT_WRITE = 29, "cap_audit_write";
    AUDIT_CONTROL = 30, "cap_audit_control";
    SETFCAP = 31, "cap_setfcap";
    MAC_OVERRIDE = 32, "cap_mac_override";
    MAC_ADMIN = 33, "cap_mac_admin";
    SYSLOG = 34, "cap_syslog";
    WAKE_ALARM = 35, "cap_wake_alarm";
    BLOCK_SUSPEND = 36, "cap_block_suspend";
    AUDIT_READ = 37, "cap_audit_read";
    PERFMON = 38, "cap_perfmon";
    BPF = 39, "cap_bpf";
    CHECKPOINT_RESTORE = 40, "cap_checkpoint_restore";
    // Note: When adding a new value, keep the table sorted by value; NAMES[v] must name Value(v)
}

/// The number of values this library has names for.
pub(crate) const NAMED: u32 = NAMES.len() as u32;

impl Value {
    /// Construct a `Value`, checking that it is supported by the running kernel.
    pub fn new(raw: u32) -> crate::Result<Self> {
        if raw < Limits::get().max_values() {
            Ok(Self(raw))
        } else {
            Err(crate::Error::BadValue)
        }
    }

    /// Get the raw number of this value.
    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Get the canonical name of this value, if this library knows one.
    #[inline]
    pub fn name(self) -> Option<&'static str> {
        NAMES.get(self.0 as usize).map(|(name, _)| *name)
    }

    /// Return an iterator over every value supported by the running kernel.
    #[inline]
    pub fn iter() -> ValueIter {
        ValueIter {
            i: 0,
            end: Limits::get().max_values(),
        }
    }

    /// Checks whether this value is supported on the current kernel.
    pub fn is_supported(self) -> bool {
        bounding::read(self).is_some()
    }

    /// Parse a value against the given limits ("cap_xxx" in any case, or a decimal number).
    pub(crate) fn parse_with(s: &str, limits: &Limits) -> crate::Result<Self> {
        let value = match NAMES
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(s))
        {
            Some((_, value)) => *value,
            None if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) => {
                Self(s.parse().map_err(|_| crate::Error::BadValue)?)
            }
            None => return Err(crate::Error::BadValue),
        };

        if value.0 < limits.max_values() {
            Ok(value)
        } else {
            Err(crate::Error::BadValue)
        }
    }

    #[inline]
    pub(crate) fn word(self) -> usize {
        (self.0 >> 5) as usize
    }

    #[inline]
    pub(crate) fn mask(self) -> u32 {
        1 << (self.0 & 31)
    }
}

impl std::str::FromStr for Value {
    type Err = crate::Error;

    #[inline]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_with(s, Limits::get())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            // Unnamed values are referred to numerically (in decimal)
            None => write!(f, "{}", self.0),
        }
    }
}

/// An iterator over all the values supported by the running kernel.
///
/// This is constructed by [`Value::iter()`].
#[derive(Clone)]
pub struct ValueIter {
    i: u32,
    end: u32,
}

impl Iterator for ValueIter {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        if self.i < self.end {
            self.i += 1;
            Some(Value(self.i - 1))
        } else {
            None
        }
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = self.len();
        (len, Some(len))
    }
}

impl ExactSizeIterator for ValueIter {
    #[inline]
    fn len(&self) -> usize {
        (self.end - self.i) as usize
    }
}

impl std::iter::FusedIterator for ValueIter {}

/// One of the three classic capability vectors of a [`Set`].
///
/// Flags are ordered `Effective < Permitted < Inheritable`.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Flag {
    Effective = 0,
    Permitted = 1,
    Inheritable = 2,
}

impl Flag {
    pub(crate) const ALL: [Flag; 3] = [Flag::Effective, Flag::Permitted, Flag::Inheritable];
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Effective => "e",
            Self::Permitted => "p",
            Self::Inheritable => "i",
        })
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn test_names_sorted() {
        for (i, (name, value)) in NAMES.iter().enumerate() {
            assert_eq!(value.raw() as usize, i, "{}", name);
            assert!(name.starts_with("cap_"));
            assert_eq!(name.to_lowercase(), *name);
        }
    }

    #[test]
    fn test_value_string() {
        assert_eq!(Value::CHOWN.to_string(), "cap_chown");
        assert_eq!(Value::SETUID.to_string(), "cap_setuid");
        assert_eq!(Value(NAMED + 2).to_string(), (NAMED + 2).to_string());
        assert_eq!(Value(NAMED + 2).name(), None);

        assert_eq!(Value::from_str("cap_chown"), Ok(Value::CHOWN));
        assert_eq!(Value::from_str("CAP_CHOWN"), Ok(Value::CHOWN));
        assert_eq!(Value::from_str("Cap_Sys_Chroot"), Ok(Value::SYS_CHROOT));
        assert_eq!(Value::from_str("0"), Ok(Value::CHOWN));
        assert_eq!(Value::from_str("7"), Ok(Value::SETUID));

        assert_eq!(Value::from_str(""), Err(crate::Error::BadValue));
        assert_eq!(Value::from_str("cap_"), Err(crate::Error::BadValue));
        assert_eq!(Value::from_str("chown"), Err(crate::Error::BadValue));
        assert_eq!(Value::from_str("-1"), Err(crate::Error::BadValue));
        assert_eq!(Value::from_str("+1"), Err(crate::Error::BadValue));
        assert_eq!(Value::from_str("1000"), Err(crate::Error::BadValue));

        for value in Value::iter() {
            assert_eq!(Value::from_str(&value.to_string()), Ok(value));
            assert_eq!(Value::from_str(&value.raw().to_string()), Ok(value));
        }
    }

    #[test]
    fn test_value_range() {
        let max = max_bits();
        assert!(max > Value::SETPCAP.raw());
        assert_eq!(Value::new(max - 1), Ok(Value(max - 1)));
        assert_eq!(Value::new(max), Err(crate::Error::BadValue));
    }

    #[test]
    fn test_unnamed_parse() {
        let limits = Limits::with_bounds(NAMED + 3, 2);
        assert_eq!(Value::parse_with("41", &limits), Ok(Value(41)));
        assert_eq!(Value::parse_with("43", &limits), Ok(Value(43)));
        assert_eq!(Value::parse_with("44", &limits), Err(crate::Error::BadValue));

        let limits = Limits::with_bounds(38, 2);
        assert_eq!(Value::parse_with("cap_bpf", &limits), Err(crate::Error::BadValue));
        assert_eq!(Value::parse_with("cap_syslog", &limits), Ok(Value::SYSLOG));
    }

    #[test]
    fn test_value_iter() {
        let mut it = Value::iter();
        let mut count = it.len();
        assert_eq!(count, max_bits() as usize);
        assert_eq!(it.next(), Some(Value::CHOWN));

        while it.next().is_some() {
            count -= 1;
        }
        assert_eq!(count, 1);
        assert_eq!(it.len(), 0);
        assert_eq!(it.next(), None);
    }

    #[test]
    fn test_supported() {
        for value in Value::iter() {
            assert!(value.is_supported());
        }
    }

    #[test]
    fn test_flag() {
        assert!(Flag::Effective < Flag::Permitted);
        assert!(Flag::Permitted < Flag::Inheritable);
        assert_eq!(
            Flag::ALL.iter().map(|f| f.to_string()).collect::<Vec<_>>(),
            vec!["e", "p", "i"]
        );
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_flag_serde() {
        use serde_test::{assert_tokens, Token};

        assert_tokens(
            &Flag::Permitted,
            &[Token::UnitVariant {
                name: "Flag",
                variant: "Permitted",
            }],
        );
    }
}
