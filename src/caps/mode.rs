use std::fmt;

use super::convenience::RaisedEffective;
use super::{ambient, bounding, Flag, Iab, IabVector, Limits, Set, Value};
use crate::prctl::{self, Secbits};
use crate::{Error, Result};

/// The secure bits every recognized mode has set (and locked).
const SECURED_BASIC: Secbits = Secbits::from_bits_truncate(
    Secbits::NOROOT.bits()
        | Secbits::NOROOT_LOCKED.bits()
        | Secbits::NO_SETUID_FIXUP.bits()
        | Secbits::NO_SETUID_FIXUP_LOCKED.bits()
        | Secbits::KEEP_CAPS_LOCKED.bits(),
);

/// [`SECURED_BASIC`], plus ambient raising disabled for good.
const SECURED_AMBIENT: Secbits = Secbits::from_bits_truncate(
    SECURED_BASIC.bits()
        | Secbits::NO_CAP_AMBIENT_RAISE.bits()
        | Secbits::NO_CAP_AMBIENT_RAISE_LOCKED.bits(),
);

/// A summary of the security state of a process.
///
/// Every mode other than [`Mode::Uncertain`] means root has no special privileges (the secure
/// bits are set and locked) and no ambient capabilities are raised; they differ in how much
/// capability the process itself still holds.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum Mode {
    /// The state does not match any of the recognized modes.
    Uncertain,
    /// No capabilities at all, and none can ever be regained.
    NoPriv,
    /// Capabilities may still be held, but nothing is inheritable.
    Pure1EInit,
    /// Capabilities may be inherited through file capabilities.
    Pure1E,
}

/// A snapshot of everything [`Mode::classify()`] looks at.
#[derive(Clone, Debug)]
pub struct ProcState {
    pub secbits: Secbits,
    pub ambient_supported: bool,
    pub caps: Set,
    pub iab: Iab,
}

impl ProcState {
    /// Read the state of the calling thread.
    pub fn current() -> Result<Self> {
        Ok(Self {
            secbits: prctl::get_securebits()?,
            ambient_supported: ambient::is_supported(),
            caps: Set::get_proc()?,
            iab: Iab::get_proc()?,
        })
    }
}

impl Mode {
    /// Summarize a snapshot of process state.
    pub fn classify(state: &ProcState) -> Mode {
        if !state.secbits.contains(SECURED_BASIC)
            || (state.ambient_supported && state.secbits != SECURED_AMBIENT)
        {
            return Mode::Uncertain;
        }

        let iab = state.iab.flat.read().clone();
        if iab.iter().any(|word| word[IabVector::Amb as usize] != 0) {
            return Mode::Uncertain;
        }

        let caps = state.caps.inner.read().flat.clone();
        if caps.iter().any(|word| word[Flag::Inheritable as usize] != 0) {
            return Mode::Pure1E;
        }
        if caps.iter().any(|word| {
            word[Flag::Permitted as usize] != 0 || word[Flag::Effective as usize] != 0
        }) {
            return Mode::Pure1EInit;
        }

        // Anything still in the bounding vector could be regained through a file capability
        let max = state.iab.limits.max_values();
        if iab
            .iter()
            .enumerate()
            .any(|(w, word)| word[IabVector::Bound as usize] != Limits::word_mask(w, max))
        {
            return Mode::Pure1EInit;
        }

        Mode::NoPriv
    }

    /// Summarize the state of the calling thread.
    #[inline]
    pub fn current() -> Result<Mode> {
        Ok(Self::classify(&ProcState::current()?))
    }

    /// Enter this mode.
    ///
    /// `CAP_SETPCAP` is raised for the duration of the call, and the Effective flag is empty
    /// afterwards. [`Mode::Uncertain`] cannot be entered and fails with [`Error::BadMode`] before
    /// anything is changed. Failures part way through are not rolled back.
    pub fn set(self) -> Result<()> {
        if self == Mode::Uncertain {
            return Err(Error::BadMode);
        }

        log::debug!("entering mode {}", self);

        let caps = Set::get_proc()?;
        let guard = RaisedEffective::raise(&caps, Value::SETPCAP)?;

        if self != Mode::Pure1E {
            caps.clear_flag(Flag::Inheritable);
        }

        let secbits = if ambient::is_supported() {
            ambient::reset()?;
            SECURED_AMBIENT
        } else {
            SECURED_BASIC
        };
        prctl::set_securebits(secbits)?;

        if self == Mode::NoPriv {
            for value in Value::iter() {
                if let Err(e) = bounding::drop(value) {
                    log::debug!("stopped dropping bounding values at {}: {}", value, e);
                    break;
                }
            }
            caps.clear_flag(Flag::Permitted);
        }

        guard.commit()
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Uncertain => "UNCERTAIN",
            Self::NoPriv => "NOPRIV",
            Self::Pure1EInit => "PURE1E_INIT",
            Self::Pure1E => "PURE1E",
        })
    }
}
