use std::fmt;
use std::str::FromStr;

use parking_lot::RwLock;

use super::{ambient, bounding, Flag, Limits, Set, Value};
use crate::{Error, Result};

/// One of the three vectors of an [`Iab`].
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum IabVector {
    /// The Inheritable flag.
    Inh = 0,
    /// The ambient vector.
    Amb = 1,
    /// Values *blocked* from the bounding vector; raising a value here drops it when applied.
    Bound = 2,
}

impl IabVector {
    const ALL: [IabVector; 3] = [IabVector::Inh, IabVector::Amb, IabVector::Bound];
}

bitflags::bitflags! {
    /// The vectors that differ between two tuples, as returned by [`Iab::cf()`].
    pub struct IabDiff: u32 {
        const INH = 1 << IabVector::Inh as u32;
        const AMB = 1 << IabVector::Amb as u32;
        const BOUND = 1 << IabVector::Bound as u32;
    }
}

impl IabDiff {
    /// Whether the compared tuples differ in `vec`.
    #[inline]
    pub fn differs(self, vec: IabVector) -> bool {
        self.bits() & (1 << vec as u32) != 0
    }
}

/// The capability state that is inherited across `execve()`: the Inheritable flag, the ambient
/// vector, and the values blocked from the bounding vector.
///
/// The ambient vector is always a subset of the Inheritable one.
pub struct Iab {
    pub(crate) limits: &'static Limits,
    pub(crate) flat: RwLock<Vec<[u32; 3]>>,
}

impl Iab {
    /// Construct an empty tuple: nothing inheritable, nothing ambient, nothing blocked.
    #[inline]
    pub fn new() -> Self {
        Self::with_limits(Limits::get())
    }

    fn with_limits(limits: &'static Limits) -> Self {
        Self {
            limits,
            flat: RwLock::new(vec![[0; 3]; limits.words()]),
        }
    }

    #[inline]
    fn check(&self, value: Value) -> Result<()> {
        if value.raw() < self.limits.max_values() {
            Ok(())
        } else {
            Err(Error::BadValue)
        }
    }

    /// Check whether `value` is raised in `vec`.
    pub fn get_vector(&self, vec: IabVector, value: Value) -> Result<bool> {
        self.check(value)?;

        Ok(self.flat.read()[value.word()][vec as usize] & value.mask() != 0)
    }

    /// Raise or lower every value in `values` in `vec`.
    ///
    /// Raising an ambient value also raises it in Inheritable, and lowering an Inheritable value
    /// also lowers it in the ambient vector.
    pub fn set_vector(&self, vec: IabVector, raised: bool, values: &[Value]) -> Result<()> {
        for value in values {
            self.check(*value)?;
        }

        let mut flat = self.flat.write();
        for value in values {
            let word = &mut flat[value.word()];
            if raised {
                word[vec as usize] |= value.mask();
            } else {
                word[vec as usize] &= !value.mask();
            }

            match vec {
                IabVector::Inh => word[IabVector::Amb as usize] &= word[IabVector::Inh as usize],
                IabVector::Amb => word[IabVector::Inh as usize] |= word[IabVector::Amb as usize],
                IabVector::Bound => (),
            }
        }

        Ok(())
    }

    /// Replace `vec` with the `flag` vector of `set`.
    ///
    /// Filling [`IabVector::Bound`] blocks every value that is *not* raised in `flag`.
    pub fn fill(&self, vec: IabVector, set: &Set, flag: Flag) {
        // Copy first, so both locks are never held at once
        let source = set.inner.read().flat.clone();
        let max = self.limits.max_values();

        let mut flat = self.flat.write();
        for (w, word) in flat.iter_mut().enumerate() {
            let bits = source.get(w).map_or(0, |s| s[flag as usize]);
            match vec {
                IabVector::Inh => {
                    word[IabVector::Inh as usize] = bits;
                    word[IabVector::Amb as usize] &= bits;
                }
                IabVector::Amb => {
                    word[IabVector::Amb as usize] = bits;
                    word[IabVector::Inh as usize] |= bits;
                }
                IabVector::Bound => {
                    word[IabVector::Bound as usize] = !bits & Limits::word_mask(w, max);
                }
            }
        }
    }

    /// Compare two tuples, reporting which vectors differ.
    pub fn cf(&self, other: &Iab) -> IabDiff {
        if std::ptr::eq(self, other) {
            return IabDiff::empty();
        }

        let a = self.flat.read().clone();
        let b = other.flat.read().clone();

        let mut diff = IabDiff::empty();
        for w in 0..a.len().max(b.len()) {
            let x = a.get(w).copied().unwrap_or_default();
            let y = b.get(w).copied().unwrap_or_default();
            for vec in IabVector::ALL.iter() {
                if x[*vec as usize] != y[*vec as usize] {
                    diff |= IabDiff::from_bits_truncate(1 << *vec as u32);
                }
            }
        }

        diff
    }

    /// Read the tuple of the calling thread.
    pub fn get_proc() -> Result<Iab> {
        let iab = Iab::new();

        let caps = Set::get_proc()?;
        iab.fill(IabVector::Inh, &caps, Flag::Inheritable);

        {
            let mut flat = iab.flat.write();
            for value in Value::iter() {
                let word = &mut flat[value.word()];
                if ambient::read(value).unwrap_or(false) {
                    word[IabVector::Amb as usize] |= value.mask();
                }
                if bounding::read(value) == Some(false) {
                    word[IabVector::Bound as usize] |= value.mask();
                }
            }
        }

        Ok(iab)
    }

    /// Apply this tuple to every thread of the process.
    ///
    /// Raising Inheritable values that are not Permitted, or blocking bounding values, requires
    /// `CAP_SETPCAP`; it is raised in Effective for the duration of the call. The Effective flag
    /// is restored before returning.
    pub fn set_proc(&self) -> Result<()> {
        let flat = self.flat.read().clone();

        let current = Set::get_proc()?;
        let mut raising = false;
        {
            let mut inner = current.inner.write();
            for (word, iab) in inner.flat.iter_mut().zip(flat.iter()) {
                let held =
                    word[Flag::Inheritable as usize] | word[Flag::Permitted as usize];
                raising |= iab[IabVector::Inh as usize] & !held != 0;
                word[Flag::Inheritable as usize] = iab[IabVector::Inh as usize];
            }
        }
        raising |= Value::iter().any(|value| {
            flat[value.word()][IabVector::Bound as usize] & value.mask() != 0
                && bounding::read(value) == Some(true)
        });

        let working = current.clone();
        if raising {
            working.set_flag(Flag::Effective, true, &[Value::SETPCAP])?;
        }
        working.set_proc()?;

        let res = apply_vectors(&flat);

        // Restore the original Effective flag (with the new Inheritable one)
        let restored = current.set_proc();
        if let Err(e) = &restored {
            log::warn!("unable to restore effective capabilities: {}", e);
        }

        res.and(restored)
    }

    pub(crate) fn from_text_with(text: &str, limits: &'static Limits) -> Result<Iab> {
        let iab = Iab::with_limits(limits);
        if text.is_empty() {
            return Ok(iab);
        }

        {
            let mut flat = iab.flat.write();
            for entry in text.split(',') {
                let name = entry.trim_start_matches(|c| matches!(c, '!' | '^' | '%'));
                let prefixes = &entry[..entry.len() - name.len()];

                let value = Value::parse_with(name, limits).map_err(|_| Error::BadText)?;
                let word = &mut flat[value.word()];

                let mut inh = prefixes.is_empty();
                for c in prefixes.chars() {
                    match c {
                        '!' => word[IabVector::Bound as usize] |= value.mask(),
                        '^' => {
                            word[IabVector::Amb as usize] |= value.mask();
                            inh = true;
                        }
                        _ => inh = true,
                    }
                }
                if inh {
                    word[IabVector::Inh as usize] |= value.mask();
                }
            }
        }

        Ok(iab)
    }
}

fn apply_vectors(flat: &[[u32; 3]]) -> Result<()> {
    let has_ambient = ambient::is_supported();

    for value in Value::iter() {
        let word = flat[value.word()];

        if has_ambient
            && word[IabVector::Amb as usize] & value.mask() == 0
            && ambient::read(value)?
        {
            ambient::set(value, false)?;
        }

        if word[IabVector::Bound as usize] & value.mask() != 0
            && bounding::read(value) == Some(true)
        {
            bounding::drop(value)?;
        }
    }

    for value in Value::iter() {
        if flat[value.word()][IabVector::Amb as usize] & value.mask() != 0
            && !(has_ambient && ambient::read(value)?)
        {
            ambient::set(value, true)?;
        }
    }

    Ok(())
}

impl Default for Iab {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Iab {
    fn clone(&self) -> Self {
        Self {
            limits: self.limits,
            flat: RwLock::new(self.flat.read().clone()),
        }
    }
}

impl PartialEq for Iab {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.cf(other).is_empty()
    }
}

impl Eq for Iab {}

impl fmt::Display for Iab {
    /// Entries are comma-separated value names, each prefixed with `!` if blocked from the
    /// bounding vector, `^` if ambient (and so inheritable), or `%` if only inheritable but also
    /// blocked. Plain names are inheritable.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flat = self.flat.read();
        let mut first = true;

        for v in 0..self.limits.max_values() {
            let value = Value(v);
            let word = flat[value.word()];
            let ib = word[IabVector::Inh as usize] & value.mask() != 0;
            let ab = word[IabVector::Amb as usize] & value.mask() != 0;
            let nb = word[IabVector::Bound as usize] & value.mask() != 0;

            if !(ib || ab || nb) {
                continue;
            }

            if !first {
                f.write_str(",")?;
            }
            first = false;

            if nb {
                f.write_str("!")?;
            }
            if ab {
                f.write_str("^")?;
            } else if nb && ib {
                f.write_str("%")?;
            }
            write!(f, "{}", value)?;
        }

        Ok(())
    }
}

impl fmt::Debug for Iab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Iab").field(&self.to_string()).finish()
    }
}

impl FromStr for Iab {
    type Err = Error;

    #[inline]
    fn from_str(s: &str) -> Result<Self> {
        Self::from_text_with(s, Limits::get())
    }
}
