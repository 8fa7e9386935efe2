use std::fmt;

use parking_lot::RwLock;

use super::{Flag, Limits, Value};
use crate::{Error, Result};

/// The words of a [`Set`]; `flat[w][f]` holds flag `f` for values `w*32..w*32+32`.
#[derive(Clone)]
pub(crate) struct Inner {
    pub(crate) flat: Vec<[u32; 3]>,
    pub(crate) ns_root: Option<libc::uid_t>,
}

/// A full set of Effective, Permitted and Inheritable capability vectors.
///
/// A `Set` can be read (queried, exported, formatted) from several threads at once; mutation
/// is exclusive. It is a plain value: a `Set` obtained from [`Set::get_proc()`] is a snapshot and
/// does not follow later changes to the process.
pub struct Set {
    pub(crate) limits: &'static Limits,
    pub(crate) inner: RwLock<Inner>,
}

bitflags::bitflags! {
    /// The flags that differ between two sets, as returned by [`Set::cf()`].
    pub struct Diff: u32 {
        const EFFECTIVE = 1 << Flag::Effective as u32;
        const PERMITTED = 1 << Flag::Permitted as u32;
        const INHERITABLE = 1 << Flag::Inheritable as u32;
    }
}

impl Diff {
    /// Whether the compared sets differ in `flag`.
    #[inline]
    pub fn differs(self, flag: Flag) -> bool {
        self.bits() & (1 << flag as u32) != 0
    }
}

impl Set {
    /// Construct an empty `Set`, sized for the running kernel.
    #[inline]
    pub fn new() -> Self {
        Self::with_limits(Limits::get())
    }

    pub(crate) fn with_limits(limits: &'static Limits) -> Self {
        Self {
            limits,
            inner: RwLock::new(Inner {
                flat: vec![[0; 3]; limits.words()],
                ns_root: None,
            }),
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

    /// Check whether `value` is raised in `flag`.
    pub fn get_flag(&self, flag: Flag, value: Value) -> Result<bool> {
        self.check(value)?;

        let inner = self.inner.read();
        Ok(inner.flat[value.word()][flag as usize] & value.mask() != 0)
    }

    /// Raise (`enable == true`) or lower every value in `values` in `flag`.
    ///
    /// Either all of the values are updated or, if any of them is out of range, none are.
    pub fn set_flag(&self, flag: Flag, enable: bool, values: &[Value]) -> Result<()> {
        for value in values {
            self.check(*value)?;
        }

        let mut inner = self.inner.write();
        for value in values {
            let word = &mut inner.flat[value.word()][flag as usize];
            if enable {
                *word |= value.mask();
            } else {
                *word &= !value.mask();
            }
        }

        Ok(())
    }

    /// Copy every bit of flag `from` into flag `to`.
    pub fn fill(&self, to: Flag, from: Flag) {
        let mut inner = self.inner.write();
        for word in inner.flat.iter_mut() {
            word[to as usize] = word[from as usize];
        }
    }

    /// Lower every value in `flag`.
    pub fn clear_flag(&self, flag: Flag) {
        self.force_flag(flag, false);
    }

    /// Lower every value in every flag.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        for word in inner.flat.iter_mut() {
            *word = [0; 3];
        }
    }

    /// Set every supported value of `flag` to `enable`.
    pub(crate) fn force_flag(&self, flag: Flag, enable: bool) {
        let max = self.limits.max_values();
        let mut inner = self.inner.write();
        for (w, word) in inner.flat.iter_mut().enumerate() {
            word[flag as usize] = if enable {
                Limits::word_mask(w, max)
            } else {
                0
            };
        }
    }

    /// Compare two sets, reporting which flags differ.
    ///
    /// An empty `Diff` means the sets are equal.
    pub fn cf(&self, other: &Set) -> Diff {
        if std::ptr::eq(self, other) {
            return Diff::empty();
        }

        // Never hold both locks at once
        let a = self.inner.read().flat.clone();
        let b = other.inner.read().flat.clone();
        let words = a.len().max(b.len());

        let mut diff = Diff::empty();
        for w in 0..words {
            let x = a.get(w).copied().unwrap_or_default();
            let y = b.get(w).copied().unwrap_or_default();
            for flag in Flag::ALL.iter() {
                if x[*flag as usize] != y[*flag as usize] {
                    diff |= Diff::from_bits_truncate(1 << *flag as u32);
                }
            }
        }

        diff
    }

    /// Whether every flag of this set is lowered for every value.
    pub fn is_empty(&self) -> bool {
        self.inner
            .read()
            .flat
            .iter()
            .all(|word| word.iter().all(|bits| *bits == 0))
    }

    /// The user namespace root UID a file capability is bound to, if any.
    #[inline]
    pub fn ns_owner(&self) -> Option<libc::uid_t> {
        self.inner.read().ns_root
    }

    /// Bind (or unbind) this set to a user namespace root UID when written as a file capability.
    #[inline]
    pub fn set_ns_owner(&self, uid: Option<libc::uid_t>) {
        self.inner.write().ns_root = uid;
    }

    /// Format an optional set, writing `<invalid>` if there is no set at all.
    ///
    /// An absent set is not the same as an empty one (which formats as `=`).
    pub fn describe(set: Option<&Set>) -> String {
        match set {
            Some(set) => set.to_string(),
            None => "<invalid>".to_string(),
        }
    }

    /// Make sure no bits at or above `maxValues` are raised.
    pub(crate) fn validate_bits(limits: &Limits, flat: &[[u32; 3]]) -> Result<()> {
        for (w, word) in flat.iter().enumerate() {
            let valid = Limits::word_mask(w, limits.max_values());
            if word.iter().any(|bits| bits & !valid != 0) {
                return Err(Error::BadValue);
            }
        }

        Ok(())
    }
}

impl Default for Set {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Set {
    fn clone(&self) -> Self {
        Self {
            limits: self.limits,
            inner: RwLock::new(self.inner.read().clone()),
        }
    }
}

impl PartialEq for Set {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.cf(other).is_empty()
    }
}

impl Eq for Set {}

impl fmt::Debug for Set {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Set").field(&self.to_string()).finish()
    }
}
