//! The canonical text form of a [`Set`].
//!
//! A text is a whitespace-separated list of clauses. Each clause names some values (a
//! comma-separated list, `all`, or nothing) followed by one or more operations: `=` resets the
//! named values and then raises the listed flags, `+` raises and `-` lowers. Flags are written as
//! any combination of `e`, `p` and `i`. A clause with no names must start with `=`; it sets the
//! default ("background") state of every named value and lowers every unnamed one.
//!
//! For example `=ep cap_setuid-e cap_net_raw+i` raises Effective and Permitted for everything
//! except that `cap_setuid` is only Permitted and `cap_net_raw` is also Inheritable.

use std::fmt;
use std::str::FromStr;

use super::{Flag, Limits, Set, Value};
use crate::{Error, Result};

const COMBOS: [&str; 8] = ["", "e", "p", "ep", "i", "ei", "pi", "epi"];

/// The flag combination of `value`, as an index into `COMBOS`.
#[inline]
fn pattern(flat: &[[u32; 3]], value: Value) -> usize {
    let word = flat[value.word()];
    Flag::ALL
        .iter()
        .filter(|flag| word[**flag as usize] & value.mask() != 0)
        .fold(0, |acc, flag| acc | (1 << *flag as usize))
}

fn join(values: impl Iterator<Item = Value>) -> String {
    values
        .map(|value| value.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

impl fmt::Display for Set {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        let named = self.limits.named();
        let max = self.limits.max_values();

        let patterns: Vec<usize> = (0..named).map(|v| pattern(&inner.flat, Value(v))).collect();
        let mut bins = [0usize; 8];
        for p in patterns.iter() {
            bins[*p] += 1;
        }

        // The background is the most popular combination among the named values; ties go to the
        // smallest combination.
        let mut m = 7;
        for t in (0..7).rev() {
            if bins[t] >= bins[m] {
                m = t;
            }
        }

        let mut clauses = vec![format!("={}", COMBOS[m])];

        for i in (0..8).rev() {
            if i == m || bins[i] == 0 {
                continue;
            }

            let mut clause = join(
                patterns
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| **p == i)
                    .map(|(v, _)| Value(v as u32)),
            );

            let raise = i & !m;
            if raise != 0 {
                if clauses.len() == 1 && clauses[0] == "=" {
                    // "= foo+e" is better written "foo=e"
                    clauses.clear();
                    clause.push('=');
                } else {
                    clause.push('+');
                }
                clause.push_str(COMBOS[raise]);
            }

            let lower = m & !i;
            if lower != 0 {
                clause.push('-');
                clause.push_str(COMBOS[lower]);
            }

            clauses.push(clause);
        }

        // Unnamed values are always lowered by the background, so they can only be added.
        let unnamed: Vec<(Value, usize)> = (named..max)
            .map(|v| (Value(v), pattern(&inner.flat, Value(v))))
            .collect();
        for i in (1..8).rev() {
            if unnamed.iter().any(|(_, p)| *p == i) {
                let list = join(
                    unnamed
                        .iter()
                        .filter(|(_, p)| *p == i)
                        .map(|(value, _)| *value),
                );
                clauses.push(format!("{}+{}", list, COMBOS[i]));
            }
        }

        f.write_str(&clauses.join(" "))
    }
}

/// One `<op><flags>` group of a clause.
struct Group {
    op: u8,
    flags: [bool; 3],
}

fn parse_groups(ops: &str) -> Result<Vec<Group>> {
    let mut groups: Vec<Group> = Vec::new();

    for b in ops.bytes() {
        let flag = match b {
            b'=' | b'+' | b'-' => {
                groups.push(Group {
                    op: b,
                    flags: [false; 3],
                });
                continue;
            }
            b'e' => Flag::Effective,
            b'p' => Flag::Permitted,
            b'i' => Flag::Inheritable,
            _ => return Err(Error::BadText),
        };

        groups.last_mut().ok_or(Error::BadText)?.flags[flag as usize] = true;
    }

    // Only "=" may be used without any flags
    if groups.is_empty()
        || groups
            .iter()
            .any(|g| g.op != b'=' && !g.flags.iter().any(|f| *f))
    {
        return Err(Error::BadText);
    }

    Ok(groups)
}

impl Set {
    pub(crate) fn from_text_with(text: &str, limits: &'static Limits) -> Result<Set> {
        let set = Set::with_limits(limits);
        let mut clauses = 0;

        for clause in text.split_whitespace() {
            clauses += 1;

            let i = clause
                .find(|c| matches!(c, '=' | '+' | '-'))
                .ok_or(Error::BadText)?;
            let (names, ops) = clause.split_at(i);
            let groups = parse_groups(ops)?;

            let background = names.is_empty();
            let values: Vec<Value> = match names {
                "" if groups[0].op != b'=' => return Err(Error::BadText),
                "" => (0..limits.named()).map(Value).collect(),
                "all" => (0..limits.max_values()).map(Value).collect(),
                _ => names
                    .split(',')
                    .map(|name| Value::parse_with(name, limits).map_err(|_| Error::BadText))
                    .collect::<Result<_>>()?,
            };

            for group in groups {
                if group.op == b'=' {
                    if background {
                        set.clear();
                    } else {
                        for flag in Flag::ALL.iter() {
                            set.set_flag(*flag, false, &values)?;
                        }
                    }
                }

                for flag in Flag::ALL.iter() {
                    if group.flags[*flag as usize] {
                        set.set_flag(*flag, group.op != b'-', &values)?;
                    }
                }
            }
        }

        if clauses == 0 {
            return Err(Error::BadText);
        }

        Ok(set)
    }
}

impl FromStr for Set {
    type Err = Error;

    /// Parse the canonical text form of a set.
    #[inline]
    fn from_str(s: &str) -> Result<Self> {
        Self::from_text_with(s, Limits::get())
    }
}
