//! Per-field value sets and the atom grammar (ranges, lists, steps, names).

use crate::error::{ParseError, Result};

/// Inclusive bounds and display name for one cron field.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FieldSpec {
    pub name: &'static str,
    pub min: u8,
    pub max: u8,
    /// Named constants accepted in place of integers (e.g. `JAN`, `MON`).
    /// The value of `names[i]` is `min + i`.
    pub names: &'static [&'static str],
}

pub(crate) const SECONDS: FieldSpec = FieldSpec {
    name: "seconds",
    min: 0,
    max: 59,
    names: &[],
};

pub(crate) const MINUTES: FieldSpec = FieldSpec {
    name: "minutes",
    min: 0,
    max: 59,
    names: &[],
};

pub(crate) const HOURS: FieldSpec = FieldSpec {
    name: "hours",
    min: 0,
    max: 23,
    names: &[],
};

pub(crate) const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
};

pub(crate) const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: &[
        "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
    ],
};

/// Day-of-week numbering is 1 = Sunday .. 7 = Saturday.
pub(crate) const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 1,
    max: 7,
    names: &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"],
};

/// Compact sorted set of allowed values for one field (bitmask over 0..=63).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ValueSet(u64);

impl ValueSet {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn full(spec: &FieldSpec) -> Self {
        let mut set = Self::empty();
        for v in spec.min..=spec.max {
            set.insert(v);
        }
        set
    }

    pub fn insert(&mut self, value: u8) {
        self.0 |= 1 << value;
    }

    pub fn contains(&self, value: u8) -> bool {
        value < 64 && self.0 & (1 << value) != 0
    }

    /// Smallest member of the set.
    pub fn min(&self) -> u8 {
        self.0.trailing_zeros() as u8
    }

    /// Smallest member `>= value`, if any.
    pub fn first_at_or_after(&self, value: u8) -> Option<u8> {
        if value >= 64 {
            return None;
        }
        let masked = self.0 & (u64::MAX << value);
        if masked == 0 {
            None
        } else {
            Some(masked.trailing_zeros() as u8)
        }
    }
}

impl FieldSpec {
    /// Resolve a single value token: an integer or a named constant.
    pub fn value(&self, token: &str, at: usize) -> Result<u8> {
        if let Some(idx) = self
            .names
            .iter()
            .position(|n| n.eq_ignore_ascii_case(token))
        {
            return Ok(self.min + idx as u8);
        }
        let v: u8 = token.parse().map_err(|_| {
            ParseError::new(at, format!("unrecognized {} value '{token}'", self.name))
        })?;
        if v < self.min || v > self.max {
            return Err(ParseError::new(
                at,
                format!(
                    "{} value {v} out of range {}..={}",
                    self.name, self.min, self.max
                ),
            ));
        }
        Ok(v)
    }

    /// Parse a comma-separated list of atoms (`a`, `a-b`, `a/b`, `a-b/c`, `*`,
    /// `*/b`) into a value set.
    pub fn parse_list(&self, field: &str, at: usize) -> Result<ValueSet> {
        let mut set = ValueSet::empty();
        for part in field.split(',') {
            if part.is_empty() {
                return Err(ParseError::new(
                    at,
                    format!("empty list element in {} field", self.name),
                ));
            }
            self.parse_atom(part, at, &mut set)?;
        }
        Ok(set)
    }

    fn parse_atom(&self, atom: &str, at: usize, set: &mut ValueSet) -> Result<()> {
        let (base, step) = match atom.split_once('/') {
            Some((base, step_str)) => {
                let step: u8 = step_str.parse().map_err(|_| {
                    ParseError::new(at, format!("invalid step '{step_str}' in {} field", self.name))
                })?;
                if step == 0 {
                    return Err(ParseError::new(
                        at,
                        format!("step must be > 0 in {} field", self.name),
                    ));
                }
                (base, Some(step))
            },
            None => (atom, None),
        };

        let (start, end) = if base == "*" {
            (self.min, self.max)
        } else if let Some((lo, hi)) = base.split_once('-') {
            (self.value(lo, at)?, self.value(hi, at)?)
        } else {
            let v = self.value(base, at)?;
            match step {
                // `a/b` means "starting at a, every b" to the top of the range.
                Some(_) => (v, self.max),
                None => (v, v),
            }
        };

        let step = step.unwrap_or(1);
        if start <= end {
            let mut v = start;
            while v <= end {
                set.insert(v);
                v = match v.checked_add(step) {
                    Some(n) => n,
                    None => break,
                };
            }
        } else {
            // Wrap-around range, e.g. hours `22-2` or `FRI-MON`.
            let span = (self.max - start) as u16 + (end - self.min) as u16 + 2;
            let width = (self.max - self.min) as u16 + 1;
            let mut offset = 0u16;
            while offset < span {
                let v = self.min + ((start - self.min) as u16 + offset).rem_euclid(width) as u8;
                set.insert(v);
                offset += step as u16;
            }
        }
        Ok(())
    }
}
