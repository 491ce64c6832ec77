//! Job and trigger identity: `(group, name)` pairs and key matchers.

use std::{cmp::Ordering, fmt};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

/// Group used when none is given.
pub const DEFAULT_GROUP: &str = "DEFAULT";

fn validate(group: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SchedulerError::invalid_argument("key name cannot be empty"));
    }
    if group.is_empty() {
        return Err(SchedulerError::invalid_argument("key group cannot be empty"));
    }
    Ok(())
}

/// `DEFAULT` sorts before any other group, then lexicographic group, then name.
fn cmp_keys(a: (&str, &str), b: (&str, &str)) -> Ordering {
    match (a.0 == DEFAULT_GROUP, b.0 == DEFAULT_GROUP) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => a.0.cmp(b.0).then_with(|| a.1.cmp(b.1)),
    }
}

macro_rules! key_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct $name {
            group: String,
            name: String,
        }

        impl $name {
            pub fn new(group: impl Into<String>, name: impl Into<String>) -> Result<Self> {
                let (group, name) = (group.into(), name.into());
                validate(&group, &name)?;
                Ok(Self { group, name })
            }

            /// Key in the `DEFAULT` group.
            pub fn of(name: impl Into<String>) -> Result<Self> {
                Self::new(DEFAULT_GROUP, name)
            }

            #[must_use]
            pub fn group(&self) -> &str {
                &self.group
            }

            #[must_use]
            pub fn name(&self) -> &str {
                &self.name
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}.{}", self.group, self.name)
            }
        }

        impl Ord for $name {
            fn cmp(&self, other: &Self) -> Ordering {
                cmp_keys(
                    (self.group.as_str(), self.name.as_str()),
                    (other.group.as_str(), other.name.as_str()),
                )
            }
        }

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }
    };
}

key_type! {
    /// Identity of a job definition.
    JobKey
}

key_type! {
    /// Identity of a trigger.
    TriggerKey
}

/// Predicate over `(group, name)` pairs, used for bulk queries, bulk
/// pause/resume, and listener registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum KeyMatcher {
    Everything,
    GroupEquals { group: String },
    NameStartsWith { prefix: String },
    Exact { group: String, name: String },
}

impl KeyMatcher {
    #[must_use]
    pub fn group(group: impl Into<String>) -> Self {
        Self::GroupEquals {
            group: group.into(),
        }
    }

    #[must_use]
    pub fn name_prefix(prefix: impl Into<String>) -> Self {
        Self::NameStartsWith {
            prefix: prefix.into(),
        }
    }

    #[must_use]
    pub fn exact(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self::Exact {
            group: group.into(),
            name: name.into(),
        }
    }

    #[must_use]
    pub fn matches(&self, group: &str, name: &str) -> bool {
        match self {
            Self::Everything => true,
            Self::GroupEquals { group: g } => g == group,
            Self::NameStartsWith { prefix } => name.starts_with(prefix.as_str()),
            Self::Exact { group: g, name: n } => g == group && n == name,
        }
    }

    #[must_use]
    pub fn matches_job(&self, key: &JobKey) -> bool {
        self.matches(key.group(), key.name())
    }

    #[must_use]
    pub fn matches_trigger(&self, key: &TriggerKey) -> bool {
        self.matches(key.group(), key.name())
    }
}
