//! Schema version parsing and step selection.
//!
//! A version is one to three dot-separated integers with an optional
//! leading `v`. Zero-padded sequence tags (`"003"`) and semantic tags
//! (`"0.4.0"`) share the same ordering: missing fields are zero, so
//! `"003"` compares as `3.0.0`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::migrate::steps::{MigrationStep, StepCatalog};

/// A parsed schema version.
///
/// The original text is kept so that the value written back to the
/// metadata table is exactly the step's tag.
#[derive(Debug, Clone)]
pub struct SchemaVersion {
    raw: String,
    fields: [u64; 3],
}

impl SchemaVersion {
    /// Version for a built-in single-field tag such as `3` (`"003"`).
    pub(crate) fn builtin(major: u64, raw: &'static str) -> Self {
        Self {
            raw: raw.to_string(),
            fields: [major, 0, 0],
        }
    }

    /// Parse a version string.
    ///
    /// # Errors
    ///
    /// Returns `VersionParse` if the string is empty, has more than three
    /// fields, or any field is not an unsigned integer.
    pub fn parse(input: &str) -> Result<Self> {
        let malformed = || Error::VersionParse {
            input: input.to_string(),
        };

        let trimmed = input.trim();
        let body = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        if body.is_empty() {
            return Err(malformed());
        }

        let mut fields = [0u64; 3];
        let mut count = 0;
        for part in body.split('.') {
            if count == 3 || part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(malformed());
            }
            fields[count] = part.parse().map_err(|_| malformed())?;
            count += 1;
        }

        Ok(Self {
            raw: trimmed.to_string(),
            fields,
        })
    }

    /// The version text as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// `(major, minor, patch)`.
    #[must_use]
    pub const fn fields(&self) -> [u64; 3] {
        self.fields
    }
}

impl PartialEq for SchemaVersion {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}

impl Eq for SchemaVersion {}

impl PartialOrd for SchemaVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SchemaVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fields.cmp(&other.fields)
    }
}

impl std::hash::Hash for SchemaVersion {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.fields.hash(state);
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for SchemaVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for SchemaVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for SchemaVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Outcome of comparing a store's version against a target.
#[derive(Debug)]
pub enum Resolution<'a> {
    /// `current >= target`: nothing to do.
    UpToDate,
    /// Steps to apply, ascending.
    Pending(Vec<&'a MigrationStep>),
}

impl Resolution<'_> {
    /// Number of steps to apply.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::UpToDate => 0,
            Self::Pending(steps) => steps.len(),
        }
    }

    /// True if no steps would run.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Select the steps with `current < version <= target`, in order.
///
/// An unset `current` sits below every step. When `current >= target`
/// (or no step falls in the window) the result is `UpToDate`.
#[must_use]
pub fn resolve<'a>(
    current: Option<&SchemaVersion>,
    target: &SchemaVersion,
    catalog: &'a StepCatalog,
) -> Resolution<'a> {
    if current.is_some_and(|c| c >= target) {
        return Resolution::UpToDate;
    }

    let steps: Vec<&MigrationStep> = catalog
        .iter()
        .filter(|step| current.is_none_or(|c| step.version() > c) && step.version() <= target)
        .collect();

    if steps.is_empty() {
        Resolution::UpToDate
    } else {
        Resolution::Pending(steps)
    }
}
