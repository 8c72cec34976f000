//! Domain model for the master store.
//!
//! # Responsibility
//! - Define canonical row shapes shared by store, propagator, maintainer
//!   and auditor.
//! - Own write-path validation rules for identifiers and scalar fields.
//!
//! # Invariants
//! - Every entity is identified by a stable text id matching [`is_valid_id`].
//! - `preference_count` is derived; callers never set it directly.

pub mod candidate;
pub mod internship;

use once_cell::sync::Lazy;
use regex::Regex;
use std::error::Error;
use std::fmt::{Display, Formatter};

static ENTITY_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.\-]{0,63}$").expect("valid entity id regex")
});

/// Returns whether `value` is an acceptable stable entity id.
pub fn is_valid_id(value: &str) -> bool {
    ENTITY_ID_RE.is_match(value)
}

/// Write-path validation failure. Surfaced synchronously as a rejected mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    InvalidId { field: &'static str, value: String },
    EmptyField(&'static str),
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidId { field, value } => write!(f, "invalid {field} `{value}`"),
            Self::EmptyField(field) => write!(f, "{field} must not be empty"),
        }
    }
}

impl Error for ValidationError {}

pub(crate) fn require_id(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if is_valid_id(value) {
        Ok(())
    } else {
        Err(ValidationError::InvalidId {
            field,
            value: value.to_string(),
        })
    }
}

pub(crate) fn require_non_empty(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        Err(ValidationError::EmptyField(field))
    } else {
        Ok(())
    }
}
