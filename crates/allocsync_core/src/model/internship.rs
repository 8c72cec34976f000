//! Internship, company and allocation rows.
//!
//! # Invariants
//! - `tier` is kept as text: legacy or unknown tiers stay representable in
//!   the master store and simply route to no shard.
//! - `revision` is the commit sequence of the last master write and is
//!   assigned by the store, never by callers.

use super::{require_id, require_non_empty, ValidationError};
use serde::{Deserialize, Serialize};

pub type InternshipId = String;

/// Canonical internship row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Internship {
    pub internship_id: InternshipId,
    pub company_id: Option<String>,
    pub sector: String,
    /// `Tier1|Tier2|Tier3`; anything else is a routing anomaly.
    pub tier: String,
    pub capacity: u32,
    /// Space-separated skill tags.
    pub required_skills: String,
    pub stipend: u32,
    /// `Office|Factory|Remote` in current data, not enforced.
    pub location_type: String,
    pub state: String,
    /// Derived from candidate preferences. Ignored on master writes.
    pub preference_count: u32,
    pub revision: i64,
}

impl Internship {
    /// Creates a row with empty optional fields and a zero aggregate.
    pub fn new(
        internship_id: impl Into<String>,
        sector: impl Into<String>,
        tier: impl Into<String>,
        capacity: u32,
        state: impl Into<String>,
    ) -> Self {
        Self {
            internship_id: internship_id.into(),
            company_id: None,
            sector: sector.into(),
            tier: tier.into(),
            capacity,
            required_skills: String::new(),
            stipend: 0,
            location_type: "Office".to_string(),
            state: state.into(),
            preference_count: 0,
            revision: 0,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        require_id("internship_id", &self.internship_id)?;
        if let Some(company_id) = &self.company_id {
            require_id("company_id", company_id)?;
        }
        require_non_empty("sector", &self.sector)?;
        require_non_empty("tier", &self.tier)?;
        require_non_empty("location_type", &self.location_type)?;
        require_non_empty("state", &self.state)?;
        Ok(())
    }
}

/// Company referenced by internships.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub company_id: String,
    pub name: String,
}

impl Company {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_id("company_id", &self.company_id)?;
        require_non_empty("name", &self.name)
    }
}

/// One filled capacity slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub student_id: String,
    pub internship_id: InternshipId,
    /// Reservation category the seat was allotted under, e.g. `GEN` or `SC`.
    pub category_allotted: Option<String>,
}

impl Allocation {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_id("student_id", &self.student_id)?;
        require_id("internship_id", &self.internship_id)
    }
}

#[cfg(test)]
mod tests {
    use super::Internship;
    use crate::model::ValidationError;

    #[test]
    fn validate_rejects_blank_state() {
        let internship = Internship::new("I001", "IT", "Tier1", 5, "  ");
        assert_eq!(
            internship.validate(),
            Err(ValidationError::EmptyField("state"))
        );
    }

    #[test]
    fn unknown_tier_is_still_a_valid_master_row() {
        let internship = Internship::new("I002", "IT", "Tier9", 5, "Goa");
        assert!(internship.validate().is_ok());
    }
}
