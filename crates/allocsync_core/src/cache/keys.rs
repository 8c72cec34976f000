//! Cache key namespace.
//!
//! Callers treat keys as opaque strings. Prefixes group keys for
//! `delete_by_prefix` invalidation.

use std::time::Duration;

pub const INTERNSHIPS_PREFIX: &str = "internships:";
pub const CANDIDATES_PREFIX: &str = "candidates:";
pub const STATS_PREFIX: &str = "stats:";

pub const DEFAULT_LISTING_TTL: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_STATS_TTL: Duration = Duration::from_secs(5 * 60);

/// TTL class of a cached value. TTLs bound staleness only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyClass {
    Listing,
    Statistics,
}

/// Fixed TTL per key class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtls {
    pub listing: Duration,
    pub statistics: Duration,
}

impl CacheTtls {
    pub fn ttl(&self, class: KeyClass) -> Duration {
        match class {
            KeyClass::Listing => self.listing,
            KeyClass::Statistics => self.statistics,
        }
    }
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            listing: DEFAULT_LISTING_TTL,
            statistics: DEFAULT_STATS_TTL,
        }
    }
}

pub fn internships_all() -> String {
    "internships:all".to_string()
}

pub fn internships_by_tier(tier: &str) -> String {
    format!("internships:tier:{tier}")
}

pub fn internships_by_state(state: &str) -> String {
    format!("internships:state:{state}")
}

pub fn stats_dashboard() -> String {
    "stats:dashboard".to_string()
}

pub fn candidates_count() -> String {
    "candidates:count".to_string()
}

pub fn candidates_state_count(state: &str) -> String {
    format!("candidates:state:{state}:count")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_follow_documented_namespace() {
        assert_eq!(internships_all(), "internships:all");
        assert_eq!(internships_by_tier("Tier2"), "internships:tier:Tier2");
        assert_eq!(internships_by_state("Goa"), "internships:state:Goa");
        assert_eq!(stats_dashboard(), "stats:dashboard");
        assert_eq!(candidates_count(), "candidates:count");
        assert_eq!(candidates_state_count("Goa"), "candidates:state:Goa:count");
        assert!(internships_by_tier("Tier1").starts_with(INTERNSHIPS_PREFIX));
        assert!(candidates_state_count("Goa").starts_with(CANDIDATES_PREFIX));
    }

    #[test]
    fn default_ttls_are_ten_and_five_minutes() {
        let ttls = CacheTtls::default();
        assert_eq!(ttls.ttl(KeyClass::Listing), Duration::from_secs(600));
        assert_eq!(ttls.ttl(KeyClass::Statistics), Duration::from_secs(300));
    }
}
