//! Pure shard routing.
//!
//! Both routing functions are total: every input yields either one shard or
//! `None`, the no-op route. `None` means "master-only"; callers log it as a
//! routing anomaly and carry on.

use serde::Serialize;

/// One of the three internship replica tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum TierShard {
    Tier1,
    Tier2,
    Tier3,
}

impl TierShard {
    pub const ALL: [TierShard; 3] = [Self::Tier1, Self::Tier2, Self::Tier3];

    /// Replica table name. Static, so it is safe to splice into SQL.
    pub fn table(self) -> &'static str {
        match self {
            Self::Tier1 => "internships_tier1",
            Self::Tier2 => "internships_tier2",
            Self::Tier3 => "internships_tier3",
        }
    }

    /// Canonical tier label as stored on master rows.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tier1 => "Tier1",
            Self::Tier2 => "Tier2",
            Self::Tier3 => "Tier3",
        }
    }
}

/// One of the four candidate replica tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum RegionShard {
    North,
    South,
    East,
    West,
}

impl RegionShard {
    pub const ALL: [RegionShard; 4] = [Self::North, Self::South, Self::East, Self::West];

    pub fn table(self) -> &'static str {
        match self {
            Self::North => "candidates_north",
            Self::South => "candidates_south",
            Self::East => "candidates_east",
            Self::West => "candidates_west",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::North => "north",
            Self::South => "south",
            Self::East => "east",
            Self::West => "west",
        }
    }

    fn states(self) -> &'static [&'static str] {
        match self {
            Self::North => NORTH_STATES,
            Self::South => SOUTH_STATES,
            Self::East => EAST_STATES,
            Self::West => WEST_STATES,
        }
    }
}

const NORTH_STATES: &[&str] = &[
    "delhi",
    "haryana",
    "punjab",
    "himachal pradesh",
    "jammu and kashmir",
    "ladakh",
    "uttarakhand",
    "uttar pradesh",
    "chandigarh",
    "rajasthan",
];

const SOUTH_STATES: &[&str] = &[
    "karnataka",
    "kerala",
    "tamil nadu",
    "andhra pradesh",
    "telangana",
    "puducherry",
    "lakshadweep",
    "andaman and nicobar islands",
];

const EAST_STATES: &[&str] = &[
    "west bengal",
    "odisha",
    "bihar",
    "jharkhand",
    "assam",
    "sikkim",
    "arunachal pradesh",
    "nagaland",
    "manipur",
    "mizoram",
    "tripura",
    "meghalaya",
];

const WEST_STATES: &[&str] = &[
    "maharashtra",
    "gujarat",
    "goa",
    "madhya pradesh",
    "chhattisgarh",
    "dadra and nagar haveli and daman and diu",
];

/// Routes an internship tier label to its replica shard.
///
/// Matching ignores surrounding whitespace and ASCII case.
pub fn route_internship(tier: &str) -> Option<TierShard> {
    let tier = tier.trim();
    TierShard::ALL
        .into_iter()
        .find(|shard| shard.as_str().eq_ignore_ascii_case(tier))
}

/// Routes a candidate's state to its regional replica shard.
///
/// Matching ignores ASCII case, surrounding whitespace and repeated inner
/// whitespace, so `"  tamil   NADU "` routes like `"Tamil Nadu"`.
pub fn route_candidate(state: &str) -> Option<RegionShard> {
    let normalized = state
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase();
    if normalized.is_empty() {
        return None;
    }
    RegionShard::ALL
        .into_iter()
        .find(|region| region.states().contains(&normalized.as_str()))
}

#[cfg(test)]
mod tests {
    use super::{route_candidate, route_internship, RegionShard, TierShard};
    use std::collections::HashSet;

    #[test]
    fn every_tier_routes_to_its_own_shard() {
        let cases = [
            ("Tier1", Some(TierShard::Tier1)),
            ("Tier2", Some(TierShard::Tier2)),
            ("Tier3", Some(TierShard::Tier3)),
            (" tier2 ", Some(TierShard::Tier2)),
            ("Tier4", None),
            ("", None),
        ];
        for (input, expected) in cases {
            assert_eq!(route_internship(input), expected, "input `{input}`");
        }
    }

    #[test]
    fn every_region_is_reachable_and_unknown_state_is_noop() {
        let cases = [
            ("Delhi", Some(RegionShard::North)),
            ("Tamil Nadu", Some(RegionShard::South)),
            ("west bengal", Some(RegionShard::East)),
            ("MAHARASHTRA", Some(RegionShard::West)),
            ("  uttar   pradesh ", Some(RegionShard::North)),
            ("Atlantis", None),
            ("   ", None),
        ];
        for (input, expected) in cases {
            assert_eq!(route_candidate(input), expected, "input `{input}`");
        }
    }

    #[test]
    fn state_lists_do_not_overlap() {
        let mut seen = HashSet::new();
        for region in RegionShard::ALL {
            for state in region.states() {
                assert!(seen.insert(*state), "{state} mapped twice");
                assert_eq!(route_candidate(state), Some(region));
            }
        }
    }

    #[test]
    fn routing_is_deterministic() {
        for _ in 0..3 {
            assert_eq!(route_internship("Tier0"), None);
            assert_eq!(route_candidate("Kerala"), Some(RegionShard::South));
        }
    }
}
