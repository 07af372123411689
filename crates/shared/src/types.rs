//! Shared domain types

use serde::{Deserialize, Serialize};

/// Who an enrollment covers. Add-on pricing varies by tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageTier {
    Individual,
    Spouse,
    Child,
    Family,
}

impl CoverageTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoverageTier::Individual => "individual",
            CoverageTier::Spouse => "spouse",
            CoverageTier::Child => "child",
            CoverageTier::Family => "family",
        }
    }

    /// Parse the stored column value. Unknown values are rejected rather than
    /// defaulted so a typo never silently reprices an enrollment.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "individual" => Some(CoverageTier::Individual),
            "spouse" => Some(CoverageTier::Spouse),
            "child" => Some(CoverageTier::Child),
            "family" => Some(CoverageTier::Family),
            _ => None,
        }
    }
}

impl std::fmt::Display for CoverageTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_matches_as_str() {
        for tier in [
            CoverageTier::Individual,
            CoverageTier::Spouse,
            CoverageTier::Child,
            CoverageTier::Family,
        ] {
            assert_eq!(CoverageTier::parse(tier.as_str()), Some(tier));
        }
        assert_eq!(CoverageTier::parse("Family"), None);
    }

    #[test]
    fn test_serde_uses_snake_case() {
        let json = serde_json::to_string(&CoverageTier::Family).unwrap();
        assert_eq!(json, "\"family\"");
    }
}
