//! Closed capability taxonomy used for task/worker matching.
//!
//! Capabilities are parsed once, when the worker registry loads or when the
//! decomposer tags a clause. Matching afterwards is plain enum set inclusion.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A named skill tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Research,
    Implement,
    Test,
    Validate,
    Document,
    Review,
}

/// Ordered set of capabilities. `BTreeSet` keeps serialization and
/// iteration deterministic.
pub type CapabilitySet = BTreeSet<Capability>;

/// Word stems that signal each capability, checked against lowercased words.
const KEYWORD_STEMS: &[(&str, Capability)] = &[
    ("research", Capability::Research),
    ("investigat", Capability::Research),
    ("analy", Capability::Research),
    ("explor", Capability::Research),
    ("survey", Capability::Research),
    ("compar", Capability::Research),
    ("implement", Capability::Implement),
    ("build", Capability::Implement),
    ("develop", Capability::Implement),
    ("refactor", Capability::Implement),
    ("fix", Capability::Implement),
    ("code", Capability::Implement),
    ("create", Capability::Implement),
    ("test", Capability::Test),
    ("benchmark", Capability::Test),
    ("validat", Capability::Validate),
    ("verif", Capability::Validate),
    ("audit", Capability::Validate),
    ("document", Capability::Document),
    ("docs", Capability::Document),
    ("readme", Capability::Document),
    ("review", Capability::Review),
    ("critique", Capability::Review),
];

impl Capability {
    pub const ALL: [Capability; 6] = [
        Capability::Research,
        Capability::Implement,
        Capability::Test,
        Capability::Validate,
        Capability::Document,
        Capability::Review,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::Implement => "implement",
            Self::Test => "test",
            Self::Validate => "validate",
            Self::Document => "document",
            Self::Review => "review",
        }
    }

    /// Map a single lowercased word to a capability, if it carries one.
    pub fn from_keyword(word: &str) -> Option<Capability> {
        KEYWORD_STEMS
            .iter()
            .find(|(stem, _)| word.starts_with(stem))
            .map(|(_, cap)| *cap)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown capability '{0}'")]
pub struct UnknownCapability(pub String);

impl FromStr for Capability {
    type Err = UnknownCapability;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        Capability::ALL
            .iter()
            .copied()
            .find(|cap| cap.as_str() == normalized)
            .ok_or(UnknownCapability(s.to_string()))
    }
}

/// Render a capability set as a comma separated list.
pub fn format_capabilities(caps: &CapabilitySet) -> String {
    caps.iter()
        .map(Capability::as_str)
        .collect::<Vec<_>>()
        .join(",")
}
