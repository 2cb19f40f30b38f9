//! Integer identifiers shared with the datastore.

use serde::{Deserialize, Serialize};

/// Error returned when an identifier cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind} id: {value:?}")]
pub struct IdParseError {
    /// Identifier kind
    pub kind: &'static str,
    /// Offending input
    pub value: String,
}

macro_rules! integer_id {
    ($(#[$doc:meta])* $name:ident, $kind:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// Raw integer value.
            pub fn get(self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim().parse().map(Self).map_err(|_| IdParseError {
                    kind: $kind,
                    value: s.to_string(),
                })
            }
        }
    };
}

integer_id!(
    /// Identifier of a rule (test).
    RuleId, "rule"
);
integer_id!(
    /// Identifier grouping every result of one execution.
    RuntimeId, "runtime"
);
integer_id!(
    /// Identifier of a published package (one document).
    PackageId, "package"
);
integer_id!(
    /// Identifier of a publishing organisation.
    OrganisationId, "organisation"
);
integer_id!(
    /// Identifier of a configured info metric.
    InfoId, "info"
);
