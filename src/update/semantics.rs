use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A rule verdict: whether the rule applies under the current mode, and the
/// reason surfaced to the client when it is violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleAndReason {
    pub enforced: bool,
    pub reason: &'static str,
}

impl RuleAndReason {
    const fn on(reason: &'static str) -> Self {
        RuleAndReason {
            enforced: true,
            reason,
        }
    }

    const fn off() -> Self {
        RuleAndReason {
            enforced: false,
            reason: "",
        }
    }
}

/// The update-semantics policy of a shard. A pure rule table: given a
/// command's requested version, each method says which invariant must hold.
///
/// * `Classic` — last write wins; no key or version requirements.
/// * `StrictInsert` — every add is an insert; the key must not exist.
/// * `StrictUpdate` — every add is an update; the key must exist.
/// * `VersionHybrid` — the requested version selects the behavior:
///   negative = insert-only, positive = version-asserted update, zero = no
///   assertion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SemanticsMode {
    Classic,
    StrictInsert,
    StrictUpdate,
    #[default]
    VersionHybrid,
}

impl SemanticsMode {
    pub fn require_unique_key_field_in_schema(&self) -> RuleAndReason {
        match self {
            SemanticsMode::Classic => RuleAndReason::off(),
            _ => RuleAndReason::on("the schema must declare a unique key field for this semantics mode"),
        }
    }

    pub fn require_unique_key_in_doc(&self) -> RuleAndReason {
        match self {
            SemanticsMode::Classic => RuleAndReason::off(),
            _ => RuleAndReason::on("every document must carry its unique key for this semantics mode"),
        }
    }

    pub fn require_version_field_in_schema(&self) -> RuleAndReason {
        match self {
            SemanticsMode::VersionHybrid => {
                RuleAndReason::on("the schema must declare the version field for version-hybrid semantics")
            }
            _ => RuleAndReason::off(),
        }
    }

    pub fn require_update_log(&self) -> RuleAndReason {
        match self {
            SemanticsMode::VersionHybrid => {
                RuleAndReason::on("an update log is required for version-hybrid semantics")
            }
            _ => RuleAndReason::off(),
        }
    }

    /// Leader-only: must the current version of the key be fetched before
    /// applying the command?
    pub fn need_to_lookup_existing(&self) -> bool {
        !matches!(self, SemanticsMode::Classic)
    }

    /// Reject the command when the key does not exist.
    pub fn require_existing_document(&self, requested_version: i64) -> RuleAndReason {
        match self {
            SemanticsMode::StrictUpdate => {
                RuleAndReason::on("updates require the document to already exist")
            }
            SemanticsMode::VersionHybrid if requested_version > 0 => {
                RuleAndReason::on("a positive requested version asserts that the document exists")
            }
            _ => RuleAndReason::off(),
        }
    }

    /// Reject the command when the key already exists.
    pub fn require_no_existing_document(&self, requested_version: i64) -> RuleAndReason {
        match self {
            SemanticsMode::StrictInsert => {
                RuleAndReason::on("inserts require the document to not already exist")
            }
            SemanticsMode::VersionHybrid if requested_version < 0 => {
                RuleAndReason::on("a negative requested version asserts that the document does not exist")
            }
            _ => RuleAndReason::off(),
        }
    }

    /// Reject the command when the current version differs from the
    /// requested one.
    pub fn require_version_equality(&self, requested_version: i64) -> RuleAndReason {
        match self {
            SemanticsMode::VersionHybrid if requested_version > 0 => {
                RuleAndReason::on("a positive requested version must equal the current version")
            }
            _ => RuleAndReason::off(),
        }
    }

    /// Whether applying this add must first remove the previous version of
    /// the document. Classic mode honors the per-command overwrite flag;
    /// every other mode always replaces.
    pub fn need_to_delete_old_version(&self, overwrite: bool) -> bool {
        match self {
            SemanticsMode::Classic => overwrite,
            _ => true,
        }
    }

    pub fn is_classic(&self) -> bool {
        matches!(self, SemanticsMode::Classic)
    }
}

impl fmt::Display for SemanticsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SemanticsMode::Classic => "classic",
            SemanticsMode::StrictInsert => "strict-insert",
            SemanticsMode::StrictUpdate => "strict-update",
            SemanticsMode::VersionHybrid => "version-hybrid",
        };
        f.write_str(s)
    }
}

impl FromStr for SemanticsMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "classic" => Ok(SemanticsMode::Classic),
            "strict-insert" => Ok(SemanticsMode::StrictInsert),
            "strict-update" => Ok(SemanticsMode::StrictUpdate),
            "version-hybrid" => Ok(SemanticsMode::VersionHybrid),
            other => Err(format!("unknown semantics mode '{}'", other)),
        }
    }
}
