use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Pipeline stages, in the order a run executes them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStage {
    Competitions,
    Teams,
    Games,
    FixtureValidation,
    FixtureCleanup,
}

impl SyncStage {
    pub const ALL: [SyncStage; 5] = [
        Self::Competitions,
        Self::Teams,
        Self::Games,
        Self::FixtureValidation,
        Self::FixtureCleanup,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Competitions => "competitions",
            Self::Teams => "teams",
            Self::Games => "games",
            Self::FixtureValidation => "fixture-validation",
            Self::FixtureCleanup => "fixture-cleanup",
        }
    }
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage '{s}'"))
    }
}
