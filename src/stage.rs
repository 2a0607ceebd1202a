//! Stage types and their step sequences.
//!
//! A session runs three stages in order, each a fixed sequence of steps:
//!
//! | Stage | Steps | Statuses |
//! |-------|-------|----------|
//! |TRIPLES|1..=11|`STEP_1`..`STEP_10`, `COMPLETED`|
//! |PRESIGN|1..=3|`STEP_1`, `STEP_2`, `COMPLETED`|
//! |SIGN|1|`COMPLETED`|
//!
//! The status of a stage is the status reached by the last step executed,
//! so the ordinal of a status is the number of steps behind it, and the last
//! step of a stage always lands on `COMPLETED`.
//!
//! Steps and statuses are closed per stage type, so asking for, say, the
//! eleventh step of a presignature is unrepresentable.
use core::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

macro_rules! ordinal_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident = $n:literal => $s:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $s)] $variant = $n),+
        }

        impl $name {
            pub fn ordinal(&self) -> u8 {
                *self as u8
            }

            pub fn from_ordinal(n: u8) -> Option<Self> {
                match n {
                    $($n => Some($name::$variant),)+
                    _ => None,
                }
            }

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $s),+
                }
            }
        }
    };
}

ordinal_enum!(
    /// A step of triple generation.
    TriplesStep {
        Step1 = 1 => "STEP_1",
        Step2 = 2 => "STEP_2",
        Step3 = 3 => "STEP_3",
        Step4 = 4 => "STEP_4",
        Step5 = 5 => "STEP_5",
        Step6 = 6 => "STEP_6",
        Step7 = 7 => "STEP_7",
        Step8 = 8 => "STEP_8",
        Step9 = 9 => "STEP_9",
        Step10 = 10 => "STEP_10",
        Step11 = 11 => "STEP_11",
    }
);

ordinal_enum!(
    /// The status of a triples stage.
    TriplesStatus {
        Step1 = 1 => "STEP_1",
        Step2 = 2 => "STEP_2",
        Step3 = 3 => "STEP_3",
        Step4 = 4 => "STEP_4",
        Step5 = 5 => "STEP_5",
        Step6 = 6 => "STEP_6",
        Step7 = 7 => "STEP_7",
        Step8 = 8 => "STEP_8",
        Step9 = 9 => "STEP_9",
        Step10 = 10 => "STEP_10",
        Completed = 11 => "COMPLETED",
    }
);

ordinal_enum!(
    /// A step of presignature generation.
    PresignStep {
        Step1 = 1 => "STEP_1",
        Step2 = 2 => "STEP_2",
        Step3 = 3 => "STEP_3",
    }
);

ordinal_enum!(
    /// The status of a presign stage.
    PresignStatus {
        Step1 = 1 => "STEP_1",
        Step2 = 2 => "STEP_2",
        Completed = 3 => "COMPLETED",
    }
);

ordinal_enum!(
    /// The single signing step.
    SignStep {
        Step1 = 1 => "STEP_1",
    }
);

ordinal_enum!(
    /// The status of a sign stage.
    SignStatus {
        Completed = 1 => "COMPLETED",
    }
);

/// The three phases of a signing session, in the order they must run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StageType {
    Triples,
    Presign,
    Sign,
}

impl StageType {
    pub const ALL: [StageType; 3] = [StageType::Triples, StageType::Presign, StageType::Sign];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageType::Triples => "TRIPLES",
            StageType::Presign => "PRESIGN",
            StageType::Sign => "SIGN",
        }
    }

    /// The number of round trips this stage takes.
    pub fn step_count(&self) -> u8 {
        match self {
            StageType::Triples => 11,
            StageType::Presign => 3,
            StageType::Sign => 1,
        }
    }

    /// The stage which must be completed before this one can start.
    pub fn previous(&self) -> Option<StageType> {
        match self {
            StageType::Triples => None,
            StageType::Presign => Some(StageType::Triples),
            StageType::Sign => Some(StageType::Presign),
        }
    }

    pub fn tag(&self) -> u8 {
        match self {
            StageType::Triples => 0,
            StageType::Presign => 1,
            StageType::Sign => 2,
        }
    }
}

impl fmt::Display for StageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageType {
    type Err = String;

    /// Parse a stage from its wire name, in either case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TRIPLES" => Ok(StageType::Triples),
            "PRESIGN" => Ok(StageType::Presign),
            "SIGN" => Ok(StageType::Sign),
            _ => Err(format!("unknown stage type: {s}")),
        }
    }
}

/// The status of a stage, closed over its type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageStatus {
    Triples(TriplesStatus),
    Presign(PresignStatus),
    Sign(SignStatus),
}

impl StageStatus {
    pub fn stage_type(&self) -> StageType {
        match self {
            StageStatus::Triples(_) => StageType::Triples,
            StageStatus::Presign(_) => StageType::Presign,
            StageStatus::Sign(_) => StageType::Sign,
        }
    }

    /// The number of steps executed to reach this status.
    pub fn ordinal(&self) -> u8 {
        match self {
            StageStatus::Triples(s) => s.ordinal(),
            StageStatus::Presign(s) => s.ordinal(),
            StageStatus::Sign(s) => s.ordinal(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.ordinal() == self.stage_type().step_count()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Triples(s) => s.as_str(),
            StageStatus::Presign(s) => s.as_str(),
            StageStatus::Sign(s) => s.as_str(),
        }
    }

    /// The status of some stage after a given number of steps.
    pub fn from_ordinal(stage: StageType, n: u8) -> Option<Self> {
        match stage {
            StageType::Triples => TriplesStatus::from_ordinal(n).map(StageStatus::Triples),
            StageType::Presign => PresignStatus::from_ordinal(n).map(StageStatus::Presign),
            StageType::Sign => SignStatus::from_ordinal(n).map(StageStatus::Sign),
        }
    }

    /// The completed status of a stage.
    pub fn completed(stage: StageType) -> Self {
        match stage {
            StageType::Triples => StageStatus::Triples(TriplesStatus::Completed),
            StageType::Presign => StageStatus::Presign(PresignStatus::Completed),
            StageType::Sign => StageStatus::Sign(SignStatus::Completed),
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.stage_type(), self.as_str())
    }
}

/// A requested step, closed over its stage type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageStep {
    Triples(TriplesStep),
    Presign(PresignStep),
    Sign(SignStep),
}

impl StageStep {
    /// Build a step from a stage and a 1-based step number.
    pub fn new(stage: StageType, n: u8) -> Option<Self> {
        match stage {
            StageType::Triples => TriplesStep::from_ordinal(n).map(StageStep::Triples),
            StageType::Presign => PresignStep::from_ordinal(n).map(StageStep::Presign),
            StageType::Sign => SignStep::from_ordinal(n).map(StageStep::Sign),
        }
    }

    pub fn stage_type(&self) -> StageType {
        match self {
            StageStep::Triples(_) => StageType::Triples,
            StageStep::Presign(_) => StageType::Presign,
            StageStep::Sign(_) => StageType::Sign,
        }
    }

    pub fn ordinal(&self) -> u8 {
        match self {
            StageStep::Triples(s) => s.ordinal(),
            StageStep::Presign(s) => s.ordinal(),
            StageStep::Sign(s) => s.ordinal(),
        }
    }

    /// Whether this step creates its stage.
    pub fn is_first(&self) -> bool {
        self.ordinal() == 1
    }

    /// Whether this step completes its stage.
    pub fn is_last(&self) -> bool {
        self.ordinal() == self.stage_type().step_count()
    }

    /// The status the stage must be in for this step to run.
    ///
    /// The first step of a stage has no predecessor: the stage must not exist yet.
    pub fn predecessor(&self) -> Option<StageStatus> {
        if self.is_first() {
            return None;
        }
        StageStatus::from_ordinal(self.stage_type(), self.ordinal() - 1)
    }

    /// The status the stage is in once this step has run.
    pub fn outcome(&self) -> StageStatus {
        StageStatus::from_ordinal(self.stage_type(), self.ordinal())
            .unwrap_or_else(|| StageStatus::completed(self.stage_type()))
    }
}

impl fmt::Display for StageStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} step {}", self.stage_type(), self.ordinal())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_step_bounds() {
        assert!(StageStep::new(StageType::Triples, 11).is_some());
        assert!(StageStep::new(StageType::Triples, 12).is_none());
        assert!(StageStep::new(StageType::Presign, 0).is_none());
        assert!(StageStep::new(StageType::Presign, 4).is_none());
        assert!(StageStep::new(StageType::Sign, 2).is_none());
    }

    #[test]
    fn test_triples_sequence() {
        let first = StageStep::Triples(TriplesStep::Step1);
        assert_eq!(first.predecessor(), None);
        assert_eq!(first.outcome(), StageStatus::Triples(TriplesStatus::Step1));

        let last = StageStep::Triples(TriplesStep::Step11);
        assert_eq!(
            last.predecessor(),
            Some(StageStatus::Triples(TriplesStatus::Step10))
        );
        assert_eq!(last.outcome(), StageStatus::Triples(TriplesStatus::Completed));
        assert!(last.outcome().is_completed());
        assert!(!StageStatus::Triples(TriplesStatus::Step10).is_completed());
    }

    #[test]
    fn test_presign_sequence() {
        let steps: Vec<_> = (1..=3)
            .map(|n| StageStep::new(StageType::Presign, n).unwrap())
            .collect();
        assert_eq!(steps[0].outcome().as_str(), "STEP_1");
        assert_eq!(steps[1].predecessor(), Some(steps[0].outcome()));
        assert_eq!(steps[2].predecessor(), Some(steps[1].outcome()));
        assert_eq!(steps[2].outcome().as_str(), "COMPLETED");
    }

    #[test]
    fn test_sign_is_single_step() {
        let step = StageStep::Sign(SignStep::Step1);
        assert!(step.is_first() && step.is_last());
        assert_eq!(step.predecessor(), None);
        assert!(step.outcome().is_completed());
    }

    #[test]
    fn test_stage_order() {
        assert_eq!(StageType::Triples.previous(), None);
        assert_eq!(StageType::Presign.previous(), Some(StageType::Triples));
        assert_eq!(StageType::Sign.previous(), Some(StageType::Presign));
        assert_eq!("presign".parse::<StageType>(), Ok(StageType::Presign));
    }

    #[test]
    fn test_status_names() {
        assert_eq!(
            serde_json::to_string(&TriplesStatus::Step10).unwrap(),
            "\"STEP_10\""
        );
        assert_eq!(
            serde_json::to_string(&StageType::Presign).unwrap(),
            "\"PRESIGN\""
        );
    }
}
