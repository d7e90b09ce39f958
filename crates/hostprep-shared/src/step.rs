//! Provisioning step ordinals.
//!
//! A step is never stored. It is recomputed from live probes every time a
//! consumer asks, so the ordinal always names the least-satisfied
//! prerequisite on the host.

use serde::{Deserialize, Serialize};

/// Number of executable actions (features, subsystem, engine)
pub const ACTION_COUNT: u32 = 3;

/// Stage of the provisioning flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Hypervisor platform and/or Linux subsystem feature not enabled
    NeedFeatures,
    /// Subsystem runtime missing or below the required major version
    NeedSubsystem,
    /// Container engine not reachable
    NeedEngine,
    /// Every prerequisite is satisfied
    Complete,
}

impl Step {
    /// All steps in flow order
    pub const ALL: [Step; 4] = [
        Step::NeedFeatures,
        Step::NeedSubsystem,
        Step::NeedEngine,
        Step::Complete,
    ];

    /// 0-based ordinal (0 = features .. 3 = complete)
    pub fn ordinal(self) -> u32 {
        match self {
            Self::NeedFeatures => 0,
            Self::NeedSubsystem => 1,
            Self::NeedEngine => 2,
            Self::Complete => 3,
        }
    }

    pub fn from_ordinal(ordinal: u32) -> Option<Self> {
        Self::ALL.get(ordinal as usize).copied()
    }

    /// 1-based action number accepted by `execute_step`, `None` once complete.
    pub fn action_number(self) -> Option<u32> {
        match self {
            Self::Complete => None,
            other => Some(other.ordinal() + 1),
        }
    }

    /// Inverse of [`Step::action_number`].
    pub fn from_action_number(action: u32) -> Option<Self> {
        match action {
            1..=ACTION_COUNT => Self::from_ordinal(action - 1),
            _ => None,
        }
    }

    pub fn is_complete(self) -> bool {
        self == Self::Complete
    }

    /// Short title for display
    pub fn title(self) -> &'static str {
        match self {
            Self::NeedFeatures => "Enable Windows features",
            Self::NeedSubsystem => "Install WSL",
            Self::NeedEngine => "Install Docker",
            Self::Complete => "Installation complete",
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NeedFeatures => write!(f, "need_features"),
            Self::NeedSubsystem => write!(f, "need_subsystem"),
            Self::NeedEngine => write!(f, "need_engine"),
            Self::Complete => write!(f, "complete"),
        }
    }
}
