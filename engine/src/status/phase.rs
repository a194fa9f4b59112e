use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle phase of one run.
///
/// External string forms: `PENDING`, `PLANNING`, `EXECUTING_STEP_<n>`,
/// `FINALIZING`, `COMPLETED`, `FAILED`. `COMBINING` is accepted as a legacy
/// spelling of `FINALIZING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Phase {
    Pending,
    Planning,
    ExecutingStep(u32),
    Finalizing,
    Completed,
    Failed,
}

impl Phase {
    /// Position in the phase sequence. Terminal phases share the top rank.
    pub fn rank(&self) -> (u8, u32) {
        match self {
            Phase::Pending => (0, 0),
            Phase::Planning => (1, 0),
            Phase::ExecutingStep(n) => (2, *n),
            Phase::Finalizing => (3, 0),
            Phase::Completed | Phase::Failed => (4, 0),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }

    /// Whether a record in `self` may move to `next`.
    ///
    /// Terminal phases accept nothing. Otherwise the move must not go
    /// backwards; staying in place is allowed.
    pub fn can_advance_to(&self, next: Phase) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Pending => write!(f, "PENDING"),
            Phase::Planning => write!(f, "PLANNING"),
            Phase::ExecutingStep(n) => write!(f, "EXECUTING_STEP_{}", n),
            Phase::Finalizing => write!(f, "FINALIZING"),
            Phase::Completed => write!(f, "COMPLETED"),
            Phase::Failed => write!(f, "FAILED"),
        }
    }
}

/// Unrecognized phase string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown phase '{0}'")]
pub struct ParsePhaseError(pub String);

impl FromStr for Phase {
    type Err = ParsePhaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase();
        match normalized.as_str() {
            "PENDING" | "INIT" => Ok(Phase::Pending),
            "PLANNING" => Ok(Phase::Planning),
            "FINALIZING" | "COMBINING" => Ok(Phase::Finalizing),
            "COMPLETED" => Ok(Phase::Completed),
            "FAILED" => Ok(Phase::Failed),
            other => other
                .strip_prefix("EXECUTING_STEP_")
                .and_then(|n| n.parse::<u32>().ok())
                .filter(|n| *n > 0)
                .map(Phase::ExecutingStep)
                .ok_or_else(|| ParsePhaseError(s.to_string())),
        }
    }
}

impl From<Phase> for String {
    fn from(phase: Phase) -> Self {
        phase.to_string()
    }
}

impl TryFrom<String> for Phase {
    type Error = ParsePhaseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_parse() {
        let phases = [
            Phase::Pending,
            Phase::Planning,
            Phase::ExecutingStep(1),
            Phase::ExecutingStep(12),
            Phase::Finalizing,
            Phase::Completed,
            Phase::Failed,
        ];
        for phase in phases {
            assert_eq!(phase.to_string().parse::<Phase>().unwrap(), phase);
        }
        assert_eq!(Phase::ExecutingStep(3).to_string(), "EXECUTING_STEP_3");
        assert_eq!("COMBINING".parse::<Phase>().unwrap(), Phase::Finalizing);
    }

    #[test]
    fn test_rejects_unknown() {
        assert!("EXECUTING_STEP_".parse::<Phase>().is_err());
        assert!("EXECUTING_STEP_0".parse::<Phase>().is_err());
        assert!("RUNNING".parse::<Phase>().is_err());
    }

    #[test]
    fn test_monotonic_transitions() {
        assert!(Phase::Pending.can_advance_to(Phase::Planning));
        assert!(Phase::Planning.can_advance_to(Phase::ExecutingStep(1)));
        assert!(Phase::ExecutingStep(1).can_advance_to(Phase::ExecutingStep(2)));
        assert!(Phase::ExecutingStep(2).can_advance_to(Phase::ExecutingStep(2)));
        assert!(!Phase::ExecutingStep(2).can_advance_to(Phase::ExecutingStep(1)));
        assert!(!Phase::Finalizing.can_advance_to(Phase::Planning));
        assert!(Phase::Planning.can_advance_to(Phase::Failed));
    }

    #[test]
    fn test_terminal_is_sticky() {
        for terminal in [Phase::Completed, Phase::Failed] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_advance_to(Phase::Completed));
            assert!(!terminal.can_advance_to(Phase::Failed));
            assert!(!terminal.can_advance_to(Phase::Planning));
        }
    }

    #[test]
    fn test_serde_uses_external_strings() {
        let json = serde_json::to_string(&Phase::ExecutingStep(4)).unwrap();
        assert_eq!(json, "\"EXECUTING_STEP_4\"");
        let parsed: Phase = serde_json::from_str("\"COMPLETED\"").unwrap();
        assert_eq!(parsed, Phase::Completed);
    }
}
