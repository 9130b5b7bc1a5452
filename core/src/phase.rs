//! Lifecycle phases.
//!
//! Phases form a fixed linear sequence; a workflow advances through them in
//! order and only when the exit gate for the current phase passes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A software-delivery lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Requirements,
    Design,
    Implementation,
    Testing,
    Deployment,
}

impl Phase {
    /// The full phase sequence in execution order.
    pub fn sequence() -> [Phase; 5] {
        [
            Phase::Requirements,
            Phase::Design,
            Phase::Implementation,
            Phase::Testing,
            Phase::Deployment,
        ]
    }

    /// The phase executed immediately before this one, if any.
    pub fn predecessor(&self) -> Option<Phase> {
        let seq = Phase::sequence();
        let idx = seq.iter().position(|p| p == self)?;
        if idx == 0 {
            None
        } else {
            Some(seq[idx - 1])
        }
    }

    /// The phase executed immediately after this one, if any.
    pub fn successor(&self) -> Option<Phase> {
        let seq = Phase::sequence();
        let idx = seq.iter().position(|p| p == self)?;
        seq.get(idx + 1).copied()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Requirements => "requirements",
            Phase::Design => "design",
            Phase::Implementation => "implementation",
            Phase::Testing => "testing",
            Phase::Deployment => "deployment",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "requirements" => Ok(Phase::Requirements),
            "design" => Ok(Phase::Design),
            "implementation" => Ok(Phase::Implementation),
            "testing" => Ok(Phase::Testing),
            "deployment" => Ok(Phase::Deployment),
            _ => Err(format!("Unknown phase: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_order() {
        let seq = Phase::sequence();
        assert_eq!(seq[0], Phase::Requirements);
        assert_eq!(seq[4], Phase::Deployment);
    }

    #[test]
    fn test_predecessor_chain() {
        assert_eq!(Phase::Requirements.predecessor(), None);
        assert_eq!(Phase::Design.predecessor(), Some(Phase::Requirements));
        assert_eq!(Phase::Deployment.predecessor(), Some(Phase::Testing));
    }

    #[test]
    fn test_successor_chain() {
        assert_eq!(Phase::Requirements.successor(), Some(Phase::Design));
        assert_eq!(Phase::Deployment.successor(), None);
    }

    #[test]
    fn test_serde_snake_case() {
        let json = serde_json::to_string(&Phase::Implementation).unwrap();
        assert_eq!(json, r#""implementation""#);
        let parsed: Phase = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, Phase::Implementation);
    }

    #[test]
    fn test_from_str_case_insensitive() {
        assert_eq!("Testing".parse::<Phase>().unwrap(), Phase::Testing);
        assert!("shipping".parse::<Phase>().is_err());
    }
}
