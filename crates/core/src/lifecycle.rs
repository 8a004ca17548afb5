//! # Experiment Lifecycle
//!
//! Fixed status set and adjacency table. Every mutation of an experiment's
//! status goes through [`transition`]; an edge missing from the table is
//! always fatal to the calling operation.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Lifecycle states of an experiment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Classified,
    Reframed,
    Gated,
    Building,
    Built,
    Challenged,
    Doubted,
    Scouted,
    Verifying,
    Verified,
    Resolved,
    Compressed,
    Merged,
    DeadEnd,
}

impl ExperimentStatus {
    pub const ALL: [ExperimentStatus; 14] = [
        Self::Classified,
        Self::Reframed,
        Self::Gated,
        Self::Building,
        Self::Built,
        Self::Challenged,
        Self::Doubted,
        Self::Scouted,
        Self::Verifying,
        Self::Verified,
        Self::Resolved,
        Self::Compressed,
        Self::Merged,
        Self::DeadEnd,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Classified => "classified",
            Self::Reframed => "reframed",
            Self::Gated => "gated",
            Self::Building => "building",
            Self::Built => "built",
            Self::Challenged => "challenged",
            Self::Doubted => "doubted",
            Self::Scouted => "scouted",
            Self::Verifying => "verifying",
            Self::Verified => "verified",
            Self::Resolved => "resolved",
            Self::Compressed => "compressed",
            Self::Merged => "merged",
            Self::DeadEnd => "dead_end",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|v| v.as_str() == s)
    }
}

impl std::fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Legal targets for a given status. The only self-loops are
/// BUILDING -> BUILDING (retry after an unrecoverable extraction failure)
/// and GATED -> GATED (repeated hypothesis rejection). DEAD_END is reachable
/// from every non-terminal state: a tripped breaker or a losing swarm worker
/// can stall the cycle anywhere.
pub fn legal_targets(from: ExperimentStatus) -> &'static [ExperimentStatus] {
    use ExperimentStatus::*;
    match from {
        Classified => &[Reframed, Gated, DeadEnd],
        Reframed => &[Gated, DeadEnd],
        Gated => &[Gated, Building, DeadEnd],
        Building => &[Building, Built, DeadEnd],
        Built => &[Challenged, Doubted, Verifying, DeadEnd],
        Challenged => &[Doubted, Scouted, Verifying, DeadEnd],
        Doubted => &[Challenged, Scouted, Verifying, DeadEnd],
        Scouted => &[Verifying, DeadEnd],
        Verifying => &[Verified, DeadEnd],
        Verified => &[Resolved, DeadEnd],
        Resolved => &[Merged, Building, Compressed, DeadEnd],
        Compressed => &[Building, DeadEnd],
        Merged => &[],
        DeadEnd => &[],
    }
}

/// Validate a status change against the adjacency table.
pub fn transition(
    from: ExperimentStatus,
    to: ExperimentStatus,
) -> Result<ExperimentStatus, CoreError> {
    if legal_targets(from).contains(&to) {
        Ok(to)
    } else {
        Err(CoreError::InvalidTransition { from, to })
    }
}

/// Only MERGED and DEAD_END are final.
pub fn is_terminal(status: ExperimentStatus) -> bool {
    matches!(
        status,
        ExperimentStatus::Merged | ExperimentStatus::DeadEnd
    )
}

/// Deterministic next-step policy. Sequences the doubt/challenge pair without
/// duplication; RESOLVED is decided by the resolution engine, not here.
pub fn determine_next_step(
    status: ExperimentStatus,
    has_doubts: bool,
    has_challenges: bool,
) -> Option<ExperimentStatus> {
    use ExperimentStatus::*;
    match status {
        // A cheap quality gate precedes any expensive build.
        Classified | Reframed => Some(Gated),
        Gated => Some(Building),
        Building => Some(Built),
        Scouted => Some(Verifying),
        Built | Challenged | Doubted => {
            if !has_doubts && !has_challenges {
                Some(Doubted)
            } else if !has_challenges {
                Some(Challenged)
            } else if !has_doubts {
                Some(Doubted)
            } else {
                Some(Verifying)
            }
        }
        Verifying => Some(Verified),
        Verified => Some(Resolved),
        Compressed => Some(Building),
        Resolved | Merged | DeadEnd => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExperimentStatus::*;

    #[test]
    fn test_every_listed_edge_transitions() {
        for from in ExperimentStatus::ALL {
            for to in legal_targets(from) {
                assert_eq!(transition(from, *to).unwrap(), *to);
            }
        }
    }

    #[test]
    fn test_every_unlisted_edge_fails() {
        for from in ExperimentStatus::ALL {
            for to in ExperimentStatus::ALL {
                if !legal_targets(from).contains(&to) {
                    let err = transition(from, to).unwrap_err();
                    assert!(matches!(err, CoreError::InvalidTransition { .. }));
                }
            }
        }
    }

    #[test]
    fn test_exactly_two_self_loops() {
        let loops: Vec<_> = ExperimentStatus::ALL
            .iter()
            .filter(|s| legal_targets(**s).contains(s))
            .copied()
            .collect();
        assert_eq!(loops, vec![Gated, Building]);
    }

    #[test]
    fn test_terminal_states() {
        for status in ExperimentStatus::ALL {
            let expected = matches!(status, Merged | DeadEnd);
            assert_eq!(is_terminal(status), expected);
        }
        assert!(legal_targets(Merged).is_empty());
        assert!(legal_targets(DeadEnd).is_empty());
    }

    #[test]
    fn test_dead_end_reachable_from_every_non_terminal_state() {
        for from in ExperimentStatus::ALL {
            if is_terminal(from) {
                assert!(transition(from, DeadEnd).is_err());
            } else {
                assert_eq!(transition(from, DeadEnd).unwrap(), DeadEnd);
            }
        }
    }

    #[test]
    fn test_doubt_challenge_sequencing() {
        // Neither exists yet: doubt first.
        assert_eq!(determine_next_step(Built, false, false), Some(Doubted));
        // Whichever is missing comes next.
        assert_eq!(determine_next_step(Doubted, true, false), Some(Challenged));
        assert_eq!(determine_next_step(Challenged, false, true), Some(Doubted));
        // Both present: verification.
        assert_eq!(determine_next_step(Challenged, true, true), Some(Verifying));
        assert_eq!(determine_next_step(Doubted, true, true), Some(Verifying));
    }

    #[test]
    fn test_gate_precedes_build() {
        assert_eq!(determine_next_step(Classified, false, false), Some(Gated));
        assert_eq!(determine_next_step(Reframed, false, false), Some(Gated));
        assert_eq!(determine_next_step(Gated, false, false), Some(Building));
    }

    #[test]
    fn test_resolution_not_decided_here() {
        assert_eq!(determine_next_step(Resolved, true, true), None);
        assert_eq!(determine_next_step(Merged, true, true), None);
        assert_eq!(determine_next_step(DeadEnd, true, true), None);
    }

    #[test]
    fn test_status_round_trip() {
        for status in ExperimentStatus::ALL {
            assert_eq!(ExperimentStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ExperimentStatus::parse("bogus"), None);
    }
}
