//! Aggregate grading. The overall grade of an experiment is the worst grade
//! across its component verifications; one rejected component rejects the
//! whole experiment.

use crate::error::CoreError;
use crate::state::Grade;
use anyhow::Result;

/// Worst grade in the set by fixed severity order.
///
/// An empty set is an error, not a pass: resolution must never run against
/// zero verifications.
pub fn worst_grade(grades: &[Grade]) -> Result<Grade> {
    grades
        .iter()
        .copied()
        .max_by_key(|g| g.severity())
        .ok_or_else(|| CoreError::EmptyVerificationSet.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worst_dominates() {
        assert_eq!(
            worst_grade(&[Grade::Sound, Grade::Good, Grade::Sound]).unwrap(),
            Grade::Good
        );
        assert_eq!(
            worst_grade(&[Grade::Sound, Grade::Rejected, Grade::Good]).unwrap(),
            Grade::Rejected
        );
        assert_eq!(worst_grade(&[Grade::Sound]).unwrap(), Grade::Sound);
    }

    #[test]
    fn test_order_invariant() {
        let mut grades = vec![Grade::Weak, Grade::Sound, Grade::Good];
        let forward = worst_grade(&grades).unwrap();
        grades.reverse();
        assert_eq!(worst_grade(&grades).unwrap(), forward);
        assert_eq!(forward, Grade::Weak);
    }

    #[test]
    fn test_empty_set_is_error() {
        let err = worst_grade(&[]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CoreError>(),
            Some(CoreError::EmptyVerificationSet)
        ));
    }
}
