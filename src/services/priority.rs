//! Priority arbitration among geofences entered in the same pass

use crate::domain::types::GeofenceId;

/// Something that competes for the single entry notification
pub trait Prioritized {
    fn priority(&self) -> i32;
    fn geofence_id(&self) -> &GeofenceId;
}

/// Index of the candidate that gets to notify
///
/// Lowest priority number wins; ties go to the smaller geofence id so the
/// outcome does not depend on repository ordering.
pub fn select<T: Prioritized>(candidates: &[T]) -> Option<usize> {
    candidates
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| {
            a.priority().cmp(&b.priority()).then_with(|| a.geofence_id().cmp(b.geofence_id()))
        })
        .map(|(idx, _)| idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Candidate(GeofenceId, i32);

    impl Prioritized for Candidate {
        fn priority(&self) -> i32 {
            self.1
        }
        fn geofence_id(&self) -> &GeofenceId {
            &self.0
        }
    }

    fn c(id: &str, priority: i32) -> Candidate {
        Candidate(GeofenceId::new(id), priority)
    }

    #[test]
    fn test_lowest_priority_number_wins() {
        let candidates = [c("g-3", 3), c("g-1", 1), c("g-5", 5)];
        assert_eq!(select(&candidates), Some(1));
    }

    #[test]
    fn test_tie_broken_by_geofence_id() {
        let candidates = [c("g-b", 2), c("g-a", 2)];
        assert_eq!(select(&candidates), Some(1));
    }

    #[test]
    fn test_empty_and_single() {
        let none: [Candidate; 0] = [];
        assert_eq!(select(&none), None);
        assert_eq!(select(&[c("only", 9)]), Some(0));
    }

    #[test]
    fn test_negative_priorities() {
        let candidates = [c("g-1", 0), c("g-2", -1)];
        assert_eq!(select(&candidates), Some(1));
    }
}
