//! Boundary classification for one (user, geofence) pair

use crate::domain::types::PresenceStatus;

/// What one admitted sample means for one geofence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Previously outside or unknown, now inside
    Entry,
    /// Previously inside, now outside; starts (or continues) exit confirmation
    ExitCandidate,
    SteadyInside,
    SteadyOutside,
    /// Back inside while an exit was waiting for confirmation
    Return,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Entry => "entry",
            Transition::ExitCandidate => "exit_candidate",
            Transition::SteadyInside => "steady_inside",
            Transition::SteadyOutside => "steady_outside",
            Transition::Return => "return",
        }
    }
}

/// Inclusive containment: a sample exactly on the radius is inside
#[inline]
pub fn is_inside(distance_m: f64, radius_m: f64) -> bool {
    distance_m <= radius_m
}

/// Classify a sample against the pair's previous status
///
/// `exit_pending` distinguishes a return from an ordinary steady-inside
/// reading. While an exit is pending the persisted status is still `Inside`.
pub fn classify(
    distance_m: f64,
    radius_m: f64,
    previous: Option<PresenceStatus>,
    exit_pending: bool,
) -> Transition {
    let inside = is_inside(distance_m, radius_m);
    match (previous, inside) {
        (Some(PresenceStatus::Inside), true) if exit_pending => Transition::Return,
        (Some(PresenceStatus::Inside), true) => Transition::SteadyInside,
        (Some(PresenceStatus::Inside), false) => Transition::ExitCandidate,
        (_, true) => Transition::Entry,
        (_, false) => Transition::SteadyOutside,
    }
}
