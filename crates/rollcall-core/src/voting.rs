//! Session voting engine.
//!
//! Accumulates per-frame match candidates over the life of a session and
//! decides final presence at session end. A single frame is never enough:
//! a student must be matched in at least `min_frames` distinct frames
//! (or clear the optional high-confidence short-circuit) to be marked
//! present.

use crate::matcher::FrameMatch;
use crate::types::AttendanceStatus;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use uuid::Uuid;

/// Tunable voting thresholds. Field-per-config-key; see the daemon's
/// `ROLLCALL_*` variables.
#[derive(Debug, Clone)]
pub struct VotingPolicy {
    /// Minimum number of distinct frames with a qualifying match (K).
    pub min_frames: u32,
    /// A first qualifying match later than this after session start marks
    /// the student late instead of present. `None` disables late marking.
    pub late_after: Option<Duration>,
    /// A single match at or above this confidence marks the student present
    /// regardless of frame count. `None` disables the short-circuit.
    pub high_confidence: Option<f32>,
}

impl Default for VotingPolicy {
    fn default() -> Self {
        Self {
            min_frames: 3,
            late_after: None,
            high_confidence: None,
        }
    }
}

/// Running per-student vote state.
#[derive(Debug, Clone, Default)]
pub struct VoteTally {
    pub frames_matched: u32,
    pub best_confidence: f32,
    pub first_match_at: Option<DateTime<Utc>>,
}

/// Final decision for one enrolled student.
#[derive(Debug, Clone)]
pub struct FinalMark {
    pub student_id: Uuid,
    pub status: AttendanceStatus,
    pub confidence: f32,
}

/// Vote accumulator for one session. Owned by the session for its active
/// lifetime and dropped at the Ended transition.
#[derive(Debug, Default)]
pub struct SessionVotes {
    frames_seen: u32,
    tallies: HashMap<Uuid, VoteTally>,
}

impl SessionVotes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the matches of one submitted frame.
    ///
    /// Every frame counts toward `frames_seen`, including failed
    /// extractions submitted with zero candidates. Matches are already
    /// deduplicated per frame, so each student tallies at most once here.
    pub fn observe(&mut self, matches: &[FrameMatch], at: DateTime<Utc>) {
        self.frames_seen += 1;
        for m in matches {
            let Some(student_id) = m.student_id else {
                continue;
            };
            let tally = self.tallies.entry(student_id).or_default();
            tally.frames_matched += 1;
            if m.confidence > tally.best_confidence {
                tally.best_confidence = m.confidence;
            }
            tally.first_match_at.get_or_insert(at);
        }
    }

    pub fn frames_seen(&self) -> u32 {
        self.frames_seen
    }

    pub fn tally(&self, student_id: Uuid) -> Option<&VoteTally> {
        self.tallies.get(&student_id)
    }

    /// Convert accumulated tallies into one mark per enrolled student.
    ///
    /// Students never matched come out absent; so does everyone when no
    /// frame was submitted, or when `min_frames` exceeds the frames seen
    /// and the short-circuit is off — short sessions must not produce
    /// spurious presence.
    pub fn finalize(
        &self,
        enrolled: &[Uuid],
        policy: &VotingPolicy,
        started_at: DateTime<Utc>,
    ) -> Vec<FinalMark> {
        enrolled
            .iter()
            .map(|&student_id| {
                let (status, confidence) = match self.tallies.get(&student_id) {
                    Some(tally) => self.decide(tally, policy, started_at),
                    None => (AttendanceStatus::Absent, 0.0),
                };
                FinalMark {
                    student_id,
                    status,
                    confidence,
                }
            })
            .collect()
    }

    fn decide(
        &self,
        tally: &VoteTally,
        policy: &VotingPolicy,
        started_at: DateTime<Utc>,
    ) -> (AttendanceStatus, f32) {
        let by_count = tally.frames_matched >= policy.min_frames;
        let by_confidence = policy
            .high_confidence
            .map_or(false, |hc| tally.best_confidence >= hc);

        if !(by_count || by_confidence) {
            return (AttendanceStatus::Absent, tally.best_confidence);
        }

        let late = match (policy.late_after, tally.first_match_at) {
            (Some(grace), Some(first)) => first > started_at + grace,
            _ => false,
        };
        let status = if late {
            AttendanceStatus::Late
        } else {
            AttendanceStatus::Present
        };
        (status, tally.best_confidence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matched(student_id: Uuid, confidence: f32) -> FrameMatch {
        FrameMatch {
            student_id: Some(student_id),
            distance: 0.1,
            confidence,
        }
    }

    fn unknown() -> FrameMatch {
        FrameMatch {
            student_id: None,
            distance: 0.9,
            confidence: 0.0,
        }
    }

    fn policy(min_frames: u32) -> VotingPolicy {
        VotingPolicy {
            min_frames,
            late_after: None,
            high_confidence: None,
        }
    }

    #[test]
    fn test_never_matched_is_absent() {
        let start = Utc::now();
        let mut votes = SessionVotes::new();
        let x = Uuid::new_v4();
        let y = Uuid::new_v4();
        for _ in 0..5 {
            votes.observe(&[matched(x, 0.8)], start);
        }
        let marks = votes.finalize(&[x, y], &policy(3), start);
        let status_of = |id| {
            marks
                .iter()
                .find(|m| m.student_id == id)
                .map(|m| m.status)
                .unwrap()
        };
        assert_eq!(status_of(x), AttendanceStatus::Present);
        assert_eq!(status_of(y), AttendanceStatus::Absent);
    }

    #[test]
    fn test_k_rule_order_independent() {
        // X matched in frames 1, 3, 4 of 5; Y only in frame 2.
        let start = Utc::now();
        let x = Uuid::new_v4();
        let y = Uuid::new_v4();
        let frames: Vec<Vec<FrameMatch>> = vec![
            vec![matched(x, 0.7)],
            vec![matched(y, 0.7)],
            vec![matched(x, 0.6), unknown()],
            vec![matched(x, 0.8)],
            vec![],
        ];

        // Same outcome for every submission order.
        for rotation in 0..frames.len() {
            let mut votes = SessionVotes::new();
            for i in 0..frames.len() {
                let frame = &frames[(i + rotation) % frames.len()];
                votes.observe(frame, start);
            }
            assert_eq!(votes.frames_seen(), 5);
            let marks = votes.finalize(&[x, y], &policy(3), start);
            let mark_of = |id| marks.iter().find(|m| m.student_id == id).unwrap().clone();
            assert_eq!(mark_of(x).status, AttendanceStatus::Present);
            assert!((mark_of(x).confidence - 0.8).abs() < 1e-6);
            assert_eq!(mark_of(y).status, AttendanceStatus::Absent);
        }
    }

    #[test]
    fn test_zero_frames_everyone_absent() {
        let start = Utc::now();
        let votes = SessionVotes::new();
        let enrolled: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        let marks = votes.finalize(&enrolled, &policy(3), start);
        assert_eq!(marks.len(), 4);
        assert!(marks.iter().all(|m| m.status == AttendanceStatus::Absent));
        assert!(marks.iter().all(|m| m.confidence == 0.0));
    }

    #[test]
    fn test_k_exceeding_frames_submitted_stays_absent() {
        let start = Utc::now();
        let mut votes = SessionVotes::new();
        let x = Uuid::new_v4();
        votes.observe(&[matched(x, 0.99)], start);
        votes.observe(&[matched(x, 0.99)], start);
        let marks = votes.finalize(&[x], &policy(3), start);
        assert_eq!(marks[0].status, AttendanceStatus::Absent);
    }

    #[test]
    fn test_high_confidence_short_circuit() {
        let start = Utc::now();
        let mut votes = SessionVotes::new();
        let x = Uuid::new_v4();
        votes.observe(&[matched(x, 0.95)], start);
        let policy = VotingPolicy {
            min_frames: 3,
            late_after: None,
            high_confidence: Some(0.9),
        };
        let marks = votes.finalize(&[x], &policy, start);
        assert_eq!(marks[0].status, AttendanceStatus::Present);
    }

    #[test]
    fn test_short_circuit_off_by_default() {
        let start = Utc::now();
        let mut votes = SessionVotes::new();
        let x = Uuid::new_v4();
        votes.observe(&[matched(x, 1.0)], start);
        let marks = votes.finalize(&[x], &VotingPolicy::default(), start);
        assert_eq!(marks[0].status, AttendanceStatus::Absent);
    }

    #[test]
    fn test_late_when_first_match_after_grace() {
        let start = Utc::now();
        let x = Uuid::new_v4();
        let policy = VotingPolicy {
            min_frames: 2,
            late_after: Some(Duration::seconds(300)),
            high_confidence: None,
        };

        let mut votes = SessionVotes::new();
        let after_grace = start + Duration::seconds(400);
        votes.observe(&[matched(x, 0.7)], after_grace);
        votes.observe(&[matched(x, 0.7)], after_grace + Duration::seconds(10));
        let marks = votes.finalize(&[x], &policy, start);
        assert_eq!(marks[0].status, AttendanceStatus::Late);

        // First match inside the grace window stays present even if later
        // matches arrive after it.
        let mut votes = SessionVotes::new();
        votes.observe(&[matched(x, 0.7)], start + Duration::seconds(10));
        votes.observe(&[matched(x, 0.7)], after_grace);
        let marks = votes.finalize(&[x], &policy, start);
        assert_eq!(marks[0].status, AttendanceStatus::Present);
    }

    #[test]
    fn test_failed_frames_count_toward_frames_seen() {
        let start = Utc::now();
        let mut votes = SessionVotes::new();
        votes.observe(&[], start);
        votes.observe(&[unknown()], start);
        assert_eq!(votes.frames_seen(), 2);
        assert!(votes.tally(Uuid::new_v4()).is_none());
    }
}
