//! Session registry and state machine.
//!
//! One attendance session moves NotStarted → Active → Ended, with Ended
//! terminal. Frame submissions for one session serialize on that
//! session's own lock; different sessions proceed in parallel. Ending a
//! session drains its in-flight extraction jobs first, so finalize sees
//! every vote exactly once.

use crate::pool::{ExtractJob, ExtractorPool, FrameOutcome, PoolError};
use chrono::{DateTime, Utc};
use rollcall_core::{AttendanceStatus, ExtractionError, SessionVotes, VotingPolicy};
use rollcall_store::{GalleryCache, ReportEntry, SessionStatus, Store, StoreError};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{oneshot, Mutex, Notify, RwLock};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session {0} not found")]
    Unknown(Uuid),
    #[error("institution {0} not found")]
    UnknownInstitution(Uuid),
    #[error("invalid session state transition: session is {0}")]
    InvalidState(&'static str),
    #[error("session not active")]
    NotActive,
    #[error("malformed frame payload: {0}")]
    MalformedFrame(String),
    #[error("extraction queue full")]
    Saturated,
    #[error("extraction pool unavailable")]
    PoolUnavailable,
    #[error(transparent)]
    Store(#[from] StoreError),
}

enum Phase {
    NotStarted,
    Active {
        started_at: DateTime<Utc>,
        votes: SessionVotes,
        closing: bool,
    },
    Ended,
}

struct SessionSlot {
    institution_id: Uuid,
    state: Mutex<Phase>,
    /// Extraction jobs dispatched but not yet folded back into the votes.
    /// Lives outside the phase lock so a cancelled submitter's drop guard
    /// can still decrement it.
    in_flight: AtomicU32,
    /// Signalled whenever the in-flight count drops to zero.
    drained: Notify,
}

/// Decrements the slot's in-flight count on drop. Held across the reply
/// await in `submit_frame` so an HTTP disconnect (which drops the handler
/// future mid-await) cannot strand `end`'s drain barrier.
struct InFlightGuard {
    slot: Arc<SessionSlot>,
}

impl InFlightGuard {
    fn new(slot: Arc<SessionSlot>) -> Self {
        slot.in_flight.fetch_add(1, Ordering::AcqRel);
        Self { slot }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.slot.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.slot.drained.notify_waiters();
        }
    }
}

/// What the capture client sees after one frame.
#[derive(Debug, Default, Serialize)]
pub struct FrameSummary {
    pub faces_detected: usize,
    pub recognized: Vec<Uuid>,
    pub unknown_faces: usize,
}

impl FrameSummary {
    fn from_outcome(outcome: &FrameOutcome) -> Self {
        Self {
            faces_detected: outcome.faces_detected,
            recognized: outcome.matches.iter().filter_map(|m| m.student_id).collect(),
            unknown_faces: outcome.matches.iter().filter(|m| m.student_id.is_none()).count(),
        }
    }
}

/// Finalize counters returned from `end`.
#[derive(Debug, Serialize)]
pub struct EndSummary {
    pub session_id: Uuid,
    pub present: usize,
    pub late: usize,
    pub absent: usize,
}

pub struct SessionManager {
    store: Store,
    gallery: Arc<GalleryCache>,
    pool: ExtractorPool,
    policy: VotingPolicy,
    distance_threshold: f32,
    sessions: RwLock<HashMap<Uuid, Arc<SessionSlot>>>,
}

impl SessionManager {
    pub fn new(
        store: Store,
        gallery: Arc<GalleryCache>,
        pool: ExtractorPool,
        policy: VotingPolicy,
        distance_threshold: f32,
    ) -> Self {
        Self {
            store,
            gallery,
            pool,
            policy,
            distance_threshold,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub async fn create_session(
        &self,
        institution_id: Uuid,
        course: &str,
    ) -> Result<Uuid, SessionError> {
        if !self.store.institution_exists(institution_id).await? {
            return Err(SessionError::UnknownInstitution(institution_id));
        }
        let id = self.store.create_session(institution_id, course).await?;
        let slot = Arc::new(SessionSlot {
            institution_id,
            state: Mutex::new(Phase::NotStarted),
            in_flight: AtomicU32::new(0),
            drained: Notify::new(),
        });
        self.sessions.write().await.insert(id, slot);
        tracing::info!(session = %id, institution = %institution_id, course, "session created");
        Ok(id)
    }

    pub async fn start_session(&self, id: Uuid) -> Result<DateTime<Utc>, SessionError> {
        let slot = self.slot(id).await?;
        let mut phase = slot.state.lock().await;
        match &*phase {
            Phase::NotStarted => {
                let started_at = Utc::now();
                *phase = Phase::Active {
                    started_at,
                    votes: SessionVotes::new(),
                    closing: false,
                };
                self.store.mark_session_started(id, started_at).await?;
                tracing::info!(session = %id, "session started");
                Ok(started_at)
            }
            Phase::Active { closing: true, .. } => Err(SessionError::InvalidState("ending")),
            Phase::Active { .. } => Err(SessionError::InvalidState("active")),
            Phase::Ended => Err(SessionError::InvalidState("ended")),
        }
    }

    /// Process one submitted frame: dispatch extraction + matching to the
    /// worker pool, then fold the result into the session's votes.
    ///
    /// Per-frame extraction failures are logged and count as a frame with
    /// zero candidates; they never abort the session.
    pub async fn submit_frame(
        &self,
        id: Uuid,
        image: Vec<u8>,
    ) -> Result<FrameSummary, SessionError> {
        let slot = self.slot(id).await?;
        let gallery = self.gallery.load(slot.institution_id).await?;
        if gallery.is_empty() {
            tracing::debug!(session = %id, "empty gallery; frame can only yield unknown faces");
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let guard;
        {
            let mut phase = slot.state.lock().await;
            let Phase::Active { closing: false, .. } = &mut *phase else {
                return Err(SessionError::NotActive);
            };
            let job = ExtractJob {
                session_id: id,
                image,
                gallery,
                distance_threshold: self.distance_threshold,
                reply: reply_tx,
            };
            match self.pool.submit(job) {
                // Increment while still holding the lock: end() flips
                // `closing` under the same lock, so it can never observe a
                // zero count with a submission still on the way in.
                Ok(()) => guard = InFlightGuard::new(slot.clone()),
                Err(PoolError::Saturated) => return Err(SessionError::Saturated),
                Err(PoolError::Closed) => return Err(SessionError::PoolUnavailable),
            }
        }

        // Cancellation point: if the client disconnects here, `guard`'s
        // drop still releases the drain barrier.
        let outcome = reply_rx.await;
        let observed_at = Utc::now();

        let mut phase = slot.state.lock().await;
        let Phase::Active { votes, .. } = &mut *phase else {
            // end() drains in-flight frames before transitioning, so the
            // phase cannot have changed underneath us.
            return Err(SessionError::NotActive);
        };

        let result = match outcome {
            Ok(Ok(outcome)) => {
                votes.observe(&outcome.matches, observed_at);
                Ok(FrameSummary::from_outcome(&outcome))
            }
            Ok(Err(ExtractionError::BadImage(err))) => {
                // Undecodable payload is the caller's problem; the frame
                // is discarded with no vote recorded.
                Err(SessionError::MalformedFrame(err.to_string()))
            }
            Ok(Err(err)) => {
                tracing::warn!(session = %id, error = %err, "frame extraction failed; zero candidates");
                votes.observe(&[], observed_at);
                Ok(FrameSummary::default())
            }
            Err(_) => {
                tracing::warn!(session = %id, "extraction worker dropped reply; zero candidates");
                votes.observe(&[], observed_at);
                Ok(FrameSummary::default())
            }
        };

        // Decrement only after the vote is folded in, while the phase lock
        // is still held; a waiting end() then finalizes with this frame
        // already counted.
        drop(guard);
        result
    }

    /// End the session: drain in-flight frames, finalize votes, persist one
    /// record per enrolled student, transition to Ended.
    ///
    /// A second `end` is an error, never a silent no-op.
    pub async fn end_session(&self, id: Uuid) -> Result<EndSummary, SessionError> {
        let slot = self.slot(id).await?;

        {
            let mut phase = slot.state.lock().await;
            match &mut *phase {
                Phase::Active { closing, .. } if !*closing => *closing = true,
                Phase::Active { .. } => return Err(SessionError::InvalidState("ending")),
                Phase::NotStarted => return Err(SessionError::InvalidState("not_started")),
                Phase::Ended => return Err(SessionError::InvalidState("ended")),
            }
        }

        // Finalize is the single barrier: no completing frame may lose its
        // vote, and nothing counts after this drain completes. Enabling the
        // notified future before the count check closes the window where a
        // guard drops between check and await.
        loop {
            let notified = slot.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if slot.in_flight.load(Ordering::Acquire) == 0 {
                break;
            }
            notified.await;
        }

        let enrolled = self.store.enrolled_students(slot.institution_id).await?;
        let ended_at = Utc::now();

        let marks = {
            let phase = slot.state.lock().await;
            let Phase::Active {
                started_at, votes, ..
            } = &*phase
            else {
                return Err(SessionError::InvalidState("ended"));
            };
            tracing::debug!(
                session = %id,
                frames = votes.frames_seen(),
                enrolled = enrolled.len(),
                "finalizing votes"
            );
            votes.finalize(&enrolled, &self.policy, *started_at)
        };

        let persisted: Result<(), SessionError> = async {
            for mark in &marks {
                match self.store.insert_attendance(id, mark, ended_at).await {
                    Ok(()) => {}
                    Err(StoreError::DuplicateRecord { student_id, .. }) => {
                        tracing::warn!(
                            session = %id,
                            student = %student_id,
                            "attendance already recorded; keeping first write"
                        );
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            self.store.mark_session_ended(id, ended_at).await?;
            Ok(())
        }
        .await;

        if let Err(err) = persisted {
            // Reopen for retry; the closing flag kept new frames out, so the
            // vote state is unchanged.
            let mut phase = slot.state.lock().await;
            if let Phase::Active { closing, .. } = &mut *phase {
                *closing = false;
            }
            return Err(err);
        }

        {
            // Vote tallies die with the Active phase.
            let mut phase = slot.state.lock().await;
            *phase = Phase::Ended;
        }
        // Ended sessions need no live slot; slot() rebuilds them from the
        // store on demand, so the registry only holds sessions in play.
        self.sessions.write().await.remove(&id);

        let mut summary = EndSummary {
            session_id: id,
            present: 0,
            late: 0,
            absent: 0,
        };
        for mark in &marks {
            match mark.status {
                AttendanceStatus::Present => summary.present += 1,
                AttendanceStatus::Late => summary.late += 1,
                AttendanceStatus::Absent => summary.absent += 1,
            }
        }
        tracing::info!(
            session = %id,
            present = summary.present,
            late = summary.late,
            absent = summary.absent,
            "session ended"
        );
        Ok(summary)
    }

    /// Records as persisted at finalize; read path for reports.
    pub async fn report(&self, id: Uuid) -> Result<Vec<ReportEntry>, SessionError> {
        // Existence check so an unknown id is a 404, not an empty report.
        let _slot = self.slot(id).await?;
        Ok(self.store.attendance_report(id).await?)
    }

    /// Sessions that have been Active since before `cutoff` and are not
    /// already being ended. Used by the timeout sweep.
    pub async fn sessions_active_since(&self, cutoff: DateTime<Utc>) -> Vec<Uuid> {
        let slots: Vec<(Uuid, Arc<SessionSlot>)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, slot)| (*id, slot.clone()))
            .collect();

        let mut overdue = Vec::new();
        for (id, slot) in slots {
            let phase = slot.state.lock().await;
            if let Phase::Active {
                started_at,
                closing: false,
                ..
            } = &*phase
            {
                if *started_at < cutoff {
                    overdue.push(id);
                }
            }
        }
        overdue
    }

    async fn slot(&self, id: Uuid) -> Result<Arc<SessionSlot>, SessionError> {
        if let Some(slot) = self.sessions.read().await.get(&id) {
            return Ok(slot.clone());
        }

        // Not in the registry: rebuild from the store (daemon restart).
        let Some(row) = self.store.session(id).await? else {
            return Err(SessionError::Unknown(id));
        };
        let phase = match row.status {
            SessionStatus::NotStarted => Phase::NotStarted,
            SessionStatus::Ended => Phase::Ended,
            // A session found active after restart keeps its start time and
            // resumes with empty tallies; the sweep closes it eventually.
            SessionStatus::Active => Phase::Active {
                started_at: row.started_at.unwrap_or_else(Utc::now),
                votes: SessionVotes::new(),
                closing: false,
            },
        };
        let slot = Arc::new(SessionSlot {
            institution_id: row.institution_id,
            state: Mutex::new(phase),
            in_flight: AtomicU32::new(0),
            drained: Notify::new(),
        });
        let mut map = self.sessions.write().await;
        Ok(map.entry(id).or_insert(slot).clone())
    }
}
