//! Enrollment store, the single source of truth for in-flight workflows.
//!
//! All state lives behind one mutex. Every mutation is a closure applied
//! under that lock, so check-then-write sequences (the duplicate-enrollment
//! guard in particular) are atomic. Locks are never held across an `.await`.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{Enrollment, EnrollmentStatus, ExecutionLogEntry};
use crate::EngineError;

type LiveKey = (String, String);

#[derive(Debug, Default)]
struct StoreState {
    enrollments: HashMap<Uuid, Enrollment>,
    /// (definition id, subject id) → the one active-or-paused enrollment.
    live: HashMap<LiveKey, Uuid>,
    /// Enrollments with a step execution currently running.
    in_flight: HashSet<Uuid>,
}

#[derive(Debug, Default)]
pub struct EnrollmentStore {
    state: Mutex<StoreState>,
}

/// Exclusive right to execute a step of one enrollment. Released on drop.
#[derive(Debug)]
pub struct InFlight<'a> {
    store: &'a EnrollmentStore,
    id: Uuid,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.store.lock().in_flight.remove(&self.id);
    }
}

fn live_key(enrollment: &Enrollment) -> LiveKey {
    (enrollment.definition_id.clone(), enrollment.subject_id.clone())
}

impl EnrollmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Insert a new enrollment unless the subject already has a live one in
    /// the same definition.
    ///
    /// # Errors
    /// [`EngineError::AlreadyEnrolled`] naming the existing enrollment.
    pub fn insert(&self, enrollment: Enrollment) -> Result<(), EngineError> {
        let mut state = self.lock();
        let key = live_key(&enrollment);
        if let Some(existing) = state.live.get(&key) {
            return Err(EngineError::AlreadyEnrolled {
                definition_id: key.0,
                subject_id: key.1,
                enrollment_id: *existing,
            });
        }
        if enrollment.status.is_live() {
            state.live.insert(key, enrollment.id);
        }
        state.enrollments.insert(enrollment.id, enrollment);
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Option<Enrollment> {
        self.lock().enrollments.get(&id).cloned()
    }

    pub fn history(&self, id: Uuid) -> Option<Vec<ExecutionLogEntry>> {
        self.lock().enrollments.get(&id).map(|e| e.history.clone())
    }

    /// All enrollments, oldest first.
    pub fn list(&self) -> Vec<Enrollment> {
        let mut all: Vec<Enrollment> = self.lock().enrollments.values().cloned().collect();
        all.sort_by_key(|e| (e.enrolled_at, e.id));
        all
    }

    /// Ids of `definition_id`'s enrollments in `status`, oldest first.
    pub fn ids_with_status(&self, definition_id: &str, status: EnrollmentStatus) -> Vec<Uuid> {
        let state = self.lock();
        let mut matching: Vec<&Enrollment> = state
            .enrollments
            .values()
            .filter(|e| e.definition_id == definition_id && e.status == status)
            .collect();
        matching.sort_by_key(|e| (e.enrolled_at, e.id));
        matching.into_iter().map(|e| e.id).collect()
    }

    /// Active enrollments whose next step is due at `now` and that are not
    /// already executing, oldest first.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let state = self.lock();
        let mut due: Vec<&Enrollment> = state
            .enrollments
            .values()
            .filter(|e| e.status == EnrollmentStatus::Active && e.is_due(now))
            .filter(|e| !state.in_flight.contains(&e.id))
            .collect();
        due.sort_by_key(|e| (e.enrolled_at, e.id));
        due.into_iter().map(|e| e.id).collect()
    }

    /// Apply `mutate` atomically.
    ///
    /// The live index follows the enrollment's status. If the mutation would
    /// make a second live enrollment for the same subject, it is rolled back.
    ///
    /// # Errors
    /// - [`EngineError::UnknownEnrollment`]
    /// - [`EngineError::AlreadyEnrolled`] (mutation rolled back)
    pub fn update<R>(
        &self,
        id: Uuid,
        mutate: impl FnOnce(&mut Enrollment) -> R,
    ) -> Result<R, EngineError> {
        let mut guard = self.lock();
        let state = &mut *guard;
        let enrollment = state
            .enrollments
            .get_mut(&id)
            .ok_or(EngineError::UnknownEnrollment(id))?;

        let before = enrollment.clone();
        let result = mutate(enrollment);
        let key = live_key(enrollment);

        if enrollment.status.is_live() {
            match state.live.get(&key) {
                Some(existing) if *existing != id => {
                    let existing = *existing;
                    *enrollment = before;
                    return Err(EngineError::AlreadyEnrolled {
                        definition_id: key.0,
                        subject_id: key.1,
                        enrollment_id: existing,
                    });
                }
                Some(_) => {}
                None => {
                    state.live.insert(key, id);
                }
            }
        } else if state.live.get(&key) == Some(&id) {
            state.live.remove(&key);
        }

        Ok(result)
    }

    /// Claim `id` for a step execution.
    ///
    /// Returns `Ok(None)` when another execution already holds the claim.
    ///
    /// # Errors
    /// [`EngineError::UnknownEnrollment`]
    pub fn claim(&self, id: Uuid) -> Result<Option<InFlight<'_>>, EngineError> {
        let mut state = self.lock();
        if !state.enrollments.contains_key(&id) {
            return Err(EngineError::UnknownEnrollment(id));
        }
        if !state.in_flight.insert(id) {
            return Ok(None);
        }
        Ok(Some(InFlight { store: self, id }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T09:00:00Z").unwrap().with_timezone(&Utc)
    }

    #[test]
    fn second_live_enrollment_for_same_pair_is_rejected() {
        let store = EnrollmentStore::new();
        let first = Enrollment::new("D1", "S1", "s1", now());
        let first_id = first.id;
        store.insert(first).unwrap();

        let err = store.insert(Enrollment::new("D1", "S1", "s1", now())).unwrap_err();
        assert_eq!(
            err,
            EngineError::AlreadyEnrolled {
                definition_id: "D1".into(),
                subject_id: "S1".into(),
                enrollment_id: first_id,
            }
        );

        // Other subject / other definition are independent.
        store.insert(Enrollment::new("D1", "S2", "s1", now())).unwrap();
        store.insert(Enrollment::new("D2", "S1", "s1", now())).unwrap();
        assert_eq!(store.list().len(), 3);
    }

    #[test]
    fn closing_an_enrollment_frees_the_pair() {
        let store = EnrollmentStore::new();
        let first = Enrollment::new("D1", "S1", "s1", now());
        let first_id = first.id;
        store.insert(first).unwrap();

        store
            .update(first_id, |e| e.status = EnrollmentStatus::Completed)
            .unwrap();
        let second = Enrollment::new("D1", "S1", "s1", now());
        let second_id = second.id;
        store.insert(second).unwrap();

        // Reviving the old one would create a second live enrollment.
        let err = store
            .update(first_id, |e| e.status = EnrollmentStatus::Active)
            .unwrap_err();
        assert!(matches!(err, EngineError::AlreadyEnrolled { enrollment_id, .. } if enrollment_id == second_id));
        assert_eq!(store.get(first_id).unwrap().status, EnrollmentStatus::Completed);
    }

    #[test]
    fn due_skips_future_and_inactive() {
        let store = EnrollmentStore::new();
        let ready = Enrollment::new("D1", "S1", "s1", now());
        let mut waiting = Enrollment::new("D1", "S2", "s1", now());
        waiting.next_step_due_at = Some(now() + Duration::hours(2));
        let mut paused = Enrollment::new("D1", "S3", "s1", now());
        paused.status = EnrollmentStatus::Paused;

        let ready_id = ready.id;
        let waiting_id = waiting.id;
        for e in [ready, waiting, paused] {
            store.insert(e).unwrap();
        }

        assert_eq!(store.due(now()), vec![ready_id]);
        let mut later = store.due(now() + Duration::hours(3));
        later.sort();
        let mut expected = vec![ready_id, waiting_id];
        expected.sort();
        assert_eq!(later, expected);
    }

    #[test]
    fn claim_is_exclusive_until_dropped() {
        let store = EnrollmentStore::new();
        let enrollment = Enrollment::new("D1", "S1", "s1", now());
        let id = enrollment.id;
        store.insert(enrollment).unwrap();

        let guard = store.claim(id).unwrap();
        assert!(guard.is_some());
        assert!(store.claim(id).unwrap().is_none());
        assert!(store.due(now()).is_empty(), "claimed enrollments are not due");
        drop(guard);
        assert_eq!(store.due(now()), vec![id]);
        assert!(store.claim(id).unwrap().is_some());

        assert!(matches!(store.claim(Uuid::new_v4()), Err(EngineError::UnknownEnrollment(_))));
    }
}
