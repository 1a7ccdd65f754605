/// Key Pool - Shared Credential Allocator
///
/// **Responsibility:**
/// Hand out judge credentials with remaining daily quota and account for
/// every submission made with them.
///
/// **Concurrency:**
/// One mutex guards the whole pool. "Pick the least-used key" compares
/// across credentials, so per-credential locks could not keep it consistent.
/// The lock is never held across an await point.
///
/// A `Reservation` holds an in-flight slot on its credential until it is
/// settled through `record_success` / `record_failure`. Concurrent
/// reservations therefore never jointly exceed a credential's remaining
/// quota. Dropping an unsettled reservation frees the slot; it is charged
/// only if `begin_submission` was called, since the judge may already count
/// that request.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use batchjudge_common::types::{Credential, CredentialId, CredentialStatus};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};

use crate::error::PoolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Judge rejected the key; permanent until the owner re-verifies it
    AuthInvalid,
    /// Judge's own quota count is authoritative
    QuotaExceeded,
    /// Network / 5xx / timeout; retry elsewhere, key unchanged
    Transient,
}

#[derive(Debug)]
struct Slot {
    credential: Credential,
    in_flight: u32,
}

impl Slot {
    fn is_eligible(&self) -> bool {
        self.credential.status == CredentialStatus::Active
            && self.credential.daily_usage + self.in_flight < self.credential.daily_limit
    }

    fn effective_usage(&self) -> u32 {
        self.credential.daily_usage + self.in_flight
    }

    fn charge(&mut self) {
        self.credential.daily_usage += 1;

        if self.credential.daily_usage >= self.credential.daily_limit
            && self.credential.status == CredentialStatus::Active
        {
            self.credential.status = CredentialStatus::Exhausted;
            info!(
                credential = %self.credential.id,
                daily_usage = self.credential.daily_usage,
                "Credential reached its daily limit"
            );
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    slots: Vec<Slot>,
}

impl PoolState {
    fn slot_mut(&mut self, id: &CredentialId) -> Option<&mut Slot> {
        self.slots.iter_mut().find(|s| &s.credential.id == id)
    }
}

fn lock(state: &Mutex<PoolState>) -> MutexGuard<'_, PoolState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Default)]
pub struct KeyPool {
    state: Arc<Mutex<PoolState>>,
}

/// A credential checked out for exactly one submission
#[derive(Debug)]
pub struct Reservation {
    pool: Arc<Mutex<PoolState>>,
    credential: Credential,
    settled: bool,
    submitted: bool,
}

impl Reservation {
    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn id(&self) -> CredentialId {
        self.credential.id
    }

    /// Mark that a request is about to reach the judge. From here on,
    /// abandoning the reservation still charges the credential.
    pub fn begin_submission(&mut self) {
        self.submitted = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut state = lock(&self.pool);
        if let Some(slot) = state.slot_mut(&self.credential.id) {
            slot.in_flight = slot.in_flight.saturating_sub(1);
            if self.submitted {
                slot.charge();
            }
        }
        debug!(
            credential = %self.credential.id,
            charged = self.submitted,
            "Released unsettled reservation"
        );
    }
}

impl KeyPool {
    pub fn new(credentials: impl IntoIterator<Item = Credential>) -> Self {
        let slots = credentials
            .into_iter()
            .map(|credential| Slot {
                credential,
                in_flight: 0,
            })
            .collect();
        Self {
            state: Arc::new(Mutex::new(PoolState { slots })),
        }
    }

    /// Register a new credential; a duplicate id replaces the stored record
    pub fn add(&self, credential: Credential) {
        let mut state = lock(&self.state);
        match state.slot_mut(&credential.id) {
            Some(slot) => slot.credential = credential,
            None => state.slots.push(Slot {
                credential,
                in_flight: 0,
            }),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.state).slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_count(&self) -> usize {
        lock(&self.state)
            .slots
            .iter()
            .filter(|s| s.credential.status == CredentialStatus::Active)
            .count()
    }

    pub fn snapshot(&self) -> Vec<Credential> {
        lock(&self.state)
            .slots
            .iter()
            .map(|s| s.credential.clone())
            .collect()
    }

    pub fn get(&self, id: &CredentialId) -> Option<Credential> {
        lock(&self.state)
            .slots
            .iter()
            .find(|s| &s.credential.id == id)
            .map(|s| s.credential.clone())
    }

    pub fn reserve(&self) -> Result<Reservation, PoolError> {
        self.reserve_excluding(&HashSet::new())
    }

    /// Reserve the least-used eligible credential not in `excluded`.
    /// Ties go to the credential reset longest ago.
    pub fn reserve_excluding(&self, excluded: &HashSet<CredentialId>) -> Result<Reservation, PoolError> {
        let mut state = lock(&self.state);

        let slot = state
            .slots
            .iter_mut()
            .filter(|s| s.is_eligible() && !excluded.contains(&s.credential.id))
            .min_by(|a, b| {
                a.effective_usage()
                    .cmp(&b.effective_usage())
                    .then(a.credential.last_reset.cmp(&b.credential.last_reset))
            })
            .ok_or(PoolError::NoneAvailable)?;

        slot.in_flight += 1;
        debug!(
            credential = %slot.credential.id,
            daily_usage = slot.credential.daily_usage,
            in_flight = slot.in_flight,
            daily_limit = slot.credential.daily_limit,
            "Reserved credential"
        );

        Ok(Reservation {
            pool: Arc::clone(&self.state),
            credential: slot.credential.clone(),
            settled: false,
            submitted: false,
        })
    }

    /// The judge accepted a submission made with this credential
    pub fn record_success(&self, mut reservation: Reservation) {
        reservation.settled = true;
        let mut state = lock(&self.state);
        let Some(slot) = state.slot_mut(&reservation.credential.id) else {
            return;
        };

        slot.in_flight = slot.in_flight.saturating_sub(1);
        slot.charge();
    }

    /// The attempt failed before the judge created a submission
    pub fn record_failure(&self, reservation: Reservation, reason: FailureReason) {
        self.settle_failure(reservation, reason, false);
    }

    /// The judge created a submission, then the attempt failed (poll
    /// timeout, lost connection, rejected fetch). The call still counts.
    pub fn record_failure_after_submit(&self, reservation: Reservation, reason: FailureReason) {
        self.settle_failure(reservation, reason, true);
    }

    fn settle_failure(&self, mut reservation: Reservation, reason: FailureReason, charged: bool) {
        reservation.settled = true;
        let mut state = lock(&self.state);
        let Some(slot) = state.slot_mut(&reservation.credential.id) else {
            return;
        };

        slot.in_flight = slot.in_flight.saturating_sub(1);
        if charged {
            slot.charge();
        }

        match reason {
            FailureReason::AuthInvalid => {
                slot.credential.status = CredentialStatus::Invalid;
                warn!(
                    credential = %slot.credential.id,
                    owner = %slot.credential.owner_ref,
                    "Credential rejected by judge; marked invalid"
                );
            }
            FailureReason::QuotaExceeded => {
                if slot.credential.status != CredentialStatus::Invalid {
                    slot.credential.status = CredentialStatus::Exhausted;
                }
                warn!(
                    credential = %slot.credential.id,
                    counted_usage = slot.credential.daily_usage,
                    "Judge reported quota exceeded; marked exhausted"
                );
            }
            FailureReason::Transient => {
                debug!(credential = %slot.credential.id, "Transient failure; credential unchanged");
            }
        }
    }

    pub fn reset_daily(&self) -> usize {
        self.reset_daily_at(Utc::now())
    }

    /// Zero usage on every credential whose last reset is at least 24h old.
    /// Exhausted credentials become active again; invalid ones stay invalid.
    /// Returns the number of credentials reset.
    pub fn reset_daily_at(&self, now: DateTime<Utc>) -> usize {
        let mut state = lock(&self.state);
        let mut reset = 0;

        for slot in state.slots.iter_mut() {
            let credential = &mut slot.credential;
            if now - credential.last_reset < ChronoDuration::hours(24) {
                continue;
            }
            credential.daily_usage = 0;
            credential.last_reset = now;
            if credential.status == CredentialStatus::Exhausted {
                credential.status = CredentialStatus::Active;
            }
            reset += 1;
        }

        if reset > 0 {
            info!(reset = reset, "Daily quota reset");
        }
        reset
    }
}
