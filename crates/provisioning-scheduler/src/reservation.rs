//! The reservation ledger: tracks how much capacity-reserved offering capacity is
//! still unclaimed, and which hostnames currently hold a reservation. A single
//! coarse lock serializes every operation rather than locking per field, since
//! contention on this state is expected to stay low.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Mutex,
};

use crate::error::Error;

#[derive(Debug, Default)]
struct Ledger {
    /// Remaining capacity per reservation id, as reported by the cloud provider.
    capacity: BTreeMap<String, u32>,
    /// Reservation ids currently held by each hostname.
    reserved: BTreeMap<String, BTreeSet<String>>,
}

/// Tracks capacity-reserved offerings across the scheduling run so two candidate
/// nodeclaims never oversubscribe the same reservation id.
#[derive(Debug, Default)]
pub struct ReservationManager {
    ledger: Mutex<Ledger>,
}

impl ReservationManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the ledger with the reservation capacity the cloud provider reported for
    /// this scheduling run. Call once, before any `Reserve`/`Release`.
    pub fn seed_capacity(&self, reservation_id: impl Into<String>, capacity: u32) {
        let mut ledger = self.ledger.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        ledger.capacity.insert(reservation_id.into(), capacity);
    }

    pub fn remaining_capacity(&self, reservation_id: &str) -> u32 {
        let ledger = self.ledger.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        ledger.capacity.get(reservation_id).copied().unwrap_or(0)
    }

    pub fn has_reservation(&self, hostname: &str, reservation_id: &str) -> bool {
        let ledger = self.ledger.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        ledger
            .reserved
            .get(hostname)
            .is_some_and(|ids| ids.contains(reservation_id))
    }

    /// Whether `hostname` could claim one more unit of `reservation_id` right now,
    /// without actually claiming it.
    pub fn can_reserve(&self, hostname: &str, reservation_id: &str) -> bool {
        let ledger = self.ledger.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if ledger
            .reserved
            .get(hostname)
            .is_some_and(|ids| ids.contains(reservation_id))
        {
            return true;
        }
        ledger.capacity.get(reservation_id).copied().unwrap_or(0) > 0
    }

    /// Claims one unit of `reservation_id` for `hostname`. Idempotent: reserving
    /// again for a hostname that already holds the id is a no-op success.
    pub fn reserve(&self, hostname: &str, reservation_id: &str) -> Result<(), Error> {
        let mut ledger = self.ledger.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        if ledger
            .reserved
            .get(hostname)
            .is_some_and(|ids| ids.contains(reservation_id))
        {
            return Ok(());
        }

        let remaining = ledger.capacity.get(reservation_id).copied().unwrap_or(0);
        debug_assert!(
            remaining > 0 || ledger.capacity.contains_key(reservation_id),
            "reserve() called for an id the ledger was never seeded with"
        );
        if remaining == 0 {
            return Err(Error::ReservedOffering);
        }

        ledger.capacity.insert(reservation_id.to_string(), remaining - 1);
        ledger
            .reserved
            .entry(hostname.to_string())
            .or_default()
            .insert(reservation_id.to_string());
        Ok(())
    }

    /// Releases `hostname`'s claim on `reservation_id`, if any, returning the unit to
    /// the ledger. Idempotent: releasing a reservation never held is a no-op.
    pub fn release(&self, hostname: &str, reservation_id: &str) -> Result<(), Error> {
        let mut ledger = self.ledger.lock().unwrap_or_else(std::sync::PoisonError::into_inner);

        let Some(ids) = ledger.reserved.get_mut(hostname) else {
            return Ok(());
        };
        if !ids.remove(reservation_id) {
            return Ok(());
        }
        if ids.is_empty() {
            ledger.reserved.remove(hostname);
        }

        match ledger.capacity.get_mut(reservation_id) {
            Some(remaining) => {
                *remaining += 1;
                Ok(())
            }
            None => Err(Error::ReservationLedgerCorrupted {
                detail: format!("released {reservation_id} for {hostname} with no tracked capacity entry"),
            }),
        }
    }
}
