//! Resource ledger for tracking per-host idle capacity

use renderq_core::{RenderqError, RenderqResult, ReservationHandle, ResourceSlice};
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Default)]
struct HostLedger {
    total: ResourceSlice,
    committed: ResourceSlice,
    reservations: HashMap<Uuid, ResourceSlice>,
}

impl HostLedger {
    fn idle(&self) -> ResourceSlice {
        self.total.saturating_sub(&self.committed)
    }
}

/// Authority for how much of each host is still free.
///
/// The ledger is not internally locked; the dispatcher keeps it behind one
/// `RwLock` so that the check in [`ResourceLedger::reserve`] and the decrement
/// that follows it can never interleave with another reservation.
#[derive(Debug, Default)]
pub struct ResourceLedger {
    hosts: HashMap<Uuid, HostLedger>,
}

impl ResourceLedger {
    /// Create an empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a host. Returns false and resizes instead when the host
    /// is already tracked.
    pub fn register_host(&mut self, host_id: Uuid, total: ResourceSlice) -> bool {
        if let Some(entry) = self.hosts.get_mut(&host_id) {
            entry.total = total;
            return false;
        }
        self.hosts.insert(
            host_id,
            HostLedger {
                total,
                ..Default::default()
            },
        );
        debug!(host_id = %host_id, total = %total, "Host registered in ledger");
        true
    }

    /// Apply new hardware totals; live reservations are kept
    pub fn resize_host(&mut self, host_id: Uuid, total: ResourceSlice) -> RenderqResult<()> {
        let entry = self
            .hosts
            .get_mut(&host_id)
            .ok_or_else(|| RenderqError::HostNotFound(host_id.to_string()))?;
        if entry.total != total {
            info!(host_id = %host_id, from = %entry.total, to = %total, "Host resized");
            entry.total = total;
        }
        Ok(())
    }

    pub fn contains(&self, host_id: Uuid) -> bool {
        self.hosts.contains_key(&host_id)
    }

    /// Reserve a slice of a host's idle capacity
    pub fn reserve(
        &mut self,
        host_id: Uuid,
        slice: ResourceSlice,
    ) -> RenderqResult<ReservationHandle> {
        let entry = self
            .hosts
            .get_mut(&host_id)
            .ok_or_else(|| RenderqError::HostNotFound(host_id.to_string()))?;

        let idle = entry.idle();
        if !slice.fits_within(&idle) {
            return Err(RenderqError::InsufficientResources(format!(
                "requested {} but host {} has {} idle",
                slice, host_id, idle
            )));
        }

        entry.committed = entry.committed.saturating_add(&slice);
        let handle = ReservationHandle {
            id: Uuid::new_v4(),
            host_id,
        };
        entry.reservations.insert(handle.id, slice);
        Ok(handle)
    }

    /// Re-insert a reservation that already exists outside the ledger, e.g.
    /// a live proc found when a host is first seen. Never fails on capacity.
    pub fn restore(&mut self, handle: ReservationHandle, slice: ResourceSlice) {
        let entry = self.hosts.entry(handle.host_id).or_default();
        if entry.reservations.insert(handle.id, slice).is_none() {
            entry.committed = entry.committed.saturating_add(&slice);
        }
    }

    /// Return a reservation's exact slice to the host
    pub fn release(&mut self, handle: &ReservationHandle) -> RenderqResult<ResourceSlice> {
        let entry = self
            .hosts
            .get_mut(&handle.host_id)
            .ok_or_else(|| RenderqError::HostNotFound(handle.host_id.to_string()))?;
        let slice = entry.reservations.remove(&handle.id).ok_or_else(|| {
            RenderqError::Internal(format!("unknown reservation {}", handle.id))
        })?;
        entry.committed = entry.committed.saturating_sub(&slice);
        Ok(slice)
    }

    pub fn idle(&self, host_id: Uuid) -> Option<ResourceSlice> {
        self.hosts.get(&host_id).map(HostLedger::idle)
    }

    pub fn committed(&self, host_id: Uuid) -> Option<ResourceSlice> {
        self.hosts.get(&host_id).map(|h| h.committed)
    }

    pub fn total(&self, host_id: Uuid) -> Option<ResourceSlice> {
        self.hosts.get(&host_id).map(|h| h.total)
    }

    /// Number of live reservations on a host
    pub fn reservation_count(&self, host_id: Uuid) -> usize {
        self.hosts
            .get(&host_id)
            .map(|h| h.reservations.len())
            .unwrap_or(0)
    }

    /// Stop tracking a host, dropping its reservations
    pub fn remove_host(&mut self, host_id: Uuid) -> bool {
        self.hosts.remove(&host_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use renderq_core::{GB, GB2, GB8};

    fn ledger_with_host(total: ResourceSlice) -> (ResourceLedger, Uuid) {
        let mut ledger = ResourceLedger::new();
        let host_id = Uuid::new_v4();
        assert!(ledger.register_host(host_id, total));
        (ledger, host_id)
    }

    #[test]
    fn test_reserve_and_release() {
        let (mut ledger, host) = ledger_with_host(ResourceSlice::new(800, GB8));

        let handle = ledger.reserve(host, ResourceSlice::new(300, GB2)).unwrap();
        assert_eq!(ledger.idle(host), Some(ResourceSlice::new(500, 6 * GB)));
        assert_eq!(ledger.committed(host), Some(ResourceSlice::new(300, GB2)));

        let released = ledger.release(&handle).unwrap();
        assert_eq!(released, ResourceSlice::new(300, GB2));
        assert_eq!(ledger.idle(host), Some(ResourceSlice::new(800, GB8)));
        assert_eq!(ledger.reservation_count(host), 0);
    }

    #[test]
    fn test_reserve_insufficient() {
        let (mut ledger, host) = ledger_with_host(ResourceSlice::new(200, GB8));

        ledger.reserve(host, ResourceSlice::new(200, GB)).unwrap();
        let result = ledger.reserve(host, ResourceSlice::new(100, GB));
        assert!(matches!(result, Err(RenderqError::InsufficientResources(_))));
        assert_eq!(ledger.committed(host), Some(ResourceSlice::new(200, GB)));
    }

    #[test]
    fn test_gpu_dimension_checked() {
        let (mut ledger, host) = ledger_with_host(ResourceSlice::new(800, GB8).with_gpus(1, GB));
        let gpu = ResourceSlice::new(100, GB).with_gpus(1, GB);

        ledger.reserve(host, gpu).unwrap();
        assert!(ledger.reserve(host, gpu).is_err());
    }

    #[test]
    fn test_double_release_is_error() {
        let (mut ledger, host) = ledger_with_host(ResourceSlice::new(800, GB8));
        let handle = ledger.reserve(host, ResourceSlice::new(100, GB)).unwrap();

        ledger.release(&handle).unwrap();
        assert!(ledger.release(&handle).is_err());
        assert_eq!(ledger.idle(host), Some(ResourceSlice::new(800, GB8)));
    }

    #[test]
    fn test_idle_plus_committed_is_total() {
        let total = ResourceSlice::new(800, GB8);
        let (mut ledger, host) = ledger_with_host(total);

        let mut handles = Vec::new();
        while let Ok(handle) = ledger.reserve(host, ResourceSlice::new(300, GB2)) {
            handles.push(handle);
            let idle = ledger.idle(host).unwrap();
            let committed = ledger.committed(host).unwrap();
            assert_eq!(idle.saturating_add(&committed), total);
        }
        assert_eq!(handles.len(), 2);
    }

    #[test]
    fn test_restore_and_resize() {
        let (mut ledger, host) = ledger_with_host(ResourceSlice::new(800, GB8));
        let handle = ReservationHandle {
            id: Uuid::new_v4(),
            host_id: host,
        };

        ledger.restore(handle, ResourceSlice::new(400, GB2));
        ledger.restore(handle, ResourceSlice::new(400, GB2));
        assert_eq!(ledger.committed(host), Some(ResourceSlice::new(400, GB2)));

        ledger.resize_host(host, ResourceSlice::new(200, GB8)).unwrap();
        assert_eq!(ledger.idle(host), Some(ResourceSlice::new(0, 6 * GB)));

        assert_eq!(ledger.release(&handle).unwrap(), ResourceSlice::new(400, GB2));
        assert_eq!(ledger.idle(host), Some(ResourceSlice::new(200, GB8)));
    }

    #[test]
    fn test_unknown_host() {
        let mut ledger = ResourceLedger::new();
        let host = Uuid::new_v4();
        assert!(ledger.reserve(host, ResourceSlice::new(100, GB)).is_err());
        assert!(ledger.resize_host(host, ResourceSlice::zero()).is_err());
        assert!(ledger.idle(host).is_none());
        assert!(!ledger.remove_host(host));
    }
}
