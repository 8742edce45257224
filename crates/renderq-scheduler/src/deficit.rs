//! Resource deficit detection
//!
//! A deficit exists when the procs placed under a local host assignment hold
//! more than the assignment now allows, usually after its maximums were
//! lowered. Detection only; nothing here kills or unbooks procs.

use renderq_core::{BookingTarget, ResourceSlice};
use renderq_store::{AssignmentRepository, DispatchStore, ProcRepository};
use std::sync::Arc;
use uuid::Uuid;

/// One over-committed assignment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDeficit {
    pub assignment_id: Uuid,
    pub target: BookingTarget,
    /// Held by the assignment's live procs
    pub committed: ResourceSlice,
    /// Configured maximum
    pub max: ResourceSlice,
    /// Per-dimension excess of `committed` over `max`
    pub over: ResourceSlice,
}

pub struct DeficitMonitor {
    store: Arc<dyn DispatchStore>,
}

impl DeficitMonitor {
    pub fn new(store: Arc<dyn DispatchStore>) -> Self {
        Self { store }
    }

    /// Deficits of every assignment on a host
    pub async fn find_deficits(&self, host_id: Uuid) -> Vec<ResourceDeficit> {
        let mut deficits = Vec::new();
        for lha in self.store.assignments_for_host(host_id).await {
            let committed: ResourceSlice = self
                .store
                .procs_for_assignment(lha.id)
                .await
                .iter()
                .map(|p| p.reserved)
                .sum();
            let max = lha.bounds.max_slice();
            let over = committed.overage(&max);
            if !over.is_zero() {
                deficits.push(ResourceDeficit {
                    assignment_id: lha.id,
                    target: lha.target,
                    committed,
                    max,
                    over,
                });
            }
        }
        deficits
    }

    pub async fn has_resource_deficit(&self, host_id: Uuid) -> bool {
        !self.find_deficits(host_id).await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booking::{BookingManager, MaxResources};
    use crate::dispatcher::Dispatcher;
    use crate::testing::farm;
    use renderq_core::{AssignmentBounds, DispatcherConfig, FrameExit, GB2, GB8};

    #[tokio::test]
    async fn test_deficit_after_shrinking_assignment() {
        let f = farm().await;
        let dispatcher = Dispatcher::new(f.store.clone(), DispatcherConfig::default());
        let booking = BookingManager::new(f.store.clone());
        let lha = booking
            .create_local_host_assignment(
                f.host.id,
                BookingTarget::Job(f.job.id),
                AssignmentBounds::new(200, 1, GB8, 0, 0),
            )
            .await
            .unwrap();

        let procs = dispatcher.dispatch_host(f.host.id).await.unwrap();
        assert_eq!(procs.len(), 2);
        assert!(!booking.has_resource_deficit(f.host.id).await);

        booking
            .set_max_resources(
                lha.id,
                MaxResources {
                    cores: Some(100),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(booking.has_resource_deficit(f.host.id).await);

        let deficits = booking.deficit_monitor().find_deficits(f.host.id).await;
        assert_eq!(deficits.len(), 1);
        assert_eq!(deficits[0].assignment_id, lha.id);
        assert_eq!(deficits[0].committed, ResourceSlice::new(200, 2 * GB2));
        assert_eq!(deficits[0].over, ResourceSlice::new(100, 0));

        // Shrunk assignment places nothing new
        assert!(dispatcher.dispatch_host(f.host.id).await.unwrap().is_empty());

        booking
            .set_max_resources(
                lha.id,
                MaxResources {
                    cores: Some(200),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!booking.has_resource_deficit(f.host.id).await);
    }

    #[tokio::test]
    async fn test_deficit_clears_when_procs_finish() {
        let f = farm().await;
        let dispatcher = Dispatcher::new(f.store.clone(), DispatcherConfig::default());
        let booking = BookingManager::new(f.store.clone());
        let lha = booking
            .create_local_host_assignment(
                f.host.id,
                BookingTarget::Layer(f.layers[0].id),
                AssignmentBounds::new(300, 1, GB8, 0, 0),
            )
            .await
            .unwrap();
        let procs = dispatcher.dispatch_host(f.host.id).await.unwrap();
        assert_eq!(procs.len(), 3);

        booking
            .set_max_resources(
                lha.id,
                MaxResources {
                    memory: Some(GB2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let monitor = DeficitMonitor::new(f.store.clone());
        assert_eq!(monitor.find_deficits(f.host.id).await[0].over.memory, 2 * GB2);

        for proc in &procs[1..] {
            dispatcher
                .release_proc(proc.id, FrameExit::Succeeded)
                .await
                .unwrap();
        }
        assert!(!monitor.has_resource_deficit(f.host.id).await);
    }
}
