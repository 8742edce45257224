//! Local host assignment lifecycle

use renderq_core::{
    AssignmentBounds, BookingTarget, Host, LocalHostAssignment, RenderqError, RenderqResult,
    ResourceSlice,
};
use renderq_store::{
    AssignmentRepository, DispatchStore, HostRepository, JobRepository, ProcRepository,
};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::deficit::DeficitMonitor;

/// New maximums for an existing assignment; `None` leaves a bound unchanged
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaxResources {
    /// Core units
    pub cores: Option<u32>,
    /// KB
    pub memory: Option<u64>,
    pub gpus: Option<u32>,
    /// KB
    pub gpu_memory: Option<u64>,
    pub threads: Option<u32>,
}

/// Creates, resizes and inspects local host assignments
pub struct BookingManager {
    store: Arc<dyn DispatchStore>,
    deficits: DeficitMonitor,
}

impl BookingManager {
    pub fn new(store: Arc<dyn DispatchStore>) -> Self {
        Self {
            deficits: DeficitMonitor::new(store.clone()),
            store,
        }
    }

    /// Pin part of a host to a job, layer or frame
    pub async fn create_local_host_assignment(
        &self,
        host_id: Uuid,
        target: BookingTarget,
        bounds: AssignmentBounds,
    ) -> RenderqResult<LocalHostAssignment> {
        validate_bounds(&bounds)?;
        if bounds.proc_cores() > bounds.max_cores {
            return Err(RenderqError::Validation(format!(
                "{} threads need {} core units but max is {}",
                bounds.threads,
                bounds.proc_cores(),
                bounds.max_cores
            )));
        }
        if bounds.max_memory == 0 {
            return Err(RenderqError::Validation(
                "max memory must be greater than zero".to_string(),
            ));
        }

        let host = self.store.get_host(host_id).await?;
        self.ensure_target_exists(target).await?;

        let existing = self.store.assignments_for_host(host_id).await;
        if existing.iter().any(|a| a.target == target) {
            return Err(RenderqError::Validation(format!(
                "host {} is already booked to {}",
                host.name, target
            )));
        }
        check_host_capacity(&host, existing.iter().map(|a| &a.bounds), &bounds)?;

        let lha = self
            .store
            .insert_assignment(LocalHostAssignment::new(host_id, target, bounds))
            .await?;

        info!(
            assignment_id = %lha.id,
            host = %host.name,
            target = %target,
            max_cores = bounds.max_cores,
            threads = bounds.threads,
            max_memory = bounds.max_memory,
            "Local host assignment created"
        );
        Ok(lha)
    }

    /// Resize an assignment. Live procs are left alone, so shrinking below
    /// what is already committed creates a resource deficit.
    pub async fn set_max_resources(
        &self,
        assignment_id: Uuid,
        max: MaxResources,
    ) -> RenderqResult<LocalHostAssignment> {
        let mut lha = self.store.get_assignment(assignment_id).await?;

        let mut bounds = lha.bounds;
        if let Some(cores) = max.cores {
            bounds.max_cores = cores;
        }
        if let Some(memory) = max.memory {
            bounds.max_memory = memory;
        }
        if let Some(gpus) = max.gpus {
            bounds.max_gpus = gpus;
        }
        if let Some(gpu_memory) = max.gpu_memory {
            bounds.max_gpu_memory = gpu_memory;
        }
        if let Some(threads) = max.threads {
            bounds.threads = threads;
        }
        validate_bounds(&bounds)?;

        let host = self.store.get_host(lha.host_id).await?;
        let others: Vec<LocalHostAssignment> = self
            .store
            .assignments_for_host(lha.host_id)
            .await
            .into_iter()
            .filter(|a| a.id != lha.id)
            .collect();
        check_host_capacity(&host, others.iter().map(|a| &a.bounds), &bounds)?;

        lha.bounds = bounds;
        self.store.update_assignment(&lha).await?;

        info!(
            assignment_id = %lha.id,
            host = %host.name,
            max = %bounds.max_slice(),
            threads = bounds.threads,
            "Local host assignment resized"
        );
        Ok(lha)
    }

    /// Drop an assignment; its live procs keep running
    pub async fn remove_local_host_assignment(
        &self,
        assignment_id: Uuid,
    ) -> RenderqResult<LocalHostAssignment> {
        let lha = self.store.remove_assignment(assignment_id).await?;
        info!(assignment_id = %lha.id, target = %lha.target, "Local host assignment removed");
        Ok(lha)
    }

    /// Assignments on a host, oldest first
    pub async fn local_assignments(&self, host_id: Uuid) -> Vec<LocalHostAssignment> {
        self.store.assignments_for_host(host_id).await
    }

    pub async fn local_assignment(
        &self,
        host_id: Uuid,
        target: BookingTarget,
    ) -> RenderqResult<LocalHostAssignment> {
        self.store
            .assignments_for_host(host_id)
            .await
            .into_iter()
            .find(|a| a.target == target)
            .ok_or_else(|| RenderqError::AssignmentNotFound(format!("{} on {}", target, host_id)))
    }

    /// Whether any live proc on the host was placed under an assignment
    pub async fn has_active_local_frames(&self, host_id: Uuid) -> bool {
        self.store
            .procs_for_host(host_id)
            .await
            .iter()
            .any(|p| p.is_local_dispatch)
    }

    pub async fn has_resource_deficit(&self, host_id: Uuid) -> bool {
        self.deficits.has_resource_deficit(host_id).await
    }

    pub fn deficit_monitor(&self) -> &DeficitMonitor {
        &self.deficits
    }

    async fn ensure_target_exists(&self, target: BookingTarget) -> RenderqResult<()> {
        let found = match target {
            BookingTarget::Job(id) => self.store.get_job(id).await.map(|_| ()),
            BookingTarget::Layer(id) => self.store.get_layer(id).await.map(|_| ()),
            BookingTarget::Frame(id) => self.store.get_frame(id).await.map(|_| ()),
        };
        found.map_err(|e| {
            if e.is_not_found() {
                RenderqError::Validation(format!("booking target {} does not exist", target))
            } else {
                e
            }
        })
    }
}

fn validate_bounds(bounds: &AssignmentBounds) -> RenderqResult<()> {
    if bounds.threads == 0 {
        return Err(RenderqError::Validation(
            "threads must be at least 1".to_string(),
        ));
    }
    if bounds.min_cores > bounds.max_cores {
        return Err(RenderqError::Validation(format!(
            "min cores {} exceeds max cores {}",
            bounds.min_cores, bounds.max_cores
        )));
    }
    Ok(())
}

/// The maxima of all assignments on a host must fit inside the host
fn check_host_capacity<'a>(
    host: &Host,
    others: impl Iterator<Item = &'a AssignmentBounds>,
    bounds: &AssignmentBounds,
) -> RenderqResult<()> {
    let booked: ResourceSlice = others.map(AssignmentBounds::max_slice).sum();
    let wanted = booked.saturating_add(&bounds.max_slice());
    if !wanted.fits_within(&host.total) {
        return Err(RenderqError::Validation(format!(
            "assignments on {} would book {} of {}",
            host.name, wanted, host.total
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::farm;
    use renderq_core::{GB, GB2, GB8};

    fn bounds(max_cores: u32, threads: u32, memory: u64) -> AssignmentBounds {
        AssignmentBounds::new(max_cores, threads, memory, 0, 0)
    }

    #[tokio::test]
    async fn test_create_local_host_assignment() {
        let f = farm().await;
        let booking = BookingManager::new(f.store.clone());
        let target = BookingTarget::Job(f.job.id);

        let lha = booking
            .create_local_host_assignment(f.host.id, target, bounds(200, 1, GB8))
            .await
            .unwrap();
        assert_eq!(lha.bounds.min_cores, 100);
        assert_eq!(lha.bounds.max_cores, 200);
        assert_eq!(booking.local_assignment(f.host.id, target).await.unwrap().id, lha.id);
        assert_eq!(booking.local_assignments(f.host.id).await.len(), 1);
        assert!(!booking.has_active_local_frames(f.host.id).await);
        assert!(!booking.has_resource_deficit(f.host.id).await);
    }

    #[tokio::test]
    async fn test_invalid_bounds_rejected() {
        let f = farm().await;
        let booking = BookingManager::new(f.store.clone());
        let target = BookingTarget::Job(f.job.id);

        for bad in [
            bounds(200, 0, GB8),
            bounds(200, 3, GB8),
            bounds(200, 1, 0),
            bounds(50, 1, GB8),
            bounds(400, 1, GB8).with_min_cores(500),
        ] {
            let result = booking.create_local_host_assignment(f.host.id, target, bad).await;
            assert!(
                matches!(result, Err(RenderqError::Validation(_))),
                "{:?} accepted",
                bad
            );
        }
        assert!(booking.local_assignments(f.host.id).await.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_target_rejected() {
        let f = farm().await;
        let booking = BookingManager::new(f.store.clone());
        let target = BookingTarget::Layer(f.layers[0].id);

        booking
            .create_local_host_assignment(f.host.id, target, bounds(200, 1, GB2))
            .await
            .unwrap();
        let result = booking
            .create_local_host_assignment(f.host.id, target, bounds(200, 1, GB2))
            .await;
        assert!(matches!(result, Err(RenderqError::Validation(_))));
    }

    #[tokio::test]
    async fn test_missing_target_rejected() {
        let f = farm().await;
        let booking = BookingManager::new(f.store.clone());

        let result = booking
            .create_local_host_assignment(f.host.id, BookingTarget::Frame(Uuid::new_v4()), bounds(200, 1, GB2))
            .await;
        assert!(matches!(result, Err(RenderqError::Validation(_))));

        let result = booking
            .create_local_host_assignment(Uuid::new_v4(), BookingTarget::Job(f.job.id), bounds(200, 1, GB2))
            .await;
        assert!(matches!(result, Err(RenderqError::HostNotFound(_))));
    }

    #[tokio::test]
    async fn test_assignments_cannot_oversubscribe_host() {
        let f = farm().await;
        let booking = BookingManager::new(f.store.clone());

        booking
            .create_local_host_assignment(f.host.id, BookingTarget::Layer(f.layers[0].id), bounds(600, 1, GB8))
            .await
            .unwrap();
        let result = booking
            .create_local_host_assignment(f.host.id, BookingTarget::Layer(f.layers[1].id), bounds(300, 1, GB))
            .await;
        assert!(matches!(result, Err(RenderqError::Validation(_))));

        booking
            .create_local_host_assignment(f.host.id, BookingTarget::Layer(f.layers[1].id), bounds(200, 1, GB8))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_set_max_resources() {
        let f = farm().await;
        let booking = BookingManager::new(f.store.clone());
        let lha = booking
            .create_local_host_assignment(f.host.id, BookingTarget::Job(f.job.id), bounds(200, 1, GB8))
            .await
            .unwrap();

        let resized = booking
            .set_max_resources(
                lha.id,
                MaxResources {
                    cores: Some(400),
                    threads: Some(2),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(resized.bounds.max_cores, 400);
        assert_eq!(resized.bounds.threads, 2);
        assert_eq!(resized.bounds.max_memory, GB8);

        let result = booking
            .set_max_resources(
                lha.id,
                MaxResources {
                    cores: Some(50),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(RenderqError::Validation(_))));

        let result = booking
            .set_max_resources(
                lha.id,
                MaxResources {
                    memory: Some(4 * GB8),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(RenderqError::Validation(_))));
        assert_eq!(
            booking.local_assignment(f.host.id, BookingTarget::Job(f.job.id)).await.unwrap().bounds,
            resized.bounds
        );
    }

    #[tokio::test]
    async fn test_remove_local_host_assignment() {
        let f = farm().await;
        let booking = BookingManager::new(f.store.clone());
        let lha = booking
            .create_local_host_assignment(f.host.id, BookingTarget::Job(f.job.id), bounds(200, 1, GB8))
            .await
            .unwrap();

        booking.remove_local_host_assignment(lha.id).await.unwrap();
        assert!(booking.local_assignments(f.host.id).await.is_empty());
        assert!(matches!(
            booking.remove_local_host_assignment(lha.id).await,
            Err(RenderqError::AssignmentNotFound(_))
        ));
    }
}
