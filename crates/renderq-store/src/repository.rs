//! Repository traits consumed by the dispatch engine

use async_trait::async_trait;
use renderq_core::{
    Allocation, BookingTarget, Facility, Frame, FrameExit, FrameState, Host, Job, Layer, LocalHostAssignment,
    RenderqResult, VirtualProc,
};
use uuid::Uuid;

/// Outcome of deleting an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationRemoval {
    /// Row removed
    Deleted,
    /// Row kept with `enabled = false` because hosts or procs still use it
    Disabled,
}

#[async_trait]
pub trait FacilityRepository: Send + Sync {
    async fn insert_facility(&self, facility: Facility) -> RenderqResult<Facility>;

    async fn get_facility(&self, name: &str) -> RenderqResult<Facility>;

    async fn get_facility_by_id(&self, id: Uuid) -> RenderqResult<Facility>;
}

#[async_trait]
pub trait AllocationRepository: Send + Sync {
    /// Insert an allocation under a facility, or re-enable a soft-deleted one
    /// with the same id
    async fn insert_allocation(
        &self,
        facility: &Facility,
        alloc: &Allocation,
    ) -> RenderqResult<Allocation>;

    /// Lookup by id, including soft-deleted rows
    async fn get_allocation(&self, id: Uuid) -> RenderqResult<Allocation>;

    /// Lookup an enabled allocation by fully qualified name
    async fn find_allocation(&self, name: &str) -> RenderqResult<Allocation>;

    /// Lookup an enabled allocation by facility and short name
    async fn find_allocation_in(&self, facility: &str, short_name: &str)
        -> RenderqResult<Allocation>;

    /// Rename, keeping the facility prefix
    async fn update_allocation_name(&self, id: Uuid, short_name: &str)
        -> RenderqResult<Allocation>;

    async fn update_allocation_tag(&self, id: Uuid, tag: &str) -> RenderqResult<()>;

    async fn update_allocation_billable(&self, id: Uuid, billable: bool) -> RenderqResult<()>;

    async fn set_default_allocation(&self, id: Uuid) -> RenderqResult<()>;

    async fn default_allocation(&self) -> RenderqResult<Allocation>;

    async fn delete_allocation(&self, id: Uuid) -> RenderqResult<AllocationRemoval>;
}

#[async_trait]
pub trait HostRepository: Send + Sync {
    async fn insert_host(&self, host: Host) -> RenderqResult<Host>;

    async fn get_host(&self, id: Uuid) -> RenderqResult<Host>;

    async fn find_host(&self, name: &str) -> RenderqResult<Host>;

    async fn update_host(&self, host: &Host) -> RenderqResult<()>;

    async fn hosts(&self) -> Vec<Host>;
}

#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Insert a job with its layers and frames
    async fn insert_job(&self, job: Job, layers: Vec<Layer>, frames: Vec<Frame>)
        -> RenderqResult<()>;

    async fn get_job(&self, id: Uuid) -> RenderqResult<Job>;

    async fn find_job(&self, name: &str) -> RenderqResult<Job>;

    async fn update_job(&self, job: &Job) -> RenderqResult<()>;

    /// Dispatchable jobs of a facility, highest priority then oldest first
    async fn pending_jobs(&self, facility: &str) -> Vec<Job>;

    async fn get_layer(&self, id: Uuid) -> RenderqResult<Layer>;

    /// Layers of a job in dispatch order
    async fn get_layers(&self, job_id: Uuid) -> RenderqResult<Vec<Layer>>;

    async fn get_frame(&self, id: Uuid) -> RenderqResult<Frame>;

    async fn find_frame(&self, layer_id: Uuid, number: i32) -> RenderqResult<Frame>;

    /// Frames of a layer in frame number order
    async fn get_frames(&self, layer_id: Uuid) -> RenderqResult<Vec<Frame>>;

    /// Waiting frames of a layer whose dependencies are satisfied, by number
    async fn dispatchable_frames(&self, layer_id: Uuid) -> RenderqResult<Vec<Frame>>;

    async fn dependencies_satisfied(&self, frame: &Frame) -> RenderqResult<bool>;

    async fn set_frame_state(&self, id: Uuid, state: FrameState)
        -> RenderqResult<()>;

    /// Whether every frame under the target is done
    async fn is_target_complete(&self, target: BookingTarget) -> RenderqResult<bool>;
}

#[async_trait]
pub trait ProcRepository: Send + Sync {
    /// Flip the proc's frame from Waiting to Running and persist the proc, as
    /// one compare-and-commit. Fails with `ConcurrentBookingConflict` when the
    /// frame is no longer waiting or already has a live proc.
    async fn commit_proc(&self, proc: VirtualProc) -> RenderqResult<VirtualProc>;

    /// Remove a proc and move its frame out of Running
    async fn release_proc(&self, id: Uuid, exit: FrameExit) -> RenderqResult<(VirtualProc, Frame)>;

    async fn get_proc(&self, id: Uuid) -> RenderqResult<VirtualProc>;

    async fn proc_for_frame(&self, frame_id: Uuid) -> Option<VirtualProc>;

    async fn procs_for_host(&self, host_id: Uuid) -> Vec<VirtualProc>;

    async fn procs_for_assignment(&self, assignment_id: Uuid) -> Vec<VirtualProc>;
}

#[async_trait]
pub trait AssignmentRepository: Send + Sync {
    /// Fails with `Validation` when the host already has an assignment for the
    /// same target
    async fn insert_assignment(&self, lha: LocalHostAssignment) -> RenderqResult<LocalHostAssignment>;

    async fn get_assignment(&self, id: Uuid) -> RenderqResult<LocalHostAssignment>;

    async fn update_assignment(&self, lha: &LocalHostAssignment) -> RenderqResult<()>;

    async fn remove_assignment(&self, id: Uuid) -> RenderqResult<LocalHostAssignment>;

    /// Assignments on a host, oldest first
    async fn assignments_for_host(&self, host_id: Uuid) -> Vec<LocalHostAssignment>;
}

/// Everything the dispatch engine needs from persistence
pub trait DispatchStore:
    FacilityRepository
    + AllocationRepository
    + HostRepository
    + JobRepository
    + ProcRepository
    + AssignmentRepository
{
}

impl<T> DispatchStore for T where
    T: FacilityRepository
        + AllocationRepository
        + HostRepository
        + JobRepository
        + ProcRepository
        + AssignmentRepository
{
}
