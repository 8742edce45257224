//! In-memory store
//!
//! All tables live behind one `RwLock`; every repository call takes the lock
//! once, so each call behaves as a single transaction. `commit_proc` is the
//! compare-and-commit that enforces one live proc per frame.

use async_trait::async_trait;
use renderq_core::{
    Allocation, BookingTarget, Facility, Frame, FrameExit, FrameState, Host, Job, JobState, Layer,
    LocalHostAssignment, RenderqError, RenderqResult, VirtualProc,
};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::repository::{
    AllocationRemoval, AllocationRepository, AssignmentRepository, FacilityRepository,
    HostRepository, JobRepository, ProcRepository,
};

#[derive(Default)]
struct Tables {
    facilities: HashMap<Uuid, Facility>,
    allocations: HashMap<Uuid, Allocation>,
    hosts: HashMap<Uuid, Host>,
    jobs: HashMap<Uuid, Job>,
    layers: HashMap<Uuid, Layer>,
    frames: HashMap<Uuid, Frame>,
    procs: HashMap<Uuid, VirtualProc>,
    /// frame id -> live proc id
    proc_by_frame: HashMap<Uuid, Uuid>,
    assignments: HashMap<Uuid, LocalHostAssignment>,
}

impl Tables {
    fn allocation_name_taken(&self, name: &str, except: Uuid) -> bool {
        self.allocations
            .values()
            .any(|a| a.id != except && a.name == name)
    }

    fn allocation_in_use(&self, id: Uuid) -> bool {
        let hosts: HashSet<Uuid> = self
            .hosts
            .values()
            .filter(|h| h.allocation_id == id)
            .map(|h| h.id)
            .collect();
        !hosts.is_empty() || self.procs.values().any(|p| hosts.contains(&p.host_id))
    }

    fn set_allocation_hosts_enabled(&mut self, allocation_id: Uuid, enabled: bool) {
        for host in self
            .hosts
            .values_mut()
            .filter(|h| h.allocation_id == allocation_id)
        {
            host.enabled = enabled;
        }
    }

    fn dependencies_satisfied(&self, frame: &Frame) -> bool {
        frame.depends_on.iter().all(|id| {
            self.frames
                .get(id)
                .map(|dep| dep.state.is_complete())
                .unwrap_or(true)
        })
    }

    fn layer_frames(&self, layer_id: Uuid) -> Vec<&Frame> {
        let mut frames: Vec<&Frame> = self
            .frames
            .values()
            .filter(|f| f.layer_id == layer_id)
            .collect();
        frames.sort_by_key(|f| f.number);
        frames
    }

    fn job_frames(&self, job_id: Uuid) -> impl Iterator<Item = &Frame> {
        self.frames.values().filter(move |f| f.job_id == job_id)
    }
}

fn validate_name(kind: &str, name: &str) -> RenderqResult<()> {
    if name.trim().is_empty() {
        return Err(RenderqError::Validation(format!("{} name cannot be empty", kind)));
    }
    if name.contains('.') {
        return Err(RenderqError::Validation(format!(
            "{} name cannot contain '.': {}",
            kind, name
        )));
    }
    Ok(())
}

/// Thread-safe in-memory implementation of every repository
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FacilityRepository for MemoryStore {
    async fn insert_facility(&self, facility: Facility) -> RenderqResult<Facility> {
        validate_name("Facility", &facility.name)?;
        let mut tables = self.tables.write().await;
        if tables.facilities.values().any(|f| f.name == facility.name) {
            return Err(RenderqError::Validation(format!(
                "Facility {} already exists",
                facility.name
            )));
        }
        tables.facilities.insert(facility.id, facility.clone());
        debug!(facility = %facility.name, "Facility created");
        Ok(facility)
    }

    async fn get_facility(&self, name: &str) -> RenderqResult<Facility> {
        let tables = self.tables.read().await;
        tables
            .facilities
            .values()
            .find(|f| f.name == name)
            .cloned()
            .ok_or_else(|| RenderqError::FacilityNotFound(name.to_string()))
    }

    async fn get_facility_by_id(&self, id: Uuid) -> RenderqResult<Facility> {
        let tables = self.tables.read().await;
        tables
            .facilities
            .get(&id)
            .cloned()
            .ok_or_else(|| RenderqError::FacilityNotFound(id.to_string()))
    }
}

#[async_trait]
impl AllocationRepository for MemoryStore {
    async fn insert_allocation(
        &self,
        facility: &Facility,
        alloc: &Allocation,
    ) -> RenderqResult<Allocation> {
        let short_name = alloc.short_name().to_string();
        validate_name("Allocation", &short_name)?;
        if alloc.tag.trim().is_empty() {
            return Err(RenderqError::Validation(
                "Allocation tag cannot be empty".to_string(),
            ));
        }

        let mut guard = self.tables.write().await;
        let tables = &mut *guard;

        if !tables.facilities.contains_key(&facility.id) {
            return Err(RenderqError::FacilityNotFound(facility.name.clone()));
        }
        let name = Allocation::qualify(&facility.name, &short_name);
        if tables.allocation_name_taken(&name, alloc.id) {
            return Err(RenderqError::Validation(format!(
                "Allocation {} already exists",
                name
            )));
        }
        let needs_default = !tables
            .allocations
            .values()
            .any(|a| a.default && a.id != alloc.id);

        if let Some(existing) = tables.allocations.get(&alloc.id) {
            if existing.enabled {
                return Err(RenderqError::Validation(format!(
                    "Allocation {} already exists",
                    existing.name
                )));
            }
        }

        let row = match tables.allocations.get_mut(&alloc.id) {
            Some(existing) => {
                existing.enabled = true;
                existing.facility_id = facility.id;
                existing.name = name;
                info!(allocation = %existing.name, "Allocation re-enabled");
                existing.clone()
            }
            None => {
                let mut row = alloc.clone();
                row.facility_id = facility.id;
                row.name = name;
                row.enabled = true;
                row.default = alloc.default || needs_default;
                if row.default {
                    for other in tables.allocations.values_mut() {
                        other.default = false;
                    }
                }
                tables.allocations.insert(row.id, row.clone());
                info!(allocation = %row.name, tag = %row.tag, "Allocation created");
                row
            }
        };
        tables.set_allocation_hosts_enabled(row.id, true);
        Ok(row)
    }

    async fn get_allocation(&self, id: Uuid) -> RenderqResult<Allocation> {
        let tables = self.tables.read().await;
        tables
            .allocations
            .get(&id)
            .cloned()
            .ok_or_else(|| RenderqError::AllocationNotFound(id.to_string()))
    }

    async fn find_allocation(&self, name: &str) -> RenderqResult<Allocation> {
        let tables = self.tables.read().await;
        tables
            .allocations
            .values()
            .find(|a| a.enabled && a.name == name)
            .cloned()
            .ok_or_else(|| RenderqError::AllocationNotFound(name.to_string()))
    }

    async fn find_allocation_in(
        &self,
        facility: &str,
        short_name: &str,
    ) -> RenderqResult<Allocation> {
        self.find_allocation(&Allocation::qualify(facility, short_name))
            .await
    }

    async fn update_allocation_name(
        &self,
        id: Uuid,
        short_name: &str,
    ) -> RenderqResult<Allocation> {
        validate_name("Allocation", short_name)?;

        let mut tables = self.tables.write().await;
        let facility_id = tables
            .allocations
            .get(&id)
            .map(|a| a.facility_id)
            .ok_or_else(|| RenderqError::AllocationNotFound(id.to_string()))?;
        let facility = tables
            .facilities
            .get(&facility_id)
            .map(|f| f.name.clone())
            .ok_or_else(|| RenderqError::FacilityNotFound(facility_id.to_string()))?;

        let name = Allocation::qualify(&facility, short_name);
        if tables.allocation_name_taken(&name, id) {
            return Err(RenderqError::Validation(format!(
                "Allocation {} already exists",
                name
            )));
        }

        let alloc = tables
            .allocations
            .get_mut(&id)
            .ok_or_else(|| RenderqError::AllocationNotFound(id.to_string()))?;
        info!(from = %alloc.name, to = %name, "Allocation renamed");
        alloc.name = name;
        Ok(alloc.clone())
    }

    async fn update_allocation_tag(&self, id: Uuid, tag: &str) -> RenderqResult<()> {
        if tag.trim().is_empty() {
            return Err(RenderqError::Validation(
                "Allocation tag cannot be empty".to_string(),
            ));
        }
        let mut tables = self.tables.write().await;
        let alloc = tables
            .allocations
            .get_mut(&id)
            .ok_or_else(|| RenderqError::AllocationNotFound(id.to_string()))?;
        alloc.tag = tag.to_string();
        Ok(())
    }

    async fn update_allocation_billable(&self, id: Uuid, billable: bool) -> RenderqResult<()> {
        let mut tables = self.tables.write().await;
        let alloc = tables
            .allocations
            .get_mut(&id)
            .ok_or_else(|| RenderqError::AllocationNotFound(id.to_string()))?;
        alloc.billable = billable;
        Ok(())
    }

    async fn set_default_allocation(&self, id: Uuid) -> RenderqResult<()> {
        let mut tables = self.tables.write().await;
        match tables.allocations.get(&id) {
            Some(alloc) if alloc.enabled => {}
            Some(alloc) => {
                return Err(RenderqError::Validation(format!(
                    "Allocation {} is disabled",
                    alloc.name
                )))
            }
            None => return Err(RenderqError::AllocationNotFound(id.to_string())),
        }
        for alloc in tables.allocations.values_mut() {
            alloc.default = alloc.id == id;
        }
        Ok(())
    }

    async fn default_allocation(&self) -> RenderqResult<Allocation> {
        let tables = self.tables.read().await;
        tables
            .allocations
            .values()
            .find(|a| a.default)
            .cloned()
            .ok_or_else(|| RenderqError::AllocationNotFound("default".to_string()))
    }

    async fn delete_allocation(&self, id: Uuid) -> RenderqResult<AllocationRemoval> {
        let mut tables = self.tables.write().await;
        let alloc = tables
            .allocations
            .get(&id)
            .cloned()
            .ok_or_else(|| RenderqError::AllocationNotFound(id.to_string()))?;
        if alloc.default {
            return Err(RenderqError::Validation(format!(
                "Cannot delete the default allocation {}",
                alloc.name
            )));
        }

        if tables.allocation_in_use(id) {
            if let Some(row) = tables.allocations.get_mut(&id) {
                row.enabled = false;
            }
            tables.set_allocation_hosts_enabled(id, false);
            info!(allocation = %alloc.name, "Allocation in use, disabled");
            Ok(AllocationRemoval::Disabled)
        } else {
            tables.allocations.remove(&id);
            info!(allocation = %alloc.name, "Allocation deleted");
            Ok(AllocationRemoval::Deleted)
        }
    }
}

#[async_trait]
impl HostRepository for MemoryStore {
    async fn insert_host(&self, host: Host) -> RenderqResult<Host> {
        if host.name.trim().is_empty() {
            return Err(RenderqError::Validation("Host name cannot be empty".to_string()));
        }
        let mut tables = self.tables.write().await;
        if tables.hosts.values().any(|h| h.name == host.name) {
            return Err(RenderqError::Validation(format!(
                "Host {} already exists",
                host.name
            )));
        }
        match tables.allocations.get(&host.allocation_id) {
            Some(alloc) if alloc.enabled => {}
            Some(alloc) => {
                return Err(RenderqError::Validation(format!(
                    "Allocation {} is disabled",
                    alloc.name
                )))
            }
            None => return Err(RenderqError::AllocationNotFound(host.allocation_id.to_string())),
        }
        tables.hosts.insert(host.id, host.clone());
        info!(host = %host.name, cores = host.total.cores, memory = host.total.memory, "Host created");
        Ok(host)
    }

    async fn get_host(&self, id: Uuid) -> RenderqResult<Host> {
        let tables = self.tables.read().await;
        tables
            .hosts
            .get(&id)
            .cloned()
            .ok_or_else(|| RenderqError::HostNotFound(id.to_string()))
    }

    async fn find_host(&self, name: &str) -> RenderqResult<Host> {
        let tables = self.tables.read().await;
        tables
            .hosts
            .values()
            .find(|h| h.name == name)
            .cloned()
            .ok_or_else(|| RenderqError::HostNotFound(name.to_string()))
    }

    async fn update_host(&self, host: &Host) -> RenderqResult<()> {
        let mut tables = self.tables.write().await;
        if !tables.allocations.contains_key(&host.allocation_id) {
            return Err(RenderqError::AllocationNotFound(host.allocation_id.to_string()));
        }
        let row = tables
            .hosts
            .get_mut(&host.id)
            .ok_or_else(|| RenderqError::HostNotFound(host.name.clone()))?;
        *row = host.clone();
        Ok(())
    }

    async fn hosts(&self) -> Vec<Host> {
        let tables = self.tables.read().await;
        let mut hosts: Vec<Host> = tables.hosts.values().cloned().collect();
        hosts.sort_by(|a, b| a.name.cmp(&b.name));
        hosts
    }
}

#[async_trait]
impl JobRepository for MemoryStore {
    async fn insert_job(
        &self,
        job: Job,
        layers: Vec<Layer>,
        frames: Vec<Frame>,
    ) -> RenderqResult<()> {
        let mut tables = self.tables.write().await;
        if tables.jobs.values().any(|j| j.name == job.name) {
            return Err(RenderqError::Validation(format!("Job {} already exists", job.name)));
        }
        if let Some(layer) = layers.iter().find(|l| l.job_id != job.id) {
            return Err(RenderqError::Validation(format!(
                "Layer {} does not belong to job {}",
                layer.name, job.name
            )));
        }

        let layer_ids: HashSet<Uuid> = layers.iter().map(|l| l.id).collect();
        let frame_ids: HashSet<Uuid> = frames.iter().map(|f| f.id).collect();
        let mut numbers = HashSet::new();
        for frame in &frames {
            if frame.job_id != job.id || !layer_ids.contains(&frame.layer_id) {
                return Err(RenderqError::Validation(format!(
                    "Frame {} does not belong to job {}",
                    frame.number, job.name
                )));
            }
            if !numbers.insert((frame.layer_id, frame.number)) {
                return Err(RenderqError::Validation(format!(
                    "Duplicate frame number {} in job {}",
                    frame.number, job.name
                )));
            }
            if let Some(dep) = frame
                .depends_on
                .iter()
                .find(|d| !frame_ids.contains(d) && !tables.frames.contains_key(d))
            {
                return Err(RenderqError::FrameNotFound(dep.to_string()));
            }
        }

        info!(
            job = %job.name,
            layers = layers.len(),
            frames = frames.len(),
            priority = job.priority,
            "Job inserted"
        );
        tables.jobs.insert(job.id, job);
        for layer in layers {
            tables.layers.insert(layer.id, layer);
        }
        for frame in frames {
            tables.frames.insert(frame.id, frame);
        }
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> RenderqResult<Job> {
        let tables = self.tables.read().await;
        tables
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| RenderqError::JobNotFound(id.to_string()))
    }

    async fn find_job(&self, name: &str) -> RenderqResult<Job> {
        let tables = self.tables.read().await;
        tables
            .jobs
            .values()
            .find(|j| j.name == name)
            .cloned()
            .ok_or_else(|| RenderqError::JobNotFound(name.to_string()))
    }

    async fn update_job(&self, job: &Job) -> RenderqResult<()> {
        let mut tables = self.tables.write().await;
        let row = tables
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| RenderqError::JobNotFound(job.name.clone()))?;
        *row = job.clone();
        Ok(())
    }

    async fn pending_jobs(&self, facility: &str) -> Vec<Job> {
        let tables = self.tables.read().await;
        let mut jobs: Vec<Job> = tables
            .jobs
            .values()
            .filter(|j| j.is_dispatchable() && j.facility == facility)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.submitted_at.cmp(&b.submitted_at))
                .then(a.name.cmp(&b.name))
        });
        jobs
    }

    async fn get_layer(&self, id: Uuid) -> RenderqResult<Layer> {
        let tables = self.tables.read().await;
        tables
            .layers
            .get(&id)
            .cloned()
            .ok_or_else(|| RenderqError::LayerNotFound(id.to_string()))
    }

    async fn get_layers(&self, job_id: Uuid) -> RenderqResult<Vec<Layer>> {
        let tables = self.tables.read().await;
        if !tables.jobs.contains_key(&job_id) {
            return Err(RenderqError::JobNotFound(job_id.to_string()));
        }
        let mut layers: Vec<Layer> = tables
            .layers
            .values()
            .filter(|l| l.job_id == job_id)
            .cloned()
            .collect();
        layers.sort_by(|a, b| {
            a.dispatch_order
                .cmp(&b.dispatch_order)
                .then(a.name.cmp(&b.name))
        });
        Ok(layers)
    }

    async fn get_frame(&self, id: Uuid) -> RenderqResult<Frame> {
        let tables = self.tables.read().await;
        tables
            .frames
            .get(&id)
            .cloned()
            .ok_or_else(|| RenderqError::FrameNotFound(id.to_string()))
    }

    async fn find_frame(&self, layer_id: Uuid, number: i32) -> RenderqResult<Frame> {
        let tables = self.tables.read().await;
        tables
            .frames
            .values()
            .find(|f| f.layer_id == layer_id && f.number == number)
            .cloned()
            .ok_or_else(|| RenderqError::FrameNotFound(format!("{}-{}", layer_id, number)))
    }

    async fn get_frames(&self, layer_id: Uuid) -> RenderqResult<Vec<Frame>> {
        let tables = self.tables.read().await;
        if !tables.layers.contains_key(&layer_id) {
            return Err(RenderqError::LayerNotFound(layer_id.to_string()));
        }
        Ok(tables.layer_frames(layer_id).into_iter().cloned().collect())
    }

    async fn dispatchable_frames(&self, layer_id: Uuid) -> RenderqResult<Vec<Frame>> {
        let tables = self.tables.read().await;
        if !tables.layers.contains_key(&layer_id) {
            return Err(RenderqError::LayerNotFound(layer_id.to_string()));
        }
        Ok(tables
            .layer_frames(layer_id)
            .into_iter()
            .filter(|f| {
                f.state == FrameState::Waiting
                    && !tables.proc_by_frame.contains_key(&f.id)
                    && tables.dependencies_satisfied(f)
            })
            .cloned()
            .collect())
    }

    async fn dependencies_satisfied(&self, frame: &Frame) -> RenderqResult<bool> {
        let tables = self.tables.read().await;
        Ok(tables.dependencies_satisfied(frame))
    }

    async fn set_frame_state(&self, id: Uuid, state: FrameState) -> RenderqResult<()> {
        let mut tables = self.tables.write().await;
        if state != FrameState::Running && tables.proc_by_frame.contains_key(&id) {
            return Err(RenderqError::Validation(format!(
                "Frame {} has a live proc; release it instead",
                id
            )));
        }
        let frame = tables
            .frames
            .get_mut(&id)
            .ok_or_else(|| RenderqError::FrameNotFound(id.to_string()))?;
        frame.state = state;
        Ok(())
    }

    async fn is_target_complete(&self, target: BookingTarget) -> RenderqResult<bool> {
        let tables = self.tables.read().await;
        match target {
            BookingTarget::Job(id) => {
                let job = tables
                    .jobs
                    .get(&id)
                    .ok_or_else(|| RenderqError::JobNotFound(id.to_string()))?;
                Ok(job.state == JobState::Finished
                    || tables.job_frames(id).all(|f| f.state.is_done()))
            }
            BookingTarget::Layer(id) => {
                if !tables.layers.contains_key(&id) {
                    return Err(RenderqError::LayerNotFound(id.to_string()));
                }
                Ok(tables.layer_frames(id).iter().all(|f| f.state.is_done()))
            }
            BookingTarget::Frame(id) => tables
                .frames
                .get(&id)
                .map(|f| f.state.is_done())
                .ok_or_else(|| RenderqError::FrameNotFound(id.to_string())),
        }
    }
}

#[async_trait]
impl ProcRepository for MemoryStore {
    async fn commit_proc(&self, proc: VirtualProc) -> RenderqResult<VirtualProc> {
        let mut guard = self.tables.write().await;
        let tables = &mut *guard;

        if tables.proc_by_frame.contains_key(&proc.frame_id) {
            return Err(RenderqError::ConcurrentBookingConflict(format!(
                "Frame {} already has a live proc",
                proc.frame_id
            )));
        }
        if !tables.hosts.contains_key(&proc.host_id) {
            return Err(RenderqError::HostNotFound(proc.host_id.to_string()));
        }
        let frame = tables
            .frames
            .get(&proc.frame_id)
            .ok_or_else(|| RenderqError::FrameNotFound(proc.frame_id.to_string()))?;
        if frame.state != FrameState::Waiting || !tables.dependencies_satisfied(frame) {
            return Err(RenderqError::ConcurrentBookingConflict(format!(
                "Frame {} is {}",
                proc.frame_id, frame.state
            )));
        }

        if let Some(frame) = tables.frames.get_mut(&proc.frame_id) {
            frame.state = FrameState::Running;
        }
        tables.proc_by_frame.insert(proc.frame_id, proc.id);
        tables.procs.insert(proc.id, proc.clone());
        Ok(proc)
    }

    async fn release_proc(&self, id: Uuid, exit: FrameExit) -> RenderqResult<(VirtualProc, Frame)> {
        let mut guard = self.tables.write().await;
        let tables = &mut *guard;

        let proc = tables
            .procs
            .remove(&id)
            .ok_or_else(|| RenderqError::ProcNotFound(id.to_string()))?;
        tables.proc_by_frame.remove(&proc.frame_id);

        let frame = tables
            .frames
            .get_mut(&proc.frame_id)
            .ok_or_else(|| RenderqError::FrameNotFound(proc.frame_id.to_string()))?;
        if frame.state == FrameState::Running {
            frame.state = match exit {
                FrameExit::Succeeded => FrameState::Succeeded,
                FrameExit::Failed => FrameState::Dead,
                FrameExit::Killed => {
                    frame.retries += 1;
                    FrameState::Waiting
                }
            };
        }
        let frame = frame.clone();

        if tables.job_frames(proc.job_id).all(|f| f.state.is_done()) {
            if let Some(job) = tables.jobs.get_mut(&proc.job_id) {
                job.state = JobState::Finished;
                info!(job = %job.name, "Job finished");
            }
        }
        Ok((proc, frame))
    }

    async fn get_proc(&self, id: Uuid) -> RenderqResult<VirtualProc> {
        let tables = self.tables.read().await;
        tables
            .procs
            .get(&id)
            .cloned()
            .ok_or_else(|| RenderqError::ProcNotFound(id.to_string()))
    }

    async fn proc_for_frame(&self, frame_id: Uuid) -> Option<VirtualProc> {
        let tables = self.tables.read().await;
        tables
            .proc_by_frame
            .get(&frame_id)
            .and_then(|id| tables.procs.get(id))
            .cloned()
    }

    async fn procs_for_host(&self, host_id: Uuid) -> Vec<VirtualProc> {
        let tables = self.tables.read().await;
        let mut procs: Vec<VirtualProc> = tables
            .procs
            .values()
            .filter(|p| p.host_id == host_id)
            .cloned()
            .collect();
        procs.sort_by_key(|p| p.booked_at);
        procs
    }

    async fn procs_for_assignment(&self, assignment_id: Uuid) -> Vec<VirtualProc> {
        let tables = self.tables.read().await;
        tables
            .procs
            .values()
            .filter(|p| p.assignment_id == Some(assignment_id))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl AssignmentRepository for MemoryStore {
    async fn insert_assignment(
        &self,
        lha: LocalHostAssignment,
    ) -> RenderqResult<LocalHostAssignment> {
        let mut tables = self.tables.write().await;
        if !tables.hosts.contains_key(&lha.host_id) {
            return Err(RenderqError::HostNotFound(lha.host_id.to_string()));
        }
        if tables
            .assignments
            .values()
            .any(|a| a.host_id == lha.host_id && a.target == lha.target)
        {
            return Err(RenderqError::Validation(format!(
                "Host {} is already booked to {}",
                lha.host_id, lha.target
            )));
        }
        tables.assignments.insert(lha.id, lha.clone());
        Ok(lha)
    }

    async fn get_assignment(&self, id: Uuid) -> RenderqResult<LocalHostAssignment> {
        let tables = self.tables.read().await;
        tables
            .assignments
            .get(&id)
            .cloned()
            .ok_or_else(|| RenderqError::AssignmentNotFound(id.to_string()))
    }

    async fn update_assignment(&self, lha: &LocalHostAssignment) -> RenderqResult<()> {
        let mut tables = self.tables.write().await;
        let row = tables
            .assignments
            .get_mut(&lha.id)
            .ok_or_else(|| RenderqError::AssignmentNotFound(lha.id.to_string()))?;
        *row = lha.clone();
        Ok(())
    }

    async fn remove_assignment(&self, id: Uuid) -> RenderqResult<LocalHostAssignment> {
        let mut tables = self.tables.write().await;
        tables
            .assignments
            .remove(&id)
            .ok_or_else(|| RenderqError::AssignmentNotFound(id.to_string()))
    }

    async fn assignments_for_host(&self, host_id: Uuid) -> Vec<LocalHostAssignment> {
        let tables = self.tables.read().await;
        let mut assignments: Vec<LocalHostAssignment> = tables
            .assignments
            .values()
            .filter(|a| a.host_id == host_id)
            .cloned()
            .collect();
        assignments.sort_by_key(|a| a.created_at);
        assignments
    }
}
