//! Dispatcher: places frames on hosts

use chrono::Utc;
use renderq_core::{
    BookingTarget, DispatchHost, DispatcherConfig, FrameEvent, FrameExit, FrameTransition, Host,
    HostReport, LockState, RenderqError, RenderqResult, ResourceSlice, VirtualProc,
};
use renderq_store::{
    AllocationRepository, AssignmentRepository, DispatchStore, FacilityRepository,
    HostRepository, JobRepository, ProcRepository,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ledger::ResourceLedger;
use crate::selector::{Candidate, CandidateFrames, CandidateSelector};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

type HostGuards = HashMap<Uuid, Arc<Mutex<()>>>;

/// Dispatcher turns idle host capacity into virtual procs
pub struct Dispatcher {
    /// Persistent farm state
    store: Arc<dyn DispatchStore>,
    /// Candidate frame selection
    selector: CandidateSelector,
    /// Idle capacity per host
    ledger: RwLock<ResourceLedger>,
    /// One guard per host; passes on a host run one at a time
    host_guards: Mutex<HostGuards>,
    /// Frame transition events
    events: broadcast::Sender<FrameEvent>,
    config: DispatcherConfig,
}

impl Dispatcher {
    /// Create a dispatcher with the default scope strategies
    pub fn new(store: Arc<dyn DispatchStore>, config: DispatcherConfig) -> Self {
        let selector = CandidateSelector::new(store.clone(), config.clone());
        Self::with_selector(store, selector, config)
    }

    pub fn with_selector(
        store: Arc<dyn DispatchStore>,
        selector: CandidateSelector,
        config: DispatcherConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        info!(
            max_procs_per_pass = config.max_procs_per_pass,
            max_candidate_frames = config.max_candidate_frames,
            "Dispatcher initialized"
        );

        Self {
            store,
            selector,
            ledger: RwLock::new(ResourceLedger::new()),
            host_guards: Mutex::new(HashMap::new()),
            events,
            config,
        }
    }

    pub fn store(&self) -> Arc<dyn DispatchStore> {
        self.store.clone()
    }

    /// Receive frame transition events
    pub fn subscribe(&self) -> broadcast::Receiver<FrameEvent> {
        self.events.subscribe()
    }

    /// Idle capacity of a host according to the ledger
    pub async fn idle(&self, host_id: Uuid) -> Option<ResourceSlice> {
        self.ledger.read().await.idle(host_id)
    }

    /// Capacity held by live procs on a host
    pub async fn committed(&self, host_id: Uuid) -> Option<ResourceSlice> {
        self.ledger.read().await.committed(host_id)
    }

    /// Dispatch a host against whatever its scope resolves to: its local host
    /// assignments if it has any, open work otherwise
    pub async fn dispatch_host(&self, host_id: Uuid) -> RenderqResult<Vec<VirtualProc>> {
        self.run_pass(host_id, None).await
    }

    /// Dispatch a host against one job, layer or frame
    pub async fn dispatch_host_to(
        &self,
        host_id: Uuid,
        target: BookingTarget,
    ) -> RenderqResult<Vec<VirtualProc>> {
        self.run_pass(host_id, Some(target)).await
    }

    async fn host_guard(&self, host_id: Uuid) -> Arc<Mutex<()>> {
        self.host_guards
            .lock()
            .await
            .entry(host_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Stop tracking a host once any pass on it has finished. The next report
    /// or pass for the host rebuilds its ledger entry from live procs.
    pub async fn remove_host(&self, host_id: Uuid) -> bool {
        let guard = self.host_guard(host_id).await;
        let _pass = guard.lock().await;

        let removed = self.ledger.write().await.remove_host(host_id);
        self.host_guards.lock().await.remove(&host_id);
        if removed {
            debug!(host_id = %host_id, "Host dropped from ledger");
        }
        removed
    }

    async fn run_pass(
        &self,
        host_id: Uuid,
        target: Option<BookingTarget>,
    ) -> RenderqResult<Vec<VirtualProc>> {
        let guard = self.host_guard(host_id).await;
        let _pass = guard.lock().await;

        let host = self.dispatch_host_view(host_id).await?;
        let candidates = match self.selector.select_frames(&host, target).await {
            Ok(candidates) => candidates,
            Err(e) if e.is_placement_failure() => {
                debug!(host = %host.name(), error = %e, "Nothing to dispatch");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        Ok(self.place_candidates(&host, candidates).await)
    }

    /// Walk a candidate snapshot, placing procs until the host, the pass limit
    /// or the candidates run out. Frames taken by another pass since the
    /// snapshot are skipped.
    async fn place_candidates(
        &self,
        host: &DispatchHost,
        candidates: CandidateFrames,
    ) -> Vec<VirtualProc> {
        let scope = candidates.scope();

        let mut placed: Vec<VirtualProc> = Vec::new();
        let mut usage: HashMap<Uuid, ResourceSlice> = HashMap::new();
        let mut exhausted: HashSet<Uuid> = HashSet::new();

        for candidate in candidates {
            if placed.len() >= self.config.max_procs_per_pass {
                debug!(host = %host.name(), "Per-pass proc limit reached");
                break;
            }

            let slice = proc_slice(&candidate);
            if let Some(lha) = &candidate.assignment {
                if exhausted.contains(&lha.id) {
                    continue;
                }
                let used = match usage.get(&lha.id) {
                    Some(used) => *used,
                    None => {
                        let used = self.assignment_usage(lha.id).await;
                        usage.insert(lha.id, used);
                        used
                    }
                };
                let pinned_frame_placed = matches!(lha.target, BookingTarget::Frame(_))
                    && placed.iter().any(|p| p.assignment_id == Some(lha.id));
                if pinned_frame_placed
                    || !used.saturating_add(&slice).fits_within(&lha.bounds.max_slice())
                {
                    debug!(
                        host = %host.name(),
                        assignment_id = %lha.id,
                        used = %used,
                        "Assignment headroom exhausted"
                    );
                    exhausted.insert(lha.id);
                    continue;
                }
            }

            match self.place(host, &candidate, slice).await {
                Ok(proc) => {
                    if let Some(id) = proc.assignment_id {
                        let used = usage.entry(id).or_default();
                        *used = used.saturating_add(&proc.reserved);
                    }
                    placed.push(proc);
                }
                Err(RenderqError::InsufficientResources(reason)) => {
                    debug!(host = %host.name(), reason = %reason, "Host out of idle capacity");
                    break;
                }
                Err(RenderqError::ConcurrentBookingConflict(reason)) => {
                    debug!(
                        host = %host.name(),
                        frame_id = %candidate.frame.id,
                        reason = %reason,
                        "Lost frame to another pass"
                    );
                }
                Err(e) => {
                    warn!(host = %host.name(), error = %e, "Dispatch pass aborted");
                    break;
                }
            }
        }

        if placed.is_empty() {
            debug!(host = %host.name(), scope = ?scope, "Nothing dispatched");
        } else {
            info!(
                host = %host.name(),
                scope = ?scope,
                procs = placed.len(),
                "Dispatch pass complete"
            );
        }
        placed
    }

    /// Reserve, commit and announce one proc. Rolls the reservation back if
    /// the commit fails.
    async fn place(
        &self,
        host: &DispatchHost,
        candidate: &Candidate,
        slice: ResourceSlice,
    ) -> RenderqResult<VirtualProc> {
        let reservation = self.ledger.write().await.reserve(host.id(), slice)?;

        let proc = VirtualProc {
            id: Uuid::new_v4(),
            host_id: host.id(),
            host_name: host.name().to_string(),
            job_id: candidate.job.id,
            layer_id: candidate.layer.id,
            frame_id: candidate.frame.id,
            reserved: slice,
            is_local_dispatch: candidate.is_local(),
            assignment_id: candidate.assignment.as_ref().map(|a| a.id),
            reservation,
            booked_at: Utc::now(),
        };

        match self.store.commit_proc(proc).await {
            Ok(proc) => {
                info!(
                    proc_id = %proc.id,
                    host = %host.name(),
                    job = %candidate.job.name,
                    layer = %candidate.layer.name,
                    frame = candidate.frame.number,
                    cores = slice.cores,
                    memory = slice.memory,
                    local = proc.is_local_dispatch,
                    "Frame booked"
                );
                self.emit(FrameEvent::for_proc(&proc, FrameTransition::Started));
                Ok(proc)
            }
            Err(e) => {
                if let Err(release_err) = self.ledger.write().await.release(&reservation) {
                    warn!(
                        host = %host.name(),
                        error = %release_err,
                        "Failed to roll back reservation"
                    );
                }
                Err(e)
            }
        }
    }

    async fn assignment_usage(&self, assignment_id: Uuid) -> ResourceSlice {
        self.store
            .procs_for_assignment(assignment_id)
            .await
            .iter()
            .map(|p| p.reserved)
            .sum()
    }

    /// Join a host with its allocation scope and ledger idle capacity
    pub async fn dispatch_host_view(&self, host_id: Uuid) -> RenderqResult<DispatchHost> {
        let host = self.store.get_host(host_id).await?;
        let alloc = self.store.get_allocation(host.allocation_id).await?;
        let facility = self.store.get_facility_by_id(alloc.facility_id).await?;

        self.sync_ledger(&host).await?;
        let idle = self.idle(host_id).await.unwrap_or_default();

        Ok(DispatchHost {
            host,
            facility: facility.name,
            allocation_tag: alloc.tag,
            allocation_enabled: alloc.enabled,
            idle,
        })
    }

    /// Track a host in the ledger, rebuilding its commitments from live procs
    /// the first time it is seen
    async fn sync_ledger(&self, host: &Host) -> RenderqResult<()> {
        let known = self.ledger.read().await.contains(host.id);
        if known {
            return self.ledger.write().await.resize_host(host.id, host.total);
        }

        let procs = self.store.procs_for_host(host.id).await;
        let mut ledger = self.ledger.write().await;
        if ledger.register_host(host.id, host.total) && !procs.is_empty() {
            for proc in &procs {
                ledger.restore(proc.reservation, proc.reserved);
            }
            info!(host = %host.name, procs = procs.len(), "Ledger rebuilt from live procs");
        }
        Ok(())
    }

    /// A running frame ended: free its proc, move the frame on and drop any
    /// local host assignment whose target is now complete
    pub async fn release_proc(&self, proc_id: Uuid, exit: FrameExit) -> RenderqResult<VirtualProc> {
        let (proc, frame) = self.store.release_proc(proc_id, exit).await?;

        if let Err(e) = self.ledger.write().await.release(&proc.reservation) {
            warn!(proc_id = %proc.id, error = %e, "Reservation missing from ledger");
        }

        info!(
            proc_id = %proc.id,
            host = %proc.host_name,
            frame_id = %frame.id,
            state = %frame.state,
            "Proc released"
        );
        self.emit(FrameEvent::for_proc(&proc, exit.into()));

        self.retire_assignments(proc.host_id).await;
        Ok(proc)
    }

    async fn retire_assignments(&self, host_id: Uuid) {
        for lha in self.store.assignments_for_host(host_id).await {
            let complete = match self.store.is_target_complete(lha.target).await {
                Ok(complete) => complete,
                Err(e) if e.is_not_found() => true,
                Err(e) => {
                    warn!(assignment_id = %lha.id, error = %e, "Failed to check assignment target");
                    continue;
                }
            };
            if !complete {
                continue;
            }
            match self.store.remove_assignment(lha.id).await {
                Ok(_) => info!(
                    assignment_id = %lha.id,
                    target = %lha.target,
                    "Assignment target complete, released"
                ),
                Err(e) => warn!(assignment_id = %lha.id, error = %e, "Failed to release assignment"),
            }
        }
    }

    /// Upsert the reporting host, sync its totals and dispatch it
    pub async fn handle_report(&self, report: HostReport) -> RenderqResult<Vec<VirtualProc>> {
        let host = match self.store.find_host(&report.name).await {
            Ok(mut host) => {
                apply_report(&mut host, &report);
                self.store.update_host(&host).await?;
                host
            }
            Err(RenderqError::HostNotFound(_)) => self.create_host(&report).await?,
            Err(e) => return Err(e),
        };

        self.sync_ledger(&host).await?;
        self.dispatch_host(host.id).await
    }

    /// New hosts join the named allocation, or the default one; either way it
    /// must belong to the facility the host reports from
    async fn create_host(&self, report: &HostReport) -> RenderqResult<Host> {
        let facility = self.store.get_facility(&report.facility).await?;
        let alloc = match &report.allocation {
            Some(name) => self.store.find_allocation(name).await?,
            None => self.store.default_allocation().await?,
        };
        if alloc.facility_id != facility.id {
            return Err(RenderqError::Validation(format!(
                "host {} reports from {} but allocation {} is outside it",
                report.name, facility.name, alloc.name
            )));
        }

        let mut host = Host::new(&report.name, alloc.id, report.total());
        apply_report(&mut host, report);
        let host = self.store.insert_host(host).await?;

        info!(
            host = %host.name,
            facility = %facility.name,
            allocation = %alloc.name,
            "Host created from report"
        );
        Ok(host)
    }

    fn emit(&self, event: FrameEvent) {
        // Fails only when nobody is subscribed
        let _ = self.events.send(event);
    }
}

/// Local procs book whole threads; everything else books the layer minimums
fn proc_slice(candidate: &Candidate) -> ResourceSlice {
    let requirements = candidate.layer.requirements();
    match &candidate.assignment {
        Some(lha) => ResourceSlice {
            cores: lha.bounds.proc_cores(),
            ..requirements
        },
        None => requirements,
    }
}

fn apply_report(host: &mut Host, report: &HostReport) {
    host.state = report.state;
    host.nimby_enabled = report.nimby_enabled;
    host.lock_state = match (report.lock_state(), host.lock_state) {
        (LockState::NimbyLocked, _) => LockState::NimbyLocked,
        (_, LockState::NimbyLocked) => LockState::Open,
        (_, current) => current,
    };
    host.tags = report.tags.iter().cloned().collect();
    host.total = report.total();
    host.total_swap = report.total_swap;
    host.free_swap = report.free_swap;
    host.boot_time = report.boot_time;
    host.last_ping = Utc::now();
}
