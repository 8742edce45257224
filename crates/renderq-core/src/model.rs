//! Farm entities: facilities, allocations, hosts, jobs, layers, frames,
//! virtual procs and local host assignments

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::resources::{threads_to_core_units, ResourceSlice, CORE_UNITS_PER_CORE};

/// A physical site grouping allocations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facility {
    pub id: Uuid,
    pub name: String,
}

impl Facility {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
        }
    }
}

/// A named, tagged group of hosts under a facility
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    /// Unique identifier, kept across soft delete and re-enable
    pub id: Uuid,
    /// Owning facility
    pub facility_id: Uuid,
    /// Fully qualified name: `<facility>.<short name>`
    pub name: String,
    /// Tag hosts in this allocation answer to
    pub tag: String,
    /// Whether usage is billed
    pub billable: bool,
    /// Soft-delete flag
    pub enabled: bool,
    /// The single system-wide default allocation
    pub default: bool,
}

impl Allocation {
    /// Create a new allocation under a facility
    pub fn new(facility: &Facility, short_name: &str, tag: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            facility_id: facility.id,
            name: Self::qualify(&facility.name, short_name),
            tag: tag.into(),
            billable: true,
            enabled: true,
            default: false,
        }
    }

    /// Build a fully qualified allocation name
    pub fn qualify(facility: &str, short_name: &str) -> String {
        format!("{}.{}", facility, short_name)
    }

    /// The part of the name after the facility prefix
    pub fn short_name(&self) -> &str {
        self.name
            .split_once('.')
            .map(|(_, short)| short)
            .unwrap_or(&self.name)
    }
}

/// Hardware state reported by a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareState {
    Up,
    Down,
    Rebooting,
    RebootWhenIdle,
    Repair,
}

impl std::fmt::Display for HardwareState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HardwareState::Up => write!(f, "UP"),
            HardwareState::Down => write!(f, "DOWN"),
            HardwareState::Rebooting => write!(f, "REBOOTING"),
            HardwareState::RebootWhenIdle => write!(f, "REBOOT_WHEN_IDLE"),
            HardwareState::Repair => write!(f, "REPAIR"),
        }
    }
}

/// Whether a host accepts new work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    Open,
    Locked,
    /// Locked by the host's interactive user (NIMBY)
    NimbyLocked,
}

/// A worker host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub id: Uuid,
    pub name: String,
    pub allocation_id: Uuid,
    pub tags: BTreeSet<String>,
    pub state: HardwareState,
    pub lock_state: LockState,
    pub nimby_enabled: bool,
    /// Cleared when the host's allocation is soft-deleted
    pub enabled: bool,
    /// Total bookable capacity
    pub total: ResourceSlice,
    /// Total swap in KB
    pub total_swap: u64,
    /// Free swap in KB, as last reported
    pub free_swap: u64,
    pub boot_time: Option<DateTime<Utc>>,
    pub last_ping: DateTime<Utc>,
}

impl Host {
    /// Create a new host in an allocation
    pub fn new(name: impl Into<String>, allocation_id: Uuid, total: ResourceSlice) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            allocation_id,
            tags: BTreeSet::new(),
            state: HardwareState::Up,
            lock_state: LockState::Open,
            nimby_enabled: false,
            enabled: true,
            total,
            total_swap: 0,
            free_swap: 0,
            boot_time: None,
            last_ping: Utc::now(),
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Up and enabled
    pub fn is_up(&self) -> bool {
        self.enabled && self.state == HardwareState::Up
    }

    /// Whether the host takes work from the open queue
    pub fn accepts_open_dispatch(&self) -> bool {
        self.is_up() && self.lock_state == LockState::Open
    }
}

/// A host joined with its allocation scope and current idle capacity
#[derive(Debug, Clone)]
pub struct DispatchHost {
    pub host: Host,
    /// Name of the facility owning the host's allocation
    pub facility: String,
    pub allocation_tag: String,
    pub allocation_enabled: bool,
    /// Idle capacity according to the resource ledger
    pub idle: ResourceSlice,
}

impl DispatchHost {
    pub fn id(&self) -> Uuid {
        self.host.id
    }

    pub fn name(&self) -> &str {
        &self.host.name
    }

    /// A layer matches when it has no tags, or shares one with the host or
    /// its allocation
    pub fn matches_tags(&self, layer_tags: &BTreeSet<String>) -> bool {
        layer_tags.is_empty()
            || layer_tags
                .iter()
                .any(|t| *t == self.allocation_tag || self.host.tags.contains(t))
    }
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Finished,
}

/// A submitted unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub show: String,
    /// Facility whose hosts may run the job
    pub facility: String,
    /// Higher runs first
    pub priority: i32,
    pub state: JobState,
    pub paused: bool,
    pub submitted_at: DateTime<Utc>,
}

impl Job {
    pub fn new(name: impl Into<String>, show: impl Into<String>, facility: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            show: show.into(),
            facility: facility.into(),
            priority: 1,
            state: JobState::Pending,
            paused: false,
            submitted_at: Utc::now(),
        }
    }

    pub fn is_dispatchable(&self) -> bool {
        self.state == JobState::Pending && !self.paused
    }
}

/// A group of frames sharing resource requirements
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer {
    pub id: Uuid,
    pub job_id: Uuid,
    pub name: String,
    /// Lower dispatches first
    pub dispatch_order: u32,
    pub tags: BTreeSet<String>,
    /// Core units per frame
    pub min_cores: u32,
    /// KB per frame
    pub min_memory: u64,
    pub min_gpus: u32,
    /// KB per frame
    pub min_gpu_memory: u64,
}

impl Layer {
    pub fn new(job: &Job, name: impl Into<String>, dispatch_order: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id: job.id,
            name: name.into(),
            dispatch_order,
            tags: BTreeSet::new(),
            min_cores: CORE_UNITS_PER_CORE,
            min_memory: 0,
            min_gpus: 0,
            min_gpu_memory: 0,
        }
    }

    /// Per-frame requirements as a slice
    pub fn requirements(&self) -> ResourceSlice {
        ResourceSlice::new(self.min_cores, self.min_memory)
            .with_gpus(self.min_gpus, self.min_gpu_memory)
    }
}

/// Frame lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameState {
    Waiting,
    Depend,
    Running,
    Succeeded,
    Dead,
    Eaten,
}

impl FrameState {
    /// Satisfies dependencies on this frame
    pub fn is_complete(&self) -> bool {
        matches!(self, FrameState::Succeeded | FrameState::Eaten)
    }

    /// No further work will happen without operator action
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            FrameState::Succeeded | FrameState::Dead | FrameState::Eaten
        )
    }
}

impl std::fmt::Display for FrameState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameState::Waiting => write!(f, "Waiting"),
            FrameState::Depend => write!(f, "Depend"),
            FrameState::Running => write!(f, "Running"),
            FrameState::Succeeded => write!(f, "Succeeded"),
            FrameState::Dead => write!(f, "Dead"),
            FrameState::Eaten => write!(f, "Eaten"),
        }
    }
}

/// The atomic unit of dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub id: Uuid,
    pub job_id: Uuid,
    pub layer_id: Uuid,
    /// Unique within the layer
    pub number: i32,
    pub state: FrameState,
    /// Frames that must complete first
    pub depends_on: Vec<Uuid>,
    pub retries: u32,
}

impl Frame {
    pub fn new(layer: &Layer, number: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id: layer.job_id,
            layer_id: layer.id,
            number,
            state: FrameState::Waiting,
            depends_on: Vec::new(),
            retries: 0,
        }
    }
}

/// A dispatch or booking target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum BookingTarget {
    Job(Uuid),
    Layer(Uuid),
    Frame(Uuid),
}

impl BookingTarget {
    pub fn id(&self) -> Uuid {
        match self {
            BookingTarget::Job(id) | BookingTarget::Layer(id) | BookingTarget::Frame(id) => *id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BookingTarget::Job(_) => "job",
            BookingTarget::Layer(_) => "layer",
            BookingTarget::Frame(_) => "frame",
        }
    }
}

impl std::fmt::Display for BookingTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// Bounds of a local host assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentBounds {
    /// Core units
    pub min_cores: u32,
    /// Core units the assignment may hold across all its procs
    pub max_cores: u32,
    /// Threads per proc; each proc books `threads * 100` core units
    pub threads: u32,
    /// KB
    pub max_memory: u64,
    pub max_gpus: u32,
    /// KB
    pub max_gpu_memory: u64,
}

impl AssignmentBounds {
    pub fn new(max_cores: u32, threads: u32, max_memory: u64, max_gpus: u32, max_gpu_memory: u64) -> Self {
        Self {
            min_cores: CORE_UNITS_PER_CORE,
            max_cores,
            threads,
            max_memory,
            max_gpus,
            max_gpu_memory,
        }
    }

    pub fn with_min_cores(mut self, min_cores: u32) -> Self {
        self.min_cores = min_cores;
        self
    }

    /// Upper bounds as a slice
    pub fn max_slice(&self) -> ResourceSlice {
        ResourceSlice::new(self.max_cores, self.max_memory)
            .with_gpus(self.max_gpus, self.max_gpu_memory)
    }

    /// Core units booked by each proc under this assignment
    pub fn proc_cores(&self) -> u32 {
        threads_to_core_units(self.threads)
    }
}

/// A standing pin of a host's capacity to one target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalHostAssignment {
    pub id: Uuid,
    pub host_id: Uuid,
    pub target: BookingTarget,
    pub bounds: AssignmentBounds,
    pub created_at: DateTime<Utc>,
}

impl LocalHostAssignment {
    pub fn new(host_id: Uuid, target: BookingTarget, bounds: AssignmentBounds) -> Self {
        Self {
            id: Uuid::new_v4(),
            host_id,
            target,
            bounds,
            created_at: Utc::now(),
        }
    }
}

/// Token returned by the resource ledger for one reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationHandle {
    pub id: Uuid,
    pub host_id: Uuid,
}

/// A live reservation of host resources bound to one running frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualProc {
    pub id: Uuid,
    pub host_id: Uuid,
    pub host_name: String,
    pub job_id: Uuid,
    pub layer_id: Uuid,
    pub frame_id: Uuid,
    pub reserved: ResourceSlice,
    /// Placed under a local host assignment
    pub is_local_dispatch: bool,
    pub assignment_id: Option<Uuid>,
    pub reservation: ReservationHandle,
    pub booked_at: DateTime<Utc>,
}

/// How a running frame ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameExit {
    Succeeded,
    Failed,
    /// Killed or unbooked; the frame goes back to the queue
    Killed,
}

/// Capacity report from a host, already deserialized
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostReport {
    pub name: String,
    pub facility: String,
    /// Fully qualified allocation to create an unknown host in
    #[serde(default)]
    pub allocation: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub state: HardwareState,
    #[serde(default)]
    pub nimby_enabled: bool,
    #[serde(default)]
    pub nimby_locked: bool,
    /// Core units
    pub total_cores: u32,
    /// KB
    pub total_memory: u64,
    #[serde(default)]
    pub total_gpus: u32,
    #[serde(default)]
    pub total_gpu_memory: u64,
    #[serde(default)]
    pub total_swap: u64,
    #[serde(default)]
    pub free_swap: u64,
    #[serde(default)]
    pub boot_time: Option<DateTime<Utc>>,
}

impl HostReport {
    pub fn total(&self) -> ResourceSlice {
        ResourceSlice::new(self.total_cores, self.total_memory)
            .with_gpus(self.total_gpus, self.total_gpu_memory)
    }

    pub fn lock_state(&self) -> LockState {
        if self.nimby_locked {
            LockState::NimbyLocked
        } else {
            LockState::Open
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::GB8;

    #[test]
    fn test_allocation_names() {
        let facility = Facility::new("spi");
        let alloc = Allocation::new(&facility, "general", "general");
        assert_eq!(alloc.name, "spi.general");
        assert_eq!(alloc.short_name(), "general");
        assert!(alloc.enabled);
        assert!(!alloc.default);
    }

    #[test]
    fn test_host_dispatch_flags() {
        let mut host = Host::new("beta", Uuid::new_v4(), ResourceSlice::new(800, GB8));
        assert!(host.accepts_open_dispatch());

        host.lock_state = LockState::NimbyLocked;
        assert!(host.is_up());
        assert!(!host.accepts_open_dispatch());

        host.enabled = false;
        assert!(!host.is_up());
    }

    #[test]
    fn test_tag_matching() {
        let host = Host::new("beta", Uuid::new_v4(), ResourceSlice::new(800, GB8)).with_tags(["test"]);
        let dispatch_host = DispatchHost {
            host,
            facility: "spi".to_string(),
            allocation_tag: "general".to_string(),
            allocation_enabled: true,
            idle: ResourceSlice::new(800, GB8),
        };

        let tags = |t: &[&str]| t.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>();
        assert!(dispatch_host.matches_tags(&tags(&[])));
        assert!(dispatch_host.matches_tags(&tags(&["general"])));
        assert!(dispatch_host.matches_tags(&tags(&["desktop", "test"])));
        assert!(!dispatch_host.matches_tags(&tags(&["desktop"])));
    }

    #[test]
    fn test_frame_state_completion() {
        assert!(FrameState::Succeeded.is_complete());
        assert!(FrameState::Eaten.is_complete());
        assert!(!FrameState::Dead.is_complete());
        assert!(FrameState::Dead.is_done());
        assert!(!FrameState::Running.is_done());
    }

    #[test]
    fn test_assignment_bounds() {
        let bounds = AssignmentBounds::new(300, 1, GB8, 0, 0);
        assert_eq!(bounds.proc_cores(), 100);
        assert_eq!(bounds.min_cores, 100);
        assert_eq!(bounds.max_slice(), ResourceSlice::new(300, GB8));
    }

    #[test]
    fn test_booking_target_serde() {
        let id = Uuid::new_v4();
        let json = serde_json::to_string(&BookingTarget::Layer(id)).unwrap();
        assert_eq!(json, format!(r#"{{"kind":"layer","id":"{}"}}"#, id));
        assert_eq!(BookingTarget::Layer(id).to_string(), format!("layer:{}", id));
    }
}
