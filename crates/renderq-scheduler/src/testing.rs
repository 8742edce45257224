//! Farm fixture shared by the scheduler tests

use renderq_core::{
    Allocation, DispatchHost, Facility, Frame, Host, Job, Layer, ResourceSlice, GB2, GB8,
};
use renderq_store::{
    AllocationRepository, FacilityRepository, HostRepository, JobRepository, MemoryStore,
};
use std::sync::Arc;

pub const JOB_NAME: &str = "pipe-dev.cue-testuser_shell_dispatch_test_v1";
pub const HOST_NAME: &str = "beta";

pub struct FarmFixture {
    pub store: Arc<MemoryStore>,
    pub facility: Facility,
    pub alloc: Allocation,
    pub host: Host,
    pub job: Job,
    /// `pass_1` and `pass_2`, ten 1-core 2GB frames each
    pub layers: Vec<Layer>,
}

/// One facility, one default allocation, an 8-core 16GB host and one job
pub async fn farm() -> FarmFixture {
    let store = Arc::new(MemoryStore::new());
    let facility = store.insert_facility(Facility::new("spi")).await.unwrap();
    let alloc = Allocation::new(&facility, "general", "general");
    let alloc = store.insert_allocation(&facility, &alloc).await.unwrap();

    let host = Host::new(HOST_NAME, alloc.id, ResourceSlice::new(800, 2 * GB8))
        .with_tags(["test"]);
    let host = store.insert_host(host).await.unwrap();

    let (job, layers) = insert_job(
        &store,
        &facility.name,
        JOB_NAME,
        1,
        &[("pass_1", 100, GB2, 10), ("pass_2", 100, GB2, 10)],
    )
    .await;

    FarmFixture {
        store,
        facility,
        alloc,
        host,
        job,
        layers,
    }
}

/// Each layer spec is `(name, core units, memory, frame count)`
async fn insert_job(
    store: &MemoryStore,
    facility: &str,
    name: &str,
    priority: i32,
    specs: &[(&str, u32, u64, i32)],
) -> (Job, Vec<Layer>) {
    let mut job = Job::new(name, "pipe", facility);
    job.priority = priority;

    let mut layers = Vec::new();
    let mut frames = Vec::new();
    for (order, (layer_name, cores, memory, count)) in specs.iter().enumerate() {
        let mut layer = Layer::new(&job, *layer_name, order as u32);
        layer.min_cores = *cores;
        layer.min_memory = *memory;
        frames.extend((1..=*count).map(|n| Frame::new(&layer, n)));
        layers.push(layer);
    }

    store
        .insert_job(job.clone(), layers.clone(), frames)
        .await
        .unwrap();
    (job, layers)
}

impl FarmFixture {
    /// Add a job; each layer is `(name, core units, memory, frame count)`
    pub async fn add_job(&self, name: &str, priority: i32, layers: &[(&str, u32, u64, i32)]) -> Job {
        insert_job(&self.store, &self.facility.name, name, priority, layers)
            .await
            .0
    }

    /// Fresh view of the fixture host with its full capacity idle
    pub async fn dispatch_host(&self) -> DispatchHost {
        let host = self.store.get_host(self.host.id).await.unwrap();
        DispatchHost {
            idle: host.total,
            host,
            facility: self.facility.name.clone(),
            allocation_tag: self.alloc.tag.clone(),
            allocation_enabled: self.alloc.enabled,
        }
    }

    pub async fn frame(&self, layer: usize, number: i32) -> Frame {
        self.store
            .find_frame(self.layers[layer].id, number)
            .await
            .unwrap()
    }
}
