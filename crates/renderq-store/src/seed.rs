//! Seed a store from a farm snapshot

use renderq_core::{
    Allocation, Facility, FarmConfig, FarmJob, Frame, Host, Job, Layer, RenderqResult,
    ResourceSlice,
};
use tracing::{debug, info};

use crate::repository::{
    AllocationRepository, DispatchStore, FacilityRepository, HostRepository, JobRepository,
};

/// Insert every facility, allocation, host and job of a farm snapshot.
/// Rows are inserted in dependency order, so a host may name any allocation
/// declared in the same file.
pub async fn load_farm<S>(store: &S, farm: &FarmConfig) -> RenderqResult<()>
where
    S: DispatchStore + ?Sized,
{
    for facility in &farm.facilities {
        store.insert_facility(Facility::new(&facility.name)).await?;
    }

    for entry in &farm.allocations {
        let facility = store.get_facility(&entry.facility).await?;
        let mut alloc = Allocation::new(&facility, &entry.name, &entry.tag);
        alloc.billable = entry.billable;
        alloc.default = entry.default;
        store.insert_allocation(&facility, &alloc).await?;
    }

    for entry in &farm.hosts {
        let alloc = store.find_allocation(&entry.allocation).await?;
        let total = ResourceSlice::new(entry.cores, entry.memory)
            .with_gpus(entry.gpus, entry.gpu_memory);
        let mut host = Host::new(&entry.name, alloc.id, total).with_tags(entry.tags.iter().cloned());
        host.total_swap = entry.swap;
        host.free_swap = entry.swap;
        store.insert_host(host).await?;
    }

    for entry in &farm.jobs {
        load_job(store, entry).await?;
    }

    info!(
        facilities = farm.facilities.len(),
        allocations = farm.allocations.len(),
        hosts = farm.hosts.len(),
        jobs = farm.jobs.len(),
        "Farm loaded"
    );
    Ok(())
}

async fn load_job<S>(store: &S, entry: &FarmJob) -> RenderqResult<()>
where
    S: DispatchStore + ?Sized,
{
    store.get_facility(&entry.facility).await?;

    let mut job = Job::new(&entry.name, &entry.show, &entry.facility);
    job.priority = entry.priority;

    let mut layers = Vec::with_capacity(entry.layers.len());
    let mut frames = Vec::new();
    for (order, spec) in entry.layers.iter().enumerate() {
        let mut layer = Layer::new(&job, &spec.name, order as u32);
        layer.tags = spec.tags.iter().cloned().collect();
        layer.min_cores = spec.cores;
        layer.min_memory = spec.memory;
        layer.min_gpus = spec.gpus;
        layer.min_gpu_memory = spec.gpu_memory;

        for number in spec.frame_numbers()? {
            frames.push(Frame::new(&layer, number));
        }
        layers.push(layer);
    }

    debug!(job = %job.name, layers = layers.len(), frames = frames.len(), "Loading job");
    store.insert_job(job, layers, frames).await
}
