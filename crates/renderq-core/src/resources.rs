//! Resource units and reservation slices
//!
//! Cores are tracked in fixed-point core units (100 units = one physical core)
//! so partial cores can be booked. Memory, GPU memory and swap are kilobytes.

use serde::{Deserialize, Serialize};

/// Core units per physical core
pub const CORE_UNITS_PER_CORE: u32 = 100;

/// One megabyte, in kilobytes
pub const MB: u64 = 1024;
/// 512 megabytes, in kilobytes
pub const MB512: u64 = 512 * MB;
/// One gigabyte, in kilobytes
pub const GB: u64 = 1024 * MB;
/// 2 gigabytes, in kilobytes
pub const GB2: u64 = 2 * GB;
/// 4 gigabytes, in kilobytes
pub const GB4: u64 = 4 * GB;
/// 8 gigabytes, in kilobytes
pub const GB8: u64 = 8 * GB;

/// Convert a thread count into core units
pub fn threads_to_core_units(threads: u32) -> u32 {
    threads.saturating_mul(CORE_UNITS_PER_CORE)
}

/// A slice of host capacity: what a proc reserves and what a host offers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceSlice {
    /// Core units
    pub cores: u32,
    /// Memory in KB
    pub memory: u64,
    /// Whole GPU devices
    pub gpus: u32,
    /// GPU memory in KB
    pub gpu_memory: u64,
}

impl ResourceSlice {
    /// Create a slice with no GPU component
    pub fn new(cores: u32, memory: u64) -> Self {
        Self {
            cores,
            memory,
            gpus: 0,
            gpu_memory: 0,
        }
    }

    /// Builder-style GPU component
    pub fn with_gpus(mut self, gpus: u32, gpu_memory: u64) -> Self {
        self.gpus = gpus;
        self.gpu_memory = gpu_memory;
        self
    }

    /// The empty slice
    pub fn zero() -> Self {
        Self::default()
    }

    /// True when every dimension is zero
    pub fn is_zero(&self) -> bool {
        *self == Self::zero()
    }

    /// True when every dimension of `self` fits inside `other`
    pub fn fits_within(&self, other: &ResourceSlice) -> bool {
        self.cores <= other.cores
            && self.memory <= other.memory
            && self.gpus <= other.gpus
            && self.gpu_memory <= other.gpu_memory
    }

    /// Subtract `other`, or `None` if any dimension would go negative
    pub fn checked_sub(&self, other: &ResourceSlice) -> Option<ResourceSlice> {
        Some(ResourceSlice {
            cores: self.cores.checked_sub(other.cores)?,
            memory: self.memory.checked_sub(other.memory)?,
            gpus: self.gpus.checked_sub(other.gpus)?,
            gpu_memory: self.gpu_memory.checked_sub(other.gpu_memory)?,
        })
    }

    pub fn saturating_sub(&self, other: &ResourceSlice) -> ResourceSlice {
        ResourceSlice {
            cores: self.cores.saturating_sub(other.cores),
            memory: self.memory.saturating_sub(other.memory),
            gpus: self.gpus.saturating_sub(other.gpus),
            gpu_memory: self.gpu_memory.saturating_sub(other.gpu_memory),
        }
    }

    pub fn saturating_add(&self, other: &ResourceSlice) -> ResourceSlice {
        ResourceSlice {
            cores: self.cores.saturating_add(other.cores),
            memory: self.memory.saturating_add(other.memory),
            gpus: self.gpus.saturating_add(other.gpus),
            gpu_memory: self.gpu_memory.saturating_add(other.gpu_memory),
        }
    }

    /// Per-dimension amount by which `self` exceeds `limit` (zero where it doesn't)
    pub fn overage(&self, limit: &ResourceSlice) -> ResourceSlice {
        self.saturating_sub(limit)
    }
}

impl std::iter::Sum for ResourceSlice {
    fn sum<I: Iterator<Item = ResourceSlice>>(iter: I) -> Self {
        iter.fold(ResourceSlice::zero(), |acc, s| acc.saturating_add(&s))
    }
}

impl std::fmt::Display for ResourceSlice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cores={} memory={}KB gpus={} gpu_memory={}KB",
            self.cores, self.memory, self.gpus, self.gpu_memory
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threads_to_core_units() {
        assert_eq!(threads_to_core_units(1), 100);
        assert_eq!(threads_to_core_units(8), 800);
    }

    #[test]
    fn test_fits_within() {
        let host = ResourceSlice::new(800, GB8).with_gpus(1, MB512);
        assert!(ResourceSlice::new(200, GB2).fits_within(&host));
        assert!(!ResourceSlice::new(900, GB2).fits_within(&host));
        assert!(!ResourceSlice::new(100, MB).with_gpus(2, 0).fits_within(&host));
    }

    #[test]
    fn test_checked_sub() {
        let idle = ResourceSlice::new(300, GB4);
        let left = idle.checked_sub(&ResourceSlice::new(100, GB)).unwrap();
        assert_eq!(left, ResourceSlice::new(200, 3 * GB));
        assert!(idle.checked_sub(&ResourceSlice::new(400, 0)).is_none());
    }

    #[test]
    fn test_overage_and_sum() {
        let committed: ResourceSlice = vec![ResourceSlice::new(400, GB), ResourceSlice::new(400, GB)]
            .into_iter()
            .sum();
        assert_eq!(committed, ResourceSlice::new(800, GB2));

        let over = committed.overage(&ResourceSlice::new(700, GB8));
        assert_eq!(over, ResourceSlice::new(100, 0));
        assert!(committed.overage(&committed).is_zero());
    }
}
