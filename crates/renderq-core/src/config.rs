//! Configuration types for renderq

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::resources::{CORE_UNITS_PER_CORE, MB};
use crate::{RenderqError, RenderqResult};

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Dispatch loop configuration
    pub dispatcher: DispatcherConfig,
    /// Host report handling configuration
    pub reports: ReportConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> RenderqResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RenderqError::Config(format!("Failed to read config file: {}", e)))?;
        toml::from_str(&content)
            .map_err(|e| RenderqError::Config(format!("Failed to parse config: {}", e)))
    }
}

/// Dispatch loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Upper bound on procs placed by one dispatch pass
    pub max_procs_per_pass: usize,
    /// Upper bound on candidate frames returned by one selection
    pub max_candidate_frames: usize,
    /// Minimum idle core units for a host to be searched for open work
    pub min_idle_cores: u32,
    /// Minimum idle memory (KB) for a host to be searched for open work
    pub min_idle_memory: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_procs_per_pass: 32,
            max_candidate_frames: 100,
            min_idle_cores: CORE_UNITS_PER_CORE,
            min_idle_memory: 256 * MB,
        }
    }
}

/// Host report handling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Number of report workers; hosts are sharded across them
    pub workers: usize,
    /// Bounded queue depth per worker
    pub queue_capacity: usize,
    /// How often the daemon polls hosts for resource deficits
    pub deficit_poll_secs: u64,
    /// How often the daemon replays farm host reports
    pub report_interval_secs: u64,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            deficit_poll_secs: 30,
            report_interval_secs: 10,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or text)
    pub format: String,
    /// Log file path (if any)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            file: None,
        }
    }
}

/// Farm snapshot file format (TOML), used to seed an in-memory store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FarmConfig {
    #[serde(rename = "facility")]
    pub facilities: Vec<FarmFacility>,
    #[serde(rename = "allocation")]
    pub allocations: Vec<FarmAllocation>,
    #[serde(rename = "host")]
    pub hosts: Vec<FarmHost>,
    #[serde(rename = "job")]
    pub jobs: Vec<FarmJob>,
}

impl FarmConfig {
    /// Load a farm snapshot from a TOML file
    pub fn from_file(path: &std::path::Path) -> RenderqResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FarmFacility {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FarmAllocation {
    pub facility: String,
    /// Short name; qualified with the facility on insert
    pub name: String,
    pub tag: String,
    #[serde(default)]
    pub default: bool,
    #[serde(default = "default_true")]
    pub billable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FarmHost {
    pub name: String,
    /// Fully qualified allocation name
    pub allocation: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Core units
    pub cores: u32,
    /// KB
    pub memory: u64,
    #[serde(default)]
    pub gpus: u32,
    #[serde(default)]
    pub gpu_memory: u64,
    #[serde(default)]
    pub swap: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FarmJob {
    pub name: String,
    pub show: String,
    pub facility: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default, rename = "layer")]
    pub layers: Vec<FarmLayer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FarmLayer {
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Core units per frame
    #[serde(default = "default_cores")]
    pub cores: u32,
    /// KB per frame
    #[serde(default)]
    pub memory: u64,
    #[serde(default)]
    pub gpus: u32,
    #[serde(default)]
    pub gpu_memory: u64,
    /// Frame range, e.g. `1-10`, `1-20x5` or `1,3,5`
    pub frames: String,
}

impl FarmLayer {
    /// Expand the frame range into frame numbers
    pub fn frame_numbers(&self) -> RenderqResult<Vec<i32>> {
        parse_frame_range(&self.frames)
    }
}

fn default_true() -> bool {
    true
}

fn default_priority() -> i32 {
    1
}

fn default_cores() -> u32 {
    CORE_UNITS_PER_CORE
}

/// Parse a comma separated list of `N`, `A-B` or `A-BxSTEP` items
pub fn parse_frame_range(spec: &str) -> RenderqResult<Vec<i32>> {
    let bad = || RenderqError::Config(format!("Invalid frame range: {}", spec));
    let mut frames = Vec::new();

    for item in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (range, step) = match item.split_once('x') {
            Some((range, step)) => (range, step.parse::<i32>().map_err(|_| bad())?),
            None => (item, 1),
        };
        if step <= 0 {
            return Err(bad());
        }
        // A leading '-' belongs to a negative start frame
        let split = range
            .char_indices()
            .skip(1)
            .find(|(_, c)| *c == '-')
            .map(|(i, _)| i);
        let (start, end) = match split {
            Some(i) => (
                range[..i].parse::<i32>().map_err(|_| bad())?,
                range[i + 1..].parse::<i32>().map_err(|_| bad())?,
            ),
            None => {
                let n = range.parse::<i32>().map_err(|_| bad())?;
                (n, n)
            }
        };
        if end < start {
            return Err(bad());
        }
        frames.extend((start..=end).step_by(step as usize));
    }

    if frames.is_empty() {
        return Err(bad());
    }
    frames.sort_unstable();
    frames.dedup();
    Ok(frames)
}
