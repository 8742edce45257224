//! Frame state transition events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{FrameExit, VirtualProc};

/// Transition a frame went through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameTransition {
    /// Waiting -> Running
    Started,
    /// Running -> Succeeded
    Succeeded,
    /// Running -> Dead
    Failed,
    /// Running -> Waiting
    Killed,
}

impl From<FrameExit> for FrameTransition {
    fn from(exit: FrameExit) -> Self {
        match exit {
            FrameExit::Succeeded => FrameTransition::Succeeded,
            FrameExit::Failed => FrameTransition::Failed,
            FrameExit::Killed => FrameTransition::Killed,
        }
    }
}

/// Emitted for job-progress reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameEvent {
    pub frame_id: Uuid,
    pub job_id: Uuid,
    pub layer_id: Uuid,
    pub host_id: Uuid,
    pub proc_id: Uuid,
    pub transition: FrameTransition,
    pub at: DateTime<Utc>,
}

impl FrameEvent {
    pub fn for_proc(proc: &VirtualProc, transition: FrameTransition) -> Self {
        Self {
            frame_id: proc.frame_id,
            job_id: proc.job_id,
            layer_id: proc.layer_id,
            host_id: proc.host_id,
            proc_id: proc.id,
            transition,
            at: Utc::now(),
        }
    }
}
