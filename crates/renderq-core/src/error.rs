//! Error types for renderq

use thiserror::Error;

/// Main error type for renderq
#[derive(Error, Debug)]
pub enum RenderqError {
    /// Malformed request: bad booking bounds, duplicate or invalid names
    #[error("Validation error: {0}")]
    Validation(String),

    /// A reservation exceeds the host's idle capacity
    #[error("Insufficient resources: {0}")]
    InsufficientResources(String),

    /// Dispatch target missing, fully booked or ineligible for the host
    #[error("Target unavailable: {0}")]
    TargetUnavailable(String),

    /// Lost a compare-and-commit race for a frame
    #[error("Concurrent booking conflict: {0}")]
    ConcurrentBookingConflict(String),

    /// Host not found
    #[error("Host not found: {0}")]
    HostNotFound(String),

    /// Job not found
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Layer not found
    #[error("Layer not found: {0}")]
    LayerNotFound(String),

    /// Frame not found
    #[error("Frame not found: {0}")]
    FrameNotFound(String),

    /// Virtual proc not found
    #[error("Proc not found: {0}")]
    ProcNotFound(String),

    /// Local host assignment not found
    #[error("Local host assignment not found: {0}")]
    AssignmentNotFound(String),

    /// Allocation not found
    #[error("Allocation not found: {0}")]
    AllocationNotFound(String),

    /// Facility not found
    #[error("Facility not found: {0}")]
    FacilityNotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RenderqError {
    /// Errors the dispatch loop absorbs instead of surfacing
    pub fn is_placement_failure(&self) -> bool {
        matches!(
            self,
            RenderqError::InsufficientResources(_)
                | RenderqError::TargetUnavailable(_)
                | RenderqError::ConcurrentBookingConflict(_)
        )
    }

    /// Lookup misses for any entity
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RenderqError::HostNotFound(_)
                | RenderqError::JobNotFound(_)
                | RenderqError::LayerNotFound(_)
                | RenderqError::FrameNotFound(_)
                | RenderqError::ProcNotFound(_)
                | RenderqError::AssignmentNotFound(_)
                | RenderqError::AllocationNotFound(_)
                | RenderqError::FacilityNotFound(_)
        )
    }
}

/// Result type for renderq operations
pub type RenderqResult<T> = Result<T, RenderqError>;

impl From<serde_json::Error> for RenderqError {
    fn from(err: serde_json::Error) -> Self {
        RenderqError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for RenderqError {
    fn from(err: toml::de::Error) -> Self {
        RenderqError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RenderqError::Validation("max cores below min cores".to_string());
        assert_eq!(err.to_string(), "Validation error: max cores below min cores");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: RenderqError = io_err.into();
        assert!(matches!(err, RenderqError::Io(_)));
    }

    #[test]
    fn test_placement_failures() {
        assert!(RenderqError::InsufficientResources("x".into()).is_placement_failure());
        assert!(RenderqError::ConcurrentBookingConflict("x".into()).is_placement_failure());
        assert!(RenderqError::TargetUnavailable("x".into()).is_placement_failure());
        assert!(!RenderqError::Validation("x".into()).is_placement_failure());
        assert!(RenderqError::FrameNotFound("x".into()).is_not_found());
        assert!(!RenderqError::Internal("x".into()).is_not_found());
    }
}
