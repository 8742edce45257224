//! renderq-core: Core types for the renderq dispatch engine
//!
//! This crate provides the fundamental types used throughout renderq:
//! - Farm entities (hosts, jobs, layers, frames, procs, bookings)
//! - Resource units and reservation slices
//! - Frame state events
//! - Configuration types
//! - Error handling

pub mod config;
pub mod error;
pub mod event;
pub mod model;
pub mod resources;

pub use config::*;
pub use error::*;
pub use event::*;
pub use model::*;
pub use resources::*;
