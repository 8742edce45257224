//! renderq-store: Persistence for the renderq dispatch engine
//!
//! This crate provides:
//! - Repository traits for facilities, allocations, hosts, jobs, procs and
//!   local host assignments
//! - An in-memory store where each call is one transaction
//! - Seeding from a farm snapshot file

pub mod memory;
pub mod repository;
pub mod seed;

pub use memory::MemoryStore;
pub use repository::*;
pub use seed::load_farm;
