//! renderq-scheduler: Dispatch and booking engine for renderq
//!
//! This crate turns idle host capacity into running frames:
//! - Resource ledger tracking idle capacity per host
//! - Candidate frame selection through ordered scope strategies
//! - Dispatch passes that place virtual procs
//! - Local host assignment booking and deficit detection
//! - Sharded host report intake

pub mod booking;
pub mod deficit;
pub mod dispatcher;
pub mod ledger;
pub mod report;
pub mod selector;

#[cfg(test)]
mod testing;

pub use booking::{BookingManager, MaxResources};
pub use deficit::{DeficitMonitor, ResourceDeficit};
pub use dispatcher::Dispatcher;
pub use ledger::ResourceLedger;
pub use report::{ReportHandler, ReportQueue};
pub use selector::{Candidate, CandidateFrames, CandidateSelector, ScopeKind, ScopeStrategy};
