//! Core engine: the plan → propose → judge → execute cycle.

pub mod accountant;
pub mod executor;
pub mod idempotency;
pub mod orchestrator;
