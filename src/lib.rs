//! AGORA — round-based auction and policy engine for an agent economy.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod policy;
pub mod storage;
pub mod engine;
pub mod memory;
pub mod brain;
pub mod chain;
pub mod api;
